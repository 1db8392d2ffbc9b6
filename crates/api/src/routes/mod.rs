//! HTTP routes

pub mod confirm;
pub mod health;
pub mod maintenance;
pub mod webhooks;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::{
    auth::{require_auth, require_maintenance_secret},
    state::AppState,
};

pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    let payer_routes = Router::new()
        .route("/confirm", post(confirm::confirm_purchase))
        .layer(middleware::from_fn_with_state(auth_state.clone(), require_auth));

    let internal_routes = Router::new()
        .route("/internal/maintenance/{job}", post(maintenance::run_job))
        .route("/internal/invariants", post(maintenance::run_invariants))
        .layer(middleware::from_fn_with_state(
            auth_state,
            require_maintenance_secret,
        ));

    Router::new()
        .route("/health", get(health::health))
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .merge(payer_routes)
        .merge(internal_routes)
        .with_state(state)
}
