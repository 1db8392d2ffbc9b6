//! Stripe webhook receiver

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use coachledger_billing::{BillingError, WebhookOutcome};
use serde_json::json;

use crate::{error::ApiError, state::AppState};

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

/// Verify and process one delivery
///
/// Anything other than a bad signature or an unparseable body answers 500 so
/// the gateway redelivers; handlers are idempotent.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let Some(signature) = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
    else {
        tracing::warn!("Webhook delivery without signature header");
        return ApiError::Unauthorized.into_response();
    };

    match state.billing.webhooks.handle(&body, signature).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "received": true,
                "duplicate": outcome == WebhookOutcome::Duplicate,
            })),
        )
            .into_response(),
        Err(BillingError::WebhookSignatureInvalid) => ApiError::Unauthorized.into_response(),
        Err(BillingError::InvalidInput(msg)) => ApiError::Validation(msg).into_response(),
        Err(e) => ApiError::Internal(e.to_string()).into_response(),
    }
}
