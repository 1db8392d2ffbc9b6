//! Application state

use sqlx::PgPool;
use std::sync::Arc;

use coachledger_billing::BillingService;

use crate::{
    auth::{AuthState, JwtManager},
    config::Config,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Absent when the engine runs over in-process stores
    pub pool: Option<PgPool>,
    pub config: Arc<Config>,
    pub jwt_manager: JwtManager,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, billing: BillingService) -> Self {
        let mut state = Self::in_memory(config, billing);
        state.pool = Some(pool);
        state
    }

    pub fn in_memory(config: Config, billing: BillingService) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);
        Self {
            pool: None,
            config: Arc::new(config),
            jwt_manager,
            billing: Arc::new(billing),
        }
    }

    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
            maintenance_secret: Arc::from(self.config.maintenance_secret.as_str()),
        }
    }
}
