// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError wraps billing error text
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! CoachLedger API Library
//!
//! HTTP surface of the billing engine: purchase confirmation, the Stripe
//! webhook receiver, maintenance triggers and health.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
