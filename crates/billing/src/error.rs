//! Billing error types

use coachledger_shared::ParseEnumError;
use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

/// Coarse classification used by callers to pick a response status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed input or unsupported purchase type (400)
    Validation,
    /// Missing or invalid credentials (401)
    Unauthenticated,
    /// Authenticated, but not the payer on record (403)
    Forbidden,
    /// Unknown package or checkout session (404)
    NotFound,
    /// Payment gateway unreachable or returned an unexpected shape (500)
    Gateway,
    /// Ledger, schedule or purchase write failure (500)
    Persistence,
}

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unsupported purchase type: {0}")]
    UnsupportedPurchaseType(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Payer mismatch: {0}")]
    PayerMismatch(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Credit package not found: {0}")]
    PackageNotFound(Uuid),

    #[error("Checkout session not found: {0}")]
    CheckoutSessionNotFound(String),

    #[error("Payment schedule not found for subscription {0}")]
    ScheduleNotFound(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Unexpected gateway payload: {0}")]
    GatewayPayload(String),

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BillingError::InvalidInput(_) | BillingError::UnsupportedPurchaseType(_) => {
                ErrorClass::Validation
            }
            BillingError::Unauthorized | BillingError::WebhookSignatureInvalid => {
                ErrorClass::Unauthenticated
            }
            BillingError::PayerMismatch(_) => ErrorClass::Forbidden,
            BillingError::NotFound(_)
            | BillingError::PackageNotFound(_)
            | BillingError::CheckoutSessionNotFound(_)
            | BillingError::ScheduleNotFound(_) => ErrorClass::NotFound,
            BillingError::StripeApi(_) | BillingError::GatewayPayload(_) => ErrorClass::Gateway,
            BillingError::Database(_) | BillingError::Config(_) | BillingError::Internal(_) => {
                ErrorClass::Persistence
            }
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<ParseEnumError> for BillingError {
    fn from(err: ParseEnumError) -> Self {
        BillingError::Database(format!("Corrupt row: {}", err))
    }
}
