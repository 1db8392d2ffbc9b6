//! API error type and its JSON rendering

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use coachledger_billing::{BillingError, ErrorClass};
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Gateway(_) | ApiError::Database(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Server-side detail stays in the logs.
        let message = if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err.class() {
            ErrorClass::Validation => ApiError::Validation(err.to_string()),
            ErrorClass::Unauthenticated => ApiError::Unauthorized,
            ErrorClass::Forbidden => ApiError::Forbidden(err.to_string()),
            ErrorClass::NotFound => ApiError::NotFound(err.to_string()),
            ErrorClass::Gateway => ApiError::Gateway(err.to_string()),
            ErrorClass::Persistence => ApiError::Database(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_errors_map_to_statuses() {
        let cases = [
            (
                BillingError::InvalidInput("x".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                BillingError::WebhookSignatureInvalid,
                StatusCode::UNAUTHORIZED,
            ),
            (
                BillingError::PayerMismatch("x".into()),
                StatusCode::FORBIDDEN,
            ),
            (
                BillingError::CheckoutSessionNotFound("cs".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                BillingError::StripeApi("timeout".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                BillingError::Database("gone".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }
}
