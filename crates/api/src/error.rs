//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use tierledger_billing::BillingError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Authentication required")]
    Unauthorized,
    #[error("Insufficient permissions")]
    Forbidden,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),

    // Billing errors
    #[error("Usage quota exceeded")]
    QuotaExceeded { remaining: i64 },

    // Upstream errors
    #[error("Payment provider error")]
    Provider,
    #[error("Request timed out")]
    Timeout,

    // Internal errors
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Authentication
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", self.to_string()),

            // Validation
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            // Resources
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),

            // Billing
            ApiError::QuotaExceeded { remaining } => {
                let body = Json(json!({
                    "error": {
                        "code": "QUOTA_EXCEEDED",
                        "message": self.to_string(),
                        "remaining": remaining,
                    }
                }));
                return (StatusCode::FORBIDDEN, body).into_response();
            }

            // Upstream
            ApiError::Provider => (StatusCode::BAD_GATEWAY, "PROVIDER_ERROR", self.to_string()),
            ApiError::Timeout => (StatusCode::SERVICE_UNAVAILABLE, "TIMEOUT", self.to_string()),

            // Internal
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
            ApiError::ServiceUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", self.to_string()),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::AuthenticationFailed => {
                ApiError::BadRequest("Invalid webhook signature".to_string())
            }
            BillingError::AlreadyApplied => ApiError::Conflict("Event already applied".to_string()),
            BillingError::Validation(msg) => ApiError::Validation(msg),
            BillingError::QuotaExceeded { remaining } => ApiError::QuotaExceeded { remaining },
            BillingError::StaleEvent(msg) => ApiError::Conflict(msg),
            BillingError::NotFound(msg) => ApiError::NotFound(msg),
            BillingError::Timeout(msg) => {
                tracing::warn!(error = %msg, "Billing operation timed out");
                ApiError::Timeout
            }
            BillingError::Provider(msg) => {
                tracing::error!(error = %msg, "Payment provider error");
                ApiError::Provider
            }
            BillingError::Storage(msg) => {
                tracing::error!(error = %msg, "Ledger storage error");
                ApiError::Internal
            }
            BillingError::Config(msg) => {
                tracing::error!(error = %msg, "Billing configuration error");
                ApiError::Internal
            }
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
