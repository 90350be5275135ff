//! Billing error types

use thiserror::Error;

use tierledger_shared::SharedError;

/// Client-facing message for writes the schema rejects; the database text is
/// only logged
pub const LEDGER_INVARIANT_MESSAGE: &str = "ledger invariant violated";

/// Billing-specific errors
///
/// Only [`BillingError::Storage`] and [`BillingError::Timeout`] are worth
/// retrying; every other variant is terminal for the operation or event that
/// produced it.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Webhook signature verification failed")]
    AuthenticationFailed,

    #[error("Event already applied")]
    AlreadyApplied,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Usage quota exceeded ({remaining} remaining)")]
    QuotaExceeded { remaining: i64 },

    #[error("Stale event: {0}")]
    StaleEvent(String),

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Stripe API error: {0}")]
    Provider(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// Whether the caller (or the provider's redelivery) should try again
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::Storage(_) | BillingError::Timeout(_))
    }

    /// Stable machine-readable code
    pub fn error_code(&self) -> &'static str {
        match self {
            BillingError::AuthenticationFailed => "AUTHENTICATION_FAILED",
            BillingError::AlreadyApplied => "ALREADY_APPLIED",
            BillingError::Validation(_) => "VALIDATION_ERROR",
            BillingError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            BillingError::StaleEvent(_) => "STALE_EVENT",
            BillingError::Storage(_) => "STORAGE_FAILURE",
            BillingError::Timeout(_) => "TIMEOUT",
            BillingError::Provider(_) => "PROVIDER_ERROR",
            BillingError::NotFound(_) => "NOT_FOUND",
            BillingError::Config(_) => "CONFIG_ERROR",
        }
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::Provider(err.to_string())
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            // PostgreSQL check_violation: a ledger invariant was rejected by the schema
            if db_err.code().as_deref() == Some("23514") {
                tracing::warn!(
                    constraint = ?db_err.constraint(),
                    error = %db_err.message(),
                    "Ledger write rejected by schema constraint"
                );
                return BillingError::Validation(LEDGER_INVARIANT_MESSAGE.to_string());
            }
        }
        BillingError::Storage(err.to_string())
    }
}

impl From<SharedError> for BillingError {
    fn from(err: SharedError) -> Self {
        BillingError::Validation(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_infrastructure_errors_retry() {
        assert!(BillingError::Storage("connection reset".into()).is_retryable());
        assert!(BillingError::Timeout("webhook".into()).is_retryable());
        assert!(!BillingError::AuthenticationFailed.is_retryable());
        assert!(!BillingError::AlreadyApplied.is_retryable());
        assert!(!BillingError::Validation("bad".into()).is_retryable());
        assert!(!BillingError::QuotaExceeded { remaining: 0 }.is_retryable());
        assert!(!BillingError::StaleEvent("old".into()).is_retryable());
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(BillingError::AuthenticationFailed.error_code(), "AUTHENTICATION_FAILED");
        assert_eq!(
            BillingError::QuotaExceeded { remaining: 3 }.error_code(),
            "QUOTA_EXCEEDED"
        );
        assert_eq!(BillingError::Storage(String::new()).error_code(), "STORAGE_FAILURE");
    }

    #[test]
    fn test_shared_error_maps_to_validation() {
        let err: BillingError = SharedError::Validation("Invalid plan: gold".into()).into();
        assert!(matches!(err, BillingError::Validation(_)));
    }
}
