use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;

/// Ledger errors
///
/// Each variant is a distinct business outcome with its own stable code.
/// `VersionConflict` never leaves the service: the balance guard retries on it
/// and turns an exhausted budget into `ConcurrencyConflict`.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Amount {amount} is below the minimum of {minimum}")]
    BelowMinimum { amount: Decimal, minimum: Decimal },

    #[error("Amount {amount} is above the maximum of {maximum}")]
    AboveMaximum { amount: Decimal, maximum: Decimal },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid payout destination: {0}")]
    InvalidDestination(String),

    #[error("Insufficient balance. Required: {required}, Available: {available}")]
    InsufficientBalance {
        required: Decimal,
        available: Decimal,
    },

    #[error("Payment verification failed")]
    PaymentVerification,

    #[error("Unknown deposit intent")]
    UnknownIntent,

    #[error("Deposit intent has expired")]
    IntentExpired,

    #[error("External reference already applied: {0}")]
    DuplicateExternalRef(String),

    #[error("Wallet is busy. Please retry.")]
    ConcurrencyConflict,

    #[error("Concurrent update detected")]
    VersionConflict,

    #[error("Wallet not found: {0}")]
    WalletNotFound(String),

    #[error("Withdrawal not found: {0}")]
    WithdrawalNotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid payout status: {0}")]
    InvalidPayoutStatus(String),

    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

impl LedgerError {
    /// Stable machine-readable code returned to API clients
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::BelowMinimum { .. } => "BELOW_MINIMUM",
            LedgerError::AboveMaximum { .. } => "ABOVE_MAXIMUM",
            LedgerError::InvalidAmount(_) => "INVALID_AMOUNT",
            LedgerError::InvalidRequest(_) => "INVALID_REQUEST",
            LedgerError::InvalidDestination(_) => "INVALID_DESTINATION",
            LedgerError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            LedgerError::PaymentVerification => "PAYMENT_VERIFICATION_FAILED",
            LedgerError::UnknownIntent => "UNKNOWN_INTENT",
            LedgerError::IntentExpired => "INTENT_EXPIRED",
            LedgerError::DuplicateExternalRef(_) => "DUPLICATE_EXTERNAL_REF",
            LedgerError::ConcurrencyConflict | LedgerError::VersionConflict => {
                "CONCURRENCY_CONFLICT"
            }
            LedgerError::WalletNotFound(_) => "WALLET_NOT_FOUND",
            LedgerError::WithdrawalNotFound(_) => "WITHDRAWAL_NOT_FOUND",
            LedgerError::InvalidState(_) => "INVALID_STATE",
            LedgerError::InvalidPayoutStatus(_) => "INVALID_PAYOUT_STATUS",
            LedgerError::GatewayUnavailable(_) => "GATEWAY_UNAVAILABLE",
            LedgerError::DatabaseError(_) | LedgerError::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the same call may succeed if retried unchanged
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::ConcurrencyConflict
                | LedgerError::VersionConflict
                | LedgerError::DatabaseError(_)
                | LedgerError::InternalError(_)
        )
    }
}

/// Convert LedgerError to HTTP responses
///
/// Storage and gateway details are logged, never returned.
impl IntoResponse for LedgerError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            LedgerError::BelowMinimum { .. }
            | LedgerError::AboveMaximum { .. }
            | LedgerError::InvalidAmount(_)
            | LedgerError::InvalidRequest(_)
            | LedgerError::InvalidDestination(_)
            | LedgerError::InvalidPayoutStatus(_)
            | LedgerError::InsufficientBalance { .. } => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }

            LedgerError::PaymentVerification => {
                (StatusCode::UNAUTHORIZED, self.to_string())
            }

            LedgerError::UnknownIntent
            | LedgerError::WalletNotFound(_)
            | LedgerError::WithdrawalNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),

            LedgerError::IntentExpired => (StatusCode::GONE, self.to_string()),

            LedgerError::DuplicateExternalRef(_)
            | LedgerError::InvalidState(_)
            | LedgerError::ConcurrencyConflict
            | LedgerError::VersionConflict => (StatusCode::CONFLICT, self.to_string()),

            LedgerError::GatewayUnavailable(ref e) => {
                tracing::error!("Gateway error: {}", e);
                (
                    StatusCode::BAD_GATEWAY,
                    "Payment gateway unavailable".to_string(),
                )
            }

            LedgerError::DatabaseError(ref e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database operation failed".to_string(),
                )
            }

            LedgerError::InternalError(ref e) => {
                tracing::error!("Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An unexpected error occurred".to_string(),
                )
            }
        };

        let body = Json(json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": error_message,
            },
        }));

        (status, body).into_response()
    }
}

/// Helper type for Results in this application
pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn version_conflict_shares_the_public_conflict_code() {
        assert_eq!(
            LedgerError::VersionConflict.code(),
            LedgerError::ConcurrencyConflict.code()
        );
    }

    #[test]
    fn insufficient_balance_maps_to_bad_request() {
        let response = LedgerError::InsufficientBalance {
            required: dec!(50),
            available: dec!(10),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn invalid_request_maps_to_bad_request() {
        let error = LedgerError::InvalidRequest("owner_id must not be blank".into());
        assert_eq!(error.code(), "INVALID_REQUEST");
        assert_eq!(error.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn only_storage_and_contention_errors_are_transient() {
        assert!(LedgerError::ConcurrencyConflict.is_transient());
        assert!(LedgerError::DatabaseError(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!LedgerError::WithdrawalNotFound("w".into()).is_transient());
        assert!(!LedgerError::InvalidState("completed".into()).is_transient());
        assert!(!LedgerError::InvalidPayoutStatus("maybe".into()).is_transient());
    }

    #[test]
    fn verification_failure_message_is_generic() {
        assert_eq!(
            LedgerError::PaymentVerification.to_string(),
            "Payment verification failed"
        );
    }
}
