//! # Settlement Error Type
//!
//! The error a register sees when a checkout does not settle.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Flow in Meridian Settlement                    │
//! │                                                                         │
//! │  Register UI                 Settlement Engine                          │
//! │  ───────────                 ─────────────────                          │
//! │                                                                         │
//! │  router.settle_cash(...)                                                │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  ┌──────────────────────────────────────────────────────────────────┐   │
//! │  │  Validating                                                      │   │
//! │  │    stock, shift, split, gift card ── CoreError ─────┐            │   │
//! │  │    gateway / terminal ──────────── GatewayError ────┤            │   │
//! │  │    write-time recheck ──────────── Concurrency ─────┤            │   │
//! │  │         │                                           ▼            │   │
//! │  │         │                           SettlementError + ErrorCode ─┼──►│
//! │  │         ▼                           (nothing persisted)          │   │
//! │  │  Writing                                                         │   │
//! │  │    transaction row ── DbError ──────────────────────────────────►│   │
//! │  │    later steps ───── PartialWrite warning (outcome still Ok) ───►│   │
//! │  └──────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Validation and gateway errors leave the cart untouched and can be
//! retried. Partial writes are not errors: the outcome carries them as
//! warnings.

use serde::Serialize;
use thiserror::Error;

use meridian_core::CoreError;
use meridian_db::DbError;

use crate::ports::GatewayError;

/// Result type alias for settlement operations.
pub type SettlementResult<T> = Result<T, SettlementError>;

/// Every way a checkout can fail to settle.
#[derive(Debug, Error)]
pub enum SettlementError {
    // =========================================================================
    // Validation (before any write)
    // =========================================================================
    /// Business rule violation: stock, shift, split, gift card, input.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A referenced record (gift card, customer, pending payment) is missing.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// The idempotency key was already used by a settled checkout.
    #[error("Checkout {key} was already submitted")]
    DuplicateSubmission { key: String },

    // =========================================================================
    // Remote collaborators
    // =========================================================================
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// No configured or online reader for the location.
    #[error("No card reader available for location {location_id}")]
    NoReaderAvailable { location_id: String },

    /// The terminal returned without capturing the payment.
    #[error("Card payment was not completed: {status}")]
    PaymentNotCompleted { status: String },

    // =========================================================================
    // Write-time failures
    // =========================================================================
    /// A balance changed between validation and the write.
    #[error("Balance changed during checkout for {resource}: {message}")]
    Concurrency { resource: String, message: String },

    /// The loyalty redemption failed after the transaction row was written.
    #[error("Loyalty redemption failed for transaction {transaction_id}: {reason}")]
    RedemptionFailed {
        transaction_id: String,
        reason: String,
    },

    #[error("Database error: {0}")]
    Db(#[from] DbError),

    // =========================================================================
    // Configuration
    // =========================================================================
    #[error("Invalid settlement configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Internal
    // =========================================================================
    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Codes
// =============================================================================

/// Machine-readable error codes for the register UI.
///
/// ## Usage in the register
/// ```typescript
/// switch (e.code) {
///   case 'INSUFFICIENT_STOCK':
///     showStockWarning(e.message);
///     break;
///   case 'CONCURRENCY_ERROR':
///     requote();
///     break;
/// }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    InsufficientStock,
    NoActiveShift,
    SplitMismatch,
    GiftCardError,
    NotFound,
    DuplicateSubmission,
    GatewayError,
    PaymentDeclined,
    NoReaderAvailable,
    ConcurrencyError,
    LoyaltyError,
    DatabaseError,
    ConfigError,
    Internal,
}

/// Serializable error body handed to the register UI.
///
/// ```json
/// { "code": "INSUFFICIENT_STOCK", "message": "Insufficient stock for ..." }
/// ```
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
}

impl SettlementError {
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        SettlementError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn concurrency(resource: impl Into<String>, message: impl Into<String>) -> Self {
        SettlementError::Concurrency {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Maps the error to its register-facing code.
    pub fn code(&self) -> ErrorCode {
        match self {
            SettlementError::Core(core) => match core {
                CoreError::InsufficientStock { .. } => ErrorCode::InsufficientStock,
                CoreError::ItemNotFound(_) => ErrorCode::NotFound,
                CoreError::NoActiveShift => ErrorCode::NoActiveShift,
                CoreError::SplitMismatch { .. } => ErrorCode::SplitMismatch,
                CoreError::GiftCardInactive(_) | CoreError::InsufficientGiftCardBalance { .. } => {
                    ErrorCode::GiftCardError
                }
                CoreError::InvalidTransition { .. } => ErrorCode::Internal,
                CoreError::InvalidPaymentAmount { .. } | CoreError::Validation(_) => {
                    ErrorCode::ValidationError
                }
            },
            SettlementError::NotFound { .. } => ErrorCode::NotFound,
            SettlementError::DuplicateSubmission { .. } => ErrorCode::DuplicateSubmission,
            SettlementError::Gateway(GatewayError::Declined { .. }) => ErrorCode::PaymentDeclined,
            SettlementError::Gateway(_) => ErrorCode::GatewayError,
            SettlementError::PaymentNotCompleted { .. } => ErrorCode::PaymentDeclined,
            SettlementError::NoReaderAvailable { .. } => ErrorCode::NoReaderAvailable,
            SettlementError::Concurrency { .. } => ErrorCode::ConcurrencyError,
            SettlementError::RedemptionFailed { .. } => ErrorCode::LoyaltyError,
            SettlementError::Db(DbError::NotFound { .. }) => ErrorCode::NotFound,
            SettlementError::Db(_) => ErrorCode::DatabaseError,
            SettlementError::InvalidConfig(_)
            | SettlementError::ConfigLoadFailed(_)
            | SettlementError::ConfigSaveFailed(_) => ErrorCode::ConfigError,
            SettlementError::Serialization(_) | SettlementError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Returns true if the cart is untouched and the same checkout may be
    /// submitted again.
    ///
    /// ## Retryable
    /// - Validation failures (fix the cart or tender first)
    /// - Gateway and terminal failures
    /// - Balance races detected before the first write
    /// - Transient store errors
    ///
    /// ## Not Retryable
    /// - Duplicate submissions (the first one settled)
    /// - Failures after the transaction row was written
    /// - Configuration problems
    pub fn is_retryable(&self) -> bool {
        match self {
            SettlementError::Core(CoreError::InvalidTransition { .. }) => false,
            SettlementError::Core(_)
            | SettlementError::NotFound { .. }
            | SettlementError::NoReaderAvailable { .. }
            | SettlementError::PaymentNotCompleted { .. }
            | SettlementError::Concurrency { .. } => true,
            SettlementError::Gateway(e) => e.is_retryable(),
            SettlementError::Db(e) => e.is_transient(),
            _ => false,
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        if let SettlementError::Db(e) = self {
            // store details stay in the log
            tracing::error!(error = %e, "Settlement store error");
            return ErrorResponse {
                code: self.code(),
                message: "Settlement store operation failed".to_string(),
                retryable: self.is_retryable(),
            };
        }

        ErrorResponse {
            code: self.code(),
            message: self.to_string(),
            retryable: self.is_retryable(),
        }
    }
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SettlementError {
    fn from(err: serde_json::Error) -> Self {
        SettlementError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for SettlementError {
    fn from(err: std::io::Error) -> Self {
        SettlementError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SettlementError {
    fn from(err: toml::de::Error) -> Self {
        SettlementError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SettlementError {
    fn from(err: toml::ser::Error) -> Self {
        SettlementError::ConfigSaveFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::Money;

    #[test]
    fn test_codes() {
        let stock: SettlementError = CoreError::InsufficientStock {
            item_id: "inv-1".into(),
            available: 2,
            requested: 3,
        }
        .into();
        assert_eq!(stock.code(), ErrorCode::InsufficientStock);

        let split: SettlementError = CoreError::SplitMismatch {
            expected: Money::from_cents(10000),
            actual: Money::from_cents(9000),
        }
        .into();
        assert_eq!(split.code(), ErrorCode::SplitMismatch);

        let declined: SettlementError = GatewayError::Declined {
            reason: "insufficient_funds".into(),
        }
        .into();
        assert_eq!(declined.code(), ErrorCode::PaymentDeclined);

        assert_eq!(
            SettlementError::concurrency("gift_card", "drained").code(),
            ErrorCode::ConcurrencyError
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(SettlementError::from(CoreError::NoActiveShift).is_retryable());
        assert!(SettlementError::concurrency("gift_card", "drained").is_retryable());
        assert!(SettlementError::from(GatewayError::Timeout { secs: 30 }).is_retryable());

        assert!(!SettlementError::DuplicateSubmission { key: "k".into() }.is_retryable());
        assert!(!SettlementError::RedemptionFailed {
            transaction_id: "tx".into(),
            reason: "balance".into()
        }
        .is_retryable());
        assert!(!SettlementError::InvalidConfig("bad".into()).is_retryable());
    }

    #[test]
    fn test_store_errors_are_not_leaked() {
        let err = SettlementError::Db(DbError::QueryFailed("near \"SELEC\": syntax error".into()));
        let response = err.to_response();
        assert_eq!(response.code, ErrorCode::DatabaseError);
        assert!(!response.message.contains("SELEC"));
    }
}
