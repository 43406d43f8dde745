//! # Error Types
//!
//! Domain-specific error types for meridian-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  meridian-core errors (this file)                                       │
//! │  ├── CoreError        - Business rule violations                        │
//! │  └── ValidationError  - Input validation failures                       │
//! │                                                                         │
//! │  meridian-db errors (separate crate)                                    │
//! │  └── DbError          - Store operation failures                        │
//! │                                                                         │
//! │  meridian-settlement errors                                             │
//! │  └── SettlementError  - What the register sees (with ErrorCode)         │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SettlementError → Register UI      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every `CoreError` is raised before the first write of a checkout, so
//! seeing one means nothing was persisted.

use thiserror::Error;

use crate::money::Money;

// =============================================================================
// Core Error
// =============================================================================

/// Business rule violations detected before any write.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Insufficient stock to complete the checkout.
    ///
    /// ## User Workflow
    /// ```text
    /// Cart: shampoo × 3
    ///      │
    ///      ▼
    /// Read stock: available=2
    ///      │
    ///      ▼
    /// InsufficientStock { item_id: "shampoo", available: 2, requested: 3 }
    ///      │
    ///      ▼
    /// UI shows: "Only 2 left in stock", cart untouched
    /// ```
    #[error("Insufficient stock for {item_id}: available {available}, requested {requested}")]
    InsufficientStock {
        item_id: String,
        available: i64,
        requested: i64,
    },

    /// A cart line references an item that no longer exists.
    #[error("Item not found: {0}")]
    ItemNotFound(String),

    /// Cash settlement without an open register shift.
    #[error("No active shift: open a shift before taking cash")]
    NoActiveShift,

    /// Split tender legs do not add up to the total.
    #[error("Split payments total {actual} but the checkout total is {expected}")]
    SplitMismatch { expected: Money, actual: Money },

    #[error("Gift card {0} is not active")]
    GiftCardInactive(String),

    #[error("Gift card {card_id} has {available} available, {requested} requested")]
    InsufficientGiftCardBalance {
        card_id: String,
        available: Money,
        requested: Money,
    },

    /// The settlement state machine was driven out of order.
    #[error("Invalid settlement transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Invalid payment amount: {reason}")]
    InvalidPaymentAmount { reason: String },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Used for early validation before business logic runs.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Invalid format (e.g., invalid UUID, malformed key).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================
