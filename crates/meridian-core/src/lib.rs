//! # meridian-core: Pure Settlement Logic for Meridian POS
//!
//! This crate holds the settlement math as pure functions with zero I/O
//! dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Meridian Settlement Engine                         │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐    │
//! │  │                    Register UI (external)                       │    │
//! │  │       Cart ──► Tender selection ──► Confirmation ──► Receipt    │    │
//! │  └─────────────────────────────┬───────────────────────────────────┘    │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐    │
//! │  │            meridian-settlement (router + handlers)              │    │
//! │  └─────────────────────────────┬───────────────────────────────────┘    │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐    │
//! │  │              ★ meridian-core (THIS CRATE) ★                     │    │
//! │  │                                                                 │    │
//! │  │   ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐   │    │
//! │  │   │  money  │ │ totals  │ │ loyalty │ │  split  │ │  state  │   │    │
//! │  │   │  Money  │ │Breakdown│ │ earn /  │ │ check / │ │  flow   │   │    │
//! │  │   │         │ │         │ │ redeem  │ │ prorate │ │         │   │    │
//! │  │   └─────────┘ └─────────┘ └─────────┘ └─────────┘ └─────────┘   │    │
//! │  │                                                                 │    │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS            │    │
//! │  └─────────────────────────────────────────────────────────────────┘    │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐    │
//! │  │                  meridian-db (shared store)                     │    │
//! │  └─────────────────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (CartItem, Transaction, ledger entries, etc.)
//! - [`money`] - Money type with integer arithmetic
//! - [`totals`] - Totals calculator
//! - [`loyalty`] - Loyalty point math
//! - [`split`] - Split payment allocator
//! - [`state`] - Settlement state machine
//! - [`error`] - Domain error types
//! - [`validation`] - Input validation
//!
//! ## Example Usage
//!
//! ```rust
//! use meridian_core::{calculate_totals, CartItem, Money, TaxRate};
//!
//! let cart = vec![CartItem::service("color", Money::from_cents(8500), 1)];
//! let totals = calculate_totals(&cart, None, TaxRate::from_bps(675), Money::zero());
//!
//! // $85.00 + 6.75% = $90.7375, charged as $90.74
//! assert_eq!(totals.charge_amount().cents(), 9074);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod loyalty;
pub mod money;
pub mod split;
pub mod state;
pub mod totals;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use money::Money;
pub use state::{SettlementFlow, SettlementState};
pub use totals::{calculate_totals, TotalsBreakdown};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum lines allowed in a single cart.
pub const MAX_CART_ITEMS: usize = 100;

/// Maximum quantity of a single line.
///
/// Catches typing 1000 instead of 10.
pub const MAX_ITEM_QUANTITY: i64 = 999;

/// Maximum length of a caller-supplied idempotency key.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

/// Allowed difference between split legs and the checkout total.
pub const SPLIT_TOLERANCE_CENTS: i64 = 1;
