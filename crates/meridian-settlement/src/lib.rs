//! # meridian-settlement: Payment Settlement Engine for Meridian POS
//!
//! Turns a cart snapshot into a settled transaction: quotes totals and
//! loyalty, validates stock and balances, takes payment through the chosen
//! tender, and writes the records. Steps that fail after the transaction
//! row exists are queued to the outbox instead of rolling the sale back.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Settlement Architecture                          │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐   │
//! │  │                    PaymentRouter (entry point)                   │   │
//! │  │  preview · settle_cash · settle_gift_card · begin/finalize card  │   │
//! │  │  charge_card_present · abandon                                   │   │
//! │  └────────────────────────────┬─────────────────────────────────────┘   │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                   │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐     │
//! │  │   checkout     │  │   handlers     │  │   ports                │     │
//! │  │                │  │                │  │                        │     │
//! │  │ quote(): totals│  │ cash, gift,    │  │ PaymentGateway         │     │
//! │  │ + loyalty cap  │  │ card, reader,  │  │ TerminalService        │     │
//! │  │                │  │ loyalty_only   │  │ CompletionSink         │     │
//! │  └────────────────┘  └───────┬────────┘  └────────────────────────┘     │
//! │                              │ commit()                                 │
//! │         ┌────────────────────┼────────────────────┐                     │
//! │         ▼                    ▼                    ▼                     │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐     │
//! │  │ InventoryGuard │  │ GiftCardLedger │  │ LoyaltyEngine          │     │
//! │  │ conditional    │  │ append-only,   │  │ append-only,           │     │
//! │  │ decrements     │  │ idempotent     │  │ guarded redeem         │     │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘     │
//! │                              │ failures after the tx row                │
//! │                              ▼                                          │
//! │                     ┌────────────────┐                                  │
//! │                     │ OutboxReplayer │  background tokio task           │
//! │                     └────────────────┘                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`router`] - `PaymentRouter`, the register-facing API
//! - [`checkout`] - Checkout requests and quotes
//! - [`gift_card`], [`loyalty`], [`inventory`] - Ledger and stock services
//! - [`outbox`] - Follow-up queueing and replay
//! - [`ports`] - Gateway, terminal and completion traits
//! - [`cache`] - Per-session barcode cache
//! - [`config`] - TOML configuration with `MERIDIAN_*` overrides
//! - [`error`] - Settlement errors and wire codes
//!
//! ## Usage
//!
//! ```rust,ignore
//! use meridian_settlement::{CheckoutRequest, PaymentRouter, SettlementConfig, SettlementContext};
//!
//! let config = SettlementConfig::load_or_default(None);
//! let ctx = SettlementContext::new(database, config);
//! let router = PaymentRouter::new(ctx, gateway, terminal);
//!
//! let request = CheckoutRequest::new(key, cart).with_shift(shift);
//! let outcome = router.settle_cash(request, Some(Money::from_cents(5000))).await?;
//! println!("Change: {:?}", outcome.change_due);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod cache;
pub mod checkout;
pub mod config;
pub mod context;
pub mod error;
pub mod gift_card;
mod handlers;
pub mod inventory;
pub mod loyalty;
pub mod outbox;
pub mod outcome;
pub mod ports;
pub mod router;

#[cfg(test)]
mod test_support;

// =============================================================================
// Re-exports
// =============================================================================

pub use cache::{BarcodeCache, RegisterSession};
pub use checkout::{Checkout, CheckoutRequest, Quote};
pub use config::SettlementConfig;
pub use context::SettlementContext;
pub use error::{ErrorCode, ErrorResponse, SettlementError, SettlementResult};
pub use gift_card::GiftCardLedger;
pub use inventory::InventoryGuard;
pub use loyalty::{LoyaltyEngine, LoyaltyPreview};
pub use outbox::{FollowUp, OutboxReplayer, OutboxReplayerHandle, ReplayReport};
pub use outcome::{PartialWrite, SettlementOutcome};
pub use ports::{
    CardDetails, CompletionSink, GatewayError, PaymentGateway, PaymentIntent, Reader, TerminalPayment,
    TerminalService,
};
pub use router::{CardCheckout, PaymentRouter};
