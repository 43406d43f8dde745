//! # Repository Module
//!
//! Store repositories for the settlement engine.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Settlement handler                                                     │
//! │       │                                                                 │
//! │       │  db.gift_cards().append_redeem(card, amount, tx, key)           │
//! │       ▼                                                                 │
//! │  GiftCardRepository                                                     │
//! │  ├── resolve_balance(&self, id)                                         │
//! │  ├── append_redeem(&self, ...)                                          │
//! │  └── refresh_cached_balance(&self, ...)                                 │
//! │       │                                                                 │
//! │       │  One SQL statement per call                                     │
//! │       ▼                                                                 │
//! │  SQLite                                                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`InventoryRepository`](inventory::InventoryRepository) - Stock reads and signed-delta updates
//! - [`LoyaltyRepository`](customer::LoyaltyRepository) - Customers, programs, loyalty ledger
//! - [`GiftCardRepository`](gift_card::GiftCardRepository) - Cards and balance ledger
//! - [`TransactionRepository`](transaction::TransactionRepository) - Transactions, items, splits
//! - [`ReceiptRepository`](receipt::ReceiptRepository) - Receipt stubs
//! - [`OutboxRepository`](outbox::OutboxRepository) - Failed post-commit steps

pub mod customer;
pub mod gift_card;
pub mod inventory;
pub mod outbox;
pub mod receipt;
pub mod transaction;
