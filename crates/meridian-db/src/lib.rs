//! # meridian-db: Shared Store for Meridian POS
//!
//! SQLite-backed store for everything the settlement engine reads and
//! writes, accessed through sqlx.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Settlement Data Flow                                 │
//! │                                                                         │
//! │  PaymentRouter / handlers (meridian-settlement)                         │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐    │
//! │  │                   meridian-db (THIS CRATE)                      │    │
//! │  │                                                                 │    │
//! │  │   ┌───────────────┐   ┌─────────────────┐   ┌───────────────┐   │    │
//! │  │   │   Database    │   │  Repositories   │   │  Migrations   │   │    │
//! │  │   │   (pool.rs)   │   │                 │   │  (embedded)   │   │    │
//! │  │   │               │   │ Inventory       │   │               │   │    │
//! │  │   │ SqlitePool    │◄──│ Loyalty         │   │ 001_settle-   │   │    │
//! │  │   │ WAL, FKs on   │   │ GiftCard        │   │ ment_schema   │   │    │
//! │  │   │               │   │ Transaction     │   │               │   │    │
//! │  │   │               │   │ Receipt, Outbox │   │               │   │    │
//! │  │   └───────────────┘   └─────────────────┘   └───────────────┘   │    │
//! │  └─────────────────────────────────────────────────────────────────┘    │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite file shared by every register                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Atomicity
//! The engine never opens a multi-statement transaction. Every repository
//! method is a single statement, and the balance-sensitive ones (stock
//! decrement, gift card redeem, loyalty redeem) carry their guard in the
//! same statement.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use meridian_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("store.db")).await?;
//! let balance = db.gift_cards().resolve_balance(&card_id).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::customer::LoyaltyRepository;
pub use repository::gift_card::GiftCardRepository;
pub use repository::inventory::InventoryRepository;
pub use repository::outbox::OutboxRepository;
pub use repository::receipt::ReceiptRepository;
pub use repository::transaction::TransactionRepository;
