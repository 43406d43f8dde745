//! # Domain Types
//!
//! Core domain types used throughout the settlement engine.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Settlement Types                                │
//! │                                                                         │
//! │  INPUTS (read-only snapshots)          RECORDS (written once)           │
//! │  ─────────────────────────────         ─────────────────────────────    │
//! │  CartItem ── ItemKind                  Transaction                      │
//! │  Discount ── DiscountKind              TransactionItem                  │
//! │  TaxRate                               PaymentSplitRecord               │
//! │  Shift                                 GiftCardLedgerEntry              │
//! │  LoyaltyProgram                        LoyaltyLedgerEntry               │
//! │  SplitPayment ── PaymentMethod         Receipt                          │
//! │                                        OutboxEntry                      │
//! │                                                                         │
//! │  CACHED ENTITIES (one scalar overwritten after each ledger write)       │
//! │  ─────────────────────────────────────────────────────────────────      │
//! │  GiftCard.current_balance_cents    ◄── latest GiftCardLedgerEntry       │
//! │  Customer.loyalty_points           ◄── Σ LoyaltyLedgerEntry             │
//! │  InventoryItem.stock_quantity      ◄── signed-delta adjustments         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Persisted records keep amounts as `*_cents: i64` columns and expose
//! `Money` accessors, so rows map straight onto the structs.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::money::Money;

// =============================================================================
// Tax Rate
// =============================================================================

/// Tax rate represented in basis points (bps).
///
/// ## Why Basis Points?
/// 1 basis point = 0.01% = 1/10000
/// 675 bps = 6.75%
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct TaxRate(u32);

impl TaxRate {
    /// Creates a tax rate from basis points.
    #[inline]
    pub const fn from_bps(bps: u32) -> Self {
        TaxRate(bps)
    }

    /// Returns the rate in basis points.
    #[inline]
    pub const fn bps(&self) -> u32 {
        self.0
    }

    /// Returns the rate as an exact percentage (675 bps → 6.75).
    pub fn percentage(&self) -> Decimal {
        Decimal::new(self.0 as i64, 2)
    }

    #[inline]
    pub const fn zero() -> Self {
        TaxRate(0)
    }

    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl Default for TaxRate {
    fn default() -> Self {
        TaxRate::zero()
    }
}

// =============================================================================
// Cart Inputs
// =============================================================================

/// What a cart line refers to.
///
/// Only `Inventory` lines are stock-checked and decremented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Service,
    Inventory,
}

/// A line of the cart snapshot handed to the engine.
///
/// Owned by the caller. The engine reads it and never mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    /// Service or inventory item id.
    pub id: String,
    pub kind: ItemKind,
    pub unit_price: Money,
    pub quantity: i64,
}

impl CartItem {
    pub fn service(id: impl Into<String>, unit_price: Money, quantity: i64) -> Self {
        CartItem {
            id: id.into(),
            kind: ItemKind::Service,
            unit_price,
            quantity,
        }
    }

    pub fn inventory(id: impl Into<String>, unit_price: Money, quantity: i64) -> Self {
        CartItem {
            id: id.into(),
            kind: ItemKind::Inventory,
            unit_price,
            quantity,
        }
    }

    /// Unit price × quantity.
    #[inline]
    pub fn line_total(&self) -> Money {
        self.unit_price.multiply_quantity(self.quantity)
    }

    #[inline]
    pub fn is_inventory(&self) -> bool {
        self.kind == ItemKind::Inventory
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum DiscountKind {
    /// `value` is a percent of the subtotal (10 = 10%).
    Percentage,
    /// `value` is a dollar amount.
    Fixed,
}

/// A manual discount applied to the whole cart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct Discount {
    pub id: String,
    pub kind: DiscountKind,
    #[ts(type = "string")]
    pub value: Decimal,
}

impl Discount {
    pub fn percentage(id: impl Into<String>, percent: Decimal) -> Self {
        Discount {
            id: id.into(),
            kind: DiscountKind::Percentage,
            value: percent,
        }
    }

    pub fn fixed(id: impl Into<String>, amount: Money) -> Self {
        Discount {
            id: id.into(),
            kind: DiscountKind::Fixed,
            value: amount.to_decimal(),
        }
    }
}

/// The open register shift. Required for cash settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shift {
    pub id: String,
    pub location_id: String,
}

// =============================================================================
// Payment Method
// =============================================================================

/// Tender used for a transaction or a split leg.
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    /// Hosted card-not-present payment through the gateway.
    Card,
    /// In-person card reader.
    CardPresent,
    GiftCard,
    /// Zero-dollar checkout fully covered by points.
    LoyaltyPoints,
}

impl PaymentMethod {
    /// Methods whose money is captured by the card gateway or terminal.
    pub fn is_card(&self) -> bool {
        matches!(self, PaymentMethod::Card | PaymentMethod::CardPresent)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::CardPresent => "card_present",
            PaymentMethod::GiftCard => "gift_card",
            PaymentMethod::LoyaltyPoints => "loyalty_points",
        }
    }
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tender leg of a split checkout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SplitPayment {
    pub method: PaymentMethod,
    pub amount: Money,
    pub gift_card_id: Option<String>,
}

impl SplitPayment {
    pub fn cash(amount: Money) -> Self {
        SplitPayment {
            method: PaymentMethod::Cash,
            amount,
            gift_card_id: None,
        }
    }

    pub fn card(amount: Money) -> Self {
        SplitPayment {
            method: PaymentMethod::Card,
            amount,
            gift_card_id: None,
        }
    }

    pub fn gift_card(gift_card_id: impl Into<String>, amount: Money) -> Self {
        SplitPayment {
            method: PaymentMethod::GiftCard,
            amount,
            gift_card_id: Some(gift_card_id.into()),
        }
    }
}

// =============================================================================
// Transaction Records
// =============================================================================

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Completed,
    /// Set by the external refund collaborator.
    PartiallyRefunded,
    /// Set by the external refund collaborator.
    Refunded,
}

/// A settled checkout. Written once; only `refunded_cents` changes later.
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    /// Caller-supplied key, unique per checkout attempt.
    pub idempotency_key: String,
    pub payment_method: PaymentMethod,
    pub status: TransactionStatus,
    pub total_cents: i64,
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    /// Manual discount plus loyalty discount.
    pub discount_cents: i64,
    pub loyalty_discount_cents: i64,
    pub is_split_payment: bool,
    pub shift_id: Option<String>,
    pub customer_id: Option<String>,
    pub gift_card_id: Option<String>,
    pub gateway_payment_id: Option<String>,
    pub card_last4: Option<String>,
    pub card_brand: Option<String>,
    pub refunded_cents: i64,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    #[inline]
    pub fn total(&self) -> Money {
        Money::from_cents(self.total_cents)
    }

    #[inline]
    pub fn refunded(&self) -> Money {
        Money::from_cents(self.refunded_cents)
    }
}

/// A line of a settled transaction (price snapshot).
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionItem {
    pub id: String,
    pub transaction_id: String,
    pub service_id: Option<String>,
    pub inventory_id: Option<String>,
    pub quantity: i64,
    pub price_cents: i64,
    pub created_at: DateTime<Utc>,
}

impl TransactionItem {
    /// Builds the record for a cart line, routing the id by item kind.
    pub fn from_cart_item(id: String, transaction_id: &str, item: &CartItem, now: DateTime<Utc>) -> Self {
        let (service_id, inventory_id) = match item.kind {
            ItemKind::Service => (Some(item.id.clone()), None),
            ItemKind::Inventory => (None, Some(item.id.clone())),
        };
        TransactionItem {
            id,
            transaction_id: transaction_id.to_string(),
            service_id,
            inventory_id,
            quantity: item.quantity,
            price_cents: item.unit_price.cents(),
            created_at: now,
        }
    }
}

/// A persisted split-tender leg.
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentSplitRecord {
    pub id: String,
    pub transaction_id: String,
    pub method: PaymentMethod,
    pub amount_cents: i64,
    pub gift_card_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PaymentSplitRecord {
    #[inline]
    pub fn amount(&self) -> Money {
        Money::from_cents(self.amount_cents)
    }
}

/// Receipt stub. Template resolution and printing happen elsewhere.
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub id: String,
    pub transaction_id: String,
    pub receipt_number: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Inventory
// =============================================================================

/// A stock-tracked item as the store sees it.
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub id: String,
    pub name: String,
    pub barcode: Option<String>,
    pub price_cents: i64,
    pub stock_quantity: i64,
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Gift Cards
// =============================================================================

/// A store-issued gift card.
///
/// `current_balance_cents` is a materialized cache. The authoritative balance
/// is the `balance_after_cents` of the card's latest ledger entry.
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GiftCard {
    pub id: String,
    pub card_number: String,
    pub initial_balance_cents: i64,
    pub current_balance_cents: i64,
    pub is_active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl GiftCard {
    #[inline]
    pub fn cached_balance(&self) -> Money {
        Money::from_cents(self.current_balance_cents)
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GiftCardEntryType {
    Redeem,
    Activate,
    Purchase,
}

/// Append-only gift card ledger entry. Never updated or deleted.
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GiftCardLedgerEntry {
    pub id: String,
    pub gift_card_id: String,
    pub transaction_id: Option<String>,
    pub entry_type: GiftCardEntryType,
    pub amount_cents: i64,
    /// Balance after this entry. Always >= 0.
    pub balance_after_cents: i64,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl GiftCardLedgerEntry {
    #[inline]
    pub fn balance_after(&self) -> Money {
        Money::from_cents(self.balance_after_cents)
    }
}

// =============================================================================
// Loyalty
// =============================================================================

/// Loyalty program configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoyaltyProgram {
    pub id: String,
    /// Points earned per dollar of final total.
    pub points_per_dollar: Decimal,
    pub minimum_points_redeem: i64,
    /// Value of one point, in cents.
    pub points_value_cents: i64,
    pub is_active: bool,
}

impl LoyaltyProgram {
    #[inline]
    pub fn point_value(&self) -> Money {
        Money::from_cents(self.points_value_cents)
    }
}

/// A customer with a cached point balance.
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub name: String,
    /// Cache of Σ(earned − redeemed) over the loyalty ledger.
    pub loyalty_points: i64,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoyaltyEntryType {
    Earn,
    Redeem,
}

/// Append-only loyalty ledger entry.
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoyaltyLedgerEntry {
    pub id: String,
    pub customer_id: String,
    /// None for opening balances granted outside a sale.
    pub transaction_id: Option<String>,
    pub points_earned: Option<i64>,
    pub points_redeemed: Option<i64>,
    /// Running balance after this entry. Never negative.
    pub points_balance: i64,
    pub entry_type: LoyaltyEntryType,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Pending Card Transaction
// =============================================================================

/// A hosted-card checkout waiting for out-of-band gateway confirmation.
///
/// Created before any remote write. Lives only until
/// `finalize_card_payment` settles it or the caller abandons it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTransaction {
    pub id: String,
    pub idempotency_key: String,
    /// Final total of the checkout.
    pub amount: Money,
    /// What the gateway is asked to capture (after split pre-payment).
    pub amount_to_charge: Money,
    pub customer_id: Option<String>,
    pub use_points: bool,
    pub items: Vec<CartItem>,
    pub discount: Option<Discount>,
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub tax_rate: TaxRate,
    pub loyalty_discount: Money,
    pub shift_id: Option<String>,
    pub loyalty_program_id: Option<String>,
    pub split_payments: Vec<SplitPayment>,
    /// True when nothing is left to charge and the gateway was skipped.
    pub is_free: bool,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Settlement Outbox
// =============================================================================

/// Post-commit step that failed and was queued for follow-up.
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxKind {
    ItemInsert,
    SplitInsert,
    InventoryDecrement,
    GiftCardDebit,
    GiftCardCacheRefresh,
    LoyaltyEarn,
    LoyaltyCacheRefresh,
    Receipt,
    /// A captured card payment with no transaction row. Keyed by the
    /// pending checkout id instead of a transaction id.
    UnsettledPayment,
}

impl OutboxKind {
    /// Kinds that wait for an operator instead of the replay worker.
    pub const OPERATOR_ONLY: [OutboxKind; 2] = [OutboxKind::GiftCardDebit, OutboxKind::UnsettledPayment];

    /// Whether a replay worker may retry the step on its own.
    ///
    /// Gift card debits are not replayed: the card may have been spent
    /// elsewhere since, so an operator decides. Unsettled payments need a
    /// gateway refund or a manual settlement.
    pub fn is_replayable(&self) -> bool {
        !Self::OPERATOR_ONLY.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxKind::ItemInsert => "item_insert",
            OutboxKind::SplitInsert => "split_insert",
            OutboxKind::InventoryDecrement => "inventory_decrement",
            OutboxKind::GiftCardDebit => "gift_card_debit",
            OutboxKind::GiftCardCacheRefresh => "gift_card_cache_refresh",
            OutboxKind::LoyaltyEarn => "loyalty_earn",
            OutboxKind::LoyaltyCacheRefresh => "loyalty_cache_refresh",
            OutboxKind::Receipt => "receipt",
            OutboxKind::UnsettledPayment => "unsettled_payment",
        }
    }
}

/// A queued follow-up for a partially written settlement.
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: String,
    pub transaction_id: String,
    pub kind: OutboxKind,
    /// JSON payload describing the step.
    pub payload: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tax_rate_percentage() {
        assert_eq!(TaxRate::from_bps(675).percentage(), Decimal::new(675, 2));
        assert!(TaxRate::default().is_zero());
    }

    #[test]
    fn test_transaction_item_routes_id_by_kind() {
        let now = Utc::now();
        let svc = CartItem::service("svc-1", Money::from_cents(2500), 1);
        let inv = CartItem::inventory("inv-1", Money::from_cents(899), 2);

        let a = TransactionItem::from_cart_item("a".into(), "tx", &svc, now);
        let b = TransactionItem::from_cart_item("b".into(), "tx", &inv, now);

        assert_eq!(a.service_id.as_deref(), Some("svc-1"));
        assert!(a.inventory_id.is_none());
        assert_eq!(b.inventory_id.as_deref(), Some("inv-1"));
        assert_eq!(inv.line_total().cents(), 1798);
    }

    #[test]
    fn test_gift_card_debits_are_not_replayable() {
        assert!(!OutboxKind::GiftCardDebit.is_replayable());
        assert!(!OutboxKind::UnsettledPayment.is_replayable());
        assert!(OutboxKind::InventoryDecrement.is_replayable());
        assert!(OutboxKind::Receipt.is_replayable());
    }
}
