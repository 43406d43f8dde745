//! # Totals Calculator
//!
//! Derives the money breakdown of a checkout from the cart, an optional
//! manual discount, the tax rate and an optional loyalty discount.
//!
//! ## Calculation Order
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  subtotal       = Σ (unit_price × quantity)                             │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  discount       = min(subtotal, pct ? subtotal × value / 100 : value)   │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  after_discount = max(0, subtotal − discount − loyalty_discount)        │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  tax            = after_discount × rate                                 │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  final_total    = after_discount + tax                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All fields are exact decimal dollars. Nothing is rounded here; the
//! amount actually charged comes from [`TotalsBreakdown::charge_amount`].
//!
//! ## Example
//! ```rust
//! use meridian_core::money::Money;
//! use meridian_core::totals::calculate_totals;
//! use meridian_core::types::{CartItem, Discount, TaxRate};
//! use rust_decimal::Decimal;
//!
//! let cart = vec![CartItem::service("cut", Money::from_cents(10000), 1)];
//! let discount = Discount::percentage("d10", Decimal::from(10));
//! let totals = calculate_totals(&cart, Some(&discount), TaxRate::from_bps(675), Money::zero());
//!
//! assert_eq!(totals.tax_amount, Decimal::new(6075, 3));
//! assert_eq!(totals.final_total, Decimal::new(96075, 3));
//! assert_eq!(totals.charge_amount().cents(), 9608);
//! ```

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::money::Money;
use crate::types::{CartItem, Discount, DiscountKind, TaxRate};

/// Derived checkout totals. Recomputed on every call, never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct TotalsBreakdown {
    #[ts(type = "string")]
    pub subtotal: Decimal,
    /// Manual discount actually applied (capped at the subtotal).
    #[ts(type = "string")]
    pub discount_amount: Decimal,
    #[ts(type = "string")]
    pub loyalty_discount: Decimal,
    #[ts(type = "string")]
    pub after_discount: Decimal,
    #[ts(type = "string")]
    pub tax_amount: Decimal,
    #[ts(type = "string")]
    pub final_total: Decimal,
}

impl TotalsBreakdown {
    /// The amount to charge, rounded to cents and never negative.
    pub fn charge_amount(&self) -> Money {
        Money::from_decimal_rounded(self.final_total).clamp_non_negative()
    }

    /// True when discounts fully cover the purchase (the fast path).
    pub fn is_zero_dollar(&self) -> bool {
        self.final_total <= Decimal::ZERO
    }

    /// Manual plus loyalty discount, in cents.
    pub fn discount_total(&self) -> Money {
        Money::from_decimal_rounded(self.discount_amount + self.loyalty_discount)
    }

    pub fn subtotal_money(&self) -> Money {
        Money::from_decimal_rounded(self.subtotal)
    }

    pub fn tax_money(&self) -> Money {
        Money::from_decimal_rounded(self.tax_amount)
    }
}

/// Sum of unit price × quantity over the cart.
pub fn cart_subtotal(items: &[CartItem]) -> Money {
    items.iter().map(CartItem::line_total).sum()
}

/// Computes the totals breakdown. Pure: same inputs, same output.
pub fn calculate_totals(
    items: &[CartItem],
    discount: Option<&Discount>,
    tax_rate: TaxRate,
    loyalty_discount: Money,
) -> TotalsBreakdown {
    let subtotal = cart_subtotal(items).to_decimal();

    let discount_amount = match discount {
        Some(d) => {
            let raw = match d.kind {
                DiscountKind::Percentage => subtotal * d.value / Decimal::ONE_HUNDRED,
                DiscountKind::Fixed => d.value,
            };
            raw.max(Decimal::ZERO).min(subtotal)
        }
        None => Decimal::ZERO,
    };

    let loyalty_discount = loyalty_discount.clamp_non_negative().to_decimal();
    let after_discount = (subtotal - discount_amount - loyalty_discount).max(Decimal::ZERO);
    let tax_amount = after_discount * tax_rate.percentage() / Decimal::ONE_HUNDRED;
    let final_total = after_discount + tax_amount;

    TotalsBreakdown {
        subtotal,
        discount_amount,
        loyalty_discount,
        after_discount,
        tax_amount,
        final_total,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn cart_of(cents: i64) -> Vec<CartItem> {
        vec![CartItem::service("svc", Money::from_cents(cents), 1)]
    }

    #[test]
    fn test_percentage_discount_with_tax() {
        let discount = Discount::percentage("d", Decimal::from(10));
        let totals = calculate_totals(
            &cart_of(10000),
            Some(&discount),
            TaxRate::from_bps(675),
            Money::zero(),
        );

        assert_eq!(totals.subtotal, Decimal::from(100));
        assert_eq!(totals.discount_amount, Decimal::from(10));
        assert_eq!(totals.after_discount, Decimal::from(90));
        assert_eq!(totals.tax_amount, Decimal::new(6075, 3));
        assert_eq!(totals.final_total, Decimal::new(96075, 3));
        assert_eq!(totals.charge_amount(), Money::from_cents(9608));
    }

    #[test]
    fn test_is_pure() {
        let cart = vec![
            CartItem::service("a", Money::from_cents(1999), 2),
            CartItem::inventory("b", Money::from_cents(550), 3),
        ];
        let discount = Discount::fixed("f", Money::from_cents(500));
        let first = calculate_totals(&cart, Some(&discount), TaxRate::from_bps(825), Money::from_cents(100));
        let second = calculate_totals(&cart, Some(&discount), TaxRate::from_bps(825), Money::from_cents(100));
        assert_eq!(first, second);
        assert_eq!(first.subtotal, Decimal::new(5648, 2));
    }

    #[test]
    fn test_fixed_discount_is_capped_at_subtotal() {
        let discount = Discount::fixed("f", Money::from_cents(5000));
        let totals = calculate_totals(&cart_of(3000), Some(&discount), TaxRate::from_bps(675), Money::zero());

        assert_eq!(totals.discount_amount, Decimal::from(30));
        assert_eq!(totals.final_total, Decimal::ZERO);
        assert!(totals.is_zero_dollar());
    }

    #[test]
    fn test_loyalty_discount_never_drives_total_negative() {
        let discount = Discount::percentage("d", Decimal::from(50));
        let totals = calculate_totals(
            &cart_of(1000),
            Some(&discount),
            TaxRate::from_bps(1000),
            Money::from_cents(800),
        );

        assert_eq!(totals.after_discount, Decimal::ZERO);
        assert_eq!(totals.tax_amount, Decimal::ZERO);
        assert_eq!(totals.charge_amount(), Money::zero());
    }

    #[test]
    fn test_zero_dollar_iff_discounts_cover_everything() {
        let covered = calculate_totals(&cart_of(300), None, TaxRate::zero(), Money::from_cents(300));
        assert!(covered.is_zero_dollar());

        let one_cent_short = calculate_totals(&cart_of(300), None, TaxRate::zero(), Money::from_cents(299));
        assert!(!one_cent_short.is_zero_dollar());
        assert_eq!(one_cent_short.charge_amount(), Money::from_cents(1));
    }

    #[test]
    fn test_discount_total_combines_manual_and_loyalty() {
        let discount = Discount::fixed("f", Money::from_cents(250));
        let totals = calculate_totals(&cart_of(2000), Some(&discount), TaxRate::zero(), Money::from_cents(150));
        assert_eq!(totals.discount_total(), Money::from_cents(400));
        assert_eq!(totals.subtotal_money(), Money::from_cents(2000));
    }
}
