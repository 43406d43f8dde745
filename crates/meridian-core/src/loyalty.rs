//! # Loyalty Point Math
//!
//! Pure calculations behind the loyalty points engine. Reading balances and
//! posting ledger entries happen in meridian-settlement.
//!
//! ## Point Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  BEFORE CHARGING                    AFTER A TENDER SUCCEEDS             │
//! │  ─────────────────────────────      ──────────────────────────────────  │
//! │  preview_discount                   used points?                        │
//! │    balance × point value              ├── yes → plan_redemption         │
//! │    capped at the subtotal             │         ceil(cover / value)     │
//! │                                       │         capped at the balance   │
//! │                                       └── no  → points_to_earn          │
//! │                                                 floor(total × rate)     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::money::Money;
use crate::types::LoyaltyProgram;

/// A redemption sized against the customer's balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redemption {
    pub points_to_redeem: i64,
    /// Money the redeemed points are worth, capped at the amount to cover.
    pub redeemed_value: Money,
    pub balance_before: i64,
    pub balance_after: i64,
}

impl Redemption {
    /// Nothing to post.
    pub fn is_noop(&self) -> bool {
        self.points_to_redeem <= 0
    }
}

/// Candidate loyalty discount for a checkout.
///
/// Zero when points are not requested, the program is missing or inactive,
/// or the balance is below the program's redemption minimum.
///
/// ## Example
/// ```rust
/// use meridian_core::loyalty::preview_discount;
/// use meridian_core::money::Money;
/// use meridian_core::types::LoyaltyProgram;
/// use rust_decimal::Decimal;
///
/// let program = LoyaltyProgram {
///     id: "p".into(),
///     points_per_dollar: Decimal::ONE,
///     minimum_points_redeem: 0,
///     points_value_cents: 1,
///     is_active: true,
/// };
/// // 500 points at 1¢ = $5.00, capped at a $3.00 subtotal
/// let discount = preview_discount(500, Some(&program), true, Money::from_cents(300));
/// assert_eq!(discount, Money::from_cents(300));
/// ```
pub fn preview_discount(
    balance: i64,
    program: Option<&LoyaltyProgram>,
    use_points: bool,
    subtotal: Money,
) -> Money {
    let program = match program {
        Some(p) if use_points && p.is_active => p,
        _ => return Money::zero(),
    };

    if balance <= 0 || balance < program.minimum_points_redeem || program.points_value_cents <= 0 {
        return Money::zero();
    }

    let max_discount = Money::from_cents(balance.saturating_mul(program.points_value_cents));
    max_discount.min(subtotal.clamp_non_negative())
}

/// Points earned on a completed sale: floor(total × points per dollar).
pub fn points_to_earn(final_total: Decimal, points_per_dollar: Decimal) -> i64 {
    if final_total <= Decimal::ZERO || points_per_dollar <= Decimal::ZERO {
        return 0;
    }
    (final_total * points_per_dollar).floor().to_i64().unwrap_or(0)
}

/// Sizes a redemption that covers `amount_to_cover`.
///
/// `points_needed = ceil(amount / point value)`, capped at the balance.
pub fn plan_redemption(balance: i64, amount_to_cover: Money, points_value_cents: i64) -> Redemption {
    let balance = balance.max(0);
    let noop = Redemption {
        points_to_redeem: 0,
        redeemed_value: Money::zero(),
        balance_before: balance,
        balance_after: balance,
    };

    if points_value_cents <= 0 || !amount_to_cover.is_positive() || balance == 0 {
        return noop;
    }

    let cover = amount_to_cover.cents();
    let points_needed = (cover + points_value_cents - 1) / points_value_cents;
    let points_to_redeem = balance.min(points_needed);
    let redeemed_value = Money::from_cents(cover.min(points_to_redeem * points_value_cents));

    Redemption {
        points_to_redeem,
        redeemed_value,
        balance_before: balance,
        balance_after: balance - points_to_redeem,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
