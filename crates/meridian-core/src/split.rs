//! # Split Payment Allocator
//!
//! Checks that split tender legs add up to the checkout total, and spreads a
//! refund across the legs of a split transaction for reporting.
//!
//! ## Refund Proration
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Legs: cash $40 + gift card $60 = $100        Refund: $10               │
//! │                                                                         │
//! │  cash      share = 10 × 40/100 = $4    adjusted = $36                   │
//! │  gift card share = 10 − 4      = $6    adjusted = $54                   │
//! │                                                                         │
//! │  The last leg absorbs rounding so shares always sum to the refund.      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::money::Money;
use crate::types::{PaymentMethod, SplitPayment};
use crate::SPLIT_TOLERANCE_CENTS;

/// Validates split legs against the checkout total.
///
/// ## Rules
/// - Every leg is positive
/// - Gift card legs name their card
/// - Loyalty points are not a split tender
/// - `|Σ amount − total| ≤ 1¢`
pub fn validate_split(splits: &[SplitPayment], total: Money) -> CoreResult<()> {
    for leg in splits {
        if !leg.amount.is_positive() {
            return Err(CoreError::InvalidPaymentAmount {
                reason: format!("{} leg must be positive, got {}", leg.method, leg.amount),
            });
        }
        match leg.method {
            PaymentMethod::GiftCard if leg.gift_card_id.is_none() => {
                return Err(ValidationError::Required {
                    field: "gift_card_id".to_string(),
                }
                .into());
            }
            PaymentMethod::LoyaltyPoints => {
                return Err(CoreError::InvalidPaymentAmount {
                    reason: "loyalty points cannot be a split leg".to_string(),
                });
            }
            _ => {}
        }
    }

    let actual = split_total(splits);
    if (actual - total).abs().cents() > SPLIT_TOLERANCE_CENTS {
        return Err(CoreError::SplitMismatch {
            expected: total,
            actual,
        });
    }

    Ok(())
}

/// Sum of all leg amounts.
pub fn split_total(splits: &[SplitPayment]) -> Money {
    splits.iter().map(|s| s.amount).sum()
}

/// Sum of legs paid with a given method.
pub fn portion_for(splits: &[SplitPayment], method: PaymentMethod) -> Money {
    splits
        .iter()
        .filter(|s| s.method == method)
        .map(|s| s.amount)
        .sum()
}

/// A split leg with its share of refunds applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProratedLeg {
    pub method: PaymentMethod,
    pub gift_card_id: Option<String>,
    pub original: Money,
    /// Negative adjustment attributed to this leg.
    pub refund_share: Money,
    pub adjusted: Money,
}

/// Distributes `refund_total` across legs in proportion to their amounts.
pub fn prorate_refund(splits: &[SplitPayment], refund_total: Money) -> Vec<ProratedLeg> {
    let total = split_total(splits);
    let refund = refund_total.clamp_non_negative().min(total.clamp_non_negative());

    let mut allocated = Money::zero();
    let last = splits.len().saturating_sub(1);

    splits
        .iter()
        .enumerate()
        .map(|(i, leg)| {
            let share = if !total.is_positive() {
                Money::zero()
            } else if i == last {
                refund - allocated
            } else {
                let numerator = refund.cents() as i128 * leg.amount.cents() as i128;
                let denominator = total.cents() as i128;
                // round half up on non-negative values
                Money::from_cents(((numerator * 2 + denominator) / (denominator * 2)) as i64)
            };
            allocated += share;

            ProratedLeg {
                method: leg.method,
                gift_card_id: leg.gift_card_id.clone(),
                original: leg.amount,
                refund_share: -share,
                adjusted: leg.amount - share,
            }
        })
        .collect()
}

// =============================================================================
// Unit Tests
// =============================================================================
