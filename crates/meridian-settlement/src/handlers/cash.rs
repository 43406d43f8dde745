//! Cash settlement, optionally split with store gift cards.
//!
//! Needs an open shift. When `cash_tendered` is given, change is what the
//! customer handed over minus the cash portion.

use tracing::debug;

use meridian_core::split::{portion_for, validate_split};
use meridian_core::{CoreError, Money, PaymentMethod, SettlementFlow, SplitPayment};

use super::{commit, fail_on_error, gift_debits, recheck_balances, start, validate_checkout, Tender};
use crate::checkout::Checkout;
use crate::context::SettlementContext;
use crate::error::SettlementResult;
use crate::outcome::SettlementOutcome;

pub(crate) async fn settle(
    ctx: &SettlementContext,
    checkout: &Checkout,
    cash_tendered: Option<Money>,
) -> SettlementResult<SettlementOutcome> {
    let mut flow = SettlementFlow::new();
    start(&mut flow, PaymentMethod::Cash)?;

    let tender = fail_on_error(&mut flow, plan(checkout, cash_tendered))?;
    fail_on_error(&mut flow, validate_checkout(ctx, checkout, &tender.gift_debits).await)?;
    fail_on_error(&mut flow, recheck_balances(ctx, checkout, &tender.gift_debits).await)?;

    commit(ctx, &mut flow, checkout, tender).await
}

fn plan(checkout: &Checkout, cash_tendered: Option<Money>) -> SettlementResult<Tender> {
    if checkout.request.shift.is_none() {
        return Err(CoreError::NoActiveShift.into());
    }

    let total = checkout.quote.charge_amount();
    let legs = &checkout.request.split_payments;

    if let Some(leg) = legs
        .iter()
        .find(|l| !matches!(l.method, PaymentMethod::Cash | PaymentMethod::GiftCard))
    {
        return Err(CoreError::InvalidPaymentAmount {
            reason: format!("{} cannot be tendered at the cash drawer", leg.method),
        }
        .into());
    }
    if !legs.is_empty() {
        validate_split(legs, total)?;
    }

    let cash_portion = if legs.is_empty() {
        total
    } else {
        portion_for(legs, PaymentMethod::Cash)
    };

    let change_due = match cash_tendered {
        Some(tendered) if tendered < cash_portion => {
            return Err(CoreError::InvalidPaymentAmount {
                reason: format!("tendered {} does not cover cash portion {}", tendered, cash_portion),
            }
            .into());
        }
        Some(tendered) => Some(tendered - cash_portion),
        None => None,
    };

    let debits = gift_debits(legs);
    debug!(cash = %cash_portion, gift_cards = debits.len(), "Cash tender planned");

    let mut tender = Tender::new(PaymentMethod::Cash);
    tender.gift_card_id = single_card(legs);
    tender.legs = legs.clone();
    tender.gift_debits = debits;
    tender.change_due = change_due;
    Ok(tender)
}

/// The card id when exactly one gift card takes part.
pub(super) fn single_card(legs: &[SplitPayment]) -> Option<String> {
    let mut cards = legs.iter().filter_map(|l| l.gift_card_id.as_deref());
    let first = cards.next()?;
    if cards.all(|c| c == first) {
        Some(first.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::{prepare, CheckoutRequest};
    use crate::error::SettlementError;
    use crate::test_support::{gift_card_id, seeded_context, shift, SPRAY};
    use meridian_core::{CartItem, OutboxKind, SettlementState};

    fn spray_cart() -> Vec<CartItem> {
        vec![CartItem::inventory(SPRAY, Money::from_cents(1575), 1)]
    }

    #[tokio::test]
    async fn test_requires_shift() {
        let ctx = seeded_context().await;
        let checkout = prepare(&ctx, CheckoutRequest::new("chk-noshift", spray_cart()))
            .await
            .unwrap();

        let err = settle(&ctx, &checkout, None).await.unwrap_err();
        assert!(matches!(err, SettlementError::Core(CoreError::NoActiveShift)));
        assert_eq!(ctx.db().transactions().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cash_with_change() {
        let ctx = seeded_context().await;
        let checkout = prepare(
            &ctx,
            CheckoutRequest::new("chk-change", spray_cart()).with_shift(shift()),
        )
        .await
        .unwrap();

        let outcome = settle(&ctx, &checkout, Some(Money::from_cents(2000))).await.unwrap();

        assert_eq!(outcome.transaction.total(), Money::from_cents(1575));
        assert_eq!(outcome.change_due, Some(Money::from_cents(425)));
        assert!(outcome.receipt.is_some());
        assert!(outcome.is_clean());
        assert_eq!(ctx.db().inventory().get_stock(SPRAY).await.unwrap(), Some(1));
        assert_eq!(ctx.db().transactions().get_items(outcome.transaction_id()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tendered_below_cash_portion() {
        let ctx = seeded_context().await;
        let checkout = prepare(
            &ctx,
            CheckoutRequest::new("chk-short", spray_cart()).with_shift(shift()),
        )
        .await
        .unwrap();

        let err = settle(&ctx, &checkout, Some(Money::from_cents(1000))).await.unwrap_err();
        assert!(matches!(
            err,
            SettlementError::Core(CoreError::InvalidPaymentAmount { .. })
        ));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_card_leg_rejected_at_drawer() {
        let ctx = seeded_context().await;
        let checkout = prepare(
            &ctx,
            CheckoutRequest::new("chk-cardleg", spray_cart())
                .with_shift(shift())
                .with_splits(vec![
                    SplitPayment::cash(Money::from_cents(575)),
                    SplitPayment::card(Money::from_cents(1000)),
                ]),
        )
        .await
        .unwrap();

        assert!(settle(&ctx, &checkout, None).await.is_err());
    }

    #[tokio::test]
    async fn test_split_gift_leg_on_inactive_card() {
        let ctx = seeded_context().await;
        let card = gift_card_id(&ctx).await;
        ctx.db().gift_cards().deactivate(&card).await.unwrap();

        let checkout = prepare(
            &ctx,
            CheckoutRequest::new("chk-inactive", spray_cart())
                .with_shift(shift())
                .with_splits(vec![
                    SplitPayment::cash(Money::from_cents(575)),
                    SplitPayment::gift_card(&card, Money::from_cents(1000)),
                ]),
        )
        .await
        .unwrap();

        let err = settle(&ctx, &checkout, None).await.unwrap_err();
        assert!(matches!(err, SettlementError::Core(CoreError::GiftCardInactive(_))));
        assert_eq!(ctx.db().transactions().count().await.unwrap(), 0);
        assert_eq!(ctx.db().inventory().get_stock(SPRAY).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_sold_out_between_check_and_decrement_is_queued() {
        let ctx = seeded_context().await;
        let checkout = prepare(
            &ctx,
            CheckoutRequest::new("chk-race", vec![CartItem::inventory(SPRAY, Money::from_cents(1575), 2)])
                .with_shift(shift()),
        )
        .await
        .unwrap();

        // validation passes, then another register takes one
        let mut flow = SettlementFlow::new();
        start(&mut flow, PaymentMethod::Cash).unwrap();
        let tender = plan(&checkout, None).unwrap();
        validate_checkout(&ctx, &checkout, &tender.gift_debits).await.unwrap();
        ctx.db().inventory().decrement_stock(SPRAY, 1).await.unwrap();

        let outcome = commit(&ctx, &mut flow, &checkout, tender).await.unwrap();

        assert_eq!(flow.state(), SettlementState::Settled);
        assert!(outcome.has_warning(OutboxKind::InventoryDecrement));
        assert_eq!(ctx.db().inventory().get_stock(SPRAY).await.unwrap(), Some(1));
        assert_eq!(ctx.db().outbox().count_pending().await.unwrap(), 1);
    }

    #[test]
    fn test_single_card() {
        let one = vec![
            SplitPayment::cash(Money::from_cents(100)),
            SplitPayment::gift_card("a", Money::from_cents(100)),
        ];
        assert_eq!(single_card(&one), Some("a".to_string()));

        let two = vec![
            SplitPayment::gift_card("a", Money::from_cents(100)),
            SplitPayment::gift_card("b", Money::from_cents(100)),
        ];
        assert_eq!(single_card(&two), None);
        assert_eq!(single_card(&[]), None);
    }
}
