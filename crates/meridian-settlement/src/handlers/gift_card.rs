//! Gift card as the primary tender.
//!
//! Without split legs the card pays the whole charge and no split rows are
//! written. With legs, one of them must be this card; the rest may be cash
//! or other gift cards.

use meridian_core::split::validate_split;
use meridian_core::{CoreError, PaymentMethod, SettlementFlow};

use super::cash::single_card;
use super::{
    commit, fail_on_error, gift_debits, recheck_balances, start, validate_checkout, GiftDebit, Tender,
};
use crate::checkout::Checkout;
use crate::context::SettlementContext;
use crate::error::SettlementResult;
use crate::outcome::SettlementOutcome;

pub(crate) async fn settle(
    ctx: &SettlementContext,
    checkout: &Checkout,
    card_id: &str,
) -> SettlementResult<SettlementOutcome> {
    let mut flow = SettlementFlow::new();
    start(&mut flow, PaymentMethod::GiftCard)?;

    let tender = fail_on_error(&mut flow, plan(checkout, card_id))?;
    fail_on_error(&mut flow, validate_checkout(ctx, checkout, &tender.gift_debits).await)?;
    fail_on_error(&mut flow, recheck_balances(ctx, checkout, &tender.gift_debits).await)?;

    commit(ctx, &mut flow, checkout, tender).await
}

fn plan(checkout: &Checkout, card_id: &str) -> SettlementResult<Tender> {
    if checkout.request.shift.is_none() {
        return Err(CoreError::NoActiveShift.into());
    }

    let total = checkout.quote.charge_amount();
    let legs = &checkout.request.split_payments;
    let mut tender = Tender::new(PaymentMethod::GiftCard);

    if legs.is_empty() {
        tender.gift_card_id = Some(card_id.to_string());
        tender.gift_debits = vec![GiftDebit {
            card_id: card_id.to_string(),
            amount: total,
        }];
        return Ok(tender);
    }

    if let Some(leg) = legs
        .iter()
        .find(|l| !matches!(l.method, PaymentMethod::Cash | PaymentMethod::GiftCard))
    {
        return Err(CoreError::InvalidPaymentAmount {
            reason: format!("{} cannot be combined with a gift card at the counter", leg.method),
        }
        .into());
    }
    if !legs.iter().any(|l| l.gift_card_id.as_deref() == Some(card_id)) {
        return Err(CoreError::InvalidPaymentAmount {
            reason: format!("no split leg is paid with gift card {}", card_id),
        }
        .into());
    }
    validate_split(legs, total)?;

    tender.gift_card_id = single_card(legs).or_else(|| Some(card_id.to_string()));
    tender.legs = legs.clone();
    tender.gift_debits = gift_debits(legs);
    Ok(tender)
}
