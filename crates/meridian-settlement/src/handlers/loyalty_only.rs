//! Fast path: points and discounts cover the whole purchase.
//!
//! No tender, no gateway, no shift requirement. The transaction records
//! `loyalty_points` with a zero total and the redeem entry is posted
//! against it.

use meridian_core::{CoreError, PaymentMethod, SettlementFlow};

use super::{commit, fail_on_error, recheck_balances, start, validate_checkout, Tender};
use crate::checkout::Checkout;
use crate::context::SettlementContext;
use crate::error::SettlementResult;
use crate::outcome::SettlementOutcome;

pub(crate) async fn settle(
    ctx: &SettlementContext,
    checkout: &Checkout,
) -> SettlementResult<SettlementOutcome> {
    let mut flow = SettlementFlow::new();
    start(&mut flow, PaymentMethod::LoyaltyPoints)?;

    if !checkout.quote.is_zero_dollar() {
        fail_on_error::<()>(
            &mut flow,
            Err(CoreError::InvalidPaymentAmount {
                reason: format!("{} is still owed", checkout.quote.charge_amount()),
            }
            .into()),
        )?;
    }

    fail_on_error(&mut flow, validate_checkout(ctx, checkout, &[]).await)?;
    fail_on_error(&mut flow, recheck_balances(ctx, checkout, &[]).await)?;

    commit(ctx, &mut flow, checkout, Tender::new(PaymentMethod::LoyaltyPoints)).await
}
