//! # Hosted Card Settlement
//!
//! Two calls with an out-of-band confirmation in between.
//!
//! ```text
//! begin()                                   finalize()
//!   quote + split remainder                   re-validate stock, idempotency
//!   validate (no writes)                      recheck gift / loyalty ledgers
//!   amount_to_charge ≤ 1¢ ? free : intent     write sequence (Writing)
//!        │                                         ▲
//!        ▼                                         │
//!   PendingCheckout ──── hosted form, customer pays ┘
//! ```
//!
//! Nothing is written before `finalize()`. Dropping the pending checkout
//! leaves no trace. `finalize()` borrows the pending checkout, so a
//! retryable failure can be retried against the same payment; a payment
//! that can never be written is queued as an unsettled payment.

use chrono::Utc;
use tracing::{debug, error, info};

use meridian_core::split::{portion_for, split_total, validate_split};
use meridian_core::{
    CoreError, Money, PaymentMethod, PendingTransaction, SettlementFlow, SplitPayment,
    ValidationError,
};
use meridian_db::repository::transaction::generate_id;

use super::cash::single_card;
use super::{commit, fail_on_error, gift_debits, recheck_balances, start, validate_checkout, Tender};
use crate::checkout::Checkout;
use crate::context::SettlementContext;
use crate::error::{SettlementError, SettlementResult};
use crate::outbox::{queue_follow_up, FollowUp};
use crate::outcome::SettlementOutcome;
use crate::ports::{with_timeout, CardDetails, IntentMetadata, PaymentGateway};

/// A card checkout that passed validation and awaits payment.
#[derive(Debug)]
pub struct PendingCheckout {
    pub pending: PendingTransaction,
    pub method: PaymentMethod,
    pub client_secret: Option<String>,
    pub payment_intent_id: Option<String>,
    /// Gateway payment id from the last confirmation that failed to settle.
    pub(crate) confirmed_payment_id: Option<String>,
    pub(crate) checkout: Checkout,
    pub(crate) flow: SettlementFlow,
}

impl PendingCheckout {
    pub fn id(&self) -> &str {
        &self.pending.id
    }

    pub fn is_free(&self) -> bool {
        self.pending.is_free
    }

    pub fn amount_to_charge(&self) -> Money {
        self.pending.amount_to_charge
    }

    /// Payment id a confirmation settles against: the one passed in, else
    /// the intent's.
    pub(crate) fn payment_id_for(&self, gateway_payment_id: Option<&str>) -> Option<String> {
        gateway_payment_id
            .map(str::to_string)
            .or_else(|| self.payment_intent_id.clone())
    }

    /// Drops the checkout before any write.
    pub(crate) fn abandon(mut self) -> SettlementResult<()> {
        self.flow.abandon()?;
        info!(pending_id = %self.pending.id, "Card checkout abandoned");
        Ok(())
    }
}

/// Validates a card checkout and sizes the card charge. Writes nothing.
pub(crate) async fn prepare(
    ctx: &SettlementContext,
    checkout: Checkout,
    method: PaymentMethod,
) -> SettlementResult<PendingCheckout> {
    let mut flow = SettlementFlow::new();
    start(&mut flow, method)?;

    let (legs, amount_to_charge) = fail_on_error(&mut flow, card_legs(ctx, &checkout, method))?;
    let debits = gift_debits(&legs);
    fail_on_error(&mut flow, validate_checkout(ctx, &checkout, &debits).await)?;

    let is_free = amount_to_charge <= ctx.config().ledger.free_charge_threshold();
    let quote = &checkout.quote;
    let request = &checkout.request;

    let pending = PendingTransaction {
        id: generate_id(),
        idempotency_key: request.idempotency_key.clone(),
        amount: quote.charge_amount(),
        amount_to_charge,
        customer_id: request.customer_id.clone(),
        use_points: request.use_points,
        items: request.items.clone(),
        discount: request.discount.clone(),
        subtotal: quote.totals.subtotal,
        tax_amount: quote.totals.tax_amount,
        tax_rate: quote.tax_rate,
        loyalty_discount: quote.loyalty_discount(),
        shift_id: request.shift.as_ref().map(|s| s.id.clone()),
        loyalty_program_id: quote.program().map(|p| p.id.clone()),
        split_payments: legs,
        is_free,
        created_at: Utc::now(),
    };

    debug!(
        pending_id = %pending.id,
        amount = %pending.amount,
        to_charge = %amount_to_charge,
        free = is_free,
        "Card checkout prepared"
    );

    Ok(PendingCheckout {
        pending,
        method,
        client_secret: None,
        payment_intent_id: None,
        confirmed_payment_id: None,
        checkout,
        flow,
    })
}

/// Split legs with the card remainder appended, and what the card covers.
fn card_legs(
    ctx: &SettlementContext,
    checkout: &Checkout,
    method: PaymentMethod,
) -> SettlementResult<(Vec<SplitPayment>, Money)> {
    let total = checkout.quote.charge_amount();
    let mut legs = checkout.request.split_payments.clone();

    if let Some(leg) = legs.iter().find(|l| l.method == PaymentMethod::LoyaltyPoints) {
        return Err(CoreError::InvalidPaymentAmount {
            reason: format!("{} cannot be a split leg", leg.method),
        }
        .into());
    }
    if portion_for(&legs, PaymentMethod::Cash).is_positive() && checkout.request.shift.is_none() {
        return Err(CoreError::NoActiveShift.into());
    }

    let prepaid: Money = legs
        .iter()
        .filter(|l| !l.method.is_card())
        .map(|l| l.amount)
        .sum();
    let amount_to_charge = total.saturating_sub(prepaid);

    if legs.is_empty() {
        return Ok((legs, amount_to_charge));
    }

    let has_card_leg = legs.iter().any(|l| l.method.is_card());
    let waived = amount_to_charge <= ctx.config().ledger.free_charge_threshold();
    if !has_card_leg && !waived {
        legs.push(SplitPayment {
            method,
            amount: amount_to_charge,
            gift_card_id: None,
        });
    }

    validate_split(&legs, total)?;
    let charge = split_total(&legs).saturating_sub(prepaid);
    Ok((legs, charge))
}

/// Validates, then asks the gateway for a payment intent.
///
/// Free checkouts skip the gateway; settle them with [`finalize`] right away.
pub(crate) async fn begin(
    ctx: &SettlementContext,
    gateway: &dyn PaymentGateway,
    checkout: Checkout,
) -> SettlementResult<PendingCheckout> {
    let mut pending = prepare(ctx, checkout, PaymentMethod::Card).await?;
    if pending.is_free() {
        return Ok(pending);
    }

    let metadata = IntentMetadata {
        pending_id: pending.pending.id.clone(),
        idempotency_key: pending.pending.idempotency_key.clone(),
        customer_id: pending.pending.customer_id.clone(),
        shift_id: pending.pending.shift_id.clone(),
    };

    let requested: SettlementResult<_> = with_timeout(
        ctx.config().gateway.request_timeout(),
        gateway.create_payment_intent(pending.pending.amount_to_charge, &metadata),
    )
    .await
    .map_err(Into::into);
    let intent = fail_on_error(&mut pending.flow, requested)?;

    info!(
        pending_id = %pending.pending.id,
        intent_id = %intent.id,
        amount = %pending.pending.amount_to_charge,
        "Payment intent created"
    );

    pending.payment_intent_id = Some(intent.id);
    pending.client_secret = Some(intent.client_secret);
    Ok(pending)
}

/// Writes a confirmed card checkout.
///
/// `gateway_payment_id` falls back to the payment intent id. A paid
/// checkout with neither is rejected. Each attempt runs its own flow, so
/// the pending checkout stays usable after a failure.
pub(crate) async fn finalize(
    ctx: &SettlementContext,
    pending: &PendingCheckout,
    gateway_payment_id: Option<String>,
    card: Option<CardDetails>,
) -> SettlementResult<SettlementOutcome> {
    let mut flow = SettlementFlow::new();
    start(&mut flow, pending.method)?;

    let gateway_payment_id = gateway_payment_id.or_else(|| pending.payment_intent_id.clone());
    if !pending.is_free() && gateway_payment_id.is_none() {
        return fail_on_error(
            &mut flow,
            Err(CoreError::from(ValidationError::Required {
                field: "gateway_payment_id".to_string(),
            })
            .into()),
        );
    }

    // the customer may already be charged: gift shortfalls surface from the
    // recheck as concurrency errors, not as validation failures
    let checkout = &pending.checkout;
    let legs = pending.pending.split_payments.clone();
    let debits = gift_debits(&legs);
    fail_on_error(&mut flow, validate_checkout(ctx, checkout, &[]).await)?;
    fail_on_error(&mut flow, recheck_balances(ctx, checkout, &debits).await)?;

    let mut tender = Tender::new(pending.method);
    tender.gift_card_id = single_card(&legs);
    tender.legs = legs;
    tender.gift_debits = debits;
    tender.gateway_payment_id = gateway_payment_id;
    tender.card = card;

    commit(ctx, &mut flow, checkout, tender).await
}

/// Queues a captured payment that could not be written, for an operator
/// to refund or settle. The entry is keyed by the pending checkout id.
pub(crate) async fn record_unsettled(
    ctx: &SettlementContext,
    pending: &PendingCheckout,
    gateway_payment_id: &str,
    cause: &SettlementError,
) -> Option<String> {
    error!(
        pending_id = %pending.id(),
        gateway_payment_id = %gateway_payment_id,
        amount = %pending.amount_to_charge(),
        error = %cause,
        "Captured card payment left unsettled"
    );

    let follow_up = FollowUp::UnsettledPayment {
        method: pending.method,
        gateway_payment_id: gateway_payment_id.to_string(),
        amount: pending.amount_to_charge(),
        idempotency_key: pending.pending.idempotency_key.clone(),
    };
    queue_follow_up(ctx, pending.id(), follow_up, cause).await.outbox_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::{prepare as prepare_checkout, CheckoutRequest};
    use crate::error::SettlementError;
    use crate::test_support::{gift_card_id, seeded_context, shift, MockGateway};
    use meridian_core::{CartItem, GiftCardEntryType, OutboxKind, SettlementState};

    async fn checkout(ctx: &SettlementContext, key: &str, cents: i64, splits: Vec<SplitPayment>) -> Checkout {
        prepare_checkout(
            ctx,
            CheckoutRequest::new(key, vec![CartItem::service("svc-cut", Money::from_cents(cents), 1)])
                .with_shift(shift())
                .with_splits(splits),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_remainder_after_gift_leg() {
        let ctx = seeded_context().await;
        let card = gift_card_id(&ctx).await;
        let gateway = MockGateway::new();

        let chk = checkout(&ctx, "chk-rem", 10000, vec![SplitPayment::gift_card(&card, Money::from_cents(6000))]).await;
        let pending = begin(&ctx, &gateway, chk).await.unwrap();

        assert_eq!(pending.amount_to_charge(), Money::from_cents(4000));
        assert_eq!(pending.pending.split_payments.len(), 2);
        assert_eq!(gateway.intents().await, vec![Money::from_cents(4000)]);
        assert!(pending.client_secret.is_some());
        assert_eq!(ctx.db().transactions().count().await.unwrap(), 0);

        let outcome = finalize(&ctx, &pending, Some("pi_paid".into()), None).await.unwrap();
        assert_eq!(outcome.transaction.gateway_payment_id.as_deref(), Some("pi_paid"));
        assert!(outcome.transaction.is_split_payment);
        assert_eq!(ctx.gift_cards().resolve_balance(&card).await.unwrap(), Money::from_cents(1500));
    }

    #[tokio::test]
    async fn test_free_when_prepaid_covers_charge() {
        let ctx = seeded_context().await;
        let card = gift_card_id(&ctx).await;
        let gateway = MockGateway::new();

        let chk = checkout(&ctx, "chk-free", 5000, vec![SplitPayment::gift_card(&card, Money::from_cents(5000))]).await;
        let pending = begin(&ctx, &gateway, chk).await.unwrap();

        assert!(pending.is_free());
        assert!(gateway.intents().await.is_empty());

        let outcome = finalize(&ctx, &pending, None, None).await.unwrap();
        assert!(outcome.transaction.gateway_payment_id.is_none());
        assert_eq!(outcome.transaction.payment_method, PaymentMethod::Card);
    }

    #[tokio::test]
    async fn test_gateway_failure_leaves_no_row() {
        let ctx = seeded_context().await;
        let gateway = MockGateway::failing();

        let chk = checkout(&ctx, "chk-down", 2500, vec![]).await;
        let err = begin(&ctx, &gateway, chk).await.unwrap_err();

        assert!(matches!(err, SettlementError::Gateway(_)));
        assert!(err.is_retryable());
        assert_eq!(ctx.db().transactions().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_card_drained_before_finalize() {
        let ctx = seeded_context().await;
        let card = gift_card_id(&ctx).await;
        let gateway = MockGateway::new();

        let chk = checkout(&ctx, "chk-drain", 10000, vec![SplitPayment::gift_card(&card, Money::from_cents(6000))]).await;
        let pending = begin(&ctx, &gateway, chk).await.unwrap();

        // another register spends the card while the customer pays
        ctx.gift_cards()
            .redeem(&card, Money::from_cents(7000), None, Some("elsewhere"))
            .await
            .unwrap();

        let err = finalize(&ctx, &pending, Some("pi_paid".into()), None).await.unwrap_err();
        assert!(matches!(err, SettlementError::Concurrency { .. }));
        assert!(err.is_retryable());
        assert_eq!(ctx.db().transactions().count().await.unwrap(), 0);

        // the card is topped up and the same payment settles
        ctx.db()
            .gift_cards()
            .append_credit(&card, GiftCardEntryType::Purchase, Money::from_cents(6000), None)
            .await
            .unwrap();
        let outcome = finalize(&ctx, &pending, Some("pi_paid".into()), None).await.unwrap();
        assert_eq!(outcome.transaction.gateway_payment_id.as_deref(), Some("pi_paid"));
        assert_eq!(ctx.gift_cards().resolve_balance(&card).await.unwrap(), Money::from_cents(500));
    }

    #[tokio::test]
    async fn test_unsettled_payment_is_queued_under_pending_id() {
        let ctx = seeded_context().await;
        let gateway = MockGateway::new();
        let chk = checkout(&ctx, "chk-lost", 2500, vec![]).await;
        let pending = begin(&ctx, &gateway, chk).await.unwrap();

        let cause = SettlementError::DuplicateSubmission { key: "chk-lost".into() };
        let outbox_id = record_unsettled(&ctx, &pending, "pi_paid", &cause).await;
        assert!(outbox_id.is_some());

        let queued = ctx.db().outbox().for_transaction(pending.id()).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].kind, OutboxKind::UnsettledPayment);
        assert!(queued[0].payload.contains("pi_paid"));
        assert!(queued[0].payload.contains("chk-lost"));
    }

    #[tokio::test]
    async fn test_card_legs_keep_explicit_card_leg() {
        let ctx = seeded_context().await;
        let chk = checkout(
            &ctx,
            "chk-legs",
            10000,
            vec![
                SplitPayment::cash(Money::from_cents(3000)),
                SplitPayment::card(Money::from_cents(7000)),
            ],
        )
        .await;

        let (legs, charge) = card_legs(&ctx, &chk, PaymentMethod::Card).unwrap();
        assert_eq!(legs.len(), 2);
        assert_eq!(charge, Money::from_cents(7000));
    }

    #[tokio::test]
    async fn test_paid_checkout_needs_payment_id() {
        let ctx = seeded_context().await;
        let chk = checkout(&ctx, "chk-noid", 2500, vec![]).await;
        let pending = prepare(&ctx, chk, PaymentMethod::Card).await.unwrap();

        let err = finalize(&ctx, &pending, None, None).await.unwrap_err();
        assert!(matches!(err, SettlementError::Core(CoreError::Validation(_))));
    }

    #[tokio::test]
    async fn test_abandon_before_writing() {
        let ctx = seeded_context().await;
        let chk = checkout(&ctx, "chk-abandon", 2500, vec![]).await;
        let pending = prepare(&ctx, chk, PaymentMethod::Card).await.unwrap();

        assert_eq!(pending.flow.state(), SettlementState::Validating);
        pending.abandon().unwrap();
        assert_eq!(ctx.db().transactions().count().await.unwrap(), 0);
    }
}
