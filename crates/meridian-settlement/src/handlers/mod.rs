//! # Settlement Handlers
//!
//! One handler per tender, all funnelling into the same write sequence.
//!
//! ## Write Sequence
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Validating                                                             │
//! │    idempotency key unused ─► stock covers cart ─► gift legs redeemable  │
//! │    (any failure: Failed, nothing written)                               │
//! │                                                                         │
//! │  recheck_balances()          gift ledger, loyalty ledger                │
//! │    (shortfall: ConcurrencyError, nothing written)                       │
//! │                                                                         │
//! │  Writing                                                                │
//! │    1. transaction row        fatal; UNIQUE key ─► DuplicateSubmission   │
//! │    2. items                  queued on failure                          │
//! │    3. inventory decrements   queued on failure, never re-incremented    │
//! │    4. split rows             queued on failure                          │
//! │    5. gift card debits       queued on failure (operator replay)        │
//! │    6. loyalty redeem / earn  redeem fatal, earn queued                  │
//! │    7. receipt stub           queued on failure                          │
//! │                                                                         │
//! │  Settled                                                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod card;
pub mod cash;
pub mod gift_card;
pub mod loyalty_only;
pub mod reader;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use meridian_core::loyalty::{points_to_earn, Redemption};
use meridian_core::{
    GiftCardLedgerEntry, Money, PaymentMethod, PaymentSplitRecord, SettlementFlow, SettlementState,
    SplitPayment, Transaction, TransactionItem, TransactionStatus,
};
use meridian_db::repository::transaction::generate_id;

use crate::checkout::Checkout;
use crate::context::SettlementContext;
use crate::error::{SettlementError, SettlementResult};
use crate::outbox::{queue_follow_up, FollowUp};
use crate::outcome::{PartialWrite, SettlementOutcome};
use crate::ports::CardDetails;

// =============================================================================
// Flow Helpers
// =============================================================================

/// Idle → MethodSelected → Validating.
pub(crate) fn start(flow: &mut SettlementFlow, method: PaymentMethod) -> SettlementResult<()> {
    flow.advance(SettlementState::MethodSelected)?;
    flow.advance(SettlementState::Validating)?;
    info!(method = %method, "Checkout validating");
    Ok(())
}

/// Marks the flow failed when `result` is an error.
pub(crate) fn fail_on_error<T>(
    flow: &mut SettlementFlow,
    result: SettlementResult<T>,
) -> SettlementResult<T> {
    if let Err(e) = &result {
        let from = flow.state();
        if flow.fail() {
            warn!(from = %from, code = ?e.code(), error = %e, "Checkout failed");
        }
    }
    result
}

// =============================================================================
// Gift Card Debits
// =============================================================================

/// Amount to take off one card. Legs on the same card are merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GiftDebit {
    pub card_id: String,
    pub amount: Money,
}

impl GiftDebit {
    /// Ledger key for this debit; stable across resubmissions of a checkout.
    pub fn idempotency_key(&self, checkout_key: &str) -> String {
        format!("{}:gift:{}", checkout_key, self.card_id)
    }
}

pub(crate) fn gift_debits(legs: &[SplitPayment]) -> Vec<GiftDebit> {
    let mut per_card: BTreeMap<&str, Money> = BTreeMap::new();
    for leg in legs.iter().filter(|l| l.method == PaymentMethod::GiftCard) {
        if let Some(card_id) = leg.gift_card_id.as_deref() {
            *per_card.entry(card_id).or_default() += leg.amount;
        }
    }
    per_card
        .into_iter()
        .filter(|(_, amount)| amount.is_positive())
        .map(|(card_id, amount)| GiftDebit {
            card_id: card_id.to_string(),
            amount,
        })
        .collect()
}

// =============================================================================
// Validation
// =============================================================================

/// Validation-time checks. Reads only.
pub(crate) async fn validate_checkout(
    ctx: &SettlementContext,
    checkout: &Checkout,
    debits: &[GiftDebit],
) -> SettlementResult<()> {
    let key = checkout.idempotency_key();
    if let Some(existing) = ctx.db().transactions().find_by_idempotency_key(key).await? {
        warn!(key = %key, transaction_id = %existing.id, "Rejecting resubmitted checkout");
        return Err(SettlementError::DuplicateSubmission { key: key.to_string() });
    }

    ctx.inventory()
        .validate_availability(&checkout.request.items)
        .await?;

    for debit in debits {
        ctx.gift_cards()
            .check_redeemable(&debit.card_id, debit.amount)
            .await?;
    }

    Ok(())
}

/// Re-reads the ledgers right before the first write.
pub(crate) async fn recheck_balances(
    ctx: &SettlementContext,
    checkout: &Checkout,
    debits: &[GiftDebit],
) -> SettlementResult<()> {
    for debit in debits {
        ctx.gift_cards().recheck(&debit.card_id, debit.amount).await?;
    }

    if let (Some(customer_id), Some(redemption)) = (checkout.customer_id(), checkout.quote.redemption) {
        if !redemption.is_noop() {
            ctx.loyalty().recheck(customer_id, &redemption).await?;
        }
    }

    Ok(())
}

// =============================================================================
// Commit
// =============================================================================

/// How a checkout was paid.
#[derive(Debug, Clone)]
pub(crate) struct Tender {
    pub method: PaymentMethod,
    /// Persisted as split rows when there is more than one leg.
    pub legs: Vec<SplitPayment>,
    pub gift_debits: Vec<GiftDebit>,
    pub gift_card_id: Option<String>,
    pub gateway_payment_id: Option<String>,
    pub card: Option<CardDetails>,
    pub change_due: Option<Money>,
}

impl Tender {
    pub fn new(method: PaymentMethod) -> Self {
        Tender {
            method,
            legs: Vec::new(),
            gift_debits: Vec::new(),
            gift_card_id: None,
            gateway_payment_id: None,
            card: None,
            change_due: None,
        }
    }

    fn is_split(&self) -> bool {
        self.legs.len() > 1
    }
}

fn build_transaction(checkout: &Checkout, tender: &Tender, now: DateTime<Utc>) -> Transaction {
    let totals = &checkout.quote.totals;
    let request = &checkout.request;

    Transaction {
        id: generate_id(),
        idempotency_key: request.idempotency_key.clone(),
        payment_method: tender.method,
        status: TransactionStatus::Completed,
        total_cents: totals.charge_amount().cents(),
        subtotal_cents: totals.subtotal_money().cents(),
        tax_cents: totals.tax_money().cents(),
        discount_cents: totals.discount_total().cents(),
        loyalty_discount_cents: checkout.quote.loyalty_discount().cents(),
        is_split_payment: tender.is_split(),
        shift_id: request.shift.as_ref().map(|s| s.id.clone()),
        customer_id: request.customer_id.clone(),
        gift_card_id: tender.gift_card_id.clone(),
        gateway_payment_id: tender.gateway_payment_id.clone(),
        card_last4: tender.card.as_ref().map(|c| c.last4.clone()),
        card_brand: tender.card.as_ref().map(|c| c.brand.clone()),
        refunded_cents: 0,
        created_at: now,
    }
}

/// Runs the write sequence. The flow must be in `Validating`.
///
/// Only the transaction row and a loyalty redemption are fatal; every other
/// failure becomes a [`PartialWrite`] on the outcome.
pub(crate) async fn commit(
    ctx: &SettlementContext,
    flow: &mut SettlementFlow,
    checkout: &Checkout,
    tender: Tender,
) -> SettlementResult<SettlementOutcome> {
    flow.advance(SettlementState::Writing)?;

    let now = Utc::now();
    let transaction = build_transaction(checkout, &tender, now);
    let tx_id = transaction.id.clone();

    if let Err(e) = ctx.db().transactions().insert(&transaction).await {
        flow.fail();
        if e.is_unique_violation() {
            warn!(key = %transaction.idempotency_key, "Checkout settled by another submission");
            return Err(SettlementError::DuplicateSubmission {
                key: transaction.idempotency_key.clone(),
            });
        }
        error!(error = %e, "Transaction insert failed; nothing written");
        return Err(e.into());
    }

    info!(
        transaction_id = %tx_id,
        method = %transaction.payment_method,
        total = %transaction.total(),
        "Transaction recorded"
    );

    let mut warnings: Vec<PartialWrite> = Vec::new();

    // Items
    for item in &checkout.request.items {
        let record = TransactionItem::from_cart_item(generate_id(), &tx_id, item, now);
        if let Err(e) = ctx.db().transactions().insert_item(&record).await {
            let follow_up = FollowUp::ItemInsert { item: record };
            warnings.push(queue_follow_up(ctx, &tx_id, follow_up, &e.into()).await);
        }
    }

    // Inventory
    for item in checkout.request.items.iter().filter(|i| i.is_inventory()) {
        let cause = match ctx.inventory().decrement(&item.id, item.quantity).await {
            Ok(true) => continue,
            Ok(false) => SettlementError::concurrency(
                "inventory",
                format!("{} sold out before the decrement of {}", item.id, item.quantity),
            ),
            Err(e) => e,
        };
        let follow_up = FollowUp::InventoryDecrement {
            item_id: item.id.clone(),
            quantity: item.quantity,
        };
        warnings.push(queue_follow_up(ctx, &tx_id, follow_up, &cause).await);
    }

    // Split rows
    if tender.is_split() {
        for leg in &tender.legs {
            let split = PaymentSplitRecord {
                id: generate_id(),
                transaction_id: tx_id.clone(),
                method: leg.method,
                amount_cents: leg.amount.cents(),
                gift_card_id: leg.gift_card_id.clone(),
                created_at: now,
            };
            if let Err(e) = ctx.db().transactions().insert_split(&split).await {
                let follow_up = FollowUp::SplitInsert { split };
                warnings.push(queue_follow_up(ctx, &tx_id, follow_up, &e.into()).await);
            }
        }
    }

    // Gift cards
    let mut gift_card_entries: Vec<GiftCardLedgerEntry> = Vec::new();
    for debit in &tender.gift_debits {
        let key = debit.idempotency_key(checkout.idempotency_key());
        match ctx
            .gift_cards()
            .redeem(&debit.card_id, debit.amount, Some(&tx_id), Some(&key))
            .await
        {
            Ok(entry) => {
                gift_card_entries.push(entry);
                if let Err(e) = ctx.gift_cards().refresh_cache(&debit.card_id).await {
                    let follow_up = FollowUp::GiftCardCacheRefresh {
                        gift_card_id: debit.card_id.clone(),
                    };
                    warnings.push(queue_follow_up(ctx, &tx_id, follow_up, &e).await);
                }
            }
            Err(e) => {
                let follow_up = FollowUp::GiftCardDebit {
                    gift_card_id: debit.card_id.clone(),
                    amount: debit.amount,
                    idempotency_key: key,
                };
                warnings.push(queue_follow_up(ctx, &tx_id, follow_up, &e).await);
            }
        }
    }

    // Loyalty
    let mut redemption: Option<Redemption> = None;
    let mut points_earned = 0;
    if let (Some(customer_id), Some(program)) = (checkout.customer_id(), checkout.quote.program()) {
        if checkout.quote.is_redeeming() {
            match ctx
                .loyalty()
                .redeem(customer_id, &tx_id, checkout.quote.loyalty_discount(), program)
                .await
            {
                Ok(r) => redemption = Some(r),
                Err(e) => {
                    flow.fail();
                    error!(
                        transaction_id = %tx_id,
                        customer_id = %customer_id,
                        error = %e,
                        "Loyalty redemption failed after the transaction was recorded"
                    );
                    // the row exists, so a resubmission can only be a duplicate
                    return Err(match e {
                        SettlementError::RedemptionFailed { .. } => e,
                        other => SettlementError::RedemptionFailed {
                            transaction_id: tx_id.clone(),
                            reason: other.to_string(),
                        },
                    });
                }
            }
        } else {
            let final_total = checkout.quote.totals.final_total;
            match ctx.loyalty().earn(customer_id, &tx_id, final_total, program).await {
                Ok(Some(entry)) => points_earned = entry.points_earned.unwrap_or_default(),
                Ok(None) => {}
                Err(e) => {
                    warn!(customer_id = %customer_id, error = %e, "Loyalty earn failed; sale stands");
                    let follow_up = FollowUp::LoyaltyEarn {
                        customer_id: customer_id.to_string(),
                        points: points_to_earn(final_total, program.points_per_dollar),
                    };
                    warnings.push(queue_follow_up(ctx, &tx_id, follow_up, &e).await);
                }
            }
        }

        if let Err(e) = ctx.loyalty().refresh_cache(customer_id).await {
            let follow_up = FollowUp::LoyaltyCacheRefresh {
                customer_id: customer_id.to_string(),
            };
            warnings.push(queue_follow_up(ctx, &tx_id, follow_up, &e).await);
        }
    }

    // Receipt
    let register_id = &ctx.config().register.id;
    let receipt = match ctx.db().receipts().create(&tx_id, register_id).await {
        Ok(receipt) => Some(receipt),
        Err(e) => {
            let follow_up = FollowUp::Receipt {
                register_id: register_id.clone(),
            };
            warnings.push(queue_follow_up(ctx, &tx_id, follow_up, &e.into()).await);
            None
        }
    };

    flow.advance(SettlementState::Settled)?;

    info!(
        transaction_id = %tx_id,
        method = %transaction.payment_method,
        total = %transaction.total(),
        warnings = warnings.len(),
        "Checkout settled"
    );

    Ok(SettlementOutcome {
        transaction,
        receipt,
        change_due: tender.change_due,
        redemption,
        points_earned,
        gift_card_entries,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::{prepare as prepare_checkout, CheckoutRequest};
    use crate::test_support::{seeded_context, shift, CUSTOMER};
    use meridian_core::{CartItem, OutboxKind};

    /// Makes the loyalty ledger refuse inserts of one entry type.
    async fn refuse_loyalty_entries(ctx: &SettlementContext, entry_type: &str) {
        let sql = format!(
            "CREATE TRIGGER refuse_{entry_type} BEFORE INSERT ON loyalty_ledger \
             WHEN NEW.entry_type = '{entry_type}' \
             BEGIN SELECT RAISE(ABORT, 'loyalty ledger locked'); END"
        );
        sqlx::query(&sql).execute(ctx.db().pool()).await.unwrap();
    }

    async fn commit_cash(
        ctx: &SettlementContext,
        request: CheckoutRequest,
    ) -> (SettlementFlow, SettlementResult<SettlementOutcome>) {
        let checkout = prepare_checkout(ctx, request).await.unwrap();
        let mut flow = SettlementFlow::new();
        start(&mut flow, PaymentMethod::Cash).unwrap();
        let result = commit(ctx, &mut flow, &checkout, Tender::new(PaymentMethod::Cash)).await;
        (flow, result)
    }

    #[test]
    fn test_gift_debits_merge_per_card() {
        let legs = vec![
            SplitPayment::gift_card("card-b", Money::from_cents(500)),
            SplitPayment::cash(Money::from_cents(1000)),
            SplitPayment::gift_card("card-a", Money::from_cents(700)),
            SplitPayment::gift_card("card-b", Money::from_cents(250)),
        ];

        let debits = gift_debits(&legs);
        assert_eq!(
            debits,
            vec![
                GiftDebit {
                    card_id: "card-a".into(),
                    amount: Money::from_cents(700),
                },
                GiftDebit {
                    card_id: "card-b".into(),
                    amount: Money::from_cents(750),
                },
            ]
        );
        assert_eq!(debits[1].idempotency_key("chk-9"), "chk-9:gift:card-b");
    }

    #[test]
    fn test_fail_on_error_marks_flow() {
        let mut flow = SettlementFlow::new();
        start(&mut flow, PaymentMethod::Cash).unwrap();

        let result: SettlementResult<()> = Err(SettlementError::Internal("boom".into()));
        assert!(fail_on_error(&mut flow, result).is_err());
        assert_eq!(flow.state(), SettlementState::Failed);
    }

    #[tokio::test]
    async fn test_redemption_failure_after_row_fails_checkout() {
        let ctx = seeded_context().await;
        refuse_loyalty_entries(&ctx, "redeem").await;

        let request = CheckoutRequest::new("chk-redeem", vec![CartItem::service("svc-cut", Money::from_cents(4000), 1)])
            .with_customer(CUSTOMER, true)
            .with_shift(shift());
        let (flow, result) = commit_cash(&ctx, request).await;

        let err = result.unwrap_err();
        assert!(matches!(err, SettlementError::RedemptionFailed { .. }));
        assert!(!err.is_retryable());
        assert_eq!(flow.state(), SettlementState::Failed);
        // the row stays; points are untouched
        assert_eq!(ctx.db().transactions().count().await.unwrap(), 1);
        assert_eq!(ctx.db().loyalty().ledger_balance(CUSTOMER).await.unwrap(), 500);
    }

    #[tokio::test]
    async fn test_earn_failure_is_queued_and_sale_settles() {
        let ctx = seeded_context().await;
        refuse_loyalty_entries(&ctx, "earn").await;

        let request = CheckoutRequest::new("chk-earn", vec![CartItem::service("svc-cut", Money::from_cents(4000), 1)])
            .with_customer(CUSTOMER, false)
            .with_shift(shift());
        let (flow, result) = commit_cash(&ctx, request).await;

        let outcome = result.unwrap();
        assert_eq!(flow.state(), SettlementState::Settled);
        assert_eq!(outcome.points_earned, 0);
        assert!(outcome.has_warning(OutboxKind::LoyaltyEarn));
        assert!(outcome.receipt.is_some());

        let queued = ctx.db().outbox().for_transaction(outcome.transaction_id()).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].kind, OutboxKind::LoyaltyEarn);
        assert!(queued[0].payload.contains(r#""points":40"#));
        assert_eq!(ctx.db().loyalty().ledger_balance(CUSTOMER).await.unwrap(), 500);
    }
}
