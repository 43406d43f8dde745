//! # Settlement Outbox
//!
//! Follow-ups for checkouts whose transaction row landed but a later step
//! did not.
//!
//! ## Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Settlement Outbox Flow                               │
//! │                                                                         │
//! │  Handler (Writing)                                                      │
//! │    step fails ──► queue_follow_up() ──► settlement_outbox row           │
//! │                        │                  kind + JSON FollowUp          │
//! │                        ▼                                                │
//! │                  PartialWrite warning on the outcome                    │
//! │                                                                         │
//! │  OutboxReplayer                                                         │
//! │    1. Poll: pending(batch_size, max_attempts), oldest first             │
//! │       operator-only kinds are never polled (see awaiting_operator)      │
//! │    2. Apply: each step is idempotent, a UNIQUE hit counts as done       │
//! │    3. Mark: resolved_at = NOW()  or  attempts += 1, last_error          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Failed inventory decrements are retried forward here. Nothing is ever
//! re-incremented to undo a sale.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use meridian_core::{Money, OutboxEntry, OutboxKind, PaymentMethod, PaymentSplitRecord, TransactionItem};
use meridian_db::DbError;

use crate::context::SettlementContext;
use crate::error::{SettlementError, SettlementResult};
use crate::outcome::PartialWrite;

// =============================================================================
// Follow-up Payloads
// =============================================================================

/// Everything needed to re-run one post-commit step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum FollowUp {
    ItemInsert {
        item: TransactionItem,
    },
    SplitInsert {
        split: PaymentSplitRecord,
    },
    InventoryDecrement {
        item_id: String,
        quantity: i64,
    },
    GiftCardDebit {
        gift_card_id: String,
        amount: Money,
        idempotency_key: String,
    },
    GiftCardCacheRefresh {
        gift_card_id: String,
    },
    LoyaltyEarn {
        customer_id: String,
        points: i64,
    },
    LoyaltyCacheRefresh {
        customer_id: String,
    },
    Receipt {
        register_id: String,
    },
    /// Card payment captured at the gateway with no transaction written.
    /// Queued under the pending checkout id; refund or settle by hand.
    UnsettledPayment {
        method: PaymentMethod,
        gateway_payment_id: String,
        amount: Money,
        idempotency_key: String,
    },
}

impl FollowUp {
    pub fn kind(&self) -> OutboxKind {
        match self {
            FollowUp::ItemInsert { .. } => OutboxKind::ItemInsert,
            FollowUp::SplitInsert { .. } => OutboxKind::SplitInsert,
            FollowUp::InventoryDecrement { .. } => OutboxKind::InventoryDecrement,
            FollowUp::GiftCardDebit { .. } => OutboxKind::GiftCardDebit,
            FollowUp::GiftCardCacheRefresh { .. } => OutboxKind::GiftCardCacheRefresh,
            FollowUp::LoyaltyEarn { .. } => OutboxKind::LoyaltyEarn,
            FollowUp::LoyaltyCacheRefresh { .. } => OutboxKind::LoyaltyCacheRefresh,
            FollowUp::Receipt { .. } => OutboxKind::Receipt,
            FollowUp::UnsettledPayment { .. } => OutboxKind::UnsettledPayment,
        }
    }

    pub fn to_payload(&self) -> SettlementResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_entry(entry: &OutboxEntry) -> SettlementResult<Self> {
        let follow_up: FollowUp = serde_json::from_str(&entry.payload)?;
        if follow_up.kind() != entry.kind {
            return Err(SettlementError::Serialization(format!(
                "outbox entry {} is {} but carries a {} payload",
                entry.id,
                entry.kind.as_str(),
                follow_up.kind().as_str()
            )));
        }
        Ok(follow_up)
    }
}

/// Logs a failed step, queues it, and returns the warning for the outcome.
///
/// Never fails: when the outbox write fails too, the warning carries no
/// outbox id and the error log is all that is left.
pub async fn queue_follow_up(
    ctx: &SettlementContext,
    transaction_id: &str,
    follow_up: FollowUp,
    cause: &SettlementError,
) -> PartialWrite {
    let step = follow_up.kind();
    let message = cause.to_string();

    error!(
        transaction_id = %transaction_id,
        step = step.as_str(),
        error = %message,
        "Post-commit step failed; queuing follow-up"
    );

    let queued = match follow_up.to_payload() {
        Ok(payload) => ctx
            .db()
            .outbox()
            .enqueue(transaction_id, step, &payload, &message)
            .await
            .map_err(SettlementError::from),
        Err(e) => Err(e),
    };

    let outbox_id = match queued {
        Ok(entry) => Some(entry.id),
        Err(e) => {
            error!(
                transaction_id = %transaction_id,
                step = step.as_str(),
                error = %e,
                "Could not queue follow-up; manual repair needed"
            );
            None
        }
    };

    PartialWrite {
        step,
        message,
        outbox_id,
    }
}

// =============================================================================
// Replayer
// =============================================================================

/// Counts from one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    pub attempted: usize,
    pub resolved: usize,
    pub failed: usize,
    /// Entries left for an operator.
    pub skipped: usize,
}

/// Handle for stopping a running replayer.
#[derive(Debug, Clone)]
pub struct OutboxReplayerHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl OutboxReplayerHandle {
    pub async fn shutdown(&self) -> SettlementResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SettlementError::Internal("Outbox replayer already stopped".into()))
    }
}

pub struct OutboxReplayer {
    ctx: SettlementContext,
    shutdown_rx: Option<mpsc::Receiver<()>>,
}

impl OutboxReplayer {
    pub fn new(ctx: SettlementContext) -> Self {
        OutboxReplayer {
            ctx,
            shutdown_rx: None,
        }
    }

    /// Builds a replayer for [`run`](Self::run) together with its stop handle.
    pub fn with_handle(ctx: SettlementContext) -> (Self, OutboxReplayerHandle) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let replayer = OutboxReplayer {
            ctx,
            shutdown_rx: Some(shutdown_rx),
        };
        (replayer, OutboxReplayerHandle { shutdown_tx })
    }

    /// Replays pending entries every `interval` until shut down.
    ///
    /// Meant to be spawned as a background task.
    pub async fn run(mut self, interval: Duration) {
        info!("Outbox replayer starting");

        let Some(mut shutdown_rx) = self.shutdown_rx.take() else {
            warn!("Outbox replayer has no shutdown handle; use with_handle()");
            return;
        };

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.replay_pending().await {
                        error!(error = %e, "Outbox replay pass failed");
                    }
                }

                _ = shutdown_rx.recv() => {
                    info!("Outbox replayer shutting down");
                    break;
                }
            }
        }

        info!("Outbox replayer stopped");
    }

    /// One pass over the pending entries.
    pub async fn replay_pending(&self) -> SettlementResult<ReplayReport> {
        let config = &self.ctx.config().outbox;
        let entries = self
            .ctx
            .db()
            .outbox()
            .pending(config.batch_size, config.max_attempts)
            .await?;

        let waiting = self.ctx.db().outbox().count_awaiting_operator().await?;
        let mut report = ReplayReport {
            skipped: usize::try_from(waiting).unwrap_or_default(),
            ..ReplayReport::default()
        };
        if entries.is_empty() {
            debug!(awaiting_operator = report.skipped, "No pending outbox entries");
            return Ok(report);
        }

        for entry in entries {
            report.attempted += 1;
            if self.replay_entry(&entry).await? {
                report.resolved += 1;
            } else {
                report.failed += 1;
            }
        }

        info!(
            attempted = report.attempted,
            resolved = report.resolved,
            failed = report.failed,
            skipped = report.skipped,
            "Outbox replay pass complete"
        );

        Ok(report)
    }

    /// Applies one entry and records the result. Returns true when resolved.
    ///
    /// Also the operator path for gift card debits, which the pass never
    /// polls. Unsettled payments cannot be applied here; once refunded at
    /// the gateway, resolve them with `OutboxRepository::mark_resolved`.
    pub async fn replay_entry(&self, entry: &OutboxEntry) -> SettlementResult<bool> {
        let outbox = self.ctx.db().outbox();

        let applied = match FollowUp::from_entry(entry) {
            Ok(follow_up) => self.apply(&entry.transaction_id, follow_up).await,
            Err(e) => Err(e),
        };

        match applied {
            Ok(()) => {
                outbox.mark_resolved(&entry.id).await?;
                debug!(id = %entry.id, kind = entry.kind.as_str(), "Outbox entry resolved");
                Ok(true)
            }
            Err(e) => {
                warn!(
                    id = %entry.id,
                    kind = entry.kind.as_str(),
                    attempts = entry.attempts + 1,
                    error = %e,
                    "Outbox entry still failing"
                );
                outbox.mark_failed(&entry.id, &e.to_string()).await?;
                Ok(false)
            }
        }
    }

    async fn apply(&self, transaction_id: &str, follow_up: FollowUp) -> SettlementResult<()> {
        let ctx = &self.ctx;
        match follow_up {
            FollowUp::ItemInsert { item } => {
                already_done_on_unique(ctx.db().transactions().insert_item(&item).await)
            }
            FollowUp::SplitInsert { split } => {
                already_done_on_unique(ctx.db().transactions().insert_split(&split).await)
            }
            FollowUp::InventoryDecrement { item_id, quantity } => {
                if ctx.inventory().decrement(&item_id, quantity).await? {
                    Ok(())
                } else {
                    Err(SettlementError::concurrency(
                        "inventory",
                        format!("{} has less than {} in stock", item_id, quantity),
                    ))
                }
            }
            FollowUp::GiftCardDebit {
                gift_card_id,
                amount,
                idempotency_key,
            } => {
                let ledger = ctx.db().gift_cards();
                if ledger.find_by_idempotency_key(&idempotency_key).await?.is_none() {
                    let posted = ctx
                        .gift_cards()
                        .redeem(&gift_card_id, amount, Some(transaction_id), Some(&idempotency_key))
                        .await;
                    match posted {
                        Ok(_) => {}
                        // only a hit on this debit's own key means it posted;
                        // a recency-window match is someone else's redeem
                        Err(SettlementError::DuplicateSubmission { .. }) => {
                            if ledger.find_by_idempotency_key(&idempotency_key).await?.is_none() {
                                return Err(SettlementError::concurrency(
                                    "gift_card",
                                    format!(
                                        "card {} had another {} redeem inside the duplicate window",
                                        gift_card_id, amount
                                    ),
                                ));
                            }
                        }
                        Err(e) => return Err(e),
                    }
                }
                ctx.gift_cards().refresh_cache(&gift_card_id).await?;
                Ok(())
            }
            FollowUp::GiftCardCacheRefresh { gift_card_id } => {
                ctx.gift_cards().refresh_cache(&gift_card_id).await.map(|_| ())
            }
            FollowUp::LoyaltyEarn { customer_id, points } => {
                ctx.loyalty().post_earn(&customer_id, transaction_id, points).await?;
                ctx.loyalty().refresh_cache(&customer_id).await.map(|_| ())
            }
            FollowUp::LoyaltyCacheRefresh { customer_id } => {
                ctx.loyalty().refresh_cache(&customer_id).await.map(|_| ())
            }
            FollowUp::Receipt { register_id } => ctx
                .db()
                .receipts()
                .create(transaction_id, &register_id)
                .await
                .map(|_| ())
                .map_err(SettlementError::from),
            FollowUp::UnsettledPayment { gateway_payment_id, .. } => Err(SettlementError::Internal(format!(
                "payment {} has no transaction; refund it at the gateway or settle it by hand",
                gateway_payment_id
            ))),
        }
    }
}

fn already_done_on_unique(result: Result<(), DbError>) -> SettlementResult<()> {
    match result {
        Err(e) if e.is_unique_violation() => Ok(()),
        other => other.map_err(SettlementError::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SettlementConfig;
    use crate::test_support::{gift_card_id, insert_transaction, seeded_context, seeded_context_with, CUSTOMER, SPRAY};

    async fn queue(ctx: &SettlementContext, follow_up: FollowUp) -> PartialWrite {
        let cause = SettlementError::Internal("store hiccup".into());
        queue_follow_up(ctx, "tx-1", follow_up, &cause).await
    }

    #[test]
    fn test_payload_is_tagged() {
        let follow_up = FollowUp::InventoryDecrement {
            item_id: "inv-1".into(),
            quantity: 2,
        };
        let json = follow_up.to_payload().unwrap();
        assert!(json.contains(r#""step":"inventory_decrement""#));
    }

    #[tokio::test]
    async fn test_queue_returns_warning_with_outbox_id() {
        let ctx = seeded_context().await;
        insert_transaction(ctx.db(), "tx-1").await;

        let warning = queue(
            &ctx,
            FollowUp::Receipt {
                register_id: "reg-01".into(),
            },
        )
        .await;

        assert_eq!(warning.step, OutboxKind::Receipt);
        assert!(warning.outbox_id.is_some());
        assert_eq!(ctx.db().outbox().count_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_replay_resolves_idempotent_steps() {
        let ctx = seeded_context().await;
        insert_transaction(ctx.db(), "tx-1").await;

        queue(&ctx, FollowUp::Receipt { register_id: "reg-01".into() }).await;
        queue(
            &ctx,
            FollowUp::InventoryDecrement {
                item_id: SPRAY.into(),
                quantity: 1,
            },
        )
        .await;
        queue(
            &ctx,
            FollowUp::LoyaltyEarn {
                customer_id: CUSTOMER.into(),
                points: 12,
            },
        )
        .await;

        let replayer = OutboxReplayer::new(ctx.clone());
        let report = replayer.replay_pending().await.unwrap();

        assert_eq!(report.attempted, 3);
        assert_eq!(report.resolved, 3);
        assert_eq!(ctx.db().outbox().count_pending().await.unwrap(), 0);
        assert!(ctx.db().receipts().find_by_transaction("tx-1").await.unwrap().is_some());
        assert_eq!(ctx.db().loyalty().ledger_balance(CUSTOMER).await.unwrap(), 512);

        // a second pass finds nothing and changes nothing
        let again = replayer.replay_pending().await.unwrap();
        assert_eq!(again, ReplayReport::default());
        assert_eq!(ctx.db().loyalty().ledger_balance(CUSTOMER).await.unwrap(), 512);
    }

    #[tokio::test]
    async fn test_gift_debit_left_for_operator() {
        let ctx = seeded_context().await;
        let card = gift_card_id(&ctx).await;
        insert_transaction(ctx.db(), "tx-1").await;

        queue(
            &ctx,
            FollowUp::GiftCardDebit {
                gift_card_id: card.clone(),
                amount: Money::from_cents(2000),
                idempotency_key: "chk-1:gift:card".into(),
            },
        )
        .await;

        let replayer = OutboxReplayer::new(ctx.clone());
        let report = replayer.replay_pending().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.attempted, 0);
        assert_eq!(
            ctx.gift_cards().resolve_balance(&card).await.unwrap(),
            Money::from_cents(7500)
        );

        // operator applies it explicitly
        let entry = ctx.db().outbox().for_transaction("tx-1").await.unwrap().remove(0);
        assert!(replayer.replay_entry(&entry).await.unwrap());
        assert_eq!(
            ctx.gift_cards().resolve_balance(&card).await.unwrap(),
            Money::from_cents(5500)
        );
    }

    #[tokio::test]
    async fn test_operator_entries_do_not_block_the_batch() {
        let mut config = SettlementConfig::default();
        config.outbox.batch_size = 1;
        let ctx = seeded_context_with(config).await;
        let card = gift_card_id(&ctx).await;
        insert_transaction(ctx.db(), "tx-1").await;

        queue(
            &ctx,
            FollowUp::GiftCardDebit {
                gift_card_id: card,
                amount: Money::from_cents(2000),
                idempotency_key: "chk-1:gift:card".into(),
            },
        )
        .await;
        queue(&ctx, FollowUp::Receipt { register_id: "reg-01".into() }).await;

        let report = OutboxReplayer::new(ctx.clone()).replay_pending().await.unwrap();

        assert_eq!(report.attempted, 1);
        assert_eq!(report.resolved, 1);
        assert_eq!(report.skipped, 1);
        assert!(ctx.db().receipts().find_by_transaction("tx-1").await.unwrap().is_some());
        assert_eq!(ctx.db().outbox().count_awaiting_operator().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_debit_replay_ignores_another_checkouts_redeem() {
        let mut config = SettlementConfig::default();
        config.ledger.duplicate_window_secs = 300;
        let ctx = seeded_context_with(config).await;
        let card = gift_card_id(&ctx).await;
        insert_transaction(ctx.db(), "tx-1").await;

        queue(
            &ctx,
            FollowUp::GiftCardDebit {
                gift_card_id: card.clone(),
                amount: Money::from_cents(2000),
                idempotency_key: "chk-1:gift:card".into(),
            },
        )
        .await;

        // a different checkout takes the same amount off the card
        ctx.gift_cards()
            .redeem(&card, Money::from_cents(2000), None, Some("chk-2:gift:card"))
            .await
            .unwrap();

        let replayer = OutboxReplayer::new(ctx.clone());
        let entry = ctx.db().outbox().for_transaction("tx-1").await.unwrap().remove(0);
        assert!(!replayer.replay_entry(&entry).await.unwrap());

        let entry = ctx.db().outbox().for_transaction("tx-1").await.unwrap().remove(0);
        assert!(entry.resolved_at.is_none());
        assert_eq!(entry.attempts, 1);
        assert_eq!(
            ctx.gift_cards().resolve_balance(&card).await.unwrap(),
            Money::from_cents(5500)
        );
    }

    #[tokio::test]
    async fn test_debit_replay_counts_its_own_key_as_posted() {
        let mut config = SettlementConfig::default();
        config.ledger.duplicate_window_secs = 300;
        let ctx = seeded_context_with(config).await;
        let card = gift_card_id(&ctx).await;
        insert_transaction(ctx.db(), "tx-1").await;

        queue(
            &ctx,
            FollowUp::GiftCardDebit {
                gift_card_id: card.clone(),
                amount: Money::from_cents(2000),
                idempotency_key: "chk-1:gift:card".into(),
            },
        )
        .await;
        ctx.gift_cards()
            .redeem(&card, Money::from_cents(2000), Some("tx-1"), Some("chk-1:gift:card"))
            .await
            .unwrap();

        let replayer = OutboxReplayer::new(ctx.clone());
        let entry = ctx.db().outbox().for_transaction("tx-1").await.unwrap().remove(0);
        assert!(replayer.replay_entry(&entry).await.unwrap());
        assert_eq!(
            ctx.gift_cards().resolve_balance(&card).await.unwrap(),
            Money::from_cents(5500)
        );
    }

    #[tokio::test]
    async fn test_unsettled_payment_is_never_applied() {
        let ctx = seeded_context().await;
        let cause = SettlementError::concurrency("gift_card", "card drained");
        let warning = queue_follow_up(
            &ctx,
            "pend-1",
            FollowUp::UnsettledPayment {
                method: PaymentMethod::Card,
                gateway_payment_id: "pi_paid".into(),
                amount: Money::from_cents(4000),
                idempotency_key: "chk-1".into(),
            },
            &cause,
        )
        .await;
        assert_eq!(warning.step, OutboxKind::UnsettledPayment);

        let replayer = OutboxReplayer::new(ctx.clone());
        let report = replayer.replay_pending().await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(report.skipped, 1);

        let entry = ctx.db().outbox().awaiting_operator(10).await.unwrap().remove(0);
        assert!(!replayer.replay_entry(&entry).await.unwrap());
        assert_eq!(ctx.db().outbox().count_awaiting_operator().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_decrement_without_stock_stays_pending() {
        let ctx = seeded_context().await;
        insert_transaction(ctx.db(), "tx-1").await;

        queue(
            &ctx,
            FollowUp::InventoryDecrement {
                item_id: SPRAY.into(),
                quantity: 50,
            },
        )
        .await;

        let report = OutboxReplayer::new(ctx.clone()).replay_pending().await.unwrap();
        assert_eq!(report.failed, 1);

        let entry = ctx.db().outbox().for_transaction("tx-1").await.unwrap().remove(0);
        assert_eq!(entry.attempts, 1);
        assert!(entry.resolved_at.is_none());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let ctx = seeded_context().await;
        let (replayer, handle) = OutboxReplayer::with_handle(ctx);

        let task = tokio::spawn(replayer.run(Duration::from_millis(10)));
        handle.shutdown().await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
