//! # Loyalty Points Engine
//!
//! Discount previews, redemptions, earn entries and reconciliation.
//!
//! ## Balance Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Σ(earned − redeemed) over loyalty_ledger      ◄── authoritative        │
//! │          │                                                              │
//! │          │  previews, redemptions, reconciliation read this             │
//! │          ▼                                                              │
//! │  customers.loyalty_points                      ◄── cache, rewritten     │
//! │                                                    after every append   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Redemption failures stop the checkout. Earn failures are logged and
//! queued; the sale stands either way.

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use meridian_core::loyalty::{plan_redemption, points_to_earn, preview_discount, Redemption};
use meridian_core::{LoyaltyEntryType, LoyaltyLedgerEntry, LoyaltyProgram, Money};
use meridian_db::LoyaltyRepository;

use crate::error::{SettlementError, SettlementResult};

/// Loyalty figures for a checkout quote.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoyaltyPreview {
    pub program: Option<LoyaltyProgram>,
    /// Ledger balance, 0 without a customer.
    pub balance: i64,
    pub discount: Money,
}

/// Cache drift found and repaired by [`LoyaltyEngine::reconcile_loyalty`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoyaltyReconciliation {
    pub cached_before: i64,
    pub ledger_balance: i64,
    /// `ledger_balance − cached_before`.
    pub drift: i64,
}

#[derive(Debug, Clone)]
pub struct LoyaltyEngine {
    repo: LoyaltyRepository,
}

impl LoyaltyEngine {
    pub fn new(repo: LoyaltyRepository) -> Self {
        LoyaltyEngine { repo }
    }

    pub async fn active_program(&self) -> SettlementResult<Option<LoyaltyProgram>> {
        Ok(self.repo.active_program().await?)
    }

    /// Candidate discount for `coverable` (what is left after the manual
    /// discount).
    pub async fn preview_discount(
        &self,
        customer_id: Option<&str>,
        use_points: bool,
        coverable: Money,
    ) -> SettlementResult<LoyaltyPreview> {
        let Some(customer_id) = customer_id else {
            return Ok(LoyaltyPreview {
                program: None,
                balance: 0,
                discount: Money::zero(),
            });
        };

        if self.repo.get_customer(customer_id).await?.is_none() {
            return Err(SettlementError::not_found("Customer", customer_id));
        }

        let program = self.repo.active_program().await?;
        let balance = self.repo.ledger_balance(customer_id).await?;
        let discount = preview_discount(balance, program.as_ref(), use_points, coverable);

        debug!(
            customer_id = %customer_id,
            balance = balance,
            discount = %discount,
            "Loyalty preview"
        );

        Ok(LoyaltyPreview {
            program,
            balance,
            discount,
        })
    }

    /// Confirms the ledger still covers a planned redemption.
    pub async fn recheck(&self, customer_id: &str, redemption: &Redemption) -> SettlementResult<()> {
        let balance = self.repo.ledger_balance(customer_id).await?;
        if balance < redemption.points_to_redeem {
            return Err(SettlementError::concurrency(
                "loyalty",
                format!(
                    "customer {} has {} points, {} needed",
                    customer_id, balance, redemption.points_to_redeem
                ),
            ));
        }
        Ok(())
    }

    /// Posts a redeem entry sized to cover `amount_to_cover`.
    ///
    /// No-op when nothing needs redeeming.
    pub async fn redeem(
        &self,
        customer_id: &str,
        transaction_id: &str,
        amount_to_cover: Money,
        program: &LoyaltyProgram,
    ) -> SettlementResult<Redemption> {
        let balance = self.repo.ledger_balance(customer_id).await?;
        let plan = plan_redemption(balance, amount_to_cover, program.points_value_cents);

        if plan.is_noop() {
            return Ok(plan);
        }

        let entry = self
            .repo
            .append_redeem(customer_id, transaction_id, plan.points_to_redeem)
            .await
            .map_err(|e| SettlementError::RedemptionFailed {
                transaction_id: transaction_id.to_string(),
                reason: e.to_string(),
            })?
            .ok_or_else(|| SettlementError::RedemptionFailed {
                transaction_id: transaction_id.to_string(),
                reason: format!("balance no longer covers {} points", plan.points_to_redeem),
            })?;

        info!(
            customer_id = %customer_id,
            transaction_id = %transaction_id,
            points = plan.points_to_redeem,
            value = %plan.redeemed_value,
            balance_after = entry.points_balance,
            "Loyalty points redeemed"
        );

        Ok(Redemption {
            balance_after: entry.points_balance,
            ..plan
        })
    }

    /// Posts the earn entry for a completed sale.
    ///
    /// Returns None when the sale earns nothing. Replays of an already
    /// posted earn return the existing entry.
    pub async fn earn(
        &self,
        customer_id: &str,
        transaction_id: &str,
        final_total: Decimal,
        program: &LoyaltyProgram,
    ) -> SettlementResult<Option<LoyaltyLedgerEntry>> {
        let points = points_to_earn(final_total, program.points_per_dollar);
        if points <= 0 {
            return Ok(None);
        }
        self.post_earn(customer_id, transaction_id, points).await.map(Some)
    }

    /// Appends an earn of exactly `points`. Idempotent per transaction.
    pub async fn post_earn(
        &self,
        customer_id: &str,
        transaction_id: &str,
        points: i64,
    ) -> SettlementResult<LoyaltyLedgerEntry> {
        match self.repo.append_earn(customer_id, Some(transaction_id), points).await {
            Ok(entry) => {
                debug!(customer_id = %customer_id, points = points, "Loyalty points earned");
                Ok(entry)
            }
            Err(e) if e.is_unique_violation() => self
                .repo
                .find_entry(customer_id, transaction_id, LoyaltyEntryType::Earn)
                .await?
                .ok_or_else(|| SettlementError::Internal(format!("earn entry for {} vanished", transaction_id))),
            Err(e) => Err(e.into()),
        }
    }

    /// Rewrites the cached points from the ledger.
    pub async fn refresh_cache(&self, customer_id: &str) -> SettlementResult<i64> {
        Ok(self.repo.refresh_cached_points(customer_id).await?)
    }

    /// Resums the ledger, overwrites the cache and reports the drift.
    pub async fn reconcile_loyalty(&self, customer_id: &str) -> SettlementResult<LoyaltyReconciliation> {
        let customer = self
            .repo
            .get_customer(customer_id)
            .await?
            .ok_or_else(|| SettlementError::not_found("Customer", customer_id))?;

        let ledger_balance = self.repo.refresh_cached_points(customer_id).await?;
        let drift = ledger_balance - customer.loyalty_points;

        if drift != 0 {
            warn!(
                customer_id = %customer_id,
                cached = customer.loyalty_points,
                ledger = ledger_balance,
                "Loyalty cache drifted from ledger; repaired"
            );
        }

        Ok(LoyaltyReconciliation {
            cached_before: customer.loyalty_points,
            ledger_balance,
            drift,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::insert_transaction;
    use meridian_db::{Database, DbConfig};

    async fn engine_with_points(points: i64) -> (Database, LoyaltyEngine) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.loyalty()
            .insert_program(&LoyaltyProgram {
                id: "prog".into(),
                points_per_dollar: Decimal::ONE,
                minimum_points_redeem: 100,
                points_value_cents: 1,
                is_active: true,
            })
            .await
            .unwrap();
        db.loyalty().insert_customer("cust-1", "Avery Quinn").await.unwrap();
        if points > 0 {
            db.loyalty().append_earn("cust-1", None, points).await.unwrap();
        }
        db.loyalty().refresh_cached_points("cust-1").await.unwrap();
        let engine = LoyaltyEngine::new(db.loyalty());
        (db, engine)
    }

    #[tokio::test]
    async fn test_preview_caps_at_coverable() {
        let (_db, engine) = engine_with_points(500).await;

        let preview = engine
            .preview_discount(Some("cust-1"), true, Money::from_cents(300))
            .await
            .unwrap();
        assert_eq!(preview.balance, 500);
        assert_eq!(preview.discount, Money::from_cents(300));

        let off = engine
            .preview_discount(Some("cust-1"), false, Money::from_cents(300))
            .await
            .unwrap();
        assert!(off.discount.is_zero());
    }

    #[tokio::test]
    async fn test_preview_below_minimum() {
        let (_db, engine) = engine_with_points(50).await;
        let preview = engine
            .preview_discount(Some("cust-1"), true, Money::from_cents(300))
            .await
            .unwrap();
        assert!(preview.discount.is_zero());
    }

    #[tokio::test]
    async fn test_redeem_covers_exactly() {
        let (db, engine) = engine_with_points(500).await;
        insert_transaction(&db, "tx-1").await;
        let program = engine.active_program().await.unwrap().unwrap();

        let redemption = engine
            .redeem("cust-1", "tx-1", Money::from_cents(300), &program)
            .await
            .unwrap();

        assert_eq!(redemption.points_to_redeem, 300);
        assert_eq!(redemption.redeemed_value, Money::from_cents(300));
        assert_eq!(redemption.balance_after, 200);
        assert_eq!(db.loyalty().ledger_balance("cust-1").await.unwrap(), 200);
    }

    #[tokio::test]
    async fn test_recheck_detects_spent_points() {
        let (db, engine) = engine_with_points(500).await;
        let plan = plan_redemption(500, Money::from_cents(400), 1);

        insert_transaction(&db, "tx-other").await;
        db.loyalty().append_redeem("cust-1", "tx-other", 200).await.unwrap();

        let err = engine.recheck("cust-1", &plan).await.unwrap_err();
        assert!(matches!(err, SettlementError::Concurrency { .. }));
    }

    #[tokio::test]
    async fn test_earn_is_idempotent_per_transaction() {
        let (db, engine) = engine_with_points(0).await;
        insert_transaction(&db, "tx-1").await;
        let program = engine.active_program().await.unwrap().unwrap();

        // $42.99 at 1 point per dollar
        let total = Decimal::new(4299, 2);
        let first = engine.earn("cust-1", "tx-1", total, &program).await.unwrap().unwrap();
        let again = engine.earn("cust-1", "tx-1", total, &program).await.unwrap().unwrap();

        assert_eq!(first.points_earned, Some(42));
        assert_eq!(first.id, again.id);
        assert_eq!(db.loyalty().ledger_balance("cust-1").await.unwrap(), 42);

        let nothing = engine.earn("cust-1", "tx-1", Decimal::new(50, 2), &program).await.unwrap();
        assert!(nothing.is_none());
    }

    #[tokio::test]
    async fn test_reconcile_repairs_drift() {
        let (db, engine) = engine_with_points(500).await;
        db.loyalty().set_cached_points("cust-1", 320).await.unwrap();

        let report = engine.reconcile_loyalty("cust-1").await.unwrap();
        assert_eq!(report.cached_before, 320);
        assert_eq!(report.ledger_balance, 500);
        assert_eq!(report.drift, 180);

        let customer = db.loyalty().get_customer("cust-1").await.unwrap().unwrap();
        assert_eq!(customer.loyalty_points, 500);
    }
}
