//! # Gift Card Ledger
//!
//! Balance checks, redemptions and cache maintenance for store-issued
//! gift cards.
//!
//! ## Redemption Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  check_redeemable(card, amount)        Validating: inactive / short     │
//! │        │                               → CoreError, nothing written     │
//! │        ▼                                                                │
//! │  recheck(card, amount)                 right before Writing             │
//! │        │                               → ConcurrencyError               │
//! │        ▼                                                                │
//! │  redeem(card, amount, tx, key)                                          │
//! │        ├── recency scan (duplicate_window_secs > 0 only)                │
//! │        ├── conditional INSERT into gift_card_ledger                     │
//! │        │     balance_after = latest balance − amount, never < 0         │
//! │        └── key reused → DuplicateSubmission                             │
//! │        ▼                                                                │
//! │  refresh_cache(card)                   cache = latest balance_after     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use meridian_core::{CoreError, GiftCard, GiftCardLedgerEntry, Money};
use meridian_db::GiftCardRepository;

use crate::error::{SettlementError, SettlementResult};

/// Cache drift found and repaired by [`GiftCardLedger::reconcile_gift_card`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GiftCardReconciliation {
    pub cached_before: Money,
    /// Latest ledger entry's balance (or the cache when there are none).
    pub resolved: Money,
    /// Credits minus redeems over the whole ledger.
    pub ledger_sum: Option<Money>,
    pub drift: Money,
}

impl GiftCardReconciliation {
    /// True when the latest entry disagrees with the sum of all entries.
    pub fn ledger_inconsistent(&self) -> bool {
        matches!(self.ledger_sum, Some(sum) if sum != self.resolved)
    }
}

#[derive(Debug, Clone)]
pub struct GiftCardLedger {
    repo: GiftCardRepository,
    duplicate_window_secs: u64,
}

impl GiftCardLedger {
    pub fn new(repo: GiftCardRepository, duplicate_window_secs: u64) -> Self {
        GiftCardLedger {
            repo,
            duplicate_window_secs,
        }
    }

    /// Authoritative balance: latest entry, else the cached field.
    pub async fn resolve_balance(&self, card_id: &str) -> SettlementResult<Money> {
        self.card(card_id).await?;
        Ok(self.repo.resolve_balance(card_id).await?)
    }

    /// Validation-time check. Errors are plain validation failures.
    pub async fn check_redeemable(&self, card_id: &str, amount: Money) -> SettlementResult<GiftCard> {
        let card = self.card(card_id).await?;

        if !card.is_active {
            warn!(card_id = %card_id, "Rejecting redeem on inactive gift card");
            return Err(CoreError::GiftCardInactive(card_id.to_string()).into());
        }

        let available = self.repo.resolve_balance(card_id).await?;
        if amount > available {
            warn!(
                card_id = %card_id,
                available = %available,
                requested = %amount,
                "Rejecting redeem: insufficient gift card balance"
            );
            return Err(CoreError::InsufficientGiftCardBalance {
                card_id: card_id.to_string(),
                available,
                requested: amount,
            }
            .into());
        }

        Ok(card)
    }

    /// Write-time check. A shortfall here means another register spent the
    /// card after validation.
    pub async fn recheck(&self, card_id: &str, amount: Money) -> SettlementResult<()> {
        match self.check_redeemable(card_id, amount).await {
            Ok(_) => Ok(()),
            Err(SettlementError::Core(
                e @ (CoreError::InsufficientGiftCardBalance { .. } | CoreError::GiftCardInactive(_)),
            )) => Err(SettlementError::concurrency("gift_card", e.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Appends a redeem entry.
    ///
    /// ## Errors
    /// * `DuplicateSubmission` - same key already posted, or (with a recency
    ///   window) the same amount was redeemed on this card moments ago
    /// * `Concurrency` - balance or activation changed since the last check
    pub async fn redeem(
        &self,
        card_id: &str,
        amount: Money,
        transaction_id: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> SettlementResult<GiftCardLedgerEntry> {
        if self.duplicate_window_secs > 0 {
            let since = Utc::now() - Duration::seconds(self.duplicate_window_secs as i64);
            if let Some(recent) = self.repo.find_recent_redeem(card_id, amount, since).await? {
                warn!(
                    card_id = %card_id,
                    amount = %amount,
                    previous = %recent.id,
                    "Rejecting redeem inside the duplicate window"
                );
                return Err(SettlementError::DuplicateSubmission {
                    key: idempotency_key.unwrap_or(&recent.id).to_string(),
                });
            }
        }

        let appended = self
            .repo
            .append_redeem(card_id, amount, transaction_id, idempotency_key)
            .await;

        let entry = match appended {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                let available = self.repo.resolve_balance(card_id).await.unwrap_or_default();
                return Err(SettlementError::concurrency(
                    "gift_card",
                    format!(
                        "card {} could not cover {} (balance {}, or deactivated)",
                        card_id, amount, available
                    ),
                ));
            }
            Err(e) if e.is_unique_violation() => {
                return Err(SettlementError::DuplicateSubmission {
                    key: idempotency_key.unwrap_or_default().to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            card_id = %card_id,
            amount = %amount,
            balance_after = %entry.balance_after(),
            "Gift card redeemed"
        );

        Ok(entry)
    }

    /// Rewrites the cached balance and last-used time.
    pub async fn refresh_cache(&self, card_id: &str) -> SettlementResult<Money> {
        let balance = self.repo.refresh_cached_balance(card_id, Some(Utc::now())).await?;
        debug!(card_id = %card_id, balance = %balance, "Gift card cache refreshed");
        Ok(balance)
    }

    /// Re-resolves the balance, overwrites the cache and reports drift.
    pub async fn reconcile_gift_card(&self, card_id: &str) -> SettlementResult<GiftCardReconciliation> {
        let card = self.card(card_id).await?;
        let ledger_sum = self.repo.ledger_sum(card_id).await?;
        let resolved = self.repo.refresh_cached_balance(card_id, None).await?;

        let report = GiftCardReconciliation {
            cached_before: card.cached_balance(),
            resolved,
            ledger_sum,
            drift: resolved - card.cached_balance(),
        };

        if !report.drift.is_zero() {
            warn!(
                card_id = %card_id,
                cached = %report.cached_before,
                resolved = %resolved,
                "Gift card cache drifted from ledger; repaired"
            );
        }
        if report.ledger_inconsistent() {
            warn!(card_id = %card_id, "Gift card ledger sum disagrees with latest entry");
        }

        Ok(report)
    }

    async fn card(&self, card_id: &str) -> SettlementResult<GiftCard> {
        self.repo
            .get(card_id)
            .await?
            .ok_or_else(|| SettlementError::not_found("GiftCard", card_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::insert_transaction;
    use meridian_db::{Database, DbConfig};

    async fn ledger_with_card(cents: i64, window: u64) -> (Database, GiftCardLedger, String) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let card = db
            .gift_cards()
            .issue("6000-0000-0001", Money::from_cents(cents))
            .await
            .unwrap();
        let ledger = GiftCardLedger::new(db.gift_cards(), window);
        (db, ledger, card.id)
    }

    #[tokio::test]
    async fn test_sequence_never_goes_negative() {
        let (db, ledger, card) = ledger_with_card(7500, 0).await;
        insert_transaction(&db, "tx-1").await;

        for (i, cents) in [2000, 3000, 2500].into_iter().enumerate() {
            let key = format!("k{i}");
            ledger
                .redeem(&card, Money::from_cents(cents), Some("tx-1"), Some(&key))
                .await
                .unwrap();
        }
        assert_eq!(ledger.resolve_balance(&card).await.unwrap(), Money::zero());

        let err = ledger
            .redeem(&card, Money::from_cents(1), Some("tx-1"), Some("k9"))
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::Concurrency { .. }));
    }

    #[tokio::test]
    async fn test_check_redeemable() {
        let (db, ledger, card) = ledger_with_card(7500, 0).await;

        assert!(ledger.check_redeemable(&card, Money::from_cents(7500)).await.is_ok());
        let err = ledger
            .check_redeemable(&card, Money::from_cents(7501))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SettlementError::Core(CoreError::InsufficientGiftCardBalance { .. })
        ));

        db.gift_cards().deactivate(&card).await.unwrap();
        let err = ledger.check_redeemable(&card, Money::from_cents(1)).await.unwrap_err();
        assert!(matches!(err, SettlementError::Core(CoreError::GiftCardInactive(_))));

        let err = ledger.recheck(&card, Money::from_cents(1)).await.unwrap_err();
        assert!(matches!(err, SettlementError::Concurrency { .. }));
    }

    #[tokio::test]
    async fn test_reused_key_is_duplicate() {
        let (_db, ledger, card) = ledger_with_card(7500, 0).await;

        ledger
            .redeem(&card, Money::from_cents(1000), None, Some("chk-1:gift"))
            .await
            .unwrap();
        let err = ledger
            .redeem(&card, Money::from_cents(1000), None, Some("chk-1:gift"))
            .await
            .unwrap_err();

        assert!(matches!(err, SettlementError::DuplicateSubmission { .. }));
        assert_eq!(ledger.resolve_balance(&card).await.unwrap(), Money::from_cents(6500));
    }

    #[tokio::test]
    async fn test_recency_window() {
        let (_db, ledger, card) = ledger_with_card(7500, 60).await;

        ledger
            .redeem(&card, Money::from_cents(1000), None, Some("a"))
            .await
            .unwrap();
        let err = ledger
            .redeem(&card, Money::from_cents(1000), None, Some("b"))
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::DuplicateSubmission { .. }));

        // a different amount is not a duplicate
        ledger
            .redeem(&card, Money::from_cents(500), None, Some("c"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_repairs_cache() {
        let (db, ledger, card) = ledger_with_card(7500, 0).await;
        ledger
            .redeem(&card, Money::from_cents(6000), None, Some("a"))
            .await
            .unwrap();
        db.gift_cards().set_cached_balance(&card, Money::from_cents(7500)).await.unwrap();

        let report = ledger.reconcile_gift_card(&card).await.unwrap();
        assert_eq!(report.cached_before, Money::from_cents(7500));
        assert_eq!(report.resolved, Money::from_cents(1500));
        assert_eq!(report.drift, Money::from_cents(-6000));
        assert!(!report.ledger_inconsistent());

        let card = db.gift_cards().get(&card).await.unwrap().unwrap();
        assert_eq!(card.cached_balance(), Money::from_cents(1500));
    }
}
