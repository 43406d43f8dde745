//! # Gift Card Repository
//!
//! Gift cards and their append-only balance ledger.
//!
//! ## Latest Entry Wins
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  gift_card_ledger for card gc-1                                         │
//! │  ┌─────┬──────────┬────────┬───────────────┐                            │
//! │  │ seq │ type     │ amount │ balance_after │                            │
//! │  ├─────┼──────────┼────────┼───────────────┤                            │
//! │  │ 7   │ activate │ 75.00  │ 75.00         │                            │
//! │  │ 12  │ redeem   │ 60.00  │ 15.00   ◄──── authoritative balance        │
//! │  └─────┴──────────┴────────┴───────────────┘                            │
//! │                                                                         │
//! │  gift_cards.current_balance_cents  ← cache, refreshed from the row      │
//! │                                      above in a single UPDATE           │
//! │                                                                         │
//! │  A card with no entries falls back to its cached balance.               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Conditional Append
//! A redemption is one `INSERT ... SELECT ... WHERE balance >= amount`.
//! When two registers race on the same card, SQLite serializes the two
//! statements and the loser inserts nothing, so `balance_after` can never
//! go negative.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use meridian_core::{GiftCard, GiftCardEntryType, GiftCardLedgerEntry, Money};

/// Balance expression shared by reads and the conditional append.
/// Expects the card id as `?1`.
const RESOLVED_BALANCE_SQL: &str = r#"
    COALESCE(
        (SELECT balance_after_cents FROM gift_card_ledger
         WHERE gift_card_id = ?1
         ORDER BY created_at DESC, seq DESC
         LIMIT 1),
        (SELECT current_balance_cents FROM gift_cards WHERE id = ?1)
    )
"#;

const ENTRY_COLUMNS: &str = r#"
    id, gift_card_id, transaction_id, entry_type, amount_cents,
    balance_after_cents, idempotency_key, created_at
"#;

/// Repository for gift card operations.
#[derive(Debug, Clone)]
pub struct GiftCardRepository {
    pool: SqlitePool,
}

impl GiftCardRepository {
    pub fn new(pool: SqlitePool) -> Self {
        GiftCardRepository { pool }
    }

    // =========================================================================
    // Cards
    // =========================================================================

    /// Issues a card and posts its `activate` entry.
    pub async fn issue(&self, card_number: &str, initial_balance: Money) -> DbResult<GiftCard> {
        let now = Utc::now();
        let card = GiftCard {
            id: Uuid::new_v4().to_string(),
            card_number: card_number.to_string(),
            initial_balance_cents: initial_balance.cents(),
            current_balance_cents: initial_balance.cents(),
            is_active: true,
            last_used_at: None,
            created_at: now,
        };

        debug!(id = %card.id, balance = %initial_balance, "Issuing gift card");

        sqlx::query(
            r#"
            INSERT INTO gift_cards (
                id, card_number, initial_balance_cents, current_balance_cents,
                is_active, last_used_at, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&card.id)
        .bind(&card.card_number)
        .bind(card.initial_balance_cents)
        .bind(card.current_balance_cents)
        .bind(card.is_active)
        .bind(card.last_used_at)
        .bind(card.created_at)
        .execute(&self.pool)
        .await?;

        if initial_balance.is_positive() {
            self.append_credit(&card.id, GiftCardEntryType::Activate, initial_balance, None)
                .await?;
        }

        Ok(card)
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<GiftCard>> {
        let card = sqlx::query_as::<_, GiftCard>(
            r#"
            SELECT id, card_number, initial_balance_cents, current_balance_cents,
                   is_active, last_used_at, created_at
            FROM gift_cards
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(card)
    }

    pub async fn get_by_number(&self, card_number: &str) -> DbResult<Option<GiftCard>> {
        let card = sqlx::query_as::<_, GiftCard>(
            r#"
            SELECT id, card_number, initial_balance_cents, current_balance_cents,
                   is_active, last_used_at, created_at
            FROM gift_cards
            WHERE card_number = ?1
            "#,
        )
        .bind(card_number)
        .fetch_optional(&self.pool)
        .await?;

        Ok(card)
    }

    pub async fn deactivate(&self, id: &str) -> DbResult<()> {
        let result = sqlx::query("UPDATE gift_cards SET is_active = 0 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("GiftCard", id));
        }

        Ok(())
    }

    // =========================================================================
    // Balance
    // =========================================================================

    /// Authoritative balance: latest ledger entry, else the cached column.
    pub async fn resolve_balance(&self, id: &str) -> DbResult<Money> {
        let sql = format!("SELECT {RESOLVED_BALANCE_SQL}");
        let cents: Option<i64> = sqlx::query_scalar(&sql)
            .bind(id)
            .fetch_one(&self.pool)
            .await?;

        cents
            .map(Money::from_cents)
            .ok_or_else(|| DbError::not_found("GiftCard", id))
    }

    /// Signed sum of the ledger (credits − redeems), None without entries.
    pub async fn ledger_sum(&self, id: &str) -> DbResult<Option<Money>> {
        let cents: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT SUM(CASE WHEN entry_type = 'redeem' THEN -amount_cents ELSE amount_cents END)
            FROM gift_card_ledger
            WHERE gift_card_id = ?1
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(cents.map(Money::from_cents))
    }

    /// Overwrites the cached balance from the latest ledger entry.
    ///
    /// `used_at` also stamps `last_used_at` (set after redemptions).
    pub async fn refresh_cached_balance(
        &self,
        id: &str,
        used_at: Option<DateTime<Utc>>,
    ) -> DbResult<Money> {
        let sql = format!(
            r#"
            UPDATE gift_cards SET
                current_balance_cents = {RESOLVED_BALANCE_SQL},
                last_used_at = COALESCE(?2, last_used_at)
            WHERE id = ?1
            RETURNING current_balance_cents
            "#
        );

        let cents: Option<i64> = sqlx::query_scalar(&sql)
            .bind(id)
            .bind(used_at)
            .fetch_optional(&self.pool)
            .await?;

        cents
            .map(Money::from_cents)
            .ok_or_else(|| DbError::not_found("GiftCard", id))
    }

    /// Overwrites the cached balance without touching the ledger.
    ///
    /// Only used to simulate drift in tests and data repair tooling.
    pub async fn set_cached_balance(&self, id: &str, balance: Money) -> DbResult<()> {
        let result = sqlx::query("UPDATE gift_cards SET current_balance_cents = ?2 WHERE id = ?1")
            .bind(id)
            .bind(balance.cents())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("GiftCard", id));
        }

        Ok(())
    }

    // =========================================================================
    // Ledger
    // =========================================================================

    /// Appends a `redeem` entry if the card is active and covers `amount`.
    ///
    /// ## Returns
    /// * `Ok(Some(entry))` - appended
    /// * `Ok(None)` - card inactive, missing, or balance too low; nothing written
    /// * `Err(UniqueViolation)` - `idempotency_key` was already used
    pub async fn append_redeem(
        &self,
        card_id: &str,
        amount: Money,
        transaction_id: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> DbResult<Option<GiftCardLedgerEntry>> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        debug!(card_id = %card_id, amount = %amount, "Appending gift card redeem");

        let sql = format!(
            r#"
            INSERT INTO gift_card_ledger (
                id, gift_card_id, transaction_id, entry_type,
                amount_cents, balance_after_cents, idempotency_key, created_at
            )
            SELECT ?2, ?1, ?3, 'redeem', ?4, b.bal - ?4, ?5, ?6
            FROM (SELECT {RESOLVED_BALANCE_SQL} AS bal) AS b
            WHERE b.bal >= ?4
              AND EXISTS (SELECT 1 FROM gift_cards WHERE id = ?1 AND is_active = 1)
            RETURNING balance_after_cents
            "#
        );

        let balance_after: Option<i64> = sqlx::query_scalar(&sql)
            .bind(card_id)
            .bind(&id)
            .bind(transaction_id)
            .bind(amount.cents())
            .bind(idempotency_key)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        Ok(balance_after.map(|balance_after_cents| GiftCardLedgerEntry {
            id,
            gift_card_id: card_id.to_string(),
            transaction_id: transaction_id.map(str::to_string),
            entry_type: GiftCardEntryType::Redeem,
            amount_cents: amount.cents(),
            balance_after_cents,
            idempotency_key: idempotency_key.map(str::to_string),
            created_at: now,
        }))
    }

    /// Appends a credit (`activate` or `purchase`) entry.
    pub async fn append_credit(
        &self,
        card_id: &str,
        entry_type: GiftCardEntryType,
        amount: Money,
        transaction_id: Option<&str>,
    ) -> DbResult<GiftCardLedgerEntry> {
        if entry_type == GiftCardEntryType::Redeem {
            return Err(DbError::CheckViolation {
                message: "redeem entries go through append_redeem".to_string(),
            });
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        debug!(card_id = %card_id, amount = %amount, "Appending gift card credit");

        // An activate entry starts the chain; a purchase tops up the balance.
        let sql = format!(
            r#"
            INSERT INTO gift_card_ledger (
                id, gift_card_id, transaction_id, entry_type,
                amount_cents, balance_after_cents, idempotency_key, created_at
            )
            SELECT ?2, ?1, ?3, ?4, ?5,
                   CASE WHEN ?4 = 'activate' AND NOT EXISTS (
                            SELECT 1 FROM gift_card_ledger WHERE gift_card_id = ?1)
                        THEN ?5
                        ELSE b.bal + ?5 END,
                   NULL, ?6
            FROM (SELECT {RESOLVED_BALANCE_SQL} AS bal) AS b
            WHERE b.bal IS NOT NULL
            RETURNING balance_after_cents
            "#
        );

        let balance_after: Option<i64> = sqlx::query_scalar(&sql)
            .bind(card_id)
            .bind(&id)
            .bind(transaction_id)
            .bind(entry_type)
            .bind(amount.cents())
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        let balance_after_cents =
            balance_after.ok_or_else(|| DbError::not_found("GiftCard", card_id))?;

        Ok(GiftCardLedgerEntry {
            id,
            gift_card_id: card_id.to_string(),
            transaction_id: transaction_id.map(str::to_string),
            entry_type,
            amount_cents: amount.cents(),
            balance_after_cents,
            idempotency_key: None,
            created_at: now,
        })
    }

    pub async fn latest_entry(&self, card_id: &str) -> DbResult<Option<GiftCardLedgerEntry>> {
        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM gift_card_ledger
            WHERE gift_card_id = ?1
            ORDER BY created_at DESC, seq DESC
            LIMIT 1
            "#
        );

        let entry = sqlx::query_as::<_, GiftCardLedgerEntry>(&sql)
            .bind(card_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(entry)
    }

    /// Most recent entries first.
    pub async fn recent_entries(&self, card_id: &str, limit: u32) -> DbResult<Vec<GiftCardLedgerEntry>> {
        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM gift_card_ledger
            WHERE gift_card_id = ?1
            ORDER BY created_at DESC, seq DESC
            LIMIT ?2
            "#
        );

        let entries = sqlx::query_as::<_, GiftCardLedgerEntry>(&sql)
            .bind(card_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(entries)
    }

    /// A redeem of exactly `amount` on this card at or after `since`.
    pub async fn find_recent_redeem(
        &self,
        card_id: &str,
        amount: Money,
        since: DateTime<Utc>,
    ) -> DbResult<Option<GiftCardLedgerEntry>> {
        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM gift_card_ledger
            WHERE gift_card_id = ?1
              AND entry_type = 'redeem'
              AND amount_cents = ?2
              AND created_at >= ?3
            ORDER BY created_at DESC, seq DESC
            LIMIT 1
            "#
        );

        let entry = sqlx::query_as::<_, GiftCardLedgerEntry>(&sql)
            .bind(card_id)
            .bind(amount.cents())
            .bind(since)
            .fetch_optional(&self.pool)
            .await?;

        Ok(entry)
    }

    pub async fn find_by_idempotency_key(&self, key: &str) -> DbResult<Option<GiftCardLedgerEntry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM gift_card_ledger WHERE idempotency_key = ?1");

        let entry = sqlx::query_as::<_, GiftCardLedgerEntry>(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};

    #[tokio::test]
    async fn test_issue_posts_activation() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.gift_cards();
        let card = repo.issue("6000-0001", Money::from_cents(7500)).await.unwrap();

        let latest = repo.latest_entry(&card.id).await.unwrap().unwrap();
        assert_eq!(latest.entry_type, GiftCardEntryType::Activate);
        assert_eq!(latest.balance_after(), Money::from_cents(7500));
        assert_eq!(repo.resolve_balance(&card.id).await.unwrap(), Money::from_cents(7500));
    }

    #[tokio::test]
    async fn test_redeem_sequence_never_goes_negative() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.gift_cards();
        let card = repo.issue("6000-0002", Money::from_cents(5000)).await.unwrap();

        let mut redeemed = Money::zero();
        for cents in [1500, 2000, 1000] {
            let entry = repo
                .append_redeem(&card.id, Money::from_cents(cents), None, None)
                .await
                .unwrap()
                .unwrap();
            redeemed += Money::from_cents(cents);
            assert_eq!(entry.balance_after(), Money::from_cents(5000) - redeemed);
        }

        // $5.00 left, $6.00 requested: nothing written
        assert!(repo
            .append_redeem(&card.id, Money::from_cents(600), None, None)
            .await
            .unwrap()
            .is_none());
        assert_eq!(repo.resolve_balance(&card.id).await.unwrap(), Money::from_cents(500));
        assert_eq!(repo.ledger_sum(&card.id).await.unwrap(), Some(Money::from_cents(500)));
    }

    #[tokio::test]
    async fn test_ledger_wins_over_stale_cache() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.gift_cards();
        let card = repo.issue("6000-0003", Money::from_cents(7500)).await.unwrap();

        repo.append_redeem(&card.id, Money::from_cents(6000), None, None).await.unwrap();
        // cache still says $75
        assert_eq!(repo.get(&card.id).await.unwrap().unwrap().cached_balance(), Money::from_cents(7500));
        assert_eq!(repo.resolve_balance(&card.id).await.unwrap(), Money::from_cents(1500));

        let used_at = Utc::now();
        let refreshed = repo.refresh_cached_balance(&card.id, Some(used_at)).await.unwrap();
        assert_eq!(refreshed, Money::from_cents(1500));
        assert!(repo.get(&card.id).await.unwrap().unwrap().last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_idempotency_key_is_unique() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.gift_cards();
        let card = repo.issue("6000-0004", Money::from_cents(10000)).await.unwrap();

        repo.append_redeem(&card.id, Money::from_cents(1000), None, Some("k-1:gift"))
            .await
            .unwrap()
            .unwrap();
        let err = repo
            .append_redeem(&card.id, Money::from_cents(1000), None, Some("k-1:gift"))
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());

        assert!(repo.find_by_idempotency_key("k-1:gift").await.unwrap().is_some());
        assert_eq!(repo.recent_entries(&card.id, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_inactive_card_cannot_redeem() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.gift_cards();
        let card = repo.issue("6000-0005", Money::from_cents(10000)).await.unwrap();
        repo.deactivate(&card.id).await.unwrap();

        assert!(repo
            .append_redeem(&card.id, Money::from_cents(100), None, None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_purchase_tops_up() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.gift_cards();
        let card = repo.issue("6000-0006", Money::from_cents(1000)).await.unwrap();

        let entry = repo
            .append_credit(&card.id, GiftCardEntryType::Purchase, Money::from_cents(2500), None)
            .await
            .unwrap();
        assert_eq!(entry.balance_after(), Money::from_cents(3500));
        assert_eq!(repo.get_by_number("6000-0006").await.unwrap().unwrap().id, card.id);
    }
}
