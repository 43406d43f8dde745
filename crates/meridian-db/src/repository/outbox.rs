//! # Settlement Outbox Repository
//!
//! Queue of post-commit steps that failed after a transaction row was
//! written.
//!
//! ## The Outbox Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  CHECKOUT (Writing state)                                               │
//! │       │                                                                 │
//! │       ├── INSERT transactions           ✓  sale is on record            │
//! │       ├── UPDATE inventory (decrement)  ✗  store busy                   │
//! │       │        │                                                        │
//! │       │        └──► INSERT settlement_outbox                            │
//! │       │             kind = inventory_decrement                          │
//! │       │             payload = {"item_id": "...", "quantity": 2}         │
//! │       │                                                                 │
//! │       └── ... remaining steps continue, checkout reports success        │
//! │                                                                         │
//! │  OUTBOX REPLAYER (later)                                                │
//! │       1. SELECT unresolved entries, attempts < max                      │
//! │       2. Re-run the step                                                │
//! │       3. Success → resolved_at = now                                    │
//! │          Failure → attempts += 1, last_error = ?                        │
//! │                                                                         │
//! │  Operator-only kinds (gift_card_debit, unsettled_payment) never enter   │
//! │  the replay batch; awaiting_operator() lists them.                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use meridian_core::{OutboxEntry, OutboxKind};

const ENTRY_COLUMNS: &str = r#"
    id, transaction_id, kind, payload, attempts, last_error,
    created_at, attempted_at, resolved_at
"#;

/// Repository for settlement outbox operations.
#[derive(Debug, Clone)]
pub struct OutboxRepository {
    pool: SqlitePool,
}

impl OutboxRepository {
    pub fn new(pool: SqlitePool) -> Self {
        OutboxRepository { pool }
    }

    /// Queues a failed step for follow-up.
    ///
    /// ## Arguments
    /// * `transaction_id` - The settled transaction the step belongs to
    /// * `kind` - Which step failed
    /// * `payload` - JSON with everything needed to re-run the step
    pub async fn enqueue(
        &self,
        transaction_id: &str,
        kind: OutboxKind,
        payload: &str,
        error: &str,
    ) -> DbResult<OutboxEntry> {
        let now = Utc::now();

        debug!(
            transaction_id = %transaction_id,
            kind = kind.as_str(),
            "Queuing settlement follow-up"
        );

        let entry = OutboxEntry {
            id: Uuid::new_v4().to_string(),
            transaction_id: transaction_id.to_string(),
            kind,
            payload: payload.to_string(),
            attempts: 0,
            last_error: Some(error.to_string()),
            created_at: now,
            attempted_at: None,
            resolved_at: None,
        };

        sqlx::query(
            r#"
            INSERT INTO settlement_outbox (
                id, transaction_id, kind, payload,
                attempts, last_error, created_at, attempted_at, resolved_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.transaction_id)
        .bind(entry.kind)
        .bind(&entry.payload)
        .bind(entry.attempts)
        .bind(&entry.last_error)
        .bind(entry.created_at)
        .bind(entry.attempted_at)
        .bind(entry.resolved_at)
        .execute(&self.pool)
        .await?;

        Ok(entry)
    }

    /// Unresolved replayable entries with fewer than `max_attempts`
    /// attempts, oldest first. Operator-only kinds are excluded so they
    /// cannot crowd newer entries out of the batch.
    pub async fn pending(&self, limit: u32, max_attempts: u32) -> DbResult<Vec<OutboxEntry>> {
        let [gift_debit, unsettled] = OutboxKind::OPERATOR_ONLY;
        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM settlement_outbox
            WHERE resolved_at IS NULL AND attempts < ?2 AND kind NOT IN (?3, ?4)
            ORDER BY created_at ASC
            LIMIT ?1
            "#
        );

        let entries = sqlx::query_as::<_, OutboxEntry>(&sql)
            .bind(limit)
            .bind(max_attempts)
            .bind(gift_debit)
            .bind(unsettled)
            .fetch_all(&self.pool)
            .await?;

        Ok(entries)
    }

    /// Unresolved entries of the operator-only kinds, oldest first.
    pub async fn awaiting_operator(&self, limit: u32) -> DbResult<Vec<OutboxEntry>> {
        let [gift_debit, unsettled] = OutboxKind::OPERATOR_ONLY;
        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM settlement_outbox
            WHERE resolved_at IS NULL AND kind IN (?2, ?3)
            ORDER BY created_at ASC
            LIMIT ?1
            "#
        );

        let entries = sqlx::query_as::<_, OutboxEntry>(&sql)
            .bind(limit)
            .bind(gift_debit)
            .bind(unsettled)
            .fetch_all(&self.pool)
            .await?;

        Ok(entries)
    }

    pub async fn count_awaiting_operator(&self) -> DbResult<i64> {
        let [gift_debit, unsettled] = OutboxKind::OPERATOR_ONLY;
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM settlement_outbox WHERE resolved_at IS NULL AND kind IN (?1, ?2)",
        )
        .bind(gift_debit)
        .bind(unsettled)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Every entry recorded for a transaction.
    pub async fn for_transaction(&self, transaction_id: &str) -> DbResult<Vec<OutboxEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM settlement_outbox WHERE transaction_id = ?1 ORDER BY created_at ASC"
        );

        let entries = sqlx::query_as::<_, OutboxEntry>(&sql)
            .bind(transaction_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(entries)
    }

    pub async fn mark_resolved(&self, id: &str) -> DbResult<()> {
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE settlement_outbox SET
                resolved_at = ?2,
                attempted_at = ?2,
                attempts = attempts + 1
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("OutboxEntry", id));
        }

        Ok(())
    }

    /// Records a failed replay.
    pub async fn mark_failed(&self, id: &str, error: &str) -> DbResult<()> {
        let now = Utc::now();

        sqlx::query(
            r#"
            UPDATE settlement_outbox SET
                attempts = attempts + 1,
                last_error = ?2,
                attempted_at = ?3
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn count_pending(&self) -> DbResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM settlement_outbox WHERE resolved_at IS NULL")
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }
}
