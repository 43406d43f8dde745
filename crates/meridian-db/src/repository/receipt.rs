//! # Receipt Repository
//!
//! Receipt stubs. Rendering and printing happen outside the engine; this
//! only reserves a receipt number for a settled transaction.
//!
//! Numbers are `YYYYMMDD-<register id>-NNNN`, with a daily sequence per
//! register. The sequence is picked inside the INSERT, so two checkouts
//! on the same register cannot read the same count.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use meridian_core::Receipt;

/// Attempts before a sequence collision is reported.
const MAX_NUMBER_ATTEMPTS: usize = 3;

/// Repository for receipt stubs.
#[derive(Debug, Clone)]
pub struct ReceiptRepository {
    pool: SqlitePool,
}

impl ReceiptRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ReceiptRepository { pool }
    }

    /// Creates the receipt stub for a transaction.
    ///
    /// Returns the existing stub when one was already created, so replays
    /// are harmless.
    pub async fn create(&self, transaction_id: &str, register_id: &str) -> DbResult<Receipt> {
        let mut last_err: Option<DbError> = None;

        for attempt in 1..=MAX_NUMBER_ATTEMPTS {
            if let Some(existing) = self.find_by_transaction(transaction_id).await? {
                return Ok(existing);
            }

            match self.insert_next(transaction_id, register_id, Utc::now()).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) if e.is_unique_violation() => {
                    warn!(
                        transaction_id = %transaction_id,
                        register_id = %register_id,
                        attempt,
                        "Receipt number taken; retrying"
                    );
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(existing) = self.find_by_transaction(transaction_id).await? {
            return Ok(existing);
        }
        Err(last_err.unwrap_or_else(|| DbError::not_found("Receipt", transaction_id)))
    }

    async fn insert_next(
        &self,
        transaction_id: &str,
        register_id: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Receipt> {
        let id = Uuid::new_v4().to_string();
        let business_date = business_date(now);

        let receipt_number: String = sqlx::query_scalar(
            r#"
            INSERT INTO receipts (
                id, transaction_id, register_id, business_date,
                sequence, receipt_number, created_at
            )
            SELECT ?1, ?2, ?3, ?4, next.n, printf('%s-%s-%04d', ?4, ?3, next.n), ?5
            FROM (
                SELECT COALESCE(MAX(sequence), 0) + 1 AS n
                FROM receipts
                WHERE register_id = ?3 AND business_date = ?4
            ) AS next
            RETURNING receipt_number
            "#,
        )
        .bind(&id)
        .bind(transaction_id)
        .bind(register_id)
        .bind(&business_date)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        debug!(
            transaction_id = %transaction_id,
            receipt_number = %receipt_number,
            "Receipt created"
        );

        Ok(Receipt {
            id,
            transaction_id: transaction_id.to_string(),
            receipt_number,
            created_at: now,
        })
    }

    pub async fn find_by_transaction(&self, transaction_id: &str) -> DbResult<Option<Receipt>> {
        let receipt = sqlx::query_as::<_, Receipt>(
            "SELECT id, transaction_id, receipt_number, created_at FROM receipts WHERE transaction_id = ?1",
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(receipt)
    }
}

/// UTC calendar day the daily sequence restarts on.
fn business_date(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d").to_string()
}
