//! # Transaction Repository
//!
//! Settled transactions, their items, and split-tender rows.
//!
//! ## Write Order
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. insert()          transactions      ← UNIQUE idempotency_key        │
//! │  2. insert_item()     transaction_items ← one per cart line             │
//! │  3. insert_split()    payment_splits    ← one per tender leg            │
//! │                                                                         │
//! │  Each call is its own statement. Once (1) succeeds the sale is on       │
//! │  record; failures in (2) and (3) are handled by the caller.             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `refunded_cents` is the only column changed after the insert, and only by
//! the refund collaborator through [`TransactionRepository::record_refund`].

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use meridian_core::split::{prorate_refund, ProratedLeg};
use meridian_core::{Money, PaymentSplitRecord, SplitPayment, Transaction, TransactionItem};

const TRANSACTION_COLUMNS: &str = r#"
    id, idempotency_key, payment_method, status,
    total_cents, subtotal_cents, tax_cents, discount_cents, loyalty_discount_cents,
    is_split_payment, shift_id, customer_id, gift_card_id,
    gateway_payment_id, card_last4, card_brand, refunded_cents, created_at
"#;

/// Repository for transaction records.
#[derive(Debug, Clone)]
pub struct TransactionRepository {
    pool: SqlitePool,
}

impl TransactionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        TransactionRepository { pool }
    }

    /// Inserts a settled transaction.
    ///
    /// ## Errors
    /// `UniqueViolation` when the idempotency key was already used.
    pub async fn insert(&self, tx: &Transaction) -> DbResult<()> {
        debug!(
            id = %tx.id,
            method = %tx.payment_method,
            total = %tx.total(),
            "Inserting transaction"
        );

        sqlx::query(
            r#"
            INSERT INTO transactions (
                id, idempotency_key, payment_method, status,
                total_cents, subtotal_cents, tax_cents, discount_cents, loyalty_discount_cents,
                is_split_payment, shift_id, customer_id, gift_card_id,
                gateway_payment_id, card_last4, card_brand, refunded_cents, created_at
            ) VALUES (
                ?1, ?2, ?3, ?4,
                ?5, ?6, ?7, ?8, ?9,
                ?10, ?11, ?12, ?13,
                ?14, ?15, ?16, ?17, ?18
            )
            "#,
        )
        .bind(&tx.id)
        .bind(&tx.idempotency_key)
        .bind(tx.payment_method)
        .bind(tx.status)
        .bind(tx.total_cents)
        .bind(tx.subtotal_cents)
        .bind(tx.tax_cents)
        .bind(tx.discount_cents)
        .bind(tx.loyalty_discount_cents)
        .bind(tx.is_split_payment)
        .bind(&tx.shift_id)
        .bind(&tx.customer_id)
        .bind(&tx.gift_card_id)
        .bind(&tx.gateway_payment_id)
        .bind(&tx.card_last4)
        .bind(&tx.card_brand)
        .bind(tx.refunded_cents)
        .bind(tx.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<Transaction>> {
        let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = ?1");

        let tx = sqlx::query_as::<_, Transaction>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(tx)
    }

    pub async fn find_by_idempotency_key(&self, key: &str) -> DbResult<Option<Transaction>> {
        let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE idempotency_key = ?1");

        let tx = sqlx::query_as::<_, Transaction>(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(tx)
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transactions")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    // =========================================================================
    // Items
    // =========================================================================

    pub async fn insert_item(&self, item: &TransactionItem) -> DbResult<()> {
        debug!(transaction_id = %item.transaction_id, quantity = item.quantity, "Inserting transaction item");

        sqlx::query(
            r#"
            INSERT INTO transaction_items (
                id, transaction_id, service_id, inventory_id,
                quantity, price_cents, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&item.id)
        .bind(&item.transaction_id)
        .bind(&item.service_id)
        .bind(&item.inventory_id)
        .bind(item.quantity)
        .bind(item.price_cents)
        .bind(item.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_items(&self, transaction_id: &str) -> DbResult<Vec<TransactionItem>> {
        let items = sqlx::query_as::<_, TransactionItem>(
            r#"
            SELECT id, transaction_id, service_id, inventory_id, quantity, price_cents, created_at
            FROM transaction_items
            WHERE transaction_id = ?1
            ORDER BY created_at, id
            "#,
        )
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    // =========================================================================
    // Splits
    // =========================================================================

    pub async fn insert_split(&self, split: &PaymentSplitRecord) -> DbResult<()> {
        debug!(
            transaction_id = %split.transaction_id,
            method = %split.method,
            amount = %split.amount(),
            "Inserting payment split"
        );

        sqlx::query(
            r#"
            INSERT INTO payment_splits (
                id, transaction_id, method, amount_cents, gift_card_id, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&split.id)
        .bind(&split.transaction_id)
        .bind(split.method)
        .bind(split.amount_cents)
        .bind(&split.gift_card_id)
        .bind(split.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_splits(&self, transaction_id: &str) -> DbResult<Vec<PaymentSplitRecord>> {
        let splits = sqlx::query_as::<_, PaymentSplitRecord>(
            r#"
            SELECT id, transaction_id, method, amount_cents, gift_card_id, created_at
            FROM payment_splits
            WHERE transaction_id = ?1
            ORDER BY created_at, id
            "#,
        )
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(splits)
    }

    // =========================================================================
    // Refunds (written by the refund collaborator)
    // =========================================================================

    /// Adds `amount` to `refunded_cents` and moves the status accordingly.
    pub async fn record_refund(&self, id: &str, amount: Money) -> DbResult<()> {
        debug!(id = %id, amount = %amount, "Recording refund");

        let result = sqlx::query(
            r#"
            UPDATE transactions SET
                refunded_cents = refunded_cents + ?2,
                status = CASE
                    WHEN refunded_cents + ?2 >= total_cents THEN 'refunded'
                    ELSE 'partially_refunded'
                END
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(amount.cents())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Transaction", id));
        }

        Ok(())
    }

    /// Split legs with the transaction's refunds prorated across them.
    ///
    /// For display and reporting only; nothing is written.
    pub async fn split_breakdown(&self, id: &str) -> DbResult<Vec<ProratedLeg>> {
        let tx = self
            .get_by_id(id)
            .await?
            .ok_or_else(|| DbError::not_found("Transaction", id))?;

        let legs: Vec<SplitPayment> = self
            .get_splits(id)
            .await?
            .into_iter()
            .map(|s| SplitPayment {
                method: s.method,
                amount: s.amount(),
                gift_card_id: s.gift_card_id,
            })
            .collect();

        Ok(prorate_refund(&legs, tx.refunded()))
    }
}

/// Generates a new record ID.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}
