//! # Loyalty Repository
//!
//! Customers, loyalty programs, and the append-only loyalty ledger.
//!
//! ## Balance Ownership
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  loyalty_ledger  (authoritative)                                        │
//! │  ┌────────┬────────────────┬─────────┬──────────┬─────────┐             │
//! │  │ seq    │ transaction_id │ earned  │ redeemed │ balance │             │
//! │  ├────────┼────────────────┼─────────┼──────────┼─────────┤             │
//! │  │ 1      │ (opening)      │ 500     │          │ 500     │             │
//! │  │ 2      │ tx-a           │         │ 300      │ 200     │             │
//! │  │ 3      │ tx-b           │ 42      │          │ 242     │             │
//! │  └────────┴────────────────┴─────────┴──────────┴─────────┘             │
//! │                     │                                                   │
//! │                     │ refresh_cached_points: one UPDATE with Σ          │
//! │                     ▼                                                   │
//! │  customers.loyalty_points = 242   (cache for hot-path display)          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every append computes `points_balance` from the ledger sum inside the
//! INSERT itself, and redemptions only insert when the sum covers them.
//! Nothing else in the system writes these tables.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use meridian_core::{Customer, LoyaltyEntryType, LoyaltyLedgerEntry, LoyaltyProgram};

/// Raw `loyalty_programs` row; `points_per_dollar` is stored as TEXT.
#[derive(Debug, sqlx::FromRow)]
struct ProgramRow {
    id: String,
    points_per_dollar: String,
    minimum_points_redeem: i64,
    points_value_cents: i64,
    is_active: bool,
}

impl TryFrom<ProgramRow> for LoyaltyProgram {
    type Error = DbError;

    fn try_from(row: ProgramRow) -> DbResult<Self> {
        let points_per_dollar =
            Decimal::from_str(&row.points_per_dollar).map_err(|_| DbError::Decode {
                field: "points_per_dollar".to_string(),
                value: row.points_per_dollar.clone(),
            })?;

        Ok(LoyaltyProgram {
            id: row.id,
            points_per_dollar,
            minimum_points_redeem: row.minimum_points_redeem,
            points_value_cents: row.points_value_cents,
            is_active: row.is_active,
        })
    }
}

/// Repository for customers and the loyalty ledger.
#[derive(Debug, Clone)]
pub struct LoyaltyRepository {
    pool: SqlitePool,
}

impl LoyaltyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        LoyaltyRepository { pool }
    }

    // =========================================================================
    // Customers
    // =========================================================================

    pub async fn insert_customer(&self, id: &str, name: &str) -> DbResult<Customer> {
        debug!(id = %id, "Inserting customer");

        sqlx::query("INSERT INTO customers (id, name, loyalty_points, created_at) VALUES (?1, ?2, 0, ?3)")
            .bind(id)
            .bind(name)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(Customer {
            id: id.to_string(),
            name: name.to_string(),
            loyalty_points: 0,
        })
    }

    pub async fn get_customer(&self, id: &str) -> DbResult<Option<Customer>> {
        let customer = sqlx::query_as::<_, Customer>(
            "SELECT id, name, loyalty_points FROM customers WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(customer)
    }

    // =========================================================================
    // Programs
    // =========================================================================

    pub async fn insert_program(&self, program: &LoyaltyProgram) -> DbResult<()> {
        debug!(id = %program.id, "Inserting loyalty program");

        sqlx::query(
            r#"
            INSERT INTO loyalty_programs (
                id, points_per_dollar, minimum_points_redeem,
                points_value_cents, is_active, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&program.id)
        .bind(program.points_per_dollar.to_string())
        .bind(program.minimum_points_redeem)
        .bind(program.points_value_cents)
        .bind(program.is_active)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_program(&self, id: &str) -> DbResult<Option<LoyaltyProgram>> {
        let row = sqlx::query_as::<_, ProgramRow>(
            r#"
            SELECT id, points_per_dollar, minimum_points_redeem, points_value_cents, is_active
            FROM loyalty_programs
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(LoyaltyProgram::try_from).transpose()
    }

    /// The most recently created active program, if any.
    pub async fn active_program(&self) -> DbResult<Option<LoyaltyProgram>> {
        let row = sqlx::query_as::<_, ProgramRow>(
            r#"
            SELECT id, points_per_dollar, minimum_points_redeem, points_value_cents, is_active
            FROM loyalty_programs
            WHERE is_active = 1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(LoyaltyProgram::try_from).transpose()
    }

    // =========================================================================
    // Ledger
    // =========================================================================

    /// Authoritative balance: Σ(earned − redeemed) over the ledger.
    pub async fn ledger_balance(&self, customer_id: &str) -> DbResult<i64> {
        let balance: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(COALESCE(points_earned, 0) - COALESCE(points_redeemed, 0)), 0)
            FROM loyalty_ledger
            WHERE customer_id = ?1
            "#,
        )
        .bind(customer_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(balance)
    }

    /// Appends an earn entry. `transaction_id` is None for opening balances.
    pub async fn append_earn(
        &self,
        customer_id: &str,
        transaction_id: Option<&str>,
        points: i64,
    ) -> DbResult<LoyaltyLedgerEntry> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        debug!(customer_id = %customer_id, points = points, "Appending loyalty earn");

        let balance: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO loyalty_ledger (
                id, customer_id, transaction_id,
                points_earned, points_redeemed, points_balance,
                entry_type, created_at
            )
            SELECT ?1, ?2, ?3, ?4, NULL, b.bal + ?4, 'earn', ?5
            FROM (
                SELECT COALESCE(SUM(COALESCE(points_earned, 0) - COALESCE(points_redeemed, 0)), 0) AS bal
                FROM loyalty_ledger
                WHERE customer_id = ?2
            ) AS b
            RETURNING points_balance
            "#,
        )
        .bind(&id)
        .bind(customer_id)
        .bind(transaction_id)
        .bind(points)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(LoyaltyLedgerEntry {
            id,
            customer_id: customer_id.to_string(),
            transaction_id: transaction_id.map(str::to_string),
            points_earned: Some(points),
            points_redeemed: None,
            points_balance: balance,
            entry_type: LoyaltyEntryType::Earn,
            created_at: now,
        })
    }

    /// Appends a redeem entry if the ledger balance covers `points`.
    ///
    /// Returns None (and writes nothing) when it does not.
    pub async fn append_redeem(
        &self,
        customer_id: &str,
        transaction_id: &str,
        points: i64,
    ) -> DbResult<Option<LoyaltyLedgerEntry>> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        debug!(customer_id = %customer_id, points = points, "Appending loyalty redeem");

        let balance: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO loyalty_ledger (
                id, customer_id, transaction_id,
                points_earned, points_redeemed, points_balance,
                entry_type, created_at
            )
            SELECT ?1, ?2, ?3, NULL, ?4, b.bal - ?4, 'redeem', ?5
            FROM (
                SELECT COALESCE(SUM(COALESCE(points_earned, 0) - COALESCE(points_redeemed, 0)), 0) AS bal
                FROM loyalty_ledger
                WHERE customer_id = ?2
            ) AS b
            WHERE b.bal >= ?4
            RETURNING points_balance
            "#,
        )
        .bind(&id)
        .bind(customer_id)
        .bind(transaction_id)
        .bind(points)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(balance.map(|points_balance| LoyaltyLedgerEntry {
            id,
            customer_id: customer_id.to_string(),
            transaction_id: Some(transaction_id.to_string()),
            points_earned: None,
            points_redeemed: Some(points),
            points_balance,
            entry_type: LoyaltyEntryType::Redeem,
            created_at: now,
        }))
    }

    /// Overwrites `customers.loyalty_points` with the ledger sum.
    ///
    /// Returns the refreshed value.
    pub async fn refresh_cached_points(&self, customer_id: &str) -> DbResult<i64> {
        let points: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE customers SET loyalty_points = (
                SELECT COALESCE(SUM(COALESCE(points_earned, 0) - COALESCE(points_redeemed, 0)), 0)
                FROM loyalty_ledger
                WHERE customer_id = ?1
            )
            WHERE id = ?1
            RETURNING loyalty_points
            "#,
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        points.ok_or_else(|| DbError::not_found("Customer", customer_id))
    }

    /// Overwrites the cached points without touching the ledger.
    ///
    /// Only used to simulate drift in tests and data repair tooling.
    pub async fn set_cached_points(&self, customer_id: &str, points: i64) -> DbResult<()> {
        let result = sqlx::query("UPDATE customers SET loyalty_points = ?2 WHERE id = ?1")
            .bind(customer_id)
            .bind(points)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Customer", customer_id));
        }

        Ok(())
    }

    /// The entry of a given type a transaction posted, if any.
    pub async fn find_entry(
        &self,
        customer_id: &str,
        transaction_id: &str,
        entry_type: LoyaltyEntryType,
    ) -> DbResult<Option<LoyaltyLedgerEntry>> {
        let entry = sqlx::query_as::<_, LoyaltyLedgerEntry>(
            r#"
            SELECT id, customer_id, transaction_id, points_earned, points_redeemed,
                   points_balance, entry_type, created_at
            FROM loyalty_ledger
            WHERE customer_id = ?1 AND transaction_id = ?2 AND entry_type = ?3
            "#,
        )
        .bind(customer_id)
        .bind(transaction_id)
        .bind(entry_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(entry)
    }

    /// All entries for a customer, oldest first.
    pub async fn entries(&self, customer_id: &str) -> DbResult<Vec<LoyaltyLedgerEntry>> {
        let entries = sqlx::query_as::<_, LoyaltyLedgerEntry>(
            r#"
            SELECT id, customer_id, transaction_id, points_earned, points_redeemed,
                   points_balance, entry_type, created_at
            FROM loyalty_ledger
            WHERE customer_id = ?1
            ORDER BY seq ASC
            "#,
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    /// Entries created at or after `since` (reporting).
    pub async fn entries_since(
        &self,
        customer_id: &str,
        since: DateTime<Utc>,
    ) -> DbResult<Vec<LoyaltyLedgerEntry>> {
        let entries = sqlx::query_as::<_, LoyaltyLedgerEntry>(
            r#"
            SELECT id, customer_id, transaction_id, points_earned, points_redeemed,
                   points_balance, entry_type, created_at
            FROM loyalty_ledger
            WHERE customer_id = ?1 AND created_at >= ?2
            ORDER BY seq ASC
            "#,
        )
        .bind(customer_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};

    async fn setup() -> Database {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.loyalty().insert_customer("cust-1", "Avery").await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_ledger_balance_and_cache_refresh() {
        let db = setup().await;
        let repo = db.loyalty();

        let opening = repo.append_earn("cust-1", None, 500).await.unwrap();
        assert_eq!(opening.points_balance, 500);
        assert_eq!(repo.ledger_balance("cust-1").await.unwrap(), 500);

        // cache is only written by refresh
        assert_eq!(repo.get_customer("cust-1").await.unwrap().unwrap().loyalty_points, 0);
        assert_eq!(repo.refresh_cached_points("cust-1").await.unwrap(), 500);
        assert_eq!(repo.get_customer("cust-1").await.unwrap().unwrap().loyalty_points, 500);
    }

    #[tokio::test]
    async fn test_redeem_never_overdraws() {
        let db = setup().await;
        let repo = db.loyalty();
        repo.append_earn("cust-1", None, 100).await.unwrap();

        sqlx::query(
            "INSERT INTO transactions (id, idempotency_key, payment_method, total_cents, subtotal_cents, tax_cents, created_at) VALUES ('tx-1', 'k-1', 'cash', 0, 0, 0, '2026-10-18T10:00:00+00:00')",
        )
        .execute(db.pool())
        .await
        .unwrap();

        assert!(repo.append_redeem("cust-1", "tx-1", 150).await.unwrap().is_none());
        let entry = repo.append_redeem("cust-1", "tx-1", 60).await.unwrap().unwrap();
        assert_eq!(entry.points_balance, 40);

        // a second redeem for the same transaction is rejected
        let err = repo.append_redeem("cust-1", "tx-1", 10).await.unwrap_err();
        assert!(err.is_unique_violation());

        let found = repo
            .find_entry("cust-1", "tx-1", LoyaltyEntryType::Redeem)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.points_redeemed, Some(60));
        assert_eq!(repo.entries("cust-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_program_round_trips_decimal_rate() {
        let db = setup().await;
        let program = LoyaltyProgram {
            id: "prog-1".into(),
            points_per_dollar: Decimal::new(15, 1),
            minimum_points_redeem: 100,
            points_value_cents: 1,
            is_active: true,
        };
        db.loyalty().insert_program(&program).await.unwrap();

        let active = db.loyalty().active_program().await.unwrap().unwrap();
        assert_eq!(active, program);
    }
}
