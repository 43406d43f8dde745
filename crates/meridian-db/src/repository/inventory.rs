//! # Inventory Repository
//!
//! Stock lookups and signed-delta stock adjustments.
//!
//! ## Why Signed Deltas
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  READ-THEN-WRITE (never used)         SIGNED DELTA (this module)        │
//! │  ─────────────────────────────        ────────────────────────────────  │
//! │  A: read stock = 2                    A: UPDATE ... SET q = q - 1       │
//! │  B: read stock = 2                    B: UPDATE ... SET q = q - 1       │
//! │  A: write 1                                                             │
//! │  B: write 1   ← one sale lost         SQLite serializes the two writes  │
//! │                                       → q = 0                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Decrements are additionally guarded with `stock_quantity >= qty` in the
//! same statement, so two registers racing for the last unit cannot drive
//! the count negative.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use meridian_core::InventoryItem;

/// Repository for inventory stock operations.
#[derive(Debug, Clone)]
pub struct InventoryRepository {
    pool: SqlitePool,
}

impl InventoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        InventoryRepository { pool }
    }

    /// Inserts a stock-tracked item (catalog import, seeding, tests).
    pub async fn insert_item(
        &self,
        id: &str,
        name: &str,
        barcode: Option<&str>,
        price_cents: i64,
        stock_quantity: i64,
    ) -> DbResult<InventoryItem> {
        debug!(id = %id, stock = stock_quantity, "Inserting inventory item");

        let item = InventoryItem {
            id: id.to_string(),
            name: name.to_string(),
            barcode: barcode.map(str::to_string),
            price_cents,
            stock_quantity,
            is_active: true,
            updated_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO inventory_items (
                id, name, barcode, price_cents, stock_quantity, is_active, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&item.id)
        .bind(&item.name)
        .bind(&item.barcode)
        .bind(item.price_cents)
        .bind(item.stock_quantity)
        .bind(item.is_active)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(item)
    }

    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<InventoryItem>> {
        let item = sqlx::query_as::<_, InventoryItem>(
            r#"
            SELECT id, name, barcode, price_cents, stock_quantity, is_active, updated_at
            FROM inventory_items
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(item)
    }

    /// Looks up an active item by barcode (scanner input).
    pub async fn get_by_barcode(&self, barcode: &str) -> DbResult<Option<InventoryItem>> {
        let item = sqlx::query_as::<_, InventoryItem>(
            r#"
            SELECT id, name, barcode, price_cents, stock_quantity, is_active, updated_at
            FROM inventory_items
            WHERE barcode = ?1 AND is_active = 1
            "#,
        )
        .bind(barcode)
        .fetch_optional(&self.pool)
        .await?;

        Ok(item)
    }

    /// Current stock of an active item, or None when it no longer exists.
    pub async fn get_stock(&self, id: &str) -> DbResult<Option<i64>> {
        let stock: Option<i64> = sqlx::query_scalar(
            "SELECT stock_quantity FROM inventory_items WHERE id = ?1 AND is_active = 1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(stock)
    }

    /// Decrements stock by `quantity` in one conditional statement.
    ///
    /// ## Returns
    /// * `Ok(true)` - applied
    /// * `Ok(false)` - the item exists but has less than `quantity` left
    /// * `Err(NotFound)` - no such item
    pub async fn decrement_stock(&self, id: &str, quantity: i64) -> DbResult<bool> {
        debug!(id = %id, quantity = quantity, "Decrementing stock");

        let result = sqlx::query(
            r#"
            UPDATE inventory_items SET
                stock_quantity = stock_quantity - ?2,
                updated_at = ?3
            WHERE id = ?1 AND stock_quantity >= ?2
            "#,
        )
        .bind(id)
        .bind(quantity)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        match self.get_by_id(id).await? {
            Some(_) => Ok(false),
            None => Err(DbError::not_found("InventoryItem", id)),
        }
    }

    /// Adjusts stock by a signed delta without a floor (receiving, counts).
    pub async fn adjust_stock(&self, id: &str, delta: i64) -> DbResult<()> {
        debug!(id = %id, delta = delta, "Adjusting stock");

        let result = sqlx::query(
            r#"
            UPDATE inventory_items SET
                stock_quantity = stock_quantity + ?2,
                updated_at = ?3
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(delta)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("InventoryItem", id));
        }

        Ok(())
    }

    /// Marks an item inactive. It stops resolving for checkouts.
    pub async fn deactivate(&self, id: &str) -> DbResult<()> {
        let result = sqlx::query("UPDATE inventory_items SET is_active = 0, updated_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("InventoryItem", id));
        }

        Ok(())
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM inventory_items")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use crate::{Database, DbConfig};

    #[tokio::test]
    async fn test_decrement_is_floored_at_zero() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.inventory();
        repo.insert_item("inv-1", "Conditioner", Some("5900000000011"), 1499, 2).await.unwrap();

        assert!(repo.decrement_stock("inv-1", 2).await.unwrap());
        assert!(!repo.decrement_stock("inv-1", 1).await.unwrap());
        assert_eq!(repo.get_stock("inv-1").await.unwrap(), Some(0));

        let err = repo.decrement_stock("missing", 1).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_adjust_and_lookup() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.inventory();
        repo.insert_item("inv-1", "Conditioner", Some("5900000000011"), 1499, 2).await.unwrap();

        repo.adjust_stock("inv-1", 10).await.unwrap();
        assert_eq!(repo.get_stock("inv-1").await.unwrap(), Some(12));

        let by_barcode = repo.get_by_barcode("5900000000011").await.unwrap().unwrap();
        assert_eq!(by_barcode.id, "inv-1");

        repo.deactivate("inv-1").await.unwrap();
        assert_eq!(repo.get_stock("inv-1").await.unwrap(), None);
        assert_eq!(repo.count().await.unwrap(), 1);
    }
}
