//! # Inventory Guard
//!
//! Stock checks before any write, and the decrement after the transaction
//! row lands.
//!
//! ## Oversell Protection
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  validate_availability(cart)          (Validating, no writes)           │
//! │    shampoo × 2 + shampoo × 1 ──► requested 3                            │
//! │    SELECT stock ──► 2  ──► InsufficientStock { 2, 3 }                   │
//! │                                                                         │
//! │  decrement(item, qty)                 (Writing)                         │
//! │    UPDATE ... SET stock = stock - qty WHERE stock >= qty                │
//! │    0 rows ──► another register sold it first: Ok(false)                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use tracing::{debug, warn};

use meridian_core::{CartItem, CoreError};
use meridian_db::InventoryRepository;

use crate::error::SettlementResult;

#[derive(Debug, Clone)]
pub struct InventoryGuard {
    repo: InventoryRepository,
}

impl InventoryGuard {
    pub fn new(repo: InventoryRepository) -> Self {
        InventoryGuard { repo }
    }

    /// Fails fast on the first inventory line the store cannot cover.
    ///
    /// Lines for the same item are summed first, so a cart with the item
    /// on two lines is checked against the total quantity.
    pub async fn validate_availability(&self, items: &[CartItem]) -> SettlementResult<()> {
        for (item_id, requested) in requested_quantities(items) {
            let available = self
                .repo
                .get_stock(item_id)
                .await?
                .ok_or_else(|| CoreError::ItemNotFound(item_id.to_string()))?;

            if requested > available {
                warn!(
                    item_id = %item_id,
                    available = available,
                    requested = requested,
                    "Rejecting checkout: insufficient stock"
                );
                return Err(CoreError::InsufficientStock {
                    item_id: item_id.to_string(),
                    available,
                    requested,
                }
                .into());
            }
        }

        debug!(lines = items.len(), "Inventory available");
        Ok(())
    }

    /// Decrements one item. `Ok(false)` means stock ran out after validation.
    pub async fn decrement(&self, item_id: &str, quantity: i64) -> SettlementResult<bool> {
        Ok(self.repo.decrement_stock(item_id, quantity).await?)
    }
}

/// Summed quantity per inventory item, in id order.
fn requested_quantities(items: &[CartItem]) -> BTreeMap<&str, i64> {
    let mut requested = BTreeMap::new();
    for item in items.iter().filter(|i| i.is_inventory()) {
        *requested.entry(item.id.as_str()).or_insert(0) += item.quantity;
    }
    requested
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SettlementError;
    use meridian_core::Money;
    use meridian_db::{Database, DbConfig};

    async fn guard_with_stock(stock: i64) -> (Database, InventoryGuard) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.inventory()
            .insert_item("inv-spray", "Texture Spray", None, 1575, stock)
            .await
            .unwrap();
        let guard = InventoryGuard::new(db.inventory());
        (db, guard)
    }

    #[tokio::test]
    async fn test_rejects_quantity_above_stock() {
        let (db, guard) = guard_with_stock(2).await;
        let cart = vec![CartItem::inventory("inv-spray", Money::from_cents(1575), 3)];

        let err = guard.validate_availability(&cart).await.unwrap_err();
        assert!(matches!(
            err,
            SettlementError::Core(CoreError::InsufficientStock {
                available: 2,
                requested: 3,
                ..
            })
        ));
        assert_eq!(db.inventory().get_stock("inv-spray").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_sums_repeated_lines() {
        let (_db, guard) = guard_with_stock(2).await;
        let cart = vec![
            CartItem::inventory("inv-spray", Money::from_cents(1575), 1),
            CartItem::service("svc-cut", Money::from_cents(4000), 5),
            CartItem::inventory("inv-spray", Money::from_cents(1575), 2),
        ];

        assert!(guard.validate_availability(&cart).await.is_err());
        assert!(guard.validate_availability(&cart[..2]).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_item() {
        let (_db, guard) = guard_with_stock(2).await;
        let cart = vec![CartItem::inventory("inv-ghost", Money::from_cents(100), 1)];

        let err = guard.validate_availability(&cart).await.unwrap_err();
        assert!(matches!(err, SettlementError::Core(CoreError::ItemNotFound(_))));
    }

    #[tokio::test]
    async fn test_decrement_never_goes_negative() {
        let (db, guard) = guard_with_stock(2).await;

        assert!(guard.decrement("inv-spray", 2).await.unwrap());
        assert!(!guard.decrement("inv-spray", 1).await.unwrap());
        assert_eq!(db.inventory().get_stock("inv-spray").await.unwrap(), Some(0));
    }
}
