//! # Barcode Cache
//!
//! Scanned barcodes resolved to inventory items, owned by one register
//! session and dropped with it.
//!
//! ```text
//! RegisterSession::open(shift)
//!     │
//!     ├── lookup_barcode("590…059") ──► miss ──► inventory_items ──► cached
//!     ├── lookup_barcode("590…059") ──► hit
//!     ├── invalidate_item("inv-spray")   (price or stock edited)
//!     │
//! RegisterSession::close()  ──► cache cleared
//! ```
//!
//! Stock in a cached item is a snapshot for display. Checkouts always
//! re-read stock through the inventory guard.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use meridian_core::{InventoryItem, Shift};
use meridian_db::InventoryRepository;

use crate::error::SettlementResult;

#[derive(Debug, Default)]
pub struct BarcodeCache {
    items: HashMap<String, InventoryItem>,
    hits: u64,
    misses: u64,
}

impl BarcodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached item for `barcode`, loading it on a miss.
    ///
    /// Unknown and inactive barcodes are not cached.
    pub async fn get_or_load(
        &mut self,
        repo: &InventoryRepository,
        barcode: &str,
    ) -> SettlementResult<Option<InventoryItem>> {
        if let Some(item) = self.items.get(barcode) {
            self.hits += 1;
            return Ok(Some(item.clone()));
        }

        self.misses += 1;
        let loaded = repo.get_by_barcode(barcode).await?.filter(|i| i.is_active);
        if let Some(item) = &loaded {
            debug!(barcode = %barcode, item_id = %item.id, "Barcode cached");
            self.items.insert(barcode.to_string(), item.clone());
        }
        Ok(loaded)
    }

    pub fn invalidate(&mut self, barcode: &str) -> bool {
        self.items.remove(barcode).is_some()
    }

    /// Drops every barcode that points at `item_id`.
    pub fn invalidate_item(&mut self, item_id: &str) -> usize {
        let before = self.items.len();
        self.items.retain(|_, item| item.id != item_id);
        before - self.items.len()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.hits = 0;
        self.misses = 0;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

/// One register's working session, scoped to a shift.
#[derive(Debug)]
pub struct RegisterSession {
    pub id: String,
    pub shift: Shift,
    pub started_at: DateTime<Utc>,
    barcodes: BarcodeCache,
    inventory: InventoryRepository,
}

impl RegisterSession {
    pub fn open(id: impl Into<String>, shift: Shift, inventory: InventoryRepository) -> Self {
        let session = RegisterSession {
            id: id.into(),
            shift,
            started_at: Utc::now(),
            barcodes: BarcodeCache::new(),
            inventory,
        };
        info!(session_id = %session.id, shift_id = %session.shift.id, "Register session opened");
        session
    }

    pub async fn lookup_barcode(&mut self, barcode: &str) -> SettlementResult<Option<InventoryItem>> {
        self.barcodes.get_or_load(&self.inventory, barcode).await
    }

    pub fn barcodes(&mut self) -> &mut BarcodeCache {
        &mut self.barcodes
    }

    /// Ends the session and forgets every cached barcode.
    pub fn close(mut self) {
        let cached = self.barcodes.len();
        self.barcodes.clear();
        info!(session_id = %self.id, cached = cached, "Register session closed");
    }
}
