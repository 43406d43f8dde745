//! # Settlement Context
//!
//! The store handle, configuration and the three ledgers every handler
//! works through.

use std::sync::Arc;

use meridian_db::Database;

use crate::config::SettlementConfig;
use crate::gift_card::GiftCardLedger;
use crate::inventory::InventoryGuard;
use crate::loyalty::LoyaltyEngine;

/// Shared collaborators for one register. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct SettlementContext {
    db: Database,
    config: Arc<SettlementConfig>,
    inventory: InventoryGuard,
    loyalty: LoyaltyEngine,
    gift_cards: GiftCardLedger,
}

impl SettlementContext {
    pub fn new(db: Database, config: SettlementConfig) -> Self {
        SettlementContext {
            inventory: InventoryGuard::new(db.inventory()),
            loyalty: LoyaltyEngine::new(db.loyalty()),
            gift_cards: GiftCardLedger::new(db.gift_cards(), config.ledger.duplicate_window_secs),
            config: Arc::new(config),
            db,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &SettlementConfig {
        &self.config
    }

    pub fn inventory(&self) -> &InventoryGuard {
        &self.inventory
    }

    pub fn loyalty(&self) -> &LoyaltyEngine {
        &self.loyalty
    }

    pub fn gift_cards(&self) -> &GiftCardLedger {
        &self.gift_cards
    }
}
