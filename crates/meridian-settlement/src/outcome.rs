//! # Settlement Outcome
//!
//! What a settled checkout reports back to the register.

use serde::Serialize;

use meridian_core::loyalty::Redemption;
use meridian_core::{GiftCardLedgerEntry, Money, OutboxKind, Receipt, Transaction};

/// A post-commit step that failed.
///
/// The transaction is on record; the step was queued in the settlement
/// outbox (`outbox_id`) unless the outbox write failed too.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialWrite {
    pub step: OutboxKind,
    pub message: String,
    pub outbox_id: Option<String>,
}

/// Result of a checkout that reached `Settled`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementOutcome {
    pub transaction: Transaction,
    /// None when the receipt stub could not be created (see `warnings`).
    pub receipt: Option<Receipt>,
    /// Cash owed back to the customer.
    pub change_due: Option<Money>,
    pub redemption: Option<Redemption>,
    pub points_earned: i64,
    pub gift_card_entries: Vec<GiftCardLedgerEntry>,
    pub warnings: Vec<PartialWrite>,
}

impl SettlementOutcome {
    pub fn transaction_id(&self) -> &str {
        &self.transaction.id
    }

    /// True when every step was written.
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn has_warning(&self, step: OutboxKind) -> bool {
        self.warnings.iter().any(|w| w.step == step)
    }
}
