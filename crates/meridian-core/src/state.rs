//! # Settlement State Machine
//!
//! Tracks one checkout from tender selection to a terminal state.
//!
//! ## States
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   Idle ──► MethodSelected ──► Validating ──► Writing ──► Settled        │
//! │    ▲              │               │             │                       │
//! │    └──────────────┴───────────────┤             │                       │
//! │        (abandon, no side effects) │             │                       │
//! │                                   ▼             ▼                       │
//! │                                 Failed ◄────────┘                       │
//! │                                                                         │
//! │   Validating → Failed : nothing persisted                               │
//! │   Writing    → Failed : the transaction row itself could not be written │
//! │   Abandoning is only possible before Writing.                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SettlementState {
    Idle,
    MethodSelected,
    Validating,
    Writing,
    Settled,
    Failed,
}

impl SettlementState {
    /// Whether `self → next` is a legal move.
    pub fn can_transition_to(&self, next: SettlementState) -> bool {
        use SettlementState::*;
        matches!(
            (self, next),
            (Idle, MethodSelected)
                | (MethodSelected, Validating)
                | (MethodSelected, Idle)
                | (Validating, Writing)
                | (Validating, Failed)
                | (Validating, Idle)
                | (Writing, Settled)
                | (Writing, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SettlementState::Settled | SettlementState::Failed)
    }

    /// True once a write may have happened.
    pub fn has_side_effects(&self) -> bool {
        matches!(self, SettlementState::Writing | SettlementState::Settled)
    }
}

impl fmt::Display for SettlementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SettlementState::Idle => "idle",
            SettlementState::MethodSelected => "method_selected",
            SettlementState::Validating => "validating",
            SettlementState::Writing => "writing",
            SettlementState::Settled => "settled",
            SettlementState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// The state of a single checkout, with the path it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementFlow {
    state: SettlementState,
    history: Vec<SettlementState>,
}

impl SettlementFlow {
    pub fn new() -> Self {
        SettlementFlow {
            state: SettlementState::Idle,
            history: vec![SettlementState::Idle],
        }
    }

    pub fn state(&self) -> SettlementState {
        self.state
    }

    pub fn history(&self) -> &[SettlementState] {
        &self.history
    }

    /// Moves to `next`, rejecting illegal transitions.
    pub fn advance(&mut self, next: SettlementState) -> CoreResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Marks the flow failed from wherever it is, if that is legal.
    ///
    /// Returns false when the flow already finished or never started.
    pub fn fail(&mut self) -> bool {
        self.advance(SettlementState::Failed).is_ok()
    }

    /// Drops the checkout before any write.
    pub fn abandon(&mut self) -> CoreResult<()> {
        self.advance(SettlementState::Idle)
    }
}

impl Default for SettlementFlow {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use SettlementState::*;

    #[test]
    fn test_happy_path() {
        let mut flow = SettlementFlow::new();
        for next in [MethodSelected, Validating, Writing, Settled] {
            flow.advance(next).unwrap();
        }
        assert_eq!(flow.state(), Settled);
        assert_eq!(flow.history(), &[Idle, MethodSelected, Validating, Writing, Settled]);
    }

    #[test]
    fn test_validation_failure_skips_writing() {
        let mut flow = SettlementFlow::new();
        flow.advance(MethodSelected).unwrap();
        flow.advance(Validating).unwrap();
        assert!(flow.fail());
        assert!(!flow.history().contains(&Writing));
    }

    #[test]
    fn test_cannot_abandon_once_writing() {
        let mut flow = SettlementFlow::new();
        flow.advance(MethodSelected).unwrap();
        flow.advance(Validating).unwrap();
        flow.advance(Writing).unwrap();

        let err = flow.abandon().unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
        assert!(flow.state().has_side_effects());
    }

    #[test]
    fn test_terminal_states_are_final() {
        assert!(!Settled.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Writing));
        assert!(!Idle.can_transition_to(Writing));

        let mut flow = SettlementFlow::new();
        assert!(!flow.fail());
    }
}
