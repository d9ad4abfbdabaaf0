//! Per-intent state machine

use crate::error::{DriverError, DriverResult};

use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IntentState {
    Building,
    Submitted,
    WaitingReceipt,
    Confirmed,
    RevertedOnChain,
    Retryable,
    Abandoned,
}

impl IntentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntentState::Confirmed | IntentState::RevertedOnChain | IntentState::Abandoned
        )
    }

    pub fn can_transition_to(&self, next: IntentState) -> bool {
        use IntentState::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Building, Submitted)
                | (Building, Retryable)
                | (Building, Abandoned)
                | (Submitted, WaitingReceipt)
                | (Submitted, Retryable)
                | (Submitted, Abandoned)
                // Timeout replacement at the same nonce
                | (WaitingReceipt, Submitted)
                | (WaitingReceipt, Confirmed)
                | (WaitingReceipt, RevertedOnChain)
                | (WaitingReceipt, Retryable)
                | (Retryable, Building)
                | (Retryable, Abandoned)
                // An earlier submission turned up mined
                | (Retryable, Confirmed)
                | (Retryable, RevertedOnChain)
        )
    }
}

/// Tracks one intent's state and rejects illegal moves
#[derive(Debug)]
pub struct IntentMachine {
    state: IntentState,
}

impl IntentMachine {
    pub fn new() -> Self {
        Self {
            state: IntentState::Building,
        }
    }

    pub fn state(&self) -> IntentState {
        self.state
    }

    pub fn transition(&mut self, next: IntentState) -> DriverResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(DriverError::InvalidStateTransition {
                from: format!("{:?}", self.state),
                to: format!("{:?}", next),
            });
        }
        debug!("Intent state {:?} -> {:?}", self.state, next);
        self.state = next;
        Ok(())
    }

    /// Enter `Retryable` unless already there
    pub fn retry(&mut self) -> DriverResult<()> {
        if self.state == IntentState::Retryable {
            return Ok(());
        }
        self.transition(IntentState::Retryable)
    }

    /// Enter `Building` for a fresh attempt
    pub fn rebuild(&mut self) -> DriverResult<()> {
        if self.state == IntentState::Building {
            return Ok(());
        }
        self.transition(IntentState::Building)
    }
}

impl Default for IntentMachine {
    fn default() -> Self {
        Self::new()
    }
}
