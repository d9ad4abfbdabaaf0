//! Persisted run state
//!
//! Handles:
//! - Submission journaling for restart recovery
//! - Last known good transaction hash
//! - Per-error-class counters
//! - Atomic JSON rewrite after each runner step

mod store;

pub use store::{PendingEntry, PersistedState, StateStore, TerminalEntry};

use crate::error::DriverResult;
use crate::intent::Intent;
use crate::tx::Outcome;

use ethers::types::{Address, H256};

/// Sink for the driver's and runner's progress
pub trait SubmissionJournal: Send {
    /// A node accepted `tx_hash` for `intent`
    fn submitted(
        &mut self,
        intent: &Intent,
        wallet: Address,
        nonce: u64,
        tx_hash: H256,
    ) -> DriverResult<()>;

    /// `intent` reached a terminal outcome
    fn resolved(&mut self, intent: &Intent, outcome: &Outcome) -> DriverResult<()>;

    /// Count one non-success attempt result
    fn record_error(&mut self, class: &str);

    /// The wallet book wrapped
    fn cycle_completed(&mut self) {}

    /// Make everything recorded so far durable
    fn checkpoint(&mut self) -> DriverResult<()>;
}

/// Journal that keeps nothing; used when no state file is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NullJournal;

impl SubmissionJournal for NullJournal {
    fn submitted(&mut self, _: &Intent, _: Address, _: u64, _: H256) -> DriverResult<()> {
        Ok(())
    }

    fn resolved(&mut self, _: &Intent, _: &Outcome) -> DriverResult<()> {
        Ok(())
    }

    fn record_error(&mut self, _: &str) {}

    fn checkpoint(&mut self) -> DriverResult<()> {
        Ok(())
    }
}
