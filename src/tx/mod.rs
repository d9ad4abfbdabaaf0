//! Transaction execution: fee quoting, gas estimation, error classification
//! and the per-intent retry loop

mod classify;
mod driver;
mod fees;
mod gas;
mod state;

pub use driver::{AbandonReason, Outcome, OutcomeStatus, TransactionDriver};
pub use fees::{FeeEnvelope, FeeMode, FeeOracle};
pub use gas::GasEstimator;
