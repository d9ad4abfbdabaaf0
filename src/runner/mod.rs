//! Intent runner: walks the wallet book, executes intents serially and
//! applies pacing
//!
//! A cycle is one slot per wallet. An abandoned intent ends its wallet's slot
//! early; the runner waits one short delay and moves on.

mod pacing;
mod tasks;

pub use pacing::Pacing;
pub use tasks::TaskSource;

use crate::config::{ChainConfig, RunnerConfig};
use crate::error::DriverResult;
use crate::intent::Intent;
use crate::shutdown::Shutdown;
use crate::state::SubmissionJournal;
use crate::tx::{AbandonReason, Outcome, OutcomeStatus, TransactionDriver};
use crate::wallet::WalletBook;

use ethers::types::{Address, U256};
use ethers::utils::format_ether;
use tracing::{error, info, warn};

/// Domain code that turns a wallet's slot into intents
pub trait IntentSource: Send {
    /// Called when a wallet's slot starts
    fn begin_slot(&mut self, wallet: Address);

    /// Next intent for the slot; `None` ends it
    fn next_intent(&mut self, wallet: Address) -> DriverResult<Option<Intent>>;
}

/// Totals over a run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub cycles: u64,
    pub confirmed: u64,
    pub reverted: u64,
    pub abandoned: u64,
    /// Reissued intents still waiting for a wallet when the run stopped
    pub dropped: u64,
    pub gas_spent: U256,
}

impl RunReport {
    fn tally(&mut self, outcome: &Outcome) {
        match outcome.status {
            OutcomeStatus::Confirmed { .. } => self.confirmed += 1,
            OutcomeStatus::RevertedOnChain { .. } => self.reverted += 1,
            OutcomeStatus::Abandoned(_) => self.abandoned += 1,
        }
    }
}

pub struct IntentRunner {
    driver: TransactionDriver,
    wallets: WalletBook,
    source: Box<dyn IntentSource>,
    journal: Box<dyn SubmissionJournal>,
    pacing: Pacing,
    config: RunnerConfig,
    chain: ChainConfig,
    shutdown: Shutdown,
}

impl IntentRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        driver: TransactionDriver,
        wallets: WalletBook,
        source: Box<dyn IntentSource>,
        journal: Box<dyn SubmissionJournal>,
        pacing: Pacing,
        config: RunnerConfig,
        chain: ChainConfig,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            driver,
            wallets,
            source,
            journal,
            pacing,
            config,
            chain,
            shutdown,
        }
    }

    /// Execute one intent from the current wallet and report it
    pub async fn run(&mut self, intent: &Intent) -> DriverResult<Outcome> {
        let wallet = self.wallets.current_mut();
        let outcome = self
            .driver
            .execute(intent, wallet, self.journal.as_mut())
            .await?;

        if let Err(e) = self.journal.resolved(intent, &outcome) {
            warn!("Failed to journal outcome of {}: {}", intent.label, e);
        }
        crate::metrics::record_intent(outcome.status.label());
        self.report(intent, &outcome);

        if let Err(e) = self.journal.checkpoint() {
            warn!("Failed to write state file: {}", e);
        }
        Ok(outcome)
    }

    /// Loop over wallets until `max_cycles` is reached or shutdown
    pub async fn run_cycles(&mut self) -> DriverResult<RunReport> {
        let mut report = RunReport::default();
        let mut carried: Option<Intent> = None;
        let mut cycle_start_spend = self.driver.gas_spent();

        info!(
            "Runner started on {} with {} wallet(s)",
            self.chain.name,
            self.wallets.len()
        );

        loop {
            self.shutdown.check()?;

            let (index, address) = {
                let wallet = self.wallets.current();
                (wallet.index(), wallet.address())
            };
            info!("Wallet #{} ({:?}) slot started", index, address);
            self.source.begin_slot(address);

            let mut abandoned = false;
            let mut first = true;
            loop {
                let (intent, reissued) = match carried.take() {
                    Some(intent) => {
                        info!("Wallet #{} picks up reissued {}", index, intent.describe());
                        (intent, true)
                    }
                    None => match self.source.next_intent(address)? {
                        Some(intent) => (intent, false),
                        None => break,
                    },
                };

                if !first {
                    self.pacing.intra_intent().await?;
                }
                first = false;

                let outcome = self.run(&intent).await?;
                report.tally(&outcome);

                if let OutcomeStatus::Abandoned(reason) = &outcome.status {
                    if self.config.reissue_on_insufficient_funds
                        && *reason == AbandonReason::InsufficientFunds
                        && self.wallets.len() > 1
                        && !reissued
                    {
                        carried = Some(intent.reissued());
                    }
                    abandoned = true;
                    break;
                }
            }

            if abandoned {
                info!("Wallet #{} skipped for the rest of this cycle", index);
                self.pacing.intra_intent().await?;
            }

            if self.wallets.advance() {
                report.cycles += 1;
                report.gas_spent = self.driver.gas_spent();
                self.cycle_summary(&report, cycle_start_spend);
                cycle_start_spend = self.driver.gas_spent();

                crate::metrics::record_cycle();
                self.journal.cycle_completed();
                if let Err(e) = self.journal.checkpoint() {
                    warn!("Failed to write state file: {}", e);
                }

                if self.config.max_cycles > 0 && report.cycles >= self.config.max_cycles {
                    if let Some(intent) = carried.take() {
                        warn!(
                            "Reissued {} ({}) dropped: run stopped before another wallet took it",
                            intent.describe(),
                            intent.id
                        );
                        report.dropped += 1;
                    }
                    info!("Completed {} cycle(s), stopping", report.cycles);
                    break;
                }
                self.pacing.inter_cycle().await?;
            } else if !abandoned {
                self.pacing.inter_wallet().await?;
            }
        }

        Ok(report)
    }

    fn report(&self, intent: &Intent, outcome: &Outcome) {
        let symbol = &self.chain.native_symbol;

        match &outcome.status {
            OutcomeStatus::Confirmed { receipt, cost } => {
                info!(
                    status = "success",
                    "Wallet #{} {} confirmed: {:?} in block {:?}, gas {}, cost {} {}, total {} {}",
                    outcome.wallet,
                    intent.describe(),
                    receipt.tx_hash,
                    receipt.block_number,
                    receipt.gas_used,
                    format_ether(*cost),
                    symbol,
                    format_ether(self.driver.gas_spent()),
                    symbol
                );
                if let Some(base) = &self.chain.explorer_tx_url {
                    info!("Explorer: {}{:?}", base, receipt.tx_hash);
                }
            }
            OutcomeStatus::RevertedOnChain { receipt, .. } => {
                error!(
                    "Wallet #{} {} reverted on chain: {:?} in block {:?}",
                    outcome.wallet,
                    intent.describe(),
                    receipt.tx_hash,
                    receipt.block_number
                );
            }
            OutcomeStatus::Abandoned(reason) => {
                error!(
                    "Wallet #{} abandoned {} after {} attempt(s): {}",
                    outcome.wallet,
                    intent.describe(),
                    outcome.attempts.len(),
                    reason
                );
            }
        }
    }

    fn cycle_summary(&self, report: &RunReport, cycle_start_spend: U256) {
        let symbol = &self.chain.native_symbol;
        let spent = report.gas_spent.saturating_sub(cycle_start_spend);

        info!(
            target: "gas_report",
            "Cycle {} done: {} confirmed, {} reverted, {} abandoned; gas {} {}, total {} {}",
            report.cycles,
            report.confirmed,
            report.reverted,
            report.abandoned,
            format_ether(spent),
            symbol,
            format_ether(report.gas_spent),
            symbol
        );
        for wallet in self.wallets.wallets() {
            info!(
                target: "gas_report",
                "Wallet #{} {:?} next nonce {:?}, {} unconfirmed, last signed {:?} ago",
                wallet.index(),
                wallet.address(),
                wallet.nonce_cache().current(),
                wallet.nonce_cache().pending_count(),
                wallet.last_used().map(|t| t.elapsed())
            );
        }
        for endpoint in self.driver.pool().status() {
            info!(
                target: "gas_report",
                "Endpoint {}: {} consecutive failure(s), eligible {}",
                endpoint.url,
                endpoint.consecutive_failures,
                endpoint.eligible
            );
        }
    }
}
