//! Transaction driver: builds, signs, submits, waits for and retries one
//! intent until it is confirmed, reverted or abandoned
//!
//! Handles:
//! - Endpoint rotation on transport failures, keeping nonce and fee
//! - Fee escalation on underpriced rejections and receipt timeouts
//! - Nonce refresh on nonce-class rejections
//! - Stuck-nonce replacement with a 0-value self-transfer
//! - Same-nonce replacement when a receipt does not show up in time

use super::classify::{classify, is_already_known, AttemptResult};
use super::fees::{FeeEnvelope, FeeOracle};
use super::gas::GasEstimator;
use super::state::{IntentMachine, IntentState};
use crate::chain::{ChainRpc, EndpointPool, FailureReason, Lease, Receipt, RpcFailure};
use crate::config::DriverConfig;
use crate::error::{DriverError, DriverResult};
use crate::intent::{self_transfer, Intent};
use crate::shutdown::Shutdown;
use crate::state::SubmissionJournal;
use crate::wallet::{NonceView, Wallet};

use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use futures::future::join_all;
use rand::Rng;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Gas limit of a plain native transfer
const TRANSFER_GAS: u64 = 21_000;

/// One signed transaction that reached a node
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub index: u32,
    pub nonce: u64,
    pub fee: FeeEnvelope,
    pub gas_limit: u64,
    pub tx_hash: H256,
    pub endpoint: usize,
    pub accepted: bool,
    /// Classified rejection, if the node refused it
    pub rejection: Option<&'static str>,
    /// Same-nonce resubmission after a receipt timeout
    pub replacement: bool,
}

/// Why an intent was given up
#[derive(Debug, Clone, PartialEq)]
pub enum AbandonReason {
    InsufficientFunds,
    AttemptsExhausted { last: String },
}

impl std::fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbandonReason::InsufficientFunds => write!(f, "insufficient funds"),
            AbandonReason::AttemptsExhausted { last } => {
                write!(f, "attempts exhausted (last result: {})", last)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeStatus {
    Confirmed { receipt: Receipt, cost: U256 },
    RevertedOnChain { receipt: Receipt, cost: U256 },
    Abandoned(AbandonReason),
}

impl OutcomeStatus {
    pub fn label(&self) -> &'static str {
        match self {
            OutcomeStatus::Confirmed { .. } => "confirmed",
            OutcomeStatus::RevertedOnChain { .. } => "reverted",
            OutcomeStatus::Abandoned(_) => "abandoned",
        }
    }
}

/// Terminal result of one intent
#[derive(Debug, Clone)]
pub struct Outcome {
    pub intent_id: Uuid,
    pub wallet: usize,
    pub status: OutcomeStatus,
    pub attempts: Vec<AttemptRecord>,
    /// Self-transfer sent to unblock a stuck nonce, if any
    pub stuck_replacement: Option<H256>,
}

impl Outcome {
    pub fn receipt(&self) -> Option<&Receipt> {
        match &self.status {
            OutcomeStatus::Confirmed { receipt, .. }
            | OutcomeStatus::RevertedOnChain { receipt, .. } => Some(receipt),
            OutcomeStatus::Abandoned(_) => None,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self.status, OutcomeStatus::Confirmed { .. })
    }
}

/// Signed transaction ready to (re)submit
struct Prepared {
    tx: TypedTransaction,
    raw: Bytes,
    hash: H256,
    nonce: u64,
    fee: FeeEnvelope,
    gas_limit: u64,
    replacement: bool,
}

/// Mutable state of one intent execution
struct Run<'a> {
    intent: &'a Intent,
    machine: IntentMachine,
    lease: Lease,
    nonce: Option<u64>,
    fee_index: u32,
    last_fee: Option<FeeEnvelope>,
    /// Signed but never seen by a node (transport failure)
    prepared: Option<Prepared>,
    /// Hashes accepted for the current nonce that may still be mined
    outstanding: Vec<H256>,
    attempts: Vec<AttemptRecord>,
    /// Attempt units consumed against `max_attempts`
    units: u32,
    stuck_checked: bool,
    stuck_replacement: Option<H256>,
    last_class: &'static str,
}

impl<'a> Run<'a> {
    fn new(intent: &'a Intent, lease: Lease) -> Self {
        Self {
            intent,
            machine: IntentMachine::new(),
            lease,
            nonce: None,
            fee_index: 0,
            last_fee: None,
            prepared: None,
            outstanding: Vec::new(),
            attempts: Vec::new(),
            units: 0,
            stuck_checked: false,
            stuck_replacement: None,
            last_class: "none",
        }
    }

    fn client(&self) -> std::sync::Arc<dyn ChainRpc> {
        self.lease.client.clone()
    }

    /// A failure before anything was submitted
    fn pre_submit_failure(&mut self, failure: RpcFailure) -> AttemptResult {
        let result = classify(&failure);
        if !result.is_transport() {
            self.units += 1;
        }
        debug!("Pre-submit call failed: {}", failure);
        result
    }
}

/// Executes intents one at a time against an endpoint pool
pub struct TransactionDriver {
    pool: EndpointPool,
    fees: FeeOracle,
    gas: GasEstimator,
    config: DriverConfig,
    shutdown: Shutdown,
    /// Accumulated cost of confirmed transactions, in wei
    gas_spent: U256,
}

impl TransactionDriver {
    pub fn new(
        pool: EndpointPool,
        fees: FeeOracle,
        gas: GasEstimator,
        config: DriverConfig,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            pool,
            fees,
            gas,
            config,
            shutdown,
            gas_spent: U256::zero(),
        }
    }

    pub fn gas_spent(&self) -> U256 {
        self.gas_spent
    }

    /// Seed the running total, e.g. from persisted state
    pub fn set_gas_spent(&mut self, total: U256) {
        self.gas_spent = total;
    }

    pub fn pool(&self) -> &EndpointPool {
        &self.pool
    }

    /// Execute `intent` from `wallet` until it reaches a terminal outcome
    ///
    /// Transient failures are retried internally; only cancellation, a fatal
    /// endpoint condition or a signing failure return `Err`.
    pub async fn execute(
        &mut self,
        intent: &Intent,
        wallet: &mut Wallet,
        journal: &mut dyn SubmissionJournal,
    ) -> DriverResult<Outcome> {
        if intent.chain_id != self.pool.chain_id() {
            return Err(DriverError::Intent(format!(
                "intent {} targets chain {}, driver serves chain {}",
                intent.label,
                intent.chain_id,
                self.pool.chain_id()
            )));
        }

        let lease = self.pool.acquire().await?;
        let mut run = Run::new(intent, lease);

        info!(
            "Wallet #{} executing {} via endpoint #{}",
            wallet.index(),
            intent.describe(),
            run.lease.index
        );

        loop {
            self.shutdown.check()?;

            if run.machine.state() == IntentState::Retryable {
                if let Some(receipt) = self.find_receipt(&run).await {
                    info!(
                        "Earlier submission {:?} was mined, resolving intent",
                        receipt.tx_hash
                    );
                    return self.finish(run, wallet, receipt);
                }
                if run.units >= self.config.max_attempts {
                    let reason = AbandonReason::AttemptsExhausted {
                        last: run.last_class.to_string(),
                    };
                    return self.abandon(run, wallet, reason);
                }
                run.machine.rebuild()?;
            }

            let result = self.attempt(&mut run, wallet, journal).await?;

            match result {
                AttemptResult::Confirmed(receipt) | AttemptResult::RevertedOnChain(receipt) => {
                    return self.finish(run, wallet, receipt);
                }
                AttemptResult::InsufficientFunds => {
                    self.note_failure(&mut run, journal, &AttemptResult::InsufficientFunds);
                    return self.abandon(run, wallet, AbandonReason::InsufficientFunds);
                }
                other => {
                    self.note_failure(&mut run, journal, &other);
                    run.machine.retry()?;
                    self.respond(&mut run, other).await?;
                }
            }
        }
    }

    /// One pass of build, sign, submit and wait
    async fn attempt(
        &mut self,
        run: &mut Run<'_>,
        wallet: &mut Wallet,
        journal: &mut dyn SubmissionJournal,
    ) -> DriverResult<AttemptResult> {
        let nonce = match run.nonce {
            Some(nonce) => nonce,
            None => {
                let client = run.client();
                let view = match wallet.nonce_for(&*client).await {
                    Ok(view) => view,
                    Err(failure) => return Ok(run.pre_submit_failure(failure)),
                };
                if !run.stuck_checked {
                    run.stuck_checked = true;
                    if view.gap() > self.config.stuck_nonce_threshold {
                        self.replace_stuck(run, wallet, &view).await;
                    }
                }
                run.nonce = Some(view.next);
                view.next
            }
        };

        let prepared = match run.prepared.take() {
            Some(prepared) => prepared,
            None => match self.prepare(run, wallet, nonce).await? {
                Ok(prepared) => prepared,
                Err(result) => return Ok(result),
            },
        };

        let current = match self.submit(run, wallet, journal, prepared).await? {
            Ok(current) => current,
            Err(result) => return Ok(result),
        };

        if let Some(receipt) = self.wait_for_receipt(run).await? {
            return Ok(receipt_result(receipt));
        }

        if run.units >= self.config.max_attempts {
            return Ok(AttemptResult::TimeoutPending);
        }

        // Same nonce, higher fee: whichever of the two is mined resolves the intent
        warn!(
            "No receipt for {:?} after {}s, replacing at nonce {}",
            current.hash,
            self.receipt_timeout(run.intent).as_secs(),
            current.nonce
        );
        let replacement = self.prepare_replacement(run, wallet, &current)?;
        if let Err(result) = self.submit(run, wallet, journal, replacement).await? {
            return Ok(result);
        }

        match self.wait_for_receipt(run).await? {
            Some(receipt) => Ok(receipt_result(receipt)),
            None => Ok(AttemptResult::TimeoutPending),
        }
    }

    /// Quote, estimate, check balance and sign a fresh transaction
    async fn prepare(
        &mut self,
        run: &mut Run<'_>,
        wallet: &mut Wallet,
        nonce: u64,
    ) -> DriverResult<Result<Prepared, AttemptResult>> {
        let client = run.client();
        let intent = run.intent;

        let mut fee = match self
            .fees
            .quote(&*client, intent.fee_mode, run.fee_index)
            .await
        {
            Ok(fee) => fee,
            Err(failure) => return Ok(Err(run.pre_submit_failure(failure))),
        };
        if let Some(previous) = &run.last_fee {
            let raised = fee.ensure_above(previous);
            if raised != fee {
                debug!("Fee raised from {} to {} to stay above previous attempt", fee, raised);
            }
            fee = raised;
        }

        let mut tx = intent.build_transaction(wallet.address(), nonce, &fee, None);
        let gas_limit = self
            .gas
            .estimate(&*client, &tx, intent.fallback_gas, intent.gas_limit_range)
            .await;
        tx.set_gas(gas_limit);

        match client.balance(wallet.address()).await {
            Ok(balance) => {
                let needed = intent.value + fee.headline() * U256::from(gas_limit);
                if balance < needed {
                    warn!(
                        "Wallet #{} balance {} wei below required {} wei",
                        wallet.index(),
                        balance,
                        needed
                    );
                    run.units += 1;
                    return Ok(Err(AttemptResult::InsufficientFunds));
                }
            }
            Err(failure) if !failure.reached_node() => {
                return Ok(Err(run.pre_submit_failure(failure)));
            }
            Err(failure) => debug!("Balance check skipped: {}", failure),
        }

        let (raw, hash) = wallet.sign(&tx)?;
        Ok(Ok(Prepared {
            tx,
            raw,
            hash,
            nonce,
            fee,
            gas_limit,
            replacement: false,
        }))
    }

    fn prepare_replacement(
        &mut self,
        run: &mut Run<'_>,
        wallet: &mut Wallet,
        current: &Prepared,
    ) -> DriverResult<Prepared> {
        run.fee_index += 1;
        let mut fee = current.fee.scaled(self.config.replacement_fee_percent);
        if let Some(previous) = &run.last_fee {
            fee = fee.ensure_above(previous);
        }

        let tx = run.intent.build_transaction(
            wallet.address(),
            current.nonce,
            &fee,
            Some(current.gas_limit),
        );
        let (raw, hash) = wallet.sign(&tx)?;
        Ok(Prepared {
            tx,
            raw,
            hash,
            nonce: current.nonce,
            fee,
            gas_limit: current.gas_limit,
            replacement: true,
        })
    }

    /// Send a signed transaction; `Ok(Ok(_))` means a node accepted it
    async fn submit(
        &mut self,
        run: &mut Run<'_>,
        wallet: &mut Wallet,
        journal: &mut dyn SubmissionJournal,
        prepared: Prepared,
    ) -> DriverResult<Result<Prepared, AttemptResult>> {
        run.machine.transition(IntentState::Submitted)?;
        let client = run.client();

        let response = client.send_raw_transaction(prepared.raw.clone()).await;
        if let Err(failure) = &response {
            // Throttling answers count as transport: same transaction, no unit spent
            let transport = !failure.reached_node()
                || (!is_already_known(failure) && classify(failure).is_transport());
            if transport {
                debug!("Submission of {:?} hit a transport failure: {}", prepared.hash, failure);
                run.prepared = Some(prepared);
                return Ok(Err(AttemptResult::EndpointDown));
            }
        }

        run.units += 1;
        let index = run.attempts.len() as u32;
        let rejection = match &response {
            Ok(hash) => {
                if *hash != prepared.hash {
                    warn!("Node returned hash {:?}, signed {:?}", hash, prepared.hash);
                }
                None
            }
            Err(failure) if is_already_known(failure) => {
                info!("Node already knows {:?}, treating as accepted", prepared.hash);
                None
            }
            Err(failure) => Some(classify(failure)),
        };

        crate::metrics::record_submission(if prepared.replacement {
            "timeout_replacement"
        } else {
            "attempt"
        });
        run.attempts.push(AttemptRecord {
            index,
            nonce: prepared.nonce,
            fee: prepared.fee,
            gas_limit: prepared.gas_limit,
            tx_hash: prepared.hash,
            endpoint: run.lease.index,
            accepted: rejection.is_none(),
            rejection: rejection.as_ref().map(|r| r.class()),
            replacement: prepared.replacement,
        });
        run.last_fee = Some(prepared.fee);

        if let Some(result) = rejection {
            warn!(
                "Attempt {}/{} for wallet #{} rejected: {} ({})",
                run.units,
                self.config.max_attempts,
                wallet.index(),
                result.class(),
                response.err().map(|e| e.to_string()).unwrap_or_default()
            );
            return Ok(Err(result));
        }

        self.pool.mark_success(run.lease.index);
        wallet.nonce_cache_mut().mark_pending(prepared.nonce, prepared.hash);
        run.outstanding.push(prepared.hash);
        let journaled =
            journal.submitted(run.intent, wallet.address(), prepared.nonce, prepared.hash);
        if let Err(e) = journaled {
            warn!("Failed to journal submission {:?}: {}", prepared.hash, e);
        }

        info!(
            "Wallet #{} sent {:?} (nonce {}, attempt {}/{}, {}, gas limit {})",
            wallet.index(),
            prepared.hash,
            prepared.nonce,
            run.units,
            self.config.max_attempts,
            prepared.fee,
            prepared.gas_limit
        );

        run.machine.transition(IntentState::WaitingReceipt)?;
        Ok(Ok(prepared))
    }

    fn receipt_timeout(&self, intent: &Intent) -> Duration {
        if intent.heavy {
            Duration::from_secs(self.config.heavy_receipt_timeout_s)
        } else {
            Duration::from_secs(self.config.receipt_timeout_s)
        }
    }

    /// Poll all outstanding hashes until one has a receipt or the timeout passes
    async fn wait_for_receipt(&self, run: &Run<'_>) -> DriverResult<Option<Receipt>> {
        let deadline = Instant::now() + self.receipt_timeout(run.intent);
        let interval = Duration::from_millis(self.config.receipt_poll_interval_ms.max(1));

        loop {
            if let Some(receipt) = self.find_receipt(run).await {
                return Ok(Some(receipt));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            self.shutdown.sleep(interval).await?;
        }
    }

    async fn find_receipt(&self, run: &Run<'_>) -> Option<Receipt> {
        if run.outstanding.is_empty() {
            return None;
        }

        let client = run.client();
        let lookups = run
            .outstanding
            .iter()
            .map(|hash| client.transaction_receipt(*hash));

        join_all(lookups)
            .await
            .into_iter()
            .filter_map(|response| match response {
                Ok(receipt) => receipt,
                Err(e) => {
                    debug!("Receipt poll failed: {}", e);
                    None
                }
            })
            .next()
    }

    /// Recovery action for a non-terminal result
    async fn respond(&mut self, run: &mut Run<'_>, result: AttemptResult) -> DriverResult<()> {
        match result {
            AttemptResult::EndpointDown => {
                self.pool.mark_failure(run.lease.index, FailureReason::EndpointDown);
                run.lease = self.pool.rotate().await?;
            }
            AttemptResult::NonceGap => {
                run.nonce = None;
                run.prepared = None;
            }
            AttemptResult::Underpriced => {
                run.fee_index += 1;
                run.prepared = None;
            }
            AttemptResult::MempoolFull => {
                let (min, max) = self.config.mempool_full_delay_s;
                let delay = rand::thread_rng().gen_range(min..=max);
                warn!("Mempool full on endpoint #{}, waiting {}s", run.lease.index, delay);
                self.shutdown.sleep(Duration::from_secs(delay)).await?;
                run.lease = self.pool.rotate().await?;
                run.prepared = None;
            }
            AttemptResult::TimeoutPending => {
                self.pool.mark_failure(run.lease.index, FailureReason::TimeoutPending);
                run.lease = self.pool.rotate().await?;
                run.fee_index += 1;
                run.prepared = None;
            }
            AttemptResult::UnknownError(message) => {
                let exponent = run.units.saturating_sub(1).min(16);
                let delay = (5u64 << exponent).min(self.config.attempt_backoff_cap_s);
                warn!("Unclassified error ({}), backing off {}s", message, delay);
                self.shutdown.sleep(Duration::from_secs(delay)).await?;
                run.prepared = None;
            }
            AttemptResult::InsufficientFunds
            | AttemptResult::Confirmed(_)
            | AttemptResult::RevertedOnChain(_) => {}
        }
        Ok(())
    }

    fn note_failure(
        &self,
        run: &mut Run<'_>,
        journal: &mut dyn SubmissionJournal,
        result: &AttemptResult,
    ) {
        run.last_class = result.class();
        journal.record_error(result.class());
        crate::metrics::record_attempt_result(result.class());
    }

    /// Best-effort 0-value self-transfer at the oldest unmined nonce
    async fn replace_stuck(&mut self, run: &mut Run<'_>, wallet: &mut Wallet, view: &NonceView) {
        let stuck_nonce = view.oldest_gap_nonce();
        warn!(
            "Wallet #{} has {} unmined nonces (threshold {}), replacing nonce {}",
            wallet.index(),
            view.gap(),
            self.config.stuck_nonce_threshold,
            stuck_nonce
        );

        let client = run.client();
        match wallet.nonce_cache().pending_hash(stuck_nonce) {
            Some(hash) => match client.transaction_exists(hash).await {
                Ok(true) => info!("Nonce {} is held by {:?}", stuck_nonce, hash),
                Ok(false) => {
                    info!("No transaction found for nonce {}, possibly stuck", stuck_nonce)
                }
                Err(e) => debug!("eth_getTransaction failed: {}", e),
            },
            None => info!("No local record for nonce {}, possibly stuck", stuck_nonce),
        }

        match self.send_stuck_replacement(&*client, run.intent, wallet, stuck_nonce).await {
            Ok(hash) => {
                info!("Replacement {:?} sent for stuck nonce {}", hash, stuck_nonce);
                crate::metrics::record_submission("stuck_replacement");
                run.stuck_replacement = Some(hash);
            }
            Err(e) => warn!(
                "Stuck nonce replacement for wallet #{} failed: {}",
                wallet.index(),
                e
            ),
        }
    }

    async fn send_stuck_replacement(
        &self,
        client: &dyn ChainRpc,
        intent: &Intent,
        wallet: &mut Wallet,
        nonce: u64,
    ) -> Result<H256, String> {
        let fee = self
            .fees
            .quote(client, intent.fee_mode, 0)
            .await
            .map_err(|e| e.to_string())?
            .scaled(self.config.replacement_fee_percent);

        let transfer = self_transfer(wallet.address(), intent.chain_id, intent.fee_mode);
        let tx = transfer.build_transaction(wallet.address(), nonce, &fee, Some(TRANSFER_GAS));
        let (raw, hash) = wallet.sign(&tx).map_err(|e| e.to_string())?;

        match client.send_raw_transaction(raw).await {
            Ok(_) => {}
            Err(failure) if is_already_known(&failure) => {}
            Err(failure) => return Err(failure.to_string()),
        }
        wallet.nonce_cache_mut().mark_pending(nonce, hash);
        Ok(hash)
    }

    fn finish(
        &mut self,
        mut run: Run<'_>,
        wallet: &mut Wallet,
        receipt: Receipt,
    ) -> DriverResult<Outcome> {
        let mined = run
            .attempts
            .iter()
            .find(|a| a.tx_hash == receipt.tx_hash)
            .or_else(|| run.attempts.last());

        if let Some(attempt) = mined {
            wallet.nonce_cache_mut().confirm(attempt.nonce);
        }

        let price = receipt
            .effective_gas_price
            .or_else(|| mined.map(|a| a.fee.headline()))
            .unwrap_or_default();
        let cost = receipt.gas_used * price;

        self.pool.mark_success(run.lease.index);

        let status = if receipt.succeeded() {
            run.machine.transition(IntentState::Confirmed)?;
            self.gas_spent += cost;
            crate::metrics::set_gas_spent(self.gas_spent);
            OutcomeStatus::Confirmed { receipt, cost }
        } else {
            run.machine.transition(IntentState::RevertedOnChain)?;
            warn!(
                "Transaction {:?} reverted on chain in block {:?}",
                receipt.tx_hash, receipt.block_number
            );
            OutcomeStatus::RevertedOnChain { receipt, cost }
        };
        crate::metrics::record_attempt_result(match status {
            OutcomeStatus::Confirmed { .. } => "confirmed",
            _ => "reverted_on_chain",
        });

        Ok(Outcome {
            intent_id: run.intent.id,
            wallet: wallet.index(),
            status,
            attempts: run.attempts,
            stuck_replacement: run.stuck_replacement,
        })
    }

    fn abandon(
        &mut self,
        mut run: Run<'_>,
        wallet: &Wallet,
        reason: AbandonReason,
    ) -> DriverResult<Outcome> {
        run.machine.transition(IntentState::Abandoned)?;
        if !run.outstanding.is_empty() {
            warn!(
                "Abandoning {} with {} submission(s) still unmined: {:?}",
                run.intent.describe(),
                run.outstanding.len(),
                run.outstanding
            );
        }

        Ok(Outcome {
            intent_id: run.intent.id,
            wallet: wallet.index(),
            status: OutcomeStatus::Abandoned(reason),
            attempts: run.attempts,
            stuck_replacement: run.stuck_replacement,
        })
    }
}

fn receipt_result(receipt: Receipt) -> AttemptResult {
    if receipt.succeeded() {
        AttemptResult::Confirmed(receipt)
    } else {
        AttemptResult::RevertedOnChain(receipt)
    }
}
