//! JSON state file with atomic rewrite

use super::SubmissionJournal;
use crate::chain::ChainRpc;
use crate::error::{DriverError, DriverResult};
use crate::intent::Intent;
use crate::tx::{Outcome, OutcomeStatus};

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Terminal entries kept in the file; older ones are dropped
const MAX_TERMINAL_ENTRIES: usize = 500;

/// An intent with at least one accepted submission and no outcome yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub intent_id: Uuid,
    pub label: String,
    #[serde(default)]
    pub hint: Option<String>,
    pub wallet: Address,
    pub nonce: u64,
    pub tx_hashes: Vec<H256>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalEntry {
    pub intent_id: Uuid,
    pub label: String,
    pub status: String,
    #[serde(default)]
    pub tx_hash: Option<H256>,
    #[serde(default)]
    pub block_number: Option<u64>,
    pub resolved_at: DateTime<Utc>,
}

/// On-disk layout
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub pending: BTreeMap<Uuid, PendingEntry>,
    #[serde(default)]
    pub terminal: Vec<TerminalEntry>,
    #[serde(default)]
    pub last_good_tx: Option<H256>,
    #[serde(default)]
    pub error_counters: BTreeMap<String, u64>,
    #[serde(default)]
    pub gas_spent_wei: U256,
    #[serde(default)]
    pub cycles: u64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// State file owner
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: PersistedState,
    dirty: bool,
}

impl StateStore {
    /// Load the state file; a missing file starts a fresh run
    pub fn load(path: impl Into<PathBuf>) -> DriverResult<Self> {
        let path = path.into();

        let state = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).map_err(|e| {
                DriverError::State(format!("{} is not a valid state file: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No state file at {}, starting fresh", path.display());
                PersistedState::default()
            }
            Err(e) => return Err(e.into()),
        };

        let store = Self {
            path,
            state,
            dirty: false,
        };
        if !store.state.pending.is_empty() {
            info!(
                "Restored {} pending intent(s) from {}",
                store.state.pending.len(),
                store.path.display()
            );
        }
        Ok(store)
    }

    pub fn state(&self) -> &PersistedState {
        &self.state
    }

    pub fn gas_spent(&self) -> U256 {
        self.state.gas_spent_wei
    }

    /// Resolve restored pending entries whose transactions were mined
    ///
    /// Unresolved entries stay pending and are never resubmitted. Returns the
    /// number of entries moved to the terminal list.
    pub async fn reconcile(&mut self, client: &dyn ChainRpc) -> usize {
        let mut resolved = Vec::new();

        for (id, entry) in &self.state.pending {
            for hash in &entry.tx_hashes {
                match client.transaction_receipt(*hash).await {
                    Ok(Some(receipt)) => {
                        let status = if receipt.succeeded() {
                            "confirmed_on_reload"
                        } else {
                            "reverted_on_reload"
                        };
                        resolved.push((*id, status, receipt));
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => debug!("Receipt lookup for {:?} failed: {}", hash, e),
                }
            }
        }

        let count = resolved.len();
        for (id, status, receipt) in resolved {
            if let Some(entry) = self.state.pending.remove(&id) {
                info!(
                    "Pending {} ({:?}) {} in block {:?}",
                    entry.label, receipt.tx_hash, status, receipt.block_number
                );
                if receipt.succeeded() {
                    self.state.last_good_tx = Some(receipt.tx_hash);
                }
                self.push_terminal(TerminalEntry {
                    intent_id: id,
                    label: entry.label,
                    status: status.to_string(),
                    tx_hash: Some(receipt.tx_hash),
                    block_number: receipt.block_number,
                    resolved_at: Utc::now(),
                });
            }
        }

        for entry in self.state.pending.values() {
            warn!(
                "Intent {} (wallet {:?}, nonce {}) still unresolved after restart",
                entry.label, entry.wallet, entry.nonce
            );
        }

        if count > 0 {
            self.dirty = true;
        }
        count
    }

    /// Atomically rewrite the state file
    pub fn flush(&mut self) -> DriverResult<()> {
        self.state.updated_at = Some(Utc::now());
        let json = serde_json::to_vec_pretty(&self.state)?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut file = NamedTempFile::new_in(&dir)?;
        file.write_all(&json)?;
        file.as_file().sync_all()?;
        file.persist(&self.path).map_err(|e| DriverError::Io(e.error))?;

        self.dirty = false;
        debug!("State written to {}", self.path.display());
        Ok(())
    }

    fn push_terminal(&mut self, entry: TerminalEntry) {
        self.state.terminal.push(entry);
        if self.state.terminal.len() > MAX_TERMINAL_ENTRIES {
            let excess = self.state.terminal.len() - MAX_TERMINAL_ENTRIES;
            self.state.terminal.drain(..excess);
        }
    }
}

impl SubmissionJournal for StateStore {
    fn submitted(
        &mut self,
        intent: &Intent,
        wallet: Address,
        nonce: u64,
        tx_hash: H256,
    ) -> DriverResult<()> {
        let entry = self
            .state
            .pending
            .entry(intent.id)
            .or_insert_with(|| PendingEntry {
                intent_id: intent.id,
                label: intent.label.clone(),
                hint: intent.hint.clone(),
                wallet,
                nonce,
                tx_hashes: Vec::new(),
                submitted_at: Utc::now(),
            });

        entry.nonce = nonce;
        if !entry.tx_hashes.contains(&tx_hash) {
            entry.tx_hashes.push(tx_hash);
        }
        self.dirty = true;
        Ok(())
    }

    fn resolved(&mut self, intent: &Intent, outcome: &Outcome) -> DriverResult<()> {
        self.state.pending.remove(&intent.id);

        let receipt = outcome.receipt();
        if let OutcomeStatus::Confirmed { receipt, cost } = &outcome.status {
            self.state.last_good_tx = Some(receipt.tx_hash);
            self.state.gas_spent_wei += *cost;
        }

        self.push_terminal(TerminalEntry {
            intent_id: intent.id,
            label: intent.label.clone(),
            status: outcome.status.label().to_string(),
            tx_hash: receipt.map(|r| r.tx_hash),
            block_number: receipt.and_then(|r| r.block_number),
            resolved_at: Utc::now(),
        });
        self.dirty = true;
        Ok(())
    }

    fn record_error(&mut self, class: &str) {
        *self.state.error_counters.entry(class.to_string()).or_insert(0) += 1;
        self.dirty = true;
    }

    fn cycle_completed(&mut self) {
        self.state.cycles += 1;
        self.dirty = true;
    }

    fn checkpoint(&mut self) -> DriverResult<()> {
        if self.dirty {
            self.flush()?;
        }
        Ok(())
    }
}
