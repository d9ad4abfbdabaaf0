//! Endpoint pool with health tracking and failover
//!
//! Endpoints are verified lazily: the first time one is selected its chain id
//! is checked and the verdict cached for the life of the process. Only
//! endpoints whose measured chain id equals the configured one are handed out.

use super::rpc::{redact_url, ChainRpc};
use crate::error::{DriverError, DriverResult};
use crate::shutdown::Shutdown;

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Builds a client for an endpoint URL
pub type Connector = Arc<dyn Fn(&str) -> Result<Arc<dyn ChainRpc>, String> + Send + Sync>;

/// Why an endpoint is being penalised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    EndpointDown,
    TimeoutPending,
    Transport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verification {
    Unverified,
    Verified,
    /// Permanently ineligible (chain id mismatch or unusable URL)
    Rejected,
}

struct Endpoint {
    url: String,
    client: Option<Arc<dyn ChainRpc>>,
    verification: Verification,
    measured_chain_id: Option<u64>,
    consecutive_failures: u32,
    last_success: Option<Instant>,
    last_failure: Option<Instant>,
    last_used: Option<Instant>,
}

impl Endpoint {
    fn new(url: String) -> Self {
        Self {
            url,
            client: None,
            verification: Verification::Unverified,
            measured_chain_id: None,
            consecutive_failures: 0,
            last_success: None,
            last_failure: None,
            last_used: None,
        }
    }
}

/// A client bound to one pool entry
#[derive(Clone)]
pub struct Lease {
    pub index: usize,
    pub client: Arc<dyn ChainRpc>,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("index", &self.index).finish()
    }
}

/// Health snapshot of one endpoint
#[derive(Debug, Clone)]
pub struct EndpointStatus {
    pub url: String,
    pub consecutive_failures: u32,
    pub measured_chain_id: Option<u64>,
    pub eligible: bool,
}

/// Set of RPC endpoints for one chain
pub struct EndpointPool {
    chain_id: u64,
    endpoints: Vec<Endpoint>,
    current: Option<usize>,
    connector: Connector,
    failure_ceiling: u32,
    backoff: (u64, u64),
    shutdown: Shutdown,
}

impl EndpointPool {
    pub fn new(
        chain_id: u64,
        urls: &[String],
        connector: Connector,
        failure_ceiling: u32,
        backoff: (u64, u64),
        shutdown: Shutdown,
    ) -> DriverResult<Self> {
        if urls.is_empty() {
            return Err(DriverError::NoUsableEndpoints {
                chain_id,
                message: "no RPC URLs configured".to_string(),
            });
        }

        Ok(Self {
            chain_id,
            endpoints: urls.iter().cloned().map(Endpoint::new).collect(),
            current: None,
            connector,
            failure_ceiling: failure_ceiling.max(1),
            backoff,
            shutdown,
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Return a client for an eligible endpoint, blocking until one exists
    pub async fn acquire(&mut self) -> DriverResult<Lease> {
        self.acquire_excluding(None).await
    }

    /// Switch away from the current endpoint if any alternative is eligible
    pub async fn rotate(&mut self) -> DriverResult<Lease> {
        let previous = self.current;
        let lease = self.acquire_excluding(previous).await?;
        if Some(lease.index) != previous {
            info!(
                "Chain {} rotated to endpoint #{} ({})",
                self.chain_id,
                lease.index,
                redact_url(&self.endpoints[lease.index].url)
            );
        }
        Ok(lease)
    }

    /// Penalise an endpoint after a transport-class failure
    ///
    /// Callers must not report on-chain reverts here.
    pub fn mark_failure(&mut self, index: usize, reason: FailureReason) {
        if let Some(endpoint) = self.endpoints.get_mut(index) {
            endpoint.consecutive_failures += 1;
            endpoint.last_failure = Some(Instant::now());
            warn!(
                "Endpoint #{} ({}) failure {:?}, consecutive failures: {}",
                index,
                redact_url(&endpoint.url),
                reason,
                endpoint.consecutive_failures
            );
            crate::metrics::record_endpoint_failure(index);
        }
    }

    /// Clear the failure streak after a successful call
    pub fn mark_success(&mut self, index: usize) {
        if let Some(endpoint) = self.endpoints.get_mut(index) {
            endpoint.consecutive_failures = 0;
            endpoint.last_success = Some(Instant::now());
        }
    }

    pub fn status(&self) -> Vec<EndpointStatus> {
        self.endpoints
            .iter()
            .map(|e| EndpointStatus {
                url: redact_url(&e.url),
                consecutive_failures: e.consecutive_failures,
                measured_chain_id: e.measured_chain_id,
                eligible: e.verification != Verification::Rejected
                    && e.consecutive_failures < self.failure_ceiling,
            })
            .collect()
    }

    async fn acquire_excluding(&mut self, exclude: Option<usize>) -> DriverResult<Lease> {
        loop {
            self.shutdown.check()?;

            // Exclusion only applies when there is somewhere else to go
            let mut excluded = exclude;
            loop {
                let Some(index) = self.select(excluded) else {
                    if excluded.take().is_some() {
                        continue;
                    }
                    break;
                };

                if let Some(lease) = self.verify(index).await {
                    let endpoint = &mut self.endpoints[index];
                    endpoint.last_used = Some(Instant::now());
                    self.current = Some(index);
                    return Ok(lease);
                }
            }

            if self
                .endpoints
                .iter()
                .all(|e| e.verification == Verification::Rejected)
            {
                return Err(DriverError::NoUsableEndpoints {
                    chain_id: self.chain_id,
                    message: "every endpoint failed chain id or URL validation".to_string(),
                });
            }

            let delay = rand::thread_rng().gen_range(self.backoff.0..=self.backoff.1);
            warn!(
                "No eligible endpoint for chain {}, retrying full list in {}s",
                self.chain_id, delay
            );
            self.shutdown.sleep(Duration::from_secs(delay)).await?;

            for endpoint in &mut self.endpoints {
                endpoint.consecutive_failures = 0;
            }
        }
    }

    /// Clean endpoints first (least recently used wins), then the one whose
    /// last failure is oldest
    fn select(&self, exclude: Option<usize>) -> Option<usize> {
        let candidates = || {
            self.endpoints.iter().enumerate().filter(|(i, e)| {
                Some(*i) != exclude
                    && e.verification != Verification::Rejected
                    && e.consecutive_failures < self.failure_ceiling
            })
        };

        let clean = candidates()
            .filter(|(_, e)| e.consecutive_failures == 0)
            .min_by_key(|(_, e)| e.last_used)
            .map(|(i, _)| i);

        clean.or_else(|| {
            candidates()
                .min_by_key(|(_, e)| e.last_failure)
                .map(|(i, _)| i)
        })
    }

    /// Connect and check the chain id on first use; `None` means try another
    async fn verify(&mut self, index: usize) -> Option<Lease> {
        let chain_id = self.chain_id;
        let connector = self.connector.clone();
        let endpoint = &mut self.endpoints[index];

        let client = match &endpoint.client {
            Some(client) => client.clone(),
            None => match connector(&endpoint.url) {
                Ok(client) => {
                    endpoint.client = Some(client.clone());
                    client
                }
                Err(e) => {
                    warn!(
                        "Endpoint #{} ({}) rejected: {}",
                        index,
                        redact_url(&endpoint.url),
                        e
                    );
                    endpoint.verification = Verification::Rejected;
                    return None;
                }
            },
        };

        if endpoint.verification == Verification::Verified {
            return Some(Lease { index, client });
        }

        match client.chain_id().await {
            Ok(measured) if measured == chain_id => {
                endpoint.measured_chain_id = Some(measured);
                endpoint.verification = Verification::Verified;
                endpoint.last_success = Some(Instant::now());
                info!(
                    "Connected to endpoint #{} ({}) for chain {}",
                    index,
                    redact_url(&endpoint.url),
                    chain_id
                );
                Some(Lease { index, client })
            }
            Ok(measured) => {
                endpoint.measured_chain_id = Some(measured);
                endpoint.verification = Verification::Rejected;
                warn!(
                    "{}",
                    DriverError::ChainIdMismatch {
                        url: redact_url(&endpoint.url),
                        expected: chain_id,
                        actual: measured,
                    }
                );
                None
            }
            Err(e) => {
                debug!("Chain id probe failed on endpoint #{}: {}", index, e);
                self.mark_failure(index, FailureReason::Transport);
                None
            }
        }
    }
}
