//! Per-wallet nonce bookkeeping
//!
//! Handles:
//! - Local nonce tracking so a retry never reuses a stale value
//! - Gap detection between the confirmed and pending views of the chain
//! - Remembering which hash was sent at which nonce, for stuck replacement

use std::collections::BTreeMap;

use ethers::types::H256;
use tracing::{debug, warn};

/// Chain view of a sender's nonces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceView {
    /// `eth_getTransactionCount(addr, "latest")`
    pub confirmed: u64,
    /// `eth_getTransactionCount(addr, "pending")`
    pub pending: u64,
    /// Nonce to use for the next transaction
    pub next: u64,
}

impl NonceView {
    /// Number of nonces sent but not yet mined
    pub fn gap(&self) -> u64 {
        self.pending.saturating_sub(self.confirmed)
    }

    /// Oldest nonce that is sent but not mined
    pub fn oldest_gap_nonce(&self) -> u64 {
        self.confirmed
    }
}

/// Nonce cache owned by exactly one wallet
#[derive(Debug, Default)]
pub struct NonceCache {
    /// Next nonce to use, `None` until first synced
    current: Option<u64>,
    /// Transactions we sent: nonce -> latest tx hash for that nonce
    pending: BTreeMap<u64, H256>,
    /// Highest nonce known mined, plus one
    confirmed: u64,
}

impl NonceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<u64> {
        self.current
    }

    /// Fold a fresh chain reading into the cache
    ///
    /// The cache never moves backwards except when the chain's pending view
    /// is lower than the cache, which means something we sent was dropped;
    /// then the chain wins.
    pub fn sync(&mut self, confirmed: u64, pending: u64) -> NonceView {
        let pending = pending.max(confirmed);

        let next = match self.current {
            Some(cached) if pending < cached => {
                warn!(
                    "Nonce drift: cache at {}, chain pending at {} - refilling from chain",
                    cached, pending
                );
                pending
            }
            Some(cached) => cached.max(pending),
            None => pending,
        };

        self.current = Some(next);
        self.confirmed = self.confirmed.max(confirmed);
        self.pending.retain(|nonce, _| *nonce >= confirmed);

        debug!(
            "Nonce sync: confirmed {}, pending {}, next {}",
            confirmed, pending, next
        );

        NonceView {
            confirmed,
            pending,
            next,
        }
    }

    /// Record a transaction accepted by a node at `nonce`
    pub fn mark_pending(&mut self, nonce: u64, tx_hash: H256) {
        self.pending.insert(nonce, tx_hash);
        let next = nonce + 1;
        if self.current.map(|c| c < next).unwrap_or(true) {
            self.current = Some(next);
        }
    }

    /// A transaction at `nonce` was mined
    pub fn confirm(&mut self, nonce: u64) {
        self.pending.remove(&nonce);
        if nonce + 1 > self.confirmed {
            self.confirmed = nonce + 1;
        }
    }

    /// Last hash we sent at `nonce`, if any
    pub fn pending_hash(&self, nonce: u64) -> Option<H256> {
        self.pending.get(&nonce).copied()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sync_takes_pending() {
        let mut cache = NonceCache::new();
        let view = cache.sync(4, 6);
        assert_eq!(view.next, 6);
        assert_eq!(view.gap(), 2);
        assert_eq!(view.oldest_gap_nonce(), 4);
    }

    #[test]
    fn test_cache_is_monotonic_when_chain_lags() {
        let mut cache = NonceCache::new();
        cache.sync(4, 4);
        cache.mark_pending(4, H256::repeat_byte(1));
        cache.mark_pending(5, H256::repeat_byte(2));
        // Node has not seen our last submission yet
        let view = cache.sync(4, 6);
        assert_eq!(view.next, 6);
        assert_eq!(cache.current(), Some(6));
    }

    #[test]
    fn test_drift_refills_from_chain() {
        let mut cache = NonceCache::new();
        cache.sync(10, 10);
        cache.mark_pending(10, H256::repeat_byte(1));
        cache.mark_pending(11, H256::repeat_byte(2));
        assert_eq!(cache.current(), Some(12));

        // Both transactions were dropped from the mempool
        let view = cache.sync(10, 10);
        assert_eq!(view.next, 10);
    }

    #[test]
    fn test_confirm_clears_pending_entry() {
        let mut cache = NonceCache::new();
        cache.sync(0, 0);
        cache.mark_pending(0, H256::repeat_byte(9));
        assert_eq!(cache.pending_hash(0), Some(H256::repeat_byte(9)));
        cache.confirm(0);
        assert_eq!(cache.pending_hash(0), None);
        assert_eq!(cache.pending_count(), 0);
    }

    #[test]
    fn test_sync_prunes_mined_entries() {
        let mut cache = NonceCache::new();
        cache.sync(0, 0);
        cache.mark_pending(0, H256::repeat_byte(1));
        cache.mark_pending(1, H256::repeat_byte(2));
        cache.sync(1, 2);
        assert_eq!(cache.pending_hash(0), None);
        assert_eq!(cache.pending_hash(1), Some(H256::repeat_byte(2)));
    }
}
