//! Gas limit estimation with a safety buffer and clamping band

use crate::chain::ChainRpc;
use crate::config::GasConfig;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::U256;
use tracing::{debug, warn};

/// Gas estimator for attempts
#[derive(Debug, Clone)]
pub struct GasEstimator {
    /// Buffer percentage added to the node's estimate (10 = 10%)
    buffer_percent: u64,
    /// Default clamp band when the intent has no override
    band: (u64, u64),
}

impl GasEstimator {
    pub fn new(buffer_percent: u64, band: (u64, u64)) -> Self {
        Self {
            buffer_percent,
            band,
        }
    }

    pub fn from_config(config: &GasConfig) -> Self {
        Self::new(config.estimate_buffer_percent, config.limit_band)
    }

    /// Estimate the gas limit for `tx`
    ///
    /// A successful estimate is buffered and clamped to `band` (or the
    /// configured band). A failed estimate yields `fallback` unchanged.
    pub async fn estimate(
        &self,
        client: &dyn ChainRpc,
        tx: &TypedTransaction,
        fallback: u64,
        band: Option<(u64, u64)>,
    ) -> u64 {
        match client.estimate_gas(tx).await {
            Ok(estimate) => {
                let limit = self.buffered(estimate, band.unwrap_or(self.band));
                debug!("Gas estimate {} -> limit {}", estimate, limit);
                limit
            }
            Err(e) => {
                warn!("eth_estimateGas failed ({}), using fallback limit {}", e, fallback);
                fallback
            }
        }
    }

    fn buffered(&self, estimate: U256, band: (u64, u64)) -> u64 {
        let buffered = estimate.saturating_mul(U256::from(100 + self.buffer_percent))
            / U256::from(100u64);
        let limit = if buffered > U256::from(u64::MAX) {
            u64::MAX
        } else {
            buffered.as_u64()
        };
        limit.clamp(band.0, band.1)
    }
}
