//! Fee oracle: legacy gas price or EIP-1559 fee envelope per attempt

use crate::chain::{ChainRpc, RpcResult};
use crate::config::FeeConfig;

use ethers::types::U256;
use serde::{Deserialize, Serialize};
use tracing::debug;

const BASIS_POINTS: u64 = 10_000;

/// Used when the latest block carries no `baseFeePerGas`
const FALLBACK_BASE_FEE_WEI: u64 = 500_000_000;

/// Transaction fee mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeMode {
    Legacy,
    Eip1559,
}

/// Fee parameters of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeeEnvelope {
    Legacy {
        gas_price: U256,
    },
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl FeeEnvelope {
    /// Gas price or max fee; the per-gas amount a sender can be charged
    pub fn headline(&self) -> U256 {
        match self {
            FeeEnvelope::Legacy { gas_price } => *gas_price,
            FeeEnvelope::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }

    /// Multiply every field by `percent / 100`
    pub fn scaled(&self, percent: u64) -> Self {
        let scale = |v: U256| v * U256::from(percent) / U256::from(100u64);
        match self {
            FeeEnvelope::Legacy { gas_price } => FeeEnvelope::Legacy {
                gas_price: scale(*gas_price),
            },
            FeeEnvelope::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => FeeEnvelope::Eip1559 {
                max_fee_per_gas: scale(*max_fee_per_gas),
                max_priority_fee_per_gas: scale(*max_priority_fee_per_gas),
            },
        }
    }

    /// Raise every field to at least `previous × 1.10 + 1 wei`
    ///
    /// Nodes refuse a same-nonce replacement unless each fee field grows by
    /// 10%, so this also keeps the fee strictly increasing across attempts.
    pub fn ensure_above(self, previous: &FeeEnvelope) -> Self {
        let min_next = |v: U256| v * U256::from(110u64) / U256::from(100u64) + U256::one();
        match (self, previous) {
            (FeeEnvelope::Legacy { gas_price }, FeeEnvelope::Legacy { gas_price: prev }) => {
                FeeEnvelope::Legacy {
                    gas_price: gas_price.max(min_next(*prev)),
                }
            }
            (
                FeeEnvelope::Eip1559 {
                    max_fee_per_gas,
                    max_priority_fee_per_gas,
                },
                FeeEnvelope::Eip1559 {
                    max_fee_per_gas: prev_max,
                    max_priority_fee_per_gas: prev_priority,
                },
            ) => {
                let priority = max_priority_fee_per_gas.max(min_next(*prev_priority));
                FeeEnvelope::Eip1559 {
                    max_fee_per_gas: max_fee_per_gas.max(min_next(*prev_max)).max(priority),
                    max_priority_fee_per_gas: priority,
                }
            }
            (fee, _) => fee,
        }
    }
}

impl std::fmt::Display for FeeEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeeEnvelope::Legacy { gas_price } => write!(f, "gasPrice {} wei", gas_price),
            FeeEnvelope::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => write!(
                f,
                "maxFee {} wei / priority {} wei",
                max_fee_per_gas, max_priority_fee_per_gas
            ),
        }
    }
}

/// Convert gwei to wei, rounding to the nearest wei
pub fn gwei_to_wei(gwei: f64) -> U256 {
    U256::from((gwei * 1e9).round().max(0.0) as u128)
}

/// Produces the fee envelope for an attempt index
#[derive(Debug, Clone)]
pub struct FeeOracle {
    floor_wei: U256,
    ceiling_wei: U256,
    max_bump_percent: u64,
}

impl FeeOracle {
    pub fn new(gwei_band: (f64, f64), max_bump_percent: u64) -> Self {
        Self {
            floor_wei: gwei_to_wei(gwei_band.0).max(U256::one()),
            ceiling_wei: gwei_to_wei(gwei_band.1).max(U256::one()),
            max_bump_percent,
        }
    }

    pub fn from_config(config: &FeeConfig) -> Self {
        Self::new(config.gwei_band, config.max_bump_percent)
    }

    /// EIP-1559 base-fee bump for `attempt`, in basis points: 30% + 11% per attempt
    pub fn bump_bps(&self, attempt: u32) -> u64 {
        let bump = 3_000u64.saturating_add(1_100u64.saturating_mul(attempt as u64));
        bump.min(self.max_bump_percent.saturating_mul(100))
    }

    /// Legacy multiplier for `attempt`, in basis points: 1.01 + 0.11 per attempt
    pub fn legacy_multiplier_bps(&self, attempt: u32) -> u64 {
        10_100u64.saturating_add(1_100u64.saturating_mul(attempt as u64))
    }

    /// Quote a fee from the live chain for the given attempt index
    pub async fn quote(
        &self,
        client: &dyn ChainRpc,
        mode: FeeMode,
        attempt: u32,
    ) -> RpcResult<FeeEnvelope> {
        let fee = match mode {
            FeeMode::Eip1559 => self.quote_eip1559(client, attempt).await?,
            FeeMode::Legacy => self.quote_legacy(client, attempt).await?,
        };
        debug!("Fee quote for attempt {}: {}", attempt, fee);
        Ok(fee)
    }

    async fn quote_eip1559(&self, client: &dyn ChainRpc, attempt: u32) -> RpcResult<FeeEnvelope> {
        let base_fee = client
            .latest_base_fee()
            .await?
            .unwrap_or_else(|| U256::from(FALLBACK_BASE_FEE_WEI));

        let priority = match client.max_priority_fee().await {
            Ok(fee) if !fee.is_zero() => fee,
            Ok(_) => self.floor_wei,
            Err(e) => {
                debug!("eth_maxPriorityFeePerGas unavailable ({}), using floor", e);
                self.floor_wei
            }
        };

        let bps = U256::from(BASIS_POINTS + self.bump_bps(attempt));
        let half = U256::from(BASIS_POINTS / 2);
        let bumped_base = (base_fee * bps + half) / U256::from(BASIS_POINTS);

        let max_fee = (bumped_base + priority).max(self.floor_wei).max(priority);

        Ok(FeeEnvelope::Eip1559 {
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: priority,
        })
    }

    async fn quote_legacy(&self, client: &dyn ChainRpc, attempt: u32) -> RpcResult<FeeEnvelope> {
        let mut price = client.gas_price().await?;
        if price < self.floor_wei {
            price = self.floor_wei;
        }

        let scaled = price * U256::from(self.legacy_multiplier_bps(attempt))
            / U256::from(BASIS_POINTS);
        let gas_price = scaled.max(self.floor_wei).min(self.ceiling_wei.max(self.floor_wei));

        Ok(FeeEnvelope::Legacy { gas_price })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::rpc::MockChainRpc;
    use crate::chain::RpcFailure;

    fn gwei(v: u64) -> U256 {
        U256::from(v) * U256::exp10(9)
    }

    fn legacy_chain(price: U256) -> MockChainRpc {
        let mut mock = MockChainRpc::new();
        mock.expect_gas_price().returning(move || Ok(price));
        mock
    }

    #[test]
    fn test_gwei_conversion() {
        assert_eq!(gwei_to_wei(1.0), gwei(1));
        assert_eq!(gwei_to_wei(0.05), U256::from(50_000_000u64));
    }

    #[test]
    fn test_bump_schedule_is_capped() {
        let oracle = FeeOracle::new((0.1, 100.0), 60);
        assert_eq!(oracle.bump_bps(0), 3_000);
        assert_eq!(oracle.bump_bps(1), 4_100);
        assert_eq!(oracle.bump_bps(2), 5_200);
        assert_eq!(oracle.bump_bps(3), 6_000);
        assert_eq!(oracle.bump_bps(50), 6_000);
    }

    #[tokio::test]
    async fn test_eip1559_quote() {
        let mut mock = MockChainRpc::new();
        mock.expect_latest_base_fee()
            .returning(|| Ok(Some(U256::from(1_000_000_000u64))));
        mock.expect_max_priority_fee()
            .returning(|| Ok(U256::from(200_000_000u64)));

        let oracle = FeeOracle::new((0.01, 100.0), 250);
        let fee = oracle.quote(&mock, FeeMode::Eip1559, 0).await.unwrap();
        assert_eq!(
            fee,
            FeeEnvelope::Eip1559 {
                max_fee_per_gas: U256::from(1_500_000_000u64),
                max_priority_fee_per_gas: U256::from(200_000_000u64),
            }
        );

        let bumped = oracle.quote(&mock, FeeMode::Eip1559, 2).await.unwrap();
        assert_eq!(bumped.headline(), U256::from(1_720_000_000u64));
    }

    #[tokio::test]
    async fn test_eip1559_fallbacks() {
        let mut mock = MockChainRpc::new();
        mock.expect_latest_base_fee().returning(|| Ok(None));
        mock.expect_max_priority_fee().returning(|| {
            Err(RpcFailure::Rejected {
                code: -32601,
                message: "method not found".into(),
            })
        });

        let oracle = FeeOracle::new((1.0, 100.0), 250);
        let fee = oracle.quote(&mock, FeeMode::Eip1559, 0).await.unwrap();
        match fee {
            FeeEnvelope::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                assert_eq!(max_priority_fee_per_gas, gwei(1));
                // 0.5 gwei × 1.3 + 1 gwei
                assert_eq!(max_fee_per_gas, U256::from(1_650_000_000u64));
            }
            other => panic!("unexpected envelope {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_legacy_raised_to_floor_and_clamped() {
        let oracle = FeeOracle::new((2.0, 5.0), 250);

        let low = legacy_chain(U256::from(1_000u64));
        let fee = oracle.quote(&low, FeeMode::Legacy, 0).await.unwrap();
        assert_eq!(fee.headline(), U256::from(2_020_000_000u64));

        let high = legacy_chain(gwei(40));
        let fee = oracle.quote(&high, FeeMode::Legacy, 0).await.unwrap();
        assert_eq!(fee.headline(), gwei(5));
    }

    #[tokio::test]
    async fn test_legacy_escalates_per_attempt() {
        let oracle = FeeOracle::new((0.1, 1_000.0), 250);
        let chain = legacy_chain(gwei(10));

        let mut previous = U256::zero();
        for attempt in 0..5 {
            let fee = oracle.quote(&chain, FeeMode::Legacy, attempt).await.unwrap();
            assert!(fee.headline() > previous);
            previous = fee.headline();
        }
        assert_eq!(previous, U256::from(14_500_000_000u64));
    }

    #[tokio::test]
    async fn test_transport_failure_propagates() {
        let mut mock = MockChainRpc::new();
        mock.expect_gas_price()
            .returning(|| Err(RpcFailure::Transport("timed out".into())));
        let oracle = FeeOracle::new((1.0, 5.0), 250);
        assert!(oracle.quote(&mock, FeeMode::Legacy, 0).await.is_err());
    }

    #[test]
    fn test_ensure_above_beats_ceiling() {
        let previous = FeeEnvelope::Legacy { gas_price: gwei(5) };
        let clamped = FeeEnvelope::Legacy { gas_price: gwei(5) };
        let next = clamped.ensure_above(&previous);
        assert_eq!(next.headline(), U256::from(5_500_000_001u64));
    }

    #[test]
    fn test_ensure_above_bumps_both_eip1559_fields() {
        let previous = FeeEnvelope::Eip1559 {
            max_fee_per_gas: gwei(10),
            max_priority_fee_per_gas: gwei(1),
        };
        let quote = FeeEnvelope::Eip1559 {
            max_fee_per_gas: gwei(9),
            max_priority_fee_per_gas: gwei(1),
        };
        match quote.ensure_above(&previous) {
            FeeEnvelope::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                assert_eq!(max_fee_per_gas, U256::from(11_000_000_001u64));
                assert_eq!(max_priority_fee_per_gas, U256::from(1_100_000_001u64));
            }
            other => panic!("unexpected envelope {:?}", other),
        }
    }

    #[test]
    fn test_scaled_replacement_fee() {
        let fee = FeeEnvelope::Legacy { gas_price: gwei(2) };
        assert_eq!(fee.scaled(150).headline(), gwei(3));
    }
}
