//! Randomized delays between intents, wallets and cycles

use crate::config::PacingConfig;
use crate::error::DriverResult;
use crate::shutdown::Shutdown;

use rand::Rng;
use std::time::Duration;
use tracing::info;

#[derive(Clone)]
pub struct Pacing {
    config: PacingConfig,
    shutdown: Shutdown,
}

impl Pacing {
    pub fn new(config: PacingConfig, shutdown: Shutdown) -> Self {
        Self { config, shutdown }
    }

    /// Short pause between intents of one wallet
    pub async fn intra_intent(&self) -> DriverResult<()> {
        self.pause("the next intent", self.config.intra_intent_delay_s)
            .await
    }

    pub async fn inter_wallet(&self) -> DriverResult<()> {
        self.pause("the next wallet", self.config.inter_wallet_delay_s)
            .await
    }

    /// Long pause after every wallet had its slot
    pub async fn inter_cycle(&self) -> DriverResult<()> {
        self.pause("the next cycle", self.config.inter_cycle_delay_s)
            .await
    }

    async fn pause(&self, what: &str, (min, max): (u64, u64)) -> DriverResult<()> {
        let secs = rand::thread_rng().gen_range(min..=max);
        info!("Waiting {} before {}", human_duration(secs), what);
        self.shutdown.sleep(Duration::from_secs(secs)).await
    }
}

fn human_duration(secs: u64) -> String {
    match (secs / 3600, secs % 3600 / 60, secs % 60) {
        (0, 0, s) => format!("{}s", s),
        (0, m, s) => format!("{}m {}s", m, s),
        (h, m, _) => format!("{}h {}m", h, m),
    }
}
