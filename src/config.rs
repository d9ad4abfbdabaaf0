//! Configuration management for the transaction driver
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::tx::FeeMode;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub chain: ChainConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
    pub fees: FeeConfig,
    #[serde(default)]
    pub gas: GasConfig,
    #[serde(default)]
    pub driver: DriverConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
    #[serde(default)]
    pub explorer_tx_url: Option<String>,
    #[serde(default = "default_native_symbol")]
    pub native_symbol: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    #[serde(default = "default_private_key_env")]
    pub private_key_env: String,
    #[serde(default)]
    pub private_keys_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeeConfig {
    pub mode: FeeMode,
    /// Floor/ceiling for legacy gas price, in gwei
    pub gwei_band: (f64, f64),
    #[serde(default = "default_max_bump_percent")]
    pub max_bump_percent: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GasConfig {
    pub limit_band: (u64, u64),
    pub estimate_buffer_percent: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub receipt_timeout_s: u64,
    pub heavy_receipt_timeout_s: u64,
    pub receipt_poll_interval_ms: u64,
    pub max_attempts: u32,
    pub attempt_backoff_cap_s: u64,
    pub stuck_nonce_threshold: u64,
    pub replacement_fee_percent: u64,
    pub mempool_full_delay_s: (u64, u64),
    pub endpoint_failure_ceiling: u32,
    pub endpoint_backoff_s: (u64, u64),
    pub request_timeout_s: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub intra_intent_delay_s: (u64, u64),
    pub inter_wallet_delay_s: (u64, u64),
    pub inter_cycle_delay_s: (u64, u64),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub reissue_on_insufficient_funds: bool,
    /// Stop after this many completed cycles (0 = run forever)
    #[serde(default)]
    pub max_cycles: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

/// One intent template; see `runner::tasks`
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    pub contract: String,
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub calldata: Option<String>,
    #[serde(default = "default_value_wei")]
    pub value_wei: String,
    #[serde(default = "default_fallback_gas")]
    pub fallback_gas: u64,
    #[serde(default)]
    pub gas_limit_band: Option<(u64, u64)>,
    #[serde(default = "default_per_wallet")]
    pub per_wallet: u32,
    #[serde(default)]
    pub heavy: bool,
}

fn default_native_symbol() -> String {
    "ETH".to_string()
}

fn default_private_key_env() -> String {
    "PRIVATE_KEY".to_string()
}

fn default_max_bump_percent() -> u64 {
    250
}

fn default_estimate_buffer_percent() -> u64 {
    10
}

fn default_value_wei() -> String {
    "0".to_string()
}

fn default_fallback_gas() -> u64 {
    150_000
}

fn default_per_wallet() -> u32 {
    1
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            private_key_env: default_private_key_env(),
            private_keys_file: Some(PathBuf::from("private_keys.txt")),
        }
    }
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            limit_band: (21_000, 3_000_000),
            estimate_buffer_percent: default_estimate_buffer_percent(),
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            receipt_timeout_s: 180,
            heavy_receipt_timeout_s: 300,
            receipt_poll_interval_ms: 3_000,
            max_attempts: 10,
            attempt_backoff_cap_s: 60,
            stuck_nonce_threshold: 5,
            replacement_fee_percent: 150,
            mempool_full_delay_s: (60, 120),
            endpoint_failure_ceiling: 3,
            endpoint_backoff_s: (20, 30),
            request_timeout_s: 30,
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            intra_intent_delay_s: (10, 80),
            inter_wallet_delay_s: (80, 200),
            inter_cycle_delay_s: (30 * 60, 90 * 60),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            reissue_on_insufficient_funds: false,
            max_cycles: 0,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9100,
        }
    }
}

impl Settings {
    /// Load settings from the configuration file
    pub fn load() -> Result<Self> {
        let config_path = env::var("DRIVER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse settings from TOML text
    pub fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.chain.rpc_urls.is_empty() {
            anyhow::bail!("Chain {} has no RPC URLs configured", self.chain.name);
        }
        if self.chain.chain_id == 0 {
            anyhow::bail!("Chain {} has no chain id configured", self.chain.name);
        }

        let (floor, ceiling) = self.fees.gwei_band;
        if !(floor > 0.0 && floor <= ceiling) {
            anyhow::bail!(
                "fees.gwei_band must satisfy 0 < min <= max, got {:?}",
                self.fees.gwei_band
            );
        }

        check_range("gas.limit_band", self.gas.limit_band)?;
        check_range("driver.mempool_full_delay_s", self.driver.mempool_full_delay_s)?;
        check_range("driver.endpoint_backoff_s", self.driver.endpoint_backoff_s)?;
        check_range("pacing.intra_intent_delay_s", self.pacing.intra_intent_delay_s)?;
        check_range("pacing.inter_wallet_delay_s", self.pacing.inter_wallet_delay_s)?;
        check_range("pacing.inter_cycle_delay_s", self.pacing.inter_cycle_delay_s)?;

        if self.driver.max_attempts == 0 {
            anyhow::bail!("driver.max_attempts must be at least 1");
        }
        if self.driver.replacement_fee_percent <= 100 {
            anyhow::bail!("driver.replacement_fee_percent must exceed 100");
        }

        if self.tasks.is_empty() {
            anyhow::bail!("At least one [[tasks]] entry must be configured");
        }
        for task in &self.tasks {
            if let Some(band) = task.gas_limit_band {
                check_range(&format!("tasks.{}.gas_limit_band", task.name), band)?;
            }
            if task.function.is_some() && task.calldata.is_some() {
                anyhow::bail!("Task {} sets both function and calldata", task.name);
            }
            if task.per_wallet == 0 {
                warn!("Task {} has per_wallet = 0 - will never run", task.name);
            }
        }

        Ok(())
    }
}

fn check_range<T: PartialOrd + std::fmt::Debug>(name: &str, range: (T, T)) -> Result<()> {
    if range.0 > range.1 {
        anyhow::bail!("{} must satisfy min <= max, got {:?}", name, range);
    }
    Ok(())
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid env var pattern");
    }

    let mut result = input.to_string();
    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

/// Load signing keys from the configured environment variable and key file
///
/// Keys without a `0x` prefix receive one; blank lines and `#` comments are
/// skipped; duplicates are removed keeping the first occurrence. Key material
/// is never echoed back in logs or errors.
pub fn load_private_keys(config: &WalletConfig) -> Result<Vec<String>> {
    let mut raw = Vec::new();

    if let Ok(value) = env::var(&config.private_key_env) {
        raw.extend(split_keys(&value));
    }

    if let Some(path) = &config.private_keys_file {
        match std::fs::read_to_string(path) {
            Ok(contents) => raw.extend(split_keys(&contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Key file {:?} not found - using environment keys only", path);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read key file {:?}", path));
            }
        }
    }

    Ok(normalize_keys(raw))
}

fn split_keys(input: &str) -> Vec<String> {
    input
        .split(|c| c == '\n' || c == ',')
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn normalize_keys(raw: Vec<String>) -> Vec<String> {
    let mut keys: Vec<String> = Vec::with_capacity(raw.len());

    for (position, key) in raw.into_iter().enumerate() {
        let key = if key.starts_with("0x") || key.starts_with("0X") {
            format!("0x{}", &key[2..])
        } else {
            format!("0x{}", key)
        };

        if key.len() != 66 || hex::decode(&key[2..]).is_err() {
            warn!("Skipping malformed private key entry #{}", position + 1);
            continue;
        }

        if !keys.iter().any(|k| k.eq_ignore_ascii_case(&key)) {
            keys.push(key);
        }
    }

    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
    const KEY_B: &str = "0x646f1ce2fdad0e6deeeb5c7e8e5543bdde65e86029e2fd9fc169899c440a7913";

    const MINIMAL: &str = r#"
        [chain]
        name = "0g-galileo"
        chain_id = 16601
        rpc_urls = ["https://evmrpc-testnet.0g.ai"]

        [fees]
        mode = "eip1559"
        gwei_band = [0.05, 2.0]

        [[tasks]]
        name = "gm"
        contract = "0x0000000000000000000000000000000000000001"
        function = "function gm()"
    "#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let settings = Settings::parse(MINIMAL).unwrap();
        assert_eq!(settings.chain.chain_id, 16601);
        assert_eq!(settings.fees.mode, FeeMode::Eip1559);
        assert_eq!(settings.driver.max_attempts, 10);
        assert_eq!(settings.driver.receipt_timeout_s, 180);
        assert_eq!(settings.driver.heavy_receipt_timeout_s, 300);
        assert_eq!(settings.pacing.inter_wallet_delay_s, (80, 200));
        assert_eq!(settings.tasks[0].fallback_gas, 150_000);
        assert!(settings.state.path.is_none());
    }

    #[test]
    fn test_partial_sections_keep_remaining_defaults() {
        let partial = r#"
            [driver]
            max_attempts = 5

            [pacing]
            inter_cycle_delay_s = [60, 120]

            [gas]
            estimate_buffer_percent = 20

            [metrics]
            enabled = true
        "#;
        let toml = format!("{}{}", MINIMAL, partial);
        let settings = Settings::parse(&toml).unwrap();
        assert_eq!(settings.driver.max_attempts, 5);
        assert_eq!(settings.driver.receipt_timeout_s, 180);
        assert_eq!(settings.driver.stuck_nonce_threshold, 5);
        assert_eq!(settings.pacing.inter_cycle_delay_s, (60, 120));
        assert_eq!(settings.pacing.intra_intent_delay_s, (10, 80));
        assert_eq!(settings.gas.estimate_buffer_percent, 20);
        assert_eq!(settings.gas.limit_band, (21_000, 3_000_000));
        assert!(settings.metrics.enabled);
        assert_eq!(settings.metrics.port, 9100);
    }

    #[test]
    fn test_shipped_config_parses() {
        let settings = Settings::parse(include_str!("../config/default.toml")).unwrap();
        assert_eq!(settings.chain.rpc_urls.len(), 3);
        assert_eq!(settings.driver.mempool_full_delay_s, (60, 120));
        assert_eq!(settings.tasks.len(), 2);
        assert!(settings.state.path.is_some());
    }

    #[test]
    fn test_inverted_range_rejected() {
        let bad = MINIMAL.replace("gwei_band = [0.05, 2.0]", "gwei_band = [3.0, 2.0]");
        assert!(Settings::parse(&bad).is_err());
    }

    #[test]
    fn test_missing_tasks_rejected() {
        let idx = MINIMAL.find("[[tasks]]").unwrap();
        assert!(Settings::parse(&MINIMAL[..idx]).is_err());
    }

    #[test]
    fn test_keys_prefixed_and_deduplicated() {
        let raw = vec![
            KEY_A.to_string(),
            format!("0x{}", KEY_A),
            KEY_B.to_string(),
            "not-a-key".to_string(),
        ];
        let keys = normalize_keys(raw);
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0], format!("0x{}", KEY_A));
        assert_eq!(keys[1], KEY_B);
    }

    #[test]
    fn test_keys_file_and_env_combined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("private_keys.txt");
        std::fs::write(&path, format!("# farm wallets\n{}\n\n{}\n", KEY_A, KEY_B)).unwrap();

        env::set_var("TEST_DRIVER_KEYS", KEY_B);
        let config = WalletConfig {
            private_key_env: "TEST_DRIVER_KEYS".to_string(),
            private_keys_file: Some(path),
        };

        let keys = load_private_keys(&config).unwrap();
        assert_eq!(keys, vec![KEY_B.to_string(), format!("0x{}", KEY_A)]);
    }

    #[test]
    fn test_missing_key_file_is_not_an_error() {
        let config = WalletConfig {
            private_key_env: "TEST_DRIVER_KEYS_UNSET".to_string(),
            private_keys_file: Some(PathBuf::from("/nonexistent/private_keys.txt")),
        };
        let keys = load_private_keys(&config).unwrap();
        assert!(keys.is_empty());
    }
}
