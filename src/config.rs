use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ethers::types::U256;
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::errors::ConfigError;

pub const CONFIG_DIR: &str = "./conf";

/// Per-network settings, read from `./conf/<network>.json`. Secrets are never part of
/// this file; see [`env_secret`].
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NetworkConfig {
    pub network_name: String,
    #[serde(default)]
    pub chain_id: Option<u64>,
    pub rpc_url: String,
    pub registry_path: PathBuf,
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
    #[serde(default = "default_confirmations")]
    pub confirmations: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub provisioning: Option<ProvisioningConfig>,
    #[serde(default)]
    pub explorer: Option<ExplorerConfig>,
    #[serde(default)]
    pub keeper: KeeperConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProvisioningConfig {
    pub base_url: String,
    /// Network identifier as the provider spells it, e.g. `goerli`.
    pub network: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_provisioning_poll_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_per_poll_retries")]
    pub per_poll_retries: u32,
}

impl ProvisioningConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ExplorerConfig {
    pub api_url: String,
    #[serde(default = "default_verify_retry_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_verify_status_poll_secs")]
    pub status_poll_secs: u64,
}

impl ExplorerConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn status_poll(&self) -> Duration {
        Duration::from_secs(self.status_poll_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KeeperConfig {
    /// Registry key of the pool: holds pooled deposits and reports the registered total.
    pub pool_key: String,
    /// Registry key of the staking-nodes manager that registers validators.
    pub manager_key: String,
    /// Registry key of the beacon deposit contract; without it the anchor is zero.
    #[serde(default)]
    pub deposit_contract_key: Option<String>,
    /// Decimal wei amount.
    pub funding_threshold_wei: String,
    pub poll_interval_ms: u64,
    pub error_backoff_ms: u64,
    pub cycle_timeout_secs: u64,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        KeeperConfig {
            pool_key: "ynETH".to_string(),
            manager_key: "stakingNodesManager".to_string(),
            deposit_contract_key: None,
            funding_threshold_wei: DEPOSIT_AMOUNT_WEI.to_string(),
            poll_interval_ms: DEFAULT_KEEPER_POLL_MS,
            error_backoff_ms: DEFAULT_KEEPER_ERROR_BACKOFF_MS,
            cycle_timeout_secs: DEFAULT_CYCLE_TIMEOUT_SECS,
        }
    }
}

impl KeeperConfig {
    pub fn funding_threshold(&self) -> Result<U256, ConfigError> {
        let threshold = U256::from_dec_str(&self.funding_threshold_wei).map_err(|e| {
            ConfigError::Invalid(format!(
                "funding_threshold_wei {}: {e}",
                self.funding_threshold_wei
            ))
        })?;
        if threshold.is_zero() {
            return Err(ConfigError::Invalid(
                "funding_threshold_wei must be positive".into(),
            ));
        }
        Ok(threshold)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("./artifacts")
}
fn default_confirmations() -> usize {
    DEFAULT_CONFIRMATIONS
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_page_size() -> u32 {
    DEFAULT_PROVISIONING_PAGE_SIZE
}
fn default_provisioning_poll_ms() -> u64 {
    DEFAULT_PROVISIONING_POLL_MS
}
fn default_per_poll_retries() -> u32 {
    DEFAULT_PER_POLL_RETRIES
}
fn default_verify_retry_secs() -> u64 {
    DEFAULT_VERIFY_RETRY_SECS
}
fn default_verify_status_poll_secs() -> u64 {
    DEFAULT_VERIFY_STATUS_POLL_SECS
}

impl NetworkConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let reader = BufReader::new(File::open(path)?);
        let config: NetworkConfig = serde_json::from_reader(reader)?;
        config.keeper.funding_threshold()?;
        Ok(config)
    }

    /// `./conf/<network>.json`
    pub fn path_for_network(network: &str) -> PathBuf {
        Path::new(CONFIG_DIR).join(format!("{network}.json"))
    }

    pub fn provisioning(&self) -> Result<&ProvisioningConfig, ConfigError> {
        self.provisioning.as_ref().ok_or_else(|| {
            ConfigError::Invalid(format!("{} has no provisioning section", self.network_name))
        })
    }

    pub fn explorer(&self) -> Result<&ExplorerConfig, ConfigError> {
        self.explorer.as_ref().ok_or_else(|| {
            ConfigError::Invalid(format!("{} has no explorer section", self.network_name))
        })
    }
}

pub fn env_secret(var: &'static str) -> Result<String, ConfigError> {
    match std::env::var(var) {
        Ok(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(ConfigError::MissingEnv(var)),
    }
}
