//! Configuration management for the transaction manager node
//!
//! Loads configuration from a TOML file with `${VAR}` environment variable
//! substitution, then applies `TXM__SECTION__KEY` environment overrides.

use crate::engine::ReaperPolicy;
use crate::error::TxmResult;
use crate::tx::{FeeModel, GasPolicy, RetryPolicy};

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub node: NodeConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub keys: Vec<KeyConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub instance_id: String,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    /// Unstarted transactions allowed per account; 0 is unlimited
    #[serde(default = "default_max_queued")]
    pub max_queued: u64,
    /// InProgress transactions allowed per account; 0 is unlimited
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: u64,
    #[serde(default = "default_process_head_timeout")]
    pub process_head_timeout_secs: u64,
}

impl NodeConfig {
    pub fn process_head_timeout(&self) -> Duration {
        Duration::from_secs(self.process_head_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// Fallback filter when RUST_LOG is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            filter: default_log_filter(),
        }
    }
}

/// Retry bounds for `eth_sendRawTransaction` and receipt queries
#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
}

impl BroadcastConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
            Duration::from_millis(self.send_timeout_ms),
        )
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: default_send_timeout(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
        }
    }
}

/// Deletion of finished transactions from the ledger
#[derive(Debug, Clone, Deserialize)]
pub struct ReaperConfig {
    /// 0 disables the reaper
    #[serde(default = "default_reaper_interval")]
    pub interval_secs: u64,
    /// Minimum age of a finished transaction before it is deleted
    #[serde(default = "default_reaper_threshold")]
    pub threshold_secs: u64,
}

impl ReaperConfig {
    pub fn policy(&self) -> Option<ReaperPolicy> {
        if self.interval_secs == 0 {
            return None;
        }
        Some(ReaperPolicy {
            interval: Duration::from_secs(self.interval_secs),
            threshold: Duration::from_secs(self.threshold_secs),
        })
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reaper_interval(),
            threshold_secs: default_reaper_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
    pub fee_model: FeeModel,
    /// Blocks without confirmation before a gas bump; 0 disables bumping
    pub bump_threshold: u64,
    pub bump_multiplier: f64,
    pub max_fee_gwei: u64,
    pub confirmation_depth: u64,
    /// Defaults to twice the confirmation depth
    pub reorg_window: Option<u64>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Seconds before an unconfirmed attempt is sent again unchanged; 0 disables
    #[serde(default = "default_resend_after")]
    pub resend_after_secs: u64,
    pub enabled: bool,
}

impl ChainConfig {
    /// Build the gas policy passed to the confirmer and rebroadcaster
    pub fn gas_policy(&self) -> TxmResult<GasPolicy> {
        let mut policy = GasPolicy::new(
            self.fee_model,
            self.bump_threshold,
            self.bump_multiplier,
            self.max_fee_gwei,
            self.confirmation_depth,
        )?
        .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
        .with_resend_after(Duration::from_secs(self.resend_after_secs));

        if let Some(window) = self.reorg_window {
            policy = policy.with_reorg_window(window);
        }
        Ok(policy)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyConfig {
    /// Name of the environment variable holding the hex private key
    pub private_key_env: String,
    pub chain_ids: Vec<u64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_max_queued() -> u64 {
    250
}

fn default_max_in_flight() -> u64 {
    16
}

fn default_process_head_timeout() -> u64 {
    600
}

fn default_log_filter() -> String {
    "info,oracle_txm=debug,sqlx=warn,hyper=warn".to_string()
}

fn default_send_timeout() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_base_delay() -> u64 {
    200
}

fn default_retry_max_delay() -> u64 {
    5_000
}

fn default_poll_interval() -> u64 {
    2_000
}

fn default_resend_after() -> u64 {
    60
}

fn default_reaper_interval() -> u64 {
    3_600
}

fn default_reaper_threshold() -> u64 {
    7 * 24 * 3_600
}

fn default_true() -> bool {
    true
}

impl Settings {
    /// Load settings from the file named by `TXM_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("TXM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file, applying environment overrides
    pub fn load_from(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings = config::Config::builder()
            .add_source(config::File::from_str(&config_str, config::FileFormat::Toml))
            .add_source(config::Environment::with_prefix("TXM").separator("__"))
            .build()
            .with_context(|| "Failed to assemble configuration")?
            .try_deserialize()
            .with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Parse settings from TOML text without environment overrides
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(&substitute_env_vars(input))
            .with_context(|| "Failed to parse configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        // At least one chain must be enabled
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        for (name, chain) in self.enabled_chains() {
            if chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
            chain
                .gas_policy()
                .with_context(|| format!("Chain {} has an invalid gas policy", name))?;
        }

        for key in &self.keys {
            if key.chain_ids.is_empty() {
                tracing::warn!("Key {} is not enabled for any chain", key.private_key_env);
            }
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        let mut chains: Vec<_> = self.chains.iter().filter(|(_, c)| c.enabled).collect();
        chains.sort_by_key(|(_, c)| c.chain_id);
        chains
    }

    /// Get chain config by chain ID
    pub fn get_chain_by_id(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.values().find(|c| c.chain_id == chain_id)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex");
    }

    ENV_VAR
        .replace_all(input, |caps: &regex::Captures| {
            env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[node]
instance_id = "txm-test"
max_queued = 10

[database]
url = "postgres://localhost/txm"
max_connections = 5
min_connections = 1

[api]
host = "127.0.0.1"
port = 8080

[metrics]
enabled = false
port = 9090

[chains.sepolia]
chain_id = 11155111
rpc_urls = ["${TXM_TEST_RPC_URL}"]
fee_model = "eip1559"
bump_threshold = 3
bump_multiplier = 1.2
max_fee_gwei = 500
confirmation_depth = 12
enabled = true

[chains.disabled]
chain_id = 5
rpc_urls = []
fee_model = "legacy"
bump_threshold = 3
bump_multiplier = 1.1
max_fee_gwei = 100
confirmation_depth = 6
reorg_window = 50
resend_after_secs = 0
enabled = false

[[keys]]
private_key_env = "TXM_TEST_KEY"
chain_ids = [11155111]
"#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TXM_TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TXM_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_load_from_file_with_defaults() {
        env::set_var("TXM_TEST_RPC_URL", "http://localhost:8545");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.node.max_queued, 10);
        assert_eq!(settings.node.max_in_flight, 16);
        assert_eq!(settings.broadcast.max_retries, 5);
        assert_eq!(settings.logging.format, LogFormat::Text);
        assert!(settings.keys[0].enabled);

        let enabled = settings.enabled_chains();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].1.rpc_urls, vec!["http://localhost:8545".to_string()]);

        let policy = enabled[0].1.gas_policy().unwrap();
        assert_eq!(policy.reorg_window, 24);
        assert_eq!(policy.bump_permille, 1200);
        assert_eq!(policy.resend_after, Duration::from_secs(60));

        let disabled = settings.get_chain_by_id(5).unwrap();
        let policy = disabled.gas_policy().unwrap();
        assert_eq!(policy.reorg_window, 50);
        assert!(policy.resend_after.is_zero());

        let reaper = settings.reaper.policy().unwrap();
        assert_eq!(reaper.interval, Duration::from_secs(3_600));
        assert_eq!(reaper.threshold, Duration::from_secs(604_800));
    }

    #[test]
    fn test_reaper_can_be_disabled() {
        env::set_var("TXM_TEST_RPC_URL", "http://localhost:8545");
        let toml = format!("{}\n[reaper]\ninterval_secs = 0\n", SAMPLE);
        let settings = Settings::from_toml_str(&toml).unwrap();
        assert!(settings.reaper.policy().is_none());
    }

    #[test]
    fn test_rejects_non_increasing_multiplier() {
        env::set_var("TXM_TEST_RPC_URL", "http://localhost:8545");
        let bad = SAMPLE.replacen("bump_multiplier = 1.2", "bump_multiplier = 1.0", 1);
        assert!(Settings::from_toml_str(&bad).is_err());
    }

    #[test]
    fn test_requires_an_enabled_chain() {
        let none = SAMPLE.replacen("enabled = true", "enabled = false", 1);
        assert!(Settings::from_toml_str(&none).is_err());
    }
}
