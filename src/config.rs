//! Configuration management for the transaction manager
//!
//! Loads configuration from a TOML file with environment variable substitution,
//! then layers `TON_TXM__SECTION__KEY` environment overrides on top.

use crate::cell::Address;
use crate::wallet::{WalletIdentity, WalletVersion};

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex");
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub txm: TxmConfig,
    pub node: NodeConfig,
    pub wallets: Vec<WalletConfig>,
    #[serde(default)]
    pub keystore: KeystoreConfig,
    #[serde(default)]
    pub fees: FeeConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_confirm_poll_secs() -> f64 {
    2.0
}
fn default_max_broadcast_retries() -> u32 {
    3
}
fn default_broadcast_retry_delay_ms() -> u64 {
    500
}
fn default_max_inflight_batches() -> usize {
    4
}
fn default_root_lookup_retries() -> u32 {
    10
}
fn default_max_trace_depth() -> usize {
    8
}
fn default_max_trace_nodes() -> usize {
    64
}
fn default_queue_capacity() -> usize {
    100
}
fn default_close_grace_secs() -> u64 {
    10
}
fn default_list_batch_size() -> usize {
    20
}
fn default_terminal_retention_secs() -> u64 {
    3600
}

/// Transaction manager tuning
#[derive(Debug, Clone, Deserialize)]
pub struct TxmConfig {
    #[serde(default = "default_confirm_poll_secs")]
    pub confirm_poll_secs: f64,
    /// Broadcast attempts per batch before it is Failed
    #[serde(default = "default_max_broadcast_retries")]
    pub max_broadcast_retries: u32,
    /// Delay before the second attempt; doubles per attempt
    #[serde(default = "default_broadcast_retry_delay_ms")]
    pub broadcast_retry_delay_ms: u64,
    #[serde(default = "default_max_inflight_batches")]
    pub max_inflight_batches: usize,
    /// Clamped to the wallet limit; `None` means the wallet limit
    #[serde(default)]
    pub max_messages_per_batch: Option<usize>,
    #[serde(default)]
    pub batch_max_wait_ms: u64,
    #[serde(default = "default_root_lookup_retries")]
    pub root_lookup_retries: u32,
    #[serde(default = "default_max_trace_depth")]
    pub max_trace_depth: usize,
    #[serde(default = "default_max_trace_nodes")]
    pub max_trace_nodes: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_close_grace_secs")]
    pub close_grace_secs: u64,
    /// Page size for transaction listings
    #[serde(default = "default_list_batch_size")]
    pub list_batch_size: usize,
    /// How long terminal request records stay queryable
    #[serde(default = "default_terminal_retention_secs")]
    pub terminal_retention_secs: u64,
}

impl Default for TxmConfig {
    fn default() -> Self {
        Self {
            confirm_poll_secs: default_confirm_poll_secs(),
            max_broadcast_retries: default_max_broadcast_retries(),
            broadcast_retry_delay_ms: default_broadcast_retry_delay_ms(),
            max_inflight_batches: default_max_inflight_batches(),
            max_messages_per_batch: None,
            batch_max_wait_ms: 0,
            root_lookup_retries: default_root_lookup_retries(),
            max_trace_depth: default_max_trace_depth(),
            max_trace_nodes: default_max_trace_nodes(),
            queue_capacity: default_queue_capacity(),
            close_grace_secs: default_close_grace_secs(),
            list_batch_size: default_list_batch_size(),
            terminal_retention_secs: default_terminal_retention_secs(),
        }
    }
}

impl TxmConfig {
    pub fn confirm_poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.confirm_poll_secs.max(0.001))
    }

    pub fn broadcast_retry_delay(&self) -> Duration {
        Duration::from_millis(self.broadcast_retry_delay_ms)
    }

    pub fn batch_max_wait(&self) -> Duration {
        Duration::from_millis(self.batch_max_wait_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_secs(self.close_grace_secs)
    }

    /// Batch size for a wallet version
    pub fn batch_limit(&self, version: &WalletVersion) -> usize {
        let wallet_limit = version.max_messages();
        self.max_messages_per_batch
            .map(|n| n.clamp(1, wallet_limit))
            .unwrap_or(wallet_limit)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.confirm_poll_secs > 0.0) {
            anyhow::bail!("txm.confirm_poll_secs must be positive");
        }
        if self.max_broadcast_retries == 0 {
            anyhow::bail!("txm.max_broadcast_retries must be at least 1");
        }
        if self.max_inflight_batches == 0 {
            anyhow::bail!("txm.max_inflight_batches must be at least 1");
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("txm.queue_capacity must be at least 1");
        }
        if self.max_messages_per_batch == Some(0) {
            anyhow::bail!("txm.max_messages_per_batch must be at least 1");
        }
        if self.max_trace_nodes == 0 {
            anyhow::bail!("txm.max_trace_nodes must be at least 1");
        }
        if self.list_batch_size == 0 {
            anyhow::bail!("txm.list_batch_size must be at least 1");
        }
        Ok(())
    }
}

fn default_request_timeout_secs() -> u64 {
    10
}
fn default_block_poll_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// toncenter base URLs, tried in order on failure
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_block_poll_ms")]
    pub block_poll_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    pub address: String,
    /// Hex Ed25519 public key
    pub public_key: String,
    pub version: WalletVersion,
    /// `.compiled.json` wallet code, attached as state init while the wallet is undeployed
    #[serde(default)]
    pub code_path: Option<String>,
}

impl WalletConfig {
    pub fn identity(&self) -> Result<WalletIdentity> {
        let address: Address = self
            .address
            .parse()
            .with_context(|| format!("Invalid wallet address {}", self.address))?;
        let key = hex::decode(&self.public_key)
            .with_context(|| format!("Invalid public key for wallet {}", self.address))?;
        if key.len() != 32 {
            anyhow::bail!("Public key for wallet {} must be 32 bytes", self.address);
        }
        Ok(WalletIdentity::new(
            address,
            self.public_key.to_lowercase(),
            self.version.clone(),
        ))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeystoreConfig {
    /// Hex Ed25519 seeds, usually injected through `${VAR}` substitution
    #[serde(default)]
    pub seeds: Vec<String>,
}

fn default_gas_buffer_percent() -> u64 {
    20
}
fn default_forward_buffer_percent() -> u64 {
    10
}
fn default_base_gas_fee() -> u64 {
    10_000_000
}
fn default_base_forward_fee() -> u64 {
    1_000_000
}
fn default_per_cell_fee() -> u64 {
    100_000
}
fn default_base_storage_fee() -> u64 {
    1_000
}

/// Parameters of the static fee estimator, in nanotons
#[derive(Debug, Clone, Deserialize)]
pub struct FeeConfig {
    #[serde(default = "default_base_gas_fee")]
    pub base_gas: u64,
    #[serde(default = "default_base_forward_fee")]
    pub base_forward: u64,
    /// Added to the forward fee for every cell of body and state init
    #[serde(default = "default_per_cell_fee")]
    pub per_cell: u64,
    #[serde(default = "default_base_storage_fee")]
    pub base_storage: u64,
    #[serde(default = "default_gas_buffer_percent")]
    pub gas_buffer_percent: u64,
    #[serde(default = "default_forward_buffer_percent")]
    pub forward_buffer_percent: u64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            base_gas: default_base_gas_fee(),
            base_forward: default_base_forward_fee(),
            per_cell: default_per_cell_fee(),
            base_storage: default_base_storage_fee(),
            gas_buffer_percent: default_gas_buffer_percent(),
            forward_buffer_percent: default_forward_buffer_percent(),
        }
    }
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}
fn default_api_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

fn default_metrics_port() -> u16 {
    9090
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
    /// `EnvFilter` directives; `RUST_LOG` wins when set
    #[serde(default)]
    pub filter: Option<String>,
}

impl Settings {
    /// Load settings from the file named by `TON_TXM_CONFIG`, then apply environment overrides
    pub fn load() -> Result<Self> {
        let config_path = env::var("TON_TXM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        let settings: Settings = Config::builder()
            .add_source(File::from_str(
                &substitute_env_vars(&config_str),
                FileFormat::Toml,
            ))
            .add_source(
                Environment::with_prefix("TON_TXM")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("node.endpoints"),
            )
            .build()
            .context("Failed to layer configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from TOML text without environment overrides
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(&substitute_env_vars(input))
            .context("Failed to parse configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        self.txm.validate()?;

        if self.node.endpoints.is_empty() {
            anyhow::bail!("At least one node endpoint must be configured");
        }
        if self.wallets.is_empty() {
            anyhow::bail!("At least one sender wallet must be configured");
        }

        let mut seen = std::collections::HashSet::new();
        for wallet in &self.wallets {
            let identity = wallet.identity()?;
            if !seen.insert(identity.address) {
                anyhow::bail!("Wallet {} is configured twice", wallet.address);
            }
            if let Some(path) = &wallet.code_path {
                if !path.ends_with(".compiled.json") {
                    tracing::warn!(
                        "Wallet {} code {} is not a .compiled.json file",
                        wallet.address,
                        path
                    );
                }
            }
        }

        if self.keystore.seeds.is_empty() {
            tracing::warn!("No keystore seeds configured - signing will fail");
        }

        Ok(())
    }

    pub fn identities(&self) -> Result<Vec<WalletIdentity>> {
        self.wallets.iter().map(WalletConfig::identity).collect()
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR
        .replace_all(input, |caps: &regex::Captures<'_>| {
            env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[txm]
confirm_poll_secs = 0.5
max_messages_per_batch = 10

[node]
endpoints = ["https://toncenter.example/"]
api_key = "${TON_TXM_TEST_API_KEY}"

[[wallets]]
address = "0:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
public_key = "8a88e3dd7409f195fd52db2d3cba5d72ca6709bf1d94121bf3748801b40f6f5c"
version = { type = "HighloadV3", timeout_secs = 300 }

[keystore]
seeds = ["0101010101010101010101010101010101010101010101010101010101010101"]
"#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TON_TXM_TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TON_TXM_TEST_VAR}/endpoint\"";
        assert_eq!(
            substitute_env_vars(input),
            "url = \"https://api.example.com/test_value/endpoint\""
        );
        assert_eq!(substitute_env_vars("${TON_TXM_TEST_UNSET_VAR}"), "");
    }

    #[test]
    fn test_parses_sample_with_defaults() {
        env::set_var("TON_TXM_TEST_API_KEY", "secret");
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        assert_eq!(settings.node.api_key.as_deref(), Some("secret"));
        assert_eq!(settings.txm.max_broadcast_retries, 3);
        assert_eq!(settings.txm.queue_capacity, 100);
        assert_eq!(settings.txm.confirm_poll_interval(), Duration::from_millis(500));
        assert_eq!(settings.api.port, 8080);
        assert!(!settings.logging.json);

        let identities = settings.identities().unwrap();
        assert_eq!(identities.len(), 1);
        assert!(identities[0].version.is_highload());
        assert_eq!(settings.txm.batch_limit(&identities[0].version), 10);
        assert_eq!(settings.txm.batch_limit(&WalletVersion::v3r2()), 4);
    }

    #[test]
    fn test_rejects_invalid_settings() {
        let no_wallets = SAMPLE.split("[[wallets]]").next().unwrap();
        assert!(Settings::from_toml_str(no_wallets).is_err());

        let bad_key = SAMPLE.replace("8a88e3dd", "zz88e3dd");
        assert!(Settings::from_toml_str(&bad_key).is_err());

        let zero_queue = SAMPLE.replace("[txm]", "[txm]\nqueue_capacity = 0");
        assert!(Settings::from_toml_str(&zero_queue).is_err());
    }

    #[test]
    fn test_load_layers_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("txm.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        env::set_var("TON_TXM_CONFIG", &path);
        env::set_var("TON_TXM__TXM__QUEUE_CAPACITY", "7");
        let settings = Settings::load().unwrap();
        env::remove_var("TON_TXM__TXM__QUEUE_CAPACITY");
        env::remove_var("TON_TXM_CONFIG");
        assert_eq!(settings.txm.queue_capacity, 7);
    }
}
