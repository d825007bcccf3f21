//! Configuration management for txguard
//!
//! Loads configuration from TOML files with environment variable substitution
//! and validates it before any component is constructed.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid regex");
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    pub chain: ChainConfig,
    pub signer: SignerConfig,
    #[serde(default)]
    pub gas: GasConfig,
    #[serde(default)]
    pub nonce: NonceConfig,
    #[serde(default)]
    pub sender: SenderConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub instance_id: String,
    pub health_check_interval_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            instance_id: "txguard-0".to_string(),
            health_check_interval_secs: 30,
        }
    }
}

/// PostgreSQL settings for the intent store. Without a URL the in-memory store is used.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            min_connections: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    15
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SignerBackend {
    Local,
    Remote,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignerConfig {
    pub backend: SignerBackend,
    /// Hex private key, usually supplied through `${VAR}` substitution
    pub private_key: Option<String>,
    /// Name of an environment variable holding the hex private key
    pub private_key_env: Option<String>,
    pub kms_key_id: Option<String>,
    pub kms_region: Option<String>,
}

impl SignerConfig {
    /// Resolve local key material from the inline value or the named env var
    pub fn local_key_material(&self) -> Option<String> {
        if let Some(key) = self.private_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Some(key.trim().to_string());
        }
        self.private_key_env
            .as_ref()
            .and_then(|name| env::var(name).ok())
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
    }

    /// Remote key id and region, both required for the remote backend
    pub fn remote_key(&self) -> Option<(&str, &str)> {
        let key_id = self.kms_key_id.as_deref().filter(|k| !k.is_empty())?;
        let region = self.kms_region.as_deref().filter(|r| !r.is_empty())?;
        Some((key_id, region))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GasConfig {
    /// Hard ceiling on maxFeePerGas
    pub max_fee_cap_gwei: f64,
    /// Priority fee bid on fee-market chains
    pub priority_fee_gwei: f64,
    /// Priority fee never goes below this
    pub min_priority_fee_gwei: f64,
    pub surge_multiplier: f64,
    /// Multiplier applied to eth_gasPrice on chains without a base fee
    pub legacy_multiplier: f64,
    pub bump_percent: u64,
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            max_fee_cap_gwei: 150.0,
            priority_fee_gwei: 2.0,
            min_priority_fee_gwei: 1.0,
            surge_multiplier: 1.2,
            legacy_multiplier: 1.2,
            bump_percent: 15,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NonceStoreKind {
    Memory,
    Distributed,
    Hybrid,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NonceConfig {
    pub store: NonceStoreKind,
    pub redis_url: Option<String>,
    pub key_prefix: String,
    pub cache_ttl_secs: u64,
    pub lock_wait_ms: u64,
    pub lock_hold_ms: u64,
    pub lock_retry_interval_ms: u64,
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            store: NonceStoreKind::Memory,
            redis_url: None,
            key_prefix: "txguard".to_string(),
            cache_ttl_secs: 300,
            lock_wait_ms: 5_000,
            lock_hold_ms: 10_000,
            lock_retry_interval_ms: 50,
        }
    }
}

impl NonceConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn lock_hold(&self) -> Duration {
        Duration::from_millis(self.lock_hold_ms)
    }

    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub send_timeout_secs: u64,
    pub gas_limit_buffer_percent: u64,
    pub fallback_gas_limit: u64,
    pub intent_bucket_secs: u64,
    pub receipt_poll_interval_ms: u64,
    pub receipt_timeout_secs: u64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 500,
            send_timeout_secs: 30,
            gas_limit_buffer_percent: 20,
            fallback_gas_limit: 500_000,
            intent_bucket_secs: 1,
            receipt_poll_interval_ms: 2_000,
            receipt_timeout_secs: 120,
        }
    }
}

impl SenderConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }
}

impl Settings {
    /// Load settings from the file named by `TXGUARD_CONFIG` (default `config/default.toml`)
    pub fn load() -> Result<Self> {
        let config_path = env::var("TXGUARD_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml_str(&config_str)
    }

    /// Parse and validate settings from TOML text
    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration; any failure here blocks service start
    fn validate(&self) -> Result<()> {
        if self.chain.rpc_urls.is_empty() {
            anyhow::bail!("Chain {} has no RPC URLs configured", self.chain.name);
        }

        match self.signer.backend {
            SignerBackend::Local => {
                if self.signer.local_key_material().is_none() {
                    anyhow::bail!(
                        "Local signer selected but no key material: set signer.private_key or signer.private_key_env"
                    );
                }
            }
            SignerBackend::Remote => {
                if self.signer.remote_key().is_none() {
                    anyhow::bail!(
                        "Remote signer selected but signer.kms_key_id or signer.kms_region is missing"
                    );
                }
            }
        }

        let gas = &self.gas;
        if gas.max_fee_cap_gwei <= 0.0 {
            anyhow::bail!("gas.max_fee_cap_gwei must be positive");
        }
        if gas.priority_fee_gwei > gas.max_fee_cap_gwei
            || gas.min_priority_fee_gwei > gas.max_fee_cap_gwei
        {
            anyhow::bail!("Priority fee settings exceed gas.max_fee_cap_gwei");
        }
        if gas.priority_fee_gwei < 0.0 || gas.min_priority_fee_gwei < 0.0 {
            anyhow::bail!("Priority fee settings must not be negative");
        }
        if gas.surge_multiplier < 1.0 || gas.legacy_multiplier < 1.0 {
            anyhow::bail!("gas.surge_multiplier and gas.legacy_multiplier must be >= 1.0");
        }
        if gas.bump_percent == 0 {
            anyhow::bail!("gas.bump_percent must be positive");
        }

        let nonce = &self.nonce;
        if nonce.store != NonceStoreKind::Memory
            && nonce.redis_url.as_deref().unwrap_or("").is_empty()
        {
            anyhow::bail!("nonce.redis_url is required for the {:?} nonce store", nonce.store);
        }
        if nonce.cache_ttl_secs == 0 || nonce.lock_wait_ms == 0 || nonce.lock_hold_ms == 0 {
            anyhow::bail!("nonce cache TTL and lock bounds must be positive");
        }

        if self.sender.intent_bucket_secs == 0 {
            anyhow::bail!("sender.intent_bucket_secs must be positive");
        }

        if self.database.url.is_none() {
            tracing::warn!("No database URL configured - idempotency records will not survive restarts");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();

    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
