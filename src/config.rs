//! Configuration management for the swap coordinator
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub service: ServiceConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    pub swap: SwapConfig,
    pub database: Option<DatabaseConfig>,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub pairs: Vec<PairConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub instance_id: String,
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_ms: u64,
    pub call_timeout_ms: u64,
    pub max_concurrent_monitors: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub event_buffer: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            call_timeout_ms: 8_000,
            max_concurrent_monitors: 256,
            max_retries: 5,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            event_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwapConfig {
    pub src_timelock_secs: u64,
    pub dst_timelock_secs: u64,
    #[serde(default)]
    pub auto_fund_destination: bool,
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

/// Chain families with an adapter implementation
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    Evm,
    Tron,
    Bitcoin,
    Ton,
}

impl ChainKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainKind::Evm => "evm",
            ChainKind::Tron => "tron",
            ChainKind::Bitcoin => "bitcoin",
            ChainKind::Ton => "ton",
        }
    }

    /// Finality depth used when a chain does not override it
    pub fn default_confirmations(&self) -> u64 {
        match self {
            ChainKind::Evm => 12,
            ChainKind::Tron => 19,
            ChainKind::Bitcoin => 6,
            ChainKind::Ton => 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub kind: ChainKind,
    pub name: String,
    /// JSON-RPC endpoints (EVM, failover order) or the HTTP API base URL
    pub rpc_urls: Vec<String>,
    /// HTLC registry contract (EVM, Tron, TON)
    #[serde(default)]
    pub contract_address: String,
    pub confirmation_blocks: Option<u64>,
    /// Name of the environment variable holding the signing key
    pub private_key_env: String,
    #[serde(default)]
    pub tokens: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    // EVM
    pub chain_id: Option<u64>,
    #[serde(default)]
    pub gas_price_strategy: GasPriceStrategy,
    #[serde(default = "default_max_gas_price_gwei")]
    pub max_gas_price_gwei: u64,
    #[serde(default = "default_log_lookback")]
    pub log_lookback_blocks: u64,

    // Tron and TON
    pub api_key_env: Option<String>,
    #[serde(default = "default_fee_limit")]
    pub fee_limit: u64,

    // Bitcoin
    pub network: Option<String>,
    #[serde(default = "default_fee_rate")]
    pub fee_rate_sat_vb: u64,

    // TON
    pub index_url: Option<String>,
    pub wallet_address: Option<String>,
    pub subwallet_id: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    #[default]
    Eip1559,
}

/// A supported swap direction with a fixed integer rate
#[derive(Debug, Clone, Deserialize)]
pub struct PairConfig {
    pub from_chain: String,
    pub from_token: String,
    pub to_chain: String,
    pub to_token: String,
    pub rate_numerator: u128,
    pub rate_denominator: u128,
}

impl PairConfig {
    pub fn matches(&self, from_chain: &str, from_token: &str, to_chain: &str, to_token: &str) -> bool {
        self.from_chain == from_chain
            && self.from_token.eq_ignore_ascii_case(from_token)
            && self.to_chain == to_chain
            && self.to_token.eq_ignore_ascii_case(to_token)
    }

    /// Amount the counter-party locks for a given source amount
    pub fn quote(&self, amount: u128) -> Option<u128> {
        amount
            .checked_mul(self.rate_numerator)
            .map(|v| v / self.rate_denominator)
    }
}

fn default_health_interval() -> u64 {
    30
}

fn default_enabled() -> bool {
    true
}

fn default_max_gas_price_gwei() -> u64 {
    500
}

fn default_log_lookback() -> u64 {
    50_000
}

fn default_fee_limit() -> u64 {
    100_000_000
}

fn default_fee_rate() -> u64 {
    10
}

impl ChainConfig {
    pub fn required_confirmations(&self) -> u64 {
        self.confirmation_blocks
            .unwrap_or_else(|| self.kind.default_confirmations())
            .max(1)
    }

    pub fn supports_token(&self, token: &str) -> bool {
        self.tokens.iter().any(|t| t.eq_ignore_ascii_case(token))
    }
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("SWAP_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::from_path(&config_path)
    }

    pub fn from_path(config_path: &PathBuf) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml(&config_str)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(raw);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        for (name, chain) in &self.chains {
            if chain.enabled {
                if chain.rpc_urls.is_empty() {
                    anyhow::bail!("Chain {} has no RPC URLs configured", name);
                }
                if chain.kind == ChainKind::Evm && chain.chain_id.is_none() {
                    anyhow::bail!("EVM chain {} needs a chain_id", name);
                }
                if chain.kind == ChainKind::Ton && chain.wallet_address.is_none() {
                    anyhow::bail!("TON chain {} needs a wallet_address", name);
                }
                if chain.kind != ChainKind::Bitcoin && chain.contract_address.is_empty() {
                    anyhow::bail!("Chain {} has no HTLC contract address", name);
                }
                if chain.tokens.is_empty() {
                    tracing::warn!("Chain {} lists no tokens - no pair can use it", name);
                }
            }
        }

        if self.swap.dst_timelock_secs == 0 {
            anyhow::bail!("dst_timelock_secs must be positive");
        }
        if self.swap.dst_timelock_secs >= self.swap.src_timelock_secs {
            anyhow::bail!(
                "dst_timelock_secs ({}) must be strictly less than src_timelock_secs ({})",
                self.swap.dst_timelock_secs,
                self.swap.src_timelock_secs
            );
        }

        if self.monitor.poll_interval_ms == 0 || self.monitor.max_concurrent_monitors == 0 {
            anyhow::bail!("poll_interval_ms and max_concurrent_monitors must be positive");
        }

        for pair in &self.pairs {
            if pair.rate_denominator == 0 {
                anyhow::bail!(
                    "Pair {}:{} -> {}:{} has a zero rate denominator",
                    pair.from_chain,
                    pair.from_token,
                    pair.to_chain,
                    pair.to_token
                );
            }
            for (chain, token) in [
                (&pair.from_chain, &pair.from_token),
                (&pair.to_chain, &pair.to_token),
            ] {
                match self.chains.get(chain) {
                    Some(c) if c.enabled && c.supports_token(token) => {}
                    Some(c) if c.enabled => {
                        anyhow::bail!("Pair references token {} not listed on chain {}", token, chain)
                    }
                    _ => anyhow::bail!("Pair references unknown or disabled chain {}", chain),
                }
            }
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }
}

/// Find the pair configuration for a swap direction
pub fn find_pair<'a>(
    pairs: &'a [PairConfig],
    from_chain: &str,
    from_token: &str,
    to_chain: &str,
    to_token: &str,
) -> Option<&'a PairConfig> {
    pairs
        .iter()
        .find(|p| p.matches(from_chain, from_token, to_chain, to_token))
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex");
    }

    let mut result = input.to_string();
    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) const SAMPLE: &str = r#"
[service]
instance_id = "test"

[monitor]
poll_interval_ms = 1000

[swap]
src_timelock_secs = 7200
dst_timelock_secs = 3600

[api]
host = "127.0.0.1"
port = 8080

[metrics]
enabled = false
port = 9090

[chains.sepolia]
kind = "evm"
name = "Sepolia"
chain_id = 11155111
rpc_urls = ["https://rpc.sepolia.example"]
contract_address = "0x1111111111111111111111111111111111111111"
private_key_env = "SEPOLIA_KEY"
tokens = ["ETH"]

[chains.btc]
kind = "bitcoin"
name = "Bitcoin testnet"
network = "testnet"
rpc_urls = ["https://esplora.example/testnet/api"]
private_key_env = "BTC_WIF"
tokens = ["BTC"]

[[pairs]]
from_chain = "btc"
from_token = "BTC"
to_chain = "sepolia"
to_token = "ETH"
rate_numerator = 150000000000
rate_denominator = 1
"#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("SWAP_TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${SWAP_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_sample_config_parses() {
        let settings = Settings::from_toml(SAMPLE).unwrap();
        assert_eq!(settings.enabled_chains().len(), 2);
        assert_eq!(settings.monitor.poll_interval_ms, 1000);
        assert_eq!(settings.monitor.call_timeout_ms, 8000);
        assert_eq!(settings.chains["btc"].required_confirmations(), 6);
        assert_eq!(settings.chains["sepolia"].gas_price_strategy, GasPriceStrategy::Eip1559);

        let pair = find_pair(&settings.pairs, "btc", "btc", "sepolia", "ETH").unwrap();
        assert_eq!(pair.quote(2), Some(300_000_000_000));
        assert!(find_pair(&settings.pairs, "sepolia", "ETH", "btc", "BTC").is_none());
    }

    #[test]
    fn test_reversed_timelocks_rejected() {
        let raw = SAMPLE.replace("dst_timelock_secs = 3600", "dst_timelock_secs = 7200");
        let err = Settings::from_toml(&raw).unwrap_err();
        assert!(err.to_string().contains("strictly less"));
    }

    #[test]
    fn test_pair_with_unknown_token_rejected() {
        let raw = SAMPLE.replace("to_token = \"ETH\"", "to_token = \"USDC\"");
        assert!(Settings::from_toml(&raw).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let settings = Settings::from_path(&file.path().to_path_buf()).unwrap();
        assert_eq!(settings.service.instance_id, "test");
    }
}
