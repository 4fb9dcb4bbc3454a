//! Per-chain deployment: endpoints, contract addresses, venues, alerts.
//!
//! ```toml
//! chain_id = 8453
//! rpc_url = "${BASE_RPC_URL}"
//! leverage_manager = "0x..."
//! rebalancer = "0x..."
//! registry_path = "data/leverage_tokens.json"
//!
//! [gas]
//! model = "eip1559"
//!
//! [uniswap_v3]
//! swap_router = "0x..."
//! quoter_v2 = "0x..."
//! ```

use alloy::primitives::Address;
use rebalancer_chain::GasPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Full deployment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Deployment name for logs
    #[serde(default = "default_name")]
    pub name: String,
    pub chain_id: u64,
    /// HTTP RPC endpoint (`${VAR}` expanded)
    pub rpc_url: String,
    pub leverage_manager: Address,
    /// Rebalancer executor contract
    pub rebalancer: Address,
    #[serde(default = "default_registry_path")]
    pub registry_path: String,
    /// First block scanned for token creation events
    #[serde(default)]
    pub discovery_start_block: Option<u64>,
    #[serde(default)]
    pub gas: GasPolicy,
    #[serde(default)]
    pub uniswap_v2: Option<UniswapV2Venue>,
    #[serde(default)]
    pub uniswap_v3: Option<UniswapV3Venue>,
    #[serde(default)]
    pub aggregator: Option<AggregatorVenue>,
    #[serde(default)]
    pub erc4626_vaults: Vec<Erc4626Vault>,
    #[serde(default)]
    pub telegram: Option<TelegramSettings>,
}

fn default_name() -> String {
    "leverage-tokens".to_string()
}

fn default_registry_path() -> String {
    "data/leverage_tokens.json".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniswapV2Venue {
    pub router: Address,
    /// Intermediate token for two-hop paths (usually WETH)
    #[serde(default)]
    pub connector: Option<Address>,
    #[serde(default)]
    pub venue: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniswapV3Venue {
    pub swap_router: Address,
    pub quoter_v2: Address,
    /// Near-parity pairs tried on low fee tiers first
    #[serde(default)]
    pub correlated_pairs: Vec<(Address, Address)>,
    #[serde(default)]
    pub venue: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorVenue {
    pub base_url: String,
    /// API key (`${VAR}` expanded)
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Erc4626Vault {
    pub vault: Address,
    /// Underlying asset
    pub asset: Address,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramSettings {
    pub chat_id: String,
}

impl DeploymentConfig {
    /// Load a deployment TOML and expand `${VAR}` references.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let mut config: DeploymentConfig = toml::from_str(content)?;
        config.expand_env_vars();
        if config.rpc_url.contains("${") {
            anyhow::bail!("rpc_url references an unset environment variable: {}", config.rpc_url);
        }
        Ok(config)
    }

    /// Expand environment variables in string values.
    pub fn expand_env_vars(&mut self) {
        self.rpc_url = expand_env(&self.rpc_url);
        if let Some(aggregator) = self.aggregator.as_mut() {
            aggregator.base_url = expand_env(&aggregator.base_url);
            if let Some(key) = aggregator.api_key.as_mut() {
                *key = expand_env(key);
            }
        }
    }

    /// Number of configured quote venues.
    pub fn venue_count(&self) -> usize {
        self.uniswap_v2.is_some() as usize
            + self.uniswap_v3.is_some() as usize
            + self.aggregator.is_some() as usize
            + self.erc4626_vaults.len()
    }
}

/// Expand `${VAR_NAME}` patterns with environment variable values.
/// Unset variables are left as-is.
pub fn expand_env(s: &str) -> String {
    let Ok(re) = regex_lite::Regex::new(r"\$\{([^}]+)\}") else {
        return s.to_string();
    };
    re.replace_all(s, |caps: &regex_lite::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}
