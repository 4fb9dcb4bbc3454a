//! Gas pricing policy.
//!
//! Two pricing models:
//! - `Legacy`: single `gasPrice` from `eth_gasPrice`, capped
//! - `Eip1559`: `maxFeePerGas = base_fee * multiplier + tip`, capped
//!
//! ```toml
//! [gas]
//! model = "eip1559"
//! priority_fee_gwei = 0.01
//! max_fee_multiplier = 2.0
//! max_fee_gwei = 50.0
//! ```

use alloy::eips::BlockNumberOrTag;
use alloy::network::TransactionBuilder;
use alloy::providers::Provider;
use alloy::rpc::types::TransactionRequest;
use anyhow::Result;
use serde::{Deserialize, Serialize};

const GWEI: f64 = 1e9;

/// Fallback base fee when the latest block carries none.
const FALLBACK_BASE_FEE: u128 = 1_000_000_000;

/// Configured gas pricing model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "lowercase")]
pub enum GasPolicy {
    Legacy {
        #[serde(default = "default_gas_price_gwei")]
        default_gas_price_gwei: f64,
        #[serde(default = "default_max_fee_gwei")]
        max_gas_price_gwei: f64,
    },
    Eip1559 {
        #[serde(default = "default_priority_fee_gwei")]
        priority_fee_gwei: f64,
        #[serde(default = "default_max_fee_multiplier")]
        max_fee_multiplier: f64,
        #[serde(default = "default_max_fee_gwei")]
        max_fee_gwei: f64,
    },
}

fn default_gas_price_gwei() -> f64 {
    1.0
}

fn default_max_fee_gwei() -> f64 {
    100.0
}

fn default_priority_fee_gwei() -> f64 {
    0.01
}

fn default_max_fee_multiplier() -> f64 {
    2.0
}

impl Default for GasPolicy {
    fn default() -> Self {
        GasPolicy::Eip1559 {
            priority_fee_gwei: default_priority_fee_gwei(),
            max_fee_multiplier: default_max_fee_multiplier(),
            max_fee_gwei: default_max_fee_gwei(),
        }
    }
}

/// Gas parameters resolved for one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasParams {
    Legacy {
        gas_price: u128,
    },
    Eip1559 {
        max_fee_per_gas: u128,
        max_priority_fee_per_gas: u128,
    },
}

impl GasParams {
    /// Upper bound paid per gas unit.
    pub fn effective_gas_price(&self) -> u128 {
        match self {
            GasParams::Legacy { gas_price } => *gas_price,
            GasParams::Eip1559 { max_fee_per_gas, .. } => *max_fee_per_gas,
        }
    }

    /// Write the pricing fields onto `tx`.
    pub fn apply(&self, tx: &mut TransactionRequest) {
        match *self {
            GasParams::Legacy { gas_price } => tx.set_gas_price(gas_price),
            GasParams::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                tx.set_max_fee_per_gas(max_fee_per_gas);
                tx.set_max_priority_fee_per_gas(max_priority_fee_per_gas);
            }
        }
    }
}

impl GasPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            GasPolicy::Legacy { .. } => "Legacy",
            GasPolicy::Eip1559 { .. } => "EIP-1559",
        }
    }

    /// Query the chain and resolve parameters for the next transaction.
    pub async fn fetch_params<P: Provider>(&self, provider: &P) -> Result<GasParams> {
        match *self {
            GasPolicy::Legacy {
                default_gas_price_gwei,
                max_gas_price_gwei,
            } => {
                let fallback = gwei_to_wei(default_gas_price_gwei);
                let gas_price = provider.get_gas_price().await.unwrap_or(fallback);
                Ok(GasParams::Legacy {
                    gas_price: gas_price.min(gwei_to_wei(max_gas_price_gwei)),
                })
            }
            GasPolicy::Eip1559 {
                priority_fee_gwei,
                max_fee_multiplier,
                max_fee_gwei,
            } => {
                let block = provider
                    .get_block_by_number(BlockNumberOrTag::Latest)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("Failed to get latest block"))?;
                let base_fee = block
                    .header
                    .base_fee_per_gas
                    .map(|b| b as u128)
                    .unwrap_or(FALLBACK_BASE_FEE);
                let tip = provider
                    .get_max_priority_fee_per_gas()
                    .await
                    .unwrap_or_else(|_| gwei_to_wei(priority_fee_gwei));

                Ok(self.eip1559_params(base_fee, tip, max_fee_multiplier, max_fee_gwei))
            }
        }
    }

    fn eip1559_params(&self, base_fee: u128, tip: u128, multiplier: f64, cap_gwei: f64) -> GasParams {
        let cap = gwei_to_wei(cap_gwei);
        let max_fee = (((base_fee as f64) * multiplier) as u128 + tip).min(cap);
        GasParams::Eip1559 {
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: tip.min(max_fee),
        }
    }
}

fn gwei_to_wei(gwei: f64) -> u128 {
    (gwei * GWEI) as u128
}
