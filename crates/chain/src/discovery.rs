//! Newly created leverage tokens, found by polling manager logs.

use crate::contracts::ILeverageManager;
use crate::types::Position;
use alloy::primitives::Address;
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolEvent;
use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

/// Source of leverage tokens created in a block range.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Tokens created in `[from_block, to_block]`.
    async fn created_between(&self, from_block: u64, to_block: u64) -> Result<Vec<Position>>;
}

/// Polls `LeverageTokenCreated` logs from the leverage manager.
#[derive(Debug, Clone)]
pub struct LeverageTokenDiscovery {
    rpc_url: String,
    leverage_manager: Address,
}

impl LeverageTokenDiscovery {
    pub fn new(rpc_url: impl Into<String>, leverage_manager: Address) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            leverage_manager,
        }
    }
}

#[async_trait]
impl TokenSource for LeverageTokenDiscovery {
    async fn created_between(&self, from_block: u64, to_block: u64) -> Result<Vec<Position>> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.parse()?);
        let filter = Filter::new()
            .address(self.leverage_manager)
            .event_signature(ILeverageManager::LeverageTokenCreated::SIGNATURE_HASH)
            .from_block(from_block)
            .to_block(to_block);

        let logs = provider.get_logs(&filter).await?;
        debug!(from_block, to_block, logs = logs.len(), "Scanned for new leverage tokens");

        Ok(logs.iter().filter_map(parse_created).collect())
    }
}

fn parse_created(log: &Log) -> Option<Position> {
    match log.log_decode::<ILeverageManager::LeverageTokenCreated>() {
        Ok(decoded) => {
            let event = decoded.inner.data;
            Some(Position {
                token: event.token,
                collateral_asset: event.collateralAsset,
                debt_asset: event.debtAsset,
                rebalance_adapter: event.config.rebalanceAdapter,
                lending_adapter: event.config.lendingAdapter,
            })
        }
        Err(e) => {
            warn!(tx = ?log.transaction_hash, error = %e, "Undecodable LeverageTokenCreated log");
            None
        }
    }
}
