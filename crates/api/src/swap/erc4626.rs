//! ERC-4626 yield wrapper venue.
//!
//! Wrapped collateral (e.g. a lending vault share) rarely has direct
//! liquidity. This provider composes an inner route with the vault's
//! `deposit` / `redeem` so the selector can still price it:
//!
//! - buying shares: swap `from -> asset` (inner route), then `deposit`
//! - selling shares: `redeem`, then swap `asset -> to` (inner route)

use super::{
    approve_call, min_amount_out, Call, Quote, QuoteData, QuoteProvider, QuoteRequest, WrapAction,
};
use crate::route::{Plan, RouteSelector};
use alloy::primitives::{Address, U256};
use alloy::providers::ProviderBuilder;
use alloy::sol;
use alloy::sol_types::SolCall;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

sol! {
    #[sol(rpc)]
    interface IERC4626 {
        function previewDeposit(uint256 assets) external view returns (uint256 shares);
        function previewRedeem(uint256 shares) external view returns (uint256 assets);
        function deposit(uint256 assets, address receiver) external returns (uint256 shares);
        function redeem(uint256 shares, address receiver, address owner) external returns (uint256 assets);
    }
}

/// Composite provider for one ERC-4626 vault.
#[derive(Debug, Clone)]
pub struct Erc4626Provider {
    venue: String,
    rpc_url: String,
    vault: Address,
    /// Underlying asset of the vault
    asset: Address,
    /// Selector used for the inner swap leg (must not contain this provider)
    inner: Arc<RouteSelector>,
    slippage_bps: u16,
}

impl Erc4626Provider {
    pub fn new(
        rpc_url: impl Into<String>,
        vault: Address,
        asset: Address,
        inner: Arc<RouteSelector>,
    ) -> Self {
        Self {
            venue: format!("erc4626:{vault}"),
            rpc_url: rpc_url.into(),
            vault,
            asset,
            inner,
            slippage_bps: super::DEFAULT_SLIPPAGE_BPS,
        }
    }

    pub fn with_slippage_bps(mut self, slippage_bps: u16) -> Self {
        self.slippage_bps = slippage_bps;
        self
    }

    /// Which leg this request needs, if any.
    fn action_for(&self, request: &QuoteRequest) -> Option<WrapAction> {
        if request.to == self.vault && request.from != self.vault {
            Some(WrapAction::EnterThenWrap)
        } else if request.from == self.vault && request.to != self.vault {
            Some(WrapAction::UnwrapThenExit)
        } else {
            None
        }
    }

    async fn preview_deposit(&self, assets: U256) -> Result<U256> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.parse()?);
        let vault = IERC4626::new(self.vault, provider);
        Ok(vault.previewDeposit(assets).call().await?.shares)
    }

    async fn preview_redeem(&self, shares: U256) -> Result<U256> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.parse()?);
        let vault = IERC4626::new(self.vault, provider);
        Ok(vault.previewRedeem(shares).call().await?.assets)
    }

    /// Inner leg, skipped when the pair already is the underlying.
    async fn inner_leg(&self, from: Address, to: Address, amount: U256) -> Option<Plan> {
        if from == to {
            return None;
        }
        Some(self.inner.select_best_route(from, to, amount).await)
    }
}

#[async_trait]
impl QuoteProvider for Erc4626Provider {
    fn venue(&self) -> &str {
        &self.venue
    }

    async fn quote(&self, request: &QuoteRequest) -> Result<Option<Quote>> {
        let Some(action) = self.action_for(request) else {
            return Ok(None);
        };

        let (wrap_amount, amount_out, inner) = match action {
            WrapAction::EnterThenWrap => {
                let inner = self.inner_leg(request.from, self.asset, request.amount_in).await;
                let assets = match &inner {
                    Some(plan) if plan.is_empty() => return Ok(None),
                    // Deposit only what the swap is guaranteed to deliver
                    Some(plan) => min_amount_out(plan.amount_out, self.slippage_bps),
                    None => request.amount_in,
                };
                let shares = self.preview_deposit(assets).await?;
                (assets, shares, inner)
            }
            WrapAction::UnwrapThenExit => {
                let assets = self.preview_redeem(request.amount_in).await?;
                let inner = self.inner_leg(self.asset, request.to, assets).await;
                let amount_out = match &inner {
                    Some(plan) if plan.is_empty() => return Ok(None),
                    Some(plan) => plan.amount_out,
                    None => assets,
                };
                (request.amount_in, amount_out, inner)
            }
        };

        debug!(
            venue = %self.venue,
            action = ?action,
            wrap_amount = %wrap_amount,
            amount_out = %amount_out,
            "Wrapper quote"
        );

        if amount_out.is_zero() {
            return Ok(None);
        }

        Ok(Some(Quote {
            venue: self.venue.clone(),
            request: *request,
            amount_out,
            data: QuoteData::Wrapped {
                action,
                vault: self.vault,
                wrap_amount,
                inner: inner.map(Box::new),
            },
        }))
    }

    fn build_calldata(&self, quote: &Quote) -> Result<Vec<Call>> {
        let QuoteData::Wrapped { action, vault, wrap_amount, inner } = &quote.data else {
            anyhow::bail!("{} cannot build calldata for {:?}", self.venue, quote.data);
        };
        let recipient = quote.request.recipient;
        let inner_calls = inner.as_ref().map(|plan| plan.calls.clone()).unwrap_or_default();

        let mut calls = Vec::with_capacity(inner_calls.len() + 2);
        match action {
            WrapAction::EnterThenWrap => {
                calls.extend(inner_calls);
                calls.push(approve_call(self.asset, *vault, *wrap_amount));
                let deposit = IERC4626::depositCall {
                    assets: *wrap_amount,
                    receiver: recipient,
                };
                calls.push(Call::new(*vault, deposit.abi_encode()));
            }
            WrapAction::UnwrapThenExit => {
                let redeem = IERC4626::redeemCall {
                    shares: *wrap_amount,
                    receiver: recipient,
                    owner: recipient,
                };
                calls.push(Call::new(*vault, redeem.abi_encode()));
                calls.extend(inner_calls);
            }
        }

        Ok(calls)
    }
}
