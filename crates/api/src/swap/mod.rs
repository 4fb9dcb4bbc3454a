//! Quote provider abstractions for rebalance routing.
//!
//! Every liquidity venue implements [`QuoteProvider`]: it can price an
//! exact-input swap and, once its quote wins, turn that quote into the call
//! sequence the on-chain rebalancer contract executes.
//!
//! # Supported venues
//!
//! - `uniswap_v2`: constant-product router (`getAmountsOut`)
//! - `uniswap_v3`: concentrated-liquidity QuoterV2 + SwapRouter02
//! - `aggregator`: off-chain aggregator HTTP API
//! - `erc4626`: yield wrapper composed with an inner route
//!
//! # Example
//!
//! ```rust,ignore
//! use rebalancer_api::swap::{UniswapV3Provider, UniswapV3Addresses};
//! use rebalancer_api::RouteSelector;
//!
//! let selector = RouteSelector::new(rebalancer)
//!     .with_provider(Arc::new(UniswapV3Provider::new(rpc_url, UniswapV3Addresses::base())));
//!
//! let plan = selector.select_best_route(weth, usdc, amount).await;
//! ```

mod aggregator;
mod erc4626;
mod uniswap_v2;
mod uniswap_v3;

pub use aggregator::AggregatorProvider;
pub use erc4626::Erc4626Provider;
pub use uniswap_v2::UniswapV2Provider;
pub use uniswap_v3::{FeeTier, UniswapV3Addresses, UniswapV3Provider};

use alloy::primitives::{Address, Bytes, U256};
use alloy::sol;
use alloy::sol_types::SolCall;
use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Debug;

use crate::route::Plan;

sol! {
    interface IERC20 {
        function approve(address spender, uint256 amount) external returns (bool);
    }
}

/// Default slippage applied to encoded minimum outputs (0.5%).
pub const DEFAULT_SLIPPAGE_BPS: u16 = 50;

/// A single call executed by the rebalancer contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub target: Address,
    pub value: U256,
    pub data: Bytes,
}

impl Call {
    /// Create a call with zero native value.
    pub fn new(target: Address, data: impl Into<Bytes>) -> Self {
        Self {
            target,
            value: U256::ZERO,
            data: data.into(),
        }
    }
}

/// ERC-20 `approve` call granting `spender` an allowance on `token`.
pub fn approve_call(token: Address, spender: Address, amount: U256) -> Call {
    let data = IERC20::approveCall { spender, amount }.abi_encode();
    Call::new(token, data)
}

/// Reduce `amount` by `slippage_bps`.
pub fn min_amount_out(amount: U256, slippage_bps: u16) -> U256 {
    let factor = U256::from(10_000u16.saturating_sub(slippage_bps));
    amount * factor / U256::from(10_000u16)
}

/// Exact-input quote request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuoteRequest {
    /// Asset sold
    pub from: Address,
    /// Asset bought
    pub to: Address,
    /// Amount of `from` sold (raw units)
    pub amount_in: U256,
    /// Account that holds `from` and receives `to` (the rebalancer contract)
    pub recipient: Address,
}

/// Venue-specific routing data needed to build calldata for a quote.
#[derive(Debug, Clone)]
pub enum QuoteData {
    /// Constant-product router path.
    ConstantProduct { path: Vec<Address> },
    /// Concentrated-liquidity pool fee tier.
    ConcentratedLiquidity { fee: u32 },
    /// Pre-built transaction returned by an aggregator API.
    Aggregator {
        to: Address,
        calldata: Bytes,
        value: U256,
        approval: Address,
    },
    /// Yield-wrapper leg combined with an optional inner swap route.
    Wrapped {
        action: WrapAction,
        vault: Address,
        /// Amount handed to `deposit` or `redeem`
        wrap_amount: U256,
        inner: Option<Box<Plan>>,
    },
}

/// Direction of a yield-wrapper leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapAction {
    /// Swap into the underlying (if needed), then deposit.
    EnterThenWrap,
    /// Redeem into the underlying, then swap out (if needed).
    UnwrapThenExit,
}

/// A priced quote from one venue.
#[derive(Debug, Clone)]
pub struct Quote {
    /// Venue identifier
    pub venue: String,
    /// Request this quote answers
    pub request: QuoteRequest,
    /// Expected output amount
    pub amount_out: U256,
    /// Data needed by `build_calldata`
    pub data: QuoteData,
}

/// Trait for liquidity venues.
///
/// Implement this trait to add a new DEX, aggregator or wrapper.
#[async_trait]
pub trait QuoteProvider: Send + Sync + Debug {
    /// Venue identifier (e.g., "uniswap-v3").
    fn venue(&self) -> &str;

    /// Price an exact-input swap. `Ok(None)` means the venue has no route.
    async fn quote(&self, request: &QuoteRequest) -> Result<Option<Quote>>;

    /// Turn a winning quote into the call sequence that realizes it.
    fn build_calldata(&self, quote: &Quote) -> Result<Vec<Call>>;
}
