//! Concentrated-liquidity venue (Uniswap V3 and forks).
//!
//! Prices through QuoterV2 across fee tiers and executes through
//! SwapRouter02 `exactInputSingle`.

use super::{approve_call, min_amount_out, Call, Quote, QuoteData, QuoteProvider, QuoteRequest};
use alloy::primitives::{Address, U160, U256};
use alloy::providers::ProviderBuilder;
use alloy::sol;
use alloy::sol_types::SolCall;
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

sol! {
    #[sol(rpc)]
    interface IQuoterV2 {
        struct QuoteExactInputSingleParams {
            address tokenIn;
            address tokenOut;
            uint256 amountIn;
            uint24 fee;
            uint160 sqrtPriceLimitX96;
        }

        function quoteExactInputSingle(QuoteExactInputSingleParams memory params)
            external
            returns (
                uint256 amountOut,
                uint160 sqrtPriceX96After,
                uint32 initializedTicksCrossed,
                uint256 gasEstimate
            );
    }

    interface ISwapRouter02 {
        struct ExactInputSingleParams {
            address tokenIn;
            address tokenOut;
            uint24 fee;
            address recipient;
            uint256 amountIn;
            uint256 amountOutMinimum;
            uint160 sqrtPriceLimitX96;
        }

        function exactInputSingle(ExactInputSingleParams calldata params)
            external
            payable
            returns (uint256 amountOut);
    }
}

/// Uniswap V3 periphery addresses.
#[derive(Debug, Clone)]
pub struct UniswapV3Addresses {
    pub swap_router: Address,
    pub quoter_v2: Address,
}

impl UniswapV3Addresses {
    /// Uniswap V3 on Base.
    pub fn base() -> Self {
        Self {
            swap_router: alloy::primitives::address!("2626664c2603336E57B271c5C0b26F421741e481"),
            quoter_v2: alloy::primitives::address!("3d4e44Eb1374240CE5F1B871ab261CD16335B76a"),
        }
    }

    /// Uniswap V3 on Ethereum mainnet.
    pub fn mainnet() -> Self {
        Self {
            swap_router: alloy::primitives::address!("68b3465833fb72A70ecDF485E0e4C7bD8665Fc45"),
            quoter_v2: alloy::primitives::address!("61fFE014bA17989E743c5F6cB21bF9697530B21e"),
        }
    }
}

/// Common Uniswap V3 fee tiers in hundredths of a basis point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeTier {
    /// 0.01% - correlated pairs (LST/ETH, stables)
    Lowest = 100,
    /// 0.05%
    Low = 500,
    /// 0.3%
    Medium = 3000,
    /// 1%
    High = 10000,
}

impl FeeTier {
    /// Pool fee as passed to the quoter and router.
    pub const fn fee(self) -> u32 {
        self as u32
    }

    /// Fee tiers to try, most likely first.
    pub fn tiers_for_pair(is_correlated_pair: bool) -> Vec<u32> {
        let order: &[FeeTier] = if is_correlated_pair {
            &[FeeTier::Lowest, FeeTier::Low, FeeTier::Medium]
        } else {
            &[FeeTier::Low, FeeTier::Medium, FeeTier::Lowest, FeeTier::High]
        };
        order.iter().map(|tier| tier.fee()).collect()
    }
}

/// Concentrated-liquidity quote provider.
#[derive(Clone)]
pub struct UniswapV3Provider {
    /// Venue name reported in plans
    venue: String,
    /// RPC URL for quotes
    rpc_url: String,
    /// Periphery addresses
    addresses: UniswapV3Addresses,
    /// Best fee tier seen per pair. Only the tier is cached, never amounts.
    fee_cache: Arc<DashMap<(Address, Address), u32>>,
    /// Pairs that trade at near-parity (tried on low tiers first)
    correlated: Vec<(Address, Address)>,
    slippage_bps: u16,
}

impl std::fmt::Debug for UniswapV3Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UniswapV3Provider")
            .field("venue", &self.venue)
            .field("rpc_url", &self.rpc_url)
            .field("quoter", &self.addresses.quoter_v2)
            .finish()
    }
}

impl UniswapV3Provider {
    pub fn new(rpc_url: impl Into<String>, addresses: UniswapV3Addresses) -> Self {
        Self {
            venue: "uniswap-v3".to_string(),
            rpc_url: rpc_url.into(),
            addresses,
            fee_cache: Arc::new(DashMap::new()),
            correlated: Vec::new(),
            slippage_bps: super::DEFAULT_SLIPPAGE_BPS,
        }
    }

    /// Override the venue name (for forks such as Aerodrome Slipstream).
    pub fn with_venue(mut self, venue: impl Into<String>) -> Self {
        self.venue = venue.into();
        self
    }

    /// Register near-parity pairs for better fee tier ordering.
    pub fn with_correlated_pairs(mut self, pairs: Vec<(Address, Address)>) -> Self {
        self.correlated = pairs;
        self
    }

    pub fn with_slippage_bps(mut self, slippage_bps: u16) -> Self {
        self.slippage_bps = slippage_bps;
        self
    }

    fn is_correlated(&self, a: Address, b: Address) -> bool {
        self.correlated
            .iter()
            .any(|&(x, y)| (x == a && y == b) || (x == b && y == a))
    }

    fn cached_fee(&self, token_in: Address, token_out: Address) -> Option<u32> {
        self.fee_cache
            .get(&(token_in, token_out))
            .or_else(|| self.fee_cache.get(&(token_out, token_in)))
            .map(|fee| *fee)
    }

    async fn quote_tier(
        &self,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        fee: u32,
    ) -> Result<U256> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.parse()?);
        let quoter = IQuoterV2::new(self.addresses.quoter_v2, provider);

        let params = IQuoterV2::QuoteExactInputSingleParams {
            tokenIn: token_in,
            tokenOut: token_out,
            amountIn: amount_in,
            fee: alloy::primitives::Uint::<24, 1>::from(fee),
            sqrtPriceLimitX96: U160::ZERO,
        };

        let result = quoter.quoteExactInputSingle(params).call().await?;
        Ok(result.amountOut)
    }

    /// Best (fee, amount_out) across tiers, or `None` when no pool has liquidity.
    async fn find_best_fee(
        &self,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
    ) -> Option<(u32, U256)> {
        let tiers = match self.cached_fee(token_in, token_out) {
            Some(fee) => vec![fee],
            None => FeeTier::tiers_for_pair(self.is_correlated(token_in, token_out)),
        };

        let mut best: Option<(u32, U256)> = None;
        for fee in tiers {
            match self.quote_tier(token_in, token_out, amount_in, fee).await {
                Ok(out) if best.map_or(true, |(_, b)| out > b) && !out.is_zero() => {
                    debug!(fee, amount_out = %out, "Better fee tier quote");
                    best = Some((fee, out));
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(fee, error = %e, "Fee tier not available for pair");
                }
            }
        }

        if let Some((fee, _)) = best {
            self.fee_cache.insert((token_in, token_out), fee);
        }
        best
    }
}

#[async_trait]
impl QuoteProvider for UniswapV3Provider {
    fn venue(&self) -> &str {
        &self.venue
    }

    async fn quote(&self, request: &QuoteRequest) -> Result<Option<Quote>> {
        let Some((fee, amount_out)) = self
            .find_best_fee(request.from, request.to, request.amount_in)
            .await
        else {
            return Ok(None);
        };

        Ok(Some(Quote {
            venue: self.venue.clone(),
            request: *request,
            amount_out,
            data: QuoteData::ConcentratedLiquidity { fee },
        }))
    }

    fn build_calldata(&self, quote: &Quote) -> Result<Vec<Call>> {
        let QuoteData::ConcentratedLiquidity { fee } = quote.data else {
            anyhow::bail!("{} cannot build calldata for {:?}", self.venue, quote.data);
        };
        let request = &quote.request;

        let swap = ISwapRouter02::exactInputSingleCall {
            params: ISwapRouter02::ExactInputSingleParams {
                tokenIn: request.from,
                tokenOut: request.to,
                fee: alloy::primitives::Uint::<24, 1>::from(fee),
                recipient: request.recipient,
                amountIn: request.amount_in,
                amountOutMinimum: min_amount_out(quote.amount_out, self.slippage_bps),
                sqrtPriceLimitX96: U160::ZERO,
            },
        };

        Ok(vec![
            approve_call(request.from, self.addresses.swap_router, request.amount_in),
            Call::new(self.addresses.swap_router, swap.abi_encode()),
        ])
    }
}
