//! Constant-product venue (Uniswap V2 style routers).

use super::{approve_call, min_amount_out, Call, Quote, QuoteData, QuoteProvider, QuoteRequest};
use alloy::primitives::{Address, U256};
use alloy::providers::ProviderBuilder;
use alloy::sol;
use alloy::sol_types::SolCall;
use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

sol! {
    #[sol(rpc)]
    interface IUniswapV2Router02 {
        function getAmountsOut(uint256 amountIn, address[] calldata path)
            external
            view
            returns (uint256[] memory amounts);

        function swapExactTokensForTokens(
            uint256 amountIn,
            uint256 amountOutMin,
            address[] calldata path,
            address to,
            uint256 deadline
        ) external returns (uint256[] memory amounts);
    }
}

/// Swap deadline offset from now (seconds).
const DEADLINE_SECS: i64 = 300;

/// Constant-product router quote provider.
///
/// Tries the direct pair and, when configured, a two-hop path through a
/// connector token (usually the wrapped native asset).
#[derive(Debug, Clone)]
pub struct UniswapV2Provider {
    venue: String,
    rpc_url: String,
    router: Address,
    connector: Option<Address>,
    slippage_bps: u16,
}

impl UniswapV2Provider {
    pub fn new(rpc_url: impl Into<String>, router: Address) -> Self {
        Self {
            venue: "uniswap-v2".to_string(),
            rpc_url: rpc_url.into(),
            router,
            connector: None,
            slippage_bps: super::DEFAULT_SLIPPAGE_BPS,
        }
    }

    pub fn with_venue(mut self, venue: impl Into<String>) -> Self {
        self.venue = venue.into();
        self
    }

    /// Route through `connector` when it beats the direct pair.
    pub fn with_connector(mut self, connector: Address) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_slippage_bps(mut self, slippage_bps: u16) -> Self {
        self.slippage_bps = slippage_bps;
        self
    }

    /// Candidate paths for a pair.
    fn paths(&self, from: Address, to: Address) -> Vec<Vec<Address>> {
        let mut paths = vec![vec![from, to]];
        if let Some(connector) = self.connector {
            if connector != from && connector != to {
                paths.push(vec![from, connector, to]);
            }
        }
        paths
    }

    async fn amount_out(&self, amount_in: U256, path: Vec<Address>) -> Result<U256> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.parse()?);
        let router = IUniswapV2Router02::new(self.router, provider);
        let amounts = router.getAmountsOut(amount_in, path).call().await?.amounts;
        Ok(amounts.last().copied().unwrap_or(U256::ZERO))
    }
}

#[async_trait]
impl QuoteProvider for UniswapV2Provider {
    fn venue(&self) -> &str {
        &self.venue
    }

    async fn quote(&self, request: &QuoteRequest) -> Result<Option<Quote>> {
        let mut best: Option<(Vec<Address>, U256)> = None;

        for path in self.paths(request.from, request.to) {
            match self.amount_out(request.amount_in, path.clone()).await {
                Ok(out) if !out.is_zero() && best.as_ref().map_or(true, |(_, b)| out > *b) => {
                    best = Some((path, out));
                }
                Ok(_) => {}
                // Missing pairs revert inside the router
                Err(e) => debug!(venue = %self.venue, hops = path.len() - 1, error = %e, "Path unavailable"),
            }
        }

        Ok(best.map(|(path, amount_out)| Quote {
            venue: self.venue.clone(),
            request: *request,
            amount_out,
            data: QuoteData::ConstantProduct { path },
        }))
    }

    fn build_calldata(&self, quote: &Quote) -> Result<Vec<Call>> {
        let QuoteData::ConstantProduct { path } = &quote.data else {
            anyhow::bail!("{} cannot build calldata for {:?}", self.venue, quote.data);
        };
        let request = &quote.request;
        let deadline = chrono::Utc::now().timestamp() + DEADLINE_SECS;

        let swap = IUniswapV2Router02::swapExactTokensForTokensCall {
            amountIn: request.amount_in,
            amountOutMin: min_amount_out(quote.amount_out, self.slippage_bps),
            path: path.clone(),
            to: request.recipient,
            deadline: U256::from(deadline),
        };

        Ok(vec![
            approve_call(request.from, self.router, request.amount_in),
            Call::new(self.router, swap.abi_encode()),
        ])
    }
}
