//! Best-route selection across configured quote providers.

use crate::swap::{Call, Quote, QuoteProvider, QuoteRequest};
use alloy::primitives::{Address, U256};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Executable swap plan chosen by the [`RouteSelector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    /// Winning venue, `None` for identity and empty plans
    pub venue: Option<String>,
    pub from: Address,
    pub to: Address,
    pub amount_in: U256,
    /// Expected output (0 when no venue could route)
    pub amount_out: U256,
    /// Calls executed in order by the rebalancer contract
    pub calls: Vec<Call>,
}

impl Plan {
    /// A plan no venue could fill.
    pub fn empty(from: Address, to: Address, amount_in: U256) -> Self {
        Self {
            venue: None,
            from,
            to,
            amount_in,
            amount_out: U256::ZERO,
            calls: Vec::new(),
        }
    }

    /// Same asset on both sides: nothing to swap.
    pub fn identity(asset: Address, amount: U256) -> Self {
        Self {
            venue: None,
            from: asset,
            to: asset,
            amount_in: amount,
            amount_out: amount,
            calls: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.amount_out.is_zero()
    }

    /// Whether this plan covers `required` units of the output asset.
    pub fn covers(&self, required: U256) -> bool {
        !self.is_empty() && self.amount_out >= required
    }
}

/// Fans a request out to every provider and keeps the best quote.
#[derive(Debug, Clone)]
pub struct RouteSelector {
    /// Providers in configuration order (earlier wins ties)
    providers: Vec<Arc<dyn QuoteProvider>>,
    /// Account that holds the input and receives the output
    recipient: Address,
}

impl RouteSelector {
    pub fn new(recipient: Address) -> Self {
        Self {
            providers: Vec::new(),
            recipient,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn QuoteProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn providers(&self) -> usize {
        self.providers.len()
    }

    pub fn recipient(&self) -> Address {
        self.recipient
    }

    /// Quote every provider concurrently and build calldata for the winner.
    ///
    /// Never fails: provider errors count as no quote, and an unroutable
    /// request yields a plan with zero output.
    #[instrument(skip(self), fields(providers = self.providers.len()))]
    pub async fn select_best_route(&self, from: Address, to: Address, amount_in: U256) -> Plan {
        if from == to {
            return Plan::identity(from, amount_in);
        }
        if amount_in.is_zero() {
            return Plan::empty(from, to, amount_in);
        }

        let request = QuoteRequest {
            from,
            to,
            amount_in,
            recipient: self.recipient,
        };

        let results = join_all(self.providers.iter().map(|p| p.quote(&request))).await;

        let quotes: Vec<Option<Quote>> = results
            .into_iter()
            .zip(&self.providers)
            .map(|(result, provider)| match result {
                Ok(quote) => quote,
                Err(e) => {
                    debug!(venue = provider.venue(), error = %e, "Quote failed");
                    None
                }
            })
            .collect();

        for index in rank(&quotes) {
            let (Some(quote), provider) = (&quotes[index], &self.providers[index]) else {
                continue;
            };
            match provider.build_calldata(quote) {
                Ok(calls) => {
                    debug!(venue = %quote.venue, amount_out = %quote.amount_out, "Selected route");
                    return Plan {
                        venue: Some(quote.venue.clone()),
                        from,
                        to,
                        amount_in,
                        amount_out: quote.amount_out,
                        calls,
                    };
                }
                Err(e) => {
                    warn!(venue = %quote.venue, error = %e, "Calldata build failed, trying next venue");
                }
            }
        }

        Plan::empty(from, to, amount_in)
    }
}

/// Indices of non-zero quotes, best first. Ties keep configuration order.
pub fn rank(quotes: &[Option<Quote>]) -> Vec<usize> {
    let mut ranked: Vec<(usize, U256)> = quotes
        .iter()
        .enumerate()
        .filter_map(|(i, q)| q.as_ref().map(|q| (i, q.amount_out)))
        .filter(|(_, out)| !out.is_zero())
        .collect();
    // Stable sort keeps earlier providers ahead on equal output
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked.into_iter().map(|(i, _)| i).collect()
}
