//! Off-chain aggregator venue.
//!
//! Talks to a LI.FI-compatible `/v1/quote` endpoint that returns both the
//! expected output and a ready-to-send transaction.

use super::{approve_call, Call, Quote, QuoteData, QuoteProvider, QuoteRequest};
use alloy::primitives::{Address, Bytes, U256};
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

/// Default HTTP timeout for quote requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Aggregator API quote provider.
#[derive(Clone)]
pub struct AggregatorProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    chain_id: u64,
    slippage_bps: u16,
}

impl std::fmt::Debug for AggregatorProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregatorProvider")
            .field("base_url", &self.base_url)
            .field("chain_id", &self.chain_id)
            .field("has_api_key", &self.api_key.is_some())
            .finish()
    }
}

impl AggregatorProvider {
    pub fn new(base_url: impl Into<String>, chain_id: u64) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: None,
            chain_id,
            slippage_bps: super::DEFAULT_SLIPPAGE_BPS,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_slippage_bps(mut self, slippage_bps: u16) -> Self {
        self.slippage_bps = slippage_bps;
        self
    }

    #[instrument(skip(self), fields(from = %request.from, to = %request.to))]
    async fn fetch_quote(&self, request: &QuoteRequest) -> Result<AggregatorQuote> {
        let url = format!("{}/v1/quote", self.base_url);
        let chain = self.chain_id.to_string();
        let params: [(&str, String); 8] = [
            ("fromChain", chain.clone()),
            ("toChain", chain),
            ("fromToken", request.from.to_string()),
            ("toToken", request.to.to_string()),
            ("fromAmount", request.amount_in.to_string()),
            ("fromAddress", request.recipient.to_string()),
            ("toAddress", request.recipient.to_string()),
            ("slippage", (self.slippage_bps as f64 / 10_000.0).to_string()),
        ];

        let mut http = self.client.get(&url).query(&params);
        if let Some(key) = &self.api_key {
            http = http.header("x-lifi-api-key", key);
        }

        let response = http.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Aggregator API error: {} - {}", status, body);
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl QuoteProvider for AggregatorProvider {
    fn venue(&self) -> &str {
        "aggregator"
    }

    async fn quote(&self, request: &QuoteRequest) -> Result<Option<Quote>> {
        let response = self.fetch_quote(request).await?;
        let amount_out: U256 = response.estimate.to_amount.parse()?;
        if amount_out.is_zero() {
            return Ok(None);
        }

        debug!(amount_out = %amount_out, tool = ?response.tool, "Aggregator quote");

        let tx = response.transaction_request;
        Ok(Some(Quote {
            venue: "aggregator".to_string(),
            request: *request,
            amount_out,
            data: QuoteData::Aggregator {
                to: tx.to.parse()?,
                calldata: decode_hex(&tx.data)?,
                value: tx.value.as_deref().map(parse_quantity).transpose()?.unwrap_or_default(),
                approval: response.estimate.approval_address.parse()?,
            },
        }))
    }

    fn build_calldata(&self, quote: &Quote) -> Result<Vec<Call>> {
        let QuoteData::Aggregator { to, calldata, value, approval } = &quote.data else {
            anyhow::bail!("aggregator cannot build calldata for {:?}", quote.data);
        };

        Ok(vec![
            approve_call(quote.request.from, *approval, quote.request.amount_in),
            Call {
                target: *to,
                value: *value,
                data: calldata.clone(),
            },
        ])
    }
}

fn decode_hex(data: &str) -> Result<Bytes> {
    let raw = data.strip_prefix("0x").unwrap_or(data);
    Ok(Bytes::from(hex::decode(raw)?))
}

/// Parse a JSON-RPC quantity (`0x`-hex or decimal).
fn parse_quantity(value: &str) -> Result<U256> {
    match value.strip_prefix("0x") {
        Some(hex) if hex.is_empty() => Ok(U256::ZERO),
        Some(hex) => Ok(U256::from_str_radix(hex, 16)?),
        None => Ok(value.parse()?),
    }
}

// API response types

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AggregatorQuote {
    #[serde(default)]
    tool: Option<String>,
    estimate: Estimate,
    transaction_request: TransactionRequest,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Estimate {
    to_amount: String,
    approval_address: String,
}

#[derive(Debug, Deserialize)]
struct TransactionRequest {
    to: String,
    data: String,
    #[serde(default)]
    value: Option<String>,
}
