//! Transaction signer and sender for rebalances.
//! Uses Alloy providers for type-safe RPC interactions.
//!
//! - Cached nonce: atomic counter, resynced after reverts and send errors
//! - Gas from the configured [`GasPolicy`], fixed gas limit
//! - Reverts decoded into stale-state vs everything else

use crate::contracts::{stale_state_selectors, ExecutionRequest, STALE_STATE_NAMES};
use crate::gas::GasPolicy;
use alloy::eips::BlockId;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, Bytes, B256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{TransactionReceipt, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::{RpcError, TransportErrorKind};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Executor failures surfaced to the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// State moved between read and execution; retry with fresh numbers.
    #[error("stale state: {0}")]
    StaleState(String),

    #[error("simulation failed: {0}")]
    Simulation(String),

    #[error("submission failed: {0}")]
    Submission(String),

    #[error("rpc error: {0}")]
    Rpc(String),
}

impl ExecutorError {
    pub fn is_stale(&self) -> bool {
        matches!(self, ExecutorError::StaleState(_))
    }
}

/// Why a mined transaction reverted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevertReason {
    /// Known stale-state error
    Stale(String),
    Other(String),
}

impl std::fmt::Display for RevertReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RevertReason::Stale(r) => write!(f, "stale state ({r})"),
            RevertReason::Other(r) => write!(f, "{r}"),
        }
    }
}

/// Result of waiting on a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    Success { block: u64, gas_used: u64 },
    Reverted(RevertReason),
    TimedOut,
}

/// A submitted transaction.
#[derive(Debug, Clone)]
pub struct TxHandle {
    pub hash: B256,
    pub nonce: u64,
    pub request: ExecutionRequest,
    pub submitted_at: Instant,
}

/// Write side of the chain client used by the engine.
#[async_trait]
pub trait TransactionExecutor: Send + Sync {
    /// Dry-run `request` from the signer address.
    async fn simulate(&self, request: &ExecutionRequest) -> Result<(), ExecutorError>;

    /// Sign and broadcast `request`.
    async fn submit(&self, request: &ExecutionRequest) -> Result<TxHandle, ExecutorError>;

    /// Poll for the receipt until it lands or `timeout` elapses.
    async fn await_outcome(&self, handle: &TxHandle, timeout: Duration) -> Result<TxOutcome, ExecutorError>;

    /// Single receipt probe. `None` while still pending.
    async fn outcome_now(&self, handle: &TxHandle) -> Result<Option<TxOutcome>, ExecutorError>;
}

/// Cached nonce manager.
/// Avoids an RPC call per transaction by tracking the nonce locally.
pub struct NonceManager {
    current: AtomicU64,
    last_synced: AtomicU64,
}

impl NonceManager {
    pub fn new(initial_nonce: u64) -> Self {
        Self {
            current: AtomicU64::new(initial_nonce),
            last_synced: AtomicU64::new(initial_nonce),
        }
    }

    /// Take the next nonce.
    #[inline]
    pub fn next(&self) -> u64 {
        self.current.fetch_add(1, Ordering::SeqCst)
    }

    #[inline]
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    pub fn last_synced(&self) -> u64 {
        self.last_synced.load(Ordering::SeqCst)
    }

    /// Force the counter to the chain's pending nonce.
    pub fn reset(&self, chain_nonce: u64) {
        self.current.store(chain_nonce, Ordering::SeqCst);
        self.last_synced.store(chain_nonce, Ordering::SeqCst);
    }
}

/// Default gas limit for take + multi-call swaps.
pub const DEFAULT_GAS_LIMIT: u64 = 3_000_000;

/// Default receipt poll interval.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1_000);

/// Signs and submits rebalance transactions.
pub struct TransactionSender {
    rpc_url: String,
    wallet: EthereumWallet,
    pub address: Address,
    chain_id: u64,
    nonce_manager: NonceManager,
    gas_limit: u64,
    gas_policy: GasPolicy,
    poll_interval: Duration,
}

impl TransactionSender {
    /// Create a sender, fetching the starting nonce from chain.
    pub async fn new(private_key: &str, rpc_url: &str, chain_id: u64, gas_policy: GasPolicy) -> Result<Self> {
        let key_str = private_key.trim_start_matches("0x");
        let signer: PrivateKeySigner = key_str.parse()?;
        let address = signer.address();
        let wallet = EthereumWallet::from(signer);

        let provider = ProviderBuilder::new().on_http(rpc_url.parse()?);
        let initial_nonce = provider.get_transaction_count(address).pending().await?;

        info!(
            address = %address,
            chain_id,
            initial_nonce,
            gas_policy = gas_policy.name(),
            "Transaction sender initialized"
        );

        Ok(Self {
            rpc_url: rpc_url.to_string(),
            wallet,
            address,
            chain_id,
            nonce_manager: NonceManager::new(initial_nonce),
            gas_limit: DEFAULT_GAS_LIMIT,
            gas_policy,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = gas_limit;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn http_provider(&self) -> Result<impl Provider> {
        Ok(ProviderBuilder::new().on_http(self.rpc_url.parse()?))
    }

    fn read_provider(&self) -> Result<impl Provider, ExecutorError> {
        self.http_provider().map_err(|e| ExecutorError::Rpc(e.to_string()))
    }

    fn signing_provider(&self) -> Result<impl Provider> {
        Ok(ProviderBuilder::new()
            .wallet(self.wallet.clone())
            .on_http(self.rpc_url.parse()?))
    }

    fn call_request(&self, request: &ExecutionRequest) -> TransactionRequest {
        TransactionRequest::default()
            .with_from(self.address)
            .with_to(request.to)
            .with_input(request.data.clone())
            .with_value(request.value)
    }

    /// Resync the local nonce from the chain's pending count.
    pub async fn sync_nonce(&self) {
        let provider = match self.read_provider() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Failed to build provider for nonce sync");
                return;
            }
        };
        match provider.get_transaction_count(self.address).pending().await {
            Ok(chain_nonce) => {
                self.nonce_manager.reset(chain_nonce);
                debug!(nonce = chain_nonce, "Nonce synced from chain");
            }
            Err(e) => warn!(error = %e, "Failed to sync nonce from chain"),
        }
    }

    /// Replay a reverted transaction at its block to recover the reason.
    async fn revert_reason(&self, handle: &TxHandle, receipt: &TransactionReceipt) -> RevertReason {
        let Ok(provider) = self.read_provider() else {
            return RevertReason::Other("reverted".into());
        };
        let block = receipt.block_number.map(BlockId::number).unwrap_or_else(BlockId::latest);
        match provider.call(self.call_request(&handle.request)).block(block).await {
            // Replay no longer reverts; state at that block was already used up
            Ok(_) => RevertReason::Other("reverted (replay succeeded)".into()),
            Err(e) => classify_revert(revert_data(&e).as_deref().map(|b| &b[..]), &e.to_string()),
        }
    }

    async fn outcome_from_receipt(&self, handle: &TxHandle, receipt: TransactionReceipt) -> TxOutcome {
        let block = receipt.block_number.unwrap_or(0);
        if receipt.status() {
            info!(
                tx_hash = %handle.hash,
                block,
                gas_used = receipt.gas_used,
                elapsed_ms = handle.submitted_at.elapsed().as_millis(),
                "Transaction confirmed"
            );
            TxOutcome::Success {
                block,
                gas_used: receipt.gas_used,
            }
        } else {
            let reason = self.revert_reason(handle, &receipt).await;
            warn!(tx_hash = %handle.hash, block, reason = %reason, "Transaction reverted, syncing nonce");
            self.sync_nonce().await;
            TxOutcome::Reverted(reason)
        }
    }
}

#[async_trait]
impl TransactionExecutor for TransactionSender {
    #[instrument(skip(self, request), fields(label = request.label, to = %request.to))]
    async fn simulate(&self, request: &ExecutionRequest) -> Result<(), ExecutorError> {
        let provider = self.read_provider()?;
        match provider.call(self.call_request(request)).await {
            Ok(_) => {
                debug!("Simulation succeeded");
                Ok(())
            }
            Err(e) => Err(match classify_revert(revert_data(&e).as_deref().map(|b| &b[..]), &e.to_string()) {
                RevertReason::Stale(reason) => ExecutorError::StaleState(reason),
                RevertReason::Other(reason) => ExecutorError::Simulation(reason),
            }),
        }
    }

    #[instrument(skip(self, request), fields(label = request.label, to = %request.to))]
    async fn submit(&self, request: &ExecutionRequest) -> Result<TxHandle, ExecutorError> {
        let read = self.read_provider()?;
        let gas = self
            .gas_policy
            .fetch_params(&read)
            .await
            .map_err(|e| ExecutorError::Rpc(format!("gas params: {e}")))?;

        let nonce = self.nonce_manager.next();
        let mut tx = self
            .call_request(request)
            .with_nonce(nonce)
            .with_gas_limit(self.gas_limit)
            .with_chain_id(self.chain_id);
        gas.apply(&mut tx);

        let provider = self
            .signing_provider()
            .map_err(|e| ExecutorError::Rpc(e.to_string()))?;

        match provider.send_transaction(tx).await {
            Ok(pending) => {
                let hash = *pending.tx_hash();
                info!(
                    tx_hash = %hash,
                    nonce,
                    gas_limit = self.gas_limit,
                    gas_price_gwei = gas.effective_gas_price() / 1_000_000_000,
                    "Transaction submitted"
                );
                Ok(TxHandle {
                    hash,
                    nonce,
                    request: request.clone(),
                    submitted_at: Instant::now(),
                })
            }
            Err(e) => {
                warn!(nonce, error = %e, "Submission failed, syncing nonce");
                self.sync_nonce().await;
                Err(ExecutorError::Submission(e.to_string()))
            }
        }
    }

    async fn await_outcome(&self, handle: &TxHandle, timeout: Duration) -> Result<TxOutcome, ExecutorError> {
        let provider = self.read_provider()?;
        let poll = async {
            loop {
                match provider.get_transaction_receipt(handle.hash).await {
                    Ok(Some(receipt)) => return receipt,
                    Ok(None) => {}
                    Err(e) => debug!(tx_hash = %handle.hash, error = %e, "Receipt poll failed"),
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        match tokio::time::timeout(timeout, poll).await {
            Ok(receipt) => Ok(self.outcome_from_receipt(handle, receipt).await),
            Err(_) => {
                warn!(tx_hash = %handle.hash, timeout_secs = timeout.as_secs(), "Receipt wait timed out");
                Ok(TxOutcome::TimedOut)
            }
        }
    }

    async fn outcome_now(&self, handle: &TxHandle) -> Result<Option<TxOutcome>, ExecutorError> {
        let provider = self.read_provider()?;
        let receipt = provider
            .get_transaction_receipt(handle.hash)
            .await
            .map_err(|e| ExecutorError::Rpc(e.to_string()))?;
        match receipt {
            Some(receipt) => Ok(Some(self.outcome_from_receipt(handle, receipt).await)),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for TransactionSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionSender")
            .field("address", &self.address)
            .field("chain_id", &self.chain_id)
            .field("rpc_url", &self.rpc_url)
            .field("gas_policy", &self.gas_policy.name())
            .finish_non_exhaustive()
    }
}

/// Revert payload carried by an `eth_call` error response, if any.
fn revert_data(error: &RpcError<TransportErrorKind>) -> Option<Bytes> {
    error.as_error_resp().and_then(|payload| payload.as_revert_data())
}

/// Classify a revert by selector, falling back to the error text.
pub fn classify_revert(data: Option<&[u8]>, message: &str) -> RevertReason {
    if let Some(data) = data {
        if data.len() >= 4 {
            let selector: [u8; 4] = [data[0], data[1], data[2], data[3]];
            if let Some(i) = stale_state_selectors().iter().position(|s| *s == selector) {
                return RevertReason::Stale(STALE_STATE_NAMES[i].to_string());
            }
            return RevertReason::Other(format!("{message} (selector 0x{})", hex::encode(selector)));
        }
    }

    match STALE_STATE_NAMES.iter().find(|name| message.contains(*name)) {
        Some(name) => RevertReason::Stale((*name).to_string()),
        None => RevertReason::Other(message.to_string()),
    }
}
