//! Leverage token chain interaction layer.
//!
//! This crate provides:
//! - Contract bindings for the leverage manager, rebalance and lending adapters
//! - Encoders for the rebalancer executor contract
//! - Batched position state reads ([`RebalanceReader`])
//! - Transaction signing, submission and revert classification ([`TransactionExecutor`])
//! - Gas policy (Legacy + EIP-1559)
//! - Discovery of newly created leverage tokens

pub mod contracts;
mod discovery;
pub mod gas;
mod provider;
mod signer;
pub mod types;

pub use contracts::{
    encode_create_auction, encode_pre_liquidation, encode_take_auction, ExecutionRequest,
    IRebalancer,
};
pub use discovery::{LeverageTokenDiscovery, TokenSource};
pub use gas::{GasParams, GasPolicy};
pub use provider::{discount_by_reward, LeverageTokenReader, RebalanceReader};
pub use signer::{
    classify_revert, ExecutorError, NonceManager, RevertReason, TransactionExecutor,
    TransactionSender, TxHandle, TxOutcome,
};
pub use types::{Position, PositionSnapshot, RebalanceMode, TakeContext, BPS, WAD};
