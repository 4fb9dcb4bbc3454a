//! Leverage token records and live state read from chain.

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};

/// 1e18, the fixed-point unit of collateral ratios.
pub const WAD: U256 = U256::from_limbs([1_000_000_000_000_000_000, 0, 0, 0]);

/// Basis point denominator.
pub const BPS: u64 = 10_000;

/// A tracked leverage token. Never mutated once registered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    /// Leverage token address (unique id)
    pub token: Address,
    pub collateral_asset: Address,
    pub debt_asset: Address,
    pub rebalance_adapter: Address,
    pub lending_adapter: Address,
}

/// Which rebalance mechanism an attempt uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RebalanceMode {
    /// Dutch auction opened by the rebalance adapter
    Auction,
    /// Emergency buyback below the pre-liquidation threshold
    PreLiquidation,
}

impl std::fmt::Display for RebalanceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RebalanceMode::Auction => write!(f, "auction"),
            RebalanceMode::PreLiquidation => write!(f, "pre-liquidation"),
        }
    }
}

/// One consistent read of a position's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionSnapshot {
    pub token: Address,
    /// Block the snapshot was read at
    pub block: u64,
    /// Collateral valued in debt-asset units
    pub collateral: U256,
    pub debt: U256,
    pub equity: U256,
    /// Collateral ratio (WAD = 1.0)
    pub collateral_ratio: U256,
    /// Target collateral ratio (WAD)
    pub target_ratio: U256,
    /// Adapter reports the token may be rebalanced
    pub adapter_eligible: bool,
    /// An auction is currently open
    pub auction_valid: bool,
    /// Ratio below which pre-liquidation opens (WAD)
    pub pre_liquidation_threshold: U256,
}

impl PositionSnapshot {
    pub fn is_over_collateralized(&self) -> bool {
        self.collateral_ratio > self.target_ratio
    }

    pub fn is_below_pre_liquidation(&self) -> bool {
        !self.debt.is_zero() && self.collateral_ratio < self.pre_liquidation_threshold
    }
}

/// Snapshot plus the adapter parameters needed to size a take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TakeContext {
    pub snapshot: PositionSnapshot,
    /// Pre-liquidation reward paid to the rebalancer (bps)
    pub rebalance_reward_bps: u64,
}
