//! Position classification.

use rebalancer_chain::RebalanceMode;
pub use rebalancer_chain::{Position, PositionSnapshot};

/// Rebalance state computed from one snapshot. Never cached across ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RebalanceState {
    NotEligible,
    AuctionEligible,
    PreLiquidationEligible,
}

impl RebalanceState {
    /// Mechanism to use, if any.
    pub fn mode(self) -> Option<RebalanceMode> {
        match self {
            RebalanceState::NotEligible => None,
            RebalanceState::AuctionEligible => Some(RebalanceMode::Auction),
            RebalanceState::PreLiquidationEligible => Some(RebalanceMode::PreLiquidation),
        }
    }
}

/// Classify a snapshot. Pre-liquidation takes precedence over auctions.
pub fn classify(snapshot: &PositionSnapshot) -> RebalanceState {
    if snapshot.is_below_pre_liquidation() {
        RebalanceState::PreLiquidationEligible
    } else if snapshot.adapter_eligible || snapshot.auction_valid {
        RebalanceState::AuctionEligible
    } else {
        RebalanceState::NotEligible
    }
}
