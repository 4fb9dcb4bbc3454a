//! Engine error types.

use alloy::primitives::Address;
use rebalancer_chain::ExecutorError;
use thiserror::Error;

/// Lease acquisition failure. Expected under contention, never alerted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseError {
    #[error("lease for {0} is held by another attempt")]
    LockOccupied(Address),
}

/// Failures that abort a rebalance attempt.
///
/// Expected outcomes (unprofitable step, stale revert, receipt timeout,
/// mined revert) never surface here.
#[derive(Error, Debug)]
pub enum RebalanceError {
    #[error("chain read failed: {0:#}")]
    ChainRead(anyhow::Error),

    #[error("simulation failed: {0}")]
    Simulation(String),

    #[error("submission failed: {0}")]
    Submission(String),

    #[error("route error: {0}")]
    Route(String),
}

impl RebalanceError {
    /// Map a non-stale executor error raised while simulating.
    pub fn from_simulation(error: ExecutorError) -> Self {
        match error {
            ExecutorError::Submission(e) => RebalanceError::Submission(e),
            other => RebalanceError::Simulation(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for RebalanceError {
    fn from(error: anyhow::Error) -> Self {
        RebalanceError::ChainRead(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = RebalanceError::ChainRead(anyhow::anyhow!("timeout").context("snapshot"));
        assert_eq!(err.to_string(), "chain read failed: snapshot: timeout");

        let err = LeaseError::LockOccupied(Address::ZERO);
        assert!(err.to_string().starts_with("lease for 0x0000"));
    }

    #[test]
    fn test_from_simulation() {
        let err = RebalanceError::from_simulation(ExecutorError::Rpc("down".into()));
        assert!(matches!(err, RebalanceError::Simulation(ref m) if m == "rpc error: down"));
    }
}
