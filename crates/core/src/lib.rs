//! Rebalancer core logic.
//!
//! This crate provides the decision and execution engine:
//! - Position registry and classification
//! - Eligibility monitor polling every tracked position
//! - Lease scheduler for exclusive per-position attempts and repeating take tasks
//! - Stepped negotiation engine sizing and executing takes
//! - Engine and deployment configuration

pub mod config;
mod error;
mod lease;
mod monitor;
mod negotiator;
mod position;
mod registry;
pub mod u256_math;

pub use config::{DeploymentConfig, EngineConfig};
pub use error::{LeaseError, RebalanceError};
pub use lease::{LeaseJob, LeaseScheduler, LeaseToken, TaskControl};
pub use monitor::{EligibilityMonitor, TickReport};
pub use negotiator::{
    candidates, take_size, CandidatePlan, Candidates, NegotiationEngine, NegotiationOutcome, TakeSide,
    TakeSize,
};
pub use position::{classify, Position, PositionSnapshot, RebalanceState};
pub use registry::PositionRegistry;
