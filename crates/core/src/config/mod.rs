//! Configuration for the rebalancer.
//!
//! - Engine configuration (profiles, timing, search parameters)
//! - Deployment configuration (chain, contracts, venues, alerts)

mod deployment;
mod engine;

pub use deployment::{
    expand_env, AggregatorVenue, DeploymentConfig, Erc4626Vault, TelegramSettings, UniswapV2Venue,
    UniswapV3Venue,
};
pub use engine::{EngineConfig, ExecutionConfig, LeaseConfig, MonitorConfig, NegotiationConfig};
