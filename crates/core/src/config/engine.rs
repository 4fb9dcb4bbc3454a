//! Engine configuration with profile support.
//!
//! Profiles (`default`, `production`, `aggressive`) are picked with
//! `BOT_PROFILE`; a TOML file named by `ENGINE_CONFIG` replaces them.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// All engine tuning parameters. Loaded once, immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Profile name (for logging/identification)
    #[serde(default = "default_profile_name")]
    pub profile: String,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub negotiation: NegotiationConfig,

    #[serde(default)]
    pub lease: LeaseConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,
}

fn default_profile_name() -> String {
    "default".to_string()
}

/// Eligibility polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Concurrent snapshot reads per tick
    #[serde(default = "default_read_concurrency")]
    pub read_concurrency: usize,

    /// Maximum blocks scanned per discovery query
    #[serde(default = "default_discovery_block_range")]
    pub discovery_block_range: u64,
}

fn default_poll_interval() -> u64 {
    12_000
}
fn default_read_concurrency() -> usize {
    8
}
fn default_discovery_block_range() -> u64 {
    5_000
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            read_concurrency: default_read_concurrency(),
            discovery_block_range: default_discovery_block_range(),
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Stepped take search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiationConfig {
    /// Candidates tried per attempt
    #[serde(default = "default_step_count")]
    pub step_count: usize,

    /// Haircut on the computed maximum take (bps)
    #[serde(default = "default_safety_discount")]
    pub safety_discount_bps: u64,

    /// Largest share of debt a pre-liquidation may repay (bps)
    #[serde(default = "default_close_factor")]
    pub pre_liquidation_close_factor_bps: u64,

    /// Slippage applied by venues to encoded minimum outputs (bps)
    #[serde(default = "default_slippage")]
    pub slippage_bps: u16,
}

fn default_step_count() -> usize {
    5
}
fn default_safety_discount() -> u64 {
    100
}
fn default_close_factor() -> u64 {
    5_000
}
fn default_slippage() -> u16 {
    50
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            step_count: default_step_count(),
            safety_discount_bps: default_safety_discount(),
            pre_liquidation_close_factor_bps: default_close_factor(),
            slippage_bps: default_slippage(),
        }
    }
}

/// Per-position lease and repeating task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseConfig {
    #[serde(default = "default_lease_ttl")]
    pub ttl_secs: u64,

    /// Interval between auction take attempts
    #[serde(default = "default_task_interval")]
    pub task_interval_ms: u64,
}

fn default_lease_ttl() -> u64 {
    240
}
fn default_task_interval() -> u64 {
    4_000
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_lease_ttl(),
            task_interval_ms: default_task_interval(),
        }
    }
}

impl LeaseConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
    pub fn task_interval(&self) -> Duration {
        Duration::from_millis(self.task_interval_ms)
    }
}

/// Transaction submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_receipt_timeout")]
    pub receipt_timeout_secs: u64,

    #[serde(default = "default_receipt_poll")]
    pub receipt_poll_ms: u64,

    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
}

fn default_receipt_timeout() -> u64 {
    30
}
fn default_receipt_poll() -> u64 {
    1_000
}
fn default_gas_limit() -> u64 {
    3_000_000
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            receipt_timeout_secs: default_receipt_timeout(),
            receipt_poll_ms: default_receipt_poll(),
            gas_limit: default_gas_limit(),
        }
    }
}

impl ExecutionConfig {
    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.receipt_timeout_secs)
    }
    pub fn receipt_poll(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            profile: default_profile_name(),
            monitor: MonitorConfig::default(),
            negotiation: NegotiationConfig::default(),
            lease: LeaseConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }
}

/// Allowance per step for eligibility, quoting and simulation on top of the
/// receipt wait.
pub const STEP_OVERHEAD_SECS: u64 = 10;

impl EngineConfig {
    /// Longest a single attempt can run when every step times out.
    pub fn attempt_budget(&self) -> Duration {
        let per_step = self
            .execution
            .receipt_timeout_secs
            .saturating_add(STEP_OVERHEAD_SECS);
        Duration::from_secs(per_step.saturating_mul(self.negotiation.step_count as u64))
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Conservative settings: finer search, tighter slippage.
    pub fn production() -> Self {
        Self {
            profile: "production".to_string(),
            monitor: MonitorConfig {
                poll_interval_ms: 12_000,
                read_concurrency: 8,
                discovery_block_range: 5_000,
            },
            negotiation: NegotiationConfig {
                step_count: 8,
                safety_discount_bps: 150,
                pre_liquidation_close_factor_bps: 5_000,
                slippage_bps: 30,
            },
            lease: LeaseConfig {
                ttl_secs: 480,
                ..Default::default()
            },
            execution: ExecutionConfig {
                receipt_timeout_secs: 45,
                ..Default::default()
            },
        }
    }

    /// Faster polling and fewer, larger steps.
    pub fn aggressive() -> Self {
        Self {
            profile: "aggressive".to_string(),
            monitor: MonitorConfig {
                poll_interval_ms: 4_000,
                read_concurrency: 16,
                ..Default::default()
            },
            negotiation: NegotiationConfig {
                step_count: 4,
                safety_discount_bps: 50,
                pre_liquidation_close_factor_bps: 5_000,
                slippage_bps: 100,
            },
            lease: LeaseConfig {
                ttl_secs: 150,
                task_interval_ms: 2_000,
            },
            execution: ExecutionConfig {
                receipt_timeout_secs: 20,
                receipt_poll_ms: 500,
                ..Default::default()
            },
        }
    }

    /// Profile named by `BOT_PROFILE`, or the TOML file named by `ENGINE_CONFIG`.
    pub fn from_env() -> anyhow::Result<Self> {
        if let Ok(path) = std::env::var("ENGINE_CONFIG") {
            return Self::from_file(&path);
        }
        let profile = std::env::var("BOT_PROFILE").unwrap_or_else(|_| "default".to_string());
        Ok(Self::from_profile(&profile))
    }

    pub fn from_profile(profile: &str) -> Self {
        match profile.to_lowercase().as_str() {
            "production" | "prod" => Self::production(),
            "aggressive" | "aggro" => Self::aggressive(),
            _ => Self::default(),
        }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.negotiation.step_count == 0 {
            anyhow::bail!("negotiation.step_count must be at least 1");
        }
        if self.negotiation.safety_discount_bps >= 10_000 {
            anyhow::bail!("negotiation.safety_discount_bps must be below 10000");
        }
        if self.negotiation.pre_liquidation_close_factor_bps > 10_000 {
            anyhow::bail!("negotiation.pre_liquidation_close_factor_bps must be at most 10000");
        }
        if self.lease.ttl_secs == 0 {
            anyhow::bail!("lease.ttl_secs must be positive");
        }
        // A lease must outlive a full ladder or a working attempt loses exclusivity
        let budget = self.attempt_budget();
        if self.lease.ttl() <= budget {
            anyhow::bail!(
                "lease.ttl_secs ({}) must exceed step_count x (receipt_timeout_secs + {}) = {}s",
                self.lease.ttl_secs,
                STEP_OVERHEAD_SECS,
                budget.as_secs()
            );
        }
        Ok(())
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        tracing::info!(profile = %self.profile, "Engine configuration loaded");
        tracing::info!(
            poll_ms = self.monitor.poll_interval_ms,
            read_concurrency = self.monitor.read_concurrency,
            discovery_range = self.monitor.discovery_block_range,
            "Monitor"
        );
        tracing::info!(
            steps = self.negotiation.step_count,
            safety_discount_bps = self.negotiation.safety_discount_bps,
            close_factor_bps = self.negotiation.pre_liquidation_close_factor_bps,
            slippage_bps = self.negotiation.slippage_bps,
            "Negotiation"
        );
        tracing::info!(
            ttl_secs = self.lease.ttl_secs,
            task_interval_ms = self.lease.task_interval_ms,
            receipt_timeout_secs = self.execution.receipt_timeout_secs,
            gas_limit = self.execution.gas_limit,
            "Lease and execution"
        );
    }
}
