//! Off-chain collaborators for the rebalancer.
//!
//! This crate provides:
//! - Quote providers for each liquidity venue family
//! - The route selector that picks the best venue for a swap
//! - Alert sinks (Telegram, log)

pub mod alert;
pub mod route;
pub mod swap;

pub use alert::{Alert, AlertLevel, AlertSink, Alerter, LogAlertSink, TelegramAlertSink};
pub use route::{Plan, RouteSelector};
pub use swap::{Call, Quote, QuoteData, QuoteProvider, QuoteRequest};
