//! Leverage Token Rebalancer
//!
//! Watches leverage tokens for rebalance eligibility and executes profitable
//! auction takes and pre-liquidation rebalances through the rebalancer
//! contract.
//! Features:
//! - Batched state reads with per-position isolation
//! - Repeating auction take tasks guarded by per-position leases
//! - Stepped negotiation over candidate take sizes
//! - Best-route selection across DEX, aggregator and ERC-4626 venues

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rebalancer_api::swap::{
    AggregatorProvider, Erc4626Provider, UniswapV2Provider, UniswapV3Addresses, UniswapV3Provider,
};
use rebalancer_api::{AlertSink, Alerter, LogAlertSink, QuoteProvider, RouteSelector, TelegramAlertSink};
use rebalancer_chain::{
    LeverageTokenDiscovery, LeverageTokenReader, RebalanceReader, TransactionExecutor,
    TransactionSender,
};
use rebalancer_core::{
    DeploymentConfig, EligibilityMonitor, EngineConfig, LeaseScheduler, NegotiationEngine,
    PositionRegistry,
};

/// Environment variable names.
mod env {
    pub const DEPLOYMENT_CONFIG: &str = "DEPLOYMENT_CONFIG";
    pub const PRIVATE_KEY: &str = "PRIVATE_KEY";
    pub const TELEGRAM_BOT_TOKEN: &str = "TELEGRAM_BOT_TOKEN";
    pub const LOG_FORMAT: &str = "LOG_FORMAT";
}

const DEFAULT_DEPLOYMENT: &str = "config/deployment.toml";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    // BOT_PROFILE selects default/production/aggressive; ENGINE_CONFIG points at a TOML file
    let engine_config = EngineConfig::from_env()?;
    engine_config.validate()?;
    engine_config.log_config();

    let deployment_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(env::DEPLOYMENT_CONFIG).ok())
        .unwrap_or_else(|| DEFAULT_DEPLOYMENT.to_string());
    let deployment = DeploymentConfig::from_file(&deployment_path)
        .with_context(|| format!("loading deployment {deployment_path}"))?;

    info!(
        name = %deployment.name,
        chain_id = deployment.chain_id,
        leverage_manager = %deployment.leverage_manager,
        rebalancer = %deployment.rebalancer,
        "Starting leverage token rebalancer"
    );

    let monitor = initialize_components(&engine_config, &deployment).await?;

    tokio::select! {
        _ = monitor.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rebalancer_core=debug,rebalancer_chain=debug"));

    if std::env::var(env::LOG_FORMAT).is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

async fn initialize_components(
    engine: &EngineConfig,
    deployment: &DeploymentConfig,
) -> Result<Arc<EligibilityMonitor>> {
    info!("Initializing components...");

    let private_key = std::env::var(env::PRIVATE_KEY)
        .map_err(|_| anyhow::anyhow!("Missing env var: {}", env::PRIVATE_KEY))?;

    // Chain reader
    let reader: Arc<dyn RebalanceReader> = Arc::new(
        LeverageTokenReader::new(&deployment.rpc_url, deployment.leverage_manager, deployment.rebalancer)
            .await
            .context("connecting reader")?,
    );

    // Transaction sender
    let sender = TransactionSender::new(
        &private_key,
        &deployment.rpc_url,
        deployment.chain_id,
        deployment.gas.clone(),
    )
    .await
    .context("initializing transaction sender")?
    .with_gas_limit(engine.execution.gas_limit)
    .with_poll_interval(engine.execution.receipt_poll());
    info!(address = %sender.address, gas = deployment.gas.name(), "Transaction sender initialized");
    let executor: Arc<dyn TransactionExecutor> = Arc::new(sender);

    // Routing
    let router = Arc::new(build_router(engine, deployment)?);
    info!(venues = router.providers(), "Route selector configured");
    if router.providers() == 0 {
        warn!("No quote venues configured, every step will be unprofitable");
    }

    // Alerts
    let alerter = build_alerter(deployment)?;

    // Registry
    let registry = Arc::new(PositionRegistry::load(&deployment.registry_path)?);

    // Negotiation engine
    let negotiator = Arc::new(
        NegotiationEngine::new(
            reader.clone(),
            executor.clone(),
            router,
            alerter.clone(),
            deployment.rebalancer,
        )
        .with_config(&engine.negotiation)
        .with_receipt_timeout(engine.execution.receipt_timeout()),
    );

    // Scheduler
    let scheduler = LeaseScheduler::new(engine.lease.ttl(), engine.lease.task_interval());

    // Monitor
    let discovery = Arc::new(LeverageTokenDiscovery::new(
        deployment.rpc_url.clone(),
        deployment.leverage_manager,
    ));
    let monitor = EligibilityMonitor::new(
        registry,
        reader,
        executor,
        negotiator,
        scheduler,
        alerter,
        engine.monitor.clone(),
    )
    .with_discovery(discovery, deployment.discovery_start_block)
    .with_receipt_timeout(engine.execution.receipt_timeout());

    info!("All components initialized");
    Ok(Arc::new(monitor))
}

/// Quote providers in configuration order. ERC-4626 wrappers route their
/// inner leg through a selector holding only the plain venues.
fn build_router(engine: &EngineConfig, deployment: &DeploymentConfig) -> Result<RouteSelector> {
    let slippage = engine.negotiation.slippage_bps;
    let mut venues: Vec<Arc<dyn QuoteProvider>> = Vec::new();

    if let Some(v2) = &deployment.uniswap_v2 {
        let mut provider = UniswapV2Provider::new(&deployment.rpc_url, v2.router).with_slippage_bps(slippage);
        if let Some(connector) = v2.connector {
            provider = provider.with_connector(connector);
        }
        if let Some(venue) = &v2.venue {
            provider = provider.with_venue(venue);
        }
        venues.push(Arc::new(provider));
    }

    if let Some(v3) = &deployment.uniswap_v3 {
        let addresses = UniswapV3Addresses {
            swap_router: v3.swap_router,
            quoter_v2: v3.quoter_v2,
        };
        let mut provider = UniswapV3Provider::new(&deployment.rpc_url, addresses)
            .with_correlated_pairs(v3.correlated_pairs.clone())
            .with_slippage_bps(slippage);
        if let Some(venue) = &v3.venue {
            provider = provider.with_venue(venue);
        }
        venues.push(Arc::new(provider));
    }

    if let Some(aggregator) = &deployment.aggregator {
        let mut provider = AggregatorProvider::new(&aggregator.base_url, deployment.chain_id)?
            .with_slippage_bps(slippage);
        if let Some(key) = &aggregator.api_key {
            provider = provider.with_api_key(key);
        }
        venues.push(Arc::new(provider));
    }

    let inner = Arc::new(
        venues
            .iter()
            .cloned()
            .fold(RouteSelector::new(deployment.rebalancer), |s, p| s.with_provider(p)),
    );

    let mut router = venues
        .into_iter()
        .fold(RouteSelector::new(deployment.rebalancer), |s, p| s.with_provider(p));
    for vault in &deployment.erc4626_vaults {
        let provider = Erc4626Provider::new(&deployment.rpc_url, vault.vault, vault.asset, inner.clone())
            .with_slippage_bps(slippage);
        router = router.with_provider(Arc::new(provider));
    }

    Ok(router)
}

fn build_alerter(deployment: &DeploymentConfig) -> Result<Alerter> {
    let mut sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(LogAlertSink)];

    match (&deployment.telegram, std::env::var(env::TELEGRAM_BOT_TOKEN)) {
        (Some(telegram), Ok(token)) => {
            sinks.push(Arc::new(TelegramAlertSink::new(token, telegram.chat_id.clone())?));
            info!("Telegram alerts enabled");
        }
        (Some(_), Err(_)) => warn!("Telegram configured but TELEGRAM_BOT_TOKEN is unset"),
        _ => {}
    }

    Ok(Alerter::new(sinks))
}
