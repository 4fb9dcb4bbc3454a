//! Eligibility monitor.
//!
//! Every tick: pick up newly created tokens, read all tracked positions in
//! one batch, classify each and dispatch the matching action. Auctions are
//! opened if needed and handed to a repeating take task; pre-liquidations
//! run once under the position's lease.

use crate::config::{ExecutionConfig, MonitorConfig};
use crate::error::LeaseError;
use crate::lease::{LeaseJob, LeaseScheduler, TaskControl};
use crate::negotiator::{NegotiationEngine, NegotiationOutcome};
use crate::position::{classify, Position, PositionSnapshot, RebalanceState};
use crate::registry::PositionRegistry;
use alloy::primitives::Address;
use async_trait::async_trait;
use dashmap::DashSet;
use parking_lot::Mutex;
use rebalancer_api::{Alert, AlertLevel, Alerter};
use rebalancer_chain::{
    encode_create_auction, RebalanceMode, RebalanceReader, TokenSource, TransactionExecutor,
    TxOutcome,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, trace, warn};

/// Summary of one monitor tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tracked: usize,
    pub read_failures: usize,
    pub auction_eligible: usize,
    pub pre_liquidation_eligible: usize,
    /// Positions an action was spawned for
    pub dispatched: Vec<Address>,
}

/// Polls positions and dispatches rebalance actions.
pub struct EligibilityMonitor {
    registry: Arc<PositionRegistry>,
    reader: Arc<dyn RebalanceReader>,
    executor: Arc<dyn TransactionExecutor>,
    engine: Arc<NegotiationEngine>,
    scheduler: Arc<LeaseScheduler>,
    alerter: Alerter,
    discovery: Option<Arc<dyn TokenSource>>,
    /// Next block to scan for created tokens
    discovery_cursor: Mutex<Option<u64>>,
    in_flight: DashSet<Address>,
    config: MonitorConfig,
    receipt_timeout: Duration,
}

impl EligibilityMonitor {
    pub fn new(
        registry: Arc<PositionRegistry>,
        reader: Arc<dyn RebalanceReader>,
        executor: Arc<dyn TransactionExecutor>,
        engine: Arc<NegotiationEngine>,
        scheduler: Arc<LeaseScheduler>,
        alerter: Alerter,
        config: MonitorConfig,
    ) -> Self {
        Self {
            registry,
            reader,
            executor,
            engine,
            scheduler,
            alerter,
            discovery: None,
            discovery_cursor: Mutex::new(None),
            in_flight: DashSet::new(),
            config,
            receipt_timeout: ExecutionConfig::default().receipt_timeout(),
        }
    }

    /// Scan `source` for new tokens each tick, starting at `start_block`
    /// (default: one discovery range behind the head).
    pub fn with_discovery(mut self, source: Arc<dyn TokenSource>, start_block: Option<u64>) -> Self {
        self.discovery = Some(source);
        self.discovery_cursor = Mutex::new(start_block);
        self
    }

    pub fn with_receipt_timeout(mut self, timeout: Duration) -> Self {
        self.receipt_timeout = timeout;
        self
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Tick forever on the poll interval.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            poll_ms = self.config.poll_interval_ms,
            positions = self.registry.len(),
            "Eligibility monitor started"
        );

        loop {
            ticker.tick().await;
            let started = Instant::now();
            match self.tick().await {
                Ok(report) => debug!(
                    tracked = report.tracked,
                    auction = report.auction_eligible,
                    pre_liquidation = report.pre_liquidation_eligible,
                    dispatched = report.dispatched.len(),
                    read_failures = report.read_failures,
                    tasks = self.scheduler.active_tasks(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Tick complete"
                ),
                Err(e) => warn!(error = %e, "Tick failed, retrying next interval"),
            }
        }
    }

    /// One pass over every tracked position.
    pub async fn tick(self: &Arc<Self>) -> anyhow::Result<TickReport> {
        self.discover().await;
        if let Err(e) = self.registry.reload() {
            warn!(error = %e, "Registry reload failed, using cached list");
        }

        let positions = self.registry.list();
        let mut report = TickReport {
            tracked: positions.len(),
            ..Default::default()
        };
        if positions.is_empty() {
            return Ok(report);
        }

        let snapshots = self
            .reader
            .snapshots(&positions, self.config.read_concurrency)
            .await?;
        let by_token: HashMap<Address, &Position> = positions.iter().map(|p| (p.token, p)).collect();

        for (token, result) in snapshots {
            let snapshot = match result {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    report.read_failures += 1;
                    warn!(token = %token, error = %e, "Position read failed");
                    continue;
                }
            };
            let Some(position) = by_token.get(&token) else {
                continue;
            };

            let state = classify(&snapshot);
            trace!(token = %token, state = ?state, block = snapshot.block, "Classified");
            match state {
                RebalanceState::NotEligible => continue,
                RebalanceState::AuctionEligible => report.auction_eligible += 1,
                RebalanceState::PreLiquidationEligible => report.pre_liquidation_eligible += 1,
            }

            if self.dispatch((*position).clone(), state, snapshot) {
                report.dispatched.push(token);
            }
        }

        Ok(report)
    }

    /// Spawn the action for `state` unless one is already in flight.
    fn dispatch(self: &Arc<Self>, position: Position, state: RebalanceState, snapshot: PositionSnapshot) -> bool {
        let Some(mode) = state.mode() else {
            return false;
        };
        let id = position.token;
        if mode == RebalanceMode::Auction && self.scheduler.has_task(&id) {
            return false;
        }
        if !self.in_flight.insert(id) {
            trace!(token = %id, "Action already in flight");
            return false;
        }

        let guard = InFlight {
            monitor: self.clone(),
            id,
        };
        tokio::spawn(async move {
            let monitor = guard.monitor.clone();
            match mode {
                RebalanceMode::Auction => monitor.start_auction(position, snapshot.auction_valid).await,
                RebalanceMode::PreLiquidation => monitor.pre_liquidate(position).await,
            }
            drop(guard);
        });
        true
    }

    /// Open the auction if needed, then hand the position to a take task.
    #[instrument(skip(self, position), fields(token = %position.token))]
    async fn start_auction(&self, position: Position, auction_open: bool) {
        if !auction_open && !self.create_auction(&position).await {
            return;
        }

        let job = Arc::new(AuctionTakeJob {
            engine: self.engine.clone(),
        });
        self.scheduler.start_if_absent(position, job);
    }

    /// Submit `createAuction()`. True once the auction is known to be open.
    async fn create_auction(&self, position: &Position) -> bool {
        let request = encode_create_auction(position.rebalance_adapter);

        if let Err(e) = self.executor.simulate(&request).await {
            if e.is_stale() {
                debug!(error = %e, "Auction already open or not creatable");
            } else {
                warn!(error = %e, "createAuction simulation failed");
                self.alert(position, AlertLevel::Warning, "Auction creation failed", e.to_string());
            }
            return false;
        }

        let handle = match self.executor.submit(&request).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "createAuction submission failed");
                self.alert(position, AlertLevel::Critical, "Auction creation failed", e.to_string());
                return false;
            }
        };

        match self.executor.await_outcome(&handle, self.receipt_timeout).await {
            Ok(TxOutcome::Success { block, .. }) => {
                info!(tx_hash = %handle.hash, block, "Auction created");
                self.alert(
                    position,
                    AlertLevel::Info,
                    "Auction created",
                    format!("tx {}", handle.hash),
                );
                true
            }
            Ok(TxOutcome::Reverted(reason)) => {
                warn!(tx_hash = %handle.hash, reason = %reason, "createAuction reverted");
                false
            }
            Ok(TxOutcome::TimedOut) => {
                warn!(tx_hash = %handle.hash, "createAuction receipt timed out");
                false
            }
            Err(e) => {
                warn!(tx_hash = %handle.hash, error = %e, "createAuction receipt polling failed");
                false
            }
        }
    }

    /// One pre-liquidation attempt under the position's lease.
    #[instrument(skip(self, position), fields(token = %position.token))]
    async fn pre_liquidate(&self, position: Position) {
        let id = position.token;
        let lease = match self.scheduler.acquire(id, self.scheduler.ttl()) {
            Ok(lease) => lease,
            Err(LeaseError::LockOccupied(_)) => return,
        };

        let result = self.engine.negotiate(&position, RebalanceMode::PreLiquidation).await;
        self.scheduler.release(id, lease);

        match result {
            Ok(outcome) => info!(outcome = ?outcome, "Pre-liquidation attempt finished"),
            Err(e) => {
                error!(error = %e, "Pre-liquidation attempt failed");
                self.alert(&position, AlertLevel::Critical, "Pre-liquidation failed", e.to_string());
            }
        }
    }

    /// Append tokens created since the last scanned block.
    async fn discover(&self) {
        let Some(source) = self.discovery.as_ref() else {
            return;
        };
        let latest = match self.reader.block_number().await {
            Ok(block) => block,
            Err(e) => {
                debug!(error = %e, "Discovery skipped, block number unavailable");
                return;
            }
        };

        let range = self.config.discovery_block_range.max(1);
        let mut start = self
            .discovery_cursor
            .lock()
            .unwrap_or_else(|| latest.saturating_sub(range));

        while start <= latest {
            let end = start.saturating_add(range - 1).min(latest);
            let found = match source.created_between(start, end).await {
                Ok(found) => found,
                Err(e) => {
                    warn!(from_block = start, to_block = end, error = %e, "Token discovery failed");
                    return;
                }
            };

            if !found.is_empty() {
                match self.registry.append(found) {
                    Ok(0) => {}
                    Ok(added) => {
                        info!(added, from_block = start, to_block = end, "Discovered leverage tokens");
                        self.alerter.send(Alert::new(
                            AlertLevel::Info,
                            "New leverage tokens",
                            format!("{added} token(s) created in blocks {start}..={end}"),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "Registry append failed");
                        return;
                    }
                }
            }

            *self.discovery_cursor.lock() = Some(end + 1);
            start = end + 1;
        }
    }

    fn alert(&self, position: &Position, level: AlertLevel, title: &str, body: String) {
        self.alerter
            .send(Alert::new(level, title, body).for_token(position.token));
    }
}

/// Clears the in-flight mark when the action ends, including on panic.
struct InFlight {
    monitor: Arc<EligibilityMonitor>,
    id: Address,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.monitor.in_flight.remove(&self.id);
    }
}

/// Repeating auction take, run under the position's lease.
struct AuctionTakeJob {
    engine: Arc<NegotiationEngine>,
}

#[async_trait]
impl LeaseJob for AuctionTakeJob {
    async fn run(&self, position: &Position) -> TaskControl {
        let outcome = match self.engine.negotiate(position, RebalanceMode::Auction).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(token = %position.token, error = %e, "Auction attempt failed");
                return TaskControl::Continue;
            }
        };

        match outcome {
            NegotiationOutcome::NoLongerEligible { .. } => TaskControl::Stop,
            NegotiationOutcome::Exhausted { .. } => TaskControl::Continue,
            NegotiationOutcome::Executed { .. } | NegotiationOutcome::NothingToTake => {
                match self
                    .engine
                    .reader()
                    .is_still_eligible(position, RebalanceMode::Auction)
                    .await
                {
                    Ok(false) => TaskControl::Stop,
                    Ok(true) => TaskControl::Continue,
                    Err(e) => {
                        debug!(token = %position.token, error = %e, "Eligibility check failed");
                        TaskControl::Continue
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{B256, U256};
    use rebalancer_api::{Call, Quote, QuoteData, QuoteProvider, QuoteRequest, RouteSelector};
    use rebalancer_chain::{ExecutionRequest, ExecutorError, TakeContext, TxHandle, WAD};
    use std::collections::HashSet;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("rebalancer-monitor-{name}-{}-{nanos}.json", std::process::id()))
    }

    fn position(byte: u8) -> Position {
        Position {
            token: Address::repeat_byte(byte),
            collateral_asset: Address::repeat_byte(0xc0),
            debt_asset: Address::repeat_byte(0xd0),
            rebalance_adapter: Address::repeat_byte(0xa0),
            lending_adapter: Address::repeat_byte(0xb0),
        }
    }

    fn snapshot(token: Address, collateral: u64, eligible: bool) -> PositionSnapshot {
        PositionSnapshot {
            token,
            block: 100,
            collateral: U256::from(collateral),
            debt: U256::from(1000u64),
            equity: U256::from(collateral.saturating_sub(1000)),
            collateral_ratio: WAD * U256::from(collateral) / U256::from(1000u64),
            target_ratio: WAD * U256::from(2u64),
            adapter_eligible: eligible,
            auction_valid: false,
            pre_liquidation_threshold: WAD * U256::from(11u64) / U256::from(10u64),
        }
    }

    #[derive(Default)]
    struct MockReader {
        snapshots: HashMap<Address, PositionSnapshot>,
        failing: HashSet<Address>,
        fail_batch: bool,
    }

    #[async_trait]
    impl RebalanceReader for MockReader {
        async fn block_number(&self) -> anyhow::Result<u64> {
            Ok(100)
        }

        async fn snapshot(&self, position: &Position) -> anyhow::Result<PositionSnapshot> {
            self.snapshots
                .get(&position.token)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown token"))
        }

        async fn snapshots(
            &self,
            positions: &[Position],
            _concurrency: usize,
        ) -> anyhow::Result<Vec<(Address, anyhow::Result<PositionSnapshot>)>> {
            if self.fail_batch {
                anyhow::bail!("node unreachable");
            }
            let mut out = Vec::new();
            for p in positions {
                if self.failing.contains(&p.token) {
                    out.push((p.token, Err(anyhow::anyhow!("call reverted"))));
                } else {
                    out.push((p.token, self.snapshot(p).await));
                }
            }
            Ok(out)
        }

        async fn take_context(&self, position: &Position) -> anyhow::Result<TakeContext> {
            Ok(TakeContext {
                snapshot: self.snapshot(position).await?,
                rebalance_reward_bps: 500,
            })
        }

        async fn is_still_eligible(&self, _position: &Position, mode: RebalanceMode) -> anyhow::Result<bool> {
            // Auctions close immediately so take tasks stop on their first run
            Ok(mode == RebalanceMode::PreLiquidation)
        }

        async fn required_amount_in(
            &self,
            _position: &Position,
            _mode: RebalanceMode,
            take: U256,
        ) -> anyhow::Result<U256> {
            Ok(take)
        }

        async fn debt_to_collateral(&self, _position: &Position, debt: U256) -> anyhow::Result<U256> {
            Ok(debt)
        }

        async fn collateral_to_debt(&self, _position: &Position, collateral: U256) -> anyhow::Result<U256> {
            Ok(collateral)
        }
    }

    #[derive(Default)]
    struct MockExecutor {
        labels: Mutex<Vec<&'static str>>,
        delay: Duration,
    }

    #[async_trait]
    impl TransactionExecutor for MockExecutor {
        async fn simulate(&self, _request: &ExecutionRequest) -> Result<(), ExecutorError> {
            tokio::time::sleep(self.delay).await;
            Ok(())
        }

        async fn submit(&self, request: &ExecutionRequest) -> Result<TxHandle, ExecutorError> {
            self.labels.lock().push(request.label);
            Ok(TxHandle {
                hash: B256::repeat_byte(0x42),
                nonce: 0,
                request: request.clone(),
                submitted_at: Instant::now(),
            })
        }

        async fn await_outcome(&self, _handle: &TxHandle, _timeout: Duration) -> Result<TxOutcome, ExecutorError> {
            Ok(TxOutcome::Success { block: 101, gas_used: 1 })
        }

        async fn outcome_now(&self, _handle: &TxHandle) -> Result<Option<TxOutcome>, ExecutorError> {
            Ok(None)
        }
    }

    #[derive(Debug)]
    struct DoublingProvider;

    #[async_trait]
    impl QuoteProvider for DoublingProvider {
        fn venue(&self) -> &str {
            "doubling"
        }

        async fn quote(&self, request: &QuoteRequest) -> anyhow::Result<Option<Quote>> {
            Ok(Some(Quote {
                venue: "doubling".into(),
                request: *request,
                amount_out: request.amount_in * U256::from(2u64),
                data: QuoteData::ConcentratedLiquidity { fee: 500 },
            }))
        }

        fn build_calldata(&self, quote: &Quote) -> anyhow::Result<Vec<Call>> {
            Ok(vec![Call::new(quote.request.from, vec![0x01])])
        }
    }

    struct MockSource {
        created: Vec<(u64, Position)>,
        ranges: Mutex<Vec<(u64, u64)>>,
    }

    #[async_trait]
    impl TokenSource for MockSource {
        async fn created_between(&self, from_block: u64, to_block: u64) -> anyhow::Result<Vec<Position>> {
            self.ranges.lock().push((from_block, to_block));
            Ok(self
                .created
                .iter()
                .filter(|(block, _)| (from_block..=to_block).contains(block))
                .map(|(_, p)| p.clone())
                .collect())
        }
    }

    fn monitor(
        path: &PathBuf,
        reader: Arc<MockReader>,
        executor: Arc<MockExecutor>,
    ) -> (EligibilityMonitor, Arc<LeaseScheduler>) {
        let registry = Arc::new(PositionRegistry::load(path).unwrap());
        let router = RouteSelector::new(Address::repeat_byte(0xee)).with_provider(Arc::new(DoublingProvider));
        let engine = Arc::new(NegotiationEngine::new(
            reader.clone(),
            executor.clone(),
            Arc::new(router),
            Alerter::log_only(),
            Address::repeat_byte(0xee),
        ));
        let scheduler = LeaseScheduler::new(Duration::from_secs(5), Duration::from_millis(10));
        let monitor = EligibilityMonitor::new(
            registry,
            reader,
            executor,
            engine,
            scheduler.clone(),
            Alerter::log_only(),
            MonitorConfig::default(),
        );
        (monitor, scheduler)
    }

    async fn wait_idle(monitor: &EligibilityMonitor, scheduler: &LeaseScheduler) {
        for _ in 0..100 {
            if monitor.in_flight() == 0 && scheduler.active_tasks() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_tick_dispatches_by_state() {
        let path = temp_path("dispatch");
        let (idle, auction, pre_liq) = (position(1), position(2), position(3));
        PositionRegistry::load(&path)
            .unwrap()
            .append([idle.clone(), auction.clone(), pre_liq.clone()])
            .unwrap();

        let mut reader = MockReader::default();
        reader.snapshots.insert(idle.token, snapshot(idle.token, 2000, false));
        reader.snapshots.insert(auction.token, snapshot(auction.token, 3000, true));
        reader.snapshots.insert(pre_liq.token, snapshot(pre_liq.token, 1050, true));
        let executor = Arc::new(MockExecutor::default());
        let (monitor, scheduler) = monitor(&path, Arc::new(reader), executor.clone());
        let monitor = Arc::new(monitor);

        let report = monitor.tick().await.unwrap();
        assert_eq!(report.tracked, 3);
        assert_eq!(report.auction_eligible, 1);
        assert_eq!(report.pre_liquidation_eligible, 1);
        assert_eq!(report.dispatched.len(), 2);
        assert!(!report.dispatched.contains(&idle.token));

        wait_idle(&monitor, &scheduler).await;
        let labels = executor.labels.lock().clone();
        assert!(labels.contains(&"createAuction"));
        assert!(labels.contains(&"preLiquidationRebalance"));
        assert!(!labels.contains(&"takeAuction"));
        assert_eq!(scheduler.active_tasks(), 0);
        assert!(!scheduler.is_leased(&pre_liq.token));

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_in_flight_positions_are_not_redispatched() {
        let path = temp_path("inflight");
        let target = position(4);
        PositionRegistry::load(&path).unwrap().append([target.clone()]).unwrap();

        let mut reader = MockReader::default();
        reader.snapshots.insert(target.token, snapshot(target.token, 1050, true));
        let executor = Arc::new(MockExecutor {
            delay: Duration::from_millis(100),
            ..Default::default()
        });
        let (monitor, scheduler) = monitor(&path, Arc::new(reader), executor);
        let monitor = Arc::new(monitor);

        let first = monitor.tick().await.unwrap();
        let second = monitor.tick().await.unwrap();
        assert_eq!(first.dispatched, vec![target.token]);
        assert!(second.dispatched.is_empty());
        assert_eq!(monitor.in_flight(), 1);

        wait_idle(&monitor, &scheduler).await;
        assert_eq!(monitor.in_flight(), 0);

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_read_failures_are_isolated() {
        let path = temp_path("failures");
        let (ok, broken) = (position(5), position(6));
        PositionRegistry::load(&path)
            .unwrap()
            .append([ok.clone(), broken.clone()])
            .unwrap();

        let mut reader = MockReader::default();
        reader.snapshots.insert(ok.token, snapshot(ok.token, 2000, false));
        reader.failing.insert(broken.token);
        let (monitor, _) = monitor(&path, Arc::new(reader), Arc::new(MockExecutor::default()));
        let monitor = Arc::new(monitor);

        let report = monitor.tick().await.unwrap();
        assert_eq!(report.tracked, 2);
        assert_eq!(report.read_failures, 1);
        assert!(report.dispatched.is_empty());

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_batch_failure_fails_tick() {
        let path = temp_path("batch");
        PositionRegistry::load(&path).unwrap().append([position(7)]).unwrap();

        let reader = MockReader {
            fail_batch: true,
            ..Default::default()
        };
        let (monitor, _) = monitor(&path, Arc::new(reader), Arc::new(MockExecutor::default()));
        assert!(Arc::new(monitor).tick().await.is_err());

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_discovery_appends_and_advances_cursor() {
        let path = temp_path("discovery");
        let created = position(8);
        let mut reader = MockReader::default();
        reader.snapshots.insert(created.token, snapshot(created.token, 2000, false));
        let (monitor, _) = monitor(&path, Arc::new(reader), Arc::new(MockExecutor::default()));

        let source = Arc::new(MockSource {
            created: vec![(95, created.clone())],
            ranges: Mutex::new(Vec::new()),
        });
        let monitor = Arc::new(monitor.with_discovery(source.clone(), Some(40)));

        let report = monitor.tick().await.unwrap();
        assert_eq!(report.tracked, 1);
        assert!(monitor.registry.contains(&created.token));
        assert_eq!(*source.ranges.lock(), vec![(40, 100)]);
        assert_eq!(*monitor.discovery_cursor.lock(), Some(101));

        // Head unchanged: nothing left to scan
        monitor.tick().await.unwrap();
        assert_eq!(source.ranges.lock().len(), 1);

        std::fs::remove_file(&path).unwrap();
    }
}
