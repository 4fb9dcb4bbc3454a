//! Stepped negotiation engine.
//!
//! Sizes the largest take that restores a position's target ratio, then
//! walks down a fixed ladder of candidate amounts. Each step re-checks
//! eligibility, prices the required payment, routes the swap and, when the
//! route covers the payment, simulates and submits. The first mined success
//! ends the attempt.

use crate::config::{ExecutionConfig, NegotiationConfig};
use crate::error::RebalanceError;
use crate::position::Position;
use crate::u256_math;
use alloy::primitives::{Address, B256, U256};
use rebalancer_api::{Alert, AlertLevel, Alerter, Call, Plan, RouteSelector};
use rebalancer_chain::{
    encode_pre_liquidation, encode_take_auction, ExecutionRequest, IRebalancer, RebalanceMode,
    RebalanceReader, TakeContext, TransactionExecutor, TxHandle, TxOutcome,
};
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Candidate ladder, largest first.
pub type Candidates = SmallVec<[U256; 8]>;

/// `max_take − i·(max_take / step_count)` for `i in 0..step_count`.
pub fn candidates(max_take: U256, step_count: usize) -> Candidates {
    if max_take.is_zero() || step_count == 0 {
        return Candidates::new();
    }
    let step = max_take / U256::from(step_count);
    (0..step_count)
        .map(|i| max_take - step * U256::from(i))
        .collect()
}

/// Which asset the rebalancer receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeSide {
    /// Debt out, collateral in (position over target)
    Debt,
    /// Collateral out, debt in (position under target or pre-liquidation)
    Collateral,
}

impl TakeSide {
    /// `(take_asset, payment_asset)` for `position`.
    pub fn assets(self, position: &Position) -> (Address, Address) {
        match self {
            TakeSide::Debt => (position.debt_asset, position.collateral_asset),
            TakeSide::Collateral => (position.collateral_asset, position.debt_asset),
        }
    }
}

/// Unconverted take size, always in debt-asset units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TakeSize {
    pub side: TakeSide,
    pub debt_units: U256,
}

/// Size the take that brings the snapshot back to its target ratio.
pub fn take_size(context: &TakeContext, mode: RebalanceMode, close_factor_bps: u64) -> TakeSize {
    let s = &context.snapshot;
    match mode {
        RebalanceMode::Auction if s.collateral_ratio > s.target_ratio => TakeSize {
            side: TakeSide::Debt,
            debt_units: u256_math::excess_collateral_delta(s.collateral, s.debt, s.target_ratio),
        },
        RebalanceMode::Auction if s.collateral_ratio < s.target_ratio => TakeSize {
            side: TakeSide::Collateral,
            debt_units: u256_math::collateral_shortfall_delta(s.collateral, s.debt, s.target_ratio),
        },
        RebalanceMode::Auction => TakeSize {
            side: TakeSide::Debt,
            debt_units: U256::ZERO,
        },
        RebalanceMode::PreLiquidation => {
            let repay = u256_math::pre_liquidation_repay(
                s.collateral,
                s.debt,
                s.target_ratio,
                context.rebalance_reward_bps,
                close_factor_bps,
            );
            TakeSize {
                side: TakeSide::Collateral,
                debt_units: u256_math::seized_for_repay(repay, context.rebalance_reward_bps),
            }
        }
    }
}

/// How an attempt ended. Every variant is a normal outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationOutcome {
    /// A take landed on chain.
    Executed { step: usize, take: U256, tx_hash: B256 },
    /// Every candidate was unprofitable, stale, reverted or timed out.
    Exhausted { steps: usize },
    /// Eligibility was lost before `step`.
    NoLongerEligible { step: usize },
    /// Position already at target.
    NothingToTake,
}

/// One evaluated step of the ladder. Never persisted.
#[derive(Debug, Clone)]
pub struct CandidatePlan {
    pub take: U256,
    /// Payment owed to the adapter for `take`
    pub required_in: U256,
    /// Best route for selling `take`
    pub plan: Plan,
}

impl CandidatePlan {
    /// Route output covers the payment owed.
    pub fn is_profitable(&self) -> bool {
        self.plan.covers(self.required_in)
    }

    pub fn venue(&self) -> &str {
        self.plan.venue.as_deref().unwrap_or("none")
    }
}

/// Transaction sent earlier in the attempt whose receipt never arrived.
struct Unconfirmed {
    step: usize,
    take: U256,
    handle: TxHandle,
}

/// Runs one rebalance attempt for a position.
pub struct NegotiationEngine {
    reader: Arc<dyn RebalanceReader>,
    executor: Arc<dyn TransactionExecutor>,
    router: Arc<RouteSelector>,
    alerter: Alerter,
    /// Rebalancer executor contract
    rebalancer: Address,
    step_count: usize,
    safety_discount_bps: u64,
    close_factor_bps: u64,
    receipt_timeout: Duration,
}

impl NegotiationEngine {
    pub fn new(
        reader: Arc<dyn RebalanceReader>,
        executor: Arc<dyn TransactionExecutor>,
        router: Arc<RouteSelector>,
        alerter: Alerter,
        rebalancer: Address,
    ) -> Self {
        let defaults = NegotiationConfig::default();
        Self {
            reader,
            executor,
            router,
            alerter,
            rebalancer,
            step_count: defaults.step_count,
            safety_discount_bps: defaults.safety_discount_bps,
            close_factor_bps: defaults.pre_liquidation_close_factor_bps,
            receipt_timeout: ExecutionConfig::default().receipt_timeout(),
        }
    }

    /// Apply step count, safety discount and close factor.
    pub fn with_config(mut self, config: &NegotiationConfig) -> Self {
        self.step_count = config.step_count;
        self.safety_discount_bps = config.safety_discount_bps;
        self.close_factor_bps = config.pre_liquidation_close_factor_bps;
        self
    }

    pub fn with_receipt_timeout(mut self, timeout: Duration) -> Self {
        self.receipt_timeout = timeout;
        self
    }

    pub fn reader(&self) -> &Arc<dyn RebalanceReader> {
        &self.reader
    }

    /// Run a full attempt: size, build the ladder, walk it.
    #[instrument(skip(self, position), fields(token = %position.token, mode = %mode))]
    pub async fn negotiate(
        &self,
        position: &Position,
        mode: RebalanceMode,
    ) -> Result<NegotiationOutcome, RebalanceError> {
        let context = self.reader.take_context(position).await?;
        let size = take_size(&context, mode, self.close_factor_bps);
        if size.debt_units.is_zero() {
            debug!(block = context.snapshot.block, "Position at target, nothing to take");
            return Ok(NegotiationOutcome::NothingToTake);
        }

        let raw = match size.side {
            TakeSide::Debt => size.debt_units,
            TakeSide::Collateral => self.reader.debt_to_collateral(position, size.debt_units).await?,
        };
        let max_take = u256_math::apply_basis_points(raw, self.safety_discount_bps);
        if max_take.is_zero() {
            return Ok(NegotiationOutcome::NothingToTake);
        }

        let (take_asset, payment_asset) = size.side.assets(position);
        let ladder = candidates(max_take, self.step_count);
        info!(
            side = ?size.side,
            max_take = %max_take,
            steps = ladder.len(),
            ratio = u256_math::wad_to_f64(context.snapshot.collateral_ratio),
            target = u256_math::wad_to_f64(context.snapshot.target_ratio),
            "Starting negotiation"
        );

        self.run_steps(position, mode, take_asset, payment_asset, &ladder).await
    }

    /// Walk `ladder` in order. Stops at the first executed take.
    pub async fn run_steps(
        &self,
        position: &Position,
        mode: RebalanceMode,
        take_asset: Address,
        payment_asset: Address,
        ladder: &[U256],
    ) -> Result<NegotiationOutcome, RebalanceError> {
        let mut unconfirmed: Vec<Unconfirmed> = Vec::new();

        for (index, &take) in ladder.iter().enumerate() {
            let step = index + 1;

            if !self.reader.is_still_eligible(position, mode).await? {
                info!(step, "No longer eligible, stopping");
                return Ok(NegotiationOutcome::NoLongerEligible { step });
            }

            let candidate = CandidatePlan {
                take,
                required_in: self.reader.required_amount_in(position, mode, take).await?,
                plan: self.router.select_best_route(take_asset, payment_asset, take).await,
            };
            if !candidate.is_profitable() {
                debug!(
                    step,
                    take = %take,
                    required = %candidate.required_in,
                    quoted = %candidate.plan.amount_out,
                    "Unprofitable step"
                );
                continue;
            }
            if candidate.plan.calls.is_empty() && take_asset != payment_asset {
                return Err(RebalanceError::Route(format!(
                    "plan {take_asset} -> {payment_asset} has no calls"
                )));
            }

            let request = self.encode(position, mode, take, &candidate.plan);
            match self.executor.simulate(&request).await {
                Ok(()) => {}
                Err(e) if e.is_stale() => {
                    debug!(step, take = %take, error = %e, "Stale state in simulation");
                    continue;
                }
                Err(e) => {
                    self.alert(
                        position,
                        AlertLevel::Critical,
                        "Simulation failed",
                        format!("{mode} step {step} take {take}: {e}"),
                    );
                    return Err(RebalanceError::from_simulation(e));
                }
            }

            if let Some(outcome) = self.landed_earlier(position, mode, &unconfirmed).await {
                return Ok(outcome);
            }

            let handle = match self.executor.submit(&request).await {
                Ok(handle) => handle,
                Err(e) => {
                    self.alert(
                        position,
                        AlertLevel::Critical,
                        "Submission failed",
                        format!("{mode} step {step} take {take}: {e}"),
                    );
                    return Err(RebalanceError::Submission(e.to_string()));
                }
            };
            info!(
                step,
                take = %take,
                venue = candidate.venue(),
                tx_hash = %handle.hash,
                "Submitted rebalance"
            );

            match self.executor.await_outcome(&handle, self.receipt_timeout).await {
                Ok(TxOutcome::Success { block, gas_used }) => {
                    info!(step, take = %take, tx_hash = %handle.hash, block, gas_used, "Rebalance executed");
                    self.alert_success(position, mode, step, take, handle.hash).await;
                    return Ok(NegotiationOutcome::Executed {
                        step,
                        take,
                        tx_hash: handle.hash,
                    });
                }
                Ok(TxOutcome::Reverted(reason)) => {
                    warn!(step, take = %take, tx_hash = %handle.hash, reason = %reason, "Rebalance reverted");
                    self.alert(
                        position,
                        AlertLevel::Warning,
                        "Rebalance reverted",
                        format!("{mode} step {step} take {take} tx {}: {reason}", handle.hash),
                    );
                }
                Ok(TxOutcome::TimedOut) => {
                    warn!(step, take = %take, tx_hash = %handle.hash, "Receipt timed out, moving on");
                    self.alert(
                        position,
                        AlertLevel::Warning,
                        "Receipt timeout",
                        format!("{mode} step {step} take {take} tx {}", handle.hash),
                    );
                    unconfirmed.push(Unconfirmed { step, take, handle });
                }
                Err(e) => {
                    warn!(step, tx_hash = %handle.hash, error = %e, "Receipt polling failed, moving on");
                    unconfirmed.push(Unconfirmed { step, take, handle });
                }
            }
        }

        if let Some(outcome) = self.landed_earlier(position, mode, &unconfirmed).await {
            return Ok(outcome);
        }
        info!(steps = ladder.len(), "Candidates exhausted");
        Ok(NegotiationOutcome::Exhausted { steps: ladder.len() })
    }

    /// Probe each unconfirmed transaction once. A late success ends the attempt.
    async fn landed_earlier(
        &self,
        position: &Position,
        mode: RebalanceMode,
        unconfirmed: &[Unconfirmed],
    ) -> Option<NegotiationOutcome> {
        for tx in unconfirmed {
            match self.executor.outcome_now(&tx.handle).await {
                Ok(Some(TxOutcome::Success { block, .. })) => {
                    info!(step = tx.step, tx_hash = %tx.handle.hash, block, "Earlier transaction landed late");
                    self.alert_success(position, mode, tx.step, tx.take, tx.handle.hash).await;
                    return Some(NegotiationOutcome::Executed {
                        step: tx.step,
                        take: tx.take,
                        tx_hash: tx.handle.hash,
                    });
                }
                Ok(_) => {}
                Err(e) => debug!(tx_hash = %tx.handle.hash, error = %e, "Receipt probe failed"),
            }
        }
        None
    }

    fn encode(&self, position: &Position, mode: RebalanceMode, take: U256, plan: &Plan) -> ExecutionRequest {
        let calls = plan.calls.iter().map(rebalancer_call).collect();
        match mode {
            RebalanceMode::Auction => {
                encode_take_auction(self.rebalancer, position.rebalance_adapter, take, calls)
            }
            RebalanceMode::PreLiquidation => {
                encode_pre_liquidation(self.rebalancer, position.token, take, calls)
            }
        }
    }

    fn alert(&self, position: &Position, level: AlertLevel, title: &str, body: String) {
        self.alerter
            .send(Alert::new(level, title, body).for_token(position.token));
    }

    async fn alert_success(
        &self,
        position: &Position,
        mode: RebalanceMode,
        step: usize,
        take: U256,
        tx_hash: B256,
    ) {
        let post_state = match self.reader.snapshot(position).await {
            Ok(s) => format!(
                "ratio {:.4} target {:.4} debt {}",
                u256_math::wad_to_f64(s.collateral_ratio),
                u256_math::wad_to_f64(s.target_ratio),
                s.debt
            ),
            Err(e) => format!("post-state unavailable: {e}"),
        };
        self.alert(
            position,
            AlertLevel::Success,
            "Rebalance executed",
            format!("{mode} step {step} take {take} tx {tx_hash}\n{post_state}"),
        );
    }
}

fn rebalancer_call(call: &Call) -> IRebalancer::Call {
    IRebalancer::Call {
        target: call.target,
        value: call.value,
        data: call.data.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::PositionSnapshot;
    use alloy::sol_types::SolCall;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rebalancer_api::{AlertSink, Quote, QuoteData, QuoteProvider, QuoteRequest};
    use rebalancer_chain::{ExecutorError, WAD};
    use std::collections::{HashMap, VecDeque};
    use std::time::Instant;

    const REBALANCER: Address = Address::repeat_byte(0xee);

    fn position() -> Position {
        Position {
            token: Address::repeat_byte(0x11),
            collateral_asset: Address::repeat_byte(0xc0),
            debt_asset: Address::repeat_byte(0xd0),
            rebalance_adapter: Address::repeat_byte(0xa0),
            lending_adapter: Address::repeat_byte(0xb0),
        }
    }

    fn u(v: u64) -> U256 {
        U256::from(v)
    }

    fn snapshot(collateral: u64, debt: u64) -> PositionSnapshot {
        PositionSnapshot {
            token: position().token,
            block: 100,
            collateral: u(collateral),
            debt: u(debt),
            equity: u(collateral.saturating_sub(debt)),
            collateral_ratio: WAD * u(collateral) / u(debt),
            target_ratio: WAD * u(2),
            adapter_eligible: true,
            auction_valid: true,
            pre_liquidation_threshold: WAD * u(11) / u(10),
        }
    }

    struct MockReader {
        snapshot: PositionSnapshot,
        /// Eligibility checks answered `true` before turning `false`
        eligible_checks: usize,
        /// take -> required amount in (default: take)
        required: HashMap<U256, U256>,
        eligibility_calls: Mutex<usize>,
        required_calls: Mutex<usize>,
        conversion_calls: Mutex<usize>,
    }

    impl MockReader {
        fn new(snapshot: PositionSnapshot) -> Self {
            Self {
                snapshot,
                eligible_checks: usize::MAX,
                required: HashMap::new(),
                eligibility_calls: Mutex::new(0),
                required_calls: Mutex::new(0),
                conversion_calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl RebalanceReader for MockReader {
        async fn block_number(&self) -> anyhow::Result<u64> {
            Ok(self.snapshot.block)
        }

        async fn snapshot(&self, _position: &Position) -> anyhow::Result<PositionSnapshot> {
            Ok(self.snapshot.clone())
        }

        async fn snapshots(
            &self,
            positions: &[Position],
            _concurrency: usize,
        ) -> anyhow::Result<Vec<(Address, anyhow::Result<PositionSnapshot>)>> {
            Ok(positions.iter().map(|p| (p.token, Ok(self.snapshot.clone()))).collect())
        }

        async fn take_context(&self, _position: &Position) -> anyhow::Result<TakeContext> {
            Ok(TakeContext {
                snapshot: self.snapshot.clone(),
                rebalance_reward_bps: 500,
            })
        }

        async fn is_still_eligible(&self, _position: &Position, _mode: RebalanceMode) -> anyhow::Result<bool> {
            let mut calls = self.eligibility_calls.lock();
            *calls += 1;
            Ok(*calls <= self.eligible_checks)
        }

        async fn required_amount_in(
            &self,
            _position: &Position,
            _mode: RebalanceMode,
            take: U256,
        ) -> anyhow::Result<U256> {
            *self.required_calls.lock() += 1;
            Ok(self.required.get(&take).copied().unwrap_or(take))
        }

        async fn debt_to_collateral(&self, _position: &Position, debt: U256) -> anyhow::Result<U256> {
            *self.conversion_calls.lock() += 1;
            Ok(debt * u(2))
        }

        async fn collateral_to_debt(&self, _position: &Position, collateral: U256) -> anyhow::Result<U256> {
            *self.conversion_calls.lock() += 1;
            Ok(collateral / u(2))
        }
    }

    #[derive(Default)]
    struct MockExecutor {
        simulations: Mutex<VecDeque<Result<(), ExecutorError>>>,
        outcomes: Mutex<VecDeque<TxOutcome>>,
        /// Answer for `outcome_now` probes (default: still pending)
        late: Mutex<Option<TxOutcome>>,
        submitted: Mutex<Vec<ExecutionRequest>>,
        probes: Mutex<usize>,
        /// Fail every `submit` with this message
        submit_failure: Mutex<Option<String>>,
        /// Number of upcoming `await_outcome` calls that error
        await_failures: Mutex<usize>,
    }

    impl MockExecutor {
        fn submitted_takes(&self) -> Vec<U256> {
            self.submitted
                .lock()
                .iter()
                .map(|r| IRebalancer::takeAuctionCall::abi_decode(&r.data, true).unwrap().amountOut)
                .collect()
        }
    }

    #[async_trait]
    impl TransactionExecutor for MockExecutor {
        async fn simulate(&self, _request: &ExecutionRequest) -> Result<(), ExecutorError> {
            self.simulations.lock().pop_front().unwrap_or(Ok(()))
        }

        async fn submit(&self, request: &ExecutionRequest) -> Result<TxHandle, ExecutorError> {
            if let Some(message) = self.submit_failure.lock().clone() {
                return Err(ExecutorError::Submission(message));
            }
            let mut submitted = self.submitted.lock();
            submitted.push(request.clone());
            let nonce = submitted.len() as u64;
            Ok(TxHandle {
                hash: B256::with_last_byte(nonce as u8),
                nonce,
                request: request.clone(),
                submitted_at: Instant::now(),
            })
        }

        async fn await_outcome(&self, _handle: &TxHandle, _timeout: Duration) -> Result<TxOutcome, ExecutorError> {
            {
                let mut failures = self.await_failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(ExecutorError::Rpc("connection reset".into()));
                }
            }
            Ok(self
                .outcomes
                .lock()
                .pop_front()
                .unwrap_or(TxOutcome::Success { block: 101, gas_used: 500_000 }))
        }

        async fn outcome_now(&self, _handle: &TxHandle) -> Result<Option<TxOutcome>, ExecutorError> {
            *self.probes.lock() += 1;
            Ok(self.late.lock().clone())
        }
    }

    /// Quotes `amount_in * multiplier` unless overridden per amount.
    #[derive(Debug)]
    struct LadderProvider {
        multiplier: u64,
        quotes: HashMap<U256, U256>,
        requests: Mutex<Vec<QuoteRequest>>,
    }

    impl LadderProvider {
        fn new(multiplier: u64) -> Self {
            Self {
                multiplier,
                quotes: HashMap::new(),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn amounts(&self) -> Vec<U256> {
            self.requests.lock().iter().map(|r| r.amount_in).collect()
        }
    }

    #[async_trait]
    impl QuoteProvider for LadderProvider {
        fn venue(&self) -> &str {
            "ladder"
        }

        async fn quote(&self, request: &QuoteRequest) -> anyhow::Result<Option<Quote>> {
            self.requests.lock().push(*request);
            let amount_out = self
                .quotes
                .get(&request.amount_in)
                .copied()
                .unwrap_or(request.amount_in * U256::from(self.multiplier));
            Ok(Some(Quote {
                venue: "ladder".into(),
                request: *request,
                amount_out,
                data: QuoteData::ConcentratedLiquidity { fee: 500 },
            }))
        }

        fn build_calldata(&self, quote: &Quote) -> anyhow::Result<Vec<Call>> {
            Ok(vec![Call::new(quote.request.from, vec![0xab])])
        }
    }

    /// Keeps every alert for inspection.
    #[derive(Default)]
    struct RecordingSink {
        alerts: Mutex<Vec<Alert>>,
    }

    impl RecordingSink {
        fn titles(&self) -> Vec<String> {
            self.alerts.lock().iter().map(|a| a.title.clone()).collect()
        }
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn deliver(&self, alert: &Alert) -> anyhow::Result<()> {
            self.alerts.lock().push(alert.clone());
            Ok(())
        }
    }

    /// Let spawned alert deliveries run.
    async fn drain_alerts() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn engine(
        reader: Arc<MockReader>,
        executor: Arc<MockExecutor>,
        provider: Arc<LadderProvider>,
    ) -> NegotiationEngine {
        let router = RouteSelector::new(REBALANCER).with_provider(provider);
        NegotiationEngine::new(reader, executor, Arc::new(router), Alerter::log_only(), REBALANCER)
            .with_receipt_timeout(Duration::from_millis(10))
    }

    fn ladder() -> Candidates {
        candidates(u(1000), 5)
    }

    #[test]
    fn test_candidates_monotonic() {
        assert_eq!(ladder().as_slice(), &[u(1000), u(800), u(600), u(400), u(200)]);

        let uneven = candidates(u(1003), 4);
        assert_eq!(uneven.as_slice(), &[u(1003), u(753), u(503), u(253)]);
        assert!(uneven.windows(2).all(|w| w[0] > w[1]));

        assert!(candidates(U256::ZERO, 5).is_empty());
        assert_eq!(candidates(u(3), 5).as_slice(), &[u(3); 5]);
    }

    #[test]
    fn test_take_size_over_and_under_target() {
        let over = TakeContext { snapshot: snapshot(3000, 1000), rebalance_reward_bps: 0 };
        assert_eq!(
            take_size(&over, RebalanceMode::Auction, 5000),
            TakeSize { side: TakeSide::Debt, debt_units: u(1000) }
        );

        let under = TakeContext { snapshot: snapshot(1500, 1000), rebalance_reward_bps: 0 };
        assert_eq!(
            take_size(&under, RebalanceMode::Auction, 5000),
            TakeSize { side: TakeSide::Collateral, debt_units: u(500) }
        );

        let at = TakeContext { snapshot: snapshot(2000, 1000), rebalance_reward_bps: 0 };
        assert!(take_size(&at, RebalanceMode::Auction, 5000).debt_units.is_zero());
    }

    #[test]
    fn test_take_size_pre_liquidation() {
        let context = TakeContext { snapshot: snapshot(1050, 1000), rebalance_reward_bps: 500 };
        let size = take_size(&context, RebalanceMode::PreLiquidation, 5000);
        assert_eq!(size.side, TakeSide::Collateral);
        // repay capped at 500, seize 500 * 1.05
        assert_eq!(size.debt_units, u(525));
    }

    #[tokio::test]
    async fn test_scenario_a_second_step_executes() {
        let mut reader = MockReader::new(snapshot(3000, 1000));
        reader.required = HashMap::from([(u(1000), u(950)), (u(800), u(820))]);
        let reader = Arc::new(reader);
        let executor = Arc::new(MockExecutor::default());
        let mut provider = LadderProvider::new(1);
        provider.quotes = HashMap::from([(u(1000), u(900)), (u(800), u(850))]);
        let provider = Arc::new(provider);
        let engine = engine(reader.clone(), executor.clone(), provider.clone());

        let p = position();
        let outcome = engine
            .run_steps(&p, RebalanceMode::Auction, p.debt_asset, p.collateral_asset, &ladder())
            .await
            .unwrap();

        assert!(matches!(outcome, NegotiationOutcome::Executed { step: 2, take, .. } if take == u(800)));
        assert_eq!(provider.amounts(), vec![u(1000), u(800)]);
        assert_eq!(*reader.required_calls.lock(), 2);
        assert_eq!(executor.submitted_takes(), vec![u(800)]);
    }

    #[tokio::test]
    async fn test_scenario_b_timeout_moves_to_next_step() {
        let reader = Arc::new(MockReader::new(snapshot(3000, 1000)));
        let executor = Arc::new(MockExecutor::default());
        // Steps 1 and 2 unprofitable
        let mut provider = LadderProvider::new(1);
        provider.quotes = HashMap::from([(u(1000), u(1)), (u(800), u(1))]);
        let provider = Arc::new(provider);
        executor.outcomes.lock().push_back(TxOutcome::TimedOut);
        let engine = engine(reader, executor.clone(), provider);

        let p = position();
        let outcome = engine
            .run_steps(&p, RebalanceMode::Auction, p.debt_asset, p.collateral_asset, &ladder())
            .await
            .unwrap();

        assert!(matches!(outcome, NegotiationOutcome::Executed { step: 4, take, .. } if take == u(400)));
        assert_eq!(executor.submitted_takes(), vec![u(600), u(400)]);
        // Step 3's transaction was probed once before step 4 was sent
        assert_eq!(*executor.probes.lock(), 1);
    }

    #[tokio::test]
    async fn test_late_landing_stops_further_submissions() {
        let reader = Arc::new(MockReader::new(snapshot(3000, 1000)));
        let executor = Arc::new(MockExecutor::default());
        executor.outcomes.lock().push_back(TxOutcome::TimedOut);
        *executor.late.lock() = Some(TxOutcome::Success { block: 102, gas_used: 1 });
        let engine = engine(reader, executor.clone(), Arc::new(LadderProvider::new(2)));

        let p = position();
        let outcome = engine
            .run_steps(&p, RebalanceMode::Auction, p.debt_asset, p.collateral_asset, &ladder())
            .await
            .unwrap();

        assert!(matches!(outcome, NegotiationOutcome::Executed { step: 1, take, .. } if take == u(1000)));
        assert_eq!(executor.submitted_takes(), vec![u(1000)]);
    }

    #[tokio::test]
    async fn test_scenario_c_eligibility_lost() {
        let mut reader = MockReader::new(snapshot(3000, 1000));
        reader.eligible_checks = 1;
        let reader = Arc::new(reader);
        let executor = Arc::new(MockExecutor::default());
        let mut provider = LadderProvider::new(1);
        provider.quotes = HashMap::from([(u(1000), u(1))]);
        let provider = Arc::new(provider);
        let engine = engine(reader, executor.clone(), provider.clone());

        let p = position();
        let outcome = engine
            .run_steps(&p, RebalanceMode::Auction, p.debt_asset, p.collateral_asset, &ladder())
            .await
            .unwrap();

        assert_eq!(outcome, NegotiationOutcome::NoLongerEligible { step: 2 });
        assert_eq!(provider.amounts(), vec![u(1000)]);
        assert!(executor.submitted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_zero_delta_short_circuits() {
        let reader = Arc::new(MockReader::new(snapshot(2000, 1000)));
        let executor = Arc::new(MockExecutor::default());
        let provider = Arc::new(LadderProvider::new(2));
        let engine = engine(reader.clone(), executor.clone(), provider.clone());

        let outcome = engine.negotiate(&position(), RebalanceMode::Auction).await.unwrap();

        assert_eq!(outcome, NegotiationOutcome::NothingToTake);
        assert_eq!(*reader.eligibility_calls.lock(), 0);
        assert_eq!(*reader.required_calls.lock(), 0);
        assert_eq!(*reader.conversion_calls.lock(), 0);
        assert!(provider.amounts().is_empty());
        assert!(executor.submitted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_negotiate_over_target_takes_debt() {
        let reader = Arc::new(MockReader::new(snapshot(3000, 1000)));
        let executor = Arc::new(MockExecutor::default());
        let provider = Arc::new(LadderProvider::new(2));
        let engine = engine(reader, executor.clone(), provider.clone());

        let outcome = engine.negotiate(&position(), RebalanceMode::Auction).await.unwrap();

        // 1000 less the 1% safety discount
        assert!(matches!(outcome, NegotiationOutcome::Executed { step: 1, take, .. } if take == u(990)));
        let request = provider.requests.lock()[0];
        assert_eq!(request.from, position().debt_asset);
        assert_eq!(request.to, position().collateral_asset);
    }

    #[tokio::test]
    async fn test_negotiate_under_target_takes_collateral() {
        let reader = Arc::new(MockReader::new(snapshot(1500, 1000)));
        let executor = Arc::new(MockExecutor::default());
        let provider = Arc::new(LadderProvider::new(2));
        let engine = engine(reader.clone(), executor, provider.clone());

        let outcome = engine.negotiate(&position(), RebalanceMode::Auction).await.unwrap();

        // 500 debt units -> 1000 collateral -> 990 after discount
        assert!(matches!(outcome, NegotiationOutcome::Executed { take, .. } if take == u(990)));
        assert_eq!(provider.requests.lock()[0].from, position().collateral_asset);
        assert_eq!(*reader.conversion_calls.lock(), 1);
    }

    #[tokio::test]
    async fn test_stale_simulation_skips_step() {
        let reader = Arc::new(MockReader::new(snapshot(3000, 1000)));
        let executor = Arc::new(MockExecutor::default());
        executor
            .simulations
            .lock()
            .push_back(Err(ExecutorError::StaleState("AuctionNotValid".into())));
        let engine = engine(reader, executor.clone(), Arc::new(LadderProvider::new(2)));

        let p = position();
        let outcome = engine
            .run_steps(&p, RebalanceMode::Auction, p.debt_asset, p.collateral_asset, &ladder())
            .await
            .unwrap();

        assert!(matches!(outcome, NegotiationOutcome::Executed { step: 2, .. }));
        assert_eq!(executor.submitted_takes(), vec![u(800)]);
    }

    #[tokio::test]
    async fn test_fatal_simulation_aborts() {
        let reader = Arc::new(MockReader::new(snapshot(3000, 1000)));
        let executor = Arc::new(MockExecutor::default());
        executor
            .simulations
            .lock()
            .push_back(Err(ExecutorError::Simulation("out of gas".into())));
        let engine = engine(reader, executor.clone(), Arc::new(LadderProvider::new(2)));

        let p = position();
        let result = engine
            .run_steps(&p, RebalanceMode::Auction, p.debt_asset, p.collateral_asset, &ladder())
            .await;

        assert!(matches!(result, Err(RebalanceError::Simulation(_))));
        assert!(executor.submitted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_submission_failure_aborts_and_alerts() {
        let reader = Arc::new(MockReader::new(snapshot(3000, 1000)));
        let executor = Arc::new(MockExecutor::default());
        *executor.submit_failure.lock() = Some("nonce too low".into());
        let provider = Arc::new(LadderProvider::new(2));
        let sink = Arc::new(RecordingSink::default());
        let router = RouteSelector::new(REBALANCER).with_provider(provider.clone());
        let engine = NegotiationEngine::new(
            reader.clone(),
            executor.clone(),
            Arc::new(router),
            Alerter::new(vec![sink.clone() as Arc<dyn AlertSink>]),
            REBALANCER,
        );

        let p = position();
        let result = engine
            .run_steps(&p, RebalanceMode::Auction, p.debt_asset, p.collateral_asset, &ladder())
            .await;

        assert!(matches!(result, Err(RebalanceError::Submission(ref m)) if m.contains("nonce too low")));
        // Nothing after the first step was quoted or checked
        assert_eq!(provider.amounts(), vec![u(1000)]);
        assert_eq!(*reader.required_calls.lock(), 1);
        assert!(executor.submitted.lock().is_empty());

        drain_alerts().await;
        let alerts = sink.alerts.lock();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].title, "Submission failed");
        assert_eq!(alerts[0].level, AlertLevel::Critical);
    }

    #[tokio::test]
    async fn test_receipt_error_moves_to_next_step() {
        let reader = Arc::new(MockReader::new(snapshot(3000, 1000)));
        let executor = Arc::new(MockExecutor::default());
        *executor.await_failures.lock() = 1;
        let sink = Arc::new(RecordingSink::default());
        let router = RouteSelector::new(REBALANCER).with_provider(Arc::new(LadderProvider::new(2)));
        let engine = NegotiationEngine::new(
            reader,
            executor.clone(),
            Arc::new(router),
            Alerter::new(vec![sink.clone() as Arc<dyn AlertSink>]),
            REBALANCER,
        );

        let p = position();
        let outcome = engine
            .run_steps(&p, RebalanceMode::Auction, p.debt_asset, p.collateral_asset, &ladder())
            .await
            .unwrap();

        assert!(matches!(outcome, NegotiationOutcome::Executed { step: 2, take, .. } if take == u(800)));
        assert_eq!(executor.submitted_takes(), vec![u(1000), u(800)]);
        // Step 1's handle stayed unconfirmed and was checked before step 2 was sent
        assert_eq!(*executor.probes.lock(), 1);

        drain_alerts().await;
        assert!(!sink.titles().iter().any(|t| t == "Submission failed"));
    }

    #[tokio::test]
    async fn test_reverts_exhaust_ladder() {
        let reader = Arc::new(MockReader::new(snapshot(3000, 1000)));
        let executor = Arc::new(MockExecutor::default());
        for _ in 0..5 {
            executor
                .outcomes
                .lock()
                .push_back(TxOutcome::Reverted(rebalancer_chain::RevertReason::Other("slippage".into())));
        }
        let engine = engine(reader, executor.clone(), Arc::new(LadderProvider::new(2)));

        let p = position();
        let outcome = engine
            .run_steps(&p, RebalanceMode::Auction, p.debt_asset, p.collateral_asset, &ladder())
            .await
            .unwrap();

        assert_eq!(outcome, NegotiationOutcome::Exhausted { steps: 5 });
        assert_eq!(executor.submitted.lock().len(), 5);
        assert_eq!(*executor.probes.lock(), 0);
    }

    #[tokio::test]
    async fn test_pre_liquidation_encodes_token() {
        let reader = Arc::new(MockReader::new(snapshot(1050, 1000)));
        let executor = Arc::new(MockExecutor::default());
        let engine = engine(reader, executor.clone(), Arc::new(LadderProvider::new(2)));

        let outcome = engine.negotiate(&position(), RebalanceMode::PreLiquidation).await.unwrap();
        assert!(matches!(outcome, NegotiationOutcome::Executed { step: 1, .. }));

        let submitted = executor.submitted.lock();
        let call = IRebalancer::preLiquidationRebalanceCall::abi_decode(&submitted[0].data, true).unwrap();
        assert_eq!(call.leverageToken, position().token);
        // 525 debt units -> 1050 collateral -> 1% discount
        assert_eq!(call.collateralAmount, u(1039));
        assert_eq!(call.swapCalls.len(), 1);
    }
}
