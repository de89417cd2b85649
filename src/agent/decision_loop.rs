//! Per-agent decision cycle
//!
//! Each cycle reads state through the cache, reconciles the ledger with the
//! exchange, asks the provider for actions, validates them, executes closes
//! before opens and hands the full artifact to the audit sinks. Cycles of one
//! agent never overlap.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{DecisionConfig, RiskConfig};
use crate::coordination::StopSignal;
use crate::decision::audit::{ActionOutcome, ExecutionOutcome, Verdict};
use crate::decision::{
    AuditSink, CandidatePool, CycleRecord, CycleStatus, DecisionContext, DecisionOutput,
    DecisionProvider, MarketBundle, MarketDataSource, RiskLimits,
};
use crate::domain::{
    AccountSnapshot, Action, CloseReason, CloseRequest, OpenRequest, OrderUpdate, PositionKey,
    PositionSnapshot, TradeRecord,
};
use crate::error::{Result, TraderError};
use crate::exchange::ExchangeClient;
use crate::persistence::AgentStore;
use crate::portfolio::{CloseFill, LedgerEntry, PerformanceTracker, PositionLedger};
use crate::state::StateCache;

use super::validation::{check_capacity, validate_batch};

/// Timing and risk settings for one agent's loop
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub interval: Duration,
    pub performance_window: usize,
    pub provider_timeout: Duration,
    pub limits: RiskLimits,
}

impl LoopSettings {
    pub fn from_config(
        decision: &DecisionConfig,
        risk: &RiskConfig,
        interval_override: Option<u64>,
    ) -> Self {
        let interval = interval_override
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or_else(|| decision.interval());
        Self {
            interval,
            performance_window: decision.performance_window.max(1),
            provider_timeout: decision.provider_timeout(),
            limits: RiskLimits::from(risk),
        }
    }
}

/// Account-side state owned by one agent
#[derive(Clone)]
pub struct AgentState {
    pub exchange: Arc<dyn ExchangeClient>,
    pub cache: Arc<StateCache>,
    pub ledger: Arc<PositionLedger>,
    pub tracker: Arc<PerformanceTracker>,
}

/// External collaborators of a cycle
#[derive(Clone)]
pub struct Collaborators {
    pub provider: Arc<dyn DecisionProvider>,
    pub market: Arc<dyn MarketDataSource>,
    pub candidates: Arc<dyn CandidatePool>,
    pub audit: Vec<Arc<dyn AuditSink>>,
}

/// Compact view of the last finished cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleSummary {
    pub cycle: u64,
    pub status: CycleStatus,
    pub finished_at: chrono::DateTime<Utc>,
    pub executed: usize,
    pub rejected: usize,
    pub trades: usize,
    pub error: Option<String>,
}

impl CycleSummary {
    fn from_record(record: &CycleRecord) -> Self {
        Self {
            cycle: record.cycle,
            status: record.status,
            finished_at: record.finished_at,
            executed: record.executed(),
            rejected: record.rejected(),
            trades: record.trades.len(),
            error: record.error.clone(),
        }
    }
}

#[derive(Debug)]
pub enum CycleOutcome {
    /// Another cycle was in flight; nothing ran
    Deferred,
    Finished(Box<CycleRecord>),
}

pub struct DecisionLoop {
    agent_id: String,
    settings: LoopSettings,
    state: AgentState,
    collaborators: Collaborators,
    store: Option<AgentStore>,
    orders: Mutex<mpsc::Receiver<OrderUpdate>>,
    /// Latest filled reducing order per key, for external-close attribution
    last_fills: Mutex<HashMap<PositionKey, OrderUpdate>>,
    cycle_lock: Mutex<()>,
    cycles: AtomicU64,
    last: RwLock<Option<CycleSummary>>,
}

impl DecisionLoop {
    pub fn new(
        agent_id: impl Into<String>,
        settings: LoopSettings,
        state: AgentState,
        collaborators: Collaborators,
        orders: mpsc::Receiver<OrderUpdate>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            settings,
            state,
            collaborators,
            store: None,
            orders: Mutex::new(orders),
            last_fills: Mutex::new(HashMap::new()),
            cycle_lock: Mutex::new(()),
            cycles: AtomicU64::new(0),
            last: RwLock::new(None),
        }
    }

    /// Persist trades and ledger after every cycle that may have changed them.
    pub fn with_store(mut self, store: AgentStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    pub fn cycles_run(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    pub async fn last_cycle(&self) -> Option<CycleSummary> {
        self.last.read().await.clone()
    }

    pub fn ledger(&self) -> &Arc<PositionLedger> {
        &self.state.ledger
    }

    pub fn tracker(&self) -> &Arc<PerformanceTracker> {
        &self.state.tracker
    }

    /// Tick until `stop` fires. An in-flight cycle always runs to completion.
    pub async fn run(self: Arc<Self>, stop: StopSignal) {
        info!(
            agent = %self.agent_id,
            interval_secs = self.settings.interval.as_secs(),
            "decision loop started"
        );

        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = stop.triggered() => break,
                _ = ticker.tick() => {}
            }
            if stop.is_triggered() {
                break;
            }

            match self.run_cycle().await {
                CycleOutcome::Deferred => debug!(agent = %self.agent_id, "tick deferred"),
                CycleOutcome::Finished(record) => debug!(
                    agent = %self.agent_id,
                    cycle = record.cycle,
                    status = %record.status,
                    "cycle finished"
                ),
            }
        }

        info!(agent = %self.agent_id, cycles = self.cycles_run(), "decision loop stopped");
    }

    /// Run one cycle now, or defer if one is already running.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            debug!(agent = %self.agent_id, "cycle already in flight");
            return CycleOutcome::Deferred;
        };

        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let started_at = Utc::now();
        let mut record = CycleRecord {
            agent_id: self.agent_id.clone(),
            cycle,
            started_at,
            finished_at: started_at,
            status: CycleStatus::Completed,
            error: None,
            context: None,
            output: None,
            outcomes: Vec::new(),
            trades: Vec::new(),
        };

        self.drain_order_events().await;
        self.execute_cycle(&mut record).await;
        record.finished_at = Utc::now();

        if record.executed() > 0 || !record.trades.is_empty() {
            self.state.cache.invalidate().await;
        }
        if record.status != CycleStatus::Skipped {
            self.persist().await;
        }

        for sink in &self.collaborators.audit {
            if let Err(e) = sink.record(&record).await {
                warn!(agent = %self.agent_id, cycle, error = %e, "audit sink failed");
            }
        }

        *self.last.write().await = Some(CycleSummary::from_record(&record));
        CycleOutcome::Finished(Box::new(record))
    }

    async fn execute_cycle(&self, record: &mut CycleRecord) {
        let cycle = record.cycle;
        let (account, positions) = match self.read_state().await {
            Ok(state) => state,
            Err(e) => {
                warn!(agent = %self.agent_id, cycle, error = %e, "state unavailable, skipping cycle");
                record.status = CycleStatus::Skipped;
                record.error = Some(e.to_string());
                return;
            }
        };

        record.trades = self.reconcile(cycle, &positions).await;

        let window = self.settings.performance_window;
        let performance = self.state.tracker.summary(window).await;
        let recent_trades = self.state.tracker.recent(window).await;
        let candidates = self.candidate_set(&positions).await;
        let market = self.market_bundle(&candidates).await;

        let context = DecisionContext {
            agent_id: self.agent_id.clone(),
            cycle,
            generated_at: Utc::now(),
            account,
            positions: positions.clone(),
            market,
            candidates,
            performance,
            recent_trades,
            limits: self.settings.limits.clone(),
        };

        let equity = context.account.equity();
        let decided = self.decide(&context).await;
        record.context = Some(context);
        let output = match decided {
            Ok(output) => output,
            Err(e) => {
                warn!(agent = %self.agent_id, cycle, error = %e, "provider failed, aborting cycle");
                record.status = CycleStatus::Aborted;
                record.error = Some(e.to_string());
                return;
            }
        };

        let mut held: BTreeSet<PositionKey> = self
            .state
            .ledger
            .entries()
            .await
            .iter()
            .map(LedgerEntry::key)
            .collect();
        held.extend(positions.iter().map(PositionSnapshot::key));

        let verdicts = validate_batch(&output.actions, &held, equity, &self.settings.limits);
        let mut outcomes: Vec<ActionOutcome> = output
            .actions
            .iter()
            .cloned()
            .zip(verdicts)
            .map(|(action, verdict)| {
                if let Verdict::Rejected { reason } = &verdict {
                    warn!(agent = %self.agent_id, cycle, action = %action.kind, instrument = %action.instrument, %reason, "action rejected");
                }
                ActionOutcome {
                    action,
                    verdict,
                    execution: None,
                }
            })
            .collect();

        // Closes first so released margin is available to the opens.
        let mut live = held;
        for outcome in outcomes
            .iter_mut()
            .filter(|o| o.verdict == Verdict::Accepted && o.action.kind.is_close())
        {
            let (execution, trade) = self.execute_close(&outcome.action).await;
            if execution.success {
                if let Some(key) = outcome.action.key() {
                    live.remove(&key);
                }
            }
            outcome.execution = Some(execution);
            record.trades.extend(trade);
        }

        // Validation assumed every close fills; count only the ones that did.
        for outcome in outcomes
            .iter_mut()
            .filter(|o| o.verdict == Verdict::Accepted && o.action.kind.is_open())
        {
            if let Err(e) = check_capacity(live.len(), &self.settings.limits) {
                warn!(agent = %self.agent_id, cycle, instrument = %outcome.action.instrument, reason = %e, "open rejected after failed close");
                outcome.verdict = Verdict::Rejected {
                    reason: e.to_string(),
                };
                continue;
            }
            let execution = self.execute_open(&outcome.action).await;
            if execution.success {
                live.extend(outcome.action.key());
            }
            outcome.execution = Some(execution);
        }

        record.output = Some(output);
        record.outcomes = outcomes;
    }

    async fn read_state(&self) -> Result<(AccountSnapshot, Vec<PositionSnapshot>)> {
        let account = self.state.cache.get_account().await?;
        let positions = self.state.cache.get_positions().await?;
        Ok((account, positions))
    }

    /// Keep only the latest filled reducing order per key.
    async fn drain_order_events(&self) {
        let mut orders = self.orders.lock().await;
        let mut fills = self.last_fills.lock().await;
        while let Ok(update) = orders.try_recv() {
            if !(update.is_filled() && update.is_reducing()) {
                continue;
            }
            if let Some(key) = update.position_key() {
                fills.insert(key, update);
            }
        }
    }

    /// Seed unknown exchange positions and close ledger entries the exchange
    /// no longer holds.
    async fn reconcile(&self, cycle: u64, positions: &[PositionSnapshot]) -> Vec<TradeRecord> {
        let report = self.state.ledger.reconcile(positions).await;

        if !report.seeded.is_empty() {
            if cycle == 1 {
                info!(agent = %self.agent_id, seeded = report.seeded.len(), "ledger seeded from exchange positions");
            } else {
                warn!(agent = %self.agent_id, positions = ?report.seeded, "exchange positions unknown to the ledger, seeded as recovered");
            }
        }

        let mut trades = Vec::with_capacity(report.missing.len());
        for key in report.missing {
            let opened_at = self.state.ledger.get(&key).await.map(|e| e.opened_at);
            let fill = self
                .last_fills
                .lock()
                .await
                .remove(&key)
                .filter(|update| opened_at.map(|t| update.event_time >= t).unwrap_or(true))
                .map(|update| CloseFill {
                    exit_price: update.avg_price,
                    quantity: None,
                    realized_pnl: update.realized_pnl,
                })
                .unwrap_or_default();

            warn!(agent = %self.agent_id, position = %key, exit = ?fill.exit_price, "position closed outside the agent");
            let trade = self.state.ledger.close(&key, fill, CloseReason::External).await;
            self.state.tracker.append(trade.clone()).await;
            trades.push(trade);
        }
        trades
    }

    async fn candidate_set(&self, positions: &[PositionSnapshot]) -> Vec<String> {
        let mut candidates = match self.collaborators.candidates.candidates().await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(agent = %self.agent_id, error = %e, "candidate pool unavailable");
                Vec::new()
            }
        };
        for position in positions {
            if !candidates.contains(&position.instrument) {
                candidates.push(position.instrument.clone());
            }
        }
        candidates
    }

    async fn market_bundle(&self, instruments: &[String]) -> MarketBundle {
        match self.collaborators.market.market_snapshot(instruments).await {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(agent = %self.agent_id, error = %e, "market data unavailable");
                MarketBundle::new()
            }
        }
    }

    async fn decide(&self, context: &DecisionContext) -> Result<DecisionOutput> {
        let limit = self.settings.provider_timeout;
        tokio::time::timeout(limit, self.collaborators.provider.decide(context))
            .await
            .map_err(|_| TraderError::Timeout {
                operation: "decide".to_string(),
                elapsed_ms: limit.as_millis() as u64,
            })?
    }

    async fn execute_close(&self, action: &Action) -> (ExecutionOutcome, Option<TradeRecord>) {
        let Some(key) = action.key() else {
            return (ExecutionOutcome::failed("close action without direction"), None);
        };
        let request = CloseRequest {
            instrument: key.instrument.clone(),
            direction: key.direction,
            quantity: None,
        };

        let report = match self.state.exchange.close_position(&request).await {
            Ok(report) => report,
            Err(e) => {
                warn!(agent = %self.agent_id, position = %key, error = %e, "close failed");
                return (ExecutionOutcome::failed(e.to_string()), None);
            }
        };

        let exit_price = match report.avg_price {
            Some(price) => Some(price),
            None => self.state.exchange.get_price(&key.instrument).await.ok(),
        };
        let fill = CloseFill {
            exit_price,
            quantity: Some(report.filled_quantity),
            realized_pnl: report.realized_pnl,
        };
        let trade = self.state.ledger.close(&key, fill, CloseReason::Decision).await;
        self.state.tracker.append(trade.clone()).await;
        info!(agent = %self.agent_id, position = %key, order_id = %report.order_id, pnl = ?trade.pnl_usd, "position closed");

        let execution = ExecutionOutcome {
            success: true,
            order_id: Some(report.order_id),
            filled_quantity: Some(report.filled_quantity),
            avg_price: exit_price,
            error: None,
        };
        (execution, Some(trade))
    }

    /// `size_usd` is notional: quantity = size_usd / current price.
    async fn execute_open(&self, action: &Action) -> ExecutionOutcome {
        let Some(key) = action.key() else {
            return ExecutionOutcome::failed("open action without direction");
        };

        let price = match self.state.exchange.get_price(&key.instrument).await {
            Ok(price) if price > Decimal::ZERO => price,
            Ok(price) => return ExecutionOutcome::failed(format!("invalid price {price}")),
            Err(e) => return ExecutionOutcome::failed(format!("price unavailable: {e}")),
        };
        let Some(quantity) = action.size_usd.checked_div(price) else {
            return ExecutionOutcome::failed("cannot size order");
        };

        if let Err(e) = self
            .state
            .exchange
            .set_leverage(&key.instrument, action.leverage)
            .await
        {
            warn!(agent = %self.agent_id, position = %key, error = %e, "set leverage failed");
            return ExecutionOutcome::failed(e.to_string());
        }

        let request = OpenRequest {
            instrument: key.instrument.clone(),
            direction: key.direction,
            quantity,
            leverage: action.leverage,
            stop_loss: action.stop_loss,
            take_profit: action.take_profit,
        };
        let report = match self.state.exchange.open_position(&request).await {
            Ok(report) => report,
            Err(e) => {
                warn!(agent = %self.agent_id, position = %key, error = %e, "open failed");
                return ExecutionOutcome::failed(e.to_string());
            }
        };

        let entry_price = report.avg_price.unwrap_or(price);
        let mut execution = ExecutionOutcome {
            success: true,
            order_id: Some(report.order_id.clone()),
            filled_quantity: Some(report.filled_quantity),
            avg_price: Some(entry_price),
            error: None,
        };

        let entry = LedgerEntry::new(
            key.instrument.clone(),
            key.direction,
            report.filled_quantity,
            entry_price,
            action.leverage,
        );
        match self.state.ledger.open(entry).await {
            Ok(()) => {
                info!(agent = %self.agent_id, position = %key, order_id = %report.order_id, qty = %report.filled_quantity, price = %entry_price, "position opened");
            }
            Err(e) => {
                error!(agent = %self.agent_id, position = %key, error = %e, "filled open not recorded in ledger");
                execution.error = Some(e.to_string());
            }
        }
        execution
    }

    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let trades = self.state.tracker.all().await;
        if let Err(e) = store.save_trades(&trades).await {
            error!(agent = %self.agent_id, error = %e, "failed to persist trade history");
        }
        let entries = self.state.ledger.entries().await;
        if let Err(e) = store.save_ledger(&entries).await {
            error!(agent = %self.agent_id, error = %e, "failed to persist ledger");
        }
    }
}

impl std::fmt::Debug for DecisionLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionLoop")
            .field("agent_id", &self.agent_id)
            .field("settings", &self.settings)
            .field("cycles", &self.cycles_run())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::PaperExchange;
    use crate::decision::{MockDecisionProvider, StaticCandidatePool};
    use crate::domain::{Direction, OrderSide};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicUsize;

    struct Harness {
        paper: Arc<PaperExchange>,
        orders: mpsc::Sender<OrderUpdate>,
        agent: Arc<DecisionLoop>,
    }

    fn harness(provider: Arc<dyn DecisionProvider>, max_positions: usize) -> Harness {
        harness_with(provider, max_positions, None)
    }

    fn harness_with(
        provider: Arc<dyn DecisionProvider>,
        max_positions: usize,
        store: Option<AgentStore>,
    ) -> Harness {
        let paper = Arc::new(PaperExchange::new(dec!(1000)));
        paper.set_price("BTCUSDT", dec!(100));
        paper.set_price("ETHUSDT", dec!(50));

        let exchange: Arc<dyn ExchangeClient> = paper.clone();
        let state = AgentState {
            exchange: exchange.clone(),
            cache: Arc::new(StateCache::new(exchange, Duration::ZERO)),
            ledger: Arc::new(PositionLedger::new()),
            tracker: Arc::new(PerformanceTracker::new()),
        };
        let collaborators = Collaborators {
            provider,
            market: paper.clone(),
            candidates: Arc::new(StaticCandidatePool::new(["BTCUSDT", "ETHUSDT"])),
            audit: Vec::new(),
        };
        let settings = LoopSettings {
            interval: Duration::from_secs(60),
            performance_window: 20,
            provider_timeout: Duration::from_secs(5),
            limits: RiskLimits {
                max_open_positions: max_positions,
                default_leverage_cap: 10,
                leverage_caps: HashMap::new(),
                default_notional_cap: dec!(10),
                notional_caps: HashMap::new(),
                require_protection: false,
            },
        };
        let (tx, rx) = mpsc::channel(16);
        let mut agent = DecisionLoop::new("alpha", settings, state, collaborators, rx);
        if let Some(store) = store {
            agent = agent.with_store(store);
        }
        Harness {
            paper,
            orders: tx,
            agent: Arc::new(agent),
        }
    }

    fn replying(outputs: Vec<Vec<Action>>) -> Arc<dyn DecisionProvider> {
        let mut provider = MockDecisionProvider::new();
        let mut seq = mockall::Sequence::new();
        for actions in outputs {
            provider
                .expect_decide()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_| {
                    Ok(DecisionOutput {
                        reasoning: "scripted".to_string(),
                        actions: actions.clone(),
                    })
                });
        }
        Arc::new(provider)
    }

    async fn finished(agent: &DecisionLoop) -> CycleRecord {
        match agent.run_cycle().await {
            CycleOutcome::Finished(record) => *record,
            CycleOutcome::Deferred => panic!("cycle unexpectedly deferred"),
        }
    }

    /// Sleeps before answering and counts calls
    struct SlowProvider {
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DecisionProvider for SlowProvider {
        async fn decide(&self, _context: &DecisionContext) -> Result<DecisionOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(DecisionOutput::default())
        }
    }

    #[tokio::test]
    async fn closes_execute_before_opens() {
        // 500 of 1000 is locked in ETH margin; the BTC open needs 800.
        let h = harness(
            replying(vec![vec![
                Action::open("BTCUSDT", Direction::Long, dec!(4000), 5),
                Action::close("ETHUSDT", Direction::Long),
            ]]),
            5,
        );
        h.paper
            .seed_position("ETHUSDT", Direction::Long, dec!(10), dec!(50), 1);

        let record = finished(&h.agent).await;
        assert_eq!(record.status, CycleStatus::Completed);
        assert_eq!(record.executed(), 2);
        assert_eq!(record.trades.len(), 1);
        assert_eq!(record.trades[0].instrument, "ETHUSDT");
        assert!(record.trades[0].recovered);

        let ledger = h.agent.ledger();
        let btc = ledger
            .get(&PositionKey::new("BTCUSDT", Direction::Long))
            .await
            .unwrap();
        assert_eq!(btc.quantity, dec!(40));
        assert_eq!(btc.leverage, 5);
        assert!(!ledger.contains(&PositionKey::new("ETHUSDT", Direction::Long)).await);
        assert_eq!(h.paper.leverage_for("BTCUSDT"), Some(5));
        assert_eq!(h.agent.tracker().len().await, 1);
    }

    #[tokio::test]
    async fn duplicate_open_leaves_ledger_unchanged() {
        let h = harness(
            replying(vec![
                vec![Action::open("BTCUSDT", Direction::Long, dec!(200), 2)],
                vec![
                    Action::open("BTCUSDT", Direction::Long, dec!(300), 2),
                    Action::open("ETHUSDT", Direction::Short, dec!(100), 2),
                ],
            ]),
            5,
        );

        finished(&h.agent).await;
        let key = PositionKey::new("BTCUSDT", Direction::Long);
        let before = h.agent.ledger().get(&key).await.unwrap();

        let record = finished(&h.agent).await;
        assert!(matches!(record.outcomes[0].verdict, Verdict::Rejected { .. }));
        assert!(record.outcomes[0].execution.is_none());
        assert_eq!(record.outcomes[1].verdict, Verdict::Accepted);
        assert_eq!(h.agent.ledger().get(&key).await.unwrap(), before);
        assert_eq!(h.agent.ledger().len().await, 2);
    }

    #[tokio::test]
    async fn exchange_failure_is_recorded_per_action() {
        let h = harness(
            replying(vec![vec![
                Action::open("ETHUSDT", Direction::Long, dec!(100), 2),
                Action::open("BTCUSDT", Direction::Long, dec!(100), 2),
            ]]),
            5,
        );
        h.paper.reject_orders_for("ETHUSDT", "Market is closed.");

        let record = finished(&h.agent).await;
        let eth = record.outcomes[0].execution.as_ref().unwrap();
        assert!(!eth.success);
        assert!(eth.error.as_deref().unwrap().contains("Market is closed."));
        assert!(record.outcomes[1].execution.as_ref().unwrap().success);
        assert_eq!(h.agent.ledger().len().await, 1);
    }

    #[tokio::test]
    async fn failed_close_does_not_free_a_slot() {
        let h = harness(
            replying(vec![vec![
                Action::close("ETHUSDT", Direction::Long),
                Action::open("BTCUSDT", Direction::Long, dec!(100), 2),
            ]]),
            1,
        );
        h.paper
            .seed_position("ETHUSDT", Direction::Long, dec!(2), dec!(50), 1);
        h.paper.reject_orders_for("ETHUSDT", "Market is closed.");

        let record = finished(&h.agent).await;
        assert!(!record.outcomes[0].execution.as_ref().unwrap().success);
        assert_eq!(
            record.outcomes[1].verdict,
            Verdict::Rejected {
                reason: "open positions would reach 2, max is 1".to_string()
            }
        );
        assert!(record.outcomes[1].execution.is_none());
        assert_eq!(record.executed(), 0);

        assert_eq!(h.paper.get_positions().await.unwrap().len(), 1);
        assert_eq!(h.agent.ledger().len().await, 1);
        assert!(!h.agent.ledger().contains(&PositionKey::new("BTCUSDT", Direction::Long)).await);
    }

    #[tokio::test]
    async fn provider_error_aborts_without_mutation() {
        let mut provider = MockDecisionProvider::new();
        provider
            .expect_decide()
            .times(1)
            .returning(|_| Err(TraderError::InvalidDecision("missing actions".to_string())));
        let h = harness(Arc::new(provider), 5);

        let record = finished(&h.agent).await;
        assert_eq!(record.status, CycleStatus::Aborted);
        assert!(record.error.unwrap().contains("missing actions"));
        assert!(record.output.is_none());
        assert!(record.context.is_some());
        assert!(h.agent.ledger().is_empty().await);
        assert_eq!(h.paper.wallet_balance(), dec!(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_provider_times_out() {
        let provider = Arc::new(SlowProvider {
            delay: Duration::from_secs(30),
            calls: AtomicUsize::new(0),
        });
        let h = harness(provider, 5);

        let record = finished(&h.agent).await;
        assert_eq!(record.status, CycleStatus::Aborted);
        assert!(record.error.unwrap().contains("decide"));
    }

    #[tokio::test]
    async fn unavailable_state_skips_cycle() {
        let mut provider = MockDecisionProvider::new();
        provider.expect_decide().never();
        let h = harness(Arc::new(provider), 5);
        h.paper.set_offline(true);

        let record = finished(&h.agent).await;
        assert_eq!(record.status, CycleStatus::Skipped);
        assert!(record.context.is_none());

        let summary = h.agent.last_cycle().await.unwrap();
        assert_eq!(summary.status, CycleStatus::Skipped);
        assert_eq!(h.agent.cycles_run(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_cycle_is_deferred() {
        let provider = Arc::new(SlowProvider {
            delay: Duration::from_secs(2),
            calls: AtomicUsize::new(0),
        });
        let h = harness(provider.clone(), 5);

        let agent = h.agent.clone();
        let first = tokio::spawn(async move { agent.run_cycle().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(matches!(h.agent.run_cycle().await, CycleOutcome::Deferred));
        assert!(matches!(first.await.unwrap(), CycleOutcome::Finished(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.agent.cycles_run(), 1);
    }

    #[tokio::test]
    async fn external_close_uses_latest_reducing_fill() {
        let h = harness(replying(vec![Vec::new(), Vec::new()]), 5);
        h.paper.set_price("SOLUSDT", dec!(100));
        h.paper
            .seed_position("SOLUSDT", Direction::Long, dec!(2), dec!(100), 10);

        let first = finished(&h.agent).await;
        assert!(first.context.unwrap().candidates.contains(&"SOLUSDT".to_string()));
        let key = PositionKey::new("SOLUSDT", Direction::Long);
        assert!(h.agent.ledger().get(&key).await.unwrap().recovered);

        h.paper.set_price("SOLUSDT", dec!(105));
        let exchange_pnl = h.paper.external_close(&key);
        h.orders
            .send(OrderUpdate {
                order_id: "manual-1".to_string(),
                instrument: "SOLUSDT".to_string(),
                side: OrderSide::Sell,
                direction: Some(Direction::Long),
                status: "FILLED".to_string(),
                quantity: dec!(2),
                filled_quantity: dec!(2),
                avg_price: Some(dec!(105)),
                realized_pnl: exchange_pnl,
                event_time: Utc::now(),
            })
            .await
            .unwrap();

        let second = finished(&h.agent).await;
        assert_eq!(second.trades.len(), 1);
        let trade = &second.trades[0];
        assert_eq!(trade.close_reason, CloseReason::External);
        assert_eq!(trade.exit_price, Some(dec!(105)));
        assert_eq!(trade.pnl_usd, Some(dec!(100)));
        assert!(h.agent.ledger().is_empty().await);
    }

    #[tokio::test]
    async fn fill_older_than_entry_is_not_attributed() {
        let h = harness(replying(vec![Vec::new(), Vec::new()]), 5);
        h.paper
            .seed_position("BTCUSDT", Direction::Short, dec!(1), dec!(100), 3);
        finished(&h.agent).await;

        let key = PositionKey::new("BTCUSDT", Direction::Short);
        h.paper.external_close(&key);
        h.orders
            .send(OrderUpdate {
                order_id: "old".to_string(),
                instrument: "BTCUSDT".to_string(),
                side: OrderSide::Buy,
                direction: Some(Direction::Short),
                status: "FILLED".to_string(),
                quantity: dec!(1),
                filled_quantity: dec!(1),
                avg_price: Some(dec!(90)),
                realized_pnl: Some(dec!(10)),
                event_time: Utc::now() - chrono::Duration::hours(1),
            })
            .await
            .unwrap();

        let record = finished(&h.agent).await;
        assert_eq!(record.trades.len(), 1);
        assert_eq!(record.trades[0].pnl_usd, None);
        assert_eq!(record.trades[0].exit_price, None);
    }

    #[tokio::test]
    async fn store_follows_every_cycle() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AgentStore::new(tmp.path(), "alpha");
        let h = harness_with(
            replying(vec![
                vec![Action::open("BTCUSDT", Direction::Long, dec!(500), 2)],
                vec![Action::close("BTCUSDT", Direction::Long)],
            ]),
            5,
            Some(store.clone()),
        );

        finished(&h.agent).await;
        let ledger = store.load_ledger().await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].quantity, dec!(5));
        assert!(store.load_trades().await.unwrap().is_empty());

        h.paper.set_price("BTCUSDT", dec!(110));
        finished(&h.agent).await;
        assert!(store.load_ledger().await.unwrap().is_empty());
        let trades = store.load_trades().await.unwrap();
        assert_eq!(trades.len(), 1);
        // 500 notional * 10% * 2x
        assert_eq!(trades[0].pnl_usd, Some(dec!(100)));
    }
}
