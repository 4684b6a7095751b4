// =============================================================================
// Account Loop — one cooperative task per (account, broker) pair
// =============================================================================
//
// Phase machine:
//
//   Idle -> Connecting -> Ready -> Scanning -> Managing -> Sleeping -> ...
//                            `-> Degraded (repeated transient failures)
//                            `-> Halted   (EMERGENCY_STOP / fatal error)
//
// Tick order, every cycle:
//   1. Re-check the kill switch and engine state. Anything other than
//      LIVE_ACTIVE / DRY_RUN runs exits only (managing-only mode).
//   2. Reconcile broker positions into the tracker (adopt-if-new).
//   3. Evaluate and execute exits for every open position.
//   4. If entries are allowed: rotate to the next market batch, run the
//      strategy, and place risk-gated buys.
//   5. Publish master fills to the copy-trade bus.
//   6. Sleep until the next tick.
//
// All broker I/O within the account is serialized (nonce and rate-limit
// discipline); parallelism exists only across accounts. Cancellation is
// cooperative: the shutdown watch channel is checked at every suspension
// point.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::BrokerAdapter;
use crate::cleanup::{run_forced_cleanup, CleanupBudget};
use crate::config::CapConfig;
use crate::copy_trade::{CopyEvent, CopyTradeBus};
use crate::error::{BrokerError, ErrorClass};
use crate::exit::{ExitEngine, ExitIntent, ExitReason};
use crate::indicators;
use crate::journal::{JournalRecord, TradeJournal};
use crate::kill_switch::KillSwitch;
use crate::position::{PositionTracker, TrackedPosition};
use crate::risk::RiskEngine;
use crate::state_machine::{EngineMode, StateMachine};
use crate::strategy::{analyze, classify_regime, CandleSeries};
use crate::types::{AccountRole, MarketOrderRequest, Side, Timeframe};

/// Consecutive transient tick failures before the loop degrades.
const DEGRADE_AFTER_FAILURES: u32 = 3;
/// Candle depths per timeframe for one strategy evaluation.
const BASE_CANDLES: usize = 120;
const MID_CANDLES: usize = 60;
const HIGH_CANDLES: usize = 40;

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

/// Loop phase, exported for the liveness snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoopPhase {
    Idle,
    Connecting,
    Ready,
    Scanning,
    Managing,
    Sleeping,
    Degraded,
    Halted,
}

impl std::fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Ready => write!(f, "READY"),
            Self::Scanning => write!(f, "SCANNING"),
            Self::Managing => write!(f, "MANAGING"),
            Self::Sleeping => write!(f, "SLEEPING"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Halted => write!(f, "HALTED"),
        }
    }
}

/// Shared liveness handle: the loop writes, the API reads.
pub struct LoopStatus {
    phase: RwLock<LoopPhase>,
    last_tick_at: RwLock<Option<std::time::Instant>>,
    cycles: AtomicU64,
}

impl LoopStatus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            phase: RwLock::new(LoopPhase::Idle),
            last_tick_at: RwLock::new(None),
            cycles: AtomicU64::new(0),
        })
    }

    fn set_phase(&self, phase: LoopPhase) {
        *self.phase.write() = phase;
    }

    fn mark_tick(&self) {
        *self.last_tick_at.write() = Some(std::time::Instant::now());
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn phase(&self) -> LoopPhase {
        *self.phase.read()
    }

    pub fn last_tick_age_secs(&self) -> Option<u64> {
        self.last_tick_at.read().map(|t| t.elapsed().as_secs())
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Loop configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub cycle_interval: Duration,
    pub market_batch_size: usize,
    pub cap: CapConfig,
    pub dry_run: bool,
}

// ---------------------------------------------------------------------------
// The loop
// ---------------------------------------------------------------------------

pub struct AccountLoop {
    account_id: String,
    role: AccountRole,
    adapter: Arc<dyn BrokerAdapter>,
    tracker: Arc<PositionTracker>,
    risk: Arc<RiskEngine>,
    exit: ExitEngine,
    bus: Option<Arc<CopyTradeBus>>,
    journal: Arc<TradeJournal>,
    state: Arc<StateMachine>,
    kill: Arc<KillSwitch>,
    config: LoopConfig,
    status: Arc<LoopStatus>,
    equity_usd: Arc<RwLock<f64>>,
    scan_offset: usize,
    consecutive_failures: u32,
    trades_since_cleanup: u64,
}

impl AccountLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        role: AccountRole,
        adapter: Arc<dyn BrokerAdapter>,
        tracker: Arc<PositionTracker>,
        risk: Arc<RiskEngine>,
        exit: ExitEngine,
        bus: Option<Arc<CopyTradeBus>>,
        journal: Arc<TradeJournal>,
        state: Arc<StateMachine>,
        kill: Arc<KillSwitch>,
        config: LoopConfig,
        status: Arc<LoopStatus>,
        equity_usd: Arc<RwLock<f64>>,
    ) -> Self {
        Self {
            account_id: adapter.account_id().to_string(),
            role,
            adapter,
            tracker,
            risk,
            exit,
            bus,
            journal,
            state,
            kill,
            config,
            status,
            equity_usd,
            scan_offset: 0,
            consecutive_failures: 0,
            trades_since_cleanup: 0,
        }
    }

    /// Run until shutdown, EMERGENCY_STOP, or a fatal error.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(account = %self.account_id, role = %self.role, "account loop started");

        // Re-verify the login before the first cycle; the supervisor
        // connected once already, but that may have been a while ago.
        self.status.set_phase(LoopPhase::Connecting);
        if let Err(e) = self.adapter.connect().await {
            if e.class() == ErrorClass::Fatal {
                error!(account = %self.account_id, error = %e, "credentials invalid; loop halted");
                self.journal_error(None, &e);
                self.status.set_phase(LoopPhase::Halted);
                return;
            }
            warn!(account = %self.account_id, error = %e, "connect re-verification failed; continuing");
        }
        self.status.set_phase(LoopPhase::Ready);

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.tick().await {
                Ok(()) => {
                    self.consecutive_failures = 0;
                }
                Err(e) => match e.class() {
                    ErrorClass::Transient => {
                        self.consecutive_failures += 1;
                        warn!(
                            account = %self.account_id,
                            failures = self.consecutive_failures,
                            error = %e,
                            "tick failed with transient error"
                        );
                        if self.consecutive_failures >= DEGRADE_AFTER_FAILURES {
                            self.status.set_phase(LoopPhase::Degraded);
                        }
                    }
                    ErrorClass::Business => {
                        // Already journaled at the call site; next cycle.
                        debug!(account = %self.account_id, error = %e, "tick hit business error");
                    }
                    ErrorClass::Logic => {
                        error!(account = %self.account_id, error = %e, "LOGIC error; engaging emergency stop");
                        self.journal_error(None, &e);
                        self.kill.engage(&format!("logic error on {}: {e}", self.account_id));
                        let _ = self.state.emergency_stop(&e.to_string());
                        self.status.set_phase(LoopPhase::Halted);
                        break;
                    }
                    ErrorClass::Fatal => {
                        error!(account = %self.account_id, error = %e, "FATAL error; halting this account's loop");
                        self.journal_error(None, &e);
                        self.status.set_phase(LoopPhase::Halted);
                        break;
                    }
                },
            }

            if self.status.phase() == LoopPhase::Halted {
                break;
            }

            // Degraded loops sleep longer before retrying.
            let sleep_for = if self.status.phase() == LoopPhase::Degraded {
                self.config.cycle_interval * 2
            } else {
                self.status.set_phase(LoopPhase::Sleeping);
                self.config.cycle_interval
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {
                    if self.status.phase() == LoopPhase::Degraded {
                        self.status.set_phase(LoopPhase::Ready);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        info!(account = %self.account_id, "account loop stopped");
    }

    /// One full scan/manage cycle.
    pub async fn tick(&mut self) -> Result<(), BrokerError> {
        self.status.mark_tick();

        // ── 1. Gates ─────────────────────────────────────────────────────
        if self.kill.is_engaged() {
            warn!(account = %self.account_id, "kill switch engaged; halting loop");
            let _ = self.state.emergency_stop("kill switch engaged");
            self.status.set_phase(LoopPhase::Halted);
            return Ok(());
        }
        let mode = self.state.mode();
        if mode == EngineMode::EmergencyStop {
            self.status.set_phase(LoopPhase::Halted);
            return Ok(());
        }
        let entries_allowed = matches!(mode, EngineMode::LiveActive | EngineMode::DryRun);

        // ── 2. Reconcile broker positions (adopt-if-new) ─────────────────
        self.reconcile().await?;

        // ── 3. Exits for every open position ─────────────────────────────
        self.status.set_phase(LoopPhase::Managing);
        self.manage_positions().await?;

        // ── 4. Entries ───────────────────────────────────────────────────
        if entries_allowed {
            self.status.set_phase(LoopPhase::Scanning);
            self.scan_and_enter().await?;
        } else {
            debug!(account = %self.account_id, mode = %mode, "managing-only mode; entries skipped");
        }

        // ── 5. Trade-count cleanup trigger ───────────────────────────────
        if let Some(after_n) = self.config.cap.cleanup_after_n_trades {
            if self.trades_since_cleanup >= after_n {
                self.trades_since_cleanup = 0;
                let _ = run_forced_cleanup(
                    self.adapter.as_ref(),
                    &self.tracker,
                    &self.config.cap,
                    CleanupBudget::MidCycle,
                    &self.journal,
                )
                .await?;
            }
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    async fn reconcile(&self) -> Result<(), BrokerError> {
        let broker_positions = self.adapter.get_positions().await?;
        if broker_positions.is_empty() {
            return Ok(());
        }

        let mut prices: HashMap<String, f64> = HashMap::new();
        for raw in &broker_positions {
            if self.tracker.get(&raw.symbol).is_some() {
                continue; // Known position; no price needed for adoption.
            }
            if let Ok(price) = self.adapter.get_current_price(&raw.symbol).await {
                prices.insert(raw.symbol.clone(), price);
            }
        }

        let adopted = self.tracker.adopt_existing(&broker_positions, &prices);
        if adopted > 0 {
            info!(account = %self.account_id, adopted, "broker positions adopted during reconcile");
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Exits
    // -------------------------------------------------------------------------

    async fn manage_positions(&mut self) -> Result<(), BrokerError> {
        let mut priced: Vec<(TrackedPosition, f64)> = Vec::new();

        for pos in self.tracker.open_positions() {
            let price = match self.adapter.get_current_price(&pos.symbol).await {
                Ok(p) => p,
                Err(e) if e.class() == ErrorClass::Business => {
                    debug!(symbol = %pos.symbol, error = %e, "no price; skipping symbol this cycle");
                    continue;
                }
                Err(e) => return Err(e),
            };

            self.tracker.observe_price(&pos.symbol, price);

            // ATR for the trailing distance, from cached base candles.
            let atr_frac = self
                .adapter
                .get_candles(&pos.symbol, Timeframe::M1, 50)
                .await
                .ok()
                .and_then(|candles| indicators::atr(&candles, 14))
                .map(|atr| atr / price);

            if let Some(level) = self.exit.trailing_candidate(&pos, price, atr_frac) {
                self.tracker.ratchet_trailing_stop(&pos.symbol, level);
            }

            // Re-read: trailing stop may have just ratcheted.
            let Some(pos) = self.tracker.get(&pos.symbol) else { continue };
            if let Some(intent) = self.exit.evaluate(&pos, price, Utc::now()) {
                self.execute_exit(&pos, &intent, price).await?;
            }

            if let Some(pos) = self.tracker.get(&pos.symbol) {
                priced.push((pos, price));
            }
        }

        // Over-cap forced drain, bounded per cycle.
        if self.tracker.open_count() > self.config.cap.max_concurrent_positions {
            let intents = self
                .exit
                .forced_drain(&priced, self.config.cap.max_concurrent_positions);
            for intent in intents {
                let Some(pos) = self.tracker.get(&intent.symbol) else { continue };
                let price = priced
                    .iter()
                    .find(|(p, _)| p.symbol == intent.symbol)
                    .map(|(_, price)| *price)
                    .unwrap_or(0.0);
                self.execute_exit(&pos, &intent, price).await?;
            }
        }

        Ok(())
    }

    async fn execute_exit(
        &mut self,
        pos: &TrackedPosition,
        intent: &ExitIntent,
        price: f64,
    ) -> Result<(), BrokerError> {
        let reason = intent.reason.to_string();
        info!(
            account = %self.account_id,
            symbol = %pos.symbol,
            fraction = intent.fraction,
            reason = %reason,
            "exit intent"
        );

        let fill_price = if self.config.dry_run {
            price
        } else {
            let request = MarketOrderRequest {
                client_id: format!("apex-exit-{}-{}", self.account_id, Uuid::new_v4()),
                symbol: pos.symbol.clone(),
                side: match pos.side {
                    Side::Long => Side::Short,
                    Side::Short => Side::Long,
                },
                qty: Some(pos.qty * intent.fraction),
                notional_usd: None,
            };
            match self.adapter.place_market(&request).await {
                Ok(order) => order.avg_fill_price().unwrap_or(price),
                Err(e) => {
                    let failures = self.tracker.mark_sell_failure(&pos.symbol);
                    self.journal_error(Some(&pos.symbol), &e);
                    warn!(
                        symbol = %pos.symbol,
                        failures,
                        error = %e,
                        "exit order failed"
                    );
                    // Logic/Fatal bubbles; everything else waits a cycle.
                    if matches!(e.class(), ErrorClass::Logic | ErrorClass::Fatal) {
                        return Err(e);
                    }
                    return Ok(());
                }
            }
        };

        if let Some(exit) =
            self.tracker
                .record_exit(&pos.symbol, fill_price, intent.fraction, self.adapter.fee_rate())
        {
            if let ExitReason::ProfitTier(index) = intent.reason {
                self.tracker.note_tier_taken(&pos.symbol, index);
            }
            self.tracker.clear_sell_failures(&pos.symbol);
            if exit.closed {
                self.risk.record_outcome(exit.pnl_usd);
                self.trades_since_cleanup += 1;
            }
            self.journal.record(JournalRecord::exit(
                &self.account_id,
                &self.adapter.kind().to_string(),
                &pos.symbol,
                exit.qty,
                fill_price,
                exit.pnl_usd,
                exit.pnl_pct,
                &reason,
            ));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Entries
    // -------------------------------------------------------------------------

    async fn scan_and_enter(&mut self) -> Result<(), BrokerError> {
        let products = self.adapter.get_products().await?;
        if products.is_empty() {
            return Ok(());
        }

        let balance = self.adapter.get_balance("USD").await?;
        let equity = balance.total;
        *self.equity_usd.write() = equity;

        let batch = self.next_batch(&products);
        debug!(
            account = %self.account_id,
            batch = batch.len(),
            universe = products.len(),
            equity,
            "scanning market batch"
        );

        for symbol in batch {
            if self.kill.is_engaged() {
                break;
            }
            if self.tracker.get(&symbol).is_some() {
                continue;
            }
            if self.tracker.open_count() >= self.config.cap.max_concurrent_positions {
                break;
            }

            let Some(signal) = self.evaluate_symbol(&symbol).await else {
                continue;
            };
            if signal.side == Side::Short && !self.adapter.kind().supports_short() {
                debug!(symbol, "short signal on a spot-only venue; skipped");
                continue;
            }

            let plan = match self.risk.evaluate(
                equity,
                self.tracker.open_count(),
                &signal,
                self.adapter.fee_rate(),
                self.adapter.min_notional(),
            ) {
                Ok(plan) => plan,
                Err(rejection) => {
                    debug!(symbol, rejection = %rejection, "entry rejected by risk gate");
                    continue;
                }
            };

            if let Err(e) = self.execute_entry(&signal, plan.size_usd, equity).await {
                self.journal_error(Some(&signal.symbol), &e);
                if matches!(e.class(), ErrorClass::Logic | ErrorClass::Fatal) {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn next_batch(&mut self, products: &[String]) -> Vec<String> {
        let n = products.len();
        let take = self.config.market_batch_size.min(n);
        let batch: Vec<String> = (0..take)
            .map(|i| products[(self.scan_offset + i) % n].clone())
            .collect();
        self.scan_offset = (self.scan_offset + take) % n;
        batch
    }

    async fn evaluate_symbol(&self, symbol: &str) -> Option<crate::types::Signal> {
        let base_tf = Timeframe::M1;
        let base = self
            .adapter
            .get_candles(symbol, base_tf, BASE_CANDLES)
            .await
            .ok()?;
        let reading = classify_regime(&base)?;

        let mid = self
            .adapter
            .get_candles(symbol, base_tf.times_five(), MID_CANDLES)
            .await
            .unwrap_or_default();
        let high = self
            .adapter
            .get_candles(symbol, base_tf.times_fifteen(), HIGH_CANDLES)
            .await
            .unwrap_or_default();

        let series = CandleSeries {
            base_tf,
            base,
            mid,
            high,
        };
        analyze(symbol, &series, reading)
    }

    async fn execute_entry(
        &mut self,
        signal: &crate::types::Signal,
        size_usd: f64,
        equity_at_fill: f64,
    ) -> Result<(), BrokerError> {
        let client_id = format!("apex-{}-{}", self.account_id, Uuid::new_v4());

        let (fill_price, qty, master_order_id) = if self.config.dry_run {
            let price = self.adapter.get_current_price(&signal.symbol).await?;
            (price, size_usd / price, client_id.clone())
        } else {
            let request = MarketOrderRequest {
                client_id,
                symbol: signal.symbol.clone(),
                side: signal.side,
                qty: None,
                notional_usd: Some(size_usd),
            };
            let order = self.adapter.place_market(&request).await?;
            let price = order
                .avg_fill_price()
                .unwrap_or(size_usd / order.qty.max(f64::EPSILON));
            let order_id = if order.broker_order_id.is_empty() {
                order.client_id.clone()
            } else {
                order.broker_order_id.clone()
            };
            (price, order.qty, order_id)
        };

        self.tracker
            .track_entry(&signal.symbol, signal.side, fill_price, qty);
        self.journal.record(JournalRecord::entry(
            &self.account_id,
            &self.adapter.kind().to_string(),
            &signal.symbol,
            signal.side,
            qty,
            fill_price,
        ));
        info!(
            account = %self.account_id,
            symbol = %signal.symbol,
            side = %signal.side,
            size_usd,
            score = signal.score,
            reason = %signal.reason,
            "entry filled"
        );

        // Master fills fan out to followers with equity captured now.
        if self.role == AccountRole::Master && !self.config.dry_run {
            if let Some(bus) = &self.bus {
                bus.publish(CopyEvent {
                    master_order_id,
                    broker: self.adapter.kind(),
                    symbol: signal.symbol.clone(),
                    side: signal.side,
                    size_usd,
                    master_equity_at_fill: equity_at_fill,
                    ts: Utc::now(),
                });
            }
        }
        Ok(())
    }

    fn journal_error(&self, symbol: Option<&str>, error: &BrokerError) {
        self.journal.record(JournalRecord::error(
            &self.account_id,
            &self.adapter.kind().to_string(),
            symbol,
            &error.class().to_string(),
            &error.to_string(),
        ));
    }
}

impl std::fmt::Debug for AccountLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountLoop")
            .field("account_id", &self.account_id)
            .field("role", &self.role)
            .field("phase", &self.status.phase())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerKind, IdempotencyMap};
    use crate::exit::ExitConfig;
    use crate::risk::RiskConfig;
    use crate::types::{
        AccountIdentity, Balance, Candle, Fill, Order, OrderState, RawPosition,
    };
    use async_trait::async_trait;

    /// Scripted broker for loop tests: canned candles, prices, and
    /// positions; records every order it is asked to place.
    struct MockBroker {
        account_id: String,
        price: f64,
        candles: Vec<Candle>,
        positions: Vec<RawPosition>,
        products: Vec<String>,
        placed: parking_lot::Mutex<Vec<MarketOrderRequest>>,
        orders: IdempotencyMap,
    }

    impl MockBroker {
        fn new(price: f64, candles: Vec<Candle>) -> Self {
            Self {
                account_id: "mock_master".into(),
                price,
                candles,
                positions: Vec::new(),
                products: vec!["TEST-USD".into()],
                placed: parking_lot::Mutex::new(Vec::new()),
                orders: IdempotencyMap::in_memory(),
            }
        }
    }

    #[async_trait]
    impl BrokerAdapter for MockBroker {
        fn kind(&self) -> BrokerKind {
            BrokerKind::Binance
        }

        fn account_id(&self) -> &str {
            &self.account_id
        }

        async fn connect(&self) -> Result<AccountIdentity, BrokerError> {
            Ok(AccountIdentity {
                account_id: self.account_id.clone(),
                label: "mock".into(),
            })
        }

        async fn get_balance(&self, _quote: &str) -> Result<Balance, BrokerError> {
            Ok(Balance {
                available: 1_000.0,
                total: 1_000.0,
            })
        }

        async fn get_positions(&self) -> Result<Vec<RawPosition>, BrokerError> {
            Ok(self.positions.clone())
        }

        async fn get_candles(
            &self,
            _symbol: &str,
            _tf: Timeframe,
            n: usize,
        ) -> Result<Vec<Candle>, BrokerError> {
            let len = self.candles.len();
            Ok(self.candles[len.saturating_sub(n)..].to_vec())
        }

        async fn get_current_price(&self, _symbol: &str) -> Result<f64, BrokerError> {
            Ok(self.price)
        }

        async fn get_products(&self) -> Result<Vec<String>, BrokerError> {
            Ok(self.products.clone())
        }

        async fn place_market(&self, request: &MarketOrderRequest) -> Result<Order, BrokerError> {
            if let Some(existing) = self.orders.get(&request.client_id) {
                return Ok(existing);
            }
            self.placed.lock().push(request.clone());
            let qty = request
                .qty
                .unwrap_or_else(|| request.notional_usd.unwrap_or(0.0) / self.price);
            let order = Order {
                client_id: request.client_id.clone(),
                broker_order_id: format!("mock-{}", self.placed.lock().len()),
                symbol: request.symbol.clone(),
                side: request.side,
                qty,
                notional_usd: qty * self.price,
                state: OrderState::Filled,
                fills: vec![Fill {
                    price: self.price,
                    qty,
                    fee_usd: 0.0,
                    ts: Utc::now(),
                }],
                fees_usd: 0.0,
            };
            self.orders.insert(order.clone());
            Ok(order)
        }

        async fn cancel(&self, _order_ref: &str) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    fn trending_up(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 * (1.0 + 0.01 * i as f64);
                Candle::new(
                    i as i64 * 60_000,
                    base * 0.999,
                    base * 1.002,
                    base * 0.997,
                    base,
                    1_000.0 + 10.0 * i as f64,
                )
            })
            .collect()
    }

    fn build_loop(
        dir: &std::path::Path,
        adapter: Arc<MockBroker>,
        state: Arc<StateMachine>,
        kill: Arc<KillSwitch>,
        dry_run: bool,
    ) -> AccountLoop {
        let tracker = Arc::new(PositionTracker::new(adapter.account_id()));
        AccountLoop::new(
            AccountRole::Master,
            adapter.clone(),
            tracker,
            Arc::new(RiskEngine::new(RiskConfig::default())),
            ExitEngine::new(BrokerKind::Binance, ExitConfig::default()),
            None,
            Arc::new(TradeJournal::open(dir).unwrap()),
            state,
            kill,
            LoopConfig {
                cycle_interval: Duration::from_millis(50),
                market_batch_size: 100,
                cap: CapConfig::default(),
                dry_run,
            },
            LoopStatus::new(),
            Arc::new(RwLock::new(0.0)),
        )
    }

    #[tokio::test]
    async fn managing_only_mode_places_no_entries() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(StateMachine::load(dir.path()).unwrap());
        let kill = Arc::new(KillSwitch::new(dir.path()));

        // A strong uptrend that would absolutely generate a signal.
        let adapter = Arc::new(MockBroker::new(219.0, trending_up(120)));
        let mut account_loop = build_loop(dir.path(), adapter.clone(), state, kill, true);

        // Engine is OFF (cold boot): managing-only, so nothing is placed
        // and nothing is tracked.
        account_loop.tick().await.unwrap();
        assert!(adapter.placed.lock().is_empty());
        assert_eq!(account_loop.tracker.open_count(), 0);
    }

    #[tokio::test]
    async fn dry_run_entry_is_simulated_without_orders() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(StateMachine::load(dir.path()).unwrap());
        state.start_dry_run("test").unwrap();
        let kill = Arc::new(KillSwitch::new(dir.path()));

        let adapter = Arc::new(MockBroker::new(219.0, trending_up(120)));
        let mut account_loop = build_loop(dir.path(), adapter.clone(), state, kill, true);

        account_loop.tick().await.unwrap();

        // The signal fired and the tracker holds a simulated position, but
        // no order reached the (mock) venue.
        assert_eq!(account_loop.tracker.open_count(), 1);
        assert!(adapter.placed.lock().is_empty());
        let pos = account_loop.tracker.get("TEST-USD").unwrap();
        assert_eq!(pos.side, Side::Long);
    }

    #[tokio::test]
    async fn underwater_position_is_stopped_out_through_the_broker() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(StateMachine::load(dir.path()).unwrap());
        let kill = Arc::new(KillSwitch::new(dir.path()));

        // Flat candles so no new signal interferes; exits run even in
        // managing-only mode and reach the (mock) venue when not dry-run.
        let flat: Vec<Candle> = (0..120)
            .map(|i| Candle::new(i as i64 * 60_000, 100.0, 100.5, 99.5, 100.0, 1_000.0))
            .collect();
        let adapter = Arc::new(MockBroker::new(100.0, flat));
        let mut account_loop = build_loop(dir.path(), adapter.clone(), state, kill, false);

        // Entry at 103 with the price at 100: -2.9%, through the -1.5% stop.
        account_loop
            .tracker
            .track_entry("TEST-USD", Side::Long, 103.0, 1.0);

        account_loop.tick().await.unwrap();

        assert_eq!(account_loop.tracker.open_count(), 0);
        let placed = adapter.placed.lock();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].side, Side::Short);
        assert_eq!(placed[0].symbol, "TEST-USD");
    }

    #[tokio::test]
    async fn kill_switch_halts_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(StateMachine::load(dir.path()).unwrap());
        let kill = Arc::new(KillSwitch::new(dir.path()));
        kill.engage("test");

        let adapter = Arc::new(MockBroker::new(100.0, trending_up(120)));
        let mut account_loop = build_loop(dir.path(), adapter.clone(), state.clone(), kill, false);

        account_loop.tick().await.unwrap();
        assert_eq!(account_loop.status.phase(), LoopPhase::Halted);
        assert_eq!(state.mode(), EngineMode::EmergencyStop);
        assert!(adapter.placed.lock().is_empty());
    }

    #[tokio::test]
    async fn broker_positions_are_adopted_on_reconcile() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(StateMachine::load(dir.path()).unwrap());
        let kill = Arc::new(KillSwitch::new(dir.path()));

        let flat: Vec<Candle> = (0..120)
            .map(|i| Candle::new(i as i64 * 60_000, 100.0, 100.5, 99.5, 100.0, 1_000.0))
            .collect();
        let mut adapter = MockBroker::new(100.0, flat);
        // The broker knows the true entry, below the current price, so the
        // adopted position is in profit and no exit rule fires.
        adapter.positions = vec![RawPosition {
            symbol: "FOUND-USD".into(),
            qty: 2.0,
            entry_price: Some(99.0),
        }];
        let adapter = Arc::new(adapter);
        let mut account_loop = build_loop(dir.path(), adapter.clone(), state, kill, true);

        account_loop.tick().await.unwrap();

        let pos = account_loop.tracker.get("FOUND-USD").unwrap();
        assert!(!pos.adopted);
        assert!((pos.entry_price - 99.0).abs() < 1e-9);
        assert_eq!(account_loop.tracker.open_count(), 1);
    }

    #[test]
    fn batch_rotation_cycles_through_universe() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(StateMachine::load(dir.path()).unwrap());
        let kill = Arc::new(KillSwitch::new(dir.path()));
        let adapter = Arc::new(MockBroker::new(100.0, Vec::new()));
        let mut account_loop = build_loop(dir.path(), adapter, state, kill, true);
        account_loop.config.market_batch_size = 2;

        let products: Vec<String> = (0..5).map(|i| format!("P{i}-USD")).collect();
        assert_eq!(account_loop.next_batch(&products), vec!["P0-USD", "P1-USD"]);
        assert_eq!(account_loop.next_batch(&products), vec!["P2-USD", "P3-USD"]);
        assert_eq!(account_loop.next_batch(&products), vec!["P4-USD", "P0-USD"]);
    }
}
