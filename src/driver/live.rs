//! # driver::live
//!
//! **Live execution driver** — polls the broker on a fixed interval and feeds
//! the same [`PositionLifecycleManager`] the backtest uses.
//!
//! ## Cycle
//! ```text
//! [1] ensure_connected  (bounded retries; failure → latched warning, cycle skipped)
//! [2] open_positions + recent_bars
//! [3] reconcile         broker is authoritative: external closes, SL/TP overrides, orphans;
//!                       groups that lost a ticket catch up on the pending bars first
//! [4] pending bars      manager.on_bar → broker closes, stop moves
//! [5] signals           last completed bar only: classify → admit → risk → create → submit
//! [6] publish           monitor snapshot + CYCLE_COMPLETED frame
//! ```
//!
//! Every broker call is wrapped in a timeout. A timed-out or failed call
//! abandons the cycle; the next one starts from scratch. Only fatal
//! [`EngineError`]s stop the loop.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerPosition, OrderRequest};
use crate::config::AppConfig;
use crate::driver::alerts::AlertLatch;
use crate::driver::reconciler::{BrokerReconciler, ReconciliationConflict, ReconciliationReport};
use crate::engine::{
    Admission, AdmissionStats, CloseEvent, PositionLifecycleManager, RegimeClassifier,
    SignalAdmissionGate,
};
use crate::error::EngineError;
use crate::events::{Notifier, TradeEvent, WsEvent};
use crate::models::{Bar, GroupId, PositionGroup};
use crate::risk::{RiskDecision, RiskManager};
use crate::state::{GroupView, MonitorSnapshot, SharedState};
use crate::store::GroupStore;
use crate::strategy::SignalSource;

/// Alert key for an unreachable broker.
pub const BROKER_ALERT: &str = "broker_connection";
const POSITIONS_ALERT: &str = "broker_positions";
const BARS_ALERT: &str = "broker_bars";

// ─── Settings ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LiveSettings {
    pub bot_id:         u32,
    pub symbol:         String,
    pub bar_period:     chrono::Duration,
    pub tick_size:      f64,
    pub poll_interval:  StdDuration,
    pub broker_timeout: StdDuration,
    pub max_attempts:   u32,
    pub retry_delay:    StdDuration,
    pub base_magic:     u64,
    /// Bars requested per cycle; enough for the classifier and the source.
    pub history_bars:   usize,
}

impl LiveSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            bot_id:         config.bot_id,
            symbol:         config.symbol.clone(),
            bar_period:     config.bar_period,
            tick_size:      config.instrument.tick_size,
            poll_interval:  config.poll_interval,
            broker_timeout: config.broker.timeout,
            max_attempts:   config.broker.max_attempts,
            retry_delay:    config.broker.retry_delay,
            base_magic:     config.broker.base_magic,
            history_bars:   config.regime.long_period.max(config.strategy.slow) * 2,
        }
    }
}

// ─── Outcome ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleSummary {
    pub conflicts:      usize,
    pub bars_applied:   usize,
    pub closes:         usize,
    pub groups_opened:  Vec<GroupId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// The broker could not be reached or read; nothing was changed after
    /// the failing step.
    Skipped(String),
    Completed(CycleSummary),
}

// ─── Driver ───────────────────────────────────────────────────────────────────

pub struct LiveExecutionDriver<S: GroupStore> {
    settings:       LiveSettings,
    manager:        PositionLifecycleManager<S>,
    broker:         Arc<dyn Broker>,
    source:         Box<dyn SignalSource>,
    classifier:     RegimeClassifier,
    gate:           SignalAdmissionGate,
    reconciler:     BrokerReconciler,
    risk:           Arc<RiskManager>,
    notifier:       Arc<dyn Notifier>,
    alerts:         AlertLatch,
    monitor:        Option<SharedState>,
    /// Open time of the newest completed bar already handled.
    last_bar:       Option<DateTime<Utc>>,
    /// Tickets whose latest stop move has not reached the broker.
    unsynced_stops: HashSet<u64>,
    cycle:          u64,
    connected:      bool,
}

impl<S: GroupStore> LiveExecutionDriver<S> {
    pub fn new(
        settings: LiveSettings,
        manager: PositionLifecycleManager<S>,
        broker: Arc<dyn Broker>,
        source: Box<dyn SignalSource>,
        classifier: RegimeClassifier,
        risk: Arc<RiskManager>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, EngineError> {
        let mut gate = SignalAdmissionGate::new(settings.bot_id, settings.bar_period, settings.tick_size);
        manager.seed_gate(&mut gate)?;
        let reconciler = BrokerReconciler::new(settings.bot_id, settings.symbol.clone(), settings.base_magic);

        info!(
            bot_id  = settings.bot_id,
            symbol  = %settings.symbol,
            source  = source.name(),
            seeded  = gate.len(),
            "🤖 [LIVE] driver ready"
        );

        Ok(Self {
            settings,
            manager,
            broker,
            source,
            classifier,
            gate,
            reconciler,
            risk,
            notifier,
            alerts: AlertLatch::new(),
            monitor: None,
            last_bar: None,
            unsynced_stops: HashSet::new(),
            cycle: 0,
            connected: false,
        })
    }

    pub fn with_monitor(mut self, state: SharedState) -> Self {
        self.monitor = Some(state);
        self
    }

    pub fn manager(&self) -> &PositionLifecycleManager<S> {
        &self.manager
    }

    pub fn alerts(&self) -> &AlertLatch {
        &self.alerts
    }

    pub fn admission_stats(&self) -> AdmissionStats {
        self.gate.stats()
    }

    // ─── Loop ─────────────────────────────────────────────────────────────────

    /// Runs cycles until `stop` flips to `true` (or its sender is dropped).
    /// The flag is only looked at between cycles.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> Result<(), EngineError> {
        info!(interval = ?self.settings.poll_interval, "▶️ [LIVE] poll loop started");
        loop {
            if *stop.borrow() {
                break;
            }

            match self.run_cycle(Utc::now()).await {
                Ok(CycleOutcome::Completed(summary)) => debug!(cycle = self.cycle, ?summary, "cycle completed"),
                Ok(CycleOutcome::Skipped(reason)) => debug!(cycle = self.cycle, %reason, "cycle skipped"),
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "💥 [LIVE] fatal error, stopping");
                    self.risk.kill(&e.to_string()).await;
                    self.broadcast(&WsEvent::RiskKilled { reason: e.to_string() });
                    return Err(e);
                }
                Err(e) => warn!(cycle = self.cycle, error = %e, "⚠️ [LIVE] cycle aborted"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(cycles = self.cycle, "⏹️ [LIVE] poll loop stopped");
        Ok(())
    }

    /// One poll cycle at wall-clock `now`.
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<CycleOutcome, EngineError> {
        self.cycle += 1;
        let mut summary = CycleSummary::default();

        // ── 1. Connection ─────────────────────────────────────────────────────
        if let Err(e) = self.ensure_connected().await {
            self.publish(now).await?;
            return Ok(CycleOutcome::Skipped(e.to_string()));
        }

        // ── 2. Broker state ───────────────────────────────────────────────────
        let timeout = self.settings.broker_timeout;
        let fetched = bounded(timeout, "open_positions", self.broker.open_positions(&self.settings.symbol)).await;
        let positions = match self.checked(POSITIONS_ALERT, fetched) {
            Ok(p) => p,
            Err(e) => return self.skip(e, now).await,
        };

        let fetched = bounded(
            timeout,
            "recent_bars",
            self.broker.recent_bars(&self.settings.symbol, self.settings.history_bars),
        )
        .await;
        let bars = match self.checked(BARS_ALERT, fetched) {
            Ok(b) => b,
            Err(e) => return self.skip(e, now).await,
        };
        let completed: Vec<Bar> = bars
            .into_iter()
            .filter(|b| b.is_complete(self.settings.bar_period, now))
            .collect();
        let pending = self.pending_bars(&completed)?;

        // ── 3. Reconcile ──────────────────────────────────────────────────────
        let report = self.reconciler.reconcile(
            &mut self.manager,
            &positions,
            &pending,
            &self.unsynced_stops,
            now,
        )?;
        summary.conflicts = report.conflicts.len();
        summary.closes = self.apply_report(report).await;

        // ── 4. Bars ───────────────────────────────────────────────────────────
        summary.closes += self.apply_bars(&pending).await?;
        summary.bars_applied = pending.len();
        if let Some(last) = completed.last() {
            self.last_bar = Some(last.time);
        }
        self.push_stop_moves(&positions).await?;

        // ── 5. Signals ────────────────────────────────────────────────────────
        summary.groups_opened = self.admit_signals(&completed, now).await?;

        // ── 6. Publish ────────────────────────────────────────────────────────
        self.publish(now).await?;
        Ok(CycleOutcome::Completed(summary))
    }

    // ─── Connection ───────────────────────────────────────────────────────────

    /// Checks the broker link up to `max_attempts` times. The first failure of an
    /// outage is reported; later ones only counted until it clears.
    async fn ensure_connected(&mut self) -> Result<(), EngineError> {
        let mut last_err = None;
        for attempt in 1..=self.settings.max_attempts {
            match self.check_link().await {
                Ok(()) => {
                    self.connected = true;
                    if self.alerts.clear(BROKER_ALERT) {
                        self.broadcast(&WsEvent::BrokerRestored);
                    }
                    return Ok(());
                }
                Err(e) => {
                    debug!(attempt, error = %e, "connection check failed");
                    last_err = Some(e);
                    if attempt < self.settings.max_attempts {
                        tokio::time::sleep(self.settings.retry_delay).await;
                    }
                }
            }
        }

        self.connected = false;
        let err = last_err.unwrap_or_else(|| EngineError::Connection("no connection attempt made".into()));
        if self.alerts.raise(BROKER_ALERT, &format!("broker unreachable: {err}")) {
            self.broadcast(&WsEvent::BrokerDown { reason: err.to_string() });
        }
        Err(err)
    }

    async fn check_link(&self) -> Result<(), EngineError> {
        bounded(self.settings.broker_timeout, "ensure_connected", self.broker.ensure_connected()).await
    }

    /// Latches `key` on failure, clears it on success.
    fn checked<T>(&mut self, key: &str, result: Result<T, EngineError>) -> Result<T, EngineError> {
        match result {
            Ok(v) => {
                self.alerts.clear(key);
                Ok(v)
            }
            Err(e) => {
                self.alerts.raise(key, &format!("{key}: {e}"));
                Err(e)
            }
        }
    }

    async fn skip(&mut self, err: EngineError, now: DateTime<Utc>) -> Result<CycleOutcome, EngineError> {
        if err.is_fatal() {
            return Err(err);
        }
        self.publish(now).await?;
        Ok(CycleOutcome::Skipped(err.to_string()))
    }

    // ─── Reconciliation side effects ──────────────────────────────────────────

    /// Returns the number of closes booked during reconciliation.
    async fn apply_report(&mut self, report: ReconciliationReport) -> usize {
        for conflict in &report.conflicts {
            let message = match conflict {
                ReconciliationConflict::LevelsOverridden(o) => format!(
                    "group {} pos {}: broker SL/TP {}/{} adopted",
                    o.group_id, o.position_num, o.new_sl, o.new_tp
                ),
                ReconciliationConflict::Orphan { ticket, comment, .. } => {
                    format!("orphan position {ticket} ({comment}) closed")
                }
                other => format!("{other:?}"),
            };
            self.broadcast(&WsEvent::Reconciliation { message });
        }

        for event in &report.close_events {
            self.notifier.notify(&TradeEvent::closed(event));
        }
        for event in &report.broker_closes {
            self.dispatch_close(event).await;
        }

        for orphan in &report.orphans {
            self.close_at_broker(orphan.ticket, orphan.volume).await;
        }
        report.close_events.len() + report.broker_closes.len()
    }

    // ─── Bars ─────────────────────────────────────────────────────────────────

    /// Completed bars newer than the last handled one. After a restart only
    /// bars closing after the oldest active group was created matter; the
    /// manager itself refuses to apply a bar twice.
    fn pending_bars(&self, completed: &[Bar]) -> Result<Vec<Bar>, EngineError> {
        let period = self.settings.bar_period;
        let earliest = self.manager.active_groups()?.iter().map(|g| g.created_at).min();
        Ok(completed
            .iter()
            .filter(|bar| match self.last_bar {
                Some(last) => bar.time > last,
                None => earliest.is_some_and(|created| bar.close_time(period) > created),
            })
            .cloned()
            .collect())
    }

    /// Feeds `pending` to the manager and returns the number of closes.
    async fn apply_bars(&mut self, pending: &[Bar]) -> Result<usize, EngineError> {
        let mut closes = 0;
        for bar in pending {
            for event in self.manager.on_bar(bar)? {
                closes += 1;
                self.dispatch_close(&event).await;
            }
        }
        Ok(closes)
    }

    async fn dispatch_close(&mut self, event: &CloseEvent) {
        if let Some(ticket) = event.ticket {
            self.close_at_broker(ticket, event.volume).await;
        }
        self.notifier.notify(&TradeEvent::closed(event));
    }

    /// A failed close is not retried here: the position stays at the broker
    /// with no open local owner and the next reconciliation closes it as an
    /// orphan.
    async fn close_at_broker(&self, ticket: u64, volume: f64) {
        let result = bounded(
            self.settings.broker_timeout,
            "close_position",
            self.broker.close_position(ticket, volume),
        )
        .await;
        match result {
            Ok(()) => info!(ticket, volume, "📤 [LIVE] broker position closed"),
            Err(e) => warn!(ticket, error = %e, "⚠️ [LIVE] broker close failed, left to reconciliation"),
        }
    }

    /// Sends stops the manager moved (breakeven, trailing) to the broker. A
    /// ticket whose push fails stays in `unsynced_stops` until one succeeds.
    async fn push_stop_moves(&mut self, broker_positions: &[BrokerPosition]) -> Result<(), EngineError> {
        let by_ticket: HashMap<u64, &BrokerPosition> =
            broker_positions.iter().map(|p| (p.ticket, p)).collect();
        let half_tick = self.settings.tick_size / 2.0;

        for group in self.manager.active_groups()? {
            for p in group.open_positions() {
                let Some(ticket) = p.ticket else { continue };
                let Some(bp) = by_ticket.get(&ticket) else { continue };
                if (p.sl_price - bp.sl).abs() < half_tick {
                    self.unsynced_stops.remove(&ticket);
                    continue;
                }

                let result = bounded(
                    self.settings.broker_timeout,
                    "modify_position",
                    self.broker.modify_position(ticket, p.sl_price, p.tp_price),
                )
                .await;
                match result {
                    Ok(()) => {
                        self.unsynced_stops.remove(&ticket);
                        info!(ticket, from = bp.sl, to = p.sl_price, "🛡️ [LIVE] stop moved at broker");
                    }
                    Err(e) => {
                        self.unsynced_stops.insert(ticket);
                        warn!(ticket, error = %e, "⚠️ [LIVE] stop move failed, retried next cycle");
                    }
                }
            }
        }

        let open: HashSet<u64> = by_ticket.keys().copied().collect();
        self.unsynced_stops.retain(|t| open.contains(t));
        Ok(())
    }

    // ─── Signals ──────────────────────────────────────────────────────────────

    /// Admits signals on the newest completed bar and opens their groups.
    async fn admit_signals(&mut self, completed: &[Bar], now: DateTime<Utc>) -> Result<Vec<GroupId>, EngineError> {
        let Some(last) = completed.last() else {
            return Ok(Vec::new());
        };

        let signals: Vec<_> = self
            .source
            .generate_signals(completed)
            .filter(|s| s.time == last.time)
            .collect();

        let mut opened = Vec::new();
        for signal in signals {
            let regime = signal.regime.unwrap_or_else(|| self.classifier.classify(completed));
            let signal = signal.with_regime(regime);

            let group_id = match self.gate.admit(&signal, now) {
                Admission::Accepted { group_id, .. } => group_id,
                rejected => {
                    debug!(?rejected, time = %signal.time, "signal not admitted");
                    continue;
                }
            };

            // validated before the risk check, a bad signal never reaches it
            match self.manager.plan_group(&signal, group_id, now) {
                Ok(_) => {}
                Err(EngineError::InvalidSignal(msg)) => {
                    warn!(group_id = %group_id, %msg, "⚠️ [LIVE] invalid signal dropped");
                    continue;
                }
                Err(e) => return Err(e),
            }

            if let RiskDecision::Blocked(reason) = self.risk.pre_trade_check(now).await {
                warn!(group_id = %group_id, %reason, "🛑 [LIVE] signal blocked by risk");
                continue;
            }

            let group = self.manager.on_admitted_signal(&signal, group_id, now)?;
            self.notifier.notify(&TradeEvent::opened(&group));

            if self.submit_group(&group, now).await? {
                opened.push(group.group_id);
            }
        }
        Ok(opened)
    }

    /// Sends one order per rung. Returns `false` when nothing filled and the
    /// group was discarded.
    async fn submit_group(&mut self, group: &PositionGroup, now: DateTime<Utc>) -> Result<bool, EngineError> {
        let mut unfilled = Vec::new();
        for position in &group.positions {
            let num = position.position_num;
            let Some(order) = OrderRequest::for_position(group, num, self.settings.base_magic) else {
                continue;
            };
            match self.submit_with_retry(&order).await {
                Some(ticket) => self.manager.attach_ticket(group.group_id, num, ticket)?,
                None => unfilled.push(num),
            }
        }

        if unfilled.len() == group.positions.len() {
            self.manager.discard_unfilled(group.group_id)?;
            self.risk.record_failure(now).await;
            return Ok(false);
        }

        for num in unfilled {
            if let Some(event) = self.manager.finalize_unfilled(group.group_id, num, now)? {
                self.notifier.notify(&TradeEvent::closed(&event));
            }
        }
        self.risk.record_group_opened(now).await;
        Ok(true)
    }

    /// Bounded retry; the connection is re-validated before every attempt.
    async fn submit_with_retry(&self, order: &OrderRequest) -> Option<u64> {
        let attempts = self.settings.max_attempts;
        for attempt in 1..=attempts {
            let result = match self.check_link().await {
                Ok(()) => bounded(self.settings.broker_timeout, "submit_order", self.broker.submit_order(order)).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(ticket) => {
                    info!(ticket, comment = %order.comment, attempt, "📨 [LIVE] order filled");
                    return Some(ticket);
                }
                Err(e) => {
                    warn!(comment = %order.comment, attempt, attempts, error = %e, "⚠️ [LIVE] order attempt failed");
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.retry_delay).await;
                    }
                }
            }
        }
        error!(comment = %order.comment, "❌ [LIVE] order gave up after {attempts} attempts");
        None
    }

    // ─── Monitor ──────────────────────────────────────────────────────────────

    fn broadcast(&self, event: &WsEvent) {
        if let Some(state) = &self.monitor {
            state.broadcast(event);
        }
    }

    async fn publish(&self, now: DateTime<Utc>) -> Result<(), EngineError> {
        let Some(state) = &self.monitor else {
            return Ok(());
        };
        let snapshot = MonitorSnapshot {
            cycle:            self.cycle,
            updated_at:       Some(now),
            broker_connected: self.connected,
            groups:           self.manager.all_groups()?.into_iter().map(GroupView::from).collect(),
            records:          self.manager.trade_records()?,
            admission:        self.gate.stats(),
        };
        state.publish(snapshot).await;
        Ok(())
    }
}

/// Runs one broker call under `timeout`. Expiry is a connection error.
async fn bounded<T, F>(timeout: StdDuration, what: &str, call: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Connection(format!("{what} timed out after {timeout:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::paper::PaperBroker;
    use crate::engine::ManagerSettings;
    use crate::events::TracingNotifier;
    use crate::models::{CloseReason, Direction, Regime, Signal};
    use crate::risk::RiskConfig;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};

    /// Replays a fixed signal list, yielding those whose bar is in the window.
    struct FixedSignals(Vec<Signal>);

    impl SignalSource for FixedSignals {
        fn name(&self) -> &str {
            "fixed"
        }

        fn generate_signals<'a>(&'a self, bars: &'a [Bar]) -> Box<dyn Iterator<Item = Signal> + 'a> {
            Box::new(
                self.0
                    .iter()
                    .filter(move |s| bars.iter().any(|b| b.time == s.time))
                    .cloned(),
            )
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn flat_bar(hour: i64) -> Bar {
        Bar { time: t0() + Duration::hours(hour), open: 2000.0, high: 2001.0, low: 1999.0, close: 2000.0, volume: 0.0 }
    }

    /// Five minutes after bar `hour` closed.
    fn after_bar(hour: i64) -> DateTime<Utc> {
        t0() + Duration::hours(hour + 1) + Duration::minutes(5)
    }

    fn settings() -> LiveSettings {
        LiveSettings {
            bot_id:         1,
            symbol:         "XAUUSD".into(),
            bar_period:     Duration::hours(1),
            tick_size:      0.01,
            poll_interval:  StdDuration::from_millis(10),
            broker_timeout: StdDuration::from_secs(1),
            max_attempts:   3,
            retry_delay:    StdDuration::ZERO,
            base_magic:     420_000,
            history_bars:   100,
        }
    }

    fn buy_on_bar_9() -> Signal {
        Signal::new(flat_bar(9).time, Direction::Buy, 2000.0, 1980.0, "fixed").with_regime(Regime::Range)
    }

    fn bar(hour: i64, high: f64, low: f64, close: f64) -> Bar {
        Bar { time: t0() + Duration::hours(hour), open: 2000.0, high, low, close, volume: 0.0 }
    }

    /// Paper broker with ten flat hourly bars and a BUY signal on bar 9.
    fn driver() -> (LiveExecutionDriver<MemoryStore>, Arc<PaperBroker>) {
        driver_with(buy_on_bar_9())
    }

    fn driver_with(signal: Signal) -> (LiveExecutionDriver<MemoryStore>, Arc<PaperBroker>) {
        let paper = Arc::new(PaperBroker::with_bars((0..10).map(flat_bar).collect()));
        let manager = PositionLifecycleManager::new(MemoryStore::new(), ManagerSettings::default());
        let driver = LiveExecutionDriver::new(
            settings(),
            manager,
            paper.clone(),
            Box::new(FixedSignals(vec![signal])),
            RegimeClassifier::default(),
            Arc::new(RiskManager::new(RiskConfig::default())),
            Arc::new(TracingNotifier),
        )
        .unwrap();
        (driver, paper)
    }

    fn opened(outcome: &CycleOutcome) -> Vec<GroupId> {
        match outcome {
            CycleOutcome::Completed(s) => s.groups_opened.clone(),
            CycleOutcome::Skipped(reason) => panic!("cycle skipped: {reason}"),
        }
    }

    #[tokio::test]
    async fn test_signal_opens_three_tagged_orders_once() {
        let (mut d, paper) = driver();

        let first = d.run_cycle(after_bar(9)).await.unwrap();
        assert_eq!(opened(&first).len(), 1);
        let orders = paper.submitted();
        assert_eq!(orders.len(), 3);
        assert_eq!(orders[0].comment, "LB1-00-1");
        assert_eq!(orders[0].magic, 421_001);

        let group = &d.manager().active_groups().unwrap()[0];
        assert!(group.positions.iter().all(|p| p.ticket.is_some()));

        // same bar five minutes later: duplicate, no new orders
        let second = d.run_cycle(after_bar(9) + Duration::minutes(5)).await.unwrap();
        assert!(opened(&second).is_empty());
        assert_eq!(paper.submitted().len(), 3);
        assert_eq!(d.admission_stats().duplicates, 1);
        assert_eq!(d.risk.status_at(after_bar(9)).await.groups_today, 1);
    }

    #[tokio::test]
    async fn test_invalid_signal_takes_no_risk_slot() {
        // BUY with the stop above entry
        let (mut d, paper) = driver_with(
            Signal::new(flat_bar(9).time, Direction::Buy, 2000.0, 2010.0, "fixed").with_regime(Regime::Range),
        );

        let outcome = d.run_cycle(after_bar(9)).await.unwrap();
        assert!(opened(&outcome).is_empty());
        assert!(paper.submitted().is_empty());
        assert!(d.manager().all_groups().unwrap().is_empty());
        assert_eq!(d.risk.status_at(after_bar(9)).await.groups_today, 0);
    }

    #[tokio::test]
    async fn test_broker_tp_override_adopted_without_record() {
        let (mut d, paper) = driver();
        d.run_cycle(after_bar(9)).await.unwrap();

        let ticket = d.manager().active_groups().unwrap()[0].positions[0].ticket.unwrap();
        paper.set_levels(ticket, 1980.0, 2030.0);
        d.run_cycle(after_bar(9) + Duration::minutes(10)).await.unwrap();

        let group = &d.manager().active_groups().unwrap()[0];
        assert_eq!(group.positions[0].tp_price, 2030.0);
        assert!(d.manager().trade_records().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_warned_once_then_cleared() {
        let (mut d, paper) = driver();
        paper.set_connected(false);

        for i in 0..3 {
            let outcome = d.run_cycle(after_bar(9) + Duration::minutes(i)).await.unwrap();
            assert!(matches!(outcome, CycleOutcome::Skipped(_)));
        }
        assert!(d.alerts().is_raised(BROKER_ALERT));
        assert_eq!(d.alerts().suppressed(BROKER_ALERT), 2);
        assert!(paper.submitted().is_empty());

        paper.set_connected(true);
        d.run_cycle(after_bar(9) + Duration::minutes(5)).await.unwrap();
        assert!(!d.alerts().is_raised(BROKER_ALERT));
        assert_eq!(paper.submitted().len(), 3);
    }

    #[tokio::test]
    async fn test_rejected_order_retried() {
        let (mut d, paper) = driver();
        paper.reject_next_orders(2);

        d.run_cycle(after_bar(9)).await.unwrap();
        // rung 1 needed three attempts, rungs 2 and 3 one each
        assert_eq!(paper.submitted().len(), 5);
        assert_eq!(paper.positions().len(), 3);
        // one check for the cycle, one before every attempt
        assert_eq!(paper.connection_checks(), 6);
    }

    #[tokio::test]
    async fn test_connection_revalidated_before_each_attempt() {
        let (d, paper) = driver();
        let order = OrderRequest {
            symbol:  "XAUUSD".into(),
            action:  Direction::Buy,
            volume:  0.05,
            price:   2000.0,
            sl:      1980.0,
            tp:      2020.0,
            comment: "LB1-00-1".into(),
            magic:   421_001,
        };
        paper.fail_next_connection_checks(1);

        assert!(d.submit_with_retry(&order).await.is_some());
        // the first attempt never reached submit_order
        assert_eq!(paper.submitted().len(), 1);
        assert_eq!(paper.connection_checks(), 2);
    }

    #[tokio::test]
    async fn test_nothing_filled_discards_group() {
        let (mut d, paper) = driver();
        paper.reject_next_orders(100);

        let outcome = d.run_cycle(after_bar(9)).await.unwrap();
        assert!(opened(&outcome).is_empty());
        assert!(d.manager().all_groups().unwrap().is_empty());
        assert_eq!(d.risk.status().await.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_external_close_and_orphan() {
        let (mut d, paper) = driver();
        d.run_cycle(after_bar(9)).await.unwrap();

        let group = d.manager().active_groups().unwrap()[0].clone();
        let dropped = paper.drop_position(group.positions[1].ticket.unwrap()).unwrap();

        let mut orphan = dropped.clone();
        orphan.ticket = 9_999;
        paper.inject_position(orphan);

        d.run_cycle(after_bar(9) + Duration::minutes(10)).await.unwrap();

        let records = d.manager().trade_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].position_num, 2);
        assert_eq!(records[0].status, CloseReason::External);
        assert_eq!(paper.closed_tickets(), vec![9_999]);
    }

    #[tokio::test]
    async fn test_tp1_closes_at_broker_and_trails_stops() {
        let (mut d, paper) = driver();
        d.run_cycle(after_bar(9)).await.unwrap();
        let group = d.manager().active_groups().unwrap()[0].clone();
        let tickets: Vec<u64> = group.positions.iter().filter_map(|p| p.ticket).collect();

        paper.push_bar(Bar { time: t0() + Duration::hours(10), open: 2000.0, high: 2020.0, low: 1999.0, close: 2015.0, volume: 0.0 });
        let outcome = d.run_cycle(after_bar(10)).await.unwrap();
        assert!(matches!(&outcome, CycleOutcome::Completed(s) if s.closes == 1 && s.bars_applied == 1));

        assert_eq!(paper.closed_tickets(), vec![tickets[0]]);
        let moves = paper.modifications();
        assert_eq!(moves.len(), 2);
        assert!(moves.iter().all(|(_, sl, _)| (sl - 2007.88).abs() < 1e-6));

        // next cycle: broker already carries the trailed stop, nothing to push
        d.run_cycle(after_bar(10) + Duration::minutes(5)).await.unwrap();
        assert_eq!(paper.modifications().len(), 2);
    }

    #[tokio::test]
    async fn test_broker_tp_fill_arms_trailing() {
        let (mut d, paper) = driver();
        d.run_cycle(after_bar(9)).await.unwrap();
        let group = d.manager().active_groups().unwrap()[0].clone();

        // the broker filled TP1 on its own before the bar reached us
        paper.push_bar(bar(10, 2020.0, 1999.0, 2015.0));
        paper.drop_position(group.positions[0].ticket.unwrap()).unwrap();
        d.run_cycle(after_bar(10)).await.unwrap();

        let records = d.manager().trade_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, CloseReason::Tp1);
        assert!((records[0].close_price - 2020.0).abs() < 1e-6);

        let group = d.manager().group(group.group_id).unwrap();
        assert!(group.tp1_hit);
        assert!((group.positions[1].sl_price - 2007.88).abs() < 1e-6);
        assert!(paper.closed_tickets().is_empty());
        assert_eq!(paper.modifications().len(), 2);
    }

    #[tokio::test]
    async fn test_backtest_and_live_ledgers_agree() {
        let bars: Vec<Bar> = (0..10)
            .map(flat_bar)
            .chain([bar(10, 2020.0, 1999.0, 2015.0), bar(11, 2010.0, 2005.0, 2006.0)])
            .collect();
        let source = FixedSignals(vec![buy_on_bar_9()]);
        let report = crate::driver::BacktestDriver::new(ManagerSettings::default(), RegimeClassifier::default(), &source)
            .run(&bars)
            .unwrap();

        // live: every exit is filled broker-side before the driver sees the bar
        let (mut d, paper) = driver();
        d.run_cycle(after_bar(9)).await.unwrap();
        let tickets: Vec<u64> = d.manager().active_groups().unwrap()[0]
            .positions
            .iter()
            .filter_map(|p| p.ticket)
            .collect();

        paper.push_bar(bars[10]);
        paper.drop_position(tickets[0]);
        d.run_cycle(after_bar(10)).await.unwrap();

        paper.push_bar(bars[11]);
        paper.drop_position(tickets[1]);
        paper.drop_position(tickets[2]);
        d.run_cycle(after_bar(11)).await.unwrap();

        let ledger = |records: &[crate::models::TradeRecord]| -> Vec<(u8, CloseReason, f64)> {
            records.iter().map(|r| (r.position_num, r.status, r.close_price)).collect()
        };
        let live = d.manager().trade_records().unwrap();
        assert_eq!(live.len(), 3);
        assert_eq!(ledger(&live), ledger(&report.records));
        assert_eq!(live[1].status, CloseReason::TrailingSl);
        assert!(d.manager().active_groups().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_stop_push_keeps_local_stop() {
        let (mut d, paper) = driver();
        d.run_cycle(after_bar(9)).await.unwrap();
        let group_id = d.manager().active_groups().unwrap()[0].group_id;

        paper.push_bar(bar(10, 2020.0, 1999.0, 2015.0));
        paper.reject_next_modifications(2);
        d.run_cycle(after_bar(10)).await.unwrap();
        assert!(paper.modifications().is_empty());
        assert_eq!(d.unsynced_stops.len(), 2);

        // broker still shows 1980; that must not pull the trailed stop back
        d.run_cycle(after_bar(10) + Duration::minutes(5)).await.unwrap();
        let group = d.manager().group(group_id).unwrap();
        assert!(group.open_positions().all(|p| (p.sl_price - 2007.88).abs() < 1e-6));
        assert_eq!(paper.modifications().len(), 2);
        assert!(d.unsynced_stops.is_empty());
        assert_eq!(d.manager().trade_records().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_signal() {
        let (d, _paper) = driver();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(d.run(rx));
        tokio::time::sleep(StdDuration::from_millis(30)).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
