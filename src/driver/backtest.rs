//! # driver::backtest
//!
//! **Backtest driver** — deterministic replay of historical bars through the
//! same admission gate and lifecycle manager the live driver uses.
//!
//! ```text
//! for bar in bars (chronological):
//!   ├─ manager.on_bar(bar)                          exits first, now = bar close
//!   └─ for signal flagged on this bar:
//!        classify(bars[..=i]) → gate.admit(now) → manager.on_admitted_signal
//! ```
//!
//! No wall clock, no randomness, in-memory store. Two runs over the same
//! input produce the same ledger, byte for byte.

use serde::Serialize;
use tracing::{debug, info};

use crate::engine::{Admission, ManagerSettings, PositionLifecycleManager, RegimeClassifier, SignalAdmissionGate};
use crate::error::EngineError;
use crate::models::{Bar, PositionGroup, Signal, TradeRecord};
use crate::store::MemoryStore;
use crate::strategy::SignalSource;

// ─── Report ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RejectionBreakdown {
    pub duplicates:     usize,
    pub incomplete_bar: usize,
    pub stale:          usize,
    /// Levels on the wrong side of entry, non-positive prices.
    pub invalid_signal: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BacktestReport {
    pub total_bars:    usize,
    pub total_signals: usize,
    pub total_groups:  usize,
    /// Ledger rows in close order.
    pub records:       Vec<TradeRecord>,
    /// Sum of record profits (price × lots).
    pub total_profit:  f64,
    /// Share of ledger rows with positive profit, percent.
    pub win_rate_pct:  f64,
    /// Largest peak-to-trough fall of cumulative profit.
    pub max_drawdown:  f64,
    pub rejections:    RejectionBreakdown,
    /// Groups still ACTIVE when the data ran out.
    pub open_groups:   Vec<PositionGroup>,
}

// ─── Driver ───────────────────────────────────────────────────────────────────

pub struct BacktestDriver<'a> {
    settings:   ManagerSettings,
    classifier: RegimeClassifier,
    source:     &'a dyn SignalSource,
}

impl<'a> BacktestDriver<'a> {
    pub fn new(settings: ManagerSettings, classifier: RegimeClassifier, source: &'a dyn SignalSource) -> Self {
        Self { settings, classifier, source }
    }

    pub fn run(&self, bars: &[Bar]) -> Result<BacktestReport, EngineError> {
        let period = self.settings.bar_period;
        let mut manager = PositionLifecycleManager::new(MemoryStore::new(), self.settings.clone());
        let mut gate = SignalAdmissionGate::new(
            self.settings.bot_id,
            period,
            self.settings.instrument.tick_size,
        );

        let mut signals: Vec<Signal> = self.source.generate_signals(bars).collect();
        signals.sort_by_key(|s| s.time);
        let total_signals = signals.len();

        let mut rejections = RejectionBreakdown::default();
        let mut total_groups = 0;
        let mut next = 0;

        for (i, bar) in bars.iter().enumerate() {
            manager.on_bar(bar)?;

            let now = bar.close_time(period);
            // signals stamped before this bar closes belong to it (or were
            // never matched to a bar and are simply dropped)
            while next < signals.len() && signals[next].time < now {
                let signal = &signals[next];
                next += 1;
                if signal.time < bar.time {
                    continue;
                }

                let regime = signal.regime.unwrap_or_else(|| self.classifier.classify(&bars[..=i]));
                let signal = signal.clone().with_regime(regime);

                let group_id = match gate.admit(&signal, now) {
                    Admission::Accepted { group_id, .. } => group_id,
                    rejected => {
                        debug!(?rejected, time = %signal.time, "signal not admitted");
                        continue;
                    }
                };
                match manager.on_admitted_signal(&signal, group_id, now) {
                    Ok(_) => total_groups += 1,
                    Err(EngineError::InvalidSignal(msg)) => {
                        debug!(%msg, time = %signal.time, "invalid signal skipped");
                        rejections.invalid_signal += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let stats = gate.stats();
        rejections.duplicates = stats.duplicates;
        rejections.incomplete_bar = stats.incomplete_bar;
        rejections.stale = stats.stale;

        let records = manager.trade_records()?;
        let open_groups = manager.active_groups()?;
        let report = summarize(bars.len(), total_signals, total_groups, records, rejections, open_groups);

        info!(
            bars         = report.total_bars,
            groups       = report.total_groups,
            records      = report.records.len(),
            total_profit = report.total_profit,
            win_rate     = report.win_rate_pct,
            "📊 [BACKTEST] finished"
        );
        Ok(report)
    }
}

fn summarize(
    total_bars: usize,
    total_signals: usize,
    total_groups: usize,
    records: Vec<TradeRecord>,
    rejections: RejectionBreakdown,
    open_groups: Vec<PositionGroup>,
) -> BacktestReport {
    let mut running = 0.0_f64;
    let mut peak = 0.0_f64;
    let mut max_drawdown = 0.0_f64;
    for r in &records {
        running += r.profit;
        if running > peak {
            peak = running;
        }
        max_drawdown = max_drawdown.max(peak - running);
    }

    let wins = records.iter().filter(|r| r.is_win()).count();
    let win_rate_pct = if records.is_empty() {
        0.0
    } else {
        wins as f64 / records.len() as f64 * 100.0
    };

    BacktestReport {
        total_bars,
        total_signals,
        total_groups,
        total_profit: running,
        win_rate_pct,
        max_drawdown,
        rejections,
        open_groups,
        records,
    }
}
