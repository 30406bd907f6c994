//! # strategy::ma_cross
//!
//! Reference signal source: fast/slow SMA crossover on closes.
//!
//! ```text
//! fast crosses above slow on bar i → BUY  @ close[i], SL = close × (1 − stop%)
//! fast crosses below slow on bar i → SELL @ close[i], SL = close × (1 + stop%)
//! ```
//!
//! Regime is left unset; the driver classifies the signal bar.

use crate::config::env_or;
use crate::error::EngineError;
use crate::models::{Bar, Direction, Signal};
use crate::strategy::SignalSource;

pub const SOURCE_TAG: &str = "ma_cross";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaCrossConfig {
    pub fast:     usize,
    pub slow:     usize,
    /// Stop distance from entry, percent.
    pub stop_pct: f64,
}

impl Default for MaCrossConfig {
    fn default() -> Self {
        Self { fast: 10, slow: 30, stop_pct: 1.0 }
    }
}

impl MaCrossConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            fast:     env_or("MA_FAST", d.fast),
            slow:     env_or("MA_SLOW", d.slow),
            stop_pct: env_or("MA_STOP_PCT", d.stop_pct),
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.fast == 0 || self.fast >= self.slow {
            return Err(EngineError::Configuration(format!(
                "MA_FAST ({}) must be positive and below MA_SLOW ({})",
                self.fast, self.slow
            )));
        }
        if !(self.stop_pct > 0.0 && self.stop_pct < 100.0) {
            return Err(EngineError::Configuration(format!(
                "MA_STOP_PCT {} out of range",
                self.stop_pct
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MaCrossSource {
    config: MaCrossConfig,
}

impl MaCrossSource {
    pub fn new(config: MaCrossConfig) -> Self {
        Self { config }
    }

    /// Direction of a cross that completes on bar `i`, if any.
    fn cross_at(&self, bars: &[Bar], i: usize) -> Option<Direction> {
        let MaCrossConfig { fast, slow, .. } = self.config;
        if i < slow {
            return None;
        }
        let prev = sma(&bars[..i], fast) - sma(&bars[..i], slow);
        let curr = sma(&bars[..=i], fast) - sma(&bars[..=i], slow);
        match (prev <= 0.0, curr > 0.0, prev >= 0.0, curr < 0.0) {
            (true, true, _, _) => Some(Direction::Buy),
            (_, _, true, true) => Some(Direction::Sell),
            _ => None,
        }
    }
}

impl SignalSource for MaCrossSource {
    fn name(&self) -> &str {
        SOURCE_TAG
    }

    fn generate_signals<'a>(&'a self, bars: &'a [Bar]) -> Box<dyn Iterator<Item = Signal> + 'a> {
        let stop = self.config.stop_pct / 100.0;
        Box::new((self.config.slow..bars.len()).filter_map(move |i| {
            let direction = self.cross_at(bars, i)?;
            let bar = &bars[i];
            let sl = bar.close * (1.0 - direction.sign() * stop);
            Some(Signal::new(bar.time, direction, bar.close, sl, SOURCE_TAG))
        }))
    }
}

fn sma(window: &[Bar], period: usize) -> f64 {
    window[window.len() - period..].iter().map(|b| b.close).sum::<f64>() / period as f64
}
