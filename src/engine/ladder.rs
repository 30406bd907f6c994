//! # engine::ladder
//!
//! **Exit ladder** — the regime → exit-parameters table.
//!
//! ```text
//!   entry ──┬── TP1 (distance₁, fraction₁)  → partial close, arm trailing
//!           ├── TP2 (distance₂, fraction₂)  → partial close
//!           └── TP3 (distance₃, fraction₃)  → final close
//!   + trailing distance (after TP1), breakeven buffer, timeout horizon
//! ```
//!
//! All distances are **percent of entry price**. The table is validated once
//! when it is loaded; the lifecycle manager trusts it afterwards.

use std::path::Path;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::config::InstrumentSpec;
use crate::error::EngineError;
use crate::models::{Direction, Regime};

const FRACTION_TOLERANCE: f64 = 1e-9;

// ─── Rung ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rung {
    /// Distance from entry, percent (1.0 = 1%).
    pub distance_pct: f64,
    /// Share of the original size closed at this rung.
    pub fraction: f64,
}

// ─── ExitLadder ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExitLadder {
    pub rungs: [Rung; 3],
    /// Trailing distance from the best price seen, percent.
    pub trailing_pct: f64,
    /// Hard horizon after which whatever is left is closed.
    pub timeout_hours: f64,
    /// Stop placed this far beyond entry once TP1 fires, percent.
    #[serde(default = "default_breakeven_buffer")]
    pub breakeven_buffer_pct: f64,
}

fn default_breakeven_buffer() -> f64 {
    0.05
}

impl ExitLadder {
    pub fn range_default() -> Self {
        Self {
            rungs: [
                Rung { distance_pct: 1.0,  fraction: 0.5 },
                Rung { distance_pct: 1.75, fraction: 0.3 },
                Rung { distance_pct: 2.5,  fraction: 0.2 },
            ],
            trailing_pct:         0.6,
            timeout_hours:        24.0,
            breakeven_buffer_pct: default_breakeven_buffer(),
        }
    }

    pub fn trend_default() -> Self {
        Self {
            rungs: [
                Rung { distance_pct: 1.5, fraction: 0.4 },
                Rung { distance_pct: 3.0, fraction: 0.3 },
                Rung { distance_pct: 4.5, fraction: 0.3 },
            ],
            trailing_pct:         1.0,
            timeout_hours:        72.0,
            breakeven_buffer_pct: default_breakeven_buffer(),
        }
    }

    /// Checks every structural invariant of the ladder.
    pub fn validate(&self, name: &str) -> Result<(), EngineError> {
        let bad = |msg: String| Err(EngineError::Configuration(format!("{name} ladder: {msg}")));

        let sum: f64 = self.rungs.iter().map(|r| r.fraction).sum();
        if (sum - 1.0).abs() > FRACTION_TOLERANCE {
            return bad(format!("fractions sum to {sum}, expected 1.0"));
        }

        for (i, rung) in self.rungs.iter().enumerate() {
            if !(rung.fraction > 0.0 && rung.fraction.is_finite()) {
                return bad(format!("rung {} fraction must be positive", i + 1));
            }
            if !(rung.distance_pct > 0.0 && rung.distance_pct.is_finite()) {
                return bad(format!("rung {} distance must be positive", i + 1));
            }
        }

        if !self.rungs.windows(2).all(|w| w[0].distance_pct < w[1].distance_pct) {
            return bad("distances must be strictly increasing (tp1 < tp2 < tp3)".into());
        }
        if !(self.trailing_pct > 0.0 && self.trailing_pct < 100.0) {
            return bad(format!("trailing_pct {} out of range", self.trailing_pct));
        }
        if !(self.timeout_hours > 0.0 && self.timeout_hours.is_finite()) {
            return bad(format!("timeout_hours {} must be positive", self.timeout_hours));
        }
        if !(self.breakeven_buffer_pct >= 0.0 && self.breakeven_buffer_pct < self.rungs[0].distance_pct) {
            return bad("breakeven buffer must be non-negative and inside tp1".into());
        }
        Ok(())
    }

    /// Take-profit price of rung `index` (0-based).
    #[inline]
    pub fn tp_price(&self, entry: f64, direction: Direction, index: usize) -> f64 {
        entry * (1.0 + direction.sign() * self.rungs[index].distance_pct / 100.0)
    }

    /// Stop that replaces the original stop once TP1 has fired.
    #[inline]
    pub fn breakeven_stop(&self, entry: f64, direction: Direction) -> f64 {
        entry * (1.0 + direction.sign() * self.breakeven_buffer_pct / 100.0)
    }

    /// Trailing stop behind the best price seen (max for BUY, min for SELL).
    #[inline]
    pub fn trailing_stop(&self, extreme: f64, direction: Direction) -> f64 {
        extreme * (1.0 - direction.sign() * self.trailing_pct / 100.0)
    }

    pub fn timeout(&self) -> Duration {
        Duration::seconds((self.timeout_hours * 3600.0).round() as i64)
    }

    /// Splits the instrument's lot across the rungs. Rungs 1 and 2 are
    /// floored to the volume step and rung 3 takes the remainder, so the
    /// total is exactly the lot. Every rung must get at least one step.
    pub fn split_volume(&self, inst: &InstrumentSpec) -> Result<[f64; 3], EngineError> {
        let mut volumes = [0.0; 3];
        let mut allotted = 0.0;
        for i in 0..2 {
            volumes[i] = inst.floor_volume(inst.lot_size * self.rungs[i].fraction);
            allotted += volumes[i];
        }
        volumes[2] = ((inst.lot_size - allotted) / inst.volume_step).round() * inst.volume_step;

        if volumes.iter().any(|v| *v < inst.volume_step - FRACTION_TOLERANCE) {
            return Err(EngineError::Configuration(format!(
                "LOT_SIZE {} too small for ladder fractions at step {}: {volumes:?}",
                inst.lot_size, inst.volume_step
            )));
        }
        Ok(volumes)
    }
}

// ─── ExitLadderConfig ─────────────────────────────────────────────────────────

/// One ladder per regime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExitLadderConfig {
    pub trend: ExitLadder,
    pub range: ExitLadder,
}

impl Default for ExitLadderConfig {
    fn default() -> Self {
        Self {
            trend: ExitLadder::trend_default(),
            range: ExitLadder::range_default(),
        }
    }
}

impl ExitLadderConfig {
    pub fn for_regime(&self, regime: Regime) -> &ExitLadder {
        match regime {
            Regime::Trend => &self.trend,
            Regime::Range => &self.range,
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        self.trend.validate("TREND")?;
        self.range.validate("RANGE")
    }

    /// Checks that both ladders can split the instrument's lot.
    pub fn validate_sizing(&self, inst: &InstrumentSpec) -> Result<(), EngineError> {
        self.trend.split_volume(inst)?;
        self.range.split_volume(inst)?;
        Ok(())
    }

    /// Parses and validates a TOML ladder table.
    ///
    /// ```toml
    /// [range]
    /// trailing_pct = 0.6
    /// timeout_hours = 24
    /// rungs = [
    ///   { distance_pct = 1.0,  fraction = 0.5 },
    ///   { distance_pct = 1.75, fraction = 0.3 },
    ///   { distance_pct = 2.5,  fraction = 0.2 },
    /// ]
    /// ```
    pub fn from_toml_str(raw: &str) -> Result<Self, EngineError> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| EngineError::Configuration(format!("ladder TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        ExitLadderConfig::default().validate().unwrap();
    }

    #[test]
    fn test_fractions_must_sum_to_one() {
        let mut ladder = ExitLadder::range_default();
        ladder.rungs[2].fraction = 0.25;
        let err = ladder.validate("RANGE").unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
        assert!(err.to_string().contains("fractions"));
    }

    #[test]
    fn test_distances_must_increase() {
        let mut ladder = ExitLadder::trend_default();
        ladder.rungs[1].distance_pct = 1.5;
        assert!(ladder.validate("TREND").is_err());
    }

    #[test]
    fn test_negative_distance_rejected() {
        let mut ladder = ExitLadder::range_default();
        ladder.rungs[0].distance_pct = -1.0;
        assert!(ladder.validate("RANGE").is_err());
    }

    #[test]
    fn test_range_prices_for_buy_and_sell() {
        let ladder = ExitLadder::range_default();
        assert!((ladder.tp_price(2000.0, Direction::Buy, 0) - 2020.0).abs() < 1e-9);
        assert!((ladder.tp_price(2000.0, Direction::Buy, 1) - 2035.0).abs() < 1e-9);
        assert!((ladder.tp_price(2000.0, Direction::Sell, 2) - 1950.0).abs() < 1e-9);
        assert!((ladder.trailing_stop(2020.0, Direction::Buy) - 2007.88).abs() < 1e-9);
        assert!((ladder.breakeven_stop(2000.0, Direction::Sell) - 1999.0).abs() < 1e-9);
    }

    #[test]
    fn test_toml_round_trip_rejects_bad_config() {
        let raw = r#"
            [trend]
            trailing_pct = 1.0
            timeout_hours = 72
            rungs = [
              { distance_pct = 1.5, fraction = 0.4 },
              { distance_pct = 3.0, fraction = 0.3 },
              { distance_pct = 4.5, fraction = 0.3 },
            ]

            [range]
            trailing_pct = 0.6
            timeout_hours = 24
            rungs = [
              { distance_pct = 1.0,  fraction = 0.5 },
              { distance_pct = 1.75, fraction = 0.5 },
              { distance_pct = 2.5,  fraction = 0.2 },
            ]
        "#;
        let err = ExitLadderConfig::from_toml_str(raw).unwrap_err();
        assert!(err.to_string().contains("RANGE"));

        let fixed = raw.replace("{ distance_pct = 1.75, fraction = 0.5 }", "{ distance_pct = 1.75, fraction = 0.3 }");
        let config = ExitLadderConfig::from_toml_str(&fixed).unwrap();
        assert_eq!(config.range.breakeven_buffer_pct, 0.05);
        assert_eq!(config.for_regime(Regime::Trend).timeout(), Duration::hours(72));
    }
}
