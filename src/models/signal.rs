//! # models::signal
//!
//! Defines [`Signal`], the directional instruction a signal source hands to
//! the core, together with [`Direction`] and [`Regime`].
//!
//! A signal only describes *intent*. It becomes a position group once the
//! admission gate has accepted it; from that point it is never touched again.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Direction ────────────────────────────────────────────────────────────────

/// Trade direction. Serialised as `BUY` / `SELL`, which is also the
/// `trade_type` column of the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    /// `+1.0` for BUY, `-1.0` for SELL.
    #[inline]
    pub fn sign(self) -> f64 {
        match self {
            Direction::Buy  => 1.0,
            Direction::Sell => -1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Buy  => "BUY",
            Direction::Sell => "SELL",
        }
    }

    /// The tighter of two stops: higher for BUY, lower for SELL.
    #[inline]
    pub fn tighter_stop(self, current: f64, candidate: f64) -> f64 {
        match self {
            Direction::Buy  => current.max(candidate),
            Direction::Sell => current.min(candidate),
        }
    }

    /// `true` when a bar with this range trades through `stop`.
    #[inline]
    pub fn stop_reached(self, stop: f64, high: f64, low: f64) -> bool {
        match self {
            Direction::Buy  => low <= stop,
            Direction::Sell => high >= stop,
        }
    }

    /// `true` when a bar with this range trades through `target`.
    #[inline]
    pub fn target_reached(self, target: f64, high: f64, low: f64) -> bool {
        match self {
            Direction::Buy  => high >= target,
            Direction::Sell => low <= target,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Regime ───────────────────────────────────────────────────────────────────

/// Market-condition label. Fixed on a group at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    Trend,
    Range,
}

impl Regime {
    pub fn as_str(self) -> &'static str {
        match self {
            Regime::Trend => "TREND",
            Regime::Range => "RANGE",
        }
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Signal ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Open time of the bar this signal refers to (UTC).
    pub time: DateTime<Utc>,

    pub direction: Direction,

    pub entry_price: f64,

    /// Original protective stop. BUY: below entry, SELL: above entry.
    pub stop_loss: f64,

    /// Informational only. The exit ladder decides the real targets.
    #[serde(default)]
    pub take_profit_hint: Option<f64>,

    /// `None` until the driver runs the regime classifier on it.
    #[serde(default)]
    pub regime: Option<Regime>,

    /// Name of the source that produced the signal, for logging / export.
    pub source_tag: String,
}

impl Signal {
    pub fn new(
        time: DateTime<Utc>,
        direction: Direction,
        entry_price: f64,
        stop_loss: f64,
        source_tag: impl Into<String>,
    ) -> Self {
        Self {
            time,
            direction,
            entry_price,
            stop_loss,
            take_profit_hint: None,
            regime: None,
            source_tag: source_tag.into(),
        }
    }

    pub fn with_regime(mut self, regime: Regime) -> Self {
        self.regime = Some(regime);
        self
    }

    pub fn with_take_profit_hint(mut self, tp: f64) -> Self {
        self.take_profit_hint = Some(tp);
        self
    }

    /// Stop distance measured in the profitable direction. Positive means the
    /// stop sits on the protective side of entry.
    #[inline]
    pub fn stop_distance(&self) -> f64 {
        (self.entry_price - self.stop_loss) * self.direction.sign()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_stop_distance_sign() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let buy = Signal::new(t, Direction::Buy, 2000.0, 1980.0, "test");
        let sell = Signal::new(t, Direction::Sell, 2000.0, 2020.0, "test");
        let bad = Signal::new(t, Direction::Buy, 2000.0, 2010.0, "test");

        assert_eq!(buy.stop_distance(), 20.0);
        assert_eq!(sell.stop_distance(), 20.0);
        assert!(bad.stop_distance() < 0.0);
    }

    #[test]
    fn test_direction_serialises_as_trade_type() {
        assert_eq!(serde_json::to_string(&Direction::Sell).unwrap(), r#""SELL""#);
        assert_eq!(serde_json::to_string(&Regime::Trend).unwrap(), r#""TREND""#);
    }

    #[test]
    fn test_level_checks_mirror_for_sell() {
        assert_eq!(Direction::Buy.tighter_stop(1980.0, 2001.0), 2001.0);
        assert_eq!(Direction::Sell.tighter_stop(2020.0, 1999.0), 1999.0);
        assert!(Direction::Buy.stop_reached(1980.0, 2010.0, 1979.5));
        assert!(!Direction::Sell.stop_reached(2020.0, 2019.9, 1990.0));
        assert!(Direction::Sell.target_reached(1980.0, 2000.0, 1980.0));
    }
}
