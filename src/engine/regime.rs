//! # engine::regime
//!
//! **Regime classifier** — labels the market TREND or RANGE at the signal bar.
//!
//! ```text
//! window of closes ──┬─ [A] |SMA_short − SMA_long| / SMA_long ≥ separation
//!                    └─ [B] |close − SMA_short| / SMA_short ≥ distance
//! score = A + B   →   score ≥ 1 ⇒ TREND, else RANGE
//! ```
//!
//! Pure function of the window: the backtest and the live driver must agree
//! on the label for the same bars, otherwise they would pick different exit
//! ladders for the same signal.

use tracing::debug;

use crate::config::env_or;
use crate::error::EngineError;
use crate::models::{Bar, Regime};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegimeClassifier {
    pub short_period: usize,
    pub long_period: usize,
    /// Minimum relative gap between the two averages.
    pub separation_threshold: f64,
    /// Minimum relative gap between price and the short average.
    pub distance_threshold: f64,
}

impl Default for RegimeClassifier {
    fn default() -> Self {
        Self {
            short_period:         20,
            long_period:          50,
            separation_threshold: 0.002,
            distance_threshold:   0.003,
        }
    }
}

impl RegimeClassifier {
    pub fn from_env() -> Result<Self, EngineError> {
        let d = Self::default();
        let classifier = Self {
            short_period:         env_or("REGIME_SHORT_PERIOD", d.short_period),
            long_period:          env_or("REGIME_LONG_PERIOD", d.long_period),
            separation_threshold: env_or("REGIME_SEPARATION", d.separation_threshold),
            distance_threshold:   env_or("REGIME_DISTANCE", d.distance_threshold),
        };
        classifier.validate()?;
        Ok(classifier)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.short_period == 0 || self.short_period >= self.long_period {
            return Err(EngineError::Configuration(format!(
                "regime periods must satisfy 0 < short ({}) < long ({})",
                self.short_period, self.long_period
            )));
        }
        if !(self.separation_threshold > 0.0 && self.distance_threshold > 0.0) {
            return Err(EngineError::Configuration(
                "regime thresholds must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Classifies the bar at the end of `window`.
    ///
    /// A window shorter than the long period cannot show a trend and is
    /// labelled RANGE.
    pub fn classify(&self, window: &[Bar]) -> Regime {
        if window.len() < self.long_period {
            return Regime::Range;
        }

        let short = sma(window, self.short_period);
        let long = sma(window, self.long_period);
        let close = window[window.len() - 1].close;

        if long <= 0.0 || short <= 0.0 {
            return Regime::Range;
        }

        let separation = (short - long).abs() / long;
        let distance = (close - short).abs() / short;

        let score = u8::from(separation >= self.separation_threshold)
            + u8::from(distance >= self.distance_threshold);

        let regime = if score >= 1 { Regime::Trend } else { Regime::Range };
        debug!(separation, distance, score, %regime, "regime classified");
        regime
    }
}

/// Simple moving average of the last `period` closes.
fn sma(window: &[Bar], period: usize) -> f64 {
    let tail = &window[window.len() - period..];
    tail.iter().map(|b| b.close).sum::<f64>() / period as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn bars_from(closes: &[f64]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                time:   start + Duration::hours(i as i64),
                open:   c,
                high:   c + 0.5,
                low:    c - 0.5,
                close:  c,
                volume: 100.0,
            })
            .collect()
    }

    #[test]
    fn test_short_window_is_range() {
        let bars = bars_from(&[100.0; 10]);
        assert_eq!(RegimeClassifier::default().classify(&bars), Regime::Range);
    }

    #[test]
    fn test_flat_market_is_range() {
        let bars = bars_from(&[2000.0; 60]);
        assert_eq!(RegimeClassifier::default().classify(&bars), Regime::Range);
    }

    #[test]
    fn test_steady_climb_is_trend() {
        let closes: Vec<f64> = (0..60).map(|i| 2000.0 + i as f64 * 2.0).collect();
        let bars = bars_from(&closes);
        assert_eq!(RegimeClassifier::default().classify(&bars), Regime::Trend);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let closes: Vec<f64> = (0..80).map(|i| 2000.0 + ((i * 7) % 13) as f64).collect();
        let bars = bars_from(&closes);
        let c = RegimeClassifier::default();
        assert_eq!(c.classify(&bars), c.classify(&bars.clone()));
    }

    #[test]
    fn test_invalid_periods_rejected() {
        let c = RegimeClassifier { short_period: 50, long_period: 20, ..Default::default() };
        assert!(matches!(c.validate(), Err(EngineError::Configuration(_))));
    }
}
