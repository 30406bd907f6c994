//! # models::bar
//!
//! Defines [`Bar`], one OHLCV candle. Both drivers speak bars: the backtest
//! replays them from a file, the live driver pulls them from the terminal.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A single completed (or forming) OHLCV bar.
///
/// `time` is the **open** time of the bar, always UTC. The close time is not
/// stored; it is derived from the bar period, which is a property of the bot
/// and not of the bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub time:   DateTime<Utc>,
    pub open:   f64,
    pub high:   f64,
    pub low:    f64,
    pub close:  f64,
    #[serde(default)]
    pub volume: f64,
}

impl Bar {
    /// Instant at which this bar stops forming.
    #[inline]
    pub fn close_time(&self, period: Duration) -> DateTime<Utc> {
        self.time + period
    }

    /// `true` once `now` has reached the bar's close time.
    #[inline]
    pub fn is_complete(&self, period: Duration, now: DateTime<Utc>) -> bool {
        now >= self.close_time(period)
    }
}
