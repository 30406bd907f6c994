//! # data — historical bar loader
//!
//! Reads `time,open,high,low,close[,volume]` CSV files for the backtest.
//! `time` is the bar open, either unix seconds, RFC 3339, or
//! `YYYY-MM-DD HH:MM[:SS]` taken as UTC.

use std::io::Read;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;

use crate::error::StoreError;
use crate::models::Bar;

#[derive(Debug, Deserialize)]
struct RawBar {
    time:   String,
    open:   f64,
    high:   f64,
    low:    f64,
    close:  f64,
    #[serde(default)]
    volume: Option<f64>,
}

pub fn load_bars(path: &Path) -> Result<Vec<Bar>, StoreError> {
    read_bars(std::fs::File::open(path)?)
}

/// Parses and validates a bar CSV. Bars must be strictly increasing in time
/// and internally consistent (`low ≤ open, close ≤ high`).
pub fn read_bars<R: Read>(reader: R) -> Result<Vec<Bar>, StoreError> {
    let mut csv = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut bars: Vec<Bar> = Vec::new();

    for (i, row) in csv.deserialize::<RawBar>().enumerate() {
        let raw = row?;
        let line = i + 2;
        let bar = Bar {
            time:   parse_time(&raw.time)
                .ok_or_else(|| StoreError::InvalidData(format!("line {line}: bad time '{}'", raw.time)))?,
            open:   raw.open,
            high:   raw.high,
            low:    raw.low,
            close:  raw.close,
            volume: raw.volume.unwrap_or(0.0),
        };

        let prices = [bar.open, bar.high, bar.low, bar.close];
        if prices.iter().any(|p| !p.is_finite() || *p <= 0.0)
            || bar.low > bar.open.min(bar.close)
            || bar.high < bar.open.max(bar.close)
        {
            return Err(StoreError::InvalidData(format!("line {line}: inconsistent OHLC")));
        }
        if let Some(prev) = bars.last() {
            if bar.time <= prev.time {
                return Err(StoreError::InvalidData(format!(
                    "line {line}: {} not after {}",
                    bar.time, prev.time
                )));
            }
        }
        bars.push(bar);
    }
    Ok(bars)
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(secs) = raw.parse::<i64>() {
        return DateTime::from_timestamp(secs, 0);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y.%m.%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}
