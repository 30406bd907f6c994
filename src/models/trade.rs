//! # models::trade
//!
//! [`TradeRecord`] — one row of the append-only ledger, written for every
//! partial or full close. Rows are never edited; a correction is a new row.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{Direction, GroupId, Position, PositionGroup, Regime};

// ─── CloseReason ──────────────────────────────────────────────────────────────

/// Why a position was closed. Also the `status` column of the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseReason {
    #[serde(rename = "TP1")]
    Tp1,
    #[serde(rename = "TP2")]
    Tp2,
    #[serde(rename = "TP3")]
    Tp3,
    /// Original stop-loss, before TP1.
    #[serde(rename = "SL")]
    StopLoss,
    /// Breakeven / trailing stop, after TP1.
    #[serde(rename = "TRAILING_SL")]
    TrailingSl,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    /// Closed outside the engine (operator, broker stop-out, unfilled order).
    #[serde(rename = "EXTERNAL")]
    External,
}

impl CloseReason {
    /// Take-profit reason for rung `position_num`.
    pub fn take_profit(position_num: u8) -> Self {
        match position_num {
            1 => CloseReason::Tp1,
            2 => CloseReason::Tp2,
            _ => CloseReason::Tp3,
        }
    }

    pub fn is_take_profit(self) -> bool {
        matches!(self, CloseReason::Tp1 | CloseReason::Tp2 | CloseReason::Tp3)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Tp1        => "TP1",
            CloseReason::Tp2        => "TP2",
            CloseReason::Tp3        => "TP3",
            CloseReason::StopLoss   => "SL",
            CloseReason::TrailingSl => "TRAILING_SL",
            CloseReason::Timeout    => "TIMEOUT",
            CloseReason::External   => "EXTERNAL",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── TradeRecord ──────────────────────────────────────────────────────────────

/// Flat ledger row. Every field is always present; the only optional one is
/// the broker order id, which backtests never have.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub trade_id:          Uuid,
    pub bot_id:            u32,
    pub order_id:          Option<u64>,
    pub symbol:            String,
    pub open_time:         DateTime<Utc>,
    pub close_time:        DateTime<Utc>,
    pub duration_hours:    f64,
    pub trade_type:        Direction,
    pub amount:            f64,
    pub entry_price:       f64,
    pub close_price:       f64,
    pub stop_loss:         f64,
    pub take_profit:       f64,
    pub profit:            f64,
    pub profit_percent:    f64,
    pub status:            CloseReason,
    pub market_regime:     Regime,
    pub position_group_id: GroupId,
    pub position_num:      u8,
}

impl TradeRecord {
    /// Builds the ledger row for closing `position` of `group` and validates
    /// its shape.
    pub fn from_close(
        group: &PositionGroup,
        position: &Position,
        close_price: f64,
        close_time: DateTime<Utc>,
        reason: CloseReason,
    ) -> Result<Self, EngineError> {
        let sign = group.trade_type.sign();
        let favourable = (close_price - group.entry_price) * sign;

        let record = Self {
            trade_id:          trade_id_for(group.group_id, position.position_num),
            bot_id:            group.bot_id,
            order_id:          position.ticket,
            symbol:            group.symbol.clone(),
            open_time:         group.created_at,
            close_time,
            duration_hours:    (close_time - group.created_at).num_seconds() as f64 / 3600.0,
            trade_type:        group.trade_type,
            amount:            position.volume,
            entry_price:       group.entry_price,
            close_price,
            stop_loss:         position.sl_price,
            take_profit:       position.tp_price,
            profit:            favourable * position.volume,
            profit_percent:    favourable / group.entry_price * 100.0,
            status:            reason,
            market_regime:     group.regime,
            position_group_id: group.group_id,
            position_num:      position.position_num,
        };
        record.validate()?;
        Ok(record)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |msg: &str| {
            Err(EngineError::InvariantViolation(format!(
                "trade record {} (group {} pos {}): {msg}",
                self.trade_id, self.position_group_id, self.position_num
            )))
        };

        if !(1..=3).contains(&self.position_num) {
            return invalid("position_num outside 1..=3");
        }
        if !(self.amount > 0.0 && self.amount.is_finite()) {
            return invalid("amount must be positive");
        }
        let prices = [self.entry_price, self.close_price, self.stop_loss, self.take_profit];
        if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return invalid("prices must be finite and positive");
        }
        if self.close_time < self.open_time {
            return invalid("close_time before open_time");
        }
        Ok(())
    }

    #[inline]
    pub fn is_win(&self) -> bool {
        self.profit > 0.0
    }
}

/// Deterministic trade id: the same close in two replays gets the same id.
pub fn trade_id_for(group_id: GroupId, position_num: u8) -> Uuid {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"trade:");
    hasher.update(group_id.as_bytes());
    hasher.update(&[position_num]);
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest.as_bytes()[..16]);
    Uuid::from_bytes(bytes)
}
