//! # broker
//!
//! The [`Broker`] trait is everything the live driver needs from a trading
//! terminal. The broker is authoritative for what is actually open; the
//! reconciler brings local bookkeeping in line with it every cycle.
//!
//! | Implementation  | When                                   |
//! |-----------------|----------------------------------------|
//! | [`Mt5Broker`]   | `MT5_BASE_URL=http://…` (HTTP bridge EA) |
//! | [`PaperBroker`] | `MT5_BASE_URL=mock`, tests             |

pub mod mt5;
pub mod paper;

pub use mt5::Mt5Broker;
pub use paper::PaperBroker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::models::{Bar, Direction, PositionGroup};

/// MT5 `TRADE_RETCODE_DONE`.
pub const RETCODE_DONE: u32 = 10009;

// ─── Wire types ───────────────────────────────────────────────────────────────

/// One open position as the broker reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub ticket:     u64,
    pub symbol:     String,
    pub magic:      u64,
    pub volume:     f64,
    #[serde(default)]
    pub price_open: f64,
    /// 0.0 = not set
    #[serde(default)]
    pub sl:         f64,
    /// 0.0 = not set
    #[serde(default)]
    pub tp:         f64,
    #[serde(default)]
    pub comment:    String,
}

/// Market order for one rung of a group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRequest {
    pub symbol:  String,
    pub action:  Direction,
    pub volume:  f64,
    pub price:   f64,
    pub sl:      f64,
    pub tp:      f64,
    pub comment: String,
    pub magic:   u64,
}

impl OrderRequest {
    /// Order for rung `position_num` of `group`, tagged so the reconciler can
    /// find it again.
    pub fn for_position(group: &PositionGroup, position_num: u8, base_magic: u64) -> Option<Self> {
        let position = group.position(position_num)?;
        let tag = group.order_tag(position_num);
        Some(Self {
            symbol:  group.symbol.clone(),
            action:  group.trade_type,
            volume:  position.volume,
            price:   group.entry_price,
            sl:      position.sl_price,
            tp:      position.tp_price,
            comment: tag.comment(),
            magic:   tag.magic(base_magic),
        })
    }
}

// ─── Broker ───────────────────────────────────────────────────────────────────

#[async_trait]
pub trait Broker: Send + Sync {
    /// Cheap liveness check. Must fail fast when the terminal is unreachable.
    async fn ensure_connected(&self) -> Result<(), EngineError>;

    async fn open_positions(&self, symbol: &str) -> Result<Vec<BrokerPosition>, EngineError>;

    /// Sends a market order and returns the broker ticket.
    async fn submit_order(&self, order: &OrderRequest) -> Result<u64, EngineError>;

    async fn close_position(&self, ticket: u64, volume: f64) -> Result<(), EngineError>;

    async fn modify_position(&self, ticket: u64, sl: f64, tp: f64) -> Result<(), EngineError>;

    /// The last `count` bars of `symbol`, oldest first. The newest may still
    /// be forming.
    async fn recent_bars(&self, symbol: &str, count: usize) -> Result<Vec<Bar>, EngineError>;
}
