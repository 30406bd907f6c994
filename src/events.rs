//! # events
//!
//! Structured trade notifications and the monitor's WebSocket frames.
//!
//! The core never formats messages for humans. It hands a [`TradeEvent`] to
//! a [`Notifier`]; what happens next (a log line, a WebSocket frame, a chat
//! message elsewhere) is the notifier's business.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

use crate::engine::CloseEvent;
use crate::models::{CloseReason, Direction, GroupId, PositionGroup};

// ─── TradeEvent ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeEventKind {
    Opened,
    PartialClose,
    FullClose,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeEvent {
    pub kind:           TradeEventKind,
    pub group_id:       GroupId,
    pub position_num:   Option<u8>,
    pub direction:      Direction,
    pub entry:          f64,
    pub exit:           Option<f64>,
    pub exit_reason:    Option<CloseReason>,
    pub pnl_pct:        Option<f64>,
    pub pnl_abs:        Option<f64>,
    pub duration_hours: Option<f64>,
    pub time:           DateTime<Utc>,
}

impl TradeEvent {
    pub fn opened(group: &PositionGroup) -> Self {
        Self {
            kind:           TradeEventKind::Opened,
            group_id:       group.group_id,
            position_num:   None,
            direction:      group.trade_type,
            entry:          group.entry_price,
            exit:           None,
            exit_reason:    None,
            pnl_pct:        None,
            pnl_abs:        None,
            duration_hours: None,
            time:           group.created_at,
        }
    }

    pub fn closed(event: &CloseEvent) -> Self {
        let record = &event.record;
        Self {
            kind:           if event.group_closed { TradeEventKind::FullClose } else { TradeEventKind::PartialClose },
            group_id:       event.group_id,
            position_num:   Some(event.position_num),
            direction:      record.trade_type,
            entry:          record.entry_price,
            exit:           Some(event.price),
            exit_reason:    Some(event.reason),
            pnl_pct:        Some(record.profit_percent),
            pnl_abs:        Some(record.profit),
            duration_hours: Some(record.duration_hours),
            time:           record.close_time,
        }
    }
}

// ─── Notifier ─────────────────────────────────────────────────────────────────

pub trait Notifier: Send + Sync {
    fn notify(&self, event: &TradeEvent);
}

/// Writes every event to the log.
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: &TradeEvent) {
        info!(
            kind     = ?event.kind,
            group_id = %event.group_id,
            pos      = ?event.position_num,
            reason   = ?event.exit_reason,
            pnl_abs  = ?event.pnl_abs,
            "📣 trade event"
        );
    }
}

/// Pushes events to monitor WebSocket clients. Sending with no subscriber is
/// not an error.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<String>,
}

impl BroadcastNotifier {
    pub fn new(tx: broadcast::Sender<String>) -> Self {
        Self { tx }
    }
}

impl Notifier for BroadcastNotifier {
    fn notify(&self, event: &TradeEvent) {
        let _ = self.tx.send(WsEvent::Trade { trade: event.clone() }.to_json());
    }
}

/// Fans one event out to several notifiers.
#[derive(Default)]
pub struct Notifiers(Vec<Arc<dyn Notifier>>);

impl Notifiers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn with(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.0.push(notifier);
        self
    }
}

impl Notifier for Notifiers {
    fn notify(&self, event: &TradeEvent) {
        for n in &self.0 {
            n.notify(event);
        }
    }
}

// ─── WsEvent ──────────────────────────────────────────────────────────────────

/// Every frame the monitor WebSocket can carry.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WsEvent {
    Trade { trade: TradeEvent },

    /// Broker SL/TP adopted or orphan closed during reconciliation.
    Reconciliation { message: String },

    /// Broker unreachable; latched, sent once per outage.
    BrokerDown { reason: String },

    BrokerRestored,

    RiskKilled { reason: String },

    /// End-of-cycle heartbeat.
    CycleCompleted {
        cycle:         u64,
        active_groups: usize,
        records:       usize,
    },
}

impl WsEvent {
    #[inline]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"event":"SERIALIZATION_ERROR"}"#.to_string())
    }
}
