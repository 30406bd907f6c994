//! # state
//!
//! Shared state behind the monitor HTTP server. The live driver is the only
//! writer: it publishes a [`MonitorSnapshot`] at the end of every cycle, and
//! the handlers read that snapshot instead of touching the store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};

use crate::engine::AdmissionStats;
use crate::events::WsEvent;
use crate::models::{LifecycleState, PositionGroup, TradeRecord};
use crate::risk::RiskManager;

// ─── Snapshot ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct GroupView {
    #[serde(flatten)]
    pub group:      PositionGroup,
    pub state:      LifecycleState,
    /// Open remainder valued at the group's last price.
    pub unrealised: f64,
}

impl From<PositionGroup> for GroupView {
    fn from(group: PositionGroup) -> Self {
        Self {
            state:      group.state(),
            unrealised: group.unrealised(group.last_price),
            group,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorSnapshot {
    pub cycle:            u64,
    pub updated_at:       Option<DateTime<Utc>>,
    pub broker_connected: bool,
    pub groups:           Vec<GroupView>,
    pub records:          Vec<TradeRecord>,
    pub admission:        AdmissionStats,
}

impl MonitorSnapshot {
    pub fn active_groups(&self) -> usize {
        self.groups.iter().filter(|g| g.group.is_active()).count()
    }

    pub fn realised_profit(&self) -> f64 {
        self.records.iter().map(|r| r.profit).sum()
    }

    pub fn unrealised_profit(&self) -> f64 {
        self.groups.iter().map(|g| g.unrealised).sum()
    }
}

// ─── AppState ─────────────────────────────────────────────────────────────────

/// Top-level shared state injected into every Axum handler.
pub struct AppState {
    /// Pre-serialized [`WsEvent`] frames for WebSocket clients.
    pub broadcast_tx: broadcast::Sender<String>,
    pub risk:         Arc<RiskManager>,
    pub snapshot:     RwLock<MonitorSnapshot>,
    /// `None` = every request allowed (dev mode).
    pub api_key:      Option<String>,
    pub started_at:   DateTime<Utc>,
}

impl AppState {
    pub fn new(risk: Arc<RiskManager>, api_key: Option<String>) -> Self {
        let (broadcast_tx, _) = broadcast::channel(256);
        Self {
            broadcast_tx,
            risk,
            snapshot: RwLock::new(MonitorSnapshot::default()),
            api_key,
            started_at: Utc::now(),
        }
    }

    /// Sends `event` to all WebSocket clients. No listener is not an error.
    pub fn broadcast(&self, event: &WsEvent) {
        let _ = self.broadcast_tx.send(event.to_json());
    }

    pub async fn publish(&self, snapshot: MonitorSnapshot) {
        let event = WsEvent::CycleCompleted {
            cycle:         snapshot.cycle,
            active_groups: snapshot.active_groups(),
            records:       snapshot.records.len(),
        };
        *self.snapshot.write().await = snapshot;
        self.broadcast(&event);
    }
}

pub type SharedState = Arc<AppState>;
