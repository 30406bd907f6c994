//! # routes::monitor
//!
//! Read-only view of the bot for dashboards.
//!
//! | Method   | Path              | Description                                   |
//! |----------|-------------------|-----------------------------------------------|
//! | GET      | `/api/health`     | liveness, uptime, broker connectivity         |
//! | GET      | `/api/groups`     | position groups (`?status=active\|closed`)    |
//! | GET      | `/api/groups/:id` | one group                                     |
//! | GET      | `/api/trades`     | the ledger                                    |
//! | GET      | `/api/stats`      | realised / unrealised P&L, admission counters |
//! | GET (WS) | `/ws/monitor`     | live event stream                             |

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::{GroupView, SharedState};

// ─── WebSocket ────────────────────────────────────────────────────────────────

/// Upgrades to a WebSocket fed by the broadcast channel. The first frame is
/// a `SNAPSHOT` of the last published cycle.
pub async fn ws_monitor(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let mut rx = state.broadcast_tx.subscribe();
    let (mut sender, mut receiver) = socket.split();

    info!("🔌 WebSocket client connected");

    let snapshot = {
        let snap = state.snapshot.read().await;
        json!({
            "event":            "SNAPSHOT",
            "cycle":            snap.cycle,
            "broker_connected": snap.broker_connected,
            "groups":           snap.groups,
            "records":          snap.records.len(),
        })
        .to_string()
    };

    if sender.send(Message::Text(snapshot.into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(frame) => {
                        if sender.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!("WS client lagged, skipped {n} events");
                    }
                    Err(_) => break,
                }
            }

            result = receiver.next() => {
                match result {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("🔌 WebSocket client disconnected");
}

// ─── REST ─────────────────────────────────────────────────────────────────────

/// GET /api/health
pub async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    let snap = state.snapshot.read().await;
    Json(json!({
        "ok":               true,
        "uptime_secs":      (Utc::now() - state.started_at).num_seconds(),
        "cycle":            snap.cycle,
        "last_cycle_at":    snap.updated_at,
        "broker_connected": snap.broker_connected,
    }))
}

#[derive(Debug, Deserialize)]
pub struct GroupFilter {
    pub status: Option<String>,
}

/// GET /api/groups
pub async fn list_groups(
    State(state): State<SharedState>,
    Query(filter): Query<GroupFilter>,
) -> Result<impl IntoResponse, AppError> {
    let active = match filter.status.as_deref() {
        None | Some("all") => None,
        Some("active") => Some(true),
        Some("closed") => Some(false),
        Some(other) => return Err(AppError::BadRequest(format!("unknown status filter '{other}'"))),
    };

    let snap = state.snapshot.read().await;
    let groups: Vec<&GroupView> = snap
        .groups
        .iter()
        .filter(|g| active.map_or(true, |a| g.group.is_active() == a))
        .collect();

    Ok(Json(json!({
        "ok":     true,
        "count":  groups.len(),
        "groups": groups,
    })))
}

/// GET /api/groups/:id
pub async fn get_group(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let snap = state.snapshot.read().await;
    let group = snap
        .groups
        .iter()
        .find(|g| g.group.group_id == id)
        .ok_or_else(|| AppError::NotFound(format!("position group {id}")))?;
    Ok(Json(json!({ "ok": true, "group": group })))
}

/// GET /api/trades
pub async fn list_trades(State(state): State<SharedState>) -> impl IntoResponse {
    let snap = state.snapshot.read().await;
    Json(json!({
        "ok":      true,
        "count":   snap.records.len(),
        "records": snap.records,
    }))
}

/// GET /api/stats
pub async fn stats(State(state): State<SharedState>) -> impl IntoResponse {
    let snap = state.snapshot.read().await;
    let wins = snap.records.iter().filter(|r| r.is_win()).count();
    let win_rate_pct = if snap.records.is_empty() {
        0.0
    } else {
        wins as f64 / snap.records.len() as f64 * 100.0
    };

    Json(json!({
        "ok":                true,
        "cycle":             snap.cycle,
        "active_groups":     snap.active_groups(),
        "total_groups":      snap.groups.len(),
        "records":           snap.records.len(),
        "realised_profit":   snap.realised_profit(),
        "unrealised_profit": snap.unrealised_profit(),
        "win_rate_pct":      win_rate_pct,
        "admission":         snap.admission,
    }))
}
