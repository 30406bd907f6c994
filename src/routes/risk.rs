//! # routes::risk
//!
//! | Method | Path               | Description                       |
//! |--------|--------------------|-----------------------------------|
//! | POST   | `/api/risk/kill`   | stop opening new groups           |
//! | POST   | `/api/risk/rearm`  | allow new groups again            |
//! | GET    | `/api/risk/status` | counters, cooldown, kill reason   |
//!
//! The kill switch only gates new groups. Open groups keep being managed.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;

use crate::events::WsEvent;
use crate::state::SharedState;

#[derive(Deserialize)]
pub struct KillBody {
    pub reason: Option<String>,
}

/// POST /api/risk/kill
pub async fn kill_switch_on(
    State(state): State<SharedState>,
    body: Option<Json<KillBody>>,
) -> impl IntoResponse {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "Manual kill via API".to_string());

    state.risk.kill(&reason).await;
    state.broadcast(&WsEvent::RiskKilled { reason: reason.clone() });

    (StatusCode::OK, Json(json!({
        "ok":      true,
        "message": format!("Kill switch activated: {reason}"),
    })))
}

/// POST /api/risk/rearm
pub async fn kill_switch_off(State(state): State<SharedState>) -> impl IntoResponse {
    state.risk.rearm().await;
    Json(json!({
        "ok":      true,
        "message": "System re-armed, new groups allowed",
    }))
}

/// GET /api/risk/status
pub async fn get_risk_status(State(state): State<SharedState>) -> impl IntoResponse {
    let status = state.risk.status().await;
    Json(json!({ "ok": true, "risk": status }))
}
