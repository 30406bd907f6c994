//! # routes
//!
//! HTTP monitor for a running bot. Handlers only read the snapshot the live
//! driver publishes (plus the risk switch); none of them touches the store.

pub mod monitor;
pub mod risk;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::auth::require_api_key;
use crate::state::SharedState;

pub fn router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Monitor ───────────────────────────────────────────────────────────
        .route("/api/health",       get(monitor::health))
        .route("/api/groups",       get(monitor::list_groups))
        .route("/api/groups/:id",   get(monitor::get_group))
        .route("/api/trades",       get(monitor::list_trades))
        .route("/api/stats",        get(monitor::stats))
        .route("/ws/monitor",       get(monitor::ws_monitor))
        // ── Risk Management ───────────────────────────────────────────────────
        .route("/api/risk/kill",    post(risk::kill_switch_on))
        .route("/api/risk/rearm",   post(risk::kill_switch_off))
        .route("/api/risk/status",  get(risk::get_risk_status))
        // ── Middleware ────────────────────────────────────────────────────────
        .layer(axum::middleware::from_fn_with_state(state.clone(), require_api_key))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::risk::{RiskConfig, RiskManager};
    use crate::state::{AppState, MonitorSnapshot};
    use crate::store::memory::tests::{sample_group, sample_record};

    const KEY: &str = "secret";

    async fn state_with_group() -> SharedState {
        let state = Arc::new(AppState::new(
            Arc::new(RiskManager::new(RiskConfig::default())),
            Some(KEY.to_string()),
        ));
        let mut closed = sample_group(2, 0);
        closed.status = crate::models::GroupStatus::Closed;
        state
            .publish(MonitorSnapshot {
                cycle:   3,
                groups:  vec![sample_group(1, 0).into(), closed.clone().into()],
                records: vec![sample_record(&closed)],
                ..Default::default()
            })
            .await;
        state
    }

    fn get_req(uri: &str, key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(k) = key {
            builder = builder.header("X-API-Key", k);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn json_of(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_open_everything_else_needs_key() {
        let app = router(state_with_group().await);

        let res = app.clone().oneshot(get_req("/api/health", None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_of(res).await["cycle"], 3);

        let res = app.clone().oneshot(get_req("/api/groups", None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = app.oneshot(get_req("/api/groups", Some("wrong"))).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_groups_filter_and_lookup() {
        let app = router(state_with_group().await);

        let res = app.clone().oneshot(get_req("/api/groups?status=active", Some(KEY))).await.unwrap();
        let body = json_of(res).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["groups"][0]["state"], "OPEN");

        let res = app.clone().oneshot(get_req("/api/groups?status=bogus", Some(KEY))).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let id = uuid::Uuid::from_u128(2);
        let res = app.clone().oneshot(get_req(&format!("/api/groups/{id}"), Some(KEY))).await.unwrap();
        assert_eq!(json_of(res).await["group"]["status"], "CLOSED");

        let missing = uuid::Uuid::from_u128(9);
        let res = app.oneshot(get_req(&format!("/api/groups/{missing}"), Some(KEY))).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_of(res).await["ok"], false);
    }

    #[tokio::test]
    async fn test_trades_and_stats() {
        let app = router(state_with_group().await);

        let res = app.clone().oneshot(get_req("/api/trades", Some(KEY))).await.unwrap();
        assert_eq!(json_of(res).await["count"], 1);

        let res = app.oneshot(get_req("/api/stats", Some(KEY))).await.unwrap();
        let body = json_of(res).await;
        assert_eq!(body["active_groups"], 1);
        assert_eq!(body["win_rate_pct"], 100.0);
    }

    #[tokio::test]
    async fn test_kill_and_rearm() {
        let state = state_with_group().await;
        let app = router(state.clone());

        let kill = Request::builder()
            .method("POST")
            .uri("/api/risk/kill")
            .header("X-API-Key", KEY)
            .header("content-type", "application/json")
            .body(Body::from(r#"{"reason":"maintenance"}"#))
            .unwrap();
        assert_eq!(app.clone().oneshot(kill).await.unwrap().status(), StatusCode::OK);
        assert_eq!(state.risk.status().await.kill_reason.as_deref(), Some("maintenance"));

        let rearm = Request::builder()
            .method("POST")
            .uri("/api/risk/rearm")
            .header("X-API-Key", KEY)
            .body(Body::empty())
            .unwrap();
        app.clone().oneshot(rearm).await.unwrap();

        let res = app.oneshot(get_req("/api/risk/status", Some(KEY))).await.unwrap();
        assert_eq!(json_of(res).await["risk"]["is_killed"], false);
    }
}
