//! # broker::mt5
//!
//! **MT5 bridge client** — talks to the HTTP bridge EA running inside the
//! MetaTrader 5 terminal.
//!
//! ## Bridge API contract (MQL5 side)
//! | Method | Path               | Body / query                        | Reply                                   |
//! |--------|--------------------|-------------------------------------|-----------------------------------------|
//! | GET    | `/health`          |                                     | `{ "ok": true }`                        |
//! | GET    | `/positions`       | `?symbol=`                          | `{ "positions": [BrokerPosition] }`     |
//! | POST   | `/order/send`      | [`OrderRequest`]                    | `{ "retcode": 10009, "order": 123456 }` |
//! | POST   | `/position/close`  | `{ "ticket", "volume" }`            | `{ "retcode": 10009 }`                  |
//! | POST   | `/position/modify` | `{ "ticket", "sl", "tp" }`          | `{ "retcode": 10009 }`                  |
//! | GET    | `/rates`           | `?symbol=&timeframe_minutes=&count=`| `{ "rates": [{time, open, …}] }`        |
//!
//! retcode 10009 = `TRADE_RETCODE_DONE`; anything else is a rejection.

use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::broker::{Broker, BrokerPosition, OrderRequest, RETCODE_DONE};
use crate::error::EngineError;
use crate::models::Bar;

// ─── Bridge Request / Response ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TradeResponse {
    retcode: u32,
    /// Ticket, present when retcode = 10009.
    order:   Option<u64>,
    comment: Option<String>,
}

#[derive(Debug, Serialize)]
struct CloseBody {
    ticket: u64,
    volume: f64,
}

#[derive(Debug, Serialize)]
struct ModifyBody {
    ticket: u64,
    sl:     f64,
    tp:     f64,
}

#[derive(Debug, Deserialize)]
struct PositionsResponse {
    #[serde(default)]
    positions: Vec<BrokerPosition>,
}

#[derive(Debug, Deserialize)]
struct Rate {
    /// Bar open, unix seconds (server time already shifted to UTC by the EA).
    time:  i64,
    open:  f64,
    high:  f64,
    low:   f64,
    close: f64,
    #[serde(default)]
    tick_volume: f64,
}

#[derive(Debug, Deserialize)]
struct RatesResponse {
    #[serde(default)]
    rates: Vec<Rate>,
}

// ─── Client ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Mt5Broker {
    client:         reqwest::Client,
    base_url:       String,
    timeout:        Duration,
    timeframe_mins: i64,
}

impl Mt5Broker {
    pub fn new(base_url: impl Into<String>, timeout: Duration, bar_period: chrono::Duration) -> Self {
        Self {
            client:         reqwest::Client::new(),
            base_url:       base_url.into().trim_end_matches('/').to_string(),
            timeout,
            timeframe_mins: bar_period.num_minutes(),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, EngineError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(query)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| EngineError::Connection(format!("MT5 unreachable ({path}): {e}")))?;
        parse(response, path).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, EngineError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, path, "MT5 unreachable");
                EngineError::Connection(format!("MT5 unreachable ({path}): {e}"))
            })?;
        parse(response, path).await
    }
}

/// HTTP status check + JSON decode.
async fn parse<T: DeserializeOwned>(response: reqwest::Response, path: &str) -> Result<T, EngineError> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error!(http_status = %status, body = %body, path, "MT5 returned HTTP error");
        return Err(EngineError::Broker(format!("MT5 HTTP {status} on {path}: {body}")));
    }
    response
        .json()
        .await
        .map_err(|e| EngineError::Broker(format!("MT5 response parse error on {path}: {e}")))
}

/// Only retcode 10009 counts as success.
fn check_retcode(resp: &TradeResponse, what: &str) -> Result<(), EngineError> {
    if resp.retcode == RETCODE_DONE {
        return Ok(());
    }
    let msg = format!(
        "MT5 rejected {what}: retcode={} comment={}",
        resp.retcode,
        resp.comment.as_deref().unwrap_or("unknown")
    );
    warn!("{msg}");
    Err(EngineError::Broker(msg))
}

#[async_trait]
impl Broker for Mt5Broker {
    async fn ensure_connected(&self) -> Result<(), EngineError> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| EngineError::Connection(format!("MT5 health check failed: {e}")))?;
        if !response.status().is_success() {
            return Err(EngineError::Connection(format!(
                "MT5 health check returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn open_positions(&self, symbol: &str) -> Result<Vec<BrokerPosition>, EngineError> {
        let resp: PositionsResponse = self
            .get_json("/positions", &[("symbol", symbol.to_string())])
            .await?;
        Ok(resp.positions)
    }

    async fn submit_order(&self, order: &OrderRequest) -> Result<u64, EngineError> {
        info!(
            symbol  = %order.symbol,
            action  = %order.action,
            volume  = order.volume,
            price   = order.price,
            sl      = order.sl,
            tp      = order.tp,
            magic   = order.magic,
            "🚀 [MT5] sending order"
        );

        let resp: TradeResponse = self.post_json("/order/send", order).await?;
        check_retcode(&resp, "order")?;
        let ticket = resp
            .order
            .ok_or_else(|| EngineError::Broker("MT5 accepted order without a ticket".into()))?;

        info!(ticket, "✅ [MT5] order accepted");
        Ok(ticket)
    }

    async fn close_position(&self, ticket: u64, volume: f64) -> Result<(), EngineError> {
        let resp: TradeResponse = self
            .post_json("/position/close", &CloseBody { ticket, volume })
            .await?;
        check_retcode(&resp, "close")?;
        info!(ticket, volume, "✅ [MT5] position closed");
        Ok(())
    }

    async fn modify_position(&self, ticket: u64, sl: f64, tp: f64) -> Result<(), EngineError> {
        let resp: TradeResponse = self
            .post_json("/position/modify", &ModifyBody { ticket, sl, tp })
            .await?;
        check_retcode(&resp, "modify")?;
        info!(ticket, sl, tp, "✅ [MT5] position modified");
        Ok(())
    }

    async fn recent_bars(&self, symbol: &str, count: usize) -> Result<Vec<Bar>, EngineError> {
        let resp: RatesResponse = self
            .get_json(
                "/rates",
                &[
                    ("symbol", symbol.to_string()),
                    ("timeframe_minutes", self.timeframe_mins.to_string()),
                    ("count", count.to_string()),
                ],
            )
            .await?;

        let mut bars = resp
            .rates
            .into_iter()
            .map(|r| {
                let time = DateTime::from_timestamp(r.time, 0)
                    .ok_or_else(|| EngineError::Broker(format!("MT5 rate with bad time {}", r.time)))?;
                Ok(Bar {
                    time,
                    open:   r.open,
                    high:   r.high,
                    low:    r.low,
                    close:  r.close,
                    volume: r.tick_volume,
                })
            })
            .collect::<Result<Vec<_>, EngineError>>()?;
        bars.sort_by_key(|b| b.time);
        Ok(bars)
    }
}
