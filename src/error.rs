//! # error
//!
//! Centralised error types.
//!
//! * [`EngineError`] — everything the core can fail with. Configuration and
//!   invariant errors are fatal; connection errors are operating conditions
//!   that the live driver retries and then reports once.
//! * [`StoreError`] — persistence failures.
//! * [`AppError`] — what monitor handlers return. Axum's `IntoResponse` impl
//!   turns it into a structured JSON error body.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::models::GroupId;

// ─── EngineError ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid ladder / regime / instrument configuration. Raised at load time.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Broker terminal unreachable or timed out.
    #[error("Broker connection error: {0}")]
    Connection(String),

    /// Broker answered but refused the request (bad retcode, bad payload).
    #[error("Broker rejected request: {0}")]
    Broker(String),

    #[error("Store error: {0}")]
    Store(StoreError),

    /// A logic bug: double close, fractions not summing to one, stop on the
    /// wrong side of entry. Never swallowed.
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    /// A signal whose levels cannot form a valid group (stop on the wrong
    /// side of entry, non-positive price). The signal is dropped.
    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    #[error("Position group not found: {0}")]
    GroupNotFound(GroupId),

    #[error("All group counters (0-99) are held by active groups")]
    CounterExhausted,
}

impl EngineError {
    /// Fatal errors stop the live loop instead of being retried next cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Configuration(_) | EngineError::InvariantViolation(_)
        )
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateRecord { .. } => EngineError::InvariantViolation(err.to_string()),
            other => EngineError::Store(other),
        }
    }
}

// ─── StoreError ───────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Input file parsed but its content is unusable (unsorted bars, bad time).
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// The ledger already holds a close for this position.
    #[error("position {position_num} of group {group_id} closed twice")]
    DuplicateRecord { group_id: GroupId, position_num: u8 },
}

// ─── AppError (HTTP) ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AppError {
    /// The request payload was syntactically correct but semantically invalid.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The requested resource does not exist (yet).
    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Catch-all for unexpected failures.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Engine(EngineError::InvalidSignal(msg)) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Engine(EngineError::GroupNotFound(id)) => {
                (StatusCode::NOT_FOUND, format!("Position group not found: {id}"))
            }
            AppError::Engine(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
            AppError::Internal(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal error: {err}"),
            ),
        };

        let body = Json(json!({
            "ok":    false,
            "error": message,
        }));

        (status, body).into_response()
    }
}
