//! # Ladderbot — Position Lifecycle & Reconciliation Engine
//!
//! ```text
//!   SignalSource ──▶ SignalAdmissionGate ──▶ PositionLifecycleManager ──▶ GroupStore
//!                          (dedupe)             (3-rung exit ladder)       (ledger)
//!                                                      ▲
//!                 ┌────────────────────────────────────┴──────────────┐
//!          BacktestDriver                                  LiveExecutionDriver
//!          (bar slice)                                     (Broker + BrokerReconciler)
//!                                                                     │
//!                                                          AppState ──▶ /api/*, /ws/monitor
//! ```

pub mod auth;
pub mod broker;
pub mod config;
pub mod data;
pub mod driver;
pub mod engine;
pub mod error;
pub mod events;
pub mod models;
pub mod risk;
pub mod routes;
pub mod state;
pub mod store;
pub mod strategy;
