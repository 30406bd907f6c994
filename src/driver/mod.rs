//! # driver
//!
//! The two callers of the lifecycle manager. They differ only in where the
//! next bar comes from and in their side effects.
//!
//! | Driver                  | Bars from       | Side effects                         |
//! |-------------------------|-----------------|--------------------------------------|
//! | [`BacktestDriver`]      | a slice         | none, in-memory ledger               |
//! | [`LiveExecutionDriver`] | the broker      | orders, closes, stop moves, monitor  |

pub mod alerts;
pub mod backtest;
pub mod live;
pub mod reconciler;

pub use alerts::AlertLatch;
pub use backtest::{BacktestDriver, BacktestReport, RejectionBreakdown};
pub use live::{CycleOutcome, CycleSummary, LiveExecutionDriver, LiveSettings};
pub use reconciler::{BrokerReconciler, ReconciliationConflict, ReconciliationReport};
