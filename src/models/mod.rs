//! # models
//!
//! Plain data types shared by the engine, the store and both drivers.

pub mod bar;
pub mod position;
pub mod signal;
pub mod trade;

pub use bar::Bar;
pub use position::{GroupId, GroupStatus, LifecycleState, OrderTag, Position, PositionGroup};
pub use signal::{Direction, Regime, Signal};
pub use trade::{CloseReason, TradeRecord};
