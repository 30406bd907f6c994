//! # engine
//!
//! The deterministic core. Nothing in here performs I/O other than through the
//! injected [`crate::store::GroupStore`], and nothing reads the wall clock:
//! every operation takes `now` from its caller.

pub mod admission;
pub mod ladder;
pub mod lifecycle;
pub mod regime;

pub use admission::{Admission, AdmissionStats, SignalAdmissionGate};
pub use ladder::{ExitLadder, ExitLadderConfig, Rung};
pub use lifecycle::{CloseEvent, LevelOverride, ManagerSettings, PositionLifecycleManager};
pub use regime::RegimeClassifier;
