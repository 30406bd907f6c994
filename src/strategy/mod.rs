//! # strategy
//!
//! Signal sources plug into both drivers through [`SignalSource`]. A source
//! sees a bar window and lazily yields the signals it finds in it; it must be
//! causal (a signal on bar `i` may only depend on bars `..=i`) and
//! restartable (the same window always yields the same signals).

pub mod ma_cross;

pub use ma_cross::{MaCrossConfig, MaCrossSource};

use crate::models::{Bar, Signal};

pub trait SignalSource: Send + Sync {
    fn name(&self) -> &str;

    fn generate_signals<'a>(&'a self, bars: &'a [Bar]) -> Box<dyn Iterator<Item = Signal> + 'a>;
}
