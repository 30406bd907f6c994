//! # driver::alerts
//!
//! Latched warnings: a condition is reported once when it appears and once
//! when it clears, however many cycles it lasts. Repeats in between are only
//! counted.

use std::collections::HashMap;

use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct AlertLatch {
    /// key → repeats suppressed since the alert was raised
    raised: HashMap<String, u64>,
}

impl AlertLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports `message` under `key` unless that key is already latched.
    /// Returns `true` when the alert was emitted.
    pub fn raise(&mut self, key: &str, message: &str) -> bool {
        match self.raised.get_mut(key) {
            Some(suppressed) => {
                *suppressed += 1;
                false
            }
            None => {
                warn!(key, "🚨 {message}");
                self.raised.insert(key.to_string(), 0);
                true
            }
        }
    }

    /// Releases `key`. Returns `true` if it was latched.
    pub fn clear(&mut self, key: &str) -> bool {
        match self.raised.remove(key) {
            Some(suppressed) => {
                info!(key, suppressed, "✅ condition cleared");
                true
            }
            None => false,
        }
    }

    pub fn is_raised(&self, key: &str) -> bool {
        self.raised.contains_key(key)
    }

    pub fn suppressed(&self, key: &str) -> u64 {
        self.raised.get(key).copied().unwrap_or(0)
    }
}
