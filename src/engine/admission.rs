//! # engine::admission
//!
//! **Signal admission gate** — the only door into the lifecycle manager.
//!
//! ## Checks (in order)
//! ```text
//! signal
//!   ├─ [1] Incomplete bar  → now − bar_open <  period        → reject
//!   ├─ [2] Stale bar       → now − bar_open >  1.5 × period  → reject
//!   └─ [3] Duplicate       → fingerprint already admitted    → reject
//!                             fingerprint = blake3(bar_open ⌊period⌋, direction, entry ⌊tick⌋)
//! ```
//!
//! Rejections are counted, not raised. The admitted set is keyed by group id
//! (a pure function of bot id + fingerprint) and forgets entries older than
//! seven days.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::models::{Direction, GroupId, Signal};

/// How long an admitted fingerprint is remembered.
pub const RETENTION_DAYS: i64 = 7;

// ─── Admission ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted { group_id: GroupId, fingerprint: String },
    RejectedDuplicate,
    RejectedIncompleteBar,
    RejectedStale,
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    pub accepted:       usize,
    pub duplicates:     usize,
    pub incomplete_bar: usize,
    pub stale:          usize,
}

// ─── Gate ─────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct SignalAdmissionGate {
    bot_id:     u32,
    bar_period: Duration,
    tick_size:  f64,
    /// group id → bar open time of the admitted signal
    seen:       HashMap<GroupId, DateTime<Utc>>,
    stats:      AdmissionStats,
}

impl SignalAdmissionGate {
    pub fn new(bot_id: u32, bar_period: Duration, tick_size: f64) -> Self {
        Self {
            bot_id,
            bar_period,
            tick_size,
            seen: HashMap::new(),
            stats: AdmissionStats::default(),
        }
    }

    /// Deterministic fingerprint of the economic event behind `signal`.
    pub fn fingerprint(&self, signal: &Signal) -> String {
        let bar_open = self.truncate_to_bar(signal.time);
        let ticks = (signal.entry_price / self.tick_size).round() as i64;
        let direction: u8 = match signal.direction {
            Direction::Buy  => 1,
            Direction::Sell => 2,
        };

        let mut hasher = blake3::Hasher::new();
        hasher.update(&bar_open.timestamp().to_le_bytes());
        hasher.update(&[direction]);
        hasher.update(&ticks.to_le_bytes());
        hasher.finalize().to_hex()[..32].to_string()
    }

    /// Group id the fingerprint maps to for this bot.
    pub fn group_id_for(&self, fingerprint: &str) -> GroupId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"group:");
        hasher.update(&self.bot_id.to_le_bytes());
        hasher.update(fingerprint.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest.as_bytes()[..16]);
        Uuid::from_bytes(bytes)
    }

    pub fn admit(&mut self, signal: &Signal, now: DateTime<Utc>) -> Admission {
        self.prune(now);

        let bar_open = self.truncate_to_bar(signal.time);
        let elapsed = now - bar_open;

        // ── [1] The reference bar must be finished ───────────────────────────
        if elapsed < self.bar_period {
            self.stats.incomplete_bar += 1;
            debug!(bar_open = %bar_open, %now, "signal rejected: bar still forming");
            return Admission::RejectedIncompleteBar;
        }

        // ── [2] ...but not long gone ─────────────────────────────────────────
        if elapsed > self.bar_period * 3 / 2 {
            self.stats.stale += 1;
            debug!(bar_open = %bar_open, %now, "signal rejected: stale");
            return Admission::RejectedStale;
        }

        // ── [3] Duplicate ─────────────────────────────────────────────────────
        let fingerprint = self.fingerprint(signal);
        let group_id = self.group_id_for(&fingerprint);
        if self.seen.contains_key(&group_id) {
            self.stats.duplicates += 1;
            debug!(%fingerprint, "signal rejected: duplicate");
            return Admission::RejectedDuplicate;
        }

        self.seen.insert(group_id, bar_open);
        self.stats.accepted += 1;
        Admission::Accepted { group_id, fingerprint }
    }

    /// Registers a group that already exists (store reload after restart).
    pub fn seed(&mut self, group_id: GroupId, at: DateTime<Utc>) {
        self.seen.entry(group_id).or_insert(at);
    }

    /// Drops admitted entries older than [`RETENTION_DAYS`].
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let horizon = now - Duration::days(RETENTION_DAYS);
        self.seen.retain(|_, at| *at >= horizon);
    }

    pub fn stats(&self) -> AdmissionStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn truncate_to_bar(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        let period = self.bar_period.num_seconds().max(1);
        let ts = time.timestamp();
        DateTime::from_timestamp(ts - ts.rem_euclid(period), 0).unwrap_or(time)
    }
}
