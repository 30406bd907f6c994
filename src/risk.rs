//! # risk — pre-submission gate for new position groups
//!
//! Last check before the live driver sends a new group's orders to the broker.
//! It never touches groups that are already open: exits always run.
//!
//! ## Layers
//! 1. **Kill switch**       — manual (HTTP) or automatic
//! 2. **Cooldown**          — pause after a failed submission
//! 3. **Max groups/day**    — cap on groups opened per UTC day
//! 4. **Auto-kill**         — trips the kill switch after N failures in a row
//!
//! The check itself is read-only apart from the daily roll: a slot is taken by
//! [`RiskManager::record_group_opened`], so signals dropped after the check
//! (or groups where nothing filled) never count against the day.
//! Every method takes the caller's clock.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::env_or;

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct RiskConfig {
    /// New groups allowed per UTC day (0 = unlimited).
    pub max_groups_per_day: u32,
    /// Failed submissions in a row before auto-kill (0 = never).
    pub max_consecutive_failures: u32,
    pub cooldown_secs_after_failure: u64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_groups_per_day:          10,
            max_consecutive_failures:    3,
            cooldown_secs_after_failure: 300,
        }
    }
}

impl RiskConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_groups_per_day:          env_or("RISK_MAX_GROUPS_PER_DAY", d.max_groups_per_day),
            max_consecutive_failures:    env_or("RISK_MAX_CONSECUTIVE_FAILS", d.max_consecutive_failures),
            cooldown_secs_after_failure: env_or("RISK_COOLDOWN_SECS", d.cooldown_secs_after_failure),
        }
    }
}

// ─── Internal State ───────────────────────────────────────────────────────────

#[derive(Debug)]
struct RiskInner {
    is_killed:            bool,
    kill_reason:          Option<String>,
    groups_today:         u32,
    consecutive_failures: u32,
    last_failure_at:      Option<DateTime<Utc>>,
    last_group_at:        Option<DateTime<Utc>>,
    /// `None` until the first call sets the day.
    day:                  Option<NaiveDate>,
}

// ─── Status (for the monitor) ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct RiskStatus {
    pub is_killed:            bool,
    pub kill_reason:          Option<String>,
    pub groups_today:         u32,
    pub consecutive_failures: u32,
    pub last_group_at:        Option<DateTime<Utc>>,
    pub in_cooldown:          bool,
    pub cooldown_ends_at:     Option<DateTime<Utc>>,
    pub config:               RiskConfigSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskConfigSnapshot {
    pub max_groups_per_day:          u32,
    pub max_consecutive_failures:    u32,
    pub cooldown_secs_after_failure: u64,
}

// ─── Decision ─────────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
pub enum RiskDecision {
    Approved,
    Blocked(String),
}

// ─── Risk Manager ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct RiskManager {
    inner:  Arc<RwLock<RiskInner>>,
    config: Arc<RiskConfig>,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RiskInner {
                is_killed:            false,
                kill_reason:          None,
                groups_today:         0,
                consecutive_failures: 0,
                last_failure_at:      None,
                last_group_at:        None,
                day:                  None,
            })),
            config: Arc::new(config),
        }
    }

    fn roll_day(inner: &mut RiskInner, now: DateTime<Utc>) {
        let today = now.date_naive();
        match inner.day {
            Some(day) if day >= today => {}
            Some(_) => {
                inner.groups_today = 0;
                inner.day          = Some(today);
                info!(%today, "📅 Risk: daily counters reset");
            }
            None => inner.day = Some(today),
        }
    }

    fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.cooldown_secs_after_failure as i64)
    }

    // ─── Pre-Submission Check ─────────────────────────────────────────────────

    pub async fn pre_trade_check(&self, now: DateTime<Utc>) -> RiskDecision {
        let mut inner = self.inner.write().await;
        Self::roll_day(&mut inner, now);

        // [1] Kill switch
        if inner.is_killed {
            return RiskDecision::Blocked(format!(
                "Kill switch active: {}",
                inner.kill_reason.as_deref().unwrap_or("manual activation")
            ));
        }

        // [2] Cooldown after a failure
        if let Some(fail_time) = inner.last_failure_at {
            let elapsed  = now.signed_duration_since(fail_time);
            let cooldown = self.cooldown();
            if elapsed < cooldown {
                let remaining = (cooldown - elapsed).num_seconds();
                return RiskDecision::Blocked(format!(
                    "Cooldown: {remaining}s remaining after last failure"
                ));
            }
        }

        // [3] Max groups per day
        if self.config.max_groups_per_day > 0
            && inner.groups_today >= self.config.max_groups_per_day
        {
            return RiskDecision::Blocked(format!(
                "Daily group limit reached: {}/{}",
                inner.groups_today, self.config.max_groups_per_day
            ));
        }

        // [4] Consecutive failure auto-kill
        if self.config.max_consecutive_failures > 0
            && inner.consecutive_failures >= self.config.max_consecutive_failures
        {
            let reason = format!(
                "Auto-kill: {} consecutive submission failures",
                inner.consecutive_failures
            );
            inner.is_killed   = true;
            inner.kill_reason = Some(reason.clone());
            warn!("⛔ Risk auto-kill activated: {reason}");
            return RiskDecision::Blocked(reason);
        }

        RiskDecision::Approved
    }

    // ─── Submission Results ───────────────────────────────────────────────────

    /// At least one order of the group filled: takes a daily slot.
    pub async fn record_group_opened(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.write().await;
        Self::roll_day(&mut inner, now);
        inner.groups_today += 1;
        inner.last_group_at = Some(now);

        let prev = inner.consecutive_failures;
        inner.consecutive_failures = 0;
        if prev > 0 {
            info!("Risk: consecutive_failures reset (was {prev})");
        }
        info!(
            groups_today = inner.groups_today,
            max          = self.config.max_groups_per_day,
            "✅ Risk: group opened"
        );
    }

    /// No order of the group filled.
    pub async fn record_failure(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.write().await;
        inner.consecutive_failures += 1;
        inner.last_failure_at = Some(now);
        warn!(
            consecutive = inner.consecutive_failures,
            max         = self.config.max_consecutive_failures,
            "⚠️ Risk: submission failure recorded"
        );
    }

    // ─── Manual Controls ──────────────────────────────────────────────────────

    pub async fn kill(&self, reason: &str) {
        let mut inner = self.inner.write().await;
        inner.is_killed   = true;
        inner.kill_reason = Some(reason.to_string());
        warn!(reason, "⛔ KILL SWITCH ACTIVATED");
    }

    pub async fn rearm(&self) {
        let mut inner = self.inner.write().await;
        inner.is_killed            = false;
        inner.kill_reason          = None;
        inner.consecutive_failures = 0;
        inner.last_failure_at      = None;
        info!("✅ KILL SWITCH DEACTIVATED, new groups allowed again");
    }

    // ─── Status ───────────────────────────────────────────────────────────────

    /// Cooldown is judged against the wall clock, the monitor has no other.
    pub async fn status(&self) -> RiskStatus {
        self.status_at(Utc::now()).await
    }

    pub async fn status_at(&self, now: DateTime<Utc>) -> RiskStatus {
        let inner = self.inner.read().await;
        let cooldown_ends = inner.last_failure_at.map(|t| t + self.cooldown());
        let in_cooldown = cooldown_ends.map(|end| now < end).unwrap_or(false);

        RiskStatus {
            is_killed:            inner.is_killed,
            kill_reason:          inner.kill_reason.clone(),
            groups_today:         inner.groups_today,
            consecutive_failures: inner.consecutive_failures,
            last_group_at:        inner.last_group_at,
            in_cooldown,
            cooldown_ends_at:     if in_cooldown { cooldown_ends } else { None },
            config: RiskConfigSnapshot {
                max_groups_per_day:          self.config.max_groups_per_day,
                max_consecutive_failures:    self.config.max_consecutive_failures,
                cooldown_secs_after_failure: self.config.cooldown_secs_after_failure,
            },
        }
    }
}
