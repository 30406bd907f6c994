//! # models::position
//!
//! Defines the **position group**, the set of up to three sibling positions
//! opened from one admitted signal, one per exit-ladder rung.
//!
//! ## Why a group and not one position?
//! The broker holds three independent orders (one per rung, each with its own
//! TP), but their fate is linked: TP1 arms the trailing stop for the other two,
//! and the timeout closes whatever is left. The group is the unit the
//! lifecycle manager reasons about; [`Position`] is the unit the broker sees.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::ladder::ExitLadder;
use crate::models::{Direction, Regime};

/// Opaque unique token of a group. Derived from the bot id and the signal
/// fingerprint, so the same signal always maps to the same id.
pub type GroupId = Uuid;

// ─── GroupStatus ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupStatus {
    Active,
    Closed,
}

/// Lifecycle state derived from the stored fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    /// Ladder armed, original stop in place.
    Open,
    /// TP1 fired; the rest rides a trailing stop.
    TrailingArmed,
    Closed,
}

// ─── Position ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Rung number, 1..=3.
    pub position_num: u8,
    /// Share of the group's original size.
    pub fraction: f64,
    /// Lots actually sent for this rung (rounded to the volume step).
    pub volume: f64,
    pub tp_price: f64,
    pub sl_price: f64,
    /// `true` once this position has been closed, for whatever reason.
    pub hit: bool,
    /// Broker ticket, known after the order was accepted. Always `None` in
    /// backtests.
    #[serde(default)]
    pub ticket: Option<u64>,
}

// ─── PositionGroup ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionGroup {
    pub group_id:     GroupId,
    pub bot_id:       u32,
    pub symbol:       String,
    pub trade_type:   Direction,
    pub entry_price:  f64,
    /// Stop-loss the signal came with. Individual positions may have moved
    /// theirs since (breakeven, trailing, operator override).
    pub stop_loss:    f64,
    pub regime:       Regime,
    /// Snapshot of the ladder in force when the group was created. A later
    /// config change or regime flip never alters a running group.
    pub ladder:       ExitLadder,
    pub created_at:   DateTime<Utc>,
    pub updated_at:   DateTime<Utc>,
    pub tp1_hit:      bool,
    pub tp1_close_price: Option<f64>,
    pub max_price_seen: f64,
    pub min_price_seen: f64,
    /// 0..=99, embedded in broker order tags.
    pub group_counter: u8,
    pub status:       GroupStatus,
    /// Last price the manager saw for this group (close of the last update).
    pub last_price:   f64,
    /// Close time of the last bar applied to this group. A bar is never
    /// applied twice, even when the driver replays history after a restart.
    #[serde(default)]
    pub last_bar_at:  Option<DateTime<Utc>>,
    pub source_tag:   String,
    pub positions:    Vec<Position>,
}

impl PositionGroup {
    pub fn state(&self) -> LifecycleState {
        match (self.status, self.tp1_hit) {
            (GroupStatus::Closed, _) => LifecycleState::Closed,
            (GroupStatus::Active, true) => LifecycleState::TrailingArmed,
            (GroupStatus::Active, false) => LifecycleState::Open,
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.status == GroupStatus::Active
    }

    pub fn position(&self, position_num: u8) -> Option<&Position> {
        self.positions.iter().find(|p| p.position_num == position_num)
    }

    pub fn position_mut(&mut self, position_num: u8) -> Option<&mut Position> {
        self.positions.iter_mut().find(|p| p.position_num == position_num)
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.iter().filter(|p| !p.hit)
    }

    /// Sum of fractions already closed.
    pub fn closed_fraction(&self) -> f64 {
        self.positions.iter().filter(|p| p.hit).map(|p| p.fraction).sum()
    }

    pub fn remaining_volume(&self) -> f64 {
        self.open_positions().map(|p| p.volume).sum()
    }

    /// Tag for the broker order of one rung.
    pub fn order_tag(&self, position_num: u8) -> OrderTag {
        OrderTag {
            bot_id:        self.bot_id,
            group_counter: self.group_counter,
            position_num,
        }
    }

    /// Records the TP1 fill and pulls every open stop to `breakeven`. A stop
    /// that is already tighter stays where it is.
    pub fn arm_trailing(&mut self, tp1_price: f64, breakeven: f64) {
        self.tp1_hit = true;
        self.tp1_close_price = Some(tp1_price);
        let direction = self.trade_type;
        for p in self.positions.iter_mut().filter(|p| !p.hit) {
            p.sl_price = direction.tighter_stop(p.sl_price, breakeven);
        }
    }

    /// Flips the group to CLOSED once every position is hit. Returns `true`
    /// on the transition.
    pub fn close_if_done(&mut self) -> bool {
        if self.is_active() && self.positions.iter().all(|p| p.hit) {
            self.status = GroupStatus::Closed;
            return true;
        }
        false
    }

    /// Unrealised profit of the open remainder at `price`, in price × lots.
    pub fn unrealised(&self, price: f64) -> f64 {
        let sign = self.trade_type.sign();
        self.open_positions()
            .map(|p| (price - self.entry_price) * sign * p.volume)
            .sum()
    }
}

// ─── OrderTag ─────────────────────────────────────────────────────────────────

/// Short numeric tag carried by every broker order we send.
///
/// Encoded into the MT5 magic number as
/// `base_magic + bot_id × 1000 + group_counter × 10 + position_num`, and into
/// the order comment as `LB{bot}-{counter}-{pos}`. Decoding the magic of a
/// broker position leads straight back to the group without a lookup table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderTag {
    pub bot_id:        u32,
    pub group_counter: u8,
    pub position_num:  u8,
}

impl OrderTag {
    pub fn magic(&self, base_magic: u64) -> u64 {
        base_magic
            + u64::from(self.bot_id) * 1000
            + u64::from(self.group_counter) * 10
            + u64::from(self.position_num)
    }

    /// Inverse of [`OrderTag::magic`]. `None` for foreign orders.
    pub fn from_magic(magic: u64, base_magic: u64, bot_id: u32) -> Option<Self> {
        let offset = base_magic + u64::from(bot_id) * 1000;
        let rest = magic.checked_sub(offset)?;
        if rest >= 1000 {
            return None;
        }
        let position_num = (rest % 10) as u8;
        if !(1..=3).contains(&position_num) {
            return None;
        }
        Some(Self {
            bot_id,
            group_counter: (rest / 10) as u8,
            position_num,
        })
    }

    pub fn comment(&self) -> String {
        format!("LB{}-{:02}-{}", self.bot_id, self.group_counter, self.position_num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_tag_magic_round_trip() {
        let tag = OrderTag { bot_id: 3, group_counter: 47, position_num: 2 };
        let magic = tag.magic(420_000);
        assert_eq!(magic, 420_000 + 3_000 + 470 + 2);
        assert_eq!(OrderTag::from_magic(magic, 420_000, 3), Some(tag));
        assert_eq!(tag.comment(), "LB3-47-2");
    }

    #[test]
    fn test_order_tag_rejects_foreign_magic() {
        // other bot
        assert_eq!(OrderTag::from_magic(420_000 + 4_000 + 11, 420_000, 3), None);
        // position 0 is not a rung
        assert_eq!(OrderTag::from_magic(420_000 + 3_000 + 50, 420_000, 3), None);
        // below base
        assert_eq!(OrderTag::from_magic(12, 420_000, 3), None);
    }
}
