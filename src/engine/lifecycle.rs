//! # engine::lifecycle
//!
//! **Position lifecycle manager** — owns every position group of one bot and
//! is the only code that mutates them.
//!
//! ## Per-update order (identical for backtest and live)
//! ```text
//! update(high, low, close, now)
//!   ├─ [1] Timeout   now − created_at ≥ timeout   → close remainder @ close   TIMEOUT
//!   ├─ [2] Stops     low ≤ sl (BUY) / high ≥ sl   → fill @ sl                 SL | TRAILING_SL
//!   ├─ [3] Ladder    rung 1..3 reached            → fill @ tp                 TP1 | TP2 | TP3
//!   │                 └─ TP1 arms trailing: stops → breakeven + buffer
//!   ├─ [4] Extremes  max_seen / min_seen
//!   └─ [5] Trailing  (armed only) stop = tighter(stop, extreme ∓ trailing%)
//! ```
//!
//! Stops run before targets, so a bar that spans both resolves as a loss.
//! Every close is appended to the ledger *before* the group snapshot is saved;
//! the store replays the ledger if the process dies in between.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, InstrumentSpec};
use crate::engine::admission::SignalAdmissionGate;
use crate::engine::ladder::{ExitLadder, ExitLadderConfig};
use crate::error::EngineError;
use crate::models::{
    Bar, CloseReason, Direction, GroupId, GroupStatus, Position, PositionGroup, Signal,
    TradeRecord,
};
use crate::store::GroupStore;

const MAX_GROUP_COUNTER: u8 = 100;
const FRACTION_TOLERANCE: f64 = 1e-9;

// ─── Settings ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub bot_id:     u32,
    pub symbol:     String,
    pub instrument: InstrumentSpec,
    pub ladders:    ExitLadderConfig,
    pub bar_period: Duration,
}

impl ManagerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            bot_id:     config.bot_id,
            symbol:     config.symbol.clone(),
            instrument: config.instrument,
            ladders:    config.ladder,
            bar_period: config.bar_period,
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

// ─── Outputs ──────────────────────────────────────────────────────────────────

/// One position closed by the manager. The driver turns it into a broker
/// close order (live) or nothing (backtest).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CloseEvent {
    pub group_id:     GroupId,
    pub position_num: u8,
    pub ticket:       Option<u64>,
    pub volume:       f64,
    pub price:        f64,
    pub reason:       CloseReason,
    /// `true` when this close finished the group.
    pub group_closed: bool,
    pub record:       TradeRecord,
}

/// Broker-side SL/TP that replaced the local levels of one position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelOverride {
    pub group_id:     GroupId,
    pub position_num: u8,
    pub old_sl:       f64,
    pub new_sl:       f64,
    pub old_tp:       f64,
    pub new_tp:       f64,
}

// ─── Manager ──────────────────────────────────────────────────────────────────

pub struct PositionLifecycleManager<S: GroupStore> {
    store:    S,
    settings: ManagerSettings,
}

impl<S: GroupStore> PositionLifecycleManager<S> {
    pub fn new(store: S, settings: ManagerSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn group(&self, group_id: GroupId) -> Result<PositionGroup, EngineError> {
        self.store
            .load(group_id)?
            .ok_or(EngineError::GroupNotFound(group_id))
    }

    pub fn active_groups(&self) -> Result<Vec<PositionGroup>, EngineError> {
        Ok(self.store.list_active()?)
    }

    pub fn all_groups(&self) -> Result<Vec<PositionGroup>, EngineError> {
        Ok(self.store.list_groups()?)
    }

    pub fn trade_records(&self) -> Result<Vec<TradeRecord>, EngineError> {
        Ok(self.store.trade_records()?)
    }

    /// Removes CLOSED groups from the store and hands them back.
    pub fn archive_closed(&mut self) -> Result<Vec<PositionGroup>, EngineError> {
        Ok(self.store.archive_closed()?)
    }

    /// Registers every known group with the admission gate so a restart
    /// cannot admit the same signal twice.
    pub fn seed_gate(&self, gate: &mut SignalAdmissionGate) -> Result<(), EngineError> {
        for group in self.store.list_groups()? {
            gate.seed(group.group_id, group.created_at);
        }
        for record in self.store.trade_records()? {
            gate.seed(record.position_group_id, record.open_time);
        }
        Ok(())
    }

    // ─── Creation ─────────────────────────────────────────────────────────────

    /// Creates and persists the group for an admitted signal.
    pub fn on_admitted_signal(
        &mut self,
        signal: &Signal,
        group_id: GroupId,
        now: DateTime<Utc>,
    ) -> Result<PositionGroup, EngineError> {
        if self.store.load(group_id)?.is_some() {
            return Err(EngineError::InvariantViolation(format!(
                "group {group_id} admitted twice"
            )));
        }
        let group = self.plan_group(signal, group_id, now)?;

        self.store.save(&group)?;
        info!(
            group_id  = %group.group_id,
            counter   = group.group_counter,
            direction = %group.trade_type,
            regime    = %group.regime,
            entry     = group.entry_price,
            sl        = group.stop_loss,
            "📥 [MANAGER] group opened"
        );
        Ok(group)
    }

    /// Builds the group `on_admitted_signal` would open, without saving it.
    /// Fails with `InvalidSignal` when the levels are unusable.
    pub fn plan_group(
        &self,
        signal: &Signal,
        group_id: GroupId,
        now: DateTime<Utc>,
    ) -> Result<PositionGroup, EngineError> {
        let regime = signal.regime.ok_or_else(|| {
            EngineError::InvariantViolation("signal reached the manager unclassified".into())
        })?;

        let inst = self.settings.instrument;
        let entry = inst.round_price(signal.entry_price);
        let stop = inst.round_price(signal.stop_loss);
        if !(entry > 0.0 && entry.is_finite() && stop > 0.0 && stop.is_finite()) {
            return Err(EngineError::InvalidSignal(format!(
                "non-positive levels entry={entry} sl={stop}"
            )));
        }

        let ladder: ExitLadder = *self.settings.ladders.for_regime(regime);
        let direction = signal.direction;
        let volumes = ladder.split_volume(&inst)?;

        let positions: Vec<Position> = (0..3)
            .map(|i| Position {
                position_num: i as u8 + 1,
                fraction:     ladder.rungs[i].fraction,
                volume:       volumes[i],
                tp_price:     inst.round_price(ladder.tp_price(entry, direction, i)),
                sl_price:     stop,
                hit:          false,
                ticket:       None,
            })
            .collect();

        // BUY: sl < entry < tp, SELL mirrored
        let sign = direction.sign();
        let protective = (entry - stop) * sign > 0.0;
        let targets_beyond = positions.iter().all(|p| (p.tp_price - entry) * sign > 0.0);
        if !(protective && targets_beyond) {
            return Err(EngineError::InvalidSignal(format!(
                "{direction} entry={entry} sl={stop}: stop must sit on the protective side"
            )));
        }

        Ok(PositionGroup {
            group_id,
            bot_id:          self.settings.bot_id,
            symbol:          self.settings.symbol.clone(),
            trade_type:      direction,
            entry_price:     entry,
            stop_loss:       stop,
            regime,
            ladder,
            created_at:      now,
            updated_at:      now,
            tp1_hit:         false,
            tp1_close_price: None,
            max_price_seen:  entry,
            min_price_seen:  entry,
            group_counter:   self.next_group_counter()?,
            status:          GroupStatus::Active,
            last_price:      entry,
            last_bar_at:     None,
            source_tag:      signal.source_tag.clone(),
            positions,
        })
    }

    /// Smallest counter after the most recent group's counter that no ACTIVE
    /// group holds, wrapping at 100.
    pub fn next_group_counter(&self) -> Result<u8, EngineError> {
        let groups = self.store.list_groups()?;
        let in_use: HashSet<u8> = groups
            .iter()
            .filter(|g| g.is_active())
            .map(|g| g.group_counter)
            .collect();
        let start = groups
            .last()
            .map(|g| (g.group_counter + 1) % MAX_GROUP_COUNTER)
            .unwrap_or(0);

        (0..MAX_GROUP_COUNTER)
            .map(|k| (start + k) % MAX_GROUP_COUNTER)
            .find(|c| !in_use.contains(c))
            .ok_or(EngineError::CounterExhausted)
    }

    // ─── Price updates ────────────────────────────────────────────────────────

    /// Applies one completed bar to every active group created before the bar
    /// closed. `now` is the bar's close time, never the wall clock.
    pub fn on_bar(&mut self, bar: &Bar) -> Result<Vec<CloseEvent>, EngineError> {
        let mut events = Vec::new();
        for mut group in self.store.list_active()? {
            events.extend(self.apply_bar(&mut group, bar)?);
        }
        Ok(events)
    }

    /// Brings one group up to date with `bars`, exactly as `on_bar` would
    /// have. Bars the group already saw are skipped, so a later `on_bar`
    /// over the same bars leaves it alone.
    pub fn catch_up(&mut self, group_id: GroupId, bars: &[Bar]) -> Result<Vec<CloseEvent>, EngineError> {
        let mut group = self.group(group_id)?;
        let mut events = Vec::new();
        for bar in bars {
            events.extend(self.apply_bar(&mut group, bar)?);
        }
        Ok(events)
    }

    fn apply_bar(&mut self, group: &mut PositionGroup, bar: &Bar) -> Result<Vec<CloseEvent>, EngineError> {
        let now = bar.close_time(self.settings.bar_period);
        if !group.is_active() || group.created_at >= now || group.last_bar_at.is_some_and(|t| t >= now) {
            return Ok(Vec::new());
        }
        group.last_bar_at = Some(now);
        self.advance(group, bar.high, bar.low, bar.close, now)
    }

    pub fn on_price_update(
        &mut self,
        group_id: GroupId,
        high: f64,
        low: f64,
        close: f64,
        now: DateTime<Utc>,
    ) -> Result<Vec<CloseEvent>, EngineError> {
        let mut group = self.group(group_id)?;
        if !group.is_active() {
            return Ok(Vec::new());
        }
        self.advance(&mut group, high, low, close, now)
    }

    fn advance(
        &mut self,
        group: &mut PositionGroup,
        high: f64,
        low: f64,
        close: f64,
        now: DateTime<Utc>,
    ) -> Result<Vec<CloseEvent>, EngineError> {
        let direction = group.trade_type;
        let ladder = group.ladder;
        let inst = self.settings.instrument;
        let mut events = Vec::new();

        // ── 1. Timeout ────────────────────────────────────────────────────────
        if now - group.created_at >= ladder.timeout() {
            for num in open_nums(group) {
                events.push(self.close_position(group, num, close, now, CloseReason::Timeout)?);
            }
            info!(group_id = %group.group_id, "⏰ [MANAGER] timeout, remainder closed");
            return self.finish(group, close, now, events);
        }

        // ── 2. Stops ──────────────────────────────────────────────────────────
        let stop_reason = if group.tp1_hit { CloseReason::TrailingSl } else { CloseReason::StopLoss };
        for num in open_nums(group) {
            let sl = position_of(group, num)?.sl_price;
            if direction.stop_reached(sl, high, low) {
                events.push(self.close_position(group, num, sl, now, stop_reason)?);
            }
        }

        // ── 3. Ladder ─────────────────────────────────────────────────────────
        for num in open_nums(group) {
            let tp = position_of(group, num)?.tp_price;
            if !direction.target_reached(tp, high, low) {
                continue;
            }
            events.push(self.close_position(group, num, tp, now, CloseReason::take_profit(num))?);
            if num == 1 {
                let breakeven = inst.round_price(ladder.breakeven_stop(group.entry_price, direction));
                group.arm_trailing(tp, breakeven);
                info!(group_id = %group.group_id, breakeven, "🎯 [MANAGER] TP1 hit, trailing armed");
            }
        }

        // ── 4. Extremes ───────────────────────────────────────────────────────
        group.max_price_seen = group.max_price_seen.max(high);
        group.min_price_seen = group.min_price_seen.min(low);

        // ── 5. Trailing ratchet ───────────────────────────────────────────────
        ratchet_trailing(group, &inst);

        self.finish(group, close, now, events)
    }

    /// Stamps the update, settles CLOSED status and saves the snapshot.
    fn finish(
        &mut self,
        group: &mut PositionGroup,
        price: f64,
        now: DateTime<Utc>,
        mut events: Vec<CloseEvent>,
    ) -> Result<Vec<CloseEvent>, EngineError> {
        group.last_price = price;
        if now > group.updated_at {
            group.updated_at = now;
        }

        if group.close_if_done() {
            let fired = group.closed_fraction();
            if (fired - 1.0).abs() > FRACTION_TOLERANCE {
                return Err(EngineError::InvariantViolation(format!(
                    "group {} closed with fired fractions summing to {fired}",
                    group.group_id
                )));
            }
            if let Some(last) = events.last_mut() {
                last.group_closed = true;
            }
            info!(group_id = %group.group_id, "🏁 [MANAGER] group closed");
        }

        self.store.save(group)?;
        Ok(events)
    }

    /// Writes the ledger row, then marks the position hit.
    fn close_position(
        &mut self,
        group: &mut PositionGroup,
        position_num: u8,
        price: f64,
        now: DateTime<Utc>,
        reason: CloseReason,
    ) -> Result<CloseEvent, EngineError> {
        let position = position_of(group, position_num)?;
        if position.hit {
            return Err(EngineError::InvariantViolation(format!(
                "position {position_num} of group {} closed twice",
                group.group_id
            )));
        }

        let record = TradeRecord::from_close(group, position, price, now, reason)?;
        self.store.append_trade_record(&record)?;

        let ticket = position.ticket;
        let volume = position.volume;
        if let Some(p) = group.position_mut(position_num) {
            p.hit = true;
        }

        info!(
            group_id = %group.group_id,
            pos      = position_num,
            %reason,
            price,
            profit   = record.profit,
            "💰 [MANAGER] position closed"
        );

        Ok(CloseEvent {
            group_id: group.group_id,
            position_num,
            ticket,
            volume,
            price,
            reason,
            group_closed: false,
            record,
        })
    }

    // ─── Reconciliation hooks ─────────────────────────────────────────────────

    /// Finalizes a position the broker no longer holds. The close is booked
    /// at the last price seen; the reason is inferred from where that price
    /// sits relative to the position's levels. Returns `None` when the
    /// position was already closed locally.
    pub fn on_external_close(
        &mut self,
        group_id: GroupId,
        position_num: u8,
        now: DateTime<Utc>,
    ) -> Result<Option<CloseEvent>, EngineError> {
        let mut group = self.group(group_id)?;
        let position = position_of(&group, position_num)?;
        if position.hit {
            return Ok(None);
        }

        let price = group.last_price;
        let direction = group.trade_type;
        let reason = if direction.target_reached(position.tp_price, price, price) {
            CloseReason::take_profit(position_num)
        } else if direction.stop_reached(position.sl_price, price, price) {
            if group.tp1_hit { CloseReason::TrailingSl } else { CloseReason::StopLoss }
        } else {
            CloseReason::External
        };

        let time = now.max(group.created_at);
        let event = self.close_position(&mut group, position_num, price, time, reason)?;
        if reason == CloseReason::Tp1 {
            let breakeven = self
                .settings
                .instrument
                .round_price(group.ladder.breakeven_stop(group.entry_price, direction));
            group.arm_trailing(price, breakeven);
        }
        warn!(group_id = %group_id, pos = position_num, %reason, "🔄 [MANAGER] closed outside the engine");

        let mut events = self.finish(&mut group, price, time, vec![event])?;
        Ok(events.pop())
    }

    /// Books a position whose order never filled as EXTERNAL at entry (zero
    /// profit).
    pub fn finalize_unfilled(
        &mut self,
        group_id: GroupId,
        position_num: u8,
        now: DateTime<Utc>,
    ) -> Result<Option<CloseEvent>, EngineError> {
        let mut group = self.group(group_id)?;
        let position = position_of(&group, position_num)?;
        if position.hit {
            return Ok(None);
        }
        if position.ticket.is_some() {
            return Err(EngineError::InvariantViolation(format!(
                "position {position_num} of group {group_id} has a ticket, it did fill"
            )));
        }

        let entry = group.entry_price;
        let time = now.max(group.created_at);
        let event = self.close_position(&mut group, position_num, entry, time, CloseReason::External)?;
        let last_price = group.last_price;
        let mut events = self.finish(&mut group, last_price, time, vec![event])?;
        Ok(events.pop())
    }

    /// Adopts the broker's SL/TP when they differ from the local ones by more
    /// than one tick. Zero on the broker side means "not set" and is
    /// ignored. No ledger row is written.
    pub fn apply_broker_levels(
        &mut self,
        group_id: GroupId,
        position_num: u8,
        broker_sl: f64,
        broker_tp: f64,
    ) -> Result<Option<LevelOverride>, EngineError> {
        let mut group = self.group(group_id)?;
        let tolerance = self.settings.instrument.tick_size * (1.0 + 1e-6);
        let position = group
            .position_mut(position_num)
            .ok_or_else(|| missing_position(group_id, position_num))?;
        if position.hit {
            return Ok(None);
        }

        let differs = |broker: f64, local: f64| broker > 0.0 && (broker - local).abs() > tolerance;
        let sl_changed = differs(broker_sl, position.sl_price);
        let tp_changed = differs(broker_tp, position.tp_price);
        if !(sl_changed || tp_changed) {
            return Ok(None);
        }

        let over = LevelOverride {
            group_id,
            position_num,
            old_sl: position.sl_price,
            new_sl: if sl_changed { broker_sl } else { position.sl_price },
            old_tp: position.tp_price,
            new_tp: if tp_changed { broker_tp } else { position.tp_price },
        };
        position.sl_price = over.new_sl;
        position.tp_price = over.new_tp;

        info!(
            group_id = %group_id,
            pos      = position_num,
            old_sl   = over.old_sl,
            new_sl   = over.new_sl,
            old_tp   = over.old_tp,
            new_tp   = over.new_tp,
            "📝 [MANAGER] broker levels adopted"
        );
        self.store.save(&group)?;
        Ok(Some(over))
    }

    pub fn attach_ticket(
        &mut self,
        group_id: GroupId,
        position_num: u8,
        ticket: u64,
    ) -> Result<(), EngineError> {
        let mut group = self.group(group_id)?;
        let position = group
            .position_mut(position_num)
            .ok_or_else(|| missing_position(group_id, position_num))?;
        if position.ticket == Some(ticket) {
            return Ok(());
        }
        position.ticket = Some(ticket);
        self.store.save(&group)?;
        Ok(())
    }

    /// Deletes a group none of whose orders ever filled.
    pub fn discard_unfilled(&mut self, group_id: GroupId) -> Result<(), EngineError> {
        let group = self.group(group_id)?;
        if group.positions.iter().any(|p| p.ticket.is_some() || p.hit) {
            return Err(EngineError::InvariantViolation(format!(
                "group {group_id} has fills and cannot be discarded"
            )));
        }
        self.store.remove(group_id)?;
        warn!(group_id = %group_id, "🗑️ [MANAGER] unfilled group discarded");
        Ok(())
    }
}

fn open_nums(group: &PositionGroup) -> Vec<u8> {
    group.open_positions().map(|p| p.position_num).collect()
}

fn position_of(group: &PositionGroup, position_num: u8) -> Result<&Position, EngineError> {
    group
        .position(position_num)
        .ok_or_else(|| missing_position(group.group_id, position_num))
}

fn missing_position(group_id: GroupId, position_num: u8) -> EngineError {
    EngineError::InvariantViolation(format!("group {group_id} has no position {position_num}"))
}

/// Tightens every open stop toward the trailing level off the best price
/// seen so far. Does nothing before TP1 or once the group is closed.
pub(crate) fn ratchet_trailing(group: &mut PositionGroup, inst: &InstrumentSpec) {
    if !(group.tp1_hit && group.is_active()) {
        return;
    }
    let direction = group.trade_type;
    let extreme = match direction {
        Direction::Buy  => group.max_price_seen,
        Direction::Sell => group.min_price_seen,
    };
    let trail = inst.round_price(group.ladder.trailing_stop(extreme, direction));
    for p in group.positions.iter_mut().filter(|p| !p.hit) {
        let next = direction.tighter_stop(p.sl_price, trail);
        if next != p.sl_price {
            debug!(group_id = %group.group_id, pos = p.position_num, from = p.sl_price, to = next, "trailing stop ratcheted");
            p.sl_price = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Regime;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
    }

    fn make_manager() -> PositionLifecycleManager<MemoryStore> {
        PositionLifecycleManager::new(MemoryStore::new(), ManagerSettings::default())
    }

    fn open(m: &mut PositionLifecycleManager<MemoryStore>, id: u128, dir: Direction, sl: f64) -> GroupId {
        let signal = Signal::new(t0(), dir, 2000.0, sl, "test").with_regime(Regime::Range);
        m.on_admitted_signal(&signal, Uuid::from_u128(id), t0()).unwrap().group_id
    }

    fn bar_at(hours: i64, high: f64, low: f64, close: f64) -> Bar {
        // opens at t0 + hours, closes one hour later
        Bar { time: t0() + Duration::hours(hours), open: close, high, low, close, volume: 0.0 }
    }

    #[test]
    fn test_group_creation_range_ladder() {
        let mut m = make_manager();
        let gid = open(&mut m, 1, Direction::Buy, 1980.0);
        let g = m.group(gid).unwrap();

        let tps: Vec<f64> = g.positions.iter().map(|p| p.tp_price).collect();
        let vols: Vec<f64> = g.positions.iter().map(|p| p.volume).collect();
        assert!((tps[0] - 2020.0).abs() < 1e-9 && (tps[1] - 2035.0).abs() < 1e-9 && (tps[2] - 2050.0).abs() < 1e-9);
        assert!((vols[0] - 0.05).abs() < 1e-9 && (vols[1] - 0.03).abs() < 1e-9 && (vols[2] - 0.02).abs() < 1e-9);
        assert!(g.positions.iter().all(|p| p.sl_price < g.entry_price && p.tp_price > g.entry_price));
        assert_eq!(g.group_counter, 0);
        assert_eq!(g.state(), crate::models::LifecycleState::Open);
    }

    #[test]
    fn test_wrong_side_stop_rejected() {
        let mut m = make_manager();
        let signal = Signal::new(t0(), Direction::Buy, 2000.0, 2010.0, "test").with_regime(Regime::Range);
        let err = m.on_admitted_signal(&signal, Uuid::from_u128(1), t0()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidSignal(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_tp1_then_trailing_stop_scenario() {
        let mut m = make_manager();
        let gid = open(&mut m, 1, Direction::Buy, 1980.0);

        // bar reaches 2020: TP1 fills, trailing armed
        let events = m.on_bar(&bar_at(0, 2020.0, 1995.0, 2015.0)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, CloseReason::Tp1);
        assert_eq!(events[0].price, 2020.0);

        let g = m.group(gid).unwrap();
        assert!(g.tp1_hit);
        assert_eq!(g.tp1_close_price, Some(2020.0));
        assert_eq!(g.state(), crate::models::LifecycleState::TrailingArmed);
        // breakeven 2001 was overtaken by the trail 2020 × 0.994
        assert!((g.positions[1].sl_price - 2007.88).abs() < 1e-6);

        // next bar trades through the trailing stop
        let events = m.on_bar(&bar_at(1, 2012.0, 2005.0, 2006.0)).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.reason == CloseReason::TrailingSl));
        assert!(events.iter().all(|e| (e.price - 2007.88).abs() < 1e-6));
        assert!(events[1].group_closed);

        let g = m.group(gid).unwrap();
        assert_eq!(g.status, GroupStatus::Closed);
        assert!((g.closed_fraction() - 1.0).abs() < 1e-9);
        assert_eq!(m.trade_records().unwrap().len(), 3);
    }

    #[test]
    fn test_sell_mirror() {
        let mut m = make_manager();
        let gid = open(&mut m, 1, Direction::Sell, 2020.0);
        let events = m.on_bar(&bar_at(0, 2004.0, 1980.0, 1985.0)).unwrap();
        assert_eq!(events[0].reason, CloseReason::Tp1);

        let g = m.group(gid).unwrap();
        // 1980 × 1.006
        assert!((g.positions[1].sl_price - 1991.88).abs() < 1e-6);
        assert!(g.min_price_seen <= g.entry_price);
        assert!(events[0].record.profit > 0.0);
    }

    #[test]
    fn test_gap_bar_resolves_stop_first() {
        let mut m = make_manager();
        let gid = open(&mut m, 1, Direction::Buy, 1980.0);
        let events = m.on_bar(&bar_at(0, 2060.0, 1970.0, 2000.0)).unwrap();

        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.reason == CloseReason::StopLoss && e.price == 1980.0));
        assert!(!m.group(gid).unwrap().tp1_hit);
    }

    #[test]
    fn test_timeout_closes_remainder_at_close() {
        let mut m = make_manager();
        let gid = open(&mut m, 1, Direction::Buy, 1980.0);
        let mut all = Vec::new();
        for h in 0..30 {
            all.extend(m.on_bar(&bar_at(h, 2005.0, 1995.0, 2001.0)).unwrap());
            if !m.group(gid).unwrap().is_active() {
                break;
            }
        }
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|e| e.reason == CloseReason::Timeout && e.price == 2001.0));
        let closed_at = all[0].record.close_time;
        assert!(closed_at - t0() <= Duration::hours(24) + Duration::hours(1));
    }

    #[test]
    fn test_timeout_beats_target_on_the_same_bar() {
        let mut m = make_manager();
        let gid = open(&mut m, 1, Direction::Buy, 1980.0);
        for h in 0..23 {
            assert!(m.on_bar(&bar_at(h, 2005.0, 1995.0, 2001.0)).unwrap().is_empty());
        }

        // closes exactly at the 24h horizon and trades through every TP
        let events = m.on_bar(&bar_at(23, 2060.0, 1999.0, 2040.0)).unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.reason == CloseReason::Timeout && e.price == 2040.0));
        assert!(!m.group(gid).unwrap().tp1_hit);
    }

    #[test]
    fn test_sell_original_stop_hit_before_tp1() {
        let mut m = make_manager();
        let gid = open(&mut m, 1, Direction::Sell, 2020.0);
        let events = m.on_bar(&bar_at(0, 2021.0, 1995.0, 2018.0)).unwrap();

        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.reason == CloseReason::StopLoss && e.price == 2020.0));
        assert!(events.iter().all(|e| e.record.profit < 0.0));
        assert_eq!(m.group(gid).unwrap().status, GroupStatus::Closed);
    }

    #[test]
    fn test_catch_up_matches_on_bar() {
        let bars = [bar_at(0, 2020.0, 1995.0, 2015.0), bar_at(1, 2012.0, 2005.0, 2006.0)];

        let mut online = make_manager();
        open(&mut online, 1, Direction::Buy, 1980.0);
        let mut expected = Vec::new();
        for bar in &bars {
            expected.extend(online.on_bar(bar).unwrap());
        }

        let mut m = make_manager();
        let gid = open(&mut m, 1, Direction::Buy, 1980.0);
        let events = m.catch_up(gid, &bars[..1]).unwrap();
        assert_eq!(events.len(), 1);
        assert!((m.group(gid).unwrap().positions[2].sl_price - 2007.88).abs() < 1e-6);

        // the first bar is already accounted for and must not be re-applied
        let mut rest = m.on_bar(&bars[0]).unwrap();
        rest.extend(m.on_bar(&bars[1]).unwrap());
        let all: Vec<_> = events.into_iter().chain(rest).map(|e| (e.reason, e.price)).collect();
        let want: Vec<_> = expected.into_iter().map(|e| (e.reason, e.price)).collect();
        assert_eq!(all, want);
    }

    #[test]
    fn test_plan_group_saves_nothing() {
        let mut m = make_manager();
        let signal = Signal::new(t0(), Direction::Buy, 2000.0, 1980.0, "test").with_regime(Regime::Range);
        let planned = m.plan_group(&signal, Uuid::from_u128(1), t0()).unwrap();
        assert!(m.all_groups().unwrap().is_empty());

        let opened = m.on_admitted_signal(&signal, Uuid::from_u128(1), t0()).unwrap();
        assert_eq!(planned, opened);
    }

    #[test]
    fn test_group_created_at_bar_close_skips_that_bar() {
        let mut m = make_manager();
        let signal = Signal::new(t0(), Direction::Buy, 2000.0, 1980.0, "test").with_regime(Regime::Range);
        let created = t0() + Duration::hours(1);
        m.on_admitted_signal(&signal, Uuid::from_u128(1), created).unwrap();

        // the signal bar itself closes at `created`
        assert!(m.on_bar(&bar_at(0, 2100.0, 1900.0, 2000.0)).unwrap().is_empty());
        assert_eq!(m.on_bar(&bar_at(1, 2020.0, 1999.0, 2010.0)).unwrap().len(), 1);
    }

    #[test]
    fn test_replayed_bar_is_ignored() {
        let mut m = make_manager();
        let gid = open(&mut m, 1, Direction::Buy, 1980.0);
        let bar = bar_at(0, 2020.0, 1995.0, 2015.0);
        assert_eq!(m.on_bar(&bar).unwrap().len(), 1);

        // re-applying the same bar against the armed trail would stop out
        // the remainder at 2007.88
        assert!(m.on_bar(&bar).unwrap().is_empty());
        let g = m.group(gid).unwrap();
        assert_eq!(g.open_positions().count(), 2);
        assert_eq!(g.last_bar_at, Some(bar.close_time(Duration::hours(1))));
    }

    #[test]
    fn test_external_close_infers_reason() {
        let mut m = make_manager();
        let gid = open(&mut m, 1, Direction::Buy, 1980.0);
        m.on_bar(&bar_at(0, 2021.0, 1999.0, 2021.0)).unwrap();

        // position 2 vanished at the broker while price sits between levels
        let event = m.on_external_close(gid, 2, t0() + Duration::hours(2)).unwrap().unwrap();
        assert_eq!(event.reason, CloseReason::External);
        assert_eq!(event.price, 2021.0);

        // already closed locally: nothing to do
        assert!(m.on_external_close(gid, 1, t0() + Duration::hours(2)).unwrap().is_none());
    }

    #[test]
    fn test_external_close_past_tp_counts_as_rung() {
        let mut m = make_manager();
        let gid = open(&mut m, 1, Direction::Buy, 1980.0);
        m.on_price_update(gid, 2019.0, 2000.0, 2019.0, t0() + Duration::minutes(30)).unwrap();
        let mut g = m.group(gid).unwrap();
        g.last_price = 2025.0;
        m.store.save(&g).unwrap();

        let event = m.on_external_close(gid, 1, t0() + Duration::hours(1)).unwrap().unwrap();
        assert_eq!(event.reason, CloseReason::Tp1);
        assert!(m.group(gid).unwrap().tp1_hit);
    }

    #[test]
    fn test_closing_twice_is_invariant_violation() {
        let mut m = make_manager();
        let gid = open(&mut m, 1, Direction::Buy, 1980.0);
        let mut group = m.group(gid).unwrap();
        m.close_position(&mut group, 1, 2020.0, t0() + Duration::hours(1), CloseReason::Tp1).unwrap();
        let err = m.close_position(&mut group, 1, 2020.0, t0() + Duration::hours(1), CloseReason::Tp1).unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));
    }

    #[test]
    fn test_broker_tp_override_writes_no_record() {
        let mut m = make_manager();
        let gid = open(&mut m, 1, Direction::Buy, 1980.0);
        let over = m.apply_broker_levels(gid, 1, 1980.0, 2030.0).unwrap().unwrap();
        assert_eq!(over.old_tp, 2020.0);
        assert_eq!(m.group(gid).unwrap().positions[0].tp_price, 2030.0);
        assert!(m.trade_records().unwrap().is_empty());

        // identical levels, a one-tick difference and broker zeros are no-ops
        assert!(m.apply_broker_levels(gid, 1, 1980.0, 2030.0).unwrap().is_none());
        assert!(m.apply_broker_levels(gid, 1, 1980.01, 2029.99).unwrap().is_none());
        assert_eq!(m.group(gid).unwrap().positions[0].sl_price, 1980.0);
        assert!(m.apply_broker_levels(gid, 1, 0.0, 0.0).unwrap().is_none());

        // the old target no longer fires
        assert!(m.on_bar(&bar_at(0, 2025.0, 1999.0, 2024.0)).unwrap().is_empty());
    }

    #[test]
    fn test_counter_skips_active_and_wraps() {
        let mut m = make_manager();
        for i in 0..3 {
            let signal = Signal::new(t0(), Direction::Buy, 2000.0, 1980.0, "test").with_regime(Regime::Range);
            m.on_admitted_signal(&signal, Uuid::from_u128(i + 1), t0() + Duration::minutes(i as i64)).unwrap();
        }
        let counters: Vec<u8> = m.all_groups().unwrap().iter().map(|g| g.group_counter).collect();
        assert_eq!(counters, vec![0, 1, 2]);

        // latest group holds 99: the search wraps past 0 and 1, both active
        let mut last = m.all_groups().unwrap().pop().unwrap();
        last.group_counter = 99;
        m.store.save(&last).unwrap();
        assert_eq!(m.next_group_counter().unwrap(), 2);
    }

    #[test]
    fn test_counter_exhausted() {
        let mut m = make_manager();
        let template = {
            let gid = open(&mut m, 1000, Direction::Buy, 1980.0);
            m.group(gid).unwrap()
        };
        for c in 0..100u8 {
            let mut g = template.clone();
            g.group_id = Uuid::from_u128(u128::from(c) + 1);
            g.group_counter = c;
            m.store.save(&g).unwrap();
        }
        assert!(matches!(m.next_group_counter(), Err(EngineError::CounterExhausted)));
    }

    #[test]
    fn test_unfilled_handling() {
        let mut m = make_manager();
        let gid = open(&mut m, 1, Direction::Buy, 1980.0);
        m.attach_ticket(gid, 1, 5001).unwrap();
        assert!(m.discard_unfilled(gid).is_err());

        let e2 = m.finalize_unfilled(gid, 2, t0()).unwrap().unwrap();
        assert_eq!(e2.reason, CloseReason::External);
        assert_eq!(e2.record.profit, 0.0);
        assert!(m.finalize_unfilled(gid, 1, t0()).is_err());

        let other = open(&mut m, 2, Direction::Buy, 1980.0);
        m.discard_unfilled(other).unwrap();
        assert!(matches!(m.group(other), Err(EngineError::GroupNotFound(_))));
    }

    #[test]
    fn test_trend_volumes_sum_to_lot() {
        let mut m = make_manager();
        let signal = Signal::new(t0(), Direction::Buy, 2000.0, 1980.0, "test").with_regime(Regime::Trend);
        let g = m.on_admitted_signal(&signal, Uuid::from_u128(9), t0()).unwrap();
        let total: f64 = g.positions.iter().map(|p| p.volume).sum();
        assert!((total - 0.10).abs() < 1e-9);
        assert_eq!(g.ladder, ExitLadder::trend_default());
    }
}
