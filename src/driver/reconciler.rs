//! # driver::reconciler
//!
//! **Broker reconciliation** — brings local bookkeeping in line with the
//! broker's open-position list at the start of every live cycle.
//!
//! ```text
//! group with a ticket the broker lost → catch up on the pending bars first
//!   (a broker-side TP/SL fill is booked at its level, TP1 arms trailing)
//!
//! local open position
//!   ├─ has ticket, broker has it     → adopt broker SL/TP if they differ      (LevelsOverridden)
//!   ├─ has ticket, broker lost it    → on_external_close @ last price         (ExternalClose)
//!   ├─ no ticket,  broker has tag    → attach ticket, then compare levels     (Adopted)
//!   └─ no ticket,  broker has no tag → order never filled → EXTERNAL @ entry  (Unfilled)
//! broker position with our tag, no open local owner                          (Orphan → close)
//! ```
//!
//! The broker is authoritative. Nothing here raises on a mismatch; every
//! divergence becomes a [`ReconciliationConflict`] in the report.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::broker::BrokerPosition;
use crate::engine::{CloseEvent, LevelOverride, PositionLifecycleManager};
use crate::error::EngineError;
use crate::models::{Bar, CloseReason, GroupId, OrderTag};
use crate::store::GroupStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconciliationConflict {
    LevelsOverridden(LevelOverride),
    ExternalClose { group_id: GroupId, position_num: u8, reason: CloseReason },
    Adopted { group_id: GroupId, position_num: u8, ticket: u64 },
    Unfilled { group_id: GroupId, position_num: u8 },
    Discarded { group_id: GroupId },
    Orphan { ticket: u64, magic: u64, comment: String },
}

#[derive(Debug, Default)]
pub struct ReconciliationReport {
    pub conflicts:     Vec<ReconciliationConflict>,
    /// Closes the broker already carried out; notify only.
    pub close_events:  Vec<CloseEvent>,
    /// Closes found while catching up whose ticket is still open at the
    /// broker; the driver must close them there.
    pub broker_closes: Vec<CloseEvent>,
    /// Broker positions to close: ours by tag, unknown locally.
    pub orphans:       Vec<BrokerPosition>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct BrokerReconciler {
    bot_id:     u32,
    symbol:     String,
    base_magic: u64,
}

impl BrokerReconciler {
    pub fn new(bot_id: u32, symbol: impl Into<String>, base_magic: u64) -> Self {
        Self { bot_id, symbol: symbol.into(), base_magic }
    }

    fn tag_of(&self, position: &BrokerPosition) -> Option<OrderTag> {
        if position.symbol != self.symbol {
            return None;
        }
        OrderTag::from_magic(position.magic, self.base_magic, self.bot_id)
    }

    /// `pending_bars` are the completed bars the manager has not been fed
    /// yet. `unsynced_stops` holds tickets whose last stop move did not
    /// reach the broker; their broker SL is stale and is not adopted.
    pub fn reconcile<S: GroupStore>(
        &self,
        manager: &mut PositionLifecycleManager<S>,
        broker_positions: &[BrokerPosition],
        pending_bars: &[Bar],
        unsynced_stops: &HashSet<u64>,
        now: DateTime<Utc>,
    ) -> Result<ReconciliationReport, EngineError> {
        let mut report = ReconciliationReport::default();

        let by_ticket: HashMap<u64, &BrokerPosition> =
            broker_positions.iter().map(|p| (p.ticket, p)).collect();

        // first broker position per tag; duplicates end up as orphans
        let mut by_tag: HashMap<OrderTag, &BrokerPosition> = HashMap::new();
        for p in broker_positions {
            if let Some(tag) = self.tag_of(p) {
                by_tag.entry(tag).or_insert(p);
            }
        }

        let mut claimed: HashSet<u64> = manager
            .all_groups()?
            .iter()
            .flat_map(|g| g.positions.iter().filter(|p| !p.hit))
            .filter_map(|p| p.ticket)
            .filter(|t| by_ticket.contains_key(t))
            .collect();

        for group in manager.active_groups()? {
            let group_id = group.group_id;
            let lost_ticket = group
                .open_positions()
                .any(|p| p.ticket.is_some_and(|t| !by_ticket.contains_key(&t)));

            // a vanished ticket usually means the broker filled its TP or SL
            // on a bar we have not applied yet
            let caught_up = lost_ticket && !pending_bars.is_empty();
            let group = if caught_up {
                for event in manager.catch_up(group_id, pending_bars)? {
                    if event.ticket.is_some_and(|t| by_ticket.contains_key(&t)) {
                        report.broker_closes.push(event);
                    } else {
                        report.conflicts.push(ReconciliationConflict::ExternalClose {
                            group_id,
                            position_num: event.position_num,
                            reason: event.reason,
                        });
                        report.close_events.push(event);
                    }
                }
                manager.group(group_id)?
            } else {
                group
            };
            let mut unfilled = Vec::new();

            for position in group.positions.iter().filter(|p| !p.hit) {
                let num = position.position_num;

                let broker_pos = match position.ticket {
                    Some(ticket) => match by_ticket.get(&ticket) {
                        Some(bp) => *bp,
                        None => {
                            if let Some(event) = manager.on_external_close(group_id, num, now)? {
                                report.conflicts.push(ReconciliationConflict::ExternalClose {
                                    group_id,
                                    position_num: num,
                                    reason: event.reason,
                                });
                                report.close_events.push(event);
                            }
                            continue;
                        }
                    },
                    None => match by_tag.get(&group.order_tag(num)) {
                        Some(bp) if !claimed.contains(&bp.ticket) => {
                            manager.attach_ticket(group_id, num, bp.ticket)?;
                            claimed.insert(bp.ticket);
                            info!(group_id = %group_id, pos = num, ticket = bp.ticket, "🔗 [RECONCILE] adopted broker position");
                            report.conflicts.push(ReconciliationConflict::Adopted {
                                group_id,
                                position_num: num,
                                ticket: bp.ticket,
                            });
                            *bp
                        }
                        _ => {
                            unfilled.push(num);
                            continue;
                        }
                    },
                };

                // stops the engine moved this cycle or failed to push are
                // ahead of the broker; zero leaves the local SL in place
                let stale_sl = caught_up || unsynced_stops.contains(&broker_pos.ticket);
                let broker_sl = if stale_sl { 0.0 } else { broker_pos.sl };
                if let Some(over) = manager.apply_broker_levels(group_id, num, broker_sl, broker_pos.tp)? {
                    report.conflicts.push(ReconciliationConflict::LevelsOverridden(over));
                }
            }

            if !unfilled.is_empty() {
                self.settle_unfilled(manager, group_id, &unfilled, now, &mut report)?;
            }
        }

        for p in broker_positions {
            if self.tag_of(p).is_some() && !claimed.contains(&p.ticket) {
                warn!(ticket = p.ticket, magic = p.magic, comment = %p.comment, "👻 [RECONCILE] orphan broker position");
                report.conflicts.push(ReconciliationConflict::Orphan {
                    ticket:  p.ticket,
                    magic:   p.magic,
                    comment: p.comment.clone(),
                });
                report.orphans.push(p.clone());
            }
        }

        if report.is_clean() {
            debug!(broker_positions = broker_positions.len(), "reconciliation clean");
        }
        Ok(report)
    }

    /// Positions with no ticket that the broker does not hold either: the
    /// order never filled. A group with no fill at all is discarded.
    fn settle_unfilled<S: GroupStore>(
        &self,
        manager: &mut PositionLifecycleManager<S>,
        group_id: GroupId,
        unfilled: &[u8],
        now: DateTime<Utc>,
        report: &mut ReconciliationReport,
    ) -> Result<(), EngineError> {
        let group = manager.group(group_id)?;
        let has_fill = group.positions.iter().any(|p| p.ticket.is_some() || p.hit);

        if !has_fill {
            manager.discard_unfilled(group_id)?;
            report.conflicts.push(ReconciliationConflict::Discarded { group_id });
            return Ok(());
        }

        for &num in unfilled {
            if let Some(event) = manager.finalize_unfilled(group_id, num, now)? {
                report.conflicts.push(ReconciliationConflict::Unfilled { group_id, position_num: num });
                report.close_events.push(event);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ManagerSettings;
    use crate::models::{Direction, Regime, Signal};
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use uuid::Uuid;

    const BASE: u64 = 420_000;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
    }

    /// Manager with one RANGE BUY group whose three positions carry tickets
    /// 11, 12, 13, plus the matching broker list.
    fn setup() -> (PositionLifecycleManager<MemoryStore>, GroupId, Vec<BrokerPosition>) {
        let mut m = PositionLifecycleManager::new(MemoryStore::new(), ManagerSettings::default());
        let signal = Signal::new(t0(), Direction::Buy, 2000.0, 1980.0, "test").with_regime(Regime::Range);
        let group = m.on_admitted_signal(&signal, Uuid::from_u128(1), t0()).unwrap();

        let mut broker = Vec::new();
        for p in &group.positions {
            let ticket = 10 + u64::from(p.position_num);
            m.attach_ticket(group.group_id, p.position_num, ticket).unwrap();
            let tag = group.order_tag(p.position_num);
            broker.push(BrokerPosition {
                ticket,
                symbol:     "XAUUSD".into(),
                magic:      tag.magic(BASE),
                volume:     p.volume,
                price_open: 2000.0,
                sl:         p.sl_price,
                tp:         p.tp_price,
                comment:    tag.comment(),
            });
        }
        (m, group.group_id, broker)
    }

    fn reconciler() -> BrokerReconciler {
        BrokerReconciler::new(1, "XAUUSD", BASE)
    }

    #[test]
    fn test_in_sync_is_clean() {
        let (mut m, _, broker) = setup();
        let report = reconciler().reconcile(&mut m, &broker, &[], &HashSet::new(), t0()).unwrap();
        assert!(report.is_clean());
        assert!(report.orphans.is_empty());
    }

    #[test]
    fn test_broker_tp_change_adopted_without_record() {
        let (mut m, gid, mut broker) = setup();
        broker[0].tp = 2030.0;

        let report = reconciler().reconcile(&mut m, &broker, &[], &HashSet::new(), t0()).unwrap();
        assert_eq!(report.conflicts.len(), 1);
        assert!(matches!(&report.conflicts[0], ReconciliationConflict::LevelsOverridden(o) if o.new_tp == 2030.0));
        assert_eq!(m.group(gid).unwrap().positions[0].tp_price, 2030.0);
        assert!(m.trade_records().unwrap().is_empty());
    }

    #[test]
    fn test_missing_ticket_closed_externally() {
        let (mut m, gid, mut broker) = setup();
        broker.remove(1);

        let report = reconciler().reconcile(&mut m, &broker, &[], &HashSet::new(), t0()).unwrap();
        assert_eq!(report.close_events.len(), 1);
        assert_eq!(report.close_events[0].reason, CloseReason::External);
        assert!(m.group(gid).unwrap().positions[1].hit);
    }

    #[test]
    fn test_broker_tp_fill_booked_at_tp_level() {
        let (mut m, gid, mut broker) = setup();
        // the broker filled TP1 during a bar the manager has not seen
        broker.remove(0);
        let bar = Bar { time: t0(), open: 2000.0, high: 2020.0, low: 1999.0, close: 2015.0, volume: 0.0 };

        let report = reconciler().reconcile(&mut m, &broker, &[bar], &HashSet::new(), t0()).unwrap();
        assert_eq!(report.close_events.len(), 1);
        assert_eq!(report.close_events[0].reason, CloseReason::Tp1);
        assert_eq!(report.close_events[0].price, 2020.0);
        assert!(report.broker_closes.is_empty());

        // trailing armed and ratcheted; the broker's 1980 is not adopted back
        let g = m.group(gid).unwrap();
        assert!(g.tp1_hit);
        assert!((g.positions[1].sl_price - 2007.88).abs() < 1e-6);
        assert!(!report.conflicts.iter().any(|c| matches!(c, ReconciliationConflict::LevelsOverridden(_))));
    }

    #[test]
    fn test_unsynced_stop_not_loosened() {
        let (mut m, gid, broker) = setup();
        let mut g = m.group(gid).unwrap();
        g.positions[1].sl_price = 2007.88;
        let mut store = m.into_store();
        store.save(&g).unwrap();
        let mut m = PositionLifecycleManager::new(store, ManagerSettings::default());

        let pending: HashSet<u64> = [12].into_iter().collect();
        let report = reconciler().reconcile(&mut m, &broker, &[], &pending, t0()).unwrap();
        assert!(report.is_clean());
        assert_eq!(m.group(gid).unwrap().positions[1].sl_price, 2007.88);

        // once synced, a broker-side edit is authoritative again
        reconciler().reconcile(&mut m, &broker, &[], &HashSet::new(), t0()).unwrap();
        assert_eq!(m.group(gid).unwrap().positions[1].sl_price, 1980.0);
    }

    #[test]
    fn test_untracked_position_adopted_by_tag() {
        let (mut m, gid, broker) = setup();
        // simulate a crash before the ticket of rung 3 was saved
        let mut g = m.group(gid).unwrap();
        g.positions[2].ticket = None;
        let mut store = m.into_store();
        store.save(&g).unwrap();
        let mut m = PositionLifecycleManager::new(store, ManagerSettings::default());

        let report = reconciler().reconcile(&mut m, &broker, &[], &HashSet::new(), t0()).unwrap();
        assert!(matches!(report.conflicts[0], ReconciliationConflict::Adopted { ticket: 13, .. }));
        assert_eq!(m.group(gid).unwrap().positions[2].ticket, Some(13));
        assert!(report.orphans.is_empty());
    }

    #[test]
    fn test_orphans_reported_foreign_ignored() {
        let (mut m, _, mut broker) = setup();
        let mut orphan = broker[0].clone();
        orphan.ticket = 99;
        broker.push(orphan);
        let mut foreign = broker[0].clone();
        foreign.ticket = 100;
        foreign.magic = 7;
        broker.push(foreign);

        let report = reconciler().reconcile(&mut m, &broker, &[], &HashSet::new(), t0()).unwrap();
        assert_eq!(report.orphans.len(), 1);
        assert_eq!(report.orphans[0].ticket, 99);
    }

    #[test]
    fn test_never_filled_group_discarded() {
        let mut m = PositionLifecycleManager::new(MemoryStore::new(), ManagerSettings::default());
        let signal = Signal::new(t0(), Direction::Buy, 2000.0, 1980.0, "test").with_regime(Regime::Range);
        let gid = m.on_admitted_signal(&signal, Uuid::from_u128(5), t0()).unwrap().group_id;

        let report = reconciler().reconcile(&mut m, &[], &[], &HashSet::new(), t0()).unwrap();
        assert!(matches!(report.conflicts[0], ReconciliationConflict::Discarded { .. }));
        assert!(m.group(gid).is_err());
    }
}
