//! # broker::paper
//!
//! In-process broker for `MT5_BASE_URL=mock` and for driver tests. Orders
//! fill instantly at the requested price; nothing ever closes on its own.
//! Tests steer it through the `set_*` / `inject_*` helpers to simulate
//! disconnects, rejected orders, failed stop moves, operator edits and
//! external closes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::info;

use crate::broker::{Broker, BrokerPosition, OrderRequest};
use crate::error::EngineError;
use crate::models::Bar;

#[derive(Debug, Default)]
struct Book {
    positions:   BTreeMap<u64, BrokerPosition>,
    bars:        Vec<Bar>,
    next_ticket: u64,
    submitted:   Vec<OrderRequest>,
    closed:      Vec<u64>,
    modified:    Vec<(u64, f64, f64)>,
}

#[derive(Debug)]
pub struct PaperBroker {
    book:         Mutex<Book>,
    connected:    AtomicBool,
    /// Submissions still to reject before orders start filling again.
    reject_next:  AtomicU32,
    /// Same for SL/TP modifications.
    reject_moves: AtomicU32,
    /// Connection checks still to fail while `connected` stays up.
    drop_checks:  AtomicU32,
    checks:       AtomicU32,
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperBroker {
    pub fn new() -> Self {
        Self {
            book: Mutex::new(Book { next_ticket: 1000, ..Default::default() }),
            connected:    AtomicBool::new(true),
            reject_next:  AtomicU32::new(0),
            reject_moves: AtomicU32::new(0),
            drop_checks:  AtomicU32::new(0),
            checks:       AtomicU32::new(0),
        }
    }

    pub fn with_bars(bars: Vec<Bar>) -> Self {
        let broker = Self::new();
        broker.set_bars(bars);
        broker
    }

    fn book(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_connected(&self) -> Result<(), EngineError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::Connection("paper broker offline".into()))
        }
    }

    // ── Test / mock controls ──────────────────────────────────────────────────

    pub fn set_connected(&self, up: bool) {
        self.connected.store(up, Ordering::SeqCst);
    }

    pub fn set_bars(&self, bars: Vec<Bar>) {
        self.book().bars = bars;
    }

    pub fn push_bar(&self, bar: Bar) {
        self.book().bars.push(bar);
    }

    pub fn reject_next_orders(&self, n: u32) {
        self.reject_next.store(n, Ordering::SeqCst);
    }

    pub fn reject_next_modifications(&self, n: u32) {
        self.reject_moves.store(n, Ordering::SeqCst);
    }

    /// The next `n` calls to `ensure_connected` fail, then the link is back.
    pub fn fail_next_connection_checks(&self, n: u32) {
        self.drop_checks.store(n, Ordering::SeqCst);
    }

    /// Calls to `ensure_connected` so far.
    pub fn connection_checks(&self) -> u32 {
        self.checks.load(Ordering::SeqCst)
    }

    /// Operator moved SL/TP in the terminal.
    pub fn set_levels(&self, ticket: u64, sl: f64, tp: f64) {
        if let Some(p) = self.book().positions.get_mut(&ticket) {
            p.sl = sl;
            p.tp = tp;
        }
    }

    /// Position vanished without us asking (manual close, stop-out).
    pub fn drop_position(&self, ticket: u64) -> Option<BrokerPosition> {
        self.book().positions.remove(&ticket)
    }

    /// A position we never opened in this session.
    pub fn inject_position(&self, position: BrokerPosition) {
        self.book().positions.insert(position.ticket, position);
    }

    pub fn positions(&self) -> Vec<BrokerPosition> {
        self.book().positions.values().cloned().collect()
    }

    pub fn submitted(&self) -> Vec<OrderRequest> {
        self.book().submitted.clone()
    }

    pub fn closed_tickets(&self) -> Vec<u64> {
        self.book().closed.clone()
    }

    pub fn modifications(&self) -> Vec<(u64, f64, f64)> {
        self.book().modified.clone()
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn ensure_connected(&self) -> Result<(), EngineError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.drop_checks) {
            return Err(EngineError::Connection("paper broker: link dropped".into()));
        }
        self.check_connected()
    }

    async fn open_positions(&self, symbol: &str) -> Result<Vec<BrokerPosition>, EngineError> {
        self.check_connected()?;
        Ok(self
            .book()
            .positions
            .values()
            .filter(|p| p.symbol == symbol)
            .cloned()
            .collect())
    }

    async fn submit_order(&self, order: &OrderRequest) -> Result<u64, EngineError> {
        self.check_connected()?;
        let mut book = self.book();
        book.submitted.push(order.clone());

        if take_one(&self.reject_next) {
            return Err(EngineError::Broker("paper broker rejected order: retcode=10006".into()));
        }

        book.next_ticket += 1;
        let ticket = book.next_ticket;
        book.positions.insert(
            ticket,
            BrokerPosition {
                ticket,
                symbol:     order.symbol.clone(),
                magic:      order.magic,
                volume:     order.volume,
                price_open: order.price,
                sl:         order.sl,
                tp:         order.tp,
                comment:    order.comment.clone(),
            },
        );
        info!(ticket, comment = %order.comment, "🎭 [PAPER] order filled");
        Ok(ticket)
    }

    async fn close_position(&self, ticket: u64, _volume: f64) -> Result<(), EngineError> {
        self.check_connected()?;
        let mut book = self.book();
        if book.positions.remove(&ticket).is_none() {
            return Err(EngineError::Broker(format!("paper broker: no position {ticket}")));
        }
        book.closed.push(ticket);
        Ok(())
    }

    async fn modify_position(&self, ticket: u64, sl: f64, tp: f64) -> Result<(), EngineError> {
        self.check_connected()?;
        if take_one(&self.reject_moves) {
            return Err(EngineError::Broker(format!("paper broker rejected modify {ticket}: retcode=10016")));
        }
        let mut book = self.book();
        let position = book
            .positions
            .get_mut(&ticket)
            .ok_or_else(|| EngineError::Broker(format!("paper broker: no position {ticket}")))?;
        position.sl = sl;
        position.tp = tp;
        book.modified.push((ticket, sl, tp));
        Ok(())
    }

    async fn recent_bars(&self, _symbol: &str, count: usize) -> Result<Vec<Bar>, EngineError> {
        self.check_connected()?;
        let book = self.book();
        let start = book.bars.len().saturating_sub(count);
        Ok(book.bars[start..].to_vec())
    }
}

/// Decrements a countdown, `true` while it had something left.
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}
