//! # store
//!
//! Durable home of position groups and the append-only trade ledger.
//!
//! The [`GroupStore`] trait is the seam between the lifecycle manager and
//! persistence. Two implementations:
//!
//! | Store            | Used by                | Durability                              |
//! |------------------|------------------------|-----------------------------------------|
//! | [`MemoryStore`]  | backtests, unit tests  | none                                    |
//! | [`JsonFileStore`]| live driver            | atomic snapshot + fsync'd JSON-lines    |
//!
//! Both enforce the ledger rule: at most one [`TradeRecord`] per
//! `(group_id, position_num)`.

pub mod export;
pub mod file;
pub mod memory;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

use crate::error::StoreError;
use crate::models::{GroupId, PositionGroup, TradeRecord};

pub trait GroupStore: Send {
    /// Inserts or replaces the snapshot of `group`.
    fn save(&mut self, group: &PositionGroup) -> Result<(), StoreError>;

    fn load(&self, group_id: GroupId) -> Result<Option<PositionGroup>, StoreError>;

    /// Every stored group, ordered by `created_at` then id.
    fn list_groups(&self) -> Result<Vec<PositionGroup>, StoreError>;

    fn list_active(&self) -> Result<Vec<PositionGroup>, StoreError> {
        Ok(self
            .list_groups()?
            .into_iter()
            .filter(PositionGroup::is_active)
            .collect())
    }

    /// Deletes a group snapshot. Ledger rows are never deleted.
    fn remove(&mut self, group_id: GroupId) -> Result<(), StoreError>;

    /// Appends one ledger row. A second row for the same position fails with
    /// [`StoreError::DuplicateRecord`].
    fn append_trade_record(&mut self, record: &TradeRecord) -> Result<(), StoreError>;

    /// The full ledger, in append order.
    fn trade_records(&self) -> Result<Vec<TradeRecord>, StoreError>;

    /// Removes CLOSED groups from the snapshot set and returns them.
    fn archive_closed(&mut self) -> Result<Vec<PositionGroup>, StoreError>;
}

/// Sort key shared by the implementations.
pub(crate) fn sort_groups(groups: &mut [PositionGroup]) {
    groups.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.group_id.cmp(&b.group_id))
    });
}
