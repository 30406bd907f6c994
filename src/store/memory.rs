//! # store::memory
//!
//! In-process [`GroupStore`]. Backtests run entirely on it, which is what
//! makes two replays over the same bars produce the same ledger byte for byte:
//! a `BTreeMap` gives a stable iteration order and nothing touches the clock.

use std::collections::{BTreeMap, HashSet};

use crate::error::StoreError;
use crate::models::{GroupId, PositionGroup, TradeRecord};
use crate::store::{sort_groups, GroupStore};

#[derive(Debug, Default)]
pub struct MemoryStore {
    groups:  BTreeMap<GroupId, PositionGroup>,
    records: Vec<TradeRecord>,
    closed:  HashSet<(GroupId, u8)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GroupStore for MemoryStore {
    fn save(&mut self, group: &PositionGroup) -> Result<(), StoreError> {
        self.groups.insert(group.group_id, group.clone());
        Ok(())
    }

    fn load(&self, group_id: GroupId) -> Result<Option<PositionGroup>, StoreError> {
        Ok(self.groups.get(&group_id).cloned())
    }

    fn list_groups(&self) -> Result<Vec<PositionGroup>, StoreError> {
        let mut groups: Vec<_> = self.groups.values().cloned().collect();
        sort_groups(&mut groups);
        Ok(groups)
    }

    fn remove(&mut self, group_id: GroupId) -> Result<(), StoreError> {
        self.groups.remove(&group_id);
        Ok(())
    }

    fn append_trade_record(&mut self, record: &TradeRecord) -> Result<(), StoreError> {
        let key = (record.position_group_id, record.position_num);
        if !self.closed.insert(key) {
            return Err(StoreError::DuplicateRecord {
                group_id:     key.0,
                position_num: key.1,
            });
        }
        self.records.push(record.clone());
        Ok(())
    }

    fn trade_records(&self) -> Result<Vec<TradeRecord>, StoreError> {
        Ok(self.records.clone())
    }

    fn archive_closed(&mut self) -> Result<Vec<PositionGroup>, StoreError> {
        let closed: Vec<GroupId> = self
            .groups
            .values()
            .filter(|g| !g.is_active())
            .map(|g| g.group_id)
            .collect();

        let mut archived: Vec<_> = closed
            .iter()
            .filter_map(|id| self.groups.remove(id))
            .collect();
        sort_groups(&mut archived);
        Ok(archived)
    }
}
