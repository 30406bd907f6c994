//! # store::file
//!
//! Crash-safe [`GroupStore`] backed by two files under the state directory:
//!
//! ```text
//! <state_dir>/
//!   ├─ groups.json   snapshot of every stored group   (temp → fsync → rename)
//!   ├─ trades.jsonl  append-only ledger, one row per line, fsync'd per append
//!   └─ archive/
//!        └─ groups.jsonl  closed groups moved out of the snapshot, one per line
//! ```
//!
//! The manager appends the ledger row *before* it saves the group snapshot.
//! A crash between the two leaves the ledger ahead of the snapshot; on open,
//! those rows are replayed onto their groups so the position is not closed a
//! second time after restart. A replayed target fill also moves the stops the
//! way the bar that produced it did: TP1 arms the breakeven stop and every
//! target price widens the best price seen before the trailing ratchet.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::InstrumentSpec;
use crate::engine::lifecycle::ratchet_trailing;
use crate::error::StoreError;
use crate::models::{CloseReason, GroupId, PositionGroup, TradeRecord};
use crate::store::{sort_groups, GroupStore};

const GROUPS_FILE: &str = "groups.json";
const LEDGER_FILE: &str = "trades.jsonl";
const ARCHIVE_DIR: &str = "archive";
const ARCHIVE_FILE: &str = "groups.jsonl";

#[derive(Debug)]
pub struct JsonFileStore {
    dir:        PathBuf,
    /// Price rounding for replayed stops.
    instrument: InstrumentSpec,
    groups:     BTreeMap<GroupId, PositionGroup>,
    records:    Vec<TradeRecord>,
    closed:     HashSet<(GroupId, u8)>,
}

impl JsonFileStore {
    /// Opens (or creates) the store in `dir` and replays the ledger.
    pub fn open(dir: impl AsRef<Path>, instrument: InstrumentSpec) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let groups_path = dir.join(GROUPS_FILE);
        let groups: Vec<PositionGroup> = if groups_path.exists() {
            serde_json::from_slice(&fs::read(&groups_path)?)?
        } else {
            Vec::new()
        };

        let ledger_path = dir.join(LEDGER_FILE);
        let (records, torn) = read_ledger(&ledger_path)?;
        if torn {
            rewrite_ledger(&dir, &records)?;
        }

        let mut store = Self {
            dir,
            instrument,
            groups: groups.into_iter().map(|g| (g.group_id, g)).collect(),
            closed: records
                .iter()
                .map(|r| (r.position_group_id, r.position_num))
                .collect(),
            records,
        };

        let replayed = store.replay_ledger();
        if replayed > 0 {
            warn!(replayed, "♻️ [STORE] ledger was ahead of snapshot, replayed");
            store.write_snapshot()?;
        }

        info!(
            dir     = %store.dir.display(),
            groups  = store.groups.len(),
            records = store.records.len(),
            "📂 [STORE] opened"
        );
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn archive_path(&self) -> PathBuf {
        self.dir.join(ARCHIVE_DIR).join(ARCHIVE_FILE)
    }

    /// Applies ledger rows that the snapshot does not reflect yet. Returns the
    /// number of positions fixed up.
    fn replay_ledger(&mut self) -> usize {
        let mut replayed = 0;
        for record in &self.records {
            let Some(group) = self.groups.get_mut(&record.position_group_id) else {
                continue;
            };
            let Some(position) = group.position_mut(record.position_num) else {
                continue;
            };
            if position.hit {
                continue;
            }

            position.hit = true;
            replayed += 1;

            if record.status.is_take_profit() {
                if record.status == CloseReason::Tp1 && !group.tp1_hit {
                    let breakeven = self
                        .instrument
                        .round_price(group.ladder.breakeven_stop(group.entry_price, group.trade_type));
                    group.arm_trailing(record.close_price, breakeven);
                }
                group.max_price_seen = group.max_price_seen.max(record.close_price);
                group.min_price_seen = group.min_price_seen.min(record.close_price);
                ratchet_trailing(group, &self.instrument);
            }
            group.last_price = record.close_price;
            if record.close_time > group.updated_at {
                group.updated_at = record.close_time;
            }
            // bar-driven closes happen at the bar's close time
            if record.status != CloseReason::External && group.last_bar_at < Some(record.close_time) {
                group.last_bar_at = Some(record.close_time);
            }
            group.close_if_done();
        }
        replayed
    }

    /// Writes the full snapshot to a temp file, fsyncs it and renames it over
    /// `groups.json`.
    fn write_snapshot(&self) -> Result<(), StoreError> {
        let mut groups: Vec<PositionGroup> = self.groups.values().cloned().collect();
        sort_groups(&mut groups);

        let path = self.dir.join(GROUPS_FILE);
        let tmp = self.dir.join(format!("{GROUPS_FILE}.tmp"));

        let mut file = File::create(&tmp)?;
        file.write_all(&serde_json::to_vec_pretty(&groups)?)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Reads every ledger row. A torn final line (crash mid-append) is dropped
/// with a warning and reported through the flag; a bad line anywhere else is
/// an error.
fn read_ledger(path: &Path) -> Result<(Vec<TradeRecord>, bool), StoreError> {
    if !path.exists() {
        return Ok((Vec::new(), false));
    }

    let lines: Vec<String> = BufReader::new(File::open(path)?)
        .lines()
        .collect::<Result<_, _>>()?;
    let last = lines.iter().rposition(|l| !l.trim().is_empty());

    let mut records = Vec::with_capacity(lines.len());
    let mut torn = false;
    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TradeRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) if Some(i) == last => {
                warn!(line = i + 1, error = %e, "⚠️ [STORE] dropping torn ledger tail");
                torn = true;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok((records, torn))
}

/// Replaces the ledger with `records`, same temp → fsync → rename dance as
/// the snapshot.
fn rewrite_ledger(dir: &Path, records: &[TradeRecord]) -> Result<(), StoreError> {
    let tmp = dir.join(format!("{LEDGER_FILE}.tmp"));
    let mut file = File::create(&tmp)?;
    for record in records {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        file.write_all(&line)?;
    }
    file.sync_all()?;
    fs::rename(&tmp, dir.join(LEDGER_FILE))?;
    Ok(())
}

impl GroupStore for JsonFileStore {
    fn save(&mut self, group: &PositionGroup) -> Result<(), StoreError> {
        self.groups.insert(group.group_id, group.clone());
        self.write_snapshot()
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
        if self.groups.remove(&group_id).is_some() {
            self.write_snapshot()?;
        }
        Ok(())
    }

    fn append_trade_record(&mut self, record: &TradeRecord) -> Result<(), StoreError> {
        let key = (record.position_group_id, record.position_num);
        if self.closed.contains(&key) {
            return Err(StoreError::DuplicateRecord {
                group_id:     key.0,
                position_num: key.1,
            });
        }

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(LEDGER_FILE))?;
        file.write_all(&line)?;
        file.sync_data()?;

        self.closed.insert(key);
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
        if closed.is_empty() {
            return Ok(Vec::new());
        }

        let mut archived: Vec<PositionGroup> = closed
            .iter()
            .filter_map(|id| self.groups.get(id).cloned())
            .collect();
        sort_groups(&mut archived);

        // archive before the snapshot rewrite: a group is always in at least one
        fs::create_dir_all(self.dir.join(ARCHIVE_DIR))?;
        let mut lines = Vec::new();
        for group in &archived {
            lines.extend(serde_json::to_vec(group)?);
            lines.push(b'\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.archive_path())?;
        file.write_all(&lines)?;
        file.sync_data()?;

        for id in &closed {
            self.groups.remove(id);
        }
        self.write_snapshot()?;
        info!(
            count = archived.len(),
            path  = %self.archive_path().display(),
            "🗄️ [STORE] archived closed groups"
        );
        Ok(archived)
    }
}
