//! Tables: the page directory, RID allocation, base/tail record I/O, the
//! indirection chain, rollback journaling, and merge bookkeeping.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use strata::BufferPool;
use strata::lock_manager::TxId;

use crate::config::{
    DELETED_RID, INDIRECTION_COLUMN, NUM_METADATA_COLUMNS, RANGE_CAPACITY, RID_COLUMN,
    SCHEMA_ENCODING_COLUMN,
};
use crate::errors::{EngineError, EngineResult};
use crate::index::{ColumnIndex, Index};
use crate::merge::MergeHandle;
use crate::page_range::{PageRange, RangeSnapshot};

pub type Rid = u64;

/// Where a record lives: which range, base or tail section, and the logical
/// offset within that section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLocation {
    pub range: usize,
    pub is_tail: bool,
    pub offset: usize,
}

struct RangeRoster {
    ranges: Vec<Arc<PageRange>>,
    current_base: Option<usize>,
    current_tail: Option<usize>,
}

struct JournalEntry {
    tx: TxId,
    rid: Rid,
    op: JournalOp,
}

enum JournalOp {
    Insert,
    Update {
        base_image: Vec<i64>,
        index_transitions: Vec<(usize, i64, i64)>,
    },
    Delete {
        base_image: Vec<i64>,
        latest_values: Vec<i64>,
    },
}

/// Everything needed to persist and rebuild a table's logical structure.
/// Page bytes are authoritative on disk; this is a directory into them.
pub struct TableState {
    pub name: String,
    pub num_columns: usize,
    pub key: usize,
    pub next_rid: u64,
    pub updates_since_merge: usize,
    pub ranges: Vec<RangeSnapshot>,
    pub directory: HashMap<Rid, RecordLocation>,
    pub current_base: Option<usize>,
    pub current_tail: Option<usize>,
    pub indexed_columns: Vec<usize>,
}

pub struct Table {
    name: Arc<str>,
    key: usize,
    num_columns: usize,
    total_columns: usize,
    pool: Arc<BufferPool>,

    directory: RwLock<HashMap<Rid, RecordLocation>>,
    roster: Mutex<RangeRoster>,
    next_rid: AtomicU64,
    index: Mutex<Index>,

    dirty_rids: Mutex<HashSet<Rid>>,
    updates_since_merge: AtomicUsize,
    journal: Mutex<Vec<JournalEntry>>,

    merge_handle: Mutex<Option<MergeHandle>>,
    merge_in_progress: Mutex<()>,
}

fn user_and_schema(record: Vec<i64>) -> (Vec<i64>, i64) {
    let schema = record[SCHEMA_ENCODING_COLUMN];
    (record[NUM_METADATA_COLUMNS..].to_vec(), schema)
}

impl Table {
    pub fn create(name: &str, num_columns: usize, key: usize, pool: Arc<BufferPool>) -> Arc<Self> {
        let table = Arc::new(Self::empty(name, num_columns, key, pool));
        table.index.lock().set_column(key, ColumnIndex::new());
        crate::merge::start(&table);
        table
    }

    fn empty(name: &str, num_columns: usize, key: usize, pool: Arc<BufferPool>) -> Self {
        Self {
            name: Arc::from(name),
            key,
            num_columns,
            total_columns: NUM_METADATA_COLUMNS + num_columns,
            pool,
            directory: RwLock::new(HashMap::new()),
            roster: Mutex::new(RangeRoster {
                ranges: Vec::new(),
                current_base: None,
                current_tail: None,
            }),
            next_rid: AtomicU64::new(1),
            index: Mutex::new(Index::new(num_columns)),
            dirty_rids: Mutex::new(HashSet::new()),
            updates_since_merge: AtomicUsize::new(0),
            journal: Mutex::new(Vec::new()),
            merge_handle: Mutex::new(None),
            merge_in_progress: Mutex::new(()),
        }
    }

    /// Rebuild a table from its persisted state; indexes are repopulated
    /// from the latest version of every base record.
    pub fn restore(state: TableState, pool: Arc<BufferPool>) -> EngineResult<Arc<Self>> {
        let mut table = Self::empty(&state.name, state.num_columns, state.key, pool);
        let name = Arc::clone(&table.name);
        let total_columns = table.total_columns;

        let ranges: Vec<Arc<PageRange>> = state
            .ranges
            .into_iter()
            .enumerate()
            .map(|(idx, snapshot)| {
                Arc::new(PageRange::restore(
                    Arc::clone(&name),
                    idx,
                    total_columns,
                    Arc::clone(&table.pool),
                    snapshot,
                ))
            })
            .collect();

        // Fall back to the last range with room when the hints were absent.
        let current_base = state.current_base.or_else(|| {
            ranges
                .iter()
                .rposition(|range| range.has_capacity())
                .or_else(|| ranges.len().checked_sub(1))
        });
        let current_tail = state.current_tail.or_else(|| {
            ranges
                .iter()
                .rposition(|range| range.num_tail_records() < RANGE_CAPACITY)
                .or_else(|| ranges.len().checked_sub(1))
        });

        table.roster = Mutex::new(RangeRoster {
            ranges,
            current_base,
            current_tail,
        });
        table.directory = RwLock::new(state.directory);
        table.next_rid = AtomicU64::new(state.next_rid);
        table.updates_since_merge = AtomicUsize::new(state.updates_since_merge);

        let table = Arc::new(table);
        table.build_index(state.key)?;
        for column in state.indexed_columns {
            if column != state.key {
                table.build_index(column)?;
            }
        }
        crate::merge::start(&table);
        Ok(table)
    }

    pub fn snapshot_state(&self) -> TableState {
        // Never reach for the index lock while the roster is held; writers
        // nest the other way around.
        let (ranges, current_base, current_tail) = {
            let roster = self.roster.lock();
            (
                roster.ranges.iter().map(|range| range.snapshot()).collect(),
                roster.current_base,
                roster.current_tail,
            )
        };
        TableState {
            name: self.name.to_string(),
            num_columns: self.num_columns,
            key: self.key,
            next_rid: self.next_rid.load(Ordering::SeqCst),
            updates_since_merge: self.updates_since_merge.load(Ordering::SeqCst),
            ranges,
            directory: self.directory.read().clone(),
            current_base,
            current_tail,
            indexed_columns: self.index.lock().indexed_columns(),
        }
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn key_column(&self) -> usize {
        self.key
    }

    pub fn num_columns(&self) -> usize {
        self.num_columns
    }

    pub(crate) fn install_merge_handle(&self, handle: MergeHandle) {
        *self.merge_handle.lock() = Some(handle);
    }

    /// Signal the background merger and wait for it to drain. Must run
    /// before the buffer pool is flushed at close, otherwise the merger may
    /// redirty flushed pages.
    pub fn stop_merge_thread(&self) {
        let handle = self.merge_handle.lock().take();
        if let Some(mut handle) = handle {
            handle.stop();
        }
    }

    // ------------------------------------------------------------------
    // Range selection

    fn push_range(
        name: &Arc<str>,
        total_columns: usize,
        pool: &Arc<BufferPool>,
        roster: &mut RangeRoster,
    ) -> Arc<PageRange> {
        let idx = roster.ranges.len();
        let range = Arc::new(PageRange::new(
            Arc::clone(name),
            idx,
            total_columns,
            Arc::clone(pool),
        ));
        roster.ranges.push(Arc::clone(&range));
        roster.current_base = Some(idx);
        range
    }

    fn current_base_range(&self) -> Arc<PageRange> {
        let mut roster = self.roster.lock();
        if let Some(idx) = roster.current_base {
            let range = Arc::clone(&roster.ranges[idx]);
            if range.has_capacity() {
                return range;
            }
        }
        Self::push_range(&self.name, self.total_columns, &self.pool, &mut roster)
    }

    fn retire_base_range(&self, idx: usize) {
        let mut roster = self.roster.lock();
        if roster.current_base == Some(idx) {
            Self::push_range(&self.name, self.total_columns, &self.pool, &mut roster);
        }
    }

    /// Tail appends follow the current base range once the previous tail
    /// range fills up.
    fn current_tail_range(&self) -> Arc<PageRange> {
        let mut roster = self.roster.lock();
        if let Some(idx) = roster.current_tail {
            let range = Arc::clone(&roster.ranges[idx]);
            if range.num_tail_records() < RANGE_CAPACITY {
                return range;
            }
        }
        let range = match roster.current_base {
            Some(idx) => {
                let range = Arc::clone(&roster.ranges[idx]);
                if range.has_capacity() {
                    range
                } else {
                    Self::push_range(&self.name, self.total_columns, &self.pool, &mut roster)
                }
            }
            None => Self::push_range(&self.name, self.total_columns, &self.pool, &mut roster),
        };
        roster.current_tail = Some(range.range_idx());
        range
    }

    fn retire_tail_range(&self, idx: usize) {
        let mut roster = self.roster.lock();
        if roster.current_tail == Some(idx) {
            roster.current_tail = None;
        }
    }

    fn location(&self, rid: Rid) -> Option<RecordLocation> {
        self.directory.read().get(&rid).copied()
    }

    fn range(&self, idx: usize) -> Option<Arc<PageRange>> {
        self.roster.lock().ranges.get(idx).cloned()
    }

    // ------------------------------------------------------------------
    // Record operations

    /// Insert a new base record; returns its RID. The index lock is held
    /// across the uniqueness check and the index insertions so the whole
    /// operation is atomic with respect to other inserts.
    pub fn insert(&self, tx: Option<TxId>, values: &[i64]) -> EngineResult<Rid> {
        if values.len() != self.num_columns {
            return Err(EngineError::IntegrityViolation(format!(
                "expected {} columns, got {}",
                self.num_columns,
                values.len()
            )));
        }

        let mut index = self.index.lock();
        let duplicate = match index.locate(self.key, values[self.key]) {
            Some(rids) => !rids.is_empty(),
            None => self
                .scan_latest()?
                .iter()
                .any(|(_, row)| row[self.key] == values[self.key]),
        };
        if duplicate {
            return Err(EngineError::IntegrityViolation(format!(
                "duplicate primary key {}",
                values[self.key]
            )));
        }

        let rid = self.next_rid.fetch_add(1, Ordering::SeqCst);
        let mut record = vec![0, rid as i64, Utc::now().timestamp(), 0];
        record.extend_from_slice(values);

        let (range_idx, offset) = loop {
            let range = self.current_base_range();
            let mut guard = range.lock();
            if guard.base_is_full() {
                drop(guard);
                self.retire_base_range(range.range_idx());
                continue;
            }
            let offset = guard.append_base(&record)?;
            break (range.range_idx(), offset);
        };

        self.directory.write().insert(
            rid,
            RecordLocation {
                range: range_idx,
                is_tail: false,
                offset,
            },
        );

        for column in index.indexed_columns() {
            index.insert(column, values[column], rid);
        }
        drop(index);

        self.journal_op(tx, rid, JournalOp::Insert);
        crate::lstore_debug_log!("[Table::insert] {} rid={rid}", self.name);
        Ok(rid)
    }

    /// Read a record (base or tail) by RID. Returns the full metadata+user
    /// column vector, or `None` when the record is absent or tombstoned.
    pub fn read_record(&self, rid: Rid) -> EngineResult<Option<Vec<i64>>> {
        let Some(loc) = self.location(rid) else {
            return Ok(None);
        };
        let Some(range) = self.range(loc.range) else {
            return Ok(None);
        };

        let guard = range.lock();
        let record = if loc.is_tail {
            guard.read_tail(loc.offset)?
        } else {
            guard.read_base(loc.offset)?
        };
        drop(guard);

        if record[RID_COLUMN] as u64 == DELETED_RID {
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Latest user columns and schema encoding: a single hop through the
    /// base record's indirection pointer. The chain depth is only walked by
    /// [`Table::get_version`].
    pub fn get_latest_version(&self, rid: Rid) -> EngineResult<Option<(Vec<i64>, i64)>> {
        let Some(base) = self.read_record(rid)? else {
            return Ok(None);
        };

        let indirection = base[INDIRECTION_COLUMN] as u64;
        if indirection == DELETED_RID {
            return Ok(Some(user_and_schema(base)));
        }
        match self.read_record(indirection)? {
            Some(tail) => Ok(Some(user_and_schema(tail))),
            None => Ok(Some(user_and_schema(base))),
        }
    }

    /// Walk `relative` steps back from the newest tail; `0` means latest. A
    /// chain shorter than the walk yields the base record.
    pub fn get_version(&self, rid: Rid, relative: i64) -> EngineResult<Option<(Vec<i64>, i64)>> {
        let Some(base) = self.read_record(rid)? else {
            return Ok(None);
        };
        if relative == 0 {
            return self.get_latest_version(rid);
        }

        let mut cursor = base[INDIRECTION_COLUMN] as u64;
        if cursor == DELETED_RID {
            return Ok(Some(user_and_schema(base)));
        }

        for _ in 0..relative.unsigned_abs() {
            if cursor == DELETED_RID {
                break;
            }
            let Some(tail) = self.read_record(cursor)? else {
                return Ok(None);
            };
            cursor = tail[INDIRECTION_COLUMN] as u64;
        }

        if cursor == DELETED_RID {
            return Ok(Some(user_and_schema(base)));
        }
        match self.read_record(cursor)? {
            Some(record) => Ok(Some(user_and_schema(record))),
            None => Ok(None),
        }
    }

    /// Append a tail record carrying the merged column values, rewire the
    /// base record's indirection to it, and queue the RID for the merger.
    /// `None` entries keep the latest value of their column.
    pub fn update_record(
        &self,
        tx: Option<TxId>,
        rid: Rid,
        updates: &[Option<i64>],
    ) -> EngineResult<()> {
        if updates.len() != self.num_columns {
            return Err(EngineError::IntegrityViolation(format!(
                "expected {} columns, got {}",
                self.num_columns,
                updates.len()
            )));
        }
        let Some(base) = self.read_record(rid)? else {
            return Err(EngineError::NotFound);
        };
        let Some((latest, current_schema)) = self.get_latest_version(rid)? else {
            return Err(EngineError::NotFound);
        };

        let tail_rid = self.next_rid.fetch_add(1, Ordering::SeqCst);
        let prev_tail = base[INDIRECTION_COLUMN];

        let mut new_schema = current_schema;
        let mut transitions = Vec::new();
        for (column, value) in updates.iter().enumerate() {
            if let Some(value) = value {
                new_schema |= 1 << column;
                transitions.push((column, latest[column], *value));
            }
        }

        let mut tail_data = vec![
            prev_tail,
            tail_rid as i64,
            Utc::now().timestamp(),
            new_schema,
        ];
        for (column, value) in updates.iter().enumerate() {
            tail_data.push(value.unwrap_or(latest[column]));
        }

        let (tail_range_idx, tail_offset) = loop {
            let range = self.current_tail_range();
            let mut guard = range.lock();
            if guard.tail_is_full() {
                drop(guard);
                self.retire_tail_range(range.range_idx());
                continue;
            }
            let offset = guard.append_tail(&tail_data)?;
            break (range.range_idx(), offset);
        };

        let base_loc = {
            let mut directory = self.directory.write();
            directory.insert(
                tail_rid,
                RecordLocation {
                    range: tail_range_idx,
                    is_tail: true,
                    offset: tail_offset,
                },
            );
            directory.get(&rid).copied()
        };
        let Some(base_loc) = base_loc else {
            return Err(EngineError::NotFound);
        };
        debug_assert!(!base_loc.is_tail);

        let Some(base_range) = self.range(base_loc.range) else {
            return Err(EngineError::NotFound);
        };
        base_range.lock().write_base_columns(
            base_loc.offset,
            &[
                (INDIRECTION_COLUMN, tail_rid as i64),
                (SCHEMA_ENCODING_COLUMN, new_schema),
            ],
        )?;

        {
            let mut index = self.index.lock();
            for &(column, old_value, new_value) in &transitions {
                index.update(column, old_value, new_value, rid);
            }
        }

        self.journal_op(
            tx,
            rid,
            JournalOp::Update {
                base_image: base,
                index_transitions: transitions,
            },
        );
        self.dirty_rids.lock().insert(rid);
        self.updates_since_merge.fetch_add(1, Ordering::SeqCst);
        crate::lstore_debug_log!("[Table::update] {} rid={rid} tail={tail_rid}", self.name);
        Ok(())
    }

    /// Tombstone a base record and drop it from every index.
    pub fn delete_record(&self, tx: Option<TxId>, rid: Rid) -> EngineResult<()> {
        let Some(loc) = self.location(rid) else {
            return Err(EngineError::NotFound);
        };
        if loc.is_tail {
            return Err(EngineError::NotFound);
        }
        let Some(base) = self.read_record(rid)? else {
            return Err(EngineError::NotFound);
        };
        let Some((latest, _)) = self.get_latest_version(rid)? else {
            return Err(EngineError::NotFound);
        };

        let Some(range) = self.range(loc.range) else {
            return Err(EngineError::NotFound);
        };
        range
            .lock()
            .write_base_columns(loc.offset, &[(RID_COLUMN, DELETED_RID as i64)])?;

        {
            let mut index = self.index.lock();
            for column in index.indexed_columns() {
                index.delete(column, latest[column], rid);
            }
        }

        self.journal_op(
            tx,
            rid,
            JournalOp::Delete {
                base_image: base,
                latest_values: latest,
            },
        );
        crate::lstore_debug_log!("[Table::delete] {} rid={rid}", self.name);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Index access

    /// RIDs whose latest value in `column` equals `value`. Non-indexed
    /// columns fall back to a full scan over base records.
    pub fn locate(&self, column: usize, value: i64) -> EngineResult<HashSet<Rid>> {
        if let Some(result) = self.index.lock().locate(column, value) {
            return Ok(result);
        }
        let mut result = HashSet::new();
        for (rid, row) in self.scan_latest()? {
            if row.get(column) == Some(&value) {
                result.insert(rid);
            }
        }
        Ok(result)
    }

    /// RIDs whose latest value in `column` lies in `[begin, end]`.
    pub fn locate_range(&self, begin: i64, end: i64, column: usize) -> EngineResult<HashSet<Rid>> {
        if let Some(result) = self.index.lock().locate_range(column, begin, end) {
            return Ok(result);
        }
        let mut result = HashSet::new();
        for (rid, row) in self.scan_latest()? {
            if let Some(&value) = row.get(column) {
                if begin <= value && value <= end {
                    result.insert(rid);
                }
            }
        }
        Ok(result)
    }

    fn scan_latest(&self) -> EngineResult<Vec<(Rid, Vec<i64>)>> {
        let base_rids: Vec<Rid> = {
            let directory = self.directory.read();
            directory
                .iter()
                .filter(|(_, loc)| !loc.is_tail)
                .map(|(&rid, _)| rid)
                .collect()
        };

        let mut rows = Vec::new();
        for rid in base_rids {
            if let Some((values, _)) = self.get_latest_version(rid)? {
                rows.push((rid, values));
            }
        }
        Ok(rows)
    }

    /// Populate an index on `column` from the latest version of every base
    /// record. A no-op when the index already exists.
    pub fn build_index(&self, column: usize) -> EngineResult<()> {
        if column >= self.num_columns {
            return Err(EngineError::IntegrityViolation(format!(
                "no such column {column}"
            )));
        }
        let mut index = self.index.lock();
        if index.has_index(column) {
            return Ok(());
        }

        let base_rids: Vec<Rid> = {
            let directory = self.directory.read();
            directory
                .iter()
                .filter(|(_, loc)| !loc.is_tail)
                .map(|(&rid, _)| rid)
                .collect()
        };
        let mut entries = Vec::new();
        for rid in base_rids {
            if let Some((values, _)) = self.get_latest_version(rid)? {
                entries.push((values[column], rid));
            }
        }
        index.set_column(column, ColumnIndex::build(entries));
        Ok(())
    }

    /// The key column's index cannot be dropped.
    pub fn drop_index(&self, column: usize) {
        if column == self.key {
            return;
        }
        self.index.lock().drop_column(column);
    }

    pub fn has_index(&self, column: usize) -> bool {
        self.index.lock().has_index(column)
    }

    // ------------------------------------------------------------------
    // Rollback journal

    fn journal_op(&self, tx: Option<TxId>, rid: Rid, op: JournalOp) {
        if let Some(tx) = tx {
            self.journal.lock().push(JournalEntry { tx, rid, op });
        }
    }

    /// Discard a committed transaction's journal entries.
    pub fn discard_journal(&self, tx: TxId) {
        self.journal.lock().retain(|entry| entry.tx != tx);
    }

    /// Undo every journaled operation of `tx`, newest first. Tail records
    /// written by an aborted update stay in place; they become unreachable
    /// once the base indirection is restored.
    pub fn rollback_transaction(&self, tx: TxId) {
        let mine: Vec<JournalEntry> = {
            let mut journal = self.journal.lock();
            let mut mine = Vec::new();
            let mut keep = Vec::new();
            for entry in journal.drain(..) {
                if entry.tx == tx {
                    mine.push(entry);
                } else {
                    keep.push(entry);
                }
            }
            *journal = keep;
            mine
        };

        for entry in mine.into_iter().rev() {
            if let Err(err) = self.rollback_entry(entry) {
                crate::lstore_debug_log!("[Table::rollback] {} failed: {err:?}", self.name);
            }
        }
    }

    fn rollback_entry(&self, entry: JournalEntry) -> EngineResult<()> {
        let rid = entry.rid;
        match entry.op {
            JournalOp::Insert => {
                // Index cleanup needs the record's values before the
                // tombstone lands.
                let latest = self.get_latest_version(rid)?;
                if let Some((values, _)) = latest {
                    let mut index = self.index.lock();
                    for column in index.indexed_columns() {
                        index.delete(column, values[column], rid);
                    }
                }

                if let Some(loc) = self.location(rid) {
                    if !loc.is_tail {
                        if let Some(range) = self.range(loc.range) {
                            range
                                .lock()
                                .write_base_columns(loc.offset, &[(RID_COLUMN, DELETED_RID as i64)])?;
                        }
                    }
                }
                self.directory.write().remove(&rid);
            }
            JournalOp::Update {
                base_image,
                index_transitions,
            } => {
                let Some(loc) = self.location(rid) else {
                    return Err(EngineError::NotFound);
                };
                let Some(range) = self.range(loc.range) else {
                    return Err(EngineError::NotFound);
                };
                let restore: Vec<(usize, i64)> = base_image.iter().copied().enumerate().collect();
                range.lock().write_base_columns(loc.offset, &restore)?;

                let mut index = self.index.lock();
                for &(column, old_value, new_value) in index_transitions.iter().rev() {
                    index.update(column, new_value, old_value, rid);
                }
            }
            JournalOp::Delete {
                base_image,
                latest_values,
            } => {
                let Some(loc) = self.location(rid) else {
                    return Err(EngineError::NotFound);
                };
                let Some(range) = self.range(loc.range) else {
                    return Err(EngineError::NotFound);
                };
                range
                    .lock()
                    .write_base_columns(loc.offset, &[(RID_COLUMN, base_image[RID_COLUMN])])?;

                let mut index = self.index.lock();
                for column in index.indexed_columns() {
                    index.insert(column, latest_values[column], rid);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Merge

    pub fn updates_since_merge(&self) -> usize {
        self.updates_since_merge.load(Ordering::SeqCst)
    }

    /// Run one merge pass unless another is already in progress.
    pub fn merge(&self) {
        let Some(_running) = self.merge_in_progress.try_lock() else {
            return;
        };
        if let Err(err) = self.merge_pass() {
            crate::lstore_debug_log!("[Table::merge] {} pass failed: {err:?}", self.name);
        }
        self.updates_since_merge.store(0, Ordering::SeqCst);
    }

    /// Consolidate the RIDs dirtied since the last pass: advance per-page
    /// TPS to the newest merged tail RID. Base user columns are left
    /// untouched so every historical version stays reachable.
    fn merge_pass(&self) -> EngineResult<()> {
        let rids: Vec<Rid> = {
            let mut dirty = self.dirty_rids.lock();
            dirty.drain().collect()
        };
        if rids.is_empty() {
            return Ok(());
        }
        crate::lstore_debug_log!("[Table::merge] {} merging {} rids", self.name, rids.len());

        let mut by_range: HashMap<usize, Vec<(Rid, usize)>> = HashMap::new();
        {
            let directory = self.directory.read();
            for rid in rids {
                if let Some(loc) = directory.get(&rid) {
                    if !loc.is_tail {
                        by_range.entry(loc.range).or_default().push((rid, loc.offset));
                    }
                }
            }
        }

        let ranges: Vec<Arc<PageRange>> = self.roster.lock().ranges.clone();
        for (range_idx, batch) in by_range {
            let Some(range) = ranges.get(range_idx) else {
                continue;
            };
            let Some(mut guard) = range.try_lock() else {
                // Writers own this range right now; try again next pass.
                self.dirty_rids
                    .lock()
                    .extend(batch.iter().map(|&(rid, _)| rid));
                continue;
            };

            for (rid, offset) in batch {
                let base = match guard.read_base(offset) {
                    Ok(record) => record,
                    Err(_) => continue,
                };
                if base[RID_COLUMN] as u64 == DELETED_RID {
                    continue;
                }
                let tail_rid = base[INDIRECTION_COLUMN] as u64;
                if tail_rid == DELETED_RID {
                    continue;
                }
                if tail_rid <= guard.base_tps(offset)? {
                    continue;
                }

                // Latest-version reads may touch tails in other ranges;
                // never hold two range locks at once.
                drop(guard);
                let latest = self.get_latest_version(rid)?;
                guard = range.lock();

                if latest.is_none() {
                    continue;
                }
                guard.raise_base_tps(offset, tail_rid)?;
            }
        }
        Ok(())
    }
}
