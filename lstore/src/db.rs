//! The database façade: owns the disk-backed buffer pool, the lock
//! manager, and the tables, and persists per-table metadata at close.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use serde::{Deserialize, Serialize};
use strata::{BufferPool, DiskManager, LockManager};

use crate::config::BUFFERPOOL_CAPACITY;
use crate::errors::{EngineError, EngineResult};
use crate::page_range::RangeSnapshot;
use crate::table::{RecordLocation, Rid, Table, TableState};
use crate::transaction::Transaction;

/// The on-disk shape of a table's `meta.json` blob. Logical structure only:
/// record counts, page counts, and the page directory. Page bytes are
/// already on disk.
#[derive(Serialize, Deserialize)]
struct TableMeta {
    num_columns: usize,
    key_index: usize,
    next_rid: u64,
    page_ranges: Vec<RangeMeta>,
    page_directory: HashMap<Rid, LocationMeta>,
    current_range_idx: Option<usize>,
    current_tail_range_idx: Option<usize>,
    updates_since_merge: usize,
    indexed_columns: Vec<usize>,
}

#[derive(Serialize, Deserialize)]
struct RangeMeta {
    num_base_records: usize,
    num_tail_records: usize,
    num_base_pages_per_col: Vec<usize>,
    num_tail_pages_per_col: Vec<usize>,
}

#[derive(Serialize, Deserialize)]
struct LocationMeta {
    range_idx: usize,
    is_tail: bool,
    offset: usize,
}

impl TableMeta {
    fn from_state(state: &TableState) -> Self {
        Self {
            num_columns: state.num_columns,
            key_index: state.key,
            next_rid: state.next_rid,
            page_ranges: state
                .ranges
                .iter()
                .map(|range| RangeMeta {
                    num_base_records: range.num_base_records,
                    num_tail_records: range.num_tail_records,
                    num_base_pages_per_col: range.base_pages_per_col.clone(),
                    num_tail_pages_per_col: range.tail_pages_per_col.clone(),
                })
                .collect(),
            page_directory: state
                .directory
                .iter()
                .map(|(&rid, loc)| {
                    (
                        rid,
                        LocationMeta {
                            range_idx: loc.range,
                            is_tail: loc.is_tail,
                            offset: loc.offset,
                        },
                    )
                })
                .collect(),
            current_range_idx: state.current_base,
            current_tail_range_idx: state.current_tail,
            updates_since_merge: state.updates_since_merge,
            indexed_columns: state.indexed_columns.clone(),
        }
    }

    fn into_state(self, name: String) -> TableState {
        TableState {
            name,
            num_columns: self.num_columns,
            key: self.key_index,
            next_rid: self.next_rid,
            updates_since_merge: self.updates_since_merge,
            ranges: self
                .page_ranges
                .into_iter()
                .map(|range| RangeSnapshot {
                    num_base_records: range.num_base_records,
                    num_tail_records: range.num_tail_records,
                    base_pages_per_col: range.num_base_pages_per_col,
                    tail_pages_per_col: range.num_tail_pages_per_col,
                })
                .collect(),
            directory: self
                .page_directory
                .into_iter()
                .map(|(rid, loc)| {
                    (
                        rid,
                        RecordLocation {
                            range: loc.range_idx,
                            is_tail: loc.is_tail,
                            offset: loc.offset,
                        },
                    )
                })
                .collect(),
            current_base: self.current_range_idx,
            current_tail: self.current_tail_range_idx,
            indexed_columns: self.indexed_columns,
        }
    }
}

/// Owns every engine-wide service; nothing in the engine is process-global.
pub struct Database {
    pool: Option<Arc<BufferPool>>,
    lock_manager: Arc<LockManager>,
    next_tx_id: Arc<AtomicU64>,
    tables: HashMap<String, Arc<Table>>,
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl Database {
    pub fn new() -> Self {
        Self {
            pool: None,
            lock_manager: Arc::new(LockManager::new()),
            next_tx_id: Arc::new(AtomicU64::new(1)),
            tables: HashMap::new(),
        }
    }

    /// Attach to `path`, loading every table that left a metadata blob.
    pub fn open<P: AsRef<Path>>(&mut self, path: P) -> EngineResult<()> {
        let disk = DiskManager::open(path)?;
        let names = disk.list_tables()?;
        let pool = Arc::new(BufferPool::new(disk, BUFFERPOOL_CAPACITY));
        self.pool = Some(Arc::clone(&pool));

        for name in names {
            let Some(blob) = pool.disk().read_meta(&name)? else {
                continue;
            };
            let meta: TableMeta = serde_json::from_value(blob).map_err(io::Error::from)?;
            let table = Table::restore(meta.into_state(name.clone()), Arc::clone(&pool))?;
            self.tables.insert(name, table);
        }
        crate::lstore_debug_log!("[Database::open] loaded {} tables", self.tables.len());
        Ok(())
    }

    /// Stop every merger, flush the pool, and write table metadata. The
    /// mergers must be joined before the flush so they cannot redirty
    /// already-flushed pages.
    pub fn close(&mut self) -> EngineResult<()> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };

        for table in self.tables.values() {
            table.stop_merge_thread();
        }
        pool.flush_all()?;
        for (name, table) in &self.tables {
            let meta = TableMeta::from_state(&table.snapshot_state());
            let blob = serde_json::to_value(&meta).map_err(io::Error::from)?;
            pool.disk().write_meta(name, &blob)?;
        }
        crate::lstore_debug_log!("[Database::close] flushed {} tables", self.tables.len());
        Ok(())
    }

    /// Create a table. Re-creating an existing name resets it: the old
    /// merger stops and its pages, frames, and metadata are discarded.
    pub fn create_table(
        &mut self,
        name: &str,
        num_columns: usize,
        key_index: usize,
    ) -> EngineResult<Arc<Table>> {
        let pool = self.open_pool()?;
        if let Some(old) = self.tables.remove(name) {
            old.stop_merge_thread();
            pool.drop_table_frames(name);
            pool.disk().remove_table(name)?;
        }

        let table = Table::create(name, num_columns, key_index, pool);
        self.tables.insert(name.to_string(), Arc::clone(&table));
        Ok(table)
    }

    pub fn drop_table(&mut self, name: &str) -> EngineResult<()> {
        let Some(table) = self.tables.remove(name) else {
            return Err(EngineError::NotFound);
        };
        table.stop_merge_thread();
        if let Some(pool) = &self.pool {
            pool.drop_table_frames(name);
        }
        Ok(())
    }

    pub fn get_table(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.get(name).cloned()
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn create_transaction(&self) -> Transaction {
        Transaction::new(Arc::clone(&self.lock_manager), Arc::clone(&self.next_tx_id))
    }

    fn open_pool(&self) -> EngineResult<Arc<BufferPool>> {
        self.pool
            .clone()
            .ok_or_else(|| EngineError::Persistence(io::Error::other("database is not open")))
    }
}
