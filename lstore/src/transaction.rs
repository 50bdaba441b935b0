//! The strict-2PL transaction runner.
//!
//! A transaction is an ordered batch of query operations. Running it has
//! three phases: grow (acquire every lock the batch needs, aborting on the
//! first refusal), execute (any failed operation aborts), and shrink
//! (release everything; an abort first rolls back every touched table).
//! Aborted runs retry under exponential backoff with random jitter, taking
//! a fresh transaction id each attempt.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use rand::Rng;
use strata::lock_manager::{LockKey, LockManager, LockMode, TxId};

use crate::config::{MAX_RETRIES, MAX_RETRY_DELAY, RETRY_BACKOFF_MULTIPLIER, RETRY_DELAY};
use crate::query::Query;
use crate::table::Table;

/// One queued query operation.
pub enum QueryOp {
    Insert {
        values: Vec<i64>,
    },
    Select {
        search_key: i64,
        search_column: usize,
        projection: Vec<bool>,
    },
    SelectVersion {
        search_key: i64,
        search_column: usize,
        projection: Vec<bool>,
        relative: i64,
    },
    Update {
        primary_key: i64,
        updates: Vec<Option<i64>>,
    },
    Delete {
        primary_key: i64,
    },
    Sum {
        start: i64,
        end: i64,
        aggregate_column: usize,
    },
    SumVersion {
        start: i64,
        end: i64,
        aggregate_column: usize,
        relative: i64,
    },
    Increment {
        primary_key: i64,
        column: usize,
    },
}

pub struct Transaction {
    id: TxId,
    id_source: Arc<AtomicU64>,
    lock_manager: Arc<LockManager>,
    queries: Vec<(Arc<Table>, QueryOp)>,
}

impl Transaction {
    pub fn new(lock_manager: Arc<LockManager>, id_source: Arc<AtomicU64>) -> Self {
        let id = id_source.fetch_add(1, Ordering::SeqCst);
        Self {
            id,
            id_source,
            lock_manager,
            queries: Vec::new(),
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    /// Queue `op` against `table`; operations execute in insertion order.
    pub fn add_query(&mut self, table: Arc<Table>, op: QueryOp) {
        self.queries.push((table, op));
    }

    /// Run to commit, retrying aborted attempts with exponential backoff.
    pub fn run(&mut self) -> bool {
        let mut delay = RETRY_DELAY;
        for attempt in 0..MAX_RETRIES {
            if self.run_once() {
                return true;
            }
            if attempt + 1 == MAX_RETRIES {
                break;
            }

            let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64);
            thread::sleep(delay + Duration::from_millis(jitter));
            delay = delay.mul_f64(RETRY_BACKOFF_MULTIPLIER).min(MAX_RETRY_DELAY);

            // Retry under a fresh identity with an empty lock set and journal.
            self.id = self.id_source.fetch_add(1, Ordering::SeqCst);
            crate::lstore_debug_log!(
                "[Transaction::run] retrying as tx {} (attempt {})",
                self.id,
                attempt + 2
            );
        }
        false
    }

    /// One grow/execute/shrink attempt with no retry. Aborted attempts roll
    /// back every touched table and release all locks before returning.
    pub fn run_once(&self) -> bool {
        // Grow: acquire every lock up front; the first refusal aborts.
        for (table, op) in &self.queries {
            let Some(locks) = self.lock_set(table, op) else {
                return self.abort();
            };
            for (key, mode) in locks {
                if !self.lock_manager.acquire(self.id, key, mode) {
                    return self.abort();
                }
            }
        }

        // Execute in insertion order; any failure aborts.
        for (table, op) in &self.queries {
            if !self.execute(table, op) {
                return self.abort();
            }
        }

        self.commit()
    }

    /// The locks an operation needs: shared for reads and aggregates,
    /// exclusive for mutations, and a table-level pseudo-lock for inserts
    /// (which have no RID yet).
    fn lock_set(&self, table: &Arc<Table>, op: &QueryOp) -> Option<Vec<(LockKey, LockMode)>> {
        fn record_locks(
            table: &Arc<Table>,
            rids: impl IntoIterator<Item = u64>,
            mode: LockMode,
        ) -> Vec<(LockKey, LockMode)> {
            rids.into_iter()
                .map(|rid| {
                    (
                        LockKey::Record {
                            table: Arc::clone(table.name()),
                            rid,
                        },
                        mode,
                    )
                })
                .collect()
        }

        let locks = match op {
            QueryOp::Insert { .. } => vec![(
                LockKey::Table {
                    table: Arc::clone(table.name()),
                },
                LockMode::Exclusive,
            )],
            QueryOp::Select {
                search_key,
                search_column,
                ..
            }
            | QueryOp::SelectVersion {
                search_key,
                search_column,
                ..
            } => record_locks(
                table,
                table.locate(*search_column, *search_key).ok()?,
                LockMode::Shared,
            ),
            QueryOp::Update { primary_key, .. }
            | QueryOp::Delete { primary_key }
            | QueryOp::Increment { primary_key, .. } => record_locks(
                table,
                table.locate(table.key_column(), *primary_key).ok()?,
                LockMode::Exclusive,
            ),
            QueryOp::Sum { start, end, .. } | QueryOp::SumVersion { start, end, .. } => {
                record_locks(
                    table,
                    table.locate_range(*start, *end, table.key_column()).ok()?,
                    LockMode::Shared,
                )
            }
        };
        Some(locks)
    }

    fn execute(&self, table: &Arc<Table>, op: &QueryOp) -> bool {
        let query = Query::new(Arc::clone(table));
        let tx = Some(self.id);
        match op {
            QueryOp::Insert { values } => query.insert_with(tx, values),
            QueryOp::Select {
                search_key,
                search_column,
                projection,
            } => query
                .select_version(*search_key, *search_column, projection, 0)
                .is_some(),
            QueryOp::SelectVersion {
                search_key,
                search_column,
                projection,
                relative,
            } => query
                .select_version(*search_key, *search_column, projection, *relative)
                .is_some(),
            QueryOp::Update {
                primary_key,
                updates,
            } => query.update_with(tx, *primary_key, updates),
            QueryOp::Delete { primary_key } => query.delete_with(tx, *primary_key),
            QueryOp::Sum {
                start,
                end,
                aggregate_column,
            } => query.sum_version(*start, *end, *aggregate_column, 0).is_some(),
            QueryOp::SumVersion {
                start,
                end,
                aggregate_column,
                relative,
            } => query
                .sum_version(*start, *end, *aggregate_column, *relative)
                .is_some(),
            QueryOp::Increment {
                primary_key,
                column,
            } => query.increment_with(tx, *primary_key, *column),
        }
    }

    fn touched_tables(&self) -> Vec<Arc<Table>> {
        let mut tables: Vec<Arc<Table>> = Vec::new();
        for (table, _) in &self.queries {
            if !tables.iter().any(|seen| Arc::ptr_eq(seen, table)) {
                tables.push(Arc::clone(table));
            }
        }
        tables
    }

    fn abort(&self) -> bool {
        crate::lstore_debug_log!("[Transaction::abort] tx {}", self.id);
        for table in self.touched_tables() {
            table.rollback_transaction(self.id);
        }
        self.lock_manager.release_all(self.id);
        false
    }

    fn commit(&self) -> bool {
        for table in self.touched_tables() {
            table.discard_journal(self.id);
        }
        self.lock_manager.release_all(self.id);
        true
    }
}
