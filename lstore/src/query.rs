//! The fixed query primitives over a single table.
//!
//! Every primitive collapses internal typed errors to the false/empty
//! convention at this boundary: a `false` or `None` return means "failed or
//! not found", and nothing below this layer panics the engine.

use std::sync::Arc;

use strata::lock_manager::TxId;

use crate::table::{Rid, Table};

/// One query result row: the matched record's RID, its primary key, and the
/// projected column values (`None` where the projection mask is off).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub rid: Rid,
    pub key: i64,
    pub columns: Vec<Option<i64>>,
}

/// Performs the fixed query primitives on the specified table.
pub struct Query {
    table: Arc<Table>,
}

impl Query {
    pub fn new(table: Arc<Table>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    pub fn insert(&self, values: &[i64]) -> bool {
        self.insert_with(None, values)
    }

    pub(crate) fn insert_with(&self, tx: Option<TxId>, values: &[i64]) -> bool {
        match self.table.insert(tx, values) {
            Ok(_) => true,
            Err(err) => {
                crate::lstore_debug_log!("[Query::insert] failed: {err:?}");
                false
            }
        }
    }

    /// Records whose latest value in `search_column` equals `search_key`.
    /// Falls back to a full scan when the column has no index.
    pub fn select(
        &self,
        search_key: i64,
        search_column: usize,
        projection: &[bool],
    ) -> Option<Vec<Record>> {
        self.select_version(search_key, search_column, projection, 0)
    }

    /// Like `select`, but each record is materialized at relative version
    /// `relative` (0 = latest, -n = n versions back).
    pub fn select_version(
        &self,
        search_key: i64,
        search_column: usize,
        projection: &[bool],
        relative: i64,
    ) -> Option<Vec<Record>> {
        if search_column >= self.table.num_columns()
            || projection.len() != self.table.num_columns()
        {
            return None;
        }

        let rids = self.table.locate(search_column, search_key).ok()?;
        let mut results = Vec::new();
        for rid in rids {
            let versioned = self.table.get_version(rid, relative).ok()?;
            let Some((values, _)) = versioned else {
                continue;
            };
            results.push(Record {
                rid,
                key: values[self.table.key_column()],
                columns: values
                    .iter()
                    .zip(projection)
                    .map(|(&value, &keep)| if keep { Some(value) } else { None })
                    .collect(),
            });
        }
        Some(results)
    }

    /// Update the record with the given primary key; `None` entries leave
    /// their column unchanged. Changing the key onto an existing key fails.
    pub fn update(&self, primary_key: i64, updates: &[Option<i64>]) -> bool {
        self.update_with(None, primary_key, updates)
    }

    pub(crate) fn update_with(
        &self,
        tx: Option<TxId>,
        primary_key: i64,
        updates: &[Option<i64>],
    ) -> bool {
        let key_column = self.table.key_column();
        if updates.len() != self.table.num_columns() {
            return false;
        }

        if let Some(new_key) = updates[key_column] {
            if new_key != primary_key {
                match self.table.locate(key_column, new_key) {
                    Ok(existing) if !existing.is_empty() => return false,
                    Ok(_) => {}
                    Err(_) => return false,
                }
            }
        }

        let Ok(rids) = self.table.locate(key_column, primary_key) else {
            return false;
        };
        if rids.is_empty() {
            return false;
        }
        for rid in rids {
            if self.table.update_record(tx, rid, updates).is_err() {
                return false;
            }
        }
        true
    }

    pub fn delete(&self, primary_key: i64) -> bool {
        self.delete_with(None, primary_key)
    }

    pub(crate) fn delete_with(&self, tx: Option<TxId>, primary_key: i64) -> bool {
        let Ok(rids) = self.table.locate(self.table.key_column(), primary_key) else {
            return false;
        };
        if rids.is_empty() {
            return false;
        }
        for rid in rids {
            if self.table.delete_record(tx, rid).is_err() {
                return false;
            }
        }
        true
    }

    /// Sum of `aggregate_column` over the latest versions of records whose
    /// primary key lies in `[start, end]`. `None` when the range is empty.
    pub fn sum(&self, start: i64, end: i64, aggregate_column: usize) -> Option<i64> {
        self.sum_version(start, end, aggregate_column, 0)
    }

    pub fn sum_version(
        &self,
        start: i64,
        end: i64,
        aggregate_column: usize,
        relative: i64,
    ) -> Option<i64> {
        if aggregate_column >= self.table.num_columns() {
            return None;
        }
        let rids = self
            .table
            .locate_range(start, end, self.table.key_column())
            .ok()?;
        if rids.is_empty() {
            return None;
        }

        let mut total = 0i64;
        for rid in rids {
            let versioned = self.table.get_version(rid, relative).ok()?;
            if let Some((values, _)) = versioned {
                total += values[aggregate_column];
            }
        }
        Some(total)
    }

    /// Add one to `column` of the record with the given primary key:
    /// a select plus an update, atomic within the caller's transaction.
    pub fn increment(&self, primary_key: i64, column: usize) -> bool {
        self.increment_with(None, primary_key, column)
    }

    pub(crate) fn increment_with(
        &self,
        tx: Option<TxId>,
        primary_key: i64,
        column: usize,
    ) -> bool {
        if column >= self.table.num_columns() {
            return false;
        }
        let Ok(rids) = self.table.locate(self.table.key_column(), primary_key) else {
            return false;
        };
        let Some(&rid) = rids.iter().next() else {
            return false;
        };
        let Ok(Some((values, _))) = self.table.get_latest_version(rid) else {
            return false;
        };

        let mut updates = vec![None; self.table.num_columns()];
        updates[column] = Some(values[column] + 1);
        self.table.update_record(tx, rid, &updates).is_ok()
    }
}
