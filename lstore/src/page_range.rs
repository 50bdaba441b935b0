//! A page range groups the per-column base and tail pages that back one
//! slice of a table's records.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use strata::{BufferPool, PageGuard, PageKey, PageKind};

use crate::config::{RANGE_CAPACITY, RECORDS_PER_PAGE, RID_COLUMN};
use crate::errors::{EngineError, EngineResult};

/// Persistable counters of a page range, stored in the table metadata blob.
#[derive(Debug, Clone)]
pub struct RangeSnapshot {
    pub num_base_records: usize,
    pub num_tail_records: usize,
    pub base_pages_per_col: Vec<usize>,
    pub tail_pages_per_col: Vec<usize>,
}

struct RangeInner {
    num_base_records: usize,
    num_tail_records: usize,
    base_pages_per_col: Vec<usize>,
    tail_pages_per_col: Vec<usize>,
}

/// Manages a range of base and tail pages. All data flow into the range
/// (appends, column overwrites, consistent full-record reads, TPS updates)
/// runs through a [`RangeGuard`] obtained from [`PageRange::lock`] or the
/// non-blocking [`PageRange::try_lock`] used by the merger.
pub struct PageRange {
    table: Arc<str>,
    range_idx: usize,
    total_columns: usize,
    pool: Arc<BufferPool>,
    inner: Mutex<RangeInner>,
}

impl PageRange {
    pub fn new(
        table: Arc<str>,
        range_idx: usize,
        total_columns: usize,
        pool: Arc<BufferPool>,
    ) -> Self {
        Self {
            table,
            range_idx,
            total_columns,
            pool,
            inner: Mutex::new(RangeInner {
                num_base_records: 0,
                num_tail_records: 0,
                base_pages_per_col: vec![1; total_columns],
                tail_pages_per_col: vec![1; total_columns],
            }),
        }
    }

    /// Rebuild a range from persisted counters.
    pub fn restore(
        table: Arc<str>,
        range_idx: usize,
        total_columns: usize,
        pool: Arc<BufferPool>,
        snapshot: RangeSnapshot,
    ) -> Self {
        Self {
            table,
            range_idx,
            total_columns,
            pool,
            inner: Mutex::new(RangeInner {
                num_base_records: snapshot.num_base_records,
                num_tail_records: snapshot.num_tail_records,
                base_pages_per_col: snapshot.base_pages_per_col,
                tail_pages_per_col: snapshot.tail_pages_per_col,
            }),
        }
    }

    pub fn range_idx(&self) -> usize {
        self.range_idx
    }

    pub fn lock(&self) -> RangeGuard<'_> {
        RangeGuard {
            range: self,
            inner: self.inner.lock(),
        }
    }

    /// Non-blocking acquisition for the merger.
    pub fn try_lock(&self) -> Option<RangeGuard<'_>> {
        self.inner.try_lock().map(|inner| RangeGuard { range: self, inner })
    }

    pub fn has_capacity(&self) -> bool {
        self.inner.lock().num_base_records < RANGE_CAPACITY
    }

    pub fn num_tail_records(&self) -> usize {
        self.inner.lock().num_tail_records
    }

    pub fn snapshot(&self) -> RangeSnapshot {
        let inner = self.inner.lock();
        RangeSnapshot {
            num_base_records: inner.num_base_records,
            num_tail_records: inner.num_tail_records,
            base_pages_per_col: inner.base_pages_per_col.clone(),
            tail_pages_per_col: inner.tail_pages_per_col.clone(),
        }
    }

    fn fix_page(&self, kind: PageKind, column: usize, page: usize) -> EngineResult<PageGuard> {
        let key = PageKey {
            table: Arc::clone(&self.table),
            kind,
            column,
            range: self.range_idx,
            page,
        };
        Ok(self.pool.fix(&key)?)
    }
}

/// Exclusive access to one page range's structure and data.
pub struct RangeGuard<'a> {
    range: &'a PageRange,
    inner: MutexGuard<'a, RangeInner>,
}

impl RangeGuard<'_> {
    pub fn base_is_full(&self) -> bool {
        self.inner.num_base_records >= RANGE_CAPACITY
    }

    pub fn tail_is_full(&self) -> bool {
        self.inner.num_tail_records >= RANGE_CAPACITY
    }

    pub fn num_base_records(&self) -> usize {
        self.inner.num_base_records
    }

    /// Append a full base record (metadata plus user columns). Returns the
    /// record's offset within the range.
    pub fn append_base(&mut self, record: &[i64]) -> EngineResult<usize> {
        debug_assert_eq!(record.len(), self.range.total_columns);
        let offset = self.inner.num_base_records;
        let page_index = offset / RECORDS_PER_PAGE;
        let slot = offset % RECORDS_PER_PAGE;

        for (col, &value) in record.iter().enumerate() {
            if page_index >= self.inner.base_pages_per_col[col] {
                self.inner.base_pages_per_col[col] = page_index + 1;
            }
            let guard = self.range.fix_page(PageKind::Base, col, page_index)?;
            let mut page = guard.write();
            if page.num_records == 0 && slot > 0 {
                page.num_records = slot;
            }
            if page.append(value) != Some(slot) {
                return Err(EngineError::BoundsViolation);
            }
        }

        self.inner.num_base_records += 1;
        Ok(offset)
    }

    /// Append a full tail record. Returns the tail offset within the range.
    pub fn append_tail(&mut self, record: &[i64]) -> EngineResult<usize> {
        debug_assert_eq!(record.len(), self.range.total_columns);
        let offset = self.inner.num_tail_records;
        let page_index = offset / RECORDS_PER_PAGE;
        let slot = offset % RECORDS_PER_PAGE;

        for (col, &value) in record.iter().enumerate() {
            if page_index >= self.inner.tail_pages_per_col[col] {
                self.inner.tail_pages_per_col[col] = page_index + 1;
            }
            let guard = self.range.fix_page(PageKind::Tail, col, page_index)?;
            let mut page = guard.write();
            if page.num_records == 0 && slot > 0 {
                page.num_records = slot;
            }
            if page.append(value) != Some(slot) {
                return Err(EngineError::BoundsViolation);
            }
        }

        self.inner.num_tail_records += 1;
        Ok(offset)
    }

    pub fn read_base(&self, offset: usize) -> EngineResult<Vec<i64>> {
        self.read_record(PageKind::Base, offset, self.inner.num_base_records)
    }

    pub fn read_tail(&self, offset: usize) -> EngineResult<Vec<i64>> {
        self.read_record(PageKind::Tail, offset, self.inner.num_tail_records)
    }

    fn read_record(
        &self,
        kind: PageKind,
        offset: usize,
        total_records: usize,
    ) -> EngineResult<Vec<i64>> {
        if offset >= total_records {
            return Err(EngineError::BoundsViolation);
        }
        let page_index = offset / RECORDS_PER_PAGE;
        let slot = offset % RECORDS_PER_PAGE;

        let mut record = Vec::with_capacity(self.range.total_columns);
        for col in 0..self.range.total_columns {
            let guard = self.range.fix_page(kind, col, page_index)?;
            self.repair_slot_count(&guard, page_index, total_records);
            let value = guard
                .read()
                .read(slot)
                .ok_or(EngineError::BoundsViolation)?;
            record.push(value);
        }
        Ok(record)
    }

    /// Overwrite individual columns of a base record in place.
    pub fn write_base_columns(
        &mut self,
        offset: usize,
        updates: &[(usize, i64)],
    ) -> EngineResult<()> {
        if offset >= self.inner.num_base_records {
            return Err(EngineError::BoundsViolation);
        }
        let page_index = offset / RECORDS_PER_PAGE;
        let slot = offset % RECORDS_PER_PAGE;

        for &(col, value) in updates {
            let guard = self.range.fix_page(PageKind::Base, col, page_index)?;
            self.repair_slot_count(&guard, page_index, self.inner.num_base_records);
            if !guard.write().update(slot, value) {
                return Err(EngineError::BoundsViolation);
            }
        }
        Ok(())
    }

    /// Current TPS of the base page holding `offset`. TPS is tracked on the
    /// RID-column page of each page index.
    pub fn base_tps(&self, offset: usize) -> EngineResult<u64> {
        let page_index = offset / RECORDS_PER_PAGE;
        let guard = self.range.fix_page(PageKind::Base, RID_COLUMN, page_index)?;
        let tps = guard.read().get_tps();
        Ok(tps)
    }

    /// Advance the TPS of the base page holding `offset`. Never lowers it.
    pub fn raise_base_tps(&mut self, offset: usize, tps: u64) -> EngineResult<()> {
        let page_index = offset / RECORDS_PER_PAGE;
        let guard = self.range.fix_page(PageKind::Base, RID_COLUMN, page_index)?;
        let mut page = guard.write();
        if tps > page.get_tps() {
            page.set_tps(tps);
        }
        Ok(())
    }

    /// A page that was evicted and re-read from disk comes back with a zero
    /// slot count; restore it from the range-level record totals before
    /// touching its slots.
    fn repair_slot_count(&self, guard: &PageGuard, page_index: usize, total_records: usize) {
        let expected = total_records
            .saturating_sub(page_index * RECORDS_PER_PAGE)
            .min(RECORDS_PER_PAGE);
        if expected == 0 {
            return;
        }
        if guard.read().num_records == 0 {
            guard.write_transient().num_records = expected;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NUM_METADATA_COLUMNS;
    use strata::DiskManager;
    use tempfile::tempdir;

    const COLS: usize = NUM_METADATA_COLUMNS + 2;

    fn range_with_pool(capacity: usize) -> (tempfile::TempDir, PageRange) {
        let dir = tempdir().unwrap();
        let disk = DiskManager::open(dir.path()).unwrap();
        let pool = Arc::new(BufferPool::new(disk, capacity));
        let range = PageRange::new(Arc::from("t"), 0, COLS, pool);
        (dir, range)
    }

    fn record(seed: i64) -> Vec<i64> {
        (0..COLS as i64).map(|c| seed * 100 + c).collect()
    }

    #[test]
    fn appended_base_records_read_back_across_page_boundaries() {
        let (_dir, range) = range_with_pool(256);
        let mut guard = range.lock();
        for i in 0..(RECORDS_PER_PAGE + 5) as i64 {
            assert_eq!(guard.append_base(&record(i)).unwrap(), i as usize);
        }
        assert_eq!(guard.read_base(0).unwrap(), record(0));
        assert_eq!(
            guard.read_base(RECORDS_PER_PAGE + 2).unwrap(),
            record(RECORDS_PER_PAGE as i64 + 2)
        );
    }

    #[test]
    fn tail_records_are_tracked_independently() {
        let (_dir, range) = range_with_pool(256);
        let mut guard = range.lock();
        guard.append_base(&record(1)).unwrap();
        guard.append_tail(&record(2)).unwrap();
        guard.append_tail(&record(3)).unwrap();

        assert_eq!(guard.read_tail(1).unwrap(), record(3));
        drop(guard);
        assert_eq!(range.num_tail_records(), 2);
        assert!(range.has_capacity());
    }

    #[test]
    fn column_overwrite_is_visible_to_reads() {
        let (_dir, range) = range_with_pool(256);
        let mut guard = range.lock();
        let offset = guard.append_base(&record(1)).unwrap();
        guard.write_base_columns(offset, &[(0, 42), (5, -9)]).unwrap();

        let row = guard.read_base(offset).unwrap();
        assert_eq!(row[0], 42);
        assert_eq!(row[5], -9);
        assert_eq!(row[1], record(1)[1]);
    }

    #[test]
    fn out_of_range_offsets_are_rejected() {
        let (_dir, range) = range_with_pool(256);
        let mut guard = range.lock();
        guard.append_base(&record(1)).unwrap();

        assert!(matches!(
            guard.read_base(1),
            Err(EngineError::BoundsViolation)
        ));
        assert!(matches!(
            guard.write_base_columns(7, &[(0, 1)]),
            Err(EngineError::BoundsViolation)
        ));
    }

    #[test]
    fn slot_counts_survive_eviction_and_reload() {
        // A pool this small churns every page through eviction.
        let (_dir, range) = range_with_pool(2);
        {
            let mut guard = range.lock();
            for i in 0..20 {
                guard.append_base(&record(i)).unwrap();
            }
        }
        let guard = range.lock();
        for i in 0..20 {
            assert_eq!(guard.read_base(i as usize).unwrap(), record(i));
        }
    }

    #[test]
    fn tps_is_monotone_per_base_page() {
        let (_dir, range) = range_with_pool(256);
        let mut guard = range.lock();
        guard.append_base(&record(1)).unwrap();

        assert_eq!(guard.base_tps(0).unwrap(), 0);
        guard.raise_base_tps(0, 9).unwrap();
        assert_eq!(guard.base_tps(0).unwrap(), 9);
        guard.raise_base_tps(0, 4).unwrap();
        assert_eq!(guard.base_tps(0).unwrap(), 9);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let (_dir, range) = range_with_pool(256);
        let guard = range.lock();
        assert!(range.try_lock().is_none());
        drop(guard);
        assert!(range.try_lock().is_some());
    }
}
