//! Manages the buffer pool, a bounded set of in-memory frames that cache
//! disk pages with LRU eviction over unpinned frames.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::disk::DiskManager;
use crate::{Page, PageKey};

/// A single frame in the buffer pool.
#[derive(Debug)]
struct Frame {
    page: RwLock<Page>,
    meta: Mutex<FrameMeta>,
}

#[derive(Debug)]
struct FrameMeta {
    pin_count: u32,
    dirty: bool,
    last_used: u64,
}

struct PoolState {
    frames: HashMap<PageKey, Arc<Frame>>,
    tick: u64,
}

/// The buffer pool manager. All structural operations (fix, flush, evict)
/// are serialized under one mutex; page content access goes through the
/// per-frame lock after the frame is pinned.
pub struct BufferPool {
    disk: DiskManager,
    capacity: usize,
    state: Mutex<PoolState>,
}

/// An RAII pin on a page. Dropping the guard unpins the frame.
#[derive(Debug)]
pub struct PageGuard {
    key: PageKey,
    frame: Arc<Frame>,
}

impl PageGuard {
    pub fn key(&self) -> &PageKey {
        &self.key
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.frame.page.read()
    }

    /// Mutable access; marks the frame dirty.
    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        self.frame.meta.lock().dirty = true;
        self.frame.page.write()
    }

    /// Mutable access without marking the frame dirty. For transient
    /// bookkeeping (slot-count repair after a reload) that does not change
    /// the page bytes.
    pub fn write_transient(&self) -> RwLockWriteGuard<'_, Page> {
        self.frame.page.write()
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        let mut meta = self.frame.meta.lock();
        if meta.pin_count > 0 {
            meta.pin_count -= 1;
        }
    }
}

impl BufferPool {
    pub fn new(disk: DiskManager, capacity: usize) -> Self {
        Self {
            disk,
            capacity: capacity.max(1),
            state: Mutex::new(PoolState {
                frames: HashMap::new(),
                tick: 0,
            }),
        }
    }

    pub fn disk(&self) -> &DiskManager {
        &self.disk
    }

    /// Return the pinned page for `key`, loading it from disk on a miss and
    /// evicting an unpinned victim when the pool is full.
    pub fn fix(&self, key: &PageKey) -> io::Result<PageGuard> {
        let mut state = self.state.lock();
        state.tick += 1;
        let tick = state.tick;

        if let Some(frame) = state.frames.get(key) {
            let frame = Arc::clone(frame);
            let mut meta = frame.meta.lock();
            meta.pin_count += 1;
            meta.last_used = tick;
            drop(meta);
            return Ok(PageGuard {
                key: key.clone(),
                frame,
            });
        }

        if state.frames.len() >= self.capacity {
            self.evict_one(&mut state)?;
        }

        crate::strata_debug_log!("[BufferPool::fix] Miss, loading {key:?}");
        let page = self.disk.read_page(key)?;
        let frame = Arc::new(Frame {
            page: RwLock::new(page),
            meta: Mutex::new(FrameMeta {
                pin_count: 1,
                dirty: false,
                last_used: tick,
            }),
        });
        state.frames.insert(key.clone(), Arc::clone(&frame));
        Ok(PageGuard {
            key: key.clone(),
            frame,
        })
    }

    /// Evict the least-recently-used unpinned frame, writing it back first
    /// when dirty. Fails when every frame is pinned.
    fn evict_one(&self, state: &mut PoolState) -> io::Result<()> {
        let mut victim: Option<(PageKey, u64)> = None;
        for (key, frame) in state.frames.iter() {
            let meta = frame.meta.lock();
            if meta.pin_count == 0
                && victim
                    .as_ref()
                    .map_or(true, |(_, used)| meta.last_used < *used)
            {
                victim = Some((key.clone(), meta.last_used));
            }
        }

        let Some((key, _)) = victim else {
            return Err(io::Error::other("all pages are pinned"));
        };

        let frame = Arc::clone(&state.frames[&key]);
        {
            let mut meta = frame.meta.lock();
            if meta.dirty {
                self.disk.write_page(&key, &frame.page.read())?;
                meta.dirty = false;
            }
        }
        crate::strata_debug_log!("[BufferPool::evict] Evicting {key:?}");
        state.frames.remove(&key);
        Ok(())
    }

    /// Write the page through if it is dirty.
    pub fn flush(&self, key: &PageKey) -> io::Result<()> {
        let state = self.state.lock();
        if let Some(frame) = state.frames.get(key) {
            let mut meta = frame.meta.lock();
            if meta.dirty {
                self.disk.write_page(key, &frame.page.read())?;
                meta.dirty = false;
            }
        }
        Ok(())
    }

    /// Write back every dirty frame. Called at close.
    pub fn flush_all(&self) -> io::Result<()> {
        let state = self.state.lock();
        for (key, frame) in state.frames.iter() {
            let mut meta = frame.meta.lock();
            if meta.dirty {
                self.disk.write_page(key, &frame.page.read())?;
                meta.dirty = false;
            }
        }
        Ok(())
    }

    /// Forget every frame belonging to `table` without writing it back.
    /// Used when a table is dropped or re-created under an existing name.
    pub fn drop_table_frames(&self, table: &str) {
        let mut state = self.state.lock();
        state.frames.retain(|key, _| key.table.as_ref() != table);
    }

    pub fn cached_pages(&self) -> usize {
        self.state.lock().frames.len()
    }
}
