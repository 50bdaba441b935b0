//! Manages shared/exclusive locks on engine resources under strict 2PL.
//!
//! Acquisition is non-blocking: a conflicting request fails immediately and
//! the caller is expected to abort and retry with backoff. Deadlock
//! avoidance is probabilistic via the caller's randomized retry delay.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

pub type TxId = u64;

/// Represents the different modes of locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Represents a resource that can be locked.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    /// One logical record of a table, by base RID.
    Record { table: Arc<str>, rid: u64 },
    /// A whole table; used as the insert pseudo-lock.
    Table { table: Arc<str> },
}

#[derive(Debug, Default)]
struct LockState {
    holders: HashSet<TxId>,
    exclusive: Option<TxId>,
}

impl LockState {
    fn acquire(&mut self, tx: TxId, mode: LockMode) -> bool {
        // Reentrant for a transaction that already holds a lock here; a sole
        // shared holder may upgrade to exclusive.
        if self.holders.contains(&tx) {
            if mode == LockMode::Exclusive {
                if self.holders.len() == 1 && self.exclusive.is_none() {
                    self.holders.remove(&tx);
                    self.exclusive = Some(tx);
                    return true;
                }
                return false;
            }
            return true;
        }
        if self.exclusive == Some(tx) {
            return true;
        }

        match mode {
            LockMode::Shared => {
                if self.exclusive.is_none() {
                    self.holders.insert(tx);
                    true
                } else {
                    false
                }
            }
            LockMode::Exclusive => {
                if self.exclusive.is_none() && self.holders.is_empty() {
                    self.exclusive = Some(tx);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn release(&mut self, tx: TxId) {
        self.holders.remove(&tx);
        if self.exclusive == Some(tx) {
            self.exclusive = None;
        }
    }

    fn is_free(&self) -> bool {
        self.holders.is_empty() && self.exclusive.is_none()
    }
}

/// The main lock manager struct.
#[derive(Debug, Default)]
pub struct LockManager {
    lock_table: Mutex<HashMap<LockKey, LockState>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to acquire `key` in `mode` for `tx`. Returns false on conflict.
    pub fn acquire(&self, tx: TxId, key: LockKey, mode: LockMode) -> bool {
        let mut table = self.lock_table.lock();
        let granted = table.entry(key.clone()).or_default().acquire(tx, mode);
        crate::strata_debug_log!(
            "[LockManager::acquire] tx {tx} {mode:?} on {key:?}: granted={granted}"
        );
        granted
    }

    /// Release every lock held by `tx` (strict 2PL shrink phase).
    pub fn release_all(&self, tx: TxId) {
        let mut table = self.lock_table.lock();
        table.retain(|_, state| {
            state.release(tx);
            !state.is_free()
        });
    }
}
