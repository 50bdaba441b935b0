//! The per-table background merge thread.
//!
//! The thread wakes on a fixed tick, runs a merge pass once enough updates
//! have accumulated, and exits when signalled or when its table is gone. It
//! holds only a weak reference to the table, so dropping the last table
//! handle also winds the thread down.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::config::{MERGE_CHECK_INTERVAL, MERGE_THRESHOLD_UPDATES};
use crate::table::Table;

#[derive(Default)]
struct MergeSignal {
    stop: Mutex<bool>,
    cv: Condvar,
}

pub struct MergeHandle {
    thread: Option<JoinHandle<()>>,
    signal: Arc<MergeSignal>,
}

impl MergeHandle {
    /// Signal the worker and wait for it to drain its current pass.
    pub fn stop(&mut self) {
        *self.signal.stop.lock() = true;
        self.signal.cv.notify_all();
        if let Some(handle) = self.thread.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for MergeHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn the merge thread for `table` and install its handle.
pub(crate) fn start(table: &Arc<Table>) {
    let signal = Arc::new(MergeSignal::default());
    let weak: Weak<Table> = Arc::downgrade(table);
    let thread_signal = Arc::clone(&signal);

    let thread = thread::Builder::new()
        .name(format!("lstore-merge-{}", table.name()))
        .spawn(move || merge_loop(weak, thread_signal))
        .expect("failed to spawn merge thread");

    table.install_merge_handle(MergeHandle {
        thread: Some(thread),
        signal,
    });
}

fn merge_loop(table: Weak<Table>, signal: Arc<MergeSignal>) {
    loop {
        {
            let mut stopped = signal.stop.lock();
            if *stopped {
                break;
            }
            signal.cv.wait_for(&mut stopped, MERGE_CHECK_INTERVAL);
            if *stopped {
                break;
            }
        }

        let Some(table) = table.upgrade() else {
            break;
        };
        if table.updates_since_merge() >= MERGE_THRESHOLD_UPDATES {
            crate::lstore_debug_log!("[merge_loop] {} threshold reached", table.name());
            table.merge();
        }
    }
}
