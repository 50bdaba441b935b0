//! A thin thread-per-batch transaction runner.

use std::thread::{self, JoinHandle};

use crate::transaction::Transaction;

/// Runs a batch of transactions on its own worker thread. Each transaction
/// retries internally; the worker just records commit outcomes.
#[derive(Default)]
pub struct TransactionWorker {
    transactions: Vec<Transaction>,
    handle: Option<JoinHandle<Vec<bool>>>,
    stats: Vec<bool>,
}

impl TransactionWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_transaction(&mut self, transaction: Transaction) {
        self.transactions.push(transaction);
    }

    /// Start the worker thread. A second call while running is a no-op.
    pub fn run(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let batch = std::mem::take(&mut self.transactions);
        self.handle = Some(thread::spawn(move || {
            batch
                .into_iter()
                .map(|mut transaction| transaction.run())
                .collect()
        }));
    }

    /// Wait for the worker to finish and collect its outcomes.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(stats) => self.stats = stats,
                Err(_) => crate::lstore_debug_log!("[TransactionWorker::join] worker panicked"),
            }
        }
    }

    /// Commit outcome per transaction, in submission order.
    pub fn stats(&self) -> &[bool] {
        &self.stats
    }

    /// Number of committed transactions.
    pub fn result(&self) -> usize {
        self.stats.iter().filter(|&&ok| ok).count()
    }
}
