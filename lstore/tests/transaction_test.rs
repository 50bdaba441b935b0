//! Transaction semantics: strict 2PL serialization, abort atomicity, and
//! worker-thread batches.

use std::sync::Arc;

use lstore::transaction::QueryOp;
use lstore::{Database, Query, Table, TransactionWorker};
use serial_test::serial;
use strata::{LockKey, LockMode};
use tempfile::TempDir;

fn setup() -> (TempDir, Database, Arc<Table>) {
    let dir = TempDir::new().unwrap();
    let mut db = Database::new();
    db.open(dir.path()).unwrap();
    let table = db.create_table("accounts", 3, 0).unwrap();
    (dir, db, table)
}

#[test]
fn transaction_commits_a_batch_in_order() {
    let (_dir, mut db, table) = setup();

    let mut tx = db.create_transaction();
    tx.add_query(Arc::clone(&table), QueryOp::Insert { values: vec![1, 10, 100] });
    tx.add_query(Arc::clone(&table), QueryOp::Insert { values: vec![2, 20, 200] });
    tx.add_query(
        Arc::clone(&table),
        QueryOp::Update {
            primary_key: 1,
            updates: vec![None, Some(11), None],
        },
    );
    assert!(tx.run());

    let q = Query::new(table);
    let records = q.select(1, 0, &[true, true, true]).unwrap();
    assert_eq!(records[0].columns, vec![Some(1), Some(11), Some(100)]);
    assert_eq!(q.sum(1, 2, 2), Some(300));
    db.close().unwrap();
}

#[test]
fn update_then_select_in_one_transaction_sees_the_write() {
    let (_dir, mut db, table) = setup();
    let q = Query::new(Arc::clone(&table));
    assert!(q.insert(&[1, 10, 100]));

    // Grow acquires X for the update and then S on the same record for the
    // select; both must be granted to the one holder.
    let mut tx = db.create_transaction();
    tx.add_query(
        Arc::clone(&table),
        QueryOp::Update {
            primary_key: 1,
            updates: vec![None, Some(77), None],
        },
    );
    tx.add_query(
        Arc::clone(&table),
        QueryOp::Select {
            search_key: 1,
            search_column: 0,
            projection: vec![true, true, true],
        },
    );
    assert!(tx.run());

    let records = q.select(1, 0, &[true, true, true]).unwrap();
    assert_eq!(records[0].columns[1], Some(77));
    db.close().unwrap();
}

#[test]
fn conflicting_writers_abort_and_leave_no_partial_state() {
    let (_dir, db, table) = setup();
    let q = Query::new(Arc::clone(&table));
    assert!(q.insert(&[1, 10, 100]));

    // An outside holder pins the record exclusively, so the transaction's
    // grow phase must fail and its single attempt must change nothing.
    let blocker_tx = 999_999;
    assert!(db.lock_manager().acquire(
        blocker_tx,
        LockKey::Record {
            table: Arc::clone(table.name()),
            rid: 1,
        },
        LockMode::Exclusive,
    ));

    let mut tx = db.create_transaction();
    tx.add_query(
        Arc::clone(&table),
        QueryOp::Update {
            primary_key: 1,
            updates: vec![None, Some(55), None],
        },
    );
    assert!(!tx.run_once());

    let records = q.select(1, 0, &[true, true, true]).unwrap();
    assert_eq!(records[0].columns, vec![Some(1), Some(10), Some(100)]);

    // Once the blocker lets go, the same transaction goes through.
    db.lock_manager().release_all(blocker_tx);
    assert!(tx.run_once());
    let records = q.select(1, 0, &[true, true, true]).unwrap();
    assert_eq!(records[0].columns[1], Some(55));
}

#[test]
fn aborted_batch_rolls_back_earlier_operations() {
    let (_dir, db, table) = setup();
    let q = Query::new(Arc::clone(&table));
    assert!(q.insert(&[1, 10, 100]));

    // The second operation fails (no such key), so the first must be
    // undone: base bytes, directory, and index all back to the pre-image.
    let mut tx = db.create_transaction();
    tx.add_query(
        Arc::clone(&table),
        QueryOp::Update {
            primary_key: 1,
            updates: vec![None, Some(999), None],
        },
    );
    tx.add_query(Arc::clone(&table), QueryOp::Delete { primary_key: 42 });
    assert!(!tx.run_once());

    let records = q.select(1, 0, &[true, true, true]).unwrap();
    assert_eq!(records[0].columns, vec![Some(1), Some(10), Some(100)]);
    let (latest, schema) = table.get_latest_version(1).unwrap().unwrap();
    assert_eq!(latest, vec![1, 10, 100]);
    assert_eq!(schema, 0);
}

#[test]
#[serial]
fn two_conflicting_updates_serialize_to_one_winner() {
    let (_dir, mut db, table) = setup();
    let q = Query::new(Arc::clone(&table));
    assert!(q.insert(&[1, 10, 100]));

    let mut worker_a = TransactionWorker::new();
    let mut worker_b = TransactionWorker::new();
    for (worker, value) in [(&mut worker_a, 77), (&mut worker_b, 88)] {
        let mut tx = db.create_transaction();
        tx.add_query(
            Arc::clone(&table),
            QueryOp::Update {
                primary_key: 1,
                updates: vec![None, Some(value), None],
            },
        );
        worker.add_transaction(tx);
    }

    worker_a.run();
    worker_b.run();
    worker_a.join();
    worker_b.join();
    assert_eq!(worker_a.result() + worker_b.result(), 2);

    // 2PL admits either order, but never a mix: the final value belongs to
    // one writer and version -1 holds the value it overwrote.
    let latest = q.select(1, 0, &[true, true, true]).unwrap()[0].columns[1].unwrap();
    let previous = q.select_version(1, 0, &[true, true, true], -1).unwrap()[0].columns[1].unwrap();
    let mut seen = [latest, previous];
    seen.sort_unstable();
    assert_eq!(seen, [77, 88]);
    db.close().unwrap();
}

#[test]
#[serial]
fn concurrent_increments_all_apply_exactly_once() {
    let (_dir, mut db, table) = setup();
    let q = Query::new(Arc::clone(&table));
    assert!(q.insert(&[1, 0, 100]));

    const WORKERS: usize = 3;
    const PER_WORKER: usize = 10;

    let mut workers = Vec::new();
    for _ in 0..WORKERS {
        let mut worker = TransactionWorker::new();
        for _ in 0..PER_WORKER {
            let mut tx = db.create_transaction();
            tx.add_query(
                Arc::clone(&table),
                QueryOp::Increment {
                    primary_key: 1,
                    column: 1,
                },
            );
            worker.add_transaction(tx);
        }
        worker.run();
        workers.push(worker);
    }

    let mut committed = 0;
    for worker in &mut workers {
        worker.join();
        committed += worker.result();
    }
    assert_eq!(committed, WORKERS * PER_WORKER);

    let records = q.select(1, 0, &[true, true, true]).unwrap();
    assert_eq!(records[0].columns[1], Some((WORKERS * PER_WORKER) as i64));
    db.close().unwrap();
}

#[test]
fn insert_heavy_batches_from_two_workers_all_land() {
    let (_dir, mut db, table) = setup();

    let mut workers = Vec::new();
    for base in [0i64, 1000] {
        let mut worker = TransactionWorker::new();
        for k in 0..20 {
            let mut tx = db.create_transaction();
            tx.add_query(
                Arc::clone(&table),
                QueryOp::Insert {
                    values: vec![base + k, k, 5],
                },
            );
            worker.add_transaction(tx);
        }
        worker.run();
        workers.push(worker);
    }
    for worker in &mut workers {
        worker.join();
        assert_eq!(worker.result(), 20);
    }

    let q = Query::new(table);
    assert_eq!(q.sum(0, 2000, 2), Some(40 * 5));
    db.close().unwrap();
}
