//! A seeded random workload mirroring the engine against an in-memory
//! model: inserts, partial updates, deletes, point and version reads, and
//! range sums, with a close/reopen at the end.

use std::collections::BTreeMap;
use std::sync::Arc;

use lstore::{Database, Query, Table};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

const COLUMNS: usize = 5;
const KEYS: i64 = 200;
const STEPS: usize = 2000;

/// Reference model: key -> history of full rows, oldest first.
type Model = BTreeMap<i64, Vec<Vec<i64>>>;

fn check_row(q: &Query, model: &Model, key: i64) {
    let mask = vec![true; COLUMNS];
    let records = q.select(key, 0, &mask).unwrap();
    match model.get(&key) {
        None => assert!(records.is_empty(), "key {key} should be gone"),
        Some(history) => {
            assert_eq!(records.len(), 1, "key {key} should be visible once");
            let latest = history.last().unwrap();
            let got: Vec<i64> = records[0].columns.iter().map(|v| v.unwrap()).collect();
            assert_eq!(&got, latest, "latest row for key {key}");
        }
    }
}

fn check_version(q: &Query, model: &Model, key: i64, back: usize) {
    let Some(history) = model.get(&key) else {
        return;
    };
    let mask = vec![true; COLUMNS];
    let records = q
        .select_version(key, 0, &mask, -(back as i64))
        .unwrap();
    assert_eq!(records.len(), 1);
    // Walking past the oldest version pins to the base row.
    let idx = history.len().saturating_sub(1 + back);
    let expected = &history[idx];
    let got: Vec<i64> = records[0].columns.iter().map(|v| v.unwrap()).collect();
    assert_eq!(&got, expected, "key {key} at {back} versions back");
}

fn check_sum(q: &Query, model: &Model, lo: i64, hi: i64, column: usize) {
    let expected: i64 = model
        .range(lo..=hi)
        .map(|(_, history)| history.last().unwrap()[column])
        .sum();
    let live = model.range(lo..=hi).count();
    match q.sum(lo, hi, column) {
        Some(total) => assert_eq!(total, expected),
        None => assert_eq!(live, 0, "sum over a non-empty range must answer"),
    }
}

#[test]
fn randomized_workload_matches_a_reference_model() {
    let dir = TempDir::new().unwrap();
    let mut db = Database::new();
    db.open(dir.path()).unwrap();
    let table: Arc<Table> = db.create_table("workload", COLUMNS, 0).unwrap();
    let q = Query::new(Arc::clone(&table));

    let mut rng = StdRng::seed_from_u64(165);
    let mut model: Model = BTreeMap::new();

    for step in 0..STEPS {
        let key = rng.gen_range(0..KEYS);
        match rng.gen_range(0..100) {
            // Insert a fresh row; a duplicate key must be refused.
            0..=39 => {
                let mut row = vec![key];
                row.extend((1..COLUMNS).map(|_| rng.gen_range(-1000..1000)));
                let ok = q.insert(&row);
                assert_eq!(ok, !model.contains_key(&key), "insert at step {step}");
                if ok {
                    model.insert(key, vec![row]);
                }
            }
            // Partial update of an existing row.
            40..=79 => {
                let mut updates: Vec<Option<i64>> = vec![None; COLUMNS];
                for column in 1..COLUMNS {
                    if rng.gen_bool(0.5) {
                        updates[column] = Some(rng.gen_range(-1000..1000));
                    }
                }
                let ok = q.update(key, &updates);
                assert_eq!(ok, model.contains_key(&key), "update at step {step}");
                if ok {
                    let history = model.get_mut(&key).unwrap();
                    let mut row = history.last().unwrap().clone();
                    for (column, value) in updates.iter().enumerate() {
                        if let Some(value) = value {
                            row[column] = *value;
                        }
                    }
                    history.push(row);
                }
            }
            // Delete.
            80..=89 => {
                let ok = q.delete(key);
                assert_eq!(ok, model.contains_key(&key), "delete at step {step}");
                model.remove(&key);
            }
            // Reads.
            90..=93 => check_row(&q, &model, key),
            94..=96 => check_version(&q, &model, key, rng.gen_range(0..4)),
            _ => {
                let lo = rng.gen_range(0..KEYS);
                let hi = lo + rng.gen_range(0..50);
                check_sum(&q, &model, lo, hi, rng.gen_range(1..COLUMNS));
            }
        }
    }

    // Full sweep before and after a close/reopen cycle.
    for key in 0..KEYS {
        check_row(&q, &model, key);
    }
    db.close().unwrap();

    let mut db = Database::new();
    db.open(dir.path()).unwrap();
    let q = Query::new(db.get_table("workload").unwrap());
    for key in 0..KEYS {
        check_row(&q, &model, key);
        check_version(&q, &model, key, 1);
    }
    check_sum(&q, &model, 0, KEYS, 1);
    db.close().unwrap();
}
