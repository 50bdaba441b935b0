//! Per-column ordered indexes mapping values to base-record RIDs.
//!
//! Each column index keeps an arena of value nodes chained into a
//! doubly-linked list in key order (node links are arena indices, so the
//! structure owns no cyclic references), a value-to-node map for point
//! lookups, and a sorted key vector for range starts. Deleting the last RID
//! of a value tombstones the key instead of rewriting the sorted vector;
//! tombstones are compacted out once they dominate it.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::table::Rid;

struct IndexNode {
    value: i64,
    rids: HashSet<Rid>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// The ordered index of a single column.
#[derive(Default)]
pub struct ColumnIndex {
    map: HashMap<i64, usize>,
    arena: Vec<IndexNode>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    sorted_keys: Vec<i64>,
    dead_keys: HashSet<i64>,
}

impl ColumnIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index in one pass over `(value, rid)` pairs.
    pub fn build<I: IntoIterator<Item = (i64, Rid)>>(entries: I) -> Self {
        let mut grouped: BTreeMap<i64, HashSet<Rid>> = BTreeMap::new();
        for (value, rid) in entries {
            grouped.entry(value).or_default().insert(rid);
        }

        let mut index = Self::new();
        let mut last: Option<usize> = None;
        for (value, rids) in grouped {
            let node_idx = index.arena.len();
            index.arena.push(IndexNode {
                value,
                rids,
                prev: last,
                next: None,
            });
            match last {
                Some(prev) => index.arena[prev].next = Some(node_idx),
                None => index.head = Some(node_idx),
            }
            index.map.insert(value, node_idx);
            index.sorted_keys.push(value);
            last = Some(node_idx);
        }
        index.tail = last;
        index
    }

    /// RIDs carrying `value`, copied so callers can iterate without holding
    /// the index lock.
    pub fn locate(&self, value: i64) -> HashSet<Rid> {
        if self.dead_keys.contains(&value) {
            return HashSet::new();
        }
        self.map
            .get(&value)
            .map(|&i| self.arena[i].rids.clone())
            .unwrap_or_default()
    }

    /// RIDs with values in `[begin, end]`, inclusive.
    pub fn locate_range(&self, begin: i64, end: i64) -> HashSet<Rid> {
        let mut result = HashSet::new();

        // Binary search for the first key >= begin, then skip tombstones to
        // find the first live node in range.
        let start = self.sorted_keys.partition_point(|&k| k < begin);
        let mut cursor = None;
        for &key in &self.sorted_keys[start..] {
            if key > end {
                break;
            }
            if let Some(&node) = self.map.get(&key) {
                cursor = Some(node);
                break;
            }
        }

        while let Some(node_idx) = cursor {
            let node = &self.arena[node_idx];
            if node.value > end {
                break;
            }
            result.extend(node.rids.iter().copied());
            cursor = node.next;
        }
        result
    }

    pub fn insert(&mut self, value: i64, rid: Rid) {
        if let Some(&node_idx) = self.map.get(&value) {
            self.arena[node_idx].rids.insert(rid);
            return;
        }

        // Fresh or revived key: splice a node into the linked list at the
        // position found by binary search on the key vector.
        self.dead_keys.remove(&value);
        let pos = self.sorted_keys.partition_point(|&k| k < value);
        if self.sorted_keys.get(pos) != Some(&value) {
            self.sorted_keys.insert(pos, value);
        }

        let successor = self.sorted_keys[pos + 1..]
            .iter()
            .find_map(|key| self.map.get(key).copied());

        let node_idx = self.alloc_node(value, rid);
        match successor {
            Some(next) => {
                let prev = self.arena[next].prev;
                self.arena[node_idx].prev = prev;
                self.arena[node_idx].next = Some(next);
                self.arena[next].prev = Some(node_idx);
                match prev {
                    Some(p) => self.arena[p].next = Some(node_idx),
                    None => self.head = Some(node_idx),
                }
            }
            None => {
                let prev = self.tail;
                self.arena[node_idx].prev = prev;
                match prev {
                    Some(p) => self.arena[p].next = Some(node_idx),
                    None => self.head = Some(node_idx),
                }
                self.tail = Some(node_idx);
            }
        }
        self.map.insert(value, node_idx);
    }

    pub fn delete(&mut self, value: i64, rid: Rid) {
        let Some(&node_idx) = self.map.get(&value) else {
            return;
        };
        self.arena[node_idx].rids.remove(&rid);
        if !self.arena[node_idx].rids.is_empty() {
            return;
        }

        // Last RID gone: unlink the node and tombstone the key.
        let prev = self.arena[node_idx].prev;
        let next = self.arena[node_idx].next;
        match prev {
            Some(p) => self.arena[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.arena[n].prev = prev,
            None => self.tail = prev,
        }
        self.map.remove(&value);
        self.free.push(node_idx);
        self.dead_keys.insert(value);
        self.maybe_compact();
    }

    pub fn update(&mut self, old_value: i64, new_value: i64, rid: Rid) {
        self.delete(old_value, rid);
        self.insert(new_value, rid);
    }

    fn alloc_node(&mut self, value: i64, rid: Rid) -> usize {
        let mut rids = HashSet::new();
        rids.insert(rid);
        let node = IndexNode {
            value,
            rids,
            prev: None,
            next: None,
        };
        match self.free.pop() {
            Some(slot) => {
                self.arena[slot] = node;
                slot
            }
            None => {
                self.arena.push(node);
                self.arena.len() - 1
            }
        }
    }

    /// The sorted key vector is not rewritten on every deletion; once dead
    /// keys outnumber live ones, rewrite it in one pass.
    fn maybe_compact(&mut self) {
        if self.dead_keys.len() * 2 > self.sorted_keys.len() {
            let dead = std::mem::take(&mut self.dead_keys);
            self.sorted_keys.retain(|key| !dead.contains(key));
        }
    }

    #[cfg(test)]
    fn key_vector_len(&self) -> usize {
        self.sorted_keys.len()
    }
}

/// The per-table index collection: one optional ordered index per user
/// column. Only base RIDs ever appear here; tail records are invisible.
pub struct Index {
    columns: Vec<Option<ColumnIndex>>,
}

impl Index {
    pub fn new(num_columns: usize) -> Self {
        let mut columns = Vec::with_capacity(num_columns);
        columns.resize_with(num_columns, || None);
        Self { columns }
    }

    pub fn has_index(&self, column: usize) -> bool {
        matches!(self.columns.get(column), Some(Some(_)))
    }

    pub fn indexed_columns(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter_map(|(col, index)| index.as_ref().map(|_| col))
            .collect()
    }

    pub fn set_column(&mut self, column: usize, index: ColumnIndex) {
        self.columns[column] = Some(index);
    }

    pub fn drop_column(&mut self, column: usize) {
        self.columns[column] = None;
    }

    /// `None` when the column has no index (callers fall back to a scan).
    pub fn locate(&self, column: usize, value: i64) -> Option<HashSet<Rid>> {
        self.columns
            .get(column)?
            .as_ref()
            .map(|index| index.locate(value))
    }

    pub fn locate_range(&self, column: usize, begin: i64, end: i64) -> Option<HashSet<Rid>> {
        self.columns
            .get(column)?
            .as_ref()
            .map(|index| index.locate_range(begin, end))
    }

    pub fn insert(&mut self, column: usize, value: i64, rid: Rid) {
        if let Some(Some(index)) = self.columns.get_mut(column) {
            index.insert(value, rid);
        }
    }

    pub fn delete(&mut self, column: usize, value: i64, rid: Rid) {
        if let Some(Some(index)) = self.columns.get_mut(column) {
            index.delete(value, rid);
        }
    }

    pub fn update(&mut self, column: usize, old_value: i64, new_value: i64, rid: Rid) {
        if let Some(Some(index)) = self.columns.get_mut(column) {
            index.update(old_value, new_value, rid);
        }
    }
}
