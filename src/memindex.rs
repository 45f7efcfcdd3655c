//! Concurrent ordered key index backing the memtable.
//!
//! An ordered mapping from key to the latest entry for that key. Readers
//! are lock-free and always observe a consistent sorted view; writers are
//! serialized upstream by the memtable's WAL, which also fixes visibility
//! order (an entry is upserted here only after its WAL append returned).

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_skiplist::SkipMap;

use crate::entry::Entry;

/// Sorted in-memory index from key to entry with accounted-size tracking.
#[derive(Debug, Default)]
pub struct MemIndex {
    map: SkipMap<String, Entry>,
    size: AtomicUsize,
}

impl MemIndex {
    pub fn new() -> Self {
        Self {
            map: SkipMap::new(),
            size: AtomicUsize::new(0),
        }
    }

    /// Inserts or replaces the entry for its key, adjusting the accounted
    /// size by the delta of estimated entry sizes.
    pub fn upsert(&self, entry: Entry) {
        let new_size = entry.estimated_size();
        let old_size = self.map.get(&entry.key).map(|e| e.value().estimated_size());

        self.map.insert(entry.key.clone(), entry);

        match old_size {
            Some(old) if old > new_size => {
                self.size.fetch_sub(old - new_size, Ordering::SeqCst);
            }
            Some(old) => {
                self.size.fetch_add(new_size - old, Ordering::SeqCst);
            }
            None => {
                self.size.fetch_add(new_size, Ordering::SeqCst);
            }
        }
    }

    /// Returns the latest entry for the key, tombstones included.
    pub fn get(&self, key: &str) -> Option<Entry> {
        self.map.get(key).map(|e| e.value().clone())
    }

    /// Returns all entries in key order.
    pub fn scan(&self) -> Vec<Entry> {
        self.map.iter().map(|e| e.value().clone()).collect()
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Accounted size estimate in bytes.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }
}
