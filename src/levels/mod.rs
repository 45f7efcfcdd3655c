//! Leveled organization of published SSTables.
//!
//! Level 0 holds flush outputs in creation order and allows overlapping key
//! ranges; every deeper level holds pairwise-disjoint ranges. Tables are
//! shared as `Arc` handles so in-flight searches keep a table readable even
//! after a compaction removes it from its level and unlinks the file.

pub mod compaction;
pub mod manager;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::BlockCache;
use crate::codec::Compression;
use crate::entry::Entry;
use crate::error::Result;
use crate::sstable::table::{Table, TableIterator};

pub use manager::{LevelManager, SearchStats};

/// In-memory descriptor of one published table: its level, its file path,
/// and the open reader carrying the bloom filter, index block, and meta
/// block loaded at open time.
#[derive(Debug)]
pub struct TableHandle {
    level: u32,
    path: PathBuf,
    table: Arc<Table>,
}

impl TableHandle {
    /// Opens the file and takes the level from its meta block; the file
    /// name's level marker is advisory only.
    pub fn open(
        path: impl Into<PathBuf>,
        compression: Compression,
        cache: Option<Arc<BlockCache>>,
    ) -> Result<Self> {
        let path = path.into();
        let table = Arc::new(Table::open(&path, compression, cache)?);
        Ok(Self {
            level: table.level(),
            path,
            table,
        })
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn min_key(&self) -> &str {
        self.table.min_key()
    }

    pub fn max_key(&self) -> &str {
        self.table.max_key()
    }

    pub fn entry_count(&self) -> u64 {
        self.table.entry_count()
    }

    /// Range test for a point lookup.
    pub fn covers(&self, key: &str) -> bool {
        self.min_key() <= key && key <= self.max_key()
    }

    /// Bloom test; false means the key is definitely absent.
    pub fn may_contain(&self, key: &str) -> bool {
        self.table.bloom().contains(key.as_bytes())
    }

    /// Inclusive range overlap test against another table's span.
    pub fn overlaps(&self, min: &str, max: &str) -> bool {
        self.min_key() <= max && min <= self.max_key()
    }

    pub fn search(&self, key: &str) -> Result<Option<Entry>> {
        self.table.search(key)
    }

    /// Full scan in key order, used as a compaction input stream.
    pub fn iter(&self) -> TableIterator {
        TableIterator::new(Arc::clone(&self.table))
    }
}

/// One level: an insertion-ordered list of table handles, oldest at the
/// front.
#[derive(Debug)]
pub struct Level {
    num: u32,
    tables: VecDeque<Arc<TableHandle>>,
}

impl Level {
    pub fn new(num: u32) -> Self {
        Self {
            num,
            tables: VecDeque::new(),
        }
    }

    pub fn num(&self) -> u32 {
        self.num
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Appends a newly published table.
    pub fn push(&mut self, handle: Arc<TableHandle>) {
        self.tables.push_back(handle);
    }

    /// Oldest table (front of the list).
    pub fn oldest(&self) -> Option<Arc<TableHandle>> {
        self.tables.front().cloned()
    }

    /// Snapshot of the list, oldest first.
    pub fn snapshot(&self) -> Vec<Arc<TableHandle>> {
        self.tables.iter().cloned().collect()
    }

    /// Tables whose ranges intersect `[min, max]`, oldest first.
    pub fn overlapping(&self, min: &str, max: &str) -> Vec<Arc<TableHandle>> {
        self.tables
            .iter()
            .filter(|t| t.overlaps(min, max))
            .cloned()
            .collect()
    }

    /// Removes tables by file path, returning how many were dropped.
    pub fn remove_paths(&mut self, paths: &[PathBuf]) -> usize {
        let before = self.tables.len();
        self.tables.retain(|t| !paths.contains(&t.path().to_path_buf()));
        before - self.tables.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Entry;
    use crate::sstable::table::{TableBuilder, TableOptions};
    use tempfile::TempDir;

    fn build_handle(dir: &TempDir, name: &str, level: u32, keys: &[&str]) -> Arc<TableHandle> {
        let path = dir.path().join(name);
        let opts = TableOptions {
            data_block_size: 4096,
            compression: Compression::None,
            bloom_fpr: 0.01,
        };
        let mut builder = TableBuilder::new(&path, level, keys.len(), opts).unwrap();
        for key in keys {
            builder.add(&Entry::put(*key, b"v".to_vec(), 1)).unwrap();
        }
        builder.finish().unwrap();
        Arc::new(TableHandle::open(&path, Compression::None, None).unwrap())
    }

    #[test]
    fn test_handle_range_and_bloom() {
        let dir = TempDir::new().unwrap();
        let handle = build_handle(&dir, "a.sst", 1, &["bb", "dd", "ff"]);

        assert_eq!(handle.level(), 1);
        assert_eq!(handle.min_key(), "bb");
        assert_eq!(handle.max_key(), "ff");

        assert!(handle.covers("cc"));
        assert!(!handle.covers("aa"));
        assert!(!handle.covers("gg"));

        assert!(handle.may_contain("dd"));
        assert!(handle.overlaps("ee", "zz"));
        assert!(!handle.overlaps("gg", "zz"));
    }

    #[test]
    fn test_level_push_order_and_overlap() {
        let dir = TempDir::new().unwrap();
        let older = build_handle(&dir, "older.sst", 0, &["a", "m"]);
        let newer = build_handle(&dir, "newer.sst", 0, &["k", "z"]);

        let mut level = Level::new(0);
        level.push(Arc::clone(&older));
        level.push(Arc::clone(&newer));

        assert_eq!(level.len(), 2);
        assert_eq!(level.oldest().unwrap().path(), older.path());

        let snapshot = level.snapshot();
        assert_eq!(snapshot[0].path(), older.path());
        assert_eq!(snapshot[1].path(), newer.path());

        let hits = level.overlapping("l", "l");
        assert_eq!(hits.len(), 2);
        let hits = level.overlapping("a", "b");
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_level_remove_paths() {
        let dir = TempDir::new().unwrap();
        let a = build_handle(&dir, "a.sst", 0, &["a"]);
        let b = build_handle(&dir, "b.sst", 0, &["b"]);

        let mut level = Level::new(0);
        level.push(Arc::clone(&a));
        level.push(Arc::clone(&b));

        let removed = level.remove_paths(&[a.path().to_path_buf()]);
        assert_eq!(removed, 1);
        assert_eq!(level.len(), 1);
        assert_eq!(level.oldest().unwrap().path(), b.path());
    }
}
