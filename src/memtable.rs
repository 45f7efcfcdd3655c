//! Memtable: the WAL-backed in-memory write buffer.
//!
//! Couples a [`Wal`](crate::wal::Wal) with a [`MemIndex`]. Writes hit the
//! WAL first so the durability gate is passed before the entry becomes
//! visible; any WAL failure surfaces before the index is mutated.
//!
//! A memtable moves through three states: active (accepting writes), read
//! only (frozen, queued for flush), and drained (its contents published as
//! an L0 SSTable, its WAL deleted).

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::memindex::MemIndex;
use crate::wal::Wal;

#[derive(Debug)]
pub struct Memtable {
    index: MemIndex,
    wal: Wal,
    wal_id: u64,
    read_only: AtomicBool,
}

impl Memtable {
    /// Creates an empty memtable with a fresh WAL at `wal_path`.
    pub fn new(wal_path: impl AsRef<Path>, wal_id: u64) -> Result<Self> {
        let wal = Wal::open(wal_path.as_ref())?;
        Ok(Self {
            index: MemIndex::new(),
            wal,
            wal_id,
            read_only: AtomicBool::new(false),
        })
    }

    /// Rebuilds a memtable from an existing WAL by replaying its records
    /// into the index. Torn tails are tolerated by the WAL reader.
    pub fn recover(wal_path: impl AsRef<Path>, wal_id: u64) -> Result<Self> {
        let memtable = Self::new(wal_path, wal_id)?;
        for entry in memtable.wal.read()? {
            memtable.index.upsert(entry);
        }
        Ok(memtable)
    }

    /// Writes an entry: WAL first, then the ordered index.
    pub fn set(&self, entry: Entry) -> Result<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(Error::ReadOnly);
        }
        self.wal.write(std::slice::from_ref(&entry))?;
        self.index.upsert(entry);
        Ok(())
    }

    /// Returns the latest entry for the key, tombstones included.
    pub fn get(&self, key: &str) -> Option<Entry> {
        self.index.get(key)
    }

    /// All entries in key order. Used to drain the memtable into an SSTable.
    pub fn scan(&self) -> Vec<Entry> {
        self.index.scan()
    }

    /// Accounted size estimate; the flush threshold is compared against this.
    pub fn size(&self) -> usize {
        self.index.size()
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// One-way, idempotent transition into the read-only state.
    pub fn make_read_only(&self) {
        self.read_only.store(true, Ordering::SeqCst);
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    pub fn wal_id(&self) -> u64 {
        self.wal_id
    }

    pub fn wal_path(&self) -> &Path {
        self.wal.path()
    }

    /// Unlinks the WAL. Called by the engine only after this memtable's
    /// contents are durably published as an SSTable.
    pub fn delete_wal(&self) -> Result<()> {
        self.wal.delete()
    }
}
