//! The database façade.
//!
//! Ties together the active/flushing memtable pair, the level manager, and
//! recovery. Writes land in the active memtable (WAL first); when its
//! accounted size crosses the configured threshold a fresh memtable is
//! swapped in and the old one drains to an L0 SSTable on a background
//! thread. Reads consult the active memtable, then the draining one, then
//! the levels, newest first.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use itertools::Itertools;

use crate::cache::BlockCache;
use crate::config::Config;
use crate::entry::{Entry, MAX_KEY_LEN};
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::levels::{LevelManager, TableHandle};
use crate::memtable::Memtable;
use crate::metrics::Metrics;
use crate::sstable::table::TableBuilder;
use crate::wal::parse_wal_id;

const LOCK_FILE: &str = "cinderdb.lock";
const LEVELS_DIR: &str = "levels";

/// An open CinderDB instance. Cheap to clone; all clones share the engine.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

struct Slots {
    active: Arc<Memtable>,
    flushing: Option<Arc<Memtable>>,
}

struct Inner {
    config: Config,
    lock: Mutex<Option<FileLock>>,
    levels: Arc<LevelManager>,
    cache: Option<Arc<BlockCache>>,
    slots: RwLock<Slots>,
    /// One permit: concurrent flushes run sequentially.
    flush_lock: Mutex<()>,
    /// Deduplicates threshold-triggered background flush spawns.
    flush_pending: AtomicBool,
    next_wal_id: AtomicU64,
    closed: AtomicBool,
}

impl Database {
    /// Opens (creating if needed) a database with default configuration.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_config(Config::new(dir))
    }

    /// Opens a database: acquires the directory lock, registers published
    /// SSTables, replays leftover WALs into L0 tables, and installs a
    /// fresh active memtable.
    pub fn open_with_config(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;
        let lock = FileLock::lock(config.dir.join(LOCK_FILE))?;

        let cache = (config.block_cache_size > 0)
            .then(|| Arc::new(BlockCache::new(config.block_cache_size)));
        let levels = Arc::new(LevelManager::open(
            config.dir.join(LEVELS_DIR),
            config.clone(),
            cache.clone(),
        )?);

        // Replay every leftover WAL, oldest first; non-empty ones are
        // published straight to L0, then their WALs are removed.
        let wal_paths: Vec<(u64, PathBuf)> = std::fs::read_dir(&config.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter_map(|path| parse_wal_id(&path).map(|id| (id, path)))
            .sorted()
            .collect();

        let mut max_wal_id = 0u64;
        for (id, path) in wal_paths {
            max_wal_id = max_wal_id.max(id);
            let memtable = Memtable::recover(&path, id)?;
            let recovered = memtable.len();
            if !memtable.is_empty() {
                publish_memtable(&levels, &memtable)?;
            }
            memtable.delete_wal()?;
            tracing::info!(wal_id = id, entries = recovered, "recovered WAL");
        }

        let wal_id = max_wal_id + 1;
        let active = Arc::new(Memtable::new(wal_file_path(&config, wal_id), wal_id)?);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                lock: Mutex::new(Some(lock)),
                levels,
                cache,
                slots: RwLock::new(Slots {
                    active,
                    flushing: None,
                }),
                flush_lock: Mutex::new(()),
                flush_pending: AtomicBool::new(false),
                next_wal_id: AtomicU64::new(wal_id + 1),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Stores a value under the key.
    pub fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.inner.check_open()?;
        validate_key(key)?;
        Inner::write(&self.inner, Entry::put(key, value.to_vec(), 0))
    }

    /// Deletes the key by writing a tombstone.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.inner.check_open()?;
        validate_key(key)?;
        Inner::write(&self.inner, Entry::tombstone(key, 0))
    }

    /// Looks up a key. Tombstones surface as not-found.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.check_open()?;

        let (active, flushing) = {
            let slots = self.inner.slots.read()?;
            (slots.active.clone(), slots.flushing.clone())
        };

        if let Some(entry) = active.get(key) {
            return Ok(visible(entry));
        }
        if let Some(flushing) = flushing {
            if let Some(entry) = flushing.get(key) {
                return Ok(visible(entry));
            }
        }
        match self.inner.levels.search(key)? {
            Some(entry) => Ok(visible(entry)),
            None => Ok(None),
        }
    }

    /// Synchronously drains the current memtable to an L0 SSTable.
    pub fn flush(&self) -> Result<()> {
        self.inner.check_open()?;
        self.inner.flush()
    }

    /// Triggers compaction from L0, cascading per the level policy.
    pub fn compact(&self) -> Result<()> {
        self.inner.check_open()?;
        self.inner.levels.compact(0)
    }

    /// Closes the engine after a best-effort final flush. Idempotent;
    /// flush errors are swallowed.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.inner.flush() {
            tracing::warn!(error = %e, "final flush failed during close");
        }
        self.metrics().log();
        Ok(())
    }

    /// Snapshot of engine counters.
    pub fn metrics(&self) -> Metrics {
        let (active_bytes, flushing_bytes) = self
            .inner
            .slots
            .read()
            .map(|slots| {
                (
                    slots.active.size(),
                    slots.flushing.as_ref().map_or(0, |m| m.size()),
                )
            })
            .unwrap_or((0, 0));

        Metrics {
            active_memtable_bytes: active_bytes,
            flushing_memtable_bytes: flushing_bytes,
            level_table_counts: self.inner.levels.table_counts(),
            search: self.inner.levels.search_stats(),
            cache: self.inner.cache.as_ref().map(|c| c.stats()),
        }
    }
}

impl Inner {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Writes one entry to the active memtable, retrying if a concurrent
    /// swap froze the one we grabbed. Crossing the size threshold spawns a
    /// non-blocking background flush.
    fn write(this: &Arc<Inner>, entry: Entry) -> Result<()> {
        loop {
            let active = { this.slots.read()?.active.clone() };
            match active.set(entry.clone()) {
                Ok(()) => {
                    if active.size() >= this.config.memtable_threshold {
                        Inner::spawn_flush(this);
                    }
                    return Ok(());
                }
                // A flush swapped the active memtable under us; retry
                // against the new one.
                Err(Error::ReadOnly) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Spawns at most one background flush at a time.
    fn spawn_flush(this: &Arc<Inner>) {
        if this.flush_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(this);
        std::thread::spawn(move || {
            if let Err(e) = inner.flush() {
                tracing::error!(error = %e, "background flush failed");
            }
            inner.flush_pending.store(false, Ordering::SeqCst);
        });
    }

    /// Serialized flush. Either retries a previously failed drain (the
    /// flushing slot is still occupied) or freezes and swaps the active
    /// memtable, then drains outside the slots lock.
    fn flush(&self) -> Result<()> {
        let _permit = self.flush_lock.lock()?;

        let memtable = {
            let mut slots = self.slots.write()?;
            match &slots.flushing {
                Some(stuck) => Arc::clone(stuck),
                None => {
                    if slots.active.is_empty() {
                        return Ok(());
                    }
                    // The replacement is created before the freeze so a WAL
                    // creation failure leaves the active memtable writable.
                    let wal_id = self.next_wal_id.fetch_add(1, Ordering::SeqCst);
                    let fresh =
                        Arc::new(Memtable::new(wal_file_path(&self.config, wal_id), wal_id)?);
                    slots.active.make_read_only();
                    let old = std::mem::replace(&mut slots.active, fresh);
                    slots.flushing = Some(Arc::clone(&old));
                    old
                }
            }
        };

        // Drain with no locks held; on error the flushing slot stays
        // occupied and the next flush retries from the same data.
        publish_memtable(&self.levels, &memtable)?;

        if let Err(e) = memtable.delete_wal() {
            // The SSTable is durable; a lingering WAL only means a
            // redundant (idempotent) replay on the next open.
            tracing::warn!(wal_id = memtable.wal_id(), error = %e, "failed to delete flushed WAL");
        }
        self.slots.write()?.flushing = None;

        tracing::info!(
            wal_id = memtable.wal_id(),
            entries = memtable.len(),
            "flushed memtable to L0"
        );

        if self.levels.l0_needs_compaction() {
            self.levels.compact(0)?;
        }
        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Release the directory lock; everything else is just dropped. No
        // implicit flush here: unflushed writes stay in their WAL.
        if let Ok(mut guard) = self.lock.lock() {
            if let Some(lock) = guard.take() {
                let _ = lock.unlock();
            }
        }
    }
}

/// Builds and registers an L0 table from a memtable's sorted contents.
fn publish_memtable(levels: &LevelManager, memtable: &Memtable) -> Result<()> {
    let entries = memtable.scan();
    let path = levels.next_flush_path();
    let mut builder = TableBuilder::new(&path, 0, entries.len(), levels.table_options())?;
    for entry in &entries {
        builder.add(entry)?;
    }
    builder.finish()?;

    let handle = TableHandle::open(&path, levels.compression(), levels.cache())?;
    levels.register(Arc::new(handle))
}

fn wal_file_path(config: &Config, id: u64) -> PathBuf {
    config.dir.join(format!("wal_{id}.wal"))
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return crate::errinput!("key must be non-empty");
    }
    if key.len() > MAX_KEY_LEN {
        return crate::errinput!("key exceeds {MAX_KEY_LEN} bytes");
    }
    Ok(())
}

fn visible(entry: Entry) -> Option<Vec<u8>> {
    if entry.tombstone {
        None
    } else {
        Some(entry.value)
    }
}
