//! Level manager: tracks published tables per level, routes point lookups
//! newest-first, and owns the compaction scheduling state.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use itertools::Itertools;

use crate::cache::BlockCache;
use crate::config::Config;
use crate::entry::{now_millis, Entry};
use crate::error::Result;
use crate::levels::{Level, TableHandle};
use crate::sstable::table::TableOptions;

/// Snapshot of the manager's search counters. `tables_probed` counts actual
/// table opens/reads; bloom and range rejections are the lookups those
/// probes were spared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchStats {
    pub searches: u64,
    pub tables_probed: u64,
    pub bloom_negatives: u64,
    pub range_skips: u64,
    pub hits: u64,
}

#[derive(Default)]
struct ProbeCounters {
    searches: AtomicU64,
    tables_probed: AtomicU64,
    bloom_negatives: AtomicU64,
    range_skips: AtomicU64,
    hits: AtomicU64,
}

pub struct LevelManager {
    pub(super) dir: PathBuf,
    pub(super) config: Config,
    pub(super) cache: Option<Arc<BlockCache>>,
    pub(super) levels: RwLock<Vec<Level>>,
    /// Serializes whole compactions; list mutations still happen under the
    /// levels write lock.
    pub(super) compaction_lock: Mutex<()>,
    /// Failed unlinks retried lazily; in-memory state is authoritative.
    pub(super) pending_deletes: Mutex<Vec<PathBuf>>,
    file_seq: AtomicU64,
    last_ts: AtomicI64,
    counters: ProbeCounters,
}

impl LevelManager {
    /// Opens the level directory and registers every readable `*.sst` file,
    /// taking each table's level from its meta block. Corrupt files are
    /// skipped with an error log; they are never auto-repaired.
    pub fn open(
        dir: impl Into<PathBuf>,
        config: Config,
        cache: Option<Arc<BlockCache>>,
    ) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let levels = (0..config.max_levels as u32).map(Level::new).collect();
        let manager = Self {
            dir,
            config,
            cache,
            levels: RwLock::new(levels),
            compaction_lock: Mutex::new(()),
            pending_deletes: Mutex::new(Vec::new()),
            file_seq: AtomicU64::new(1),
            last_ts: AtomicI64::new(0),
            counters: ProbeCounters::default(),
        };

        // Names sort by creation timestamp, so registration preserves L0
        // creation order.
        let paths: Vec<PathBuf> = std::fs::read_dir(&manager.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "sst"))
            .sorted()
            .collect();

        let mut registered = 0usize;
        for path in paths {
            match TableHandle::open(&path, manager.config.compression, manager.cache.clone()) {
                Ok(handle) => {
                    manager.register(Arc::new(handle))?;
                    registered += 1;
                }
                Err(e) => {
                    tracing::error!(
                        path = %path.display(),
                        error = %e,
                        "skipping unreadable SSTable during recovery"
                    );
                }
            }
            manager.file_seq.fetch_add(1, Ordering::SeqCst);
        }
        if registered > 0 {
            tracing::info!(tables = registered, "registered SSTables from disk");
        }

        Ok(manager)
    }

    /// Adds a published table to its level list, in arrival order.
    pub fn register(&self, handle: Arc<TableHandle>) -> Result<()> {
        let mut levels = self.levels.write()?;
        let max_level = levels.len() - 1;
        let level = handle.level() as usize;
        if level > max_level {
            tracing::warn!(
                path = %handle.path().display(),
                level,
                max_level,
                "table level exceeds depth cap, registering at bottom level"
            );
        }
        levels[level.min(max_level)].push(handle);
        Ok(())
    }

    /// Point lookup across all levels: L0 newest-first, then deeper levels
    /// in order. Bloom and range rejections skip a table without touching
    /// it. A table whose probe fails with corruption is logged and treated
    /// as a miss.
    pub fn search(&self, key: &str) -> Result<Option<Entry>> {
        self.counters.searches.fetch_add(1, Ordering::Relaxed);

        let candidates: Vec<Arc<TableHandle>> = {
            let levels = self.levels.read()?;
            let mut candidates = Vec::new();
            let mut l0 = levels[0].snapshot();
            l0.reverse();
            candidates.extend(l0);
            for level in levels.iter().skip(1) {
                candidates.extend(level.snapshot());
            }
            candidates
        };

        for handle in candidates {
            if !handle.covers(key) {
                self.counters.range_skips.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if !handle.may_contain(key) {
                self.counters.bloom_negatives.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            self.counters.tables_probed.fetch_add(1, Ordering::Relaxed);
            match handle.search(key) {
                Ok(Some(entry)) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(entry));
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        path = %handle.path().display(),
                        error = %e,
                        "table probe failed, treating as miss"
                    );
                }
            }
        }
        Ok(None)
    }

    /// Runs compaction starting from `level`, cascading while deeper levels
    /// exceed their targets.
    pub fn compact(&self, level: usize) -> Result<()> {
        super::compaction::run(self, level)
    }

    /// True once L0 has reached its compaction trigger.
    pub fn l0_needs_compaction(&self) -> bool {
        self.levels
            .read()
            .map(|levels| levels[0].len() >= self.config.l0_compaction_trigger)
            .unwrap_or(false)
    }

    /// Table count per level.
    pub fn table_counts(&self) -> Vec<usize> {
        self.levels
            .read()
            .map(|levels| levels.iter().map(|l| l.len()).collect())
            .unwrap_or_default()
    }

    /// Inclusive key ranges of the tables at one level, list order.
    pub fn level_ranges(&self, level: usize) -> Vec<(String, String)> {
        self.levels
            .read()
            .ok()
            .and_then(|levels| {
                levels.get(level).map(|l| {
                    l.snapshot()
                        .iter()
                        .map(|t| (t.min_key().to_string(), t.max_key().to_string()))
                        .collect()
                })
            })
            .unwrap_or_default()
    }

    pub fn search_stats(&self) -> SearchStats {
        SearchStats {
            searches: self.counters.searches.load(Ordering::Relaxed),
            tables_probed: self.counters.tables_probed.load(Ordering::Relaxed),
            bloom_negatives: self.counters.bloom_negatives.load(Ordering::Relaxed),
            range_skips: self.counters.range_skips.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
        }
    }

    /// Build-time options derived from the engine config.
    pub fn table_options(&self) -> TableOptions {
        TableOptions {
            data_block_size: self.config.data_block_size,
            compression: self.config.compression,
            bloom_fpr: self.config.bloom_fpr,
        }
    }

    pub fn compression(&self) -> crate::codec::Compression {
        self.config.compression
    }

    pub fn cache(&self) -> Option<Arc<BlockCache>> {
        self.cache.clone()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path for the next flushed L0 table.
    pub fn next_flush_path(&self) -> PathBuf {
        self.dir.join(format!("L0_{}.sst", self.unique_ts()))
    }

    /// Path for the next compaction output at `level`.
    pub(super) fn next_compaction_path(&self, level: usize) -> PathBuf {
        let seq = self.file_seq.fetch_add(1, Ordering::SeqCst);
        self.dir
            .join(format!("L{level}_{seq}_{}.sst", self.unique_ts()))
    }

    /// Strictly increasing millisecond stamp so file names never collide.
    fn unique_ts(&self) -> i64 {
        let now = now_millis();
        let mut last = self.last_ts.load(Ordering::SeqCst);
        loop {
            let next = now.max(last + 1);
            match self.last_ts.compare_exchange(
                last,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    /// Attempts any unlinks that failed earlier. The level lists no longer
    /// reference these paths, so a missing file is success.
    pub(super) fn retry_pending_deletes(&self) {
        let mut pending = match self.pending_deletes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        pending.retain(|path| match std::fs::remove_file(path) {
            Ok(()) => false,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "deferred SSTable delete still failing");
                true
            }
        });
    }
}

impl std::fmt::Debug for LevelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LevelManager")
            .field("dir", &self.dir)
            .field("table_counts", &self.table_counts())
            .finish()
    }
}
