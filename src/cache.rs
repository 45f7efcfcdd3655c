//! Size-bounded LRU cache of decoded data blocks.
//!
//! Keyed by `(file path, block offset)` — both stable for the lifetime of
//! an immutable SSTable. Values are decoded blocks, so a cache hit skips
//! the disk read, the decompression, and the decode. The LRU mutation is
//! serialized behind a single mutex; recency is tracked with a monotonic
//! tick per access.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::sstable::block::DataBlock;

/// Fixed per-block accounting overhead on top of the entry estimate.
const BLOCK_OVERHEAD: usize = 64;

type CacheKey = (PathBuf, u64);

/// Counters exported by [`BlockCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub max_size: usize,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Slot {
    block: Arc<DataBlock>,
    charge: usize,
    tick: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<CacheKey, Slot>,
    /// Recency order: lowest tick is the LRU tail.
    order: BTreeMap<u64, CacheKey>,
    next_tick: u64,
    size: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl Inner {
    fn touch(&mut self, key: &CacheKey) {
        let tick = self.next_tick;
        self.next_tick += 1;
        if let Some(slot) = self.entries.get_mut(key) {
            self.order.remove(&slot.tick);
            slot.tick = tick;
            self.order.insert(tick, key.clone());
        }
    }
}

/// Thread-safe LRU from `(path, offset)` to decoded block.
pub struct BlockCache {
    max_size: usize,
    inner: Mutex<Inner>,
}

impl BlockCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Returns the cached block and promotes it to most recently used.
    pub fn get(&self, path: &Path, offset: u64) -> Option<Arc<DataBlock>> {
        let key = (path.to_path_buf(), offset);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.entries.get(&key) {
            Some(slot) => {
                let block = Arc::clone(&slot.block);
                inner.hits += 1;
                inner.touch(&key);
                Some(block)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Inserts a decoded block, evicting from the LRU tail until the cache
    /// fits its budget. Inserting an existing key only promotes it.
    pub fn insert(&self, path: &Path, offset: u64, block: Arc<DataBlock>) {
        let key = (path.to_path_buf(), offset);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if inner.entries.contains_key(&key) {
            inner.touch(&key);
            return;
        }

        let charge = block.estimated_size() + BLOCK_OVERHEAD;
        let tick = inner.next_tick;
        inner.next_tick += 1;
        inner.entries.insert(
            key.clone(),
            Slot {
                block,
                charge,
                tick,
            },
        );
        inner.order.insert(tick, key);
        inner.size += charge;

        while inner.size > self.max_size {
            let Some((&oldest_tick, _)) = inner.order.iter().next() else {
                break;
            };
            let victim = inner.order.remove(&oldest_tick).expect("tick present");
            if let Some(slot) = inner.entries.remove(&victim) {
                inner.size -= slot.charge;
                inner.evictions += 1;
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            size: inner.size,
            max_size: self.max_size,
        }
    }
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("BlockCache")
            .field("size", &stats.size)
            .field("max_size", &stats.max_size)
            .field("hit_ratio", &stats.hit_ratio())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Entry;

    fn block(value_len: usize) -> Arc<DataBlock> {
        let mut builder = crate::sstable::block::BlockBuilder::new();
        builder.add(&Entry::put("key", vec![0u8; value_len], 1));
        let (bytes, _, _) = builder.finish();
        Arc::new(DataBlock::decode(&bytes).unwrap())
    }

    #[test]
    fn test_hit_and_miss_counting() {
        let cache = BlockCache::new(1 << 20);
        let path = Path::new("/t/a.sst");

        assert!(cache.get(path, 0).is_none());
        cache.insert(path, 0, block(10));
        assert!(cache.get(path, 0).is_some());
        assert!(cache.get(path, 4096).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert!((stats.hit_ratio() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_keys_distinguish_file_and_offset() {
        let cache = BlockCache::new(1 << 20);
        cache.insert(Path::new("/t/a.sst"), 0, block(1));

        assert!(cache.get(Path::new("/t/b.sst"), 0).is_none());
        assert!(cache.get(Path::new("/t/a.sst"), 1).is_none());
        assert!(cache.get(Path::new("/t/a.sst"), 0).is_some());
    }

    #[test]
    fn test_eviction_from_lru_tail() {
        // Each block charges ~100 bytes of value plus overheads; size the
        // cache for roughly two of them.
        let one = block(100);
        let budget = 2 * (one.estimated_size() + BLOCK_OVERHEAD);
        let cache = BlockCache::new(budget);
        let path = Path::new("/t/a.sst");

        cache.insert(path, 0, block(100));
        cache.insert(path, 1, block(100));
        // Touch offset 0 so offset 1 becomes the tail.
        assert!(cache.get(path, 0).is_some());

        cache.insert(path, 2, block(100));
        assert!(cache.get(path, 1).is_none(), "tail should be evicted");
        assert!(cache.get(path, 0).is_some());
        assert!(cache.get(path, 2).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_size_respects_budget() {
        let one = block(50);
        let budget = 3 * (one.estimated_size() + BLOCK_OVERHEAD);
        let cache = BlockCache::new(budget);
        let path = Path::new("/t/a.sst");

        for offset in 0..20 {
            cache.insert(path, offset, block(50));
            assert!(cache.stats().size <= budget);
        }
        assert_eq!(cache.stats().evictions, 17);
    }

    #[test]
    fn test_reinsert_promotes_without_double_charge() {
        let cache = BlockCache::new(1 << 20);
        let path = Path::new("/t/a.sst");

        cache.insert(path, 0, block(10));
        let size_after_first = cache.stats().size;
        cache.insert(path, 0, block(10));
        assert_eq!(cache.stats().size, size_after_first);
    }

    #[test]
    fn test_concurrent_access() {
        use std::thread;

        let cache = Arc::new(BlockCache::new(1 << 16));
        let mut handles = Vec::new();
        for t in 0..4 {
            let cache = Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                let path = PathBuf::from(format!("/t/{t}.sst"));
                for i in 0..100u64 {
                    cache.insert(&path, i, block(20));
                    cache.get(&path, i);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let stats = cache.stats();
        assert!(stats.hits + stats.misses >= 400);
        assert!(stats.size <= stats.max_size);
    }
}
