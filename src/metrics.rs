//! Engine metrics snapshot for monitoring and tests.

use crate::cache::CacheStats;
use crate::levels::SearchStats;

/// Point-in-time view of the engine's moving parts.
#[derive(Debug, Clone)]
pub struct Metrics {
    /// Accounted size of the active memtable.
    pub active_memtable_bytes: usize,
    /// Accounted size of the memtable currently draining, if any.
    pub flushing_memtable_bytes: usize,
    /// Table count per level, L0 first.
    pub level_table_counts: Vec<usize>,
    /// Level-manager probe counters.
    pub search: SearchStats,
    /// Block cache counters; absent when the cache is disabled.
    pub cache: Option<CacheStats>,
}

impl Metrics {
    pub fn total_tables(&self) -> usize {
        self.level_table_counts.iter().sum()
    }

    /// Emits the snapshot as one structured log line.
    pub fn log(&self) {
        tracing::info!(
            active_bytes = self.active_memtable_bytes,
            flushing_bytes = self.flushing_memtable_bytes,
            tables = self.total_tables(),
            searches = self.search.searches,
            tables_probed = self.search.tables_probed,
            bloom_negatives = self.search.bloom_negatives,
            cache_hit_ratio = self.cache.map(|c| c.hit_ratio()).unwrap_or(0.0),
            "engine status"
        );
    }
}
