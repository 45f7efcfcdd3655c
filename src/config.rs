use std::path::PathBuf;

use crate::codec::Compression;

/// Configuration for a CinderDB instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory path for the database
    pub dir: PathBuf,

    /// Memtable size at which it becomes flush-eligible (default: 1 MiB)
    pub memtable_threshold: usize,

    /// Target pre-compression data block size (default: 4 KiB)
    pub data_block_size: usize,

    /// Bloom filter target false-positive rate (default: 0.01)
    pub bloom_fpr: f64,

    /// Codec applied to SSTable data blocks (default: gzip)
    pub compression: Compression,

    /// Block cache capacity in bytes; 0 disables the cache (default: 64 MiB)
    pub block_cache_size: usize,

    /// Maximum number of levels (default: 7)
    pub max_levels: usize,

    /// Number of L0 tables that triggers compaction (default: 4)
    pub l0_compaction_trigger: usize,

    /// Table count multiplier between adjacent levels (default: 10)
    pub level_ratio: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./cinderdb"),
            memtable_threshold: 1024 * 1024,
            data_block_size: 4096,
            bloom_fpr: 0.01,
            compression: Compression::Gzip,
            block_cache_size: 64 * 1024 * 1024,
            max_levels: 7,
            l0_compaction_trigger: 4,
            level_ratio: 10,
        }
    }
}

impl Config {
    /// Create a new config rooted at the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the memtable flush threshold in bytes.
    pub fn memtable_threshold(mut self, bytes: usize) -> Self {
        self.memtable_threshold = bytes;
        self
    }

    /// Set the target pre-compression data block size.
    pub fn data_block_size(mut self, bytes: usize) -> Self {
        self.data_block_size = bytes;
        self
    }

    /// Set the bloom filter target false-positive rate.
    pub fn bloom_fpr(mut self, fpr: f64) -> Self {
        self.bloom_fpr = fpr;
        self
    }

    /// Set the data block codec.
    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Set the block cache capacity; 0 disables the cache.
    pub fn block_cache_size(mut self, bytes: usize) -> Self {
        self.block_cache_size = bytes;
        self
    }

    /// Set the maximum level depth.
    pub fn max_levels(mut self, levels: usize) -> Self {
        self.max_levels = levels;
        self
    }

    /// Set the L0 table count that triggers compaction.
    pub fn l0_compaction_trigger(mut self, tables: usize) -> Self {
        self.l0_compaction_trigger = tables;
        self
    }

    /// Set the table count multiplier between adjacent levels.
    pub fn level_ratio(mut self, ratio: usize) -> Self {
        self.level_ratio = ratio;
        self
    }

    /// Target table count for a level. Level 0 uses the compaction trigger;
    /// level i >= 1 targets `trigger * ratio^i` tables.
    pub fn level_target(&self, level: usize) -> usize {
        let mut target = self.l0_compaction_trigger;
        for _ in 0..level {
            target = target.saturating_mul(self.level_ratio);
        }
        target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.memtable_threshold, 1024 * 1024);
        assert_eq!(config.data_block_size, 4096);
        assert_eq!(config.bloom_fpr, 0.01);
        assert_eq!(config.compression, Compression::Gzip);
        assert_eq!(config.block_cache_size, 64 * 1024 * 1024);
        assert_eq!(config.max_levels, 7);
        assert_eq!(config.l0_compaction_trigger, 4);
        assert_eq!(config.level_ratio, 10);
    }

    #[test]
    fn test_config_builder() {
        let config = Config::new("/tmp/test")
            .memtable_threshold(512 * 1024)
            .data_block_size(8192)
            .bloom_fpr(0.05)
            .compression(Compression::None)
            .block_cache_size(0)
            .max_levels(4)
            .l0_compaction_trigger(2)
            .level_ratio(4);

        assert_eq!(config.dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.memtable_threshold, 512 * 1024);
        assert_eq!(config.data_block_size, 8192);
        assert_eq!(config.bloom_fpr, 0.05);
        assert_eq!(config.compression, Compression::None);
        assert_eq!(config.block_cache_size, 0);
        assert_eq!(config.max_levels, 4);
        assert_eq!(config.l0_compaction_trigger, 2);
        assert_eq!(config.level_ratio, 4);
    }

    #[test]
    fn test_level_targets() {
        let config = Config::default();
        assert_eq!(config.level_target(0), 4);
        assert_eq!(config.level_target(1), 40);
        assert_eq!(config.level_target(2), 400);

        let config = Config::default().l0_compaction_trigger(2).level_ratio(3);
        assert_eq!(config.level_target(0), 2);
        assert_eq!(config.level_target(1), 6);
        assert_eq!(config.level_target(2), 18);
    }
}
