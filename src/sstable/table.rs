//! SSTable build and read paths.
//!
//! ## File layout
//!
//! ```text
//! +-------------------+
//! | Data Block 1      |  compressed with the configured codec
//! +-------------------+
//! | ...               |
//! +-------------------+
//! | Data Block N      |
//! +-------------------+
//! | Meta Block        |  table facts + bloom filter
//! +-------------------+
//! | Index Block       |
//! +-------------------+
//! | Footer (40 bytes) |  meta handle | index handle | magic
//! +-------------------+
//! ```
//!
//! [`TableBuilder`] streams sorted entries into data blocks, cutting a
//! block when the estimated encoded size of the next entry would push it
//! past the target (the realized size is never measured, so physical block
//! sizes vary around the target). [`Table`] opens a published file by
//! validating the footer, loading meta, bloom, and index, and then serves
//! random-access point lookups.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bloom::BloomFilter;
use crate::cache::BlockCache;
use crate::codec::Compression;
use crate::entry::{now_millis, BlockHandle, Entry};
use crate::error::{Error, Result};
use crate::sstable::block::{BlockBuilder, DataBlock};
use crate::sstable::index::{Footer, IndexBlock, IndexLookup, MetaBlock, FOOTER_LEN};

/// Build-time knobs for one table, taken from the engine config.
#[derive(Debug, Clone)]
pub struct TableOptions {
    pub data_block_size: usize,
    pub compression: Compression,
    pub bloom_fpr: f64,
}

/// Streams sorted entries into a new SSTable file.
pub struct TableBuilder {
    path: PathBuf,
    file: File,
    options: TableOptions,
    level: u32,
    bloom: BloomFilter,
    block: BlockBuilder,
    index: IndexBlock,
    offset: u64,
    entry_count: u64,
    min_key: Option<String>,
    max_key: Option<String>,
}

impl TableBuilder {
    /// Creates the file and sizes the bloom filter for `expected_entries`
    /// keys. Overestimating the count only lowers the realized false
    /// positive rate.
    pub fn new(
        path: impl Into<PathBuf>,
        level: u32,
        expected_entries: usize,
        options: TableOptions,
    ) -> Result<Self> {
        let path = path.into();
        let file = File::create(&path)?;
        let bloom = BloomFilter::new(expected_entries.max(1), options.bloom_fpr);
        Ok(Self {
            path,
            file,
            options,
            level,
            bloom,
            block: BlockBuilder::new(),
            index: IndexBlock::new(),
            offset: 0,
            entry_count: 0,
            min_key: None,
            max_key: None,
        })
    }

    /// Appends an entry. Entries must arrive in ascending key order, unique
    /// per key.
    pub fn add(&mut self, entry: &Entry) -> Result<()> {
        debug_assert!(
            self.max_key
                .as_deref()
                .map_or(true, |last| last < entry.key.as_str()),
            "entries must be added in ascending key order"
        );

        // Cut the block against the estimate, before appending.
        let estimate = BlockBuilder::estimated_entry_len(entry);
        if !self.block.is_empty() && self.block.len() + estimate > self.options.data_block_size {
            self.flush_block()?;
        }

        self.bloom.insert(entry.key.as_bytes());
        self.block.add(entry);
        self.entry_count += 1;
        if self.min_key.is_none() {
            self.min_key = Some(entry.key.clone());
        }
        self.max_key = Some(entry.key.clone());
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        let (bytes, first_key, last_key) = self.block.finish();
        let compressed = self.options.compression.compress(&bytes)?;
        self.file.write_all(&compressed)?;
        self.index.push(
            first_key,
            last_key,
            BlockHandle::new(self.offset, compressed.len() as u64),
        );
        self.offset += compressed.len() as u64;
        Ok(())
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Writes the meta block, index block, and footer, then fsyncs.
    /// Refuses to publish an empty table.
    pub fn finish(mut self) -> Result<()> {
        if self.entry_count == 0 {
            return crate::errinput!("refusing to build an empty SSTable");
        }
        if !self.block.is_empty() {
            self.flush_block()?;
        }
        self.index.data_handle = BlockHandle::new(0, self.offset);

        let meta = MetaBlock {
            created_unix: now_millis() / 1000,
            level: self.level,
            entry_count: self.entry_count,
            min_key: self.min_key.take().expect("non-empty table"),
            max_key: self.max_key.take().expect("non-empty table"),
        };
        let mut meta_buf = meta.encode();
        self.bloom.encode(&mut meta_buf);
        let meta_handle = BlockHandle::new(self.offset, meta_buf.len() as u64);
        self.file.write_all(&meta_buf)?;
        self.offset += meta_buf.len() as u64;

        let index_buf = self.index.encode();
        let index_handle = BlockHandle::new(self.offset, index_buf.len() as u64);
        self.file.write_all(&index_buf)?;

        let footer = Footer {
            meta_handle,
            index_handle,
        };
        self.file.write_all(&footer.encode())?;
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// An open, immutable SSTable serving point lookups.
pub struct Table {
    path: PathBuf,
    file: File,
    compression: Compression,
    meta: MetaBlock,
    bloom: BloomFilter,
    index: IndexBlock,
    cache: Option<Arc<BlockCache>>,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("path", &self.path)
            .field("level", &self.meta.level)
            .field("entries", &self.meta.entry_count)
            .finish()
    }
}

impl Table {
    /// Opens a published table: validates the footer magic, then loads the
    /// meta block (with its bloom filter) and the index block. Any failure
    /// is corruption tagged with the file path.
    pub fn open(
        path: impl Into<PathBuf>,
        compression: Compression,
        cache: Option<Arc<BlockCache>>,
    ) -> Result<Self> {
        let path = path.into();
        let mut file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        if file_len < FOOTER_LEN as u64 {
            return crate::errdata!(
                "{}: file too short for footer ({file_len} bytes)",
                path.display()
            );
        }

        file.seek(SeekFrom::End(-(FOOTER_LEN as i64)))?;
        let mut footer_buf = [0u8; FOOTER_LEN];
        file.read_exact(&mut footer_buf)?;
        let footer = Footer::decode(&footer_buf)
            .map_err(|e| Error::InvalidData(format!("{}: {e}", path.display())))?;

        let meta_buf = read_exact_at(&mut file, footer.meta_handle)?;
        let (meta, filter_bytes) = MetaBlock::decode(&meta_buf)
            .map_err(|e| Error::InvalidData(format!("{}: {e}", path.display())))?;
        let bloom = BloomFilter::decode(filter_bytes)
            .map_err(|e| Error::InvalidData(format!("{}: {e}", path.display())))?;

        let index_buf = read_exact_at(&mut file, footer.index_handle)?;
        let index = IndexBlock::decode(&index_buf)
            .map_err(|e| Error::InvalidData(format!("{}: {e}", path.display())))?;

        Ok(Self {
            path,
            file,
            compression,
            meta,
            bloom,
            index,
            cache,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn meta(&self) -> &MetaBlock {
        &self.meta
    }

    pub fn bloom(&self) -> &BloomFilter {
        &self.bloom
    }

    pub fn level(&self) -> u32 {
        self.meta.level
    }

    pub fn entry_count(&self) -> u64 {
        self.meta.entry_count
    }

    pub fn min_key(&self) -> &str {
        &self.meta.min_key
    }

    pub fn max_key(&self) -> &str {
        &self.meta.max_key
    }

    /// Point lookup. Returns the entry (tombstones included) or a miss.
    pub fn search(&self, key: &str) -> Result<Option<Entry>> {
        if key < self.meta.min_key.as_str() || key > self.meta.max_key.as_str() {
            return Ok(None);
        }

        let block_idx = match self.index.find(key) {
            IndexLookup::Within(idx) => idx,
            // The key fell between two blocks' ranges; the next block is
            // probed as the only secondary candidate.
            IndexLookup::Following(idx) => idx,
            IndexLookup::Miss => return Ok(None),
        };

        let block = self.read_block(block_idx)?;
        Ok(block.get(key).cloned())
    }

    /// Loads and decodes a data block, via the cache when one is attached.
    pub fn read_block(&self, block_idx: usize) -> Result<Arc<DataBlock>> {
        let handle = self
            .index
            .get(block_idx)
            .ok_or_else(|| Error::InvalidData(format!("block index {block_idx} out of range")))?
            .handle;

        if let Some(cache) = &self.cache {
            if let Some(block) = cache.get(&self.path, handle.offset) {
                return Ok(block);
            }
        }

        let mut file = self.file.try_clone()?;
        let compressed = read_exact_at(&mut file, handle)?;
        let bytes = self
            .compression
            .decompress(&compressed)
            .map_err(|e| Error::InvalidData(format!("{}: {e}", self.path.display())))?;
        let block = Arc::new(
            DataBlock::decode(&bytes)
                .map_err(|e| Error::InvalidData(format!("{}: {e}", self.path.display())))?,
        );

        if let Some(cache) = &self.cache {
            cache.insert(&self.path, handle.offset, Arc::clone(&block));
        }
        Ok(block)
    }

    pub fn block_count(&self) -> usize {
        self.index.len()
    }
}

fn read_exact_at(file: &mut File, handle: BlockHandle) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; handle.length as usize];
    file.seek(SeekFrom::Start(handle.offset))?;
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// Streaming iterator over a table's entries in key order, block by block.
/// Used as a merge source during compaction.
pub struct TableIterator {
    table: Arc<Table>,
    block_idx: usize,
    entries: Vec<Entry>,
    entry_idx: usize,
    failed: bool,
}

impl TableIterator {
    pub fn new(table: Arc<Table>) -> Self {
        Self {
            table,
            block_idx: 0,
            entries: Vec::new(),
            entry_idx: 0,
            failed: false,
        }
    }
}

impl Iterator for TableIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if self.entry_idx < self.entries.len() {
                let entry = self.entries[self.entry_idx].clone();
                self.entry_idx += 1;
                return Some(Ok(entry));
            }
            if self.block_idx >= self.table.block_count() {
                return None;
            }
            match self.table.read_block(self.block_idx) {
                Ok(block) => {
                    self.entries = block.entries().to_vec();
                    self.entry_idx = 0;
                    self.block_idx += 1;
                }
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
