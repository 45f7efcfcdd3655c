//! SSTable index block, meta block, and footer.
//!
//! The index block maps each data block to its inclusive key range and byte
//! range; the meta block carries table-level facts (creation time, level,
//! entry count, key bounds) followed by the serialized bloom filter; the
//! fixed 40-byte footer points at both and ends in the magic number.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::entry::BlockHandle;
use crate::error::{Error, Result};

/// Trailing magic of every SSTable file.
pub const MAGIC: u64 = 0x1234567890ABCDEF;

/// Footer length: two handles plus the magic.
pub const FOOTER_LEN: usize = 2 * BlockHandle::ENCODED_LEN + 8;

/// One index record: the inclusive key range of a data block and its
/// location in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub start_key: String,
    pub end_key: String,
    pub handle: BlockHandle,
}

/// Where a key landed in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexLookup {
    /// The key lies inside this block's inclusive range.
    Within(usize),
    /// The key lies between blocks; this is the first block whose start key
    /// is greater, probed as a secondary candidate.
    Following(usize),
    /// The key is past the last block.
    Miss,
}

/// The in-memory index over a table's data blocks.
#[derive(Debug, Clone)]
pub struct IndexBlock {
    /// Aggregate handle over all data bytes in the file.
    pub data_handle: BlockHandle,
    entries: Vec<IndexEntry>,
}

impl IndexBlock {
    pub fn new() -> Self {
        Self {
            data_handle: BlockHandle::new(0, 0),
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, start_key: String, end_key: String, handle: BlockHandle) {
        self.entries.push(IndexEntry {
            start_key,
            end_key,
            handle,
        });
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&IndexEntry> {
        self.entries.get(idx)
    }

    /// Binary-searches for the block containing `key`. A key inside some
    /// block's inclusive `[start_key, end_key]` resolves to `Within`; a key
    /// falling in the gap between two blocks resolves to `Following` on the
    /// first block whose start key exceeds it.
    pub fn find(&self, key: &str) -> IndexLookup {
        let key = key.as_bytes();
        // Partition point: number of blocks with start_key <= key.
        let upper = self
            .entries
            .partition_point(|e| e.start_key.as_bytes() <= key);

        if upper > 0 {
            let candidate = &self.entries[upper - 1];
            if key <= candidate.end_key.as_bytes() {
                return IndexLookup::Within(upper - 1);
            }
        }
        if upper < self.entries.len() {
            return IndexLookup::Following(upper);
        }
        IndexLookup::Miss
    }

    /// Wire form, little-endian:
    ///
    /// ```text
    /// u64 data_offset | u64 data_length | i32 entry_count
    ///   | entry_count x { i32 start_len | start | i32 end_len | end | u64 off | u64 len }
    /// ```
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u64::<LittleEndian>(self.data_handle.offset)
            .expect("vec write");
        buf.write_u64::<LittleEndian>(self.data_handle.length)
            .expect("vec write");
        buf.write_i32::<LittleEndian>(self.entries.len() as i32)
            .expect("vec write");
        for entry in &self.entries {
            buf.write_i32::<LittleEndian>(entry.start_key.len() as i32)
                .expect("vec write");
            buf.extend_from_slice(entry.start_key.as_bytes());
            buf.write_i32::<LittleEndian>(entry.end_key.len() as i32)
                .expect("vec write");
            buf.extend_from_slice(entry.end_key.as_bytes());
            buf.write_u64::<LittleEndian>(entry.handle.offset)
                .expect("vec write");
            buf.write_u64::<LittleEndian>(entry.handle.length)
                .expect("vec write");
        }
        buf
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        let data_offset = data.read_u64::<LittleEndian>()?;
        let data_length = data.read_u64::<LittleEndian>()?;
        let count = data.read_i32::<LittleEndian>()?;
        if count < 0 {
            return crate::errdata!("negative index entry count {count}");
        }

        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let start_key = read_key(&mut data)?;
            let end_key = read_key(&mut data)?;
            let offset = data.read_u64::<LittleEndian>()?;
            let length = data.read_u64::<LittleEndian>()?;
            entries.push(IndexEntry {
                start_key,
                end_key,
                handle: BlockHandle::new(offset, length),
            });
        }

        Ok(Self {
            data_handle: BlockHandle::new(data_offset, data_length),
            entries,
        })
    }
}

fn read_key(data: &mut &[u8]) -> Result<String> {
    let len = data.read_i32::<LittleEndian>()?;
    if len < 0 || len as usize > data.len() {
        return crate::errdata!("index key length {len} out of bounds");
    }
    let (key, rest) = data.split_at(len as usize);
    *data = rest;
    String::from_utf8(key.to_vec())
        .map_err(|_| Error::InvalidData("non-UTF-8 key in index block".into()))
}

/// Table-level facts recorded at publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaBlock {
    pub created_unix: i64,
    pub level: u32,
    pub entry_count: u64,
    pub min_key: String,
    pub max_key: String,
}

impl MetaBlock {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_i64::<LittleEndian>(self.created_unix)
            .expect("vec write");
        buf.write_u32::<LittleEndian>(self.level).expect("vec write");
        buf.write_u64::<LittleEndian>(self.entry_count)
            .expect("vec write");
        buf.write_u32::<LittleEndian>(self.min_key.len() as u32)
            .expect("vec write");
        buf.extend_from_slice(self.min_key.as_bytes());
        buf.write_u32::<LittleEndian>(self.max_key.len() as u32)
            .expect("vec write");
        buf.extend_from_slice(self.max_key.as_bytes());
        buf
    }

    /// Decodes the meta fields, returning the remaining bytes (the
    /// serialized bloom filter region).
    pub fn decode(mut data: &[u8]) -> Result<(Self, &[u8])> {
        let created_unix = data.read_i64::<LittleEndian>()?;
        let level = data.read_u32::<LittleEndian>()?;
        let entry_count = data.read_u64::<LittleEndian>()?;
        let min_key = read_meta_key(&mut data)?;
        let max_key = read_meta_key(&mut data)?;
        Ok((
            Self {
                created_unix,
                level,
                entry_count,
                min_key,
                max_key,
            },
            data,
        ))
    }
}

fn read_meta_key(data: &mut &[u8]) -> Result<String> {
    let len = data.read_u32::<LittleEndian>()? as usize;
    if len > data.len() {
        return crate::errdata!("meta key length {len} out of bounds");
    }
    let (key, rest) = data.split_at(len);
    *data = rest;
    String::from_utf8(key.to_vec())
        .map_err(|_| Error::InvalidData("non-UTF-8 key in meta block".into()))
}

/// The fixed-size footer closing every table file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub meta_handle: BlockHandle,
    pub index_handle: BlockHandle,
}

impl Footer {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FOOTER_LEN);
        self.meta_handle.encode(&mut buf);
        self.index_handle.encode(&mut buf);
        buf.write_u64::<LittleEndian>(MAGIC).expect("vec write");
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != FOOTER_LEN {
            return crate::errdata!("footer length {} != {FOOTER_LEN}", data.len());
        }
        let meta_handle = BlockHandle::decode(&data[0..16])?;
        let index_handle = BlockHandle::decode(&data[16..32])?;
        let magic = (&data[32..40]).read_u64::<LittleEndian>()?;
        if magic != MAGIC {
            return crate::errdata!("bad footer magic {magic:#018x}");
        }
        Ok(Self {
            meta_handle,
            index_handle,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> IndexBlock {
        let mut index = IndexBlock::new();
        index.data_handle = BlockHandle::new(0, 3000);
        index.push("a".into(), "f".into(), BlockHandle::new(0, 1000));
        index.push("h".into(), "m".into(), BlockHandle::new(1000, 1000));
        index.push("p".into(), "t".into(), BlockHandle::new(2000, 1000));
        index
    }

    #[test]
    fn test_index_roundtrip() {
        let index = sample_index();
        let decoded = IndexBlock::decode(&index.encode()).expect("decode failed");
        assert_eq!(decoded.entries(), index.entries());
        assert_eq!(decoded.data_handle, index.data_handle);
    }

    #[test]
    fn test_find_within_block() {
        let index = sample_index();
        assert_eq!(index.find("a"), IndexLookup::Within(0));
        assert_eq!(index.find("c"), IndexLookup::Within(0));
        assert_eq!(index.find("f"), IndexLookup::Within(0));
        assert_eq!(index.find("h"), IndexLookup::Within(1));
        assert_eq!(index.find("t"), IndexLookup::Within(2));
    }

    #[test]
    fn test_find_between_blocks_probes_following() {
        let index = sample_index();
        // "g" falls between [a,f] and [h,m]: probe the next block only.
        assert_eq!(index.find("g"), IndexLookup::Following(1));
        assert_eq!(index.find("n"), IndexLookup::Following(2));
    }

    #[test]
    fn test_find_outside_range() {
        let index = sample_index();
        // Before the first block: the first block is the following candidate.
        assert_eq!(index.find("A"), IndexLookup::Following(0));
        // Past the last block: miss.
        assert_eq!(index.find("z"), IndexLookup::Miss);
    }

    #[test]
    fn test_meta_roundtrip_with_trailing_filter_bytes() {
        let meta = MetaBlock {
            created_unix: 1_700_000_000,
            level: 3,
            entry_count: 4096,
            min_key: "aardvark".into(),
            max_key: "zebra".into(),
        };
        let mut buf = meta.encode();
        buf.extend_from_slice(b"filter-bytes-here");

        let (decoded, rest) = MetaBlock::decode(&buf).expect("decode failed");
        assert_eq!(decoded, meta);
        assert_eq!(rest, b"filter-bytes-here");
    }

    #[test]
    fn test_footer_roundtrip() {
        let footer = Footer {
            meta_handle: BlockHandle::new(100, 50),
            index_handle: BlockHandle::new(150, 80),
        };
        let bytes = footer.encode();
        assert_eq!(bytes.len(), FOOTER_LEN);

        let decoded = Footer::decode(&bytes).expect("decode failed");
        assert_eq!(decoded, footer);
    }

    #[test]
    fn test_footer_bad_magic_rejected() {
        let footer = Footer {
            meta_handle: BlockHandle::new(0, 0),
            index_handle: BlockHandle::new(0, 0),
        };
        let mut bytes = footer.encode();
        bytes[39] ^= 0xff;
        match Footer::decode(&bytes) {
            Err(Error::InvalidData(msg)) => assert!(msg.contains("magic")),
            other => panic!("expected corruption error, got {other:?}"),
        }
    }

    #[test]
    fn test_index_decode_rejects_bad_lengths() {
        let index = sample_index();
        let mut bytes = index.encode();
        // Corrupt the first start_len to exceed the buffer.
        bytes[20] = 0xff;
        bytes[21] = 0xff;
        bytes[22] = 0xff;
        assert!(IndexBlock::decode(&bytes).is_err());
    }
}
