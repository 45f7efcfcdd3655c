//! Core record and handle types shared across the write path, the on-disk
//! formats, and the merge machinery.

use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;

/// Keys are bounded by the u16 suffix-length encoding in data blocks.
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

/// Fixed per-entry overhead used by the accounted-size estimator, covering
/// the tombstone flag, timestamp, and container bookkeeping.
const ENTRY_OVERHEAD: usize = 24;

/// A single immutable record. The unit stored in the WAL, the memtable, and
/// SSTable data blocks.
///
/// Entries order by key ascending (byte order of the UTF-8 encoding), then
/// timestamp descending, so the newest version of a key sorts first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: Vec<u8>,
    pub tombstone: bool,
    pub timestamp: i64,
}

impl Entry {
    /// Creates a value entry. A zero timestamp is replaced with the current
    /// wall clock at ingress.
    pub fn put(key: impl Into<String>, value: Vec<u8>, timestamp: i64) -> Self {
        Self {
            key: key.into(),
            value,
            tombstone: false,
            timestamp: if timestamp == 0 { now_millis() } else { timestamp },
        }
    }

    /// Creates a tombstone entry hiding all older versions of the key.
    pub fn tombstone(key: impl Into<String>, timestamp: i64) -> Self {
        Self {
            key: key.into(),
            value: Vec::new(),
            tombstone: true,
            timestamp: if timestamp == 0 { now_millis() } else { timestamp },
        }
    }

    /// Estimated in-memory cost, used for memtable and cache accounting.
    pub fn estimated_size(&self) -> usize {
        self.key.len() + self.value.len() + ENTRY_OVERHEAD
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .as_bytes()
            .cmp(other.key.as_bytes())
            .then_with(|| other.timestamp.cmp(&self.timestamp))
            .then_with(|| self.tombstone.cmp(&other.tombstone))
            .then_with(|| self.value.cmp(&other.value))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A byte range within an SSTable file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub length: u64,
}

impl BlockHandle {
    /// Encoded size: two u64 fields.
    pub const ENCODED_LEN: usize = 16;

    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.write_u64::<LittleEndian>(self.offset).expect("vec write");
        buf.write_u64::<LittleEndian>(self.length).expect("vec write");
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        let offset = data.read_u64::<LittleEndian>()?;
        let length = data.read_u64::<LittleEndian>()?;
        Ok(Self { offset, length })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_ordering_by_key() {
        let a = Entry::put("apple", b"1".to_vec(), 5);
        let b = Entry::put("banana", b"2".to_vec(), 1);
        assert!(a < b);
    }

    #[test]
    fn test_entry_ordering_newest_first_within_key() {
        let old = Entry::put("k", b"old".to_vec(), 100);
        let new = Entry::put("k", b"new".to_vec(), 200);
        assert!(new < old, "newer timestamp must sort before older");
    }

    #[test]
    fn test_zero_timestamp_assigned_at_ingress() {
        let entry = Entry::put("k", b"v".to_vec(), 0);
        assert!(entry.timestamp > 0);

        let entry = Entry::tombstone("k", 0);
        assert!(entry.timestamp > 0);
        assert!(entry.tombstone);
        assert!(entry.value.is_empty());
    }

    #[test]
    fn test_explicit_timestamp_kept() {
        let entry = Entry::put("k", b"v".to_vec(), 42);
        assert_eq!(entry.timestamp, 42);
    }

    #[test]
    fn test_block_handle_roundtrip() {
        let handle = BlockHandle::new(8192, 517);
        let mut buf = Vec::new();
        handle.encode(&mut buf);
        assert_eq!(buf.len(), BlockHandle::ENCODED_LEN);

        let decoded = BlockHandle::decode(&buf).expect("decode failed");
        assert_eq!(decoded, handle);
    }
}
