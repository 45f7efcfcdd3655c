//! Data block encoding and decoding.
//!
//! Entries inside a block are prefix-compressed against the previous key;
//! the previous key resets at every block boundary, so each block decodes
//! independently. Per-entry layout, little-endian, pre-compression:
//!
//! ```text
//! +---------------+----------+--------+-----------+-------+------------+------------+
//! |prefix_len: u16|suffix:u16| suffix |val_len:u32| value |tombstone:u8|timestamp:i64|
//! +---------------+----------+--------+-----------+-------+------------+------------+
//! ```
//!
//! A block is decoded in full into its entry vector, then point lookups
//! binary-search the decoded entries; the block cache stores decoded
//! blocks, so the cost is paid once per cached block.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::entry::Entry;
use crate::error::{Error, Result};

/// Fixed per-entry encoding overhead: prefix len, suffix len, value len,
/// tombstone, timestamp.
const ENTRY_HEADER_LEN: usize = 2 + 2 + 4 + 1 + 8;

/// Builds one data block by appending entries in key order.
pub struct BlockBuilder {
    buffer: Vec<u8>,
    last_key: Vec<u8>,
    first_key: Option<String>,
    last_key_str: Option<String>,
    entry_count: usize,
}

impl BlockBuilder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            last_key: Vec::new(),
            first_key: None,
            last_key_str: None,
            entry_count: 0,
        }
    }

    /// Encoded size the entry would add, computed before appending so block
    /// cuts happen against the estimate rather than the realized buffer.
    /// The prefix saving is not counted, keeping the estimate conservative.
    pub fn estimated_entry_len(entry: &Entry) -> usize {
        ENTRY_HEADER_LEN + entry.key.len() + entry.value.len()
    }

    /// Appends an entry. The caller feeds entries in ascending key order.
    pub fn add(&mut self, entry: &Entry) {
        let key = entry.key.as_bytes();
        let prefix_len = shared_prefix(&self.last_key, key);
        let suffix = &key[prefix_len..];

        self.buffer
            .write_u16::<LittleEndian>(prefix_len as u16)
            .expect("vec write");
        self.buffer
            .write_u16::<LittleEndian>(suffix.len() as u16)
            .expect("vec write");
        self.buffer.extend_from_slice(suffix);
        self.buffer
            .write_u32::<LittleEndian>(entry.value.len() as u32)
            .expect("vec write");
        self.buffer.extend_from_slice(&entry.value);
        self.buffer.write_u8(entry.tombstone as u8).expect("vec write");
        self.buffer
            .write_i64::<LittleEndian>(entry.timestamp)
            .expect("vec write");

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        if self.first_key.is_none() {
            self.first_key = Some(entry.key.clone());
        }
        self.last_key_str = Some(entry.key.clone());
        self.entry_count += 1;
    }

    /// Current encoded size of the block.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    /// Returns the encoded block bytes and its inclusive key range,
    /// resetting the builder for the next block.
    pub fn finish(&mut self) -> (Vec<u8>, String, String) {
        let bytes = std::mem::take(&mut self.buffer);
        let first = self.first_key.take().expect("finish on empty block");
        let last = self.last_key_str.take().expect("finish on empty block");
        self.last_key.clear();
        self.entry_count = 0;
        (bytes, first, last)
    }
}

impl Default for BlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn shared_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// A decoded data block: its entries, sorted by key, unique per key.
#[derive(Debug)]
pub struct DataBlock {
    entries: Vec<Entry>,
}

impl DataBlock {
    /// Decodes uncompressed block bytes. Any structural inconsistency is
    /// corruption.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut entries = Vec::new();
        let mut last_key: Vec<u8> = Vec::new();
        let mut cursor = data;

        while !cursor.is_empty() {
            let prefix_len = cursor.read_u16::<LittleEndian>()? as usize;
            let suffix_len = cursor.read_u16::<LittleEndian>()? as usize;
            if prefix_len > last_key.len() || suffix_len > cursor.len() {
                return crate::errdata!("block entry key lengths out of bounds");
            }

            let mut key = Vec::with_capacity(prefix_len + suffix_len);
            key.extend_from_slice(&last_key[..prefix_len]);
            key.extend_from_slice(&cursor[..suffix_len]);
            cursor = &cursor[suffix_len..];

            let value_len = cursor.read_u32::<LittleEndian>()? as usize;
            if value_len > cursor.len() {
                return crate::errdata!("block entry value length out of bounds");
            }
            let value = cursor[..value_len].to_vec();
            cursor = &cursor[value_len..];

            let tombstone = match cursor.read_u8()? {
                0 => false,
                1 => true,
                other => return crate::errdata!("bad tombstone flag {other} in block"),
            };
            let timestamp = cursor.read_i64::<LittleEndian>()?;

            last_key.clone_from(&key);
            let key = String::from_utf8(key)
                .map_err(|_| Error::InvalidData("non-UTF-8 key in block".into()))?;
            entries.push(Entry {
                key,
                value,
                tombstone,
                timestamp,
            });
        }

        Ok(Self { entries })
    }

    /// Point lookup by binary search over the decoded entries.
    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.entries
            .binary_search_by(|e| e.key.as_bytes().cmp(key.as_bytes()))
            .ok()
            .map(|idx| &self.entries[idx])
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Estimated memory charge for cache accounting.
    pub fn estimated_size(&self) -> usize {
        self.entries.iter().map(|e| e.estimated_size()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(entries: &[Entry]) -> Vec<u8> {
        let mut builder = BlockBuilder::new();
        for entry in entries {
            builder.add(entry);
        }
        let (bytes, first, last) = builder.finish();
        assert_eq!(first, entries.first().unwrap().key);
        assert_eq!(last, entries.last().unwrap().key);
        bytes
    }

    #[test]
    fn test_roundtrip_preserves_entries() {
        let entries = vec![
            Entry::put("apple", b"fruit".to_vec(), 10),
            Entry::put("application", b"software".to_vec(), 11),
            Entry::tombstone("apply", 12),
            Entry::put("banana", Vec::new(), 13),
        ];
        let bytes = build(&entries);
        let block = DataBlock::decode(&bytes).expect("decode failed");
        assert_eq!(block.entries(), entries.as_slice());
    }

    #[test]
    fn test_prefix_compression_shrinks_shared_keys() {
        let shared: Vec<Entry> = (0..32)
            .map(|i| Entry::put(format!("common_prefix_key_{i:02}"), b"v".to_vec(), 1))
            .collect();
        let bytes = build(&shared);

        let raw_key_bytes: usize = shared.iter().map(|e| e.key.len()).sum();
        let encoded_key_bytes = bytes.len() - shared.len() * (ENTRY_HEADER_LEN + 1);
        assert!(
            encoded_key_bytes < raw_key_bytes,
            "prefix compression had no effect"
        );
    }

    #[test]
    fn test_get_hits_and_misses() {
        let entries = vec![
            Entry::put("a", b"1".to_vec(), 1),
            Entry::put("c", b"3".to_vec(), 1),
            Entry::put("e", b"5".to_vec(), 1),
        ];
        let block = DataBlock::decode(&build(&entries)).unwrap();

        assert_eq!(block.get("c").unwrap().value, b"3");
        assert!(block.get("b").is_none());
        assert!(block.get("z").is_none());
    }

    #[test]
    fn test_tombstone_and_timestamp_survive() {
        let entries = vec![Entry::tombstone("gone", 987654321)];
        let block = DataBlock::decode(&build(&entries)).unwrap();
        let entry = block.get("gone").unwrap();
        assert!(entry.tombstone);
        assert_eq!(entry.timestamp, 987654321);
    }

    #[test]
    fn test_max_len_key_roundtrip() {
        // Exercise the u16 boundary on suffix length.
        let long_key = "k".repeat(crate::entry::MAX_KEY_LEN);
        let entries = vec![Entry::put(long_key.clone(), b"v".to_vec(), 1)];
        let block = DataBlock::decode(&build(&entries)).unwrap();
        assert!(block.get(&long_key).is_some());
    }

    #[test]
    fn test_estimate_is_upper_bound_of_encoding() {
        let entries = vec![
            Entry::put("shared_aaa", b"xx".to_vec(), 1),
            Entry::put("shared_aab", b"yy".to_vec(), 2),
        ];
        let estimate: usize = entries.iter().map(BlockBuilder::estimated_entry_len).sum();
        let bytes = build(&entries);
        assert!(bytes.len() <= estimate);
    }

    #[test]
    fn test_corrupt_lengths_rejected() {
        let entries = vec![Entry::put("key", b"value".to_vec(), 1)];
        let mut bytes = build(&entries);

        // Claim a suffix longer than the remaining buffer.
        bytes[2] = 0xff;
        bytes[3] = 0xff;
        assert!(DataBlock::decode(&bytes).is_err());
    }

    #[test]
    fn test_truncated_block_rejected() {
        let entries = vec![Entry::put("key", b"value".to_vec(), 1)];
        let mut bytes = build(&entries);
        bytes.truncate(bytes.len() - 3);
        assert!(DataBlock::decode(&bytes).is_err());
    }

    #[test]
    fn test_empty_block_decodes_empty() {
        let block = DataBlock::decode(&[]).unwrap();
        assert!(block.is_empty());
    }
}
