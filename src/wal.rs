//! Write-ahead log: the durability gate for every memtable write.
//!
//! Each memtable owns one WAL file. Entries are appended before they become
//! visible in the memtable's index, flushed and fsync'd before the write is
//! acknowledged, and the file is deleted only once the memtable's contents
//! have been published as an SSTable.
//!
//! # Record format
//!
//! Little-endian, back to back until EOF:
//!
//! ```text
//! +-----------+-------+-------------+-------+------------+------------+
//! |key_len:u32| key   |value_len:u32| value |tombstone:u8|timestamp:i64|
//! +-----------+-------+-------------+-------+------------+------------+
//! ```
//!
//! Replay treats any record-level decoding failure (truncation, invalid
//! length, bad flag byte) as a torn tail: it stops there and returns the
//! entries read so far. A torn tail is expected after a crash and is not an
//! error.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::entry::{Entry, MAX_KEY_LEN};
use crate::error::{Error, Result};

/// Upper bound on a single value record; larger lengths are treated as a
/// corrupt tail rather than an allocation request.
const MAX_VALUE_LEN: usize = 1 << 30;

pub struct Wal {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal").field("path", &self.path).finish()
    }
}

impl Wal {
    /// Opens the WAL at `path`, creating it if missing. The file is held in
    /// append mode for the lifetime of the log.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        Ok(Self {
            path,
            writer: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Numeric id parsed from a `wal_<id>.wal` file name.
    pub fn id(&self) -> Result<u64> {
        parse_wal_id(&self.path)
            .ok_or_else(|| Error::InvalidData(format!("invalid WAL file name: {:?}", self.path)))
    }

    /// Appends the given entries as one durable batch: all records are
    /// serialized under the writer lock, the user buffer is flushed, and an
    /// fsync is requested before returning success.
    pub fn write(&self, entries: &[Entry]) -> Result<()> {
        let mut guard = self.writer.lock()?;
        let writer = guard.as_mut().ok_or(Error::Closed)?;

        for entry in entries {
            writer.write_u32::<LittleEndian>(entry.key.len() as u32)?;
            writer.write_all(entry.key.as_bytes())?;
            writer.write_u32::<LittleEndian>(entry.value.len() as u32)?;
            writer.write_all(&entry.value)?;
            writer.write_u8(entry.tombstone as u8)?;
            writer.write_i64::<LittleEndian>(entry.timestamp)?;
        }

        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Streams records from the start of the file until EOF or the first
    /// malformed record, returning everything decoded up to that point.
    pub fn read(&self) -> Result<Vec<Entry>> {
        if self.writer.lock()?.is_none() {
            return Err(Error::Closed);
        }

        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();

        loop {
            match read_record(&mut reader) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        records = entries.len(),
                        error = %e,
                        "WAL replay stopped at torn tail"
                    );
                    break;
                }
            }
        }

        Ok(entries)
    }

    /// Closes and unlinks the file. Subsequent operations fail with
    /// `Error::Closed`. Called only after the memtable's contents are
    /// durably on disk as an SSTable.
    pub fn delete(&self) -> Result<()> {
        let mut guard = self.writer.lock()?;
        if guard.take().is_none() {
            return Err(Error::Closed);
        }
        drop(guard);
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

/// Parses the id out of a `wal_<id>.wal` path.
pub fn parse_wal_id(path: &Path) -> Option<u64> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| stem.strip_prefix("wal_"))
        .and_then(|id| id.parse::<u64>().ok())
}

/// Reads one record. `Ok(None)` is a clean EOF before the record started;
/// any failure mid-record is a torn tail.
fn read_record<R: Read>(reader: &mut R) -> Result<Option<Entry>> {
    let key_len = match reader.read_u32::<LittleEndian>() {
        Ok(len) => len as usize,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if key_len == 0 || key_len > MAX_KEY_LEN {
        return crate::errdata!("record key length {key_len} out of range");
    }

    let mut key = vec![0u8; key_len];
    reader.read_exact(&mut key)?;
    let key = String::from_utf8(key).map_err(|_| Error::InvalidData("non-UTF-8 key".into()))?;

    let value_len = reader.read_u32::<LittleEndian>()? as usize;
    if value_len > MAX_VALUE_LEN {
        return crate::errdata!("record value length {value_len} out of range");
    }
    let mut value = vec![0u8; value_len];
    reader.read_exact(&mut value)?;

    let tombstone = match reader.read_u8()? {
        0 => false,
        1 => true,
        other => return crate::errdata!("bad tombstone flag {other}"),
    };
    let timestamp = reader.read_i64::<LittleEndian>()?;

    Ok(Some(Entry {
        key,
        value,
        tombstone,
        timestamp,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Seek;
    use tempfile::TempDir;

    fn temp_wal(dir: &TempDir) -> Wal {
        Wal::open(dir.path().join("wal_0.wal")).expect("failed to open WAL")
    }

    #[test]
    fn test_write_and_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let wal = temp_wal(&dir);

        let entries = vec![
            Entry::put("key1", b"value1".to_vec(), 10),
            Entry::put("key2", Vec::new(), 11),
            Entry::tombstone("key3", 12),
        ];
        wal.write(&entries).expect("write failed");

        let replayed = wal.read().expect("read failed");
        assert_eq!(replayed, entries);
    }

    #[test]
    fn test_multiple_batches_preserve_order() {
        let dir = TempDir::new().unwrap();
        let wal = temp_wal(&dir);

        wal.write(&[Entry::put("a", b"1".to_vec(), 1)]).unwrap();
        wal.write(&[
            Entry::put("b", b"2".to_vec(), 2),
            Entry::put("a", b"3".to_vec(), 3),
        ])
        .unwrap();

        let replayed = wal.read().unwrap();
        let keys: Vec<_> = replayed.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "a"]);
        assert_eq!(replayed[2].value, b"3");
    }

    #[test]
    fn test_empty_wal_reads_empty() {
        let dir = TempDir::new().unwrap();
        let wal = temp_wal(&dir);
        assert!(wal.read().unwrap().is_empty());
    }

    #[test]
    fn test_truncated_tail_tolerated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal_0.wal");
        let wal = Wal::open(&path).unwrap();

        wal.write(&[
            Entry::put("key1", b"value1".to_vec(), 1),
            Entry::put("key2", b"value2".to_vec(), 2),
        ])
        .unwrap();

        // Chop bytes off the second record to simulate a crash mid-append.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 5).unwrap();

        let replayed = wal.read().unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].key, "key1");
    }

    #[test]
    fn test_garbage_tail_tolerated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal_0.wal");
        let wal = Wal::open(&path).unwrap();

        wal.write(&[Entry::put("key1", b"value1".to_vec(), 1)])
            .unwrap();

        // Append a record with an absurd key length.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.seek(std::io::SeekFrom::End(0)).unwrap();
        file.write_all(&u32::MAX.to_le_bytes()).unwrap();
        file.write_all(b"junk").unwrap();

        let replayed = wal.read().unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].key, "key1");
    }

    #[test]
    fn test_delete_then_operations_fail_closed() {
        let dir = TempDir::new().unwrap();
        let wal = temp_wal(&dir);
        wal.write(&[Entry::put("k", b"v".to_vec(), 1)]).unwrap();

        wal.delete().expect("delete failed");
        assert!(!wal.path().exists());

        assert_eq!(wal.write(&[Entry::put("k", b"v".to_vec(), 2)]), Err(Error::Closed));
        assert_eq!(wal.read().unwrap_err(), Error::Closed);
        assert_eq!(wal.delete().unwrap_err(), Error::Closed);
    }

    #[test]
    fn test_max_key_length_roundtrip() {
        let dir = TempDir::new().unwrap();
        let wal = temp_wal(&dir);

        // Key length right at the u16 encoding bound.
        let key = "k".repeat(MAX_KEY_LEN);
        wal.write(&[Entry::put(key.clone(), b"v".to_vec(), 1)])
            .unwrap();

        let replayed = wal.read().unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].key, key);
    }

    #[test]
    fn test_wal_id_parsing() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(dir.path().join("wal_17.wal")).unwrap();
        assert_eq!(wal.id().unwrap(), 17);

        assert_eq!(parse_wal_id(Path::new("/tmp/wal_00042.wal")), Some(42));
        assert_eq!(parse_wal_id(Path::new("/tmp/other.wal")), None);
    }

    #[test]
    fn test_concurrent_appends_all_recovered() {
        use std::sync::Arc;
        use std::thread;

        let dir = TempDir::new().unwrap();
        let wal = Arc::new(temp_wal(&dir));

        let mut handles = Vec::new();
        for t in 0..4 {
            let wal = Arc::clone(&wal);
            handles.push(thread::spawn(move || {
                for i in 0..25 {
                    wal.write(&[Entry::put(format!("t{t}_k{i}"), b"v".to_vec(), 1)])
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(wal.read().unwrap().len(), 100);
    }
}
