//! CinderDB: an embedded, disk-backed, ordered key-value store built as a
//! leveled LSM tree.
//!
//! Writes go to a write-ahead log and an in-memory sorted memtable; full
//! memtables drain to immutable, bloom-filtered, block-compressed SSTables
//! organized into levels, with background compaction keeping level ranges
//! disjoint below L0.
//!
//! ```no_run
//! use cinderdb::Database;
//!
//! # fn main() -> cinderdb::Result<()> {
//! let db = Database::open("./data")?;
//! db.set("greeting", b"hello")?;
//! assert_eq!(db.get("greeting")?, Some(b"hello".to_vec()));
//! db.delete("greeting")?;
//! db.close()?;
//! # Ok(())
//! # }
//! ```

pub mod bloom;
pub mod cache;
pub mod codec;
pub mod config;
pub mod db;
pub mod entry;
pub mod error;
pub mod flock;
pub mod levels;
pub mod memindex;
pub mod memtable;
pub mod merge;
pub mod metrics;
pub mod sstable;
pub mod wal;

pub use cache::CacheStats;
pub use codec::Compression;
pub use config::Config;
pub use db::Database;
pub use error::{Error, Result};
pub use metrics::Metrics;
