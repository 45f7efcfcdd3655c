//! The immutable on-disk sorted table format: prefix-encoded data blocks,
//! a meta block carrying table facts and the bloom filter, an index block,
//! and a magic-terminated footer.

pub mod block;
pub mod index;
pub mod table;

pub use block::{BlockBuilder, DataBlock};
pub use index::{Footer, IndexBlock, IndexEntry, IndexLookup, MetaBlock, FOOTER_LEN, MAGIC};
pub use table::{Table, TableBuilder, TableIterator, TableOptions};
