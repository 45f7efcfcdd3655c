//! K-way merge across sorted entry streams.
//!
//! Inputs are sorted streams presented oldest first; the output is a sorted
//! stream with one entry per key, where the entry from the newest stream
//! survives. Key ties across streams are broken by stream index, so
//! timestamp ties (possible with a millisecond clock) still resolve to the
//! newer source. Tombstones are forwarded unless the merge is producing the
//! bottommost populated level, in which case they are elided.
//!
//! A min-heap over `(key, stream)` keeps the merge at `O(N log S)` for `N`
//! total entries across `S` streams.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::entry::Entry;
use crate::error::Result;

/// A sorted stream of entries feeding the merge.
pub type EntryStream<'a> = Box<dyn Iterator<Item = Result<Entry>> + Send + 'a>;

struct HeapItem {
    entry: Entry,
    source: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.entry.key == other.entry.key && self.source == other.source
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for min-heap behavior: smallest key pops first, and for
        // equal keys the oldest stream pops first so newer sources can
        // overwrite the accumulator.
        match other.entry.key.as_bytes().cmp(self.entry.key.as_bytes()) {
            Ordering::Equal => other.source.cmp(&self.source),
            ord => ord,
        }
    }
}

/// Merges sorted streams, de-duplicating by key in favor of the newest
/// stream and optionally dropping tombstones.
pub struct MergeIterator<'a> {
    sources: Vec<EntryStream<'a>>,
    heap: BinaryHeap<HeapItem>,
    pending: Option<HeapItem>,
    drop_tombstones: bool,
    done: bool,
}

impl<'a> MergeIterator<'a> {
    /// `sources` must be ordered oldest to newest. With `drop_tombstones`
    /// set, delete markers are removed from the output; this is only
    /// correct when no older source for any merged key can exist below the
    /// produced output.
    pub fn new(mut sources: Vec<EntryStream<'a>>, drop_tombstones: bool) -> Result<Self> {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (source, stream) in sources.iter_mut().enumerate() {
            if let Some(first) = stream.next() {
                heap.push(HeapItem {
                    entry: first?,
                    source,
                });
            }
        }
        Ok(Self {
            sources,
            heap,
            pending: None,
            drop_tombstones,
            done: false,
        })
    }

    /// Pulls the next item from a stream back into the heap.
    fn refill(&mut self, source: usize) -> Result<()> {
        if let Some(next) = self.sources[source].next() {
            self.heap.push(HeapItem {
                entry: next?,
                source,
            });
        }
        Ok(())
    }

    fn next_inner(&mut self) -> Result<Option<Entry>> {
        loop {
            let item = match self.heap.pop() {
                Some(item) => item,
                None => {
                    // Flush the accumulator at end of input.
                    let last = self.pending.take();
                    self.done = true;
                    return Ok(match last {
                        Some(item) if self.drop_tombstones && item.entry.tombstone => None,
                        Some(item) => Some(item.entry),
                        None => None,
                    });
                }
            };
            self.refill(item.source)?;

            match self.pending.take() {
                None => self.pending = Some(item),
                Some(acc) if acc.entry.key == item.entry.key => {
                    // Same key: newer stream wins; within a stream the
                    // later occurrence wins.
                    self.pending = Some(if item.source >= acc.source { item } else { acc });
                }
                Some(finished) => {
                    self.pending = Some(item);
                    if self.drop_tombstones && finished.entry.tombstone {
                        continue;
                    }
                    return Ok(Some(finished.entry));
                }
            }
        }
    }
}

impl Iterator for MergeIterator<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_inner() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
