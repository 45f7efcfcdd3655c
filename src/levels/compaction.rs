//! Leveled compaction.
//!
//! L0 -> L1 merges every L0 table (their ranges may overlap) together with
//! the L1 tables overlapping their union range. Li -> Li+1 (i >= 1) takes
//! the oldest table of Li plus the overlapping tables below it. Merge
//! streams are ordered oldest to newest — target-level tables first, then
//! source tables in creation order — so the newest version of each key
//! survives. The output is published by an atomic level-list swap; input
//! files are unlinked only afterwards, and a failed unlink is retried
//! lazily.
//!
//! Tombstones are dropped only when the output lands at the bottommost
//! populated position, with no deeper level that might hold an older value.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Result;
use crate::levels::manager::LevelManager;
use crate::levels::TableHandle;
use crate::merge::{EntryStream, MergeIterator};
use crate::sstable::table::TableBuilder;

/// Compacts `start` into the level below it, then cascades while deeper
/// levels exceed their table-count targets. Whole compactions are
/// serialized; searches and flushes proceed concurrently.
pub(crate) fn run(manager: &LevelManager, start: usize) -> Result<()> {
    let _guard = manager.compaction_lock.lock()?;
    manager.retry_pending_deletes();

    let mut level = start;
    loop {
        // The bottom level has nowhere to compact into.
        if level + 1 >= manager.config.max_levels {
            break;
        }

        let count = manager
            .levels
            .read()?
            .get(level)
            .map(|l| l.len())
            .unwrap_or(0);
        let proceed = if level == start {
            // An explicit request compacts whatever the level holds.
            count > 0
        } else {
            count > manager.config.level_target(level)
        };
        if !proceed {
            break;
        }

        compact_level(manager, level)?;
        level += 1;
    }
    Ok(())
}

/// One merge step from `source` into `source + 1`.
fn compact_level(manager: &LevelManager, source: usize) -> Result<()> {
    let target = source + 1;

    // Snapshot inputs under the read lock; the files are read outside it.
    let (source_tables, target_tables, drop_tombstones) = {
        let levels = manager.levels.read()?;

        let source_tables: Vec<Arc<TableHandle>> = if source == 0 {
            levels[0].snapshot()
        } else {
            levels[source].oldest().into_iter().collect()
        };
        if source_tables.is_empty() {
            return Ok(());
        }

        let min = source_tables
            .iter()
            .map(|t| t.min_key())
            .min()
            .expect("non-empty inputs")
            .to_string();
        let max = source_tables
            .iter()
            .map(|t| t.max_key())
            .max()
            .expect("non-empty inputs")
            .to_string();
        let target_tables = levels[target].overlapping(&min, &max);

        // Safe to drop tombstones only when nothing deeper could hold an
        // older value for any merged key.
        let drop_tombstones = levels[target + 1..].iter().all(|l| l.is_empty());

        (source_tables, target_tables, drop_tombstones)
    };

    tracing::info!(
        source_level = source,
        target_level = target,
        source_tables = source_tables.len(),
        target_tables = target_tables.len(),
        drop_tombstones,
        "starting compaction"
    );

    // Oldest streams first: the target level, then source tables in
    // creation order.
    let mut streams: Vec<EntryStream> = Vec::new();
    for handle in target_tables.iter().chain(source_tables.iter()) {
        streams.push(Box::new(handle.iter()));
    }
    let merge = MergeIterator::new(streams, drop_tombstones)?;

    let expected: u64 = target_tables
        .iter()
        .chain(source_tables.iter())
        .map(|t| t.entry_count())
        .sum();

    let out_path = manager.next_compaction_path(target);
    let mut builder = TableBuilder::new(
        &out_path,
        target as u32,
        expected as usize,
        manager.table_options(),
    )?;

    for result in merge {
        let entry = match result {
            Ok(entry) => entry,
            Err(e) => return abort(&out_path, e),
        };
        if let Err(e) = builder.add(&entry) {
            return abort(&out_path, e);
        }
    }

    // Every key may have resolved to a dropped tombstone; then there is no
    // output table at all.
    let new_handle = if builder.entry_count() > 0 {
        if let Err(e) = builder.finish() {
            return abort(&out_path, e);
        }
        match TableHandle::open(&out_path, manager.compression(), manager.cache()) {
            Ok(handle) => Some(Arc::new(handle)),
            Err(e) => return abort(&out_path, e),
        }
    } else {
        drop(builder);
        let _ = std::fs::remove_file(&out_path);
        None
    };

    let source_paths: Vec<PathBuf> = source_tables
        .iter()
        .map(|t| t.path().to_path_buf())
        .collect();
    let target_paths: Vec<PathBuf> = target_tables
        .iter()
        .map(|t| t.path().to_path_buf())
        .collect();
    let entries_out = new_handle.as_ref().map_or(0, |h| h.entry_count());

    // Atomic swap: remove inputs and publish the output in one critical
    // section, so no search can miss both the inputs and the output.
    {
        let mut levels = manager.levels.write()?;
        levels[source].remove_paths(&source_paths);
        levels[target].remove_paths(&target_paths);
        if let Some(handle) = new_handle {
            levels[target].push(handle);
        }
    }

    // Inputs are garbage now; the swap already happened, so a failed
    // unlink is deferred rather than propagated.
    for path in source_paths.iter().chain(target_paths.iter()) {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "failed to delete compacted SSTable");
                if let Ok(mut pending) = manager.pending_deletes.lock() {
                    pending.push(path.clone());
                }
            }
        }
    }

    tracing::info!(
        source_level = source,
        target_level = target,
        inputs = source_paths.len() + target_paths.len(),
        entries_out,
        "completed compaction"
    );
    Ok(())
}

/// Publication failed: the inputs stay valid, the partial output is
/// removed, and the error propagates.
fn abort(out_path: &std::path::Path, error: crate::error::Error) -> Result<()> {
    let _ = std::fs::remove_file(out_path);
    tracing::warn!(
        path = %out_path.display(),
        error = %error,
        "compaction aborted, inputs retained"
    );
    Err(error)
}
