//! Crash recovery: analysis, redo, undo.
//!
//! Runs once at startup, before any transaction begins. Analysis walks the
//! log forward from the last completed checkpoint (or the first record)
//! classifying transactions; redo re-applies the after-images of committed
//! updates; undo hands the losers to the log's reverse-scan rollback. Both
//! redo and undo write position-deterministic full page images, so running
//! recovery again over the same state changes nothing.

use std::collections::{HashMap, HashSet};

use crate::catalog::Catalog;
use crate::errors::Result;
use crate::pool::BufferPool;
use crate::wal::{LogRecord, WalManager, WAL_HEADER_SIZE};
use crate::TransactionId;

/// Reconstructs committed state from the log. Returns the highest raw
/// transaction id observed so the caller can advance its id counter past
/// ids used before the crash.
pub fn recover(wal: &WalManager, catalog: &Catalog, pool: &BufferPool) -> Result<u64> {
    // Analysis: seed from the checkpoint, if one completed.
    let ckpt = wal.checkpoint_offset()?;
    let mut live: HashMap<TransactionId, u64> = HashMap::new();
    let analysis_start = if ckpt >= WAL_HEADER_SIZE {
        match wal.read_record(ckpt)? {
            LogRecord::Checkpoint { live: seeded } => {
                live.extend(seeded);
                ckpt
            }
            other => {
                log::warn!(
                    "checkpoint pointer {ckpt} leads to {other:?}; scanning the whole log"
                );
                WAL_HEADER_SIZE
            }
        }
    } else {
        WAL_HEADER_SIZE
    };
    let redo_start = live
        .values()
        .min()
        .copied()
        .unwrap_or(analysis_start)
        .min(analysis_start);

    let (records, valid_end) = wal.records_from(analysis_start)?;
    // Drop any torn tail now so undo's reverse traversal starts from a
    // complete record.
    wal.truncate_to(valid_end)?;

    let mut committed: HashSet<TransactionId> = HashSet::new();
    let mut max_tid = live.keys().map(|t| t.0).max().unwrap_or(0);
    for (offset, record) in &records {
        if let Some(tid) = record.tid() {
            max_tid = max_tid.max(tid.0);
        }
        match record {
            LogRecord::Begin { tid } => {
                live.insert(*tid, *offset);
            }
            LogRecord::Commit { tid } => {
                live.remove(tid);
                committed.insert(*tid);
            }
            LogRecord::Abort { tid } => {
                live.remove(tid);
            }
            _ => {}
        }
    }
    log::info!(
        "recovery analysis: {} committed, {} loser(s), redo from offset {redo_start}",
        committed.len(),
        live.len()
    );

    // Redo: re-apply after-images of transactions that committed after the
    // checkpoint. Commits before it need nothing; the checkpoint flushed
    // every dirty page first.
    let redo_records = if redo_start < analysis_start {
        wal.records_from(redo_start)?.0
    } else {
        records
    };
    let mut redone = 0usize;
    for (_, record) in &redo_records {
        if let LogRecord::Update {
            tid, pid, after, ..
        } = record
        {
            if committed.contains(tid) {
                catalog
                    .table(pid.table_id)?
                    .write_page_bytes(pid.page_no, after)?;
                redone += 1;
            }
        }
    }
    log::info!("recovery redo: {redone} update(s) re-applied");

    // Undo the losers with the log's reverse scan.
    let losers: HashSet<TransactionId> = live.keys().copied().collect();
    if !losers.is_empty() {
        wal.rollback(&losers, pool)?;
    }
    log::info!("recovery undo: {} transaction(s) rolled back", losers.len());

    Ok(max_tid)
}
