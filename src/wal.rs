//! The write-ahead undo/redo log.
//!
//! A single append-only file. The first 8 bytes point at the most recent
//! completed checkpoint record (0 = none). Every record is
//! `[type | tid if applicable | body | 8-byte start offset]`, all fields
//! little-endian. The trailing start offset makes reverse traversal O(1)
//! per record: read the 8 bytes before the current position, seek there,
//! repeat. Update records carry full before/after page images, which is
//! what makes both redo and undo idempotent.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::catalog::Catalog;
use crate::errors::{Result, StoreError};
use crate::pool::BufferPool;
use crate::{PageId, TransactionId};

/// Byte offset of the first record; the header pointer lives before it.
pub const WAL_HEADER_SIZE: u64 = 8;

const TYPE_BEGIN: u8 = 1;
const TYPE_COMMIT: u8 = 2;
const TYPE_ABORT: u8 = 3;
const TYPE_UPDATE: u8 = 4;
const TYPE_CHECKPOINT_BEGIN: u8 = 5;
const TYPE_CHECKPOINT: u8 = 6;

#[derive(Debug, Clone)]
pub enum LogRecord {
    Begin {
        tid: TransactionId,
    },
    Commit {
        tid: TransactionId,
    },
    Abort {
        tid: TransactionId,
    },
    Update {
        tid: TransactionId,
        pid: PageId,
        before: Vec<u8>,
        after: Vec<u8>,
    },
    /// Marks the start of a checkpoint so a forward scan can tell a
    /// completed checkpoint from one interrupted mid-write.
    CheckpointBegin,
    /// Live transactions at checkpoint time, each with the offset of its
    /// first record.
    Checkpoint {
        live: Vec<(TransactionId, u64)>,
    },
}

impl LogRecord {
    pub fn tid(&self) -> Option<TransactionId> {
        match self {
            LogRecord::Begin { tid }
            | LogRecord::Commit { tid }
            | LogRecord::Abort { tid }
            | LogRecord::Update { tid, .. } => Some(*tid),
            LogRecord::CheckpointBegin | LogRecord::Checkpoint { .. } => None,
        }
    }
}

struct WalInner {
    file: File,
    /// Append position: one past the last complete record.
    offset: u64,
    /// Live transactions and the offset of each one's BEGIN record.
    first_record: HashMap<TransactionId, u64>,
}

pub struct WalManager {
    catalog: Arc<Catalog>,
    page_size: usize,
    inner: Mutex<WalInner>,
}

fn corrupt(msg: String) -> StoreError {
    StoreError::Storage(io::Error::new(io::ErrorKind::InvalidData, msg))
}

fn read_u64_at(file: &mut File, offset: u64) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

impl WalManager {
    pub fn open<P: AsRef<Path>>(
        path: P,
        catalog: Arc<Catalog>,
        page_size: usize,
    ) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        if len < WAL_HEADER_SIZE {
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&0u64.to_le_bytes())?;
            file.sync_all()?;
        }
        let offset = len.max(WAL_HEADER_SIZE);
        log::debug!("opened log {:?}, append position {offset}", path.as_ref());
        Ok(Self {
            catalog,
            page_size,
            inner: Mutex::new(WalInner {
                file,
                offset,
                first_record: HashMap::new(),
            }),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// One past the last complete record.
    pub fn end_offset(&self) -> u64 {
        self.inner.lock().unwrap().offset
    }

    fn append(inner: &mut WalInner, body: &[u8]) -> Result<u64> {
        let start = inner.offset;
        inner.file.seek(SeekFrom::Start(start))?;
        inner.file.write_all(body)?;
        inner.file.write_all(&start.to_le_bytes())?;
        inner.offset = start + body.len() as u64 + 8;
        Ok(start)
    }

    fn append_marker(inner: &mut WalInner, ty: u8, tid: TransactionId) -> Result<u64> {
        let mut body = Vec::with_capacity(9);
        body.push(ty);
        body.extend_from_slice(&tid.0.to_le_bytes());
        Self::append(inner, &body)
    }

    /// Appends an UPDATE record (and the transaction's BEGIN, if this is
    /// its first record). Does not force; callers force before any dirty
    /// page write and at commit.
    pub fn log_write(
        &self,
        tid: TransactionId,
        pid: PageId,
        before: &[u8],
        after: &[u8],
    ) -> Result<()> {
        if before.len() != self.page_size || after.len() != self.page_size {
            return Err(StoreError::InvalidRequest(format!(
                "update images for page {pid} are not {} bytes",
                self.page_size
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        if !inner.first_record.contains_key(&tid) {
            let begin = Self::append_marker(&mut inner, TYPE_BEGIN, tid)?;
            inner.first_record.insert(tid, begin);
        }
        let mut body = Vec::with_capacity(17 + 2 * self.page_size);
        body.push(TYPE_UPDATE);
        body.extend_from_slice(&tid.0.to_le_bytes());
        body.extend_from_slice(&pid.table_id.to_le_bytes());
        body.extend_from_slice(&pid.page_no.to_le_bytes());
        body.extend_from_slice(before);
        body.extend_from_slice(after);
        Self::append(&mut inner, &body)?;
        log::debug!("logged update by {tid} to page {pid}");
        Ok(())
    }

    /// Appends a COMMIT marker and forces it to stable storage.
    pub fn log_commit(&self, tid: TransactionId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::append_marker(&mut inner, TYPE_COMMIT, tid)?;
        inner.file.sync_all()?;
        inner.first_record.remove(&tid);
        log::debug!("committed {tid}");
        Ok(())
    }

    /// Rolls the transaction's updates back, then appends an ABORT marker
    /// and forces.
    pub fn log_abort(&self, tid: TransactionId, pool: &BufferPool) -> Result<()> {
        let set = HashSet::from([tid]);
        self.rollback(&set, pool)?;
        let mut inner = self.inner.lock().unwrap();
        Self::append_marker(&mut inner, TYPE_ABORT, tid)?;
        inner.file.sync_all()?;
        inner.first_record.remove(&tid);
        log::debug!("aborted {tid}");
        Ok(())
    }

    /// Flushes buffered bytes and fsyncs.
    pub fn force(&self) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        inner.file.sync_all()?;
        Ok(())
    }

    /// Undoes every update by the given transactions: a single reverse
    /// scan from the end of the log, writing each matching record's
    /// before-image straight into the page store and discarding the page
    /// from the buffer pool so the next fetch re-reads disk. Replaying the
    /// same range reproduces the same on-disk state.
    pub fn rollback(&self, tids: &HashSet<TransactionId>, pool: &BufferPool) -> Result<()> {
        let undo = {
            let mut inner = self.inner.lock().unwrap();
            Self::collect_before_images(&mut inner, tids, self.page_size)?
        };
        for (pid, before) in undo {
            log::debug!("rollback: restoring page {pid} from before-image");
            self.catalog
                .table(pid.table_id)?
                .write_page_bytes(pid.page_no, &before)?;
            pool.discard_page(pid);
        }
        Ok(())
    }

    /// Walks the log backwards via the trailing start-offset pointers and
    /// gathers (page, before-image) pairs for the given transactions,
    /// newest first. The caller applies them outside the log mutex.
    fn collect_before_images(
        inner: &mut WalInner,
        tids: &HashSet<TransactionId>,
        page_size: usize,
    ) -> Result<Vec<(PageId, Vec<u8>)>> {
        let mut out = Vec::new();
        let mut pos = inner.offset;
        while pos > WAL_HEADER_SIZE {
            let start = read_u64_at(&mut inner.file, pos - 8)?;
            if start < WAL_HEADER_SIZE || start >= pos {
                return Err(corrupt(format!(
                    "log back-pointer at {pos} points to {start}"
                )));
            }
            let (record, end) = Self::read_record_at(&mut inner.file, start, page_size)?;
            debug_assert_eq!(end, pos);
            if let LogRecord::Update {
                tid, pid, before, ..
            } = record
            {
                if tids.contains(&tid) {
                    out.push((pid, before));
                }
            }
            pos = start;
        }
        Ok(out)
    }

    /// Forces the log, flushes the buffer pool so redo never needs to look
    /// before the recorded offsets, then appends CHECKPOINT_BEGIN and the
    /// CHECKPOINT record and swings the header pointer to it.
    pub fn checkpoint(&self, pool: &BufferPool) -> Result<()> {
        self.force()?;
        pool.flush_all_pages()?;

        let mut inner = self.inner.lock().unwrap();
        let live: Vec<(TransactionId, u64)> = inner
            .first_record
            .iter()
            .map(|(tid, off)| (*tid, *off))
            .collect();

        Self::append(&mut inner, &[TYPE_CHECKPOINT_BEGIN])?;
        let mut body = Vec::with_capacity(5 + 16 * live.len());
        body.push(TYPE_CHECKPOINT);
        body.extend_from_slice(&(live.len() as u32).to_le_bytes());
        for (tid, off) in &live {
            body.extend_from_slice(&tid.0.to_le_bytes());
            body.extend_from_slice(&off.to_le_bytes());
        }
        let ckpt = Self::append(&mut inner, &body)?;
        inner.file.sync_all()?;

        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(&ckpt.to_le_bytes())?;
        inner.file.sync_all()?;
        log::info!(
            "checkpoint at offset {ckpt}, {} live transaction(s)",
            live.len()
        );
        Ok(())
    }

    /// Offset of the last completed checkpoint record, 0 if none.
    pub fn checkpoint_offset(&self) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        Ok(read_u64_at(&mut inner.file, 0)?)
    }

    /// Reads the single record starting at `offset`.
    pub fn read_record(&self, offset: u64) -> Result<LogRecord> {
        let mut inner = self.inner.lock().unwrap();
        let (record, _) = Self::read_record_at(&mut inner.file, offset, self.page_size)?;
        Ok(record)
    }

    /// Scans forward from `start`, returning each record with its offset
    /// plus the end of the last complete record. A torn tail (crash
    /// mid-append) ends the scan; it is reported, not an error.
    pub fn records_from(&self, start: u64) -> Result<(Vec<(u64, LogRecord)>, u64)> {
        let mut inner = self.inner.lock().unwrap();
        let limit = inner.offset;
        let mut records = Vec::new();
        let mut pos = start.max(WAL_HEADER_SIZE);
        while pos < limit {
            match Self::read_record_at(&mut inner.file, pos, self.page_size) {
                Ok((record, end)) => {
                    records.push((pos, record));
                    pos = end;
                }
                Err(StoreError::Storage(e))
                    if matches!(
                        e.kind(),
                        io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData
                    ) =>
                {
                    log::warn!("log tail torn at offset {pos}: {e}");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok((records, pos))
    }

    /// Drops a torn tail found by [`records_from`]. Recovery calls this
    /// before undo so reverse traversal starts from a complete record.
    pub fn truncate_to(&self, end: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if end < inner.offset {
            log::warn!("truncating torn log tail from {} to {end}", inner.offset);
            inner.file.set_len(end)?;
            inner.file.sync_all()?;
            inner.offset = end;
        }
        Ok(())
    }

    fn read_record_at(
        file: &mut File,
        start: u64,
        page_size: usize,
    ) -> Result<(LogRecord, u64)> {
        file.seek(SeekFrom::Start(start))?;

        let mut ty = [0u8; 1];
        file.read_exact(&mut ty)?;

        let read_u64 = |file: &mut File| -> io::Result<u64> {
            let mut buf = [0u8; 8];
            file.read_exact(&mut buf)?;
            Ok(u64::from_le_bytes(buf))
        };
        let read_u32 = |file: &mut File| -> io::Result<u32> {
            let mut buf = [0u8; 4];
            file.read_exact(&mut buf)?;
            Ok(u32::from_le_bytes(buf))
        };

        let record = match ty[0] {
            TYPE_BEGIN => LogRecord::Begin {
                tid: TransactionId(read_u64(file)?),
            },
            TYPE_COMMIT => LogRecord::Commit {
                tid: TransactionId(read_u64(file)?),
            },
            TYPE_ABORT => LogRecord::Abort {
                tid: TransactionId(read_u64(file)?),
            },
            TYPE_UPDATE => {
                let tid = TransactionId(read_u64(file)?);
                let table_id = read_u32(file)?;
                let page_no = read_u32(file)?;
                let mut before = vec![0u8; page_size];
                file.read_exact(&mut before)?;
                let mut after = vec![0u8; page_size];
                file.read_exact(&mut after)?;
                LogRecord::Update {
                    tid,
                    pid: PageId::new(table_id, page_no),
                    before,
                    after,
                }
            }
            TYPE_CHECKPOINT_BEGIN => LogRecord::CheckpointBegin,
            TYPE_CHECKPOINT => {
                let count = read_u32(file)?;
                let mut live = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let tid = TransactionId(read_u64(file)?);
                    let off = read_u64(file)?;
                    live.push((tid, off));
                }
                LogRecord::Checkpoint { live }
            }
            other => {
                return Err(corrupt(format!(
                    "unknown log record type {other} at offset {start}"
                )))
            }
        };

        let mut trailer = [0u8; 8];
        file.read_exact(&mut trailer)?;
        if u64::from_le_bytes(trailer) != start {
            return Err(corrupt(format!(
                "log record at {start} has mismatched back-pointer"
            )));
        }
        Ok((record, file.stream_position()?))
    }
}
