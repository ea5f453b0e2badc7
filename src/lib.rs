//! # Basalt Storage Engine
//! A transactional page store for an educational relational database.
//! This crate owns the on-disk and in-memory representation of table
//! pages: the heap files, the buffer pool with page-level strict 2PL
//! locking, the write-ahead undo/redo log, and crash recovery.

/// Table registry shared by the pool, the log, and recovery.
pub mod catalog;
/// Process-lifetime store configuration.
pub mod config;
/// Error types.
pub mod errors;
/// Heap files and slotted pages.
pub mod heap;
/// The per-page transaction-keyed lock.
pub mod lock;
/// The buffer pool.
pub mod pool;
/// Startup crash recovery.
pub mod recovery;
/// Fixed-width tuples and descriptors.
pub mod tuple;
/// The write-ahead log.
pub mod wal;

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use catalog::Catalog;
use heap::HeapFile;
use pool::BufferPool;
use tuple::TupleDesc;
use wal::WalManager;

pub use config::{StoreConfig, DEFAULT_PAGE_SIZE, DEFAULT_POOL_CAPACITY};
pub use errors::{Result, StoreError};
pub use pool::Permission;

/// A process-unique, monotonically increasing transaction identity.
/// Locks are keyed by this value, never by thread: one transaction may
/// run on several threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Identifies one page of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId {
    pub table_id: u32,
    pub page_no: u32,
}

impl PageId {
    pub fn new(table_id: u32, page_no: u32) -> Self {
        Self { table_id, page_no }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table_id, self.page_no)
    }
}

/// The engine root: owns the catalog, the log, and the buffer pool, and
/// vends transaction ids.
pub struct Database {
    config: StoreConfig,
    catalog: Arc<Catalog>,
    wal: Arc<WalManager>,
    pool: Arc<BufferPool>,
    next_tid: AtomicU64,
}

impl Database {
    /// Opens the engine over a data directory (created if absent). The log
    /// lives at `<data_dir>/basalt.wal`. Recovery is not run implicitly;
    /// call [`Database::recover`] before beginning transactions when
    /// reopening existing state.
    pub fn open<P: AsRef<Path>>(config: StoreConfig, data_dir: P) -> Result<Self> {
        std::fs::create_dir_all(data_dir.as_ref())?;
        let catalog = Arc::new(Catalog::new());
        let wal = Arc::new(WalManager::open(
            data_dir.as_ref().join("basalt.wal"),
            catalog.clone(),
            config.page_size,
        )?);
        let pool = Arc::new(BufferPool::new(
            config.pool_capacity,
            catalog.clone(),
            wal.clone(),
        ));
        Ok(Self {
            config,
            catalog,
            wal,
            pool,
            next_tid: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> StoreConfig {
        self.config
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn wal(&self) -> &Arc<WalManager> {
        &self.wal
    }

    /// Opens (or creates) a heap file and registers it with the catalog.
    pub fn add_table<P: AsRef<Path>>(
        &self,
        path: P,
        desc: Arc<TupleDesc>,
    ) -> Result<Arc<HeapFile>> {
        let file = Arc::new(HeapFile::open(path, desc, self.config.page_size)?);
        self.catalog.add_table(file.clone());
        Ok(file)
    }

    /// Starts a transaction.
    pub fn begin(&self) -> TransactionId {
        TransactionId(self.next_tid.fetch_add(1, Ordering::SeqCst))
    }

    /// Commits (`commit = true`) or aborts the transaction and releases
    /// all of its locks.
    pub fn transaction_complete(&self, tid: TransactionId, commit: bool) -> Result<()> {
        self.pool.transaction_complete(tid, commit)
    }

    /// Writes a checkpoint bounding future recovery work.
    pub fn checkpoint(&self) -> Result<()> {
        self.wal.checkpoint(&self.pool)
    }

    /// Runs analysis/redo/undo over the log, then advances the
    /// transaction-id counter past every id the log mentions.
    pub fn recover(&self) -> Result<()> {
        let max_tid = recovery::recover(&self.wal, &self.catalog, &self.pool)?;
        let next = max_tid + 1;
        if self.next_tid.load(Ordering::SeqCst) < next {
            self.next_tid.store(next, Ordering::SeqCst);
        }
        Ok(())
    }
}
