//! The buffer pool: a bounded page cache that mediates every page access.
//!
//! All four shared structures live here — the page cache, the LRU usage
//! queue, the lock book, and the per-transaction touched sets. The pool
//! enforces strict two-phase locking (locks are taken in `get_page` and
//! released only in `transaction_complete`), drives commit and abort, and
//! implements STEAL/NO-FORCE: dirty uncommitted pages may be flushed (after
//! their update record is forced, per the WAL rule) and committed pages are
//! not flushed at commit.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use crate::catalog::Catalog;
use crate::errors::{Result, StoreError};
use crate::heap::HeapPage;
use crate::lock::PageLock;
use crate::tuple::Tuple;
use crate::wal::WalManager;
use crate::{PageId, TransactionId};

/// Access level requested from [`BufferPool::get_page`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    ReadOnly,
    ReadWrite,
}

struct PageCache {
    pages: HashMap<PageId, Arc<RwLock<HeapPage>>>,
    /// Eviction order; front is the next victim.
    lru: VecDeque<PageId>,
}

pub struct BufferPool {
    capacity: usize,
    catalog: Arc<Catalog>,
    wal: Arc<WalManager>,
    cache: Mutex<PageCache>,
    lock_book: Mutex<HashMap<PageId, Arc<PageLock>>>,
    touched: Mutex<HashMap<TransactionId, HashSet<PageId>>>,
}

impl BufferPool {
    pub fn new(capacity: usize, catalog: Arc<Catalog>, wal: Arc<WalManager>) -> Self {
        Self {
            capacity,
            catalog,
            wal,
            cache: Mutex::new(PageCache {
                pages: HashMap::with_capacity(capacity),
                lru: VecDeque::with_capacity(capacity),
            }),
            lock_book: Mutex::new(HashMap::new()),
            touched: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of pages currently cached.
    pub fn cached_pages(&self) -> usize {
        self.cache.lock().unwrap().pages.len()
    }

    /// True if a page is currently in the cache (tests and diagnostics).
    pub fn is_cached(&self, pid: PageId) -> bool {
        self.cache.lock().unwrap().pages.contains_key(&pid)
    }

    /// Number of page locks currently in the lock book.
    pub fn lock_entry_count(&self) -> usize {
        self.lock_book.lock().unwrap().len()
    }

    pub fn has_lock_entry(&self, pid: PageId) -> bool {
        self.lock_book.lock().unwrap().contains_key(&pid)
    }

    /// Fetches a page under `tid` with the requested permission, taking the
    /// page lock first (exclusive for read-write, shared for read-only).
    /// Blocks if the lock is held incompatibly; a timed-out wait surfaces
    /// as `TxnAborted` with no lock state changed.
    pub fn get_page(
        &self,
        tid: TransactionId,
        pid: PageId,
        perm: Permission,
    ) -> Result<Arc<RwLock<HeapPage>>> {
        self.touched.lock().unwrap().entry(tid).or_default();

        loop {
            let lock = {
                let mut book = self.lock_book.lock().unwrap();
                book.entry(pid)
                    .or_insert_with(|| Arc::new(PageLock::new()))
                    .clone()
            };
            match perm {
                Permission::ReadWrite => lock.acquire_exclusive(tid)?,
                Permission::ReadOnly => {
                    // A transaction that already holds the lock in any mode
                    // may read without reacquiring; a shared acquire by the
                    // exclusive holder itself would block forever.
                    if !lock.is_held_by(tid) {
                        lock.acquire_shared(tid)?;
                    }
                }
            }
            // The book entry may have been collected between the clone and
            // the acquire. Holding a lock the book no longer maps would let
            // a second lock exist for the same page.
            let mut book = self.lock_book.lock().unwrap();
            match book.get(&pid) {
                Some(current) if Arc::ptr_eq(current, &lock) => break,
                Some(_) => lock.release(tid),
                None => {
                    book.insert(pid, lock);
                    break;
                }
            }
        }
        self.touched
            .lock()
            .unwrap()
            .entry(tid)
            .or_default()
            .insert(pid);

        let mut cache = self.cache.lock().unwrap();
        if let Some(page) = cache.pages.get(&pid) {
            return Ok(page.clone());
        }

        log::debug!("cache miss on page {pid}, reading from disk");
        let page = self.catalog.table(pid.table_id)?.read_page(pid)?;
        let page = Arc::new(RwLock::new(page));
        cache.pages.insert(pid, page.clone());
        if cache.pages.len() > self.capacity {
            self.evict(&mut cache)?;
        }
        cache.lru.push_back(pid);
        Ok(page)
    }

    /// True if `tid` holds the lock on `pid` in any mode.
    pub fn holds_lock(&self, tid: TransactionId, pid: PageId) -> bool {
        self.lock_book
            .lock()
            .unwrap()
            .get(&pid)
            .is_some_and(|l| l.is_held_by(tid))
    }

    /// Releases `tid`'s lock on one page before transaction completion.
    /// Risky: it breaks two-phase locking, so only callers that understand
    /// the consequences (e.g. scan operators that never re-read) should
    /// use it. Does nothing if the page is not locked.
    pub fn release_page(&self, tid: TransactionId, pid: PageId) {
        if let Some(lock) = self.lock_book.lock().unwrap().get(&pid) {
            lock.release(tid);
        }
    }

    /// Adds a tuple to the table under `tid`, taking write locks on every
    /// page the heap file touches along the way.
    pub fn insert_tuple(&self, tid: TransactionId, table_id: u32, t: &mut Tuple) -> Result<()> {
        let table = self.catalog.table(table_id)?;
        let modified = table.insert_tuple(self, tid, t)?;
        self.absorb_modified(tid, modified)
    }

    /// Removes the tuple from its page under `tid`.
    pub fn delete_tuple(&self, tid: TransactionId, t: &mut Tuple) -> Result<()> {
        let rid = t.record_id().ok_or_else(|| {
            StoreError::InvalidRequest("tuple has no record id".to_string())
        })?;
        let table = self.catalog.table(rid.page_id.table_id)?;
        let modified = table.delete_tuple(self, tid, t)?;
        self.absorb_modified(tid, modified)
    }

    /// Marks modified pages dirty by `tid`, re-homes them in the cache
    /// (replacing any stale copy) and refreshes their LRU position.
    fn absorb_modified(
        &self,
        tid: TransactionId,
        pages: Vec<Arc<RwLock<HeapPage>>>,
    ) -> Result<()> {
        for page in pages {
            let pid = {
                let mut guard = page.write().unwrap();
                guard.mark_dirty(tid);
                guard.id()
            };
            let mut cache = self.cache.lock().unwrap();
            cache.pages.insert(pid, page.clone());
            cache.lru.retain(|p| *p != pid);
            cache.lru.push_back(pid);
        }
        Ok(())
    }

    /// Commits or aborts `tid` and releases all of its locks. On commit,
    /// an update record for every touched page still in the cache is
    /// forced to the log before the commit record (NO-FORCE: the pages
    /// themselves stay unwritten). On abort, the log rolls the
    /// transaction's flushed updates back and the pool restores its
    /// still-cached dirty pages from their before-images. Calling this
    /// twice for the same transaction is a no-op the second time.
    pub fn transaction_complete(&self, tid: TransactionId, commit: bool) -> Result<()> {
        let Some(pids) = self.touched.lock().unwrap().remove(&tid) else {
            return Ok(());
        };

        if commit {
            for pid in &pids {
                let page = self.cache.lock().unwrap().pages.get(pid).cloned();
                if let Some(page) = page {
                    let mut guard = page.write().unwrap();
                    self.wal
                        .log_write(tid, *pid, guard.before_image(), guard.data())?;
                    self.wal.force()?;
                    guard.set_before_image();
                }
            }
            self.wal.log_commit(tid)?;
        } else {
            self.wal.log_abort(tid, self)?;
            // Rollback restores and discards pages whose update record
            // reached the log (i.e. pages that were flushed). A page
            // dirtied in memory and never flushed has no record; its
            // committed bytes live only in its before-image, so restore it
            // in place. The dirtier stamp stays: the restored bytes may
            // not be on disk yet, and the flush path writes out pages
            // whose dirtier is no longer live.
            for pid in &pids {
                let page = self.cache.lock().unwrap().pages.get(pid).cloned();
                if let Some(page) = page {
                    let mut guard = page.write().unwrap();
                    if guard.dirtier() == Some(tid) {
                        guard.restore_before_image();
                    }
                }
            }
        }

        let mut book = self.lock_book.lock().unwrap();
        for pid in &pids {
            if let Some(lock) = book.get(pid) {
                lock.release(tid);
                if lock.is_removable() {
                    book.remove(pid);
                }
            }
        }
        Ok(())
    }

    /// Flushes every page `tid` has touched.
    pub fn flush_pages(&self, tid: TransactionId) -> Result<()> {
        let pids: Vec<PageId> = self
            .touched
            .lock()
            .unwrap()
            .get(&tid)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for pid in pids {
            self.flush_page(pid)?;
        }
        Ok(())
    }

    /// Flushes every cached page. Dirty uncommitted pages are written too
    /// (STEAL), each preceded by its forced update record.
    pub fn flush_all_pages(&self) -> Result<()> {
        let mut cache = self.cache.lock().unwrap();
        let pids: Vec<PageId> = cache.pages.keys().copied().collect();
        for pid in pids {
            self.flush_page_locked(&mut cache, pid)?;
        }
        Ok(())
    }

    fn flush_page(&self, pid: PageId) -> Result<()> {
        let mut cache = self.cache.lock().unwrap();
        self.flush_page_locked(&mut cache, pid)
    }

    /// Writes one page to disk if dirty. If the dirtying transaction is
    /// still live the update record is forced first so the write can be
    /// undone; if it is not live it must have committed (aborts discard
    /// their pages), so its records are already on stable storage.
    fn flush_page_locked(&self, cache: &mut PageCache, pid: PageId) -> Result<()> {
        let Some(page) = cache.pages.get(&pid).cloned() else {
            return Ok(());
        };
        let mut guard = page.write().unwrap();
        let Some(dirtier) = guard.dirtier() else {
            return Ok(());
        };

        let dirtier_live = self.touched.lock().unwrap().contains_key(&dirtier);
        if dirtier_live {
            self.wal
                .log_write(dirtier, pid, guard.before_image(), guard.data())?;
            self.wal.force()?;
        }
        self.catalog.table(pid.table_id)?.write_page(&guard)?;
        guard.mark_clean();
        log::debug!("flushed page {pid} (dirtier {dirtier}, live: {dirtier_live})");
        Ok(())
    }

    /// Drops a page from the cache and the usage queue without touching
    /// the lock book. Log rollback uses this to force a re-read from disk;
    /// locks survive so the aborting transaction stays serialized until
    /// completion.
    pub fn discard_page(&self, pid: PageId) {
        let mut cache = self.cache.lock().unwrap();
        cache.pages.remove(&pid);
        cache.lru.retain(|p| *p != pid);
    }

    /// Evicts the least recently used page: flush (respecting the WAL
    /// rule), then discard.
    fn evict(&self, cache: &mut PageCache) -> Result<()> {
        let victim = *cache.lru.front().ok_or_else(|| {
            StoreError::InvalidRequest(
                "eviction requested but the usage queue is empty".to_string(),
            )
        })?;
        log::debug!("evicting page {victim}");
        self.flush_page_locked(cache, victim)?;
        cache.pages.remove(&victim);
        cache.lru.retain(|p| *p != victim);
        Ok(())
    }
}
