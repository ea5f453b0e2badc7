//! Heap file: a dense sequence of fixed-size pages backing one table.
//!
//! Page reads and writes seek directly to `page_no * page_size`. Tuple
//! insertion and deletion go through the buffer pool so the calling
//! transaction acquires exclusive page locks along the way.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::errors::{Result, StoreError};
use crate::heap::page::{slot_count, HeapPage};
use crate::pool::{BufferPool, Permission};
use crate::tuple::{Tuple, TupleDesc};
use crate::{PageId, TransactionId};

pub struct HeapFile {
    file: Mutex<File>,
    path: PathBuf,
    table_id: u32,
    desc: Arc<TupleDesc>,
    page_size: usize,
}

impl std::fmt::Debug for HeapFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapFile")
            .field("path", &self.path)
            .field("table_id", &self.table_id)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl HeapFile {
    /// Opens (creating if absent) the backing file. The table id is a
    /// stable hash of the absolute path, so reopening the same file yields
    /// the same id across processes.
    pub fn open<P: AsRef<Path>>(path: P, desc: Arc<TupleDesc>, page_size: usize) -> Result<Self> {
        if slot_count(page_size, desc.byte_size()) == 0 {
            return Err(StoreError::Schema(format!(
                "tuple width {} does not fit a {}-byte page",
                desc.byte_size(),
                page_size
            )));
        }
        let path = std::path::absolute(path.as_ref())?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let table_id = crc32fast::hash(path.as_os_str().as_encoded_bytes());
        log::debug!("opened heap file {path:?} as table {table_id}");
        Ok(Self {
            file: Mutex::new(file),
            path,
            table_id,
            desc,
            page_size,
        })
    }

    pub fn table_id(&self) -> u32 {
        self.table_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn desc(&self) -> &Arc<TupleDesc> {
        &self.desc
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of whole pages currently on disk.
    pub fn num_pages(&self) -> Result<u32> {
        let file = self.file.lock().unwrap();
        Ok((file.metadata()?.len() / self.page_size as u64) as u32)
    }

    fn check_table(&self, pid: PageId) -> Result<()> {
        if pid.table_id != self.table_id {
            return Err(StoreError::InvalidRequest(format!(
                "page {pid} does not belong to table {}",
                self.table_id
            )));
        }
        Ok(())
    }

    /// Reads one page. Only the buffer pool and recovery should call this;
    /// operators go through the pool.
    pub fn read_page(&self, pid: PageId) -> Result<HeapPage> {
        self.check_table(pid)?;
        if pid.page_no >= self.num_pages()? {
            return Err(StoreError::InvalidRequest(format!(
                "page {pid} is beyond the end of the file"
            )));
        }
        let mut data = vec![0u8; self.page_size];
        {
            let mut file = self.file.lock().unwrap();
            file.seek(SeekFrom::Start(pid.page_no as u64 * self.page_size as u64))?;
            file.read_exact(&mut data)?;
        }
        Ok(HeapPage::from_bytes(pid, self.desc.clone(), data))
    }

    /// Writes the page's current byte image at its fixed offset.
    pub fn write_page(&self, page: &HeapPage) -> Result<()> {
        self.check_table(page.id())?;
        self.write_page_bytes(page.id().page_no, page.data())
    }

    /// Raw page write used by log rollback and recovery redo, which carry
    /// page images rather than live pages.
    pub fn write_page_bytes(&self, page_no: u32, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.page_size {
            return Err(StoreError::InvalidRequest(format!(
                "page image is {} bytes, table {} uses {}-byte pages",
                bytes.len(),
                self.table_id,
                self.page_size
            )));
        }
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(page_no as u64 * self.page_size as u64))?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// Appends a fresh all-zero page and returns its id.
    fn append_empty_page(&self) -> Result<PageId> {
        let mut file = self.file.lock().unwrap();
        let page_no = (file.metadata()?.len() / self.page_size as u64) as u32;
        file.seek(SeekFrom::Start(page_no as u64 * self.page_size as u64))?;
        file.write_all(&vec![0u8; self.page_size])?;
        log::debug!("table {}: appended empty page {page_no}", self.table_id);
        Ok(PageId::new(self.table_id, page_no))
    }

    /// Scans pages front to back through the buffer pool (taking exclusive
    /// locks as it goes) for a free slot; appends a fresh page when every
    /// existing one is full. Returns the modified pages.
    pub fn insert_tuple(
        &self,
        pool: &BufferPool,
        tid: TransactionId,
        t: &mut Tuple,
    ) -> Result<Vec<Arc<RwLock<HeapPage>>>> {
        if **t.desc() != *self.desc {
            return Err(StoreError::Schema(
                "tuple descriptor does not match table".to_string(),
            ));
        }
        let mut page_no = 0u32;
        loop {
            let pid = if page_no >= self.num_pages()? {
                self.append_empty_page()?
            } else {
                PageId::new(self.table_id, page_no)
            };
            let page = pool.get_page(tid, pid, Permission::ReadWrite)?;
            {
                let mut guard = page.write().unwrap();
                if guard.free_slot_count() > 0 {
                    guard.insert_tuple(t)?;
                    return Ok(vec![page.clone()]);
                }
            }
            page_no += 1;
        }
    }

    /// Fetches the tuple's page exclusively and clears its slot. Returns
    /// the modified page.
    pub fn delete_tuple(
        &self,
        pool: &BufferPool,
        tid: TransactionId,
        t: &mut Tuple,
    ) -> Result<Vec<Arc<RwLock<HeapPage>>>> {
        let rid = t.record_id().ok_or_else(|| {
            StoreError::InvalidRequest("tuple has no record id".to_string())
        })?;
        self.check_table(rid.page_id)?;
        let page = pool.get_page(tid, rid.page_id, Permission::ReadWrite)?;
        page.write().unwrap().delete_tuple(t)?;
        Ok(vec![page])
    }

    /// Opens a cursor over every tuple in the file, reading pages through
    /// the buffer pool with read-only permission under `tid`.
    pub fn scan<'a>(&'a self, pool: &'a BufferPool, tid: TransactionId) -> TableScan<'a> {
        TableScan {
            file: self,
            pool,
            tid,
            next_page: 0,
            buffered: VecDeque::new(),
            open: true,
        }
    }
}

/// Cursor over a heap file's tuples in page order, then slot order.
pub struct TableScan<'a> {
    file: &'a HeapFile,
    pool: &'a BufferPool,
    tid: TransactionId,
    next_page: u32,
    buffered: VecDeque<Tuple>,
    open: bool,
}

impl TableScan<'_> {
    fn check_open(&self) -> Result<()> {
        if !self.open {
            return Err(StoreError::InvalidRequest(
                "cursor has been closed".to_string(),
            ));
        }
        Ok(())
    }

    /// The next tuple, or `None` at end of file.
    pub fn next(&mut self) -> Result<Option<Tuple>> {
        self.check_open()?;
        loop {
            if let Some(t) = self.buffered.pop_front() {
                return Ok(Some(t));
            }
            if self.next_page >= self.file.num_pages()? {
                return Ok(None);
            }
            let pid = PageId::new(self.file.table_id, self.next_page);
            self.next_page += 1;
            let page = self.pool.get_page(self.tid, pid, Permission::ReadOnly)?;
            let guard = page.read().unwrap();
            for slot in guard.used_slots() {
                self.buffered.push_back(guard.tuple_at(slot)?);
            }
        }
    }

    /// Restarts the scan from page zero.
    pub fn rewind(&mut self) -> Result<()> {
        self.check_open()?;
        self.next_page = 0;
        self.buffered.clear();
        Ok(())
    }

    pub fn close(&mut self) {
        self.open = false;
        self.buffered.clear();
    }
}
