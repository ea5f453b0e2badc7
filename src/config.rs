//! Store configuration.
//!
//! Both values are fixed for the lifetime of the process once a
//! [`Database`](crate::Database) is opened; there is deliberately no way to
//! change the page size after any page has been read.

/// The size of a single page in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default number of pages the buffer pool caches.
pub const DEFAULT_POOL_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    pub page_size: usize,
    pub pool_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

impl StoreConfig {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_pool_capacity(mut self, pool_capacity: usize) -> Self {
        self.pool_capacity = pool_capacity;
        self
    }
}
