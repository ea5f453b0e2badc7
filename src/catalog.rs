//! Table registry consulted by the buffer pool and recovery.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::errors::{Result, StoreError};
use crate::heap::HeapFile;

#[derive(Default)]
pub struct Catalog {
    tables: RwLock<HashMap<u32, Arc<HeapFile>>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a table and returns its id. Re-adding a table with the
    /// same backing file replaces the previous handle.
    pub fn add_table(&self, file: Arc<HeapFile>) -> u32 {
        let id = file.table_id();
        self.tables.write().unwrap().insert(id, file);
        id
    }

    pub fn table(&self, table_id: u32) -> Result<Arc<HeapFile>> {
        self.tables
            .read()
            .unwrap()
            .get(&table_id)
            .cloned()
            .ok_or_else(|| {
                StoreError::InvalidRequest(format!("no table with id {table_id}"))
            })
    }

    pub fn table_ids(&self) -> Vec<u32> {
        self.tables.read().unwrap().keys().copied().collect()
    }
}
