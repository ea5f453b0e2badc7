#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use basalt::heap::HeapFile;
use basalt::tuple::{Field, FieldType, Tuple, TupleDesc};
use basalt::{Database, StoreConfig, TransactionId};
use tempfile::TempDir;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Tiny pages keep multi-page fixtures cheap: a 64-byte page holds 15
/// four-byte int tuples behind a 2-byte bitmap.
pub const SMALL_PAGE: usize = 64;
pub const SMALL_PAGE_SLOTS: usize = 15;

pub fn small_config() -> StoreConfig {
    StoreConfig::default().with_page_size(SMALL_PAGE)
}

pub fn int_desc() -> Arc<TupleDesc> {
    Arc::new(TupleDesc::new(vec![FieldType::Int]))
}

pub fn int_tuple(desc: &Arc<TupleDesc>, v: i32) -> Tuple {
    Tuple::new(desc.clone(), vec![Field::Int(v)]).unwrap()
}

pub fn int_value(t: &Tuple) -> i32 {
    match t.field(0).unwrap() {
        Field::Int(v) => *v,
        other => panic!("expected int field, got {other:?}"),
    }
}

pub fn table_path(dir: &TempDir) -> PathBuf {
    dir.path().join("table.dat")
}

pub fn open_db(dir: &TempDir, config: StoreConfig) -> Database {
    Database::open(config, dir.path()).unwrap()
}

/// Opens the database and registers the standard one-int-column table.
pub fn open_db_with_table(dir: &TempDir, config: StoreConfig) -> (Database, Arc<HeapFile>) {
    let db = open_db(dir, config);
    let table = db.add_table(table_path(dir), int_desc()).unwrap();
    (db, table)
}

/// Inserts `values` one tuple each under `tid` (no commit).
pub fn insert_values(db: &Database, table: &Arc<HeapFile>, tid: TransactionId, values: &[i32]) {
    for &v in values {
        let mut t = int_tuple(table.desc(), v);
        db.pool().insert_tuple(tid, table.table_id(), &mut t).unwrap();
    }
}

/// Every value in the table, in page-then-slot order, read under `tid`.
pub fn scan_values(db: &Database, table: &Arc<HeapFile>, tid: TransactionId) -> Vec<i32> {
    let mut scan = table.scan(db.pool(), tid);
    let mut out = Vec::new();
    while let Some(t) = scan.next().unwrap() {
        out.push(int_value(&t));
    }
    out
}
