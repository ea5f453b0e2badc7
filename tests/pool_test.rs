//! Buffer pool behavior: caching, LRU eviction, the touched-set protocol,
//! and lock-book garbage collection.

use basalt::{PageId, Permission, StoreError};
use tempfile::tempdir;

mod common;
use common::*;

#[test]
fn cache_never_exceeds_capacity() {
    init_logging();
    let dir = tempdir().unwrap();
    let (db, table) = open_db_with_table(&dir, small_config().with_pool_capacity(2));

    // Three pages of committed data.
    let loader = db.begin();
    let values: Vec<i32> = (0..(3 * SMALL_PAGE_SLOTS as i32)).collect();
    insert_values(&db, &table, loader, &values);
    db.transaction_complete(loader, true).unwrap();
    assert_eq!(table.num_pages().unwrap(), 3);

    // Visit every page; the pool must evict to stay within two frames.
    let reader = db.begin();
    for page_no in 0..3 {
        let pid = PageId::new(table.table_id(), page_no);
        db.pool().get_page(reader, pid, Permission::ReadOnly).unwrap();
        assert!(db.pool().cached_pages() <= 2);
    }
    db.transaction_complete(reader, true).unwrap();
}

#[test]
fn eviction_drops_the_least_recently_used_page() {
    init_logging();
    let dir = tempdir().unwrap();
    let (db, table) = open_db_with_table(&dir, small_config().with_pool_capacity(2));

    let loader = db.begin();
    let values: Vec<i32> = (0..(3 * SMALL_PAGE_SLOTS as i32)).collect();
    insert_values(&db, &table, loader, &values);
    db.transaction_complete(loader, true).unwrap();

    // Loading filled the cache in page order and evicted page 0 when page
    // 2 arrived. Re-read 0 and 1, then fetch 2: page 0 is the victim.
    let reader = db.begin();
    let p0 = PageId::new(table.table_id(), 0);
    let p1 = PageId::new(table.table_id(), 1);
    let p2 = PageId::new(table.table_id(), 2);
    db.pool().get_page(reader, p0, Permission::ReadOnly).unwrap();
    db.pool().get_page(reader, p1, Permission::ReadOnly).unwrap();
    db.pool().get_page(reader, p2, Permission::ReadOnly).unwrap();
    assert!(!db.pool().is_cached(p0));
    assert!(db.pool().is_cached(p1));
    assert!(db.pool().is_cached(p2));
    db.transaction_complete(reader, true).unwrap();
}

#[test]
fn completed_transactions_leave_no_lock_behind() {
    init_logging();
    let dir = tempdir().unwrap();
    let (db, table) = open_db_with_table(&dir, small_config());

    let t1 = db.begin();
    insert_values(&db, &table, t1, &[7]);
    let pid = PageId::new(table.table_id(), 0);
    assert!(db.pool().holds_lock(t1, pid));
    assert!(db.pool().has_lock_entry(pid));

    db.transaction_complete(t1, true).unwrap();
    assert!(!db.pool().has_lock_entry(pid));
    assert_eq!(db.pool().lock_entry_count(), 0);
}

#[test]
fn shared_lock_survives_until_the_last_holder_completes() {
    init_logging();
    let dir = tempdir().unwrap();
    let (db, table) = open_db_with_table(&dir, small_config());

    let loader = db.begin();
    insert_values(&db, &table, loader, &[1]);
    db.transaction_complete(loader, true).unwrap();

    let pid = PageId::new(table.table_id(), 0);
    let t1 = db.begin();
    let t2 = db.begin();
    db.pool().get_page(t1, pid, Permission::ReadOnly).unwrap();
    db.pool().get_page(t2, pid, Permission::ReadOnly).unwrap();

    db.transaction_complete(t1, true).unwrap();
    // T2 still holds the lock, so the entry must survive.
    assert!(db.pool().has_lock_entry(pid));
    assert!(db.pool().holds_lock(t2, pid));

    db.transaction_complete(t2, true).unwrap();
    assert!(!db.pool().has_lock_entry(pid));
}

#[test]
fn transaction_complete_is_idempotent() {
    init_logging();
    let dir = tempdir().unwrap();
    let (db, table) = open_db_with_table(&dir, small_config());

    let t1 = db.begin();
    insert_values(&db, &table, t1, &[1, 2, 3]);
    db.transaction_complete(t1, true).unwrap();
    db.transaction_complete(t1, true).unwrap();
    db.transaction_complete(t1, false).unwrap();

    let reader = db.begin();
    assert_eq!(scan_values(&db, &table, reader), vec![1, 2, 3]);
    db.transaction_complete(reader, true).unwrap();
}

#[test]
fn completing_an_unknown_transaction_is_a_no_op() {
    init_logging();
    let dir = tempdir().unwrap();
    let (db, _table) = open_db_with_table(&dir, small_config());
    let tid = db.begin();
    db.transaction_complete(tid, true).unwrap();
    db.transaction_complete(db.begin(), false).unwrap();
}

#[test]
fn insert_and_delete_round_trip_through_the_pool() {
    init_logging();
    let dir = tempdir().unwrap();
    let (db, table) = open_db_with_table(&dir, small_config());

    let t1 = db.begin();
    insert_values(&db, &table, t1, &[10, 20, 30]);
    db.transaction_complete(t1, true).unwrap();

    // Delete the middle tuple.
    let t2 = db.begin();
    let mut victim = {
        let mut scan = table.scan(db.pool(), t2);
        loop {
            let t = scan.next().unwrap().expect("tuple 20 should be present");
            if int_value(&t) == 20 {
                break t;
            }
        }
    };
    db.pool().delete_tuple(t2, &mut victim).unwrap();
    // The record id keeps the page but loses its slot.
    let rid = victim.record_id().unwrap();
    assert_eq!(rid.page_id.table_id, table.table_id());
    assert_eq!(rid.slot, basalt::tuple::SLOT_NONE);
    db.transaction_complete(t2, true).unwrap();

    let t3 = db.begin();
    assert_eq!(scan_values(&db, &table, t3), vec![10, 30]);
    db.transaction_complete(t3, true).unwrap();
}

#[test]
fn deleted_slot_is_reused_by_later_inserts() {
    init_logging();
    let dir = tempdir().unwrap();
    let (db, table) = open_db_with_table(&dir, small_config());

    let t1 = db.begin();
    insert_values(&db, &table, t1, &[1, 2, 3]);
    db.transaction_complete(t1, true).unwrap();

    let t2 = db.begin();
    let mut first = table.scan(db.pool(), t2).next().unwrap().unwrap();
    db.pool().delete_tuple(t2, &mut first).unwrap();
    insert_values(&db, &table, t2, &[9]);
    db.transaction_complete(t2, true).unwrap();

    // The new tuple landed in the freed slot 0.
    let t3 = db.begin();
    assert_eq!(scan_values(&db, &table, t3), vec![9, 2, 3]);
    db.transaction_complete(t3, true).unwrap();
}

#[test]
fn unknown_table_is_an_invalid_request() {
    init_logging();
    let dir = tempdir().unwrap();
    let (db, _table) = open_db_with_table(&dir, small_config());
    let tid = db.begin();
    let err = db
        .pool()
        .get_page(tid, PageId::new(0xdead_beef, 0), Permission::ReadOnly)
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidRequest(_)));
}

#[test]
fn deleting_a_tuple_without_record_id_is_rejected() {
    init_logging();
    let dir = tempdir().unwrap();
    let (db, table) = open_db_with_table(&dir, small_config());
    let tid = db.begin();
    let mut t = int_tuple(table.desc(), 1);
    let err = db.pool().delete_tuple(tid, &mut t).unwrap_err();
    assert!(matches!(err, StoreError::InvalidRequest(_)));
}
