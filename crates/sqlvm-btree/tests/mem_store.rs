use proptest::prelude::*;
use sqlvm_btree::{Btree, MemStore, MetaSlot, SavepointOp, TreeKind, TxnState};
use sqlvm_error::SqlvmError;
use sqlvm_types::record::encode_values;
use sqlvm_types::{KeyInfo, SortOrder, SqlValue};

fn table_with_rows(store: &MemStore, rows: &[i64]) -> u32 {
    let mut bt = store.connect();
    bt.begin_trans(true).unwrap();
    let root = bt.create_table(TreeKind::Table).unwrap();
    let mut cur = bt.open_cursor(root, true, None).unwrap();
    for &r in rows {
        cur.insert_row(r, &encode_values(&[SqlValue::Integer(r)])).unwrap();
    }
    drop(cur);
    bt.commit().unwrap();
    root
}

// ── Locking ──

#[test]
fn test_two_writers_one_busy() {
    let store = MemStore::new();
    let mut a = store.connect();
    let mut b = store.connect();
    a.begin_trans(true).unwrap();
    assert!(matches!(b.begin_trans(true), Err(SqlvmError::Busy)));
    assert_eq!(b.txn_state(), TxnState::None);

    // Readers are never blocked by the writer.
    b.begin_trans(false).unwrap();
    assert_eq!(b.txn_state(), TxnState::Read);
    b.rollback().unwrap();

    a.commit().unwrap();
    b.begin_trans(true).unwrap();
    assert_eq!(b.txn_state(), TxnState::Write);
}

#[test]
fn test_dropping_writer_releases_lock() {
    let store = MemStore::new();
    {
        let mut a = store.connect();
        a.begin_trans(true).unwrap();
    }
    let mut b = store.connect();
    b.begin_trans(true).unwrap();
}

#[test]
fn test_reader_keeps_snapshot() {
    let store = MemStore::new();
    let root = table_with_rows(&store, &[1, 2]);

    let mut reader = store.connect();
    reader.begin_trans(false).unwrap();

    let mut writer = store.connect();
    writer.begin_trans(true).unwrap();
    let mut cur = writer.open_cursor(root, true, None).unwrap();
    cur.insert_row(3, &[]).unwrap();
    drop(cur);
    writer.commit().unwrap();

    let mut cur = reader.open_cursor(root, false, None).unwrap();
    assert_eq!(cur.count().unwrap(), 2);
    drop(cur);
    // The snapshot is stale, so upgrading must fail.
    assert!(matches!(reader.begin_trans(true), Err(SqlvmError::Busy)));
    reader.rollback().unwrap();

    reader.begin_trans(false).unwrap();
    let mut cur = reader.open_cursor(root, false, None).unwrap();
    assert_eq!(cur.count().unwrap(), 3);
}

#[test]
fn test_rollback_discards_changes() {
    let store = MemStore::new();
    let root = table_with_rows(&store, &[1]);
    let mut bt = store.connect();
    bt.begin_trans(true).unwrap();
    assert_eq!(bt.clear_table(root).unwrap(), 1);
    bt.rollback().unwrap();

    bt.begin_trans(false).unwrap();
    let mut cur = bt.open_cursor(root, false, None).unwrap();
    assert_eq!(cur.count().unwrap(), 1);
}

#[test]
fn test_nested_statement_savepoints() {
    let store = MemStore::new();
    let root = table_with_rows(&store, &[]);
    let mut bt = store.connect();
    bt.begin_trans(true).unwrap();
    let mut cur = bt.open_cursor(root, true, None).unwrap();
    bt.begin_stmt(1).unwrap();
    cur.insert_row(1, &[]).unwrap();
    bt.begin_stmt(2).unwrap();
    cur.insert_row(2, &[]).unwrap();
    bt.savepoint(SavepointOp::Rollback, 2).unwrap();
    assert_eq!(cur.count().unwrap(), 1);
    bt.savepoint(SavepointOp::Release, 1).unwrap();
    // Nothing left to roll back to.
    bt.savepoint(SavepointOp::Rollback, 1).unwrap();
    assert_eq!(cur.count().unwrap(), 1);
}

#[test]
fn test_schema_cookie_visible_to_other_handles() {
    let store = MemStore::new();
    let mut a = store.connect();
    a.begin_trans(true).unwrap();
    a.update_meta(MetaSlot::SchemaVersion, 4).unwrap();
    let b = store.connect();
    assert_eq!(b.get_meta(MetaSlot::SchemaVersion).unwrap(), 0);
    a.commit().unwrap();
    assert_eq!(b.get_meta(MetaSlot::SchemaVersion).unwrap(), 4);
}

#[test]
fn test_drop_table_then_open_fails() {
    let store = MemStore::new();
    let root = table_with_rows(&store, &[1]);
    let mut bt = store.connect();
    bt.begin_trans(true).unwrap();
    bt.drop_table(root).unwrap();
    assert!(matches!(
        bt.open_cursor(root, false, None),
        Err(SqlvmError::Corrupt { .. })
    ));
}

#[test]
fn test_desc_index_order() {
    let store = MemStore::new();
    let mut bt = store.connect();
    bt.begin_trans(true).unwrap();
    let root = bt.create_table(TreeKind::Index).unwrap();
    let info = std::sync::Arc::new(KeyInfo::from_orders(&[SortOrder::Desc, SortOrder::Asc]));
    let mut cur = bt.open_cursor(root, true, Some(info)).unwrap();
    for (v, rowid) in [(1, 1), (3, 2), (2, 3)] {
        cur.insert_key(&encode_values(&[SqlValue::Integer(v), SqlValue::Integer(rowid)]))
            .unwrap();
    }
    let mut seen = Vec::new();
    let mut more = cur.first().unwrap();
    while more {
        seen.push(cur.rowid().unwrap());
        more = cur.next().unwrap();
    }
    assert_eq!(seen, vec![2, 3, 1]);
    assert!(cur.table_move_to(1).is_err());
}

proptest! {
    #[test]
    fn prop_table_iterates_in_rowid_order(rows in proptest::collection::btree_set(any::<i64>(), 0..40)) {
        let store = MemStore::new();
        let shuffled: Vec<i64> = rows.iter().rev().copied().collect();
        let root = table_with_rows(&store, &shuffled);
        let mut bt = store.connect();
        bt.begin_trans(false).unwrap();
        let mut cur = bt.open_cursor(root, false, None).unwrap();
        let mut seen = Vec::new();
        let mut more = cur.first().unwrap();
        while more {
            seen.push(cur.rowid().unwrap());
            more = cur.next().unwrap();
        }
        prop_assert_eq!(seen, rows.into_iter().collect::<Vec<_>>());
    }
}
