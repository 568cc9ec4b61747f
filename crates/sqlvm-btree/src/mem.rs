//! In-memory reference backend.
//!
//! A [`MemStore`] is one database shared by any number of [`MemBtree`]
//! handles (one per connection). Each transaction works on a private copy of
//! the trees: readers see the snapshot taken when they began, the single
//! writer publishes its copy on commit. Statement savepoints are whole-copy
//! snapshots.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use sqlvm_error::{Result, SqlvmError};
use sqlvm_types::record::decode_record;
use sqlvm_types::{KeyInfo, SqlValue, UnpackedRecord};
use tracing::{debug, warn};

use crate::traits::{Btree, BtreeCursor, MetaSlot, SavepointOp, TreeKind, TxnState, SCHEMA_ROOT};

#[derive(Debug, Clone)]
enum Tree {
    Table(BTreeMap<i64, Arc<[u8]>>),
    /// Keys kept sorted under the comparator of the cursor that wrote them.
    Index(Vec<Arc<[u8]>>),
}

#[derive(Debug, Clone)]
struct Tables {
    trees: BTreeMap<u32, Tree>,
    next_root: u32,
    meta: [u32; MetaSlot::COUNT],
}

impl Tables {
    fn new() -> Self {
        let mut trees = BTreeMap::new();
        trees.insert(SCHEMA_ROOT, Tree::Table(BTreeMap::new()));
        Self {
            trees,
            next_root: SCHEMA_ROOT + 1,
            meta: [0; MetaSlot::COUNT],
        }
    }

    fn tree(&self, root: u32) -> Result<&Tree> {
        self.trees
            .get(&root)
            .ok_or_else(|| SqlvmError::corrupt(format!("no tree at root page {root}")))
    }

    fn tree_mut(&mut self, root: u32) -> Result<&mut Tree> {
        self.trees
            .get_mut(&root)
            .ok_or_else(|| SqlvmError::corrupt(format!("no tree at root page {root}")))
    }
}

#[derive(Debug)]
struct StoreState {
    committed: Tables,
    /// Bumped by every commit that published changes.
    version: u64,
    writer: Option<u64>,
}

/// A shared in-memory database.
#[derive(Debug, Clone)]
pub struct MemStore {
    state: Arc<Mutex<StoreState>>,
    next_handle: Arc<AtomicU64>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState {
                committed: Tables::new(),
                version: 0,
                writer: None,
            })),
            next_handle: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Open a new handle on this database.
    pub fn connect(&self) -> MemBtree {
        MemBtree {
            store: self.clone(),
            id: self.next_handle.fetch_add(1, AtomicOrdering::Relaxed),
            state: TxnState::None,
            snapshot_version: 0,
            working: None,
            savepoints: Vec::new(),
        }
    }

    /// Number of commits that have published changes.
    pub fn version(&self) -> u64 {
        self.state.lock().version
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

/// One connection's handle on a [`MemStore`].
#[derive(Debug)]
pub struct MemBtree {
    store: MemStore,
    id: u64,
    state: TxnState,
    snapshot_version: u64,
    working: Option<Arc<RwLock<Tables>>>,
    savepoints: Vec<(u32, Tables)>,
}

impl MemBtree {
    fn working(&self) -> Result<&Arc<RwLock<Tables>>> {
        self.working
            .as_ref()
            .ok_or_else(|| SqlvmError::Misuse("no transaction is open".to_owned()))
    }

    fn require_write(&self) -> Result<&Arc<RwLock<Tables>>> {
        if self.state != TxnState::Write {
            return Err(SqlvmError::Misuse(
                "operation requires a write transaction".to_owned(),
            ));
        }
        self.working()
    }

    fn end_transaction(&mut self) {
        self.state = TxnState::None;
        self.working = None;
        self.savepoints.clear();
    }
}

impl Btree for MemBtree {
    fn begin_trans(&mut self, write: bool) -> Result<()> {
        if self.state == TxnState::Write || (!write && self.state == TxnState::Read) {
            return Ok(());
        }
        let mut store = self.store.state.lock();
        if write {
            if let Some(owner) = store.writer {
                if owner != self.id {
                    warn!(handle = self.id, owner, "write lock held by another handle");
                    return Err(SqlvmError::Busy);
                }
            }
            // A reader whose snapshot is stale cannot upgrade.
            if self.state == TxnState::Read && self.snapshot_version != store.version {
                warn!(handle = self.id, "read snapshot is stale; cannot upgrade");
                return Err(SqlvmError::Busy);
            }
            store.writer = Some(self.id);
        }
        if self.state == TxnState::None {
            self.working = Some(Arc::new(RwLock::new(store.committed.clone())));
            self.snapshot_version = store.version;
        }
        self.state = if write { TxnState::Write } else { TxnState::Read };
        debug!(handle = self.id, write, version = store.version, "transaction begun");
        Ok(())
    }

    fn begin_stmt(&mut self, n: u32) -> Result<()> {
        let snapshot = self.require_write()?.read().clone();
        self.savepoints.push((n, snapshot));
        Ok(())
    }

    fn savepoint(&mut self, op: SavepointOp, n: u32) -> Result<()> {
        let Some(pos) = self.savepoints.iter().position(|(id, _)| *id >= n) else {
            return Ok(());
        };
        if op == SavepointOp::Rollback {
            let restored = self.savepoints[pos].1.clone();
            *self.working()?.write() = restored;
        }
        self.savepoints.truncate(pos);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.state == TxnState::Write {
            let published = self.working()?.read().clone();
            let mut store = self.store.state.lock();
            store.committed = published;
            store.version += 1;
            store.writer = None;
            debug!(handle = self.id, version = store.version, "transaction committed");
        }
        self.end_transaction();
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if self.state == TxnState::Write {
            let mut store = self.store.state.lock();
            if store.writer == Some(self.id) {
                store.writer = None;
            }
            debug!(handle = self.id, "transaction rolled back");
        }
        self.end_transaction();
        Ok(())
    }

    fn txn_state(&self) -> TxnState {
        self.state
    }

    fn get_meta(&self, slot: MetaSlot) -> Result<u32> {
        Ok(match &self.working {
            Some(tables) => tables.read().meta[slot.index()],
            None => self.store.state.lock().committed.meta[slot.index()],
        })
    }

    fn update_meta(&mut self, slot: MetaSlot, value: u32) -> Result<()> {
        self.require_write()?.write().meta[slot.index()] = value;
        Ok(())
    }

    fn open_cursor(
        &mut self,
        root: u32,
        write: bool,
        key_info: Option<Arc<KeyInfo>>,
    ) -> Result<Box<dyn BtreeCursor>> {
        if write && self.state != TxnState::Write {
            return Err(SqlvmError::Misuse(
                "write cursor needs a write transaction".to_owned(),
            ));
        }
        let tables = Arc::clone(self.working()?);
        let is_index = matches!(tables.read().tree(root)?, Tree::Index(_));
        debug!(handle = self.id, root, write, is_index, "cursor opened");
        Ok(Box::new(MemCursor {
            tables,
            root,
            is_index,
            writable: write,
            key_info: key_info.unwrap_or_default(),
            pos: Pos::Invalid,
        }))
    }

    fn create_table(&mut self, kind: TreeKind) -> Result<u32> {
        let mut tables = self.require_write()?.write();
        let root = tables.next_root;
        tables.next_root += 1;
        let tree = match kind {
            TreeKind::Table => Tree::Table(BTreeMap::new()),
            TreeKind::Index => Tree::Index(Vec::new()),
        };
        tables.trees.insert(root, tree);
        tables.meta[MetaSlot::LargestRootPage.index()] = root;
        Ok(root)
    }

    fn clear_table(&mut self, root: u32) -> Result<u64> {
        let mut tables = self.require_write()?.write();
        let removed = match tables.tree_mut(root)? {
            Tree::Table(rows) => {
                let n = rows.len();
                rows.clear();
                n
            }
            Tree::Index(keys) => {
                let n = keys.len();
                keys.clear();
                n
            }
        };
        Ok(removed as u64)
    }

    fn drop_table(&mut self, root: u32) -> Result<()> {
        let mut tables = self.require_write()?.write();
        if root == SCHEMA_ROOT {
            return Err(SqlvmError::Misuse("cannot drop the schema table".to_owned()));
        }
        tables
            .trees
            .remove(&root)
            .map(|_| ())
            .ok_or_else(|| SqlvmError::corrupt(format!("no tree at root page {root}")))
    }
}

impl Drop for MemBtree {
    fn drop(&mut self) {
        if self.state == TxnState::Write {
            let mut store = self.store.state.lock();
            if store.writer == Some(self.id) {
                store.writer = None;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Pos {
    Invalid,
    Row(i64),
    Key(Arc<[u8]>),
}

#[derive(Debug)]
struct MemCursor {
    tables: Arc<RwLock<Tables>>,
    root: u32,
    is_index: bool,
    writable: bool,
    key_info: Arc<KeyInfo>,
    pos: Pos,
}

/// Number of leading `entries` for which `before` holds (they must be a
/// prefix).
fn partition(
    entries: &[Arc<[u8]>],
    mut before: impl FnMut(&[u8]) -> Result<bool>,
) -> Result<usize> {
    let (mut lo, mut hi) = (0, entries.len());
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if before(&entries[mid])? {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

impl MemCursor {
    fn check_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(SqlvmError::ReadOnly)
        }
    }

    fn land(&mut self, pos: Option<Pos>) -> bool {
        self.pos = pos.unwrap_or(Pos::Invalid);
        !matches!(self.pos, Pos::Invalid)
    }

    fn key_cmp(&self, a: &[u8], b: &[u8]) -> Result<Ordering> {
        self.key_info.compare_records(a, b)
    }

    fn step(&mut self, forward: bool) -> Result<bool> {
        let tables = self.tables.read();
        let next = match (tables.tree(self.root)?, &self.pos) {
            (_, Pos::Invalid) => None,
            (Tree::Table(rows), Pos::Row(r)) => {
                let found = if forward {
                    rows.range((Bound::Excluded(*r), Bound::Unbounded)).next()
                } else {
                    rows.range(..*r).next_back()
                };
                found.map(|(&k, _)| Pos::Row(k))
            }
            (Tree::Index(keys), Pos::Key(k)) => {
                if forward {
                    let idx = partition(keys, |e| Ok(self.key_cmp(e, k)?.is_le()))?;
                    keys.get(idx).cloned().map(Pos::Key)
                } else {
                    let idx = partition(keys, |e| Ok(self.key_cmp(e, k)?.is_lt()))?;
                    idx.checked_sub(1).map(|i| Pos::Key(Arc::clone(&keys[i])))
                }
            }
            _ => return Err(SqlvmError::internal("cursor position does not match tree kind")),
        };
        drop(tables);
        Ok(self.land(next))
    }

    fn edge(&mut self, first: bool) -> Result<bool> {
        let tables = self.tables.read();
        let pos = match tables.tree(self.root)? {
            Tree::Table(rows) => {
                let entry = if first {
                    rows.keys().next()
                } else {
                    rows.keys().next_back()
                };
                entry.map(|&k| Pos::Row(k))
            }
            Tree::Index(keys) => {
                let entry = if first { keys.first() } else { keys.last() };
                entry.cloned().map(Pos::Key)
            }
        };
        drop(tables);
        Ok(self.land(pos))
    }
}

impl BtreeCursor for MemCursor {
    fn root(&self) -> u32 {
        self.root
    }

    fn is_index(&self) -> bool {
        self.is_index
    }

    fn first(&mut self) -> Result<bool> {
        self.edge(true)
    }

    fn last(&mut self) -> Result<bool> {
        self.edge(false)
    }

    fn next(&mut self) -> Result<bool> {
        self.step(true)
    }

    fn prev(&mut self) -> Result<bool> {
        self.step(false)
    }

    fn table_move_to(&mut self, rowid: i64) -> Result<Option<Ordering>> {
        let tables = self.tables.read();
        let Tree::Table(rows) = tables.tree(self.root)? else {
            return Err(SqlvmError::internal("rowid seek on an index tree"));
        };
        let landed = rows
            .range(rowid..)
            .next()
            .map(|(&k, _)| (k, k.cmp(&rowid)))
            .or_else(|| rows.keys().next_back().map(|&k| (k, Ordering::Less)));
        drop(tables);
        match landed {
            Some((k, ord)) => {
                self.pos = Pos::Row(k);
                Ok(Some(ord))
            }
            None => {
                self.pos = Pos::Invalid;
                Ok(None)
            }
        }
    }

    fn index_move_to(&mut self, key: &UnpackedRecord) -> Result<Option<Ordering>> {
        let tables = self.tables.read();
        let Tree::Index(keys) = tables.tree(self.root)? else {
            return Err(SqlvmError::internal("key seek on a table tree"));
        };
        let info = Arc::clone(&self.key_info);
        let idx = partition(keys, |e| Ok(key.compare_to_record(e, &info)?.is_lt()))?;
        let landed = match keys.get(idx) {
            Some(entry) => Some((Arc::clone(entry), key.compare_to_record(entry, &info)?)),
            None => keys.last().map(|entry| (Arc::clone(entry), Ordering::Less)),
        };
        drop(tables);
        match landed {
            Some((entry, ord)) => {
                self.pos = Pos::Key(entry);
                Ok(Some(ord))
            }
            None => {
                self.pos = Pos::Invalid;
                Ok(None)
            }
        }
    }

    fn rowid(&self) -> Result<i64> {
        match &self.pos {
            Pos::Row(r) => Ok(*r),
            Pos::Key(k) => match decode_record(k)?.last() {
                Some(SqlValue::Integer(r)) => Ok(*r),
                _ => Err(SqlvmError::corrupt("index key does not end in a rowid")),
            },
            Pos::Invalid => Err(SqlvmError::internal("cursor is not on an entry")),
        }
    }

    fn payload(&self) -> Result<Arc<[u8]>> {
        match &self.pos {
            Pos::Row(r) => match self.tables.read().tree(self.root)? {
                Tree::Table(rows) => rows
                    .get(r)
                    .cloned()
                    .ok_or_else(|| SqlvmError::internal("cursor row was deleted")),
                Tree::Index(_) => Err(SqlvmError::internal("row position on an index tree")),
            },
            Pos::Key(k) => Ok(Arc::clone(k)),
            Pos::Invalid => Err(SqlvmError::internal("cursor is not on an entry")),
        }
    }

    fn insert_row(&mut self, rowid: i64, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        let mut tables = self.tables.write();
        let Tree::Table(rows) = tables.tree_mut(self.root)? else {
            return Err(SqlvmError::internal("row insert into an index tree"));
        };
        rows.insert(rowid, Arc::from(data));
        drop(tables);
        self.pos = Pos::Row(rowid);
        Ok(())
    }

    fn insert_key(&mut self, key: &[u8]) -> Result<()> {
        self.check_writable()?;
        let info = Arc::clone(&self.key_info);
        let mut tables = self.tables.write();
        let Tree::Index(keys) = tables.tree_mut(self.root)? else {
            return Err(SqlvmError::internal("key insert into a table tree"));
        };
        let idx = partition(keys, |e| Ok(info.compare_records(e, key)?.is_lt()))?;
        let key: Arc<[u8]> = Arc::from(key);
        let replace = match keys.get(idx) {
            Some(existing) => info.compare_records(existing, &key)?.is_eq(),
            None => false,
        };
        if replace {
            keys[idx] = Arc::clone(&key);
        } else {
            keys.insert(idx, Arc::clone(&key));
        }
        drop(tables);
        self.pos = Pos::Key(key);
        Ok(())
    }

    fn delete(&mut self) -> Result<()> {
        self.check_writable()?;
        let info = Arc::clone(&self.key_info);
        let mut tables = self.tables.write();
        match (tables.tree_mut(self.root)?, &self.pos) {
            (Tree::Table(rows), Pos::Row(r)) => {
                rows.remove(r);
            }
            (Tree::Index(keys), Pos::Key(k)) => {
                let idx = partition(keys, |e| Ok(info.compare_records(e, k)?.is_lt()))?;
                if let Some(existing) = keys.get(idx) {
                    if info.compare_records(existing, k)?.is_eq() {
                        keys.remove(idx);
                    }
                }
            }
            _ => return Err(SqlvmError::internal("delete without a current entry")),
        }
        Ok(())
    }

    fn eof(&self) -> bool {
        matches!(self.pos, Pos::Invalid)
    }

    fn count(&mut self) -> Result<u64> {
        let tables = self.tables.read();
        let n = match tables.tree(self.root)? {
            Tree::Table(rows) => rows.len(),
            Tree::Index(keys) => keys.len(),
        };
        Ok(n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlvm_types::record::encode_values;

    fn write_handle(store: &MemStore) -> MemBtree {
        let mut bt = store.connect();
        bt.begin_trans(true).unwrap();
        bt
    }

    #[test]
    fn test_table_navigation() {
        let store = MemStore::new();
        let mut bt = write_handle(&store);
        let root = bt.create_table(TreeKind::Table).unwrap();
        let mut cur = bt.open_cursor(root, true, None).unwrap();
        for r in [3, 1, 2] {
            cur.insert_row(r, &encode_values(&[SqlValue::Integer(r * 10)])).unwrap();
        }
        assert!(cur.first().unwrap());
        assert_eq!(cur.rowid().unwrap(), 1);
        assert!(cur.next().unwrap());
        assert!(cur.next().unwrap());
        assert_eq!(cur.rowid().unwrap(), 3);
        assert!(!cur.next().unwrap());
        assert!(cur.eof());
        assert!(!cur.prev().unwrap());
        assert_eq!(cur.count().unwrap(), 3);
        assert_eq!(cur.max_rowid().unwrap(), Some(3));
    }

    #[test]
    fn test_table_move_to_lands_after_missing_key() {
        let store = MemStore::new();
        let mut bt = write_handle(&store);
        let root = bt.create_table(TreeKind::Table).unwrap();
        let mut cur = bt.open_cursor(root, true, None).unwrap();
        assert_eq!(cur.table_move_to(5).unwrap(), None);
        for r in [10, 20] {
            cur.insert_row(r, &[]).unwrap();
        }
        assert_eq!(cur.table_move_to(15).unwrap(), Some(Ordering::Greater));
        assert_eq!(cur.rowid().unwrap(), 20);
        assert_eq!(cur.table_move_to(20).unwrap(), Some(Ordering::Equal));
        assert_eq!(cur.table_move_to(99).unwrap(), Some(Ordering::Less));
        assert_eq!(cur.rowid().unwrap(), 20);
    }

    #[test]
    fn test_delete_keeps_place() {
        let store = MemStore::new();
        let mut bt = write_handle(&store);
        let root = bt.create_table(TreeKind::Table).unwrap();
        let mut cur = bt.open_cursor(root, true, None).unwrap();
        for r in 1..=3 {
            cur.insert_row(r, &[]).unwrap();
        }
        cur.table_move_to(2).unwrap();
        cur.delete().unwrap();
        assert!(cur.next().unwrap());
        assert_eq!(cur.rowid().unwrap(), 3);
        assert_eq!(cur.count().unwrap(), 2);
    }

    #[test]
    fn test_index_order_and_seek() {
        let store = MemStore::new();
        let mut bt = write_handle(&store);
        let root = bt.create_table(TreeKind::Index).unwrap();
        let mut cur = bt.open_cursor(root, true, None).unwrap();
        for (name, rowid) in [("carol", 3), ("alice", 1), ("bob", 2)] {
            cur.insert_key(&encode_values(&[SqlValue::from(name), SqlValue::Integer(rowid)]))
                .unwrap();
        }
        assert!(cur.first().unwrap());
        assert_eq!(cur.rowid().unwrap(), 1);

        let key = UnpackedRecord::new(vec![SqlValue::from("bob")]);
        assert_eq!(cur.index_move_to(&key).unwrap(), Some(Ordering::Equal));
        assert_eq!(cur.rowid().unwrap(), 2);

        let key = UnpackedRecord::new(vec![SqlValue::from("bz")]);
        assert_eq!(cur.index_move_to(&key).unwrap(), Some(Ordering::Greater));
        assert_eq!(cur.rowid().unwrap(), 3);
        assert!(cur.prev().unwrap());
        assert_eq!(cur.rowid().unwrap(), 2);
    }

    #[test]
    fn test_read_cursor_cannot_write() {
        let store = MemStore::new();
        let mut bt = write_handle(&store);
        let root = bt.create_table(TreeKind::Table).unwrap();
        let mut cur = bt.open_cursor(root, false, None).unwrap();
        assert!(matches!(cur.insert_row(1, &[]), Err(SqlvmError::ReadOnly)));
    }

    #[test]
    fn test_statement_rollback_restores_snapshot() {
        let store = MemStore::new();
        let mut bt = write_handle(&store);
        let root = bt.create_table(TreeKind::Table).unwrap();
        let mut cur = bt.open_cursor(root, true, None).unwrap();
        cur.insert_row(1, &[]).unwrap();
        bt.begin_stmt(1).unwrap();
        cur.insert_row(2, &[]).unwrap();
        bt.savepoint(SavepointOp::Rollback, 1).unwrap();
        assert_eq!(cur.count().unwrap(), 1);
    }

    #[test]
    fn test_meta_is_transactional() {
        let store = MemStore::new();
        let mut bt = write_handle(&store);
        bt.update_meta(MetaSlot::SchemaVersion, 7).unwrap();
        bt.rollback().unwrap();
        assert_eq!(bt.get_meta(MetaSlot::SchemaVersion).unwrap(), 0);
        bt.begin_trans(true).unwrap();
        bt.update_meta(MetaSlot::SchemaVersion, 9).unwrap();
        bt.commit().unwrap();
        assert_eq!(store.connect().get_meta(MetaSlot::SchemaVersion).unwrap(), 9);
    }
}
