//! Storage-layer interface consumed by the interpreter.
//!
//! # Cursor semantics
//!
//! A cursor is bound to one tree of one database handle and only works while
//! that handle has a transaction open. Positioning calls report whether they
//! landed on an entry; `eof` is true whenever the cursor is not on one.
//!
//! # Two tree kinds
//!
//! - **Table trees (intkey):** keyed by `i64` rowid, entries carry a record.
//! - **Index trees:** keyed by an encoded record whose last field is
//!   conventionally the rowid of the table row it points at.

use std::cmp::Ordering;
use std::sync::Arc;

use sqlvm_error::Result;
use sqlvm_types::{KeyInfo, UnpackedRecord};

// ---------------------------------------------------------------------------
// Transaction bookkeeping
// ---------------------------------------------------------------------------

/// What kind of transaction a handle currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TxnState {
    None,
    Read,
    Write,
}

/// Savepoint disposition used to finish a statement transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavepointOp {
    /// Keep the statement's changes and forget the savepoint(s).
    Release,
    /// Undo the statement's changes and forget the savepoint(s).
    Rollback,
}

/// What a new root page holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKind {
    Table,
    Index,
}

/// Numbered header fields stored alongside the trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MetaSlot {
    /// Bumped by every schema change (the schema cookie).
    SchemaVersion = 1,
    FileFormat = 2,
    DefaultCacheSize = 3,
    LargestRootPage = 4,
    TextEncoding = 5,
    UserVersion = 6,
    IncrementalVacuum = 7,
    ApplicationId = 8,
}

impl MetaSlot {
    /// Number of addressable slots, including the unused slot 0.
    pub const COUNT: usize = 16;

    pub const fn from_index(idx: i32) -> Option<Self> {
        match idx {
            1 => Some(Self::SchemaVersion),
            2 => Some(Self::FileFormat),
            3 => Some(Self::DefaultCacheSize),
            4 => Some(Self::LargestRootPage),
            5 => Some(Self::TextEncoding),
            6 => Some(Self::UserVersion),
            7 => Some(Self::IncrementalVacuum),
            8 => Some(Self::ApplicationId),
            _ => None,
        }
    }

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Root page of the schema table in every database.
pub const SCHEMA_ROOT: u32 = 1;

// ---------------------------------------------------------------------------
// Btree
// ---------------------------------------------------------------------------

/// One open database file as seen by one connection.
pub trait Btree: Send {
    /// Start a read or write transaction; upgrading a read transaction is
    /// allowed. Returns `Busy` when another handle owns the write lock.
    fn begin_trans(&mut self, write: bool) -> Result<()>;

    /// Open statement savepoint `n` inside the current write transaction.
    fn begin_stmt(&mut self, n: u32) -> Result<()>;

    /// Release or roll back every statement savepoint numbered `n` or above.
    fn savepoint(&mut self, op: SavepointOp, n: u32) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    /// Abandon the transaction. Never fails when no transaction is open.
    fn rollback(&mut self) -> Result<()>;

    fn txn_state(&self) -> TxnState;

    /// Read a header slot. Works outside a transaction (reads the last
    /// committed value).
    fn get_meta(&self, slot: MetaSlot) -> Result<u32>;

    /// Write a header slot; needs a write transaction.
    fn update_meta(&mut self, slot: MetaSlot, value: u32) -> Result<()>;

    /// Open a cursor on `root`. Index trees order keys by `key_info`
    /// (BINARY ascending when `None`).
    fn open_cursor(
        &mut self,
        root: u32,
        write: bool,
        key_info: Option<Arc<KeyInfo>>,
    ) -> Result<Box<dyn BtreeCursor>>;

    /// Allocate a new empty tree and return its root page.
    fn create_table(&mut self, kind: TreeKind) -> Result<u32>;

    /// Delete every entry of `root`, returning how many were removed.
    fn clear_table(&mut self, root: u32) -> Result<u64>;

    fn drop_table(&mut self, root: u32) -> Result<()>;

    /// Whether `root` is write-locked by another connection's shared cache.
    /// Backends without table-level locking never report a lock.
    fn is_table_locked(&self, _root: u32, _write: bool) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// BtreeCursor
// ---------------------------------------------------------------------------

/// Cursor over a single tree.
///
/// Move operations return the ordering of the entry the cursor landed on
/// relative to the search key: `Less` when the entry sorts before the key,
/// `Equal` on a match, `Greater` after. `None` means the tree is empty.
/// When the key is absent the cursor lands on the first entry after it, or
/// on the last entry when every entry sorts before it.
pub trait BtreeCursor: Send {
    fn root(&self) -> u32;

    fn is_index(&self) -> bool;

    /// Move to the first entry. `false` if the tree is empty.
    fn first(&mut self) -> Result<bool>;

    /// Move to the last entry. `false` if the tree is empty.
    fn last(&mut self) -> Result<bool>;

    /// Advance. `false` (and `eof`) when there is no next entry.
    fn next(&mut self) -> Result<bool>;

    /// Step back. `false` when there is no previous entry or the cursor is
    /// already at EOF.
    fn prev(&mut self) -> Result<bool>;

    fn table_move_to(&mut self, rowid: i64) -> Result<Option<Ordering>>;

    fn index_move_to(&mut self, key: &UnpackedRecord) -> Result<Option<Ordering>>;

    /// Rowid of the current entry. For index trees this is the integer in
    /// the last field of the key.
    fn rowid(&self) -> Result<i64>;

    /// Record (table) or key (index) bytes of the current entry.
    fn payload(&self) -> Result<Arc<[u8]>>;

    /// Insert or replace a table row and position on it.
    fn insert_row(&mut self, rowid: i64, data: &[u8]) -> Result<()>;

    /// Insert or replace an index key and position on it.
    fn insert_key(&mut self, key: &[u8]) -> Result<()>;

    /// Delete the current entry. The cursor keeps its place: `next`/`prev`
    /// continue from where the deleted entry was.
    fn delete(&mut self) -> Result<()>;

    fn eof(&self) -> bool;

    /// Largest rowid in a table tree, positioning on it.
    fn max_rowid(&mut self) -> Result<Option<i64>> {
        if self.last()? {
            self.rowid().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Number of entries in the tree.
    fn count(&mut self) -> Result<u64>;
}
