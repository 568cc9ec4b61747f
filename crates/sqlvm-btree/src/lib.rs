//! Storage interface for the sqlvm interpreter.
//!
//! The interpreter only talks to storage through [`Btree`] and
//! [`BtreeCursor`]. [`MemStore`] is a small in-memory implementation with
//! one-writer/many-reader locking, used by the test suites and by embedders
//! that do not need persistence.

pub mod mem;
pub mod traits;

pub use mem::{MemBtree, MemStore};
pub use traits::{
    Btree, BtreeCursor, MetaSlot, SavepointOp, TreeKind, TxnState, SCHEMA_ROOT,
};
