//! Connection state shared by every program run on it.
//!
//! A [`Connection`] owns one [`Btree`] per attached database together with
//! that database's schema cache, plus the counters the halt controller uses
//! to decide between statement and transaction boundaries.

use std::collections::BTreeMap;
use std::fmt;

use sqlvm_btree::{Btree, SavepointOp, TxnState};
use sqlvm_error::{Result, SqlvmError};
use sqlvm_func::FunctionRegistry;
use sqlvm_types::CollationRegistry;
use tracing::{debug, info};

use crate::config::VdbeConfig;
use crate::context::InterruptHandle;

/// Index of the main database.
pub const MAIN_DB: usize = 0;

/// One row of the schema table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaObject {
    /// `table`, `index`, `view` or `trigger`.
    pub kind: String,
    pub name: String,
    pub table: String,
    pub root: u32,
    pub sql: Option<String>,
}

/// What the connection knows about one database's schema.
#[derive(Debug, Clone, Default)]
pub struct SchemaCache {
    /// Schema cookie the cached objects were read under.
    pub cookie: u32,
    /// Bumped on every reset; compiled programs carry the value they saw.
    pub generation: u32,
    pub loaded: bool,
    pub objects: BTreeMap<String, SchemaObject>,
}

impl SchemaCache {
    pub fn get(&self, name: &str) -> Option<&SchemaObject> {
        self.objects.get(name)
    }

    fn reset(&mut self) {
        self.objects.clear();
        self.loaded = false;
        self.cookie = 0;
        self.generation = self.generation.wrapping_add(1);
    }
}

/// An attached database.
pub struct DbSlot {
    pub name: String,
    pub btree: Box<dyn Btree>,
    pub schema: SchemaCache,
}

impl fmt::Debug for DbSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbSlot")
            .field("name", &self.name)
            .field("txn", &self.btree.txn_state())
            .field("schema", &self.schema)
            .finish()
    }
}

/// Per-connection execution statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Instructions executed by every program that has halted.
    pub vm_steps: u64,
    pub full_scan_steps: u64,
    pub sorts: u64,
}

/// Callback polled every `progress_ops` instructions; non-zero stops the
/// running program with `Interrupted`.
pub type ProgressHandler = Box<dyn FnMut() -> i32 + Send>;

pub struct Connection {
    dbs: Vec<DbSlot>,
    pub(crate) autocommit: bool,
    /// Open statement transactions across all running programs.
    pub(crate) n_statement: u32,
    /// Outstanding deferred foreign-key violations.
    pub(crate) n_deferred_cons: i64,
    pub(crate) n_vdbe_active: usize,
    pub(crate) n_vdbe_read: usize,
    pub(crate) n_vdbe_write: usize,
    /// A schema change happened inside the open transaction.
    pub(crate) schema_changed: bool,
    n_change: i64,
    total_changes: i64,
    last_rowid: i64,
    interrupt: InterruptHandle,
    pub(crate) progress: Option<ProgressHandler>,
    pub(crate) progress_ops: u64,
    functions: FunctionRegistry,
    collations: CollationRegistry,
    config: VdbeConfig,
    pub(crate) stats: ConnectionStats,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("dbs", &self.dbs)
            .field("autocommit", &self.autocommit)
            .field("n_statement", &self.n_statement)
            .field("n_deferred_cons", &self.n_deferred_cons)
            .field("n_vdbe_active", &self.n_vdbe_active)
            .field("last_rowid", &self.last_rowid)
            .field("progress", &self.progress.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// A connection whose main database is `main`, with the builtin
    /// functions and collations registered.
    pub fn new(main: Box<dyn Btree>, config: VdbeConfig) -> Self {
        let progress_ops = config.progress_ops;
        Self {
            dbs: vec![DbSlot {
                name: "main".to_owned(),
                btree: main,
                schema: SchemaCache::default(),
            }],
            autocommit: true,
            n_statement: 0,
            n_deferred_cons: 0,
            n_vdbe_active: 0,
            n_vdbe_read: 0,
            n_vdbe_write: 0,
            schema_changed: false,
            n_change: 0,
            total_changes: 0,
            last_rowid: 0,
            interrupt: InterruptHandle::new(),
            progress: None,
            progress_ops,
            functions: FunctionRegistry::with_builtins(),
            collations: CollationRegistry::new(),
            config,
            stats: ConnectionStats::default(),
        }
    }

    /// Attach another database, returning its index for `P1`/`P3` operands.
    pub fn attach(&mut self, name: &str, btree: Box<dyn Btree>) -> usize {
        self.dbs.push(DbSlot {
            name: name.to_owned(),
            btree,
            schema: SchemaCache::default(),
        });
        debug!(name, index = self.dbs.len() - 1, "database attached");
        self.dbs.len() - 1
    }

    pub fn db_count(&self) -> usize {
        self.dbs.len()
    }

    pub fn db(&self, idx: usize) -> Result<&DbSlot> {
        self.dbs
            .get(idx)
            .ok_or_else(|| SqlvmError::internal(format!("no database at index {idx}")))
    }

    pub fn db_mut(&mut self, idx: usize) -> Result<&mut DbSlot> {
        self.dbs
            .get_mut(idx)
            .ok_or_else(|| SqlvmError::internal(format!("no database at index {idx}")))
    }


    pub fn schema(&self, idx: usize) -> Result<&SchemaCache> {
        self.db(idx).map(|db| &db.schema)
    }

    /// Discard the cached schema of database `idx`.
    pub fn reset_schema(&mut self, idx: usize) -> Result<()> {
        let db = self.db_mut(idx)?;
        db.schema.reset();
        info!(db = %db.name, generation = db.schema.generation, "schema cache reset");
        Ok(())
    }

    pub fn is_autocommit(&self) -> bool {
        self.autocommit
    }

    pub fn config(&self) -> &VdbeConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut VdbeConfig {
        &mut self.config
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    pub fn functions_mut(&mut self) -> &mut FunctionRegistry {
        &mut self.functions
    }

    pub fn collations(&self) -> &CollationRegistry {
        &self.collations
    }

    pub fn collations_mut(&mut self) -> &mut CollationRegistry {
        &mut self.collations
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    /// Install `handler`, called every `n_ops` instructions (0 removes it).
    pub fn set_progress_handler(&mut self, n_ops: u64, handler: Option<ProgressHandler>) {
        self.progress_ops = if handler.is_some() { n_ops } else { 0 };
        self.progress = handler;
    }

    pub fn last_insert_rowid(&self) -> i64 {
        self.last_rowid
    }

    pub(crate) fn set_last_rowid(&mut self, rowid: i64) {
        self.last_rowid = rowid;
    }

    /// Rows changed by the most recent successful program.
    pub fn changes(&self) -> i64 {
        self.n_change
    }

    pub fn total_changes(&self) -> i64 {
        self.total_changes
    }

    pub(crate) fn record_changes(&mut self, n: i64) {
        self.n_change = n;
        self.total_changes += n;
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    /// Number of programs currently between their first step and halt.
    pub fn active_statements(&self) -> usize {
        self.n_vdbe_active
    }

    pub fn deferred_violations(&self) -> i64 {
        self.n_deferred_cons
    }

    // ── Transaction boundaries ─────────────────────────────────────────

    /// Commit every database with an open transaction.
    pub(crate) fn commit_all(&mut self) -> Result<()> {
        for db in &mut self.dbs {
            if db.btree.txn_state() != TxnState::None {
                db.btree.commit()?;
            }
        }
        self.n_deferred_cons = 0;
        self.schema_changed = false;
        debug!("transaction committed");
        Ok(())
    }

    /// Roll back every database and return to autocommit. Schema caches
    /// are dropped when the transaction changed the schema.
    pub(crate) fn rollback_all(&mut self) {
        for db in &mut self.dbs {
            if let Err(err) = db.btree.rollback() {
                tracing::error!(db = %db.name, %err, "rollback failed");
            }
        }
        self.n_deferred_cons = 0;
        self.n_statement = 0;
        self.autocommit = true;
        if self.schema_changed {
            for db in &mut self.dbs {
                db.schema.reset();
            }
            self.schema_changed = false;
            info!("schema caches reset after rollback");
        }
        debug!("transaction rolled back");
    }

    /// Finish statement savepoint `n` on the given databases.
    pub(crate) fn end_statement(&mut self, dbs: &[usize], op: SavepointOp, n: u32) -> Result<()> {
        for &idx in dbs {
            self.db_mut(idx)?.btree.savepoint(op, n)?;
        }
        self.n_statement = self.n_statement.saturating_sub(1);
        debug!(statement = n, ?op, "statement transaction closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlvm_btree::MemStore;

    #[test]
    fn test_reset_schema_bumps_generation() {
        let store = MemStore::new();
        let mut conn = Connection::new(Box::new(store.connect()), VdbeConfig::default());
        conn.db_mut(MAIN_DB).unwrap().schema.cookie = 4;
        conn.reset_schema(MAIN_DB).unwrap();
        let schema = conn.schema(MAIN_DB).unwrap();
        assert_eq!(schema.generation, 1);
        assert_eq!(schema.cookie, 0);
        assert!(!schema.loaded);
    }

    #[test]
    fn test_attach_indexes() {
        let store = MemStore::new();
        let mut conn = Connection::new(Box::new(store.connect()), VdbeConfig::default());
        let other = MemStore::new();
        assert_eq!(conn.attach("aux", Box::new(other.connect())), 1);
        assert_eq!(conn.db(1).unwrap().name, "aux");
        assert!(conn.db(2).is_err());
    }

    #[test]
    fn test_rollback_returns_to_autocommit() {
        let store = MemStore::new();
        let mut conn = Connection::new(Box::new(store.connect()), VdbeConfig::default());
        conn.autocommit = false;
        conn.db_mut(MAIN_DB).unwrap().btree.begin_trans(true).unwrap();
        conn.rollback_all();
        assert!(conn.is_autocommit());
        assert_eq!(conn.db(MAIN_DB).unwrap().btree.txn_state(), TxnState::None);
    }

    #[test]
    fn test_progress_handler_install() {
        let store = MemStore::new();
        let mut conn = Connection::new(Box::new(store.connect()), VdbeConfig::default());
        conn.set_progress_handler(5, Some(Box::new(|| 0)));
        assert_eq!(conn.progress_ops, 5);
        conn.set_progress_handler(5, None);
        assert_eq!(conn.progress_ops, 0);
    }
}
