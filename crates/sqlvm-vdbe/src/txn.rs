//! Transaction, schema-cookie and rowid opcodes.

use std::cmp::Ordering;

use sqlvm_btree::{MetaSlot, TreeKind, SCHEMA_ROOT};
use sqlvm_error::{Result, SqlvmError};
use sqlvm_types::record::decode_record;
use sqlvm_types::{Mem, Opcode, SqlValue, VdbeOp};
use tracing::{debug, warn};

use crate::connection::{Connection, SchemaObject};
use crate::context::{ControlTransfer, Outcome};
use crate::cursor::slot;
use crate::engine::{bad_p4, jump_if, to_usize, Vdbe};

/// Largest rowid; reaching it switches allocation to random probing.
const MAX_ROWID: i64 = i64::MAX;

/// Random candidates tried before `NewRowid` gives up with `Full`.
const RANDOM_ROWID_ATTEMPTS: usize = 100;

fn meta_slot(idx: i32) -> Result<MetaSlot> {
    MetaSlot::from_index(idx).ok_or_else(|| SqlvmError::internal(format!("no header slot {idx}")))
}

fn root_operand(v: i32) -> Result<u32> {
    u32::try_from(v).map_err(|_| SqlvmError::internal(format!("bad root page {v}")))
}

impl Vdbe {
    pub(crate) fn dispatch_txn(
        &mut self,
        conn: &mut Connection,
        op: &VdbeOp,
    ) -> Result<ControlTransfer> {
        match op.opcode {
            Opcode::Transaction => self.op_transaction(conn, op),
            Opcode::AutoCommit => self.op_auto_commit(conn, op),
            Opcode::ReadCookie => {
                let db = to_usize(op.p1, "database index")?;
                let value = conn.db(db)?.btree.get_meta(meta_slot(op.p3)?)?;
                self.set_reg(op.p2, Mem::Integer(i64::from(value)))?;
                Ok(ControlTransfer::Continue)
            }
            Opcode::SetCookie => self.op_set_cookie(conn, op),
            Opcode::CreateTable | Opcode::CreateIndex => {
                let db = to_usize(op.p1, "database index")?;
                let kind = if op.opcode == Opcode::CreateTable {
                    TreeKind::Table
                } else {
                    TreeKind::Index
                };
                let root = conn.db_mut(db)?.btree.create_table(kind)?;
                debug!(db, root, ?kind, "tree created");
                self.set_reg(op.p2, Mem::Integer(i64::from(root)))?;
                Ok(ControlTransfer::Continue)
            }
            Opcode::Clear => {
                let db = to_usize(op.p2, "database index")?;
                let removed = conn.db_mut(db)?.btree.clear_table(root_operand(op.p1)?)?;
                let removed = i64::try_from(removed).unwrap_or(i64::MAX);
                if op.p3 > 0 {
                    self.n_change += removed;
                    let counter = self.reg_mut(op.p3)?;
                    *counter = Mem::Integer(counter.integer_value().saturating_add(removed));
                }
                Ok(ControlTransfer::Continue)
            }
            Opcode::Destroy => {
                if conn.n_vdbe_read > 1 {
                    return Err(SqlvmError::Generic(
                        "database table is locked".to_owned(),
                    ));
                }
                let db = to_usize(op.p3, "database index")?;
                conn.db_mut(db)?.btree.drop_table(root_operand(op.p1)?)?;
                self.set_reg(op.p2, Mem::Integer(0))?;
                Ok(ControlTransfer::Continue)
            }
            Opcode::DropTable | Opcode::DropIndex => {
                let db = to_usize(op.p1, "database index")?;
                let name = op.p4.as_text().ok_or_else(|| bad_p4(op))?;
                conn.db_mut(db)?.schema.objects.remove(&*name);
                conn.schema_changed = true;
                Ok(ControlTransfer::Continue)
            }
            Opcode::ParseSchema => {
                let db = to_usize(op.p1, "database index")?;
                let filter = op.p4.as_text().map(|t| t.into_owned());
                let loaded = load_schema(conn, db, filter.as_deref());
                if loaded.is_err() {
                    self.reset_schema_on_fault = Some(db);
                }
                loaded.map(|()| ControlTransfer::Continue)
            }
            Opcode::TableLock => {
                let db = to_usize(op.p1, "database index")?;
                let root = root_operand(op.p2)?;
                if conn.db(db)?.btree.is_table_locked(root, op.p3 != 0) {
                    let name = op.p4.as_text().unwrap_or_default();
                    return Err(SqlvmError::Generic(format!(
                        "database table is locked: {name}"
                    )));
                }
                Ok(ControlTransfer::Continue)
            }
            Opcode::FkCounter => {
                let delta = i64::from(op.p2);
                if op.p1 != 0 {
                    conn.n_deferred_cons += delta;
                } else {
                    self.n_fk_constraint += delta;
                }
                Ok(ControlTransfer::Continue)
            }
            Opcode::FkIfZero => {
                let outstanding = if op.p1 != 0 {
                    conn.n_deferred_cons
                } else {
                    self.n_fk_constraint
                };
                jump_if(outstanding == 0, op.p2)
            }
            other => Err(SqlvmError::internal(format!(
                "{other} is not a transaction opcode"
            ))),
        }
    }

    /// `Transaction`: P1 database, P2 write, P3 expected schema cookie,
    /// P4 expected schema generation, P5 check the schema version.
    fn op_transaction(&mut self, conn: &mut Connection, op: &VdbeOp) -> Result<ControlTransfer> {
        let write = op.p2 != 0;
        if write && conn.config().query_only {
            return Err(SqlvmError::ReadOnly);
        }
        let db = to_usize(op.p1, "database index")?;
        match conn.db_mut(db)?.btree.begin_trans(write) {
            Ok(()) => {}
            Err(SqlvmError::Busy) => {
                warn!(db, write, "database is locked; step again to retry");
                return Ok(ControlTransfer::Suspend(Outcome::Busy));
            }
            Err(err) => return Err(err),
        }

        if write
            && self.program.uses_stmt_journal()
            && (!conn.autocommit || conn.n_vdbe_read > 1)
        {
            if self.i_statement == 0 {
                conn.n_statement += 1;
                self.i_statement = conn.n_statement;
                self.stmt_deferred_cons = conn.n_deferred_cons;
            }
            if !self.stmt_dbs.contains(&db) {
                conn.db_mut(db)?.btree.begin_stmt(self.i_statement)?;
                self.stmt_dbs.push(db);
                debug!(db, statement = self.i_statement, "statement transaction opened");
            }
        }

        if op.p5 != 0 {
            let disk_cookie = conn.db(db)?.btree.get_meta(MetaSlot::SchemaVersion)?;
            let schema = conn.schema(db)?;
            let expected_generation = op.p4.as_int().unwrap_or(0);
            let cookie_matches = u32::try_from(op.p3).is_ok_and(|c| c == disk_cookie);
            let generation_matches =
                u32::try_from(expected_generation).is_ok_and(|g| g == schema.generation);
            if !cookie_matches || !generation_matches {
                // Only a cookie difference means the cached schema is stale;
                // a generation difference just means this program is.
                if schema.cookie != disk_cookie {
                    conn.reset_schema(db)?;
                }
                self.expired = true;
                return Err(SqlvmError::SchemaChanged);
            }
        }
        Ok(ControlTransfer::Continue)
    }

    /// `AutoCommit`: P1 is the desired autocommit flag, P2 non-zero rolls
    /// back instead of committing. Halts the program.
    fn op_auto_commit(&mut self, conn: &mut Connection, op: &VdbeOp) -> Result<ControlTransfer> {
        let desired = op.p1 != 0;
        let rollback = op.p2 != 0;
        if desired == conn.autocommit {
            let msg = if !desired {
                "cannot start a transaction within a transaction"
            } else if rollback {
                "cannot rollback - no transaction is active"
            } else {
                "cannot commit - no transaction is active"
            };
            return Err(SqlvmError::Generic(msg.to_owned()));
        }
        if desired && !rollback && conn.n_vdbe_write > usize::from(self.is_writer) {
            return Err(SqlvmError::Generic(
                "cannot commit transaction - SQL statements in progress".to_owned(),
            ));
        }
        if rollback {
            conn.rollback_all();
        } else {
            conn.autocommit = desired;
        }
        match self.halt_routine(conn, None) {
            Outcome::Busy => {
                conn.autocommit = !desired;
                Ok(ControlTransfer::Suspend(Outcome::Busy))
            }
            outcome => Ok(ControlTransfer::Suspend(outcome)),
        }
    }

    /// `SetCookie`: P1 database, P2 header slot, P3 new value.
    fn op_set_cookie(&mut self, conn: &mut Connection, op: &VdbeOp) -> Result<ControlTransfer> {
        let db = to_usize(op.p1, "database index")?;
        let slot_idx = meta_slot(op.p2)?;
        let value = u32::try_from(op.p3)
            .map_err(|_| SqlvmError::internal(format!("bad cookie value {}", op.p3)))?;
        let entry = conn.db_mut(db)?;
        entry.btree.update_meta(slot_idx, value)?;
        match slot_idx {
            MetaSlot::SchemaVersion => {
                entry.schema.cookie = value;
                entry.schema.generation = entry.schema.generation.wrapping_add(1);
            }
            MetaSlot::FileFormat => conn.reset_schema(db)?,
            _ => {}
        }
        if matches!(slot_idx, MetaSlot::SchemaVersion | MetaSlot::FileFormat) {
            conn.schema_changed = true;
        }
        Ok(ControlTransfer::Continue)
    }

    /// `NewRowid`: P1 table cursor, P2 output register, P3 AUTOINCREMENT
    /// high-water register (0 for none).
    pub(crate) fn op_new_rowid(&mut self, op: &VdbeOp) -> Result<ControlTransfer> {
        let cur = slot(&mut self.cursors, op.p1)?;
        let mut v = 0;
        if !cur.use_random_rowid {
            v = match cur.btree_mut()?.max_rowid()? {
                None => 1,
                Some(MAX_ROWID) => {
                    cur.use_random_rowid = true;
                    0
                }
                Some(max) => max + 1,
            };
        }

        if op.p3 > 0 {
            // Inside a trigger the counter lives in the top-level program.
            let regs = match self.frames.root_mut() {
                Some(root) => &mut root.registers,
                None => &mut self.regs,
            };
            let counter = usize::try_from(op.p3)
                .ok()
                .and_then(|i| regs.get_mut(i))
                .ok_or_else(|| SqlvmError::internal("autoincrement register out of range"))?;
            counter.integerify();
            let high_water = counter.integer_value();
            if high_water == MAX_ROWID || cur.use_random_rowid {
                return Err(SqlvmError::Full);
            }
            v = v.max(high_water + 1);
            *counter = Mem::Integer(v);
        }

        if cur.use_random_rowid {
            let tree = cur.btree_mut()?;
            let mut free = None;
            for _ in 0..RANDOM_ROWID_ATTEMPTS {
                let candidate = (rand::random::<i64>() & (MAX_ROWID >> 1)) + 1;
                if tree.table_move_to(candidate)? != Some(Ordering::Equal) {
                    free = Some(candidate);
                    break;
                }
            }
            v = free.ok_or(SqlvmError::Full)?;
        }
        cur.invalidate();
        self.set_reg(op.p2, Mem::Integer(v))?;
        Ok(ControlTransfer::Continue)
    }
}

/// Reload the schema cache of database `db` from its schema table. With a
/// filter only rows whose `tbl_name` matches are (re)loaded.
fn load_schema(conn: &mut Connection, db: usize, filter: Option<&str>) -> Result<()> {
    let cookie = conn.db(db)?.btree.get_meta(MetaSlot::SchemaVersion)?;
    let mut cursor = conn.db_mut(db)?.btree.open_cursor(SCHEMA_ROOT, false, None)?;
    let mut objects = Vec::new();
    let mut more = cursor.first()?;
    while more {
        let row = decode_record(&cursor.payload()?)?;
        let object = schema_object(&row)?;
        if filter.map_or(true, |t| t == object.table) {
            objects.push(object);
        }
        more = cursor.next()?;
    }

    let schema = &mut conn.db_mut(db)?.schema;
    if filter.is_none() {
        schema.objects.clear();
    }
    let n = objects.len();
    for object in objects {
        schema.objects.insert(object.name.clone(), object);
    }
    schema.loaded = true;
    schema.cookie = cookie;
    debug!(db, objects = n, cookie, filtered = filter.is_some(), "schema loaded");
    Ok(())
}

/// One schema-table row: `(type, name, tbl_name, rootpage, sql)`.
fn schema_object(row: &[SqlValue]) -> Result<SchemaObject> {
    let [kind, name, table, root, sql, ..] = row else {
        return Err(SqlvmError::corrupt(format!(
            "schema row has {} fields, expected 5",
            row.len()
        )));
    };
    let text = |v: &SqlValue| v.as_text().map(str::to_owned);
    Ok(SchemaObject {
        kind: text(kind).ok_or_else(|| SqlvmError::corrupt("schema row without a type"))?,
        name: text(name).ok_or_else(|| SqlvmError::corrupt("schema row without a name"))?,
        table: text(table).unwrap_or_default(),
        root: u32::try_from(root.to_integer())
            .map_err(|_| SqlvmError::corrupt("schema row with a bad root page"))?,
        sql: text(sql),
    })
}
