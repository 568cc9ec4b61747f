//! Cursor table entries and the opcodes that drive them.
//!
//! A [`VdbeCursor`] wraps one of four row sources behind the same
//! positioning flags and row-decode cache:
//!
//! - a b-tree cursor on an attached database,
//! - an ephemeral b-tree living in a private in-memory store,
//! - a [`Sorter`],
//! - a pseudo table whose single row is a record blob in a register.
//!
//! `Seek` is deferred: the target rowid is remembered and only resolved when
//! a later opcode actually needs the row. `Rowid` answers from the target
//! without touching storage.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use sqlvm_btree::{Btree, BtreeCursor, MemBtree, MemStore, TreeKind};
use sqlvm_error::{Result, SqlvmError};
use sqlvm_types::numeric::real_to_i64;
use sqlvm_types::opcode::{P5_LASTROWID, P5_NCHANGE, P5_P2ISREG};
use sqlvm_types::record::{decode_record, encode_cells};
use sqlvm_types::{
    Affinity, Buf, KeyInfo, Mem, Opcode, RecordHeaderCache, UnpackedRecord, VdbeOp, P4,
};
use tracing::debug;

use crate::connection::Connection;
use crate::context::ControlTransfer;
use crate::engine::{bad_p4, jump, jump_if, to_usize, Vdbe};
use crate::sorter::Sorter;

/// Which advance opcode a positioned cursor accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Any,
    Forward,
    Backward,
    /// Positioned by `Found`/`NotFound`; not advanceable.
    Frozen,
}

pub(crate) enum CursorKind {
    BTree {
        cursor: Box<dyn BtreeCursor>,
        db: usize,
    },
    /// The handle keeps the private store's transaction open.
    Ephemeral {
        cursor: Box<dyn BtreeCursor>,
        _handle: MemBtree,
    },
    Sorter(Sorter),
    /// Single-row table read from a register holding a record.
    Pseudo { reg: i32 },
}

impl CursorKind {
    fn name(&self) -> &'static str {
        match self {
            Self::BTree { .. } => "btree",
            Self::Ephemeral { .. } => "ephemeral",
            Self::Sorter(_) => "sorter",
            Self::Pseudo { .. } => "pseudo",
        }
    }

    fn db(&self) -> Option<usize> {
        match self {
            Self::BTree { db, .. } => Some(*db),
            _ => None,
        }
    }
}

pub struct VdbeCursor {
    pub(crate) kind: CursorKind,
    pub(crate) null_row: bool,
    pub(crate) deferred_moveto: bool,
    pub(crate) moveto_target: i64,
    /// Outcome of the last `Found`/`NotFound`/`NotExists` probe.
    pub(crate) seek_result: Option<Ordering>,
    pub(crate) use_random_rowid: bool,
    pub(crate) is_ordered: bool,
    pub(crate) direction: Direction,
    pub(crate) cache: RecordHeaderCache,
    pub(crate) key_info: Option<Arc<KeyInfo>>,
    pub(crate) seq_count: i64,
    pub(crate) n_field: usize,
    /// Positioned by `Rewind`/`Last` on a table; `Next`/`Prev` count as
    /// full-scan steps.
    pub(crate) full_scan: bool,
}

impl fmt::Debug for VdbeCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VdbeCursor")
            .field("kind", &self.kind.name())
            .field("db", &self.kind.db())
            .field("null_row", &self.null_row)
            .field("deferred_moveto", &self.deferred_moveto)
            .field("moveto_target", &self.moveto_target)
            .field("seek_result", &self.seek_result)
            .field("direction", &self.direction)
            .field("is_ordered", &self.is_ordered)
            .field("n_field", &self.n_field)
            .finish_non_exhaustive()
    }
}

impl VdbeCursor {
    fn new(kind: CursorKind, key_info: Option<Arc<KeyInfo>>, n_field: usize) -> Self {
        Self {
            kind,
            null_row: false,
            deferred_moveto: false,
            moveto_target: 0,
            seek_result: None,
            use_random_rowid: false,
            is_ordered: true,
            direction: Direction::Any,
            cache: RecordHeaderCache::new(),
            key_info,
            seq_count: 0,
            n_field,
            full_scan: false,
        }
    }

    pub(crate) fn btree_mut(&mut self) -> Result<&mut dyn BtreeCursor> {
        match &mut self.kind {
            CursorKind::BTree { cursor, .. } | CursorKind::Ephemeral { cursor, .. } => {
                Ok(cursor.as_mut())
            }
            other => Err(SqlvmError::internal(format!(
                "{} cursor has no b-tree",
                other.name()
            ))),
        }
    }

    fn is_index(&self) -> bool {
        match &self.kind {
            CursorKind::BTree { cursor, .. } | CursorKind::Ephemeral { cursor, .. } => {
                cursor.is_index()
            }
            _ => false,
        }
    }

    /// Forget the position-dependent state after the cursor moved.
    pub(crate) fn invalidate(&mut self) {
        self.deferred_moveto = false;
        self.cache.invalidate();
    }

    /// Perform a pending `Seek`. A target that is no longer present means
    /// the table changed under the program.
    pub(crate) fn resolve_deferred(&mut self) -> Result<()> {
        if !self.deferred_moveto {
            return Ok(());
        }
        let target = self.moveto_target;
        let res = self.btree_mut()?.table_move_to(target)?;
        if res != Some(Ordering::Equal) {
            return Err(SqlvmError::corrupt(format!(
                "deferred seek to rowid {target} found no row"
            )));
        }
        self.deferred_moveto = false;
        self.null_row = false;
        self.cache.invalidate();
        Ok(())
    }
}

/// The open cursor at slot `i`.
pub(crate) fn slot(cursors: &mut [Option<VdbeCursor>], i: i32) -> Result<&mut VdbeCursor> {
    usize::try_from(i)
        .ok()
        .and_then(|idx| cursors.get_mut(idx))
        .and_then(Option::as_mut)
        .ok_or_else(|| SqlvmError::internal(format!("cursor {i} is not open")))
}

fn key_info_operand(op: &VdbeOp) -> Option<Arc<KeyInfo>> {
    match &op.p4 {
        P4::KeyInfo(k) => Some(Arc::clone(k)),
        _ => None,
    }
}

/// Contents of a record register with any zero tail written out.
fn record_bytes(mem: &Mem, max_length: usize) -> Result<Vec<u8>> {
    let mut copy = mem.shallow_copy();
    copy.expand_zero_blob(max_length)?;
    Ok(copy.bytes().map(<[u8]>::to_vec).unwrap_or_default())
}

fn to_root(v: i64) -> Result<u32> {
    u32::try_from(v).map_err(|_| SqlvmError::internal(format!("bad root page {v}")))
}

impl Vdbe {
    pub(crate) fn dispatch_cursor(
        &mut self,
        conn: &mut Connection,
        op: &VdbeOp,
    ) -> Result<ControlTransfer> {
        match op.opcode {
            Opcode::OpenRead | Opcode::OpenWrite => self.op_open(conn, op),
            Opcode::OpenEphemeral | Opcode::OpenAutoindex => self.op_open_ephemeral(op),
            Opcode::OpenPseudo => {
                let n_field = to_usize(op.p3, "field count")?;
                let pseudo = VdbeCursor::new(CursorKind::Pseudo { reg: op.p2 }, None, n_field);
                self.install_cursor(op.p1, pseudo)
            }
            Opcode::SorterOpen => {
                let key_info = key_info_operand(op).ok_or_else(|| bad_p4(op))?;
                let sorter = Sorter::new(Arc::clone(&key_info));
                let n_field = to_usize(op.p2, "field count")?;
                self.install_cursor(
                    op.p1,
                    VdbeCursor::new(CursorKind::Sorter(sorter), Some(key_info), n_field),
                )
            }
            Opcode::Close => {
                let idx = to_usize(op.p1, "cursor")?;
                if let Some(entry) = self.cursors.get_mut(idx) {
                    if entry.take().is_some() {
                        debug!(cursor = op.p1, "cursor closed");
                    }
                }
                Ok(ControlTransfer::Continue)
            }
            Opcode::Rewind | Opcode::Last => self.op_rewind(op),
            Opcode::Sort | Opcode::SorterSort => {
                self.stats.sorts += 1;
                self.op_rewind(op)
            }
            Opcode::Next
            | Opcode::Prev
            | Opcode::NextIfOpen
            | Opcode::PrevIfOpen
            | Opcode::SorterNext => self.op_next(conn, op),
            Opcode::SeekLT | Opcode::SeekLE | Opcode::SeekGE | Opcode::SeekGT => self.op_seek(op),
            Opcode::Seek => {
                let target = self.reg(op.p2)?.integer_value();
                let cur = slot(&mut self.cursors, op.p1)?;
                cur.moveto_target = target;
                cur.deferred_moveto = true;
                cur.null_row = false;
                cur.cache.invalidate();
                Ok(ControlTransfer::Continue)
            }
            Opcode::Found | Opcode::NotFound | Opcode::NoConflict => self.op_found(conn, op),
            Opcode::NotExists => {
                let rowid = self.reg(op.p3)?.integer_value();
                let cur = slot(&mut self.cursors, op.p1)?;
                let res = cur.btree_mut()?.table_move_to(rowid)?;
                let found = res == Some(Ordering::Equal);
                cur.invalidate();
                cur.seek_result = res;
                cur.null_row = !found;
                cur.moveto_target = rowid;
                jump_if(!found, op.p2)
            }
            Opcode::Column => self.op_column(conn, op),
            Opcode::MakeRecord => self.op_make_record(conn, op),
            Opcode::Count => {
                let n = slot(&mut self.cursors, op.p1)?.btree_mut()?.count()?;
                self.set_reg(op.p2, Mem::Integer(i64::try_from(n).unwrap_or(i64::MAX)))?;
                Ok(ControlTransfer::Continue)
            }
            Opcode::Rowid => {
                let cur = slot(&mut self.cursors, op.p1)?;
                let value = if cur.deferred_moveto {
                    Mem::Integer(cur.moveto_target)
                } else if cur.null_row {
                    Mem::Null
                } else {
                    Mem::Integer(cur.btree_mut()?.rowid()?)
                };
                self.set_reg(op.p2, value)?;
                Ok(ControlTransfer::Continue)
            }
            Opcode::IdxRowid => {
                let cur = slot(&mut self.cursors, op.p1)?;
                cur.resolve_deferred()?;
                let value = if cur.null_row {
                    Mem::Null
                } else {
                    let tree = cur.btree_mut()?;
                    if tree.eof() {
                        Mem::Null
                    } else {
                        Mem::Integer(tree.rowid()?)
                    }
                };
                self.set_reg(op.p2, value)?;
                Ok(ControlTransfer::Continue)
            }
            Opcode::RowKey | Opcode::RowData => self.op_row_data(conn, op),
            Opcode::NullRow => {
                let cur = slot(&mut self.cursors, op.p1)?;
                cur.null_row = true;
                cur.invalidate();
                Ok(ControlTransfer::Continue)
            }
            Opcode::IfNullRow => {
                if !slot(&mut self.cursors, op.p1)?.null_row {
                    return Ok(ControlTransfer::Continue);
                }
                self.set_reg(op.p3, Mem::Null)?;
                jump(op.p2)
            }
            Opcode::Sequence => {
                let cur = slot(&mut self.cursors, op.p1)?;
                let seq = cur.seq_count;
                cur.seq_count += 1;
                self.set_reg(op.p2, Mem::Integer(seq))?;
                Ok(ControlTransfer::Continue)
            }
            Opcode::Insert | Opcode::InsertInt => self.op_insert(conn, op),
            Opcode::Delete => {
                let cur = slot(&mut self.cursors, op.p1)?;
                cur.resolve_deferred()?;
                cur.btree_mut()?.delete()?;
                cur.cache.invalidate();
                if op.p5 & P5_NCHANGE != 0 {
                    self.n_change += 1;
                }
                self.ctx.bump_cache();
                Ok(ControlTransfer::Continue)
            }
            Opcode::IdxInsert => {
                let key = record_bytes(self.reg(op.p2)?, conn.config().max_length)?;
                let cur = slot(&mut self.cursors, op.p1)?;
                cur.btree_mut()?.insert_key(&key)?;
                cur.invalidate();
                self.ctx.bump_cache();
                Ok(ControlTransfer::Continue)
            }
            Opcode::IdxDelete => {
                let values = self.reg_values(op.p2, to_usize(op.p3, "key width")?)?;
                let key = UnpackedRecord::new(values);
                let cur = slot(&mut self.cursors, op.p1)?;
                let tree = cur.btree_mut()?;
                if tree.index_move_to(&key)? == Some(Ordering::Equal) {
                    tree.delete()?;
                }
                cur.invalidate();
                self.ctx.bump_cache();
                Ok(ControlTransfer::Continue)
            }
            Opcode::IdxLE | Opcode::IdxGT | Opcode::IdxLT | Opcode::IdxGE => self.op_idx_compare(op),
            Opcode::SorterInsert => {
                let record = record_bytes(self.reg(op.p2)?, conn.config().max_length)?;
                match &mut slot(&mut self.cursors, op.p1)?.kind {
                    CursorKind::Sorter(sorter) => sorter.insert(record),
                    _ => return Err(SqlvmError::internal("SorterInsert on a non-sorter cursor")),
                }
                Ok(ControlTransfer::Continue)
            }
            Opcode::SorterData => {
                let row = match &slot(&mut self.cursors, op.p1)?.kind {
                    CursorKind::Sorter(sorter) => sorter.current().cloned(),
                    _ => return Err(SqlvmError::internal("SorterData on a non-sorter cursor")),
                };
                let row = row.ok_or_else(|| SqlvmError::internal("sorter has no current row"))?;
                self.set_reg(op.p2, Mem::static_blob(&row))?;
                if op.p3 > 0 {
                    slot(&mut self.cursors, op.p3)?.cache.invalidate();
                }
                Ok(ControlTransfer::Continue)
            }
            other => Err(SqlvmError::internal(format!("{other} is not a cursor opcode"))),
        }
    }

    fn install_cursor(&mut self, i: i32, cursor: VdbeCursor) -> Result<ControlTransfer> {
        let idx = to_usize(i, "cursor")?;
        let entry = self
            .cursors
            .get_mut(idx)
            .ok_or_else(|| SqlvmError::internal(format!("cursor {i} out of range")))?;
        debug!(cursor = i, kind = cursor.kind.name(), "cursor opened");
        *entry = Some(cursor);
        Ok(ControlTransfer::Continue)
    }

    // ── Open ────────────────────────────────────────────────────────────

    fn op_open(&mut self, conn: &mut Connection, op: &VdbeOp) -> Result<ControlTransfer> {
        let root = if op.p5 & P5_P2ISREG != 0 {
            to_root(self.reg(op.p2)?.integer_value())?
        } else {
            to_root(i64::from(op.p2))?
        };
        let db = to_usize(op.p3, "database index")?;
        let write = op.opcode == Opcode::OpenWrite;
        let key_info = key_info_operand(op);
        let n_field = match &op.p4 {
            P4::KeyInfo(k) => k.len(),
            P4::Int(n) => usize::try_from(*n).unwrap_or(0),
            _ => 0,
        };
        let cursor = conn
            .db_mut(db)?
            .btree
            .open_cursor(root, write, key_info.clone())?;
        debug!(db, root, write, "b-tree cursor");
        self.install_cursor(
            op.p1,
            VdbeCursor::new(CursorKind::BTree { cursor, db }, key_info, n_field),
        )
    }

    fn op_open_ephemeral(&mut self, op: &VdbeOp) -> Result<ControlTransfer> {
        let key_info = key_info_operand(op);
        let mut handle = MemStore::new().connect();
        handle.begin_trans(true)?;
        let kind = if key_info.is_some() {
            TreeKind::Index
        } else {
            TreeKind::Table
        };
        let root = handle.create_table(kind)?;
        let cursor = handle.open_cursor(root, true, key_info.clone())?;
        let n_field = to_usize(op.p2, "field count")?;
        let mut vc = VdbeCursor::new(
            CursorKind::Ephemeral {
                cursor,
                _handle: handle,
            },
            key_info,
            n_field,
        );
        vc.is_ordered = op.opcode == Opcode::OpenEphemeral;
        self.install_cursor(op.p1, vc)
    }

    // ── Positioning ─────────────────────────────────────────────────────

    fn op_rewind(&mut self, op: &VdbeOp) -> Result<ControlTransfer> {
        let last = op.opcode == Opcode::Last;
        let cur = slot(&mut self.cursors, op.p1)?;
        let has_row = match &mut cur.kind {
            CursorKind::BTree { cursor, .. } | CursorKind::Ephemeral { cursor, .. } => {
                cur.full_scan = !cursor.is_index();
                if last {
                    cursor.last()?
                } else {
                    cursor.first()?
                }
            }
            CursorKind::Sorter(sorter) => sorter.sort()?,
            CursorKind::Pseudo { .. } => {
                return Err(SqlvmError::internal("cannot rewind a pseudo cursor"));
            }
        };
        cur.invalidate();
        cur.null_row = !has_row;
        cur.direction = if last {
            Direction::Backward
        } else {
            Direction::Forward
        };
        jump_if(!has_row, op.p2)
    }

    fn op_next(&mut self, conn: &mut Connection, op: &VdbeOp) -> Result<ControlTransfer> {
        self.poll_interrupt(conn)?;
        let if_open = matches!(op.opcode, Opcode::NextIfOpen | Opcode::PrevIfOpen);
        let open = usize::try_from(op.p1)
            .ok()
            .and_then(|i| self.cursors.get(i))
            .is_some_and(Option::is_some);
        if if_open && !open {
            return Ok(ControlTransfer::Continue);
        }
        let forward = !matches!(op.opcode, Opcode::Prev | Opcode::PrevIfOpen);
        let cur = slot(&mut self.cursors, op.p1)?;
        debug_assert!(
            matches!(
                (cur.direction, forward),
                (Direction::Any, _) | (Direction::Forward, true) | (Direction::Backward, false)
            ),
            "{} on a cursor positioned for the other direction",
            op.opcode
        );
        let advanced = match &mut cur.kind {
            CursorKind::BTree { cursor, .. } | CursorKind::Ephemeral { cursor, .. } => {
                if forward {
                    cursor.next()?
                } else {
                    cursor.prev()?
                }
            }
            CursorKind::Sorter(sorter) => sorter.next(),
            CursorKind::Pseudo { .. } => {
                return Err(SqlvmError::internal("cannot step a pseudo cursor"));
            }
        };
        cur.invalidate();
        cur.null_row = !advanced;
        if !advanced {
            return Ok(ControlTransfer::Continue);
        }
        if cur.full_scan {
            self.stats.full_scan_steps += 1;
        }
        jump(op.p2)
    }

    /// `SeekLT/LE/GE/GT`.
    fn op_seek(&mut self, op: &VdbeOp) -> Result<ControlTransfer> {
        let mut opcode = op.opcode;
        let is_index = slot(&mut self.cursors, op.p1)?.is_index();
        let forward = matches!(opcode, Opcode::SeekGE | Opcode::SeekGT);

        let res = if is_index {
            let n = op.p4.as_int().map_or(Ok(1), |n| to_usize(n, "key width"))?;
            let values = self.reg_values(op.p3, n)?;
            let default_rc = if matches!(opcode, Opcode::SeekGT | Opcode::SeekLE) {
                Ordering::Less
            } else {
                Ordering::Greater
            };
            let key = UnpackedRecord::new(values).with_default_rc(default_rc);
            slot(&mut self.cursors, op.p1)?.btree_mut()?.index_move_to(&key)?
        } else {
            let mut key = self.reg(op.p3)?.shallow_copy();
            if matches!(key, Mem::Text(_)) {
                key.apply_affinity(Affinity::Numeric);
            }
            let rowid = match key {
                Mem::Integer(i) => i,
                Mem::Real(r) => {
                    let i = real_to_i64(r);
                    #[allow(clippy::cast_precision_loss)]
                    let approx = i as f64;
                    if r < approx {
                        opcode = match opcode {
                            Opcode::SeekGT => Opcode::SeekGE,
                            Opcode::SeekLE => Opcode::SeekLT,
                            other => other,
                        };
                    } else if r > approx {
                        opcode = match opcode {
                            Opcode::SeekLT => Opcode::SeekLE,
                            Opcode::SeekGE => Opcode::SeekGT,
                            other => other,
                        };
                    }
                    i
                }
                _ => return jump(op.p2),
            };
            slot(&mut self.cursors, op.p1)?.btree_mut()?.table_move_to(rowid)?
        };

        let cur = slot(&mut self.cursors, op.p1)?;
        let tree = cur.btree_mut()?;
        let found = match res {
            None => false,
            Some(ord) if forward => {
                if ord.is_lt() || (ord.is_eq() && opcode == Opcode::SeekGT) {
                    tree.next()?
                } else {
                    !tree.eof()
                }
            }
            Some(ord) => {
                if ord.is_gt() || (ord.is_eq() && opcode == Opcode::SeekLT) {
                    tree.prev()?
                } else {
                    !tree.eof()
                }
            }
        };
        cur.invalidate();
        cur.null_row = !found;
        cur.direction = if forward {
            Direction::Forward
        } else {
            Direction::Backward
        };
        jump_if(!found, op.p2)
    }

    /// `Found`, `NotFound` and `NoConflict`.
    fn op_found(&mut self, conn: &Connection, op: &VdbeOp) -> Result<ControlTransfer> {
        let values = match op.p4.as_int() {
            Some(n) if n > 0 => self.reg_values(op.p3, to_usize(n, "key width")?)?,
            _ => decode_record(&record_bytes(self.reg(op.p3)?, conn.config().max_length)?)?,
        };
        let key = UnpackedRecord::new(values);
        if op.opcode == Opcode::NoConflict && key.has_null() {
            return jump(op.p2);
        }
        let cur = slot(&mut self.cursors, op.p1)?;
        let res = cur.btree_mut()?.index_move_to(&key)?;
        let found = res == Some(Ordering::Equal);
        cur.invalidate();
        cur.seek_result = res;
        cur.null_row = !found;
        cur.direction = Direction::Frozen;
        let jump_when_found = op.opcode == Opcode::Found;
        jump_if(found == jump_when_found, op.p2)
    }

    /// `IdxLE/IdxGT/IdxLT/IdxGE`: compare the index entry under the cursor
    /// with the key in P3.. and jump when the named relation holds.
    fn op_idx_compare(&mut self, op: &VdbeOp) -> Result<ControlTransfer> {
        let n = op.p4.as_int().map_or(Ok(1), |n| to_usize(n, "key width"))?;
        let values = self.reg_values(op.p3, n)?;
        let default_rc = if matches!(op.opcode, Opcode::IdxLE | Opcode::IdxGT) {
            Ordering::Less
        } else {
            Ordering::Equal
        };
        let key = UnpackedRecord::new(values).with_default_rc(default_rc);
        let cur = slot(&mut self.cursors, op.p1)?;
        let key_info = cur.key_info.clone().unwrap_or_default();
        let entry = cur.btree_mut()?.payload()?;
        let res = match key.compare_to_record(&entry, &key_info)? {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        };
        let res = if matches!(op.opcode, Opcode::IdxLE | Opcode::IdxLT) {
            -res
        } else {
            res + 1
        };
        jump_if(res > 0, op.p2)
    }

    // ── Reading rows ────────────────────────────────────────────────────

    fn op_column(&mut self, conn: &Connection, op: &VdbeOp) -> Result<ControlTransfer> {
        let max_length = conn.config().max_length;
        let column = to_usize(op.p2, "column")?;
        let ctr = self.ctx.cache_ctr;
        let cur = slot(&mut self.cursors, op.p1)?;
        cur.resolve_deferred()?;

        let value = if cur.null_row {
            Mem::Null
        } else {
            let is_pseudo = matches!(cur.kind, CursorKind::Pseudo { .. });
            let loaded = if !is_pseudo && cur.cache.is_current(ctr) {
                true
            } else {
                let payload = match &mut cur.kind {
                    CursorKind::BTree { cursor, .. } | CursorKind::Ephemeral { cursor, .. } => {
                        if cursor.eof() {
                            None
                        } else {
                            Some(cursor.payload()?)
                        }
                    }
                    CursorKind::Sorter(sorter) => sorter.current().cloned(),
                    CursorKind::Pseudo { reg } => {
                        let mem = usize::try_from(*reg)
                            .ok()
                            .and_then(|r| self.regs.get(r))
                            .ok_or_else(|| SqlvmError::internal("pseudo cursor register"))?;
                        if mem.is_null() {
                            None
                        } else {
                            Some(Arc::from(record_bytes(mem, max_length)?))
                        }
                    }
                };
                match payload {
                    Some(payload) => {
                        let generation = self.ctx.next_generation();
                        cur.cache.load(payload, ctr, generation, max_length)?;
                        true
                    }
                    None => false,
                }
            };
            let decoded = if loaded { cur.cache.column(column)? } else { None };
            match decoded {
                Some(mem) => mem,
                None => match &op.p4 {
                    P4::Value(default) => Mem::from(default),
                    _ => Mem::Null,
                },
            }
        };
        self.set_reg(op.p3, value)?;
        Ok(ControlTransfer::Continue)
    }

    fn op_row_data(&mut self, conn: &Connection, op: &VdbeOp) -> Result<ControlTransfer> {
        let max_length = conn.config().max_length;
        let cur = slot(&mut self.cursors, op.p1)?;
        cur.resolve_deferred()?;
        let payload: Option<Arc<[u8]>> = if cur.null_row {
            None
        } else {
            match &cur.kind {
                CursorKind::BTree { cursor, .. } | CursorKind::Ephemeral { cursor, .. } => {
                    if cursor.eof() {
                        None
                    } else {
                        Some(cursor.payload()?)
                    }
                }
                CursorKind::Sorter(sorter) => sorter.current().cloned(),
                CursorKind::Pseudo { .. } => {
                    return Err(SqlvmError::internal("pseudo cursors have no row data"));
                }
            }
        };
        let value = match payload {
            Some(bytes) if bytes.len() > max_length => return Err(SqlvmError::TooBig),
            Some(bytes) => Mem::static_blob(&bytes),
            None => Mem::Null,
        };
        self.set_reg(op.p2, value)?;
        Ok(ControlTransfer::Continue)
    }

    fn op_make_record(&mut self, conn: &Connection, op: &VdbeOp) -> Result<ControlTransfer> {
        let first = self.reg_idx(op.p1)?;
        let n = to_usize(op.p2, "field count")?;
        let cells = self
            .regs
            .get_mut(first..first + n)
            .ok_or_else(|| SqlvmError::internal("record past the register file"))?;
        if let P4::Affinity(codes) = &op.p4 {
            for (cell, aff) in cells.iter_mut().zip(Affinity::parse_list(codes)) {
                cell.apply_affinity(aff);
            }
        }
        let record = encode_cells(cells);
        if record.total_len() > conn.config().max_length {
            return Err(SqlvmError::TooBig);
        }
        let value = Mem::Blob {
            buf: Buf::from(record.bytes),
            zero_tail: record.zero_tail,
        };
        self.set_reg(op.p3, value)?;
        Ok(ControlTransfer::Continue)
    }

    // ── Writing rows ────────────────────────────────────────────────────

    fn op_insert(&mut self, conn: &Connection, op: &VdbeOp) -> Result<ControlTransfer> {
        let data = match self.reg(op.p2)? {
            m if m.is_null() => Vec::new(),
            m => record_bytes(m, conn.config().max_length)?,
        };
        let rowid = if op.opcode == Opcode::InsertInt {
            i64::from(op.p3)
        } else {
            self.reg(op.p3)?.integer_value()
        };
        let cur = slot(&mut self.cursors, op.p1)?;
        cur.btree_mut()?.insert_row(rowid, &data)?;
        cur.invalidate();
        cur.null_row = false;
        if op.p5 & P5_NCHANGE != 0 {
            self.n_change += 1;
        }
        if op.p5 & P5_LASTROWID != 0 {
            self.ctx.last_rowid = rowid;
        }
        self.ctx.bump_cache();
        Ok(ControlTransfer::Continue)
    }
}
