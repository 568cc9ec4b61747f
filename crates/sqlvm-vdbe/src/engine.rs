//! The interpreter.
//!
//! A [`Vdbe`] executes one [`VdbeProgram`] against a [`Connection`]. Each
//! opcode handler reads and writes the register file and cursor table and
//! returns a [`ControlTransfer`]; the trampoline in [`Vdbe::step`] owns the
//! program counter and sends every `Err` to the halt routine, so there is a
//! single place where a failed program unwinds.
//!
//! Handlers for cursor, transaction and halt opcodes live in `cursor.rs`,
//! `txn.rs` and `halt.rs`; this file holds the loop, the register helpers
//! and the value-level opcodes.

use std::cmp::Ordering;
use std::sync::Arc;

use smallvec::SmallVec;
use sqlvm_error::{ErrorCode, Result, SqlvmError};
use sqlvm_func::FunctionContext;
use sqlvm_types::numeric::{real_as_exact_i64, real_to_i64, Numeric};
use sqlvm_types::opcode::{
    ErrorAction, P5_AFF_MASK, P5_JUMPIFNULL, P5_NULLEQ, P5_P2ISREG, P5_PERMUTE, P5_STOREP2,
};
use sqlvm_types::{
    compare, AggCell, Affinity, Buf, CollSeq, CoroutineSlot, KeyInfo, Mem, Opcode, RowSet,
    SqlValue, VdbeOp, VdbeProgram, P4,
};
use tracing::{debug, trace, warn};

use crate::connection::Connection;
use crate::context::{ControlTransfer, ExecContext, InterruptHandle, Outcome};
use crate::cursor::VdbeCursor;
use crate::frame::{register_file_bytes, FrameStack, VdbeFrame};

/// What one call to [`Vdbe::step`] produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// A result row is available through [`Vdbe::row`].
    Row,
    /// The program ran to completion.
    Done,
    /// A lock is held elsewhere; step again to retry.
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Ready,
    Running,
    Halted,
}

/// Counters for one run of a program.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatementStats {
    pub vm_steps: u64,
    /// `Next`/`Prev` steps on table cursors positioned by `Rewind`/`Last`.
    pub full_scan_steps: u64,
    pub sorts: u64,
}

/// A prepared program plus its run state.
pub struct Vdbe {
    root_program: Arc<VdbeProgram>,
    /// The program being executed (a sub-program while inside a frame).
    pub(crate) program: Arc<VdbeProgram>,
    pub(crate) regs: Vec<Mem>,
    pub(crate) cursors: Vec<Option<VdbeCursor>>,
    pub(crate) once_flags: Vec<bool>,
    pub(crate) frames: FrameStack,
    pub(crate) ctx: ExecContext,
    pc: usize,
    state: RunState,
    bindings: Vec<SqlValue>,
    row: Option<Vec<SqlValue>>,
    changes_row_pending: bool,
    error_message: Option<String>,
    rc: ErrorCode,
    pub(crate) error_action: ErrorAction,
    pub(crate) expired: bool,
    /// Statement savepoint number, 0 when none is open.
    pub(crate) i_statement: u32,
    /// Databases on which the statement savepoint was opened.
    pub(crate) stmt_dbs: SmallVec<[usize; 2]>,
    /// Deferred-constraint count when the statement savepoint opened.
    pub(crate) stmt_deferred_cons: i64,
    pub(crate) n_change: i64,
    /// Immediate foreign-key violations outstanding in this statement.
    pub(crate) n_fk_constraint: i64,
    pub(crate) reset_schema_on_fault: Option<usize>,
    pub(crate) is_reader: bool,
    pub(crate) is_writer: bool,
    produced_rows: bool,
    pub(crate) stats: StatementStats,
}

impl std::fmt::Debug for Vdbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vdbe")
            .field("pc", &self.pc)
            .field("state", &self.state)
            .field("ops", &self.program.len())
            .field("registers", &self.regs.len())
            .field("frame_depth", &self.frames.depth())
            .field("rc", &self.rc)
            .finish_non_exhaustive()
    }
}

impl Vdbe {
    pub fn new(program: VdbeProgram) -> Self {
        Self::from_arc(Arc::new(program))
    }

    pub fn from_arc(program: Arc<VdbeProgram>) -> Self {
        let (is_reader, is_writer) = transaction_kinds(&program);
        let mut vdbe = Self {
            root_program: Arc::clone(&program),
            regs: Vec::new(),
            cursors: Vec::new(),
            once_flags: Vec::new(),
            frames: FrameStack::new(0, 0),
            ctx: ExecContext::new(InterruptHandle::new()),
            pc: 0,
            state: RunState::Ready,
            bindings: Vec::new(),
            row: None,
            changes_row_pending: false,
            error_message: None,
            rc: ErrorCode::Ok,
            error_action: ErrorAction::Abort,
            expired: false,
            i_statement: 0,
            stmt_dbs: SmallVec::new(),
            stmt_deferred_cons: 0,
            n_change: 0,
            n_fk_constraint: 0,
            reset_schema_on_fault: None,
            is_reader,
            is_writer,
            produced_rows: false,
            stats: StatementStats::default(),
            program,
        };
        vdbe.init_state();
        vdbe
    }

    fn init_state(&mut self) {
        self.program = Arc::clone(&self.root_program);
        self.regs = fresh_registers(&self.program);
        self.cursors = fresh_cursors(&self.program);
        self.once_flags = vec![false; self.program.len()];
        self.pc = 0;
        self.row = None;
        self.changes_row_pending = false;
    }

    // ── Caller API ──────────────────────────────────────────────────────

    /// Bind parameter `idx` (1-based) for `Variable`.
    pub fn bind(&mut self, idx: usize, value: SqlValue) -> Result<()> {
        if idx == 0 {
            return Err(SqlvmError::Misuse("parameter indexes start at 1".to_owned()));
        }
        if self.state == RunState::Running {
            return Err(SqlvmError::Misuse(
                "cannot bind while the program is running".to_owned(),
            ));
        }
        if self.bindings.len() < idx {
            self.bindings.resize(idx, SqlValue::Null);
        }
        self.bindings[idx - 1] = value;
        Ok(())
    }

    pub fn clear_bindings(&mut self) {
        self.bindings.clear();
    }

    /// The current result row, valid until the next `step`.
    pub fn row(&self) -> Option<&[SqlValue]> {
        self.row.as_deref()
    }

    pub fn column(&self, idx: usize) -> Option<&SqlValue> {
        self.row.as_ref().and_then(|r| r.get(idx))
    }

    pub fn column_count(&self) -> usize {
        self.row.as_ref().map_or(0, Vec::len)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn error_code(&self) -> ErrorCode {
        self.rc
    }

    /// Whether the program was compiled against a schema that has since
    /// changed and must be rebuilt.
    pub fn is_expired(&self) -> bool {
        self.expired
    }

    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }

    pub fn program(&self) -> &VdbeProgram {
        &self.root_program
    }

    pub fn stats(&self) -> StatementStats {
        self.stats
    }

    /// Run until the next row, completion, `Busy` or a fault.
    pub fn step(&mut self, conn: &mut Connection) -> Result<StepResult> {
        match self.state {
            RunState::Halted if self.changes_row_pending => {
                self.changes_row_pending = false;
                self.row = None;
                return Ok(StepResult::Done);
            }
            RunState::Halted => {
                return Err(SqlvmError::Misuse(
                    "program has halted; reset it before stepping again".to_owned(),
                ));
            }
            RunState::Ready => self.start(conn),
            RunState::Running => {}
        }
        self.row = None;
        let trace_ops = conn.config().vdbe_trace;
        loop {
            let program = Arc::clone(&self.program);
            let pc = self.pc;
            self.ctx.n_vm_step += 1;
            let result = match program.get(pc) {
                Some(op) => {
                    if trace_ops {
                        trace!(
                            pc,
                            opcode = %op.opcode,
                            p1 = op.p1,
                            p2 = op.p2,
                            p3 = op.p3,
                            p5 = op.p5,
                            "dispatch"
                        );
                    }
                    self.dispatch(conn, pc, op)
                }
                // Running off the end is an implicit `Halt 0`.
                None => self.halt_ok(conn, 0),
            };
            match result {
                Ok(ControlTransfer::Continue) => self.pc = pc + 1,
                Ok(ControlTransfer::JumpTo(target)) => self.pc = target,
                Ok(ControlTransfer::Suspend(outcome)) => return self.suspend(conn, pc, outcome),
                Err(fault) => return Err(self.halt_with_fault(conn, pc, fault)),
            }
        }
    }

    /// Return to the ready state. A running program is halted first, which
    /// commits in autocommit mode just as running to completion would.
    pub fn reset(&mut self, conn: &mut Connection) {
        if self.state == RunState::Running {
            self.unwind_frames();
            match self.halt_routine(conn, None) {
                Outcome::Failed(err) => self.record_error(&err),
                // The commit could not run; abandon the transaction instead.
                Outcome::Busy => {
                    if let Outcome::Failed(err) = self.halt_routine(conn, Some(SqlvmError::Busy)) {
                        warn!(%err, "commit blocked at reset; transaction rolled back");
                    }
                }
                Outcome::Done | Outcome::Row => {}
            }
        }
        self.init_state();
        self.frames = FrameStack::new(0, 0);
        self.state = RunState::Ready;
        self.error_message = None;
        self.rc = ErrorCode::Ok;
    }

    fn start(&mut self, conn: &mut Connection) {
        self.state = RunState::Running;
        if conn.n_vdbe_active == 0 {
            conn.interrupt_handle().clear();
        }
        conn.n_vdbe_active += 1;
        if self.is_writer {
            conn.n_vdbe_write += 1;
        }
        if self.is_reader {
            conn.n_vdbe_read += 1;
        }
        self.ctx = ExecContext::new(conn.interrupt_handle());
        self.ctx.last_rowid = conn.last_insert_rowid();
        if conn.progress.is_some() {
            self.ctx.arm_progress(conn.progress_ops);
        }
        let config = conn.config();
        self.frames = FrameStack::new(config.max_frame_depth, config.frame_memory_budget);
        self.n_change = 0;
        self.n_fk_constraint = 0;
        self.error_action = ErrorAction::Abort;
        self.error_message = None;
        self.rc = ErrorCode::Ok;
        self.produced_rows = false;
        self.stats = StatementStats::default();
        debug!(
            ops = self.program.len(),
            registers = self.regs.len(),
            reader = self.is_reader,
            writer = self.is_writer,
            "program started"
        );
    }

    fn suspend(&mut self, conn: &Connection, pc: usize, outcome: Outcome) -> Result<StepResult> {
        match outcome {
            Outcome::Row => {
                self.pc = pc + 1;
                self.produced_rows = true;
                Ok(StepResult::Row)
            }
            Outcome::Busy => {
                self.pc = pc;
                Ok(StepResult::Busy)
            }
            Outcome::Done => {
                if conn.config().count_changes && self.is_writer && !self.produced_rows {
                    self.row = Some(vec![SqlValue::Integer(self.n_change)]);
                    self.changes_row_pending = true;
                    return Ok(StepResult::Row);
                }
                Ok(StepResult::Done)
            }
            Outcome::Failed(err) => Err(err),
        }
    }

    pub(crate) fn mark_halted(&mut self) {
        self.state = RunState::Halted;
    }

    pub(crate) fn record_error(&mut self, err: &SqlvmError) {
        self.rc = err.error_code();
        self.error_message = Some(err.to_string());
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    #[allow(clippy::too_many_lines)]
    fn dispatch(
        &mut self,
        conn: &mut Connection,
        pc: usize,
        op: &VdbeOp,
    ) -> Result<ControlTransfer> {
        match op.opcode {
            // ── Control Flow ────────────────────────────────────────────
            Opcode::Init => {
                if op.p2 > 0 {
                    jump(op.p2)
                } else {
                    Ok(ControlTransfer::Continue)
                }
            }
            Opcode::Goto => {
                self.poll_interrupt(conn)?;
                jump(op.p2)
            }
            Opcode::Gosub => {
                self.set_reg(op.p1, Mem::Integer(to_i64(pc)))?;
                jump(op.p2)
            }
            Opcode::Return => {
                let reg = self.reg_mut(op.p1)?;
                let Mem::Integer(addr) = *reg else {
                    return Err(SqlvmError::internal(format!(
                        "Return through register {} that holds no address",
                        op.p1
                    )));
                };
                *reg = Mem::Undefined;
                let addr = usize::try_from(addr)
                    .map_err(|_| SqlvmError::internal("negative return address"))?;
                Ok(ControlTransfer::JumpTo(addr + 1))
            }
            Opcode::InitCoroutine => {
                let entry = to_usize(op.p3, "coroutine entry")?;
                self.set_reg(op.p1, Mem::Coroutine(CoroutineSlot { resume_at: entry }))?;
                if op.p2 != 0 {
                    jump(op.p2)
                } else {
                    Ok(ControlTransfer::Continue)
                }
            }
            Opcode::Yield => {
                let Mem::Coroutine(slot) = self.reg_mut(op.p1)? else {
                    return Err(no_coroutine(op.p1));
                };
                let dest = slot.resume_at;
                slot.resume_at = pc + 1;
                Ok(ControlTransfer::JumpTo(dest))
            }
            Opcode::EndCoroutine => self.op_end_coroutine(op),
            Opcode::Halt => self.op_halt(conn, op),
            Opcode::HaltIfNull => {
                if self.reg(op.p3)?.is_null() {
                    self.op_halt(conn, op)
                } else {
                    Ok(ControlTransfer::Continue)
                }
            }
            Opcode::Once => {
                let flag = self
                    .once_flags
                    .get_mut(pc)
                    .ok_or_else(|| SqlvmError::internal("once flag out of range"))?;
                if *flag {
                    jump(op.p2)
                } else {
                    *flag = true;
                    Ok(ControlTransfer::Continue)
                }
            }
            Opcode::If | Opcode::IfNot => {
                let taken = match self.reg(op.p1)?.truth() {
                    None => op.p3 != 0,
                    Some(t) => t == (op.opcode == Opcode::If),
                };
                jump_if(taken, op.p2)
            }
            Opcode::IsNull => jump_if(self.reg(op.p1)?.is_null(), op.p2),
            Opcode::NotNull => jump_if(!self.reg(op.p1)?.is_null(), op.p2),
            Opcode::IfPos => {
                let reg = self.reg_mut(op.p1)?;
                let v = reg.integer_value();
                if v > 0 {
                    *reg = Mem::Integer(v.wrapping_sub(i64::from(op.p3)));
                    jump(op.p2)
                } else {
                    Ok(ControlTransfer::Continue)
                }
            }
            Opcode::IfZero => {
                let reg = self.reg_mut(op.p1)?;
                let v = reg.integer_value().wrapping_add(i64::from(op.p3));
                *reg = Mem::Integer(v);
                jump_if(v == 0, op.p2)
            }
            Opcode::IfNeg => jump_if(self.reg(op.p1)?.integer_value() < 0, op.p2),
            Opcode::MustBeInt => {
                let reg = self.reg_mut(op.p1)?;
                reg.apply_affinity(Affinity::Numeric);
                if let Mem::Real(r) = *reg {
                    if let Some(i) = real_as_exact_i64(r) {
                        *reg = Mem::Integer(i);
                    }
                }
                if matches!(reg, Mem::Integer(_)) {
                    Ok(ControlTransfer::Continue)
                } else if op.p2 == 0 {
                    Err(SqlvmError::TypeMismatch {
                        expected: "integer".to_owned(),
                        actual: reg.to_value().typeof_str().to_owned(),
                    })
                } else {
                    jump(op.p2)
                }
            }
            Opcode::Jump => match self.ctx.i_compare {
                Ordering::Less => jump(op.p1),
                Ordering::Equal => jump(op.p2),
                Ordering::Greater => jump(op.p3),
            },
            Opcode::Program => self.op_program(pc, op),
            Opcode::Param => self.op_param(op),
            Opcode::Noop | Opcode::Explain => Ok(ControlTransfer::Continue),

            // ── Constants & Values ──────────────────────────────────────
            Opcode::Integer => {
                self.set_reg(op.p2, Mem::Integer(i64::from(op.p1)))?;
                Ok(ControlTransfer::Continue)
            }
            Opcode::Int64 => {
                let P4::Int64(v) = op.p4 else {
                    return Err(bad_p4(op));
                };
                self.set_reg(op.p2, Mem::Integer(v))?;
                Ok(ControlTransfer::Continue)
            }
            Opcode::Real => {
                let P4::Real(v) = op.p4 else {
                    return Err(bad_p4(op));
                };
                self.set_reg(op.p2, if v.is_nan() { Mem::Null } else { Mem::Real(v) })?;
                Ok(ControlTransfer::Continue)
            }
            Opcode::String8 | Opcode::String => {
                let P4::Text(text) = &op.p4 else {
                    return Err(bad_p4(op));
                };
                check_length(text.len(), conn)?;
                self.set_reg(op.p2, Mem::static_text(text))?;
                Ok(ControlTransfer::Continue)
            }
            Opcode::Blob => {
                let P4::Blob(bytes) = &op.p4 else {
                    return Err(bad_p4(op));
                };
                check_length(bytes.len(), conn)?;
                self.set_reg(op.p2, Mem::static_blob(bytes))?;
                Ok(ControlTransfer::Continue)
            }
            Opcode::Null => {
                let last = op.p3.max(op.p2);
                for r in op.p2..=last {
                    self.set_reg(r, Mem::Null)?;
                }
                Ok(ControlTransfer::Continue)
            }
            Opcode::SoftNull => {
                self.set_reg(op.p1, Mem::Null)?;
                Ok(ControlTransfer::Continue)
            }
            Opcode::Variable => {
                let idx = to_usize(op.p1, "parameter index")?;
                let value = idx
                    .checked_sub(1)
                    .and_then(|i| self.bindings.get(i))
                    .map_or(Mem::Null, Mem::from);
                if value.too_big(conn.config().max_length) {
                    return Err(SqlvmError::TooBig);
                }
                self.set_reg(op.p2, value)?;
                Ok(ControlTransfer::Continue)
            }

            // ── Register Operations ─────────────────────────────────────
            Opcode::Move => {
                for i in 0..op.p3 {
                    let src = self.reg_idx(op.p1 + i)?;
                    let value = std::mem::take(&mut self.regs[src]);
                    self.set_reg(op.p2 + i, value)?;
                }
                Ok(ControlTransfer::Continue)
            }
            Opcode::Copy => {
                for i in 0..=op.p3 {
                    let value = self.reg(op.p1 + i)?.deep_copy();
                    self.set_reg(op.p2 + i, value)?;
                }
                Ok(ControlTransfer::Continue)
            }
            Opcode::SCopy => {
                let value = self.reg(op.p1)?.shallow_copy();
                self.set_reg(op.p2, value)?;
                Ok(ControlTransfer::Continue)
            }
            Opcode::IntCopy => {
                let value = self.reg(op.p1)?.integer_value();
                self.set_reg(op.p2, Mem::Integer(value))?;
                Ok(ControlTransfer::Continue)
            }
            Opcode::ResultRow => {
                self.poll_interrupt(conn)?;
                let first = self.reg_idx(op.p1)?;
                let n = to_usize(op.p2, "result width")?;
                let cells = self
                    .regs
                    .get_mut(first..first + n)
                    .ok_or_else(|| SqlvmError::internal("result row past the register file"))?;
                let mut row = Vec::with_capacity(n);
                for cell in cells {
                    cell.materialize();
                    row.push(cell.to_value());
                }
                self.row = Some(row);
                Ok(ControlTransfer::Suspend(Outcome::Row))
            }

            // ── Arithmetic & Bitwise ────────────────────────────────────
            Opcode::Add | Opcode::Subtract | Opcode::Multiply | Opcode::Divide | Opcode::Remainder => {
                let result = sql_arith(op.opcode, self.reg(op.p2)?, self.reg(op.p1)?);
                self.set_reg(op.p3, result)?;
                Ok(ControlTransfer::Continue)
            }
            Opcode::Concat => {
                let result = sql_concat(self.reg(op.p2)?, self.reg(op.p1)?, conn.config().max_length)?;
                self.set_reg(op.p3, result)?;
                Ok(ControlTransfer::Continue)
            }
            Opcode::BitAnd | Opcode::BitOr | Opcode::ShiftLeft | Opcode::ShiftRight => {
                let (a, b) = (self.reg(op.p1)?, self.reg(op.p2)?);
                let result = if a.is_null() || b.is_null() {
                    Mem::Null
                } else {
                    let (a, b) = (a.integer_value(), b.integer_value());
                    Mem::Integer(match op.opcode {
                        Opcode::BitAnd => a & b,
                        Opcode::BitOr => a | b,
                        Opcode::ShiftLeft => sql_shift_left(b, a),
                        _ => sql_shift_right(b, a),
                    })
                };
                self.set_reg(op.p3, result)?;
                Ok(ControlTransfer::Continue)
            }
            Opcode::BitNot => {
                let src = self.reg(op.p1)?;
                let result = if src.is_null() {
                    Mem::Null
                } else {
                    Mem::Integer(!src.integer_value())
                };
                self.set_reg(op.p2, result)?;
                Ok(ControlTransfer::Continue)
            }
            Opcode::Not => {
                let result = match self.reg(op.p1)?.truth() {
                    None => Mem::Null,
                    Some(t) => Mem::Integer(i64::from(!t)),
                };
                self.set_reg(op.p2, result)?;
                Ok(ControlTransfer::Continue)
            }
            Opcode::And | Opcode::Or => {
                let (a, b) = (self.reg(op.p1)?.truth(), self.reg(op.p2)?.truth());
                let result = if op.opcode == Opcode::And {
                    sql_and(a, b)
                } else {
                    sql_or(a, b)
                };
                self.set_reg(op.p3, result.map_or(Mem::Null, |t| Mem::Integer(i64::from(t))))?;
                Ok(ControlTransfer::Continue)
            }
            Opcode::AddImm => {
                let reg = self.reg_mut(op.p1)?;
                reg.integerify();
                if let Mem::Integer(v) = reg {
                    *v = v.wrapping_add(i64::from(op.p2));
                }
                Ok(ControlTransfer::Continue)
            }
            Opcode::Cast => {
                let target = affinity_operand(op.p2)?;
                self.reg_mut(op.p1)?.cast(target);
                Ok(ControlTransfer::Continue)
            }
            Opcode::RealAffinity => {
                let reg = self.reg_mut(op.p1)?;
                if matches!(reg, Mem::Integer(_)) {
                    reg.realify();
                }
                Ok(ControlTransfer::Continue)
            }
            Opcode::Affinity => {
                let P4::Affinity(codes) = &op.p4 else {
                    return Err(bad_p4(op));
                };
                for (i, aff) in (0..op.p2).zip(Affinity::parse_list(codes)) {
                    self.reg_mut(op.p1 + i)?.apply_affinity(aff);
                }
                Ok(ControlTransfer::Continue)
            }

            // ── Comparison ──────────────────────────────────────────────
            Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                self.op_comparison(op)
            }
            Opcode::Compare => self.op_compare(op),
            Opcode::Permutation => {
                let P4::IntArray(perm) = &op.p4 else {
                    return Err(bad_p4(op));
                };
                self.ctx.permutation = Some(Arc::clone(perm));
                Ok(ControlTransfer::Continue)
            }
            Opcode::CollSeq => {
                if op.p1 > 0 {
                    self.set_reg(op.p1, Mem::Integer(0))?;
                }
                Ok(ControlTransfer::Continue)
            }

            // ── Functions ───────────────────────────────────────────────
            Opcode::Function => self.op_function(conn, pc, op),
            Opcode::AggStep => self.op_agg_step(conn, op),
            Opcode::AggFinal => self.op_agg_final(conn, op),

            // ── Boolean Index ───────────────────────────────────────────
            Opcode::RowSetAdd => {
                let value = self.reg(op.p2)?.integer_value();
                self.row_set(op.p1)?.insert(value);
                Ok(ControlTransfer::Continue)
            }
            Opcode::RowSetRead => {
                self.poll_interrupt(conn)?;
                let idx = self.reg_idx(op.p1)?;
                let next = match &mut self.regs[idx] {
                    Mem::RowSet(set) => set.pop_smallest(),
                    _ => None,
                };
                match next {
                    Some(v) => {
                        self.set_reg(op.p3, Mem::Integer(v))?;
                        Ok(ControlTransfer::Continue)
                    }
                    None => {
                        self.regs[idx] = Mem::Null;
                        jump(op.p2)
                    }
                }
            }
            Opcode::RowSetTest => {
                let batch = op.p4.as_int().ok_or_else(|| bad_p4(op))?;
                let value = self.reg(op.p3)?.integer_value();
                let set = self.row_set(op.p1)?;
                if batch != 0 && set.test(batch, value) {
                    return jump(op.p2);
                }
                if batch >= 0 {
                    set.insert(value);
                }
                Ok(ControlTransfer::Continue)
            }

            // ── Everything that touches storage ─────────────────────────
            Opcode::OpenRead
            | Opcode::OpenWrite
            | Opcode::OpenEphemeral
            | Opcode::OpenAutoindex
            | Opcode::OpenPseudo
            | Opcode::SorterOpen
            | Opcode::Close
            | Opcode::Rewind
            | Opcode::Last
            | Opcode::Next
            | Opcode::Prev
            | Opcode::NextIfOpen
            | Opcode::PrevIfOpen
            | Opcode::SeekLT
            | Opcode::SeekLE
            | Opcode::SeekGE
            | Opcode::SeekGT
            | Opcode::Seek
            | Opcode::Found
            | Opcode::NotFound
            | Opcode::NoConflict
            | Opcode::NotExists
            | Opcode::Column
            | Opcode::MakeRecord
            | Opcode::Count
            | Opcode::Rowid
            | Opcode::RowKey
            | Opcode::RowData
            | Opcode::NullRow
            | Opcode::IfNullRow
            | Opcode::Sequence
            | Opcode::Insert
            | Opcode::InsertInt
            | Opcode::Delete
            | Opcode::IdxInsert
            | Opcode::IdxDelete
            | Opcode::IdxRowid
            | Opcode::IdxLE
            | Opcode::IdxGT
            | Opcode::IdxLT
            | Opcode::IdxGE
            | Opcode::SorterInsert
            | Opcode::SorterSort
            | Opcode::Sort
            | Opcode::SorterData
            | Opcode::SorterNext => self.dispatch_cursor(conn, op),

            Opcode::NewRowid => self.op_new_rowid(op),

            Opcode::Transaction
            | Opcode::AutoCommit
            | Opcode::ReadCookie
            | Opcode::SetCookie
            | Opcode::CreateTable
            | Opcode::CreateIndex
            | Opcode::Clear
            | Opcode::Destroy
            | Opcode::DropTable
            | Opcode::DropIndex
            | Opcode::ParseSchema
            | Opcode::TableLock
            | Opcode::FkCounter
            | Opcode::FkIfZero => self.dispatch_txn(conn, op),
        }
    }

    // ── Register helpers ────────────────────────────────────────────────

    pub(crate) fn reg_idx(&self, r: i32) -> Result<usize> {
        usize::try_from(r)
            .ok()
            .filter(|&i| i < self.regs.len())
            .ok_or_else(|| SqlvmError::internal(format!("register {r} out of range")))
    }

    pub(crate) fn reg(&self, r: i32) -> Result<&Mem> {
        let idx = self.reg_idx(r)?;
        Ok(&self.regs[idx])
    }

    pub(crate) fn reg_mut(&mut self, r: i32) -> Result<&mut Mem> {
        let idx = self.reg_idx(r)?;
        Ok(&mut self.regs[idx])
    }

    pub(crate) fn set_reg(&mut self, r: i32, value: Mem) -> Result<()> {
        *self.reg_mut(r)? = value;
        Ok(())
    }

    /// Owned copies of `n` registers starting at `first`.
    pub(crate) fn reg_values(&self, first: i32, n: usize) -> Result<Vec<SqlValue>> {
        let start = self.reg_idx(first)?;
        self.regs
            .get(start..start + n)
            .map(|cells| cells.iter().map(Mem::to_value).collect())
            .ok_or_else(|| SqlvmError::internal("register range past the register file"))
    }

    fn row_set(&mut self, r: i32) -> Result<&mut RowSet> {
        let reg = self.reg_mut(r)?;
        if !matches!(reg, Mem::RowSet(_)) {
            *reg = Mem::RowSet(Box::default());
        }
        match reg {
            Mem::RowSet(set) => Ok(set),
            _ => Err(SqlvmError::internal("row set register")),
        }
    }

    /// Interrupt and progress check at loop back-edges.
    pub(crate) fn poll_interrupt(&mut self, conn: &mut Connection) -> Result<()> {
        if self.ctx.interrupt.is_interrupted() {
            return Err(SqlvmError::Interrupted);
        }
        if self.ctx.n_vm_step >= self.ctx.progress_limit {
            self.ctx.arm_progress(conn.progress_ops);
            if let Some(handler) = conn.progress.as_mut() {
                if handler() != 0 {
                    self.ctx.progress_limit = u64::MAX;
                    warn!(steps = self.ctx.n_vm_step, "progress handler requested interrupt");
                    return Err(SqlvmError::Interrupted);
                }
            }
        }
        Ok(())
    }

    // ── Coroutines & frames ─────────────────────────────────────────────

    fn op_end_coroutine(&mut self, op: &VdbeOp) -> Result<ControlTransfer> {
        let idx = self.reg_idx(op.p1)?;
        let Mem::Coroutine(slot) = &self.regs[idx] else {
            return Err(no_coroutine(op.p1));
        };
        let caller = slot
            .resume_at
            .checked_sub(1)
            .and_then(|addr| self.program.get(addr))
            .filter(|caller| caller.opcode == Opcode::Yield)
            .ok_or_else(|| SqlvmError::internal("EndCoroutine without a pending Yield"))?;
        let target = caller.p2;
        self.regs[idx] = Mem::Undefined;
        jump(target)
    }

    fn op_program(&mut self, pc: usize, op: &VdbeOp) -> Result<ControlTransfer> {
        let P4::SubProgram(sub) = &op.p4 else {
            return Err(bad_p4(op));
        };
        let cost = std::mem::size_of::<VdbeFrame>() + register_file_bytes(&self.regs);
        self.frames.check_capacity(cost)?;
        let frame = VdbeFrame {
            program: std::mem::replace(&mut self.program, Arc::clone(sub)),
            saved_pc: pc,
            registers: std::mem::replace(&mut self.regs, fresh_registers(sub)),
            cursors: std::mem::replace(&mut self.cursors, fresh_cursors(sub)),
            once_flags: std::mem::replace(&mut self.once_flags, vec![false; sub.len()]),
            n_change: self.n_change,
            last_rowid: self.ctx.last_rowid,
            param_base: to_usize(op.p1, "parameter base")?,
            ignore_target: to_usize(op.p2, "ignore target")?,
        };
        self.frames.push_frame(frame)?;
        debug!(depth = self.frames.depth(), ops = sub.len(), "entered sub-program");
        Ok(ControlTransfer::JumpTo(0))
    }

    fn op_param(&mut self, op: &VdbeOp) -> Result<ControlTransfer> {
        let frame = self
            .frames
            .top()
            .ok_or_else(|| SqlvmError::internal("Param outside a sub-program"))?;
        let offset = to_usize(op.p1, "parameter offset")?;
        let value = frame
            .registers
            .get(frame.param_base + offset)
            .map(Mem::deep_copy)
            .ok_or_else(|| SqlvmError::internal("Param past the caller's registers"))?;
        self.set_reg(op.p2, value)?;
        Ok(ControlTransfer::Continue)
    }

    /// Leave the innermost frame, resuming the caller after its `Program`
    /// (or at the `Program`'s P2 when `ignore` is set).
    pub(crate) fn pop_frame(&mut self, ignore: bool) -> Result<ControlTransfer> {
        let frame = self
            .frames
            .pop_frame()
            .ok_or_else(|| SqlvmError::internal("no frame to return to"))?;
        let target = if ignore {
            frame.ignore_target
        } else {
            frame.saved_pc + 1
        };
        self.restore_frame(frame);
        debug!(depth = self.frames.depth(), target, "left sub-program");
        Ok(ControlTransfer::JumpTo(target))
    }

    fn restore_frame(&mut self, frame: VdbeFrame) {
        self.program = frame.program;
        self.regs = frame.registers;
        self.cursors = frame.cursors;
        self.once_flags = frame.once_flags;
        self.n_change = frame.n_change;
        self.ctx.last_rowid = frame.last_rowid;
    }

    /// Drop every frame, restoring the top-level program's state.
    pub(crate) fn unwind_frames(&mut self) {
        if let Some(root) = self.frames.unwind_all() {
            self.restore_frame(root);
        }
    }

    // ── Comparison ──────────────────────────────────────────────────────

    fn op_comparison(&mut self, op: &VdbeOp) -> Result<ControlTransfer> {
        let (lhs, rhs) = (self.reg(op.p3)?, self.reg(op.p1)?);
        let res = if lhs.is_null() || rhs.is_null() {
            if op.p5 & P5_NULLEQ == 0 {
                if op.p5 & P5_STOREP2 != 0 {
                    self.set_reg(op.p2, Mem::Null)?;
                    return Ok(ControlTransfer::Continue);
                }
                return jump_if(op.p5 & P5_JUMPIFNULL != 0, op.p2);
            }
            match (lhs.is_null(), rhs.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Less,
                _ => Ordering::Greater,
            }
        } else {
            #[allow(clippy::cast_possible_truncation)]
            let affinity = Affinity::from_byte((op.p5 & P5_AFF_MASK) as u8);
            let coll = match &op.p4 {
                P4::Collation(c) => Some(c),
                _ => None,
            };
            compare_with_affinity(lhs, rhs, affinity, coll)
        };
        let holds = match op.opcode {
            Opcode::Eq => res.is_eq(),
            Opcode::Ne => res.is_ne(),
            Opcode::Lt => res.is_lt(),
            Opcode::Le => res.is_le(),
            Opcode::Gt => res.is_gt(),
            _ => res.is_ge(),
        };
        if op.p5 & P5_STOREP2 != 0 {
            self.set_reg(op.p2, Mem::Integer(i64::from(holds)))?;
            return Ok(ControlTransfer::Continue);
        }
        jump_if(holds, op.p2)
    }

    fn op_compare(&mut self, op: &VdbeOp) -> Result<ControlTransfer> {
        let default_info;
        let info = match &op.p4 {
            P4::KeyInfo(k) => k.as_ref(),
            _ => {
                default_info = KeyInfo::default();
                &default_info
            }
        };
        let permutation = if op.p5 & P5_PERMUTE != 0 {
            self.ctx.permutation.take()
        } else {
            None
        };
        let n = to_usize(op.p3, "compare width")?;
        let mut res = Ordering::Equal;
        for i in 0..n {
            let col = match &permutation {
                Some(p) => p
                    .get(i)
                    .and_then(|&c| i32::try_from(c).ok())
                    .ok_or_else(|| SqlvmError::internal("permutation shorter than compare width"))?,
                None => to_i32(i),
            };
            let a = self.reg(op.p1 + col)?;
            let b = self.reg(op.p2 + col)?;
            res = info.compare_column(i, a.as_value_ref(), b.as_value_ref());
            if res.is_ne() {
                break;
            }
        }
        self.ctx.i_compare = res;
        Ok(ControlTransfer::Continue)
    }

    // ── Functions ───────────────────────────────────────────────────────

    /// Collation set by a `CollSeq` immediately before `pc`.
    fn preceding_collation(&self, pc: usize) -> Option<CollSeq> {
        let prev = self.program.get(pc.checked_sub(1)?)?;
        match (&prev.opcode, &prev.p4) {
            (Opcode::CollSeq, P4::Collation(c)) => Some(c.clone()),
            _ => None,
        }
    }

    fn op_function(&mut self, conn: &Connection, pc: usize, op: &VdbeOp) -> Result<ControlTransfer> {
        let P4::FuncName(name) = &op.p4 else {
            return Err(bad_p4(op));
        };
        let argc = i32::from(op.p5);
        let func = conn
            .functions()
            .find_scalar(name, argc)
            .ok_or_else(|| SqlvmError::Generic(format!("no such function: {name}")))?;
        let args = self.function_args(op.p2, op.p5)?;
        let max_length = conn.config().max_length;
        let coll = self.preceding_collation(pc);
        let mut fctx = FunctionContext::new(&args, coll.as_ref(), max_length);
        func.invoke(&mut fctx)?;
        let result = Mem::from(fctx.finish()?);
        if result.too_big(max_length) {
            return Err(SqlvmError::TooBig);
        }
        self.set_reg(op.p3, result)?;
        Ok(ControlTransfer::Continue)
    }

    fn function_args(&self, first: i32, argc: u16) -> Result<SmallVec<[SqlValue; 4]>> {
        (0..i32::from(argc))
            .map(|i| self.reg(first + i).map(Mem::to_value))
            .collect()
    }

    fn op_agg_step(&mut self, conn: &Connection, op: &VdbeOp) -> Result<ControlTransfer> {
        let P4::FuncName(name) = &op.p4 else {
            return Err(bad_p4(op));
        };
        let func = conn
            .functions()
            .find_aggregate(name, i32::from(op.p5))
            .ok_or_else(|| SqlvmError::Generic(format!("no such function: {name}")))?;
        let args = self.function_args(op.p2, op.p5)?;
        let acc = self.reg_mut(op.p3)?;
        if !matches!(acc, Mem::Agg(_)) {
            *acc = Mem::Agg(AggCell(func.initial_state()));
        }
        let Mem::Agg(AggCell(state)) = acc else {
            return Err(SqlvmError::internal("aggregate register"));
        };
        func.step(state, &args)?;
        Ok(ControlTransfer::Continue)
    }

    fn op_agg_final(&mut self, conn: &Connection, op: &VdbeOp) -> Result<ControlTransfer> {
        let P4::FuncName(name) = &op.p4 else {
            return Err(bad_p4(op));
        };
        let func = conn
            .functions()
            .find_aggregate(name, op.p2)
            .ok_or_else(|| SqlvmError::Generic(format!("no such function: {name}")))?;
        let acc = self.reg_mut(op.p1)?;
        let state = match std::mem::take(acc) {
            Mem::Agg(AggCell(state)) => state,
            _ => func.initial_state(),
        };
        let result = Mem::from(func.finalize(state)?);
        if result.too_big(conn.config().max_length) {
            return Err(SqlvmError::TooBig);
        }
        *self.reg_mut(op.p1)? = result;
        Ok(ControlTransfer::Continue)
    }
}

// ── Program shape ───────────────────────────────────────────────────────────

/// Whether the program opens read and/or write transactions.
fn transaction_kinds(program: &VdbeProgram) -> (bool, bool) {
    program
        .ops()
        .iter()
        .filter(|op| op.opcode == Opcode::Transaction)
        .fold((false, false), |(_, w), op| (true, w || op.p2 != 0))
}

fn fresh_registers(program: &VdbeProgram) -> Vec<Mem> {
    let declared = usize::try_from(program.register_count()).unwrap_or(0);
    let named = program.ops().iter().map(register_extent).max().unwrap_or(0);
    let len = declared.max(named) + 1;
    std::iter::repeat_with(Mem::default).take(len).collect()
}

fn fresh_cursors(program: &VdbeProgram) -> Vec<Option<VdbeCursor>> {
    let len = usize::try_from(program.cursor_count()).unwrap_or(0);
    std::iter::repeat_with(|| None).take(len).collect()
}

/// Highest register an instruction can touch.
fn register_extent(op: &VdbeOp) -> usize {
    let n = |v: i32| usize::try_from(v).unwrap_or(0);
    let (p1, p2, p3) = (n(op.p1), n(op.p2), n(op.p3));
    let key_len = op.p4.as_int().map_or(1, n);
    match op.opcode {
        Opcode::Gosub
        | Opcode::Return
        | Opcode::InitCoroutine
        | Opcode::EndCoroutine
        | Opcode::Yield
        | Opcode::If
        | Opcode::IfNot
        | Opcode::IsNull
        | Opcode::NotNull
        | Opcode::IfPos
        | Opcode::IfZero
        | Opcode::IfNeg
        | Opcode::MustBeInt
        | Opcode::Program
        | Opcode::SoftNull
        | Opcode::AddImm
        | Opcode::Cast
        | Opcode::RealAffinity
        | Opcode::CollSeq
        | Opcode::AggFinal => p1,
        Opcode::HaltIfNull
        | Opcode::NotExists
        | Opcode::Column
        | Opcode::IfNullRow
        | Opcode::Clear => p3,
        Opcode::Param
        | Opcode::Integer
        | Opcode::Int64
        | Opcode::Real
        | Opcode::String8
        | Opcode::String
        | Opcode::Blob
        | Opcode::Variable
        | Opcode::Seek
        | Opcode::Count
        | Opcode::Rowid
        | Opcode::RowKey
        | Opcode::RowData
        | Opcode::Sequence
        | Opcode::InsertInt
        | Opcode::IdxInsert
        | Opcode::IdxRowid
        | Opcode::SorterInsert
        | Opcode::SorterData
        | Opcode::ReadCookie
        | Opcode::CreateTable
        | Opcode::CreateIndex
        | Opcode::Destroy
        | Opcode::OpenPseudo => p2,
        Opcode::OpenRead | Opcode::OpenWrite if op.p5 & P5_P2ISREG != 0 => p2,
        Opcode::Null | Opcode::NewRowid | Opcode::Insert => p2.max(p3),
        Opcode::Move => p1.max(p2) + p3,
        Opcode::Copy => p1.max(p2) + p3 + 1,
        Opcode::ResultRow | Opcode::Affinity => p1 + p2,
        Opcode::MakeRecord => (p1 + p2).max(p3),
        Opcode::SCopy | Opcode::IntCopy | Opcode::BitNot | Opcode::Not | Opcode::RowSetAdd => {
            p1.max(p2)
        }
        Opcode::Add
        | Opcode::Subtract
        | Opcode::Multiply
        | Opcode::Divide
        | Opcode::Remainder
        | Opcode::Concat
        | Opcode::BitAnd
        | Opcode::BitOr
        | Opcode::ShiftLeft
        | Opcode::ShiftRight
        | Opcode::And
        | Opcode::Or => p1.max(p2).max(p3),
        Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
            if op.p5 & P5_STOREP2 != 0 {
                p1.max(p2).max(p3)
            } else {
                p1.max(p3)
            }
        }
        Opcode::Compare => p1.max(p2) + p3,
        Opcode::Function | Opcode::AggStep => (p2 + usize::from(op.p5)).max(p3),
        Opcode::SeekLT
        | Opcode::SeekLE
        | Opcode::SeekGE
        | Opcode::SeekGT
        | Opcode::Found
        | Opcode::NotFound
        | Opcode::NoConflict
        | Opcode::IdxLE
        | Opcode::IdxGT
        | Opcode::IdxLT
        | Opcode::IdxGE => p3 + key_len,
        Opcode::IdxDelete => p2 + p3,
        Opcode::RowSetRead | Opcode::RowSetTest => p1.max(p3),
        _ => 0,
    }
}

// ── Operand helpers ─────────────────────────────────────────────────────────

pub(crate) fn jump(target: i32) -> Result<ControlTransfer> {
    to_usize(target, "jump target").map(ControlTransfer::JumpTo)
}

pub(crate) fn jump_if(taken: bool, target: i32) -> Result<ControlTransfer> {
    if taken {
        jump(target)
    } else {
        Ok(ControlTransfer::Continue)
    }
}

pub(crate) fn to_usize(v: i32, what: &str) -> Result<usize> {
    usize::try_from(v).map_err(|_| SqlvmError::internal(format!("negative {what}: {v}")))
}

fn to_i64(v: usize) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn to_i32(v: usize) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

pub(crate) fn bad_p4(op: &VdbeOp) -> SqlvmError {
    SqlvmError::internal(format!("{} has an unexpected P4 operand", op.opcode))
}

fn no_coroutine(reg: i32) -> SqlvmError {
    SqlvmError::internal(format!("register {reg} holds no coroutine"))
}

fn affinity_operand(code: i32) -> Result<Affinity> {
    u8::try_from(code)
        .ok()
        .and_then(Affinity::from_byte)
        .ok_or_else(|| SqlvmError::internal(format!("unknown affinity code {code}")))
}

pub(crate) fn check_length(len: usize, conn: &Connection) -> Result<()> {
    if len > conn.config().max_length {
        Err(SqlvmError::TooBig)
    } else {
        Ok(())
    }
}

// ── Comparison helpers ──────────────────────────────────────────────────────

/// Compare two non-NULL cells after the affinity conversions a comparison
/// opcode applies. The registers themselves are left untouched.
fn compare_with_affinity(
    lhs: &Mem,
    rhs: &Mem,
    affinity: Option<Affinity>,
    coll: Option<&CollSeq>,
) -> Ordering {
    let convert = |m: &Mem| -> Option<Mem> {
        match affinity {
            Some(a) if a.is_numeric() && matches!(m, Mem::Text(_)) => {
                let mut c = m.shallow_copy();
                c.apply_affinity(Affinity::Numeric);
                Some(c)
            }
            Some(Affinity::Text) if m.is_numeric() => {
                let mut c = m.shallow_copy();
                c.stringify();
                Some(c)
            }
            _ => None,
        }
    };
    let (l, r) = (convert(lhs), convert(rhs));
    compare::mem_compare(l.as_ref().unwrap_or(lhs), r.as_ref().unwrap_or(rhs), coll)
}

// ── Arithmetic helpers ──────────────────────────────────────────────────────

#[allow(clippy::cast_precision_loss)]
const fn numeric_f64(n: Numeric) -> f64 {
    match n {
        Numeric::Int(i) => i as f64,
        Numeric::Real(r) => r,
    }
}

/// `lhs (op) rhs` with NULL propagation. Integer overflow falls back to
/// real arithmetic; division by zero yields NULL.
#[allow(clippy::cast_precision_loss)]
fn sql_arith(opcode: Opcode, lhs: &Mem, rhs: &Mem) -> Mem {
    if lhs.is_null() || rhs.is_null() {
        return Mem::Null;
    }
    let (a, b) = (lhs.numeric_value(), rhs.numeric_value());
    if let (Numeric::Int(x), Numeric::Int(y)) = (a, b) {
        let exact = match opcode {
            Opcode::Add => x.checked_add(y),
            Opcode::Subtract => x.checked_sub(y),
            Opcode::Multiply => x.checked_mul(y),
            Opcode::Divide if y == 0 => return Mem::Null,
            Opcode::Divide => x.checked_div(y),
            Opcode::Remainder if y == 0 => return Mem::Null,
            _ => Some(if y == -1 { 0 } else { x % y }),
        };
        if let Some(v) = exact {
            return Mem::Integer(v);
        }
    }
    real_arith(opcode, numeric_f64(a), numeric_f64(b))
}

#[allow(clippy::cast_precision_loss)]
fn real_arith(opcode: Opcode, a: f64, b: f64) -> Mem {
    let r = match opcode {
        Opcode::Add => a + b,
        Opcode::Subtract => a - b,
        Opcode::Multiply => a * b,
        Opcode::Divide => {
            if b == 0.0 {
                return Mem::Null;
            }
            a / b
        }
        _ => {
            let ia = real_to_i64(a);
            let ib = match real_to_i64(b) {
                0 => return Mem::Null,
                -1 => 1,
                other => other,
            };
            (ia % ib) as f64
        }
    };
    if r.is_nan() {
        Mem::Null
    } else {
        Mem::Real(r)
    }
}

/// `lhs || rhs` as text.
fn sql_concat(lhs: &Mem, rhs: &Mem, max_length: usize) -> Result<Mem> {
    if lhs.is_null() || rhs.is_null() {
        return Ok(Mem::Null);
    }
    let text_of = |m: &Mem| -> Result<Vec<u8>> {
        let mut c = m.shallow_copy();
        c.stringify();
        c.expand_zero_blob(max_length)?;
        Ok(c.bytes().unwrap_or_default().to_vec())
    };
    let mut out = text_of(lhs)?;
    let tail = text_of(rhs)?;
    if out.len() + tail.len() > max_length {
        return Err(SqlvmError::TooBig);
    }
    out.extend_from_slice(&tail);
    Ok(Mem::Text(Buf::from(out)))
}

/// Shift left; a negative amount shifts right.
fn sql_shift_left(val: i64, amount: i64) -> i64 {
    if amount < 0 {
        return sql_shift_right(val, amount.saturating_neg());
    }
    if amount >= 64 {
        return 0;
    }
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    let shift = amount as u32;
    val << shift
}

/// Arithmetic shift right; a negative amount shifts left.
fn sql_shift_right(val: i64, amount: i64) -> i64 {
    if amount < 0 {
        return sql_shift_left(val, amount.saturating_neg());
    }
    if amount >= 64 {
        return if val < 0 { -1 } else { 0 };
    }
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    let shift = amount as u32;
    val >> shift
}

/// Three-valued AND.
fn sql_and(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(false), _) | (_, Some(false)) => Some(false),
        (Some(true), Some(true)) => Some(true),
        _ => None,
    }
}

/// Three-valued OR.
fn sql_or(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(true), _) | (_, Some(true)) => Some(true),
        (Some(false), Some(false)) => Some(false),
        _ => None,
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_overflow_falls_back_to_real() {
        let r = sql_arith(Opcode::Add, &Mem::Integer(i64::MAX), &Mem::Integer(1));
        assert!(matches!(r, Mem::Real(v) if v > 9.2e18));
        let r = sql_arith(Opcode::Divide, &Mem::Integer(i64::MIN), &Mem::Integer(-1));
        assert!(matches!(r, Mem::Real(_)));
    }

    #[test]
    fn test_division_by_zero_is_null() {
        assert!(sql_arith(Opcode::Divide, &Mem::Integer(1), &Mem::Integer(0)).is_null());
        assert!(sql_arith(Opcode::Remainder, &Mem::Integer(1), &Mem::Integer(0)).is_null());
        assert!(sql_arith(Opcode::Divide, &Mem::Real(1.0), &Mem::Real(0.0)).is_null());
    }

    #[test]
    fn test_remainder_minus_one() {
        let r = sql_arith(Opcode::Remainder, &Mem::Integer(i64::MIN), &Mem::Integer(-1));
        assert!(matches!(r, Mem::Integer(0)));
        let r = sql_arith(Opcode::Remainder, &Mem::Real(7.5), &Mem::Integer(2));
        assert!(matches!(r, Mem::Real(v) if (v - 1.0).abs() < f64::EPSILON));
    }

    #[test]
    fn test_text_operands_use_numeric_prefix() {
        let r = sql_arith(Opcode::Multiply, &Mem::text("3abc"), &Mem::Integer(4));
        assert!(matches!(r, Mem::Integer(12)));
    }

    #[test]
    fn test_shift_edges() {
        assert_eq!(sql_shift_left(1, 64), 0);
        assert_eq!(sql_shift_right(-8, 70), -1);
        assert_eq!(sql_shift_left(16, -2), 4);
        assert_eq!(sql_shift_right(1, -3), 8);
    }

    #[test]
    fn test_three_valued_logic() {
        assert_eq!(sql_and(None, Some(false)), Some(false));
        assert_eq!(sql_and(None, Some(true)), None);
        assert_eq!(sql_or(None, Some(true)), Some(true));
        assert_eq!(sql_or(Some(false), None), None);
    }

    #[test]
    fn test_concat_limit() {
        let r = sql_concat(&Mem::text("ab"), &Mem::Integer(7), 10).unwrap();
        assert_eq!(r.to_value(), SqlValue::from("ab7"));
        assert!(matches!(
            sql_concat(&Mem::text("abc"), &Mem::text("def"), 5),
            Err(SqlvmError::TooBig)
        ));
        assert!(sql_concat(&Mem::Null, &Mem::text("x"), 10).unwrap().is_null());
    }

    #[test]
    fn test_affinity_comparison_leaves_operands() {
        let text = Mem::text("10");
        let int = Mem::Integer(9);
        assert_eq!(
            compare_with_affinity(&text, &int, Some(Affinity::Numeric), None),
            Ordering::Greater
        );
        // Without affinity text sorts after every number.
        assert_eq!(compare_with_affinity(&int, &text, None, None), Ordering::Less);
        assert_eq!(
            compare_with_affinity(&Mem::Integer(10), &Mem::text("9"), Some(Affinity::Text), None),
            Ordering::Less
        );
        assert!(matches!(text, Mem::Text(_)));
    }

    #[test]
    fn test_register_extent_ignores_constant_operands() {
        let op = VdbeOp {
            opcode: Opcode::Integer,
            p1: 1_000_000,
            p2: 3,
            p3: 0,
            p4: P4::None,
            p5: 0,
        };
        assert_eq!(register_extent(&op), 3);
        let op = VdbeOp {
            opcode: Opcode::ResultRow,
            p1: 4,
            p2: 3,
            p3: 0,
            p4: P4::None,
            p5: 0,
        };
        assert_eq!(register_extent(&op), 7);
    }
}
