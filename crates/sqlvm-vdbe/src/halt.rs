//! Halting: the `Halt` opcodes, the single fault funnel and the routine
//! that settles transactions when a program stops.
//!
//! Whatever made the program stop (an explicit `Halt`, running off the end,
//! `AutoCommit`, or a fault in any handler) ends up in [`Vdbe::halt_routine`],
//! which decides between committing, releasing or rolling back the statement
//! savepoint, and rolling back the whole transaction.

use sqlvm_btree::SavepointOp;
use sqlvm_error::{ConstraintKind, Result, SqlvmError};
use sqlvm_types::opcode::ErrorAction;
use sqlvm_types::VdbeOp;
use tracing::{info, warn};

use crate::connection::Connection;
use crate::context::{ControlTransfer, Outcome};
use crate::engine::Vdbe;

fn foreign_key_failure() -> SqlvmError {
    SqlvmError::Constraint {
        kind: ConstraintKind::ForeignKey,
        detail: None,
    }
}

impl Vdbe {
    /// `Halt`/`HaltIfNull`. P1 is the result code, P2 the error action,
    /// P4 the message and P5 the constraint class.
    pub(crate) fn op_halt(&mut self, conn: &mut Connection, op: &VdbeOp) -> Result<ControlTransfer> {
        if op.p1 == 0 {
            return self.halt_ok(conn, op.p2);
        }
        self.error_action = ErrorAction::from_p2(op.p2);
        let message = op.p4.as_text();
        Err(SqlvmError::from_halt(
            op.p1,
            ConstraintKind::from_p5(op.p5),
            message.as_deref(),
        ))
    }

    /// Successful halt. Inside a sub-program this returns to the caller.
    pub(crate) fn halt_ok(&mut self, conn: &mut Connection, p2: i32) -> Result<ControlTransfer> {
        if !self.frames.is_empty() {
            return self.pop_frame(ErrorAction::from_p2(p2) == ErrorAction::Ignore);
        }
        Ok(ControlTransfer::Suspend(self.halt_routine(conn, None)))
    }

    /// Route a handler fault through the halt routine and return the error
    /// the caller sees.
    pub(crate) fn halt_with_fault(
        &mut self,
        conn: &mut Connection,
        pc: usize,
        fault: SqlvmError,
    ) -> SqlvmError {
        self.record_error(&fault);
        warn!(pc, code = ?fault.error_code(), "statement aborts at {pc}: {fault}");
        self.unwind_frames();
        match self.halt_routine(conn, Some(fault)) {
            Outcome::Failed(err) => err,
            _ => SqlvmError::internal("halt routine dropped the fault"),
        }
    }

    /// Close cursors and settle the transaction state for a stopping
    /// program.
    ///
    /// Returns `Busy` when the commit could not take its lock; nothing is
    /// torn down in that case and the program can be stepped again.
    pub(crate) fn halt_routine(
        &mut self,
        conn: &mut Connection,
        fault: Option<SqlvmError>,
    ) -> Outcome {
        for cursor in &mut self.cursors {
            *cursor = None;
        }
        let mut fault = fault;
        if fault.is_none() && self.n_fk_constraint > 0 {
            fault = Some(foreign_key_failure());
            self.error_action = ErrorAction::Abort;
        }

        let special = fault.as_ref().is_some_and(SqlvmError::forces_rollback);
        let mut stmt_op = None;
        if special {
            let read_only_interrupt =
                !self.is_writer && matches!(fault, Some(SqlvmError::Interrupted));
            if !read_only_interrupt {
                if matches!(fault, Some(SqlvmError::Full | SqlvmError::OutOfMemory))
                    && self.program.uses_stmt_journal()
                {
                    stmt_op = Some(SavepointOp::Rollback);
                } else {
                    self.rollback_everything(conn);
                }
            }
        }

        if conn.autocommit && conn.n_vdbe_write == usize::from(self.is_writer) {
            let may_commit =
                fault.is_none() || (self.error_action == ErrorAction::Fail && !special);
            if may_commit {
                let committed = if conn.n_deferred_cons > 0 {
                    Err(foreign_key_failure())
                } else {
                    conn.commit_all()
                };
                match committed {
                    Ok(()) => {}
                    Err(SqlvmError::Busy) if fault.is_none() => {
                        warn!("commit is blocked by another connection; step again to retry");
                        return Outcome::Busy;
                    }
                    Err(err) => {
                        fault = Some(err);
                        self.rollback_everything(conn);
                    }
                }
            } else {
                self.rollback_everything(conn);
            }
            conn.n_statement = 0;
            stmt_op = None;
        } else if stmt_op.is_none() {
            stmt_op = match (&fault, self.error_action) {
                (None, _) | (Some(_), ErrorAction::Fail) => Some(SavepointOp::Release),
                (Some(_), ErrorAction::Abort) => Some(SavepointOp::Rollback),
                _ => {
                    self.rollback_everything(conn);
                    None
                }
            };
        }

        if let Some(op) = stmt_op {
            if self.i_statement != 0 {
                if op == SavepointOp::Rollback {
                    conn.n_deferred_cons = self.stmt_deferred_cons;
                }
                if let Err(err) = conn.end_statement(&self.stmt_dbs, op, self.i_statement) {
                    if matches!(fault, None | Some(SqlvmError::Constraint { .. })) {
                        fault = Some(err);
                    }
                    self.rollback_everything(conn);
                }
            }
        }
        self.i_statement = 0;
        self.stmt_dbs.clear();

        let changes = if stmt_op == Some(SavepointOp::Rollback) {
            0
        } else {
            self.n_change
        };
        conn.record_changes(changes);
        conn.set_last_rowid(self.ctx.last_rowid);

        if fault.is_some() {
            if let Some(db) = self.reset_schema_on_fault.take() {
                if let Err(err) = conn.reset_schema(db) {
                    warn!(db, %err, "schema reset after fault failed");
                }
            }
        }

        conn.n_vdbe_active = conn.n_vdbe_active.saturating_sub(1);
        if self.is_writer {
            conn.n_vdbe_write = conn.n_vdbe_write.saturating_sub(1);
        }
        if self.is_reader {
            conn.n_vdbe_read = conn.n_vdbe_read.saturating_sub(1);
        }

        self.stats.vm_steps = self.ctx.n_vm_step;
        conn.stats.vm_steps += self.stats.vm_steps;
        conn.stats.full_scan_steps += self.stats.full_scan_steps;
        conn.stats.sorts += self.stats.sorts;
        self.mark_halted();

        let code = fault.as_ref().map(SqlvmError::error_code);
        info!(
            steps = self.stats.vm_steps,
            changes,
            rc = ?code,
            "program halted"
        );
        match fault {
            Some(err) => {
                self.record_error(&err);
                Outcome::Failed(err)
            }
            None => Outcome::Done,
        }
    }

    fn rollback_everything(&mut self, conn: &mut Connection) {
        conn.rollback_all();
        self.n_change = 0;
    }
}
