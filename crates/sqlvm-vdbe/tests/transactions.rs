mod common;

use std::io::Write as _;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use common::{
    auto_commit, begin_write, collect, connect, connect_with, create_table, emit_inserts,
    insert_program, insert_rows, int, run, scan,
};
use sqlvm_btree::{
    Btree, BtreeCursor, MemBtree, MemStore, MetaSlot, SavepointOp, TreeKind, TxnState,
};
use sqlvm_error::{ConstraintKind, ErrorCode, Result, SqlvmError};
use sqlvm_types::{KeyInfo, Opcode, ProgramBuilder, SqlValue, VdbeProgram, P4};
use sqlvm_vdbe::{Connection, StepResult, Vdbe, VdbeConfig, MAIN_DB};

/// Insert one row, then halt with the given operands.
fn insert_then_halt(root: i32, p1: i32, p2: i32, p4: P4, p5: u16, stmt_journal: bool) -> VdbeProgram {
    let mut b = ProgramBuilder::new();
    b.set_uses_stmt_journal(stmt_journal);
    begin_write(&mut b, root);
    emit_inserts(&mut b, &[(1, "doomed")]);
    b.emit_op(Opcode::Halt, p1, p2, 0, p4, p5);
    b.finish().unwrap()
}

// ── Halt and constraints ──

#[test]
fn test_constraint_halt_in_autocommit_discards_the_write() {
    let store = MemStore::new();
    let mut conn = connect(&store);
    let root = create_table(&mut conn);

    let mut vdbe = Vdbe::new(insert_then_halt(root, 19, 2, P4::text("t.a"), 2, false));
    let err = vdbe.step(&mut conn).unwrap_err();
    assert!(
        matches!(
            &err,
            SqlvmError::Constraint { kind: ConstraintKind::Unique, detail: Some(d) } if d == "t.a"
        ),
        "{err:?}"
    );
    assert_eq!(vdbe.error_code(), ErrorCode::Constraint);
    assert_eq!(vdbe.error_message(), Some("UNIQUE constraint failed: t.a"));
    assert_eq!(conn.changes(), 0);
    assert_eq!(conn.active_statements(), 0);
    assert!(scan(&mut conn, root).is_empty());

    // A halted program must be reset before it runs again.
    assert!(matches!(vdbe.step(&mut conn), Err(SqlvmError::Misuse(_))));
    vdbe.reset(&mut conn);
    assert_eq!(vdbe.error_code(), ErrorCode::Ok);
}

#[test]
fn test_halt_message_and_if_null() {
    let store = MemStore::new();
    let mut conn = connect(&store);

    let mut b = ProgramBuilder::new();
    b.emit_op(Opcode::Halt, 1, 2, 0, P4::text("boom"), 0);
    let err = run(&mut conn, b.finish().unwrap()).unwrap_err();
    assert_eq!(err.to_string(), "boom");
    assert_eq!(err.error_code(), ErrorCode::Error);

    let mut b = ProgramBuilder::new();
    let r = b.alloc_reg();
    b.op(Opcode::Null, 0, r, 0);
    b.emit_op(Opcode::HaltIfNull, 19, 2, r, P4::text("t.x"), 1);
    b.op(Opcode::Halt, 0, 0, 0);
    let err = run(&mut conn, b.finish().unwrap()).unwrap_err();
    assert_eq!(err.to_string(), "NOT NULL constraint failed: t.x");
}

#[test]
fn test_statement_rollback_keeps_the_transaction() {
    let store = MemStore::new();
    let mut conn = connect(&store);
    let root = create_table(&mut conn);

    auto_commit(&mut conn, false, false).unwrap();
    assert!(!conn.is_autocommit());

    let err = run(&mut conn, insert_then_halt(root, 19, 2, P4::None, 2, true)).unwrap_err();
    assert!(matches!(err, SqlvmError::Constraint { .. }));
    assert!(!conn.is_autocommit(), "ABORT only undoes the statement");
    assert_eq!(conn.changes(), 0);

    insert_rows(&mut conn, root, &[(2, "kept")]);
    auto_commit(&mut conn, true, false).unwrap();

    let rows = scan(&mut conn, root);
    assert_eq!(rows, vec![vec![int(1), int(2), SqlValue::from("kept")]]);
}

#[test]
fn test_fail_action_keeps_earlier_changes() {
    let store = MemStore::new();
    let mut conn = connect(&store);
    let root = create_table(&mut conn);

    auto_commit(&mut conn, false, false).unwrap();
    // FAIL releases the statement savepoint instead of rolling it back.
    let err = run(&mut conn, insert_then_halt(root, 19, 3, P4::None, 3, true)).unwrap_err();
    assert!(matches!(err, SqlvmError::Constraint { kind: ConstraintKind::Check, .. }));
    auto_commit(&mut conn, true, false).unwrap();
    assert_eq!(scan(&mut conn, root).len(), 1);
}

#[test]
fn test_rollback_action_ends_the_transaction() {
    let store = MemStore::new();
    let mut conn = connect(&store);
    let root = create_table(&mut conn);

    auto_commit(&mut conn, false, false).unwrap();
    insert_rows(&mut conn, root, &[(1, "first")]);
    let err = run(&mut conn, insert_then_halt(root, 19, 1, P4::None, 2, true)).unwrap_err();
    assert!(matches!(err, SqlvmError::Constraint { .. }));
    assert!(conn.is_autocommit());
    assert!(scan(&mut conn, root).is_empty());
}

#[test]
fn test_auto_commit_misuse() {
    let store = MemStore::new();
    let mut conn = connect(&store);
    let err = auto_commit(&mut conn, true, false).unwrap_err();
    assert_eq!(err.to_string(), "cannot commit - no transaction is active");
    let err = auto_commit(&mut conn, true, true).unwrap_err();
    assert_eq!(err.to_string(), "cannot rollback - no transaction is active");

    auto_commit(&mut conn, false, false).unwrap();
    let err = auto_commit(&mut conn, false, false).unwrap_err();
    assert_eq!(err.to_string(), "cannot start a transaction within a transaction");
    auto_commit(&mut conn, true, true).unwrap();
    assert!(conn.is_autocommit());
}

// ── Foreign-key counters ──

#[test]
fn test_immediate_fk_violation_fails_the_statement() {
    let store = MemStore::new();
    let mut conn = connect(&store);
    let root = create_table(&mut conn);

    let mut b = ProgramBuilder::new();
    begin_write(&mut b, root);
    emit_inserts(&mut b, &[(1, "child")]);
    b.op(Opcode::FkCounter, 0, 1, 0);
    b.op(Opcode::Halt, 0, 0, 0);
    let err = run(&mut conn, b.finish().unwrap()).unwrap_err();
    assert!(
        matches!(err, SqlvmError::Constraint { kind: ConstraintKind::ForeignKey, .. }),
        "{err:?}"
    );
    assert!(scan(&mut conn, root).is_empty());
}

#[test]
fn test_deferred_fk_violation_fails_the_commit() {
    let store = MemStore::new();
    let mut conn = connect(&store);
    let root = create_table(&mut conn);

    auto_commit(&mut conn, false, false).unwrap();
    let mut b = ProgramBuilder::new();
    let resolved = b.new_label();
    begin_write(&mut b, root);
    emit_inserts(&mut b, &[(1, "child")]);
    b.op(Opcode::FkCounter, 1, 1, 0);
    b.emit_jump(Opcode::FkIfZero, 1, resolved, 0, P4::None, 0);
    b.place_label(resolved);
    b.op(Opcode::Halt, 0, 0, 0);
    run(&mut conn, b.finish().unwrap()).unwrap();
    assert_eq!(conn.deferred_violations(), 1);

    let err = auto_commit(&mut conn, true, false).unwrap_err();
    assert!(matches!(err, SqlvmError::Constraint { kind: ConstraintKind::ForeignKey, .. }));
    assert!(conn.is_autocommit());
    assert_eq!(conn.deferred_violations(), 0);
    assert!(scan(&mut conn, root).is_empty());
}

// ── Locking ──

#[test]
fn test_second_writer_gets_busy_then_retries() {
    let store = MemStore::new();
    let mut a = connect(&store);
    let mut b = connect(&store);
    let root = create_table(&mut a);

    // A takes the write lock and parks on a result row.
    let mut holder = ProgramBuilder::new();
    let r = holder.alloc_reg();
    holder.op(Opcode::Transaction, 0, 1, 0);
    holder.op(Opcode::Integer, 1, r, 0);
    holder.op(Opcode::ResultRow, r, 1, 0);
    holder.op(Opcode::Halt, 0, 0, 0);
    let mut holder = Vdbe::new(holder.finish().unwrap());
    assert_eq!(holder.step(&mut a).unwrap(), StepResult::Row);

    let mut writer = Vdbe::new(insert_program(root, &[(5, "late")]));
    assert_eq!(writer.step(&mut b).unwrap(), StepResult::Busy);
    assert!(writer.is_running());
    assert_eq!(writer.step(&mut b).unwrap(), StepResult::Busy);

    assert_eq!(holder.step(&mut a).unwrap(), StepResult::Done);
    assert_eq!(writer.step(&mut b).unwrap(), StepResult::Done);
    assert_eq!(b.changes(), 1);
    assert_eq!(scan(&mut a, root).len(), 1);
}

#[test]
fn test_reset_mid_run_commits_and_releases_the_lock() {
    let store = MemStore::new();
    let mut a = connect(&store);
    let mut b = connect(&store);
    let root = create_table(&mut a);

    let mut program = ProgramBuilder::new();
    let r = program.alloc_reg();
    begin_write(&mut program, root);
    emit_inserts(&mut program, &[(1, "one")]);
    program.op(Opcode::Integer, 1, r, 0);
    program.op(Opcode::ResultRow, r, 1, 0);
    program.op(Opcode::Halt, 0, 0, 0);
    let mut vdbe = Vdbe::new(program.finish().unwrap());
    assert_eq!(vdbe.step(&mut a).unwrap(), StepResult::Row);
    assert_eq!(a.active_statements(), 1);

    vdbe.reset(&mut a);
    assert_eq!(a.active_statements(), 0);
    assert!(!vdbe.is_running());
    insert_rows(&mut b, root, &[(2, "two")]);
    assert_eq!(scan(&mut b, root).len(), 2);

    // A reset program starts over.
    assert_eq!(vdbe.step(&mut a).unwrap(), StepResult::Row);
    vdbe.reset(&mut a);
    assert_eq!(scan(&mut a, root).len(), 3);
}

/// A backend whose commit reports `Busy` while `blocked` is set.
struct BlockedCommit {
    inner: MemBtree,
    blocked: Arc<AtomicBool>,
}

impl Btree for BlockedCommit {
    fn begin_trans(&mut self, write: bool) -> Result<()> {
        self.inner.begin_trans(write)
    }
    fn begin_stmt(&mut self, n: u32) -> Result<()> {
        self.inner.begin_stmt(n)
    }
    fn savepoint(&mut self, op: SavepointOp, n: u32) -> Result<()> {
        self.inner.savepoint(op, n)
    }
    fn commit(&mut self) -> Result<()> {
        if self.blocked.load(Ordering::SeqCst) {
            return Err(SqlvmError::Busy);
        }
        self.inner.commit()
    }
    fn rollback(&mut self) -> Result<()> {
        self.inner.rollback()
    }
    fn txn_state(&self) -> TxnState {
        self.inner.txn_state()
    }
    fn get_meta(&self, slot: MetaSlot) -> Result<u32> {
        self.inner.get_meta(slot)
    }
    fn update_meta(&mut self, slot: MetaSlot, value: u32) -> Result<()> {
        self.inner.update_meta(slot, value)
    }
    fn open_cursor(
        &mut self,
        root: u32,
        write: bool,
        key_info: Option<Arc<KeyInfo>>,
    ) -> Result<Box<dyn BtreeCursor>> {
        self.inner.open_cursor(root, write, key_info)
    }
    fn create_table(&mut self, kind: TreeKind) -> Result<u32> {
        self.inner.create_table(kind)
    }
    fn clear_table(&mut self, root: u32) -> Result<u64> {
        self.inner.clear_table(root)
    }
    fn drop_table(&mut self, root: u32) -> Result<()> {
        self.inner.drop_table(root)
    }
}

fn blocked_connection(store: &MemStore) -> (Connection, Arc<AtomicBool>) {
    let blocked = Arc::new(AtomicBool::new(false));
    let btree = BlockedCommit {
        inner: store.connect(),
        blocked: Arc::clone(&blocked),
    };
    (Connection::new(Box::new(btree), VdbeConfig::default()), blocked)
}

#[test]
fn test_blocked_commit_is_retried_at_the_halt() {
    let store = MemStore::new();
    let (mut conn, blocked) = blocked_connection(&store);
    let root = create_table(&mut conn);

    blocked.store(true, Ordering::SeqCst);
    let mut vdbe = Vdbe::new(insert_program(root, &[(1, "one")]));
    assert_eq!(vdbe.step(&mut conn).unwrap(), StepResult::Busy);
    assert_eq!(vdbe.step(&mut conn).unwrap(), StepResult::Busy);

    blocked.store(false, Ordering::SeqCst);
    assert_eq!(vdbe.step(&mut conn).unwrap(), StepResult::Done);
    assert_eq!(conn.changes(), 1);
    assert_eq!(scan(&mut conn, root).len(), 1);
}

#[test]
fn test_reset_after_blocked_commit_rolls_back() {
    let store = MemStore::new();
    let (mut conn, blocked) = blocked_connection(&store);
    let root = create_table(&mut conn);

    blocked.store(true, Ordering::SeqCst);
    let mut vdbe = Vdbe::new(insert_program(root, &[(1, "one")]));
    assert_eq!(vdbe.step(&mut conn).unwrap(), StepResult::Busy);
    vdbe.reset(&mut conn);
    assert_eq!(conn.active_statements(), 0);
    assert!(conn.is_autocommit());

    // The write lock was released: another connection can write.
    let mut other = connect(&store);
    insert_rows(&mut other, root, &[(2, "two")]);
    blocked.store(false, Ordering::SeqCst);
    let rows = scan(&mut conn, root);
    assert_eq!(rows, vec![vec![int(1), int(2), SqlValue::from("two")]]);
}

#[test]
fn test_query_only_rejects_writes() {
    let store = MemStore::new();
    let config = VdbeConfig {
        query_only: true,
        ..VdbeConfig::default()
    };
    let mut conn = connect_with(&store, config);
    let mut b = ProgramBuilder::new();
    b.op(Opcode::Transaction, 0, 1, 0);
    b.op(Opcode::Halt, 0, 0, 0);
    let err = run(&mut conn, b.finish().unwrap()).unwrap_err();
    assert!(matches!(err, SqlvmError::ReadOnly));
}

// ── Schema ──

fn check_schema(cookie: i32, generation: i32) -> VdbeProgram {
    let mut b = ProgramBuilder::new();
    b.emit_op(Opcode::Transaction, 0, 0, cookie, P4::Int(generation), 1);
    b.op(Opcode::Halt, 0, 0, 0);
    b.finish().unwrap()
}

#[test]
fn test_stale_generation_expires_without_reset() {
    let store = MemStore::new();
    let mut conn = connect(&store);
    let mut vdbe = Vdbe::new(check_schema(0, 3));
    let err = vdbe.step(&mut conn).unwrap_err();
    assert!(matches!(err, SqlvmError::SchemaChanged));
    assert!(vdbe.is_expired());
    assert_eq!(vdbe.error_code(), ErrorCode::Schema);
    // The cookie on disk still matches the cache: nothing to reload.
    assert_eq!(conn.schema(MAIN_DB).unwrap().generation, 0);

    assert!(run(&mut conn, check_schema(0, 0)).unwrap().is_empty());
}

#[test]
fn test_cookie_change_resets_the_cache() {
    let store = MemStore::new();
    let mut a = connect(&store);
    let mut b = connect(&store);

    let mut bump = ProgramBuilder::new();
    bump.op(Opcode::Transaction, 0, 1, 0);
    bump.op(Opcode::SetCookie, 0, 1, 7);
    bump.op(Opcode::Halt, 0, 0, 0);
    run(&mut a, bump.finish().unwrap()).unwrap();
    assert_eq!(a.schema(MAIN_DB).unwrap().cookie, 7);

    let err = run(&mut b, check_schema(0, 0)).unwrap_err();
    assert!(matches!(err, SqlvmError::SchemaChanged));
    let schema = b.schema(MAIN_DB).unwrap();
    assert_eq!(schema.generation, 1);
    assert!(!schema.loaded);

    let mut read = ProgramBuilder::new();
    let r = read.alloc_reg();
    read.op(Opcode::Transaction, 0, 0, 0);
    read.op(Opcode::ReadCookie, 0, r, 1);
    read.op(Opcode::ResultRow, r, 1, 0);
    read.op(Opcode::Halt, 0, 0, 0);
    assert_eq!(run(&mut b, read.finish().unwrap()).unwrap(), vec![vec![int(7)]]);
}

#[test]
fn test_parse_schema_loads_objects() {
    let store = MemStore::new();
    let mut conn = connect(&store);

    let mut b = ProgramBuilder::new();
    let fields = b.alloc_regs(5);
    let record = b.alloc_reg();
    let rowid = b.alloc_reg();
    b.op(Opcode::Transaction, 0, 1, 0);
    b.op(Opcode::CreateTable, 0, fields + 3, 0);
    b.emit_op(Opcode::OpenWrite, 0, 1, 0, P4::Int(5), 0);
    b.emit_op(Opcode::String8, 0, fields, 0, P4::text("table"), 0);
    b.emit_op(Opcode::String8, 0, fields + 1, 0, P4::text("t"), 0);
    b.emit_op(Opcode::String8, 0, fields + 2, 0, P4::text("t"), 0);
    b.emit_op(Opcode::String8, 0, fields + 4, 0, P4::text("CREATE TABLE t(a, b)"), 0);
    b.op(Opcode::MakeRecord, fields, 5, record);
    b.op(Opcode::NewRowid, 0, rowid, 0);
    b.op(Opcode::Insert, 0, record, rowid);
    b.op(Opcode::Close, 0, 0, 0);
    b.op(Opcode::ParseSchema, 0, 0, 0);
    b.op(Opcode::Halt, 0, 0, 0);
    run(&mut conn, b.finish().unwrap()).unwrap();

    let schema = conn.schema(MAIN_DB).unwrap();
    assert!(schema.loaded);
    let t = schema.get("t").unwrap();
    assert_eq!(t.kind, "table");
    assert_eq!(t.root, 2);
    assert_eq!(t.sql.as_deref(), Some("CREATE TABLE t(a, b)"));

    let mut drop = ProgramBuilder::new();
    drop.op(Opcode::Transaction, 0, 1, 0);
    drop.emit_op(Opcode::DropTable, 0, 0, 0, P4::text("t"), 0);
    drop.op(Opcode::Halt, 0, 0, 0);
    run(&mut conn, drop.finish().unwrap()).unwrap();
    assert!(conn.schema(MAIN_DB).unwrap().get("t").is_none());
}

// ── Interrupts and progress ──

fn spin_forever() -> VdbeProgram {
    let mut b = ProgramBuilder::new();
    let r = b.alloc_reg();
    let top = b.new_label();
    b.op(Opcode::Integer, 0, r, 0);
    b.place_label(top);
    b.op(Opcode::AddImm, r, 1, 0);
    b.emit_jump(Opcode::Goto, 0, top, 0, P4::None, 0);
    b.finish().unwrap()
}

#[test]
fn test_progress_handler_stops_the_program() {
    let store = MemStore::new();
    let mut conn = connect(&store);
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    conn.set_progress_handler(
        10,
        Some(Box::new(move || {
            let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
            i32::from(n >= 3)
        })),
    );

    let mut vdbe = Vdbe::new(spin_forever());
    let err = vdbe.step(&mut conn).unwrap_err();
    assert!(matches!(err, SqlvmError::Interrupted));
    assert_eq!(vdbe.error_code(), ErrorCode::Interrupt);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(vdbe.stats().vm_steps >= 30);
}

#[test]
fn test_interrupt_flag_is_cleared_for_the_next_program() {
    let store = MemStore::new();
    let mut conn = connect(&store);
    let handle = conn.interrupt_handle();
    conn.set_progress_handler(
        5,
        Some(Box::new(move || {
            handle.interrupt();
            0
        })),
    );
    let err = run(&mut conn, spin_forever()).unwrap_err();
    assert!(matches!(err, SqlvmError::Interrupted));
    assert!(conn.interrupt_handle().is_interrupted());

    conn.set_progress_handler(0, None);
    let mut b = ProgramBuilder::new();
    let r = b.alloc_reg();
    b.op(Opcode::Integer, 9, r, 0);
    b.op(Opcode::ResultRow, r, 1, 0);
    b.op(Opcode::Halt, 0, 0, 0);
    assert_eq!(run(&mut conn, b.finish().unwrap()).unwrap(), vec![vec![int(9)]]);
}

// ── Configuration ──

#[test]
fn test_count_changes_reports_a_row() {
    let store = MemStore::new();
    let config = VdbeConfig {
        count_changes: true,
        ..VdbeConfig::default()
    };
    let mut conn = connect_with(&store, config);
    let root = create_table(&mut conn);

    let mut vdbe = Vdbe::new(insert_program(root, &[(1, "a"), (2, "b")]));
    assert_eq!(vdbe.step(&mut conn).unwrap(), StepResult::Row);
    assert_eq!(vdbe.row().unwrap(), &[int(2)]);
    assert_eq!(vdbe.step(&mut conn).unwrap(), StepResult::Done);
    assert_eq!(conn.total_changes(), 2);
}

#[test]
fn test_config_file_limits_lengths() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{ "max_length": 5, "vdbe_trace": true }}"#).unwrap();
    let config = VdbeConfig::from_path(file.path()).unwrap();
    assert_eq!(config.max_length, 5);
    assert_eq!(config.max_frame_depth, VdbeConfig::default().max_frame_depth);

    let store = MemStore::new();
    let mut conn = connect_with(&store, config);
    let mut b = ProgramBuilder::new();
    let r = b.alloc_reg();
    b.emit_op(Opcode::String8, 0, r, 0, P4::text("too long"), 0);
    b.op(Opcode::ResultRow, r, 1, 0);
    b.op(Opcode::Halt, 0, 0, 0);
    let mut vdbe = Vdbe::new(b.finish().unwrap());
    let err = collect(&mut vdbe, &mut conn).unwrap_err();
    assert!(matches!(err, SqlvmError::TooBig));
    assert_eq!(vdbe.error_code(), ErrorCode::TooBig);
}
