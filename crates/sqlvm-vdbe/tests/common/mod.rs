#![allow(dead_code)]

use sqlvm_btree::MemStore;
use sqlvm_error::{Result, SqlvmError};
use sqlvm_types::opcode::{P5_LASTROWID, P5_NCHANGE};
use sqlvm_types::{Opcode, ProgramBuilder, SqlValue, VdbeProgram, P4};
use sqlvm_vdbe::{Connection, StepResult, Vdbe, VdbeConfig};

pub fn connect(store: &MemStore) -> Connection {
    connect_with(store, VdbeConfig::default())
}

pub fn connect_with(store: &MemStore, config: VdbeConfig) -> Connection {
    Connection::new(Box::new(store.connect()), config)
}

/// Step until the program finishes, collecting every row.
pub fn collect(vdbe: &mut Vdbe, conn: &mut Connection) -> Result<Vec<Vec<SqlValue>>> {
    let mut rows = Vec::new();
    loop {
        match vdbe.step(conn)? {
            StepResult::Row => rows.push(vdbe.row().unwrap_or_default().to_vec()),
            StepResult::Done => return Ok(rows),
            StepResult::Busy => return Err(SqlvmError::Busy),
        }
    }
}

pub fn run(conn: &mut Connection, program: VdbeProgram) -> Result<Vec<Vec<SqlValue>>> {
    collect(&mut Vdbe::new(program), conn)
}

pub fn int(v: i64) -> SqlValue {
    SqlValue::Integer(v)
}

/// Create an empty table in the main database and return its root page.
pub fn create_table(conn: &mut Connection) -> i32 {
    let mut b = ProgramBuilder::new();
    let root = b.alloc_reg();
    b.op(Opcode::Transaction, 0, 1, 0);
    b.op(Opcode::CreateTable, 0, root, 0);
    b.op(Opcode::ResultRow, root, 1, 0);
    b.op(Opcode::Halt, 0, 0, 0);
    let rows = run(conn, b.finish().unwrap()).unwrap();
    match rows[0][0] {
        SqlValue::Integer(r) => i32::try_from(r).unwrap(),
        ref other => panic!("CreateTable returned {other:?}"),
    }
}

/// Open a write cursor on `root` as cursor 0 inside a write transaction.
pub fn begin_write(b: &mut ProgramBuilder, root: i32) {
    b.op(Opcode::Transaction, 0, 1, 0);
    b.emit_op(Opcode::OpenWrite, 0, root, 0, P4::Int(2), 0);
}

/// Append `(a, b)` rows with freshly allocated rowids.
pub fn emit_inserts(b: &mut ProgramBuilder, rows: &[(i32, &str)]) {
    let a = b.alloc_regs(2);
    let record = b.alloc_reg();
    let rowid = b.alloc_reg();
    for &(x, s) in rows {
        b.op(Opcode::Integer, x, a, 0);
        b.emit_op(Opcode::String8, 0, a + 1, 0, P4::text(s), 0);
        b.op(Opcode::MakeRecord, a, 2, record);
        b.op(Opcode::NewRowid, 0, rowid, 0);
        b.emit_op(
            Opcode::Insert,
            0,
            record,
            rowid,
            P4::None,
            P5_NCHANGE | P5_LASTROWID,
        );
    }
}

pub fn insert_program(root: i32, rows: &[(i32, &str)]) -> VdbeProgram {
    let mut b = ProgramBuilder::new();
    begin_write(&mut b, root);
    emit_inserts(&mut b, rows);
    b.op(Opcode::Halt, 0, 0, 0);
    b.finish().unwrap()
}

pub fn insert_rows(conn: &mut Connection, root: i32, rows: &[(i32, &str)]) {
    run(conn, insert_program(root, rows)).unwrap();
}

/// `SELECT rowid, a, b FROM t` over the two-column table at `root`.
pub fn scan_program(root: i32) -> VdbeProgram {
    let mut b = ProgramBuilder::new();
    let out = b.alloc_regs(3);
    let done = b.new_label();
    b.op(Opcode::Transaction, 0, 0, 0);
    b.emit_op(Opcode::OpenRead, 0, root, 0, P4::Int(2), 0);
    b.emit_jump(Opcode::Rewind, 0, done, 0, P4::None, 0);
    let top = b.new_label();
    b.place_label(top);
    b.op(Opcode::Rowid, 0, out, 0);
    b.op(Opcode::Column, 0, 0, out + 1);
    b.op(Opcode::Column, 0, 1, out + 2);
    b.op(Opcode::ResultRow, out, 3, 0);
    b.emit_jump(Opcode::Next, 0, top, 0, P4::None, 0);
    b.place_label(done);
    b.op(Opcode::Halt, 0, 0, 0);
    b.finish().unwrap()
}

pub fn scan(conn: &mut Connection, root: i32) -> Vec<Vec<SqlValue>> {
    run(conn, scan_program(root)).unwrap()
}

/// A program holding only `AutoCommit p1 p2` (BEGIN, COMMIT or ROLLBACK).
pub fn auto_commit(conn: &mut Connection, on: bool, rollback: bool) -> Result<()> {
    let mut b = ProgramBuilder::new();
    b.op(Opcode::AutoCommit, i32::from(on), i32::from(rollback), 0);
    b.op(Opcode::Halt, 0, 0, 0);
    run(conn, b.finish().unwrap()).map(|_| ())
}
