//! Instruction set, instruction encoding and the program builder.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use sqlvm_error::{Result, SqlvmError};

use crate::collation::CollSeq;
use crate::compare::KeyInfo;
use crate::value::SqlValue;

/// Interpreter opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // === Control Flow ===
    /// Jump to P2. Program entry point when it is the first instruction.
    Init = 1,
    /// Jump to P2 (loop back-edge: polls for interrupts).
    Goto,
    /// Store the return address in register P1 and jump to P2.
    Gosub,
    /// Jump to the address held in register P1.
    Return,
    /// Set up coroutine register P1 with entry P3; jump to P2 if non-zero.
    InitCoroutine,
    /// Finish coroutine P1 and resume its caller after the last `Yield`.
    EndCoroutine,
    /// Swap control with the coroutine in register P1.
    Yield,
    /// Halt with error P1 if register P3 is NULL.
    HaltIfNull,
    /// Stop the program, P1 result code, P2 error action, P4 message, P5 kind.
    Halt,
    /// Fall through the first time, jump to P2 afterwards.
    Once,
    /// Jump to P2 if register P1 is true (P3 decides NULL).
    If,
    /// Jump to P2 if register P1 is false (P3 decides NULL).
    IfNot,
    /// Jump to P2 if register P1 is NULL.
    IsNull,
    /// Jump to P2 if register P1 is not NULL.
    NotNull,
    /// If register P1 > 0, subtract P3 and jump to P2.
    IfPos,
    /// Add P3 to register P1; jump to P2 if the result is zero.
    IfZero,
    /// Jump to P2 if register P1 < 0.
    IfNeg,
    /// Force register P1 to an integer; jump to P2 (or fail) if impossible.
    MustBeInt,
    /// Jump to P1, P2 or P3 on the last `Compare` result <, =, >.
    Jump,
    /// Run sub-program P4 in a new frame. P1 is the first parent register
    /// visible to `Param`; P2 is the resume address after `Halt` IGNORE.
    Program,
    /// Copy parent register (P1 + parent offset) into register P2.
    Param,
    /// Do nothing.
    Noop,
    /// Comment-only instruction.
    Explain,

    // === Constants & Values ===
    /// Register P2 = integer P1.
    Integer,
    /// Register P2 = 64-bit integer P4.
    Int64,
    /// Register P2 = real P4.
    Real,
    /// Register P2 = text P4.
    String8,
    /// Register P2 = text P4 of length P1.
    String,
    /// Register P2 = blob P4.
    Blob,
    /// Registers P2..=P3 = NULL (just P2 when P3 <= P2).
    Null,
    /// Register P1 = NULL.
    SoftNull,
    /// Register P2 = bound parameter P1.
    Variable,

    // === Register Operations ===
    /// Move P3 registers from P1 to P2, leaving the sources NULL.
    Move,
    /// Deep copy P3 + 1 registers from P1 to P2.
    Copy,
    /// Shallow copy register P1 to P2.
    SCopy,
    /// Copy the integer value of P1 into P2.
    IntCopy,
    /// Emit registers P1..P1+P2 as a result row.
    ResultRow,

    // === Arithmetic & Bitwise ===
    /// P3 = P2 + P1.
    Add,
    /// P3 = P2 - P1.
    Subtract,
    /// P3 = P2 * P1.
    Multiply,
    /// P3 = P2 / P1.
    Divide,
    /// P3 = P2 % P1.
    Remainder,
    /// P3 = P2 || P1.
    Concat,
    /// P3 = P1 & P2.
    BitAnd,
    /// P3 = P1 | P2.
    BitOr,
    /// P3 = P2 << P1.
    ShiftLeft,
    /// P3 = P2 >> P1.
    ShiftRight,
    /// P2 = ~P1.
    BitNot,
    /// P2 = NOT P1.
    Not,
    /// P3 = P1 AND P2 (three-valued).
    And,
    /// P3 = P1 OR P2 (three-valued).
    Or,
    /// Register P1 += P2 after integer conversion.
    AddImm,
    /// Cast register P1 to affinity P2.
    Cast,
    /// Integer register P1 becomes real.
    RealAffinity,
    /// Apply affinity string P4 to P2 registers starting at P1.
    Affinity,

    // === Comparison ===
    /// Compare P3 with P1; jump to P2 (or store) when equal.
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Compare register vectors P1 and P2 of length P3 under KeyInfo P4.
    Compare,
    /// Set the column permutation for the next `Compare`.
    Permutation,
    /// Collation P4 for the next function call; P1 flag register cleared.
    CollSeq,

    // === Functions ===
    /// Call scalar function P4 with P5 arguments from P2; result in P3.
    Function,
    /// Accumulate P5 arguments from P2 into aggregate register P3.
    AggStep,
    /// Finalize aggregate register P1.
    AggFinal,

    // === Cursors ===
    /// Open read cursor P1 on root page P2 of database P3.
    OpenRead,
    /// Open write cursor P1 on root page P2 of database P3.
    OpenWrite,
    /// Open cursor P1 on a new transient tree (P4 KeyInfo makes it an index).
    OpenEphemeral,
    /// Like `OpenEphemeral`, for automatic indexes.
    OpenAutoindex,
    /// Open cursor P1 reading the single row held in register P2.
    OpenPseudo,
    /// Open sorter cursor P1 with KeyInfo P4.
    SorterOpen,
    /// Close cursor P1.
    Close,
    /// Position on the first entry; jump to P2 if empty.
    Rewind,
    /// Position on the last entry; jump to P2 if empty.
    Last,
    /// Advance; jump to P2 if a row remains.
    Next,
    /// Step back; jump to P2 if a row remains.
    Prev,
    /// `Next` on a cursor that may not be open.
    NextIfOpen,
    /// `Prev` on a cursor that may not be open.
    PrevIfOpen,
    /// Seek to the last entry < key; jump to P2 if none.
    SeekLT,
    /// Seek to the last entry <= key.
    SeekLE,
    /// Seek to the first entry >= key.
    SeekGE,
    /// Seek to the first entry > key.
    SeekGT,
    /// Deferred seek of table cursor P1 to the rowid in register P2.
    Seek,
    /// Jump to P2 if the key is present.
    Found,
    /// Jump to P2 if the key is absent.
    NotFound,
    /// Jump to P2 if the key has a NULL or is absent.
    NoConflict,
    /// Jump to P2 if rowid (register P3) is absent.
    NotExists,
    /// Register P3 = column P2 of cursor P1 (P4 default).
    Column,
    /// Build a record from P2 registers starting at P1 into P3.
    MakeRecord,
    /// Register P2 = number of entries in cursor P1.
    Count,
    /// Register P2 = rowid of cursor P1.
    Rowid,
    /// Register P2 = key of index cursor P1.
    RowKey,
    /// Register P2 = row payload of cursor P1.
    RowData,
    /// Put cursor P1 on the NULL row.
    NullRow,
    /// If cursor P1 is on the NULL row, set register P3 to NULL and jump
    /// to P2.
    IfNullRow,
    /// Register P2 = next sequence number of cursor P1.
    Sequence,
    /// Register P2 = new rowid for cursor P1 (P3 autoincrement register).
    NewRowid,
    /// Insert record P2 under rowid register P3.
    Insert,
    /// Insert record P2 under rowid P3 (immediate).
    InsertInt,
    /// Delete the current row of cursor P1.
    Delete,
    /// Insert index key P2.
    IdxInsert,
    /// Delete the index entry matching P3 registers from P2.
    IdxDelete,
    /// Register P2 = rowid stored at the end of index cursor P1's key.
    IdxRowid,
    /// Jump to P2 if index key <= search key.
    IdxLE,
    /// Jump to P2 if index key > search key.
    IdxGT,
    /// Jump to P2 if index key < search key.
    IdxLT,
    /// Jump to P2 if index key >= search key.
    IdxGE,

    // === Sorter ===
    /// Add record P2 to sorter P1.
    SorterInsert,
    /// Sort and rewind; jump to P2 if empty.
    SorterSort,
    /// Same as `SorterSort`.
    Sort,
    /// Register P2 = current sorter row.
    SorterData,
    /// Advance the sorter; jump to P2 if a row remains.
    SorterNext,

    // === Transactions & Schema ===
    /// Begin a transaction on database P1 (P2 write, P3/P4 schema check).
    Transaction,
    /// Set autocommit to P1; P2 requests rollback.
    AutoCommit,
    /// Register P2 = meta slot P3 of database P1.
    ReadCookie,
    /// Meta slot P2 of database P1 = P3.
    SetCookie,
    /// Register P2 = root page of a new table in database P1.
    CreateTable,
    /// Register P2 = root page of a new index in database P1.
    CreateIndex,
    /// Delete all rows of root page P1 (P3 > 0 counts changes).
    Clear,
    /// Drop root page P1 of database P3; register P2 = moved root (0).
    Destroy,
    /// Forget cached table P4 of database P1.
    DropTable,
    /// Forget cached index P4 of database P1.
    DropIndex,
    /// Reload the schema of database P1 (P4 filter).
    ParseSchema,
    /// Take a table lock on root P2 of database P1 (P3 write).
    TableLock,

    // === Boolean Index ===
    /// Add the integer in P2 to row set P1.
    RowSetAdd,
    /// Pop the smallest value of row set P1 into P3; jump to P2 if empty.
    RowSetRead,
    /// Test/insert P3 in row set P1 with batch P4.
    RowSetTest,

    // === Foreign Keys ===
    /// Add P2 to the immediate (P1 = 0) or deferred (P1 != 0) counter.
    FkCounter,
    /// Jump to P2 if the selected counter is zero.
    FkIfZero,
}

impl Opcode {
    pub fn name(self) -> &'static str {
        OPCODE_NAMES
            .get(usize::from(self as u8))
            .copied()
            .unwrap_or("?")
    }

    /// `Eq` through `Ge`.
    pub const fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge
        )
    }

    /// Whether P2 of this opcode is a jump target.
    pub const fn jumps_p2(self) -> bool {
        matches!(
            self,
            Self::Init
                | Self::Goto
                | Self::Gosub
                | Self::InitCoroutine
                | Self::Yield
                | Self::Once
                | Self::If
                | Self::IfNot
                | Self::IsNull
                | Self::NotNull
                | Self::IfPos
                | Self::IfZero
                | Self::IfNeg
                | Self::MustBeInt
                | Self::Program
                | Self::Eq
                | Self::Ne
                | Self::Lt
                | Self::Le
                | Self::Gt
                | Self::Ge
                | Self::Rewind
                | Self::Last
                | Self::Next
                | Self::Prev
                | Self::NextIfOpen
                | Self::PrevIfOpen
                | Self::SeekLT
                | Self::SeekLE
                | Self::SeekGE
                | Self::SeekGT
                | Self::Found
                | Self::NotFound
                | Self::NoConflict
                | Self::NotExists
                | Self::IfNullRow
                | Self::IdxLE
                | Self::IdxGT
                | Self::IdxLT
                | Self::IdxGE
                | Self::SorterSort
                | Self::Sort
                | Self::SorterNext
                | Self::RowSetRead
                | Self::RowSetTest
                | Self::FkIfZero
        )
    }
}

const OPCODE_NAMES: &[&str] = &[
    "?",
    "Init",
    "Goto",
    "Gosub",
    "Return",
    "InitCoroutine",
    "EndCoroutine",
    "Yield",
    "HaltIfNull",
    "Halt",
    "Once",
    "If",
    "IfNot",
    "IsNull",
    "NotNull",
    "IfPos",
    "IfZero",
    "IfNeg",
    "MustBeInt",
    "Jump",
    "Program",
    "Param",
    "Noop",
    "Explain",
    "Integer",
    "Int64",
    "Real",
    "String8",
    "String",
    "Blob",
    "Null",
    "SoftNull",
    "Variable",
    "Move",
    "Copy",
    "SCopy",
    "IntCopy",
    "ResultRow",
    "Add",
    "Subtract",
    "Multiply",
    "Divide",
    "Remainder",
    "Concat",
    "BitAnd",
    "BitOr",
    "ShiftLeft",
    "ShiftRight",
    "BitNot",
    "Not",
    "And",
    "Or",
    "AddImm",
    "Cast",
    "RealAffinity",
    "Affinity",
    "Eq",
    "Ne",
    "Lt",
    "Le",
    "Gt",
    "Ge",
    "Compare",
    "Permutation",
    "CollSeq",
    "Function",
    "AggStep",
    "AggFinal",
    "OpenRead",
    "OpenWrite",
    "OpenEphemeral",
    "OpenAutoindex",
    "OpenPseudo",
    "SorterOpen",
    "Close",
    "Rewind",
    "Last",
    "Next",
    "Prev",
    "NextIfOpen",
    "PrevIfOpen",
    "SeekLT",
    "SeekLE",
    "SeekGE",
    "SeekGT",
    "Seek",
    "Found",
    "NotFound",
    "NoConflict",
    "NotExists",
    "Column",
    "MakeRecord",
    "Count",
    "Rowid",
    "RowKey",
    "RowData",
    "NullRow",
    "IfNullRow",
    "Sequence",
    "NewRowid",
    "Insert",
    "InsertInt",
    "Delete",
    "IdxInsert",
    "IdxDelete",
    "IdxRowid",
    "IdxLE",
    "IdxGT",
    "IdxLT",
    "IdxGE",
    "SorterInsert",
    "SorterSort",
    "Sort",
    "SorterData",
    "SorterNext",
    "Transaction",
    "AutoCommit",
    "ReadCookie",
    "SetCookie",
    "CreateTable",
    "CreateIndex",
    "Clear",
    "Destroy",
    "DropTable",
    "DropIndex",
    "ParseSchema",
    "TableLock",
    "RowSetAdd",
    "RowSetRead",
    "RowSetTest",
    "FkCounter",
    "FkIfZero",
];

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── P5 flag bits ───────────────────────────────────────────────────────────

/// Comparison: jump when either operand is NULL.
pub const P5_JUMPIFNULL: u16 = 0x10;
/// Comparison: store the boolean result in register P2 instead of jumping.
pub const P5_STOREP2: u16 = 0x20;
/// Comparison: NULL == NULL is true and NULL == x is false.
pub const P5_NULLEQ: u16 = 0x80;
/// Comparison: bits holding the affinity character (`'A'`..=`'E'`).
pub const P5_AFF_MASK: u16 = 0x47;
/// `Compare`: use the permutation set by the preceding `Permutation`.
pub const P5_PERMUTE: u16 = 0x01;
/// `Insert`/`Delete`: count the change.
pub const P5_NCHANGE: u16 = 0x01;
/// `Insert`: publish the rowid as the last inserted rowid.
pub const P5_LASTROWID: u16 = 0x02;
/// `Insert`: the cursor is already positioned by a seek (advisory).
pub const P5_USESEEKRESULT: u16 = 0x10;
/// `OpenRead`/`OpenWrite`: P2 names a register holding the root page.
pub const P5_P2ISREG: u16 = 0x10;
/// `Column`: the caller only needs the length or type, not the content.
pub const P5_LENGTHARG: u16 = 0x40;

/// `Halt` P2: how far to roll back on error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Leave earlier statement changes, keep the transaction.
    Abort,
    /// Roll back the whole transaction.
    Rollback,
    /// Keep everything done so far, including this statement's changes.
    Fail,
    /// Skip the offending row (triggers: return to the caller's P2).
    Ignore,
    /// Replace conflicting rows (handled by the program, not the halt path).
    Replace,
}

impl ErrorAction {
    pub const fn from_p2(p2: i32) -> Self {
        match p2 {
            1 => Self::Rollback,
            3 => Self::Fail,
            4 => Self::Ignore,
            5 => Self::Replace,
            _ => Self::Abort,
        }
    }

    pub const fn as_p2(self) -> i32 {
        match self {
            Self::Rollback => 1,
            Self::Abort => 2,
            Self::Fail => 3,
            Self::Ignore => 4,
            Self::Replace => 5,
        }
    }
}

// ── Instructions ───────────────────────────────────────────────────────────

/// One instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct VdbeOp {
    pub opcode: Opcode,
    pub p1: i32,
    pub p2: i32,
    pub p3: i32,
    pub p4: P4,
    pub p5: u16,
}

/// The polymorphic fourth operand.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum P4 {
    #[default]
    None,
    Int(i32),
    Int64(i64),
    Real(f64),
    /// UTF-8 text (string constants, halt messages, table names).
    Text(Arc<[u8]>),
    Blob(Arc<[u8]>),
    KeyInfo(Arc<KeyInfo>),
    Collation(CollSeq),
    /// Function name resolved against the connection's registry.
    FuncName(Arc<str>),
    /// Default value for `Column` when the row has fewer fields.
    Value(SqlValue),
    /// One affinity code per column.
    Affinity(Arc<str>),
    /// Column permutation for `Compare`.
    IntArray(Arc<[u32]>),
    SubProgram(Arc<VdbeProgram>),
}

impl P4 {
    pub fn text(s: &str) -> Self {
        Self::Text(Arc::from(s.as_bytes()))
    }

    pub fn blob(b: &[u8]) -> Self {
        Self::Blob(Arc::from(b))
    }

    pub fn func(name: &str) -> Self {
        Self::FuncName(Arc::from(name))
    }

    pub fn affinity(codes: &str) -> Self {
        Self::Affinity(Arc::from(codes))
    }

    pub fn key_info(info: KeyInfo) -> Self {
        Self::KeyInfo(Arc::new(info))
    }

    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Self::Text(t) => Some(String::from_utf8_lossy(t)),
            _ => None,
        }
    }

    pub const fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::None => String::new(),
            Self::Int(v) => format!("(int){v}"),
            Self::Int64(v) => format!("(i64){v}"),
            Self::Real(v) => format!("(real){v}"),
            Self::Text(t) => format!("(text){}", String::from_utf8_lossy(t)),
            Self::Blob(b) => format!("(blob)[{}B]", b.len()),
            Self::KeyInfo(k) => format!("(keyinfo){}", k.len()),
            Self::Collation(c) => format!("(coll){}", c.name()),
            Self::FuncName(f) => format!("(func){f}"),
            Self::Value(v) => format!("(value){v}"),
            Self::Affinity(a) => format!("(aff){a}"),
            Self::IntArray(a) => format!("(intarray){a:?}"),
            Self::SubProgram(p) => format!("(program)[{} ops]", p.len()),
        }
    }
}

// ── Program builder ────────────────────────────────────────────────────────

/// Handle for a jump target that may not be placed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

#[derive(Debug)]
enum LabelState {
    /// Instructions whose P2 must be patched when the label is placed.
    Pending(Vec<usize>),
    Placed(i32),
}

/// Builds a [`VdbeProgram`], allocating registers and cursors and resolving
/// forward jumps.
///
/// Registers are numbered from 1; register 0 is never handed out.
#[derive(Debug)]
pub struct ProgramBuilder {
    ops: Vec<VdbeOp>,
    labels: Vec<LabelState>,
    next_reg: i32,
    next_cursor: i32,
    uses_stmt_journal: bool,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self {
            ops: Vec::new(),
            labels: Vec::new(),
            next_reg: 1,
            next_cursor: 0,
            uses_stmt_journal: false,
        }
    }

    /// Append an instruction, returning its address.
    pub fn emit(&mut self, op: VdbeOp) -> usize {
        self.ops.push(op);
        self.ops.len() - 1
    }

    pub fn emit_op(&mut self, opcode: Opcode, p1: i32, p2: i32, p3: i32, p4: P4, p5: u16) -> usize {
        self.emit(VdbeOp {
            opcode,
            p1,
            p2,
            p3,
            p4,
            p5,
        })
    }

    /// Shorthand for instructions without P4/P5.
    pub fn op(&mut self, opcode: Opcode, p1: i32, p2: i32, p3: i32) -> usize {
        self.emit_op(opcode, p1, p2, p3, P4::None, 0)
    }

    pub fn current_addr(&self) -> usize {
        self.ops.len()
    }

    pub fn op_at_mut(&mut self, addr: usize) -> Option<&mut VdbeOp> {
        self.ops.get_mut(addr)
    }

    // ── Labels ──────────────────────────────────────────────────────────

    pub fn new_label(&mut self) -> Label {
        let id = u32::try_from(self.labels.len()).unwrap_or(u32::MAX);
        self.labels.push(LabelState::Pending(Vec::new()));
        Label(id)
    }

    /// Emit an instruction whose P2 is `label`.
    pub fn emit_jump(
        &mut self,
        opcode: Opcode,
        p1: i32,
        label: Label,
        p3: i32,
        p4: P4,
        p5: u16,
    ) -> usize {
        let addr = self.emit_op(opcode, p1, -1, p3, p4, p5);
        match self.labels.get_mut(label.0 as usize) {
            Some(LabelState::Pending(refs)) => refs.push(addr),
            Some(LabelState::Placed(target)) => self.ops[addr].p2 = *target,
            None => {}
        }
        addr
    }

    /// Place `label` at the next instruction address.
    pub fn place_label(&mut self, label: Label) {
        let addr = i32::try_from(self.current_addr()).unwrap_or(i32::MAX);
        if let Some(state) = self.labels.get_mut(label.0 as usize) {
            if let LabelState::Pending(refs) = state {
                for &at in refs.iter() {
                    self.ops[at].p2 = addr;
                }
            }
            *state = LabelState::Placed(addr);
        }
    }

    // ── Allocation ──────────────────────────────────────────────────────

    pub fn alloc_reg(&mut self) -> i32 {
        self.alloc_regs(1)
    }

    /// Allocate `n` consecutive registers, returning the first.
    pub fn alloc_regs(&mut self, n: i32) -> i32 {
        let first = self.next_reg;
        self.next_reg += n;
        first
    }

    pub fn alloc_cursor(&mut self) -> i32 {
        let c = self.next_cursor;
        self.next_cursor += 1;
        c
    }

    /// Mark the program as needing a statement transaction for its writes.
    pub fn set_uses_stmt_journal(&mut self, uses: bool) {
        self.uses_stmt_journal = uses;
    }

    /// Check that every referenced label was placed and produce the program.
    pub fn finish(self) -> Result<VdbeProgram> {
        for (idx, state) in self.labels.iter().enumerate() {
            if let LabelState::Pending(refs) = state {
                if !refs.is_empty() {
                    return Err(SqlvmError::internal(format!(
                        "label {idx} never placed ({} jump(s) reference it)",
                        refs.len()
                    )));
                }
            }
        }
        let len = self.ops.len();
        if let Some(bad) = self.ops.iter().position(|op| {
            let stores = op.opcode.is_comparison() && op.p5 & P5_STOREP2 != 0;
            op.opcode.jumps_p2() && !stores && usize::try_from(op.p2).map_or(true, |p2| p2 > len)
        }) {
            return Err(SqlvmError::internal(format!(
                "instruction {bad} jumps outside the program"
            )));
        }
        // Highest register or cursor any instruction names, in case the
        // caller hand-wrote operands instead of allocating them.
        let cursor_count = self
            .ops
            .iter()
            .filter(|op| opens_cursor(op.opcode))
            .map(|op| op.p1 + 1)
            .max()
            .unwrap_or(0)
            .max(self.next_cursor);
        Ok(VdbeProgram {
            register_count: self.next_reg - 1,
            cursor_count,
            once_count: self.ops.iter().filter(|op| op.opcode == Opcode::Once).count(),
            uses_stmt_journal: self.uses_stmt_journal,
            ops: self.ops,
        })
    }
}

const fn opens_cursor(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::OpenRead
            | Opcode::OpenWrite
            | Opcode::OpenEphemeral
            | Opcode::OpenAutoindex
            | Opcode::OpenPseudo
            | Opcode::SorterOpen
    )
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An immutable, validated program.
#[derive(Debug, Clone, PartialEq)]
pub struct VdbeProgram {
    ops: Vec<VdbeOp>,
    register_count: i32,
    cursor_count: i32,
    once_count: usize,
    uses_stmt_journal: bool,
}

impl VdbeProgram {
    pub fn ops(&self) -> &[VdbeOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn get(&self, pc: usize) -> Option<&VdbeOp> {
        self.ops.get(pc)
    }

    pub fn register_count(&self) -> i32 {
        self.register_count
    }

    pub fn cursor_count(&self) -> i32 {
        self.cursor_count
    }

    pub fn once_count(&self) -> usize {
        self.once_count
    }

    pub fn uses_stmt_journal(&self) -> bool {
        self.uses_stmt_journal
    }

    /// `EXPLAIN`-style listing.
    pub fn disassemble(&self) -> String {
        use std::fmt::Write;

        let mut out = String::with_capacity(self.ops.len() * 64);
        out.push_str("addr  opcode         p1    p2    p3    p4                 p5\n");
        for (addr, op) in self.ops.iter().enumerate() {
            let _ = writeln!(
                out,
                "{addr:<4}  {:<13}  {:<4}  {:<4}  {:<4}  {:<17}  {}",
                op.opcode.name(),
                op.p1,
                op.p2,
                op.p3,
                op.p4.describe(),
                op.p5
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_names_line_up() {
        assert_eq!(Opcode::Init.name(), "Init");
        assert_eq!(Opcode::Goto.name(), "Goto");
        assert_eq!(Opcode::ResultRow.name(), "ResultRow");
        assert_eq!(Opcode::SeekGE.name(), "SeekGE");
        assert_eq!(Opcode::Transaction.name(), "Transaction");
        assert_eq!(Opcode::FkIfZero.name(), "FkIfZero");
        assert_eq!(OPCODE_NAMES.len(), Opcode::FkIfZero as usize + 1);
    }

    #[test]
    fn test_jump_classification() {
        assert!(Opcode::Goto.jumps_p2());
        assert!(Opcode::SeekLT.jumps_p2());
        assert!(!Opcode::Return.jumps_p2());
        assert!(!Opcode::Jump.jumps_p2());
        assert!(!Opcode::Column.jumps_p2());
    }

    #[test]
    fn test_forward_label_patched() {
        let mut b = ProgramBuilder::new();
        let end = b.new_label();
        let jump = b.emit_jump(Opcode::Goto, 0, end, 0, P4::None, 0);
        b.op(Opcode::Noop, 0, 0, 0);
        b.place_label(end);
        b.op(Opcode::Halt, 0, 0, 0);
        let prog = b.finish().unwrap();
        assert_eq!(prog.ops()[jump].p2, 2);
    }

    #[test]
    fn test_backward_label() {
        let mut b = ProgramBuilder::new();
        let top = b.new_label();
        b.place_label(top);
        b.op(Opcode::Noop, 0, 0, 0);
        let jump = b.emit_jump(Opcode::Goto, 0, top, 0, P4::None, 0);
        let prog = b.finish().unwrap();
        assert_eq!(prog.ops()[jump].p2, 0);
    }

    #[test]
    fn test_unplaced_label_rejected() {
        let mut b = ProgramBuilder::new();
        let nowhere = b.new_label();
        b.emit_jump(Opcode::Goto, 0, nowhere, 0, P4::None, 0);
        assert!(b.finish().is_err());
    }

    #[test]
    fn test_allocation_counts() {
        let mut b = ProgramBuilder::new();
        assert_eq!(b.alloc_reg(), 1);
        assert_eq!(b.alloc_regs(3), 2);
        assert_eq!(b.alloc_cursor(), 0);
        b.op(Opcode::OpenRead, 4, 2, 0);
        b.op(Opcode::Once, 0, 3, 0);
        b.op(Opcode::Halt, 0, 0, 0);
        let prog = b.finish().unwrap();
        assert_eq!(prog.register_count(), 4);
        assert_eq!(prog.cursor_count(), 5);
        assert_eq!(prog.once_count(), 1);
    }

    #[test]
    fn test_error_action_codes() {
        assert_eq!(ErrorAction::from_p2(4), ErrorAction::Ignore);
        assert_eq!(ErrorAction::from_p2(0), ErrorAction::Abort);
        assert_eq!(ErrorAction::Rollback.as_p2(), 1);
    }

    #[test]
    fn test_disassemble_lists_every_op() {
        let mut b = ProgramBuilder::new();
        b.emit_op(Opcode::String8, 0, 1, 0, P4::text("hi"), 0);
        b.op(Opcode::Halt, 0, 0, 0);
        let text = b.finish().unwrap().disassemble();
        assert!(text.contains("String8"));
        assert!(text.contains("(text)hi"));
        assert_eq!(text.lines().count(), 3);
    }
}
