use std::fmt;

use thiserror::Error;

/// Primary error type for the sqlvm execution core.
///
/// Every fault raised inside an opcode handler is one of these variants. The
/// interpreter funnels them through a single halt routine, so the variant is
/// also what the caller eventually sees from `Vdbe::step`.
#[derive(Error, Debug)]
pub enum SqlvmError {
    // === Data Integrity ===
    /// A record or tree structure failed validation.
    #[error("database disk image is malformed: {detail}")]
    Corrupt { detail: String },

    // === Resource Exhaustion ===
    /// Key space exhausted (no rowid could be allocated) or storage full.
    #[error("database or disk is full")]
    Full,

    /// Allocation failure.
    #[error("out of memory")]
    OutOfMemory,

    // === Size Limits ===
    /// String or BLOB exceeds the configured maximum length.
    #[error("string or blob too big")]
    TooBig,

    // === Concurrency ===
    /// Another connection holds a conflicting lock. Retryable.
    #[error("database is locked")]
    Busy,

    /// The interrupt flag was raised or the progress handler asked to stop.
    #[error("interrupted")]
    Interrupted,

    // === Schema Drift ===
    /// The compiled program no longer matches the live schema.
    #[error("database schema has changed")]
    SchemaChanged,

    // === Constraint Errors ===
    /// An integrity constraint was violated.
    #[error("{}", constraint_message(*.kind, .detail.as_deref()))]
    Constraint {
        kind: ConstraintKind,
        detail: Option<String>,
    },

    // === Type Errors ===
    /// A value could not be coerced where the opcode requires it.
    #[error("datatype mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    // === Access ===
    /// Write attempted while the connection or database is read-only.
    #[error("attempt to write a readonly database")]
    ReadOnly,

    /// The API was used out of order (e.g. stepping a finalized program).
    #[error("library routine called out of sequence: {0}")]
    Misuse(String),

    // === I/O & Configuration ===
    /// File I/O error (configuration loading).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration document could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    // === Generic ===
    /// A program-raised error (`Halt` with a non-zero code and a message).
    #[error("{0}")]
    Generic(String),

    /// SQL function domain/runtime error (raised through the function context).
    #[error("{0}")]
    FunctionError(String),

    /// Internal logic error (malformed program, missing cursor, ...).
    #[error("internal error: {0}")]
    Internal(String),
}

/// The constraint classes a `Halt` (P5 1..=4) or the halt-time FK check can
/// report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintKind {
    NotNull,
    Unique,
    Check,
    ForeignKey,
}

impl ConstraintKind {
    /// Decode the `Halt` P5 operand.
    pub const fn from_p5(p5: u16) -> Option<Self> {
        match p5 {
            1 => Some(Self::NotNull),
            2 => Some(Self::Unique),
            3 => Some(Self::Check),
            4 => Some(Self::ForeignKey),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotNull => "NOT NULL",
            Self::Unique => "UNIQUE",
            Self::Check => "CHECK",
            Self::ForeignKey => "FOREIGN KEY",
        }
    }
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn constraint_message(kind: ConstraintKind, detail: Option<&str>) -> String {
    match detail {
        Some(d) => format!("{kind} constraint failed: {d}"),
        None => format!("{kind} constraint failed"),
    }
}

/// Numeric result codes.
///
/// The values match the classic embedded-database result codes so they can be
/// used as `Halt` P1 operands and compared against externally produced
/// programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Successful result.
    Ok = 0,
    /// Generic error.
    Error = 1,
    /// Internal logic error.
    Internal = 2,
    /// Database is busy.
    Busy = 5,
    /// Out of memory.
    NoMem = 7,
    /// Attempt to write a read-only database.
    ReadOnly = 8,
    /// Interrupted.
    Interrupt = 9,
    /// Disk I/O error.
    IoErr = 10,
    /// Malformed record or tree.
    Corrupt = 11,
    /// Key space or disk full.
    Full = 13,
    /// Schema changed.
    Schema = 17,
    /// String or BLOB exceeds size limit.
    TooBig = 18,
    /// Constraint violation.
    Constraint = 19,
    /// Data type mismatch.
    Mismatch = 20,
    /// Library used incorrectly.
    Misuse = 21,
    /// A result row is ready.
    Row = 100,
    /// The program finished.
    Done = 101,
}

impl ErrorCode {
    /// Decode a raw result code, mapping unknown values to `Error`.
    pub const fn from_i32(code: i32) -> Self {
        match code {
            0 => Self::Ok,
            2 => Self::Internal,
            5 => Self::Busy,
            7 => Self::NoMem,
            8 => Self::ReadOnly,
            9 => Self::Interrupt,
            10 => Self::IoErr,
            11 => Self::Corrupt,
            13 => Self::Full,
            17 => Self::Schema,
            18 => Self::TooBig,
            19 => Self::Constraint,
            20 => Self::Mismatch,
            21 => Self::Misuse,
            100 => Self::Row,
            101 => Self::Done,
            _ => Self::Error,
        }
    }

    /// Stable English classification, used as the message prefix for errors
    /// raised without detail.
    pub const fn description(self) -> &'static str {
        match self {
            Self::Ok => "not an error",
            Self::Error => "SQL logic error",
            Self::Internal => "internal logic error",
            Self::Busy => "database is locked",
            Self::NoMem => "out of memory",
            Self::ReadOnly => "attempt to write a readonly database",
            Self::Interrupt => "interrupted",
            Self::IoErr => "disk I/O error",
            Self::Corrupt => "database disk image is malformed",
            Self::Full => "database or disk is full",
            Self::Schema => "database schema has changed",
            Self::TooBig => "string or blob too big",
            Self::Constraint => "constraint failed",
            Self::Mismatch => "datatype mismatch",
            Self::Misuse => "bad parameter or other API misuse",
            Self::Row => "another row available",
            Self::Done => "no more rows available",
        }
    }
}

impl SqlvmError {
    /// Map this error to its numeric result code.
    #[allow(clippy::match_same_arms)]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::Corrupt { .. } => ErrorCode::Corrupt,
            Self::Full => ErrorCode::Full,
            Self::OutOfMemory => ErrorCode::NoMem,
            Self::TooBig => ErrorCode::TooBig,
            Self::Busy => ErrorCode::Busy,
            Self::Interrupted => ErrorCode::Interrupt,
            Self::SchemaChanged => ErrorCode::Schema,
            Self::Constraint { .. } => ErrorCode::Constraint,
            Self::TypeMismatch { .. } => ErrorCode::Mismatch,
            Self::ReadOnly => ErrorCode::ReadOnly,
            Self::Misuse(_) => ErrorCode::Misuse,
            Self::Io(_) => ErrorCode::IoErr,
            Self::Config(_) | Self::Generic(_) | Self::FunctionError(_) => ErrorCode::Error,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Whether the caller can recover without changing the program text.
    pub const fn is_user_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Busy | Self::SchemaChanged | Self::Interrupted | Self::Constraint { .. }
        )
    }

    /// Human-friendly suggestion for handling this error.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::Busy => Some("Retry the step after a short delay"),
            Self::SchemaChanged => Some("Recompile the program against the new schema and rerun it"),
            Self::Corrupt { .. } => Some("Restore the database from a backup"),
            Self::TooBig => Some("Reduce the size of the value or raise max_length"),
            Self::Full => Some("Delete rows or stop using AUTOINCREMENT near the key-space limit"),
            _ => None,
        }
    }

    /// Whether this error is transient (a retry of the same step may succeed).
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Busy)
    }

    /// Whether the halt controller must roll back the whole transaction
    /// rather than just the statement transaction.
    pub const fn forces_rollback(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemory | Self::Io(_) | Self::Full | Self::Interrupted
        )
    }

    /// Create a corruption error.
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::Corrupt {
            detail: detail.into(),
        }
    }

    /// Create a constraint error.
    pub fn constraint(kind: ConstraintKind, detail: impl Into<String>) -> Self {
        Self::Constraint {
            kind,
            detail: Some(detail.into()),
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a function domain error.
    pub fn function_error(msg: impl Into<String>) -> Self {
        Self::FunctionError(msg.into())
    }

    /// Build the error a `Halt` opcode raises from its raw operands.
    ///
    /// `code` is P1, `kind` comes from P5 and `message` from P4.
    pub fn from_halt(code: i32, kind: Option<ConstraintKind>, message: Option<&str>) -> Self {
        if let Some(kind) = kind {
            return Self::Constraint {
                kind,
                detail: message.map(str::to_owned),
            };
        }
        let message = message.map(str::to_owned);
        match ErrorCode::from_i32(code) {
            ErrorCode::Constraint => Self::Generic(message.unwrap_or_else(|| "constraint failed".to_owned())),
            ErrorCode::Busy => Self::Busy,
            ErrorCode::Full => Self::Full,
            ErrorCode::TooBig => Self::TooBig,
            ErrorCode::NoMem => Self::OutOfMemory,
            ErrorCode::Interrupt => Self::Interrupted,
            ErrorCode::Schema => Self::SchemaChanged,
            ErrorCode::Corrupt => Self::corrupt(message.unwrap_or_default()),
            ErrorCode::ReadOnly => Self::ReadOnly,
            other => Self::Generic(message.unwrap_or_else(|| other.description().to_owned())),
        }
    }
}

/// Result type alias using `SqlvmError`.
pub type Result<T> = std::result::Result<T, SqlvmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_corrupt() {
        let err = SqlvmError::corrupt("header overruns payload");
        assert_eq!(
            err.to_string(),
            "database disk image is malformed: header overruns payload"
        );
    }

    #[test]
    fn error_display_constraint() {
        let err = SqlvmError::constraint(ConstraintKind::Unique, "t1.a");
        assert_eq!(err.to_string(), "UNIQUE constraint failed: t1.a");

        let bare = SqlvmError::Constraint {
            kind: ConstraintKind::ForeignKey,
            detail: None,
        };
        assert_eq!(bare.to_string(), "FOREIGN KEY constraint failed");
    }

    #[test]
    fn error_code_mapping() {
        assert_eq!(SqlvmError::Busy.error_code(), ErrorCode::Busy);
        assert_eq!(SqlvmError::corrupt("x").error_code(), ErrorCode::Corrupt);
        assert_eq!(SqlvmError::Full.error_code(), ErrorCode::Full);
        assert_eq!(SqlvmError::TooBig.error_code(), ErrorCode::TooBig);
        assert_eq!(SqlvmError::OutOfMemory.error_code(), ErrorCode::NoMem);
        assert_eq!(SqlvmError::Interrupted.error_code(), ErrorCode::Interrupt);
        assert_eq!(SqlvmError::SchemaChanged.error_code(), ErrorCode::Schema);
        assert_eq!(
            SqlvmError::constraint(ConstraintKind::Check, "c").error_code(),
            ErrorCode::Constraint
        );
        assert_eq!(ErrorCode::Row as i32, 100);
        assert_eq!(ErrorCode::Done as i32, 101);
    }

    #[test]
    fn error_code_from_raw() {
        assert_eq!(ErrorCode::from_i32(19), ErrorCode::Constraint);
        assert_eq!(ErrorCode::from_i32(17), ErrorCode::Schema);
        assert_eq!(ErrorCode::from_i32(4242), ErrorCode::Error);
    }

    #[test]
    fn constraint_kind_from_p5() {
        assert_eq!(ConstraintKind::from_p5(1), Some(ConstraintKind::NotNull));
        assert_eq!(ConstraintKind::from_p5(4), Some(ConstraintKind::ForeignKey));
        assert_eq!(ConstraintKind::from_p5(0), None);
        assert_eq!(ConstraintKind::from_p5(5), None);
    }

    #[test]
    fn halt_error_construction() {
        let err = SqlvmError::from_halt(19, Some(ConstraintKind::NotNull), Some("t.x"));
        assert_eq!(err.to_string(), "NOT NULL constraint failed: t.x");

        let err = SqlvmError::from_halt(1, None, Some("custom failure"));
        assert_eq!(err.to_string(), "custom failure");

        let err = SqlvmError::from_halt(1, None, None);
        assert_eq!(err.to_string(), "SQL logic error");
    }

    #[test]
    fn is_transient() {
        assert!(SqlvmError::Busy.is_transient());
        assert!(!SqlvmError::Full.is_transient());
        assert!(!SqlvmError::SchemaChanged.is_transient());
    }

    #[test]
    fn user_recoverable() {
        assert!(SqlvmError::SchemaChanged.is_user_recoverable());
        assert!(SqlvmError::Busy.is_user_recoverable());
        assert!(!SqlvmError::internal("bug").is_user_recoverable());
    }

    #[test]
    fn forces_rollback_classes() {
        assert!(SqlvmError::Full.forces_rollback());
        assert!(SqlvmError::Interrupted.forces_rollback());
        assert!(!SqlvmError::constraint(ConstraintKind::Unique, "x").forces_rollback());
    }

    #[test]
    fn suggestions() {
        assert!(SqlvmError::Busy.suggestion().is_some());
        assert!(SqlvmError::SchemaChanged.suggestion().is_some());
        assert!(SqlvmError::internal("x").suggestion().is_none());
    }

    #[test]
    fn io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: SqlvmError = io.into();
        assert_eq!(err.error_code(), ErrorCode::IoErr);
    }
}
