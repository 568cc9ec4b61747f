//! Scalar (row-level) function trait and its invocation context.
//!
//! A scalar function reads its arguments from a [`FunctionContext`] and
//! either sets a result or raises an error through it. The interpreter
//! checks the error flag after every call and turns it into a fault of the
//! calling `Function` instruction.
//!
//! # Send + Sync
//!
//! Function objects are shared through `Arc` by every connection that
//! registered them.
#![allow(clippy::unnecessary_literal_bound)]

use sqlvm_error::{Result, SqlvmError};
use sqlvm_types::{CollSeq, SqlValue};

/// Arguments, collation and output slot of one function call.
#[derive(Debug)]
pub struct FunctionContext<'a> {
    args: &'a [SqlValue],
    collation: Option<&'a CollSeq>,
    result: SqlValue,
    error: Option<String>,
    max_length: usize,
}

impl<'a> FunctionContext<'a> {
    pub fn new(args: &'a [SqlValue], collation: Option<&'a CollSeq>, max_length: usize) -> Self {
        Self {
            args,
            collation,
            result: SqlValue::Null,
            error: None,
            max_length,
        }
    }

    pub fn args(&self) -> &'a [SqlValue] {
        self.args
    }

    /// Argument `idx`, or NULL when the call passed fewer arguments.
    pub fn arg(&self, idx: usize) -> &'a SqlValue {
        static NULL: SqlValue = SqlValue::Null;
        self.args.get(idx).unwrap_or(&NULL)
    }

    /// Collation set by a preceding `CollSeq` instruction (BINARY if none).
    pub fn collation(&self) -> CollSeq {
        self.collation.cloned().unwrap_or_default()
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn set_result(&mut self, value: impl Into<SqlValue>) {
        self.result = value.into();
    }

    /// Raise a function error. The result is discarded.
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The call's outcome: the result, or the raised error.
    pub fn finish(self) -> Result<SqlValue> {
        match self.error {
            Some(msg) => Err(SqlvmError::function_error(msg)),
            None => Ok(self.result),
        }
    }
}

/// A scalar SQL function.
///
/// Domain errors go through [`FunctionContext::set_error`]; returning `Err`
/// is reserved for engine-level failures such as `TooBig`.
pub trait ScalarFunction: Send + Sync {
    fn invoke(&self, ctx: &mut FunctionContext<'_>) -> Result<()>;

    /// Whether the same arguments always give the same result.
    fn is_deterministic(&self) -> bool {
        true
    }

    /// The number of arguments this function accepts. `-1` means variadic.
    fn num_args(&self) -> i32;

    fn name(&self) -> &str;
}
