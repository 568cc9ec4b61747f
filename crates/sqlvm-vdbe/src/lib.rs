//! The sqlvm bytecode interpreter.
//!
//! Programs are built with [`sqlvm_types::ProgramBuilder`] and executed by a
//! [`Vdbe`] against a [`Connection`], which owns the attached databases and
//! the transaction counters shared by every running program.
//!
//! ```text
//! let mut vdbe = Vdbe::new(program);
//! while vdbe.step(&mut conn)? == StepResult::Row {
//!     consume(vdbe.row());
//! }
//! ```

pub mod config;
pub mod connection;
mod context;
pub mod cursor;
pub mod engine;
pub mod frame;
mod halt;
pub mod sorter;
mod txn;

pub use config::VdbeConfig;
pub use connection::{
    Connection, ConnectionStats, DbSlot, ProgressHandler, SchemaCache, SchemaObject, MAIN_DB,
};
pub use context::InterruptHandle;
pub use cursor::VdbeCursor;
pub use engine::{StatementStats, StepResult, Vdbe};
pub use frame::{FrameStack, VdbeFrame};
pub use sorter::Sorter;
