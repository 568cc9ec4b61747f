//! Aggregate function trait with a type-erased state adapter.
//!
//! The interpreter keeps an aggregate's accumulator in the register named by
//! `AggStep` P3, boxed as `Box<dyn Any + Send>`. [`AggregateAdapter`] lets a
//! function with a concrete state type live behind that erased interface.
#![allow(clippy::unnecessary_literal_bound)]

use std::any::Any;

use sqlvm_error::{Result, SqlvmError};
use sqlvm_types::SqlValue;

/// An aggregate SQL function.
///
/// # State lifecycle
///
/// 1. [`initial_state`](Self::initial_state) on the first `AggStep`, or at
///    `AggFinal` when no row was seen.
/// 2. [`step`](Self::step) once per row.
/// 3. [`finalize`](Self::finalize) consumes the state.
pub trait AggregateFunction: Send + Sync {
    type State: Send;

    fn initial_state(&self) -> Self::State;

    fn step(&self, state: &mut Self::State, args: &[SqlValue]) -> Result<()>;

    fn finalize(&self, state: Self::State) -> Result<SqlValue>;

    /// The number of arguments this function accepts (`-1` = variadic).
    fn num_args(&self) -> i32;

    fn name(&self) -> &str;
}

/// Wraps a concrete [`AggregateFunction`] so heterogeneous aggregates can be
/// stored behind one trait object.
pub struct AggregateAdapter<F> {
    inner: F,
}

impl<F> AggregateAdapter<F> {
    pub const fn new(inner: F) -> Self {
        Self { inner }
    }
}

fn state_mismatch(name: &str) -> SqlvmError {
    SqlvmError::internal(format!("aggregate state of {name} has the wrong type"))
}

impl<F> AggregateFunction for AggregateAdapter<F>
where
    F: AggregateFunction,
    F::State: 'static,
{
    type State = Box<dyn Any + Send>;

    fn initial_state(&self) -> Self::State {
        Box::new(self.inner.initial_state())
    }

    fn step(&self, state: &mut Self::State, args: &[SqlValue]) -> Result<()> {
        let concrete = state
            .downcast_mut::<F::State>()
            .ok_or_else(|| state_mismatch(self.inner.name()))?;
        self.inner.step(concrete, args)
    }

    fn finalize(&self, state: Self::State) -> Result<SqlValue> {
        let concrete = state
            .downcast::<F::State>()
            .map_err(|_| state_mismatch(self.inner.name()))?;
        self.inner.finalize(*concrete)
    }

    fn num_args(&self) -> i32 {
        self.inner.num_args()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
