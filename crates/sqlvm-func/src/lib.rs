//! Function interface for the sqlvm interpreter.
//!
//! Scalar functions run through a [`FunctionContext`]; aggregates keep a
//! type-erased accumulator in a register between `AggStep` calls. The
//! [`FunctionRegistry`] resolves `Function`/`AggStep` operands by
//! `(name, argument count)` with a variadic fallback.
#![allow(clippy::unnecessary_literal_bound)]

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

pub mod agg_builtins;
pub mod aggregate;
pub mod builtins;
pub mod scalar;

pub use agg_builtins::register_aggregate_builtins;
pub use aggregate::{AggregateAdapter, AggregateFunction};
pub use builtins::register_builtins;
pub use scalar::{FunctionContext, ScalarFunction};

/// Type-erased aggregate function object used by the registry.
pub type ErasedAggregateFunction = dyn AggregateFunction<State = Box<dyn Any + Send>>;

/// Lookup key: `(UPPERCASE name, num_args)`; `-1` means variadic.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct FunctionKey {
    pub name: String,
    pub num_args: i32,
}

impl FunctionKey {
    pub fn new(name: &str, num_args: i32) -> Self {
        Self {
            name: name.to_ascii_uppercase(),
            num_args,
        }
    }
}

/// Scalar and aggregate functions keyed by `(name, num_args)`.
///
/// Lookup tries the exact arity first, then the variadic entry.
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    scalars: HashMap<FunctionKey, Arc<dyn ScalarFunction>>,
    aggregates: HashMap<FunctionKey, Arc<ErasedAggregateFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in scalar and aggregate.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        register_builtins(&mut registry);
        register_aggregate_builtins(&mut registry);
        registry
    }

    /// Register a scalar function, returning the one it replaced.
    pub fn register_scalar<F>(&mut self, function: F) -> Option<Arc<dyn ScalarFunction>>
    where
        F: ScalarFunction + 'static,
    {
        let key = FunctionKey::new(function.name(), function.num_args());
        self.scalars.insert(key, Arc::new(function))
    }

    pub fn register_aggregate<F>(&mut self, function: F) -> Option<Arc<ErasedAggregateFunction>>
    where
        F: AggregateFunction + 'static,
        F::State: 'static,
    {
        let key = FunctionKey::new(function.name(), function.num_args());
        self.aggregates
            .insert(key, Arc::new(AggregateAdapter::new(function)))
    }

    pub fn find_scalar(&self, name: &str, num_args: i32) -> Option<Arc<dyn ScalarFunction>> {
        let found = lookup(&self.scalars, name, num_args);
        debug!(name, arity = num_args, kind = "scalar", hit = found.is_some(), "registry lookup");
        found
    }

    pub fn find_aggregate(
        &self,
        name: &str,
        num_args: i32,
    ) -> Option<Arc<ErasedAggregateFunction>> {
        let found = lookup(&self.aggregates, name, num_args);
        debug!(name, arity = num_args, kind = "aggregate", hit = found.is_some(), "registry lookup");
        found
    }
}

fn lookup<T: ?Sized>(
    map: &HashMap<FunctionKey, Arc<T>>,
    name: &str,
    num_args: i32,
) -> Option<Arc<T>> {
    let mut key = FunctionKey::new(name, num_args);
    if let Some(f) = map.get(&key) {
        return Some(Arc::clone(f));
    }
    key.num_args = -1;
    map.get(&key).map(Arc::clone)
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("scalars", &self.scalars.len())
            .field("aggregates", &self.aggregates.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use sqlvm_types::SqlValue;

    use super::*;

    #[test]
    fn test_lookup_case_insensitive_with_variadic_fallback() {
        let registry = FunctionRegistry::with_builtins();
        assert!(registry.find_scalar("ABS", 1).is_some());
        assert!(registry.find_scalar("abs", 2).is_none());
        // coalesce is variadic.
        assert!(registry.find_scalar("Coalesce", 5).is_some());
    }

    #[test]
    fn test_count_star_and_count_x_are_distinct() {
        let registry = FunctionRegistry::with_builtins();
        let star = registry.find_aggregate("count", 0).unwrap();
        let col = registry.find_aggregate("count", 1).unwrap();
        let mut a = star.initial_state();
        let mut b = col.initial_state();
        star.step(&mut a, &[]).unwrap();
        col.step(&mut b, &[SqlValue::Null]).unwrap();
        assert_eq!(star.finalize(a).unwrap(), SqlValue::Integer(1));
        assert_eq!(col.finalize(b).unwrap(), SqlValue::Integer(0));
    }

    #[test]
    fn test_register_replaces_existing() {
        let mut registry = FunctionRegistry::new();
        assert!(registry.register_scalar(builtins::AbsFunc).is_none());
        assert!(registry.register_scalar(builtins::AbsFunc).is_some());
    }
}
