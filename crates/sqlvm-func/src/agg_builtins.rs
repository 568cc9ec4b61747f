//! Built-in aggregate functions: avg, count, group_concat, max, min, sum,
//! total.
//!
//! Every aggregate skips NULL arguments except `count(*)`. On an empty input
//! `count` gives 0, `total` 0.0 and the rest NULL.
#![allow(
    clippy::unnecessary_literal_bound,
    clippy::cast_precision_loss
)]

use std::cmp::Ordering;

use sqlvm_error::{Result, SqlvmError};
use sqlvm_types::compare::compare_refs;
use sqlvm_types::SqlValue;

use crate::{AggregateFunction, FunctionRegistry};

// ═══════════════════════════════════════════════════════════════════════════
// count(*) and count(X)
// ═══════════════════════════════════════════════════════════════════════════

pub struct CountStarFunc;

impl AggregateFunction for CountStarFunc {
    type State = i64;

    fn initial_state(&self) -> i64 {
        0
    }

    fn step(&self, state: &mut i64, _args: &[SqlValue]) -> Result<()> {
        *state += 1;
        Ok(())
    }

    fn finalize(&self, state: i64) -> Result<SqlValue> {
        Ok(SqlValue::Integer(state))
    }

    fn num_args(&self) -> i32 {
        0
    }

    fn name(&self) -> &str {
        "count"
    }
}

pub struct CountFunc;

impl AggregateFunction for CountFunc {
    type State = i64;

    fn initial_state(&self) -> i64 {
        0
    }

    fn step(&self, state: &mut i64, args: &[SqlValue]) -> Result<()> {
        if !args.first().map_or(true, SqlValue::is_null) {
            *state += 1;
        }
        Ok(())
    }

    fn finalize(&self, state: i64) -> Result<SqlValue> {
        Ok(SqlValue::Integer(state))
    }

    fn num_args(&self) -> i32 {
        1
    }

    fn name(&self) -> &str {
        "count"
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// sum(X), total(X), avg(X)
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct SumState {
    int_sum: i64,
    real_sum: f64,
    /// A non-integer was added; the result is real.
    approx: bool,
    overflow: bool,
    count: i64,
}

impl SumState {
    fn add(&mut self, v: &SqlValue) {
        if v.is_null() {
            return;
        }
        self.count += 1;
        match v {
            SqlValue::Integer(i) => {
                self.real_sum += *i as f64;
                if !self.overflow {
                    match self.int_sum.checked_add(*i) {
                        Some(s) => self.int_sum = s,
                        None => self.overflow = true,
                    }
                }
            }
            other => {
                self.approx = true;
                self.real_sum += other.to_real();
            }
        }
    }
}

pub struct SumFunc;

impl AggregateFunction for SumFunc {
    type State = SumState;

    fn initial_state(&self) -> SumState {
        SumState::default()
    }

    fn step(&self, state: &mut SumState, args: &[SqlValue]) -> Result<()> {
        if let Some(v) = args.first() {
            state.add(v);
        }
        Ok(())
    }

    fn finalize(&self, state: SumState) -> Result<SqlValue> {
        if state.count == 0 {
            Ok(SqlValue::Null)
        } else if state.approx {
            Ok(SqlValue::Real(state.real_sum))
        } else if state.overflow {
            Err(SqlvmError::function_error("integer overflow"))
        } else {
            Ok(SqlValue::Integer(state.int_sum))
        }
    }

    fn num_args(&self) -> i32 {
        1
    }

    fn name(&self) -> &str {
        "sum"
    }
}

pub struct TotalFunc;

impl AggregateFunction for TotalFunc {
    type State = SumState;

    fn initial_state(&self) -> SumState {
        SumState::default()
    }

    fn step(&self, state: &mut SumState, args: &[SqlValue]) -> Result<()> {
        if let Some(v) = args.first() {
            state.add(v);
        }
        Ok(())
    }

    fn finalize(&self, state: SumState) -> Result<SqlValue> {
        Ok(SqlValue::Real(state.real_sum))
    }

    fn num_args(&self) -> i32 {
        1
    }

    fn name(&self) -> &str {
        "total"
    }
}

pub struct AvgFunc;

impl AggregateFunction for AvgFunc {
    type State = SumState;

    fn initial_state(&self) -> SumState {
        SumState::default()
    }

    fn step(&self, state: &mut SumState, args: &[SqlValue]) -> Result<()> {
        if let Some(v) = args.first() {
            state.add(v);
        }
        Ok(())
    }

    fn finalize(&self, state: SumState) -> Result<SqlValue> {
        if state.count == 0 {
            Ok(SqlValue::Null)
        } else {
            Ok(SqlValue::Real(state.real_sum / state.count as f64))
        }
    }

    fn num_args(&self) -> i32 {
        1
    }

    fn name(&self) -> &str {
        "avg"
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// min(X), max(X)
// ═══════════════════════════════════════════════════════════════════════════

pub struct MinMaxFunc {
    keep: Ordering,
}

impl MinMaxFunc {
    pub const MIN: Self = Self {
        keep: Ordering::Less,
    };
    pub const MAX: Self = Self {
        keep: Ordering::Greater,
    };
}

impl AggregateFunction for MinMaxFunc {
    type State = Option<SqlValue>;

    fn initial_state(&self) -> Option<SqlValue> {
        None
    }

    fn step(&self, state: &mut Option<SqlValue>, args: &[SqlValue]) -> Result<()> {
        let Some(v) = args.first().filter(|v| !v.is_null()) else {
            return Ok(());
        };
        let replace = state
            .as_ref()
            .map_or(true, |best| compare_refs(v.as_value_ref(), best.as_value_ref(), None) == self.keep);
        if replace {
            *state = Some(v.clone());
        }
        Ok(())
    }

    fn finalize(&self, state: Option<SqlValue>) -> Result<SqlValue> {
        Ok(state.unwrap_or_default())
    }

    fn num_args(&self) -> i32 {
        1
    }

    fn name(&self) -> &str {
        if self.keep == Ordering::Less {
            "min"
        } else {
            "max"
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// group_concat(X [, SEP])
// ═══════════════════════════════════════════════════════════════════════════

pub struct GroupConcatFunc {
    with_separator: bool,
}

impl AggregateFunction for GroupConcatFunc {
    type State = Option<String>;

    fn initial_state(&self) -> Option<String> {
        None
    }

    fn step(&self, state: &mut Option<String>, args: &[SqlValue]) -> Result<()> {
        let Some(v) = args.first().filter(|v| !v.is_null()) else {
            return Ok(());
        };
        match state {
            Some(acc) => {
                match args.get(1) {
                    Some(sep) if self.with_separator => {
                        if !sep.is_null() {
                            acc.push_str(&sep.to_text());
                        }
                    }
                    _ => acc.push(','),
                }
                acc.push_str(&v.to_text());
            }
            None => *state = Some(v.to_text()),
        }
        Ok(())
    }

    fn finalize(&self, state: Option<String>) -> Result<SqlValue> {
        Ok(state.map_or(SqlValue::Null, SqlValue::Text))
    }

    fn num_args(&self) -> i32 {
        if self.with_separator {
            2
        } else {
            1
        }
    }

    fn name(&self) -> &str {
        "group_concat"
    }
}

/// Register every built-in aggregate.
pub fn register_aggregate_builtins(registry: &mut FunctionRegistry) {
    registry.register_aggregate(CountStarFunc);
    registry.register_aggregate(CountFunc);
    registry.register_aggregate(SumFunc);
    registry.register_aggregate(TotalFunc);
    registry.register_aggregate(AvgFunc);
    registry.register_aggregate(MinMaxFunc::MIN);
    registry.register_aggregate(MinMaxFunc::MAX);
    registry.register_aggregate(GroupConcatFunc {
        with_separator: false,
    });
    registry.register_aggregate(GroupConcatFunc {
        with_separator: true,
    });
}
