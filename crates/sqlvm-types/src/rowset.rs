//! Integer set used by `RowSetAdd`, `RowSetRead` and `RowSetTest`.
//!
//! Values are either drained in ascending order (`RowSetRead`) or probed for
//! membership in batches (`RowSetTest`). A membership probe only sees values
//! inserted before the current batch started: values added during batch `n`
//! become visible once a probe with a different batch number arrives.

use std::collections::BTreeSet;

use smallvec::SmallVec;

#[derive(Debug, Default)]
pub struct RowSet {
    /// Inserted since the last batch boundary or drain.
    pending: SmallVec<[i64; 8]>,
    /// Sorted, de-duplicated entries visible to probes and reads.
    settled: BTreeSet<i64>,
    batch: i32,
}

impl RowSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, value: i64) {
        self.pending.push(value);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.settled.is_empty()
    }

    fn settle(&mut self) {
        self.settled.extend(self.pending.drain(..));
    }

    /// Remove and return the smallest entry.
    pub fn pop_smallest(&mut self) -> Option<i64> {
        self.settle();
        self.settled.pop_first()
    }

    /// Whether `value` was inserted in an earlier batch than `batch`.
    ///
    /// Starting a new batch makes every previously inserted value visible.
    pub fn test(&mut self, batch: i32, value: i64) -> bool {
        if batch != self.batch {
            self.settle();
            self.batch = batch;
        }
        self.settled.contains(&value)
    }
}
