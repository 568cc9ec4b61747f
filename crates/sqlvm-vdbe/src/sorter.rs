//! In-memory sorter behind the `Sorter*` opcodes.
//!
//! Records are buffered as encoded bytes until `sort`, which decodes every
//! record once and orders them under the sorter's [`KeyInfo`]. This is a
//! pipeline breaker: all rows must be inserted before the first is read.

use std::sync::Arc;

use sqlvm_error::Result;
use sqlvm_types::record::decode_record;
use sqlvm_types::{KeyInfo, SqlValue};
use tracing::debug;

#[derive(Debug)]
pub struct Sorter {
    key_info: Arc<KeyInfo>,
    rows: Vec<Arc<[u8]>>,
    pos: usize,
    sorted: bool,
}

impl Sorter {
    pub fn new(key_info: Arc<KeyInfo>) -> Self {
        Self {
            key_info,
            rows: Vec::new(),
            pos: 0,
            sorted: false,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn insert(&mut self, record: Vec<u8>) {
        self.rows.push(record.into());
        self.sorted = false;
    }

    /// Sort the buffered rows and rewind. `false` when the sorter is empty.
    pub fn sort(&mut self) -> Result<bool> {
        if !self.sorted {
            let mut keyed: Vec<(Vec<SqlValue>, Arc<[u8]>)> = self
                .rows
                .drain(..)
                .map(|row| decode_record(&row).map(|values| (values, row)))
                .collect::<Result<_>>()?;
            let info = &self.key_info;
            keyed.sort_by(|(a, _), (b, _)| {
                info.compare_values(a, b).then(a.len().cmp(&b.len()))
            });
            self.rows = keyed.into_iter().map(|(_, row)| row).collect();
            self.sorted = true;
            debug!(rows = self.rows.len(), "sorter sorted");
        }
        self.pos = 0;
        Ok(!self.rows.is_empty())
    }

    /// Advance to the next sorted row. `false` at the end.
    pub fn next(&mut self) -> bool {
        if self.pos < self.rows.len() {
            self.pos += 1;
        }
        self.pos < self.rows.len()
    }

    /// The record under the read position.
    pub fn current(&self) -> Option<&Arc<[u8]>> {
        if self.sorted {
            self.rows.get(self.pos)
        } else {
            None
        }
    }
}
