//! Value ordering and key comparison.
//!
//! Storage classes order NULL < numeric < text < blob. Integers and reals
//! compare by exact mathematical value, text under a collating sequence, and
//! blobs byte-wise (implied zero tails included).

use std::cmp::Ordering;
use std::iter;

use sqlvm_error::Result;

use crate::collation::CollSeq;
use crate::mem::Mem;
use crate::record::decode_record_prefix;
use crate::value::{SqlValue, ValueRef};
use crate::SortOrder;

/// Compare an integer with a real without losing precision for magnitudes
/// above 2^53.
#[allow(clippy::cast_possible_truncation)]
pub fn int_float_cmp(i: i64, r: f64) -> Ordering {
    const LOW: f64 = -9_223_372_036_854_775_808.0;
    const HIGH: f64 = 9_223_372_036_854_775_808.0;
    if r.is_nan() {
        return Ordering::Greater;
    }
    if r < LOW {
        return Ordering::Greater;
    }
    if r >= HIGH {
        return Ordering::Less;
    }
    let whole = r.trunc();
    match i.cmp(&(whole as i64)) {
        // Equal integer parts: the fractional part decides.
        Ordering::Equal => 0.0_f64.partial_cmp(&(r - whole)).unwrap_or(Ordering::Equal),
        other => other,
    }
}

fn blob_cmp(a: &[u8], a_zeros: usize, b: &[u8], b_zeros: usize) -> Ordering {
    let left = a.iter().copied().chain(iter::repeat(0).take(a_zeros));
    let right = b.iter().copied().chain(iter::repeat(0).take(b_zeros));
    left.cmp(right)
}

/// Compare two values. `coll` applies to text pairs; `None` means BINARY.
pub fn compare_refs(a: ValueRef<'_>, b: ValueRef<'_>, coll: Option<&CollSeq>) -> Ordering {
    let (ca, cb) = (a.sort_class(), b.sort_class());
    if ca != cb {
        return ca.cmp(&cb);
    }
    match (a, b) {
        (ValueRef::Integer(x), ValueRef::Integer(y)) => x.cmp(&y),
        (ValueRef::Real(x), ValueRef::Real(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (ValueRef::Integer(x), ValueRef::Real(y)) => int_float_cmp(x, y),
        (ValueRef::Real(x), ValueRef::Integer(y)) => int_float_cmp(y, x).reverse(),
        (ValueRef::Text(x), ValueRef::Text(y)) => match coll {
            Some(c) => c.compare(x, y),
            None => x.cmp(y),
        },
        (ValueRef::Blob(x, zx), ValueRef::Blob(y, zy)) => blob_cmp(x, zx, y, zy),
        _ => Ordering::Equal,
    }
}

/// Compare two register cells.
pub fn mem_compare(a: &Mem, b: &Mem, coll: Option<&CollSeq>) -> Ordering {
    compare_refs(a.as_value_ref(), b.as_value_ref(), coll)
}

// ── Keys ───────────────────────────────────────────────────────────────────

/// Collation and direction of one key column.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeyField {
    pub collation: CollSeq,
    pub order: SortOrder,
}

/// Describes how the columns of an index key or sorter row compare.
///
/// Columns beyond `fields` compare as BINARY ascending.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeyInfo {
    pub fields: Vec<KeyField>,
}

impl KeyInfo {
    /// `n` BINARY ascending columns.
    pub fn binary(n: usize) -> Self {
        Self {
            fields: vec![KeyField::default(); n],
        }
    }

    pub fn from_orders(orders: &[SortOrder]) -> Self {
        Self {
            fields: orders
                .iter()
                .map(|&order| KeyField {
                    collation: CollSeq::binary(),
                    order,
                })
                .collect(),
        }
    }

    pub fn with_collation(mut self, column: usize, collation: CollSeq) -> Self {
        if self.fields.len() <= column {
            self.fields.resize(column + 1, KeyField::default());
        }
        self.fields[column].collation = collation;
        self
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Compare column `idx` of two keys, honouring collation and direction.
    pub fn compare_column(&self, idx: usize, a: ValueRef<'_>, b: ValueRef<'_>) -> Ordering {
        let (coll, order) = self
            .fields
            .get(idx)
            .map_or((None, SortOrder::Asc), |f| (Some(&f.collation), f.order));
        let ord = compare_refs(a, b, coll);
        match order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    }

    /// Compare two value lists over their common prefix.
    pub fn compare_values(&self, a: &[SqlValue], b: &[SqlValue]) -> Ordering {
        a.iter()
            .zip(b)
            .enumerate()
            .map(|(idx, (x, y))| self.compare_column(idx, x.as_value_ref(), y.as_value_ref()))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }

    /// Total order over two encoded records; the shorter record sorts first
    /// when one is a prefix of the other.
    pub fn compare_records(&self, a: &[u8], b: &[u8]) -> Result<Ordering> {
        let left = decode_record_prefix(a, usize::MAX)?;
        let right = decode_record_prefix(b, usize::MAX)?;
        Ok(self
            .compare_values(&left, &right)
            .then(left.len().cmp(&right.len())))
    }
}

/// A search key already split into values.
///
/// When every key field compares equal to the corresponding record field the
/// comparison reports `default_rc`. Seeks use it to land just before
/// (`Greater`) or just after (`Less`) a run of equal prefixes.
#[derive(Debug, Clone, PartialEq)]
pub struct UnpackedRecord {
    pub values: Vec<SqlValue>,
    pub default_rc: Ordering,
}

impl UnpackedRecord {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self {
            values,
            default_rc: Ordering::Equal,
        }
    }

    #[must_use]
    pub fn with_default_rc(mut self, default_rc: Ordering) -> Self {
        self.default_rc = default_rc;
        self
    }

    pub fn has_null(&self) -> bool {
        self.values.iter().any(SqlValue::is_null)
    }

    /// Order of the stored `record` relative to this key.
    pub fn compare_to_record(&self, record: &[u8], key_info: &KeyInfo) -> Result<Ordering> {
        let stored = decode_record_prefix(record, self.values.len())?;
        let ord = stored
            .iter()
            .zip(&self.values)
            .enumerate()
            .map(|(idx, (s, k))| key_info.compare_column(idx, s.as_value_ref(), k.as_value_ref()))
            .find(|o| o.is_ne());
        Ok(ord.unwrap_or(self.default_rc))
    }
}
