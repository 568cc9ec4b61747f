//! Register cells.
//!
//! A [`Mem`] is one slot of the register file. String and blob contents are
//! held in a [`Buf`] whose variant records who owns the bytes:
//!
//! - `Owned`: the cell owns a private buffer.
//! - `Static`: shared, immutable bytes from the program text (P4 constants).
//! - `Ephemeral`: a window onto a cursor's current row payload, tagged with the
//!   decode generation it was read under. It goes stale once that cursor moves
//!   and must be [materialized](Mem::materialize) before the value outlives the
//!   row.
//!
//! `EphemeralBuf` is deliberately not `Clone`; copies go through
//! [`Mem::shallow_copy`] or [`Mem::deep_copy`] so every aliasing point is
//! explicit.

use std::any::Any;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use sqlvm_error::{Result, SqlvmError};

use crate::numeric::{self, Numeric};
use crate::rowset::RowSet;
use crate::value::{affinity_number, format_real, SqlValue, ValueRef};
use crate::Affinity;

/// Bytes borrowed from a cursor row payload.
pub struct EphemeralBuf {
    payload: Arc<[u8]>,
    range: Range<usize>,
    generation: u64,
}

impl EphemeralBuf {
    pub fn new(payload: Arc<[u8]>, range: Range<usize>, generation: u64) -> Self {
        debug_assert!(range.start <= range.end && range.end <= payload.len());
        Self {
            payload,
            range,
            generation,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.payload[self.range.clone()]
    }

    /// Decode generation of the cursor row this window was taken from.
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    fn alias(&self) -> Self {
        Self {
            payload: Arc::clone(&self.payload),
            range: self.range.clone(),
            generation: self.generation,
        }
    }
}

impl fmt::Debug for EphemeralBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralBuf")
            .field("len", &self.range.len())
            .field("generation", &self.generation)
            .finish()
    }
}

/// Byte storage of a text or blob cell.
#[derive(Debug)]
pub enum Buf {
    Owned(Vec<u8>),
    Static(Arc<[u8]>),
    Ephemeral(EphemeralBuf),
}

impl Buf {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Owned(v) => v,
            Self::Static(s) => s,
            Self::Ephemeral(e) => e.bytes(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn is_ephemeral(&self) -> bool {
        matches!(self, Self::Ephemeral(_))
    }

    pub fn into_vec(self) -> Vec<u8> {
        match self {
            Self::Owned(v) => v,
            other => other.as_bytes().to_vec(),
        }
    }

    /// Same bytes, same ownership class. Owned buffers cannot be aliased and
    /// are copied.
    fn alias(&self) -> Self {
        match self {
            Self::Owned(v) => Self::Owned(v.clone()),
            Self::Static(s) => Self::Static(Arc::clone(s)),
            Self::Ephemeral(e) => Self::Ephemeral(e.alias()),
        }
    }
}

impl From<Vec<u8>> for Buf {
    fn from(v: Vec<u8>) -> Self {
        Self::Owned(v)
    }
}

/// Type-erased aggregate accumulator held in a register between `AggStep`
/// and `AggFinal`.
pub struct AggCell(pub Box<dyn Any + Send>);

impl fmt::Debug for AggCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AggCell(..)")
    }
}

/// Rendezvous point of a coroutine: the address the other side resumes at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoroutineSlot {
    pub resume_at: usize,
}

/// One register.
#[derive(Debug, Default)]
pub enum Mem {
    #[default]
    Null,
    Integer(i64),
    Real(f64),
    Text(Buf),
    /// Blob bytes plus `zero_tail` implied trailing zero bytes.
    Blob { buf: Buf, zero_tail: usize },
    RowSet(Box<RowSet>),
    Agg(AggCell),
    Coroutine(CoroutineSlot),
    /// Content deliberately invalidated (e.g. a `Return` address register
    /// after use). Reads as NULL.
    Undefined,
}

impl Mem {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(Buf::Owned(s.into().into_bytes()))
    }

    pub fn blob(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Blob {
            buf: Buf::Owned(bytes.into()),
            zero_tail: 0,
        }
    }

    pub const fn zero_blob(len: usize) -> Self {
        Self::Blob {
            buf: Buf::Owned(Vec::new()),
            zero_tail: len,
        }
    }

    /// Shared text from a program constant.
    pub fn static_text(bytes: &Arc<[u8]>) -> Self {
        Self::Text(Buf::Static(Arc::clone(bytes)))
    }

    pub fn static_blob(bytes: &Arc<[u8]>) -> Self {
        Self::Blob {
            buf: Buf::Static(Arc::clone(bytes)),
            zero_tail: 0,
        }
    }

    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null | Self::Undefined)
    }

    pub const fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer(_) | Self::Real(_))
    }

    pub fn is_ephemeral(&self) -> bool {
        match self {
            Self::Text(b) | Self::Blob { buf: b, .. } => b.is_ephemeral(),
            _ => false,
        }
    }

    /// Generation tag of an ephemeral buffer.
    pub fn ephemeral_generation(&self) -> Option<u64> {
        match self {
            Self::Text(Buf::Ephemeral(e)) | Self::Blob {
                buf: Buf::Ephemeral(e),
                ..
            } => Some(e.generation()),
            _ => None,
        }
    }

    pub fn as_value_ref(&self) -> ValueRef<'_> {
        match self {
            Self::Integer(i) => ValueRef::Integer(*i),
            Self::Real(r) => ValueRef::Real(*r),
            Self::Text(b) => ValueRef::Text(b.as_bytes()),
            Self::Blob { buf, zero_tail } => ValueRef::Blob(buf.as_bytes(), *zero_tail),
            Self::Null
            | Self::Undefined
            | Self::RowSet(_)
            | Self::Agg(_)
            | Self::Coroutine(_) => ValueRef::Null,
        }
    }

    /// Owned snapshot of the value. Zero tails are expanded.
    pub fn to_value(&self) -> SqlValue {
        self.as_value_ref().to_owned_value()
    }

    /// Raw bytes of a text or blob cell, excluding any zero tail.
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Text(b) | Self::Blob { buf: b, .. } => Some(b.as_bytes()),
            _ => None,
        }
    }

    /// Content length in bytes (text, blob including zero tail); 0 otherwise.
    pub fn byte_len(&self) -> usize {
        match self {
            Self::Text(b) => b.len(),
            Self::Blob { buf, zero_tail } => buf.len() + zero_tail,
            _ => 0,
        }
    }

    pub fn too_big(&self, limit: usize) -> bool {
        self.byte_len() > limit
    }

    /// Integer value with cast semantics.
    pub fn integer_value(&self) -> i64 {
        match self {
            Self::Integer(i) => *i,
            Self::Real(r) => numeric::real_to_i64(*r),
            Self::Text(b) | Self::Blob { buf: b, .. } => numeric::prefix_to_i64(b.as_bytes()),
            _ => 0,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn real_value(&self) -> f64 {
        match self {
            Self::Integer(i) => *i as f64,
            Self::Real(r) => *r,
            Self::Text(b) | Self::Blob { buf: b, .. } => numeric::prefix_to_f64(b.as_bytes()),
            _ => 0.0,
        }
    }

    /// Number used when the cell is an arithmetic operand.
    pub fn numeric_value(&self) -> Numeric {
        match self {
            Self::Integer(i) => Numeric::Int(*i),
            Self::Real(r) => Numeric::Real(*r),
            Self::Text(b) | Self::Blob { buf: b, .. } => numeric::prefix_numeric(b.as_bytes()),
            _ => Numeric::Int(0),
        }
    }

    /// Truth value for `If`/`IfNot`; `None` for NULL.
    pub fn truth(&self) -> Option<bool> {
        match self {
            Self::Integer(i) => Some(*i != 0),
            _ if self.is_null() => None,
            _ => Some(self.real_value() != 0.0),
        }
    }

    // ── Copies ───────────────────────────────────────────────────────────

    /// Copy that aliases the source bytes where possible. An ephemeral source
    /// yields an ephemeral copy with the same generation tag.
    pub fn shallow_copy(&self) -> Self {
        match self {
            Self::Null => Self::Null,
            Self::Integer(i) => Self::Integer(*i),
            Self::Real(r) => Self::Real(*r),
            Self::Text(b) => Self::Text(b.alias()),
            Self::Blob { buf, zero_tail } => Self::Blob {
                buf: buf.alias(),
                zero_tail: *zero_tail,
            },
            Self::Coroutine(slot) => Self::Coroutine(*slot),
            Self::RowSet(_) | Self::Agg(_) | Self::Undefined => Self::Null,
        }
    }

    /// Copy that owns its bytes.
    pub fn deep_copy(&self) -> Self {
        let mut copy = self.shallow_copy();
        copy.make_owned();
        copy
    }

    /// Convert an ephemeral buffer into an owned one in place.
    pub fn materialize(&mut self) {
        if self.is_ephemeral() {
            self.make_owned();
        }
    }

    fn make_owned(&mut self) {
        match self {
            Self::Text(b) | Self::Blob { buf: b, .. } if !matches!(b, Buf::Owned(_)) => {
                *b = Buf::Owned(b.as_bytes().to_vec());
            }
            _ => {}
        }
    }

    /// Write the implied zero tail of a blob as real bytes.
    pub fn expand_zero_blob(&mut self, limit: usize) -> Result<()> {
        if let Self::Blob { buf, zero_tail } = self {
            if *zero_tail == 0 {
                return Ok(());
            }
            let total = buf.len() + *zero_tail;
            if total > limit {
                return Err(SqlvmError::TooBig);
            }
            let mut bytes = std::mem::replace(buf, Buf::Owned(Vec::new())).into_vec();
            bytes.resize(total, 0);
            *buf = Buf::Owned(bytes);
            *zero_tail = 0;
        }
        Ok(())
    }

    // ── Conversions ──────────────────────────────────────────────────────

    /// Render numbers as text in place; other cells are unchanged.
    pub fn stringify(&mut self) {
        let rendered = match self {
            Self::Integer(i) => i.to_string(),
            Self::Real(r) => format_real(*r),
            _ => return,
        };
        *self = Self::text(rendered);
    }

    pub fn integerify(&mut self) {
        if !matches!(self, Self::Integer(_)) {
            *self = Self::Integer(self.integer_value());
        }
    }

    pub fn realify(&mut self) {
        if !matches!(self, Self::Real(_)) {
            *self = Self::Real(self.real_value());
        }
    }

    /// Soft conversion applied when a value is stored or compared.
    ///
    /// Numeric affinities only touch text that is entirely numeric; TEXT
    /// affinity only touches numbers. NULL never changes.
    pub fn apply_affinity(&mut self, affinity: Affinity) {
        match affinity {
            Affinity::Blob => {}
            Affinity::Text => self.stringify(),
            Affinity::Numeric | Affinity::Integer | Affinity::Real => {
                if let Self::Text(b) = self {
                    if let Some(n) = affinity_number(b.as_bytes()) {
                        *self = n.into();
                    }
                }
            }
        }
    }

    /// Hard conversion for `CAST(x AS type)`. NULL stays NULL.
    pub fn cast(&mut self, target: Affinity) {
        if self.is_null() {
            *self = Self::Null;
            return;
        }
        match target {
            Affinity::Blob => {
                self.stringify();
                if matches!(self, Self::Text(_)) {
                    if let Self::Text(buf) = std::mem::take(self) {
                        *self = Self::Blob { buf, zero_tail: 0 };
                    }
                }
            }
            Affinity::Text => {
                self.stringify();
                if matches!(self, Self::Blob { .. }) {
                    // The limit was enforced when the zero blob was created.
                    if let Err(err) = self.expand_zero_blob(usize::MAX) {
                        tracing::warn!(%err, "zero-filled blob left unexpanded");
                    }
                    // Text cells always hold UTF-8, which records rely on.
                    if let Self::Blob { buf, .. } = std::mem::take(self) {
                        *self = match String::from_utf8(buf.into_vec()) {
                            Ok(text) => Self::text(text),
                            Err(err) => Self::text(String::from_utf8_lossy(err.as_bytes())),
                        };
                    }
                }
            }
            Affinity::Numeric => {
                if let Self::Text(b) | Self::Blob { buf: b, .. } = self {
                    let bytes = b.as_bytes();
                    *self = match numeric::classify_text(bytes) {
                        Some(Numeric::Int(i)) => Self::Integer(i),
                        _ => {
                            let r = numeric::prefix_to_f64(bytes);
                            numeric::real_as_exact_i64(r).map_or(Self::Real(r), Self::Integer)
                        }
                    };
                }
            }
            Affinity::Integer => self.integerify(),
            Affinity::Real => self.realify(),
        }
    }
}

impl From<Numeric> for Mem {
    fn from(n: Numeric) -> Self {
        match n {
            Numeric::Int(i) => Self::Integer(i),
            Numeric::Real(r) => Self::Real(r),
        }
    }
}

impl From<SqlValue> for Mem {
    fn from(v: SqlValue) -> Self {
        match v {
            SqlValue::Null => Self::Null,
            SqlValue::Integer(i) => Self::Integer(i),
            SqlValue::Real(r) => Self::Real(r),
            SqlValue::Text(s) => Self::Text(Buf::Owned(s.into_bytes())),
            SqlValue::Blob(b) => Self::blob(b),
        }
    }
}

impl From<&SqlValue> for Mem {
    fn from(v: &SqlValue) -> Self {
        Self::from(v.clone())
    }
}
