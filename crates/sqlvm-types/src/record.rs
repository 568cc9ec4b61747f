//! Record format: a varint header (its own size, then one serial type per
//! field) followed by the field payloads in order.
//!
//! Besides the whole-record encoder and decoder this module holds
//! [`RecordHeaderCache`], the per-cursor incremental header parser behind the
//! `Column` opcode.

use std::sync::Arc;

use smallvec::SmallVec;
use sqlvm_error::{Result, SqlvmError};

use crate::mem::{Buf, EphemeralBuf, Mem};
use crate::serial_type::{self, get_varint, put_varint, varint_len, SerialKind};
use crate::value::{SqlValue, ValueRef};

/// Largest header size accepted when decoding a stored row.
pub const MAX_HEADER_SIZE: u64 = 98_307;

/// An encoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRecord {
    pub bytes: Vec<u8>,
    /// Zero bytes implied after `bytes` (from a zero-filled trailing blob).
    pub zero_tail: usize,
}

impl EncodedRecord {
    pub fn total_len(&self) -> usize {
        self.bytes.len() + self.zero_tail
    }

    /// The record with its zero tail written out.
    pub fn into_bytes(mut self) -> Vec<u8> {
        let total = self.total_len();
        self.bytes.resize(total, 0);
        self.bytes
    }
}

/// Size of a record header holding the given serial types, including the
/// header-size varint itself.
pub fn header_size(serial_types: &[u64]) -> usize {
    let body: usize = serial_types.iter().map(|&t| varint_len(t)).sum();
    if body <= 126 {
        return body + 1;
    }
    let size_len = varint_len(body as u64);
    let mut total = body + size_len;
    // Adding the size varint can push the total over a varint boundary.
    if size_len < varint_len(total as u64) {
        total += 1;
    }
    total
}

fn serial_type_of(field: ValueRef<'_>) -> u64 {
    match field {
        ValueRef::Null => 0,
        ValueRef::Integer(i) => serial_type::for_integer(i),
        ValueRef::Real(_) => 7,
        ValueRef::Text(t) => serial_type::for_text(t.len()),
        ValueRef::Blob(b, zeros) => serial_type::for_blob(b.len() + zeros),
    }
}

fn put_int(out: &mut Vec<u8>, value: i64, serial_type: u64) {
    let width = match serial_type::classify(serial_type) {
        SerialKind::Int { width } => width,
        _ => return,
    };
    out.extend_from_slice(&value.to_be_bytes()[8 - width..]);
}

/// Encode fields into a record.
///
/// A zero tail on the last field is kept as a count in
/// [`EncodedRecord::zero_tail`]; zero tails on earlier fields are written out.
pub fn encode_fields<'a, I>(fields: I) -> EncodedRecord
where
    I: IntoIterator<Item = ValueRef<'a>>,
{
    let fields: SmallVec<[ValueRef<'a>; 16]> = fields.into_iter().collect();
    let types: SmallVec<[u64; 16]> = fields.iter().map(|f| serial_type_of(*f)).collect();
    let hdr = header_size(&types);

    let mut out = Vec::with_capacity(hdr + fields.len() * 8);
    put_varint(&mut out, hdr as u64);
    for &t in &types {
        put_varint(&mut out, t);
    }
    debug_assert_eq!(out.len(), hdr);

    let mut zero_tail = 0;
    let last = fields.len().saturating_sub(1);
    for (idx, (field, &ty)) in fields.iter().zip(&types).enumerate() {
        match *field {
            ValueRef::Null => {}
            ValueRef::Integer(i) => put_int(&mut out, i, ty),
            ValueRef::Real(r) => out.extend_from_slice(&r.to_bits().to_be_bytes()),
            ValueRef::Text(t) => out.extend_from_slice(t),
            ValueRef::Blob(b, zeros) => {
                out.extend_from_slice(b);
                if idx == last {
                    zero_tail = zeros;
                } else {
                    out.resize(out.len() + zeros, 0);
                }
            }
        }
    }
    EncodedRecord {
        bytes: out,
        zero_tail,
    }
}

/// Encode register cells into a record.
pub fn encode_cells(cells: &[Mem]) -> EncodedRecord {
    encode_fields(cells.iter().map(Mem::as_value_ref))
}

/// Encode owned values into a record.
pub fn encode_values(values: &[SqlValue]) -> Vec<u8> {
    encode_fields(values.iter().map(SqlValue::as_value_ref)).into_bytes()
}

fn corrupt(detail: &str) -> SqlvmError {
    tracing::error!(detail, "malformed record");
    SqlvmError::corrupt(detail)
}

#[allow(clippy::cast_possible_wrap)]
fn read_int(data: &[u8]) -> i64 {
    // Sign-extend from the first byte.
    let mut acc: i64 = if data.first().is_some_and(|b| b & 0x80 != 0) {
        -1
    } else {
        0
    };
    for &b in data {
        acc = (acc << 8) | i64::from(b);
    }
    acc
}

fn read_real(data: &[u8]) -> f64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[..8]);
    f64::from_bits(u64::from_be_bytes(raw))
}

/// Decode one field into an owned value.
pub fn decode_field(serial_type: u64, data: &[u8]) -> Result<SqlValue> {
    Ok(match serial_type::classify(serial_type) {
        SerialKind::Null => SqlValue::Null,
        SerialKind::Int { .. } => SqlValue::Integer(read_int(data)),
        SerialKind::Real => SqlValue::from(read_real(data)),
        SerialKind::Const(c) => SqlValue::Integer(c),
        SerialKind::Reserved => return Err(corrupt("reserved serial type")),
        SerialKind::Text { .. } => SqlValue::Text(
            String::from_utf8(data.to_vec())
                .map_err(|_| corrupt("text field is not valid UTF-8"))?,
        ),
        SerialKind::Blob { .. } => SqlValue::Blob(data.to_vec()),
    })
}

/// Decode an entire record.
pub fn decode_record(bytes: &[u8]) -> Result<Vec<SqlValue>> {
    decode_record_prefix(bytes, usize::MAX)
}

/// Decode at most `max_fields` leading fields of a record.
pub fn decode_record_prefix(bytes: &[u8], max_fields: usize) -> Result<Vec<SqlValue>> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let (hdr, mut pos) = get_varint(bytes).ok_or_else(|| corrupt("truncated header size"))?;
    if hdr > MAX_HEADER_SIZE || hdr > bytes.len() as u64 {
        return Err(corrupt("header size out of range"));
    }
    #[allow(clippy::cast_possible_truncation)]
    let hdr = hdr as usize;
    let mut body = hdr;
    let mut values = Vec::new();
    while pos < hdr && values.len() < max_fields {
        let (ty, n) = get_varint(&bytes[pos..hdr]).ok_or_else(|| corrupt("header overrun"))?;
        pos += n;
        let len = serial_type::payload_len(ty).ok_or_else(|| corrupt("reserved serial type"))?;
        let end = usize::try_from(len)
            .ok()
            .and_then(|l| body.checked_add(l))
            .filter(|&e| e <= bytes.len())
            .ok_or_else(|| corrupt("field extends past payload"))?;
        values.push(decode_field(ty, &bytes[body..end])?);
        body = end;
    }
    if values.len() < max_fields && body != bytes.len() {
        return Err(corrupt("payload size does not match header"));
    }
    Ok(values)
}

// ── Incremental header cache ───────────────────────────────────────────────

/// Cache status value meaning "no row loaded".
pub const CACHE_STALE: u32 = 0;

/// Incremental decoder for one cursor's current row.
///
/// The header is parsed lazily, only as far as the highest column requested
/// so far. `offsets[k]` is the payload offset of field `k`, `types[k]` its
/// serial type, and `offsets[k + 1]` is always `offsets[k]` plus the payload
/// length of `types[k]`.
#[derive(Debug, Default)]
pub struct RecordHeaderCache {
    /// Matches the interpreter's cache counter while the cache is valid.
    pub cache_status: u32,
    /// Number of serial types parsed so far.
    pub hdr_parsed: usize,
    /// Header size, which is also the payload offset of field 0.
    pub hdr_offset: u64,
    /// Byte offset of the next unparsed serial type.
    hdr_pos: usize,
    offsets: SmallVec<[u64; 16]>,
    types: SmallVec<[u64; 16]>,
    payload: Option<Arc<[u8]>>,
    generation: u64,
}

impl RecordHeaderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidate(&mut self) {
        self.cache_status = CACHE_STALE;
    }

    pub fn is_current(&self, cache_ctr: u32) -> bool {
        self.cache_status != CACHE_STALE && self.cache_status == cache_ctr
    }

    pub const fn generation(&self) -> u64 {
        self.generation
    }

    pub fn payload(&self) -> Option<&Arc<[u8]>> {
        self.payload.as_ref()
    }

    /// Start decoding a new row.
    ///
    /// Fails with `TooBig` when the payload exceeds `max_length` and with
    /// `Corrupt` when the header size is implausible.
    pub fn load(
        &mut self,
        payload: Arc<[u8]>,
        cache_ctr: u32,
        generation: u64,
        max_length: usize,
    ) -> Result<()> {
        self.cache_status = CACHE_STALE;
        if payload.len() > max_length {
            return Err(SqlvmError::TooBig);
        }
        let (hdr, pos) = if payload.is_empty() {
            (0, 0)
        } else {
            get_varint(&payload).ok_or_else(|| corrupt("truncated header size"))?
        };
        if hdr > MAX_HEADER_SIZE || hdr > payload.len() as u64 {
            return Err(corrupt("header size out of range"));
        }
        self.hdr_offset = hdr;
        self.hdr_pos = pos;
        self.hdr_parsed = 0;
        self.offsets.clear();
        self.offsets.push(hdr);
        self.types.clear();
        self.payload = Some(payload);
        self.generation = generation;
        self.cache_status = cache_ctr;
        Ok(())
    }

    /// Parse serial types until `column` is covered or the header ends.
    fn parse_through(&mut self, column: usize) -> Result<()> {
        let payload = self
            .payload
            .as_ref()
            .ok_or_else(|| SqlvmError::internal("column read without a loaded row"))?;
        let payload_len = payload.len() as u64;
        #[allow(clippy::cast_possible_truncation)]
        let hdr_end = self.hdr_offset as usize;
        let mut offset = self.offsets[self.hdr_parsed];

        while self.hdr_parsed <= column && self.hdr_pos < hdr_end {
            let (ty, n) = get_varint(&payload[self.hdr_pos..hdr_end])
                .ok_or_else(|| corrupt("header overrun"))?;
            self.hdr_pos += n;
            let len = serial_type::payload_len(ty).ok_or_else(|| corrupt("reserved serial type"))?;
            offset = offset
                .checked_add(len)
                .ok_or_else(|| corrupt("field offset overflow"))?;
            self.types.push(ty);
            self.offsets.push(offset);
            self.hdr_parsed += 1;
        }

        let consumed = self.hdr_pos >= hdr_end;
        if (consumed && offset != payload_len) || offset > payload_len {
            return Err(corrupt("payload size does not match header"));
        }
        Ok(())
    }

    /// Serial type of `column`, parsing the header as needed. `None` when the
    /// row has fewer fields.
    pub fn serial_type(&mut self, column: usize) -> Result<Option<u64>> {
        if self.hdr_parsed <= column {
            self.parse_through(column)?;
        }
        Ok(self.types.get(column).copied())
    }

    /// Decode `column` of the loaded row.
    ///
    /// Text and blob fields come back as ephemeral windows onto the payload,
    /// tagged with this row's generation. `None` means the row has fewer
    /// fields than `column + 1`; the caller substitutes the default.
    pub fn column(&mut self, column: usize) -> Result<Option<Mem>> {
        let Some(ty) = self.serial_type(column)? else {
            return Ok(None);
        };
        let payload = self
            .payload
            .as_ref()
            .ok_or_else(|| SqlvmError::internal("column read without a loaded row"))?;
        #[allow(clippy::cast_possible_truncation)]
        let range = self.offsets[column] as usize..self.offsets[column + 1] as usize;
        let data = &payload[range.clone()];
        let mem = match serial_type::classify(ty) {
            SerialKind::Null => Mem::Null,
            SerialKind::Int { .. } => Mem::Integer(read_int(data)),
            SerialKind::Real => {
                let r = read_real(data);
                if r.is_nan() {
                    Mem::Null
                } else {
                    Mem::Real(r)
                }
            }
            SerialKind::Const(c) => Mem::Integer(c),
            SerialKind::Reserved => return Err(corrupt("reserved serial type")),
            SerialKind::Text { .. } => Mem::Text(Buf::Ephemeral(EphemeralBuf::new(
                Arc::clone(payload),
                range,
                self.generation,
            ))),
            SerialKind::Blob { .. } => Mem::Blob {
                buf: Buf::Ephemeral(EphemeralBuf::new(Arc::clone(payload), range, self.generation)),
                zero_tail: 0,
            },
        };
        Ok(Some(mem))
    }
}
