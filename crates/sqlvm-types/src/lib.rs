//! Value cells, record codec, comparison engine and opcode set for the
//! sqlvm bytecode interpreter.
//!
//! Everything in this crate is independent of the storage backend and of the
//! interpreter loop, so program builders and backends can depend on it
//! without pulling in `sqlvm-vdbe`.

pub mod collation;
pub mod compare;
pub mod mem;
pub mod numeric;
pub mod opcode;
pub mod record;
pub mod rowset;
pub mod serial_type;
pub mod value;

pub use collation::{CollSeq, CollationFunction, CollationRegistry};
pub use compare::{int_float_cmp, KeyField, KeyInfo, UnpackedRecord};
pub use mem::{AggCell, Buf, CoroutineSlot, EphemeralBuf, Mem};
pub use opcode::{Label, Opcode, ProgramBuilder, VdbeOp, VdbeProgram, P4};
pub use record::{EncodedRecord, RecordHeaderCache};
pub use rowset::RowSet;
pub use value::{SqlValue, ValueRef};

use serde::{Deserialize, Serialize};

/// Column type affinity.
///
/// The discriminants are the single-character codes used in affinity strings
/// and as the `Cast` target operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Affinity {
    /// No conversion ('A').
    Blob = b'A',
    /// Numbers become text ('B').
    Text = b'B',
    /// Well-formed numeric text becomes a number ('C').
    Numeric = b'C',
    /// Like NUMERIC for storage; casts truncate to integer ('D').
    Integer = b'D',
    /// Like NUMERIC for storage; casts produce a real ('E').
    Real = b'E',
}

impl Affinity {
    pub const fn from_byte(code: u8) -> Option<Self> {
        match code {
            b'A' => Some(Self::Blob),
            b'B' => Some(Self::Text),
            b'C' => Some(Self::Numeric),
            b'D' => Some(Self::Integer),
            b'E' => Some(Self::Real),
            _ => None,
        }
    }

    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// NUMERIC, INTEGER and REAL all convert numeric-looking text.
    pub const fn is_numeric(self) -> bool {
        matches!(self, Self::Numeric | Self::Integer | Self::Real)
    }

    /// Parse an affinity string (one code per column); unknown codes map to
    /// BLOB.
    pub fn parse_list(codes: &str) -> Vec<Self> {
        codes
            .bytes()
            .map(|b| Self::from_byte(b).unwrap_or(Self::Blob))
            .collect()
    }
}

/// Sort direction of one key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}
