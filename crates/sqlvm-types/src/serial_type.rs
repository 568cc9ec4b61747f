//! Record serial types and the variable-length integer encoding.
//!
//! Every field of a record is described in the record header by a serial
//! type, itself stored as a varint:
//!
//! | Serial type  | Payload bytes | Meaning                         |
//! |--------------|---------------|---------------------------------|
//! | 0            | 0             | NULL                            |
//! | 1..=4        | 1..=4         | big-endian two's complement int |
//! | 5            | 6             | 48-bit int                      |
//! | 6            | 8             | 64-bit int                      |
//! | 7            | 8             | IEEE 754 double                 |
//! | 8, 9         | 0             | integer constants 0 and 1       |
//! | 10, 11       | n/a           | reserved                        |
//! | even N >= 12 | (N-12)/2      | BLOB                            |
//! | odd N >= 13  | (N-13)/2      | TEXT                            |

/// Decoded meaning of a serial type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialKind {
    Null,
    /// Signed integer stored in `width` bytes.
    Int { width: usize },
    Real,
    /// The constant 0 (type 8) or 1 (type 9).
    Const(i64),
    Reserved,
    Blob { len: usize },
    Text { len: usize },
}

/// Classify a raw serial type.
#[allow(clippy::cast_possible_truncation)]
pub const fn classify(serial_type: u64) -> SerialKind {
    match serial_type {
        0 => SerialKind::Null,
        1..=4 => SerialKind::Int {
            width: serial_type as usize,
        },
        5 => SerialKind::Int { width: 6 },
        6 => SerialKind::Int { width: 8 },
        7 => SerialKind::Real,
        8 => SerialKind::Const(0),
        9 => SerialKind::Const(1),
        10 | 11 => SerialKind::Reserved,
        n if n % 2 == 0 => SerialKind::Blob {
            len: ((n - 12) / 2) as usize,
        },
        n => SerialKind::Text {
            len: ((n - 13) / 2) as usize,
        },
    }
}

/// Number of payload bytes a field of this serial type occupies.
///
/// `None` for the reserved types 10 and 11, which never appear in a
/// well-formed record.
pub const fn payload_len(serial_type: u64) -> Option<u64> {
    match serial_type {
        0 | 8 | 9 => Some(0),
        1..=4 => Some(serial_type),
        5 => Some(6),
        6 | 7 => Some(8),
        10 | 11 => None,
        n if n % 2 == 0 => Some((n - 12) / 2),
        n => Some((n - 13) / 2),
    }
}

/// Smallest serial type able to hold `value`.
#[allow(clippy::cast_sign_loss)]
pub const fn for_integer(value: i64) -> u64 {
    if value == 0 {
        return 8;
    }
    if value == 1 {
        return 9;
    }
    // Fold negatives onto the magnitude range of the matching positive width.
    let magnitude = if value < 0 {
        !(value as u64)
    } else {
        value as u64
    };
    match magnitude {
        0..=0x7F => 1,
        0x80..=0x7FFF => 2,
        0x8000..=0x7F_FFFF => 3,
        0x80_0000..=0x7FFF_FFFF => 4,
        0x8000_0000..=0x7FFF_FFFF_FFFF => 5,
        _ => 6,
    }
}

pub const fn for_text(len: usize) -> u64 {
    (len as u64) * 2 + 13
}

pub const fn for_blob(len: usize) -> u64 {
    (len as u64) * 2 + 12
}

// ── Varints ────────────────────────────────────────────────────────────────

/// Largest encoded varint.
pub const MAX_VARINT_LEN: usize = 9;

/// Decode a varint from the front of `buf`.
///
/// Returns the value and the number of bytes consumed, or `None` if `buf`
/// ends before the varint does. Bytes 1..=8 carry 7 bits each behind a
/// continuation flag; a ninth byte contributes all 8 of its bits.
pub fn get_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut acc: u64 = 0;
    for (idx, &byte) in buf.iter().enumerate() {
        if idx == 8 {
            return Some(((acc << 8) | u64::from(byte), 9));
        }
        acc = (acc << 7) | u64::from(byte & 0x7F);
        if byte & 0x80 == 0 {
            return Some((acc, idx + 1));
        }
    }
    None
}

/// Encoded length of `value`.
pub const fn varint_len(value: u64) -> usize {
    if value > 0x00FF_FFFF_FFFF_FFFF {
        return 9;
    }
    let mut len = 1;
    let mut rest = value >> 7;
    while rest != 0 {
        len += 1;
        rest >>= 7;
    }
    len
}

/// Append the varint encoding of `value` to `out`, returning the byte count.
#[allow(clippy::cast_possible_truncation)]
pub fn put_varint(out: &mut Vec<u8>, value: u64) -> usize {
    let len = varint_len(value);
    if len == 9 {
        let high = value >> 8;
        for shift in (0..8).rev() {
            out.push(((high >> (shift * 7)) as u8 & 0x7F) | 0x80);
        }
        out.push(value as u8);
        return 9;
    }
    for shift in (0..len).rev() {
        let chunk = (value >> (shift * 7)) as u8 & 0x7F;
        out.push(if shift == 0 { chunk } else { chunk | 0x80 });
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: u64) -> Vec<u8> {
        let mut out = Vec::new();
        put_varint(&mut out, value);
        out
    }

    #[test]
    fn test_payload_lengths() {
        let expected = [
            (0, Some(0)),
            (1, Some(1)),
            (2, Some(2)),
            (3, Some(3)),
            (4, Some(4)),
            (5, Some(6)),
            (6, Some(8)),
            (7, Some(8)),
            (8, Some(0)),
            (9, Some(0)),
            (10, None),
            (11, None),
            (12, Some(0)),
            (13, Some(0)),
            (20, Some(4)),
            (21, Some(4)),
        ];
        for (ty, len) in expected {
            assert_eq!(payload_len(ty), len, "serial type {ty}");
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(0), SerialKind::Null);
        assert_eq!(classify(3), SerialKind::Int { width: 3 });
        assert_eq!(classify(5), SerialKind::Int { width: 6 });
        assert_eq!(classify(7), SerialKind::Real);
        assert_eq!(classify(9), SerialKind::Const(1));
        assert_eq!(classify(11), SerialKind::Reserved);
        assert_eq!(classify(18), SerialKind::Blob { len: 3 });
        assert_eq!(classify(19), SerialKind::Text { len: 3 });
    }

    #[test]
    fn test_integer_widths() {
        assert_eq!(for_integer(0), 8);
        assert_eq!(for_integer(1), 9);
        assert_eq!(for_integer(2), 1);
        assert_eq!(for_integer(-128), 1);
        assert_eq!(for_integer(-129), 2);
        assert_eq!(for_integer(128), 2);
        assert_eq!(for_integer(32_768), 3);
        assert_eq!(for_integer(8_388_608), 4);
        assert_eq!(for_integer(2_147_483_648), 5);
        assert_eq!(for_integer(0x8000_0000_0000), 6);
        assert_eq!(for_integer(i64::MIN), 6);
    }

    #[test]
    fn test_text_and_blob_types() {
        assert_eq!(for_text(2), 17);
        assert_eq!(for_blob(2), 16);
        assert_eq!(classify(for_text(40)), SerialKind::Text { len: 40 });
    }

    #[test]
    fn test_varint_boundaries() {
        let cases: [(u64, usize); 10] = [
            (0, 1),
            (0x7F, 1),
            (0x80, 2),
            (0x3FFF, 2),
            (0x4000, 3),
            (0x1F_FFFF, 3),
            (0x0FFF_FFFF, 4),
            (0x00FF_FFFF_FFFF_FFFF, 8),
            (0x0100_0000_0000_0000, 9),
            (u64::MAX, 9),
        ];
        for (value, len) in cases {
            let bytes = encode(value);
            assert_eq!(bytes.len(), len, "value {value:#x}");
            assert_eq!(varint_len(value), len);
            assert_eq!(get_varint(&bytes), Some((value, len)));
        }
    }

    #[test]
    fn test_varint_ninth_byte_keeps_all_bits() {
        let bytes = encode(u64::MAX);
        assert_eq!(bytes[8], 0xFF);
        assert!(bytes[..8].iter().all(|b| b & 0x80 != 0));
    }

    #[test]
    fn test_varint_truncated() {
        assert_eq!(get_varint(&[]), None);
        assert_eq!(get_varint(&[0x81]), None);
        assert_eq!(get_varint(&[0x81, 0x00, 0xFF]), Some((128, 2)));
    }

    #[test]
    #[allow(clippy::cast_sign_loss)]
    fn test_varint_negative_rowid_uses_nine_bytes() {
        let bytes = encode((-1_i64) as u64);
        assert_eq!(bytes.len(), 9);
        let (decoded, _) = get_varint(&bytes).unwrap();
        assert_eq!(decoded as i64, -1);
    }
}
