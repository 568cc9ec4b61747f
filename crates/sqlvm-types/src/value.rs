use std::cmp::Ordering;
use std::fmt;

use crate::compare::compare_refs;
use crate::numeric::{self, Numeric};
use crate::Affinity;

/// An owned, dynamically-typed SQL value.
///
/// This is the boundary type: result rows, bound parameters, function
/// arguments and sorter rows are all `SqlValue`s. Inside the interpreter the
/// register file holds [`Mem`](crate::Mem) cells instead, which may alias
/// storage.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub enum SqlValue {
    #[default]
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// A borrowed view of a value, shared by [`SqlValue`] and
/// [`Mem`](crate::Mem) for encoding and comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueRef<'a> {
    Null,
    Integer(i64),
    Real(f64),
    Text(&'a [u8]),
    /// Blob bytes followed by `zero_tail` implied zero bytes.
    Blob(&'a [u8], usize),
}

impl ValueRef<'_> {
    /// Ordering class: NULL < numeric < text < blob.
    pub const fn sort_class(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Integer(_) | Self::Real(_) => 1,
            Self::Text(_) => 2,
            Self::Blob(..) => 3,
        }
    }

    pub fn to_owned_value(&self) -> SqlValue {
        match *self {
            Self::Null => SqlValue::Null,
            Self::Integer(i) => SqlValue::Integer(i),
            Self::Real(r) => SqlValue::Real(r),
            Self::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
            Self::Blob(b, zeros) => {
                let mut out = Vec::with_capacity(b.len() + zeros);
                out.extend_from_slice(b);
                out.resize(b.len() + zeros, 0);
                SqlValue::Blob(out)
            }
        }
    }
}

impl SqlValue {
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub const fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Self::Real(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_value_ref(&self) -> ValueRef<'_> {
        match self {
            Self::Null => ValueRef::Null,
            Self::Integer(i) => ValueRef::Integer(*i),
            Self::Real(r) => ValueRef::Real(*r),
            Self::Text(s) => ValueRef::Text(s.as_bytes()),
            Self::Blob(b) => ValueRef::Blob(b, 0),
        }
    }

    /// Integer value under cast rules: reals truncate (saturating), text and
    /// blobs contribute their numeric prefix, NULL is 0.
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_integer(&self) -> i64 {
        match self {
            Self::Null => 0,
            Self::Integer(i) => *i,
            Self::Real(r) => numeric::real_to_i64(*r),
            Self::Text(s) => numeric::prefix_to_i64(s.as_bytes()),
            Self::Blob(b) => numeric::prefix_to_i64(b),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn to_real(&self) -> f64 {
        match self {
            Self::Null => 0.0,
            Self::Integer(i) => *i as f64,
            Self::Real(r) => *r,
            Self::Text(s) => numeric::prefix_to_f64(s.as_bytes()),
            Self::Blob(b) => numeric::prefix_to_f64(b),
        }
    }

    /// Text rendering used by `TEXT` affinity and casts. NULL renders empty.
    pub fn to_text(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Integer(i) => i.to_string(),
            Self::Real(r) => format_real(*r),
            Self::Text(s) => s.clone(),
            Self::Blob(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }

    /// The `typeof()` name.
    pub const fn typeof_str(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Integer(_) => "integer",
            Self::Real(_) => "real",
            Self::Text(_) => "text",
            Self::Blob(_) => "blob",
        }
    }

    /// Apply column affinity (soft conversion, never fails).
    #[must_use]
    pub fn apply_affinity(self, affinity: Affinity) -> Self {
        match affinity {
            Affinity::Blob => self,
            Affinity::Text => match self {
                Self::Integer(_) | Self::Real(_) => Self::Text(self.to_text()),
                other => other,
            },
            Affinity::Numeric | Affinity::Integer | Affinity::Real => match &self {
                Self::Text(s) => affinity_number(s.as_bytes()).map_or(self, Self::from),
                _ => self,
            },
        }
    }
}

/// The number numeric affinity turns `text` into, if any: integers when the
/// conversion is lossless, reals otherwise.
pub fn affinity_number(text: &[u8]) -> Option<Numeric> {
    match numeric::classify_text(text)? {
        Numeric::Int(i) => Some(Numeric::Int(i)),
        Numeric::Real(r) => Some(
            numeric::real_as_exact_i64(r).map_or(Numeric::Real(r), Numeric::Int),
        ),
    }
}

impl From<Numeric> for SqlValue {
    fn from(n: Numeric) -> Self {
        match n {
            Numeric::Int(i) => Self::Integer(i),
            Numeric::Real(r) => Self::Real(r),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<i32> for SqlValue {
    fn from(i: i32) -> Self {
        Self::Integer(i64::from(i))
    }
}

impl From<f64> for SqlValue {
    fn from(r: f64) -> Self {
        if r.is_nan() {
            Self::Null
        } else {
            Self::Real(r)
        }
    }
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for SqlValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(b: Vec<u8>) -> Self {
        Self::Blob(b)
    }
}

impl<T: Into<Self>> From<Option<T>> for SqlValue {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Self::Null, Into::into)
    }
}

/// SQL-literal rendering (`'text'`, `X'0A0B'`).
impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Real(r) => f.write_str(&format_real(*r)),
            Self::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Self::Blob(b) => {
                f.write_str("X'")?;
                for byte in b {
                    write!(f, "{byte:02X}")?;
                }
                f.write_str("'")
            }
        }
    }
}

impl PartialEq for SqlValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_binary(other) == Ordering::Equal
    }
}

impl PartialOrd for SqlValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp_binary(other))
    }
}

impl SqlValue {
    /// Total order under the BINARY collation.
    pub fn cmp_binary(&self, other: &Self) -> Ordering {
        compare_refs(self.as_value_ref(), other.as_value_ref(), None)
    }
}

/// Render a real the way `printf("%!.15g")` does: 15 significant digits,
/// scientific notation outside `1e-4 ..= 1e15`, and always a decimal point.
pub fn format_real(r: f64) -> String {
    if r.is_nan() {
        return "NaN".to_owned();
    }
    if r.is_infinite() {
        return if r < 0.0 { "-Inf" } else { "Inf" }.to_owned();
    }
    if r == 0.0 {
        return if r.is_sign_negative() { "-0.0" } else { "0.0" }.to_owned();
    }

    // `{:.14e}` gives exactly 15 significant digits, correctly rounded.
    let sci = format!("{:.14e}", r.abs());
    let (mantissa, exp) = sci.split_once('e').unwrap_or((&sci, "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    let digits: String = mantissa.chars().filter(char::is_ascii_digit).collect();
    let sign = if r < 0.0 { "-" } else { "" };

    if !(-4..15).contains(&exp) {
        let (lead, rest) = digits.split_at(1);
        let rest = rest.trim_end_matches('0');
        let rest = if rest.is_empty() { "0" } else { rest };
        let exp_sign = if exp < 0 { '-' } else { '+' };
        return format!("{sign}{lead}.{rest}e{exp_sign}{:02}", exp.unsigned_abs());
    }

    let (int_part, frac_part) = if exp >= 0 {
        #[allow(clippy::cast_sign_loss)]
        let split = (exp as usize) + 1;
        (digits[..split].to_owned(), digits[split..].to_owned())
    } else {
        #[allow(clippy::cast_sign_loss)]
        let pad = (-exp - 1) as usize;
        ("0".to_owned(), format!("{}{digits}", "0".repeat(pad)))
    };
    let frac = frac_part.trim_end_matches('0');
    let frac = if frac.is_empty() { "0" } else { frac };
    format!("{sign}{int_part}.{frac}")
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_null_properties() {
        let v = SqlValue::Null;
        assert!(v.is_null());
        assert_eq!(v.typeof_str(), "null");
        assert_eq!(v.to_integer(), 0);
        assert_eq!(v.to_text(), "");
        assert_eq!(v.to_string(), "NULL");
    }

    #[test]
    fn test_conversions() {
        assert_eq!(SqlValue::from("12abc").to_integer(), 12);
        assert_eq!(SqlValue::from(-3.99).to_integer(), -3);
        assert_eq!(SqlValue::from(1e30).to_integer(), i64::MAX);
        assert_eq!(SqlValue::from("2.5e1").to_real(), 25.0);
        assert_eq!(SqlValue::Integer(7).to_text(), "7");
        assert_eq!(SqlValue::from(f64::NAN), SqlValue::Null);
    }

    #[test]
    fn test_format_real() {
        assert_eq!(format_real(1.0), "1.0");
        assert_eq!(format_real(120.0), "120.0");
        assert_eq!(format_real(-0.5), "-0.5");
        assert_eq!(format_real(3.141_592_653_589_793), "3.14159265358979");
        assert_eq!(format_real(0.0001), "0.0001");
        assert_eq!(format_real(0.000_012_5), "1.25e-05");
        assert_eq!(format_real(1e15), "1.0e+15");
        assert_eq!(format_real(123_456_789_012_345.0), "123456789012345.0");
        assert_eq!(format_real(f64::INFINITY), "Inf");
    }

    #[test]
    fn test_numeric_affinity() {
        assert_eq!(
            SqlValue::from("48.00").apply_affinity(Affinity::Numeric),
            SqlValue::Integer(48)
        );
        assert!(matches!(
            SqlValue::from(" 1.5 ").apply_affinity(Affinity::Real),
            SqlValue::Real(r) if r == 1.5
        ));
        assert!(matches!(
            SqlValue::from("abc").apply_affinity(Affinity::Integer),
            SqlValue::Text(_)
        ));
        // Integers survive REAL affinity untouched.
        assert!(matches!(
            SqlValue::Integer(3).apply_affinity(Affinity::Real),
            SqlValue::Integer(3)
        ));
        assert!(matches!(
            SqlValue::Blob(b"12".to_vec()).apply_affinity(Affinity::Numeric),
            SqlValue::Blob(_)
        ));
    }

    #[test]
    fn test_text_affinity() {
        assert!(matches!(
            SqlValue::Integer(5).apply_affinity(Affinity::Text),
            SqlValue::Text(ref s) if s == "5"
        ));
        assert!(matches!(
            SqlValue::Real(2.5).apply_affinity(Affinity::Text),
            SqlValue::Text(ref s) if s == "2.5"
        ));
        assert!(SqlValue::Null.apply_affinity(Affinity::Text).is_null());
    }

    #[test]
    fn test_ordering_classes() {
        let ordered = [
            SqlValue::Null,
            SqlValue::Integer(-5),
            SqlValue::Real(2.5),
            SqlValue::Integer(3),
            SqlValue::from("A"),
            SqlValue::from("a"),
            SqlValue::Blob(vec![0]),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(pair[0].cmp_binary(&pair[1]), Ordering::Less, "{pair:?}");
        }
        assert_eq!(SqlValue::Integer(2), SqlValue::Real(2.0));
    }

    #[test]
    fn test_display_literals() {
        assert_eq!(SqlValue::from("it's").to_string(), "'it''s'");
        assert_eq!(SqlValue::Blob(vec![0xCA, 0xFE]).to_string(), "X'CAFE'");
    }
}
