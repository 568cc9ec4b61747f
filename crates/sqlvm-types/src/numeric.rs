//! Text-to-number scanning shared by affinity, casts and arithmetic.
//!
//! Two questions get asked of text: "is the whole string a number" (affinity,
//! `NUMERIC` casts) and "what number does this string start with" (integer and
//! real casts, arithmetic on text operands). Both use the same scanner.

/// A number recognised in text.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Numeric {
    Int(i64),
    Real(f64),
}

/// Result of scanning the numeric prefix of a byte string.
#[derive(Debug, Clone, Copy)]
struct Scan {
    /// Byte range of the literal itself (sign included).
    start: usize,
    end: usize,
    /// The literal has no fraction and no exponent.
    integral: bool,
    /// Only whitespace follows the literal.
    whole: bool,
}

const fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r' | 0x0B | 0x0C)
}

fn scan(bytes: &[u8]) -> Option<Scan> {
    let mut i = 0;
    while i < bytes.len() && is_space(bytes[i]) {
        i += 1;
    }
    let start = i;
    if i < bytes.len() && matches!(bytes[i], b'+' | b'-') {
        i += 1;
    }
    let int_digits_start = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    let mut digits = i - int_digits_start;
    let mut integral = true;

    if i < bytes.len() && bytes[i] == b'.' {
        let frac_start = i + 1;
        let mut j = frac_start;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        if digits > 0 || j > frac_start {
            digits += j - frac_start;
            integral = false;
            i = j;
        }
    }
    if digits == 0 {
        return None;
    }

    if i < bytes.len() && matches!(bytes[i], b'e' | b'E') {
        let mut j = i + 1;
        if j < bytes.len() && matches!(bytes[j], b'+' | b'-') {
            j += 1;
        }
        let exp_start = j;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        if j > exp_start {
            integral = false;
            i = j;
        }
    }

    let end = i;
    let whole = bytes[end..].iter().all(|&b| is_space(b));
    Some(Scan {
        start,
        end,
        integral,
        whole,
    })
}

fn literal(bytes: &[u8], scan: Scan) -> &str {
    // The scanner only accepts ASCII, so this cannot fail.
    std::str::from_utf8(&bytes[scan.start..scan.end]).unwrap_or("0")
}

fn parse_real(text: &str) -> f64 {
    text.parse::<f64>().unwrap_or(0.0)
}

/// Parse an integer literal, saturating on overflow.
///
/// Returns the value and whether it fit without saturating.
fn parse_int_saturating(text: &str) -> (i64, bool) {
    let (negative, digits) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };
    let mut acc: i128 = 0;
    for b in digits.bytes() {
        acc = acc * 10 + i128::from(b - b'0');
        if acc > i128::from(u64::MAX) {
            break;
        }
    }
    let signed = if negative { -acc } else { acc };
    match i64::try_from(signed) {
        Ok(v) => (v, true),
        Err(_) if negative => (i64::MIN, false),
        Err(_) => (i64::MAX, false),
    }
}

/// Classify text that must be a number in its entirety.
///
/// Surrounding whitespace is allowed. An integer literal that does not fit
/// in 64 bits is reported as a real. Returns `None` for anything else.
pub fn classify_text(bytes: &[u8]) -> Option<Numeric> {
    let scan = scan(bytes)?;
    if !scan.whole {
        return None;
    }
    let text = literal(bytes, scan);
    if scan.integral {
        let (v, exact) = parse_int_saturating(text);
        if exact {
            return Some(Numeric::Int(v));
        }
    }
    Some(Numeric::Real(parse_real(text)))
}

/// Integer value of the longest numeric prefix of `bytes`.
///
/// Only the integer digits are consumed: `"12.9abc"` yields 12. Out of range
/// values saturate. Text with no numeric prefix yields 0.
pub fn prefix_to_i64(bytes: &[u8]) -> i64 {
    let Some(scan) = scan(bytes) else {
        return 0;
    };
    let text = literal(bytes, scan);
    let sign_len = usize::from(matches!(text.as_bytes().first(), Some(b'+' | b'-')));
    let digit_len = text[sign_len..]
        .bytes()
        .take_while(u8::is_ascii_digit)
        .count();
    if digit_len == 0 {
        return 0;
    }
    parse_int_saturating(&text[..sign_len + digit_len]).0
}

/// Real value of the longest numeric prefix of `bytes`, 0.0 if none.
pub fn prefix_to_f64(bytes: &[u8]) -> f64 {
    scan(bytes).map_or(0.0, |scan| parse_real(literal(bytes, scan)))
}

/// Numeric value of the longest prefix, keeping integers as integers.
pub fn prefix_numeric(bytes: &[u8]) -> Numeric {
    match scan(bytes) {
        None => Numeric::Int(0),
        Some(scan) => {
            let text = literal(bytes, scan);
            if scan.integral {
                let (v, exact) = parse_int_saturating(text);
                if exact {
                    return Numeric::Int(v);
                }
            }
            Numeric::Real(parse_real(text))
        }
    }
}

/// Convert a real to an integer the way casts do: truncate toward zero,
/// saturate at the 64-bit bounds, NaN becomes 0.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn real_to_i64(r: f64) -> i64 {
    if r.is_nan() {
        0
    } else if r <= i64::MIN as f64 {
        i64::MIN
    } else if r >= i64::MAX as f64 {
        i64::MAX
    } else {
        r as i64
    }
}

/// `Some(i)` when `r` is exactly representable as the integer `i`.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::float_cmp
)]
pub fn real_as_exact_i64(r: f64) -> Option<i64> {
    if !(-9_223_372_036_854_775_808.0..9_223_372_036_854_775_808.0).contains(&r) {
        return None;
    }
    let i = r as i64;
    (i as f64 == r).then_some(i)
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_whole_text() {
        assert_eq!(classify_text(b"42"), Some(Numeric::Int(42)));
        assert_eq!(classify_text(b"  -7 \n"), Some(Numeric::Int(-7)));
        assert_eq!(classify_text(b"48.00"), Some(Numeric::Real(48.0)));
        assert_eq!(classify_text(b"1e3"), Some(Numeric::Real(1000.0)));
        assert_eq!(classify_text(b".5"), Some(Numeric::Real(0.5)));
        assert_eq!(classify_text(b"5."), Some(Numeric::Real(5.0)));
        assert_eq!(classify_text(b"12abc"), None);
        assert_eq!(classify_text(b""), None);
        assert_eq!(classify_text(b"."), None);
        assert_eq!(classify_text(b"inf"), None);
    }

    #[test]
    fn test_classify_big_integer_is_real() {
        assert_eq!(
            classify_text(b"9223372036854775808"),
            Some(Numeric::Real(9_223_372_036_854_775_808.0))
        );
        assert_eq!(
            classify_text(b"-9223372036854775808"),
            Some(Numeric::Int(i64::MIN))
        );
    }

    #[test]
    fn test_prefix_integer() {
        assert_eq!(prefix_to_i64(b"12.9abc"), 12);
        assert_eq!(prefix_to_i64(b"  -3xyz"), -3);
        assert_eq!(prefix_to_i64(b"abc"), 0);
        assert_eq!(prefix_to_i64(b"99999999999999999999"), i64::MAX);
        assert_eq!(prefix_to_i64(b"-99999999999999999999"), i64::MIN);
        assert_eq!(prefix_to_i64(b".9"), 0);
    }

    #[test]
    fn test_prefix_real() {
        assert_eq!(prefix_to_f64(b"3.5kg"), 3.5);
        assert_eq!(prefix_to_f64(b"1e2x"), 100.0);
        assert_eq!(prefix_to_f64(b"1e"), 1.0);
        assert_eq!(prefix_to_f64(b"-"), 0.0);
    }

    #[test]
    fn test_prefix_numeric_keeps_kind() {
        assert_eq!(prefix_numeric(b"17 apples"), Numeric::Int(17));
        assert_eq!(prefix_numeric(b"1.25"), Numeric::Real(1.25));
        assert_eq!(prefix_numeric(b"none"), Numeric::Int(0));
    }

    #[test]
    fn test_real_conversions() {
        assert_eq!(real_to_i64(-2.9), -2);
        assert_eq!(real_to_i64(1e300), i64::MAX);
        assert_eq!(real_to_i64(-1e300), i64::MIN);
        assert_eq!(real_to_i64(f64::NAN), 0);
        assert_eq!(real_as_exact_i64(48.0), Some(48));
        assert_eq!(real_as_exact_i64(48.5), None);
        assert_eq!(real_as_exact_i64(1e19), None);
    }
}
