//! Collating sequences.
//!
//! A collation is a pure comparator over text bytes. The interpreter refers
//! to one through a cheap, cloneable [`CollSeq`] handle; user collations are
//! added to a [`CollationRegistry`] and looked up by name
//! (case-insensitively) when a program is prepared.
//!
//! Implementations must be deterministic, antisymmetric and transitive.
#![allow(clippy::unnecessary_literal_bound)]

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A text comparator.
pub trait CollationFunction: Send + Sync {
    /// Name used in `COLLATE name`.
    fn name(&self) -> &str;

    fn compare(&self, left: &[u8], right: &[u8]) -> Ordering;
}

// ── Built-in collations ──────────────────────────────────────────────────

/// Byte-wise comparison. The default.
pub struct BinaryCollation;

impl CollationFunction for BinaryCollation {
    fn name(&self) -> &str {
        "BINARY"
    }

    fn compare(&self, left: &[u8], right: &[u8]) -> Ordering {
        left.cmp(right)
    }
}

/// ASCII case folding; other bytes compare as-is.
pub struct NoCaseCollation;

impl CollationFunction for NoCaseCollation {
    fn name(&self) -> &str {
        "NOCASE"
    }

    fn compare(&self, left: &[u8], right: &[u8]) -> Ordering {
        left.iter()
            .map(u8::to_ascii_lowercase)
            .cmp(right.iter().map(u8::to_ascii_lowercase))
    }
}

/// Trailing ASCII spaces are ignored.
pub struct RtrimCollation;

impl CollationFunction for RtrimCollation {
    fn name(&self) -> &str {
        "RTRIM"
    }

    fn compare(&self, left: &[u8], right: &[u8]) -> Ordering {
        trim_spaces(left).cmp(trim_spaces(right))
    }
}

fn trim_spaces(s: &[u8]) -> &[u8] {
    let keep = s.iter().rposition(|&b| b != b' ').map_or(0, |i| i + 1);
    &s[..keep]
}

/// Shared handle to a collation.
#[derive(Clone)]
pub struct CollSeq(Arc<dyn CollationFunction>);

impl CollSeq {
    pub fn new(collation: impl CollationFunction + 'static) -> Self {
        Self(Arc::new(collation))
    }

    pub fn binary() -> Self {
        Self::new(BinaryCollation)
    }

    pub fn nocase() -> Self {
        Self::new(NoCaseCollation)
    }

    pub fn rtrim() -> Self {
        Self::new(RtrimCollation)
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn is_binary(&self) -> bool {
        self.name().eq_ignore_ascii_case("BINARY")
    }

    pub fn compare(&self, left: &[u8], right: &[u8]) -> Ordering {
        self.0.compare(left, right)
    }
}

impl Default for CollSeq {
    fn default() -> Self {
        Self::binary()
    }
}

impl fmt::Debug for CollSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CollSeq({})", self.name())
    }
}

impl PartialEq for CollSeq {
    fn eq(&self, other: &Self) -> bool {
        self.name().eq_ignore_ascii_case(other.name())
    }
}

/// Name → collation map with the built-ins pre-registered.
#[derive(Debug, Clone)]
pub struct CollationRegistry {
    by_name: HashMap<String, CollSeq>,
}

impl CollationRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            by_name: HashMap::new(),
        };
        registry.register(CollSeq::binary());
        registry.register(CollSeq::nocase());
        registry.register(CollSeq::rtrim());
        registry
    }

    /// Add or replace a collation.
    pub fn register(&mut self, coll: CollSeq) {
        self.by_name.insert(coll.name().to_ascii_uppercase(), coll);
    }

    pub fn find(&self, name: &str) -> Option<CollSeq> {
        self.by_name.get(&name.to_ascii_uppercase()).cloned()
    }
}

impl Default for CollationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ReverseCollation;

    impl CollationFunction for ReverseCollation {
        fn name(&self) -> &str {
            "reverse"
        }

        fn compare(&self, left: &[u8], right: &[u8]) -> Ordering {
            right.cmp(left)
        }
    }

    #[test]
    fn test_collation_binary_memcmp() {
        let coll = CollSeq::binary();
        assert_eq!(coll.compare(b"abc", b"abd"), Ordering::Less);
        assert_eq!(coll.compare(b"ABC", b"abc"), Ordering::Less);
        assert!(coll.is_binary());
    }

    #[test]
    fn test_collation_nocase() {
        let coll = CollSeq::nocase();
        assert_eq!(coll.compare(b"Alice", b"aLICE"), Ordering::Equal);
        assert_eq!(coll.compare(b"A", b"b"), Ordering::Less);
    }

    #[test]
    fn test_collation_rtrim() {
        let coll = CollSeq::rtrim();
        assert_eq!(coll.compare(b"hi   ", b"hi"), Ordering::Equal);
        assert_eq!(coll.compare(b"   ", b""), Ordering::Equal);
        assert_ne!(coll.compare(b"hi\t", b"hi"), Ordering::Equal);
    }

    #[test]
    fn test_registry_lookup_is_case_insensitive() {
        let mut registry = CollationRegistry::new();
        assert!(registry.find("nocase").is_some());
        assert!(registry.find("REVERSE").is_none());
        registry.register(CollSeq::new(ReverseCollation));
        let rev = registry.find("Reverse").unwrap();
        assert_eq!(rev.compare(b"a", b"b"), Ordering::Greater);
    }

    #[test]
    fn test_collation_antisymmetric() {
        let inputs: [&[u8]; 4] = [b"a", b"B", b"a  ", b""];
        for coll in [CollSeq::binary(), CollSeq::nocase(), CollSeq::rtrim()] {
            for a in inputs {
                for b in inputs {
                    assert_eq!(coll.compare(a, b), coll.compare(b, a).reverse());
                }
            }
        }
    }
}
