//! Single version tags
//!
//! A tag names the node that produced a revision and a signed ordinal. The
//! magnitude of the ordinal orders revisions, a negative sign marks a
//! deletion. Text form is `node`, then `+` or `-`, then the magnitude in
//! lowercase hex: `a+1f`, `b-3`.

use std::fmt;

/// Marker for a live revision
pub const LIVE_MARK: char = '+';

/// Marker for a deletion
pub const DELETE_MARK: char = '-';

/// One revision step produced by one node
///
/// The zero ordinal is the "unversioned" sentinel. It renders as the empty
/// string and sorts below every real tag.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct VersionTag {
    node: String,
    ordinal: i64,
}

impl VersionTag {
    /// Create a tag; an ordinal of zero yields the unversioned sentinel
    #[must_use]
    pub fn new(node: impl Into<String>, ordinal: i64) -> Self {
        if ordinal == 0 {
            return Self::unversioned();
        }
        Self {
            node: node.into(),
            ordinal,
        }
    }

    /// The sentinel standing for "no version"
    #[must_use]
    pub const fn unversioned() -> Self {
        Self {
            node: String::new(),
            ordinal: 0,
        }
    }

    /// Parse the text form. Malformed input degrades to the sentinel.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let Some(idx) = text.rfind([LIVE_MARK, DELETE_MARK]) else {
            return Self::unversioned();
        };
        let node = &text[..idx];
        let digits = &text[idx + 1..];
        if node.is_empty() || digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Self::unversioned();
        }
        let Some(magnitude) = u64::from_str_radix(digits, 16)
            .ok()
            .and_then(|m| i64::try_from(m).ok())
        else {
            return Self::unversioned();
        };
        let ordinal = if text[idx..].starts_with(DELETE_MARK) {
            -magnitude
        } else {
            magnitude
        };
        Self::new(node, ordinal)
    }

    /// Producing node
    #[must_use]
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Signed ordinal
    #[must_use]
    pub const fn ordinal(&self) -> i64 {
        self.ordinal
    }

    /// Absolute ordinal, the value revisions are ordered by
    #[must_use]
    pub const fn magnitude(&self) -> u64 {
        self.ordinal.unsigned_abs()
    }

    #[must_use]
    pub const fn is_unversioned(&self) -> bool {
        self.ordinal == 0
    }

    #[must_use]
    pub const fn is_delete(&self) -> bool {
        self.ordinal < 0
    }

    /// The tag `node` writes on top of this one
    #[must_use]
    pub fn next(&self, node: &str, is_delete: bool) -> Self {
        let magnitude = self.ordinal.saturating_abs().saturating_add(1);
        let ordinal = if is_delete { -magnitude } else { magnitude };
        Self {
            node: node.to_string(),
            ordinal,
        }
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unversioned() {
            return Ok(());
        }
        let mark = if self.is_delete() { DELETE_MARK } else { LIVE_MARK };
        write!(f, "{}{}{:x}", self.node, mark, self.magnitude())
    }
}

impl fmt::Debug for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VersionTag({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(VersionTag::new("a", 1).to_string(), "a+1");
        assert_eq!(VersionTag::new("node-b", 31).to_string(), "node-b+1f");
        assert_eq!(VersionTag::new("a", -3).to_string(), "a-3");
        assert_eq!(VersionTag::unversioned().to_string(), "");
        assert_eq!(VersionTag::new("a", 0), VersionTag::unversioned());
    }

    #[test]
    fn test_parse() {
        assert_eq!(VersionTag::parse("a+1f"), VersionTag::new("a", 31));
        assert_eq!(VersionTag::parse("a-2"), VersionTag::new("a", -2));
        // Node ids may contain the marks; the last one wins
        assert_eq!(VersionTag::parse("node-b+a"), VersionTag::new("node-b", 10));
        assert_eq!(VersionTag::parse("x+y-1"), VersionTag::new("x+y", -1));
    }

    #[test]
    fn test_parse_malformed() {
        for text in ["", "a", "+1", "a+", "a+zz", "a+0", "a+ffffffffffffffff", "a+1 "] {
            assert!(
                VersionTag::parse(text).is_unversioned(),
                "{text:?} should parse to the sentinel"
            );
        }
    }

    #[test]
    fn test_next() {
        let tag = VersionTag::new("a", 5);
        assert_eq!(tag.next("b", false), VersionTag::new("b", 6));
        assert_eq!(tag.next("b", true), VersionTag::new("b", -6));
        assert_eq!(VersionTag::new("a", -6).next("a", false), VersionTag::new("a", 7));
        assert_eq!(VersionTag::unversioned().next("a", false), VersionTag::new("a", 1));
    }
}
