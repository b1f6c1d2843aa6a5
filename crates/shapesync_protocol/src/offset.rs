//! Log positions and log incarnations.
//!
//! Offsets are opaque to the client: they are echoed back to the server
//! verbatim and persisted as strings. The only offset the client ever
//! constructs itself is [`Offset::before_all`].

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Position of a message within one shape log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Offset(String);

impl Offset {
    /// Textual form of the "from the beginning" sentinel.
    pub const BEFORE_ALL: &'static str = "-1";

    /// Creates an offset from its wire representation.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The offset that requests the log from its first entry.
    pub fn before_all() -> Self {
        Self(Self::BEFORE_ALL.to_string())
    }

    /// Returns the wire representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for the "from the beginning" sentinel.
    pub fn is_before_all(&self) -> bool {
        self.0 == Self::BEFORE_ALL
    }

    /// Decodes the `<tx>_<op>` form, if the offset uses it.
    ///
    /// Servers are free to use other encodings; callers must treat `None`
    /// as "unknown ordering", never as an error.
    pub fn position(&self) -> Option<LogPosition> {
        let (tx, op) = self.0.split_once('_')?;
        Some(LogPosition {
            tx: tx.parse().ok()?,
            op: op.parse().ok()?,
        })
    }

    /// Compares two offsets when both orderings are known.
    ///
    /// The sentinel sorts before every other offset.
    pub fn compare(&self, other: &Offset) -> Option<Ordering> {
        match (self.is_before_all(), other.is_before_all()) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (false, false) => Some(self.position()?.cmp(&other.position()?)),
        }
    }
}

impl Default for Offset {
    fn default() -> Self {
        Self::before_all()
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Offset {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// Decoded `<tx>_<op>` offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogPosition {
    /// Transaction component.
    pub tx: u64,
    /// Operation index within the transaction.
    pub op: u64,
}

/// Identifier of one incarnation of a shape log.
///
/// A new handle is issued whenever the server compacts or redefines the
/// log. An offset is only meaningful together with the handle it was
/// issued under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(String);

impl Handle {
    /// Creates a handle from its wire representation.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the wire representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Handle {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel() {
        let offset = Offset::before_all();
        assert!(offset.is_before_all());
        assert_eq!(offset.as_str(), "-1");
        assert_eq!(Offset::default(), offset);
        assert!(offset.position().is_none());
    }

    #[test]
    fn position_decoding() {
        let offset = Offset::new("1234_7");
        assert_eq!(offset.position(), Some(LogPosition { tx: 1234, op: 7 }));

        assert!(Offset::new("opaque").position().is_none());
        assert!(Offset::new("12_x").position().is_none());
    }

    #[test]
    fn comparison() {
        let start = Offset::before_all();
        let a = Offset::new("1_0");
        let b = Offset::new("1_3");
        let c = Offset::new("2_0");

        assert_eq!(start.compare(&a), Some(Ordering::Less));
        assert_eq!(a.compare(&start), Some(Ordering::Greater));
        assert_eq!(a.compare(&b), Some(Ordering::Less));
        assert_eq!(c.compare(&b), Some(Ordering::Greater));
        assert_eq!(a.compare(&Offset::new("1_0")), Some(Ordering::Equal));
        assert_eq!(a.compare(&Offset::new("zzz")), None);
    }

    #[test]
    fn serde_transparent() {
        let json = serde_json::to_string(&Offset::new("5_1")).unwrap();
        assert_eq!(json, "\"5_1\"");

        let handle: Handle = serde_json::from_str("\"abc-123\"").unwrap();
        assert_eq!(handle.as_str(), "abc-123");
    }

    proptest::proptest! {
        #[test]
        fn compare_matches_numeric_order(a in (0u64..10_000, 0u64..100), b in (0u64..10_000, 0u64..100)) {
            let left = Offset::new(format!("{}_{}", a.0, a.1));
            let right = Offset::new(format!("{}_{}", b.0, b.1));
            proptest::prop_assert_eq!(left.compare(&right), Some(a.cmp(&b)));
            proptest::prop_assert_eq!(right.compare(&left), Some(b.cmp(&a)));
        }
    }
}
