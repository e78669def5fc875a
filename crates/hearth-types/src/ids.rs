//! Typed identifier for page contexts.
//!
//! A page is one event loop sharing the background agent (a browser tab, a
//! window, a test harness). Page ids wrap UUIDv7 so they sort by creation time
//! and display as standard UUID text in logs. The `short()` form is for human
//! display only, never used as a lookup key.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A page context identifier (UUIDv7).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageId(uuid::Uuid);

impl PageId {
    /// Create a new time-ordered ID (UUIDv7).
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }

    /// First 8 hex characters, for human display only.
    pub fn short(&self) -> String {
        self.0.as_simple().to_string()[..8].to_string()
    }

    /// Full 32-character hex string (no hyphens).
    pub fn to_hex(&self) -> String {
        self.0.as_simple().to_string()
    }

    /// Parse from a hex string (32 chars, no hyphens) or standard UUID format.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        uuid::Uuid::parse_str(s).map(Self)
    }
}

impl Default for PageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<uuid::Uuid> for PageId {
    fn from(u: uuid::Uuid) -> Self {
        Self(u)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageId({})", self.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_unique() {
        assert_ne!(PageId::new(), PageId::new());
    }

    #[test]
    fn test_parse_roundtrip_hex_and_hyphenated() {
        let id = PageId::new();
        assert_eq!(PageId::parse(&id.to_hex()).unwrap(), id);
        assert_eq!(PageId::parse(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn test_short_is_prefix() {
        let id = PageId::new();
        assert_eq!(id.short().len(), 8);
        assert!(id.to_hex().starts_with(&id.short()));
    }

    #[test]
    fn test_serde_transparent() {
        let id = PageId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
    }
}
