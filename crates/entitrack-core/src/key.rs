//! Entity keys.
//!
//! Every tracked entity is identified by a 128-bit key generated on the
//! client when the object is constructed. The key doubles as the primary key
//! column and as the identity-map lookup key.

use crate::error::{Error, TypeError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque, globally unique entity identifier.
///
/// Rendered as a canonical hyphenated UUID string and stored as a 16-byte
/// binary column. Equality is byte-wise.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(Uuid);

impl EntityKey {
    /// Generate a fresh random key.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The all-zero key.
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Build a key from its 16-byte storage form.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// The 16-byte storage form.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Parse the textual form. Case-insensitive; braces and hyphens optional.
    pub fn parse(text: &str) -> Result<Self, Error> {
        Uuid::parse_str(text.trim()).map(Self).map_err(|_| {
            Error::Type(TypeError {
                expected: "UUID string",
                actual: text.to_string(),
                column: None,
                rust_type: Some("EntityKey"),
            })
        })
    }

    /// Render as a SQL blob literal, e.g. `X'22F4…'`.
    pub fn to_hex_literal(&self) -> String {
        let mut out = String::with_capacity(35);
        out.push_str("X'");
        for byte in self.as_bytes() {
            out.push_str(&format!("{byte:02X}"));
        }
        out.push('\'');
        out
    }

    /// Access the underlying UUID.
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EntityKey {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for EntityKey {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for EntityKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl fmt::Debug for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityKey({})", self.0.hyphenated())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_insensitive() {
        let upper = EntityKey::parse("22F4916A-430D-45C3-9FB4-4958E7C5216C").unwrap();
        let lower = EntityKey::parse("22f4916a-430d-45c3-9fb4-4958e7c5216c").unwrap();
        assert_eq!(upper, lower);
        assert_eq!(upper.to_string(), "22f4916a-430d-45c3-9fb4-4958e7c5216c");
    }

    #[test]
    fn bytes_are_stable() {
        let key = EntityKey::new();
        assert_eq!(EntityKey::from_bytes(*key.as_bytes()), key);
        assert_ne!(EntityKey::new(), key);
    }

    #[test]
    fn hex_literal() {
        let key = EntityKey::parse("22F4916A-430D-45C3-9FB4-4958E7C5216C").unwrap();
        assert_eq!(key.to_hex_literal(), "X'22F4916A430D45C39FB44958E7C5216C'");
    }

    #[test]
    fn garbage_is_a_type_error() {
        let err = EntityKey::parse("not-a-key").unwrap_err();
        assert!(matches!(err, Error::Type(_)));
    }
}
