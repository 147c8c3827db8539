//! Secure types for handling secret material.
//!
//! Secret values are opaque bytes. They pass through the engine from a source
//! store to a destination store and must never reach logs, reports or the
//! replication state database.

use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A byte buffer that redacts its contents in Debug, Display, and serialization.
///
/// # Security
///
/// - Debug output shows `SecretValue([REDACTED])`
/// - Display output shows `[REDACTED]`
/// - Serialization outputs `"[REDACTED]"` (NEVER the actual bytes)
/// - Deserialization accepts a plain string value
/// - Memory is zeroed when dropped (via `zeroize`)
///
/// Call [`SecretValue::expose_bytes`] or [`SecretValue::to_base64`] when the
/// real value has to cross into a secret store.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct SecretValue(Vec<u8>);

impl Serialize for SecretValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> Deserialize<'de> for SecretValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(SecretValue(value.into_bytes()))
    }
}

impl SecretValue {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Decode a value stored as standard base64.
    pub fn from_base64(encoded: &str) -> Result<Self, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(encoded).map(Self)
    }

    /// Exposes the underlying bytes.
    ///
    /// # Security Warning
    ///
    /// Only for handing the value to a secret store. Never log the result.
    pub fn expose_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encodes the value as standard base64 for stores that only accept text.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretValue([REDACTED])")
    }
}

impl fmt::Display for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl PartialEq for SecretValue {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for SecretValue {}

impl From<Vec<u8>> for SecretValue {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<String> for SecretValue {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl From<&str> for SecretValue {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}
