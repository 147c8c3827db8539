//! Domain Name Types with NewType Pattern
//!
//! Type-safe wrappers for the identifiers that flow through a replication
//! pass: trust domains, secret paths, key references and opaque version
//! markers. Mixing them up (passing a key reference where a path is expected)
//! is a compile error rather than a misdirected write.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to generate NewType name wrappers with all required traits
macro_rules! domain_name {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a name from anything string-like. No validation is applied;
            /// configuration validation rejects empty values before they get here.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner string value
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Convert to inner string value
            pub fn into_string(self) -> String {
                self.0
            }

            /// Whether the value is empty or whitespace only
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

domain_name!(
    /// An isolated trust boundary (an account) with its own identity namespace.
    DomainId
);

domain_name!(
    /// Location of a secret inside one domain's secret store, e.g. `/vault/creds`.
    SecretPath
);

domain_name!(
    /// Reference to an encryption key in a domain's key-management service.
    KeyRef
);

domain_name!(
    /// Opaque, store-issued version marker. Equal markers imply equal values.
    SecretVersion
);
