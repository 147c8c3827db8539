//! Declared domains and replication targets.
//!
//! ```yaml
//! domains:
//!   - id: source-account
//!     role: replicator-read
//!   - id: dest-account
//!     role: replicator-write
//!     default_key: alias/replica
//! targets:
//!   - source: { domain: source-account, path: /vault/creds }
//!     destination: { domain: dest-account, path: /replica/creds }
//!     consumers: [svc-a]
//! ```
//!
//! Declarations stay stringly typed until [`super::AppConfig::resolve_targets`]
//! checks them against each other.

use serde::{Deserialize, Serialize};
use validator::Validate;

/// One trust domain and the role assumed in it.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DomainConfig {
    #[validate(length(min = 1, message = "Domain id cannot be empty"))]
    pub id: String,

    /// Role assumed through the trust exchange
    #[validate(length(min = 1, message = "Domain role cannot be empty"))]
    pub role: String,

    /// Replica key used when a target names none
    #[serde(default)]
    pub default_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SourceDeclaration {
    #[validate(length(min = 1, message = "Source domain cannot be empty"))]
    pub domain: String,

    #[validate(length(min = 1, message = "Source path cannot be empty"))]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DestinationDeclaration {
    #[validate(length(min = 1, message = "Destination domain cannot be empty"))]
    pub domain: String,

    #[validate(length(min = 1, message = "Destination path cannot be empty"))]
    pub path: String,

    /// Replica key; falls back to the domain's `default_key`
    #[serde(default)]
    pub key: Option<String>,
}

/// A source secret and where it should be replicated to.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TargetDeclaration {
    #[validate(nested)]
    pub source: SourceDeclaration,

    #[validate(nested)]
    pub destination: DestinationDeclaration,

    /// Consumer tags granted decrypt access on the replica key
    #[serde(default)]
    pub consumers: Vec<String>,
}
