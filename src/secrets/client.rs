//! Boundary traits for the external services a replication pass talks to.
//!
//! Three services sit behind these traits: a per-domain secret store, a
//! per-domain key-management service, and the trust exchange that issues
//! short-lived credentials scoped to one domain. Every store and key call is
//! made with a [`ScopedCredential`] for the domain being touched.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use super::types::SecretValue;
use crate::domain::{DomainId, KeyRef, PolicyDocument, SecretPath, SecretVersion};
use crate::replication::error::Result;

/// What a credential will be used for. Read and write credentials are cached
/// separately so a read-only identity is never used for writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialPurpose {
    Read,
    Write,
}

impl CredentialPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialPurpose::Read => "read",
            CredentialPurpose::Write => "write",
        }
    }

    /// Session tag presented to the trust exchange.
    pub fn session_tag(&self) -> String {
        format!("crossvault-{}", self.as_str())
    }
}

impl fmt::Display for CredentialPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw output of a trust exchange.
#[derive(Debug, Clone)]
pub struct IssuedCredential {
    pub token: SecretValue,
    pub lease: Duration,
}

/// A short-lived credential valid for exactly one domain.
#[derive(Debug, Clone)]
pub struct ScopedCredential {
    pub domain: DomainId,
    pub purpose: CredentialPurpose,
    pub token: SecretValue,
    pub issued_at: Instant,
    pub expires_at: Instant,
}

impl ScopedCredential {
    pub fn new(domain: DomainId, purpose: CredentialPurpose, issued: IssuedCredential) -> Self {
        let issued_at = Instant::now();
        Self {
            domain,
            purpose,
            token: issued.token,
            issued_at,
            expires_at: issued_at + issued.lease,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// True when the lease ends within `skew` from now (or already has).
    pub fn expires_within(&self, skew: Duration) -> bool {
        Instant::now() + skew >= self.expires_at
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn can_write(&self) -> bool {
        self.purpose == CredentialPurpose::Write
    }
}

/// Secret metadata without the value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretDescription {
    pub path: SecretPath,
    pub version: SecretVersion,
    pub key_ref: KeyRef,
    pub tags: BTreeMap<String, String>,
}

/// A value read at a specific version.
#[derive(Debug, Clone)]
pub struct SecretPayload {
    pub version: SecretVersion,
    pub value: SecretValue,
}

/// Input for creating a secret that does not exist yet.
#[derive(Debug, Clone)]
pub struct NewSecret {
    pub path: SecretPath,
    pub value: SecretValue,
    pub key_ref: KeyRef,
    pub tags: BTreeMap<String, String>,
}

/// Per-domain secret store.
///
/// # Security Considerations
///
/// - Implementations MUST NOT log secret values
/// - The domain is taken from the credential; a credential never reaches
///   another domain's store
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Metadata of the current version.
    ///
    /// # Errors
    ///
    /// - [`ReplicationError::NotFound`] if the path holds no secret
    /// - [`ReplicationError::AccessDenied`] if the credential may not read it
    ///
    /// [`ReplicationError::NotFound`]: crate::replication::ReplicationError::NotFound
    /// [`ReplicationError::AccessDenied`]: crate::replication::ReplicationError::AccessDenied
    async fn describe_secret(
        &self,
        credential: &ScopedCredential,
        path: &SecretPath,
    ) -> Result<SecretDescription>;

    /// Value of the current version, together with that version.
    async fn get_secret_value(
        &self,
        credential: &ScopedCredential,
        path: &SecretPath,
    ) -> Result<SecretPayload>;

    /// Create a new secret and return its first version.
    async fn create_secret(
        &self,
        credential: &ScopedCredential,
        secret: NewSecret,
    ) -> Result<SecretVersion>;

    /// Store a new version of an existing secret.
    async fn put_secret_value(
        &self,
        credential: &ScopedCredential,
        path: &SecretPath,
        value: &SecretValue,
    ) -> Result<SecretVersion>;
}

/// Per-domain key-management service.
#[async_trait]
pub trait KeyManagement: Send + Sync {
    async fn get_key_policy(
        &self,
        credential: &ScopedCredential,
        key_ref: &KeyRef,
    ) -> Result<PolicyDocument>;

    /// Replace the whole policy of a key.
    async fn put_key_policy(
        &self,
        credential: &ScopedCredential,
        key_ref: &KeyRef,
        document: &PolicyDocument,
    ) -> Result<()>;
}

/// Issues credentials scoped to a single domain.
#[async_trait]
pub trait TrustExchange: Send + Sync {
    /// Assume `role` in `domain`.
    ///
    /// # Errors
    ///
    /// - `TrustDenied { permanent: true }` when no trust relationship exists
    /// - `TrustDenied { permanent: false }` or `Throttled` for transient failures
    async fn assume_identity(
        &self,
        domain: &DomainId,
        role: &str,
        session_tag: &str,
    ) -> Result<IssuedCredential>;
}
