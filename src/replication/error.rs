//! Failure taxonomy for a single replication target.
//!
//! Every error a pass can run into maps to exactly one [`FailureKind`], which is
//! what reports and the replication record carry. Retry decisions are made from
//! the error itself via [`ReplicationError::is_retryable`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Result type for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors raised while reconciling one target.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    /// The trust exchange refused to issue a credential.
    #[error("Trust exchange denied for domain '{domain}': {message}")]
    TrustDenied { domain: String, message: String, permanent: bool },

    /// A cached credential lapsed and could not be refreshed.
    #[error("Credential for domain '{domain}' expired and could not be refreshed")]
    TrustExpired { domain: String },

    /// The requested secret or key does not exist.
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    /// The credential is valid but not authorized for the operation.
    #[error("Access denied to {resource}: {message}")]
    AccessDenied { resource: String, message: String },

    /// The remote service asked the caller to slow down.
    #[error("Request throttled: {message}")]
    Throttled { message: String, retry_after: Option<Duration> },

    /// The secret version moved between two reads of the same pass.
    #[error("Inconsistent read of {resource}: expected version {expected}, observed {observed}")]
    Inconsistent { resource: String, expected: String, observed: String, during_apply: bool },

    /// A planned policy document broke a structural invariant.
    #[error("Invariant violation: {message}")]
    InvariantViolation { message: String },

    /// A destination write (policy or value) failed.
    #[error("Write to {resource} failed: {message}")]
    WriteError { resource: String, message: String, transient: bool },

    /// Another pass holds the lease for this target.
    #[error("Reconciliation already in progress for {key}")]
    AlreadyInProgress { key: String },

    /// The pass deadline elapsed.
    #[error("Reconciliation of {key} exceeded its deadline of {deadline_ms}ms")]
    Timeout { key: String, deadline_ms: u64 },
}

impl ReplicationError {
    pub fn trust_denied(
        domain: impl Into<String>,
        message: impl Into<String>,
        permanent: bool,
    ) -> Self {
        Self::TrustDenied { domain: domain.into(), message: message.into(), permanent }
    }

    pub fn trust_expired(domain: impl Into<String>) -> Self {
        Self::TrustExpired { domain: domain.into() }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound { resource: resource.into() }
    }

    pub fn access_denied(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AccessDenied { resource: resource.into(), message: message.into() }
    }

    pub fn throttled(message: impl Into<String>) -> Self {
        Self::Throttled { message: message.into(), retry_after: None }
    }

    pub fn inconsistent(
        resource: impl Into<String>,
        expected: impl Into<String>,
        observed: impl Into<String>,
    ) -> Self {
        Self::Inconsistent {
            resource: resource.into(),
            expected: expected.into(),
            observed: observed.into(),
            during_apply: false,
        }
    }

    pub fn invariant_violation(message: impl Into<String>) -> Self {
        Self::InvariantViolation { message: message.into() }
    }

    pub fn write_error(
        resource: impl Into<String>,
        message: impl Into<String>,
        transient: bool,
    ) -> Self {
        Self::WriteError { resource: resource.into(), message: message.into(), transient }
    }

    pub fn already_in_progress(key: impl Into<String>) -> Self {
        Self::AlreadyInProgress { key: key.into() }
    }

    pub fn timeout(key: impl Into<String>, deadline: Duration) -> Self {
        Self::Timeout { key: key.into(), deadline_ms: deadline.as_millis() as u64 }
    }

    /// Marks an `Inconsistent` error as detected while applying writes.
    /// Such errors end the pass instead of being retried within it.
    pub fn during_apply(self) -> Self {
        match self {
            Self::Inconsistent { resource, expected, observed, .. } => {
                Self::Inconsistent { resource, expected, observed, during_apply: true }
            }
            other => other,
        }
    }

    /// Folds a destination-side failure into the write taxonomy.
    ///
    /// Access denials, throttling and trust failures hit while writing are all
    /// reported as `WriteError`; the transient flag keeps the retry decision.
    pub fn into_write_error(self, resource: &str) -> Self {
        match self {
            Self::AccessDenied { message, .. } => Self::write_error(resource, message, false),
            Self::Throttled { message, .. } => Self::write_error(resource, message, true),
            Self::NotFound { resource: missing } => {
                Self::write_error(resource, format!("{} does not exist", missing), false)
            }
            Self::TrustDenied { message, permanent, .. } => {
                Self::write_error(resource, message, !permanent)
            }
            other => other,
        }
    }

    /// Whether a retry within the same pass may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TrustDenied { permanent, .. } => !permanent,
            Self::TrustExpired { .. } | Self::Throttled { .. } => true,
            Self::Inconsistent { during_apply, .. } => !during_apply,
            Self::WriteError { transient, .. } => *transient,
            Self::NotFound { .. }
            | Self::AccessDenied { .. }
            | Self::InvariantViolation { .. }
            | Self::AlreadyInProgress { .. }
            | Self::Timeout { .. } => false,
        }
    }

    /// Minimum delay the remote service asked for, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Throttled { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::TrustDenied { .. } => FailureKind::TrustDenied,
            Self::TrustExpired { .. } => FailureKind::TrustExpired,
            Self::NotFound { .. } => FailureKind::NotFound,
            Self::AccessDenied { .. } => FailureKind::AccessDenied,
            Self::Throttled { .. } => FailureKind::Throttled,
            Self::Inconsistent { .. } => FailureKind::Inconsistent,
            Self::InvariantViolation { .. } => FailureKind::InvariantViolation,
            Self::WriteError { .. } => FailureKind::WriteError,
            Self::AlreadyInProgress { .. } => FailureKind::AlreadyInProgress,
            Self::Timeout { .. } => FailureKind::Timeout,
        }
    }
}

/// Classification of a failed pass, as reported and persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TrustDenied,
    TrustExpired,
    NotFound,
    AccessDenied,
    Throttled,
    Inconsistent,
    InvariantViolation,
    WriteError,
    AlreadyInProgress,
    Timeout,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::TrustDenied => "trust_denied",
            FailureKind::TrustExpired => "trust_expired",
            FailureKind::NotFound => "not_found",
            FailureKind::AccessDenied => "access_denied",
            FailureKind::Throttled => "throttled",
            FailureKind::Inconsistent => "inconsistent",
            FailureKind::InvariantViolation => "invariant_violation",
            FailureKind::WriteError => "write_error",
            FailureKind::AlreadyInProgress => "already_in_progress",
            FailureKind::Timeout => "timeout",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "trust_denied" => Ok(FailureKind::TrustDenied),
            "trust_expired" => Ok(FailureKind::TrustExpired),
            "not_found" => Ok(FailureKind::NotFound),
            "access_denied" => Ok(FailureKind::AccessDenied),
            "throttled" => Ok(FailureKind::Throttled),
            "inconsistent" => Ok(FailureKind::Inconsistent),
            "invariant_violation" => Ok(FailureKind::InvariantViolation),
            "write_error" => Ok(FailureKind::WriteError),
            "already_in_progress" => Ok(FailureKind::AlreadyInProgress),
            "timeout" => Ok(FailureKind::Timeout),
            other => Err(format!("unknown failure kind '{}'", other)),
        }
    }
}
