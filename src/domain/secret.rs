//! Secrets and replication targets.
//!
//! A [`ReplicationTarget`] is the declared intent "keep the secret at
//! `source` replicated into `dest_domain` at `dest_path`, readable by these
//! consumers". Its [`TargetKey`] identifies it everywhere else: leases, the
//! state store and reports.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::id::{DomainId, KeyRef, SecretPath, SecretVersion};
use crate::secrets::SecretValue;

/// A secret location: domain plus path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    pub domain: DomainId,
    pub path: SecretPath,
}

impl SecretRef {
    pub fn new(domain: impl Into<DomainId>, path: impl Into<SecretPath>) -> Self {
        Self { domain: domain.into(), path: path.into() }
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.domain, self.path)
    }
}

/// A secret as read from its store. Values are only ever held transiently.
#[derive(Debug, Clone)]
pub struct Secret {
    pub domain: DomainId,
    pub path: SecretPath,
    pub version: SecretVersion,
    pub value: SecretValue,
    pub key_ref: KeyRef,
    pub tags: BTreeMap<String, String>,
}

impl Secret {
    pub fn secret_ref(&self) -> SecretRef {
        SecretRef { domain: self.domain.clone(), path: self.path.clone() }
    }
}

/// Identity of a replication target: (source, destination domain, destination path).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TargetKey {
    pub source: SecretRef,
    pub dest_domain: DomainId,
    pub dest_path: SecretPath,
}

impl TargetKey {
    pub fn new(source: SecretRef, dest_domain: DomainId, dest_path: SecretPath) -> Self {
        Self { source, dest_domain, dest_path }
    }

    pub fn destination(&self) -> SecretRef {
        SecretRef { domain: self.dest_domain.clone(), path: self.dest_path.clone() }
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} => {}:{}", self.source, self.dest_domain, self.dest_path)
    }
}

/// Declared replication intent with the destination key already resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationTarget {
    pub source: SecretRef,
    pub dest_domain: DomainId,
    pub dest_path: SecretPath,
    /// Key that encrypts the replica and whose policy carries consumer grants.
    pub dest_key: KeyRef,
    pub consumer_tags: BTreeSet<String>,
}

impl ReplicationTarget {
    pub fn key(&self) -> TargetKey {
        TargetKey::new(self.source.clone(), self.dest_domain.clone(), self.dest_path.clone())
    }
}
