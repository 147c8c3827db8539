//! Domain layer
//!
//! Pure domain entities for cross-domain secret replication, with no
//! dependency on a particular secret store, key service or database.
//!
//! ## Module Organization
//!
//! - `id`: Type-safe identifiers with the NewType pattern
//! - `secret`: Secrets, secret references and replication targets
//! - `policy`: Grants and canonical policy documents
//! - `record`: Persistent replication records

pub mod id;
pub mod policy;
pub mod record;
pub mod secret;

pub use id::{DomainId, KeyRef, SecretPath, SecretVersion};
pub use policy::{
    domain_principal, replica_scope, root_principal, Grant, GrantCondition, PolicyDocument,
    ADMIN_ACTION, CONSUMER_ACTIONS, KEY_RESOURCE_SCOPE,
};
pub use record::{RecordStatus, ReplicationRecord};
pub use secret::{ReplicationTarget, Secret, SecretRef, TargetKey};
