//! External service boundary for replication.
//!
//! The reconciler only ever talks to three traits defined in [`client`]:
//! [`SecretStore`], [`KeyManagement`] and [`TrustExchange`]. Two backends
//! implement all three:
//!
//! - [`memory::InMemoryCloud`]: a multi-domain simulator used by the `local`
//!   backend and the test suite
//! - [`vault::VaultCloud`]: HashiCorp Vault, one namespace per domain
//!
//! Secret bytes travel as [`SecretValue`], which redacts itself in logs and
//! serialized output.

pub mod client;
pub mod memory;
pub mod types;
pub mod vault;

use std::sync::Arc;

pub use client::{
    CredentialPurpose, IssuedCredential, KeyManagement, NewSecret, ScopedCredential,
    SecretDescription, SecretPayload, SecretStore, TrustExchange,
};
pub use memory::{CloudFixture, CloudOperation, InMemoryCloud, WriteKind};
pub use types::SecretValue;
pub use vault::{VaultBackendConfig, VaultCloud, VaultDomainConfig};

/// Handles to the three external services, shared by every component of a run.
#[derive(Clone)]
pub struct CloudClients {
    pub store: Arc<dyn SecretStore>,
    pub keys: Arc<dyn KeyManagement>,
    pub trust: Arc<dyn TrustExchange>,
}

impl CloudClients {
    /// Use one backend for all three services.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: SecretStore + KeyManagement + TrustExchange + 'static,
    {
        Self { store: backend.clone(), keys: backend.clone(), trust: backend }
    }
}
