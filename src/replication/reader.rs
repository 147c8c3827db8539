//! Consistent reads of a source secret.

use std::sync::Arc;

use super::error::{ReplicationError, Result};
use crate::domain::{DomainId, Secret, SecretPath, SecretVersion};
use crate::secrets::{ScopedCredential, SecretStore};

/// Reads a secret's metadata and value and checks they belong to the same version.
#[derive(Clone)]
pub struct SecretReader {
    store: Arc<dyn SecretStore>,
}

impl SecretReader {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    fn check_domain(domain: &DomainId, credential: &ScopedCredential) -> Result<()> {
        if &credential.domain != domain {
            return Err(ReplicationError::access_denied(
                domain.as_str(),
                format!("credential is scoped to domain '{}'", credential.domain),
            ));
        }
        Ok(())
    }

    /// Read `domain:path`.
    ///
    /// # Errors
    ///
    /// - `Inconsistent` if the value's version differs from the described version
    /// - `NotFound` / `AccessDenied` / `Throttled` from the store
    pub async fn read(
        &self,
        domain: &DomainId,
        path: &SecretPath,
        credential: &ScopedCredential,
    ) -> Result<Secret> {
        Self::check_domain(domain, credential)?;

        let description = self.store.describe_secret(credential, path).await?;
        let payload = self.store.get_secret_value(credential, path).await?;

        if payload.version != description.version {
            return Err(ReplicationError::inconsistent(
                format!("{}:{}", domain, path),
                description.version.as_str(),
                payload.version.as_str(),
            ));
        }

        tracing::debug!(
            domain = %domain,
            path = %path,
            version = %payload.version,
            "Read source secret"
        );

        Ok(Secret {
            domain: domain.clone(),
            path: path.clone(),
            version: payload.version,
            value: payload.value,
            key_ref: description.key_ref,
            tags: description.tags,
        })
    }

    /// Current version without fetching the value.
    pub async fn current_version(
        &self,
        domain: &DomainId,
        path: &SecretPath,
        credential: &ScopedCredential,
    ) -> Result<SecretVersion> {
        Self::check_domain(domain, credential)?;
        Ok(self.store.describe_secret(credential, path).await?.version)
    }
}
