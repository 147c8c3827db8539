//! Credential broker: scoped credentials per (domain, purpose), cached until
//! shortly before their lease ends.
//!
//! # Concurrency
//!
//! Each (domain, purpose) pair owns one slot guarded by an async mutex. The
//! mutex is held across the trust exchange, so concurrent callers that find a
//! stale entry queue behind a single refresh and then read the new credential
//! from the slot. A refreshed credential replaces the old one wholesale; there
//! is never a moment where a reader sees a half-updated entry.
//!
//! # Refresh failures
//!
//! If a refresh fails transiently while the cached lease is still valid (only
//! the refresh skew has been reached), the cached credential is returned and
//! a warning logged. Once the lease itself has ended, a failed refresh is
//! reported as `TrustExpired`. Permanent denials are always surfaced.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::error::{ReplicationError, Result};
use crate::domain::DomainId;
use crate::observability::MetricsRecorder;
use crate::secrets::{CredentialPurpose, ScopedCredential, TrustExchange};

type Slot = Arc<Mutex<Option<Arc<ScopedCredential>>>>;

pub struct CredentialBroker {
    exchange: Arc<dyn TrustExchange>,
    roles: HashMap<DomainId, String>,
    refresh_skew: Duration,
    slots: DashMap<(DomainId, CredentialPurpose), Slot>,
    metrics: MetricsRecorder,
}

impl CredentialBroker {
    /// `roles` maps each domain to the role assumed in it.
    pub fn new(
        exchange: Arc<dyn TrustExchange>,
        roles: HashMap<DomainId, String>,
        refresh_skew: Duration,
    ) -> Self {
        Self {
            exchange,
            roles,
            refresh_skew,
            slots: DashMap::new(),
            metrics: MetricsRecorder::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsRecorder) -> Self {
        self.metrics = metrics;
        self
    }

    fn slot(&self, domain: &DomainId, purpose: CredentialPurpose) -> Slot {
        self.slots.entry((domain.clone(), purpose)).or_default().clone()
    }

    /// Return a credential for `domain` with at least `refresh_skew` of lease left,
    /// exchanging for a new one when needed.
    pub async fn acquire(
        &self,
        domain: &DomainId,
        purpose: CredentialPurpose,
    ) -> Result<Arc<ScopedCredential>> {
        let slot = self.slot(domain, purpose);
        let mut cached = slot.lock().await;

        if let Some(credential) = cached.as_ref() {
            if !credential.expires_within(self.refresh_skew) {
                return Ok(credential.clone());
            }
        }

        let role = self.roles.get(domain).ok_or_else(|| {
            ReplicationError::trust_denied(domain.as_str(), "no role configured for domain", true)
        })?;

        match self.exchange.assume_identity(domain, role, &purpose.session_tag()).await {
            Ok(issued) => {
                self.metrics.record_credential_exchange(domain.as_str(), true);
                let credential = Arc::new(ScopedCredential::new(domain.clone(), purpose, issued));
                tracing::debug!(
                    domain = %domain,
                    purpose = %purpose,
                    lease_seconds = credential.remaining().as_secs(),
                    "Obtained scoped credential"
                );
                *cached = Some(credential.clone());
                Ok(credential)
            }
            Err(error) => {
                self.metrics.record_credential_exchange(domain.as_str(), false);
                match cached.as_ref() {
                    Some(previous) if error.is_retryable() && !previous.is_expired() => {
                        tracing::warn!(
                            domain = %domain,
                            purpose = %purpose,
                            error = %error,
                            remaining_seconds = previous.remaining().as_secs(),
                            "Credential refresh failed; reusing the cached credential"
                        );
                        Ok(previous.clone())
                    }
                    Some(_) if error.is_retryable() => {
                        *cached = None;
                        Err(ReplicationError::trust_expired(domain.as_str()))
                    }
                    _ => Err(error),
                }
            }
        }
    }

    /// Drop the cached credential so the next acquisition exchanges again.
    pub async fn invalidate(&self, domain: &DomainId, purpose: CredentialPurpose) {
        if let Some(slot) = self.slots.get(&(domain.clone(), purpose)).map(|s| s.clone()) {
            *slot.lock().await = None;
        }
    }

    /// Number of (domain, purpose) pairs currently holding a credential.
    pub fn cached_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| entry.value().try_lock().map(|c| c.is_some()).unwrap_or(true))
            .count()
    }
}
