//! In-process simulation of several domains' secret stores, key services and
//! trust relationships.
//!
//! `InMemoryCloud` backs the `local` backend (optionally persisted to a
//! JSON/YAML fixture between runs) and every hermetic test. It enforces the
//! same rules a real deployment would: credentials only reach their own
//! domain, only write-purpose credentials may write, and an exchange succeeds
//! only for a configured (domain, role) trust relationship. Failure injection
//! and write counters let tests drive the reconciler through every edge case.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::client::{
    IssuedCredential, KeyManagement, NewSecret, ScopedCredential, SecretDescription,
    SecretPayload, SecretStore, TrustExchange,
};
use super::types::SecretValue;
use crate::domain::{DomainId, Grant, KeyRef, PolicyDocument, SecretPath, SecretVersion};
use crate::errors::{CrossvaultError, Result as CrossvaultResult};
use crate::replication::error::{ReplicationError, Result};

const DEFAULT_LEASE: Duration = Duration::from_secs(15 * 60);

/// Operations exposed by the simulated services, used to target injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloudOperation {
    AssumeIdentity,
    DescribeSecret,
    GetSecretValue,
    CreateSecret,
    PutSecretValue,
    GetKeyPolicy,
    PutKeyPolicy,
}

/// Kinds of destination writes counted by the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    CreateSecret,
    PutSecretValue,
    PutKeyPolicy,
}

struct StoredSecret {
    versions: Vec<SecretValue>,
    key_ref: KeyRef,
    tags: BTreeMap<String, String>,
}

impl StoredSecret {
    fn current_version(&self) -> SecretVersion {
        SecretVersion::new(format!("v{}", self.versions.len()))
    }

    fn current_value(&self) -> SecretValue {
        self.versions.last().cloned().unwrap_or_default()
    }
}

#[derive(Default)]
struct DomainState {
    secrets: BTreeMap<SecretPath, StoredSecret>,
    key_policies: BTreeMap<KeyRef, PolicyDocument>,
    denied_reads: BTreeSet<SecretPath>,
    deny_writes: bool,
}

struct ScheduledWrite {
    after: CloudOperation,
    domain: DomainId,
    path: SecretPath,
    value: SecretValue,
}

struct CloudState {
    domains: BTreeMap<DomainId, DomainState>,
    trust: BTreeSet<(DomainId, String)>,
    transient_denials: HashMap<DomainId, u32>,
    throttles: HashMap<CloudOperation, u32>,
    scheduled: Vec<ScheduledWrite>,
    writes: Vec<(DomainId, WriteKind)>,
    exchanges: u64,
    lease: Duration,
    exchange_latency: Duration,
    read_latency: Duration,
    write_latency: Duration,
}

impl Default for CloudState {
    fn default() -> Self {
        Self {
            domains: BTreeMap::new(),
            trust: BTreeSet::new(),
            transient_denials: HashMap::new(),
            throttles: HashMap::new(),
            scheduled: Vec::new(),
            writes: Vec::new(),
            exchanges: 0,
            lease: DEFAULT_LEASE,
            exchange_latency: Duration::ZERO,
            read_latency: Duration::ZERO,
            write_latency: Duration::ZERO,
        }
    }
}

impl CloudState {
    fn check_throttle(&mut self, op: CloudOperation) -> Result<()> {
        if let Some(remaining) = self.throttles.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ReplicationError::throttled(format!("{:?} rate exceeded", op)));
            }
        }
        Ok(())
    }

    fn domain_for(&self, credential: &ScopedCredential) -> Result<&DomainState> {
        if credential.is_expired() {
            return Err(ReplicationError::trust_expired(credential.domain.as_str()));
        }
        self.domains
            .get(&credential.domain)
            .ok_or_else(|| ReplicationError::not_found(format!("domain {}", credential.domain)))
    }

    fn writable_domain_for(&mut self, credential: &ScopedCredential) -> Result<&mut DomainState> {
        self.domain_for(credential)?;
        if !credential.can_write() {
            return Err(ReplicationError::access_denied(
                credential.domain.as_str(),
                "read credential cannot write",
            ));
        }
        let domain = self
            .domains
            .get_mut(&credential.domain)
            .ok_or_else(|| ReplicationError::not_found(format!("domain {}", credential.domain)))?;
        if domain.deny_writes {
            return Err(ReplicationError::access_denied(
                credential.domain.as_str(),
                "writes are not permitted for this identity",
            ));
        }
        Ok(domain)
    }

    fn fire_scheduled(&mut self, op: CloudOperation, domain: &DomainId, path: &SecretPath) {
        let Some(index) = self
            .scheduled
            .iter()
            .position(|s| s.after == op && &s.domain == domain && &s.path == path)
        else {
            return;
        };
        let write = self.scheduled.remove(index);
        if let Some(secret) =
            self.domains.get_mut(&write.domain).and_then(|d| d.secrets.get_mut(&write.path))
        {
            secret.versions.push(write.value);
        }
    }
}

/// Multi-domain in-memory cloud.
#[derive(Default)]
pub struct InMemoryCloud {
    state: Mutex<CloudState>,
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn pause(&self, pick: impl Fn(&CloudState) -> Duration) {
        let delay = pick(&self.lock());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    // ---------------------------------------------------------------------
    // Seeding
    // ---------------------------------------------------------------------

    pub fn add_domain(&self, domain: impl Into<DomainId>) {
        self.lock().domains.entry(domain.into()).or_default();
    }

    /// Allow `role` in `domain` to be assumed by the engine.
    pub fn allow_trust(&self, domain: impl Into<DomainId>, role: impl Into<String>) {
        let domain = domain.into();
        let mut state = self.lock();
        state.domains.entry(domain.clone()).or_default();
        state.trust.insert((domain, role.into()));
    }

    pub fn revoke_trust(&self, domain: impl Into<DomainId>, role: &str) {
        self.lock().trust.remove(&(domain.into(), role.to_string()));
    }

    /// Create a key whose policy holds only the domain's root admin grant.
    pub fn create_key(&self, domain: impl Into<DomainId>, key_ref: impl Into<KeyRef>) {
        let domain = domain.into();
        let policy = PolicyDocument::from_grants([Grant::admin_root(&domain)]);
        self.lock().domains.entry(domain).or_default().key_policies.insert(key_ref.into(), policy);
    }

    /// Overwrite a key policy without counting it as a destination write.
    pub fn set_key_policy(
        &self,
        domain: impl Into<DomainId>,
        key_ref: impl Into<KeyRef>,
        document: PolicyDocument,
    ) {
        self.lock()
            .domains
            .entry(domain.into())
            .or_default()
            .key_policies
            .insert(key_ref.into(), document);
    }

    /// Create a secret or add a version to it, bypassing credentials and counters.
    pub fn seed_secret(
        &self,
        domain: impl Into<DomainId>,
        path: impl Into<SecretPath>,
        value: impl Into<SecretValue>,
        key_ref: impl Into<KeyRef>,
    ) -> SecretVersion {
        let mut state = self.lock();
        let domain = state.domains.entry(domain.into()).or_default();
        let secret = domain.secrets.entry(path.into()).or_insert_with(|| StoredSecret {
            versions: Vec::new(),
            key_ref: key_ref.into(),
            tags: BTreeMap::new(),
        });
        secret.versions.push(value.into());
        secret.current_version()
    }

    pub fn secret_value(&self, domain: &DomainId, path: &SecretPath) -> Option<SecretValue> {
        self.lock().domains.get(domain)?.secrets.get(path).map(StoredSecret::current_value)
    }

    pub fn secret_version(&self, domain: &DomainId, path: &SecretPath) -> Option<SecretVersion> {
        self.lock().domains.get(domain)?.secrets.get(path).map(StoredSecret::current_version)
    }

    pub fn secret_tags(
        &self,
        domain: &DomainId,
        path: &SecretPath,
    ) -> Option<BTreeMap<String, String>> {
        self.lock().domains.get(domain)?.secrets.get(path).map(|s| s.tags.clone())
    }

    pub fn key_policy(&self, domain: &DomainId, key_ref: &KeyRef) -> Option<PolicyDocument> {
        self.lock().domains.get(domain)?.key_policies.get(key_ref).cloned()
    }

    // ---------------------------------------------------------------------
    // Counters
    // ---------------------------------------------------------------------

    /// Number of successful writes (values and policies) made to `domain`.
    pub fn write_count(&self, domain: &DomainId) -> usize {
        self.lock().writes.iter().filter(|(d, _)| d == domain).count()
    }

    pub fn writes_of_kind(&self, domain: &DomainId, kind: WriteKind) -> usize {
        self.lock().writes.iter().filter(|(d, k)| d == domain && *k == kind).count()
    }

    /// Number of trust exchanges attempted, including refused ones.
    pub fn exchange_count(&self) -> u64 {
        self.lock().exchanges
    }

    pub fn reset_counters(&self) {
        let mut state = self.lock();
        state.writes.clear();
        state.exchanges = 0;
    }

    // ---------------------------------------------------------------------
    // Failure injection
    // ---------------------------------------------------------------------

    /// Fail the next `times` calls of `op` with `Throttled`.
    pub fn throttle(&self, op: CloudOperation, times: u32) {
        self.lock().throttles.insert(op, times);
    }

    /// Refuse the next `times` exchanges for `domain` with a transient denial.
    pub fn deny_exchange_transiently(&self, domain: impl Into<DomainId>, times: u32) {
        self.lock().transient_denials.insert(domain.into(), times);
    }

    pub fn deny_reads(&self, domain: impl Into<DomainId>, path: impl Into<SecretPath>) {
        self.lock().domains.entry(domain.into()).or_default().denied_reads.insert(path.into());
    }

    pub fn deny_writes(&self, domain: impl Into<DomainId>) {
        self.lock().domains.entry(domain.into()).or_default().deny_writes = true;
    }

    /// Append `value` as a new version of `domain:path` right after the next
    /// `after` call that touches that secret has been served.
    pub fn schedule_write_after(
        &self,
        after: CloudOperation,
        domain: impl Into<DomainId>,
        path: impl Into<SecretPath>,
        value: impl Into<SecretValue>,
    ) {
        self.lock().scheduled.push(ScheduledWrite {
            after,
            domain: domain.into(),
            path: path.into(),
            value: value.into(),
        });
    }

    pub fn set_lease(&self, lease: Duration) {
        self.lock().lease = lease;
    }

    pub fn set_exchange_latency(&self, latency: Duration) {
        self.lock().exchange_latency = latency;
    }

    pub fn set_read_latency(&self, latency: Duration) {
        self.lock().read_latency = latency;
    }

    pub fn set_write_latency(&self, latency: Duration) {
        self.lock().write_latency = latency;
    }

    // ---------------------------------------------------------------------
    // Fixtures
    // ---------------------------------------------------------------------

    pub fn from_fixture(fixture: CloudFixture) -> CrossvaultResult<Self> {
        let mut state = CloudState::default();

        for (domain_id, domain_fixture) in fixture.domains {
            let domain = state.domains.entry(domain_id.clone()).or_default();
            for (path, secret) in domain_fixture.secrets {
                let versions = secret
                    .versions
                    .iter()
                    .map(|encoded| SecretValue::from_base64(encoded))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| {
                        CrossvaultError::validation_field(
                            format!("secret value is not valid base64: {}", e),
                            format!("domains.{}.secrets.{}", domain_id, path),
                        )
                    })?;
                domain.secrets.insert(
                    path,
                    StoredSecret { versions, key_ref: secret.key_ref, tags: secret.tags },
                );
            }
            for (key_ref, policy) in domain_fixture.keys {
                domain.key_policies.insert(key_ref, policy.canonical());
            }
        }

        for trust in fixture.trust {
            state.domains.entry(trust.domain.clone()).or_default();
            state.trust.insert((trust.domain, trust.role));
        }

        Ok(Self { state: Mutex::new(state) })
    }

    pub fn to_fixture(&self) -> CloudFixture {
        let state = self.lock();
        let domains = state
            .domains
            .iter()
            .map(|(id, domain)| {
                let secrets = domain
                    .secrets
                    .iter()
                    .map(|(path, secret)| {
                        let versions = secret.versions.iter().map(SecretValue::to_base64).collect();
                        let fixture = SecretFixture {
                            versions,
                            key_ref: secret.key_ref.clone(),
                            tags: secret.tags.clone(),
                        };
                        (path.clone(), fixture)
                    })
                    .collect();
                (id.clone(), DomainFixture { secrets, keys: domain.key_policies.clone() })
            })
            .collect();
        let trust = state
            .trust
            .iter()
            .map(|(domain, role)| TrustFixture { domain: domain.clone(), role: role.clone() })
            .collect();

        CloudFixture { domains, trust }
    }

    /// Load a fixture file. `.json` files are parsed as JSON, anything else as YAML.
    pub fn load_fixture(path: &Path) -> CrossvaultResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| CrossvaultError::io(e, format!("reading fixture {}", path.display())))?;
        let fixture: CloudFixture = if is_json(path) {
            serde_json::from_str(&contents)?
        } else {
            serde_yaml::from_str(&contents).map_err(|e| {
                CrossvaultError::config_with_source(
                    format!("invalid fixture {}", path.display()),
                    Box::new(e),
                )
            })?
        };
        Self::from_fixture(fixture)
    }

    pub fn save_fixture(&self, path: &Path) -> CrossvaultResult<()> {
        let fixture = self.to_fixture();
        let contents = if is_json(path) {
            serde_json::to_string_pretty(&fixture)?
        } else {
            serde_yaml::to_string(&fixture).map_err(|e| {
                CrossvaultError::internal(format!("fixture serialization failed: {}", e))
            })?
        };
        std::fs::write(path, contents)
            .map_err(|e| CrossvaultError::io(e, format!("writing fixture {}", path.display())))
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("json")
}

#[async_trait]
impl SecretStore for InMemoryCloud {
    async fn describe_secret(
        &self,
        credential: &ScopedCredential,
        path: &SecretPath,
    ) -> Result<SecretDescription> {
        self.pause(|s| s.read_latency).await;
        let mut state = self.lock();
        state.check_throttle(CloudOperation::DescribeSecret)?;

        let description = {
            let domain = state.domain_for(credential)?;
            if domain.denied_reads.contains(path) {
                return Err(ReplicationError::access_denied(path.as_str(), "read not permitted"));
            }
            let secret = domain.secrets.get(path).ok_or_else(|| {
                ReplicationError::not_found(format!("{}:{}", credential.domain, path))
            })?;
            SecretDescription {
                path: path.clone(),
                version: secret.current_version(),
                key_ref: secret.key_ref.clone(),
                tags: secret.tags.clone(),
            }
        };

        state.fire_scheduled(CloudOperation::DescribeSecret, &credential.domain, path);
        Ok(description)
    }

    async fn get_secret_value(
        &self,
        credential: &ScopedCredential,
        path: &SecretPath,
    ) -> Result<SecretPayload> {
        self.pause(|s| s.read_latency).await;
        let mut state = self.lock();
        state.check_throttle(CloudOperation::GetSecretValue)?;

        let payload = {
            let domain = state.domain_for(credential)?;
            if domain.denied_reads.contains(path) {
                return Err(ReplicationError::access_denied(path.as_str(), "read not permitted"));
            }
            let secret = domain.secrets.get(path).ok_or_else(|| {
                ReplicationError::not_found(format!("{}:{}", credential.domain, path))
            })?;
            SecretPayload { version: secret.current_version(), value: secret.current_value() }
        };

        state.fire_scheduled(CloudOperation::GetSecretValue, &credential.domain, path);
        Ok(payload)
    }

    async fn create_secret(
        &self,
        credential: &ScopedCredential,
        secret: NewSecret,
    ) -> Result<SecretVersion> {
        self.pause(|s| s.write_latency).await;
        let mut state = self.lock();
        state.check_throttle(CloudOperation::CreateSecret)?;

        let version = {
            let domain = state.writable_domain_for(credential)?;
            if !domain.key_policies.contains_key(&secret.key_ref) {
                return Err(ReplicationError::not_found(format!(
                    "key {}:{}",
                    credential.domain, secret.key_ref
                )));
            }
            if domain.secrets.contains_key(&secret.path) {
                return Err(ReplicationError::write_error(
                    secret.path.as_str(),
                    "secret already exists",
                    false,
                ));
            }
            let stored = StoredSecret {
                versions: vec![secret.value],
                key_ref: secret.key_ref,
                tags: secret.tags,
            };
            let version = stored.current_version();
            domain.secrets.insert(secret.path, stored);
            version
        };

        state.writes.push((credential.domain.clone(), WriteKind::CreateSecret));
        Ok(version)
    }

    async fn put_secret_value(
        &self,
        credential: &ScopedCredential,
        path: &SecretPath,
        value: &SecretValue,
    ) -> Result<SecretVersion> {
        self.pause(|s| s.write_latency).await;
        let mut state = self.lock();
        state.check_throttle(CloudOperation::PutSecretValue)?;

        let version = {
            let domain = state.writable_domain_for(credential)?;
            let secret = domain.secrets.get_mut(path).ok_or_else(|| {
                ReplicationError::not_found(format!("{}:{}", credential.domain, path))
            })?;
            secret.versions.push(value.clone());
            secret.current_version()
        };

        state.writes.push((credential.domain.clone(), WriteKind::PutSecretValue));
        Ok(version)
    }
}

#[async_trait]
impl KeyManagement for InMemoryCloud {
    async fn get_key_policy(
        &self,
        credential: &ScopedCredential,
        key_ref: &KeyRef,
    ) -> Result<PolicyDocument> {
        self.pause(|s| s.read_latency).await;
        let mut state = self.lock();
        state.check_throttle(CloudOperation::GetKeyPolicy)?;

        state.domain_for(credential)?.key_policies.get(key_ref).cloned().ok_or_else(|| {
            ReplicationError::not_found(format!("key {}:{}", credential.domain, key_ref))
        })
    }

    async fn put_key_policy(
        &self,
        credential: &ScopedCredential,
        key_ref: &KeyRef,
        document: &PolicyDocument,
    ) -> Result<()> {
        self.pause(|s| s.write_latency).await;
        let mut state = self.lock();
        state.check_throttle(CloudOperation::PutKeyPolicy)?;

        {
            let domain = state.writable_domain_for(credential)?;
            let policy = domain.key_policies.get_mut(key_ref).ok_or_else(|| {
                ReplicationError::not_found(format!("key {}:{}", credential.domain, key_ref))
            })?;
            *policy = document.canonical();
        }

        state.writes.push((credential.domain.clone(), WriteKind::PutKeyPolicy));
        Ok(())
    }
}

#[async_trait]
impl TrustExchange for InMemoryCloud {
    async fn assume_identity(
        &self,
        domain: &DomainId,
        role: &str,
        session_tag: &str,
    ) -> Result<IssuedCredential> {
        self.pause(|s| s.exchange_latency).await;
        let mut state = self.lock();
        state.exchanges += 1;
        state.check_throttle(CloudOperation::AssumeIdentity)?;

        if let Some(remaining) = state.transient_denials.get_mut(domain) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ReplicationError::trust_denied(
                    domain.as_str(),
                    "trust exchange temporarily unavailable",
                    false,
                ));
            }
        }

        if !state.trust.contains(&(domain.clone(), role.to_string())) {
            return Err(ReplicationError::trust_denied(
                domain.as_str(),
                format!("no trust relationship allows assuming role '{}'", role),
                true,
            ));
        }

        let token = format!("{}:{}:{}:{}", domain, role, session_tag, state.exchanges);
        Ok(IssuedCredential { token: SecretValue::from(token), lease: state.lease })
    }
}

/// Serializable snapshot of an [`InMemoryCloud`]. Secret versions are base64.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudFixture {
    #[serde(default)]
    pub domains: BTreeMap<DomainId, DomainFixture>,
    #[serde(default)]
    pub trust: Vec<TrustFixture>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainFixture {
    #[serde(default)]
    pub secrets: BTreeMap<SecretPath, SecretFixture>,
    #[serde(default)]
    pub keys: BTreeMap<KeyRef, PolicyDocument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretFixture {
    pub versions: Vec<String>,
    pub key_ref: KeyRef,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustFixture {
    pub domain: DomainId,
    pub role: String,
}
