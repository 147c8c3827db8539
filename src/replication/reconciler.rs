//! Reconciler: drives one replication target through a pass.
//!
//! ```text
//! Pending -> Reading -> Planning -> Applying -> Synced
//!               ^                                 (Planned in dry-run)
//!               |
//!           Retrying <- Failed(kind)   (from any non-terminal state)
//! ```
//!
//! Destination writes happen in a fixed order: key policy patch, then the
//! secret value, then the replication record. The source version is checked
//! again right before the value is written; a change fails the pass with
//! `Inconsistent` and leaves the record's destination version untouched.
//!
//! A pass holds the per-target lease from its first read to its record write.
//! The pass deadline covers lease acquisition and every attempt; an expired
//! deadline abandons the pass without writing the record. Policy patches that
//! were already applied are not rolled back.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

use super::backoff::RetryPolicy;
use super::broker::CredentialBroker;
use super::drift::{DriftComparator, GrantRemovalPolicy, PolicyPatch, ValueDrift};
use super::error::{FailureKind, ReplicationError, Result};
use super::lease::{KeyLeases, LeaseMode};
use super::planner::{PolicyPlanner, DEFAULT_CONSUMER_TAG_KEY};
use super::reader::SecretReader;
use crate::domain::{
    replica_scope, RecordStatus, ReplicationRecord, ReplicationTarget, Secret, SecretVersion,
    TargetKey,
};
use crate::observability::MetricsRecorder;
use crate::secrets::{CloudClients, CredentialPurpose, NewSecret, ScopedCredential};
use crate::storage::ReplicationStateStore;

/// Tag set on replicas pointing back at their source secret.
pub const REPLICA_SOURCE_TAG: &str = "crossvault:source";

const STATE_STORE_RESOURCE: &str = "replication state store";

/// Position of a target in the pass state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum ReconcileState {
    Pending,
    Reading,
    Planning,
    Applying,
    Synced,
    /// Terminal state of a dry-run pass.
    Planned,
    Retrying,
    Failed(FailureKind),
}

impl ReconcileState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Synced | Self::Planned | Self::Failed(_))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Synced | Self::Planned)
    }

    /// Metric label for a terminal state.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Reading => "reading",
            Self::Planning => "planning",
            Self::Applying => "applying",
            Self::Synced => "synced",
            Self::Planned => "planned",
            Self::Retrying => "retrying",
            Self::Failed(kind) => kind.as_str(),
        }
    }
}

impl fmt::Display for ReconcileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(kind) => write!(f, "Failed({})", kind),
            Self::Pending => f.write_str("Pending"),
            Self::Reading => f.write_str("Reading"),
            Self::Planning => f.write_str("Planning"),
            Self::Applying => f.write_str("Applying"),
            Self::Synced => f.write_str("Synced"),
            Self::Planned => f.write_str("Planned"),
            Self::Retrying => f.write_str("Retrying"),
        }
    }
}

/// Destination writes issued by one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteSummary {
    pub policy_writes: u32,
    pub value_writes: u32,
}

impl WriteSummary {
    pub fn total(&self) -> u32 {
        self.policy_writes + self.value_writes
    }
}

/// Everything a caller can observe about a finished pass.
#[derive(Debug, Clone)]
pub struct PassOutcome {
    pub target_key: TargetKey,
    pub state: ReconcileState,
    /// Every state entered, in order.
    pub trail: Vec<ReconcileState>,
    pub attempts: u32,
    pub writes: WriteSummary,
    /// Policy patch computed by the last attempt that reached Planning.
    pub patch: Option<PolicyPatch>,
    pub value_drift: Option<ValueDrift>,
    pub error: Option<ReplicationError>,
    pub source_version: Option<SecretVersion>,
    pub dest_version: Option<SecretVersion>,
}

impl PassOutcome {
    pub fn is_success(&self) -> bool {
        self.state.is_success()
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self.state {
            ReconcileState::Failed(kind) => Some(kind),
            _ => None,
        }
    }
}

/// Outcomes of a batch, ordered by target key.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub outcomes: Vec<PassOutcome>,
}

impl ReconcileReport {
    /// True when every target ended `Synced` (or `Planned` in dry-run).
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(PassOutcome::is_success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &PassOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    /// Number of outcomes per terminal state label.
    pub fn counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for outcome in &self.outcomes {
            *counts.entry(outcome.state.label()).or_insert(0) += 1;
        }
        counts
    }

    pub fn total_writes(&self) -> u32 {
        self.outcomes.iter().map(|o| o.writes.total()).sum()
    }
}

/// Runtime knobs of the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub retry: RetryPolicy,
    pub pass_deadline: Duration,
    pub lease_mode: LeaseMode,
    pub dry_run: bool,
    pub max_concurrency: usize,
    pub consumer_tag_key: String,
    pub removal_policy: GrantRemovalPolicy,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            pass_deadline: Duration::from_secs(120),
            lease_mode: LeaseMode::default(),
            dry_run: false,
            max_concurrency: 8,
            consumer_tag_key: DEFAULT_CONSUMER_TAG_KEY.to_string(),
            removal_policy: GrantRemovalPolicy::default(),
        }
    }
}

/// Mutable bookkeeping for one pass, shared by its attempts.
struct PassProgress {
    trail: Vec<ReconcileState>,
    attempts: u32,
    writes: WriteSummary,
    patch: Option<PolicyPatch>,
    value_drift: Option<ValueDrift>,
    source_version: Option<SecretVersion>,
    dest_version: Option<SecretVersion>,
}

impl PassProgress {
    fn new() -> Self {
        Self {
            trail: vec![ReconcileState::Pending],
            attempts: 0,
            writes: WriteSummary::default(),
            patch: None,
            value_drift: None,
            source_version: None,
            dest_version: None,
        }
    }

    fn enter(&mut self, state: ReconcileState) {
        debug!(state = %state, "Entering state");
        if self.trail.last() != Some(&state) {
            self.trail.push(state);
        }
    }
}

/// What a successful attempt established.
struct Applied {
    source_version: SecretVersion,
    dest_version: Option<SecretVersion>,
    policy_hash: String,
}

pub struct Reconciler {
    clients: CloudClients,
    broker: Arc<CredentialBroker>,
    reader: SecretReader,
    planner: PolicyPlanner,
    comparator: DriftComparator,
    state: Arc<dyn ReplicationStateStore>,
    leases: KeyLeases,
    settings: ReconcilerSettings,
    metrics: MetricsRecorder,
}

impl Reconciler {
    pub fn new(
        clients: CloudClients,
        broker: Arc<CredentialBroker>,
        state: Arc<dyn ReplicationStateStore>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            reader: SecretReader::new(clients.store.clone()),
            planner: PolicyPlanner::new(settings.consumer_tag_key.clone()),
            comparator: DriftComparator::new(
                settings.removal_policy,
                settings.consumer_tag_key.clone(),
            ),
            clients,
            broker,
            state,
            leases: KeyLeases::new(),
            settings,
            metrics: MetricsRecorder::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsRecorder) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }

    /// Reconcile every target, at most `max_concurrency` at a time. A failing
    /// target never affects the others.
    pub async fn reconcile_all(&self, targets: &[ReplicationTarget]) -> ReconcileReport {
        let concurrency = self.settings.max_concurrency.max(1);

        let mut outcomes: Vec<PassOutcome> = stream::iter(targets)
            .map(|target| self.reconcile(target))
            .buffer_unordered(concurrency)
            .collect()
            .await;
        outcomes.sort_by(|a, b| a.target_key.cmp(&b.target_key));

        ReconcileReport { outcomes }
    }

    /// Run one pass for `target`.
    pub async fn reconcile(&self, target: &ReplicationTarget) -> PassOutcome {
        let key = target.key();
        let span = crate::pass_span!(key, dry_run = self.settings.dry_run);
        self.run_pass(target, key).instrument(span).await
    }

    async fn run_pass(&self, target: &ReplicationTarget, key: TargetKey) -> PassOutcome {
        let started = Instant::now();
        let deadline = started + self.settings.pass_deadline;
        let mut progress = PassProgress::new();

        let timed = tokio::time::timeout_at(deadline, async {
            let lease = self.leases.acquire(&key, self.settings.lease_mode).await?;
            let previous = self.state.get(&key).await.map_err(|e| {
                ReplicationError::write_error(STATE_STORE_RESOURCE, e.to_string(), false)
            })?;
            let result = self.run_attempts(target, previous.as_ref(), &mut progress).await;
            Ok::<_, ReplicationError>((lease, previous, result))
        })
        .await;

        let result = match timed {
            Err(_elapsed) => {
                warn!(
                    deadline_ms = self.settings.pass_deadline.as_millis() as u64,
                    "Pass deadline elapsed; abandoning without recording"
                );
                Err(ReplicationError::timeout(key.to_string(), self.settings.pass_deadline))
            }
            Ok(Err(error)) => Err(error),
            Ok(Ok((lease, previous, result))) => {
                let result = if self.settings.dry_run {
                    result
                } else {
                    self.record_outcome(&key, previous, &progress, result).await
                };
                drop(lease);
                result
            }
        };

        self.finish(key, progress, result, started)
    }

    fn finish(
        &self,
        target_key: TargetKey,
        mut progress: PassProgress,
        result: Result<Applied>,
        started: Instant,
    ) -> PassOutcome {
        let (state, error) = match result {
            Ok(applied) => {
                progress.source_version = Some(applied.source_version);
                progress.dest_version = applied.dest_version;
                let state = if self.settings.dry_run {
                    ReconcileState::Planned
                } else {
                    ReconcileState::Synced
                };
                (state, None)
            }
            Err(error) => (ReconcileState::Failed(error.kind()), Some(error)),
        };
        progress.enter(state);

        let elapsed = started.elapsed();
        self.metrics.record_pass(state.label(), progress.attempts, elapsed.as_secs_f64());

        match &error {
            None => info!(
                state = %state,
                attempts = progress.attempts,
                policy_writes = progress.writes.policy_writes,
                value_writes = progress.writes.value_writes,
                duration_ms = elapsed.as_millis() as u64,
                "Reconciliation pass finished"
            ),
            Some(error) => error!(
                state = %state,
                attempts = progress.attempts,
                error = %error,
                duration_ms = elapsed.as_millis() as u64,
                "Reconciliation pass failed"
            ),
        }

        PassOutcome {
            target_key,
            state,
            trail: progress.trail,
            attempts: progress.attempts,
            writes: progress.writes,
            patch: progress.patch,
            value_drift: progress.value_drift,
            error,
            source_version: progress.source_version,
            dest_version: progress.dest_version,
        }
    }

    async fn run_attempts(
        &self,
        target: &ReplicationTarget,
        previous: Option<&ReplicationRecord>,
        progress: &mut PassProgress,
    ) -> Result<Applied> {
        let retry = self.settings.retry;

        loop {
            progress.attempts += 1;
            let attempt = progress.attempts;

            let error = match self.attempt(target, previous, progress).await {
                Ok(applied) => return Ok(applied),
                Err(error) => error,
            };

            progress.enter(ReconcileState::Failed(error.kind()));
            if !retry.should_retry(attempt, &error) {
                return Err(error);
            }

            let delay = retry.delay_after(attempt, &error);
            warn!(
                attempt,
                max_attempts = retry.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Attempt failed; retrying after backoff"
            );
            self.metrics.record_retry(error.kind().as_str());
            if matches!(error, ReplicationError::TrustExpired { .. }) {
                self.broker.invalidate(&target.source.domain, CredentialPurpose::Read).await;
                self.broker.invalidate(&target.dest_domain, self.dest_purpose()).await;
            }
            progress.enter(ReconcileState::Retrying);
            tokio::time::sleep(delay).await;
        }
    }

    /// Dry runs never hold a credential that can write.
    fn dest_purpose(&self) -> CredentialPurpose {
        if self.settings.dry_run {
            CredentialPurpose::Read
        } else {
            CredentialPurpose::Write
        }
    }

    async fn attempt(
        &self,
        target: &ReplicationTarget,
        previous: Option<&ReplicationRecord>,
        progress: &mut PassProgress,
    ) -> Result<Applied> {
        progress.enter(ReconcileState::Reading);
        let source_credential =
            self.broker.acquire(&target.source.domain, CredentialPurpose::Read).await?;
        let secret = self.read_source(target, &source_credential).await?;
        progress.source_version = Some(secret.version.clone());

        progress.enter(ReconcileState::Planning);
        let replica = target.key().destination();
        let desired = self.planner.plan_for_replica(&target.consumer_tags, &replica)?;

        let destination = replica.to_string();
        let key_resource = format!("{}:{}", target.dest_domain, target.dest_key);
        let dest_credential = self
            .broker
            .acquire(&target.dest_domain, self.dest_purpose())
            .await
            .map_err(|e| e.into_write_error(&destination))?;

        let observed_policy = self
            .clients
            .keys
            .get_key_policy(&dest_credential, &target.dest_key)
            .await
            .map_err(|e| e.into_write_error(&key_resource))?;
        observed_policy.validate()?;

        let scope = replica_scope(&target.dest_path);
        let patch = self.comparator.diff_within(&observed_policy, &desired, &scope);
        let merged = DriftComparator::apply(&observed_policy, &patch);
        merged.validate()?;

        let observed_dest = match self
            .clients
            .store
            .describe_secret(&dest_credential, &target.dest_path)
            .await
        {
            Ok(description) => Some(description.version),
            Err(ReplicationError::NotFound { .. }) => None,
            Err(error) => return Err(error.into_write_error(&destination)),
        };

        let value_drift = destination_drift(previous, &secret.version, observed_dest.as_ref());
        debug!(
            grants_to_add = patch.to_add.len(),
            grants_to_remove = patch.to_remove.len(),
            value_drift = ?value_drift,
            "Planned destination changes"
        );
        progress.patch = Some(patch.clone());
        progress.value_drift = Some(value_drift);
        progress.dest_version = observed_dest.clone();

        if self.settings.dry_run {
            return Ok(Applied {
                source_version: secret.version,
                dest_version: observed_dest,
                policy_hash: desired.policy_hash(),
            });
        }

        progress.enter(ReconcileState::Applying);

        if !patch.is_empty() {
            self.clients
                .keys
                .put_key_policy(&dest_credential, &target.dest_key, &merged)
                .await
                .map_err(|e| e.into_write_error(&key_resource))?;
            progress.writes.policy_writes += 1;
            self.metrics.record_destination_write(target.dest_domain.as_str(), "key_policy");
            info!(
                key = %target.dest_key,
                added = patch.to_add.len(),
                removed = patch.to_remove.len(),
                "Applied key policy patch"
            );
        }

        let dest_version = match observed_dest {
            Some(version) if value_drift == ValueDrift::Unchanged => version,
            observed => {
                let current = self
                    .reader
                    .current_version(&target.source.domain, &target.source.path, &source_credential)
                    .await?;
                if current != secret.version {
                    return Err(ReplicationError::inconsistent(
                        target.source.to_string(),
                        secret.version.as_str(),
                        current.as_str(),
                    )
                    .during_apply());
                }

                let version = self
                    .write_value(target, &dest_credential, &secret, observed.is_some())
                    .await
                    .map_err(|e| e.into_write_error(&destination))?;
                progress.writes.value_writes += 1;
                version
            }
        };
        progress.dest_version = Some(dest_version.clone());

        Ok(Applied {
            source_version: secret.version,
            dest_version: Some(dest_version),
            policy_hash: desired.policy_hash(),
        })
    }

    /// Read the source, re-reading once if metadata and value disagreed.
    async fn read_source(
        &self,
        target: &ReplicationTarget,
        credential: &ScopedCredential,
    ) -> Result<Secret> {
        let source = &target.source;
        match self.reader.read(&source.domain, &source.path, credential).await {
            Err(ReplicationError::Inconsistent { expected, observed, .. }) => {
                debug!(%expected, %observed, "Source changed during read; reading again");
                self.reader.read(&source.domain, &source.path, credential).await
            }
            other => other,
        }
    }

    async fn write_value(
        &self,
        target: &ReplicationTarget,
        credential: &ScopedCredential,
        secret: &Secret,
        exists: bool,
    ) -> Result<SecretVersion> {
        let store = &self.clients.store;
        let (version, kind) = if exists {
            let version =
                store.put_secret_value(credential, &target.dest_path, &secret.value).await?;
            (version, "put_secret_value")
        } else {
            let mut tags = secret.tags.clone();
            tags.insert(REPLICA_SOURCE_TAG.to_string(), target.source.to_string());
            let new_secret = NewSecret {
                path: target.dest_path.clone(),
                value: secret.value.clone(),
                key_ref: target.dest_key.clone(),
                tags,
            };
            (store.create_secret(credential, new_secret).await?, "create_secret")
        };

        self.metrics.record_destination_write(target.dest_domain.as_str(), kind);
        info!(
            source_version = %secret.version,
            dest_version = %version,
            operation = kind,
            "Wrote destination secret value"
        );
        Ok(version)
    }

    /// Persist the pass result. A failed record write turns a successful pass
    /// into `WriteError`; the next pass sees the destination version mismatch
    /// and rewrites.
    async fn record_outcome(
        &self,
        key: &TargetKey,
        previous: Option<ReplicationRecord>,
        progress: &PassProgress,
        result: Result<Applied>,
    ) -> Result<Applied> {
        let mut record = previous.unwrap_or_else(|| ReplicationRecord::pending(key.clone()));
        record.last_attempt_at = Utc::now();
        record.attempt_count = record.attempt_count.saturating_add(progress.attempts);

        match &result {
            Ok(applied) => {
                record.status = RecordStatus::Synced;
                record.last_source_version = Some(applied.source_version.clone());
                record.last_dest_version = applied.dest_version.clone();
                record.last_applied_policy_hash = Some(applied.policy_hash.clone());
            }
            Err(error) => record.status = RecordStatus::Failed(error.kind()),
        }

        if let Err(e) = self.state.upsert(&record).await {
            error!(error = %e, "Failed to persist replication record");
            let failure = ReplicationError::write_error(STATE_STORE_RESOURCE, e.to_string(), false);
            return match result {
                Ok(_) => Err(failure),
                Err(original) => Err(original),
            };
        }

        result
    }
}

/// Whether the destination value has to be written this pass.
///
/// The value is rewritten when the destination is missing, when the source
/// moved past the last replicated version, or when the destination version no
/// longer matches what the last pass wrote (edited out of band).
fn destination_drift(
    previous: Option<&ReplicationRecord>,
    source_version: &SecretVersion,
    observed_dest: Option<&SecretVersion>,
) -> ValueDrift {
    let Some(observed_dest) = observed_dest else {
        return ValueDrift::NeedsUpdate;
    };

    let replicated = previous.and_then(|r| r.last_source_version.as_ref());
    if DriftComparator::diff_value(replicated, source_version) == ValueDrift::NeedsUpdate {
        return ValueDrift::NeedsUpdate;
    }

    let recorded_dest = previous.and_then(|r| r.last_dest_version.as_ref());
    if recorded_dest != Some(observed_dest) {
        warn!(
            recorded = ?recorded_dest.map(SecretVersion::as_str),
            observed = %observed_dest,
            "Destination secret changed outside of replication"
        );
        return ValueDrift::NeedsUpdate;
    }

    ValueDrift::Unchanged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        DomainId, Grant, GrantCondition, KeyRef, PolicyDocument, SecretPath, SecretRef,
        ADMIN_ACTION, CONSUMER_ACTIONS,
    };
    use crate::secrets::{CloudOperation, InMemoryCloud, WriteKind};
    use crate::storage::InMemoryStateStore;
    use std::collections::{BTreeSet, HashMap};

    const SOURCE: &str = "source-account";
    const DEST: &str = "dest-account";
    const KEY: &str = "alias/replica";

    struct Harness {
        cloud: Arc<InMemoryCloud>,
        state: Arc<InMemoryStateStore>,
        reconciler: Reconciler,
    }

    fn cloud() -> Arc<InMemoryCloud> {
        let cloud = InMemoryCloud::new();
        cloud.allow_trust(SOURCE, "replicator-read");
        cloud.allow_trust(DEST, "replicator-write");
        cloud.create_key(DEST, KEY);
        cloud.seed_secret(SOURCE, "/vault/creds", "s3cr3t-v1", "alias/source");
        Arc::new(cloud)
    }

    fn harness_with(cloud: Arc<InMemoryCloud>, settings: ReconcilerSettings) -> Harness {
        let clients = CloudClients::from_backend(cloud.clone());
        let roles = HashMap::from([
            (DomainId::new(SOURCE), "replicator-read".to_string()),
            (DomainId::new(DEST), "replicator-write".to_string()),
        ]);
        let broker =
            Arc::new(CredentialBroker::new(clients.trust.clone(), roles, Duration::from_secs(60)));
        let state = Arc::new(InMemoryStateStore::new());
        let reconciler = Reconciler::new(clients, broker, state.clone(), settings);
        Harness { cloud, state, reconciler }
    }

    fn harness() -> Harness {
        harness_with(cloud(), ReconcilerSettings::default())
    }

    fn target(consumers: &[&str]) -> ReplicationTarget {
        ReplicationTarget {
            source: SecretRef::new(SOURCE, "/vault/creds"),
            dest_domain: DomainId::new(DEST),
            dest_path: SecretPath::new("/replica/creds"),
            dest_key: KeyRef::new(KEY),
            consumer_tags: consumers.iter().map(|c| c.to_string()).collect::<BTreeSet<_>>(),
        }
    }

    fn dest() -> DomainId {
        DomainId::new(DEST)
    }

    fn dest_path() -> SecretPath {
        SecretPath::new("/replica/creds")
    }

    #[tokio::test]
    async fn test_first_pass_replicates_value_and_policy() {
        let h = harness();
        let target = target(&["svc-a"]);

        let outcome = h.reconciler.reconcile(&target).await;

        assert_eq!(outcome.state, ReconcileState::Synced);
        assert_eq!(
            outcome.trail,
            vec![
                ReconcileState::Pending,
                ReconcileState::Reading,
                ReconcileState::Planning,
                ReconcileState::Applying,
                ReconcileState::Synced,
            ]
        );
        assert_eq!(outcome.writes, WriteSummary { policy_writes: 1, value_writes: 1 });
        assert_eq!(
            h.cloud.secret_value(&dest(), &dest_path()).unwrap().expose_bytes(),
            b"s3cr3t-v1"
        );

        let tags = h.cloud.secret_tags(&dest(), &dest_path()).unwrap();
        assert_eq!(
            tags.get(REPLICA_SOURCE_TAG).map(String::as_str),
            Some("source-account:/vault/creds")
        );

        let policy = h.cloud.key_policy(&dest(), &KeyRef::new(KEY)).unwrap();
        assert_eq!(policy.len(), 2);

        let record = h.state.get(&target.key()).await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Synced);
        assert_eq!(record.last_source_version, Some(SecretVersion::new("v1")));
        assert_eq!(record.last_dest_version, Some(SecretVersion::new("v1")));
        assert_eq!(record.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_rerun_on_synced_target_writes_nothing() {
        let h = harness();
        let target = target(&["svc-a"]);
        h.reconciler.reconcile(&target).await;
        h.cloud.reset_counters();

        let outcome = h.reconciler.reconcile(&target).await;

        assert_eq!(outcome.state, ReconcileState::Synced);
        assert_eq!(outcome.writes.total(), 0);
        assert_eq!(outcome.value_drift, Some(ValueDrift::Unchanged));
        assert!(outcome.patch.unwrap().is_empty());
        assert_eq!(h.cloud.write_count(&dest()), 0);
    }

    #[tokio::test]
    async fn test_new_source_version_updates_value_only() {
        let h = harness();
        let target = target(&["svc-a"]);
        h.reconciler.reconcile(&target).await;
        h.cloud.reset_counters();

        h.cloud.seed_secret(SOURCE, "/vault/creds", "s3cr3t-v2", "alias/source");
        let outcome = h.reconciler.reconcile(&target).await;

        assert_eq!(outcome.state, ReconcileState::Synced);
        assert!(outcome.patch.unwrap().is_empty());
        assert_eq!(h.cloud.write_count(&dest()), 1);
        assert_eq!(h.cloud.writes_of_kind(&dest(), WriteKind::PutSecretValue), 1);
        assert_eq!(
            h.cloud.secret_value(&dest(), &dest_path()).unwrap().expose_bytes(),
            b"s3cr3t-v2"
        );
    }

    #[tokio::test]
    async fn test_added_consumer_adds_one_grant() {
        let h = harness();
        h.reconciler.reconcile(&target(&["svc-a"])).await;

        let outcome = h.reconciler.reconcile(&target(&["svc-a", "svc-b"])).await;

        let patch = outcome.patch.unwrap();
        assert_eq!(patch.to_add.len(), 1);
        assert!(patch.to_remove.is_empty());
        assert_eq!(outcome.writes, WriteSummary { policy_writes: 1, value_writes: 0 });
    }

    #[tokio::test]
    async fn test_source_change_before_apply_is_inconsistent() {
        let h = harness();
        let target = target(&["svc-a"]);
        h.reconciler.reconcile(&target).await;

        h.cloud.seed_secret(SOURCE, "/vault/creds", "s3cr3t-v2", "alias/source");
        h.cloud.schedule_write_after(
            CloudOperation::GetSecretValue,
            SOURCE,
            "/vault/creds",
            "s3cr3t-v3",
        );
        let outcome = h.reconciler.reconcile(&target).await;

        assert_eq!(outcome.state, ReconcileState::Failed(FailureKind::Inconsistent));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.writes.value_writes, 0);

        let record = h.state.get(&target.key()).await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Failed(FailureKind::Inconsistent));
        assert_eq!(record.last_dest_version, Some(SecretVersion::new("v1")));
        assert_eq!(record.last_source_version, Some(SecretVersion::new("v1")));
    }

    #[tokio::test]
    async fn test_dry_run_plans_without_writing() {
        let settings = ReconcilerSettings { dry_run: true, ..Default::default() };
        let h = harness_with(cloud(), settings);
        let target = target(&["svc-a"]);

        let outcome = h.reconciler.reconcile(&target).await;

        assert_eq!(outcome.state, ReconcileState::Planned);
        assert_eq!(outcome.value_drift, Some(ValueDrift::NeedsUpdate));
        assert_eq!(outcome.patch.unwrap().to_add.len(), 1);
        assert_eq!(h.cloud.write_count(&dest()), 0);
        assert!(h.state.get(&target.key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_source_fails_without_retry() {
        let h = harness();
        let mut target = target(&["svc-a"]);
        target.source = SecretRef::new(SOURCE, "/vault/missing");

        let outcome = h.reconciler.reconcile(&target).await;

        assert_eq!(outcome.state, ReconcileState::Failed(FailureKind::NotFound));
        assert_eq!(outcome.attempts, 1);
        let record = h.state.get(&target.key()).await.unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Failed(FailureKind::NotFound));
        assert!(record.last_dest_version.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_write_is_retried() {
        let h = harness();
        h.cloud.throttle(CloudOperation::CreateSecret, 2);

        let outcome = h.reconciler.reconcile(&target(&["svc-a"])).await;

        assert_eq!(outcome.state, ReconcileState::Synced);
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.trail.contains(&ReconcileState::Retrying));
        assert!(outcome.trail.contains(&ReconcileState::Failed(FailureKind::WriteError)));
        // The policy patch landed on the first attempt and is not repeated.
        assert_eq!(h.cloud.writes_of_kind(&dest(), WriteKind::PutKeyPolicy), 1);
        assert_eq!(h.cloud.writes_of_kind(&dest(), WriteKind::CreateSecret), 1);
    }

    #[tokio::test]
    async fn test_denied_destination_write_is_not_retried() {
        let h = harness();
        h.cloud.deny_writes(DEST);

        let outcome = h.reconciler.reconcile(&target(&["svc-a"])).await;

        assert_eq!(outcome.state, ReconcileState::Failed(FailureKind::WriteError));
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_permanent_trust_denial_is_surfaced() {
        let h = harness();
        h.cloud.revoke_trust(SOURCE, "replicator-read");

        let outcome = h.reconciler.reconcile(&target(&["svc-a"])).await;

        assert_eq!(outcome.state, ReconcileState::Failed(FailureKind::TrustDenied));
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_credential_expiring_mid_read_is_renewed() {
        let h = harness();
        h.cloud.set_lease(Duration::from_millis(100));
        h.cloud.set_read_latency(Duration::from_millis(150));

        let cloud = h.cloud.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cloud.set_read_latency(Duration::ZERO);
        });

        let outcome = h.reconciler.reconcile(&target(&["svc-a"])).await;

        assert_eq!(outcome.state, ReconcileState::Synced);
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.trail.contains(&ReconcileState::Failed(FailureKind::TrustExpired)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry_leaves_no_record() {
        let settings =
            ReconcilerSettings { pass_deadline: Duration::from_secs(1), ..Default::default() };
        let h = harness_with(cloud(), settings);
        h.cloud.set_read_latency(Duration::from_secs(10));
        let target = target(&["svc-a"]);

        let outcome = h.reconciler.reconcile(&target).await;

        assert_eq!(outcome.state, ReconcileState::Failed(FailureKind::Timeout));
        assert!(h.state.get(&target.key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fail_fast_when_lease_is_held() {
        let settings = ReconcilerSettings { lease_mode: LeaseMode::FailFast, ..Default::default() };
        let h = harness_with(cloud(), settings);
        let target = target(&["svc-a"]);
        let _held = h.reconciler.leases.acquire(&target.key(), LeaseMode::Block).await.unwrap();

        let outcome = h.reconciler.reconcile(&target).await;

        assert_eq!(outcome.state, ReconcileState::Failed(FailureKind::AlreadyInProgress));
        assert_eq!(outcome.attempts, 0);
        assert!(h.state.get(&target.key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_out_of_band_destination_edit_is_overwritten() {
        let h = harness();
        let target = target(&["svc-a"]);
        h.reconciler.reconcile(&target).await;
        h.cloud.seed_secret(DEST, "/replica/creds", "tampered", KEY);
        h.cloud.reset_counters();

        let outcome = h.reconciler.reconcile(&target).await;

        assert_eq!(outcome.state, ReconcileState::Synced);
        assert_eq!(outcome.writes.value_writes, 1);
        assert_eq!(
            h.cloud.secret_value(&dest(), &dest_path()).unwrap().expose_bytes(),
            b"s3cr3t-v1"
        );
    }

    fn replica_grant(tag: &str, actions: &[&str]) -> Grant {
        Grant::new("domain/dest-account:*", actions.iter().copied(), replica_scope(&dest_path()))
            .with_condition(GrantCondition::new("consumer", [tag]))
    }

    #[tokio::test]
    async fn test_narrowed_consumer_grant_is_restored_under_retain() {
        let settings =
            ReconcilerSettings { removal_policy: GrantRemovalPolicy::Retain, ..Default::default() };
        let h = harness_with(cloud(), settings);
        h.cloud.set_key_policy(
            DEST,
            KEY,
            PolicyDocument::from_grants([
                Grant::admin_root(&dest()),
                replica_grant("svc-a", &["key:Decrypt"]),
            ]),
        );

        let outcome = h.reconciler.reconcile(&target(&["svc-a"])).await;

        assert_eq!(outcome.state, ReconcileState::Synced);
        let policy = h.cloud.key_policy(&dest(), &KeyRef::new(KEY)).unwrap();
        assert!(policy.validate().is_ok());
        assert_eq!(policy.len(), 2);
        assert!(policy.contains(&replica_grant("svc-a", &CONSUMER_ACTIONS)));
    }

    #[tokio::test]
    async fn test_widened_admin_root_grant_is_kept() {
        let h = harness();
        let root = Grant::new("domain/dest-account:root", [ADMIN_ACTION, "key:TagResource"], "*");
        h.cloud.set_key_policy(DEST, KEY, PolicyDocument::from_grants([root.clone()]));

        let outcome = h.reconciler.reconcile(&target(&["svc-a"])).await;

        assert_eq!(outcome.state, ReconcileState::Synced);
        let policy = h.cloud.key_policy(&dest(), &KeyRef::new(KEY)).unwrap();
        assert!(policy.validate().is_ok());
        assert_eq!(policy.len(), 2);
        assert!(policy.contains(&root));
    }

    #[tokio::test]
    async fn test_conflicting_observed_policy_is_not_written() {
        let h = harness();
        h.cloud.set_key_policy(
            DEST,
            KEY,
            PolicyDocument::from_grants([
                Grant::admin_root(&dest()),
                replica_grant("svc-a", &["key:Decrypt"]),
                replica_grant("svc-a", &["key:Encrypt"]),
            ]),
        );

        let outcome = h.reconciler.reconcile(&target(&["svc-a"])).await;

        assert_eq!(outcome.state, ReconcileState::Failed(FailureKind::InvariantViolation));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(h.cloud.writes_of_kind(&dest(), WriteKind::PutKeyPolicy), 0);
    }

    #[tokio::test]
    async fn test_replicas_sharing_a_key_keep_each_others_grants() {
        let h = harness();
        let first = target(&["svc-a"]);
        let mut second = target(&["svc-b"]);
        second.dest_path = SecretPath::new("/replica/other");

        h.reconciler.reconcile(&first).await;
        h.reconciler.reconcile(&second).await;
        h.cloud.reset_counters();

        let outcome = h.reconciler.reconcile(&first).await;

        assert_eq!(outcome.state, ReconcileState::Synced);
        assert!(outcome.patch.unwrap().is_empty());
        let policy = h.cloud.key_policy(&dest(), &KeyRef::new(KEY)).unwrap();
        assert_eq!(policy.len(), 3);
        assert_eq!(h.cloud.writes_of_kind(&dest(), WriteKind::PutKeyPolicy), 0);
    }

    #[tokio::test]
    async fn test_reconcile_all_isolates_failures() {
        let h = harness();
        let good = target(&["svc-a"]);
        let mut bad = target(&["svc-a"]);
        bad.source = SecretRef::new(SOURCE, "/vault/missing");
        bad.dest_path = SecretPath::new("/replica/missing");

        let report = h.reconciler.reconcile_all(&[good.clone(), bad.clone()]).await;

        assert_eq!(report.outcomes.len(), 2);
        assert!(!report.all_succeeded());
        assert_eq!(report.failed().count(), 1);
        assert_eq!(report.failed().next().unwrap().target_key, bad.key());
        assert_eq!(report.counts().get("synced"), Some(&1));
    }
}
