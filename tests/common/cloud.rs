//! Seeded in-memory cloud and reconciler harness.

use crossvault::domain::{DomainId, KeyRef, ReplicationTarget, SecretPath, SecretRef};
use crossvault::replication::{CredentialBroker, Reconciler, ReconcilerSettings};
use crossvault::secrets::{CloudClients, InMemoryCloud};
use crossvault::storage::{InMemoryStateStore, ReplicationStateStore};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

pub const SOURCE: &str = "source-account";
pub const DEST: &str = "dest-account";
pub const SOURCE_ROLE: &str = "replicator-read";
pub const DEST_ROLE: &str = "replicator-write";
pub const REPLICA_KEY: &str = "alias/replica";
pub const SOURCE_PATH: &str = "/vault/creds";
pub const DEST_PATH: &str = "/replica/creds";

/// Two domains with trust configured, a replica key in the destination and
/// `/vault/creds` at version v1 in the source.
pub fn seeded_cloud() -> Arc<InMemoryCloud> {
    let cloud = InMemoryCloud::new();
    cloud.allow_trust(SOURCE, SOURCE_ROLE);
    cloud.allow_trust(DEST, DEST_ROLE);
    cloud.create_key(DEST, REPLICA_KEY);
    cloud.seed_secret(SOURCE, SOURCE_PATH, "db-password-v1", "alias/source");
    Arc::new(cloud)
}

pub fn roles() -> HashMap<DomainId, String> {
    HashMap::from([
        (DomainId::new(SOURCE), SOURCE_ROLE.to_string()),
        (DomainId::new(DEST), DEST_ROLE.to_string()),
    ])
}

pub fn target(consumers: &[&str]) -> ReplicationTarget {
    target_at(SOURCE_PATH, DEST_PATH, consumers)
}

pub fn target_at(source_path: &str, dest_path: &str, consumers: &[&str]) -> ReplicationTarget {
    ReplicationTarget {
        source: SecretRef::new(SOURCE, source_path),
        dest_domain: DomainId::new(DEST),
        dest_path: SecretPath::new(dest_path),
        dest_key: KeyRef::new(REPLICA_KEY),
        consumer_tags: consumers.iter().map(|c| c.to_string()).collect::<BTreeSet<_>>(),
    }
}

pub fn dest() -> DomainId {
    DomainId::new(DEST)
}

pub fn dest_path() -> SecretPath {
    SecretPath::new(DEST_PATH)
}

pub fn replica_key() -> KeyRef {
    KeyRef::new(REPLICA_KEY)
}

/// Test settings: fast backoff so retries do not slow the suite down.
pub fn fast_settings() -> ReconcilerSettings {
    let mut settings = ReconcilerSettings::default();
    settings.retry.base_delay = Duration::from_millis(5);
    settings.retry.max_delay = Duration::from_millis(50);
    settings
}

pub struct Harness {
    pub cloud: Arc<InMemoryCloud>,
    pub state: Arc<dyn ReplicationStateStore>,
    pub reconciler: Arc<Reconciler>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(seeded_cloud(), Arc::new(InMemoryStateStore::new()), fast_settings())
    }

    pub fn with_settings(settings: ReconcilerSettings) -> Self {
        Self::with(seeded_cloud(), Arc::new(InMemoryStateStore::new()), settings)
    }

    pub fn with(
        cloud: Arc<InMemoryCloud>,
        state: Arc<dyn ReplicationStateStore>,
        settings: ReconcilerSettings,
    ) -> Self {
        let clients = CloudClients::from_backend(cloud.clone());
        let exchange = clients.trust.clone();
        let broker = Arc::new(CredentialBroker::new(exchange, roles(), Duration::from_secs(60)));
        let reconciler = Arc::new(Reconciler::new(clients, broker, state.clone(), settings));
        Self { cloud, state, reconciler }
    }
}
