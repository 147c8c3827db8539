//! In-memory state store for dry runs and tests.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::state_store::ReplicationStateStore;
use crate::domain::{ReplicationRecord, TargetKey};
use crate::errors::Result;

#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    records: RwLock<BTreeMap<TargetKey, ReplicationRecord>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store with existing records.
    pub fn with_records(records: impl IntoIterator<Item = ReplicationRecord>) -> Self {
        Self {
            records: RwLock::new(records.into_iter().map(|r| (r.target_key.clone(), r)).collect()),
        }
    }
}

#[async_trait]
impl ReplicationStateStore for InMemoryStateStore {
    async fn get(&self, key: &TargetKey) -> Result<Option<ReplicationRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn upsert(&self, record: &ReplicationRecord) -> Result<()> {
        self.records.write().await.insert(record.target_key.clone(), record.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ReplicationRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn decommission(&self, key: &TargetKey) -> Result<bool> {
        Ok(self.records.write().await.remove(key).is_some())
    }
}
