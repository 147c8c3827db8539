//! Per-target leases: at most one pass per target key runs at a time.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::error::{ReplicationError, Result};
use crate::domain::TargetKey;

/// What a pass does when another pass already holds its target's lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseMode {
    /// Wait for the running pass, then proceed.
    #[default]
    Block,
    /// Give up immediately with `AlreadyInProgress`.
    FailFast,
}

/// Held for the duration of a pass; dropping it releases the target.
pub type TargetLease = OwnedMutexGuard<()>;

/// Lease table keyed by target. Entries are created on first use and kept.
#[derive(Debug, Default)]
pub struct KeyLeases {
    locks: DashMap<TargetKey, Arc<Mutex<()>>>,
}

impl KeyLeases {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &TargetKey, mode: LeaseMode) -> Result<TargetLease> {
        let lock = self.locks.entry(key.clone()).or_default().clone();

        match mode {
            LeaseMode::Block => Ok(lock.lock_owned().await),
            LeaseMode::FailFast => lock
                .try_lock_owned()
                .map_err(|_| ReplicationError::already_in_progress(key.to_string())),
        }
    }

    /// Whether a pass currently holds the lease for `key`.
    pub fn is_held(&self, key: &TargetKey) -> bool {
        self.locks.get(key).map(|lock| lock.try_lock().is_err()).unwrap_or(false)
    }
}
