//! Persistent per-target replication records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::id::SecretVersion;
use super::secret::TargetKey;
use crate::replication::error::FailureKind;

/// Outcome of the most recent pass as persisted in the state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum RecordStatus {
    Pending,
    Synced,
    Failed(FailureKind),
}

impl RecordStatus {
    /// Database representation, e.g. `synced` or `failed:throttled`.
    pub fn to_db_string(&self) -> String {
        match self {
            RecordStatus::Pending => "pending".to_string(),
            RecordStatus::Synced => "synced".to_string(),
            RecordStatus::Failed(kind) => format!("failed:{}", kind.as_str()),
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordStatus::Pending => write!(f, "Pending"),
            RecordStatus::Synced => write!(f, "Synced"),
            RecordStatus::Failed(kind) => write!(f, "Failed({})", kind),
        }
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecordStatus::Pending),
            "synced" => Ok(RecordStatus::Synced),
            other => match other.strip_prefix("failed:") {
                Some(kind) => kind.parse().map(RecordStatus::Failed),
                None => Err(format!("Unknown record status: {}", other)),
            },
        }
    }
}

/// What the engine last knows it achieved for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationRecord {
    pub target_key: TargetKey,
    pub last_source_version: Option<SecretVersion>,
    pub last_dest_version: Option<SecretVersion>,
    pub last_applied_policy_hash: Option<String>,
    pub status: RecordStatus,
    pub last_attempt_at: DateTime<Utc>,
    pub attempt_count: u32,
}

impl ReplicationRecord {
    /// Fresh record for a target that has never been attempted.
    pub fn pending(target_key: TargetKey) -> Self {
        Self {
            target_key,
            last_source_version: None,
            last_dest_version: None,
            last_applied_policy_hash: None,
            status: RecordStatus::Pending,
            last_attempt_at: Utc::now(),
            attempt_count: 0,
        }
    }

    pub fn is_synced(&self) -> bool {
        self.status == RecordStatus::Synced
    }
}
