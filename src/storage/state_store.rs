//! Replication state store: one record per target key.
//!
//! The store is the only shared mutable state between passes. Record writes
//! are single-statement upserts, so a record is always either the previous
//! one or the new one. The per-key lease held by the reconciler keeps two
//! passes on the same target from interleaving their read-modify-write.

use async_trait::async_trait;
use sqlx::{FromRow, Sqlite};
use tracing::instrument;

use crate::domain::{
    DomainId, RecordStatus, ReplicationRecord, SecretPath, SecretRef, SecretVersion, TargetKey,
};
use crate::errors::{CrossvaultError, Result};
use crate::storage::DbPool;

/// Persistence for [`ReplicationRecord`]s.
#[async_trait]
pub trait ReplicationStateStore: Send + Sync {
    async fn get(&self, key: &TargetKey) -> Result<Option<ReplicationRecord>>;

    /// Insert or replace the record for `record.target_key`.
    async fn upsert(&self, record: &ReplicationRecord) -> Result<()>;

    /// All records, ordered by target key.
    async fn list(&self) -> Result<Vec<ReplicationRecord>>;

    /// Remove a target's record. Returns whether one existed.
    async fn decommission(&self, key: &TargetKey) -> Result<bool>;
}

/// Database row structure for replication records
#[derive(Debug, Clone, FromRow)]
struct ReplicationRecordRow {
    pub source_domain: String,
    pub source_path: String,
    pub dest_domain: String,
    pub dest_path: String,
    pub last_source_version: Option<String>,
    pub last_dest_version: Option<String>,
    pub last_applied_policy_hash: Option<String>,
    pub status: String,
    pub last_attempt_at: chrono::DateTime<chrono::Utc>,
    pub attempt_count: i64,
}

impl TryFrom<ReplicationRecordRow> for ReplicationRecord {
    type Error = CrossvaultError;

    fn try_from(row: ReplicationRecordRow) -> Result<Self> {
        let status: RecordStatus = row.status.parse().map_err(|e: String| {
            CrossvaultError::validation_field(e, "replication_records.status")
        })?;

        Ok(Self {
            target_key: TargetKey::new(
                SecretRef::new(row.source_domain, row.source_path),
                DomainId::from(row.dest_domain),
                SecretPath::from(row.dest_path),
            ),
            last_source_version: row.last_source_version.map(SecretVersion::from),
            last_dest_version: row.last_dest_version.map(SecretVersion::from),
            last_applied_policy_hash: row.last_applied_policy_hash,
            status,
            last_attempt_at: row.last_attempt_at,
            attempt_count: u32::try_from(row.attempt_count).unwrap_or(u32::MAX),
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT source_domain, source_path, dest_domain, dest_path,
        last_source_version, last_dest_version, last_applied_policy_hash,
        status, last_attempt_at, attempt_count
 FROM replication_records";

/// SQLite-backed state store.
#[derive(Debug, Clone)]
pub struct SqlxStateStore {
    pool: DbPool,
}

impl SqlxStateStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReplicationStateStore for SqlxStateStore {
    #[instrument(skip(self), fields(target = %key), name = "db_get_replication_record")]
    async fn get(&self, key: &TargetKey) -> Result<Option<ReplicationRecord>> {
        let row = sqlx::query_as::<Sqlite, ReplicationRecordRow>(&format!(
            "{} WHERE source_domain = $1 AND source_path = $2
             AND dest_domain = $3 AND dest_path = $4",
            SELECT_COLUMNS
        ))
        .bind(key.source.domain.as_str())
        .bind(key.source.path.as_str())
        .bind(key.dest_domain.as_str())
        .bind(key.dest_path.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, target = %key, "Failed to get replication record");
            CrossvaultError::database(e, format!("Failed to get replication record for '{}'", key))
        })?;

        row.map(ReplicationRecord::try_from).transpose()
    }

    #[instrument(
        skip(self, record),
        fields(target = %record.target_key, status = %record.status),
        name = "db_upsert_replication_record"
    )]
    async fn upsert(&self, record: &ReplicationRecord) -> Result<()> {
        let key = &record.target_key;

        sqlx::query(
            "INSERT INTO replication_records (
                source_domain, source_path, dest_domain, dest_path,
                last_source_version, last_dest_version, last_applied_policy_hash,
                status, last_attempt_at, attempt_count
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (source_domain, source_path, dest_domain, dest_path) DO UPDATE SET
                last_source_version = excluded.last_source_version,
                last_dest_version = excluded.last_dest_version,
                last_applied_policy_hash = excluded.last_applied_policy_hash,
                status = excluded.status,
                last_attempt_at = excluded.last_attempt_at,
                attempt_count = excluded.attempt_count",
        )
        .bind(key.source.domain.as_str())
        .bind(key.source.path.as_str())
        .bind(key.dest_domain.as_str())
        .bind(key.dest_path.as_str())
        .bind(record.last_source_version.as_ref().map(|v| v.as_str()))
        .bind(record.last_dest_version.as_ref().map(|v| v.as_str()))
        .bind(record.last_applied_policy_hash.as_deref())
        .bind(record.status.to_db_string())
        .bind(record.last_attempt_at)
        .bind(i64::from(record.attempt_count))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, target = %key, "Failed to upsert replication record");
            CrossvaultError::database(
                e,
                format!("Failed to upsert replication record for '{}'", key),
            )
        })?;

        Ok(())
    }

    #[instrument(skip(self), name = "db_list_replication_records")]
    async fn list(&self) -> Result<Vec<ReplicationRecord>> {
        let rows = sqlx::query_as::<Sqlite, ReplicationRecordRow>(&format!(
            "{} ORDER BY source_domain, source_path, dest_domain, dest_path",
            SELECT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CrossvaultError::database(e, "Failed to list replication records"))?;

        rows.into_iter().map(ReplicationRecord::try_from).collect()
    }

    #[instrument(skip(self), fields(target = %key), name = "db_decommission_replication_record")]
    async fn decommission(&self, key: &TargetKey) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM replication_records
             WHERE source_domain = $1 AND source_path = $2 AND dest_domain = $3 AND dest_path = $4",
        )
        .bind(key.source.domain.as_str())
        .bind(key.source.path.as_str())
        .bind(key.dest_domain.as_str())
        .bind(key.dest_path.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            CrossvaultError::database(
                e,
                format!("Failed to decommission replication record for '{}'", key),
            )
        })?;

        Ok(result.rows_affected() > 0)
    }
}
