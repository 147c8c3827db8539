//! Test database utilities for integration tests.
//!
//! Each `TestDatabase` is a SQLite file in its own temporary directory, so
//! tests stay isolated and can reopen the same file to simulate a restart.

#![allow(clippy::duplicate_mod)]

use crossvault::config::StateConfig;
use crossvault::storage::{create_pool, DbPool, SqlxStateStore};
use std::path::PathBuf;
use tempfile::TempDir;

/// A file-backed state database, removed with its directory on drop.
pub struct TestDatabase {
    pub pool: DbPool,
    pub path: PathBuf,
    _dir: TempDir,
}

impl TestDatabase {
    /// Create a new database with migrations applied.
    pub async fn new(prefix: &str) -> Self {
        let dir = tempfile::Builder::new().prefix(prefix).tempdir().expect("create test directory");
        let path = dir.path().join("crossvault.db");
        let pool = create_pool(&Self::config_for(&path)).await.expect("create test database pool");
        Self { pool, path, _dir: dir }
    }

    pub fn config_for(path: &std::path::Path) -> StateConfig {
        StateConfig { url: format!("sqlite://{}", path.display()), ..Default::default() }
    }

    /// State configuration pointing at this database file.
    pub fn config(&self) -> StateConfig {
        Self::config_for(&self.path)
    }

    pub fn store(&self) -> SqlxStateStore {
        SqlxStateStore::new(self.pool.clone())
    }

    /// Open a second, independent pool on the same file.
    pub async fn reopen(&self) -> DbPool {
        create_pool(&self.config()).await.expect("reopen test database")
    }
}
