//! # Storage and Persistence
//!
//! The replication state store and its SQLite connection pool.

pub mod memory;
pub mod pool;
pub mod state_store;

pub use memory::InMemoryStateStore;
pub use pool::{create_pool, run_migrations, sanitize_url, DbPool};
pub use state_store::{ReplicationStateStore, SqlxStateStore};
