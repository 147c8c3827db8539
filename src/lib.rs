//! # crossvault
//!
//! Cross-domain secret replication engine. Secrets declared in a source trust
//! domain are copied into destination domains, and the destination key policy
//! is reconciled so that tagged consumers can decrypt the replica.
//!
//! ## Architecture
//!
//! ```text
//! config targets -> Reconciler --(per target, concurrently)--> PassOutcome
//!                     |   |   |
//!     CredentialBroker    |   DriftComparator <- PolicyPlanner
//!                     SecretReader
//!                         |
//!       secrets::{SecretStore, KeyManagement, TrustExchange}
//!                         |
//!            local simulator / HashiCorp Vault
//! ```
//!
//! Every pass ends with one replication record in the state store
//! (SQLite through `sqlx`), which later passes use to stay idempotent.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use crossvault::{config::load_config, observability::MetricsRecorder};
//! use crossvault::startup::{Engine, RunOptions};
//!
//! #[tokio::main]
//! async fn main() -> crossvault::Result<()> {
//!     let config = load_config(Some("crossvault.yaml".as_ref()))?;
//!     let engine = Engine::build(&config, RunOptions::default(), MetricsRecorder::new()).await?;
//!     let report = engine.reconcile().await?;
//!     println!("all synced: {}", report.all_succeeded());
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod domain;
pub mod errors;
pub mod observability;
pub mod replication;
pub mod secrets;
pub mod startup;
pub mod storage;

pub use config::AppConfig;
pub use errors::{CrossvaultError, Result};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
