//! # Configuration Settings
//!
//! Defines the configuration structure for the crossvault replication engine.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;
use validator::Validate;

use super::targets::{DomainConfig, TargetDeclaration};
use crate::domain::{DomainId, KeyRef, ReplicationTarget, SecretPath, SecretRef};
use crate::errors::{CrossvaultError, Result};
use crate::replication::{
    GrantRemovalPolicy, LeaseMode, ReconcilerSettings, RetryPolicy, DEFAULT_CONSUMER_TAG_KEY,
};
use crate::secrets::VaultBackendConfig;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Trust domains the engine may act in
    #[validate(nested)]
    pub domains: Vec<DomainConfig>,

    /// Declared replication targets
    #[validate(nested)]
    pub targets: Vec<TargetDeclaration>,

    /// Reconciler tuning
    #[validate(nested)]
    pub reconciler: ReconcilerConfig,

    /// Replication state database
    #[validate(nested)]
    pub state: StateConfig,

    /// Observability configuration
    #[validate(nested)]
    pub observability: ObservabilityConfig,

    /// Secret store, key service and trust exchange backend
    pub backend: BackendConfig,
}

impl AppConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(CrossvaultError::from)?;
        self.validate_custom()?;
        Ok(())
    }

    /// Cross-field checks the validator derive cannot express.
    fn validate_custom(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for (index, domain) in self.domains.iter().enumerate() {
            if !seen.insert(domain.id.trim()) {
                return Err(CrossvaultError::validation_field(
                    format!("Domain '{}' is declared more than once", domain.id),
                    format!("domains[{}].id", index),
                ));
            }
        }

        if self.reconciler.base_backoff_ms > self.reconciler.max_backoff_ms {
            return Err(CrossvaultError::validation_field(
                "base_backoff_ms cannot exceed max_backoff_ms",
                "reconciler.base_backoff_ms",
            ));
        }

        if let BackendConfig::Vault(vault) = &self.backend {
            if vault.address.trim().is_empty() {
                return Err(CrossvaultError::validation_field(
                    "Vault address cannot be empty",
                    "backend.address",
                ));
            }
            for domain in &self.domains {
                if !vault.domains.contains_key(&DomainId::new(domain.id.as_str())) {
                    return Err(CrossvaultError::validation_field(
                        format!("No Vault settings for domain '{}'", domain.id),
                        format!("backend.domains.{}", domain.id),
                    ));
                }
            }
        }

        self.resolve_targets()?;
        Ok(())
    }

    fn domain(&self, id: &str) -> Option<&DomainConfig> {
        self.domains.iter().find(|d| d.id == id)
    }

    /// Resolve declarations into targets: domains must be declared, the
    /// destination key falls back to the domain's default key, and no two
    /// declarations may write the same destination secret.
    pub fn resolve_targets(&self) -> Result<Vec<ReplicationTarget>> {
        let mut destinations: BTreeMap<SecretRef, usize> = BTreeMap::new();
        let mut targets = Vec::with_capacity(self.targets.len());

        for (index, declaration) in self.targets.iter().enumerate() {
            let field = |name: &str| format!("targets[{}].{}", index, name);
            let source = &declaration.source;
            let destination = &declaration.destination;

            if self.domain(&source.domain).is_none() {
                return Err(CrossvaultError::validation_field(
                    format!("Unknown source domain '{}'", source.domain),
                    field("source.domain"),
                ));
            }
            let Some(dest_domain) = self.domain(&destination.domain) else {
                return Err(CrossvaultError::validation_field(
                    format!("Unknown destination domain '{}'", destination.domain),
                    field("destination.domain"),
                ));
            };

            if source.path.trim().is_empty() {
                return Err(CrossvaultError::validation_field(
                    "Source path cannot be empty",
                    field("source.path"),
                ));
            }
            if destination.path.trim().is_empty() {
                return Err(CrossvaultError::validation_field(
                    "Destination path cannot be empty",
                    field("destination.path"),
                ));
            }
            if source.domain == destination.domain && source.path == destination.path {
                return Err(CrossvaultError::validation_field(
                    "Source and destination must differ",
                    field("destination"),
                ));
            }

            let dest_key = destination.key.as_ref().or(dest_domain.default_key.as_ref());
            let Some(dest_key) = dest_key.filter(|k| !k.trim().is_empty()) else {
                return Err(CrossvaultError::validation_field(
                    format!(
                        "No destination key and domain '{}' has no default_key",
                        destination.domain
                    ),
                    field("destination.key"),
                ));
            };

            let mut consumer_tags = BTreeSet::new();
            for consumer in &declaration.consumers {
                let tag = consumer.trim();
                if tag.is_empty() {
                    return Err(CrossvaultError::validation_field(
                        "Consumer tags cannot be empty",
                        field("consumers"),
                    ));
                }
                consumer_tags.insert(tag.to_string());
            }

            let target = ReplicationTarget {
                source: SecretRef::new(source.domain.as_str(), source.path.as_str()),
                dest_domain: DomainId::new(destination.domain.as_str()),
                dest_path: SecretPath::new(destination.path.as_str()),
                dest_key: KeyRef::new(dest_key.as_str()),
                consumer_tags,
            };

            if let Some(previous) = destinations.insert(target.key().destination(), index) {
                return Err(CrossvaultError::validation_field(
                    format!(
                        "Destination '{}' is already written by targets[{}]",
                        target.key().destination(),
                        previous
                    ),
                    field("destination"),
                ));
            }
            targets.push(target);
        }

        Ok(targets)
    }

    /// Role assumed in each domain.
    pub fn roles(&self) -> HashMap<DomainId, String> {
        self.domains.iter().map(|d| (DomainId::new(d.id.as_str()), d.role.clone())).collect()
    }
}

/// Reconciler tuning
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Attempts per pass, including the first one
    #[validate(range(min = 1, max = 20, message = "Max attempts must be between 1 and 20"))]
    pub max_attempts: u32,

    /// Backoff before the second attempt, in milliseconds
    #[validate(range(min = 1, message = "Base backoff must be at least 1ms"))]
    pub base_backoff_ms: u64,

    /// Upper bound for any backoff, in milliseconds
    pub max_backoff_ms: u64,

    /// Deadline of one pass, lease wait included
    #[validate(range(
        min = 1,
        max = 3600,
        message = "Pass deadline must be between 1 and 3600 seconds"
    ))]
    pub pass_deadline_seconds: u64,

    /// Targets reconciled at the same time
    #[validate(range(min = 1, max = 256, message = "Max concurrency must be between 1 and 256"))]
    pub max_concurrency: usize,

    /// Behaviour when a target is already being reconciled
    pub lease_mode: LeaseMode,

    /// Credentials are refreshed once their remaining lease drops below this
    pub refresh_skew_seconds: u64,

    /// Tag key carried by the conditions of consumer grants
    #[validate(length(min = 1, message = "Consumer tag key cannot be empty"))]
    pub consumer_tag_key: String,

    /// What happens to stale consumer grants
    pub grant_removal: GrantRemovalPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 200,
            max_backoff_ms: 30_000,
            pass_deadline_seconds: 120,
            max_concurrency: 8,
            lease_mode: LeaseMode::Block,
            refresh_skew_seconds: 60,
            consumer_tag_key: DEFAULT_CONSUMER_TAG_KEY.to_string(),
            grant_removal: GrantRemovalPolicy::RevokeManaged,
        }
    }
}

impl ReconcilerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }

    pub fn pass_deadline(&self) -> Duration {
        Duration::from_secs(self.pass_deadline_seconds)
    }

    pub fn refresh_skew(&self) -> Duration {
        Duration::from_secs(self.refresh_skew_seconds)
    }

    /// Runtime settings for a run; `dry_run` comes from the command line.
    pub fn to_settings(&self, dry_run: bool) -> ReconcilerSettings {
        ReconcilerSettings {
            retry: self.retry_policy(),
            pass_deadline: self.pass_deadline(),
            lease_mode: self.lease_mode,
            dry_run,
            max_concurrency: self.max_concurrency,
            consumer_tag_key: self.consumer_tag_key.clone(),
            removal_policy: self.grant_removal,
        }
    }
}

/// Replication state database configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StateConfig {
    /// SQLite connection URL
    #[validate(length(min = 1, message = "State database URL cannot be empty"))]
    pub url: String,

    /// Maximum number of connections in the pool
    #[validate(range(
        min = 1,
        max = 100,
        message = "Max connections must be between 1 and 100"
    ))]
    pub max_connections: u32,

    /// Minimum number of connections in the pool
    #[validate(range(max = 50, message = "Min connections must be between 0 and 50"))]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[validate(range(
        min = 1,
        max = 60,
        message = "Connect timeout must be between 1 and 60 seconds"
    ))]
    pub connect_timeout_seconds: u64,

    /// Enable automatic migrations
    pub auto_migrate: bool,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/crossvault.db".to_string(),
            max_connections: 5,
            min_connections: 0,
            connect_timeout_seconds: 10,
            auto_migrate: true,
        }
    }
}

impl StateConfig {
    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    /// Whether the database lives only as long as the process
    pub fn is_in_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }
}

/// Observability configuration for logging and metrics
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Metrics exporter port (0 = disabled)
    pub metrics_port: u16,

    /// Service name attached to metrics
    #[validate(length(min = 1, message = "Service name cannot be empty"))]
    pub service_name: String,

    /// Log level (trace, debug, info, warn, error)
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Enable JSON structured logging
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_port: 0,
            service_name: "crossvault".to_string(),
            log_level: "info".to_string(),
            json_logging: false,
        }
    }
}

impl ObservabilityConfig {
    /// Get metrics bind address (None if disabled)
    pub fn metrics_bind_address(&self) -> Option<String> {
        if self.metrics_port == 0 {
            None
        } else {
            Some(format!("0.0.0.0:{}", self.metrics_port))
        }
    }
}

/// Which services back the secret stores, key services and trust exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// In-process simulator, optionally loaded from and saved to a fixture
    Local(LocalBackendConfig),
    /// HashiCorp Vault, one namespace per domain
    Vault(VaultBackendConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Local(LocalBackendConfig::default())
    }
}

impl BackendConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            BackendConfig::Local(_) => "local",
            BackendConfig::Vault(_) => "vault",
        }
    }
}

/// Local simulator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalBackendConfig {
    /// JSON or YAML fixture describing domains, keys, secrets and trust
    #[serde(default)]
    pub fixture: Option<PathBuf>,

    /// Write the simulator state back to the fixture after a run
    #[serde(default = "default_persist")]
    pub persist: bool,
}

fn default_persist() -> bool {
    true
}

impl Default for LocalBackendConfig {
    fn default() -> Self {
        Self { fixture: None, persist: default_persist() }
    }
}
