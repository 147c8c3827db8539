//! Startup sequence: turn a validated [`AppConfig`] into a runnable engine.
//!
//! - Connect the configured backend (local simulator or Vault)
//! - Open the replication state database and apply migrations
//! - Wire the credential broker and reconciler
//!
//! For the local backend the simulator state is written back to its fixture
//! after a non dry-run pass, so consecutive runs see each other's writes.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{AppConfig, BackendConfig, StateConfig};
use crate::domain::ReplicationTarget;
use crate::errors::Result;
use crate::observability::MetricsRecorder;
use crate::replication::{CredentialBroker, LeaseMode, ReconcileReport, Reconciler};
use crate::secrets::{CloudClients, InMemoryCloud, VaultCloud};
use crate::storage::{create_pool, ReplicationStateStore, SqlxStateStore};

/// Per-invocation switches from the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub fail_fast: bool,
}

/// Local simulator and where to save it.
struct LocalCloud {
    cloud: Arc<InMemoryCloud>,
    fixture: Option<PathBuf>,
    persist: bool,
}

/// A fully wired replication engine.
pub struct Engine {
    targets: Vec<ReplicationTarget>,
    reconciler: Reconciler,
    state: Arc<dyn ReplicationStateStore>,
    local: Option<LocalCloud>,
    dry_run: bool,
}

impl Engine {
    pub async fn build(
        config: &AppConfig,
        options: RunOptions,
        metrics: MetricsRecorder,
    ) -> Result<Self> {
        let targets = config.resolve_targets()?;
        let (clients, local) = connect_backend(&config.backend).await?;
        let state = open_state_store(&config.state).await?;

        let broker = CredentialBroker::new(
            clients.trust.clone(),
            config.roles(),
            config.reconciler.refresh_skew(),
        )
        .with_metrics(metrics.clone());

        let mut settings = config.reconciler.to_settings(options.dry_run);
        if options.fail_fast {
            settings.lease_mode = LeaseMode::FailFast;
        }

        let reconciler = Reconciler::new(clients, Arc::new(broker), state.clone(), settings)
            .with_metrics(metrics);

        info!(
            backend = config.backend.kind(),
            targets = targets.len(),
            dry_run = options.dry_run,
            "Replication engine ready"
        );

        Ok(Self { targets, reconciler, state, local, dry_run: options.dry_run })
    }

    pub fn targets(&self) -> &[ReplicationTarget] {
        &self.targets
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn state_store(&self) -> Arc<dyn ReplicationStateStore> {
        self.state.clone()
    }

    /// Reconcile every configured target once.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let report = self.reconciler.reconcile_all(&self.targets).await;

        info!(
            targets = report.outcomes.len(),
            failed = report.failed().count(),
            writes = report.total_writes(),
            "Reconciliation run finished"
        );

        if !self.dry_run {
            self.persist_local_state()?;
        }
        Ok(report)
    }

    fn persist_local_state(&self) -> Result<()> {
        if let Some(LocalCloud { cloud, fixture: Some(path), persist: true }) = &self.local {
            cloud.save_fixture(path)?;
            info!(fixture = %path.display(), "Saved local backend state");
        }
        Ok(())
    }
}

async fn connect_backend(config: &BackendConfig) -> Result<(CloudClients, Option<LocalCloud>)> {
    match config {
        BackendConfig::Local(local) => {
            let cloud = match &local.fixture {
                Some(path) if path.exists() => InMemoryCloud::load_fixture(path)?,
                Some(path) => {
                    warn!(
                        fixture = %path.display(),
                        "Fixture not found; starting with an empty local backend"
                    );
                    InMemoryCloud::new()
                }
                None => InMemoryCloud::new(),
            };
            let cloud = Arc::new(cloud);
            let clients = CloudClients::from_backend(cloud.clone());
            Ok((
                clients,
                Some(LocalCloud { cloud, fixture: local.fixture.clone(), persist: local.persist }),
            ))
        }
        BackendConfig::Vault(vault) => {
            let cloud = Arc::new(VaultCloud::new(vault.clone()).await?);
            Ok((CloudClients::from_backend(cloud), None))
        }
    }
}

/// Open the SQLite state store described by `config`.
pub async fn open_state_store(config: &StateConfig) -> Result<Arc<dyn ReplicationStateStore>> {
    let pool = create_pool(config).await?;
    Ok(Arc::new(SqlxStateStore::new(pool)))
}
