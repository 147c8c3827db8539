//! # Configuration Management
//!
//! Settings are read once at startup: an optional YAML, TOML or JSON file,
//! then `CROSSVAULT__*` environment variables on top
//! (`CROSSVAULT__STATE__URL=sqlite::memory:`). The merged result is
//! validated before any pass starts.

pub mod settings;
pub mod targets;

pub use settings::{
    AppConfig, BackendConfig, LocalBackendConfig, ObservabilityConfig, ReconcilerConfig,
    StateConfig,
};
pub use targets::{DestinationDeclaration, DomainConfig, SourceDeclaration, TargetDeclaration};

use std::path::Path;

use crate::errors::{CrossvaultError, Result};

const ENV_PREFIX: &str = "CROSSVAULT";

/// Load, merge and validate configuration.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        if !path.exists() {
            return Err(CrossvaultError::config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }
        builder = builder.add_source(config::File::from(path));
    }

    builder = builder.add_source(
        config::Environment::with_prefix(ENV_PREFIX).separator("__").try_parsing(true),
    );

    let config: AppConfig = builder.build()?.try_deserialize()?;
    config.validate()?;

    tracing::debug!(
        path = ?path,
        domains = config.domains.len(),
        targets = config.targets.len(),
        "Configuration loaded"
    );

    Ok(config)
}
