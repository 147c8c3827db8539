//! # Structured Logging
//!
//! Subscriber setup and span macros built on the tracing ecosystem. Secret
//! values never appear in fields: [`crate::secrets::SecretValue`] redacts itself
//! in both `Debug` and `Display`.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{AppConfig, ObservabilityConfig};
use crate::errors::{CrossvaultError, Result};

/// Create a tracing span for one reconciliation pass.
///
/// ```rust,ignore
/// let span = pass_span!(target.key());
/// let span = pass_span!(target.key(), dry_run = true);
/// ```
#[macro_export]
macro_rules! pass_span {
    ($target_key:expr) => {
        tracing::info_span!(
            "reconcile_pass",
            target = %$target_key,
            pass_id = %uuid::Uuid::new_v4()
        )
    };
    ($target_key:expr, $($field:tt)*) => {
        tracing::info_span!(
            "reconcile_pass",
            target = %$target_key,
            pass_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Create a tracing span for state store operations.
#[macro_export]
macro_rules! state_span {
    ($operation:expr) => {
        tracing::debug_span!("state_operation", operation = %$operation)
    };
    ($operation:expr, $($field:tt)*) => {
        tracing::debug_span!("state_operation", operation = %$operation, $($field)*)
    };
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level. A second call (integration tests
/// installing their own subscriber) is ignored.
pub fn init_logging(config: &ObservabilityConfig, verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { config.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| {
            CrossvaultError::config(format!("Invalid log level '{}': {}", default_level, e))
        })?;

    let installed = if config.json_logging {
        tracing::subscriber::set_global_default(
            fmt().json().with_env_filter(filter).with_current_span(true).finish(),
        )
    } else {
        tracing::subscriber::set_global_default(
            fmt().with_env_filter(filter).with_target(false).finish(),
        )
    };

    if installed.is_err() {
        tracing::debug!("Global subscriber already installed; keeping it");
    }
    Ok(())
}

/// Log configuration at startup
pub fn log_config_info(config: &AppConfig) {
    tracing::info!(
        domains = config.domains.len(),
        targets = config.targets.len(),
        backend = %config.backend.kind(),
        state_url = %crate::storage::sanitize_url(&config.state.url),
        max_concurrency = config.reconciler.max_concurrency,
        lease_mode = ?config.reconciler.lease_mode,
        "crossvault configuration"
    );
}
