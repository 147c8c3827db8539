//! # Observability Infrastructure
//!
//! Structured logging and Prometheus metrics for crossvault.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, log_config_info};
pub use metrics::{init_metrics, MetricsRecorder};

use crate::config::ObservabilityConfig;
use crate::errors::Result;
use ::tracing::info;

/// Initialize logging and, when a port is configured, the metrics exporter.
///
/// Returns the recorder to hand to the reconciler. A recorder is returned even
/// when no exporter is installed; recording is then a no-op.
pub fn init_observability(config: &ObservabilityConfig, verbose: bool) -> Result<MetricsRecorder> {
    init_logging(config, verbose)?;
    let exporter = init_metrics(config)?;

    info!(
        service_name = %config.service_name,
        log_level = %config.log_level,
        json_logging = config.json_logging,
        metrics_enabled = exporter.is_some(),
        "Observability initialized successfully"
    );

    Ok(exporter.unwrap_or_default())
}
