//! # Metrics Collection
//!
//! Prometheus metrics for replication passes. Without an installed exporter
//! the `metrics` macros are no-ops, so components record unconditionally.

use ::tracing::info;
use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

use crate::config::ObservabilityConfig;
use crate::errors::{CrossvaultError, Result};

/// Metrics recorder that tracks replication metrics
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorder;

impl MetricsRecorder {
    /// Create a new metrics recorder instance
    pub fn new() -> Self {
        Self
    }

    /// Record a finished reconciliation pass
    pub fn record_pass(&self, status: &str, attempts: u32, duration: f64) {
        counter!("replication_passes_total", "status" => status.to_string()).increment(1);
        histogram!("replication_pass_duration_seconds").record(duration);
        histogram!("replication_pass_attempts").record(attempts as f64);
    }

    /// Record a write made to a destination domain
    pub fn record_destination_write(&self, domain: &str, kind: &str) {
        let labels = [("domain", domain.to_string()), ("kind", kind.to_string())];
        counter!("replication_destination_writes_total", &labels).increment(1);
    }

    /// Record a trust exchange and its outcome
    pub fn record_credential_exchange(&self, domain: &str, success: bool) {
        let status = if success { "success" } else { "error" };
        let labels = [("domain", domain.to_string()), ("status", status.to_string())];
        counter!("credential_exchanges_total", &labels).increment(1);
    }

    /// Record a retry scheduled after a retryable failure
    pub fn record_retry(&self, reason: &str) {
        counter!("replication_retries_total", "reason" => reason.to_string()).increment(1);
    }

    /// Register metric descriptions so Prometheus exports them before events occur.
    pub fn register_replication_metrics(&self) {
        describe_counter!(
            "replication_passes_total",
            Unit::Count,
            "Reconciliation passes grouped by terminal status"
        );
        describe_histogram!(
            "replication_pass_duration_seconds",
            Unit::Seconds,
            "Wall-clock duration of a reconciliation pass"
        );
        describe_histogram!(
            "replication_pass_attempts",
            Unit::Count,
            "Attempts used by a reconciliation pass"
        );
        describe_counter!(
            "replication_destination_writes_total",
            Unit::Count,
            "Writes made to destination domains grouped by kind"
        );
        describe_counter!(
            "credential_exchanges_total",
            Unit::Count,
            "Trust exchanges grouped by domain and outcome"
        );
        describe_counter!(
            "replication_retries_total",
            Unit::Count,
            "Retries scheduled grouped by failure kind"
        );

        for status in ["synced", "planned", "failed"] {
            counter!("replication_passes_total", "status" => status).absolute(0);
        }
    }
}

/// Install the Prometheus exporter when a metrics port is configured.
pub fn init_metrics(config: &ObservabilityConfig) -> Result<Option<MetricsRecorder>> {
    let Some(metrics_addr) = config.metrics_bind_address() else {
        return Ok(None);
    };

    let socket_addr: SocketAddr = metrics_addr.parse().map_err(|e| {
        CrossvaultError::config(format!("Invalid metrics bind address '{}': {}", metrics_addr, e))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .add_global_label("service", &config.service_name)
        .install()
        .map_err(|e| {
            CrossvaultError::config(format!("Failed to initialize metrics exporter: {}", e))
        })?;

    let recorder = MetricsRecorder::new();
    recorder.register_replication_metrics();

    info!(
        metrics_addr = %metrics_addr,
        service_name = %config.service_name,
        "Metrics collection initialized"
    );

    Ok(Some(recorder))
}
