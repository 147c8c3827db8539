//! # Command Line Interface
//!
//! `crossvault reconcile | status | decommission | validate`, all driven by the
//! same configuration file.

pub mod output;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::config::{load_config, AppConfig};
use crate::domain::{DomainId, SecretPath, SecretRef, TargetKey};
use crate::observability::{init_observability, log_config_info, MetricsRecorder};
use crate::startup::{open_state_store, Engine, RunOptions};
use output::OutputFormat;

/// Exit code when at least one target did not reach its terminal success state.
pub const EXIT_TARGETS_FAILED: i32 = 1;

#[derive(Parser)]
#[command(name = "crossvault")]
#[command(about = "Cross-domain secret replication and key-policy reconciliation")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Reconcile every configured target once
    Reconcile {
        /// Path to the configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Plan only: report drift without writing anything
        #[arg(long)]
        dry_run: bool,

        /// Fail targets already being reconciled instead of waiting
        #[arg(long)]
        fail_fast: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },

    /// List replication records
    Status {
        /// Path to the configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },

    /// Remove the replication record of one target
    Decommission {
        /// Path to the configuration file
        #[arg(short, long)]
        config: PathBuf,

        #[arg(long)]
        source_domain: String,

        #[arg(long)]
        source_path: String,

        #[arg(long)]
        dest_domain: String,

        #[arg(long)]
        dest_path: String,
    },

    /// Validate the configuration file and exit
    Validate {
        /// Path to the configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

/// Run CLI commands, returning the process exit code.
pub async fn run_cli() -> anyhow::Result<i32> {
    let cli = Cli::parse();
    run(cli).await
}

pub async fn run(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Reconcile { config, dry_run, fail_fast, output } => {
            let (config, metrics) = load(&config, cli.verbose)?;
            handle_reconcile(&config, RunOptions { dry_run, fail_fast }, metrics, output).await
        }
        Commands::Status { config, output } => {
            let (config, _) = load(&config, cli.verbose)?;
            let store = open_state_store(&config.state).await?;
            let records = store.list().await?;
            output::print_records(&records, output)?;
            Ok(0)
        }
        Commands::Decommission { config, source_domain, source_path, dest_domain, dest_path } => {
            let (config, _) = load(&config, cli.verbose)?;
            let key = TargetKey::new(
                SecretRef::new(source_domain, source_path),
                DomainId::new(dest_domain),
                SecretPath::new(dest_path),
            );
            let store = open_state_store(&config.state).await?;
            if store.decommission(&key).await? {
                println!("Removed replication record for {}", key);
                Ok(0)
            } else {
                println!("No replication record for {}", key);
                Ok(EXIT_TARGETS_FAILED)
            }
        }
        Commands::Validate { config } => {
            let (config, _) = load(&config, cli.verbose)?;
            println!(
                "Configuration is valid: {} domain(s), {} target(s), {} backend",
                config.domains.len(),
                config.targets.len(),
                config.backend.kind()
            );
            Ok(0)
        }
    }
}

fn load(path: &Path, verbose: bool) -> anyhow::Result<(AppConfig, MetricsRecorder)> {
    let config = load_config(Some(path))?;
    let metrics = init_observability(&config.observability, verbose)
        .context("Failed to initialize observability")?;
    log_config_info(&config);
    Ok((config, metrics))
}

async fn handle_reconcile(
    config: &AppConfig,
    options: RunOptions,
    metrics: MetricsRecorder,
    format: OutputFormat,
) -> anyhow::Result<i32> {
    let engine = Engine::build(config, options, metrics).await?;
    let report = engine.reconcile().await?;
    output::print_report(&report, format)?;

    Ok(if report.all_succeeded() {
        0
    } else {
        EXIT_TARGETS_FAILED
    })
}
