//! Shared output formatting for CLI commands
//!
//! Reports and records can be printed as JSON, YAML, or a plain table.

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Serialize;

use crate::domain::ReplicationRecord;
use crate::replication::{PassOutcome, ReconcileReport};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    Json,
    Yaml,
    #[default]
    Table,
}

/// One reconciled target, as printed.
#[derive(Debug, Serialize)]
pub struct PassRow {
    pub target: String,
    pub state: String,
    pub attempts: u32,
    pub policy_writes: u32,
    pub value_writes: u32,
    pub grants_added: usize,
    pub grants_removed: usize,
    pub source_version: Option<String>,
    pub dest_version: Option<String>,
    pub error: Option<String>,
}

impl From<&PassOutcome> for PassRow {
    fn from(outcome: &PassOutcome) -> Self {
        let patch = outcome.patch.as_ref();
        Self {
            target: outcome.target_key.to_string(),
            state: outcome.state.to_string(),
            attempts: outcome.attempts,
            policy_writes: outcome.writes.policy_writes,
            value_writes: outcome.writes.value_writes,
            grants_added: patch.map(|p| p.to_add.len()).unwrap_or(0),
            grants_removed: patch.map(|p| p.to_remove.len()).unwrap_or(0),
            source_version: outcome.source_version.as_ref().map(|v| v.to_string()),
            dest_version: outcome.dest_version.as_ref().map(|v| v.to_string()),
            error: outcome.error.as_ref().map(|e| e.to_string()),
        }
    }
}

/// Print data as JSON
pub fn print_json<T: Serialize>(data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data).context("Failed to serialize to JSON")?;
    println!("{}", json);
    Ok(())
}

/// Print data as YAML
pub fn print_yaml<T: Serialize>(data: &T) -> Result<()> {
    let yaml = serde_yaml::to_string(data).context("Failed to serialize to YAML")?;
    println!("{}", yaml);
    Ok(())
}

pub fn print_report(report: &ReconcileReport, format: OutputFormat) -> Result<()> {
    let rows: Vec<PassRow> = report.outcomes.iter().map(PassRow::from).collect();
    match format {
        OutputFormat::Json => print_json(&rows),
        OutputFormat::Yaml => print_yaml(&rows),
        OutputFormat::Table => {
            print_report_table(&rows);
            Ok(())
        }
    }
}

pub fn print_records(records: &[ReplicationRecord], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(&records),
        OutputFormat::Yaml => print_yaml(&records),
        OutputFormat::Table => {
            print_records_table(records);
            Ok(())
        }
    }
}

fn print_report_table(rows: &[PassRow]) {
    if rows.is_empty() {
        println!("No targets configured");
        return;
    }

    print_table_header(&[
        ("Target", 60),
        ("State", 28),
        ("Attempts", 8),
        ("Writes", 6),
        ("Error", 40),
    ]);
    for row in rows {
        println!(
            "{:<60} {:<28} {:<8} {:<6} {}",
            truncate(&row.target, 60),
            row.state,
            row.attempts,
            row.policy_writes + row.value_writes,
            row.error.as_deref().map(|e| truncate(e, 80)).unwrap_or_default()
        );
    }
    println!();
}

fn print_records_table(records: &[ReplicationRecord]) {
    if records.is_empty() {
        println!("No replication records found");
        return;
    }

    print_table_header(&[
        ("Target", 60),
        ("Status", 28),
        ("Source", 8),
        ("Dest", 8),
        ("Attempts", 8),
        ("Last Attempt", 20),
    ]);
    for record in records {
        println!(
            "{:<60} {:<28} {:<8} {:<8} {:<8} {}",
            truncate(&record.target_key.to_string(), 60),
            record.status.to_string(),
            record.last_source_version.as_ref().map(|v| v.as_str()).unwrap_or("-"),
            record.last_dest_version.as_ref().map(|v| v.as_str()).unwrap_or("-"),
            record.attempt_count,
            record.last_attempt_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!();
}

/// Truncate string to maximum length with ellipsis
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Print a table header
pub fn print_table_header(columns: &[(&str, usize)]) {
    println!();
    let mut header = String::new();
    for (name, width) in columns {
        header.push_str(&format!("{:<width$} ", name, width = width));
    }
    println!("{}", header.trim());

    let total_width: usize = columns.iter().map(|(_, w)| w + 1).sum();
    println!("{}", "-".repeat(total_width.saturating_sub(1)));
}
