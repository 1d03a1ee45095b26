//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - run: submit a task, wait for it and print its report
//! - status / result: observe one task
//! - history, versions, rollback, errors, similar: read the memory store
//! - doctor: validate configuration and check dependencies

use anyhow::{Context, Result};
use serde_json::json;
use std::time::Duration;

use crate::conductor::AgentService;
use crate::config::Config;
use crate::db::Database;
use crate::llm::InferencePort;
use crate::memory::{embedder_from_config, MemoryStore};
use sdk::types::{TaskReport, TaskStatus};

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn format_time(timestamp: i64) -> String {
    chrono::DateTime::from_timestamp(timestamp, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

/// Open the memory store without wiring inference
async fn open_store(config: &Config) -> Result<MemoryStore> {
    let database = Database::new(&config.db_path())
        .await
        .context("Failed to open database")?;
    let embedder = embedder_from_config(config)?;
    Ok(MemoryStore::new(
        database,
        embedder,
        config.memory.max_history_items,
    ))
}

/// Run a task to completion
///
/// Fails when the task ends in any status other than `completed`, after the
/// report has been printed.
pub async fn handle_run(task: String, config: &Config, format: OutputFormat) -> Result<()> {
    let service = AgentService::new(config).await?;

    if let OutputFormat::Text = format {
        println!("Executing task: {}", task);
        println!();
    }

    let result = service.run_task(&task).await;
    service.shutdown().await;
    let report = result?;

    match format {
        OutputFormat::Text => print_report(&report),
        OutputFormat::Json => print_json(&report)?,
    }

    match report.task.status {
        TaskStatus::Completed => Ok(()),
        status => Err(anyhow::anyhow!(
            "Task {} ended with status {}",
            report.task.id,
            status
        )),
    }
}

/// Show the status of a task
pub async fn handle_status(task_id: String, config: &Config, format: OutputFormat) -> Result<()> {
    let service = AgentService::new(config).await?;
    let view = service.get_status(&task_id).await?;

    match format {
        OutputFormat::Text => {
            println!("Task {}: {}", view.task_id, view.status);
            if let Some((index, description)) = &view.current_step {
                println!("  Current step {}: {}", index + 1, description);
            }
            for line in &view.log_tail {
                println!("  {}", line);
            }
        }
        OutputFormat::Json => print_json(&view)?,
    }
    Ok(())
}

/// Show the full record of a task
pub async fn handle_result(task_id: String, config: &Config, format: OutputFormat) -> Result<()> {
    let service = AgentService::new(config).await?;
    let report = service.get_result(&task_id).await?;

    match format {
        OutputFormat::Text => print_report(&report),
        OutputFormat::Json => print_json(&report)?,
    }
    Ok(())
}

fn print_report(report: &TaskReport) {
    let task = &report.task;
    println!("Task {}", task.id);
    println!("  Description: {}", task.description);
    println!("  Status:      {}", task.status);
    if let Some(task_type) = &task.task_type {
        println!("  Type:        {}", task_type);
    }
    if let Some(complexity) = report.complexity {
        println!("  Complexity:  {}", complexity);
    }
    println!("  Created:     {}", format_time(task.created_at));
    if let Some(completed) = task.completed_at {
        println!("  Finished:    {}", format_time(completed));
    }
    if let Some(error) = &task.error {
        println!("  Error:       {}", error);
    }

    println!();
    println!(
        "Steps ({}/{} succeeded, {} version(s)):",
        report.succeeded_steps(),
        report.steps.len(),
        report.versions
    );
    for step in &report.steps {
        let marker = match step.status {
            sdk::types::StepStatus::Succeeded => "✓",
            sdk::types::StepStatus::Skipped => "-",
            _ => "✗",
        };
        println!(
            "  {} Step {}: {} [{}]",
            marker,
            step.sequence_index + 1,
            step.description,
            step.status
        );
        println!(
            "      attempts: {}, fix attempts used: {}",
            step.attempts, step.fix_attempts_used
        );
        if let Some(kind) = step.error_kind {
            println!("      error kind: {}", kind);
        }
        if let Some(error) = &step.error {
            println!("      error: {}", error);
        }
        if let Some(output) = &step.output_tail {
            println!("      output:");
            for line in output.lines() {
                println!("        {}", line);
            }
        }
    }
}

/// Show recent tasks
pub async fn handle_history(limit: usize, config: &Config, format: OutputFormat) -> Result<()> {
    let store = open_store(config).await?;
    let tasks = store
        .recent_tasks(limit as i64)
        .await
        .context("Failed to fetch task history")?;

    match format {
        OutputFormat::Text => {
            if tasks.is_empty() {
                println!("No tasks in history");
                return Ok(());
            }

            println!("Task History (last {} tasks):", limit);
            println!();
            for task in &tasks {
                println!("Task ID: {}", task.id);
                println!("  Description: {}", task.description);
                println!("  Status: {}", task.status);
                println!("  Created: {}", format_time(task.created_at));
                println!();
            }
        }
        OutputFormat::Json => print_json(&json!({
            "tasks": tasks,
            "count": tasks.len(),
            "limit": limit
        }))?,
    }
    Ok(())
}

/// Show the version log of a task
pub async fn handle_versions(task_id: String, config: &Config, format: OutputFormat) -> Result<()> {
    let store = open_store(config).await?;
    let versions = store.version_history(&task_id).await?;

    match format {
        OutputFormat::Text => {
            if versions.is_empty() {
                println!("No versions recorded for task {}", task_id);
                return Ok(());
            }
            for entry in &versions {
                println!(
                    "#{} {} {} ({})",
                    entry.sequence,
                    &entry.artifact_hash[..entry.artifact_hash.len().min(12)],
                    entry.commit_message,
                    format_time(entry.created_at)
                );
                println!("    step: {}", entry.step_id);
            }
        }
        OutputFormat::Json => print_json(&versions)?,
    }
    Ok(())
}

/// Print the snapshot of a task up to one step
pub async fn handle_rollback(
    task_id: String,
    step_id: String,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let store = open_store(config).await?;
    let snapshot = store.rollback_to(&task_id, &step_id).await?;

    match format {
        OutputFormat::Text => {
            if snapshot.is_empty() {
                println!("Step {} has no committed version in task {}", step_id, task_id);
                return Ok(());
            }
            for entry in &snapshot {
                println!("# ---- version {}: {}", entry.sequence, entry.commit_message);
                println!("{}", entry.artifact);
                println!();
            }
        }
        OutputFormat::Json => print_json(&snapshot)?,
    }
    Ok(())
}

/// Show the most common error kinds
pub async fn handle_errors(limit: usize, config: &Config, format: OutputFormat) -> Result<()> {
    let store = open_store(config).await?;
    let summaries = store.common_errors(limit as i64).await?;

    match format {
        OutputFormat::Text => {
            if summaries.is_empty() {
                println!("No errors recorded");
                return Ok(());
            }
            println!("{:<22} {:>6} {:>6}  Latest message", "Kind", "Count", "Fixed");
            for summary in &summaries {
                println!(
                    "{:<22} {:>6} {:>6}  {}",
                    summary.error_kind.to_string(),
                    summary.count,
                    summary.fixed_count,
                    summary.sample_message
                );
            }
        }
        OutputFormat::Json => print_json(&summaries)?,
    }
    Ok(())
}

/// Show past experiences similar to a text
pub async fn handle_similar(
    text: String,
    k: usize,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let store = open_store(config).await?;
    if store.embedding_model().is_none() {
        tracing::warn!("No embedding model configured, retrieval is disabled");
    }
    let experiences = store.retrieve_similar(&text, k).await;

    match format {
        OutputFormat::Text => {
            if experiences.is_empty() {
                println!("No similar experiences");
                return Ok(());
            }
            for exp in &experiences {
                println!(
                    "[{:.3}] [{}] ({}) {}",
                    exp.distance.unwrap_or(f32::NAN),
                    exp.outcome,
                    exp.task_type,
                    exp.pattern.lines().next().unwrap_or_default()
                );
            }
        }
        OutputFormat::Json => print_json(&experiences)?,
    }
    Ok(())
}

/// Run system diagnostics
///
/// Checks the data, workspace and sandbox directories, the database, each
/// inference provider and the configured interpreter.
pub async fn handle_doctor(config: &Config, format: OutputFormat) -> Result<()> {
    let mut issues = Vec::new();
    let mut checks: Vec<(String, String)> = Vec::new();

    // Config is validated when loaded
    checks.push(("Configuration".to_string(), "Valid".to_string()));

    for (name, dir) in [
        ("Data directory", &config.core.data_dir),
        ("Workspace directory", &config.core.workspace),
        ("Sandbox directory", &config.execution.sandbox_dir),
    ] {
        if dir.exists() {
            checks.push((name.to_string(), "Exists".to_string()));
        } else {
            checks.push((name.to_string(), "Missing (created on first run)".to_string()));
        }
    }

    match Database::new(&config.db_path()).await {
        Ok(database) => {
            checks.push(("Database".to_string(), "OK".to_string()));
            if let Err(e) = database.close().await {
                issues.push(format!("Database did not close cleanly: {}", e));
            }
        }
        Err(e) => {
            checks.push(("Database".to_string(), "Failed".to_string()));
            issues.push(format!("Cannot open database: {:#}", e));
        }
    }

    checks.push((
        "Embedding model".to_string(),
        config.memory.embedding_model.clone(),
    ));

    match InferencePort::from_config(config) {
        Ok(port) => {
            let health = port.check_health().await;
            if !health.iter().any(|(_, healthy)| *healthy) {
                issues.push(
                    "No inference provider is reachable. Start Ollama or configure OpenAI."
                        .to_string(),
                );
            }
            for (name, healthy) in health {
                checks.push((
                    format!("Provider {}", name),
                    if healthy { "Available" } else { "Unavailable" }.to_string(),
                ));
            }
        }
        Err(e) => {
            checks.push(("Providers".to_string(), "Not configured".to_string()));
            issues.push(format!("Cannot set up inference providers: {}", e));
        }
    }

    let interpreter = &config.execution.interpreter;
    let reachable = tokio::time::timeout(
        Duration::from_secs(5),
        tokio::process::Command::new(interpreter)
            .arg("--version")
            .kill_on_drop(true)
            .output(),
    )
    .await;
    match reachable {
        Ok(Ok(output)) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout);
            let version = version.lines().next().unwrap_or_default().trim();
            let label = if version.is_empty() { "Available" } else { version };
            checks.push((format!("Interpreter {}", interpreter), label.to_string()));
        }
        Ok(Ok(_)) | Ok(Err(_)) | Err(_) => {
            checks.push((format!("Interpreter {}", interpreter), "Not found".to_string()));
            issues.push(format!(
                "Interpreter '{}' is not available on PATH",
                interpreter
            ));
        }
    }

    match format {
        OutputFormat::Text => {
            println!("Forge System Diagnostics");
            println!("========================");
            println!();
            println!("System Checks:");
            for (check, status) in &checks {
                println!("  {:<25} {}", format!("{}:", check), status);
            }
            println!();
            if issues.is_empty() {
                println!("✓ All checks passed!");
            } else {
                println!("⚠ Issues found:");
                println!();
                for (i, issue) in issues.iter().enumerate() {
                    println!("  {}. {}", i + 1, issue);
                }
            }
        }
        OutputFormat::Json => print_json(&json!({
            "checks": checks.iter().map(|(name, status)| {
                json!({
                    "name": name,
                    "status": status
                })
            }).collect::<Vec<_>>(),
            "issues": issues,
            "healthy": issues.is_empty()
        }))?,
    }

    Ok(())
}
