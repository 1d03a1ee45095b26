// Forge code-generation agent
// Main entry point for the forge binary

use clap::Parser;
use forge_engine::cli::{Cli, Command};
use forge_engine::config::Config;
use forge_engine::handlers::{
    handle_doctor, handle_errors, handle_history, handle_result, handle_rollback, handle_run,
    handle_similar, handle_status, handle_versions, OutputFormat,
};
use forge_engine::telemetry::{init_telemetry, init_telemetry_with_level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Load configuration (or use custom path if provided)
    let loaded = match &cli.config {
        Some(config_path) => Config::load_from_path(config_path),
        None => Config::load_or_create(),
    };
    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            init_telemetry();
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // --log wins over the config file; RUST_LOG wins over both
    let level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry_with_level(level);

    tracing::info!("Forge v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Run { task } => {
            tracing::info!("Executing task: {}", task);
            handle_run(task, &config, format).await
        }

        Command::Status { task_id } => handle_status(task_id, &config, format).await,

        Command::Result { task_id } => handle_result(task_id, &config, format).await,

        Command::History { limit } => {
            tracing::info!("Showing last {} tasks", limit);
            handle_history(limit, &config, format).await
        }

        Command::Versions { task_id } => handle_versions(task_id, &config, format).await,

        Command::Rollback { task_id, step_id } => {
            tracing::info!("Rolling back task {} to step {}", task_id, step_id);
            handle_rollback(task_id, step_id, &config, format).await
        }

        Command::Errors { limit } => handle_errors(limit, &config, format).await,

        Command::Similar { text, k } => handle_similar(text, k, &config, format).await,

        Command::Doctor => {
            tracing::info!("Running diagnostics...");
            handle_doctor(&config, format).await
        }
    }
}
