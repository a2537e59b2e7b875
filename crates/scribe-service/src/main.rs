use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;

use scribe_core::config::ConfigStore;
use scribe_service::telemetry::{init_logging, LogFormat};
use scribe_service::Engine;

#[derive(Parser, Debug)]
#[command(author, version, about = "Scribe rule-driven file automation engine", long_about = None)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, value_enum, global = true, default_value_t = LogFormat::Json)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine until SIGINT/SIGTERM (the default)
    Run,
    /// Load and validate a configuration, then print its rules
    Validate,
    /// Query a running engine's health endpoint
    Health {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_command(require_config(cli.config)?, cli.log_format).await,
        Commands::Validate => validate_command(&require_config(cli.config)?),
        Commands::Health { host, port } => {
            tokio::task::spawn_blocking(move || health_command(&host, port)).await?
        }
    }
}

fn require_config(config: Option<PathBuf>) -> Result<PathBuf> {
    config.ok_or_else(|| anyhow!("--config <path> is required"))
}

/// The subscriber must exist before the config store logs its first event,
/// so the level is read straight from the file here.
fn peek_log_level(path: &Path) -> String {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str::<Value>(&text).ok())
        .and_then(|v| v["engine_settings"]["log_level"].as_str().map(str::to_string))
        .unwrap_or_else(|| "info".to_string())
}

async fn run_command(config: PathBuf, format: LogFormat) -> Result<()> {
    init_logging(&peek_log_level(&config), format)?;

    let engine = tokio::task::spawn_blocking(move || -> Result<Arc<Engine>> {
        let engine = Arc::new(Engine::from_path(&config)?);
        engine.start()?;
        Ok(engine)
    })
    .await??;

    shutdown_signal().await?;
    info!("shutdown signal received");
    tokio::task::spawn_blocking(move || engine.stop()).await?;
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = signal::ctrl_c() => res?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    signal::ctrl_c().await?;
    Ok(())
}

fn validate_command(config: &Path) -> Result<()> {
    let store = ConfigStore::load(config)
        .with_context(|| format!("invalid config {}", config.display()))?;
    let snapshot = store.current();
    let rules: Vec<Value> = snapshot
        .config
        .rules
        .iter()
        .map(|rule| {
            json!({
                "id": rule.id,
                "name": rule.name,
                "enabled": rule.enabled,
                "file_glob": rule.file_glob,
                "trigger_pattern": rule.trigger_pattern,
                "actions": rule.actions.iter().map(|a| a.action_type.as_str()).collect::<Vec<_>>(),
                "circuit_breaker": rule.error_handling.circuit_breaker,
            })
        })
        .collect();
    let summary = json!({
        "valid": true,
        "config_version": snapshot.version(),
        "watch_roots": snapshot.watch_roots(),
        "rules": rules,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn health_command(host: &str, port: u16) -> Result<()> {
    let url = format!("http://{host}:{port}/health");
    let response = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?
        .get(&url)
        .send()
        .with_context(|| format!("failed to reach {url}"))?;
    let status = response.status();
    let body = response.text()?;
    println!("{body}");
    if !status.is_success() {
        bail!("health check returned {status}");
    }
    Ok(())
}
