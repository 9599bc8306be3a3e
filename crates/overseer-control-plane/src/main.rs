//! Overseer Control Plane Server

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use overseer_control_plane::metrics::collect_metrics;
use overseer_control_plane::scanner::{spawn_scanner, SystemProbe};
use overseer_control_plane::store::Snapshot;
use overseer_control_plane::{AppState, Config, InMemoryStore};
use overseer_core::{EventName, EventPayload};

/// Overseer orchestration control plane.
#[derive(Parser, Debug)]
#[command(name = "overseer", about = "Overseer orchestration control plane")]
struct Args {
    /// Path to a JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON snapshot of tasks, agents and sessions to load at startup
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Override the maximum number of concurrently working agents
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Override the command used to launch agents
    #[arg(long)]
    launcher_command: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    // Load config
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(max_concurrent) = args.max_concurrent {
        config.max_concurrent = max_concurrent;
    }
    if let Some(command) = args.launcher_command {
        config.launcher.command = Some(command);
    }
    config.validate()?;

    if config.launcher.command.is_none() {
        warn!("No launcher command configured - every launch will fail");
    }

    // Load seed records
    let store = match &args.seed {
        Some(path) => {
            let snapshot = Snapshot::from_file(path)?;
            info!(
                seed = %path.display(),
                tasks = snapshot.tasks.len(),
                agents = snapshot.agents.len(),
                sessions = snapshot.sessions.len(),
                "Seed snapshot loaded"
            );
            InMemoryStore::from_snapshot(snapshot).await
        }
        None => InMemoryStore::new(),
    };

    // Create shared state
    let state = AppState::new(config, Arc::new(store));
    state.attach();

    info!(
        max_concurrent = state.config.max_concurrent,
        "Starting Overseer control plane"
    );

    // Start scanners
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles: Vec<_> = state
        .scanners(Arc::new(SystemProbe::new()))
        .into_iter()
        .map(|scanner| spawn_scanner(scanner, shutdown_rx.clone()))
        .collect();

    state.bus.publish(EventName::SystemStartup, EventPayload::Empty);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    state.bus.publish(EventName::SystemShutdown, EventPayload::Empty);
    shutdown_tx.send(true).ok();
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Scanner task ended abnormally");
        }
    }

    match collect_metrics(&state).await {
        Ok(metrics) => info!("Final metrics:\n{metrics}"),
        Err(e) => warn!(error = %e, "Failed to collect final metrics"),
    }

    info!("Overseer control plane stopped");
    Ok(())
}
