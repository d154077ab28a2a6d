mod config;
mod ipc;
mod server_state;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use rekindle_keys::{KeyService, SchedulerConfig, SqliteKeyStore};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

use config::{Args, LogFormat};
use server_state::ServerState;

fn init_tracing(args: &Args) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match args.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args);
    tracing::info!("rekindle-keyserver starting");

    if let Some(parent) = std::path::Path::new(&args.db_path).parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create db dir {}", parent.display()))?;
    }

    let policy = args.load_policy()?;
    let store = SqliteKeyStore::open(&args.db_path)
        .with_context(|| format!("failed to open key database {}", args.db_path))?;

    let keys = Arc::new(KeyService::new(
        Arc::new(store),
        policy,
        SchedulerConfig::default(),
    ));
    let state = Arc::new(ServerState {
        keys: Arc::clone(&keys),
        started_at: ipc::timestamp_now(),
    });

    // Background key maintenance
    let (maintenance_shutdown_tx, maintenance_shutdown_rx) = watch::channel(false);
    let maintenance = if args.no_scheduler {
        tracing::info!("key maintenance disabled");
        Vec::new()
    } else {
        keys.scheduler().spawn(&maintenance_shutdown_rx)
    };

    // Start the IPC listener
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
    let ipc_state = Arc::clone(&state);
    let socket = args.socket_path.clone();
    tokio::spawn(async move {
        ipc::start_ipc_listener(&socket, ipc_state, shutdown_tx).await;
    });

    tracing::info!(socket = %args.socket_path, db = %args.db_path, "rekindle-keyserver ready");

    tokio::select! {
        _ = shutdown_rx.recv() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "failed to listen for ctrl-c");
            }
        }
    }

    tracing::info!("rekindle-keyserver shutting down");

    // Stop maintenance loops; a job already running finishes first
    let _ = maintenance_shutdown_tx.send(true);
    for handle in maintenance {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "maintenance task ended abnormally");
        }
    }

    // Clean up socket file
    let _ = std::fs::remove_file(&args.socket_path);

    tracing::info!("rekindle-keyserver stopped");
    Ok(())
}
