//! fabric control plane
//!
//! Serves the REST API and runs the job runner, the GPU lease synchronizer
//! and the worker heartbeats until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fabric_control_plane::{
    api,
    config::{Config, FabricConfig, StoreBackend},
    db::{Database, MemoryStore, Store},
    jobs::{JobRunner, Registry, RunnerConfig},
    service::Core,
    state::AppState,
    subsystems::{harbor_http::HarborClient, Subsystems},
    workers::{self, GpuSyncConfig, GpuSynchronizer, StatusReporter},
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

async fn open_store(config: &Config) -> Result<Arc<dyn Store>> {
    match config.store {
        StoreBackend::Memory => {
            warn!("Using the in-memory store; nothing survives a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Postgres => {
            let db = match Database::connect(&config.database).await {
                Ok(db) => db,
                Err(e) => {
                    error!(error = %e, "Failed to connect to database");
                    return Err(e.into());
                }
            };
            if config.dev_mode {
                info!("Running database migrations (dev mode)");
                db.run_migrations().await?;
            }
            Ok(Arc::new(db.store()))
        }
    }
}

fn subsystems(config: &Config, fabric: &FabricConfig) -> Result<Subsystems> {
    let (mut subsystems, _) = Subsystems::simulated();
    if config.dev_mode {
        info!("Dev mode: every subsystem is simulated");
    } else {
        subsystems.harbor = Arc::new(HarborClient::new(&fabric.registry)?);
        info!(registry = %fabric.registry.url, "Registry client configured");
    }
    Ok(subsystems)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to FABRIC_LOG_LEVEL.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fabric control plane");
    info!(
        listen_addr = %config.listen_addr,
        store = ?config.store,
        job_workers = config.job_workers,
        dev_mode = config.dev_mode,
        "Configuration loaded"
    );

    let fabric = Arc::new(FabricConfig::load(config.config_file.as_deref())?);
    let store = open_store(&config).await?;
    let core = Arc::new(Core::new(store, subsystems(&config, &fabric)?, fabric.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runner = Arc::new(JobRunner::new(
        core.clone(),
        Registry::new(&fabric.jobs),
        RunnerConfig::from_settings(&fabric.jobs, config.job_workers),
    ));
    let runner_handle = tokio::spawn(runner.run(shutdown_rx.clone()));

    let gpu_sync = GpuSynchronizer::new(
        core.clone(),
        GpuSyncConfig {
            interval: config.gpu_sync_interval,
        },
    );
    let gpu_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { gpu_sync.run(shutdown_rx).await }
    });

    let reporter = StatusReporter::new(
        core.clone(),
        vec![workers::JOB_RUNNER, workers::GPU_SYNCHRONIZER],
        HEARTBEAT_INTERVAL,
    );
    let status_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { reporter.run(shutdown_rx).await }
    });

    let app = api::create_router(AppState::new(core));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);

    // Deletes may be draining for longer; their jobs are reset on next start.
    if tokio::time::timeout(shutdown_timeout, runner_handle).await.is_err() {
        warn!("Job runner did not shut down in time");
    }
    if tokio::time::timeout(shutdown_timeout, gpu_handle).await.is_err() {
        warn!("Gpu lease synchronizer did not shut down in time");
    }
    if tokio::time::timeout(shutdown_timeout, status_handle).await.is_err() {
        warn!("Status reporter did not shut down in time");
    }

    info!("Control plane shutdown complete");
    Ok(())
}
