//! hostsched scheduler service.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hostsched_scheduler::{
    api, config,
    manager::SchedulerManager,
    source::{CandidateSource, MemorySource, PgCandidateSource, SeedData},
    state::AppState,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

async fn candidate_source(config: &config::Config) -> Result<Arc<dyn CandidateSource>> {
    if config.dev_mode {
        let source = match &config.seed_file {
            Some(path) => {
                info!(path = %path.display(), "Seeding in-memory candidate source");
                MemorySource::from_seed(SeedData::from_file(path)?)?
            }
            None => {
                warn!("Dev mode without HOSTSCHED_SEED_FILE, starting with no candidates");
                MemorySource::new()
            }
        };
        return Ok(Arc::new(source));
    }

    let source = PgCandidateSource::connect(&config.database)
        .await
        .context("failed to connect to inventory database")?;
    info!("Inventory database connection established");
    Ok(Arc::new(source))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to HOSTSCHED_LOG_LEVEL.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting hostsched");
    info!(listen_addr = %config.listen_addr, dev_mode = config.dev_mode, "Configuration loaded");

    let source = candidate_source(&config).await?;
    let (scheduler, workers) = SchedulerManager::new(config.scheduler.clone(), source)?;
    if let Err(e) = scheduler.load().await {
        error!(error = %e, "Initial candidate load failed");
        return Err(e.into());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handles = workers.spawn(&shutdown_rx);

    let app = api::create_router(AppState::new(scheduler.clone()));
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
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

    scheduler.shutdown();
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);
    for handle in worker_handles {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, handle).await {
            warn!(error = %e, "Worker did not shut down in time");
        }
    }

    info!("hostsched shutdown complete");
    Ok(())
}
