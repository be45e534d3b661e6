use std::time::Duration;

use anyhow::Result;
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use greenhouse_control::{
    api::{self, AppState},
    config::Config,
    control::{Actuator, ControlMode, ControlService},
    db,
    reading_cache::ReadingCache,
    retention::RetentionSweeper,
    sensors::{SensorService, SimulatedSensors},
    store::{MemoryStore, PgStore, Stores},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env (ignore error if file absent, env vars may be set externally)
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    let retry = config.retry_policy();

    let stores = match &config.database_url {
        Some(url) => {
            let pool = db::create_pool(url, retry.timeout).await?;
            db::run_migrations(&pool).await?;
            info!("Database ready");
            Stores::postgres(PgStore::new(pool))
        }
        None => {
            warn!("DATABASE_URL not set; keeping all state in memory");
            Stores::memory(MemoryStore::new())
        }
    };

    let cache = ReadingCache::new();
    let mode = ControlMode::load(stores.mode.clone(), retry).await;

    if !Actuator::new(stores.devices.clone(), retry).initialize().await {
        warn!("Some devices could not be initialised; continuing");
    }

    let cancel = CancellationToken::new();
    let mut workers = Vec::new();

    {
        let service = SensorService::new(
            stores.samples.clone(),
            cache.clone(),
            Box::new(SimulatedSensors::new()),
            config.greenhouse_id,
            retry,
        );
        let interval = Duration::from_secs(config.sample_interval_secs);
        workers.push(tokio::spawn(service.run(interval, cancel.child_token())));
    }

    {
        let control = ControlService::new(stores.clone(), cache.clone(), mode.clone(), config.greenhouse_id, retry);
        let interval = Duration::from_secs(config.control_interval_secs);
        workers.push(tokio::spawn(control.run(interval, cancel.child_token())));
    }

    {
        let sweeper = RetentionSweeper::new(
            stores.samples.clone(),
            config.retention_days,
            config.retention_batch_size,
            retry,
        );
        let interval = Duration::from_secs(config.retention_check_interval_secs);
        workers.push(tokio::spawn(sweeper.run(interval, cancel.child_token())));
    }

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "HTTP server listening");

    let state = AppState { stores, cache, mode };
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let every loop finish its current iteration before exiting.
    cancel.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            error!(error = %e, "Background task ended abnormally");
        }
    }
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
