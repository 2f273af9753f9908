//! tether-api server binary.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tether_api::{handlers::events::bridge_worker_events, router, AppState};
use tether_core::{defaults, EventBus, Repositories};
use tether_db::{Database, MemoryStore, PoolConfig};
use tether_jobs::{
    DetectionService, HttpDetector, JobReaper, ReaperConfig, WorkerBuilder, WorkerConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables daily-rotated file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors
    //   RUST_LOG    - standard env filter (default: "tether_api=debug,tether_jobs=info,tower_http=info")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "tether_api=debug,tether_jobs=info,tower_http=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref path) = log_file {
        let path = std::path::Path::new(path);
        let file_dir = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("tether-api.log");
        let (non_blocking, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(file_dir, file_name));

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(defaults::SERVER_PORT);

    let repos = open_storage().await?;
    let event_bus = Arc::new(EventBus::default());
    let service = DetectionService::new(repos.clone(), event_bus.clone());

    // Worker runs only when a detector is configured.
    let worker_config = WorkerConfig::from_env();
    let worker_handle = match HttpDetector::from_env()? {
        Some(detector) if worker_config.enabled => {
            info!(detector_url = %detector.config().url, "Starting detection worker");
            let handle = WorkerBuilder::new(repos.clone())
                .with_config(worker_config)
                .with_detector(detector)
                .build()?
                .start();
            tokio::spawn(bridge_worker_events(handle.events(), event_bus.clone()));
            Some(handle)
        }
        Some(_) => {
            info!("Detection worker disabled");
            None
        }
        None => {
            warn!("DETECTOR_URL not set, detection jobs will queue without a worker");
            None
        }
    };

    let reaper = JobReaper::new(
        repos.jobs.clone(),
        event_bus.clone(),
        ReaperConfig::from_env(),
    );
    let reaper_handle = reaper.start();

    let app = router(AppState::new(service));

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = worker_handle {
        handle.shutdown().await?;
    }
    if let Some(handle) = reaper_handle {
        handle.shutdown().await?;
    }
    info!("Server stopped");
    Ok(())
}

/// Select the storage backend from `STORAGE` (`postgres` by default).
async fn open_storage() -> anyhow::Result<Repositories> {
    let storage = std::env::var("STORAGE").unwrap_or_else(|_| "postgres".to_string());
    match storage.as_str() {
        "memory" => {
            warn!("Using in-memory storage, state is lost on restart");
            Ok(MemoryStore::new().repositories())
        }
        "postgres" => {
            let database_url = std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/tether".to_string());
            info!("Connecting to database...");
            let db = Database::connect_with_config(&database_url, PoolConfig::from_env()).await?;
            info!("Running database migrations...");
            db.migrate().await?;
            info!("Database ready");
            Ok(db.repositories())
        }
        other => anyhow::bail!("unknown STORAGE backend '{}', expected postgres or memory", other),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
