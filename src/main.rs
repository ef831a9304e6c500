mod config;
mod error;
mod feed;
mod filter;
mod listings;
mod logfile;
mod scheduler;
mod server;
mod storage;

use anyhow::Context;
use config::ConfigManager;
use futures::StreamExt;
use listings::MarketplaceScraper;
use scheduler::{Scheduler, SchedulerSettings};
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use signal_hook_tokio::Signals;
use std::{path::PathBuf, sync::Arc, time::Duration};
use storage::{AdStore, JsonFileBackend};
use tracing_subscriber::{EnvFilter, prelude::*};

const DEFAULT_LOG_FILTER: &str = "marketplace_rss=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    //
    // Load configuration. We need it before logging, as it names the log file.
    let config_path: PathBuf = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CONFIG_FILE").ok())
        .unwrap_or_else(|| "config.json".to_string())
        .into();

    let config = config::load(&config_path)
        .await
        .with_context(|| format!("Failed to load config file {}", config_path.display()))?;

    init_logging(&config.log_filename);
    tracing::info!("Starting marketplace-rss");

    let config = Arc::new(ConfigManager::new(config_path, config));
    let current = config.current();
    tracing::info!(
        "Configuration loaded from {}: {} URLs, refreshing every {} minutes",
        config.path().display(),
        current.url_filters.len(),
        current.refresh_interval_minutes
    );

    //
    // Initialize components.
    let settings = SchedulerSettings::default();
    let store = AdStore::open(JsonFileBackend::new(&current.database_name))
        .with_context(|| format!("Failed to open ad store {}", current.database_name))?;
    let scraper = MarketplaceScraper::new(settings.call_timeout)
        .context("Failed to initialize the scraper")?;
    let scheduler = Scheduler::new(
        Arc::new(scraper),
        store.clone(),
        config.subscribe(),
        settings.clone(),
    );

    //
    // Spawn our scheduler task.
    let scheduler_state = scheduler.state();
    let (scheduler_stop, scheduler_stop_recv) = tokio::sync::oneshot::channel::<()>();
    let mut scheduler_handle = tokio::spawn(scheduler.run(scheduler_stop_recv));

    //
    // Launch an HTTP server to serve the feed and the config editor.
    let app = server::create_router(server::AppState {
        store: store.clone(),
        config: config.clone(),
        retention: settings.retention,
    });
    let addr = format!("{}:{}", current.server_ip, current.server_port);

    tracing::info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Server failed to bind to given address")?;

    let (server_stop, server_stop_recv) = tokio::sync::oneshot::channel::<()>();
    let mut server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_stop_recv.await;
            })
            .await
    });

    //
    // Handle signals.
    let mut signals =
        Signals::new([SIGTERM, SIGINT, SIGQUIT]).context("Failed to register signal handlers")?;

    // Sends a message to shutdown_recv if any of the signals are received.
    let (shutdown_send, shutdown_recv) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        if let Some(signal) = signals.next().await {
            tracing::debug!("Received signal {signal}");
            let _ = shutdown_send.send(());
        }
    });

    //
    // Wait for a signal, or for one of the tasks to exit prematurely (scheduler, http server);
    tokio::select! {
        _ = shutdown_recv => tracing::info!("Received stop signal, shutting down"),
        _ = &mut server_handle => tracing::error!("HTTP server stopped unexpectedly, shutting down"),
        _ = &mut scheduler_handle => tracing::error!("Scheduler stopped unexpectedly, shutting down"),
    }

    let _ = scheduler_stop.send(());
    let _ = server_stop.send(());
    let wind_down = async {
        if !scheduler_handle.is_finished() {
            let _ = scheduler_handle.await;
        }
        if !server_handle.is_finished() {
            let _ = server_handle.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(10), wind_down)
        .await
        .is_err()
    {
        tracing::warn!("Tasks did not stop in time");
    }
    tracing::debug!("Scheduler state at exit: {:?}", *scheduler_state.borrow());

    // Whatever the last cycle recorded should survive the restart.
    if let Err(error) = store.commit().await {
        tracing::error!("Failed to persist ads on shutdown: {error}");
    }

    Ok(())
}

/// Console logging, plus a rotated plain-text log file when it can be opened.
///
/// `LOG_LEVEL` takes a bare level (scoped to this crate) or full filter directives.
fn init_logging(log_filename: &str) {
    let env_filter = match std::env::var("LOG_LEVEL") {
        Ok(level) if !level.trim().is_empty() => {
            let level = level.trim().to_lowercase();
            let directives = match level.as_str() {
                "warning" => "marketplace_rss=warn".to_string(),
                "critical" => "marketplace_rss=error".to_string(),
                "trace" | "debug" | "info" | "warn" | "error" => format!("marketplace_rss={level}"),
                _ => level,
            };
            EnvFilter::try_new(directives).unwrap_or_else(|_| DEFAULT_LOG_FILTER.into())
        }
        _ => DEFAULT_LOG_FILTER.into(),
    };

    let mut log_error = None;
    let file_layer =
        match logfile::RotatingFile::open(log_filename, logfile::MAX_LOG_BYTES, logfile::LOG_BACKUPS) {
            Ok(file) => Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            ),
            Err(error) => {
                log_error = Some(error);
                None
            }
        };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    if let Some(error) = log_error {
        tracing::warn!("Logging to console only, cannot open {log_filename}: {error}");
    }
}
