//! civicline application binary - composition root.
//!
//! 1. Parse CLI flags and load configuration from TOML
//! 2. Initialize tracing
//! 3. Open the SQLite conversation store and the catalog file
//! 4. Wire providers and build the orchestrator
//! 5. Start the idle sweep and catalog refresh loops
//! 6. Serve the axum API until Ctrl-C

mod cli;
mod providers;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;

use civicline_api::AppState;
use civicline_core::CivicConfig;
use civicline_engine::Orchestrator;
use civicline_storage::{FileCatalog, SqliteStore};

use crate::cli::{expand_home, CliArgs};

/// Periodically move stale conversations to idle.
async fn idle_sweep_loop(
    orchestrator: Arc<Orchestrator>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tracing::info!(interval_secs = every.as_secs(), "Idle sweep started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match orchestrator.sweep_idle().await {
                    Ok(0) => {}
                    Ok(count) => tracing::debug!(count, "Conversations moved to idle"),
                    Err(e) => tracing::warn!(error = %e, "Idle sweep failed"),
                }
            }
            _ = shutdown.changed() => {
                tracing::info!("Idle sweep stopped");
                return;
            }
        }
    }
}

/// Periodically reload the catalog file.
async fn catalog_refresh_loop(
    catalog: Arc<FileCatalog>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    // The first tick fires immediately; the catalog was just loaded.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let catalog = Arc::clone(&catalog);
                match tokio::task::spawn_blocking(move || catalog.refresh()).await {
                    Ok(Ok(count)) => tracing::debug!(count, "Catalog refreshed"),
                    Ok(Err(e)) => tracing::warn!(error = %e, "Catalog refresh failed, keeping previous snapshot"),
                    Err(e) => tracing::warn!(error = %e, "Catalog refresh task panicked"),
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config.
    let config_file = args.resolve_config_path();
    let config = CivicConfig::load_or_default(&config_file);

    // Tracing.
    let log_level = args.resolve_log_level(&config.general.log_level);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .init();

    tracing::info!("Starting civicline v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(path = %config_file.display(), "Configuration resolved");

    if args.write_config {
        config.save(&config_file)?;
        return Ok(());
    }
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "Invalid configuration");
        return Err(e.into());
    }

    // Storage.
    let data_dir = args.resolve_data_dir(&config.general.data_dir);
    let db_path = data_dir.join("civicline.db");
    let store = Arc::new(SqliteStore::open(&db_path)?);
    tracing::info!(path = %db_path.display(), "SQLite database opened");

    // Catalog.
    let catalog_path = expand_home(&config.providers.catalog_path);
    let catalog = Arc::new(FileCatalog::open(&catalog_path)?);

    // Providers and engine.
    let providers = providers::build_providers(&config.providers, catalog.clone())?;
    let orchestrator = Arc::new(Orchestrator::new(&config, store, providers));
    tracing::info!(
        languages = orchestrator.languages().len(),
        "Conversation engine ready"
    );

    // === Background tasks ===

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if config.session.sweep_interval_secs > 0 {
        tokio::spawn(idle_sweep_loop(
            Arc::clone(&orchestrator),
            Duration::from_secs(config.session.sweep_interval_secs),
            shutdown_rx.clone(),
        ));
    }
    if let Some(every) = providers::catalog_refresh_interval(&config.providers) {
        tokio::spawn(catalog_refresh_loop(catalog, every, shutdown_rx.clone()));
    }

    // === API server ===

    let port = args.resolve_port(config.general.port);
    let state = AppState::new(orchestrator);
    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        }
        tracing::info!("Shutdown requested");
        let _ = shutdown_tx.send(true);
    };

    if let Err(e) = civicline_api::start_server(&args.host, port, state, shutdown).await {
        tracing::error!(host = %args.host, port, error = %e, "API server failed");
        tracing::error!("Try: CIVICLINE_PORT={} civicline", port.saturating_add(1));
        return Err(e.into());
    }

    Ok(())
}
