//! keycustody - server-side key and session custody for Signal-protocol
//! end-to-end encryption.
//!
//! Persists, caches, rotates and trust-manages the key material the protocol
//! engine needs: identity keys, signed and one-time pre-keys, remote identity
//! trust and per-peer session state. The engine talks to [`store`]; operators
//! and clients go through [`commands`].

pub mod cache;
pub mod commands;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod models;
pub mod scheduler;
pub mod state;
pub mod store;

use anyhow::Context;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Run the service until Ctrl-C
pub async fn run() -> anyhow::Result<()> {
    let config = config::Config::load().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_filter.clone().into()),
        )
        .init();

    tracing::info!("Starting keycustody");

    let shared_state = state::create_shared_state(config)
        .await
        .context("Failed to initialize application state")?;
    tracing::info!("Application state initialized successfully");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = if shared_state.config.scheduler.enabled {
        Some(shared_state.scheduler.clone().spawn(shutdown_rx))
    } else {
        tracing::info!("Lifecycle scheduler disabled");
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");

    // Receivers may already be gone if the scheduler is disabled
    let _ = shutdown_tx.send(true);
    if let Some(handle) = scheduler {
        if let Err(e) = handle.await {
            tracing::error!("Lifecycle scheduler task failed: {}", e);
        }
    }

    shared_state.repo.close().await;
    tracing::info!("keycustody stopped");
    Ok(())
}
