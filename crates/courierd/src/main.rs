//! courierd — Courier server daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use courier_core::config::CourierConfig;
use courier_core::keystore::KeyStore;
use courier_services::{ChunkManager, FailurePolicy};
use courierd::ServerHandler;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = CourierConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = CourierConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        CourierConfig::default()
    });

    // Identity
    let keystore = KeyStore::new(&config.identity.keystore_root);
    let identity = keystore
        .identity(&config.identity.name)
        .with_context(|| format!("failed to load identity {:?}", config.identity.name))?;
    tracing::info!(
        identity = identity.name(),
        public_key = %identity.public_key_string(),
        "identity ready"
    );

    // Shared state
    let chunks = Arc::new(ChunkManager::new(Duration::from_secs(config.chunks.group_ttl_secs)));
    let policy = FailurePolicy::from_strict(config.codec.strict);
    if policy == FailurePolicy::Lenient {
        tracing::warn!("lenient codec, undecodable bodies are passed through");
    }

    let settings = config.socket_settings(identity.name());
    let server = ServerHandler::bind(&settings, identity.clone(), policy, chunks.clone())
        .await
        .context("failed to start server")?;
    tracing::info!(
        addr = %server.local_addr()?,
        chunk_size = settings.chunk_size,
        timeout_ms = config.network.timeout_ms,
        "courierd starting"
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let sweep_task = tokio::spawn(chunks.sweep_loop(
        Duration::from_secs(config.chunks.sweep_interval_secs.max(1)),
        shutdown_tx.subscribe(),
    ));
    let server_task = tokio::spawn(server.run(shutdown_tx.subscribe()));

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = server_task        => tracing::error!("server exited: {:?}", r),
        r = sweep_task         => tracing::error!("chunk sweeper exited: {:?}", r),
    }

    Ok(())
}
