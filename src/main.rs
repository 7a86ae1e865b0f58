//! tracklink - GPS terminal ingestion server
//!
//! Accepts raw TCP connections from tracking terminals, decodes their frames
//! and forwards location and alarm events to a job queue.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;
use tracklink_core::DeviceRegistry;
use tracklink_protocol::{Gt06Codec, ProtocolRegistry};
use tracklink_server::metrics::run_metrics_server;
use tracklink_server::{ChannelQueue, Config, Job, MessageHandler, Metrics, Server, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if TRACKLINK_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("TRACKLINK_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    tracing::info!("Starting tracklink server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!(
        "  Limits: {} connections, {}s idle timeout, {} byte buffers",
        config.network.max_connections,
        config.network.idle_timeout_secs,
        config.network.max_buffer_bytes
    );
    tracing::info!(
        "  Corrupt frames: {:?}, ack checksum: {:?}",
        config.protocol.corrupt_frame_policy,
        config.protocol.ack_checksum
    );
    match config.devices.allowlist.len() {
        0 => tracing::info!("  Device allowlist: open"),
        n => tracing::info!("  Device allowlist: {} device(s)", n),
    }

    let protocols = Arc::new(ProtocolRegistry::with_defaults(
        Gt06Codec::new().with_ack_checksum(config.protocol.ack_checksum),
    ));
    let devices = Arc::new(DeviceRegistry::new());
    let mut handler = MessageHandler::from_config(devices.clone(), &config);
    let mut server_config = ServerConfig::from_config(&config);

    // Forwarding
    let consumer_handle = if config.forwarding.enabled {
        let (queue, jobs) = ChannelQueue::bounded(config.forwarding.queue_capacity);
        handler = handler.with_queue(Arc::new(queue));
        tracing::info!(
            "  Forwarding: enabled (capacity {}, enqueue timeout {}ms)",
            config.forwarding.queue_capacity,
            config.forwarding.enqueue_timeout_ms
        );
        Some(tokio::spawn(consume_jobs(jobs)))
    } else {
        tracing::info!("  Forwarding: disabled");
        None
    };

    // Metrics
    let (metrics_shutdown, _) = broadcast::channel(1);
    let metrics_handle = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        handler = handler.with_metrics(metrics.clone());
        server_config = server_config.with_metrics(metrics.clone());

        let addr = config.metrics.bind_addr;
        let shutdown_rx = metrics_shutdown.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown_rx).await {
                tracing::error!("Metrics server error: {}", e);
            }
        }))
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    let server = Arc::new(Server::new(server_config, protocols, Arc::new(handler)));

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    let shutdown_metrics = metrics_shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
        let _ = shutdown_metrics.send(());
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }
    if let Some(handle) = consumer_handle {
        handle.abort();
    }

    let stats = server.stats();
    tracing::info!(
        "Server stopped ({} connections, {} frames, {} devices registered)",
        stats.connections_total.load(Ordering::Relaxed),
        stats.frames_total.load(Ordering::Relaxed),
        devices.len()
    );
    Ok(())
}

/// Drains forwarded jobs into the log.
///
/// Deployments that deliver jobs elsewhere embed the server crate and supply
/// their own `JobQueue`.
async fn consume_jobs(mut jobs: mpsc::Receiver<Job>) {
    while let Some(job) = jobs.recv().await {
        tracing::info!(
            "Job {} ({}, priority {}) for device {}",
            job.id,
            job.kind.as_str(),
            job.priority,
            job.device_id
        );
        match serde_json::to_string(&job.payload) {
            Ok(payload) => tracing::debug!("Job {} payload: {}", job.id, payload),
            Err(e) => tracing::warn!("Job {} payload not serializable: {}", job.id, e),
        }
    }
    tracing::debug!("Job queue closed");
}
