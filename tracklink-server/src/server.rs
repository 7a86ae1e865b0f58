//! TCP server implementation.

use crate::config::Config;
use crate::error::ServerError;
use crate::handler::MessageHandler;
use crate::metrics::Metrics;
use crate::session::{ConnectionSession, SessionEvent, SessionLimits};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracklink_core::{ConnectionHandle, DeviceStatus};
use tracklink_protocol::{AckKind, ProtocolRegistry};

/// Read buffer size per connection.
const READ_BUF_SIZE: usize = 1024;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Per-connection buffering limits.
    pub session: SessionLimits,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_connections", &self.max_connections)
            .field("session", &self.session)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], tracklink_protocol::DEFAULT_PORT)),
            idle_timeout: Duration::from_secs(300),
            max_connections: 10000,
            session: SessionLimits::default(),
            metrics: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Builds the server configuration from the loaded config file.
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            idle_timeout: config.network.idle_timeout(),
            max_connections: config.network.max_connections,
            session: SessionLimits {
                max_buffer_bytes: config.network.max_buffer_bytes,
                corrupt_frame_policy: config.protocol.corrupt_frame_policy,
            },
            metrics: None,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_session_limits(mut self, limits: SessionLimits) -> Self {
        self.session = limits;
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns whether metrics are enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub frames_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// TCP ingestion server for tracking terminals.
pub struct Server {
    config: ServerConfig,
    protocols: Arc<ProtocolRegistry>,
    handler: Arc<MessageHandler>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server.
    pub fn new(
        config: ServerConfig,
        protocols: Arc<ProtocolRegistry>,
        handler: Arc<MessageHandler>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            protocols,
            handler,
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and runs the server.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Runs the accept loop on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            "Server listening on {} (protocols: {})",
            listener.local_addr()?,
            self.protocols.names().join(", ")
        );

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                                if let Some(ref metrics) = self.config.metrics {
                                    metrics.connections_rejected_total.inc();
                                }
                                continue;
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
                            if let Some(ref metrics) = self.config.metrics {
                                metrics.connections_total.inc();
                                metrics.connections_active.inc();
                            }

                            let protocols = self.protocols.clone();
                            let handler = self.handler.clone();
                            let stats = self.stats.clone();
                            let config = self.config.clone();
                            let conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                Self::run_connection(
                                    tcp_stream,
                                    addr,
                                    protocols,
                                    handler,
                                    config.clone(),
                                    stats.clone(),
                                    conn_shutdown,
                                )
                                .await;

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                if let Some(ref metrics) = config.metrics {
                                    metrics.connections_active.dec();
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Owns one connection from accept to cleanup.
    async fn run_connection(
        mut stream: TcpStream,
        addr: SocketAddr,
        protocols: Arc<ProtocolRegistry>,
        handler: Arc<MessageHandler>,
        config: ServerConfig,
        stats: Arc<ServerStats>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        tracing::info!("Client connected: {}", addr);
        let handle = ConnectionHandle::new(addr);
        let mut session = ConnectionSession::new(handle.clone(), config.session);

        let result = Self::handle_connection(
            &mut stream,
            &mut session,
            &protocols,
            &handler,
            &config,
            &stats,
            &mut shutdown,
        )
        .await;

        let reason = match result {
            Ok(reason) => reason,
            Err(ref e) => {
                match e {
                    ServerError::Superseded | ServerError::ShuttingDown => {
                        tracing::debug!("[{}] Closing: {}", addr, e);
                    }
                    _ => {
                        tracing::warn!("[{}] Connection error: {}", addr, e);
                    }
                }
                stats.errors_total.fetch_add(1, Ordering::Relaxed);
                e.reason()
            }
        };

        session.close();
        handle.close();
        if let Some(device_id) = session.device_id() {
            let status = match result {
                Err(ref e) if e.is_device_fault() => DeviceStatus::Error,
                _ => DeviceStatus::Offline,
            };
            handler.devices().set_status(device_id, handle.id(), status);
        }
        handler.update_gauge_metrics();
        if let Some(ref metrics) = config.metrics {
            metrics.disconnects_total.with_label_values(&[reason]).inc();
        }

        if let Err(e) = stream.shutdown().await {
            tracing::debug!("[{}] Socket shutdown error: {}", addr, e);
        }

        if let Some(device_id) = session.device_id() {
            if handler.devices().unregister_connection(device_id, handle.id()) {
                tracing::info!("[{}] Device {} offline", addr, device_id);
            }
        }
        handler.update_gauge_metrics();
        tracing::info!(
            "Client disconnected: {} ({}, {} frames)",
            addr,
            reason,
            session.frames_decoded()
        );
    }

    /// Reads and handles frames until the connection ends.
    ///
    /// Returns the close reason for orderly closes.
    async fn handle_connection(
        stream: &mut TcpStream,
        session: &mut ConnectionSession,
        protocols: &ProtocolRegistry,
        handler: &MessageHandler,
        config: &ServerConfig,
        stats: &ServerStats,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<&'static str, ServerError> {
        let addr = session.handle().remote_addr();
        let handle = session.handle().clone();
        let mut buf = [0u8; READ_BUF_SIZE];

        loop {
            let idle_left = config.idle_timeout.saturating_sub(session.idle_duration());

            tokio::select! {
                result = stream.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!("[{}] Connection closed by client", addr);
                            return Ok("client_closed");
                        }
                        Ok(n) => {
                            tracing::trace!("[{}] Received {} bytes", addr, n);
                            session.extend(&buf[..n])?;
                        }
                        Err(e) => {
                            tracing::debug!("[{}] Read error: {}", addr, e);
                            return Err(ServerError::Io(e));
                        }
                    }
                }

                _ = tokio::time::sleep(idle_left) => {
                    if session.idle_duration() >= config.idle_timeout {
                        tracing::debug!("[{}] Idle timeout", addr);
                        return Ok("idle");
                    }
                    continue;
                }

                _ = handle.closed() => {
                    return Err(ServerError::Superseded);
                }

                _ = shutdown.recv() => {
                    tracing::debug!("[{}] Shutdown signal received", addr);
                    return Err(ServerError::ShuttingDown);
                }
            }

            Self::drain(stream, session, protocols, handler, config, stats).await?;
        }
    }

    /// Handles every complete frame in the session buffer.
    async fn drain(
        stream: &mut TcpStream,
        session: &mut ConnectionSession,
        protocols: &ProtocolRegistry,
        handler: &MessageHandler,
        config: &ServerConfig,
        stats: &ServerStats,
    ) -> Result<(), ServerError> {
        let addr = session.handle().remote_addr();

        loop {
            let event = match session.next_event(protocols) {
                Ok(Some(event)) => event,
                Ok(None) => return Ok(()),
                Err(e) => {
                    Self::record_decode_error(config, e.reason());
                    return Err(e);
                }
            };

            let message = match event {
                SessionEvent::Message(message) => message,
                SessionEvent::Skipped(e) => {
                    tracing::warn!("[{}] Skipped undecodable frame: {}", addr, e);
                    Self::record_decode_error(config, e.reason());
                    continue;
                }
                SessionEvent::Resynced { discarded, error } => {
                    tracing::warn!(
                        "[{}] Discarded {} bytes after corrupt frame: {}",
                        addr,
                        discarded,
                        error
                    );
                    Self::record_decode_error(config, error.reason());
                    continue;
                }
            };

            stats.frames_total.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "[{}] {} serial={} device={}",
                addr,
                message.kind,
                message.serial,
                message.device_id.as_deref().unwrap_or("-")
            );

            match handler.handle(session, &message).await {
                Ok(Some(ack)) => Self::write_ack(stream, session, ack, message.serial).await?,
                Ok(None) => {}
                Err(e @ ServerError::LoginRejected { .. }) => {
                    Self::write_ack(stream, session, AckKind::LoginRejected, message.serial)
                        .await?;
                    return Err(e);
                }
                Err(e) if !e.is_connection_fatal() => {
                    tracing::warn!("[{}] {} not processed: {}", addr, message.kind, e);
                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn write_ack(
        stream: &mut TcpStream,
        session: &ConnectionSession,
        ack: AckKind,
        serial: u16,
    ) -> Result<(), ServerError> {
        let Some(frame) = session.codec().and_then(|codec| codec.encode_ack(ack, serial)) else {
            return Ok(());
        };
        tracing::trace!(
            "[{}] Writing {:?} ack ({} bytes)",
            session.handle().remote_addr(),
            ack,
            frame.len()
        );
        stream.write_all(&frame).await?;
        Ok(())
    }

    fn record_decode_error(config: &ServerConfig, reason: &str) {
        if let Some(ref metrics) = config.metrics {
            metrics.decode_errors_total.with_label_values(&[reason]).inc();
        }
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}
