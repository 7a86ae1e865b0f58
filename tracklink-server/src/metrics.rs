//! Prometheus metrics for the tracklink server.
//!
//! This module provides:
//! - Metrics registry with counters, gauges, and histograms
//! - HTTP server to expose metrics at `/metrics` endpoint

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Message handling duration buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0];

/// Prometheus metrics for the ingestion server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total connections accepted.
    pub connections_total: Counter,
    /// Currently active connections.
    pub connections_active: Gauge,
    /// Connections refused at the connection limit.
    pub connections_rejected_total: Counter,
    /// Decoded frames by message kind.
    pub frames_total: CounterVec,
    /// Decode and framing errors by reason.
    pub decode_errors_total: CounterVec,
    /// Connections closed by reason.
    pub disconnects_total: CounterVec,
    /// Jobs handed to the queue by kind.
    pub jobs_enqueued_total: CounterVec,
    /// Events not forwarded, by reason.
    pub jobs_dropped_total: CounterVec,
    /// Message handling duration by kind.
    pub handle_duration: HistogramVec,
    /// Devices currently registered.
    pub devices_online: Gauge,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_total = Counter::with_opts(Opts::new(
            "tracklink_connections_total",
            "Total number of connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "tracklink_connections_active",
            "Number of currently active connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        let connections_rejected_total = Counter::with_opts(Opts::new(
            "tracklink_connections_rejected_total",
            "Connections refused because the connection limit was reached",
        ))?;
        registry.register(Box::new(connections_rejected_total.clone()))?;

        let frames_total = CounterVec::new(
            Opts::new("tracklink_frames_total", "Decoded frames by message kind"),
            &["kind"],
        )?;
        registry.register(Box::new(frames_total.clone()))?;

        let decode_errors_total = CounterVec::new(
            Opts::new("tracklink_decode_errors_total", "Frame decode errors by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(decode_errors_total.clone()))?;

        let disconnects_total = CounterVec::new(
            Opts::new("tracklink_disconnects_total", "Closed connections by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(disconnects_total.clone()))?;

        let jobs_enqueued_total = CounterVec::new(
            Opts::new("tracklink_jobs_enqueued_total", "Jobs forwarded downstream by kind"),
            &["kind"],
        )?;
        registry.register(Box::new(jobs_enqueued_total.clone()))?;

        let jobs_dropped_total = CounterVec::new(
            Opts::new(
                "tracklink_jobs_dropped_total",
                "Location and alarm events not forwarded, by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(jobs_dropped_total.clone()))?;

        let handle_duration = HistogramVec::new(
            HistogramOpts::new(
                "tracklink_handle_duration_seconds",
                "Message handling duration in seconds by kind",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["kind"],
        )?;
        registry.register(Box::new(handle_duration.clone()))?;

        let devices_online = Gauge::with_opts(Opts::new(
            "tracklink_devices_online",
            "Number of devices with a registered session",
        ))?;
        registry.register(Box::new(devices_online.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            connections_rejected_total,
            frames_total,
            decode_errors_total,
            disconnects_total,
            jobs_enqueued_total,
            jobs_dropped_total,
            handle_duration,
            devices_online,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
        }
        buffer
    }
}

/// Runs the HTTP metrics server.
///
/// Serves metrics at `/metrics` and a liveness probe at `/health`.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn text_response(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            metrics.encode(),
        ),
        "/health" | "/healthz" => text_response(StatusCode::OK, "text/plain", "OK"),
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    };

    Ok(response)
}
