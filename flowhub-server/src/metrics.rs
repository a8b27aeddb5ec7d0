//! Prometheus metrics for the flowhub broker.
//!
//! This module provides:
//! - Metrics registry with counters and gauges for connections, routing and auth
//! - HTTP server to expose metrics at `/metrics` endpoint

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Prometheus metrics for the broker.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total connections accepted.
    pub connections_total: Counter,
    /// Currently active connections.
    pub connections_active: Gauge,
    /// Frames delivered, by route (handler, direct, broadcast, parent).
    pub frames_routed_total: CounterVec,
    /// Frames dropped, by reason.
    pub frames_dropped_total: CounterVec,
    /// Authentication attempts, by kind and outcome.
    pub auth_total: CounterVec,
    /// 1 while the upstream link is authenticated.
    pub parent_link_up: Gauge,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_total = Counter::with_opts(Opts::new(
            "flowhub_connections_total",
            "Total number of connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "flowhub_connections_active",
            "Number of currently active connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        let frames_routed_total = CounterVec::new(
            Opts::new("flowhub_frames_routed_total", "Frames delivered by route"),
            &["route"],
        )?;
        registry.register(Box::new(frames_routed_total.clone()))?;

        let frames_dropped_total = CounterVec::new(
            Opts::new("flowhub_frames_dropped_total", "Frames dropped by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(frames_dropped_total.clone()))?;

        let auth_total = CounterVec::new(
            Opts::new(
                "flowhub_auth_total",
                "Authentication attempts by kind and outcome",
            ),
            &["kind", "outcome"],
        )?;
        registry.register(Box::new(auth_total.clone()))?;

        let parent_link_up = Gauge::with_opts(Opts::new(
            "flowhub_parent_link_up",
            "Whether the upstream parent link is authenticated",
        ))?;
        registry.register(Box::new(parent_link_up.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            frames_routed_total,
            frames_dropped_total,
            auth_total,
            parent_link_up,
        })
    }

    pub fn record_route(&self, route: &str) {
        self.frames_routed_total.with_label_values(&[route]).inc();
    }

    pub fn record_drop(&self, reason: &str) {
        self.frames_dropped_total.with_label_values(&[reason]).inc();
    }

    pub fn record_auth(&self, kind: &str, ok: bool) {
        let outcome = if ok { "ok" } else { "rejected" };
        self.auth_total.with_label_values(&[kind, outcome]).inc();
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        buffer
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server.
///
/// The server listens on the given address and serves metrics at `/metrics`.
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

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => {
            let mut response = text_response(StatusCode::OK, metrics.encode());
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            response
        }
        "/health" | "/healthz" => text_response(StatusCode::OK, "OK"),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}
