//! WebSocket listener.

use crate::broker::BrokerHandle;
use crate::connection::{
    read_pump, write_pump, Connection, PeerInfo, PumpConfig, PONG_QUEUE_CAPACITY,
};
use crate::error::ServerError;
use crate::metrics::Metrics;
use flowhub_protocol::SUBPROTOCOL;
use futures::StreamExt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

const PROTOCOL_HEADER: &str = "Sec-WebSocket-Protocol";

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Outbound frames buffered per connection.
    pub mailbox_capacity: usize,
    /// Largest accepted WebSocket message in bytes.
    pub max_message_size: usize,
    pub pump: PumpConfig,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("max_connections", &self.max_connections)
            .field("mailbox_capacity", &self.mailbox_capacity)
            .field("max_message_size", &self.max_message_size)
            .field("pump", &self.pump)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7800)),
            max_connections: 1000,
            mailbox_capacity: 256,
            max_message_size: 1024 * 1024,
            pump: PumpConfig::default(),
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

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Accepts WebSocket clients and attaches them to the router.
pub struct Server {
    config: ServerConfig,
    broker: BrokerHandle,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    pub fn new(config: ServerConfig, broker: BrokerHandle) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            broker,
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serves on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Server listening on ws://{}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => self.spawn_connection(tcp_stream, addr),
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

    fn spawn_connection(&self, tcp_stream: TcpStream, addr: SocketAddr) {
        let active = self.stats.connections_active.load(Ordering::Relaxed);
        if active >= self.config.max_connections as u64 {
            tracing::warn!("Connection limit reached, rejecting {}", addr);
            self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.config.metrics {
            metrics.connections_total.inc();
            metrics.connections_active.inc();
        }

        let broker = self.broker.clone();
        let stats = self.stats.clone();
        let config = self.config.clone();
        let mut conn_shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let result =
                Self::handle_connection(tcp_stream, addr, broker, &config, &mut conn_shutdown)
                    .await;

            if let Err(e) = result {
                tracing::debug!("Connection {} error: {}", addr, e);
                stats.errors_total.fetch_add(1, Ordering::Relaxed);
            }

            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            if let Some(ref metrics) = config.metrics {
                metrics.connections_active.dec();
            }

            tracing::info!("Client disconnected: {}", addr);
        });
    }

    async fn handle_connection(
        tcp_stream: TcpStream,
        addr: SocketAddr,
        broker: BrokerHandle,
        config: &ServerConfig,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let mut peer = PeerInfo {
            remote_addr: Some(addr),
            ..Default::default()
        };
        let ws = tokio_tungstenite::accept_hdr_async_with_config(
            tcp_stream,
            |req: &Request, resp: Response| {
                Ok::<_, ErrorResponse>(negotiate(req, resp, &mut peer))
            },
            Some(config.websocket_config()),
        )
        .await?;

        let (conn, mut mailbox) = Connection::new(peer, config.mailbox_capacity);
        tracing::info!(
            "[{}] Client connected (binary={}, agent={})",
            conn,
            conn.binary_negotiated(),
            conn.user_agent().unwrap_or("-")
        );
        broker.register(conn.clone()).await?;

        let (sink, stream) = ws.split();
        let (pong_tx, mut pongs) = mpsc::channel(PONG_QUEUE_CAPACITY);
        let writer_conn = conn.clone();
        let pump = config.pump.clone();
        let mut writer = tokio::spawn(async move {
            write_pump(&writer_conn, sink, &mut mailbox, &mut pongs, &pump).await
        });

        let result = tokio::select! {
            result = read_pump(&conn, stream, &broker, pong_tx, config.pump.read_timeout) => result,
            joined = &mut writer => match joined {
                Ok(result) => result,
                Err(e) => Err(ServerError::Internal(e.to_string())),
            },
            _ = shutdown.recv() => Err(ServerError::ShuttingDown),
        };

        // Closing the mailbox lets a still running writer flush and send Close.
        conn.close_mailbox();
        let _ = broker.unregister(conn).await;
        result
    }

    /// Signals the server to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Receiver notified when [`Server::shutdown`] is called.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
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

/// Applies subprotocol negotiation to the upgrade response and records what
/// the client asked for. Binary framing is selected by the
/// `myflowhub.bin.v1` subprotocol or a `bin=1` query parameter.
pub fn negotiate(req: &Request, mut resp: Response, peer: &mut PeerInfo) -> Response {
    peer.user_agent = req
        .headers()
        .get("User-Agent")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let offered = req
        .headers()
        .get_all(PROTOCOL_HEADER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|p| p.trim() == SUBPROTOCOL);
    if offered {
        resp.headers_mut()
            .insert(PROTOCOL_HEADER, HeaderValue::from_static(SUBPROTOCOL));
    }

    let query_binary = req
        .uri()
        .query()
        .is_some_and(|q| q.split('&').any(|pair| pair == "bin=1"));

    peer.binary = offered || query_binary;
    resp
}
