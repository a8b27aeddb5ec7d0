//! Per-connection state and I/O pumps.
//!
//! Every peer (local device or the upstream parent) is a [`Connection`] with a
//! bounded outbound mailbox. The router only ever enqueues into mailboxes
//! without blocking; a write pump drains each mailbox into the socket and a
//! read pump feeds inbound frames to the router.

use crate::broker::BrokerHandle;
use crate::error::ServerError;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Capacity of the channel carrying pong replies from the read pump.
pub const PONG_QUEUE_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("mailbox full")]
    Full,
    #[error("mailbox closed")]
    Closed,
}

/// Transport facts captured during the upgrade.
#[derive(Debug, Clone, Default)]
pub struct PeerInfo {
    pub remote_addr: Option<SocketAddr>,
    pub user_agent: Option<String>,
    /// Whether the client asked for binary framing.
    pub binary: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// A device connected to this hub.
    Local,
    /// The link to this hub's own parent.
    Parent,
}

/// A peer as seen by the router.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    kind: ConnectionKind,
    uid: AtomicU64,
    mailbox: Mutex<Option<mpsc::Sender<Bytes>>>,
    peer: PeerInfo,
    connected_at: Instant,
    last_seen: Mutex<Instant>,
    dropped: AtomicU64,
}

impl Connection {
    /// Creates a local connection and the receiving end of its mailbox.
    pub fn new(peer: PeerInfo, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        Self::with_kind(ConnectionKind::Local, peer, capacity)
    }

    /// Creates the pseudo-connection standing for the upstream parent. Its
    /// mailbox outlives individual link sessions.
    pub fn parent(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        Self::with_kind(ConnectionKind::Parent, PeerInfo::default(), capacity)
    }

    fn with_kind(
        kind: ConnectionKind,
        peer: PeerInfo,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let now = Instant::now();
        let conn = Arc::new(Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            uid: AtomicU64::new(0),
            mailbox: Mutex::new(Some(tx)),
            peer,
            connected_at: now,
            last_seen: Mutex::new(now),
            dropped: AtomicU64::new(0),
        });
        (conn, rx)
    }

    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn is_parent(&self) -> bool {
        self.kind == ConnectionKind::Parent
    }

    /// Device UID bound to this connection, 0 until authenticated.
    pub fn uid(&self) -> u64 {
        self.uid.load(Ordering::Acquire)
    }

    pub(crate) fn set_uid(&self, uid: u64) {
        self.uid.store(uid, Ordering::Release);
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid() != 0
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.peer.remote_addr
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.peer.user_agent.as_deref()
    }

    pub fn binary_negotiated(&self) -> bool {
        self.peer.binary
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Frames dropped because the mailbox was full.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Queues a frame without waiting.
    pub fn try_enqueue(&self, frame: Bytes) -> Result<(), EnqueueError> {
        let guard = self.mailbox.lock();
        let tx = guard.as_ref().ok_or(EnqueueError::Closed)?;
        match tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(EnqueueError::Full)
            }
            Err(TrySendError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }

    /// Closes the mailbox. The write pump drains what is queued and exits.
    /// Returns false if it was already closed.
    pub fn close_mailbox(&self) -> bool {
        self.mailbox.lock().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox
            .lock()
            .as_ref()
            .map_or(true, |tx| tx.is_closed())
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.kind, self.peer.remote_addr) {
            (ConnectionKind::Parent, _) => write!(f, "parent#{}", self.id),
            (_, Some(addr)) => write!(f, "{}#{}", addr, self.id),
            (_, None) => write!(f, "conn#{}", self.id),
        }
    }
}

/// Pump timings.
#[derive(Debug, Clone)]
pub struct PumpConfig {
    pub ping_interval: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(54),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Reads messages until the peer goes away, handing binary frames to the
/// router. Pings are answered through `pong_tx` so that only the write pump
/// touches the sink.
pub async fn read_pump<S>(
    conn: &Arc<Connection>,
    mut stream: S,
    broker: &BrokerHandle,
    pong_tx: mpsc::Sender<Vec<u8>>,
    read_timeout: Duration,
) -> Result<(), ServerError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let next = timeout(read_timeout, stream.next())
            .await
            .map_err(|_| ServerError::ReadTimeout)?;

        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(()),
        };
        conn.touch();

        match msg {
            Message::Binary(data) => {
                broker.submit_frame(conn.clone(), Bytes::from(data)).await?;
            }
            Message::Text(_) => {
                tracing::warn!("[{}] Dropping text message, binary framing required", conn);
            }
            Message::Ping(payload) => {
                let _ = pong_tx.try_send(payload);
            }
            Message::Pong(_) | Message::Frame(_) => {}
            Message::Close(frame) => {
                tracing::debug!("[{}] Close received: {:?}", conn, frame);
                return Ok(());
            }
        }
    }
}

/// Drains `mailbox` into `sink`, interleaving keepalive pings and pong
/// replies. Returns when the mailbox is closed or a write fails.
pub async fn write_pump<Si>(
    conn: &Connection,
    mut sink: Si,
    mailbox: &mut mpsc::Receiver<Bytes>,
    pongs: &mut mpsc::Receiver<Vec<u8>>,
    config: &PumpConfig,
) -> Result<(), ServerError>
where
    Si: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let mut ticker = tokio::time::interval(config.ping_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            frame = mailbox.recv() => match frame {
                Some(frame) => {
                    let message = Message::Binary(frame.to_vec());
                    send_within(&mut sink, message, config.write_timeout).await?;
                }
                None => {
                    tracing::debug!("[{}] Mailbox closed, closing socket", conn);
                    let close = Message::Close(None);
                    let _ = send_within(&mut sink, close, config.write_timeout).await;
                    return Ok(());
                }
            },
            Some(payload) = pongs.recv() => {
                send_within(&mut sink, Message::Pong(payload), config.write_timeout).await?;
            }
            _ = ticker.tick() => {
                send_within(&mut sink, Message::Ping(Vec::new()), config.write_timeout).await?;
            }
        }
    }
}

async fn send_within<Si>(sink: &mut Si, msg: Message, deadline: Duration) -> Result<(), ServerError>
where
    Si: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    match timeout(deadline, sink.send(msg)).await {
        Ok(result) => result.map_err(ServerError::from),
        Err(_) => Err(ServerError::WriteTimeout),
    }
}
