//! Connection management.

use crate::correlator::Correlator;
use crate::error::ClientError;
use bytes::Bytes;
use flowhub_protocol::{encode_frame, Frame, FrameHeader, SUBPROTOCOL};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;

/// Default capacity for the unsolicited frame channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Outbound messages buffered ahead of the writer task.
const OUTBOUND_CAPACITY: usize = 256;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Hub URL, e.g. `ws://127.0.0.1:7800/ws`.
    pub url: String,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Request timeout.
    pub request_timeout: Duration,
    /// Largest accepted WebSocket message in bytes.
    pub max_message_size: usize,
    /// Sent as the `User-Agent` header.
    pub user_agent: Option<String>,
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_message_size: 1024 * 1024,
            user_agent: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }
}

/// A connection to a flowhub hub.
///
/// Each instance connects at most once. After it closes, create a new one.
pub struct Connection {
    config: ConnectionConfig,
    /// Sender feeding the writer task.
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    correlator: Arc<Correlator>,
    connected: Arc<AtomicBool>,
    /// UID stamped as the source of outgoing frames (0 until authenticated).
    device_uid: AtomicU64,
    /// Frames that did not answer a pending request.
    events: broadcast::Sender<Frame>,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            outbound: Mutex::new(None),
            correlator: Arc::new(Correlator::new()),
            connected: Arc::new(AtomicBool::new(false)),
            device_uid: AtomicU64::new(0),
            events,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Subscribes to frames that are not replies to this client's requests.
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.events.subscribe()
    }

    /// Connects to the hub and starts the reader and writer tasks.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if self.correlator.is_closed() {
            return Err(ClientError::Closed);
        }
        tracing::debug!("Connecting to {}...", self.config.url);

        let mut request = self.config.url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));
        if let Some(ref agent) = self.config.user_agent {
            if let Ok(value) = HeaderValue::from_str(agent) {
                request.headers_mut().insert("User-Agent", value);
            }
        }

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.config.max_message_size);

        let (ws, _response) = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async_with_config(request, Some(ws_config), false),
        )
        .await
        .map_err(|_| {
            tracing::debug!("Connection timeout");
            ClientError::Timeout
        })?
        .map_err(|e| {
            tracing::debug!("Connection failed: {}", e);
            ClientError::WebSocket(e)
        })?;

        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
        *self.outbound.lock() = Some(tx.clone());
        self.connected.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    tracing::debug!("Write error: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let correlator = self.correlator.clone();
        let connected = self.connected.clone();
        let events = self.events.clone();
        let pong_tx = tx;
        tokio::spawn(async move {
            while let Some(result) = stream.next().await {
                match result {
                    Ok(Message::Binary(data)) => match Frame::decode(Bytes::from(data)) {
                        Ok(frame) => {
                            if !correlator.deliver(frame.header, frame.payload.clone()) {
                                let _ = events.send(frame);
                            }
                        }
                        Err(e) => tracing::warn!("Dropping undecodable frame: {}", e),
                    },
                    Ok(Message::Ping(data)) => {
                        let _ = pong_tx.try_send(Message::Pong(data));
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!("Read error: {}", e);
                        break;
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
            correlator.close();
            tracing::debug!("Reader finished");
        });

        tracing::debug!("Connected to {}", self.config.url);
        Ok(())
    }

    /// Returns whether the connection is up.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// UID used as the frame source.
    pub fn device_uid(&self) -> u64 {
        self.device_uid.load(Ordering::Relaxed)
    }

    pub fn set_device_uid(&self, uid: u64) {
        self.device_uid.store(uid, Ordering::Relaxed);
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// Sends one frame without waiting for a reply.
    pub async fn send_frame(
        &self,
        header: &FrameHeader,
        payload: &[u8],
    ) -> Result<(), ClientError> {
        let sender = self.sender()?;
        sender
            .send(Message::Binary(encode_frame(header, payload).to_vec()))
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Sends a request and waits for its correlated reply payload.
    pub async fn send_request(
        &self,
        type_id: u16,
        expected_type: u16,
        payload: &[u8],
    ) -> Result<Bytes, ClientError> {
        let timeout = self.config.request_timeout;
        self.send_request_with_timeout(type_id, expected_type, payload, timeout)
            .await
    }

    pub async fn send_request_with_timeout(
        &self,
        type_id: u16,
        expected_type: u16,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Bytes, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let msg_id = self.correlator.next_msg_id();
        let waiter = self.correlator.register(msg_id)?;
        let header = FrameHeader::new(type_id, msg_id, self.device_uid(), 0);

        tracing::debug!("Sending request type={} msg_id={}", type_id, msg_id);
        let started = Instant::now();
        match tokio::time::timeout(timeout, self.send_frame(&header, payload)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.correlator.cancel(msg_id);
                return Err(e);
            }
            Err(_) => {
                self.correlator.cancel(msg_id);
                return Err(ClientError::Timeout);
            }
        }

        let remaining = timeout.saturating_sub(started.elapsed());
        self.correlator.wait(waiter, expected_type, remaining).await
    }

    /// Closes the connection and fails outstanding requests.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.correlator.close();
        self.connected.store(false, Ordering::SeqCst);

        let sender = self.outbound.lock().take();
        if let Some(sender) = sender {
            let _ = sender.send(Message::Close(None)).await;
        }
        Ok(())
    }

    fn sender(&self) -> Result<mpsc::Sender<Message>, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        self.outbound
            .lock()
            .as_ref()
            .cloned()
            .ok_or(ClientError::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowhub_protocol::message::Reply;
    use flowhub_protocol::{types, Payload};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::WebSocketStream;

    async fn accept(tcp: TcpStream) -> WebSocketStream<TcpStream> {
        let callback = |_req: &Request, mut resp: Response| {
            resp.headers_mut()
                .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));
            Ok::<_, ErrorResponse>(resp)
        };
        tokio_tungstenite::accept_hdr_async(tcp, callback)
            .await
            .unwrap()
    }

    /// Accepts one client and answers every frame with an OK reply echoing
    /// the request id. Frames with type `MSG_SEND` are pushed back unsolicited.
    async fn echo_hub() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept(tcp).await;

            while let Some(Ok(msg)) = ws.next().await {
                let Message::Binary(data) = msg else { continue };
                let frame = Frame::decode(Bytes::from(data)).unwrap();
                let h = frame.header;
                let out = if h.type_id == types::MSG_SEND {
                    let header = FrameHeader::new(types::MSG_SEND, 1, 1, h.source);
                    encode_frame(&header, &frame.payload)
                } else {
                    let body = Reply::new(h.msg_id, 0, "ok").encode().unwrap();
                    encode_frame(&FrameHeader::new(types::OK_RESP, h.msg_id, 1, h.source), &body)
                };
                if ws.send(Message::Binary(out.to_vec())).await.is_err() {
                    break;
                }
            }
        });

        format!("ws://{}/ws", addr)
    }

    #[tokio::test]
    async fn test_request_reply() {
        let url = echo_hub().await;
        let conn = Connection::new(ConnectionConfig::new(url));
        conn.connect().await.unwrap();
        assert!(conn.is_connected());

        let payload = conn
            .send_request(types::KEEPALIVE_REQ, types::OK_RESP, &[])
            .await
            .unwrap();
        let reply = Reply::decode(&payload).unwrap();
        assert_eq!(reply.code, 0);
        assert_eq!(conn.correlator().pending_count(), 0);

        conn.close().await.unwrap();
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_unsolicited_frames_broadcast() {
        let url = echo_hub().await;
        let conn = Connection::new(ConnectionConfig::new(url));
        conn.connect().await.unwrap();
        let mut events = conn.subscribe();

        let header = FrameHeader::new(types::MSG_SEND, 99, 0, 5);
        conn.send_frame(&header, b"hello").await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.header.type_id, types::MSG_SEND);
        assert_eq!(&frame.payload[..], b"hello");
    }

    /// Accepts one client and reads frames without ever answering.
    async fn silent_hub() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept(tcp).await;
            while let Some(Ok(_)) = ws.next().await {}
        });

        format!("ws://{}/ws", addr)
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let url = silent_hub().await;
        let conn = Connection::new(ConnectionConfig::new(url));
        conn.connect().await.unwrap();

        let result = conn
            .send_request_with_timeout(
                types::KEEPALIVE_REQ,
                types::OK_RESP,
                &[],
                Duration::from_millis(50),
            )
            .await;
        assert!(matches!(result, Err(ClientError::Timeout)));
        assert_eq!(conn.correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_request_releases_waiter() {
        let url = silent_hub().await;
        let conn = Connection::new(ConnectionConfig::new(url));
        conn.connect().await.unwrap();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            conn.send_request(types::KEEPALIVE_REQ, types::OK_RESP, &[]),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(conn.correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_full_outbound_queue_times_out() {
        let conn = Connection::new(ConnectionConfig::new("ws://127.0.0.1:1/ws"));
        // Nothing drains this queue.
        let (tx, _rx) = mpsc::channel(1);
        tx.send(Message::Binary(vec![0])).await.unwrap();
        *conn.outbound.lock() = Some(tx);
        conn.connected.store(true, Ordering::SeqCst);

        let result = conn
            .send_request_with_timeout(
                types::KEEPALIVE_REQ,
                types::OK_RESP,
                &[],
                Duration::from_millis(50),
            )
            .await;
        assert!(matches!(result, Err(ClientError::Timeout)));
        assert_eq!(conn.correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_before_connect() {
        let conn = Connection::new(ConnectionConfig::new("ws://127.0.0.1:1/ws"));
        let result = conn.send_request(types::KEEPALIVE_REQ, types::OK_RESP, &[]).await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let conn = Connection::new(
            ConnectionConfig::new(format!("ws://{}/ws", addr))
                .with_connect_timeout(Duration::from_secs(2)),
        );
        assert!(conn.connect().await.is_err());
        assert!(!conn.is_connected());
    }
}
