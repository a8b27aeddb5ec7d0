//! Upstream link for relays.
//!
//! A relay keeps one WebSocket to its parent hub. Each session connects,
//! performs the signed handshake, adopts the uid the parent assigns and then
//! pumps frames both ways until the socket fails, after which it waits
//! `reconnect_delay` and starts over. Frames the router forwards upward while
//! the link is down stay queued in the parent mailbox.

use crate::broker::BrokerHandle;
use crate::connection::{read_pump, write_pump, Connection, PumpConfig, PONG_QUEUE_CAPACITY};
use crate::directory::RELAY_CAPABILITY;
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::parent_auth;
use bytes::Bytes;
use flowhub_protocol::message::{ManagerAuthResp, ParentAuthResp, Reply};
use flowhub_protocol::{
    decode_frame, encode_frame, now_millis, types, FrameHeader, Payload, SUBPROTOCOL,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Authenticating,
    Linked,
}

#[derive(Debug, Clone)]
pub struct ParentLinkConfig {
    pub parent_url: String,
    pub hardware_id: String,
    pub secret: String,
    pub reconnect_delay: Duration,
    pub auth_timeout: Duration,
    pub max_message_size: usize,
    pub pump: PumpConfig,
}

/// Result of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSession {
    pub device_uid: u64,
    pub session_id: Option<[u8; 16]>,
    pub lease_secs: Option<u32>,
}

pub struct ParentLink {
    config: ParentLinkConfig,
    broker: BrokerHandle,
    conn: Arc<Connection>,
    mailbox: mpsc::Receiver<Bytes>,
    state: watch::Sender<LinkState>,
    metrics: Option<Arc<Metrics>>,
}

impl ParentLink {
    /// `conn` and `mailbox` come from [`Connection::parent`]; the same
    /// connection must be installed on the router.
    pub fn new(
        config: ParentLinkConfig,
        broker: BrokerHandle,
        conn: Arc<Connection>,
        mailbox: mpsc::Receiver<Bytes>,
    ) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            config,
            broker,
            conn,
            mailbox,
            state,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Observes state transitions.
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: LinkState) {
        self.state.send_replace(state);
        if let Some(ref metrics) = self.metrics {
            metrics
                .parent_link_up
                .set(if state == LinkState::Linked { 1.0 } else { 0.0 });
        }
    }

    /// Keeps the link up until shutdown or until the router closes the
    /// parent mailbox.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!("Parent link starting ({})", self.config.parent_url);
        loop {
            let result = tokio::select! {
                result = self.run_session() => result,
                _ = shutdown.recv() => break,
            };
            self.set_state(LinkState::Disconnected);

            match result {
                Ok(()) => tracing::warn!("Parent link closed"),
                Err(e) if !e.is_retryable() => {
                    tracing::error!("Parent link stopped: {}", e);
                    break;
                }
                Err(e) => tracing::error!("Parent link failed: {}", e),
            }
            if self.conn.is_closed() {
                tracing::info!("Parent mailbox closed, link stopping");
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = shutdown.recv() => break,
            }
        }
        self.set_state(LinkState::Disconnected);
        tracing::info!("Parent link stopped");
    }

    async fn run_session(&mut self) -> Result<(), ServerError> {
        self.set_state(LinkState::Connecting);
        let mut request = self.config.parent_url.as_str().into_client_request()?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(SUBPROTOCOL),
        );
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.config.max_message_size);

        let (ws, _) = timeout(
            self.config.auth_timeout,
            tokio_tungstenite::connect_async_with_config(request, Some(ws_config), false),
        )
        .await
        .map_err(|_| ServerError::Timeout("parent connect"))??;
        let (mut sink, mut stream) = ws.split();

        self.set_state(LinkState::Authenticating);
        let session = handshake(&self.config, &mut sink, &mut stream).await?;
        if session.device_uid != 0 {
            self.broker.set_local_uid(session.device_uid).await?;
        }
        self.set_state(LinkState::Linked);
        tracing::info!(
            "Linked to parent {} as uid {}",
            self.config.parent_url,
            session.device_uid
        );

        let (pong_tx, mut pongs) = mpsc::channel(PONG_QUEUE_CAPACITY);
        let conn = self.conn.clone();
        let read_timeout = self.config.pump.read_timeout;
        let reader = read_pump(&conn, stream, &self.broker, pong_tx, read_timeout);
        let writer = write_pump(&conn, sink, &mut self.mailbox, &mut pongs, &self.config.pump);
        tokio::select! {
            result = reader => result,
            result = writer => result,
        }
    }
}

/// Sends the signed handshake and waits for the parent's verdict.
pub async fn handshake<Si, St>(
    config: &ParentLinkConfig,
    sink: &mut Si,
    stream: &mut St,
) -> Result<LinkSession, ServerError>
where
    Si: Sink<Message, Error = tungstenite::Error> + Unpin,
    St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let now = now_millis();
    let req = parent_auth::build_request(
        config.secret.as_bytes(),
        &config.hardware_id,
        RELAY_CAPABILITY,
        now,
    )?;
    let msg_id = now as u64;
    let header = FrameHeader::new(types::PARENT_AUTH_REQ, msg_id, 0, 0);
    let frame = encode_frame(&header, &req.encode()?);
    sink.send(Message::Binary(frame.to_vec())).await?;

    let data = timeout(config.auth_timeout, next_binary(stream))
        .await
        .map_err(|_| ServerError::Timeout("parent handshake"))??;
    let (header, payload) = decode_frame(&data)?;

    match header.type_id {
        types::PARENT_AUTH_RESP => {
            let resp = ParentAuthResp::decode(payload)?;
            Ok(LinkSession {
                device_uid: resp.device_uid,
                session_id: Some(resp.session_id),
                lease_secs: Some(resp.lease_secs),
            })
        }
        types::MANAGER_AUTH_RESP => {
            let resp = ManagerAuthResp::decode(payload)?;
            tracing::debug!("Parent answered with legacy auth response");
            Ok(LinkSession {
                device_uid: resp.device_uid,
                session_id: None,
                lease_secs: None,
            })
        }
        types::ERR_RESP => {
            let reply = Reply::decode(payload)?;
            Err(ServerError::ParentRejected {
                code: reply.code,
                message: reply.message,
            })
        }
        other => Err(ServerError::UnexpectedReply(other)),
    }
}

async fn next_binary<St>(stream: &mut St) -> Result<Vec<u8>, ServerError>
where
    St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = stream.next().await {
        match msg? {
            Message::Binary(data) => return Ok(data),
            Message::Close(_) => return Err(ServerError::ConnectionClosed),
            _ => {}
        }
    }
    Err(ServerError::ConnectionClosed)
}
