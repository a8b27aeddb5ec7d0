//! Frame router.
//!
//! A single task owns the routing tables and processes [`BrokerEvent`]s in
//! arrival order, so no locks guard the tables. Handlers run inside that task
//! and must not block.
//!
//! Routing order for an inbound frame:
//! 1. A handler registered for the frame's type id.
//! 2. Frames from unauthenticated local connections are dropped.
//! 3. `target == 0` fans out to every other device (and upward).
//! 4. `target == local uid` with no handler is dropped.
//! 5. A locally connected target gets the frame in its mailbox.
//! 6. Unknown targets go to the parent, unless the frame came from it.

use crate::connection::{Connection, EnqueueError};
use crate::error::ServerError;
use crate::metrics::Metrics;
use bytes::Bytes;
use flowhub_protocol::message::Reply;
use flowhub_protocol::{
    encode_frame, message, types, ErrorCode, FrameHeader, Payload, HEADER_SIZE,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Processes frames of one type id inside the router task.
pub trait FrameHandler: Send + Sync {
    fn handle(
        &self,
        router: &mut Router,
        conn: &Arc<Connection>,
        header: &FrameHeader,
        payload: &[u8],
    );
}

impl<F> FrameHandler for F
where
    F: Fn(&mut Router, &Arc<Connection>, &FrameHeader, &[u8]) + Send + Sync,
{
    fn handle(
        &self,
        router: &mut Router,
        conn: &Arc<Connection>,
        header: &FrameHeader,
        payload: &[u8],
    ) {
        self(router, conn, header, payload)
    }
}

/// Input to the router task.
pub enum BrokerEvent {
    Register(Arc<Connection>),
    Unregister(Arc<Connection>),
    Frame { conn: Arc<Connection>, data: Bytes },
    SetLocalUid(u64),
    RegisterHandler {
        type_id: u16,
        handler: Arc<dyn FrameHandler>,
    },
}

impl std::fmt::Debug for BrokerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerEvent::Register(conn) => write!(f, "Register({})", conn),
            BrokerEvent::Unregister(conn) => write!(f, "Unregister({})", conn),
            BrokerEvent::Frame { conn, data } => {
                write!(f, "Frame({}, {} bytes)", conn, data.len())
            }
            BrokerEvent::SetLocalUid(uid) => write!(f, "SetLocalUid({})", uid),
            BrokerEvent::RegisterHandler { type_id, .. } => {
                write!(f, "RegisterHandler({})", type_id)
            }
        }
    }
}

/// Sending side of the router's inbound queue.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<BrokerEvent>,
}

impl BrokerHandle {
    /// Creates a handle and the queue the router consumes.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<BrokerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub async fn send(&self, event: BrokerEvent) -> Result<(), ServerError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| ServerError::ShuttingDown)
    }

    pub async fn register(&self, conn: Arc<Connection>) -> Result<(), ServerError> {
        self.send(BrokerEvent::Register(conn)).await
    }

    pub async fn unregister(&self, conn: Arc<Connection>) -> Result<(), ServerError> {
        self.send(BrokerEvent::Unregister(conn)).await
    }

    pub async fn submit_frame(
        &self,
        conn: Arc<Connection>,
        data: Bytes,
    ) -> Result<(), ServerError> {
        self.send(BrokerEvent::Frame { conn, data }).await
    }

    pub async fn set_local_uid(&self, uid: u64) -> Result<(), ServerError> {
        self.send(BrokerEvent::SetLocalUid(uid)).await
    }

    pub async fn register_handler<H>(
        &self,
        type_id: u16,
        handler: H,
    ) -> Result<(), ServerError>
    where
        H: FrameHandler + 'static,
    {
        self.send(BrokerEvent::RegisterHandler {
            type_id,
            handler: Arc::new(handler),
        })
        .await
    }
}

/// Router counters.
#[derive(Debug, Default)]
pub struct RouterStats {
    pub frames_received: AtomicU64,
    pub frames_handled: AtomicU64,
    pub frames_direct: AtomicU64,
    pub frames_broadcast: AtomicU64,
    pub frames_to_parent: AtomicU64,
    pub dropped_decode: AtomicU64,
    pub dropped_unauthenticated: AtomicU64,
    pub dropped_no_target: AtomicU64,
    pub dropped_self: AtomicU64,
    pub dropped_full: AtomicU64,
}

impl RouterStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy)]
enum Route {
    Direct,
    Broadcast,
    Parent,
    Reply,
}

impl Route {
    fn label(self) -> &'static str {
        match self {
            Route::Direct => "direct",
            Route::Broadcast => "broadcast",
            Route::Parent => "parent",
            Route::Reply => "reply",
        }
    }
}

/// Routing tables and the dispatch loop.
pub struct Router {
    local_uid: u64,
    /// Connections that have not authenticated yet, keyed by connection id.
    anonymous: HashMap<u64, Arc<Connection>>,
    /// Authenticated connections keyed by device uid.
    devices: HashMap<u64, Arc<Connection>>,
    handlers: HashMap<u16, Arc<dyn FrameHandler>>,
    parent: Option<Arc<Connection>>,
    stats: Arc<RouterStats>,
    metrics: Option<Arc<Metrics>>,
}

impl Router {
    pub fn new(local_uid: u64) -> Self {
        Self {
            local_uid,
            anonymous: HashMap::new(),
            devices: HashMap::new(),
            handlers: HashMap::new(),
            parent: None,
            stats: Arc::new(RouterStats::default()),
            metrics: None,
        }
    }

    /// Forwards unroutable traffic to `parent`.
    pub fn with_parent(mut self, parent: Arc<Connection>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn local_uid(&self) -> u64 {
        self.local_uid
    }

    pub fn set_local_uid(&mut self, uid: u64) {
        if uid != 0 && uid != self.local_uid {
            tracing::info!("Local uid changed {} -> {}", self.local_uid, uid);
            self.local_uid = uid;
        }
    }

    pub fn stats(&self) -> Arc<RouterStats> {
        self.stats.clone()
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    /// Connection currently bound to `uid`.
    pub fn connection(&self, uid: u64) -> Option<&Arc<Connection>> {
        self.devices.get(&uid)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn anonymous_count(&self) -> usize {
        self.anonymous.len()
    }

    /// Installs `handler` for `type_id`. A second registration replaces the
    /// first.
    pub fn register_handler<H>(&mut self, type_id: u16, handler: H)
    where
        H: FrameHandler + 'static,
    {
        self.insert_handler(type_id, Arc::new(handler));
    }

    fn insert_handler(&mut self, type_id: u16, handler: Arc<dyn FrameHandler>) {
        if self.handlers.insert(type_id, handler).is_some() {
            tracing::warn!(
                "Handler for {} ({}) replaced",
                type_id,
                message::type_name(type_id)
            );
        }
    }

    pub fn has_handler(&self, type_id: u16) -> bool {
        self.handlers.contains_key(&type_id)
    }

    /// Tracks a freshly accepted connection.
    pub fn register(&mut self, conn: Arc<Connection>) {
        tracing::debug!("[{}] Registered", conn);
        self.anonymous.insert(conn.id(), conn);
    }

    /// Forgets `conn` and closes its mailbox. A uid binding is only removed if
    /// it still points at this connection.
    pub fn unregister(&mut self, conn: &Arc<Connection>) {
        self.anonymous.remove(&conn.id());
        let uid = conn.uid();
        if uid != 0
            && self
                .devices
                .get(&uid)
                .is_some_and(|bound| bound.id() == conn.id())
        {
            self.devices.remove(&uid);
        }
        conn.close_mailbox();
        tracing::debug!("[{}] Unregistered (uid={})", conn, uid);
    }

    /// Binds `conn` to `uid`. An older connection holding the same uid is
    /// evicted and its mailbox closed.
    pub fn promote(&mut self, conn: &Arc<Connection>, uid: u64) {
        if uid == 0 {
            return;
        }
        let previous = conn.uid();
        if previous != 0
            && previous != uid
            && self
                .devices
                .get(&previous)
                .is_some_and(|bound| bound.id() == conn.id())
        {
            self.devices.remove(&previous);
        }

        self.anonymous.remove(&conn.id());
        conn.set_uid(uid);
        if let Some(old) = self.devices.insert(uid, conn.clone()) {
            if old.id() != conn.id() {
                tracing::info!("[{}] Replaced by [{}] for uid {}", old, conn, uid);
                old.close_mailbox();
            }
        }
    }

    pub fn handle_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Register(conn) => self.register(conn),
            BrokerEvent::Unregister(conn) => self.unregister(&conn),
            BrokerEvent::Frame { conn, data } => self.route_frame(&conn, data),
            BrokerEvent::SetLocalUid(uid) => self.set_local_uid(uid),
            BrokerEvent::RegisterHandler { type_id, handler } => {
                self.insert_handler(type_id, handler)
            }
        }
    }

    /// Consumes events until every sender is gone.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<BrokerEvent>) {
        tracing::info!("Router started (uid={})", self.local_uid);
        while let Some(event) = inbound.recv().await {
            self.handle_event(event);
        }
        for conn in self.devices.values().chain(self.anonymous.values()) {
            conn.close_mailbox();
        }
        tracing::info!("Router stopped");
    }

    /// Routes one inbound frame.
    pub fn route_frame(&mut self, conn: &Arc<Connection>, data: Bytes) {
        RouterStats::bump(&self.stats.frames_received);

        let header = match FrameHeader::decode(&data) {
            Ok(header) => header,
            Err(e) => {
                tracing::warn!("[{}] Dropping undecodable frame: {}", conn, e);
                self.record_drop(&self.stats.dropped_decode, "decode");
                return;
            }
        };

        if let Some(handler) = self.handlers.get(&header.type_id).cloned() {
            RouterStats::bump(&self.stats.frames_handled);
            if let Some(ref metrics) = self.metrics {
                metrics.record_route("handler");
            }
            handler.handle(self, conn, &header, &data[HEADER_SIZE..]);
            return;
        }

        if !conn.is_authenticated() && !conn.is_parent() {
            tracing::warn!(
                "[{}] Dropping {} from unauthenticated connection",
                conn,
                message::type_name(header.type_id)
            );
            self.record_drop(&self.stats.dropped_unauthenticated, "unauthenticated");
            return;
        }

        if header.is_broadcast() {
            self.broadcast(conn, data);
            return;
        }

        if header.target == self.local_uid {
            tracing::warn!(
                "[{}] No handler for {} addressed to this hub",
                conn,
                header.type_id
            );
            self.record_drop(&self.stats.dropped_self, "no_handler");
            return;
        }

        if let Some(target) = self.devices.get(&header.target) {
            self.deliver(target, data, Route::Direct);
            return;
        }

        if let Some(parent) = self.upstream_for(conn) {
            self.deliver(parent, data, Route::Parent);
            return;
        }

        tracing::warn!(
            "[{}] Target {} not found, dropping {}",
            conn,
            header.target,
            message::type_name(header.type_id)
        );
        self.record_drop(&self.stats.dropped_no_target, "no_target");
    }

    fn broadcast(&self, from: &Arc<Connection>, data: Bytes) {
        for target in self.devices.values() {
            if target.id() != from.id() {
                self.deliver(target, data.clone(), Route::Broadcast);
            }
        }
        if let Some(parent) = self.upstream_for(from) {
            self.deliver(parent, data, Route::Parent);
        }
    }

    /// The parent connection, unless `from` is the parent itself.
    fn upstream_for(&self, from: &Connection) -> Option<&Arc<Connection>> {
        self.parent
            .as_ref()
            .filter(|parent| parent.id() != from.id() && !from.is_parent())
    }

    fn deliver(&self, target: &Connection, data: Bytes, route: Route) -> bool {
        match target.try_enqueue(data) {
            Ok(()) => {
                let counter = match route {
                    Route::Direct | Route::Reply => &self.stats.frames_direct,
                    Route::Broadcast => &self.stats.frames_broadcast,
                    Route::Parent => &self.stats.frames_to_parent,
                };
                RouterStats::bump(counter);
                if let Some(ref metrics) = self.metrics {
                    metrics.record_route(route.label());
                }
                true
            }
            Err(EnqueueError::Full) => {
                tracing::warn!("[{}] Mailbox full, dropping frame", target);
                self.record_drop(&self.stats.dropped_full, "mailbox_full");
                false
            }
            Err(EnqueueError::Closed) => {
                tracing::debug!("[{}] Mailbox closed, dropping frame", target);
                false
            }
        }
    }

    fn record_drop(&self, counter: &AtomicU64, reason: &str) {
        RouterStats::bump(counter);
        if let Some(ref metrics) = self.metrics {
            metrics.record_drop(reason);
        }
    }

    /// Sends a reply to `conn` for `request`. The reply echoes the request's
    /// msg_id, comes from this hub and targets the connection's uid.
    pub fn reply(
        &self,
        conn: &Connection,
        request: &FrameHeader,
        type_id: u16,
        payload: &[u8],
    ) -> bool {
        let header = FrameHeader::new(type_id, request.msg_id, self.local_uid, conn.uid());
        self.deliver(conn, encode_frame(&header, payload), Route::Reply)
    }

    /// Encodes `payload` and replies with it.
    pub fn reply_with<P: Payload>(
        &self,
        conn: &Connection,
        request: &FrameHeader,
        type_id: u16,
        payload: &P,
    ) -> bool {
        match payload.encode() {
            Ok(bytes) => self.reply(conn, request, type_id, &bytes),
            Err(e) => {
                tracing::error!("[{}] Failed to encode reply {}: {}", conn, type_id, e);
                false
            }
        }
    }

    pub fn reply_ok(&self, conn: &Connection, request: &FrameHeader, message: &str) -> bool {
        let body = Reply::new(request.msg_id, 0, message);
        self.reply_with(conn, request, types::OK_RESP, &body)
    }

    pub fn reply_error(
        &self,
        conn: &Connection,
        request: &FrameHeader,
        code: ErrorCode,
        message: &str,
    ) -> bool {
        let body = Reply::new(request.msg_id, code.code(), message);
        self.reply_with(conn, request, types::ERR_RESP, &body)
    }
}
