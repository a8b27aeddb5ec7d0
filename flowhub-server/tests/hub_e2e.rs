//! End-to-end tests: a real hub on a loopback socket driven by flowhub-client.

use flowhub_client::{Client, ClientError, ConnectionConfig};
use flowhub_protocol::types;
use flowhub_server::connection::PumpConfig;
use flowhub_server::directory::hash_secret;
use flowhub_server::{
    install_builtin_handlers, BrokerEvent, BrokerHandle, Connection, DeviceRecord, DeviceRole,
    HandlerContext, LinkState, MemoryDirectory, ParentAuthVerifier, ParentLink, ParentLinkConfig,
    Router, Server, ServerConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const HUB: u64 = 1;
const RELAY_SECRET: &str = "e2e-relay-secret";
const WAIT: Duration = Duration::from_secs(5);

struct Hub {
    url: String,
    server: Arc<Server>,
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.server.shutdown();
    }
}

fn directory(hub_uid: u64, devices: &[(u64, u64)]) -> Arc<MemoryDirectory> {
    let dir = MemoryDirectory::new(true)
        .with_owner(hub_uid)
        .with_manager_hashes([hash_secret("admin-token")]);
    dir.insert(DeviceRecord::new(hub_uid, format!("hub-{}", hub_uid), DeviceRole::Hub), None)
        .unwrap();
    for &(uid, parent) in devices {
        dir.insert(
            DeviceRecord::new(uid, format!("dev-{}", uid), DeviceRole::Node).with_parent(parent),
            Some("pw"),
        )
        .unwrap();
    }
    Arc::new(dir)
}

async fn start_hub(
    router: Router,
    broker: BrokerHandle,
    inbound: mpsc::Receiver<BrokerEvent>,
) -> Hub {
    tokio::spawn(router.run(inbound));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(Server::new(ServerConfig::new(addr), broker));
    let runner = server.clone();
    tokio::spawn(async move { runner.serve(listener).await });

    Hub {
        url: format!("ws://{}/ws", addr),
        server,
    }
}

async fn simple_hub() -> Hub {
    let dir = directory(HUB, &[(10, HUB), (11, 10), (12, HUB)]);
    let (broker, inbound) = BrokerHandle::channel(256);
    let mut router = Router::new(HUB);
    install_builtin_handlers(&mut router, HandlerContext::new(dir));
    start_hub(router, broker, inbound).await
}

async fn client(url: &str) -> Client {
    let config = ConnectionConfig::new(url)
        .with_request_timeout(WAIT)
        .with_user_agent("e2e/1.0");
    let client = Client::new(config);
    client.connect().await.unwrap();
    client
}

async fn logged_in(url: &str, uid: u64) -> Client {
    let c = client(url).await;
    c.authenticate(uid, "pw").await.unwrap();
    c
}

#[tokio::test]
async fn test_keepalive_and_login() {
    let hub = simple_hub().await;
    let c = client(&hub.url).await;

    assert_eq!(c.keepalive().await.unwrap(), "pong");

    c.authenticate(10, "pw").await.unwrap();
    assert_eq!(c.device_uid(), 10);
    c.close().await.unwrap();
}

#[tokio::test]
async fn test_bad_credentials_rejected() {
    let hub = simple_hub().await;
    let c = client(&hub.url).await;

    match c.authenticate(10, "wrong").await {
        Err(ClientError::Rejected { code, .. }) => assert_eq!(code, 401),
        other => panic!("expected rejection, got {:?}", other),
    }
    assert_eq!(c.device_uid(), 0);
}

#[tokio::test]
async fn test_direct_message() {
    let hub = simple_hub().await;
    let sender = logged_in(&hub.url, 10).await;
    let receiver = logged_in(&hub.url, 11).await;
    let mut inbox = receiver.subscribe();

    sender.send_to(11, b"hello").await.unwrap();

    let frame = tokio::time::timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(frame.header.type_id, types::MSG_SEND);
    assert_eq!(frame.header.source, 10);
    assert_eq!(frame.header.target, 11);
    assert_eq!(&frame.payload[..], b"hello");
}

#[tokio::test]
async fn test_broadcast_skips_sender() {
    let hub = simple_hub().await;
    let sender = logged_in(&hub.url, 10).await;
    let a = logged_in(&hub.url, 11).await;
    let b = logged_in(&hub.url, 12).await;
    let mut own = sender.subscribe();
    let mut inbox_a = a.subscribe();
    let mut inbox_b = b.subscribe();

    sender.broadcast(b"all").await.unwrap();

    for inbox in [&mut inbox_a, &mut inbox_b] {
        let frame = tokio::time::timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"all");
        assert_eq!(frame.header.source, 10);
    }

    // A round trip after the broadcast proves nothing was queued for the sender.
    sender.keepalive().await.unwrap();
    assert!(own.try_recv().is_err());
}

#[tokio::test]
async fn test_unauthenticated_frames_dropped() {
    let hub = simple_hub().await;
    let anon = client(&hub.url).await;
    let receiver = logged_in(&hub.url, 11).await;
    let mut inbox = receiver.subscribe();

    anon.send_to(11, b"sneaky").await.unwrap();
    // Frames from one connection are routed in order, so once the keepalive
    // reply arrives the message has been dropped or delivered.
    anon.keepalive().await.unwrap();
    receiver.keepalive().await.unwrap();

    assert!(inbox.try_recv().is_err());
}

#[tokio::test]
async fn test_register_then_login() {
    let hub = simple_hub().await;
    let c = client(&hub.url).await;

    let resp = c.register("fresh-sensor").await.unwrap();
    assert_ne!(resp.device_uid, 0);
    assert!(!resp.secret.is_empty());

    match c.register("fresh-sensor").await {
        Err(ClientError::Rejected { code, .. }) => assert_eq!(code, 409),
        other => panic!("expected conflict, got {:?}", other),
    }

    let again = client(&hub.url).await;
    again.authenticate(resp.device_uid, &resp.secret).await.unwrap();
}

#[tokio::test]
async fn test_query_nodes_scoped_to_subtree() {
    let hub = simple_hub().await;
    let c = logged_in(&hub.url, 10).await;

    let uids: Vec<u64> = c.query_nodes().await.unwrap().iter().map(|d| d.uid).collect();
    assert_eq!(uids, vec![10, 11]);
}

#[tokio::test]
async fn test_manager_sees_everything() {
    let hub = simple_hub().await;
    let c = client(&hub.url).await;

    let resp = c.manager_auth("admin-token").await.unwrap();
    assert_eq!(resp.role, "manager");
    assert_eq!(c.device_uid(), resp.device_uid);

    let uids: Vec<u64> = c.query_nodes().await.unwrap().iter().map(|d| d.uid).collect();
    for uid in [HUB, 10, 11, 12, resp.device_uid] {
        assert!(uids.contains(&uid), "missing {}", uid);
    }
}

#[tokio::test]
async fn test_close_fails_requests() {
    let hub = simple_hub().await;
    let c = client(&hub.url).await;
    c.close().await.unwrap();

    assert!(c.keepalive().await.is_err());
}

#[tokio::test]
async fn test_relay_forwards_to_parent() {
    // Parent hub accepts relays signed with RELAY_SECRET.
    let parent_dir = directory(HUB, &[(11, HUB)]);
    let (parent_broker, parent_inbound) = BrokerHandle::channel(256);
    let mut parent_router = Router::new(HUB);
    install_builtin_handlers(
        &mut parent_router,
        HandlerContext::new(parent_dir).with_parent_auth(ParentAuthVerifier::new(RELAY_SECRET)),
    );
    let parent = start_hub(parent_router, parent_broker, parent_inbound).await;

    // Child hub forwards unresolved targets upward.
    let child_dir = directory(500, &[(600, 500)]);
    let (child_broker, child_inbound) = BrokerHandle::channel(256);
    let (parent_conn, parent_mailbox) = Connection::parent(64);
    let mut child_router = Router::new(500).with_parent(parent_conn.clone());
    install_builtin_handlers(&mut child_router, HandlerContext::new(child_dir));
    let child = start_hub(child_router, child_broker.clone(), child_inbound).await;

    let link = ParentLink::new(
        ParentLinkConfig {
            parent_url: parent.url.clone(),
            hardware_id: "relay-500".to_string(),
            secret: RELAY_SECRET.to_string(),
            reconnect_delay: Duration::from_millis(100),
            auth_timeout: WAIT,
            max_message_size: 1024 * 1024,
            pump: PumpConfig::default(),
        },
        child_broker,
        parent_conn,
        parent_mailbox,
    );
    let mut state = link.subscribe();
    tokio::spawn(link.run(child.server.subscribe_shutdown()));
    tokio::time::timeout(WAIT, state.wait_for(|s| *s == LinkState::Linked))
        .await
        .unwrap()
        .unwrap();

    let upstream = logged_in(&parent.url, 11).await;
    let mut inbox = upstream.subscribe();
    let downstream = logged_in(&child.url, 600).await;

    downstream.send_to(11, b"via relay").await.unwrap();

    let frame = tokio::time::timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(frame.header.source, 600);
    assert_eq!(&frame.payload[..], b"via relay");
}
