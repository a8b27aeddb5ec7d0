//! flowhub - hierarchical device-messaging hub
//!
//! Accepts devices over WebSocket, routes binary frames between them and,
//! in relay mode, forwards unresolved traffic to a parent hub.

use flowhub_server::directory::{DeviceRecord, DeviceRole};
use flowhub_server::metrics::{run_metrics_server, Metrics};
use flowhub_server::{
    install_builtin_handlers, BrokerHandle, Config, Connection, HandlerContext, MemoryDirectory,
    ParentAuthVerifier, ParentLink, ParentLinkConfig, PumpConfig, Router, Server, ServerConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if FLOWHUB_CONFIG is set, then env overrides)
    let config_path = std::env::var("FLOWHUB_CONFIG").ok();
    let mut config = match Config::load() {
        Ok(c) => {
            if let Some(ref path) = config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    // Load auth secrets from external file if configured
    if let Err(e) = config.auth.load_secrets() {
        tracing::error!("Failed to load auth secrets: {}", e);
        return Err(e.into());
    }
    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    let hub_uid = config.node.device_uid;
    tracing::info!("Starting flowhub");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Hub: uid {} ({})", hub_uid, config.node.hardware_id);
    tracing::info!("  Manager tokens: {}", config.auth.manager_token_hashes.len());
    tracing::info!(
        "  Relay children: {}",
        if config.auth.relay_secret.is_some() { "accepted" } else { "rejected" }
    );

    // Metrics
    let metrics = if config.metrics.enabled {
        Some(Arc::new(Metrics::new()?))
    } else {
        None
    };

    // Device directory
    let directory = MemoryDirectory::new(config.auth.auto_approve)
        .with_owner(hub_uid)
        .with_manager_hashes(config.auth.manager_token_hashes.iter().cloned());
    let mut hub_record =
        DeviceRecord::new(hub_uid, config.node.hardware_id.clone(), DeviceRole::Hub);
    hub_record.name = config.node.name.clone();
    directory.insert(hub_record, None)?;
    directory.seed(&config.devices)?;
    tracing::info!("  Devices: {} known", directory.len());
    let directory = Arc::new(directory);

    // Router
    let (broker, inbound) = BrokerHandle::channel(config.network.inbound_queue_capacity);
    let mut router = Router::new(hub_uid);
    if let Some(ref m) = metrics {
        router = router.with_metrics(m.clone());
    }

    let parent = if config.relay.enabled {
        let (conn, mailbox) = Connection::parent(config.relay.forward_capacity);
        router = router.with_parent(conn.clone());
        Some((conn, mailbox))
    } else {
        None
    };

    let mut ctx = HandlerContext::new(directory).with_lease_secs(config.auth.lease_secs);
    if let Some(ref secret) = config.auth.relay_secret {
        let verifier = ParentAuthVerifier::new(secret.as_bytes())
            .with_max_skew(config.auth.max_clock_skew())
            .with_nonce_ttl(config.auth.nonce_ttl());
        ctx = ctx.with_parent_auth(verifier);
    }
    install_builtin_handlers(&mut router, ctx);
    let router_handle = tokio::spawn(router.run(inbound));

    // Server
    let mut server_config = ServerConfig::new(config.network.bind_addr);
    server_config.max_connections = config.network.max_connections;
    server_config.mailbox_capacity = config.network.mailbox_capacity;
    server_config.max_message_size = config.network.max_message_size;
    server_config.pump = config.network.pump_config();
    if let Some(ref m) = metrics {
        server_config = server_config.with_metrics(m.clone());
    }
    let server = Arc::new(Server::new(server_config, broker.clone()));

    // Metrics server
    if let Some(ref m) = metrics {
        let addr = config.metrics.bind_addr;
        let m = m.clone();
        let shutdown = server.subscribe_shutdown();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, m, shutdown).await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    }

    // Parent link
    if let Some((conn, mailbox)) = parent {
        let link_config = ParentLinkConfig {
            parent_url: config.relay.parent_url.clone().unwrap_or_default(),
            hardware_id: config.relay_hardware_id().to_string(),
            secret: config.relay_secret().unwrap_or_default().to_string(),
            reconnect_delay: config.relay.reconnect_delay(),
            auth_timeout: config.relay.auth_timeout(),
            max_message_size: config.network.max_message_size,
            pump: PumpConfig {
                ping_interval: Duration::from_secs(config.relay.ping_interval_secs),
                ..config.network.pump_config()
            },
        };
        tracing::info!("  Relay: parent {}", link_config.parent_url);
        let mut link = ParentLink::new(link_config, broker.clone(), conn, mailbox);
        if let Some(ref m) = metrics {
            link = link.with_metrics(m.clone());
        }
        tokio::spawn(link.run(server.subscribe_shutdown()));
    }
    drop(broker);

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    // The router stops once every broker handle is gone.
    drop(server);
    let _ = tokio::time::timeout(Duration::from_secs(5), router_handle).await;

    tracing::info!("Server stopped");
    Ok(())
}
