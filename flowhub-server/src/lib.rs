//! # flowhub-server
//!
//! Broker for flowhub.
//!
//! This crate provides:
//! - The single-task frame router with per-type handlers
//! - Per-connection mailboxes and read/write pumps over WebSocket
//! - Built-in handlers for device, manager and relay authentication
//! - The relay's upstream parent link with signed handshake and reconnect
//! - An in-memory device directory and tree-scoped authorization
//! - Prometheus metrics

pub mod authz;
pub mod broker;
pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod parent_auth;
pub mod parent_link;
pub mod server;

pub use broker::{BrokerEvent, BrokerHandle, FrameHandler, Router, RouterStats};
pub use config::{AuthConfig, Config, NetworkConfig, NodeConfig, RelayConfig};
pub use connection::{Connection, EnqueueError, PeerInfo, PumpConfig};
pub use directory::{DeviceDirectory, DeviceRecord, DeviceRole, MemoryDirectory};
pub use error::{AuthError, ServerError};
pub use handler::{install_builtin_handlers, HandlerContext};
pub use parent_auth::ParentAuthVerifier;
pub use parent_link::{LinkState, ParentLink, ParentLinkConfig};
pub use server::{Server, ServerConfig};
