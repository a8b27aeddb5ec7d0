//! # flowhub-client
//!
//! Client library for flowhub.
//!
//! This crate provides:
//! - WebSocket connection with binary subprotocol negotiation
//! - Request/reply correlation by message id with timeouts
//! - A short-lived cache for reply payloads
//! - High-level API for authentication, node queries and messaging

pub mod cache;
pub mod client;
pub mod connection;
pub mod correlator;
pub mod error;

pub use cache::ResponseCache;
pub use client::Client;
pub use connection::{Connection, ConnectionConfig};
pub use correlator::{next_msg_id, Correlator, Waiter};
pub use error::ClientError;
