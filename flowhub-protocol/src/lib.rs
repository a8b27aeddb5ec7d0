//! # flowhub-protocol
//!
//! Wire protocol implementation for flowhub.
//!
//! This crate provides:
//! - The fixed 38-byte little-endian frame header and frame encode/decode
//! - Payload primitives (fixed-width integers, varints, length-prefixed fields)
//! - The message type registry and typed payloads for the built-in messages
//! - Error codes carried in error replies

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{PayloadReader, PayloadWriter};
pub use error::{ErrorCode, ProtocolError};
pub use frame::{decode_frame, encode_frame, Frame, FrameHeader, HEADER_SIZE};
pub use message::{types, MessageBand, MessageType, Payload};

/// Parent-auth handshake version sent by relays.
pub const PROTOCOL_VERSION: u16 = 1;

/// WebSocket subprotocol token that selects binary framing.
pub const SUBPROTOCOL: &str = "myflowhub.bin.v1";

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
