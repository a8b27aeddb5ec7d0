//! Message type registry and typed payloads.
//!
//! Type IDs are grouped in numbered bands by subsystem. The codec never
//! validates a type ID; unknown IDs decode and route like any other frame.

use crate::codec::{PayloadReader, PayloadWriter};
use crate::error::ProtocolError;
use bytes::Bytes;

/// Stable type identifiers.
pub mod types {
    // Replies
    pub const OK_RESP: u16 = 0;
    pub const ERR_RESP: u16 = 1;
    pub const KEEPALIVE_REQ: u16 = 2;

    // Messaging
    pub const MSG_SEND: u16 = 10;

    // Devices
    pub const QUERY_NODES_REQ: u16 = 20;
    pub const CREATE_DEVICE_REQ: u16 = 21;
    pub const UPDATE_DEVICE_REQ: u16 = 22;
    pub const DELETE_DEVICE_REQ: u16 = 23;
    pub const QUERY_NODES_RESP: u16 = 120;

    // Authentication
    pub const MANAGER_AUTH_REQ: u16 = 100;
    pub const MANAGER_AUTH_RESP: u16 = 101;
    pub const AUTH_REQ: u16 = 102;
    pub const REGISTER_REQ: u16 = 103;
    pub const REGISTER_RESP: u16 = 104;

    // Users
    pub const USER_LOGIN_REQ: u16 = 110;
    pub const USER_LOGIN_RESP: u16 = 111;
    pub const USER_ME_REQ: u16 = 112;
    pub const USER_ME_RESP: u16 = 113;
    pub const USER_LOGOUT_REQ: u16 = 114;
    pub const USER_LOGOUT_RESP: u16 = 115;
    pub const USER_LIST_REQ: u16 = 180;
    pub const USER_LIST_RESP: u16 = 181;
    pub const USER_CREATE_REQ: u16 = 182;
    pub const USER_CREATE_RESP: u16 = 183;
    pub const USER_UPDATE_REQ: u16 = 184;
    pub const USER_DELETE_REQ: u16 = 185;

    // System log
    pub const SYSTEM_LOG_LIST_REQ: u16 = 150;
    pub const SYSTEM_LOG_LIST_RESP: u16 = 151;

    // Variables
    pub const VAR_LIST_REQ: u16 = 160;
    pub const VAR_LIST_RESP: u16 = 161;
    pub const VAR_UPDATE_REQ: u16 = 162;
    pub const VAR_DELETE_REQ: u16 = 163;

    // Keys
    pub const KEY_LIST_REQ: u16 = 170;
    pub const KEY_LIST_RESP: u16 = 171;
    pub const KEY_CREATE_REQ: u16 = 172;
    pub const KEY_CREATE_RESP: u16 = 173;
    pub const KEY_UPDATE_REQ: u16 = 174;
    pub const KEY_DELETE_REQ: u16 = 175;
    pub const KEY_DEVICES_REQ: u16 = 176;
    pub const KEY_DEVICES_RESP: u16 = 177;

    // Parent link
    pub const PARENT_AUTH_REQ: u16 = 190;
    pub const PARENT_AUTH_RESP: u16 = 191;
}

/// Subsystem a type ID belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageBand {
    Reply,
    Messaging,
    Device,
    Auth,
    User,
    SystemLog,
    Variable,
    Key,
    ParentAuth,
}

/// Registry entry for a known type ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageType {
    pub id: u16,
    pub name: &'static str,
    pub band: MessageBand,
}

const REGISTRY: &[MessageType] = &[
    entry(types::OK_RESP, "OK_RESP", MessageBand::Reply),
    entry(types::ERR_RESP, "ERR_RESP", MessageBand::Reply),
    entry(types::KEEPALIVE_REQ, "KEEPALIVE_REQ", MessageBand::Reply),
    entry(types::MSG_SEND, "MSG_SEND", MessageBand::Messaging),
    entry(types::QUERY_NODES_REQ, "QUERY_NODES_REQ", MessageBand::Device),
    entry(types::CREATE_DEVICE_REQ, "CREATE_DEVICE_REQ", MessageBand::Device),
    entry(types::UPDATE_DEVICE_REQ, "UPDATE_DEVICE_REQ", MessageBand::Device),
    entry(types::DELETE_DEVICE_REQ, "DELETE_DEVICE_REQ", MessageBand::Device),
    entry(types::QUERY_NODES_RESP, "QUERY_NODES_RESP", MessageBand::Device),
    entry(types::MANAGER_AUTH_REQ, "MANAGER_AUTH_REQ", MessageBand::Auth),
    entry(types::MANAGER_AUTH_RESP, "MANAGER_AUTH_RESP", MessageBand::Auth),
    entry(types::AUTH_REQ, "AUTH_REQ", MessageBand::Auth),
    entry(types::REGISTER_REQ, "REGISTER_REQ", MessageBand::Auth),
    entry(types::REGISTER_RESP, "REGISTER_RESP", MessageBand::Auth),
    entry(types::USER_LOGIN_REQ, "USER_LOGIN_REQ", MessageBand::User),
    entry(types::USER_LOGIN_RESP, "USER_LOGIN_RESP", MessageBand::User),
    entry(types::USER_ME_REQ, "USER_ME_REQ", MessageBand::User),
    entry(types::USER_ME_RESP, "USER_ME_RESP", MessageBand::User),
    entry(types::USER_LOGOUT_REQ, "USER_LOGOUT_REQ", MessageBand::User),
    entry(types::USER_LOGOUT_RESP, "USER_LOGOUT_RESP", MessageBand::User),
    entry(types::USER_LIST_REQ, "USER_LIST_REQ", MessageBand::User),
    entry(types::USER_LIST_RESP, "USER_LIST_RESP", MessageBand::User),
    entry(types::USER_CREATE_REQ, "USER_CREATE_REQ", MessageBand::User),
    entry(types::USER_CREATE_RESP, "USER_CREATE_RESP", MessageBand::User),
    entry(types::USER_UPDATE_REQ, "USER_UPDATE_REQ", MessageBand::User),
    entry(types::USER_DELETE_REQ, "USER_DELETE_REQ", MessageBand::User),
    entry(types::SYSTEM_LOG_LIST_REQ, "SYSTEM_LOG_LIST_REQ", MessageBand::SystemLog),
    entry(types::SYSTEM_LOG_LIST_RESP, "SYSTEM_LOG_LIST_RESP", MessageBand::SystemLog),
    entry(types::VAR_LIST_REQ, "VAR_LIST_REQ", MessageBand::Variable),
    entry(types::VAR_LIST_RESP, "VAR_LIST_RESP", MessageBand::Variable),
    entry(types::VAR_UPDATE_REQ, "VAR_UPDATE_REQ", MessageBand::Variable),
    entry(types::VAR_DELETE_REQ, "VAR_DELETE_REQ", MessageBand::Variable),
    entry(types::KEY_LIST_REQ, "KEY_LIST_REQ", MessageBand::Key),
    entry(types::KEY_LIST_RESP, "KEY_LIST_RESP", MessageBand::Key),
    entry(types::KEY_CREATE_REQ, "KEY_CREATE_REQ", MessageBand::Key),
    entry(types::KEY_CREATE_RESP, "KEY_CREATE_RESP", MessageBand::Key),
    entry(types::KEY_UPDATE_REQ, "KEY_UPDATE_REQ", MessageBand::Key),
    entry(types::KEY_DELETE_REQ, "KEY_DELETE_REQ", MessageBand::Key),
    entry(types::KEY_DEVICES_REQ, "KEY_DEVICES_REQ", MessageBand::Key),
    entry(types::KEY_DEVICES_RESP, "KEY_DEVICES_RESP", MessageBand::Key),
    entry(types::PARENT_AUTH_REQ, "PARENT_AUTH_REQ", MessageBand::ParentAuth),
    entry(types::PARENT_AUTH_RESP, "PARENT_AUTH_RESP", MessageBand::ParentAuth),
];

const fn entry(id: u16, name: &'static str, band: MessageBand) -> MessageType {
    MessageType { id, name, band }
}

/// Looks up a known type ID.
pub fn lookup(type_id: u16) -> Option<&'static MessageType> {
    REGISTRY.iter().find(|t| t.id == type_id)
}

/// Returns a printable name for any type ID.
pub fn type_name(type_id: u16) -> &'static str {
    lookup(type_id).map(|t| t.name).unwrap_or("UNKNOWN")
}

/// A payload with a fixed wire layout.
pub trait Payload: Sized {
    fn encode_to(&self, w: &mut PayloadWriter) -> Result<(), ProtocolError>;

    fn decode_from(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError>;

    fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut w = PayloadWriter::with_capacity(64);
        self.encode_to(&mut w)?;
        Ok(w.finish())
    }

    fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        Self::decode_from(&mut PayloadReader::new(buf))
    }
}

/// Body of both `OK_RESP` and `ERR_RESP`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub request_id: u64,
    pub code: i32,
    pub message: String,
}

impl Reply {
    pub fn new(request_id: u64, code: i32, message: impl Into<String>) -> Self {
        Self {
            request_id,
            code,
            message: message.into(),
        }
    }
}

impl Payload for Reply {
    fn encode_to(&self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
        w.put_u64(self.request_id);
        w.put_i32(self.code);
        w.put_str(&self.message)
    }

    fn decode_from(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            request_id: r.get_u64()?,
            code: r.get_i32()?,
            message: r.get_string()?,
        })
    }
}

/// Device credential login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthReq {
    pub device_uid: u64,
    pub secret: String,
}

impl Payload for AuthReq {
    fn encode_to(&self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
        w.put_u64(self.device_uid);
        w.put_str(&self.secret)
    }

    fn decode_from(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            device_uid: r.get_u64()?,
            secret: r.get_string()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerAuthReq {
    pub token: String,
}

impl Payload for ManagerAuthReq {
    fn encode_to(&self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
        w.put_str(&self.token)
    }

    fn decode_from(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            token: r.get_string()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerAuthResp {
    pub request_id: u64,
    pub device_uid: u64,
    /// Empty when the device has no role.
    pub role: String,
}

impl Payload for ManagerAuthResp {
    fn encode_to(&self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
        w.put_u64(self.request_id);
        w.put_u64(self.device_uid);
        w.put_str(&self.role)
    }

    fn decode_from(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            request_id: r.get_u64()?,
            device_uid: r.get_u64()?,
            role: r.get_string()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterReq {
    pub hardware_id: String,
}

impl Payload for RegisterReq {
    fn encode_to(&self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
        w.put_str(&self.hardware_id)
    }

    fn decode_from(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            hardware_id: r.get_string()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterResp {
    pub request_id: u64,
    pub device_uid: u64,
    pub secret: String,
}

impl Payload for RegisterResp {
    fn encode_to(&self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
        w.put_u64(self.request_id);
        w.put_u64(self.device_uid);
        w.put_str(&self.secret)
    }

    fn decode_from(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            request_id: r.get_u64()?,
            device_uid: r.get_u64()?,
            secret: r.get_string()?,
        })
    }
}

/// Relay handshake request, signed with HMAC-SHA256.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentAuthReq {
    pub version: u16,
    pub timestamp_ms: i64,
    pub nonce: [u8; 16],
    pub hardware_id: String,
    pub capabilities: String,
    pub signature: [u8; 32],
}

impl ParentAuthReq {
    /// Bytes covered by the signature: `ts_le || nonce || hardware_id || capabilities`.
    pub fn signing_input(
        timestamp_ms: i64,
        nonce: &[u8; 16],
        hardware_id: &str,
        capabilities: &str,
    ) -> Vec<u8> {
        let mut input = Vec::with_capacity(8 + 16 + hardware_id.len() + capabilities.len());
        input.extend_from_slice(&timestamp_ms.to_le_bytes());
        input.extend_from_slice(nonce);
        input.extend_from_slice(hardware_id.as_bytes());
        input.extend_from_slice(capabilities.as_bytes());
        input
    }
}

impl Payload for ParentAuthReq {
    fn encode_to(&self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
        w.put_u16(self.version);
        w.put_i64(self.timestamp_ms);
        w.put_raw(&self.nonce);
        w.put_str(&self.hardware_id)?;
        w.put_str(&self.capabilities)?;
        w.put_raw(&self.signature);
        Ok(())
    }

    fn decode_from(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            version: r.get_u16()?,
            timestamp_ms: r.get_i64()?,
            nonce: r.get_array()?,
            hardware_id: r.get_string()?,
            capabilities: r.get_string()?,
            signature: r.get_array()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentAuthResp {
    pub request_id: u64,
    pub device_uid: u64,
    pub session_id: [u8; 16],
    pub lease_secs: u32,
    /// Reserved for pagination/continuation metadata; empty today.
    pub continuation: Bytes,
}

impl Payload for ParentAuthResp {
    fn encode_to(&self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
        w.put_u64(self.request_id);
        w.put_u64(self.device_uid);
        w.put_raw(&self.session_id);
        w.put_u32(self.lease_secs);
        w.put_bytes(&self.continuation)
    }

    fn decode_from(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            request_id: r.get_u64()?,
            device_uid: r.get_u64()?,
            session_id: r.get_array()?,
            lease_secs: r.get_u32()?,
            continuation: Bytes::copy_from_slice(r.get_bytes()?),
        })
    }
}

/// Compact device description used in node listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceItem {
    pub uid: u64,
    pub hardware_id: String,
    pub role: String,
    pub name: String,
    pub parent_uid: Option<u64>,
}

impl Payload for DeviceItem {
    fn encode_to(&self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
        let bitmap = u8::from(self.parent_uid.is_some());
        w.put_u8(bitmap);
        w.put_u64(self.uid);
        w.put_str(&self.hardware_id)?;
        w.put_str(&self.role)?;
        w.put_str(&self.name)?;
        if let Some(parent) = self.parent_uid {
            w.put_u64(parent);
        }
        Ok(())
    }

    fn decode_from(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        let bitmap = r.get_u8()?;
        let uid = r.get_u64()?;
        let hardware_id = r.get_string()?;
        let role = r.get_string()?;
        let name = r.get_string()?;
        let parent_uid = if bitmap & 0x01 != 0 {
            Some(r.get_u64()?)
        } else {
            None
        };
        Ok(Self {
            uid,
            hardware_id,
            role,
            name,
            parent_uid,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryNodesResp {
    pub request_id: u64,
    pub devices: Vec<DeviceItem>,
}

impl Payload for QueryNodesResp {
    fn encode_to(&self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
        w.put_u64(self.request_id);
        w.put_varint(self.devices.len() as u64);
        for device in &self.devices {
            device.encode_to(w)?;
        }
        Ok(())
    }

    fn decode_from(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        let request_id = r.get_u64()?;
        let count = r.get_varint()?;
        // Each item needs at least 1 + 8 + 3 * 2 bytes; cap the reservation by what is left.
        let cap = (count as usize).min(r.remaining() / 15);
        let mut devices = Vec::with_capacity(cap);
        for _ in 0..count {
            devices.push(DeviceItem::decode_from(r)?);
        }
        Ok(Self {
            request_id,
            devices,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known_types() {
        let t = lookup(types::PARENT_AUTH_REQ).unwrap();
        assert_eq!(t.name, "PARENT_AUTH_REQ");
        assert_eq!(t.band, MessageBand::ParentAuth);

        assert_eq!(lookup(types::OK_RESP).unwrap().band, MessageBand::Reply);
        assert_eq!(lookup(types::MSG_SEND).unwrap().band, MessageBand::Messaging);
        assert_eq!(lookup(types::VAR_LIST_REQ).unwrap().band, MessageBand::Variable);
    }

    #[test]
    fn test_lookup_unknown_type() {
        assert!(lookup(9999).is_none());
        assert_eq!(type_name(9999), "UNKNOWN");
    }

    #[test]
    fn test_registry_ids_unique() {
        let mut ids: Vec<u16> = REGISTRY.iter().map(|t| t.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), REGISTRY.len());
    }

    #[test]
    fn test_reply_layout() {
        let bytes = Reply::new(5, 401, "no").encode().unwrap();
        assert_eq!(&bytes[0..8], &5u64.to_le_bytes());
        assert_eq!(&bytes[8..12], &401i32.to_le_bytes());
        assert_eq!(&bytes[12..14], &2u16.to_le_bytes());
        assert_eq!(&bytes[14..], b"no");
        assert_eq!(Reply::decode(&bytes).unwrap(), Reply::new(5, 401, "no"));
    }

    #[test]
    fn test_parent_auth_req_roundtrip() {
        let req = ParentAuthReq {
            version: 1,
            timestamp_ms: 1_700_000_000_000,
            nonce: [3u8; 16],
            hardware_id: "relay-01".to_string(),
            capabilities: "relay".to_string(),
            signature: [9u8; 32],
        };
        let bytes = req.encode().unwrap();
        assert_eq!(
            bytes.len(),
            2 + 8 + 16 + (2 + 8) + (2 + 5) + 32,
            "fixed layout"
        );
        assert_eq!(ParentAuthReq::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn test_signing_input_order() {
        let input = ParentAuthReq::signing_input(1, &[2u8; 16], "hw", "caps");
        assert_eq!(&input[..8], &1i64.to_le_bytes());
        assert_eq!(&input[8..24], &[2u8; 16]);
        assert_eq!(&input[24..], b"hwcaps");
    }

    #[test]
    fn test_parent_auth_resp_roundtrip() {
        let resp = ParentAuthResp {
            request_id: 77,
            device_uid: 12,
            session_id: [1u8; 16],
            lease_secs: 30,
            continuation: Bytes::new(),
        };
        assert_eq!(
            ParentAuthResp::decode(&resp.encode().unwrap()).unwrap(),
            resp
        );
    }

    #[test]
    fn test_truncated_payload_is_error() {
        let bytes = ManagerAuthResp {
            request_id: 1,
            device_uid: 2,
            role: "manager".to_string(),
        }
        .encode()
        .unwrap();
        for cut in 0..bytes.len() {
            assert!(ManagerAuthResp::decode(&bytes[..cut]).is_err(), "cut {}", cut);
        }
    }

    #[test]
    fn test_query_nodes_resp() {
        let resp = QueryNodesResp {
            request_id: 3,
            devices: vec![
                DeviceItem {
                    uid: 1,
                    hardware_id: "hub".to_string(),
                    role: "hub".to_string(),
                    name: "root".to_string(),
                    parent_uid: None,
                },
                DeviceItem {
                    uid: 2,
                    hardware_id: "n-2".to_string(),
                    role: "node".to_string(),
                    name: "sensor".to_string(),
                    parent_uid: Some(1),
                },
            ],
        };
        let decoded = QueryNodesResp::decode(&resp.encode().unwrap()).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn test_query_nodes_resp_bogus_count() {
        let mut w = PayloadWriter::new();
        w.put_u64(1);
        w.put_varint(u64::MAX);
        let bytes = w.finish();
        assert!(QueryNodesResp::decode(&bytes).is_err());
    }
}
