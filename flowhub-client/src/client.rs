//! High-level client API.

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use bytes::Bytes;
use flowhub_protocol::message::*;
use flowhub_protocol::{types, Frame, FrameHeader, Payload};
use std::sync::Arc;
use tokio::sync::broadcast;

/// High-level client for a flowhub hub.
pub struct Client {
    conn: Arc<Connection>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            conn: Arc::new(Connection::new(config)),
        }
    }

    /// Connects to the hub.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.conn.connect().await
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    /// UID this client is authenticated as (0 before login).
    pub fn device_uid(&self) -> u64 {
        self.conn.device_uid()
    }

    /// Frames addressed to this client that are not replies.
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.conn.subscribe()
    }

    // =========================================================================
    // Helper methods
    // =========================================================================

    async fn request<P: Payload>(
        &self,
        type_id: u16,
        expected_type: u16,
        body: &P,
    ) -> Result<Bytes, ClientError> {
        let payload = body.encode()?;
        self.conn.send_request(type_id, expected_type, &payload).await
    }

    async fn request_empty(&self, type_id: u16, expected_type: u16) -> Result<Bytes, ClientError> {
        self.conn.send_request(type_id, expected_type, &[]).await
    }

    // =========================================================================
    // Authentication
    // =========================================================================

    /// Logs in as an existing device. On success outgoing frames carry `uid`
    /// as their source.
    pub async fn authenticate(&self, uid: u64, secret: &str) -> Result<(), ClientError> {
        let req = AuthReq {
            device_uid: uid,
            secret: secret.to_string(),
        };
        self.request(types::AUTH_REQ, types::OK_RESP, &req).await?;
        self.conn.set_device_uid(uid);
        Ok(())
    }

    /// Logs in with a manager token.
    pub async fn manager_auth(&self, token: &str) -> Result<ManagerAuthResp, ClientError> {
        let req = ManagerAuthReq {
            token: token.to_string(),
        };
        let payload = self
            .request(types::MANAGER_AUTH_REQ, types::MANAGER_AUTH_RESP, &req)
            .await?;
        let resp = ManagerAuthResp::decode(&payload)?;
        self.conn.set_device_uid(resp.device_uid);
        Ok(resp)
    }

    /// Registers a new device under `hardware_id` and returns its UID and
    /// generated secret.
    pub async fn register(&self, hardware_id: &str) -> Result<RegisterResp, ClientError> {
        let req = RegisterReq {
            hardware_id: hardware_id.to_string(),
        };
        let payload = self
            .request(types::REGISTER_REQ, types::REGISTER_RESP, &req)
            .await?;
        Ok(RegisterResp::decode(&payload)?)
    }

    // =========================================================================
    // System operations
    // =========================================================================

    /// Sends a keepalive and returns the hub's reply text.
    pub async fn keepalive(&self) -> Result<String, ClientError> {
        let payload = self
            .request_empty(types::KEEPALIVE_REQ, types::OK_RESP)
            .await?;
        Ok(Reply::decode(&payload)?.message)
    }

    /// Lists the devices visible to this client.
    pub async fn query_nodes(&self) -> Result<Vec<DeviceItem>, ClientError> {
        let payload = self
            .request_empty(types::QUERY_NODES_REQ, types::QUERY_NODES_RESP)
            .await?;
        Ok(QueryNodesResp::decode(&payload)?.devices)
    }

    // =========================================================================
    // Messaging
    // =========================================================================

    /// Sends `payload` to one device. No reply is expected.
    pub async fn send_to(&self, target: u64, payload: &[u8]) -> Result<(), ClientError> {
        let msg_id = self.conn.correlator().next_msg_id();
        let header = FrameHeader::new(types::MSG_SEND, msg_id, self.device_uid(), target);
        self.conn.send_frame(&header, payload).await
    }

    /// Sends `payload` to every device reachable from the hub.
    pub async fn broadcast(&self, payload: &[u8]) -> Result<(), ClientError> {
        self.send_to(0, payload).await
    }
}
