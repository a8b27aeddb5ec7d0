//! Built-in frame handlers.
//!
//! These cover the hub's own request types: device login, manager login,
//! registration, the relay handshake, keepalive and device listing.
//! Everything else is routed by target uid.

use crate::authz::{self, AuthContext};
use crate::broker::{FrameHandler, Router};
use crate::connection::Connection;
use crate::directory::{DeviceDirectory, DeviceRecord, DirectoryError};
use crate::error::AuthError;
use crate::parent_auth::ParentAuthVerifier;
use bytes::Bytes;
use flowhub_protocol::message::{
    AuthReq, DeviceItem, ManagerAuthReq, ManagerAuthResp, ParentAuthReq, ParentAuthResp,
    QueryNodesResp, RegisterReq, RegisterResp,
};
use flowhub_protocol::{now_millis, types, ErrorCode, FrameHeader, Payload};
use std::sync::Arc;
use uuid::Uuid;

/// Default lease announced to relays.
pub const DEFAULT_LEASE_SECS: u32 = 30;

/// State shared by the built-in handlers.
pub struct HandlerContext {
    directory: Arc<dyn DeviceDirectory>,
    verifier: Option<ParentAuthVerifier>,
    lease_secs: u32,
}

impl HandlerContext {
    pub fn new(directory: Arc<dyn DeviceDirectory>) -> Self {
        Self {
            directory,
            verifier: None,
            lease_secs: DEFAULT_LEASE_SECS,
        }
    }

    /// Accepts relay handshakes checked by `verifier`.
    pub fn with_parent_auth(mut self, verifier: ParentAuthVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_lease_secs(mut self, lease_secs: u32) -> Self {
        self.lease_secs = lease_secs;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Builtin {
    Auth,
    ManagerAuth,
    Register,
    ParentAuth,
    Keepalive,
    QueryNodes,
}

/// One built-in request type bound to the shared context.
pub struct BuiltinHandler {
    kind: Builtin,
    ctx: Arc<HandlerContext>,
}

/// Registers every built-in handler on `router`. The relay handshake is only
/// accepted when the context carries a verifier.
pub fn install_builtin_handlers(router: &mut Router, ctx: HandlerContext) {
    let ctx = Arc::new(ctx);
    let mut kinds = vec![
        (types::AUTH_REQ, Builtin::Auth),
        (types::MANAGER_AUTH_REQ, Builtin::ManagerAuth),
        (types::REGISTER_REQ, Builtin::Register),
        (types::KEEPALIVE_REQ, Builtin::Keepalive),
        (types::QUERY_NODES_REQ, Builtin::QueryNodes),
    ];
    if ctx.verifier.is_some() {
        kinds.push((types::PARENT_AUTH_REQ, Builtin::ParentAuth));
    }
    for (type_id, kind) in kinds {
        router.register_handler(
            type_id,
            BuiltinHandler {
                kind,
                ctx: ctx.clone(),
            },
        );
    }
}

impl FrameHandler for BuiltinHandler {
    fn handle(
        &self,
        router: &mut Router,
        conn: &Arc<Connection>,
        header: &FrameHeader,
        payload: &[u8],
    ) {
        match self.kind {
            Builtin::Auth => self.handle_auth(router, conn, header, payload),
            Builtin::ManagerAuth => self.handle_manager_auth(router, conn, header, payload),
            Builtin::Register => self.handle_register(router, conn, header, payload),
            Builtin::ParentAuth => self.handle_parent_auth(router, conn, header, payload),
            Builtin::Keepalive => {
                router.reply_ok(conn, header, "pong");
            }
            Builtin::QueryNodes => self.handle_query_nodes(router, conn, header),
        }
    }
}

fn record_auth(router: &Router, kind: &str, ok: bool) {
    if let Some(metrics) = router.metrics() {
        metrics.record_auth(kind, ok);
    }
}

fn decode_or_reject<P: Payload>(
    router: &Router,
    conn: &Connection,
    header: &FrameHeader,
    payload: &[u8],
) -> Option<P> {
    match P::decode(payload) {
        Ok(req) => Some(req),
        Err(e) => {
            tracing::warn!("[{}] Malformed {}: {}", conn, header.type_id, e);
            router.reply_error(conn, header, ErrorCode::BadRequest, "bad request");
            None
        }
    }
}

impl BuiltinHandler {
    fn handle_auth(
        &self,
        router: &mut Router,
        conn: &Arc<Connection>,
        header: &FrameHeader,
        payload: &[u8],
    ) {
        let Some(req) = decode_or_reject::<AuthReq>(router, conn, header, payload) else {
            return;
        };

        let record = match self
            .ctx
            .directory
            .authenticate_device(req.device_uid, &req.secret)
        {
            Some(record) => record,
            None => {
                tracing::warn!("[{}] Login failed for uid {}", conn, req.device_uid);
                record_auth(router, "device", false);
                router.reply_error(conn, header, ErrorCode::Unauthorized, "invalid credentials");
                return;
            }
        };
        if !record.approved {
            record_auth(router, "device", false);
            router.reply_error(conn, header, ErrorCode::Forbidden, "device not approved");
            return;
        }

        router.promote(conn, record.uid);
        record_auth(router, "device", true);
        tracing::info!("[{}] Device {} authenticated", conn, record.uid);
        router.reply_ok(conn, header, "ok");
    }

    fn handle_manager_auth(
        &self,
        router: &mut Router,
        conn: &Arc<Connection>,
        header: &FrameHeader,
        payload: &[u8],
    ) {
        let Some(req) = decode_or_reject::<ManagerAuthReq>(router, conn, header, payload) else {
            return;
        };

        let Some(record) = self.ctx.directory.authenticate_manager(&req.token) else {
            tracing::warn!("[{}] Manager login failed", conn);
            record_auth(router, "manager", false);
            router.reply_error(conn, header, ErrorCode::Unauthorized, "invalid token");
            return;
        };

        router.promote(conn, record.uid);
        record_auth(router, "manager", true);
        tracing::info!("[{}] Manager authenticated as {}", conn, record.uid);
        let resp = ManagerAuthResp {
            request_id: header.msg_id,
            device_uid: record.uid,
            role: record.role.to_string(),
        };
        router.reply_with(conn, header, types::MANAGER_AUTH_RESP, &resp);
    }

    fn handle_register(
        &self,
        router: &mut Router,
        conn: &Arc<Connection>,
        header: &FrameHeader,
        payload: &[u8],
    ) {
        let Some(req) = decode_or_reject::<RegisterReq>(router, conn, header, payload) else {
            return;
        };

        match self.ctx.directory.register_device(&req.hardware_id) {
            Ok((record, secret)) => {
                if record.approved {
                    router.promote(conn, record.uid);
                }
                tracing::info!(
                    "[{}] Registered {} as uid {} (approved={})",
                    conn,
                    record.hardware_id,
                    record.uid,
                    record.approved
                );
                let resp = RegisterResp {
                    request_id: header.msg_id,
                    device_uid: record.uid,
                    secret,
                };
                router.reply_with(conn, header, types::REGISTER_RESP, &resp);
            }
            Err(e) => {
                let code = match e {
                    DirectoryError::AlreadyRegistered(_) | DirectoryError::UidInUse(_) => {
                        ErrorCode::Conflict
                    }
                    DirectoryError::EmptyHardwareId => ErrorCode::BadRequest,
                };
                router.reply_error(conn, header, code, &e.to_string());
            }
        }
    }

    fn handle_parent_auth(
        &self,
        router: &mut Router,
        conn: &Arc<Connection>,
        header: &FrameHeader,
        payload: &[u8],
    ) {
        let Some(verifier) = self.ctx.verifier.as_ref() else {
            router.reply_error(conn, header, ErrorCode::Forbidden, "relays not accepted");
            return;
        };
        let Some(req) = decode_or_reject::<ParentAuthReq>(router, conn, header, payload) else {
            return;
        };

        match self.admit_relay(verifier, &req) {
            Ok(record) => {
                router.promote(conn, record.uid);
                record_auth(router, "parent", true);
                tracing::info!(
                    "[{}] Child {} linked as uid {} ({})",
                    conn,
                    record.hardware_id,
                    record.uid,
                    record.role
                );
                let resp = ParentAuthResp {
                    request_id: header.msg_id,
                    device_uid: record.uid,
                    session_id: Uuid::new_v4().into_bytes(),
                    lease_secs: self.ctx.lease_secs,
                    continuation: Bytes::new(),
                };
                router.reply_with(conn, header, types::PARENT_AUTH_RESP, &resp);
            }
            Err(e) => {
                tracing::warn!(
                    "[{}] Handshake from {:?} rejected: {}",
                    conn,
                    req.hardware_id,
                    e
                );
                record_auth(router, "parent", false);
                router.reply_error(conn, header, e.error_code(), &e.to_string());
            }
        }
    }

    fn admit_relay(
        &self,
        verifier: &ParentAuthVerifier,
        req: &ParentAuthReq,
    ) -> Result<DeviceRecord, AuthError> {
        verifier.verify(req, now_millis())?;
        let record = self
            .ctx
            .directory
            .ensure_device(&req.hardware_id, &req.capabilities)
            .map_err(|e| AuthError::Directory(e.to_string()))?;
        if !record.approved {
            return Err(AuthError::NotApproved);
        }
        Ok(record)
    }

    fn handle_query_nodes(
        &self,
        router: &mut Router,
        conn: &Arc<Connection>,
        header: &FrameHeader,
    ) {
        let uid = conn.uid();
        if uid == 0 {
            router.reply_error(conn, header, ErrorCode::Unauthorized, "not authenticated");
            return;
        }

        let directory = self.ctx.directory.as_ref();
        let ctx = directory
            .find(uid)
            .map(|r| AuthContext::from_permissions(r.permissions))
            .unwrap_or_default();
        let devices: Vec<DeviceItem> = authz::visible_devices(directory, &ctx, uid)
            .into_iter()
            .filter_map(|uid| directory.find(uid))
            .map(|r| DeviceItem {
                uid: r.uid,
                hardware_id: r.hardware_id,
                role: r.role.to_string(),
                name: r.name,
                parent_uid: r.parent_uid,
            })
            .collect();

        let resp = QueryNodesResp {
            request_id: header.msg_id,
            devices,
        };
        router.reply_with(conn, header, types::QUERY_NODES_RESP, &resp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::PeerInfo;
    use crate::directory::{hash_secret, DeviceRole, MemoryDirectory};
    use crate::parent_auth::build_request;
    use flowhub_protocol::message::Reply;
    use flowhub_protocol::{decode_frame, encode_frame};
    use tokio::sync::mpsc;

    const HUB: u64 = 1;
    const SECRET: &[u8] = b"relay-secret";

    fn directory(auto_approve: bool) -> Arc<MemoryDirectory> {
        let dir = MemoryDirectory::new(auto_approve)
            .with_owner(HUB)
            .with_manager_hashes([hash_secret("admin")]);
        dir.insert(DeviceRecord::new(HUB, "hub", DeviceRole::Hub), None)
            .unwrap();
        dir.insert(
            DeviceRecord::new(10, "sensor-10", DeviceRole::Node).with_parent(HUB),
            Some("pw"),
        )
        .unwrap();
        dir.insert(
            DeviceRecord::new(11, "sensor-11", DeviceRole::Node).with_parent(10),
            Some("pw"),
        )
        .unwrap();
        Arc::new(dir)
    }

    fn router_with(dir: Arc<MemoryDirectory>) -> Router {
        let mut router = Router::new(HUB);
        let ctx = HandlerContext::new(dir).with_parent_auth(ParentAuthVerifier::new(SECRET));
        install_builtin_handlers(&mut router, ctx);
        router
    }

    fn connect(router: &mut Router) -> (Arc<Connection>, mpsc::Receiver<Bytes>) {
        let (conn, rx) = Connection::new(PeerInfo::default(), 8);
        router.register(conn.clone());
        (conn, rx)
    }

    fn request<P: Payload>(type_id: u16, body: &P) -> Bytes {
        let header = FrameHeader::new(type_id, 4242, 0, HUB);
        encode_frame(&header, &body.encode().unwrap())
    }

    fn reply(rx: &mut mpsc::Receiver<Bytes>) -> (FrameHeader, Bytes) {
        let frame = rx.try_recv().unwrap();
        let (header, payload) = decode_frame(&frame).unwrap();
        (header, Bytes::copy_from_slice(payload))
    }

    #[test]
    fn test_device_auth_success() {
        let mut router = router_with(directory(true));
        let (conn, mut rx) = connect(&mut router);

        let req = AuthReq {
            device_uid: 10,
            secret: "pw".into(),
        };
        router.route_frame(&conn, request(types::AUTH_REQ, &req));

        let (header, _) = reply(&mut rx);
        assert_eq!(header.type_id, types::OK_RESP);
        assert_eq!(header.msg_id, 4242);
        assert_eq!(header.target, 10);
        assert_eq!(conn.uid(), 10);
    }

    #[test]
    fn test_device_auth_failure() {
        let mut router = router_with(directory(true));
        let (conn, mut rx) = connect(&mut router);

        let req = AuthReq {
            device_uid: 10,
            secret: "bad".into(),
        };
        router.route_frame(&conn, request(types::AUTH_REQ, &req));

        let (header, payload) = reply(&mut rx);
        assert_eq!(header.type_id, types::ERR_RESP);
        assert_eq!(Reply::decode(&payload).unwrap().code, 401);
        assert!(!conn.is_authenticated());
    }

    #[test]
    fn test_malformed_request() {
        let mut router = router_with(directory(true));
        let (conn, mut rx) = connect(&mut router);

        let header = FrameHeader::new(types::AUTH_REQ, 1, 0, HUB);
        router.route_frame(&conn, encode_frame(&header, &[0x01]));

        let (header, payload) = reply(&mut rx);
        assert_eq!(header.type_id, types::ERR_RESP);
        assert_eq!(Reply::decode(&payload).unwrap().code, 400);
    }

    #[test]
    fn test_manager_auth() {
        let mut router = router_with(directory(true));
        let (conn, mut rx) = connect(&mut router);

        let req = ManagerAuthReq {
            token: "admin".into(),
        };
        router.route_frame(&conn, request(types::MANAGER_AUTH_REQ, &req));

        let (header, payload) = reply(&mut rx);
        assert_eq!(header.type_id, types::MANAGER_AUTH_RESP);
        let resp = ManagerAuthResp::decode(&payload).unwrap();
        assert_eq!(resp.request_id, 4242);
        assert_eq!(resp.role, "manager");
        assert_eq!(conn.uid(), resp.device_uid);
    }

    #[test]
    fn test_register_then_login() {
        let dir = directory(true);
        let mut router = router_with(dir.clone());
        let (conn, mut rx) = connect(&mut router);

        let req = RegisterReq {
            hardware_id: "board-x".into(),
        };
        router.route_frame(&conn, request(types::REGISTER_REQ, &req));
        let (header, payload) = reply(&mut rx);
        assert_eq!(header.type_id, types::REGISTER_RESP);
        let resp = RegisterResp::decode(&payload).unwrap();
        assert_eq!(conn.uid(), resp.device_uid);
        assert!(dir.authenticate_device(resp.device_uid, &resp.secret).is_some());

        router.route_frame(&conn, request(types::REGISTER_REQ, &req));
        let (header, payload) = reply(&mut rx);
        assert_eq!(header.type_id, types::ERR_RESP);
        assert_eq!(Reply::decode(&payload).unwrap().code, 409);
    }

    #[test]
    fn test_keepalive() {
        let mut router = router_with(directory(true));
        let (conn, mut rx) = connect(&mut router);
        let keepalive = FrameHeader::new(types::KEEPALIVE_REQ, 3, 0, HUB);
        router.route_frame(&conn, encode_frame(&keepalive, &[]));
        let (header, payload) = reply(&mut rx);
        assert_eq!(header.type_id, types::OK_RESP);
        assert_eq!(Reply::decode(&payload).unwrap().message, "pong");
    }

    #[test]
    fn test_parent_auth_success() {
        let mut router = router_with(directory(true));
        let (conn, mut rx) = connect(&mut router);

        let req = build_request(SECRET, "relay-a", "relay", now_millis()).unwrap();
        router.route_frame(&conn, request(types::PARENT_AUTH_REQ, &req));

        let (header, payload) = reply(&mut rx);
        assert_eq!(header.type_id, types::PARENT_AUTH_RESP);
        let resp = ParentAuthResp::decode(&payload).unwrap();
        assert_eq!(resp.request_id, 4242);
        assert_eq!(resp.lease_secs, DEFAULT_LEASE_SECS);
        assert!(resp.continuation.is_empty());
        assert_eq!(conn.uid(), resp.device_uid);
        assert_eq!(header.target, resp.device_uid);
    }

    #[test]
    fn test_parent_auth_replay() {
        let mut router = router_with(directory(true));
        let (conn, mut rx) = connect(&mut router);

        let req = build_request(SECRET, "relay-a", "relay", now_millis()).unwrap();
        router.route_frame(&conn, request(types::PARENT_AUTH_REQ, &req));
        assert_eq!(reply(&mut rx).0.type_id, types::PARENT_AUTH_RESP);

        let (other, mut other_rx) = connect(&mut router);
        router.route_frame(&other, request(types::PARENT_AUTH_REQ, &req));
        let (header, payload) = reply(&mut other_rx);
        assert_eq!(header.type_id, types::ERR_RESP);
        let body = Reply::decode(&payload).unwrap();
        assert_eq!(body.code, 400);
        assert_eq!(body.message, "replay detected");
        assert!(!other.is_authenticated());
    }

    #[test]
    fn test_parent_auth_bad_signature() {
        let mut router = router_with(directory(true));
        let (conn, mut rx) = connect(&mut router);

        let req = build_request(b"wrong", "relay-a", "relay", now_millis()).unwrap();
        router.route_frame(&conn, request(types::PARENT_AUTH_REQ, &req));

        let (_, payload) = reply(&mut rx);
        assert_eq!(Reply::decode(&payload).unwrap().code, 401);
    }

    #[test]
    fn test_parent_auth_not_approved() {
        let mut router = router_with(directory(false));
        let (conn, mut rx) = connect(&mut router);

        let req = build_request(SECRET, "relay-new", "relay", now_millis()).unwrap();
        router.route_frame(&conn, request(types::PARENT_AUTH_REQ, &req));

        let (_, payload) = reply(&mut rx);
        assert_eq!(Reply::decode(&payload).unwrap().code, 403);
        assert!(!conn.is_authenticated());
    }

    #[test]
    fn test_parent_auth_not_installed_without_verifier() {
        let mut router = Router::new(HUB);
        install_builtin_handlers(&mut router, HandlerContext::new(directory(true)));
        assert!(!router.has_handler(types::PARENT_AUTH_REQ));
        assert!(router.has_handler(types::AUTH_REQ));
    }

    #[test]
    fn test_query_nodes_scoped_to_subtree() {
        let mut router = router_with(directory(true));
        let (conn, mut rx) = connect(&mut router);
        router.promote(&conn, 10);

        let query = FrameHeader::new(types::QUERY_NODES_REQ, 9, 10, HUB);
        router.route_frame(&conn, encode_frame(&query, &[]));
        let (header, payload) = reply(&mut rx);
        assert_eq!(header.type_id, types::QUERY_NODES_RESP);
        let resp = QueryNodesResp::decode(&payload).unwrap();
        let uids: Vec<u64> = resp.devices.iter().map(|d| d.uid).collect();
        assert_eq!(uids, vec![10, 11]);
        assert_eq!(resp.devices[1].parent_uid, Some(10));
    }

    #[test]
    fn test_query_nodes_requires_auth() {
        let mut router = router_with(directory(true));
        let (conn, mut rx) = connect(&mut router);
        let query = FrameHeader::new(types::QUERY_NODES_REQ, 9, 0, HUB);
        router.route_frame(&conn, encode_frame(&query, &[]));
        let (_, payload) = reply(&mut rx);
        assert_eq!(Reply::decode(&payload).unwrap().code, 401);
    }
}
