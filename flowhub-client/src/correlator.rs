//! Request/reply correlation.
//!
//! A request registers a single-shot waiter under its message id before the
//! frame is sent. Exactly one of three parties consumes that waiter by
//! removing it from the pending map: the reader delivering the reply, the
//! timeout path, or [`Correlator::close`]. Whoever removes the entry owns the
//! outcome, so the three results never overlap. A [`Waiter`] dropped before
//! any of them (a cancelled request future) takes its entry with it.

use crate::cache::ResponseCache;
use crate::error::ClientError;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use flowhub_protocol::message::Reply;
use flowhub_protocol::{types, FrameHeader, Payload};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;

static MSG_SEQ: AtomicU64 = AtomicU64::new(0);

/// Generates a process-wide message id.
///
/// The timestamp occupies the high bits and a shared counter is XORed into
/// the low bits. Collisions are improbable, not impossible; the pending map
/// rejects an id that is already in flight. Never returns 0.
pub fn next_msg_id() -> u64 {
    loop {
        let millis = chrono::Utc::now().timestamp_millis() as u64;
        let seq = MSG_SEQ.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let id = (millis << 20) ^ seq;
        if id != 0 {
            return id;
        }
    }
}

type PendingMap = DashMap<u64, oneshot::Sender<FrameHeader>>;

/// Registered interest in the reply to one message id.
#[derive(Debug)]
pub struct Waiter {
    msg_id: u64,
    rx: oneshot::Receiver<FrameHeader>,
    pending: Weak<PendingMap>,
}

impl Waiter {
    pub fn msg_id(&self) -> u64 {
        self.msg_id
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        // Only the entry paired with this receiver is removed.
        self.rx.close();
        if let Some(pending) = self.pending.upgrade() {
            pending.remove_if(&self.msg_id, |_, tx| tx.is_closed());
        }
    }
}

/// Pending waiters plus the payload side cache.
pub struct Correlator {
    pending: Arc<PendingMap>,
    payloads: ResponseCache,
    closed: AtomicBool,
}

impl Correlator {
    pub fn new() -> Self {
        Self::with_cache(ResponseCache::default())
    }

    pub fn with_cache(payloads: ResponseCache) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            payloads,
            closed: AtomicBool::new(false),
        }
    }

    pub fn next_msg_id(&self) -> u64 {
        next_msg_id()
    }

    /// Registers a waiter for `msg_id`.
    pub fn register(&self, msg_id: u64) -> Result<Waiter, ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }

        let (tx, rx) = oneshot::channel();
        match self.pending.entry(msg_id) {
            Entry::Occupied(_) => return Err(ClientError::DuplicateMsgId),
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        // close() may have drained the map between the check and the insert.
        if self.is_closed() {
            self.pending.remove(&msg_id);
            return Err(ClientError::Closed);
        }

        Ok(Waiter {
            msg_id,
            rx,
            pending: Arc::downgrade(&self.pending),
        })
    }

    /// Drops the waiter for `msg_id` without resolving it.
    pub fn cancel(&self, msg_id: u64) {
        self.pending.remove(&msg_id);
    }

    /// Hands a reply to its waiter. Returns false when nobody is waiting for
    /// `header.msg_id`, in which case the payload is not cached.
    pub fn deliver(&self, header: FrameHeader, payload: Bytes) -> bool {
        let Some((msg_id, tx)) = self.pending.remove(&header.msg_id) else {
            return false;
        };

        self.payloads.put(msg_id, payload);
        if tx.send(header).is_err() {
            // Waiter future was dropped.
            self.payloads.take_if_present(msg_id);
        }
        true
    }

    /// Waits for the reply, a timeout, or close, whichever claims the waiter.
    ///
    /// An `ERR_RESP` reply becomes [`ClientError::Rejected`]; any other type
    /// that is not `expected_type` becomes [`ClientError::UnexpectedType`].
    pub async fn wait(
        &self,
        mut waiter: Waiter,
        expected_type: u16,
        timeout: Duration,
    ) -> Result<Bytes, ClientError> {
        let msg_id = waiter.msg_id;

        let header = match tokio::time::timeout(timeout, &mut waiter.rx).await {
            Ok(Ok(header)) => header,
            Ok(Err(_)) => return Err(ClientError::Closed),
            Err(_) => {
                if self.pending.remove(&msg_id).is_some() {
                    return Err(ClientError::Timeout);
                }
                // The reader or close() claimed the waiter just as the timer fired.
                match (&mut waiter.rx).await {
                    Ok(header) => header,
                    Err(_) => return Err(ClientError::Closed),
                }
            }
        };

        let payload = self.payloads.take_if_present(msg_id);

        if header.type_id == types::ERR_RESP {
            let payload = payload.ok_or(ClientError::MissingPayload)?;
            let reply = Reply::decode(&payload)?;
            return Err(ClientError::Rejected {
                code: reply.code,
                message: reply.message,
            });
        }

        if header.type_id != expected_type {
            return Err(ClientError::UnexpectedType {
                expected: expected_type,
                actual: header.type_id,
            });
        }

        payload.ok_or(ClientError::MissingPayload)
    }

    /// Fails every outstanding waiter with [`ClientError::Closed`] and rejects
    /// new registrations.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.pending.remove(&id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_secs(2);

    fn reply_header(type_id: u16, msg_id: u64) -> FrameHeader {
        FrameHeader::new(type_id, msg_id, 1, 0)
    }

    #[test]
    fn test_msg_ids_unique_and_nonzero() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let id = next_msg_id();
            assert_ne!(id, 0);
            assert!(seen.insert(id));
        }
    }

    #[tokio::test]
    async fn test_reply_delivered() {
        let correlator = Correlator::new();
        let waiter = correlator.register(42).unwrap();
        assert_eq!(correlator.pending_count(), 1);

        let header = reply_header(types::REGISTER_RESP, 42);
        assert!(correlator.deliver(header, Bytes::from_static(b"body")));
        let payload = correlator
            .wait(waiter, types::REGISTER_RESP, WAIT)
            .await
            .unwrap();
        assert_eq!(&payload[..], b"body");
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_reply_not_consumed() {
        let correlator = Correlator::new();
        assert!(!correlator.deliver(reply_header(types::OK_RESP, 9), Bytes::new()));
    }

    #[tokio::test]
    async fn test_error_reply_surfaces_code() {
        let correlator = Correlator::new();
        let waiter = correlator.register(5).unwrap();
        let body = Reply::new(5, 401, "invalid credentials").encode().unwrap();
        correlator.deliver(reply_header(types::ERR_RESP, 5), body);

        match correlator.wait(waiter, types::OK_RESP, WAIT).await {
            Err(ClientError::Rejected { code, message }) => {
                assert_eq!(code, 401);
                assert_eq!(message, "invalid credentials");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unexpected_type() {
        let correlator = Correlator::new();
        let waiter = correlator.register(6).unwrap();
        correlator.deliver(reply_header(types::OK_RESP, 6), Bytes::new());

        match correlator.wait(waiter, types::MANAGER_AUTH_RESP, WAIT).await {
            Err(ClientError::UnexpectedType { expected, actual }) => {
                assert_eq!(expected, types::MANAGER_AUTH_RESP);
                assert_eq!(actual, types::OK_RESP);
            }
            other => panic!("expected unexpected type, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_removes_waiter() {
        let correlator = Correlator::new();
        let waiter = correlator.register(7).unwrap();

        let result = correlator
            .wait(waiter, types::OK_RESP, Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(ClientError::Timeout)));
        assert_eq!(correlator.pending_count(), 0);

        // A late reply finds nobody waiting.
        assert!(!correlator.deliver(reply_header(types::OK_RESP, 7), Bytes::new()));
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let correlator = Arc::new(Correlator::new());
        let waiter = correlator.register(8).unwrap();

        let c = correlator.clone();
        let handle = tokio::spawn(async move { c.wait(waiter, types::OK_RESP, WAIT).await });
        tokio::task::yield_now().await;

        correlator.close();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ClientError::Closed)));
        assert!(matches!(correlator.register(9), Err(ClientError::Closed)));
    }

    #[test]
    fn test_duplicate_msg_id() {
        let correlator = Correlator::new();
        let _waiter = correlator.register(11).unwrap();
        assert!(matches!(
            correlator.register(11),
            Err(ClientError::DuplicateMsgId)
        ));
    }

    #[tokio::test]
    async fn test_dropped_waiter_releases_entry() {
        let correlator = Correlator::new();
        let waiter = correlator.register(12).unwrap();
        drop(waiter);
        assert_eq!(correlator.pending_count(), 0);

        let header = reply_header(types::OK_RESP, 12);
        assert!(!correlator.deliver(header, Bytes::from_static(b"x")));
        assert!(correlator.payloads.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_wait_releases_entry() {
        let correlator = Correlator::new();
        let waiter = correlator.register(13).unwrap();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            correlator.wait(waiter, types::OK_RESP, Duration::from_secs(60)),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(correlator.pending_count(), 0);
        assert!(!correlator.deliver(reply_header(types::OK_RESP, 13), Bytes::new()));
    }

    #[tokio::test]
    async fn test_stale_waiter_leaves_reused_id_alone() {
        let correlator = Correlator::new();
        let first = correlator.register(14).unwrap();
        correlator.cancel(14);
        let second = correlator.register(14).unwrap();

        drop(first);
        assert_eq!(correlator.pending_count(), 1);

        correlator.deliver(reply_header(types::OK_RESP, 14), Bytes::from_static(b"ok"));
        let payload = correlator.wait(second, types::OK_RESP, WAIT).await.unwrap();
        assert_eq!(&payload[..], b"ok");
    }

    #[test]
    fn test_waiter_outliving_correlator() {
        let correlator = Correlator::new();
        let waiter = correlator.register(15).unwrap();
        drop(correlator);
        drop(waiter);
    }
}
