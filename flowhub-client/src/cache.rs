//! Short-lived reply payload cache.
//!
//! Reply headers travel to waiters over a oneshot channel while the payload
//! bytes are parked here keyed by message id. Entries expire after a fixed
//! TTL so payloads nobody claims do not accumulate.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default lifetime of a cached payload.
pub const DEFAULT_PAYLOAD_TTL: Duration = Duration::from_secs(30);

struct Entry {
    stored_at: Instant,
    payload: Bytes,
}

/// TTL-bounded map from message id to reply payload.
pub struct ResponseCache {
    ttl: Duration,
    entries: Mutex<HashMap<u64, Entry>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Stores a payload, sweeping expired entries first.
    pub fn put(&self, msg_id: u64, payload: Bytes) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let ttl = self.ttl;
        entries.retain(|_, e| now.duration_since(e.stored_at) < ttl);
        entries.insert(
            msg_id,
            Entry {
                stored_at: now,
                payload,
            },
        );
    }

    /// Removes and returns the payload if it is present and not expired.
    pub fn take_if_present(&self, msg_id: u64) -> Option<Bytes> {
        let entry = self.entries.lock().remove(&msg_id)?;
        if entry.stored_at.elapsed() < self.ttl {
            Some(entry.payload)
        } else {
            None
        }
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_PAYLOAD_TTL)
    }
}
