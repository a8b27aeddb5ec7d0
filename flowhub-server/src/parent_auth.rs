//! Signed parent-auth handshake.
//!
//! A relay proves knowledge of the shared secret by signing
//! `ts_le || nonce || hardware_id || capabilities` with HMAC-SHA256. The hub
//! checks, in order: signature, clock skew, nonce freshness, request shape.
//! A nonce is only remembered once the signature and timestamp are good, so
//! forged requests cannot poison the cache.

use crate::error::AuthError;
use flowhub_protocol::message::ParentAuthReq;
use flowhub_protocol::PROTOCOL_VERSION;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Default tolerated clock skew.
pub const DEFAULT_MAX_SKEW: Duration = Duration::from_secs(5 * 60);

/// Default nonce retention.
pub const DEFAULT_NONCE_TTL: Duration = Duration::from_secs(10 * 60);

fn keyed(secret: &[u8]) -> Result<HmacSha256, AuthError> {
    HmacSha256::new_from_slice(secret).map_err(|_| AuthError::InvalidKey)
}

/// Computes the handshake signature.
pub fn sign(
    secret: &[u8],
    timestamp_ms: i64,
    nonce: &[u8; 16],
    hardware_id: &str,
    capabilities: &str,
) -> Result<[u8; 32], AuthError> {
    let mut mac = keyed(secret)?;
    mac.update(&ParentAuthReq::signing_input(
        timestamp_ms,
        nonce,
        hardware_id,
        capabilities,
    ));
    let mut signature = [0u8; 32];
    signature.copy_from_slice(&mac.finalize().into_bytes());
    Ok(signature)
}

/// Builds a signed request with a random nonce.
pub fn build_request(
    secret: &[u8],
    hardware_id: &str,
    capabilities: &str,
    now_ms: i64,
) -> Result<ParentAuthReq, AuthError> {
    let nonce = Uuid::new_v4().into_bytes();
    let signature = sign(secret, now_ms, &nonce, hardware_id, capabilities)?;
    Ok(ParentAuthReq {
        version: PROTOCOL_VERSION,
        timestamp_ms: now_ms,
        nonce,
        hardware_id: hardware_id.to_string(),
        capabilities: capabilities.to_string(),
        signature,
    })
}

/// Remembers recently seen nonces.
#[derive(Debug)]
pub struct NonceCache {
    ttl_ms: i64,
    seen: Mutex<HashMap<[u8; 16], i64>>,
}

impl NonceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Records `nonce` and returns true if it was not seen within the TTL.
    /// Expired entries are swept on every call.
    pub fn check_and_record(&self, nonce: &[u8; 16], now_ms: i64) -> bool {
        let mut seen = self.seen.lock();
        let ttl = self.ttl_ms;
        seen.retain(|_, first_seen| now_ms.saturating_sub(*first_seen) <= ttl);
        if seen.contains_key(nonce) {
            return false;
        }
        seen.insert(*nonce, now_ms);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Verifies incoming parent-auth requests.
#[derive(Debug)]
pub struct ParentAuthVerifier {
    secret: Vec<u8>,
    max_skew_ms: u64,
    nonces: NonceCache,
}

impl ParentAuthVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            max_skew_ms: DEFAULT_MAX_SKEW.as_millis() as u64,
            nonces: NonceCache::new(DEFAULT_NONCE_TTL),
        }
    }

    pub fn with_max_skew(mut self, skew: Duration) -> Self {
        self.max_skew_ms = u64::try_from(skew.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_nonce_ttl(mut self, ttl: Duration) -> Self {
        self.nonces = NonceCache::new(ttl);
        self
    }

    /// Checks a request against the secret, the clock and the nonce cache.
    pub fn verify(&self, req: &ParentAuthReq, now_ms: i64) -> Result<(), AuthError> {
        let mut mac = keyed(&self.secret)?;
        mac.update(&ParentAuthReq::signing_input(
            req.timestamp_ms,
            &req.nonce,
            &req.hardware_id,
            &req.capabilities,
        ));
        mac.verify_slice(&req.signature)
            .map_err(|_| AuthError::InvalidSignature)?;

        if now_ms.abs_diff(req.timestamp_ms) > self.max_skew_ms {
            return Err(AuthError::BadTimeWindow);
        }

        if req.hardware_id.trim().is_empty() {
            return Err(AuthError::BadRequest);
        }

        if !self.nonces.check_and_record(&req.nonce, now_ms) {
            return Err(AuthError::Replay);
        }

        Ok(())
    }

    pub fn nonce_cache(&self) -> &NonceCache {
        &self.nonces
    }
}
