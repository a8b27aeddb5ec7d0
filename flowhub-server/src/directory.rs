//! Device directory.
//!
//! The router never touches persistence directly; credential checks and
//! device lookups go through [`DeviceDirectory`]. [`MemoryDirectory`] keeps
//! everything in memory and stores secrets as SHA-256 hashes so plaintext
//! credentials never sit in configuration.

use crate::authz::DeviceTree;
use crate::config::DeviceSeed;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use uuid::Uuid;

/// Hardware ID of the device record that manager sessions authenticate as.
pub const MANAGER_HARDWARE_ID: &str = "manager";

/// Capability token that marks a handshaking device as a relay.
pub const RELAY_CAPABILITY: &str = "relay";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Hub,
    Relay,
    Node,
    Manager,
}

impl DeviceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceRole::Hub => "hub",
            DeviceRole::Relay => "relay",
            DeviceRole::Node => "node",
            DeviceRole::Manager => "manager",
        }
    }
}

impl std::fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A device as the directory knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub uid: u64,
    pub hardware_id: String,
    pub name: String,
    pub role: DeviceRole,
    pub parent_uid: Option<u64>,
    pub approved: bool,
    pub permissions: Vec<String>,
}

impl DeviceRecord {
    pub fn new(uid: u64, hardware_id: impl Into<String>, role: DeviceRole) -> Self {
        Self {
            uid,
            hardware_id: hardware_id.into(),
            name: String::new(),
            role,
            parent_uid: None,
            approved: true,
            permissions: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent_uid: u64) -> Self {
        self.parent_uid = Some(parent_uid);
        self
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = permissions.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("hardware id must not be empty")]
    EmptyHardwareId,

    #[error("device already registered: {0}")]
    AlreadyRegistered(String),

    #[error("uid {0} already in use")]
    UidInUse(u64),
}

/// Lookup and credential checks used by the auth handlers.
pub trait DeviceDirectory: DeviceTree + Send + Sync {
    /// Checks a device secret. Returns the record on success.
    fn authenticate_device(&self, uid: u64, secret: &str) -> Option<DeviceRecord>;

    /// Checks a manager token. Returns the manager record on success.
    fn authenticate_manager(&self, token: &str) -> Option<DeviceRecord>;

    /// Creates a device for `hardware_id` and returns it with a fresh secret.
    fn register_device(&self, hardware_id: &str) -> Result<(DeviceRecord, String), DirectoryError>;

    /// Returns the device for `hardware_id`, creating it if unknown.
    fn ensure_device(
        &self,
        hardware_id: &str,
        capabilities: &str,
    ) -> Result<DeviceRecord, DirectoryError>;

    fn find(&self, uid: u64) -> Option<DeviceRecord>;

    fn all(&self) -> Vec<DeviceRecord>;
}

/// Hashes a secret using SHA-256, returning a lowercase hex string.
pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compares two hex digests without short-circuiting on the first mismatch.
fn digests_match(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a
            .bytes()
            .zip(b.bytes())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}

fn has_capability(capabilities: &str, wanted: &str) -> bool {
    capabilities
        .split(|c: char| c == ',' || c.is_whitespace())
        .any(|c| c.eq_ignore_ascii_case(wanted))
}

#[derive(Debug)]
struct StoredDevice {
    record: DeviceRecord,
    secret_hash: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    devices: HashMap<u64, StoredDevice>,
    by_hardware: HashMap<String, u64>,
    next_uid: u64,
}

impl Inner {
    fn allocate_uid(&mut self) -> u64 {
        while self.next_uid == 0 || self.devices.contains_key(&self.next_uid) {
            self.next_uid = self.next_uid.wrapping_add(1);
        }
        let uid = self.next_uid;
        self.next_uid = self.next_uid.wrapping_add(1);
        uid
    }

    fn insert(&mut self, record: DeviceRecord, secret_hash: Option<String>) {
        self.by_hardware.insert(record.hardware_id.clone(), record.uid);
        if record.uid >= self.next_uid {
            self.next_uid = record.uid.wrapping_add(1);
        }
        self.devices
            .insert(record.uid, StoredDevice { record, secret_hash });
    }

    fn by_hardware(&self, hardware_id: &str) -> Option<&StoredDevice> {
        self.by_hardware
            .get(hardware_id)
            .and_then(|uid| self.devices.get(uid))
    }
}

/// In-memory directory.
#[derive(Debug)]
pub struct MemoryDirectory {
    inner: RwLock<Inner>,
    manager_hashes: HashSet<String>,
    auto_approve: bool,
    /// Parent assigned to devices created at runtime.
    owner_uid: Option<u64>,
}

impl MemoryDirectory {
    pub fn new(auto_approve: bool) -> Self {
        Self {
            inner: RwLock::new(Inner {
                next_uid: 1,
                ..Default::default()
            }),
            manager_hashes: HashSet::new(),
            auto_approve,
            owner_uid: None,
        }
    }

    /// Devices created at runtime get `owner_uid` as their parent.
    pub fn with_owner(mut self, owner_uid: u64) -> Self {
        self.owner_uid = Some(owner_uid);
        self
    }

    /// Accepts manager tokens whose SHA-256 hex is in `hashes`.
    pub fn with_manager_hashes(mut self, hashes: impl IntoIterator<Item = String>) -> Self {
        self.manager_hashes
            .extend(hashes.into_iter().map(|h| h.to_lowercase()));
        self
    }

    /// Adds a device with an optional plaintext secret.
    pub fn insert(&self, record: DeviceRecord, secret: Option<&str>) -> Result<(), DirectoryError> {
        self.insert_hashed(record, secret.map(hash_secret))
    }

    /// Adds a device whose secret is already hashed.
    pub fn insert_hashed(
        &self,
        record: DeviceRecord,
        secret_hash: Option<String>,
    ) -> Result<(), DirectoryError> {
        if record.hardware_id.trim().is_empty() {
            return Err(DirectoryError::EmptyHardwareId);
        }
        let mut inner = self.inner.write();
        if inner.devices.contains_key(&record.uid) {
            return Err(DirectoryError::UidInUse(record.uid));
        }
        if inner.by_hardware.contains_key(&record.hardware_id) {
            return Err(DirectoryError::AlreadyRegistered(record.hardware_id));
        }
        inner.insert(record, secret_hash.map(|h| h.to_lowercase()));
        Ok(())
    }

    /// Adds every seed device.
    pub fn seed(&self, seeds: &[DeviceSeed]) -> Result<(), DirectoryError> {
        for seed in seeds {
            let record = DeviceRecord {
                uid: seed.uid,
                hardware_id: seed.hardware_id.clone(),
                name: seed.name.clone(),
                role: seed.role,
                parent_uid: seed.parent_uid,
                approved: seed.approved,
                permissions: seed.permissions.clone(),
            };
            self.insert_hashed(record, seed.secret_hash.clone())?;
        }
        Ok(())
    }

    /// Marks a device approved. Returns false if the uid is unknown.
    pub fn approve(&self, uid: u64) -> bool {
        match self.inner.write().devices.get_mut(&uid) {
            Some(stored) => {
                stored.record.approved = true;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn create(
        &self,
        inner: &mut Inner,
        hardware_id: &str,
        role: DeviceRole,
        secret_hash: Option<String>,
    ) -> DeviceRecord {
        let uid = inner.allocate_uid();
        let mut record = DeviceRecord::new(uid, hardware_id, role);
        record.name = hardware_id.to_string();
        record.parent_uid = self.owner_uid;
        record.approved = self.auto_approve;
        if role == DeviceRole::Manager {
            record.permissions = vec!["**".to_string()];
            record.approved = true;
        }
        inner.insert(record.clone(), secret_hash);
        record
    }
}

impl DeviceTree for MemoryDirectory {
    fn parent_of(&self, uid: u64) -> Option<u64> {
        self.inner
            .read()
            .devices
            .get(&uid)
            .and_then(|d| d.record.parent_uid)
    }

    fn children_of(&self, uid: u64) -> Vec<u64> {
        let inner = self.inner.read();
        let mut children: Vec<u64> = inner
            .devices
            .values()
            .filter(|d| d.record.parent_uid == Some(uid))
            .map(|d| d.record.uid)
            .collect();
        children.sort_unstable();
        children
    }

    fn all_uids(&self) -> Vec<u64> {
        let mut uids: Vec<u64> = self.inner.read().devices.keys().copied().collect();
        uids.sort_unstable();
        uids
    }
}

impl DeviceDirectory for MemoryDirectory {
    fn authenticate_device(&self, uid: u64, secret: &str) -> Option<DeviceRecord> {
        let inner = self.inner.read();
        let stored = inner.devices.get(&uid)?;
        let expected = stored.secret_hash.as_deref()?;
        digests_match(&hash_secret(secret), expected).then(|| stored.record.clone())
    }

    fn authenticate_manager(&self, token: &str) -> Option<DeviceRecord> {
        let candidate = hash_secret(token);
        let known = self
            .manager_hashes
            .iter()
            .fold(false, |found, hash| digests_match(hash, &candidate) | found);
        if !known {
            return None;
        }
        let mut inner = self.inner.write();
        if let Some(stored) = inner.by_hardware(MANAGER_HARDWARE_ID) {
            return Some(stored.record.clone());
        }
        Some(self.create(&mut inner, MANAGER_HARDWARE_ID, DeviceRole::Manager, None))
    }

    fn register_device(&self, hardware_id: &str) -> Result<(DeviceRecord, String), DirectoryError> {
        let hardware_id = hardware_id.trim();
        if hardware_id.is_empty() {
            return Err(DirectoryError::EmptyHardwareId);
        }
        let mut inner = self.inner.write();
        if inner.by_hardware.contains_key(hardware_id) {
            return Err(DirectoryError::AlreadyRegistered(hardware_id.to_string()));
        }
        let secret = Uuid::new_v4().simple().to_string();
        let record = self.create(
            &mut inner,
            hardware_id,
            DeviceRole::Node,
            Some(hash_secret(&secret)),
        );
        Ok((record, secret))
    }

    fn ensure_device(
        &self,
        hardware_id: &str,
        capabilities: &str,
    ) -> Result<DeviceRecord, DirectoryError> {
        let hardware_id = hardware_id.trim();
        if hardware_id.is_empty() {
            return Err(DirectoryError::EmptyHardwareId);
        }
        let mut inner = self.inner.write();
        if let Some(stored) = inner.by_hardware(hardware_id) {
            return Ok(stored.record.clone());
        }
        let role = if has_capability(capabilities, RELAY_CAPABILITY) {
            DeviceRole::Relay
        } else {
            DeviceRole::Node
        };
        Ok(self.create(&mut inner, hardware_id, role, None))
    }

    fn find(&self, uid: u64) -> Option<DeviceRecord> {
        self.inner.read().devices.get(&uid).map(|d| d.record.clone())
    }

    fn all(&self) -> Vec<DeviceRecord> {
        let inner = self.inner.read();
        let mut records: Vec<DeviceRecord> =
            inner.devices.values().map(|d| d.record.clone()).collect();
        records.sort_by_key(|r| r.uid);
        records
    }
}
