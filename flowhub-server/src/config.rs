//! Hub configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via FLOWHUB_CONFIG)
//! 3. Environment variables

use crate::connection::PumpConfig;
use crate::directory::DeviceRole;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hub configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener and connection pump settings.
    pub network: NetworkConfig,
    /// Identity of this hub.
    pub node: NodeConfig,
    /// Credential settings.
    pub auth: AuthConfig,
    /// Upstream link settings when running as a relay.
    pub relay: RelayConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
    /// Devices known at startup.
    pub devices: Vec<DeviceSeed>,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("FLOWHUB_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.node.apply_env_overrides();
        self.auth.apply_env_overrides();
        self.relay.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.device_uid == 0 {
            return Err(ConfigError::ValidationError(
                "node.device_uid must be non-zero".to_string(),
            ));
        }
        if self.network.mailbox_capacity == 0 || self.network.inbound_queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "queue capacities must be non-zero".to_string(),
            ));
        }
        if self.network.ping_interval_secs >= self.network.read_timeout_secs {
            return Err(ConfigError::ValidationError(
                "network.ping_interval_secs must be shorter than network.read_timeout_secs"
                    .to_string(),
            ));
        }
        if self.relay.enabled {
            if self.relay.parent_url.as_deref().unwrap_or("").is_empty() {
                return Err(ConfigError::ValidationError(
                    "relay enabled but parent_url not set".to_string(),
                ));
            }
            if self.relay_secret().is_none() {
                return Err(ConfigError::ValidationError(
                    "relay enabled but no shared secret configured".to_string(),
                ));
            }
        }
        for seed in &self.devices {
            if seed.uid == 0 || seed.hardware_id.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "device seed '{}' needs a non-zero uid and a hardware id",
                    seed.hardware_id
                )));
            }
        }
        Ok(())
    }

    /// Secret used to sign the parent handshake: `relay.shared_secret`,
    /// falling back to `auth.relay_secret`.
    pub fn relay_secret(&self) -> Option<&str> {
        self.relay
            .shared_secret
            .as_deref()
            .or(self.auth.relay_secret.as_deref())
            .filter(|s| !s.is_empty())
    }

    /// Hardware ID presented to the parent.
    pub fn relay_hardware_id(&self) -> &str {
        self.relay
            .hardware_id
            .as_deref()
            .unwrap_or(&self.node.hardware_id)
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Outbound frames buffered per connection before drops begin.
    pub mailbox_capacity: usize,
    /// Events buffered in front of the router.
    pub inbound_queue_capacity: usize,
    /// Interval between keepalive pings.
    pub ping_interval_secs: u64,
    /// Read deadline, refreshed by every inbound message.
    pub read_timeout_secs: u64,
    /// Deadline for a single outbound write.
    pub write_timeout_secs: u64,
    /// Largest accepted WebSocket message in bytes.
    pub max_message_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7800)),
            max_connections: 1000,
            mailbox_capacity: 256,
            inbound_queue_capacity: 1024,
            ping_interval_secs: 54,
            read_timeout_secs: 60,
            write_timeout_secs: 10,
            max_message_size: 1024 * 1024,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("FLOWHUB_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(max) = std::env::var("FLOWHUB_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }

        if let Ok(cap) = std::env::var("FLOWHUB_MAILBOX_CAPACITY") {
            if let Ok(n) = cap.parse() {
                self.mailbox_capacity = n;
            }
        }
    }

    /// Timing settings for the per-connection pumps.
    pub fn pump_config(&self) -> PumpConfig {
        PumpConfig {
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
        }
    }
}

/// Identity of this hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// UID used as the source of replies until a parent assigns one.
    pub device_uid: u64,
    pub hardware_id: String,
    pub name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            device_uid: 1,
            hardware_id: "flowhub-hub".to_string(),
            name: "hub".to_string(),
        }
    }
}

impl NodeConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(uid) = std::env::var("FLOWHUB_DEVICE_UID") {
            if let Ok(n) = uid.parse() {
                self.device_uid = n;
            }
        }
        if let Ok(hw) = std::env::var("FLOWHUB_HARDWARE_ID") {
            if !hw.is_empty() {
                self.hardware_id = hw;
            }
        }
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Manager token hashes (SHA-256 hex strings).
    /// Generate hashes with: `flowhub-cli hash-secret <token>`
    pub manager_token_hashes: Vec<String>,
    /// Optional path to a file with one manager token hash per line.
    pub secrets_file: Option<PathBuf>,
    /// Shared secret that child relays sign their handshake with.
    pub relay_secret: Option<String>,
    /// Whether newly seen devices are approved without operator action.
    pub auto_approve: bool,
    /// How long a handshake nonce is remembered.
    pub nonce_ttl_secs: u64,
    /// Maximum tolerated clock skew for handshake timestamps.
    pub max_clock_skew_secs: u64,
    /// Lease announced in handshake replies.
    pub lease_secs: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            manager_token_hashes: Vec::new(),
            secrets_file: None,
            relay_secret: None,
            auto_approve: true,
            nonce_ttl_secs: 600,
            max_clock_skew_secs: 300,
            lease_secs: 30,
        }
    }
}

impl AuthConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(hash) = std::env::var("FLOWHUB_MANAGER_TOKEN_HASH") {
            if !hash.is_empty() {
                self.manager_token_hashes.push(hash);
            }
        }

        if let Ok(secret) = std::env::var("FLOWHUB_RELAY_SECRET") {
            if !secret.is_empty() {
                self.relay_secret = Some(secret);
            }
        }

        if let Ok(path) = std::env::var("FLOWHUB_SECRETS_FILE") {
            self.secrets_file = Some(PathBuf::from(path));
        }

        if let Ok(approve) = std::env::var("FLOWHUB_AUTO_APPROVE") {
            self.auto_approve = approve == "1" || approve.to_lowercase() == "true";
        }
    }

    /// Loads manager token hashes from the secrets file if configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        if let Some(ref path) = self.secrets_file {
            let content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(path.clone(), e))?;
            self.manager_token_hashes.extend(
                content
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(str::to_string),
            );
        }
        Ok(())
    }

    pub fn nonce_ttl(&self) -> Duration {
        Duration::from_secs(self.nonce_ttl_secs)
    }

    pub fn max_clock_skew(&self) -> Duration {
        Duration::from_secs(self.max_clock_skew_secs)
    }
}

/// Upstream link configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Run as a relay under `parent_url`.
    pub enabled: bool,
    /// WebSocket URL of the parent hub, e.g. `ws://parent:7800/ws`.
    pub parent_url: Option<String>,
    /// Hardware ID presented to the parent (defaults to `node.hardware_id`).
    pub hardware_id: Option<String>,
    /// Shared secret for the handshake signature.
    pub shared_secret: Option<String>,
    pub reconnect_delay_secs: u64,
    pub auth_timeout_secs: u64,
    pub ping_interval_secs: u64,
    /// Frames buffered toward the parent while the link is down.
    pub forward_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            parent_url: None,
            hardware_id: None,
            shared_secret: None,
            reconnect_delay_secs: 5,
            auth_timeout_secs: 10,
            ping_interval_secs: 30,
            forward_capacity: 256,
        }
    }
}

impl RelayConfig {
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// A parent URL turns relay mode on; `FLOWHUB_RELAY_ENABLED` has the last word.
    fn apply_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = var("FLOWHUB_PARENT_URL") {
            if !url.is_empty() {
                self.enabled = true;
                self.parent_url = Some(url);
            }
        }
        if let Some(enabled) = var("FLOWHUB_RELAY_ENABLED") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
        if let Some(secret) = var("FLOWHUB_RELAY_SECRET_SHARED") {
            if !secret.is_empty() {
                self.shared_secret = Some(secret);
            }
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("FLOWHUB_METRICS_ENABLED") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
        if let Ok(addr) = std::env::var("FLOWHUB_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// A device known at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSeed {
    pub uid: u64,
    pub hardware_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_seed_role")]
    pub role: DeviceRole,
    /// SHA-256 hex of the device secret.
    #[serde(default)]
    pub secret_hash: Option<String>,
    #[serde(default)]
    pub parent_uid: Option<u64>,
    #[serde(default = "default_true")]
    pub approved: bool,
    #[serde(default)]
    pub permissions: Vec<String>,
}

fn default_seed_role() -> DeviceRole {
    DeviceRole::Node
}

fn default_true() -> bool {
    true
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
