//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via TRACKLINK_CONFIG)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracklink_protocol::{AckChecksum, MAX_FRAME_SIZE};

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Framing and acknowledgment behaviour.
    pub protocol: ProtocolConfig,
    /// Job queue forwarding.
    pub forwarding: ForwardingConfig,
    /// Device admission.
    pub devices: DevicesConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("TRACKLINK_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.protocol.apply_env_overrides();
        self.forwarding.apply_env_overrides();
        self.devices.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Rejects settings that cannot work together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "network.max_connections must be at least 1".to_string(),
            ));
        }
        if self.network.idle_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "network.idle_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.network.max_buffer_bytes < MAX_FRAME_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "network.max_buffer_bytes ({}) must hold a full frame ({} bytes)",
                self.network.max_buffer_bytes, MAX_FRAME_SIZE
            )));
        }
        if self.forwarding.enabled && self.forwarding.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "forwarding.queue_capacity must be at least 1 when forwarding is enabled"
                    .to_string(),
            ));
        }
        self.devices.validate()
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

fn env_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address terminals connect to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Idle connection timeout in seconds.
    pub idle_timeout_secs: u64,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Maximum unconsumed bytes buffered per connection.
    pub max_buffer_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, tracklink_protocol::DEFAULT_PORT)),
            idle_timeout_secs: 300,
            max_connections: 10_000,
            max_buffer_bytes: 4096,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("TRACKLINK_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(timeout) = std::env::var("TRACKLINK_IDLE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.idle_timeout_secs = secs;
            }
        }

        if let Ok(max) = std::env::var("TRACKLINK_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }

        if let Ok(max) = std::env::var("TRACKLINK_MAX_BUFFER_BYTES") {
            if let Ok(n) = max.parse() {
                self.max_buffer_bytes = n;
            }
        }
    }

    /// Returns idle timeout as Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// What a connection does when the byte stream stops making sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptFramePolicy {
    /// Close the connection.
    #[default]
    Close,
    /// Discard bytes up to the next start marker and keep reading.
    Resync,
}

impl std::str::FromStr for CorruptFramePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "close" => Ok(Self::Close),
            "resync" => Ok(Self::Resync),
            other => Err(ConfigError::ValidationError(format!(
                "unknown corrupt frame policy '{}'",
                other
            ))),
        }
    }
}

/// Framing and acknowledgment configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub corrupt_frame_policy: CorruptFramePolicy,
    /// Checksum mode for outgoing acknowledgments.
    pub ack_checksum: AckChecksum,
}

impl ProtocolConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(policy) = std::env::var("TRACKLINK_CORRUPT_FRAME_POLICY") {
            match policy.parse() {
                Ok(parsed) => self.corrupt_frame_policy = parsed,
                Err(e) => tracing::warn!("Ignoring TRACKLINK_CORRUPT_FRAME_POLICY: {}", e),
            }
        }

        if let Ok(mode) = std::env::var("TRACKLINK_ACK_CHECKSUM") {
            self.ack_checksum = match mode.to_lowercase().as_str() {
                "zeroed" | "zero" => AckChecksum::Zeroed,
                _ => AckChecksum::Computed,
            };
        }
    }
}

/// Job queue forwarding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardingConfig {
    /// Forward location and alarm events downstream.
    pub enabled: bool,
    /// Capacity of the bundled channel queue.
    pub queue_capacity: usize,
    /// How long a connection waits for queue capacity (0 = never wait).
    pub enqueue_timeout_ms: u64,
    /// Delivery attempts for location jobs.
    pub location_max_attempts: u32,
    /// Delivery attempts for alarm jobs.
    pub alarm_max_attempts: u32,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_capacity: 10_000,
            enqueue_timeout_ms: 500,
            location_max_attempts: 3,
            alarm_max_attempts: 5,
        }
    }
}

impl ForwardingConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("TRACKLINK_FORWARDING_ENABLED") {
            self.enabled = env_flag(&enabled);
        }

        if let Ok(capacity) = std::env::var("TRACKLINK_QUEUE_CAPACITY") {
            if let Ok(n) = capacity.parse() {
                self.queue_capacity = n;
            }
        }

        if let Ok(timeout) = std::env::var("TRACKLINK_ENQUEUE_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.enqueue_timeout_ms = ms;
            }
        }
    }

    /// Returns the enqueue timeout as Duration.
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }
}

/// Device admission configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    /// Identities allowed to log in. Empty admits every device.
    pub allowlist: Vec<String>,
}

impl DevicesConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(list) = std::env::var("TRACKLINK_DEVICE_ALLOWLIST") {
            self.allowlist = list
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    /// Every entry must be a 16 character hex identity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for id in &self.allowlist {
            if id.len() != 16 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ConfigError::ValidationError(format!(
                    "devices.allowlist entry '{}' is not a 16 character hex identity",
                    id
                )));
            }
        }
        Ok(())
    }

    /// Returns the normalized allowlist, or `None` when admission is open.
    pub fn allowlist_set(&self) -> Option<HashSet<String>> {
        if self.allowlist.is_empty() {
            return None;
        }
        Some(self.allowlist.iter().map(|id| id.to_lowercase()).collect())
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
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("TRACKLINK_METRICS_ENABLED") {
            self.enabled = env_flag(&enabled);
        }
        if let Ok(addr) = std::env::var("TRACKLINK_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
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

/// Custom serde module for SocketAddr (to handle as string in YAML).
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), 5023);
        assert_eq!(config.network.idle_timeout(), Duration::from_secs(300));
        assert_eq!(config.protocol.corrupt_frame_policy, CorruptFramePolicy::Close);
        assert_eq!(config.protocol.ack_checksum, AckChecksum::Computed);
        assert!(config.forwarding.enabled);
        assert!(!config.metrics.enabled);
        assert!(config.devices.allowlist_set().is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.bind_addr, config.network.bind_addr);
        assert_eq!(parsed.forwarding.queue_capacity, config.forwarding.queue_capacity);
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
network:
  bind_addr: "127.0.0.1:6000"
  idle_timeout_secs: 30
protocol:
  corrupt_frame_policy: resync
  ack_checksum: zeroed
forwarding:
  enqueue_timeout_ms: 0
devices:
  allowlist:
    - "0123456789ABCDEF"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.network.bind_addr.port(), 6000);
        assert_eq!(config.network.idle_timeout_secs, 30);
        // Unset fields keep their defaults.
        assert_eq!(config.network.max_buffer_bytes, 4096);
        assert_eq!(config.protocol.corrupt_frame_policy, CorruptFramePolicy::Resync);
        assert_eq!(config.protocol.ack_checksum, AckChecksum::Zeroed);
        assert_eq!(config.forwarding.enqueue_timeout(), Duration::ZERO);
        let allowlist = config.devices.allowlist_set().unwrap();
        assert!(allowlist.contains("0123456789abcdef"));
        config.validate().unwrap();
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracklink.yaml");
        let mut config = Config::default();
        config.metrics.enabled = true;
        config.save(&path).unwrap();

        let reloaded = Config::from_file(&path).unwrap();
        assert!(reloaded.metrics.enabled);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/tracklink.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(..)));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.network.max_buffer_bytes = 100;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = Config::default();
        config.network.idle_timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(msg)) if msg.contains("idle_timeout_secs")
        ));

        let mut config = Config::default();
        config.forwarding.queue_capacity = 0;
        assert!(config.validate().is_err());
        config.forwarding.enabled = false;
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.devices.allowlist = vec!["not-an-id".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!(
            "RESYNC".parse::<CorruptFramePolicy>().unwrap(),
            CorruptFramePolicy::Resync
        );
        assert!("skip".parse::<CorruptFramePolicy>().is_err());
    }
}
