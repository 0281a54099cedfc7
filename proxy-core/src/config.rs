//! Configuration types and utilities

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Proxy configuration.
/// Every field has a default so partial TOML files are accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address to listen on
    pub listen_address: String,
    /// Port to listen on (0 picks an ephemeral port)
    pub listen_port: u16,
    /// Request header carrying the session identifier of a connection
    pub session_header: String,
    /// How long `stop()` waits for in-flight exchanges before forcing shutdown
    pub shutdown_grace_ms: u64,
    pub certificate: CertificateConfig,
    pub capture: CaptureConfig,
    pub upstream: UpstreamConfig,
    pub events: EventConfig,
    pub trust: TrustProbeConfig,
    pub admin: AdminConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            listen_port: 0,
            session_header: "x-devproxy-session".to_string(),
            shutdown_grace_ms: 5_000,
            certificate: CertificateConfig::default(),
            capture: CaptureConfig::default(),
            upstream: UpstreamConfig::default(),
            events: EventConfig::default(),
            trust: TrustProbeConfig::default(),
            admin: AdminConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigurationError> {
        let config: ProxyConfig =
            toml::from_str(raw).map_err(|e| ConfigurationError::InvalidFile(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file from disk.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigurationError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConfigurationError::InvalidFile(format!("{}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.capture.buffer_capacity == 0 {
            return Err(ConfigurationError::InvalidFile(
                "capture.buffer_capacity must be at least 1".to_string(),
            ));
        }
        if self.events.subscriber_queue == 0 {
            return Err(ConfigurationError::InvalidFile(
                "events.subscriber_queue must be at least 1".to_string(),
            ));
        }
        if self.session_header.trim().is_empty() {
            return Err(ConfigurationError::InvalidFile(
                "session_header must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Certificate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateConfig {
    /// Directory holding `ca.pem` and `ca.key`
    pub storage_path: PathBuf,
    /// Root certificate validity in days
    pub ca_validity_days: u32,
    /// Leaf certificate validity in days
    pub leaf_validity_days: u32,
    /// Maximum number of per-host TLS configurations kept in memory
    pub leaf_cache_size: usize,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./certs"),
            ca_validity_days: 365 * 10,
            leaf_validity_days: 365,
            leaf_cache_size: 1_000,
        }
    }
}

/// Capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Number of exchanges retained in the log buffer
    pub buffer_capacity: usize,
    /// Bodies larger than this are stored truncated
    pub max_body_size: usize,
    /// Timeout for reading a complete client request body
    pub body_read_timeout_ms: u64,
    /// Hosts to capture (wildcards); empty means every host
    pub include_hosts: Vec<String>,
    /// Hosts never captured; exclusion wins over inclusion
    pub exclude_hosts: Vec<String>,
    /// Size of the before/after snapshots recorded for debug rules
    pub debug_snapshot_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 200,
            max_body_size: 1024 * 1024,
            body_read_timeout_ms: 30_000,
            include_hosts: Vec::new(),
            exclude_hosts: Vec::new(),
            debug_snapshot_size: 4 * 1024,
        }
    }
}

impl CaptureConfig {
    pub fn body_read_timeout(&self) -> Duration {
        Duration::from_millis(self.body_read_timeout_ms)
    }
}

/// Upstream forwarding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Default timeout for one upstream round trip, rules may override it
    pub timeout_ms: u64,
    /// Accept invalid upstream certificates (local test servers)
    pub accept_invalid_certs: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            accept_invalid_certs: false,
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Live event feed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Per-subscriber queue size; a subscriber whose queue fills up is detached
    pub subscriber_queue: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            subscriber_queue: 256,
        }
    }
}

/// Trust probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustProbeConfig {
    /// Known-reachable HTTPS URL used by `verify_trust`
    pub probe_url: String,
    pub timeout_ms: u64,
}

impl Default for TrustProbeConfig {
    fn default() -> Self {
        Self {
            probe_url: "https://example.com/".to_string(),
            timeout_ms: 5_000,
        }
    }
}

impl TrustProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Admin API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub address: String,
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "127.0.0.1".to_string(),
            port: 9091,
        }
    }
}
