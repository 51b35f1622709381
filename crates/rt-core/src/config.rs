//! Configuration management for RTunnel
//!
//! Handles loading and saving of the tunnel configuration: the signaling
//! server, the shared secret, the exposed mappings and runtime tunables.
//! Files use camelCase keys; `.toml` files are parsed as TOML, everything
//! else as JSON.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::brand::CONFIG_DIR_NAME;
use crate::candidate::IceCandidateFilter;
use crate::error::{Result, TunnelError};
use crate::heartbeat::{HeartbeatConfig, DEFAULT_ERROR_THRESHOLD};
use crate::mapping::Mapping;
use crate::session::SessionSettings;
use crate::signaling::socketio::{SocketIoConfig, DEFAULT_PATH};
use crate::slots::DEFAULT_TUNNEL_LIMIT;

/// Config files looked up next to the executable, in order
pub const LOCAL_CONFIG_FILES: [&str; 2] = ["config.dev.json", "config.json"];

/// Signaling server location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server URL, e.g. `https://relay.example.com`
    pub url: String,

    /// Socket.IO endpoint path
    #[serde(default = "default_path")]
    pub path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            path: default_path(),
        }
    }
}

fn default_path() -> String {
    DEFAULT_PATH.to_string()
}

fn default_tunnel_limit() -> usize {
    DEFAULT_TUNNEL_LIMIT
}

fn default_heartbeat_interval_ms() -> u64 {
    3000
}

fn default_heartbeat_error_threshold() -> u32 {
    DEFAULT_ERROR_THRESHOLD
}

fn default_reconnect_delay_ms() -> u64 {
    3000
}

/// Main configuration for RTunnel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    /// Signaling server
    #[serde(default)]
    pub server: ServerConfig,

    /// Shared secret pairing the two peers on the server
    #[serde(default)]
    pub secret_key: String,

    /// Services exposed by the listening peer
    #[serde(default)]
    pub mapping: Vec<Mapping>,

    /// Remote candidate addresses that are never used
    #[serde(default)]
    pub ice_addr_blacklist: Vec<String>,

    /// Maximum concurrent streams per listening session
    #[serde(default = "default_tunnel_limit")]
    pub tunnel_limit: usize,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Consecutive heartbeat errors tolerated before a session closes
    #[serde(default = "default_heartbeat_error_threshold")]
    pub heartbeat_error_threshold: u32,

    /// Delay before reconnecting to the signaling server
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            secret_key: String::new(),
            mapping: Vec::new(),
            ice_addr_blacklist: Vec::new(),
            tunnel_limit: default_tunnel_limit(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_error_threshold: default_heartbeat_error_threshold(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("toml"))
}

impl TunnelConfig {
    /// Creates a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        if is_toml(path) {
            Ok(toml::from_str(&contents)?)
        } else {
            serde_json::from_str(&contents).map_err(|e| TunnelError::ConfigError(e.to_string()))
        }
    }

    /// Saves configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = if is_toml(path) {
            toml::to_string_pretty(self).map_err(|e| TunnelError::ConfigError(e.to_string()))?
        } else {
            serde_json::to_string_pretty(self)?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Returns the default configuration directory
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CONFIG_DIR_NAME)
    }

    /// Returns the default configuration file path
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.json")
    }

    /// Find the first existing config file among the standard locations
    pub fn locate() -> Result<PathBuf> {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
        Self::locate_in(exe_dir.as_deref())
    }

    /// [`TunnelConfig::locate`] with an explicit executable directory
    pub fn locate_in(exe_dir: Option<&Path>) -> Result<PathBuf> {
        let mut candidates: Vec<PathBuf> = exe_dir
            .map(|dir| LOCAL_CONFIG_FILES.iter().map(|name| dir.join(name)).collect())
            .unwrap_or_default();
        candidates.push(Self::default_config_path());

        candidates
            .into_iter()
            .find(|path| path.is_file())
            .ok_or(TunnelError::ConfigNotFound)
    }

    /// Check the fields a running tunnel depends on
    pub fn validate(&self) -> Result<()> {
        if self.server.url.trim().is_empty() {
            return Err(TunnelError::ConfigError("server.url is empty".to_string()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(TunnelError::ConfigError(
                "heartbeatIntervalMs must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat_error_threshold == 0 {
            return Err(TunnelError::ConfigError(
                "heartbeatErrorThreshold must be greater than zero".to_string(),
            ));
        }
        if self.tunnel_limit == 0 {
            return Err(TunnelError::ConfigError(
                "tunnelLimit must be greater than zero".to_string(),
            ));
        }
        for mapping in &self.mapping {
            if mapping.remote_ip.trim().is_empty() {
                return Err(TunnelError::ConfigError(format!(
                    "mapping {} has no remoteIp",
                    mapping
                )));
            }
            if mapping.remote_port == 0 {
                return Err(TunnelError::ConfigError(format!(
                    "mapping {} has no remotePort",
                    mapping
                )));
            }
        }
        Ok(())
    }

    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig::default()
            .with_interval(Duration::from_millis(self.heartbeat_interval_ms))
            .with_error_threshold(self.heartbeat_error_threshold)
    }

    /// Per-session tunables derived from this configuration
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings::default()
            .with_tunnel_limit(self.tunnel_limit)
            .with_heartbeat(self.heartbeat())
            .with_filter(IceCandidateFilter::new(self.ice_addr_blacklist.iter().cloned()))
    }

    /// Socket.IO client settings for the configured server
    pub fn signaling(&self) -> SocketIoConfig {
        SocketIoConfig::new(self.server.url.clone())
            .with_path(self.server.path.clone())
            .with_reconnect_delay(Duration::from_millis(self.reconnect_delay_ms))
    }

    /// Builder pattern: set signaling server
    pub fn with_server(mut self, url: impl Into<String>, path: impl Into<String>) -> Self {
        self.server = ServerConfig {
            url: url.into(),
            path: path.into(),
        };
        self
    }

    /// Builder pattern: set shared secret
    pub fn with_secret_key(mut self, secret_key: impl Into<String>) -> Self {
        self.secret_key = secret_key.into();
        self
    }

    /// Builder pattern: add a mapping
    pub fn with_mapping(mut self, mapping: Mapping) -> Self {
        self.mapping.push(mapping);
        self
    }

    /// Builder pattern: blacklist a candidate address
    pub fn with_blacklisted_address(mut self, address: impl Into<String>) -> Self {
        self.ice_addr_blacklist.push(address.into());
        self
    }

    /// Builder pattern: set stream limit
    pub fn with_tunnel_limit(mut self, limit: usize) -> Self {
        self.tunnel_limit = limit;
        self
    }

    /// Builder pattern: set heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORIGINAL_FORMAT: &str = r#"{
        "server": { "url": "https://relay.example.com", "path": "/socket.io" },
        "secretKey": "s3cret",
        "mapping": [
            { "localIp": "127.0.0.1", "localPort": 2222, "remoteIp": "10.0.0.5", "remotePort": 22 },
            { "remoteIp": "10.0.0.6", "remotePort": 80 }
        ],
        "iceAddrBlacklist": ["192.168.1.20"]
    }"#;

    #[test]
    fn test_default_config() {
        let config = TunnelConfig::default();
        assert_eq!(config.tunnel_limit, 1000);
        assert_eq!(config.heartbeat_interval_ms, 3000);
        assert_eq!(config.heartbeat_error_threshold, 3);
        assert_eq!(config.server.path, "/socket.io");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_json_keys() {
        let config: TunnelConfig = serde_json::from_str(ORIGINAL_FORMAT).unwrap();
        assert_eq!(config.secret_key, "s3cret");
        assert_eq!(config.mapping.len(), 2);
        assert_eq!(config.mapping[0].local_port, Some(2222));
        assert_eq!(config.mapping[1].local_addr(), "127.0.0.1:0");
        assert_eq!(config.ice_addr_blacklist, vec!["192.168.1.20"]);
        assert_eq!(config.tunnel_limit, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = TunnelConfig::new()
            .with_server("http://localhost:3000", "/socket.io")
            .with_secret_key("k")
            .with_mapping(Mapping::new("10.0.0.5", 22))
            .with_tunnel_limit(5)
            .with_heartbeat_interval(Duration::from_millis(500));

        assert_eq!(config.session_settings().tunnel_limit, 5);
        assert_eq!(config.heartbeat().interval, Duration::from_millis(500));
        assert_eq!(config.signaling().url, "http://localhost:3000");
    }

    #[test]
    fn test_validate_rejects_bad_mapping() {
        let config = TunnelConfig::new()
            .with_server("http://localhost:3000", "/socket.io")
            .with_mapping(Mapping::new("10.0.0.5", 0));
        assert!(config.validate().is_err());

        let config = TunnelConfig::new()
            .with_server("http://localhost:3000", "/socket.io")
            .with_mapping(Mapping::new("", 22));
        assert!(config.validate().is_err());
    }
}
