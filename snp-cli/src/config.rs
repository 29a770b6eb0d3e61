//! Configuration file support for SNP CLI tools

use serde::{Deserialize, Serialize};
use snp::{ClientConfig, ServerConfig};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerCliConfig {
    /// Address to listen on
    pub listen: SocketAddr,
    /// Application identifier carried in every packet header
    #[serde(default = "default_app_id")]
    pub app_id: u16,
    /// Application version carried in every packet header
    #[serde(default = "default_app_version")]
    pub app_version: u16,
    /// Where to write the server's public certificate (DER)
    #[serde(default = "default_cert_path")]
    pub cert_path: String,
    /// Retransmit budget per reliable message
    #[serde(default = "default_max_retransmit")]
    pub max_retransmit: u32,
    /// Ack timeout in milliseconds
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Silence window in seconds before a client is dropped
    #[serde(default = "default_max_heartbeat_delta_secs")]
    pub max_heartbeat_delta_secs: u64,
    /// Statistics interval in seconds
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCliConfig {
    /// Server endpoint to connect to
    pub server: SocketAddr,
    /// Application identifier carried in every packet header
    #[serde(default = "default_app_id")]
    pub app_id: u16,
    /// Application version carried in every packet header
    #[serde(default = "default_app_version")]
    pub app_version: u16,
    /// Where to read the server's public certificate from (DER)
    #[serde(default = "default_cert_path")]
    pub cert_path: String,
    /// Retransmit budget per reliable message
    #[serde(default = "default_max_retransmit")]
    pub max_retransmit: u32,
    /// Ack timeout in milliseconds
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Silence window in seconds before the server is considered gone
    #[serde(default = "default_max_heartbeat_delta_secs")]
    pub max_heartbeat_delta_secs: u64,
}

fn default_app_id() -> u16 {
    1
}

fn default_app_version() -> u16 {
    1
}

fn default_cert_path() -> String {
    "snp-server-cert.der".to_string()
}

fn default_max_retransmit() -> u32 {
    3
}

fn default_ack_timeout_ms() -> u64 {
    3000
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_max_heartbeat_delta_secs() -> u64 {
    10
}

fn default_stats_interval() -> u64 {
    5
}

/// Combined configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: Option<ServerCliConfig>,
    /// Client configuration
    pub client: Option<ClientCliConfig>,
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Create example server configuration
    pub fn example_server() -> Self {
        Config {
            server: Some(ServerCliConfig {
                listen: "0.0.0.0:7600".parse().unwrap(),
                app_id: 1,
                app_version: 1,
                cert_path: default_cert_path(),
                max_retransmit: 3,
                ack_timeout_ms: 3000,
                max_heartbeat_delta_secs: 10,
                stats_interval_secs: 5,
            }),
            client: None,
        }
    }

    /// Create example client configuration
    pub fn example_client() -> Self {
        Config {
            server: None,
            client: Some(ClientCliConfig {
                server: "127.0.0.1:7600".parse().unwrap(),
                app_id: 1,
                app_version: 1,
                cert_path: default_cert_path(),
                max_retransmit: 3,
                ack_timeout_ms: 3000,
                heartbeat_interval_ms: 1000,
                max_heartbeat_delta_secs: 10,
            }),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ServerCliConfig {
    /// Get ack timeout as Duration
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Get the silence window as Duration
    pub fn max_heartbeat_delta(&self) -> Duration {
        Duration::from_secs(self.max_heartbeat_delta_secs)
    }

    /// Get statistics interval as Duration
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    /// Copy the tuning knobs onto a driver configuration.
    pub fn apply(&self, config: &mut ServerConfig) {
        config.max_retransmit = self.max_retransmit;
        config.ack_timeout = self.ack_timeout();
        config.max_heartbeat_delta = self.max_heartbeat_delta();
    }
}

impl ClientCliConfig {
    /// Get ack timeout as Duration
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Get the silence window as Duration
    pub fn max_heartbeat_delta(&self) -> Duration {
        Duration::from_secs(self.max_heartbeat_delta_secs)
    }

    /// Copy the tuning knobs onto a driver configuration.
    pub fn apply(&self, config: &mut ClientConfig) {
        config.max_retransmit = self.max_retransmit;
        config.ack_timeout = self.ack_timeout();
        config.heartbeat_interval = self.heartbeat_interval();
        config.max_heartbeat_delta = self.max_heartbeat_delta();
    }
}
