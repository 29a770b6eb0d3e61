//! Driver configuration
//!
//! Plain structs handed to the driver constructors. Nothing here is global:
//! every knob travels with the driver that uses it. File-based configuration
//! (TOML) lives in the CLI crate, not here.

use snp_crypto::{Certificate, PublicCertificate};
use snp_protocol::replay::DEFAULT_REPLAY_WINDOW;
use std::net::SocketAddr;
use std::time::Duration;

/// Retransmit budget per message / handshake packet
pub const DEFAULT_MAX_RETRANSMIT: u32 = 3;

/// How long to wait for an ack before retransmitting
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(3);

/// How often an idle client emits a heartbeat
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Silence window after which a peer is considered gone
pub const DEFAULT_MAX_HEARTBEAT_DELTA: Duration = Duration::from_secs(10);

/// Client driver configuration.
#[derive(Clone)]
pub struct ClientConfig {
    pub app_id: u16,
    pub app_version: u16,
    /// Server endpoint to connect to
    pub server_addr: SocketAddr,
    /// The server's long-lived public certificate, known out of band
    pub certificate: PublicCertificate,
    pub max_retransmit: u32,
    pub ack_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_heartbeat_delta: Duration,
}

impl ClientConfig {
    pub fn new(
        app_id: u16,
        app_version: u16,
        server_addr: SocketAddr,
        certificate: PublicCertificate,
    ) -> Self {
        ClientConfig {
            app_id,
            app_version,
            server_addr,
            certificate,
            max_retransmit: DEFAULT_MAX_RETRANSMIT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_heartbeat_delta: DEFAULT_MAX_HEARTBEAT_DELTA,
        }
    }
}

/// Server driver configuration.
#[derive(Clone)]
pub struct ServerConfig {
    pub app_id: u16,
    pub app_version: u16,
    /// Address to listen on
    pub bind_addr: SocketAddr,
    /// The server's long-lived identity keypair
    pub certificate: Certificate,
    pub max_retransmit: u32,
    pub ack_timeout: Duration,
    pub max_heartbeat_delta: Duration,
    /// Anti-replay slots per packet type per connection
    pub replay_window: usize,
}

impl ServerConfig {
    pub fn new(
        app_id: u16,
        app_version: u16,
        bind_addr: SocketAddr,
        certificate: Certificate,
    ) -> Self {
        ServerConfig {
            app_id,
            app_version,
            bind_addr,
            certificate,
            max_retransmit: DEFAULT_MAX_RETRANSMIT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            max_heartbeat_delta: DEFAULT_MAX_HEARTBEAT_DELTA,
            replay_window: DEFAULT_REPLAY_WINDOW,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_defaults() {
        let cert = Certificate::generate().unwrap();
        let config = ClientConfig::new(1, 1, "127.0.0.1:9000".parse().unwrap(), cert.public());
        assert_eq!(config.max_retransmit, DEFAULT_MAX_RETRANSMIT);
        assert_eq!(config.ack_timeout, DEFAULT_ACK_TIMEOUT);
        assert_eq!(config.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
    }

    #[test]
    fn test_server_defaults() {
        let cert = Certificate::generate().unwrap();
        let config = ServerConfig::new(1, 1, "127.0.0.1:0".parse().unwrap(), cert);
        assert_eq!(config.replay_window, DEFAULT_REPLAY_WINDOW);
        assert_eq!(config.max_heartbeat_delta, DEFAULT_MAX_HEARTBEAT_DELTA);
    }
}
