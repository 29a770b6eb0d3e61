//! SNP Drivers
//!
//! The client and server drivers tie the protocol core together: each owns a
//! UDP socket and a background receive thread, dispatches inbound packets
//! through a single validation funnel, and advances handshakes, heartbeats,
//! and the outbound message lifecycle from an application-driven `update`
//! call. Application payloads are handed to pluggable
//! [`MessageController`]s; the transport never interprets them.

pub mod client;
pub mod config;
pub mod connection;
pub mod controller;
pub mod server;
pub mod stats;

pub use client::ClientDriver;
pub use config::{ClientConfig, ServerConfig};
pub use connection::ServerConnection;
pub use controller::{
    MessageController, MessageData, MessageDataError, MessageDataErrorArgs, PacketFilter,
};
pub use server::ServerDriver;
pub use stats::DriverStats;

use snp_io::SocketError;
use snp_protocol::{HandshakeError, MessageError, PacketError};
use thiserror::Error;

/// Driver construction and send errors
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("handshake failure: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("crypto failure: {0}")]
    Crypto(#[from] snp_crypto::CryptoError),

    #[error("message error: {0}")]
    Message(#[from] MessageError),

    #[error("driver is not connected")]
    NotConnected,
}
