//! SNP I/O and Platform Abstraction
//!
//! This crate provides network I/O and platform-specific abstractions:
//! the UDP socket wrapper the drivers receive on, and timing utilities for
//! heartbeats and retransmission deadlines.

pub mod socket;
pub mod time;

pub use socket::{NetSocket, SocketError};
pub use time::{Timer, Timestamp};
