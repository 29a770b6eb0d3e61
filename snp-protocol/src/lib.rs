//! SNP Protocol Core Implementation
//!
//! This crate implements the core SNP (Secure Net Protocol) wire layer:
//! the packet codec, the anti-replay transmit buffer, session identifiers,
//! handshake payload encoding, and the outbound message lifecycle. The
//! client and server drivers in the `snp` crate are built on top of it.

pub mod handshake;
pub mod message;
pub mod packet;
pub mod replay;
pub mod session;

pub use handshake::{ClientHello, HandshakeError, ServerHello};
pub use message::{
    options, CompletionFn, Message, MessageError, MessageKind, MessageState, SerializeContext,
};
pub use packet::{
    flags, HeaderFields, PacketBuilder, PacketError, PacketType, PacketView, TransmitId,
    HEADER_SIZE, MAX_PAYLOAD_SIZE,
};
pub use replay::{ReplaySet, TransmitBuffer};
pub use session::{SessionId, SESSION_ID_SIZE};
