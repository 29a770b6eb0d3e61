//! Outbound Message Lifecycle
//!
//! A [`Message`] is one application message moving through
//! `Serialize -> Register -> Transmit -> {Success | Failed} -> Garbage`.
//! Serialization happens exactly once: encryption, signing, and HMACs are
//! paid up front and the finished wire bytes are cached, so retransmission is
//! a plain socket send. The owning driver registers the message in an
//! id-keyed map for ack matching, drives retransmission from its update tick,
//! and fires exactly one of the success/failure callbacks on the update
//! thread before sweeping the message.

use crate::packet::{
    flags, HeaderFields, PacketBuilder, PacketError, PacketType, PacketView, TransmitId, IV_SIZE,
};
use crate::session::SessionId;
use bytes::Bytes;
use snp_crypto::{cipher, CryptoError, Certificate, MacKey, KEY_SIZE};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Message option bits (a subset of the packet flag bits).
pub mod options {
    use crate::packet::flags;

    /// Retransmit until acknowledged or the retry budget is exhausted.
    pub const RELIABLE: u16 = flags::RELIABLE;
    /// AES-encrypt the payload with the session key.
    pub const ENCRYPT: u16 = flags::ENCRYPTED;
    /// RSA-sign the packet with the sender's one-time signing key.
    pub const SIGNED: u16 = flags::SIGNED;
    /// Append an HMAC block over the (possibly encrypted) payload.
    pub const HMAC: u16 = flags::HMAC;
}

/// Application message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Message,
    Request,
    Response,
}

impl MessageKind {
    pub fn packet_type(self) -> PacketType {
        match self {
            MessageKind::Message => PacketType::Message,
            MessageKind::Request => PacketType::Request,
            MessageKind::Response => PacketType::Response,
        }
    }

    pub fn from_packet_type(packet_type: PacketType) -> Option<Self> {
        match packet_type {
            PacketType::Message => Some(MessageKind::Message),
            PacketType::Request => Some(MessageKind::Request),
            PacketType::Response => Some(MessageKind::Response),
            _ => None,
        }
    }
}

/// Message lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    /// Holds raw application bytes, not yet on the wire
    Serialize,
    /// Wire bytes built; awaiting insertion into the driver's ack map
    Register,
    /// In flight; retransmitted until acked or the budget runs out
    Transmit,
    /// Acknowledged; success callback pending
    Success,
    /// Serialization error or retransmit exhaustion; failure callback pending
    Failed,
    /// Callback fired; swept on the next update pass
    Garbage,
}

/// Completion callback, fired exactly once on the update thread.
pub type CompletionFn = Box<dyn FnOnce(TransmitId) + Send>;

/// Message serialization errors
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("crypto failure: {0}")]
    Crypto(#[from] CryptoError),

    #[error("message is not in the {0} state")]
    InvalidState(&'static str),
}

/// Key material and identity needed to serialize one message.
pub struct SerializeContext<'a> {
    pub app_id: u16,
    pub app_version: u16,
    pub uid: u32,
    pub session_id: SessionId,
    pub session_key: &'a [u8; KEY_SIZE],
    pub hmac_key: &'a MacKey,
    pub sign_cert: &'a Certificate,
}

/// One outbound application message.
pub struct Message {
    kind: MessageKind,
    options: u16,
    payload: Vec<u8>,
    wire: Bytes,
    transmit_id: TransmitId,
    retransmits_left: u32,
    last_send: Option<Instant>,
    state: MessageState,
    on_success: Option<CompletionFn>,
    on_failed: Option<CompletionFn>,
}

impl Message {
    pub fn new(
        kind: MessageKind,
        options: u16,
        payload: Vec<u8>,
        max_retransmit: u32,
        on_success: Option<CompletionFn>,
        on_failed: Option<CompletionFn>,
    ) -> Self {
        Message {
            kind,
            options,
            payload,
            wire: Bytes::new(),
            transmit_id: TransmitId::EMPTY,
            retransmits_left: max_retransmit,
            last_send: None,
            state: MessageState::Serialize,
            on_success,
            on_failed,
        }
    }

    /// Build the wire packet: encrypt, HMAC, sign, seal. Raw application
    /// bytes are cleared afterwards; only the cached wire bytes remain.
    pub fn serialize(&mut self, ctx: &SerializeContext<'_>) -> Result<(), MessageError> {
        if self.state != MessageState::Serialize {
            return Err(MessageError::InvalidState("serialize"));
        }

        let mut iv = [0u8; IV_SIZE];
        let data = if self.options & options::ENCRYPT != 0 {
            snp_crypto::secure_random_bytes(&mut iv);
            cipher::encrypt(ctx.session_key, &iv, &self.payload)
        } else {
            std::mem::take(&mut self.payload)
        };

        let fields = HeaderFields {
            app_id: ctx.app_id,
            app_version: ctx.app_version,
            flags: self.options & (options::RELIABLE | options::ENCRYPT),
            packet_type: self.kind.packet_type(),
            uid: ctx.uid,
            session_id: ctx.session_id,
            iv,
        };

        let stage = PacketBuilder::new(&fields).payload(&data)?;
        let wire = match (
            self.options & options::HMAC != 0,
            self.options & options::SIGNED != 0,
        ) {
            (true, true) => stage
                .data_hmac(ctx.hmac_key)
                .sign(ctx.sign_cert)?
                .seal(Some(ctx.hmac_key)),
            (true, false) => stage.data_hmac(ctx.hmac_key).seal(Some(ctx.hmac_key)),
            (false, true) => stage.sign(ctx.sign_cert)?.seal(Some(ctx.hmac_key)),
            (false, false) => stage.seal(Some(ctx.hmac_key)),
        };

        self.transmit_id = PacketView::new(&wire)?.transmit_id();
        self.wire = wire;
        self.payload = Vec::new();
        self.state = MessageState::Register;
        Ok(())
    }

    /// Driver bookkeeping: the message is now in the ack-matching map.
    pub fn mark_registered(&mut self) {
        debug_assert_eq!(self.state, MessageState::Register);
        self.state = MessageState::Transmit;
    }

    /// True when the message should go on the wire this tick: never sent, or
    /// the ack timeout elapsed with retransmits remaining.
    pub fn should_send(&self, ack_timeout: Duration) -> bool {
        if self.state != MessageState::Transmit {
            return false;
        }
        match self.last_send {
            None => true,
            Some(at) => at.elapsed() >= ack_timeout && self.retransmits_left > 0,
        }
    }

    /// Record a send. Returns `true` when this was a retransmission.
    /// Unreliable messages complete on the first send: no ack will come.
    pub fn mark_sent(&mut self) -> bool {
        let retransmit = self.last_send.is_some();
        if retransmit {
            self.retransmits_left = self.retransmits_left.saturating_sub(1);
        }
        self.last_send = Some(Instant::now());
        if self.options & options::RELIABLE == 0 {
            self.state = MessageState::Success;
        }
        retransmit
    }

    /// True when the retry budget is spent and the last send timed out.
    pub fn expired(&self, ack_timeout: Duration) -> bool {
        self.state == MessageState::Transmit
            && self.retransmits_left == 0
            && self
                .last_send
                .map(|at| at.elapsed() >= ack_timeout)
                .unwrap_or(false)
    }

    /// An ack matched this message.
    pub fn acknowledge(&mut self) {
        if matches!(self.state, MessageState::Register | MessageState::Transmit) {
            self.state = MessageState::Success;
        }
    }

    /// Serialization failure or retransmit exhaustion.
    pub fn fail(&mut self) {
        if !matches!(self.state, MessageState::Success | MessageState::Garbage) {
            self.state = MessageState::Failed;
        }
    }

    /// Take the callback owed for a finished message and move it to
    /// `Garbage`. Returns `None` for messages still in flight. The caller
    /// must invoke the callback outside any driver lock.
    pub fn take_completion(&mut self) -> Option<CompletionFn> {
        let callback = match self.state {
            MessageState::Success => self.on_success.take(),
            MessageState::Failed => self.on_failed.take(),
            _ => return None,
        };
        self.on_success = None;
        self.on_failed = None;
        self.state = MessageState::Garbage;
        callback
    }

    pub fn state(&self) -> MessageState {
        self.state
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn transmit_id(&self) -> TransmitId {
        self.transmit_id
    }

    /// The cached wire bytes (valid after serialization).
    pub fn wire(&self) -> &Bytes {
        &self.wire
    }

    pub fn is_garbage(&self) -> bool {
        self.state == MessageState::Garbage
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, MessageState::Success | MessageState::Failed)
    }
}
