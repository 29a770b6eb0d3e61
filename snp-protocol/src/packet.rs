//! SNP Packet Structures and Serialization
//!
//! Every SNP datagram starts with a fixed 83-byte header followed by a
//! length-prefixed data region, an optional HMAC-over-data block, and an
//! optional RSA signature block. All multi-byte integers are big-endian.
//!
//! ```text
//! [AppID:u16][AppVer:u16][Flags:u16][Type:u8][UID:u32][SessionID:16]
//! [IV:16][HeaderHMAC:32][CRC32:u32][DataLen:u32][Data...][DataHMAC:32?][Sig:256?]
//! ```
//!
//! Finalization order matters cryptographically: the data HMAC covers the
//! data region, the signature covers header fields plus data plus data-HMAC,
//! the header HMAC covers everything except itself and the CRC, and the CRC
//! covers everything except itself. The write side encodes that order in the
//! type system: [`PacketBuilder`] -> [`DataStage`] -> [`MacStage`] ->
//! [`SignStage`] -> sealed bytes, so a packet finalized out of order does not
//! compile.

use crate::session::{SessionId, SESSION_ID_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use snp_crypto::{crc32_parts, Certificate, MacKey, PublicCertificate, MAC_SIZE, SIGNATURE_SIZE};
use std::fmt;
use thiserror::Error;

/// AES IV size carried in every header
pub const IV_SIZE: usize = 16;

// Fixed header field offsets.
const OFF_APP_ID: usize = 0;
const OFF_APP_VERSION: usize = 2;
const OFF_FLAGS: usize = 4;
const OFF_TYPE: usize = 6;
const OFF_UID: usize = 7;
const OFF_SESSION: usize = 11;
const OFF_IV: usize = OFF_SESSION + SESSION_ID_SIZE;
const OFF_HEADER_HMAC: usize = OFF_IV + IV_SIZE;
const OFF_CRC: usize = OFF_HEADER_HMAC + MAC_SIZE;
const OFF_DATA_LEN: usize = OFF_CRC + 4;

/// Size of the fixed header (through the data-length prefix)
pub const HEADER_SIZE: usize = OFF_DATA_LEN + 4;

/// Offset of the data region in a packet buffer
pub const DATA_OFFSET: usize = HEADER_SIZE;

/// Maximum data region size: MTU 1500 minus IP/UDP headers, the fixed
/// header, and worst-case HMAC + signature trailers.
pub const MAX_PAYLOAD_SIZE: usize = 1472 - HEADER_SIZE - MAC_SIZE - SIGNATURE_SIZE;

/// Packet flag bits
pub mod flags {
    /// This packet acknowledges another packet; data carries the transmit id.
    pub const ACK: u16 = 1 << 0;
    /// An RSA signature block follows the data (and data-HMAC, if present).
    pub const SIGNED: u16 = 1 << 1;
    /// An HMAC-over-data block follows the data region.
    pub const HMAC: u16 = 1 << 2;
    /// The data region is AES-encrypted.
    pub const ENCRYPTED: u16 = 1 << 3;
    /// The sender expects an acknowledgement and will retransmit.
    pub const RELIABLE: u16 = 1 << 4;
}

/// Packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Disconnect = 2,
    Heartbeat = 3,
    Message = 4,
    Request = 5,
    Response = 6,
    ClientHello = 7,
    ServerHello = 8,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(PacketType::Connect),
            2 => Some(PacketType::Disconnect),
            3 => Some(PacketType::Heartbeat),
            4 => Some(PacketType::Message),
            5 => Some(PacketType::Request),
            6 => Some(PacketType::Response),
            7 => Some(PacketType::ClientHello),
            8 => Some(PacketType::ServerHello),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// True for the application-data packet types.
    pub fn is_message(self) -> bool {
        matches!(
            self,
            PacketType::Message | PacketType::Request | PacketType::Response
        )
    }
}

/// Combined `(PacketUID, CRC32)` identifier.
///
/// Used both to match acknowledgements to outbound messages and to detect
/// replayed/duplicate inbound packets.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct TransmitId(u64);

impl TransmitId {
    /// The empty/invalid transmit id.
    pub const EMPTY: TransmitId = TransmitId(0);

    pub fn new(uid: u32, crc: u32) -> Self {
        TransmitId(((uid as u64) << 32) | crc as u64)
    }

    pub fn from_raw(raw: u64) -> Self {
        TransmitId(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }

    pub fn uid(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn crc(self) -> u32 {
        self.0 as u32
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for TransmitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransmitId(uid={}, crc={:08x})", self.uid(), self.crc())
    }
}

/// Packet parsing and construction errors
#[derive(Error, Debug)]
pub enum PacketError {
    #[error("insufficient data: expected at least {expected} bytes, got {actual}")]
    Undersized { expected: usize, actual: usize },

    #[error("length mismatch: declared {declared} bytes, buffer holds {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("invalid packet type: {0}")]
    InvalidType(u8),

    #[error("packet has no {0} block")]
    MissingBlock(&'static str),
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Read-only view over a received packet buffer.
///
/// Construction validates the overall layout (header present, declared data
/// length plus optional trailers exactly fills the buffer); field accessors
/// are then infallible slices at fixed offsets. Nothing is copied.
pub struct PacketView<'a> {
    buf: &'a [u8],
}

impl<'a> PacketView<'a> {
    pub fn new(buf: &'a [u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_SIZE {
            return Err(PacketError::Undersized {
                expected: HEADER_SIZE,
                actual: buf.len(),
            });
        }

        let flags = read_u16(buf, OFF_FLAGS);
        let data_len = read_u32(buf, OFF_DATA_LEN) as usize;

        let mut expected = HEADER_SIZE + data_len;
        if flags & flags::HMAC != 0 {
            expected += MAC_SIZE;
        }
        if flags & flags::SIGNED != 0 {
            expected += SIGNATURE_SIZE;
        }
        if buf.len() != expected {
            return Err(PacketError::LengthMismatch {
                declared: expected,
                actual: buf.len(),
            });
        }

        Ok(PacketView { buf })
    }

    pub fn app_id(&self) -> u16 {
        read_u16(self.buf, OFF_APP_ID)
    }

    pub fn app_version(&self) -> u16 {
        read_u16(self.buf, OFF_APP_VERSION)
    }

    pub fn flags(&self) -> u16 {
        read_u16(self.buf, OFF_FLAGS)
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags() & flag != 0
    }

    pub fn packet_type(&self) -> Result<PacketType, PacketError> {
        let raw = self.buf[OFF_TYPE];
        PacketType::from_u8(raw).ok_or(PacketError::InvalidType(raw))
    }

    pub fn uid(&self) -> u32 {
        read_u32(self.buf, OFF_UID)
    }

    pub fn session_id(&self) -> SessionId {
        let mut id = [0u8; SESSION_ID_SIZE];
        id.copy_from_slice(&self.buf[OFF_SESSION..OFF_SESSION + SESSION_ID_SIZE]);
        SessionId::from_bytes(id)
    }

    pub fn iv(&self) -> [u8; IV_SIZE] {
        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&self.buf[OFF_IV..OFF_IV + IV_SIZE]);
        iv
    }

    pub fn crc(&self) -> u32 {
        read_u32(self.buf, OFF_CRC)
    }

    pub fn data_len(&self) -> usize {
        read_u32(self.buf, OFF_DATA_LEN) as usize
    }

    /// The data region (ciphertext for encrypted packets).
    pub fn data(&self) -> &'a [u8] {
        &self.buf[DATA_OFFSET..DATA_OFFSET + self.data_len()]
    }

    /// The HMAC-over-data block, present iff `flags::HMAC` is set.
    pub fn data_hmac(&self) -> Result<&'a [u8], PacketError> {
        if !self.has_flag(flags::HMAC) {
            return Err(PacketError::MissingBlock("data-hmac"));
        }
        let off = DATA_OFFSET + self.data_len();
        Ok(&self.buf[off..off + MAC_SIZE])
    }

    /// The RSA signature block, present iff `flags::SIGNED` is set.
    pub fn signature(&self) -> Result<&'a [u8], PacketError> {
        if !self.has_flag(flags::SIGNED) {
            return Err(PacketError::MissingBlock("signature"));
        }
        let off = self.buf.len() - SIGNATURE_SIZE;
        Ok(&self.buf[off..])
    }

    /// The transmit id of this packet: `(uid, crc)`.
    pub fn transmit_id(&self) -> TransmitId {
        TransmitId::new(self.uid(), self.crc())
    }

    /// Recompute the CRC32 and compare against the stored field.
    pub fn crc_valid(&self) -> bool {
        let computed = crc32_parts(&[&self.buf[..OFF_CRC], &self.buf[OFF_DATA_LEN..]]);
        computed == self.crc()
    }

    /// Verify the header HMAC: covers everything except the HMAC field
    /// itself and the CRC field.
    pub fn verify_header_hmac(&self, key: &MacKey) -> bool {
        key.verify(
            &[&self.buf[..OFF_HEADER_HMAC], &self.buf[OFF_DATA_LEN..]],
            &self.buf[OFF_HEADER_HMAC..OFF_HEADER_HMAC + MAC_SIZE],
        )
    }

    /// Verify the HMAC-over-data block against the data region.
    pub fn verify_data_hmac(&self, key: &MacKey) -> bool {
        match self.data_hmac() {
            Ok(tag) => key.verify(&[self.data()], tag),
            Err(_) => false,
        }
    }

    /// Verify the RSA signature. Coverage: header fields (excluding the
    /// header-HMAC and CRC fields, which are written after signing) plus the
    /// data region and data-HMAC block.
    pub fn verify_signature(&self, cert: &PublicCertificate) -> bool {
        let sig = match self.signature() {
            Ok(sig) => sig,
            Err(_) => return false,
        };
        let sig_off = self.buf.len() - SIGNATURE_SIZE;
        let mut covered =
            Vec::with_capacity(OFF_HEADER_HMAC + (sig_off - OFF_DATA_LEN));
        covered.extend_from_slice(&self.buf[..OFF_HEADER_HMAC]);
        covered.extend_from_slice(&self.buf[OFF_DATA_LEN..sig_off]);
        cert.verify(&covered, sig)
    }
}

/// Identity fields for a packet under construction.
#[derive(Clone, Debug)]
pub struct HeaderFields {
    pub app_id: u16,
    pub app_version: u16,
    /// ACK / ENCRYPTED / RELIABLE bits; the SIGNED and HMAC bits are managed
    /// by the builder stages.
    pub flags: u16,
    pub packet_type: PacketType,
    pub uid: u32,
    pub session_id: SessionId,
    pub iv: [u8; IV_SIZE],
}

fn set_flag(buf: &mut BytesMut, flag: u16) {
    let current = read_u16(buf, OFF_FLAGS);
    buf[OFF_FLAGS..OFF_FLAGS + 2].copy_from_slice(&(current | flag).to_be_bytes());
}

fn append_signature(mut buf: BytesMut, cert: &Certificate) -> Result<BytesMut, MessageSignError> {
    set_flag(&mut buf, flags::SIGNED);
    let mut covered = Vec::with_capacity(OFF_HEADER_HMAC + (buf.len() - OFF_DATA_LEN));
    covered.extend_from_slice(&buf[..OFF_HEADER_HMAC]);
    covered.extend_from_slice(&buf[OFF_DATA_LEN..]);
    let signature = cert.sign(&covered)?;
    buf.put_slice(&signature);
    Ok(buf)
}

fn seal_packet(mut buf: BytesMut, hmac_key: Option<&MacKey>) -> Bytes {
    // Header HMAC first (it must cover the final trailer bytes), CRC last.
    if let Some(key) = hmac_key {
        let tag = key.compute(&[&buf[..OFF_HEADER_HMAC], &buf[OFF_DATA_LEN..]]);
        buf[OFF_HEADER_HMAC..OFF_HEADER_HMAC + MAC_SIZE].copy_from_slice(&tag);
    }
    let crc = crc32_parts(&[&buf[..OFF_CRC], &buf[OFF_DATA_LEN..]]);
    buf[OFF_CRC..OFF_CRC + 4].copy_from_slice(&crc.to_be_bytes());
    buf.freeze()
}

/// Signing failures during packet construction.
pub type MessageSignError = snp_crypto::CryptoError;

/// Staged packet writer.
///
/// `PacketBuilder::new` fixes the identity fields; [`Self::payload`] writes
/// the data region and yields a [`DataStage`]. Each subsequent stage consumes
/// the previous one, so the data-HMAC / signature / header-HMAC / CRC order
/// cannot be violated by callers.
pub struct PacketBuilder {
    buf: BytesMut,
}

impl PacketBuilder {
    pub fn new(fields: &HeaderFields) -> Self {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 128);
        buf.put_u16(fields.app_id);
        buf.put_u16(fields.app_version);
        buf.put_u16(fields.flags & !(flags::SIGNED | flags::HMAC));
        buf.put_u8(fields.packet_type.as_u8());
        buf.put_u32(fields.uid);
        buf.put_slice(fields.session_id.as_bytes());
        buf.put_slice(&fields.iv);
        buf.put_bytes(0, MAC_SIZE); // header HMAC, written by seal
        buf.put_u32(0); // CRC32, written by seal
        debug_assert_eq!(buf.len(), OFF_DATA_LEN);
        PacketBuilder { buf }
    }

    /// Write the length-prefixed data region.
    pub fn payload(mut self, data: &[u8]) -> Result<DataStage, PacketError> {
        if data.len() > MAX_PAYLOAD_SIZE {
            return Err(PacketError::PayloadTooLarge {
                size: data.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        self.buf.put_u32(data.len() as u32);
        self.buf.put_slice(data);
        Ok(DataStage { buf: self.buf })
    }
}

/// Builder stage: data written, trailers not yet placed.
pub struct DataStage {
    buf: BytesMut,
}

impl DataStage {
    /// Append an HMAC block over the data region and set `flags::HMAC`.
    pub fn data_hmac(mut self, key: &MacKey) -> MacStage {
        set_flag(&mut self.buf, flags::HMAC);
        let tag = key.compute(&[&self.buf[DATA_OFFSET..]]);
        self.buf.put_slice(&tag);
        MacStage { buf: self.buf }
    }

    /// Append an RSA signature block and set `flags::SIGNED`.
    pub fn sign(self, cert: &Certificate) -> Result<SignStage, MessageSignError> {
        Ok(SignStage {
            buf: append_signature(self.buf, cert)?,
        })
    }

    /// Finalize: write the header HMAC (zeros when no key is available yet,
    /// as in hello packets) and then the CRC32.
    pub fn seal(self, hmac_key: Option<&MacKey>) -> Bytes {
        seal_packet(self.buf, hmac_key)
    }
}

/// Builder stage: data HMAC placed.
pub struct MacStage {
    buf: BytesMut,
}

impl MacStage {
    /// Append an RSA signature block (covering data and data-HMAC) and set
    /// `flags::SIGNED`.
    pub fn sign(self, cert: &Certificate) -> Result<SignStage, MessageSignError> {
        Ok(SignStage {
            buf: append_signature(self.buf, cert)?,
        })
    }

    pub fn seal(self, hmac_key: Option<&MacKey>) -> Bytes {
        seal_packet(self.buf, hmac_key)
    }
}

/// Builder stage: signature placed; only sealing remains.
pub struct SignStage {
    buf: BytesMut,
}

impl SignStage {
    pub fn seal(self, hmac_key: Option<&MacKey>) -> Bytes {
        seal_packet(self.buf, hmac_key)
    }
}

/// Build an acknowledgement for a received packet: same type byte, ACK flag
/// set, data region carrying the acknowledged transmit id.
pub fn build_ack(
    app_id: u16,
    app_version: u16,
    packet_type: PacketType,
    uid: u32,
    session_id: SessionId,
    acked: TransmitId,
    hmac_key: Option<&MacKey>,
) -> Bytes {
    let fields = HeaderFields {
        app_id,
        app_version,
        flags: flags::ACK,
        packet_type,
        uid,
        session_id,
        iv: [0u8; IV_SIZE],
    };
    PacketBuilder::new(&fields)
        .payload(&acked.as_raw().to_be_bytes())
        .expect("ack payload is 8 bytes")
        .seal(hmac_key)
}

/// Extract the acknowledged transmit id from an ACK packet's data region.
pub fn parse_ack_data(data: &[u8]) -> Option<TransmitId> {
    if data.len() != 8 {
        return None;
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(data);
    Some(TransmitId::from_raw(u64::from_be_bytes(raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use snp_crypto::random_array;

    fn fields(packet_type: PacketType) -> HeaderFields {
        HeaderFields {
            app_id: 0x5150,
            app_version: 3,
            flags: flags::RELIABLE | flags::ENCRYPTED,
            packet_type,
            uid: 42,
            session_id: SessionId::from_bytes([7u8; SESSION_ID_SIZE]),
            iv: random_array(),
        }
    }

    #[test]
    fn test_plain_packet_roundtrip() {
        let f = fields(PacketType::Message);
        let wire = PacketBuilder::new(&f).payload(b"hello").unwrap().seal(None);

        let view = PacketView::new(&wire).unwrap();
        assert_eq!(view.app_id(), 0x5150);
        assert_eq!(view.app_version(), 3);
        assert_eq!(view.packet_type().unwrap(), PacketType::Message);
        assert_eq!(view.uid(), 42);
        assert_eq!(view.session_id(), f.session_id);
        assert_eq!(view.iv(), f.iv);
        assert_eq!(view.data(), b"hello");
        assert!(view.has_flag(flags::RELIABLE));
        assert!(!view.has_flag(flags::SIGNED));
        assert!(view.crc_valid());
    }

    #[test]
    fn test_undersized_rejected() {
        assert!(matches!(
            PacketView::new(&[0u8; HEADER_SIZE - 1]),
            Err(PacketError::Undersized { .. })
        ));
    }

    #[test]
    fn test_truncated_data_rejected() {
        let wire = PacketBuilder::new(&fields(PacketType::Message))
            .payload(b"hello world")
            .unwrap()
            .seal(None);
        assert!(matches!(
            PacketView::new(&wire[..wire.len() - 1]),
            Err(PacketError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_crc_detects_corruption() {
        let wire = PacketBuilder::new(&fields(PacketType::Message))
            .payload(b"payload")
            .unwrap()
            .seal(None);

        let mut corrupted = wire.to_vec();
        corrupted[DATA_OFFSET] ^= 0x01;
        let view = PacketView::new(&corrupted).unwrap();
        assert!(!view.crc_valid());
    }

    #[test]
    fn test_header_hmac_rejects_tamper_and_wrong_key() {
        let key = MacKey::new(random_array());
        let wrong = MacKey::new(random_array());
        let wire = PacketBuilder::new(&fields(PacketType::Heartbeat))
            .payload(&[])
            .unwrap()
            .seal(Some(&key));

        let view = PacketView::new(&wire).unwrap();
        assert!(view.verify_header_hmac(&key));
        assert!(!view.verify_header_hmac(&wrong));

        // Flip a session-id byte: header HMAC must catch it even though the
        // packet is re-CRC'd.
        let mut spliced = wire.to_vec();
        spliced[OFF_SESSION] ^= 0xff;
        let crc = crc32_parts(&[&spliced[..OFF_CRC], &spliced[OFF_DATA_LEN..]]);
        spliced[OFF_CRC..OFF_CRC + 4].copy_from_slice(&crc.to_be_bytes());
        let view = PacketView::new(&spliced).unwrap();
        assert!(view.crc_valid());
        assert!(!view.verify_header_hmac(&key));
    }

    #[test]
    fn test_data_hmac_and_signature_blocks() {
        let key = MacKey::new(random_array());
        let cert = Certificate::generate().unwrap();

        let wire = PacketBuilder::new(&fields(PacketType::Request))
            .payload(b"ciphertext bytes")
            .unwrap()
            .data_hmac(&key)
            .sign(&cert)
            .unwrap()
            .seal(Some(&key));

        let view = PacketView::new(&wire).unwrap();
        assert!(view.has_flag(flags::HMAC));
        assert!(view.has_flag(flags::SIGNED));
        assert!(view.crc_valid());
        assert!(view.verify_header_hmac(&key));
        assert!(view.verify_data_hmac(&key));
        assert!(view.verify_signature(&cert.public()));

        // Tamper with one data byte: every covering check must fail.
        let mut tampered = wire.to_vec();
        tampered[DATA_OFFSET + 3] ^= 0x20;
        let crc = crc32_parts(&[&tampered[..OFF_CRC], &tampered[OFF_DATA_LEN..]]);
        tampered[OFF_CRC..OFF_CRC + 4].copy_from_slice(&crc.to_be_bytes());
        let view = PacketView::new(&tampered).unwrap();
        assert!(!view.verify_data_hmac(&key));
        assert!(!view.verify_signature(&cert.public()));
        assert!(!view.verify_header_hmac(&key));
    }

    #[test]
    fn test_header_hmac_covers_signature_bytes() {
        let key = MacKey::new(random_array());
        let cert = Certificate::generate().unwrap();

        let wire = PacketBuilder::new(&fields(PacketType::Response))
            .payload(b"data")
            .unwrap()
            .sign(&cert)
            .unwrap()
            .seal(Some(&key));

        let mut tampered = wire.to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        let crc = crc32_parts(&[&tampered[..OFF_CRC], &tampered[OFF_DATA_LEN..]]);
        tampered[OFF_CRC..OFF_CRC + 4].copy_from_slice(&crc.to_be_bytes());

        let view = PacketView::new(&tampered).unwrap();
        assert!(!view.verify_header_hmac(&key));
    }

    #[test]
    fn test_payload_too_large() {
        let oversized = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(
            PacketBuilder::new(&fields(PacketType::Message)).payload(&oversized),
            Err(PacketError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_ack_roundtrip() {
        let acked = TransmitId::new(1234, 0xdead_beef);
        let wire = build_ack(
            0x5150,
            3,
            PacketType::Request,
            99,
            SessionId::EMPTY,
            acked,
            None,
        );

        let view = PacketView::new(&wire).unwrap();
        assert!(view.has_flag(flags::ACK));
        assert_eq!(view.packet_type().unwrap(), PacketType::Request);
        assert_eq!(parse_ack_data(view.data()), Some(acked));
    }

    #[test]
    fn test_transmit_id_parts() {
        let id = TransmitId::new(7, 9);
        assert_eq!(id.uid(), 7);
        assert_eq!(id.crc(), 9);
        assert_eq!(TransmitId::from_raw(id.as_raw()), id);
        assert!(TransmitId::EMPTY.is_empty());
        assert!(!id.is_empty());
    }
}
