//! SNP Cryptographic Primitives
//!
//! This crate wraps the cryptographic building blocks the SNP transport
//! consumes as black boxes: AES-256-CBC payload encryption, RSA-2048
//! certificates (encrypt-to-public, sign, verify), X25519 key agreement for
//! session-key derivation, HMAC-SHA256 authentication, CRC32 integrity
//! checksums, and OS-backed secure randomness.
//!
//! Nothing in here knows about packets or connections; the transport layers
//! above decide what gets encrypted, signed, and checksummed, and in what
//! order.

pub mod cert;
pub mod cipher;
pub mod ecdh;
pub mod mac;

pub use cert::{Certificate, PublicCertificate, SIGNATURE_SIZE};
pub use cipher::{IV_SIZE, KEY_SIZE};
pub use ecdh::{EcdhKeyPair, PUBLIC_KEY_SIZE, SHARED_SECRET_SIZE};
pub use mac::{MacKey, MAC_SIZE};

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroize;

/// Per-session key material derived during the handshake.
///
/// The AES session key and the HMAC key come from two independent ECDH
/// exchanges. The session key is zeroized on drop ([`MacKey`] zeroizes
/// itself).
pub struct SessionKeys {
    pub session_key: [u8; KEY_SIZE],
    pub hmac_key: MacKey,
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.session_key.zeroize();
    }
}

/// Cryptographic operation errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("RSA operation failed: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("decryption failed")]
    Decrypt,

    #[error("signature verification failed")]
    BadSignature,

    #[error("signature has wrong length: expected {expected}, got {actual}")]
    SignatureLength { expected: usize, actual: usize },

    #[error("malformed key encoding")]
    KeyEncoding,
}

/// Compute a CRC32 checksum over a byte slice.
#[inline]
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Compute a CRC32 checksum over multiple disjoint byte ranges.
///
/// Used for packet checksums that exclude the CRC field itself.
pub fn crc32_parts(parts: &[&[u8]]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

/// Fill a buffer with cryptographically secure random bytes.
pub fn secure_random_bytes(out: &mut [u8]) {
    OsRng.fill_bytes(out);
}

/// Generate a fixed-size array of cryptographically secure random bytes.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_parts_matches_contiguous() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let whole = crc32(data);
        let split = crc32_parts(&[&data[..10], &data[10..30], &data[30..]]);
        assert_eq!(whole, split);
    }

    #[test]
    fn test_random_array_distinct() {
        let a = random_array::<16>();
        let b = random_array::<16>();
        assert_ne!(a, b);
    }
}
