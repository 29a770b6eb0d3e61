//! HMAC-SHA256 message authentication
//!
//! Header HMACs authenticate packet headers against splicing; data HMACs
//! authenticate ciphertext payloads. Both use the session HMAC key derived
//! during the handshake.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 output size in bytes
pub const MAC_SIZE: usize = 32;

/// A 256-bit HMAC key, zeroized on drop.
#[derive(Clone)]
pub struct MacKey {
    key: [u8; 32],
}

impl MacKey {
    pub fn new(key: [u8; 32]) -> Self {
        MacKey { key }
    }

    /// Compute an HMAC over multiple disjoint byte ranges.
    ///
    /// Packet HMAC coverage excludes the HMAC field itself, so callers pass
    /// the ranges around it.
    pub fn compute(&self, parts: &[&[u8]]) -> [u8; MAC_SIZE] {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        for part in parts {
            mac.update(part);
        }
        mac.finalize().into_bytes().into()
    }

    /// Verify an HMAC tag in constant time.
    pub fn verify(&self, parts: &[&[u8]], tag: &[u8]) -> bool {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        for part in parts {
            mac.update(part);
        }
        mac.verify_slice(tag).is_ok()
    }
}

impl Drop for MacKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random_array;

    #[test]
    fn test_compute_verify() {
        let key = MacKey::new(random_array());
        let tag = key.compute(&[b"header", b"data"]);

        assert!(key.verify(&[b"header", b"data"], &tag));
        assert!(!key.verify(&[b"header", b"tampered"], &tag));
        assert!(!key.verify(&[b"header", b"data"], &[0u8; MAC_SIZE]));
    }

    #[test]
    fn test_split_matches_contiguous() {
        let key = MacKey::new(random_array());
        let whole = key.compute(&[b"headerdata"]);
        let split = key.compute(&[b"header", b"data"]);
        assert_eq!(whole, split);
    }

    #[test]
    fn test_different_keys_differ() {
        let a = MacKey::new(random_array());
        let b = MacKey::new(random_array());
        assert_ne!(a.compute(&[b"x"]), b.compute(&[b"x"]));
    }
}
