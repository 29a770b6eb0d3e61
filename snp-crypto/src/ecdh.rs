//! X25519 key agreement
//!
//! Each side of the handshake generates two ephemeral keypairs: one pair
//! derives the AES session key, the other derives the HMAC key. The two
//! exchanges are independent so a compromise of one derived key reveals
//! nothing about the other.

use x25519_dalek::{PublicKey, StaticSecret};

/// X25519 public key size in bytes
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Shared secret size in bytes (used directly as AES-256 / HMAC key material)
pub const SHARED_SECRET_SIZE: usize = 32;

/// An ephemeral X25519 keypair.
///
/// The secret half never leaves this struct; `x25519-dalek` zeroizes it on
/// drop. Held only for the duration of the handshake window.
pub struct EcdhKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl EcdhKeyPair {
    /// Generate a fresh keypair from OS randomness.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        EcdhKeyPair { secret, public }
    }

    /// The public key bytes to embed in a handshake payload.
    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Derive the shared secret against a peer's public key.
    pub fn derive(&self, peer_public: &[u8; PUBLIC_KEY_SIZE]) -> [u8; SHARED_SECRET_SIZE] {
        let peer = PublicKey::from(*peer_public);
        self.secret.diffie_hellman(&peer).to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_agreement_symmetry() {
        let client = EcdhKeyPair::generate();
        let server = EcdhKeyPair::generate();

        let client_shared = client.derive(&server.public_bytes());
        let server_shared = server.derive(&client.public_bytes());

        assert_eq!(client_shared, server_shared);
    }

    #[test]
    fn test_independent_pairs_yield_independent_secrets() {
        let a1 = EcdhKeyPair::generate();
        let a2 = EcdhKeyPair::generate();
        let b = EcdhKeyPair::generate();

        assert_ne!(a1.derive(&b.public_bytes()), a2.derive(&b.public_bytes()));
    }
}
