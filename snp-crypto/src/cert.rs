//! RSA-2048 certificates
//!
//! A [`Certificate`] is an RSA-2048 keypair. The server's long-lived
//! certificate is its identity: clients know the public half out of band and
//! use it to verify SERVER_HELLO signatures and to wrap the one-time key in
//! CLIENT_HELLO. Both sides additionally generate one-time signing
//! certificates during the handshake for per-message signatures.
//!
//! Encryption is PKCS#1 v1.5; signatures are PKCS#1 v1.5 over SHA-256. The
//! 2048-bit modulus is a protocol constant: the wire format reserves exactly
//! 256 bytes for RSA blocks and signatures.

use crate::CryptoError;
use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

/// RSA modulus size in bits
pub const KEY_BITS: usize = 2048;

/// RSA block size: one signature or one encrypted block, in bytes
pub const SIGNATURE_SIZE: usize = KEY_BITS / 8;

/// Maximum plaintext length for one PKCS#1 v1.5 encrypted block
pub const MAX_ENCRYPT_SIZE: usize = SIGNATURE_SIZE - 11;

/// An RSA keypair: identity certificate or one-time signing key.
#[derive(Clone)]
pub struct Certificate {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl Certificate {
    /// Generate a fresh 2048-bit keypair.
    ///
    /// Key generation is slow (hundreds of milliseconds); long-lived server
    /// certificates should be generated once and reused.
    pub fn generate() -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::new(&mut OsRng, KEY_BITS)?;
        let public = RsaPublicKey::from(&private);
        Ok(Certificate { private, public })
    }

    /// Get the public half of this certificate.
    pub fn public(&self) -> PublicCertificate {
        PublicCertificate {
            key: self.public.clone(),
        }
    }

    /// Decrypt a PKCS#1 v1.5 block encrypted to this certificate's public key.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.private
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }

    /// Sign data with PKCS#1 v1.5 over SHA-256.
    ///
    /// The signature is always [`SIGNATURE_SIZE`] bytes.
    pub fn sign(&self, data: &[u8]) -> Result<[u8; SIGNATURE_SIZE], CryptoError> {
        let signing_key = SigningKey::<Sha256>::new(self.private.clone());
        let signature = signing_key.sign(data);
        let bytes = signature.to_vec();
        if bytes.len() != SIGNATURE_SIZE {
            return Err(CryptoError::SignatureLength {
                expected: SIGNATURE_SIZE,
                actual: bytes.len(),
            });
        }
        let mut out = [0u8; SIGNATURE_SIZE];
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}

/// The public half of a [`Certificate`].
#[derive(Clone)]
pub struct PublicCertificate {
    key: RsaPublicKey,
}

impl PublicCertificate {
    /// Encrypt a short plaintext (at most [`MAX_ENCRYPT_SIZE`] bytes) to this
    /// key with PKCS#1 v1.5. The output is always [`SIGNATURE_SIZE`] bytes.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(self.key.encrypt(&mut OsRng, Pkcs1v15Encrypt, plaintext)?)
    }

    /// Verify a PKCS#1 v1.5 / SHA-256 signature over `data`.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let verifying_key = VerifyingKey::<Sha256>::new(self.key.clone());
        match Signature::try_from(signature) {
            Ok(sig) => verifying_key.verify(data, &sig).is_ok(),
            Err(_) => false,
        }
    }

    /// Serialize to PKCS#1 DER for transmission inside handshake payloads.
    pub fn to_der(&self) -> Result<Vec<u8>, CryptoError> {
        let doc = self
            .key
            .to_pkcs1_der()
            .map_err(|_| CryptoError::KeyEncoding)?;
        Ok(doc.as_bytes().to_vec())
    }

    /// Deserialize from PKCS#1 DER.
    pub fn from_der(der: &[u8]) -> Result<Self, CryptoError> {
        let key = RsaPublicKey::from_pkcs1_der(der).map_err(|_| CryptoError::KeyEncoding)?;
        Ok(PublicCertificate { key })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cert() -> Certificate {
        // 2048-bit generation is slow; share one keypair across assertions.
        Certificate::generate().unwrap()
    }

    #[test]
    fn test_encrypt_decrypt_sign_verify() {
        let cert = test_cert();
        let public = cert.public();

        let secret = b"one-time key material";
        let wrapped = public.encrypt(secret).unwrap();
        assert_eq!(wrapped.len(), SIGNATURE_SIZE);
        assert_eq!(cert.decrypt(&wrapped).unwrap(), secret);

        let data = b"packet bytes to authenticate";
        let sig = cert.sign(data).unwrap();
        assert!(public.verify(data, &sig));
        assert!(!public.verify(b"tampered bytes", &sig));

        let mut bad_sig = sig;
        bad_sig[0] ^= 0x01;
        assert!(!public.verify(data, &bad_sig));
    }

    #[test]
    fn test_der_roundtrip() {
        let cert = test_cert();
        let der = cert.public().to_der().unwrap();
        let restored = PublicCertificate::from_der(&der).unwrap();

        let data = b"roundtrip";
        let sig = cert.sign(data).unwrap();
        assert!(restored.verify(data, &sig));
    }

    #[test]
    fn test_from_der_rejects_garbage() {
        assert!(PublicCertificate::from_der(&[0xde, 0xad, 0xbe, 0xef]).is_err());
    }
}
