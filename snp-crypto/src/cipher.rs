//! AES-256-CBC payload encryption
//!
//! SNP encrypts application payloads and handshake inner blocks with
//! AES-256-CBC and PKCS#7 padding. Every encryption uses a fresh random IV
//! carried in the packet header.

use crate::CryptoError;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES-256 key size in bytes
pub const KEY_SIZE: usize = 32;

/// AES block / IV size in bytes
pub const IV_SIZE: usize = 16;

/// Encrypt a plaintext with AES-256-CBC / PKCS#7.
///
/// The output is always a whole number of blocks and at least one block long.
pub fn encrypt(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE], plaintext: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Decrypt an AES-256-CBC / PKCS#7 ciphertext.
///
/// Fails on ciphertexts that are not block-aligned or carry invalid padding.
/// A padding failure reveals nothing beyond "decryption failed"; callers must
/// authenticate before decrypting.
pub fn decrypt(
    key: &[u8; KEY_SIZE],
    iv: &[u8; IV_SIZE],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}
