//! Handshake Payload Codecs
//!
//! The CLIENT_HELLO / SERVER_HELLO exchange authenticates the server's
//! long-lived certificate and derives the per-session AES and HMAC keys.
//! Both payloads are two-layer: a fixed-size RSA-encrypted block bootstraps
//! a symmetric key, and an AES-encrypted block carries the remainder.
//!
//! ```text
//! CLIENT_HELLO data:
//!   RSA(server_cert,  one_time_key[32] || one_time_iv[16])
//!   AES(one_time_key, one_time_iv,
//!       secret_pub[32] || hmac_pub[32] || len:u16 || sign_pub_der)
//!
//! SERVER_HELLO data:
//!   RSA(client_sign,  reply_iv[16] || secret_pub[32])
//!   AES(session_key,  reply_iv,
//!       hmac_pub[32] || len:u16 || sign_pub_der || session_id[16])
//! ```
//!
//! The client can only open the SERVER_HELLO inner block after recovering the
//! server's secret-derivation public key from the RSA block and running ECDH,
//! which is exactly the point: a forged hello without the ECDH exchange is
//! undecryptable noise.

use crate::packet::IV_SIZE;
use crate::session::{SessionId, SESSION_ID_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use snp_crypto::{cipher, CryptoError, Certificate, PublicCertificate, KEY_SIZE, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
use thiserror::Error;

/// Handshake encode/decode errors
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("crypto failure: {0}")]
    Crypto(#[from] CryptoError),

    #[error("malformed handshake payload: {0}")]
    Malformed(&'static str),
}

fn put_der(buf: &mut BytesMut, der: &[u8]) {
    buf.put_u16(der.len() as u16);
    buf.put_slice(der);
}

fn take_array<const N: usize>(input: &mut &[u8]) -> Result<[u8; N], HandshakeError> {
    if input.len() < N {
        return Err(HandshakeError::Malformed("truncated field"));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&input[..N]);
    *input = &input[N..];
    Ok(out)
}

fn take_der(input: &mut &[u8]) -> Result<PublicCertificate, HandshakeError> {
    let len_bytes: [u8; 2] = take_array(input)?;
    let len = u16::from_be_bytes(len_bytes) as usize;
    if input.len() < len {
        return Err(HandshakeError::Malformed("truncated key encoding"));
    }
    let cert = PublicCertificate::from_der(&input[..len])?;
    *input = &input[len..];
    Ok(cert)
}

/// Decoded CLIENT_HELLO contents.
pub struct ClientHello {
    /// One-time AES key wrapping the inner block
    pub one_time_key: [u8; KEY_SIZE],
    /// One-time IV; also placed in the packet header's IV field
    pub one_time_iv: [u8; IV_SIZE],
    /// Client's ECDH public key for session-key derivation
    pub secret_public: [u8; PUBLIC_KEY_SIZE],
    /// Client's ECDH public key for HMAC-key derivation
    pub hmac_public: [u8; PUBLIC_KEY_SIZE],
    /// Client's one-time RSA signing public key
    pub sign_public: PublicCertificate,
}

impl ClientHello {
    /// Encode under the server's known public certificate.
    pub fn encode(&self, server_cert: &PublicCertificate) -> Result<Bytes, HandshakeError> {
        let mut outer = Vec::with_capacity(KEY_SIZE + IV_SIZE);
        outer.extend_from_slice(&self.one_time_key);
        outer.extend_from_slice(&self.one_time_iv);
        let wrapped = server_cert.encrypt(&outer)?;

        let der = self.sign_public.to_der()?;
        let mut inner = BytesMut::with_capacity(2 * PUBLIC_KEY_SIZE + 2 + der.len());
        inner.put_slice(&self.secret_public);
        inner.put_slice(&self.hmac_public);
        put_der(&mut inner, &der);
        let sealed = cipher::encrypt(&self.one_time_key, &self.one_time_iv, &inner);

        let mut data = BytesMut::with_capacity(wrapped.len() + sealed.len());
        data.put_slice(&wrapped);
        data.put_slice(&sealed);
        Ok(data.freeze())
    }

    /// Decode with the server's private certificate.
    pub fn decode(data: &[u8], server_cert: &Certificate) -> Result<Self, HandshakeError> {
        if data.len() <= SIGNATURE_SIZE {
            return Err(HandshakeError::Malformed("client hello too short"));
        }
        let outer = server_cert.decrypt(&data[..SIGNATURE_SIZE])?;
        let mut cursor = outer.as_slice();
        let one_time_key: [u8; KEY_SIZE] = take_array(&mut cursor)?;
        let one_time_iv: [u8; IV_SIZE] = take_array(&mut cursor)?;

        let inner = cipher::decrypt(&one_time_key, &one_time_iv, &data[SIGNATURE_SIZE..])?;
        let mut cursor = inner.as_slice();
        let secret_public = take_array(&mut cursor)?;
        let hmac_public = take_array(&mut cursor)?;
        let sign_public = take_der(&mut cursor)?;

        Ok(ClientHello {
            one_time_key,
            one_time_iv,
            secret_public,
            hmac_public,
            sign_public,
        })
    }
}

/// SERVER_HELLO contents (encode side).
pub struct ServerHello {
    /// Fresh IV; also placed in the packet header's IV field so the client
    /// can cross-check for splicing
    pub reply_iv: [u8; IV_SIZE],
    /// Server's ECDH public key for session-key derivation
    pub secret_public: [u8; PUBLIC_KEY_SIZE],
    /// Server's ECDH public key for HMAC-key derivation
    pub hmac_public: [u8; PUBLIC_KEY_SIZE],
    /// Server's one-time RSA signing public key
    pub sign_public: PublicCertificate,
    /// The session id assigned to this connection
    pub session_id: SessionId,
}

/// The RSA-protected half of a SERVER_HELLO, readable before key derivation.
pub struct ServerHelloOuter {
    pub reply_iv: [u8; IV_SIZE],
    pub secret_public: [u8; PUBLIC_KEY_SIZE],
}

/// The AES-protected half of a SERVER_HELLO, readable after key derivation.
pub struct ServerHelloInner {
    pub hmac_public: [u8; PUBLIC_KEY_SIZE],
    pub sign_public: PublicCertificate,
    pub session_id: SessionId,
}

impl ServerHello {
    /// Encode under the client's signing public key (outer) and the derived
    /// session key (inner).
    pub fn encode(
        &self,
        client_sign: &PublicCertificate,
        session_key: &[u8; KEY_SIZE],
    ) -> Result<Bytes, HandshakeError> {
        let mut outer = Vec::with_capacity(IV_SIZE + PUBLIC_KEY_SIZE);
        outer.extend_from_slice(&self.reply_iv);
        outer.extend_from_slice(&self.secret_public);
        let wrapped = client_sign.encrypt(&outer)?;

        let der = self.sign_public.to_der()?;
        let mut inner =
            BytesMut::with_capacity(PUBLIC_KEY_SIZE + 2 + der.len() + SESSION_ID_SIZE);
        inner.put_slice(&self.hmac_public);
        put_der(&mut inner, &der);
        inner.put_slice(self.session_id.as_bytes());
        let sealed = cipher::encrypt(session_key, &self.reply_iv, &inner);

        let mut data = BytesMut::with_capacity(wrapped.len() + sealed.len());
        data.put_slice(&wrapped);
        data.put_slice(&sealed);
        Ok(data.freeze())
    }

    /// Decode the RSA block with the client's private signing certificate.
    pub fn decode_outer(
        data: &[u8],
        client_cert: &Certificate,
    ) -> Result<ServerHelloOuter, HandshakeError> {
        if data.len() <= SIGNATURE_SIZE {
            return Err(HandshakeError::Malformed("server hello too short"));
        }
        let outer = client_cert.decrypt(&data[..SIGNATURE_SIZE])?;
        let mut cursor = outer.as_slice();
        Ok(ServerHelloOuter {
            reply_iv: take_array(&mut cursor)?,
            secret_public: take_array(&mut cursor)?,
        })
    }

    /// Decode the AES block with the freshly derived session key.
    pub fn decode_inner(
        data: &[u8],
        session_key: &[u8; KEY_SIZE],
        reply_iv: &[u8; IV_SIZE],
    ) -> Result<ServerHelloInner, HandshakeError> {
        let inner = cipher::decrypt(session_key, reply_iv, &data[SIGNATURE_SIZE..])?;
        let mut cursor = inner.as_slice();
        let hmac_public = take_array(&mut cursor)?;
        let sign_public = take_der(&mut cursor)?;
        let session_bytes: [u8; SESSION_ID_SIZE] = take_array(&mut cursor)?;
        let session_id = SessionId::from_bytes(session_bytes);
        if session_id.is_empty() {
            return Err(HandshakeError::Malformed("empty session id"));
        }
        Ok(ServerHelloInner {
            hmac_public,
            sign_public,
            session_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snp_crypto::{random_array, EcdhKeyPair};

    #[test]
    fn test_client_hello_roundtrip() {
        let server_cert = Certificate::generate().unwrap();
        let client_sign = Certificate::generate().unwrap();
        let secret_keys = EcdhKeyPair::generate();
        let hmac_keys = EcdhKeyPair::generate();

        let hello = ClientHello {
            one_time_key: random_array(),
            one_time_iv: random_array(),
            secret_public: secret_keys.public_bytes(),
            hmac_public: hmac_keys.public_bytes(),
            sign_public: client_sign.public(),
        };

        let data = hello.encode(&server_cert.public()).unwrap();
        let decoded = ClientHello::decode(&data, &server_cert).unwrap();

        assert_eq!(decoded.one_time_key, hello.one_time_key);
        assert_eq!(decoded.one_time_iv, hello.one_time_iv);
        assert_eq!(decoded.secret_public, hello.secret_public);
        assert_eq!(decoded.hmac_public, hello.hmac_public);

        // The recovered signing key must verify what the original signs.
        let sig = client_sign.sign(b"probe").unwrap();
        assert!(decoded.sign_public.verify(b"probe", &sig));
    }

    #[test]
    fn test_client_hello_wrong_cert_fails() {
        let server_cert = Certificate::generate().unwrap();
        let other_cert = Certificate::generate().unwrap();
        let sign = Certificate::generate().unwrap();

        let hello = ClientHello {
            one_time_key: random_array(),
            one_time_iv: random_array(),
            secret_public: random_array(),
            hmac_public: random_array(),
            sign_public: sign.public(),
        };

        let data = hello.encode(&server_cert.public()).unwrap();
        assert!(ClientHello::decode(&data, &other_cert).is_err());
    }

    #[test]
    fn test_server_hello_roundtrip() {
        let client_sign = Certificate::generate().unwrap();
        let server_sign = Certificate::generate().unwrap();

        let client_secret = EcdhKeyPair::generate();
        let server_secret = EcdhKeyPair::generate();
        let server_hmac = EcdhKeyPair::generate();
        let session_key = server_secret.derive(&client_secret.public_bytes());
        let session_id = SessionId::generate();

        let hello = ServerHello {
            reply_iv: random_array(),
            secret_public: server_secret.public_bytes(),
            hmac_public: server_hmac.public_bytes(),
            sign_public: server_sign.public(),
            session_id,
        };

        let data = hello.encode(&client_sign.public(), &session_key).unwrap();

        // Client side: outer first, then derive, then inner.
        let outer = ServerHello::decode_outer(&data, &client_sign).unwrap();
        assert_eq!(outer.reply_iv, hello.reply_iv);
        assert_eq!(outer.secret_public, server_secret.public_bytes());

        let derived = client_secret.derive(&outer.secret_public);
        assert_eq!(derived, session_key);

        let inner = ServerHello::decode_inner(&data, &derived, &outer.reply_iv).unwrap();
        assert_eq!(inner.hmac_public, server_hmac.public_bytes());
        assert_eq!(inner.session_id, session_id);
    }

    #[test]
    fn test_server_hello_wrong_session_key_fails() {
        let client_sign = Certificate::generate().unwrap();
        let server_sign = Certificate::generate().unwrap();
        let session_key: [u8; 32] = random_array();

        let hello = ServerHello {
            reply_iv: random_array(),
            secret_public: random_array(),
            hmac_public: random_array(),
            sign_public: server_sign.public(),
            session_id: SessionId::generate(),
        };

        let data = hello.encode(&client_sign.public(), &session_key).unwrap();
        let outer = ServerHello::decode_outer(&data, &client_sign).unwrap();
        let wrong_key: [u8; 32] = random_array();
        assert!(ServerHello::decode_inner(&data, &wrong_key, &outer.reply_iv).is_err());
    }
}
