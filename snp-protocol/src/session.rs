//! Session Identifiers
//!
//! The server assigns each accepted connection a random 128-bit session id.
//! The all-zero value is the "no session" sentinel used by packets sent
//! before a session exists (hellos and their acks).

use std::fmt;

/// Session identifier size in bytes
pub const SESSION_ID_SIZE: usize = 16;

/// A server-assigned connection identifier.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct SessionId([u8; SESSION_ID_SIZE]);

impl SessionId {
    /// The "no session" sentinel.
    pub const EMPTY: SessionId = SessionId([0u8; SESSION_ID_SIZE]);

    /// Generate a fresh random session id. Never returns the sentinel.
    pub fn generate() -> Self {
        loop {
            let id = SessionId(snp_crypto::random_array());
            if !id.is_empty() {
                return id;
            }
        }
    }

    pub fn from_bytes(bytes: [u8; SESSION_ID_SIZE]) -> Self {
        SessionId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_ID_SIZE] {
        &self.0
    }

    /// True for the "no session" sentinel.
    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; SESSION_ID_SIZE]
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({self})")
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_nonempty_and_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert!(!a.is_empty());
        assert!(!b.is_empty());
        assert_ne!(a, b);
    }

    #[test]
    fn test_sentinel() {
        assert!(SessionId::EMPTY.is_empty());
        assert_eq!(SessionId::from_bytes([0u8; SESSION_ID_SIZE]), SessionId::EMPTY);
    }

    #[test]
    fn test_display_hex() {
        let id = SessionId::from_bytes([0xab; SESSION_ID_SIZE]);
        assert_eq!(id.to_string(), "ab".repeat(SESSION_ID_SIZE));
    }
}
