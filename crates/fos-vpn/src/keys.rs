//! WireGuard Key Management
//!
//! X25519 keys as exchanged with users (base64) and with the tunnel
//! engine (lowercase hex). Every decoded key must be exactly 32 bytes.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::rngs::OsRng;
use std::fmt;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

/// Key parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("invalid base64 key encoding")]
    InvalidBase64,

    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// Decode a base64 key, enforcing the 32 byte length
fn decode(s: &str) -> Result<[u8; 32], KeyError> {
    let bytes = BASE64.decode(s.trim()).map_err(|_| KeyError::InvalidBase64)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| KeyError::InvalidLength(bytes.len()))
}

/// Convert a base64 key to the hex form used by the engine protocol
pub fn key_to_hex(s: &str) -> Result<String, KeyError> {
    decode(s).map(hex::encode)
}

/// Check that a string is a well-formed base64 key
pub fn validate_key(s: &str) -> Result<(), KeyError> {
    decode(s).map(|_| ())
}

/// WireGuard private key (Curve25519)
#[derive(Clone)]
pub struct PrivateKey {
    secret: StaticSecret,
}

impl PrivateKey {
    /// Generate a new random private key
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret: StaticSecret::from(bytes),
        }
    }

    /// Create from base64 string
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode(s).map(Self::from_bytes)
    }

    /// Get the corresponding public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: X25519Public::from(&self.secret),
        }
    }

    /// Get raw bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([redacted])")
    }
}

/// WireGuard public key (Curve25519)
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKey {
    key: X25519Public,
}

impl PublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            key: X25519Public::from(bytes),
        }
    }

    /// Create from base64 string
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode(s).map(Self::from_bytes)
    }

    /// Get raw bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_base64()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

/// A key pair (private + public)
#[derive(Clone)]
pub struct KeyPair {
    pub private: PrivateKey,
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self::from_private(PrivateKey::generate())
    }

    /// Create from a private key
    pub fn from_private(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() {
        let keypair = KeyPair::generate();

        assert_eq!(keypair.private.to_bytes().len(), 32);
        assert_eq!(keypair.public, keypair.private.public_key());
    }

    #[test]
    fn test_private_key_base64() {
        let keypair = KeyPair::generate();

        let b64 = keypair.private.to_base64();
        let restored = PrivateKey::from_base64(&b64).unwrap();

        assert_eq!(keypair.private.to_bytes(), restored.to_bytes());
    }

    #[test]
    fn test_key_to_hex() {
        let b64 = BASE64.encode([0xabu8; 32]);
        assert_eq!(key_to_hex(&b64).unwrap(), "ab".repeat(32));
    }

    #[test]
    fn test_wrong_length_rejected() {
        let short = BASE64.encode([1u8; 16]);
        let err = key_to_hex(&short).unwrap_err();

        assert_eq!(err, KeyError::InvalidLength(16));
        assert_eq!(err.to_string(), "invalid key length: expected 32 bytes, got 16");
        assert!(validate_key(&BASE64.encode([1u8; 33])).is_err());
    }

    #[test]
    fn test_invalid_base64() {
        assert_eq!(
            PublicKey::from_base64("not-valid-base64!!!").unwrap_err(),
            KeyError::InvalidBase64
        );
    }

    #[test]
    fn test_private_key_debug_redacted() {
        let key = PrivateKey::generate();
        assert!(!format!("{:?}", key).contains(&key.to_base64()));
    }
}
