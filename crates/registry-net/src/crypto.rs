//! Shared-key sealing of gossip frames
//!
//! Every node in a secured cluster holds the same secret. Frame payloads
//! are sealed with ChaCha20-Poly1305 under a key derived from that secret,
//! with the frame type bound as associated data.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use thiserror::Error;

/// Key used when security is enabled without an explicit secret
pub const DEFAULT_KEY: &[u8] = b"DefaultGossipKey";

const KEY_CONTEXT: &str = "gossip-registry 2024 frame sealing key v1";
const NONCE_LEN: usize = 12;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key length {0} (expected 16, 24 or 32 bytes)")]
    InvalidKeyLength(usize),
    #[error("AEAD encryption failed")]
    EncryptionFailed,
    #[error("AEAD decryption failed")]
    DecryptionFailed,
    #[error("Sealed payload too short")]
    Truncated,
}

/// Derived frame-sealing key
#[derive(Clone)]
pub struct SecretKey {
    key: [u8; 32],
}

impl SecretKey {
    /// Derive a sealing key from a 16, 24 or 32 byte secret
    pub fn new(secret: &[u8]) -> Result<Self, CryptoError> {
        if !matches!(secret.len(), 16 | 24 | 32) {
            return Err(CryptoError::InvalidKeyLength(secret.len()));
        }
        Ok(Self {
            key: blake3::derive_key(KEY_CONTEXT, secret),
        })
    }

    /// Key derived from [`DEFAULT_KEY`]
    pub fn default_key() -> Self {
        Self {
            key: blake3::derive_key(KEY_CONTEXT, DEFAULT_KEY),
        }
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.key))
    }

    /// Seal a payload: `nonce || ciphertext`
    pub fn seal(&self, frame_type: u8, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let ciphertext = self
            .cipher()
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: &[frame_type],
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a payload produced by [`SecretKey::seal`]
    pub fn open(&self, frame_type: u8, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN {
            return Err(CryptoError::Truncated);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher()
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &[frame_type],
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_lengths() {
        assert!(SecretKey::new(&[0; 16]).is_ok());
        assert!(SecretKey::new(&[0; 24]).is_ok());
        assert!(SecretKey::new(&[0; 32]).is_ok());
        assert!(matches!(SecretKey::new(&[0; 10]), Err(CryptoError::InvalidKeyLength(10))));
    }

    #[test]
    fn test_default_key_matches_explicit() {
        let explicit = SecretKey::new(DEFAULT_KEY).unwrap();
        let sealed = SecretKey::default_key().seal(10, b"hello").unwrap();
        assert_eq!(explicit.open(10, &sealed).unwrap(), b"hello");
    }

    #[test]
    fn test_frame_type_is_bound() {
        let key = SecretKey::default_key();
        let sealed = key.seal(10, b"hello").unwrap();
        assert!(matches!(key.open(20, &sealed), Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn test_truncated_rejected() {
        let key = SecretKey::default_key();
        assert!(matches!(key.open(10, &[1, 2, 3]), Err(CryptoError::Truncated)));
    }
}
