//! At-rest encryption for OAuth tokens (AES-256-GCM).
//!
//! Stored form is base64 of `nonce (12 bytes) || ciphertext`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("Invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("Failed to encrypt token")]
    Encrypt,

    #[error("Failed to decrypt token: {0}")]
    Decrypt(String),
}

#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
        }
    }

    /// Build from a base64-encoded 32-byte key.
    pub fn from_base64(encoded: &str) -> Result<Self, CipherError> {
        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CipherError::InvalidKey(e.to_string()))?;
        let key: [u8; 32] = decoded
            .try_into()
            .map_err(|v: Vec<u8>| CipherError::InvalidKey(format!("expected 32 bytes, got {}", v.len())))?;
        Ok(Self::new(&key))
    }

    /// Random key, for development setups without a configured key.
    pub fn ephemeral() -> Self {
        let key: [u8; 32] = rand::random();
        Self::new(&key)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, CipherError> {
        let raw = STANDARD
            .decode(encoded)
            .map_err(|e| CipherError::Decrypt(e.to_string()))?;
        if raw.len() <= NONCE_LEN {
            return Err(CipherError::Decrypt("ciphertext too short".into()));
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CipherError::Decrypt("authentication failed".into()))?;
        String::from_utf8(plaintext).map_err(|e| CipherError::Decrypt(e.to_string()))
    }
}
