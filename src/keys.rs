//! At-rest encryption for merchant signing keys.
//!
//! Merchant Ed25519 private keys stored by the gateway are sealed with
//! AES-256-GCM under a single deployment-wide key. The ciphertext layout is
//! `base64(iv || tag || ciphertext)` with a 12-byte random nonce and the
//! 16-byte GCM tag detached up front, so a record is self-contained and can
//! be decrypted with nothing but the deployment key.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("encryption key must be 32 bytes of hex, got {0} bytes")]
    BadKeyLength(usize),
    #[error("encryption key is not valid hex: {0}")]
    BadKeyHex(#[from] hex::FromHexError),
    #[error("ciphertext is not valid base64: {0}")]
    BadCiphertextEncoding(#[from] base64::DecodeError),
    #[error("ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),
    #[error("decryption failed")]
    DecryptFailed,
    #[error("encryption failed")]
    EncryptFailed,
}

/// A parsed AES-256-GCM deployment key.
#[derive(Clone)]
pub struct EncryptionKey(Key<Aes256Gcm>);

impl EncryptionKey {
    /// Parses a 64-character hex string into a 256-bit key.
    pub fn from_hex(hex_key: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_key.trim())?;
        if bytes.len() != 32 {
            return Err(KeyError::BadKeyLength(bytes.len()));
        }
        Ok(Self(*Key::<Aes256Gcm>::from_slice(&bytes)))
    }

    /// Seals `plaintext`, returning `base64(iv || tag || ciphertext)`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, KeyError> {
        let cipher = Aes256Gcm::new(&self.0);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| KeyError::EncryptFailed)?;
        // aes-gcm appends the tag to the ciphertext; the stored layout keeps
        // it between the nonce and the ciphertext body instead.
        let (body, tag) = sealed.split_at(sealed.len() - TAG_LEN);
        let mut out = Vec::with_capacity(NONCE_LEN + TAG_LEN + body.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(tag);
        out.extend_from_slice(body);
        Ok(BASE64.encode(out))
    }

    /// Opens a record produced by [`EncryptionKey::encrypt`].
    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>, KeyError> {
        let raw = BASE64.decode(encoded.trim())?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(KeyError::CiphertextTooShort(raw.len()));
        }
        let (nonce, rest) = raw.split_at(NONCE_LEN);
        let (tag, body) = rest.split_at(TAG_LEN);
        let mut sealed = Vec::with_capacity(body.len() + TAG_LEN);
        sealed.extend_from_slice(body);
        sealed.extend_from_slice(tag);
        let cipher = Aes256Gcm::new(&self.0);
        cipher
            .decrypt(Nonce::from_slice(nonce), sealed.as_ref())
            .map_err(|_| KeyError::DecryptFailed)
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}
