//! Application-layer cryptography for Parley.
//!
//! Provides three things:
//!   1. SymmetricKey: the process-lifetime key the relay hands to every client
//!   2. ChaCha20-Poly1305 sealing and opening of chat text under that key
//!   3. BLAKE3 fingerprints, so logs can name a key without revealing it
//!
//! This envelope sits inside TLS. Every client holds the same key, so it
//! gives no secrecy between clients of one relay.
//!
//! All key material derives ZeroizeOnDrop. There is no unsafe code in this module.

use std::fmt;
use std::sync::Arc;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Key length for ChaCha20-Poly1305.
pub const KEY_LEN: usize = 32;

/// Nonce length, prepended to every sealed payload.
pub const NONCE_LEN: usize = 12;

/// Poly1305 tag length, appended by the AEAD.
pub const TAG_LEN: usize = 16;

// ── SymmetricKey ──────────────────────────────────────────────────────────────

/// The shared application-layer key.
///
/// Generated once when the relay starts and never persisted. A restart
/// produces a new key and every previously distributed key stops working.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    bytes: [u8; KEY_LEN],
}

impl SymmetricKey {
    /// Generate a fresh key from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    /// Transport encoding used in `key_distribution` envelopes.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Decode a key received in a `key_distribution` envelope.
    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let raw = Zeroizing::new(hex::decode(encoded.trim())?);
        let bytes: [u8; KEY_LEN] = raw
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::BadKeyLength(raw.len()))?;
        Ok(Self { bytes })
    }

    /// Short BLAKE3 fingerprint: hex of the first 8 digest bytes.
    pub fn fingerprint(&self) -> String {
        let digest = blake3::hash(&self.bytes);
        hex::encode(&digest.as_bytes()[..8])
    }

    /// Seal `plaintext` under this key.
    ///
    /// Output layout: `nonce (12) || ciphertext || tag (16)`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.bytes));

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Seal)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a payload produced by [`SymmetricKey::encrypt`].
    ///
    /// Returns Err on truncation, a wrong key, or any tampering.
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::TooShort(sealed.len()));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.bytes));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Open)
    }

    /// Seal UTF-8 text and hex-encode the result for a `chat_message` envelope.
    pub fn seal_text(&self, text: &str) -> Result<String, CryptoError> {
        Ok(hex::encode(self.encrypt(text.as_bytes())?))
    }

    /// Inverse of [`SymmetricKey::seal_text`].
    pub fn open_text(&self, sealed_hex: &str) -> Result<String, CryptoError> {
        let sealed = hex::decode(sealed_hex)?;
        let plaintext = self.decrypt(&sealed)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::NotUtf8)
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

// ── KeyProvider ───────────────────────────────────────────────────────────────

/// Holds the relay's key for the lifetime of the process.
///
/// No rotation. The key is immutable after startup, so handlers share it
/// through an `Arc` without any locking.
#[derive(Clone)]
pub struct KeyProvider {
    key: Arc<SymmetricKey>,
}

impl KeyProvider {
    /// Generate the process key. Call once at server startup.
    pub fn generate() -> Self {
        Self::with_key(SymmetricKey::generate())
    }

    pub fn with_key(key: SymmetricKey) -> Self {
        Self { key: Arc::new(key) }
    }

    pub fn current_key(&self) -> Arc<SymmetricKey> {
        self.key.clone()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("sealed payload too short ({0} bytes; need at least 28: 12 nonce + 16 MAC)")]
    TooShort(usize),

    #[error("ChaCha20-Poly1305 seal failed")]
    Seal,

    #[error("authentication failed: wrong key or tampered ciphertext")]
    Open,

    #[error("invalid hex encoding: {0}")]
    BadEncoding(#[from] hex::FromHexError),

    #[error("invalid key length: expected 32 bytes, got {0}")]
    BadKeyLength(usize),

    #[error("decrypted payload is not valid UTF-8")]
    NotUtf8,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
