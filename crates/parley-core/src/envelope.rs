//! Application envelopes: the JSON records carried inside frames.
//!
//! On the wire each envelope is a tagged object, for example:
//!
//! ```json
//! {"type":"chat_message","username":"alice","ciphertext":"9f1c…","timestamp":1700000000000}
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::crypto::{CryptoError, SymmetricKey};
use crate::wire::{encode_frame, DecodeError};

/// Sender name the relay uses for its own notices.
pub const SYSTEM_SENDER: &str = "System";

/// Longest username the relay accepts, in bytes.
pub const MAX_USERNAME_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Server → client, first envelope on every connection.
    KeyDistribution {
        /// Hex-encoded `SymmetricKey`.
        key: String,
    },

    /// Client → server, exactly once, right after the key arrives.
    Register { username: String },

    /// Either direction. The relay forwards `ciphertext` without opening it.
    ChatMessage {
        username: String,
        /// Hex of `nonce || ciphertext || tag` under the shared key.
        ciphertext: String,
        /// Unix milliseconds, stamped by the sender.
        timestamp: u64,
    },

    /// Client → server graceful logout.
    Disconnect,
}

impl Envelope {
    pub fn key_distribution(key: &SymmetricKey) -> Self {
        Self::KeyDistribution { key: key.to_hex() }
    }

    pub fn register(username: impl Into<String>) -> Self {
        Self::Register {
            username: username.into(),
        }
    }

    /// Seal `text` under `key` and wrap it, stamped with the current time.
    pub fn chat(username: &str, key: &SymmetricKey, text: &str) -> Result<Self, CryptoError> {
        Ok(Self::ChatMessage {
            username: username.to_string(),
            ciphertext: key.seal_text(text)?,
            timestamp: now_millis(),
        })
    }

    /// A relay-originated notice such as "~~alice joined the chat".
    pub fn system_notice(key: &SymmetricKey, text: &str) -> Result<Self, CryptoError> {
        Self::chat(SYSTEM_SENDER, key, text)
    }

    /// Wire name of the variant, for logs and protocol errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::KeyDistribution { .. } => "key_distribution",
            Self::Register { .. } => "register",
            Self::ChatMessage { .. } => "chat_message",
            Self::Disconnect => "disconnect",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DecodeError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(payload: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Serialize and frame in one step.
    pub fn to_frame(&self) -> Result<Bytes, DecodeError> {
        encode_frame(&self.to_bytes()?)
    }
}

/// Check a requested username. Returns the trimmed name.
pub fn validate_username(raw: &str) -> Result<&str, UsernameError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(UsernameError::Empty);
    }
    if name.len() > MAX_USERNAME_LEN {
        return Err(UsernameError::TooLong(name.len()));
    }
    if name.chars().any(char::is_control) {
        return Err(UsernameError::ControlCharacter);
    }
    if name.eq_ignore_ascii_case(SYSTEM_SENDER) {
        return Err(UsernameError::Reserved(name.to_string()));
    }
    Ok(name)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UsernameError {
    #[error("username is empty")]
    Empty,
    #[error("username is {0} bytes; the limit is 64")]
    TooLong(usize),
    #[error("username contains control characters")]
    ControlCharacter,
    #[error("username {0:?} is reserved for relay notices")]
    Reserved(String),
}

/// Current Unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
