//! Failure taxonomy for one relay connection or one client session.
//!
//! Every variant is contained to the connection it happened on: the server
//! logs it and moves the handler to `Closed`, the client reports it to the
//! caller. Nothing here is allowed to take down the process.

use parley_core::{CryptoError, DecodeError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Connect, accept, read, or write failed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    /// Certificate or key could not be generated, read, or parsed.
    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("TLS handshake timed out")]
    HandshakeTimeout,

    /// Envelope out of sequence or with invalid content.
    #[error("protocol violation in {state}: {detail}")]
    ProtocolViolation { state: &'static str, detail: String },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Peer closed the stream where the protocol required another envelope.
    #[error("connection closed by peer")]
    ConnectionClosed,
}

impl SessionError {
    pub(crate) fn violation(state: &'static str, detail: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            state,
            detail: detail.into(),
        }
    }
}
