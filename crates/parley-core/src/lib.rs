//! parley-core: shared types, wire format, and cryptographic primitives.
//! All other Parley crates depend on this one.

pub mod config;
pub mod crypto;
pub mod envelope;
pub mod wire;

pub use crypto::{CryptoError, KeyProvider, SymmetricKey};
pub use envelope::{Envelope, SYSTEM_SENDER};
pub use wire::{DecodeError, FrameDecoder, FrameHeader};
