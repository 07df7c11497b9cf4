//! Parley wire framing.
//!
//! Every envelope travels as one frame: a fixed `FrameHeader` followed by
//! `length` bytes of JSON payload. TLS gives a byte stream with no message
//! boundaries, so `FrameDecoder` accumulates bytes across reads and may
//! produce zero, one, or several frames per read.
//!
//! Wire layout (8 bytes, then payload):
//!   [magic "PL" (2)] [version (1)] [flags (1)] [length u32 BE (4)] [payload]
//!
//! Header types use zerocopy derives for allocation-free parsing. There is no
//! unsafe code in this module.

use bytes::{Buf, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use thiserror::Error;
use zerocopy::byteorder::{NetworkEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// First two bytes of every frame.
pub const FRAME_MAGIC: [u8; 2] = *b"PL";

/// Current protocol version. Frames with any other version are rejected.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of `FrameHeader` on the wire.
pub const HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();

/// Default per-frame payload limit (1 MiB). Receivers may configure their own.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

// ── Frame Header ──────────────────────────────────────────────────────────────

/// Precedes every payload on the wire.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct FrameHeader {
    /// Always `FRAME_MAGIC`. Anything else means the stream is desynchronised
    /// or is not speaking Parley at all.
    pub magic: [u8; 2],

    /// Protocol version, currently `PROTOCOL_VERSION`.
    pub version: u8,

    /// Reserved, sent as zero. Receivers ignore it.
    pub flags: u8,

    /// Payload length in bytes, not including this header.
    pub length: U32<NetworkEndian>,
}

assert_eq_size!(FrameHeader, [u8; 8]);

impl FrameHeader {
    pub fn new(length: u32) -> Self {
        Self {
            magic: FRAME_MAGIC,
            version: PROTOCOL_VERSION,
            flags: 0,
            length: U32::new(length),
        }
    }

    pub fn payload_len(&self) -> usize {
        self.length.get() as usize
    }

    /// Check magic, version, and length limit. Returns the payload length.
    pub fn validate(&self, max_frame_len: usize) -> Result<usize, DecodeError> {
        if self.magic != FRAME_MAGIC {
            return Err(DecodeError::BadMagic(self.magic));
        }
        if self.version != PROTOCOL_VERSION {
            return Err(DecodeError::UnsupportedVersion(self.version));
        }
        let len = self.payload_len();
        if len > max_frame_len {
            return Err(DecodeError::FrameTooLarge {
                len,
                max: max_frame_len,
            });
        }
        Ok(len)
    }
}

/// Build a complete frame (header + payload) ready to write to a stream.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, DecodeError> {
    let length = u32::try_from(payload.len()).map_err(|_| DecodeError::FrameTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;

    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(FrameHeader::new(length).as_bytes());
    frame.extend_from_slice(payload);
    Ok(frame.freeze())
}

// ── Decoder ───────────────────────────────────────────────────────────────────

/// Per-connection accumulation buffer.
///
/// Push raw bytes in as they arrive, then drain complete frames with
/// `next_frame` until it returns `Ok(None)`.
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(HEADER_LEN + 1024),
            max_frame_len,
        }
    }

    /// Append bytes received from the stream.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Direct access for readers that fill the buffer in place.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Bytes held that do not yet form a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame payload, if one is fully buffered.
    ///
    /// A header error is returned as soon as the header is buffered, without
    /// waiting for the payload. After an error the stream cannot be
    /// resynchronised and the connection should be dropped.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, DecodeError> {
        let Some(header) = FrameHeader::read_from_prefix(&self.buf[..]) else {
            return Ok(None);
        };
        let len = header.validate(self.max_frame_len)?;

        let needed = HEADER_LEN + len;
        if self.buf.len() < needed {
            self.buf.reserve(needed - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Call at end of stream. Leftover bytes mean the peer stopped mid-frame.
    pub fn finish(&self) -> Result<(), DecodeError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::Truncated {
                buffered: self.buf.len(),
            })
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("bad frame magic {0:02x?}")]
    BadMagic([u8; 2]),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("stream ended inside a frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },

    #[error("malformed envelope: {0}")]
    Envelope(#[from] serde_json::Error),
}

impl DecodeError {
    /// True when the byte stream itself is unusable, as opposed to one frame
    /// carrying a payload that failed to parse.
    pub fn is_framing(&self) -> bool {
        !matches!(self, DecodeError::Envelope(_))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
