//! Async envelope I/O over any byte stream.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use parley_core::wire::FrameDecoder;
use parley_core::Envelope;

use crate::SessionError;

/// Bytes requested from the stream per read.
const READ_CHUNK: usize = 8 * 1024;

/// Read half of a framed connection.
pub struct FramedReader<R> {
    inner: R,
    decoder: FrameDecoder,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(inner: R, max_frame_len: usize) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(max_frame_len),
        }
    }

    /// Next frame payload. `Ok(None)` is a clean end of stream on a frame
    /// boundary; ending mid-frame is a `Truncated` decode error.
    pub async fn read_frame(&mut self) -> Result<Option<Bytes>, SessionError> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(Some(frame));
            }

            let buf = self.decoder.buffer_mut();
            buf.reserve(READ_CHUNK);
            if self.inner.read_buf(buf).await? == 0 {
                self.decoder.finish()?;
                return Ok(None);
            }
        }
    }

    pub async fn read_envelope(&mut self) -> Result<Option<Envelope>, SessionError> {
        match self.read_frame().await? {
            Some(frame) => Ok(Some(Envelope::from_bytes(&frame)?)),
            None => Ok(None),
        }
    }
}

/// Frame, write, and flush one envelope.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    let frame = envelope.to_frame()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
