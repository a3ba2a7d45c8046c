//! Framed reads and writes over a byte stream.
//!
//! Works over any `AsyncRead`/`AsyncWrite`, so the same helpers serve client
//! sockets, backend sockets and mock streams in tests.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{Error, Result};
use crate::protocol::{Frame, ParseResult};

/// Read buffer size
pub const BUFFER_SIZE: usize = 16 * 1024;

/// Read exactly one frame from `reader`.
///
/// Returns `Ok(None)` if the peer closed the stream before sending anything.
/// A stream that ends partway through a frame is a `MalformedPayload`.
pub async fn read_frame<T, R>(reader: &mut R) -> Result<Option<T>>
where
    T: Frame,
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        match T::parse(&buffer) {
            ParseResult::Complete(frame, consumed) => {
                trace!(consumed, "Frame complete");
                return Ok(Some(frame));
            }
            ParseResult::Error(e) => return Err(e.into()),
            ParseResult::Incomplete => {}
        }

        if buffer.capacity() == buffer.len() {
            buffer.reserve(BUFFER_SIZE);
        }
        let n = reader.read_buf(&mut buffer).await?;
        if n == 0 {
            if buffer.is_empty() {
                trace!("Stream closed by peer");
                return Ok(None);
            }
            return Err(Error::malformed(format!(
                "stream ended after {} bytes, mid-frame",
                buffer.len()
            )));
        }
    }
}

/// Encode `frame` and write it out in full.
pub async fn write_frame<T, W>(writer: &mut W, frame: &T) -> Result<()>
where
    T: Frame,
    W: AsyncWrite + Unpin,
{
    let bytes = frame.encode();
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    trace!(bytes = bytes.len(), "Frame written");
    Ok(())
}
