//! Length-prefixed frame codec.
//!
//! Every message on the wire is a 4-byte big-endian unsigned length
//! followed by exactly that many payload bytes:
//!
//! ```text
//! +----------------+---------------------------+
//! | length (u32 BE)| payload (length bytes)    |
//! +----------------+---------------------------+
//!
//! Example:
//! payload 01 02 03  ->  00 00 00 03 01 02 03
//! ```
//!
//! A frame is atomic: `decode` either returns the whole payload or fails.
//! Sockets may deliver fewer bytes than requested per call, so reads
//! accumulate until the target count is reached or the peer closes.

use crate::error::FrameError;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest chunk requested from the socket per read while filling a payload.
const READ_CHUNK: usize = 8192;

/// Encode a payload into a standalone frame.
pub fn encode(payload: &[u8]) -> Result<Bytes, FrameError> {
    let mut out = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    encode_into(payload, &mut out)?;
    Ok(out.freeze())
}

/// Append the frame for `payload` to `out`.
pub fn encode_into(payload: &[u8], out: &mut BytesMut) -> Result<(), FrameError> {
    let length =
        u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge(payload.len()))?;
    out.reserve(LENGTH_PREFIX_LEN + payload.len());
    out.put_u32(length);
    out.extend_from_slice(payload);
    Ok(())
}

/// Read one frame from `source` and return its payload.
///
/// `max_len` bounds the declared length; `None` trusts the peer, which is
/// only appropriate inside a controlled benchmarking network.
pub async fn decode<R>(source: &mut R, max_len: Option<u32>) -> Result<Bytes, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; LENGTH_PREFIX_LEN];
    let got = read_full(source, &mut header).await?;
    if got < LENGTH_PREFIX_LEN {
        return Err(FrameError::ConnectionClosed);
    }

    let declared = u32::from_be_bytes(header);
    if let Some(limit) = max_len {
        if declared > limit {
            return Err(FrameError::FrameTooLarge {
                len: declared,
                limit,
            });
        }
    }

    let length = declared as usize;
    let mut payload = BytesMut::with_capacity(length.min(64 * 1024));

    // Grow the buffer as bytes arrive rather than trusting the prefix up front
    while payload.len() < length {
        let start = payload.len();
        let chunk = (length - start).min(READ_CHUNK);
        payload.resize(start + chunk, 0);

        let n = source.read(&mut payload[start..start + chunk]).await?;
        payload.truncate(start + n);
        if n == 0 {
            return Err(FrameError::IncompleteFrame {
                expected: length,
                received: start,
            });
        }
    }

    Ok(payload.freeze())
}

/// Encode `payload` and write the whole frame to `destination`.
///
/// Partial writes are retried until the frame is sent or the socket errors.
pub async fn write_frame<W>(destination: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(payload)?;
    destination.write_all(&frame).await?;
    Ok(())
}

/// Fill `buf` from `source`, stopping early only at EOF.
///
/// Returns the number of bytes actually read.
async fn read_full<R>(source: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
