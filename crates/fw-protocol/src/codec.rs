//! Envelope I/O over any async byte stream.
//!
//! The reader side is strict about byte accounting: a frame is
//! `prefix + header + Len` bytes, no more and no less. Any EOF after the
//! first byte of a frame leaves the stream desynchronized and is fatal
//! ([`FrameError::UnexpectedEof`]); an EOF before the first byte is an
//! orderly close ([`FrameError::ConnectionClosed`]).

use crate::{FrameError, MAX_HEADER_BYTES, MessageHeader};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const COPY_CHUNK: usize = 64 * 1024;

/// Read and parse one header: decimal prefix, space, JSON bytes.
///
/// Returns the parsed header; the caller is responsible for consuming
/// exactly `header.len` payload bytes before reading the next header.
pub async fn read_header<R>(reader: &mut R) -> Result<MessageHeader, FrameError>
where
    R: AsyncRead + Unpin,
{
    let json_len = read_prefix(reader).await?;

    let mut json = vec![0u8; json_len as usize];
    reader.read_exact(&mut json).await.map_err(map_body_eof)?;
    MessageHeader::parse(&json)
}

/// Read the decimal length prefix up to the terminating space.
///
/// Accepts 1 ≤ value ≤ [`MAX_HEADER_BYTES`], base-10 ASCII with no
/// leading zeros.
async fn read_prefix<R>(reader: &mut R) -> Result<u64, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut value: u64 = 0;
    let mut digits: u32 = 0;
    let mut leading_zero = false;
    loop {
        let mut byte = [0u8; 1];
        match reader.read(&mut byte).await {
            Ok(0) if digits == 0 => return Err(FrameError::ConnectionClosed),
            Ok(0) => return Err(FrameError::UnexpectedEof),
            Ok(_) => {}
            Err(e) => return Err(FrameError::Io(e)),
        }
        match byte[0] {
            b' ' if digits == 0 => return Err(FrameError::MalformedPrefix),
            b' ' => break,
            d @ b'0'..=b'9' => {
                if digits == 0 && d == b'0' {
                    leading_zero = true;
                }
                // 16 MiB is 8 digits; a 9th digit can only overflow the cap.
                if digits == 8 {
                    return Err(FrameError::HeaderTooLarge(value * 10 + u64::from(d - b'0')));
                }
                value = value * 10 + u64::from(d - b'0');
                digits += 1;
            }
            _ => return Err(FrameError::MalformedPrefix),
        }
    }
    if leading_zero && digits > 1 {
        return Err(FrameError::MalformedPrefix);
    }
    if value == 0 {
        return Err(FrameError::MalformedPrefix);
    }
    if value > MAX_HEADER_BYTES {
        return Err(FrameError::HeaderTooLarge(value));
    }
    Ok(value)
}

/// Write one complete envelope from an in-memory payload. Returns the total
/// bytes put on the wire (prefix + header + payload).
///
/// `header.len` must equal `payload.len()`; the mismatch is a caller bug
/// and is rejected rather than silently emitting a desynchronizing frame.
pub async fn write_frame<W>(
    writer: &mut W,
    header: &MessageHeader,
    payload: &[u8],
) -> Result<u64, FrameError>
where
    W: AsyncWrite + Unpin,
{
    if header.len != payload.len() as u64 {
        return Err(FrameError::ContentLengthMismatch {
            expected: header.len,
            got: payload.len() as u64,
        });
    }
    let envelope = header.encode();
    writer.write_all(&envelope).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(envelope.len() as u64 + header.len)
}

/// Write one complete envelope, streaming `header.len` payload bytes from
/// `source`. Returns the total bytes put on the wire. Fails with
/// [`FrameError::ContentLengthMismatch`] if the source runs dry early;
/// bytes past the declared length are left unread.
pub async fn write_frame_from_reader<W, R>(
    writer: &mut W,
    header: &MessageHeader,
    source: &mut R,
) -> Result<u64, FrameError>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let envelope = header.encode();
    writer.write_all(&envelope).await?;

    let mut remaining = header.len;
    let mut buf = vec![0u8; COPY_CHUNK.min(remaining.max(1) as usize)];
    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let n = source.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(FrameError::ContentLengthMismatch {
                expected: header.len,
                got: header.len - remaining,
            });
        }
        writer.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    writer.flush().await?;
    Ok(envelope.len() as u64 + header.len)
}

/// `read_exact` reports a clean EOF as `UnexpectedEof`; inside a frame that
/// is a desync, not an orderly close.
fn map_body_eof(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::UnexpectedEof
    } else {
        FrameError::Io(e)
    }
}
