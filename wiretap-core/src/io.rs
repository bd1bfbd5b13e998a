//! Small `Decode`/`Encode` traits plumbing shared by every protocol codec, in the shape
//! of `sqlx_core::io` — a `BufStream` keeps a read buffer and a write buffer so a single
//! mutex-guarded flush is the only point where bytes actually hit the socket.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Decodes a value out of an owned, already-framed buffer.
pub trait Decode<'de>: Sized {
    fn decode(buf: Bytes) -> Result<Self>;
}

/// Encodes a value onto the end of a `Vec<u8>` write buffer.
pub trait Encode<'en> {
    fn encode(&self, buf: &mut Vec<u8>);
}

/// A duplex byte stream with a read buffer and a write buffer, and one writer mutex per
/// connection direction (the mutex lives in the protocol codec that owns a `BufStream`,
/// not here — this type only buffers).
pub struct BufStream<S> {
    stream: S,
    rbuf: BytesMut,
    wbuf: Vec<u8>,
}

impl<S> BufStream<S> {
    pub fn new(stream: S) -> Self {
        Self { stream, rbuf: BytesMut::with_capacity(4096), wbuf: Vec::with_capacity(512) }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Drains whatever is currently buffered but not yet consumed by a framer, without
    /// touching the socket. Used when handing a connection off to raw byte-copy
    /// passthrough so no already-read bytes are lost ("fall back to
    /// passthrough").
    pub fn take_buffered(&mut self) -> Bytes {
        std::mem::take(&mut self.rbuf).freeze()
    }
}

// Read-side methods need only `AsyncRead`, so a `BufStream` wrapping a `tokio::io::
// ReadHalf` (which isn't `AsyncWrite`) still gets them — the two impl blocks below are
// split by trait bound rather than combined under `AsyncRead + AsyncWrite` for exactly
// that reason.
impl<S> BufStream<S>
where
    S: AsyncRead + Unpin,
{
    /// Reads exactly `cnt` bytes, blocking on the socket as needed, and returns them as
    /// an owned, frozen [`Bytes`].
    pub async fn read_exact(&mut self, cnt: usize) -> Result<Bytes> {
        while self.rbuf.len() < cnt {
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(Error::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "peer closed connection",
                        )));
            }
            self.rbuf.extend_from_slice(&chunk[..n]);
        }
        Ok(self.rbuf.split_to(cnt).freeze())
    }

    /// Peeks at the buffered + freshly read bytes without consuming them, reading more
    /// from the socket only if fewer than `cnt` bytes are already buffered. Used by the
    /// integration dispatcher to classify a connection from its preface.
    pub async fn peek(&mut self, cnt: usize) -> Result<Bytes> {
        while self.rbuf.len() < cnt {
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            self.rbuf.extend_from_slice(&chunk[..n]);
        }
        let take = cnt.min(self.rbuf.len());
        Ok(Bytes::copy_from_slice(&self.rbuf[..take]))
    }

    /// Non-blocking: returns whatever is already buffered, up to `cnt` bytes, reading
    /// from the socket at most once. Used by framers that split a TCP read into 0..N
    /// whole messages and carry a short tail forward.
    pub async fn read_buffered_or_more(&mut self, cnt: usize) -> Result<Option<Bytes>> {
        if self.rbuf.len() < cnt {
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.rbuf.extend_from_slice(&chunk[..n]);
        }
        if self.rbuf.len() < cnt {
            return Ok(None);
        }
        Ok(Some(self.rbuf.split_to(cnt).freeze()))
    }
}

impl<S> BufStream<S>
where
    S: AsyncWrite + Unpin,
{
    pub fn write<'en, T: Encode<'en>>(&mut self, value: &T) {
        value.encode(&mut self.wbuf);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.wbuf.extend_from_slice(bytes);
    }

    /// Flushes the write buffer to the socket in one write call. Callers serialize
    /// access to this behind a single mutex so one frame's bytes are never interleaved
    /// with another's.
    pub async fn flush(&mut self) -> Result<()> {
        if !self.wbuf.is_empty() {
            self.stream.write_all(&self.wbuf).await?;
            self.stream.flush().await?;
            self.wbuf.clear();
        }
        Ok(())
    }
}

/// Reads a big-endian `u32` from the front of `buf` without advancing past it,
/// returning an error rather than panicking on a short buffer (framers see untrusted
/// peers).
pub fn peek_u32_be(buf: &[u8]) -> Result<u32> {
    if buf.len() < 4 {
        return Err(Error::framing("buffer shorter than 4 bytes"));
    }
    let mut b = buf;
    Ok(b.get_u32())
}
