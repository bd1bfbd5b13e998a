//! Connection adaptor: wraps a single already-accepted byte stream so
//! it can be driven by a protocol engine as if it both preface-classified the connection
//! itself. The dispatcher peeks a handful of bytes to classify the connection; this
//! adaptor replays exactly those bytes back out before any live read reaches the
//! underlying socket, so the engine sees an unbroken byte stream starting at the
//! connection preface.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Wraps `S`, first serving `preface` bytes to readers before falling through to `S`
/// itself. Writes pass straight through untouched.
pub struct PrefaceReplayStream<S> {
    preface: Bytes,
    inner: S,
}

impl<S> PrefaceReplayStream<S> {
    pub fn new(preface: Bytes, inner: S) -> Self {
        Self { preface, inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S> AsyncRead for PrefaceReplayStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if !this.preface.is_empty() {
            let take = this.preface.len().min(buf.remaining());
            buf.put_slice(&this.preface[..take]);
            this.preface.advance(take);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for PrefaceReplayStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn preface_is_replayed_before_live_bytes() {
        let (mut client, server) = duplex(64);
        let adapted = PrefaceReplayStream::new(Bytes::from_static(b"PRI"), server);
        tokio::spawn(async move {
                client.write_all(b" * HTTP/2.0").await.unwrap();
            });

        let mut adapted = adapted;
        let mut out = Vec::new();
        let mut chunk = [0u8; 32];
        // First read must return the sniffed preface bytes, not the live socket data.
        let n = adapted.read(&mut chunk).await.unwrap();
        out.extend_from_slice(&chunk[..n]);
        assert_eq!(&out, b"PRI");

        let n = adapted.read(&mut chunk).await.unwrap();
        out.extend_from_slice(&chunk[..n]);
        assert_eq!(&out, b"PRI * HTTP/2.0");
    }
}
