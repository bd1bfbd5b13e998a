//! The HTTP/2 frame codec: one read-side half owned by a single reader
//! task, one mutex-guarded write-side half shared by everyone that needs to emit a
//! frame, so one frame's bytes are never interleaved with another's (//! "atomic-write discipline").

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{split, AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;

use wiretap_core::error::Result;
use wiretap_core::io::BufStream;

use crate::frame::{decode_header, encode_frame, FrameType, RawFrame, FRAME_HEADER_LEN};

/// The frame size this engine advertises to peers via its initial SETTINGS, and the
/// cap it enforces on its own DATA writes.
pub const MAX_FRAME_SIZE: u32 = 8192;

pub struct Http2Reader<S> {
    stream: BufStream<ReadHalf<S>>,
}

impl<S> Http2Reader<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Reads exactly one frame. Declared non-support: if a HEADERS frame arrives with
    /// END_HEADERS cleared, the caller is expected to log and ignore rather than
    /// attempt CONTINUATION reassembly — this codec still hands back the
    /// raw frame; the engine decides not to chase CONTINUATION frames for it.
    pub async fn read_frame(&mut self) -> Result<RawFrame> {
        let header = self.stream.read_exact(FRAME_HEADER_LEN).await?;
        let (frame_type, flags, stream_id, len) = decode_header(header)?;
        let payload = if len == 0 { Bytes::new() } else { self.stream.read_exact(len).await? };
        Ok(RawFrame { frame_type, flags, stream_id, payload })
    }
}

#[derive(Clone)]
pub struct Http2Writer<S> {
    stream: Arc<AsyncMutex<BufStream<WriteHalf<S>>>>,
}

impl<S> Http2Writer<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub async fn write_frame(
        &self,
        frame_type: FrameType,
        flags: u8,
        stream_id: u32,
        payload: &[u8],
    ) -> Result<()> {
        let mut guard = self.stream.lock().await;
        let mut buf = Vec::with_capacity(9 + payload.len());
        encode_frame(&mut buf, frame_type, flags, stream_id, payload);
        guard.write_bytes(&buf);
        guard.flush().await
    }
}

pub fn split_codec<S>(stream: S) -> (Http2Reader<S>, Http2Writer<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, write_half) = split(stream);
    (
        Http2Reader { stream: BufStream::new(read_half) },
        Http2Writer { stream: Arc::new(AsyncMutex::new(BufStream::new(write_half))) },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::flags;
    use tokio::io::duplex;

    #[tokio::test]
    async fn frame_round_trips_over_a_duplex_stream() {
        let (client, server) = duplex(4096);
        let (mut server_reader, _server_writer) = split_codec(server);
        let (_client_reader, client_writer) = split_codec(client);

        client_writer
        .write_frame(FrameType::Ping, flags::ACK, 0, b"12345678")
        .await
        .unwrap();

        let frame = server_reader.read_frame().await.unwrap();
        assert_eq!(frame.frame_type, FrameType::Ping);
        assert_eq!(frame.flags, flags::ACK);
        assert_eq!(&frame.payload[..], b"12345678");
    }

    #[tokio::test]
    async fn single_writer_mutex_serializes_concurrent_writes() {
        let (client, server) = duplex(8192);
        let (mut server_reader, _sw) = split_codec(server);
        let (_cr, client_writer) = split_codec(client);

        let w1 = client_writer.clone();
        let w2 = client_writer.clone();
        let a = tokio::spawn(async move {
                w1.write_frame(FrameType::Ping, 0, 0, &[0u8; 8]).await.unwrap();
            });
        let b = tokio::spawn(async move {
                w2.write_frame(FrameType::Ping, 0, 0, &[1u8; 8]).await.unwrap();
            });
        a.await.unwrap();
        b.await.unwrap();

        let f1 = server_reader.read_frame().await.unwrap();
        let f2 = server_reader.read_frame().await.unwrap();
        // Each frame's payload must be internally consistent (all zeroes or all ones),
        // never an interleaving of both writers' bytes.
        for f in [f1, f2] {
            assert!(f.payload.iter().all(|&b| b == f.payload[0]));
        }
    }
}
