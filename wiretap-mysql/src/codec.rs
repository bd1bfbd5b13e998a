//! MySQL packet framing.
//!
//! Every packet is `{u24 (LE) payload_length, u8 sequence_id, payload}`. The sequence id
//! starts at 0 on every new command and increments by one per packet exchanged for that
//! command; this codec tracks and validates continuity but,, does not enforce
//! it strictly — a gap is logged, not fatal. Payloads
//! whose length hits the 2^24-1 ceiling are split across multiple packets sharing one
//! logical payload; the reader transparently reassembles them.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{split, AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

use wiretap_core::error::Result;
use wiretap_core::io::BufStream;

/// The largest payload a single physical packet may carry before the codec must split
/// it across consecutive sequence ids.
pub const MAX_PACKET_PAYLOAD: usize = 0x00FF_FFFF;

#[derive(Debug, Clone)]
pub struct RawPacket {
    pub sequence_id: u8,
    pub payload: Bytes,
}

pub struct MySqlReader<S> {
    stream: BufStream<S>,
    next_sequence_id: u8,
}

impl<S> MySqlReader<S> {
    pub fn new(stream: S) -> Self {
        Self { stream: BufStream::new(stream), next_sequence_id: 0 }
    }

    /// Resets the expected sequence id to 0, as happens at the start of every new
    /// command+response exchange.
    pub fn reset_sequence(&mut self) {
        self.next_sequence_id = 0;
    }

    pub fn into_inner(self) -> BufStream<S> {
        self.stream
    }
}

impl<S> MySqlReader<S>
where
    S: AsyncRead + Unpin,
{
    /// Reads one logical packet, transparently reassembling split packets at the
    /// `MAX_PACKET_PAYLOAD` boundary.
    pub async fn read_packet(&mut self) -> Result<RawPacket> {
        let mut payload = BytesMut::new();
        let first_seq;
        loop {
            let header = self.stream.read_exact(4).await?;
            let mut cursor = &header[..];
            let len = cursor.get_uint_le(3) as usize;
            let sequence_id = cursor.get_u8();
            if payload.is_empty() {
                first_seq = sequence_id;
            }
            if sequence_id != self.next_sequence_id {
                tracing::warn!(
                    expected = self.next_sequence_id,
                    got = sequence_id,
                    "mysql packet sequence id discontinuity, continuing permissively"
                );
            }
            self.next_sequence_id = sequence_id.wrapping_add(1);

            let chunk = self.stream.read_exact(len).await?;
            payload.extend_from_slice(&chunk);
            if len < MAX_PACKET_PAYLOAD {
                break;
            }
        }
        let _ = first_seq;
        Ok(RawPacket { sequence_id: self.next_sequence_id.wrapping_sub(1), payload: payload.freeze() })
    }
}

pub struct MySqlWriter<S> {
    stream: BufStream<S>,
    next_sequence_id: u8,
}

impl<S> MySqlWriter<S> {
    pub fn new(stream: S) -> Self {
        Self { stream: BufStream::new(stream), next_sequence_id: 0 }
    }

    pub fn reset_sequence(&mut self) {
        self.next_sequence_id = 0;
    }

    /// Sets this writer's sequence counter directly — used by the replay engine, where
    /// one shared counter spans both the client's request packet and the response
    /// packets that follow it within the same exchange.
    pub fn set_next_sequence_id(&mut self, id: u8) {
        self.next_sequence_id = id;
    }

    pub fn into_inner(self) -> BufStream<S> {
        self.stream
    }
}

impl<S> MySqlWriter<S>
where
    S: AsyncWrite + Unpin,
{
    /// Writes `payload` as one or more packets, splitting at `MAX_PACKET_PAYLOAD` and
    /// renumbering sequence ids from whatever this writer's counter currently holds
    ///.
    pub async fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        let mut chunks = payload.chunks(MAX_PACKET_PAYLOAD).peekable();
        if chunks.peek().is_none() {
            self.write_one(&[]).await?;
            return self.stream.flush().await;
        }
        while let Some(chunk) = chunks.next() {
            self.write_one(chunk).await?;
        }
        self.stream.flush().await
    }

    async fn write_one(&mut self, chunk: &[u8]) -> Result<()> {
        let mut header = [0u8; 4];
        header[..3].copy_from_slice(&(chunk.len() as u32).to_le_bytes()[..3]);
        header[3] = self.next_sequence_id;
        self.next_sequence_id = self.next_sequence_id.wrapping_add(1);
        self.stream.write_bytes(&header);
        self.stream.write_bytes(chunk);
        Ok(())
    }

    /// Writes a fully-framed packet and flushes immediately — used by the record-mode
    /// tee, which forwards packets it has already read rather than re-numbering them
    /// (the original sequence id is preserved verbatim).
    pub async fn write_raw_packet(&mut self, packet: &RawPacket) -> Result<()> {
        let mut header = [0u8; 4];
        header[..3].copy_from_slice(&(packet.payload.len() as u32).to_le_bytes()[..3]);
        header[3] = packet.sequence_id;
        self.stream.write_bytes(&header);
        self.stream.write_bytes(&packet.payload);
        self.stream.flush().await
    }
}

trait GetUintLe {
    fn get_uint_le(&mut self, nbytes: usize) -> u64;
}

impl GetUintLe for &[u8] {
    fn get_uint_le(&mut self, nbytes: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes[..nbytes].copy_from_slice(&self[..nbytes]);
        self.advance(nbytes);
        u64::from_le_bytes(bytes)
    }
}

/// Splits a full-duplex connection into an independent reader and writer (mirrors
/// `wiretap_postgres::split_codec`).
pub fn split_codec<S>(stream: S) -> (MySqlReader<ReadHalf<S>>, MySqlWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, write_half) = split(stream);
    (MySqlReader::new(read_half), MySqlWriter::new(write_half))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn round_trips_a_single_packet() {
        let (client, mut server) = duplex(256);
        let mut writer = MySqlWriter::new(client);
        writer.write_packet(b"hello").await.unwrap();

        let mut reader = MySqlReader::new(&mut server);
        let packet = reader.read_packet().await.unwrap();
        assert_eq!(packet.sequence_id, 0);
        assert_eq!(&packet.payload[..], b"hello");
    }

    #[tokio::test]
    async fn sequence_id_increments_per_packet_in_an_exchange() {
        let (client, mut server) = duplex(256);
        let mut writer = MySqlWriter::new(client);
        writer.write_packet(b"one").await.unwrap();
        writer.write_packet(b"two").await.unwrap();

        let mut reader = MySqlReader::new(&mut server);
        assert_eq!(reader.read_packet().await.unwrap().sequence_id, 0);
        assert_eq!(reader.read_packet().await.unwrap().sequence_id, 1);
    }

    #[tokio::test]
    async fn resets_sequence_to_zero_for_a_new_command() {
        let (client, mut server) = duplex(256);
        let mut writer = MySqlWriter::new(client);
        writer.write_packet(b"one").await.unwrap();
        writer.reset_sequence();
        writer.write_packet(b"two").await.unwrap();

        let mut reader = MySqlReader::new(&mut server);
        assert_eq!(reader.read_packet().await.unwrap().sequence_id, 0);
        reader.reset_sequence();
        assert_eq!(reader.read_packet().await.unwrap().sequence_id, 0);
    }

    #[tokio::test]
    async fn splits_and_reassembles_a_packet_at_the_max_payload_boundary() {
        let (client, mut server) = duplex(1 << 20);
        let mut writer = MySqlWriter::new(client);
        let big = vec![0x42u8; MAX_PACKET_PAYLOAD + 10];
        writer.write_packet(&big).await.unwrap();

        let mut reader = MySqlReader::new(&mut server);
        let packet = reader.read_packet().await.unwrap();
        assert_eq!(packet.payload.len(), big.len());
        assert_eq!(&packet.payload[..], &big[..]);
    }
}
