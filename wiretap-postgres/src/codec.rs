//! Postgres v3 framing.
//!
//! Every message after the startup handshake is `{u8 tag, u32 length_including_self,
//! payload}`. The very first frontend message of a connection has no tag byte: it is
//! `{u32 length_including_self, u32 magic, rest}`, where `magic` is either the protocol
//! version (`196608` for v3.0) or one of the three special request codes.

use bytes::{Buf, Bytes};
use tokio::io::{split, AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

use wiretap_core::error::{Error, Result};
use wiretap_core::io::BufStream;

pub const PROTOCOL_VERSION_3: u32 = 196_608;
pub const SSL_REQUEST_CODE: u32 = 80_877_103;
pub const CANCEL_REQUEST_CODE: u32 = 80_877_102;
pub const GSS_ENC_REQUEST_CODE: u32 = 80_877_104;

#[derive(Debug, Clone)]
pub enum StartupFrame {
    Startup { version: u32, params: Bytes },
    SslRequest,
    GssEncRequest,
    CancelRequest { process_id: u32, secret_key: u32 },
}

#[derive(Debug, Clone)]
pub struct TaggedFrame {
    pub tag: u8,
    /// Payload after the tag and the length field (`{u8 type, u32 length,
    /// payload}`, `payload` here being just what follows `length`).
    pub payload: Bytes,
}

pub struct PgReader<S> {
    stream: BufStream<S>,
}

impl<S> PgReader<S> {
    pub fn new(stream: S) -> Self {
        Self { stream: BufStream::new(stream) }
    }

    pub fn into_inner(self) -> BufStream<S> {
        self.stream
    }
}

impl<S> PgReader<S>
where
    S: AsyncRead + Unpin,
{
    /// Reads the one untagged message a connection may begin with.
    pub async fn read_startup_frame(&mut self) -> Result<StartupFrame> {
        let header = self.stream.read_exact(8).await?;
        let mut cursor = header.clone();
        let len = cursor.get_u32() as usize;
        let magic = cursor.get_u32();
        if len < 8 {
            return Err(Error::framing("startup frame shorter than its own header"));
        }
        let rest = if len > 8 { self.stream.read_exact(len - 8).await? } else { Bytes::new() };

        Ok(match magic {
                PROTOCOL_VERSION_3 => StartupFrame::Startup { version: magic, params: rest },
                SSL_REQUEST_CODE => StartupFrame::SslRequest,
                GSS_ENC_REQUEST_CODE => StartupFrame::GssEncRequest,
                CANCEL_REQUEST_CODE => {
                    let mut body = rest;
                    if body.remaining() < 8 {
                        return Err(Error::framing("truncated CancelRequest"));
                    }
                    StartupFrame::CancelRequest { process_id: body.get_u32(), secret_key: body.get_u32() }
                }
                other => return Err(Error::protocol_violation(format!("unrecognized startup magic {other}"))),
            })
    }

    /// Reads exactly `n` unframed bytes — used only for the single raw `S`/`N` byte a
    /// real backend replies to an `SSLRequest`/`GssEncRequest` with, which carries
    /// neither a tag nor a length prefix.
    pub async fn read_raw(&mut self, n: usize) -> Result<Bytes> {
        self.stream.read_exact(n).await
    }

    /// Reads one tagged message.
    pub async fn read_tagged_frame(&mut self) -> Result<TaggedFrame> {
        let header = self.stream.read_exact(5).await?;
        let tag = header[0];
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if len < 4 {
            return Err(Error::framing("message length field must be at least 4"));
        }
        let payload = if len > 4 { self.stream.read_exact(len - 4).await? } else { Bytes::new() };
        Ok(TaggedFrame { tag, payload })
    }
}

/// Re-encodes a [`TaggedFrame`] back to its exact wire form (tag, length, payload),
/// used by record mode to forward what it just read without a second round-trip
/// through the stream.
pub fn encode_tagged_frame(frame: &TaggedFrame) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + frame.payload.len());
    out.push(frame.tag);
    out.extend_from_slice(&((4 + frame.payload.len()) as u32).to_be_bytes());
    out.extend_from_slice(&frame.payload);
    out
}

/// Re-encodes a [`StartupFrame`] back to its exact wire form, mirroring
/// `encode_tagged_frame` for the one untagged message a connection may begin with.
pub fn encode_startup_frame(frame: &StartupFrame) -> Vec<u8> {
    let mut out = Vec::new();
    match frame {
        StartupFrame::Startup { version, params } => {
            out.extend_from_slice(&((8 + params.len()) as u32).to_be_bytes());
            out.extend_from_slice(&version.to_be_bytes());
            out.extend_from_slice(params);
        }
        StartupFrame::SslRequest => {
            out.extend_from_slice(&8u32.to_be_bytes());
            out.extend_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
        }
        StartupFrame::GssEncRequest => {
            out.extend_from_slice(&8u32.to_be_bytes());
            out.extend_from_slice(&GSS_ENC_REQUEST_CODE.to_be_bytes());
        }
        StartupFrame::CancelRequest { process_id, secret_key } => {
            out.extend_from_slice(&16u32.to_be_bytes());
            out.extend_from_slice(&CANCEL_REQUEST_CODE.to_be_bytes());
            out.extend_from_slice(&process_id.to_be_bytes());
            out.extend_from_slice(&secret_key.to_be_bytes());
        }
    }
    out
}

pub struct PgWriter<S> {
    stream: BufStream<S>,
}

impl<S> PgWriter<S> {
    pub fn new(stream: S) -> Self {
        Self { stream: BufStream::new(stream) }
    }
}

impl<S> PgWriter<S>
where
    S: AsyncWrite + Unpin,
{
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_bytes(bytes);
        self.stream.flush().await
    }

    /// Writes a single byte with no framing — used for the SSL-off `N` reply.
    pub async fn write_byte(&mut self, b: u8) -> Result<()> {
        self.write_raw(&[b]).await
    }

    pub fn into_inner(self) -> BufStream<S> {
        self.stream
    }
}

/// Splits a full-duplex connection into an independent reader and writer, the way a
/// record/replay engine needs to read from and write to a socket concurrently from two
/// different tasks (mirrors `wiretap_http2::split_codec`).
pub fn split_codec<S>(stream: S) -> (PgReader<ReadHalf<S>>, PgWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, write_half) = split(stream);
    (PgReader::new(read_half), PgWriter::new(write_half))
}
