//! HTTP/2 frame layout.
//!
//! Every frame starts with a 9-byte header: a 24-bit length, an 8-bit type, an 8-bit
//! flags field, and a 32-bit stream identifier (top bit reserved, cleared on the wire).

use bytes::{Buf, BufMut, Bytes};

use wiretap_core::error::{Error, Result};

pub const FRAME_HEADER_LEN: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
}

impl FrameType {
    fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
                0x0 => FrameType::Data,
                0x1 => FrameType::Headers,
                0x2 => FrameType::Priority,
                0x3 => FrameType::RstStream,
                0x4 => FrameType::Settings,
                0x5 => FrameType::PushPromise,
                0x6 => FrameType::Ping,
                0x7 => FrameType::GoAway,
                0x8 => FrameType::WindowUpdate,
                0x9 => FrameType::Continuation,
                _ => return None,
            })
    }

    fn to_u8(self) -> u8 {
        match self {
            FrameType::Data => 0x0,
            FrameType::Headers => 0x1,
            FrameType::Priority => 0x2,
            FrameType::RstStream => 0x3,
            FrameType::Settings => 0x4,
            FrameType::PushPromise => 0x5,
            FrameType::Ping => 0x6,
            FrameType::GoAway => 0x7,
            FrameType::WindowUpdate => 0x8,
            FrameType::Continuation => 0x9,
        }
    }
}

pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

#[derive(Debug, Clone)]
pub struct RawFrame {
    pub frame_type: FrameType,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl RawFrame {
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// Decodes one frame's 9-byte header from `header`, returning `(type, flags, stream_id,
/// payload_len)`. The caller is responsible for then reading exactly `payload_len`
/// bytes to complete the frame.
pub fn decode_header(mut header: Bytes) -> Result<(FrameType, u8, u32, usize)> {
    if header.len() < FRAME_HEADER_LEN {
        return Err(Error::framing("short http/2 frame header"));
    }
    let len_hi = header.get_u16();
    let len_lo = header.get_u8();
    let length = ((len_hi as usize) << 8) | len_lo as usize;
    let type_byte = header.get_u8();
    let flags = header.get_u8();
    let stream_id = header.get_u32() & 0x7fff_ffff;

    let frame_type = FrameType::from_u8(type_byte)
    .ok_or_else(|| Error::framing(format!("unknown http/2 frame type {type_byte:#x}")))?;

    Ok((frame_type, flags, stream_id, length))
}

pub fn encode_header(buf: &mut Vec<u8>, frame_type: FrameType, flags: u8, stream_id: u32, len: usize) {
    buf.put_u8((len >> 16) as u8);
    buf.put_u8((len >> 8) as u8);
    buf.put_u8(len as u8);
    buf.put_u8(frame_type.to_u8());
    buf.put_u8(flags);
    buf.put_u32(stream_id & 0x7fff_ffff);
}

pub fn encode_frame(buf: &mut Vec<u8>, frame_type: FrameType, flags: u8, stream_id: u32, payload: &[u8]) {
    encode_header(buf, frame_type, flags, stream_id, payload.len());
    buf.extend_from_slice(payload);
}

/// A client-initiated stream id must be odd (: "HEADERS ->... stream id
/// must be odd").
pub fn is_client_stream(stream_id: u32) -> bool {
    stream_id != 0 && stream_id % 2 == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let mut buf = Vec::new();
        encode_header(&mut buf, FrameType::Headers, flags::END_HEADERS, 1, 42);
        let (ty, flags, stream_id, len) = decode_header(Bytes::from(buf)).unwrap();
        assert_eq!(ty, FrameType::Headers);
        assert_eq!(flags, flags::END_HEADERS);
        assert_eq!(stream_id, 1);
        assert_eq!(len, 42);
    }

    #[test]
    fn reserved_bit_is_masked_out() {
        let mut buf = Vec::new();
        encode_header(&mut buf, FrameType::Ping, 0, 0x8000_0005, 0);
        let (_, _, stream_id, _) = decode_header(Bytes::from(buf)).unwrap();
        assert_eq!(stream_id, 5);
    }

    #[test]
    fn client_stream_ids_are_odd() {
        assert!(is_client_stream(1));
        assert!(!is_client_stream(2));
        assert!(!is_client_stream(0));
    }
}
