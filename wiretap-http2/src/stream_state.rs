//! Per-stream HTTP/2 state tracking.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::SystemTime;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::frame::RawFrame;

/// `{ pseudo, ordinary }` — pseudo-headers are those whose name begins with `:`
///.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSet {
    pub pseudo: BTreeMap<String, String>,
    pub ordinary: BTreeMap<String, String>,
}

impl HeaderSet {
    pub fn insert(&mut self, name: String, value: String) {
        if name.starts_with(':') {
            self.pseudo.insert(name, value);
        } else {
            self.ordinary.insert(name, value);
        }
    }

    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        let mut set = Self::default();
        for (k, v) in pairs {
            set.insert(k, v);
        }
        set
    }
}

/// The gRPC length-prefixed message body, without its 5-byte wire prefix (: the
/// compression flag and length are carried separately from `payload`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrpcMessage {
    pub compression_flag: u8,
    pub length: u32,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct StreamRequest {
    pub headers: HeaderSet,
    pub body: Option<GrpcMessage>,
}

#[derive(Debug, Clone, Default)]
pub struct StreamResponse {
    pub headers: HeaderSet,
    pub body: Option<GrpcMessage>,
    pub trailers: Option<HeaderSet>,
}

struct StreamEntry {
    request: StreamRequest,
    response: StreamResponse,
    req_raw: BytesMut,
    resp_raw: BytesMut,
    req_prefix_parsed: bool,
    resp_prefix_parsed: bool,
    req_declared_len: Option<u32>,
    resp_declared_len: Option<u32>,
    req_compression_flag: Option<u8>,
    resp_compression_flag: Option<u8>,
    req_ts: Option<SystemTime>,
    res_ts: Option<SystemTime>,
}

impl Default for StreamEntry {
    fn default() -> Self {
        Self {
            request: StreamRequest::default(),
            response: StreamResponse::default(),
            req_raw: BytesMut::new(),
            resp_raw: BytesMut::new(),
            req_prefix_parsed: false,
            resp_prefix_parsed: false,
            req_declared_len: None,
            resp_declared_len: None,
            req_compression_flag: None,
            resp_compression_flag: None,
            req_ts: None,
            res_ts: None,
        }
    }
}

/// Tries to peel a complete gRPC length-prefixed message out of `raw`, given whether the
/// 5-byte prefix has already been parsed and the declared length/flag if so. The flag is
/// stashed into `compression_flag` the moment the prefix is parsed, since the 5-byte
/// header and the payload may arrive in separate chunks. Returns the message once `raw`
/// holds `5 + declared_length` bytes.
fn try_take_message(
    raw: &mut BytesMut,
    prefix_parsed: &mut bool,
    declared_len: &mut Option<u32>,
    compression_flag: &mut Option<u8>,
) -> Option<GrpcMessage> {
    if !*prefix_parsed {
        if raw.len() < 5 {
            return None;
        }
        *prefix_parsed = true;
        let mut header = raw.split_to(5);
        *compression_flag = Some(header.get_u8());
        let length = header.get_u32();
        *declared_len = Some(length);
    }
    let length = (*declared_len)? as usize;
    if raw.len() < length {
        return None;
    }
    let payload = raw.split_to(length).freeze();
    Some(GrpcMessage { compression_flag: compression_flag.unwrap_or(0), length: length as u32, payload })
}

/// Thread-safe `stream_id -> stream_state` accumulator. All operations take
/// a single short-held mutex; no work happens while holding it.
pub struct StreamAccumulator {
    streams: Mutex<HashMap<u32, StreamEntry>>,
    deferred: Mutex<VecDeque<RawFrame>>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self { streams: Mutex::new(HashMap::new()), deferred: Mutex::new(VecDeque::new()) }
    }

    pub fn init(&self, stream_id: u32) {
        self.streams.lock().entry(stream_id).or_default();
    }

    pub fn add_request_headers(&self, stream_id: u32, pairs: Vec<(String, String)>) {
        let mut streams = self.streams.lock();
        let entry = streams.entry(stream_id).or_default();
        for (k, v) in pairs {
            entry.request.headers.insert(k, v);
        }
        entry.req_ts = Some(SystemTime::now());
    }

    pub fn add_response_headers(&self, stream_id: u32, pairs: Vec<(String, String)>, trailers: bool) {
        let mut streams = self.streams.lock();
        let entry = streams.entry(stream_id).or_default();
        if trailers {
            entry.response.trailers = Some(HeaderSet::from_pairs(pairs));
        } else {
            for (k, v) in pairs {
                entry.response.headers.insert(k, v);
            }
        }
        entry.res_ts = Some(SystemTime::now());
    }

    pub fn add_request_body_chunk(&self, stream_id: u32, bytes: &[u8]) {
        let mut streams = self.streams.lock();
        let entry = streams.entry(stream_id).or_default();
        entry.req_raw.extend_from_slice(bytes);
        if let Some(msg) = try_take_message(
            &mut entry.req_raw,
            &mut entry.req_prefix_parsed,
            &mut entry.req_declared_len,
            &mut entry.req_compression_flag,
        ) {
            entry.request.body = Some(msg);
        }
        entry.req_ts = Some(SystemTime::now());
    }

    pub fn add_response_body_chunk(&self, stream_id: u32, bytes: &[u8]) {
        let mut streams = self.streams.lock();
        let entry = streams.entry(stream_id).or_default();
        entry.resp_raw.extend_from_slice(bytes);
        if let Some(msg) = try_take_message(
            &mut entry.resp_raw,
            &mut entry.resp_prefix_parsed,
            &mut entry.resp_declared_len,
            &mut entry.resp_compression_flag,
        ) {
            entry.response.body = Some(msg);
        }
        entry.res_ts = Some(SystemTime::now());
    }

    pub fn fetch_request(&self, stream_id: u32) -> Option<StreamRequest> {
        self.streams.lock().get(&stream_id).map(|e| e.request.clone())
    }

    pub fn fetch_response(&self, stream_id: u32) -> Option<StreamResponse> {
        self.streams.lock().get(&stream_id).map(|e| e.response.clone())
    }

    pub fn timestamps(&self, stream_id: u32) -> Option<(SystemTime, SystemTime)> {
        let streams = self.streams.lock();
        let entry = streams.get(&stream_id)?;
        Some((entry.req_ts?, entry.res_ts.unwrap_or_else(SystemTime::now)))
    }

    /// Takes the finished `(request, response)` pair and deletes the stream's state —
    /// stream ids may be reused by the client once this runs.
    pub fn take_and_reset(&self, stream_id: u32) -> Option<(StreamRequest, StreamResponse, SystemTime, SystemTime)> {
        let mut streams = self.streams.lock();
        let entry = streams.remove(&stream_id)?;
        let req_ts = entry.req_ts.unwrap_or_else(SystemTime::now);
        let res_ts = entry.res_ts.unwrap_or_else(SystemTime::now);
        Some((entry.request, entry.response, req_ts, res_ts))
    }

    pub fn contains(&self, stream_id: u32) -> bool {
        self.streams.lock().contains_key(&stream_id)
    }

    /// FIFO queue for frames that cannot be processed where they were read (:
    /// "ordering guarantee: FIFO per connection, never reordered across frames"). The
    /// engine decides when and whether to drain it.
    pub fn defer(&self, frame: RawFrame) {
        self.deferred.lock().push_back(frame);
    }

    pub fn poll_deferred(&self) -> Option<RawFrame> {
        self.deferred.lock().pop_front()
    }
}

impl Default for StreamAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grpc_prefix_parses_once_enough_bytes_arrive() {
        let acc = StreamAccumulator::new();
        acc.init(1);
        // compression flag 0, length 5, in two chunks.
        acc.add_request_body_chunk(1, &[0, 0, 0, 0, 5]);
        assert!(acc.fetch_request(1).unwrap().body.is_none());
        acc.add_request_body_chunk(1, b"hello");
        let body = acc.fetch_request(1).unwrap().body.unwrap();
        assert_eq!(body.payload, Bytes::from_static(b"hello"));
        assert_eq!(body.length, 5);
    }

    #[test]
    fn grpc_compression_flag_survives_a_prefix_split_across_chunks() {
        let acc = StreamAccumulator::new();
        acc.init(1);
        // flag=1 plus the first two length bytes in one chunk, the rest of the
        // 5-byte prefix plus the body in the next.
        acc.add_request_body_chunk(1, &[1, 0, 0]);
        assert!(acc.fetch_request(1).unwrap().body.is_none());
        acc.add_request_body_chunk(1, &[0, 5, b'h', b'e', b'l', b'l', b'o']);
        let body = acc.fetch_request(1).unwrap().body.unwrap();
        assert_eq!(body.compression_flag, 1);
        assert_eq!(body.payload, Bytes::from_static(b"hello"));
    }

    #[test]
    fn streams_are_isolated() {
        // Mutations on one stream never observe or alter another's.
        let acc = StreamAccumulator::new();
        acc.add_request_headers(1, vec![(":path".into(), "/a".into())]);
        acc.add_request_headers(3, vec![(":path".into(), "/b".into())]);

        assert_eq!(acc.fetch_request(1).unwrap().headers.pseudo[":path"], "/a");
        assert_eq!(acc.fetch_request(3).unwrap().headers.pseudo[":path"], "/b");
    }

    #[test]
    fn take_and_reset_deletes_state() {
        let acc = StreamAccumulator::new();
        acc.init(1);
        assert!(acc.contains(1));
        acc.take_and_reset(1);
        assert!(!acc.contains(1));
    }

    #[test]
    fn deferred_queue_is_fifo() {
        let acc = StreamAccumulator::new();
        let f = |id| RawFrame {
            frame_type: crate::frame::FrameType::Ping,
            flags: 0,
            stream_id: id,
            payload: Bytes::new(),
        };
        acc.defer(f(1));
        acc.defer(f(2));
        assert_eq!(acc.poll_deferred().unwrap().stream_id, 1);
        assert_eq!(acc.poll_deferred().unwrap().stream_id, 2);
        assert!(acc.poll_deferred().is_none());
    }
}
