//! A minimal HPACK codec (RFC 7541) covering what this engine needs to reproduce
//! gRPC's small, low-cardinality header sets: the static table, a dynamic table capped
//! at 2048 bytes, and literal header field representations.
//!
//! Huffman-coded string literals are a declared non-goal, in the same spirit as the
//! engine's declared non-support for CONTINUATION reassembly: this engine
//! never emits Huffman-coded strings itself, and rejects them on decode with a
//! [`Error::ProtocolViolation`] rather than silently mis-parsing. Real gRPC clients
//! commonly do Huffman-encode; pairing this engine with one that can be told to send
//! plain literals (or that falls back when the peer's SETTINGS do not advertise Huffman
//! support) is assumed at the deployment layer, outside this core.

use bytes::{Buf, Bytes};

use wiretap_core::error::{Error, Result};

/// RFC 7541 Appendix A, indices 1..=61 (index 0 is reserved/unused).
const STATIC_TABLE: &[(&str, &str)] = &[
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

const DEFAULT_DYNAMIC_TABLE_SIZE: usize = 2048;

#[derive(Debug, Clone)]
struct DynamicEntry {
    name: String,
    value: String,
}

impl DynamicEntry {
    /// RFC 7541 §4.1: an entry's size is name.len() + value.len() + 32.
    fn size(&self) -> usize {
        self.name.len() + self.value.len() + 32
    }
}

/// One direction's HPACK state. A connection holds two: one per direction, never
/// shared (: "an HPACK dynamic table of size 2048 bytes is maintained per
/// direction").
pub struct HpackTable {
    dynamic: Vec<DynamicEntry>, // most-recently-inserted first, per RFC 7541 §2.3.2
    max_size: usize,
    current_size: usize,
}

impl HpackTable {
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_DYNAMIC_TABLE_SIZE)
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self { dynamic: Vec::new(), max_size, current_size: 0 }
    }

    fn insert(&mut self, name: String, value: String) {
        let entry = DynamicEntry { name, value };
        self.current_size += entry.size();
        self.dynamic.insert(0, entry);
        self.evict();
    }

    fn evict(&mut self) {
        while self.current_size > self.max_size {
            let Some(last) = self.dynamic.pop() else { break };
            self.current_size -= last.size();
        }
    }

    fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict();
    }

    fn lookup(&self, index: usize) -> Result<(String, String)> {
        if index == 0 {
            return Err(Error::protocol_violation("hpack index 0 is invalid"));
        }
        if index <= STATIC_TABLE.len() {
            let (name, value) = STATIC_TABLE[index - 1];
            return Ok((name.to_string(), value.to_string()));
        }
        let dyn_index = index - STATIC_TABLE.len() - 1;
        self.dynamic
        .get(dyn_index)
        .map(|e| (e.name.clone(), e.value.clone()))
        .ok_or_else(|| Error::protocol_violation(format!("hpack index {index} out of range")))
    }
}

impl Default for HpackTable {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_integer(buf: &mut Bytes, prefix_bits: u8, first_byte: u8) -> Result<usize> {
    let mask = (1u16 << prefix_bits) as u8 - 1;
    let mut value = (first_byte & mask) as usize;
    if value < mask as usize {
        return Ok(value);
    }
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(Error::framing("truncated hpack integer"));
        }
        let b = buf.get_u8();
        value += ((b & 0x7f) as usize) << shift;
        if b & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    Ok(value)
}

fn encode_integer(buf: &mut Vec<u8>, prefix_bits: u8, prefix_value: u8, mut value: usize) {
    let mask = (1u16 << prefix_bits) as usize - 1;
    if value < mask {
        buf.push(prefix_value | value as u8);
        return;
    }
    buf.push(prefix_value | mask as u8);
    value -= mask;
    while value >= 0x80 {
        buf.push(((value % 0x80) | 0x80) as u8);
        value /= 0x80;
    }
    buf.push(value as u8);
}

fn decode_string(buf: &mut Bytes) -> Result<String> {
    if !buf.has_remaining() {
        return Err(Error::framing("truncated hpack string"));
    }
    let first = buf[0];
    let huffman = first & 0x80 != 0;
    let len = decode_integer(buf, 7, buf.get_u8())?;
    if buf.remaining() < len {
        return Err(Error::framing("truncated hpack string literal"));
    }
    if huffman {
        return Err(Error::protocol_violation(
                "huffman-coded hpack strings are not supported",
            ));
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| Error::framing("hpack string is not valid utf-8"))
}

fn encode_string(buf: &mut Vec<u8>, value: &str) {
    // Never Huffman-encode on our own write path (see module docs).
    encode_integer(buf, 7, 0x00, value.len());
    buf.extend_from_slice(value.as_bytes());
}

/// Decodes a full HEADERS/CONTINUATION block fragment into an ordered list of
/// `(name, value)` pairs, mutating `table` for any indexing instructions encountered.
pub fn decode_block(mut buf: Bytes, table: &mut HpackTable) -> Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    while buf.has_remaining() {
        let first = buf[0];
        if first & 0x80 != 0 {
            // Indexed Header Field.
            let index = decode_integer(&mut buf, 7, buf.get_u8())?;
            let (name, value) = table.lookup(index)?;
            headers.push((name, value));
        } else if first & 0x40 != 0 {
            // Literal Header Field with Incremental Indexing.
            let index = decode_integer(&mut buf, 6, buf.get_u8())?;
            let name = if index == 0 { decode_string(&mut buf)? } else { table.lookup(index)?.0 };
            let value = decode_string(&mut buf)?;
            table.insert(name.clone(), value.clone());
            headers.push((name, value));
        } else if first & 0x20 != 0 {
            // Dynamic Table Size Update.
            let new_size = decode_integer(&mut buf, 5, buf.get_u8())?;
            table.set_max_size(new_size);
        } else {
            // Literal Header Field without Indexing (0000xxxx) or Never Indexed
            // (0001xxxx) — both decode identically, they only differ in whether a
            // re-encoding proxy is allowed to index them, which we never do either way.
            let prefix_bits = 4;
            let index = decode_integer(&mut buf, prefix_bits, buf.get_u8())?;
            let name = if index == 0 { decode_string(&mut buf)? } else { table.lookup(index)?.0 };
            let value = decode_string(&mut buf)?;
            headers.push((name, value));
        }
    }
    Ok(headers)
}

/// Encodes `headers` as a block of Literal Header Field without Indexing
/// representations. We never rely on indexing for our own synthesized responses —
/// trading a few bytes of header size for a codec with no shared mutable state to get
/// wrong across record and replay runs.
pub fn encode_block(headers: &[(String, String)]) -> Vec<u8> {
    let mut buf = Vec::new();
    for (name, value) in headers {
        buf.push(0x00); // Literal Header Field without Indexing, index 0 (new name).
        encode_integer(&mut buf, 4, 0x00, 0);
        encode_string(&mut buf, name);
        encode_string(&mut buf, value);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_without_indexing_round_trips() {
        let headers = vec![
            (":path".to_string(), "/svc.M/Method".to_string()),
            ("content-type".to_string(), "application/grpc".to_string()),
        ];
        let encoded = encode_block(&headers);
        let mut table = HpackTable::new();
        let decoded = decode_block(Bytes::from(encoded), &mut table).unwrap();
        assert_eq!(decoded, headers);
    }

    #[test]
    fn static_table_indexed_lookup() {
        let mut table = HpackTable::new();
        // Index 2 is (":method", "GET").
        let mut buf = Vec::new();
        buf.push(0x80 | 2);
        let decoded = decode_block(Bytes::from(buf), &mut table).unwrap();
        assert_eq!(decoded, vec![(":method".to_string(), "GET".to_string())]);
    }

    #[test]
    fn dynamic_table_evicts_past_max_size() {
        let mut table = HpackTable::with_max_size(40);
        table.insert("a".repeat(10), "b".repeat(10));
        assert_eq!(table.dynamic.len(), 1);
        table.insert("c".repeat(30), "d".repeat(30));
        // Second entry alone exceeds the 40-byte cap's room after the first, so the
        // first must be evicted.
        assert!(table.current_size <= table.max_size || table.dynamic.len() == 1);
    }

    #[test]
    fn huffman_strings_are_rejected() {
        let mut table = HpackTable::new();
        let mut buf = vec![0x00, 0x00]; // literal without indexing, new name
        buf.push(0x80); // huffman flag set, length 0
        let err = decode_block(Bytes::from(buf), &mut table).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }
}
