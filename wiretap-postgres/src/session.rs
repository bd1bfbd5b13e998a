//! Per-connection session state: the prepared-statement name map
//! and the request-bundle builder that merges several wire messages into one composite
//! [`PgRequest`] for the matcher.

use std::collections::HashMap;

use bytes::{BufMut, Bytes};

use wiretap_core::error::Result;
use wiretap_core::io::Encode;

use crate::codec::TaggedFrame;
use crate::packet::{Bind, Execute, Parse, PasswordMessage, PgRequest, Query};

/// Maps a connection-local prepared-statement name (`S_1`, `s_7`, …) to the query text
/// it was `Parse`d with — `record_ps[conn_id]` during recording, `test_ps[conn_id]`
/// during replay.
#[derive(Debug, Default)]
pub struct PreparedStatements {
    by_name: HashMap<String, String>,
}

impl PreparedStatements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_parse(&mut self, name: &str, query: &str) {
        self.by_name.insert(name.to_string(), query.to_string());
    }

    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.by_name.get(name).map(String::as_str)
    }
}

fn tag_name(tag: u8) -> &'static str {
    match tag {
        b'P' => "Parse",
        b'B' => "Bind",
        b'E' => "Execute",
        b'Q' => "Query",
        b'p' => "PasswordMessage",
        b'D' => "Describe",
        b'S' => "Sync",
        b'C' => "Close",
        b'H' => "Flush",
        _ => "Unknown",
    }
}

/// Builds one composite [`PgRequest`] out of however many wire messages arrive during a
/// request bundle (: "the merge re-encodes each structured buffer back to wire
/// form and concatenates them").
#[derive(Default)]
pub struct RequestBuilder {
    req: PgRequest,
    payload: Vec<u8>,
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.req.packet_types.is_empty()
    }

    /// Decodes `frame` by tag and folds it into the composite request; statements'
    /// connection-local names are resolved to query text via `ps` so the matcher never
    /// sees ephemeral names.
    pub fn push_frame(&mut self, frame: &TaggedFrame, ps: &mut PreparedStatements) -> Result<()> {
        self.req.packet_types.push(tag_name(frame.tag).to_string());
        self.payload.push(frame.tag);
        let len_pos = self.payload.len();
        self.payload.put_u32(0);

        match frame.tag {
            b'P' => {
                let parsed = Parse::decode_body(frame.payload.clone())?;
                ps.record_parse(&parsed.statement, &parsed.query);
                parsed.encode_body(&mut self.payload);
                self.req.parse.push(parsed);
            }
            b'B' => {
                let parsed = Bind::decode_body(frame.payload.clone())?;
                parsed.encode_body(&mut self.payload);
                self.req.bind.push(parsed);
            }
            b'E' => {
                let parsed = Execute::decode_body(frame.payload.clone())?;
                parsed.encode_body(&mut self.payload);
                self.req.execute.push(parsed);
            }
            b'Q' => {
                let parsed = Query::decode_body(frame.payload.clone())?;
                parsed.encode_body(&mut self.payload);
                self.req.query = Some(parsed);
            }
            b'p' => {
                let parsed = PasswordMessage::decode_body(frame.payload.clone())?;
                parsed.encode_body(&mut self.payload);
                self.req.password = Some(parsed);
            }
            _ => {
                self.payload.extend_from_slice(&frame.payload);
            }
        }

        let total_len = (self.payload.len() - len_pos) as u32;
        self.payload[len_pos..len_pos + 4].copy_from_slice(&total_len.to_be_bytes());
        Ok(())
    }

    /// Finishes the bundle, resolving every `Bind`'s prepared-statement name to query
    /// text via `ps` before handing the request to the matcher.
    pub fn finish(mut self, ps: &PreparedStatements) -> PgRequest {
        self.req.payload = Bytes::from(self.payload);
        self.req.bind_queries = resolve_bind_queries(&self.req, ps);
        self.req
    }
}

/// Resolves the query text behind every `Bind` in `req` against `ps`, for the matcher's
/// prepared-statement-aware equality. Returns one entry per `Bind`, `None`
/// if the name is unknown to this connection (an unprepared statement, or one prepared
/// before this session's bookkeeping began).
pub fn resolve_bind_queries(req: &PgRequest, ps: &PreparedStatements) -> Vec<Option<String>> {
    req.bind.iter().map(|b| ps.resolve(&b.statement).map(str::to_string)).collect()
}

/// Helpers so [`RequestBuilder`] can re-encode just the body (tag and length already
/// written by the caller) using each type's existing `Encode` impl.
trait BodyCodec: Sized {
    fn decode_body(buf: Bytes) -> Result<Self>;
    fn encode_body(&self, out: &mut Vec<u8>);
}

impl<T> BodyCodec for T
where
    T: for<'de> wiretap_core::io::Decode<'de> + for<'en> Encode<'en>,
{
    fn decode_body(buf: Bytes) -> Result<Self> {
        T::decode(buf)
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        // Each type's `Encode::encode` writes its own tag + length prefix; strip those
        // back off since the caller already wrote the shared tag/length header.
        let mut full = Vec::new();
        Encode::encode(self, &mut full);
        out.extend_from_slice(&full[5..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8, body: &[u8]) -> TaggedFrame {
        TaggedFrame { tag, payload: Bytes::copy_from_slice(body) }
    }

    #[test]
    fn merges_parse_bind_execute_into_one_request() {
        let mut ps = PreparedStatements::new();
        let mut builder = RequestBuilder::new();

        let parse = Parse { statement: "s1".into(), query: "select $1".into(), param_types: vec![23] };
        let mut parse_body = Vec::new();
        parse.encode(&mut parse_body);
        builder.push_frame(&frame(b'P', &parse_body[5..]), &mut ps).unwrap();

        let bind = Bind {
            portal: String::new(),
            statement: "s1".into(),
            param_formats: vec![0],
            params: vec![Some(Bytes::from_static(b"42"))],
            result_formats: vec![0],
        };
        let mut bind_body = Vec::new();
        bind.encode(&mut bind_body);
        builder.push_frame(&frame(b'B', &bind_body[5..]), &mut ps).unwrap();

        let execute = Execute { portal: String::new(), max_rows: 0 };
        let mut exec_body = Vec::new();
        execute.encode(&mut exec_body);
        builder.push_frame(&frame(b'E', &exec_body[5..]), &mut ps).unwrap();

        let req = builder.finish(&ps);
        assert_eq!(req.packet_types, vec!["Parse", "Bind", "Execute"]);
        assert_eq!(req.parse.len(), 1);
        assert_eq!(req.bind.len(), 1);
        assert_eq!(req.execute.len(), 1);
        assert!(!req.payload.is_empty());

        assert_eq!(ps.resolve("s1"), Some("select $1"));
        assert_eq!(req.bind_queries, vec![Some("select $1".to_string())]);
    }

    #[test]
    fn resolves_bind_queries_via_prepared_statement_map() {
        let mut ps = PreparedStatements::new();
        ps.record_parse("s7", "SELECT * FROM t WHERE id=$1");

        let req = PgRequest {
            bind: vec![Bind {
                    portal: String::new(),
                    statement: "s7".into(),
                    param_formats: vec![],
                    params: vec![],
                    result_formats: vec![],
                }],
            ..Default::default()
        };

        let resolved = resolve_bind_queries(&req, &ps);
        assert_eq!(resolved, vec![Some("SELECT * FROM t WHERE id=$1".to_string())]);
    }
}
