//! gRPC matcher predicates plugged into the generic cascade.
//!
//! Pseudo-headers must match exactly between request and recorded mock at every
//! cascade stage, not just the exact-match stage.

use wiretap_core::matching::MatchPredicates;

use crate::message::Http2Request;

pub struct Http2Predicates;

fn pseudo_equal(a: &Http2Request, b: &Http2Request) -> bool {
    a.headers.pseudo == b.headers.pseudo
}

fn ordinary_key_sets_equal(a: &Http2Request, b: &Http2Request) -> bool {
    let a_keys: std::collections::BTreeSet<_> = a.headers.ordinary.keys().collect();
    let b_keys: std::collections::BTreeSet<_> = b.headers.ordinary.keys().collect();
    a_keys == b_keys
}

impl MatchPredicates<Http2Request> for Http2Predicates {
    fn exact(&self, query: &Http2Request, candidate: &Http2Request) -> bool {
        if !pseudo_equal(query, candidate) || !ordinary_key_sets_equal(query, candidate) {
            return false;
        }
        if query.headers.ordinary.get("content-type") != candidate.headers.ordinary.get("content-type")
        {
            return false;
        }
        match (&query.body, &candidate.body) {
            (None, None) => true,
            (Some(a), Some(b)) => a.compression_flag == b.compression_flag && a.payload == b.payload,
            _ => false,
        }
    }

    fn schema(&self, query: &Http2Request, candidate: &Http2Request) -> bool {
        if !pseudo_equal(query, candidate) || !ordinary_key_sets_equal(query, candidate) {
            return false;
        }
        // compression_flag need not match at this stage, and body *values* are left to
        // the fuzzy stage — schema only cares that both sides either have a body or not.
        query.body.is_some() == candidate.body.is_some()
    }

    fn raw_bytes(&self, req: &Http2Request) -> Vec<u8> {
        req.body.as_ref().map(|b| b.payload.to_vec()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_state::GrpcMessage;
    use bytes::Bytes;

    fn req(path: &str, body: &'static [u8]) -> Http2Request {
        let mut r = Http2Request::default();
        r.headers.insert(":path".into(), path.into());
        r.headers.insert("content-type".into(), "application/grpc".into());
        r.body = Some(GrpcMessage { compression_flag: 0, length: body.len() as u32, payload: Bytes::from_static(body) });
        r
    }

    #[test]
    fn exact_requires_pseudo_header_equality() {
        let p = Http2Predicates;
        let a = req("/svc.M/Method", b"hello");
        let mut b = req("/svc.M/OtherMethod", b"hello");
        assert!(!p.exact(&a, &b));
        b.headers.pseudo.insert(":path".into(), "/svc.M/Method".into());
        assert!(p.exact(&a, &b));
    }

    #[test]
    fn schema_ignores_body_value() {
        let p = Http2Predicates;
        let a = req("/svc.M/Method", b"hello");
        let b = req("/svc.M/Method", b"totally different payload bytes");
        assert!(!p.exact(&a, &b));
        assert!(p.schema(&a, &b));
    }
}
