//! Postgres matcher predicates plugged into the generic cascade.
//!
//! Bind parameters whose bytes look like a timestamp or a bcrypt hash are skipped at
//! every comparison stage —
//! both change on every recording and would otherwise defeat exact matching outright. A
//! `Bind`'s statement name is never compared directly: it is ephemeral per connection, so
//! comparisons go through `bind_queries`, the name resolved to durable query text via the
//! session's prepared-statement map.

use std::collections::BTreeSet;

use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::bytes::Regex;

use wiretap_core::matching::MatchPredicates;

use crate::packet::PgRequest;

static TIMESTAMP_LIKE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^\d{4}-\d{2}-\d{2}([ T]\d{2}:\d{2}:\d{2}(\.\d+)?)?([+-]\d{2}(:?\d{2})?)?$").unwrap()
    });

static BCRYPT_LIKE: Lazy<Regex> =
Lazy::new(|| Regex::new(r"^\$2[aby]?\$\d{2}\$[./A-Za-z0-9]{53}$").unwrap());

fn is_volatile(param: &Option<Bytes>) -> bool {
    match param {
        Some(bytes) => TIMESTAMP_LIKE.is_match(bytes) || BCRYPT_LIKE.is_match(bytes),
        None => false,
    }
}

pub struct PgPredicates;

fn packet_type_set(req: &PgRequest) -> BTreeSet<&str> {
    req.packet_types.iter().map(String::as_str).collect()
}

impl MatchPredicates<PgRequest> for PgPredicates {
    fn exact(&self, query: &PgRequest, candidate: &PgRequest) -> bool {
        if query.packet_types != candidate.packet_types {
            return false;
        }
        if query.parse.len() != candidate.parse.len()
        || !query
        .parse
        .iter()
        .zip(&candidate.parse)
        .all(|(a, b)| a.query == b.query && a.param_types == b.param_types)
        {
            return false;
        }
        if query.bind.len() != candidate.bind.len() || query.bind_queries != candidate.bind_queries {
            return false;
        }
        for (a, b) in query.bind.iter().zip(&candidate.bind) {
            if a.param_formats != b.param_formats || a.result_formats != b.result_formats {
                return false;
            }
            if a.params.len() != b.params.len() {
                return false;
            }
            for (pa, pb) in a.params.iter().zip(&b.params) {
                if is_volatile(pa) || is_volatile(pb) {
                    continue;
                }
                if pa != pb {
                    return false;
                }
            }
        }
        if query.execute.len() != candidate.execute.len()
        || !query.execute.iter().zip(&candidate.execute).all(|(a, b)| a.max_rows == b.max_rows)
        {
            return false;
        }
        match (&query.query, &candidate.query) {
            (Some(a), Some(b)) if a.sql == b.sql => {}
            (None, None) => {}
            _ => return false,
        }
        query.password.is_some() == candidate.password.is_some()
    }

    fn schema(&self, query: &PgRequest, candidate: &PgRequest) -> bool {
        // The ambiguous original `compareMapKeys` (an asymmetric subset check) is
        // standardized here to an equal-key-set comparison over which packet types
        // appear in the bundle.
        if packet_type_set(query) != packet_type_set(candidate) {
            return false;
        }
        query.bind.len() == candidate.bind.len()
        && query.parse.len() == candidate.parse.len()
        && query.execute.len() == candidate.execute.len()
        && query.query.is_some() == candidate.query.is_some()
    }

    fn raw_bytes(&self, req: &PgRequest) -> Vec<u8> {
        req.payload.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Bind, Parse, Query};

    fn base() -> PgRequest {
        PgRequest { packet_types: vec!["Query".into()], ..Default::default() }
    }

    #[test]
    fn exact_requires_same_query_text() {
        let p = PgPredicates;
        let mut a = base();
        a.query = Some(Query { sql: "select 1".into() });
        let mut b = base();
        b.query = Some(Query { sql: "select 2".into() });
        assert!(!p.exact(&a, &b));
        b.query = Some(Query { sql: "select 1".into() });
        assert!(p.exact(&a, &b));
    }

    #[test]
    fn exact_ignores_bcrypt_shaped_bind_parameter() {
        let p = PgPredicates;
        let mut a = base();
        a.packet_types = vec!["Bind".into()];
        a.bind = vec![Bind {
                portal: String::new(),
                statement: "s1".into(),
                param_formats: vec![0],
                params: vec![Some(Bytes::from_static(
                            b"$2b$12$PGeN936uYK8Bv1.3gbLmBAB/uZ0Ba29bqba4jAzKVjNo0Wki9wC7d",
                        ))],
                result_formats: vec![0],
            }];
        a.bind_queries = vec![Some("insert into users (pw) values ($1)".into())];

        let mut b = a.clone();
        b.bind[0].params = vec![Some(Bytes::from_static(
                    b"$2b$12$xzUstJ2LSwt8B6DlwTTb/Xbxqr4g.vOY0F7sXy8rzq.o4BbUVJeCH",
                ))];

        assert!(p.exact(&a, &b));
    }

    #[test]
    fn exact_compares_bind_by_resolved_query_not_ephemeral_name() {
        let p = PgPredicates;
        let mut a = base();
        a.packet_types = vec!["Bind".into()];
        a.bind = vec![Bind {
                portal: String::new(),
                statement: "s_1".into(),
                param_formats: vec![],
                params: vec![],
                result_formats: vec![],
            }];
        a.bind_queries = vec![Some("select * from t where id=$1".into())];

        let mut b = a.clone();
        b.bind[0].statement = "s_7".into();
        // Different live name, same resolved query: still an exact match.
        assert!(p.exact(&a, &b));

        b.bind_queries = vec![Some("select * from t where id=$2".into())];
        assert!(!p.exact(&a, &b));
    }

    #[test]
    fn schema_ignores_query_text_but_not_shape() {
        let p = PgPredicates;
        let mut a = base();
        a.query = Some(Query { sql: "select 1".into() });
        let mut b = base();
        b.query = Some(Query { sql: "select whatever from anywhere".into() });
        assert!(p.schema(&a, &b));

        a.parse = vec![Parse { statement: "s1".into(), query: "x".into(), param_types: vec![] }];
        assert!(!p.schema(&a, &b));
    }
}
