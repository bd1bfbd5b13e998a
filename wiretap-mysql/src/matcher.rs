//! MySQL matcher predicates plugged into the generic cascade.
//!
//! Bound parameters that look like a timestamp or a bcrypt hash are skipped at the
//! exact-match stage, mirroring `wiretap_postgres::matcher`'s treatment of volatile bind
//! values — both change on every recording and would otherwise defeat exact matching
//! outright. A `StmtExecute`'s numeric `statement_id` is never compared directly: it's
//! ephemeral per connection, so comparisons go through `resolved_query`, the id resolved
//! to durable query text via the session's prepared-statement map.

use once_cell::sync::Lazy;
use regex::bytes::Regex;

use wiretap_core::matching::MatchPredicates;

use crate::packet::{BoundParam, Message, MySqlRequest};

static TIMESTAMP_LIKE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^\d{4}-\d{2}-\d{2}([ T]\d{2}:\d{2}:\d{2}(\.\d+)?)?([+-]\d{2}(:?\d{2})?)?$").unwrap()
    });

static BCRYPT_LIKE: Lazy<Regex> =
Lazy::new(|| Regex::new(r"^\$2[aby]?\$\d{2}\$[./A-Za-z0-9]{53}$").unwrap());

fn is_volatile(param: &BoundParam) -> bool {
    match &param.value {
        Some(bytes) => TIMESTAMP_LIKE.is_match(bytes) || BCRYPT_LIKE.is_match(bytes),
        None => false,
    }
}

fn params_match(a: &[BoundParam], b: &[BoundParam]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).all(|(pa, pb)| {
            if pa.type_code != pb.type_code || pa.unsigned != pb.unsigned {
                return false;
            }
            if is_volatile(pa) || is_volatile(pb) {
                return true;
            }
            pa.value == pb.value
        })
}

pub struct MySqlPredicates;

impl MatchPredicates<MySqlRequest> for MySqlPredicates {
    fn exact(&self, query: &MySqlRequest, candidate: &MySqlRequest) -> bool {
        if query.packet_types != candidate.packet_types {
            return false;
        }
        if query.resolved_query != candidate.resolved_query {
            return false;
        }
        match (query.messages.first(), candidate.messages.first()) {
            (Some(Message::Query { sql: a }), Some(Message::Query { sql: b })) => a == b,
            (Some(Message::StmtPrepare { query: a }), Some(Message::StmtPrepare { query: b })) => a == b,
            (Some(Message::StmtExecute(a)), Some(Message::StmtExecute(b))) => params_match(&a.params, &b.params),
            (Some(Message::InitDb { schema: a }), Some(Message::InitDb { schema: b })) => a == b,
            (Some(Message::StmtClose { .. }), Some(Message::StmtClose { .. })) => true,
            (Some(Message::StmtReset { .. }), Some(Message::StmtReset { .. })) => true,
            (Some(Message::Quit), Some(Message::Quit)) => true,
            (Some(Message::Ping), Some(Message::Ping)) => true,
            (None, None) => true,
            _ => false,
        }
    }

    fn schema(&self, query: &MySqlRequest, candidate: &MySqlRequest) -> bool {
        if query.packet_types != candidate.packet_types {
            return false;
        }
        match (query.messages.first(), candidate.messages.first()) {
            (Some(Message::StmtExecute(a)), Some(Message::StmtExecute(b))) => a.params.len() == b.params.len(),
            _ => true,
        }
    }

    fn raw_bytes(&self, req: &MySqlRequest) -> Vec<u8> {
        req.payload.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::StmtExecute;
    use bytes::Bytes;

    fn base(msg: Message) -> MySqlRequest {
        MySqlRequest { packet_types: vec![msg.tag_name().to_string()], messages: vec![msg], ..Default::default() }
    }

    #[test]
    fn exact_requires_same_query_text() {
        let p = MySqlPredicates;
        let a = base(Message::Query { sql: "select 1".into() });
        let mut b = base(Message::Query { sql: "select 2".into() });
        assert!(!p.exact(&a, &b));
        b = base(Message::Query { sql: "select 1".into() });
        assert!(p.exact(&a, &b));
    }

    #[test]
    fn exact_ignores_bcrypt_shaped_parameter() {
        let p = MySqlPredicates;
        let exec_a = StmtExecute {
            statement_id: 1,
            cursor_type: 0,
            params: vec![BoundParam {
                    type_code: 0xfd,
                    unsigned: false,
                    value: Some(Bytes::from_static(
                            b"$2b$12$PGeN936uYK8Bv1.3gbLmBAB/uZ0Ba29bqba4jAzKVjNo0Wki9wC7d",
                        )),
                }],
        };
        let mut a = base(Message::StmtExecute(exec_a.clone()));
        a.resolved_query = Some("insert into users (pw) values (?)".into());

        let exec_b = StmtExecute {
            statement_id: 1,
            cursor_type: 0,
            params: vec![BoundParam {
                    type_code: 0xfd,
                    unsigned: false,
                    value: Some(Bytes::from_static(
                            b"$2b$12$xzUstJ2LSwt8B6DlwTTb/Xbxqr4g.vOY0F7sXy8rzq.o4BbUVJeCH",
                        )),
                }],
        };
        let mut b = base(Message::StmtExecute(exec_b));
        b.resolved_query = a.resolved_query.clone();

        assert!(p.exact(&a, &b));
    }

    #[test]
    fn exact_compares_stmt_execute_by_resolved_query_not_ephemeral_id() {
        let p = MySqlPredicates;
        let exec = StmtExecute { statement_id: 3, cursor_type: 0, params: vec![] };
        let mut a = base(Message::StmtExecute(exec.clone()));
        a.resolved_query = Some("select * from t where id = ?".into());

        let mut other_id_exec = exec.clone();
        other_id_exec.statement_id = 99;
        let mut b = base(Message::StmtExecute(other_id_exec));
        b.resolved_query = a.resolved_query.clone();
        assert!(p.exact(&a, &b));

        b.resolved_query = Some("select * from t where id = ? and active = 1".into());
        assert!(!p.exact(&a, &b));
    }

    #[test]
    fn schema_ignores_query_text_but_not_param_count() {
        let p = MySqlPredicates;
        let a = base(Message::Query { sql: "select 1".into() });
        let b = base(Message::Query { sql: "select whatever from anywhere".into() });
        assert!(p.schema(&a, &b));

        let exec_a = base(Message::StmtExecute(StmtExecute { statement_id: 1, cursor_type: 0, params: vec![] }));
        let exec_b = base(Message::StmtExecute(StmtExecute {
                    statement_id: 1,
                    cursor_type: 0,
                    params: vec![BoundParam { type_code: 0x08, unsigned: false, value: Some(Bytes::from_static(b"1")) }],
                }));
        assert!(!p.schema(&exec_a, &exec_b));
    }
}
