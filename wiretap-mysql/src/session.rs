//! Per-connection session state: the connection-phase state machine
//! and the prepared-statement id bookkeeping that lets the matcher compare
//! `StmtExecute` calls by query text rather than by a numeric id that's only meaningful
//! within one connection (mirrors `wiretap_postgres::session`'s name→query map, keyed by
//! `u32` here instead of by string).

use std::collections::HashMap;

/// Where a connection is in the handshake, mirroring the phases a real MySQL server
/// walks a client through before accepting commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Server has sent `HandshakeV10`, waiting for `HandshakeResponse41`.
    AwaitHandshakeResponse,
    /// Server asked the client to switch auth plugins, waiting for the response.
    AwaitAuthSwitchResponse,
    /// Handshake complete; next packet starts a new command.
    Authenticated,
}

/// Maps a connection-local prepared-statement id (`StmtPrepareOk.statement_id`) to the
/// query text it was prepared with, and to the parameter count the binary protocol
/// needs to size a `StmtExecute`'s null-bitmap and type-pair section.
#[derive(Debug, Default)]
pub struct PreparedStatements {
    by_id: HashMap<u32, PreparedStatement>,
}

#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub query: String,
    pub num_params: u16,
}

impl PreparedStatements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, statement_id: u32, query: &str, num_params: u16) {
        self.by_id.insert(statement_id, PreparedStatement { query: query.to_string(), num_params });
    }

    pub fn resolve(&self, statement_id: u32) -> Option<&PreparedStatement> {
        self.by_id.get(&statement_id)
    }

    pub fn forget(&mut self, statement_id: u32) {
        self.by_id.remove(&statement_id);
    }
}

/// Per-connection state threaded through both the record-mode tee and the replay
/// engine: which handshake phase the connection is in, and the prepared-statement map
///.
#[derive(Debug)]
pub struct SessionState {
    pub phase: ConnectionPhase,
    pub prepared: PreparedStatements,
}

impl SessionState {
    pub fn new() -> Self {
        Self { phase: ConnectionPhase::AwaitHandshakeResponse, prepared: PreparedStatements::new() }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_statement_by_id_after_prepare() {
        let mut ps = PreparedStatements::new();
        ps.record(1, "SELECT * FROM t WHERE id = ?", 1);
        let resolved = ps.resolve(1).unwrap();
        assert_eq!(resolved.query, "SELECT * FROM t WHERE id = ?");
        assert_eq!(resolved.num_params, 1);
    }

    #[test]
    fn forgetting_a_statement_removes_it() {
        let mut ps = PreparedStatements::new();
        ps.record(1, "SELECT 1", 0);
        ps.forget(1);
        assert!(ps.resolve(1).is_none());
    }

    #[test]
    fn new_session_starts_awaiting_handshake_response() {
        let session = SessionState::new();
        assert_eq!(session.phase, ConnectionPhase::AwaitHandshakeResponse);
    }
}
