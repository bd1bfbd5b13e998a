//! The MySQL protocol engine.
//!
//! State machine: `AwaitClientHandshakeResponse → ServerChallenge? → Authenticated →
//! Command` (loop). Within `Command`, each client packet begins a new exchange with the
//! sequence id reset to 0, and the packet's command byte determines the expected
//! response shape: `OK`/`ERR`, `ColumnCount` + column defs + rows + `EOF`/`OK`, or
//! `StmtPrepareOk` + parameter defs + column defs.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::RngCore;
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use wiretap_core::error::{Error, Result};
use wiretap_core::matching::match_and_claim;
use wiretap_core::mock::MockKind;
use wiretap_core::store::MockStore;
use wiretap_core::{CancelSignal, Mock};

use crate::codec::{split_codec, MySqlReader, MySqlWriter};
use crate::matcher::MySqlPredicates;
use crate::message::MySqlMock;
use crate::packet::{
    decode_stmt_execute_header, peek_column_count, BinaryRow, ColumnDefinition41, EofPacket, ErrPacket,
    HandshakeResponse41, HandshakeV10, Message, MySqlRequest, MySqlResponse, OkPacket, StmtExecute,
    StmtPrepareOk, TextRow, COM_STMT_EXECUTE,
};
use crate::session::PreparedStatements;

/// A connection-wide scramble fed to the live client as part of the synthesized
/// `HandshakeV10`; unlike Postgres's SCRAM rewrite there's no subsequent
/// verification step the engine has to honor, so this only needs to look plausible.
fn synthetic_scramble() -> Bytes {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    Bytes::copy_from_slice(&bytes)
}

/// What shape of response a client command expects — determined by the command byte
/// the way a real server routes it internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExpectedShape {
    /// No response packet at all (`COM_QUIT`, `COM_STMT_CLOSE`).
    None,
    /// A single `OK` or `ERR` packet.
    OkOrErr,
    /// `OK`/`ERR`, or `ColumnCount` + column defs + text rows + `EOF`/`OK`.
    QueryResult,
    /// `OK`/`ERR`, or `ColumnCount` + column defs + binary rows + `EOF`/`OK`.
    ExecuteResult,
    /// `ERR`, or `StmtPrepareOk` + parameter defs + column defs.
    PrepareResult,
}

fn expected_shape(msg: &Message) -> ExpectedShape {
    match msg {
        Message::Quit | Message::StmtClose { .. } => ExpectedShape::None,
        Message::Ping | Message::InitDb { .. } | Message::StmtReset { .. } => ExpectedShape::OkOrErr,
        Message::StmtExecute(_) => ExpectedShape::ExecuteResult,
        Message::StmtPrepare { .. } => ExpectedShape::PrepareResult,
        _ => ExpectedShape::QueryResult,
    }
}

/// Reads one full response for `shape`, forwarding every raw packet to `writer` as it
/// arrives (record mode's tee calls this directly; replay mode never calls this — it
/// walks a mock's already-decoded `messages` instead).
async fn read_response<S, C>(
    reader: &mut MySqlReader<S>,
    writer: &mut MySqlWriter<C>,
    shape: ExpectedShape,
    deprecate_eof: bool,
) -> Result<MySqlResponse>
where
    S: AsyncRead + Unpin,
    C: AsyncWrite + Unpin,
{
    let mut resp = MySqlResponse::default();
    let mut payload_acc = Vec::new();

    if matches!(shape, ExpectedShape::None) {
        return Ok(resp);
    }

    macro_rules! pull {
        () => {{
                let packet = reader.read_packet().await?;
                writer.write_raw_packet(&packet).await?;
                payload_acc.extend_from_slice(&packet.payload);
                packet
            }};
    }

    let first = pull!();
    let first_byte = first.payload.first().copied().unwrap_or(0);

    if first_byte == 0xFF {
        resp.packet_types.push("Err".into());
        resp.messages.push(Message::Err(ErrPacket::decode(first.payload.clone())?));
        resp.payload = Bytes::from(payload_acc);
        return Ok(resp);
    }

    match shape {
        ExpectedShape::None => unreachable!(),
        ExpectedShape::OkOrErr => {
            resp.packet_types.push("Ok".into());
            resp.messages.push(Message::Ok(OkPacket::decode(first.payload.clone())?));
        }
        ExpectedShape::PrepareResult => {
            let ok = StmtPrepareOk::decode(first.payload.clone())?;
            let (num_params, num_columns) = (ok.num_params, ok.num_columns);
            resp.packet_types.push("StmtPrepareOk".into());
            resp.messages.push(Message::StmtPrepareOk(ok));

            if num_params > 0 {
                for _ in 0..num_params {
                    let p = pull!();
                    resp.packet_types.push("ColumnDefinition41".into());
                    resp.messages.push(Message::ColumnDefinition41(ColumnDefinition41::decode(p.payload.clone())?));
                }
                if !deprecate_eof {
                    let e = pull!();
                    resp.packet_types.push("Eof".into());
                    resp.messages.push(Message::Eof(EofPacket::decode(e.payload.clone())?));
                }
            }
            if num_columns > 0 {
                for _ in 0..num_columns {
                    let p = pull!();
                    resp.packet_types.push("ColumnDefinition41".into());
                    resp.messages.push(Message::ColumnDefinition41(ColumnDefinition41::decode(p.payload.clone())?));
                }
                if !deprecate_eof {
                    let e = pull!();
                    resp.packet_types.push("Eof".into());
                    resp.messages.push(Message::Eof(EofPacket::decode(e.payload.clone())?));
                }
            }
        }
        ExpectedShape::QueryResult | ExpectedShape::ExecuteResult => {
            if first_byte == 0x00 {
                resp.packet_types.push("Ok".into());
                resp.messages.push(Message::Ok(OkPacket::decode(first.payload.clone())?));
            } else {
                let column_count = peek_column_count(&first.payload)?;
                resp.packet_types.push("ColumnCount".into());
                resp.messages.push(Message::ColumnCount { count: column_count });

                for _ in 0..column_count {
                    let p = pull!();
                    resp.packet_types.push("ColumnDefinition41".into());
                    resp.messages.push(Message::ColumnDefinition41(ColumnDefinition41::decode(p.payload.clone())?));
                }
                if !deprecate_eof {
                    let e = pull!();
                    resp.packet_types.push("Eof".into());
                    resp.messages.push(Message::Eof(EofPacket::decode(e.payload.clone())?));
                }

                let binary = matches!(shape, ExpectedShape::ExecuteResult);
                loop {
                    let r = pull!();
                    let b0 = r.payload.first().copied().unwrap_or(0);
                    if b0 == 0xFF {
                        resp.packet_types.push("Err".into());
                        resp.messages.push(Message::Err(ErrPacket::decode(r.payload.clone())?));
                        break;
                    }
                    if b0 == 0xFE && (deprecate_eof || r.payload.len() < 9) {
                        if deprecate_eof {
                            resp.packet_types.push("Ok".into());
                            resp.messages.push(Message::Ok(OkPacket::decode(r.payload.clone())?));
                        } else {
                            resp.packet_types.push("Eof".into());
                            resp.messages.push(Message::Eof(EofPacket::decode(r.payload.clone())?));
                        }
                        break;
                    }
                    if binary {
                        resp.packet_types.push("BinaryRow".into());
                        resp.messages.push(Message::BinaryRow(BinaryRow::decode(r.payload.clone())?));
                    } else {
                        resp.packet_types.push("TextRow".into());
                        resp.messages.push(Message::TextRow(TextRow::decode(r.payload.clone())?));
                    }
                }
            }
        }
    }

    resp.payload = Bytes::from(payload_acc);
    Ok(resp)
}

/// Decodes one client command packet, resolving `COM_STMT_EXECUTE`'s parameter section
/// against `prepared` (it can't be sized without knowing `num_params` from the matching
/// `StmtPrepareOk`) and attaching the statement's query text as `resolved_query` for any
/// message referencing a statement id, so the matcher never compares by ephemeral id
///.
fn decode_request(payload: Bytes, prepared: &PreparedStatements) -> Result<MySqlRequest> {
    let command = payload.first().copied().unwrap_or(0);
    let (message, resolved_query) = if command == COM_STMT_EXECUTE {
        let (statement_id, cursor_type, rest) = decode_stmt_execute_header(payload.clone())?;
        let stmt = prepared.resolve(statement_id);
        let num_params = stmt.map(|s| s.num_params);
        let exec = StmtExecute::decode_with_param_count(rest, statement_id, cursor_type, num_params)?;
        (Message::StmtExecute(exec), stmt.map(|s| s.query.clone()))
    } else {
        let msg = Message::decode_command(payload.clone())?;
        let resolved = match &msg {
            Message::StmtClose { statement_id } | Message::StmtReset { statement_id } => {
                prepared.resolve(*statement_id).map(|s| s.query.clone())
            }
            _ => None,
        };
        (msg, resolved)
    };
    Ok(MySqlRequest {
            packet_types: vec![message.tag_name().to_string()],
            messages: vec![message],
            payload,
            resolved_query,
        })
}

/// Record mode: the handshake is a strictly sequential challenge/response
/// so it's driven directly rather than by the directional tee tasks used for the
/// command loop. Every client command and its paired response are bundled into one
/// mock and handed to `sink`.
pub async fn record_mode<C, S>(
    client: C,
    server: S,
    cancel: CancelSignal,
    sink: mpsc::UnboundedSender<MySqlMock>,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut client_reader, mut client_writer) = split_codec(client);
    let (mut server_reader, mut server_writer) = split_codec(server);

    let handshake = server_reader.read_packet().await?;
    client_writer.write_raw_packet(&handshake).await?;

    let response = client_reader.read_packet().await?;
    server_writer.write_raw_packet(&response).await?;
    let deprecate_eof = HandshakeResponse41::decode(response.payload.clone())
    .map(|h| h.capabilities & crate::packet::CLIENT_DEPRECATE_EOF != 0)
    .unwrap_or(false);

    loop {
        let packet = server_reader.read_packet().await?;
        client_writer.write_raw_packet(&packet).await?;
        match packet.payload.first().copied().unwrap_or(0) {
            0xFE | 0x01 => {
                let reply = client_reader.read_packet().await?;
                server_writer.write_raw_packet(&reply).await?;
            }
            _ => break,
        }
    }

    let prepared = Arc::new(Mutex::new(PreparedStatements::new()));
    let pending: Arc<Mutex<VecDeque<(MySqlRequest, ExpectedShape, SystemTime)>>> =
    Arc::new(Mutex::new(VecDeque::new()));

    let c2s = {
        let prepared = prepared.clone();
        let pending = pending.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
                tee_client_to_server(client_reader, server_writer, prepared, pending, cancel).await
            })
    };
    let s2c = {
        tokio::spawn(async move {
                tee_server_to_client(server_reader, client_writer, prepared, pending, deprecate_eof, cancel, sink).await
            })
    };

    let (r1, r2) = tokio::join!(c2s, s2c);
    r1.map_err(|_| Error::Cancelled)??;
    r2.map_err(|_| Error::Cancelled)??;
    Ok(())
}

async fn tee_client_to_server<C, S>(
    mut reader: MySqlReader<ReadHalf<C>>,
    mut writer: MySqlWriter<WriteHalf<S>>,
    prepared: Arc<Mutex<PreparedStatements>>,
    pending: Arc<Mutex<VecDeque<(MySqlRequest, ExpectedShape, SystemTime)>>>,
    cancel: CancelSignal,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let packet = match reader.read_packet().await {
            Ok(p) => p,
            Err(_) => return Ok(()),
        };
        let req_ts = SystemTime::now();
        writer.write_raw_packet(&packet).await?;

        let request = decode_request(packet.payload, &prepared.lock())?;
        let shape = expected_shape(&request.messages[0]);
        if matches!(request.messages[0], Message::Quit) {
            return Ok(());
        }
        pending.lock().push_back((request, shape, req_ts));
    }
}

async fn tee_server_to_client<S, C>(
    mut reader: MySqlReader<ReadHalf<S>>,
    mut writer: MySqlWriter<WriteHalf<C>>,
    prepared: Arc<Mutex<PreparedStatements>>,
    pending: Arc<Mutex<VecDeque<(MySqlRequest, ExpectedShape, SystemTime)>>>,
    deprecate_eof: bool,
    cancel: CancelSignal,
    sink: mpsc::UnboundedSender<MySqlMock>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        // Waits for the client-side task to have decoded the command this response
        // pairs with; a short park-free spin is fine since the client always writes
        // its command packet before the server can possibly answer it.
        let (request, shape, req_ts) = loop {
            if let Some(item) = pending.lock().pop_front() {
                break item;
            }
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            tokio::task::yield_now().await;
        };

        let response = match read_response(&mut reader, &mut writer, shape, deprecate_eof).await {
            Ok(r) => r,
            Err(_) => return Ok(()),
        };

        if let (Message::StmtPrepare { query }, Some(Message::StmtPrepareOk(ok))) =
        (&request.messages[0], response.messages.first())
        {
            prepared.lock().record(ok.statement_id, query, ok.num_params);
        }

        let res_ts = SystemTime::now();
        let mock = Mock::new(MockKind::MySql, request, response, req_ts, res_ts);
        let _ = sink.send(mock);
    }
}

/// Anything a no-mock fallback can proxy bytes to (mirrors
/// `wiretap_postgres::engine::PassthroughDest`).
pub trait PassthroughDest: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> PassthroughDest for T {}

/// Replay mode: terminate the client, synthesize the server side of the
/// handshake and every command's response from matched mocks, and fall back to
/// passthrough when nothing matches.
pub struct ReplayEngine<C, St> {
    reader: MySqlReader<ReadHalf<C>>,
    writer: MySqlWriter<WriteHalf<C>>,
    store: Arc<St>,
    cancel: CancelSignal,
    auth_switch: Option<String>,
    prepared: PreparedStatements,
    passthrough: Option<Box<dyn PassthroughDest>>,
}

impl<C, St> ReplayEngine<C, St>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    St: MockStore<MySqlRequest, MySqlResponse> + Send + Sync + 'static,
{
    pub fn new(client: C, store: Arc<St>, cancel: CancelSignal) -> Self {
        let (reader, writer) = split_codec(client);
        Self { reader, writer, store, cancel, auth_switch: None, prepared: PreparedStatements::new(), passthrough: None }
    }

    /// Configures a plugin name recorded mode observed an `AuthSwitchRequest` for, so
    /// replay performs the same round trip instead of accepting the client's initial
    /// handshake response directly.
    pub fn with_auth_switch(mut self, plugin_name: impl Into<String>) -> Self {
        self.auth_switch = Some(plugin_name.into());
        self
    }

    /// Configures the destination this engine proxies to when no mock matches a
    /// completed command.
    pub fn with_passthrough<D>(mut self, dest: D) -> Self
    where
        D: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.passthrough = Some(Box::new(dest));
        self
    }

    pub async fn run(mut self) -> Result<()> {
        self.handle_handshake().await?;

        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.reader.reset_sequence();
            let packet = match self.reader.read_packet().await {
                Ok(p) => p,
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            };
            self.writer.set_next_sequence_id(packet.sequence_id.wrapping_add(1));

            let request = decode_request(packet.payload.clone(), &self.prepared)?;
            if matches!(request.messages[0], Message::Quit) {
                return Ok(());
            }
            if let Message::StmtClose { statement_id } = &request.messages[0] {
                self.prepared.forget(*statement_id);
                continue;
            }

            match match_and_claim::<MySqlRequest, MySqlResponse, St>(&self.store, &request, &MySqlPredicates) {
                Ok(mock) => {
                    self.send_response(&mock.response).await?;
                    if let (Message::StmtPrepare { query }, Some(Message::StmtPrepareOk(ok))) =
                    (&request.messages[0], mock.response.messages.first())
                    {
                        self.prepared.record(ok.statement_id, query, ok.num_params);
                    }
                }
                Err(Error::NoMock(_)) => {
                    tracing::warn!(
                        payload = %wiretap_core::preview::BytePreview(&packet.payload),
                        "no mock matched mysql command, falling back to passthrough"
                    );
                    return self.passthrough_fallback(packet.payload).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn handle_handshake(&mut self) -> Result<()> {
        let handshake = HandshakeV10 {
            server_version: "8.0.34-wiretap".into(),
            connection_id: 1,
            auth_plugin_data: synthetic_scramble(),
            capabilities: crate::packet::CLIENT_PROTOCOL_41
            | crate::packet::CLIENT_SECURE_CONNECTION
            | crate::packet::CLIENT_PLUGIN_AUTH
            | crate::packet::CLIENT_CONNECT_WITH_DB
            | crate::packet::CLIENT_PLUGIN_AUTH_LENENC_DATA,
            char_set: 45,
            status: 2,
            auth_plugin_name: "mysql_native_password".into(),
        };
        self.writer.write_packet(&handshake.encode()).await?;

        let _response = self.reader.read_packet().await?;

        if let Some(plugin_name) = self.auth_switch.clone() {
            let switch = crate::packet::AuthSwitchRequest { plugin_name, plugin_data: synthetic_scramble() };
            self.writer.write_packet(&switch.encode()).await?;
            let _ = self.reader.read_packet().await?;
        }

        self.writer.write_packet(&OkPacket::default().encode()).await
    }

    async fn send_response(&mut self, response: &MySqlResponse) -> Result<()> {
        if response.messages.is_empty() {
            if !response.payload.is_empty() {
                self.writer.write_packet(&response.payload).await?;
            }
            return Ok(());
        }
        for msg in &response.messages {
            self.writer.write_packet(&msg.encode()).await?;
        }
        Ok(())
    }

    /// Hands the rest of this connection off to raw byte-copy passthrough, mirroring
    /// `wiretap_postgres::engine::ReplayEngine::passthrough_fallback`.
    async fn passthrough_fallback(self, request_bytes: Bytes) -> Result<()> {
        let Some(mut dest) = self.passthrough else {
            return Err(Error::no_mock("no mock matched and no passthrough destination configured"));
        };
        dest.write_all(&request_bytes).await.map_err(Error::Io)?;

        let mut reader_buf = self.reader.into_inner();
        let tail = reader_buf.take_buffered();
        let read_half = reader_buf.into_inner();

        let mut writer_buf = self.writer.into_inner();
        writer_buf.flush().await?;
        let write_half = writer_buf.into_inner();

        let mut client = io::unsplit(read_half, write_half);
        if !tail.is_empty() {
            dest.write_all(&tail).await.map_err(Error::Io)?;
        }
        io::copy_bidirectional(&mut client, &mut dest).await.map_err(Error::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::split_codec as split_client_codec;
    use std::time::Duration;
    use tokio::io::duplex;
    use wiretap_core::store::InMemoryMockStore;

    fn query_mock(sql: &str) -> MySqlMock {
        let request = MySqlRequest {
            packet_types: vec!["Query".into()],
            messages: vec![Message::Query { sql: sql.to_string() }],
            ..Default::default()
        };
        let ok = OkPacket { affected_rows: 1, ..Default::default() };
        let response = MySqlResponse {
            packet_types: vec!["Ok".into()],
            messages: vec![Message::Ok(ok)],
            ..Default::default()
        };
        let now = SystemTime::now();
        Mock::new(MockKind::MySql, request, response, now, now)
    }

    async fn drive_past_handshake(client: &mut tokio::io::DuplexStream) {
        let mut writer = MySqlWriter::new(&mut *client);
        let response = HandshakeResponse41 {
            capabilities: crate::packet::CLIENT_PROTOCOL_41 | crate::packet::CLIENT_SECURE_CONNECTION,
            max_packet_size: 16_777_216,
            char_set: 45,
            username: "root".into(),
            auth_response: Bytes::new(),
            database: None,
            auth_plugin_name: None,
        };
        writer.write_packet(&response.encode()).await.unwrap();
    }

    #[tokio::test]
    async fn replays_simple_query_with_recorded_ok_packet() {
        let store = Arc::new(InMemoryMockStore::new());
        store.insert(query_mock("select 1"));

        let (mut client, server) = duplex(1 << 16);
        let cancel = CancelSignal::new();
        let engine = ReplayEngine::new(server, store, cancel.clone());
        let handle = tokio::spawn(engine.run());

        // Drain the synthesized HandshakeV10.
        let mut reader = MySqlReader::new(&mut client);
        reader.read_packet().await.unwrap();
        drive_past_handshake(&mut client).await;
        // Drain the synthesized OK that completes the handshake.
        reader.read_packet().await.unwrap();

        let (mut reader, mut writer) = split_client_codec(client);
        let mut query_payload = vec![crate::packet::COM_QUERY];
        query_payload.extend_from_slice(b"select 1");
        writer.write_packet(&query_payload).await.unwrap();

        let reply = reader.read_packet().await.unwrap();
        let ok = OkPacket::decode(reply.payload).unwrap();
        assert_eq!(ok.affected_rows, 1);

        drop(reader);
        drop(writer);
        let _ = cancel;
        let _ = tokio::time::timeout(Duration::from_millis(200), handle).await;
    }

    #[tokio::test]
    async fn stmt_prepare_then_execute_resolves_by_query_text() {
        let store = Arc::new(InMemoryMockStore::new());
        let prepare_request = MySqlRequest {
            packet_types: vec!["StmtPrepare".into()],
            messages: vec![Message::StmtPrepare { query: "SELECT ?".into() }],
            ..Default::default()
        };
        let prepare_ok = StmtPrepareOk { statement_id: 1, num_columns: 1, num_params: 1, warnings: 0 };
        let prepare_response = MySqlResponse {
            packet_types: vec!["StmtPrepareOk".into()],
            messages: vec![Message::StmtPrepareOk(prepare_ok)],
            ..Default::default()
        };
        let now = SystemTime::now();
        store.insert(Mock::new(MockKind::MySql, prepare_request, prepare_response, now, now));

        let exec_request = MySqlRequest {
            packet_types: vec!["StmtExecute".into()],
            messages: vec![Message::StmtExecute(StmtExecute { statement_id: 1, cursor_type: 0, params: vec![] })],
            resolved_query: Some("SELECT ?".into()),
            ..Default::default()
        };
        let exec_ok = OkPacket { affected_rows: 0, ..Default::default() };
        let exec_response = MySqlResponse {
            packet_types: vec!["Ok".into()],
            messages: vec![Message::Ok(exec_ok)],
            ..Default::default()
        };
        store.insert(Mock::new(MockKind::MySql, exec_request, exec_response, now, now));

        let (mut client, server) = duplex(1 << 16);
        let cancel = CancelSignal::new();
        let engine = ReplayEngine::new(server, store, cancel.clone());
        let handle = tokio::spawn(engine.run());

        let mut reader = MySqlReader::new(&mut client);
        reader.read_packet().await.unwrap();
        drive_past_handshake(&mut client).await;
        reader.read_packet().await.unwrap();

        let (mut reader, mut writer) = split_client_codec(client);
        let mut prepare_payload = vec![crate::packet::COM_STMT_PREPARE];
        prepare_payload.extend_from_slice(b"SELECT ?");
        writer.write_packet(&prepare_payload).await.unwrap();
        let reply = reader.read_packet().await.unwrap();
        let got_ok = StmtPrepareOk::decode(reply.payload).unwrap();
        assert_eq!(got_ok.statement_id, 1);
        assert_eq!(got_ok.num_params, 1);

        let exec = StmtExecute {
            statement_id: got_ok.statement_id,
            cursor_type: 0,
            params: vec![crate::packet::BoundParam {
                    type_code: 0xfd,
                    unsigned: false,
                    value: Some(Bytes::from_static(b"1")),
                }],
        };
        writer.write_packet(&exec.encode()).await.unwrap();
        let reply = reader.read_packet().await.unwrap();
        let ok = OkPacket::decode(reply.payload).unwrap();
        assert_eq!(ok.affected_rows, 0);

        drop(reader);
        drop(writer);
        let _ = cancel;
        let _ = tokio::time::timeout(Duration::from_millis(200), handle).await;
    }

    #[tokio::test]
    async fn falls_back_to_passthrough_when_no_mock_matches() {
        let store: Arc<InMemoryMockStore<MySqlRequest, MySqlResponse>> = Arc::new(InMemoryMockStore::new());
        let (mut client, server) = duplex(1 << 16);
        let (dest_engine_side, mut dest_test_side) = duplex(1 << 16);
        let cancel = CancelSignal::new();
        let engine = ReplayEngine::new(server, store, cancel.clone()).with_passthrough(dest_engine_side);
        let handle = tokio::spawn(engine.run());

        let mut reader = MySqlReader::new(&mut client);
        reader.read_packet().await.unwrap();
        drive_past_handshake(&mut client).await;
        reader.read_packet().await.unwrap();

        let (mut reader, mut writer) = split_client_codec(client);
        let mut query_payload = vec![crate::packet::COM_QUERY];
        query_payload.extend_from_slice(b"select unmatched");
        writer.write_packet(&query_payload).await.unwrap();

        let mut seen = [0u8; 4];
        tokio::io::AsyncReadExt::read_exact(&mut dest_test_side, &mut seen).await.unwrap();
        assert_eq!(&seen[3..4], &[0u8]); // sequence id of the forwarded request packet

        drop(reader);
        drop(writer);
        drop(dest_test_side);
        let _ = tokio::time::timeout(Duration::from_millis(200), handle).await;
    }
}
