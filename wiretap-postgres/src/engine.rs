//! The Postgres protocol engine.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use wiretap_core::error::{Error, Result};
use wiretap_core::io::{Decode, Encode};
use wiretap_core::matching::match_and_claim;
use wiretap_core::mock::MockKind;
use wiretap_core::store::MockStore;
use wiretap_core::{CancelSignal, Mock};

use crate::codec::{encode_startup_frame, encode_tagged_frame, split_codec, PgReader, PgWriter, StartupFrame};
use crate::matcher::PgPredicates;
use crate::message::PgMock;
use crate::packet::{
    Authentication, BackendKeyData, CommandComplete, DataRow, ParameterStatus, PgRequest,
    PgResponse, ReadyForQuery, RowDescription,
};
use crate::session::{PreparedStatements, RequestBuilder};

/// A connection is considered to have finished sending one "request bundle" once this
/// much time passes with nothing new to read.
const BUNDLE_INACTIVITY_WINDOW: Duration = Duration::from_millis(10);

const SYNTHETIC_SALT: [u8; 4] = [0x5a, 0x5a, 0x5a, 0x5a];

/// Canonical startup parameters a recorded session's live replay wouldn't have a real
/// backend to supply; a fixed, uncontroversial set is sent regardless of what the
/// original server reported.
const DEFAULT_PARAMETER_STATUS: &[(&str, &str)] = &[
    ("server_version", "13.4"),
    ("server_encoding", "UTF8"),
    ("client_encoding", "UTF8"),
    ("DateStyle", "ISO, MDY"),
    ("TimeZone", "UTC"),
    ("standard_conforming_strings", "on"),
    ("integer_datetimes", "on"),
];

fn encode_msg<'en, T: Encode<'en>>(msg: &T) -> Vec<u8> {
    let mut buf = Vec::new();
    msg.encode(&mut buf);
    buf
}

/// What this connection's startup handshake should present to the live client, derived
/// from what was recorded (SCRAM→MD5 rewrite: `Md5` covers both an
/// originally-MD5 and an originally-SCRAM recording, since replay mode has no real
/// backend to run SCRAM's multi-round exchange against).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordedAuth {
    #[default]
    Ok,
    Md5,
}

impl RecordedAuth {
    /// Classifies the `auth` metadata tag record mode attaches to a mock (`"md5"`,
    /// `"scram"`, or absent/`"ok"`).
    pub fn from_label(label: Option<&str>) -> Self {
        match label {
            Some("md5") | Some("scram") => RecordedAuth::Md5,
            _ => RecordedAuth::Ok,
        }
    }
}

fn response_tag_name(tag: u8) -> &'static str {
    match tag {
        b'R' => "Authentication",
        b'S' => "ParameterStatus",
        b'K' => "BackendKeyData",
        b'Z' => "ReadyForQuery",
        b'T' => "RowDescription",
        b'D' => "DataRow",
        b'C' => "CommandComplete",
        b'E' => "ErrorResponse",
        b'N' => "NoticeResponse",
        _ => "Unknown",
    }
}

/// Record mode: tee bytes in both directions, merge each side's wire
/// messages into a bundle the same way replay mode would, and flush a mock whenever the
/// server closes a response with `ReadyForQuery` and a pending request is waiting for
/// it. The client's untagged startup/SSL negotiation is forwarded but never folded into
/// a mock; the server's `Authentication` reply is remembered as `auth` metadata so a
/// later replay knows which startup rewrite to perform.
pub async fn record_mode<C, S>(
    client: C,
    server: S,
    cancel: CancelSignal,
    sink: mpsc::UnboundedSender<PgMock>,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client_reader, client_writer) = split_codec(client);
    let (server_reader, server_writer) = split_codec(server);

    let pending: Arc<Mutex<VecDeque<(PgRequest, SystemTime)>>> = Arc::new(Mutex::new(VecDeque::new()));
    let auth_label: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    // Signals one `()` per SSLRequest/GssEncRequest forwarded during startup, so the
    // server-side task knows to read a single raw ack byte rather than a tagged frame
    //. This
    // assumes the recorded connection never actually upgrades to TLS with the real
    // backend — record mode cannot tee a TLS handshake it isn't a party to.
    let (ssl_ack_tx, ssl_ack_rx) = mpsc::unbounded_channel::<()>();

    let c2s = {
        let pending = pending.clone();
        let cancel = cancel.clone();
        tokio::spawn(tee_client_to_server(client_reader, server_writer, pending, ssl_ack_tx, cancel))
    };
    let s2c = {
        tokio::spawn(tee_server_to_client(
                server_reader,
                client_writer,
                pending,
                auth_label,
                ssl_ack_rx,
                cancel,
                sink,
            ))
    };

    let (r1, r2) = tokio::join!(c2s, s2c);
    r1.map_err(|_| Error::Cancelled)??;
    r2.map_err(|_| Error::Cancelled)??;
    Ok(())
}

async fn tee_client_to_server<C, S>(
    mut reader: PgReader<ReadHalf<C>>,
    mut writer: PgWriter<WriteHalf<S>>,
    pending: Arc<Mutex<VecDeque<(PgRequest, SystemTime)>>>,
    ssl_ack_tx: mpsc::UnboundedSender<()>,
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
        let frame = match reader.read_startup_frame().await {
            Ok(f) => f,
            Err(_) => return Ok(()),
        };
        let is_startup = matches!(frame, StartupFrame::Startup { .. });
        writer.write_raw(&encode_startup_frame(&frame)).await?;
        if is_startup {
            break;
        }
        let _ = ssl_ack_tx.send(());
    }
    // No more acks are coming; dropping the sender lets the server-side task's ack
    // drain loop observe channel closure once it has read every signalled byte.
    drop(ssl_ack_tx);

    let mut ps = PreparedStatements::new();
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut builder = RequestBuilder::new();
        let first = match reader.read_tagged_frame().await {
            Ok(f) => f,
            Err(_) => return Ok(()),
        };
        let req_ts = SystemTime::now();
        writer.write_raw(&encode_tagged_frame(&first)).await?;
        builder.push_frame(&first, &mut ps)?;

        loop {
            match tokio::time::timeout(BUNDLE_INACTIVITY_WINDOW, reader.read_tagged_frame()).await {
                Ok(Ok(frame)) => {
                    writer.write_raw(&encode_tagged_frame(&frame)).await?;
                    builder.push_frame(&frame, &mut ps)?;
                }
                Ok(Err(_)) => return Ok(()),
                Err(_elapsed) => break,
            }
        }
        pending.lock().push_back((builder.finish(&ps), req_ts));
    }
}

async fn tee_server_to_client<S, C>(
    mut reader: PgReader<ReadHalf<S>>,
    mut writer: PgWriter<WriteHalf<C>>,
    pending: Arc<Mutex<VecDeque<(PgRequest, SystemTime)>>>,
    auth_label: Arc<Mutex<Option<String>>>,
    mut ssl_ack_rx: mpsc::UnboundedReceiver<()>,
    cancel: CancelSignal,
    sink: mpsc::UnboundedSender<PgMock>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: AsyncRead + AsyncWrite + Unpin,
{
    // Mirror the client-side task's startup loop: every SSLRequest/GssEncRequest it
    // forwarded gets exactly one raw ack byte back from the real backend, framed as
    // neither a tagged nor a startup message.
    while ssl_ack_rx.recv().await.is_some() {
        let ack = reader.read_raw(1).await?;
        writer.write_raw(&ack).await?;
    }

    let mut resp = PgResponse::default();
    let mut resp_payload: Vec<u8> = Vec::new();

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let frame = match reader.read_tagged_frame().await {
            Ok(f) => f,
            Err(_) => return Ok(()),
        };
        let wire = encode_tagged_frame(&frame);
        writer.write_raw(&wire).await?;

        resp.packet_types.push(response_tag_name(frame.tag).to_string());
        resp_payload.extend_from_slice(&wire);

        match frame.tag {
            b'R' => {
                if let Ok(auth) = Authentication::decode(frame.payload.clone()) {
                    let label = if auth.is_scram() {
                        "scram"
                    } else if matches!(auth, Authentication::Md5Password { .. }) {
                        "md5"
                    } else {
                        "ok"
                    };
                    *auth_label.lock() = Some(label.to_string());
                    resp.authentication.push(auth);
                }
            }
            b'S' => {
                if let Ok(param) = ParameterStatus::decode(frame.payload.clone()) {
                    resp.parameter_status.push(param);
                }
            }
            b'C' => {
                if let Ok(cc) = CommandComplete::decode(frame.payload.clone()) {
                    resp.command_complete.push(cc);
                }
            }
            b'T' => {
                if let Ok(rd) = RowDescription::decode(frame.payload.clone()) {
                    resp.row_description = Some(rd);
                }
            }
            b'D' => {
                if let Ok(dr) = DataRow::decode(frame.payload.clone()) {
                    resp.data_row.push(dr);
                }
            }
            b'Z' => {
                if let Ok(rfq) = ReadyForQuery::decode(frame.payload.clone()) {
                    resp.ready_for_query = Some(rfq);
                }
                resp.payload = Bytes::from(std::mem::take(&mut resp_payload));
                let finished = std::mem::replace(&mut resp, PgResponse::default());
                let res_ts = SystemTime::now();
                if let Some((request, req_ts)) = pending.lock().pop_front() {
                    let mut mock = Mock::new(MockKind::Postgres, request, finished, req_ts, res_ts);
                    if let Some(label) = auth_label.lock().clone() {
                        mock = mock.with_metadata("auth", label);
                    }
                    let _ = sink.send(mock);
                }
            }
            _ => {}
        }
    }
}

/// Re-encodes a response from its structured form, used only when `resp.payload` is
/// empty (, option (b)); the common case is (a), writing the recorded raw
/// bytes verbatim.
fn synthesize_response(resp: &PgResponse) -> Vec<u8> {
    if !resp.payload.is_empty() {
        return resp.payload.to_vec();
    }
    let mut out = Vec::new();
    let mut command_complete = resp.command_complete.iter();
    let mut data_row = resp.data_row.iter();
    let mut authentication = resp.authentication.iter();
    let mut parameter_status = resp.parameter_status.iter();
    for ty in &resp.packet_types {
        match ty.as_str() {
            "CommandComplete" => {
                if let Some(cc) = command_complete.next() {
                    cc.encode(&mut out);
                }
            }
            "DataRow" => {
                if let Some(dr) = data_row.next() {
                    dr.encode(&mut out);
                }
            }
            "RowDescription" => {
                if let Some(rd) = &resp.row_description {
                    rd.encode(&mut out);
                }
            }
            "ParameterStatus" => {
                if let Some(ps) = parameter_status.next() {
                    ps.encode(&mut out);
                }
            }
            "ReadyForQuery" => {
                if let Some(rfq) = &resp.ready_for_query {
                    rfq.encode(&mut out);
                }
            }
            "Authentication" => {
                if let Some(a) = authentication.next() {
                    a.encode(&mut out);
                }
            }
            _ => {}
        }
    }
    out
}

/// Anything a no-mock fallback can proxy bytes to ("connect to the
/// configured destination, proxy bytes"). Connection bootstrap mechanics are out of
/// scope; this only needs an already-connected duplex stream.
pub trait PassthroughDest: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> PassthroughDest for T {}

/// Replay mode: terminate the client, synthesize responses from matched
/// mocks, and fall back to passthrough when nothing matches.
pub struct ReplayEngine<C, St> {
    reader: PgReader<ReadHalf<C>>,
    writer: PgWriter<WriteHalf<C>>,
    store: Arc<St>,
    cancel: CancelSignal,
    auth: RecordedAuth,
    ps: PreparedStatements,
    passthrough: Option<Box<dyn PassthroughDest>>,
}

impl<C, St> ReplayEngine<C, St>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    St: MockStore<PgRequest, PgResponse> + Send + Sync + 'static,
{
    pub fn new(client: C, store: Arc<St>, cancel: CancelSignal) -> Self {
        let (reader, writer) = split_codec(client);
        Self {
            reader,
            writer,
            store,
            cancel,
            auth: RecordedAuth::Ok,
            ps: PreparedStatements::new(),
            passthrough: None,
        }
    }

    pub fn with_auth(mut self, auth: RecordedAuth) -> Self {
        self.auth = auth;
        self
    }

    /// Configures the destination this engine proxies to when no mock matches a
    /// completed request bundle. Without one, a `NoMock` miss is a fatal
    /// error for the connection instead, mirroring the HTTP/2 engine's failure policy.
    pub fn with_passthrough<D>(mut self, dest: D) -> Self
    where
        D: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.passthrough = Some(Box::new(dest));
        self
    }

    pub async fn run(mut self) -> Result<()> {
        self.handle_startup_handshake().await?;

        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let Some(request) = self.read_bundle().await? else {
                return Ok(());
            };

            match match_and_claim::<PgRequest, PgResponse, St>(&self.store, &request, &PgPredicates) {
                Ok(mock) => self.send_response(&mock.response).await?,
                Err(Error::NoMock(_)) => {
                    tracing::warn!(
                        payload = %wiretap_core::preview::BytePreview(&request.payload),
                        "no mock matched postgres request bundle, falling back to passthrough"
                    );
                    return self.passthrough_fallback(request.payload.clone()).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn handle_startup_handshake(&mut self) -> Result<()> {
        loop {
            let frame = self.reader.read_startup_frame().await?;
            match frame {
                StartupFrame::SslRequest | StartupFrame::GssEncRequest => {
                    self.writer.write_byte(b'N').await?;
                }
                StartupFrame::CancelRequest { .. } => {
                    return Err(Error::protocol_violation("cancel request not supported in replay mode"));
                }
                StartupFrame::Startup { .. } => {
                    self.send_auth_sequence().await?;
                    return Ok(());
                }
            }
        }
    }

    /// Sends the authentication challenge (rewritten to MD5 if the recording used
    /// SCRAM), accepts the client's password unconditionally (there is no real backend
    /// to verify it against), then the canonical post-auth sequence.
    async fn send_auth_sequence(&mut self) -> Result<()> {
        match self.auth {
            RecordedAuth::Ok => {
                self.writer.write_raw(&encode_msg(&Authentication::Ok)).await?;
            }
            RecordedAuth::Md5 => {
                self.writer
                .write_raw(&encode_msg(&Authentication::Md5Password { salt: SYNTHETIC_SALT }))
                .await?;
                let _ = self.reader.read_tagged_frame().await?;
                self.writer.write_raw(&encode_msg(&Authentication::Ok)).await?;
            }
        }

        for (name, value) in DEFAULT_PARAMETER_STATUS {
            let param = ParameterStatus { name: name.to_string(), value: value.to_string() };
            self.writer.write_raw(&encode_msg(&param)).await?;
        }
        self.writer
        .write_raw(&encode_msg(&BackendKeyData { process_id: 0, secret_key: 0 }))
        .await?;
        self.writer.write_raw(&encode_msg(&ReadyForQuery { status: b'I' })).await
    }

    /// Reads one request bundle: the first tagged frame blocks indefinitely, then
    /// subsequent frames are read with a 10ms timeout — elapsing it closes the bundle
    ///.
    async fn read_bundle(&mut self) -> Result<Option<PgRequest>> {
        let mut builder = RequestBuilder::new();
        let first = match self.reader.read_tagged_frame().await {
            Ok(f) => f,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        };
        builder.push_frame(&first, &mut self.ps)?;

        loop {
            match tokio::time::timeout(BUNDLE_INACTIVITY_WINDOW, self.reader.read_tagged_frame()).await {
                Ok(Ok(frame)) => builder.push_frame(&frame, &mut self.ps)?,
                Ok(Err(Error::Io(e))) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Ok(Err(e)) => return Err(e),
                Err(_elapsed) => break,
            }
        }
        Ok(Some(builder.finish(&self.ps)))
    }

    async fn send_response(&mut self, response: &PgResponse) -> Result<()> {
        let bytes = synthesize_response(response);
        self.writer.write_raw(&bytes).await
    }

    /// Hands the rest of this connection off to raw byte-copy passthrough: the
    /// unmatched bundle's bytes go first, then whatever was already buffered but
    /// unread, then a bidirectional splice for the remainder of the connection's
    /// lifetime.
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
