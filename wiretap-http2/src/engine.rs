//! The HTTP/2-gRPC protocol engine.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use wiretap_core::error::{Error, Result};
use wiretap_core::matching::match_and_claim;
use wiretap_core::store::MockStore;
use wiretap_core::{CancelSignal, Mock};

use crate::codec::{split_codec, Http2Reader, Http2Writer, MAX_FRAME_SIZE};
use crate::flow_control::FlowControl;
use crate::frame::{flags, is_client_stream, FrameType, RawFrame};
use crate::hpack::{decode_block, encode_block, HpackTable};
use crate::matcher::Http2Predicates;
use crate::message::{Http2Mock, Http2Request};
use crate::settings;
use crate::stream_state::StreamAccumulator;

/// Record mode: tee bytes in both directions, decoding headers/bodies into the
/// accumulator as they pass through, emitting a [`Http2Mock`] whenever the server
/// closes a stream with END_STREAM on its trailers.
pub async fn record_mode<C, S>(
    client: C,
    server: S,
    cancel: CancelSignal,
    sink: mpsc::UnboundedSender<Http2Mock>,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client_reader, client_writer) = split_codec(client);
    let (server_reader, server_writer) = split_codec(server);

    let acc = Arc::new(StreamAccumulator::new());

    let c2s = {
        let acc = acc.clone();
        let cancel = cancel.clone();
        tokio::spawn(tee_client_to_server(client_reader, server_writer, acc, cancel))
    };
    let s2c = {
        let acc = acc.clone();
        tokio::spawn(tee_server_to_client(server_reader, client_writer, acc, cancel, sink))
    };

    let (r1, r2) = tokio::join!(c2s, s2c);
    r1.map_err(|_| Error::Cancelled)??;
    r2.map_err(|_| Error::Cancelled)??;
    Ok(())
}

async fn tee_client_to_server<C, S>(
    mut reader: Http2Reader<C>,
    writer: Http2Writer<S>,
    acc: Arc<StreamAccumulator>,
    cancel: CancelSignal,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut hpack = HpackTable::new();
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let frame = match reader.read_frame().await {
            Ok(f) => f,
            Err(_) => return Ok(()), // peer closed; record mode ends quietly
        };

        if frame.frame_type == FrameType::Headers {
            if !is_client_stream(frame.stream_id) {
                return Err(Error::protocol_violation("even stream id from client"));
            }
            if frame.has_flag(flags::END_HEADERS) {
                if let Ok(pairs) = decode_block(frame.payload.clone(), &mut hpack) {
                    acc.add_request_headers(frame.stream_id, pairs);
                }
            } else {
                tracing::warn!(stream_id = frame.stream_id, "CONTINUATION reassembly unsupported, ignoring");
            }
        } else if frame.frame_type == FrameType::Data {
            acc.add_request_body_chunk(frame.stream_id, &frame.payload);
        }

        writer.write_frame(frame.frame_type, frame.flags, frame.stream_id, &frame.payload).await?;
    }
}

async fn tee_server_to_client<S, C>(
    mut reader: Http2Reader<S>,
    writer: Http2Writer<C>,
    acc: Arc<StreamAccumulator>,
    cancel: CancelSignal,
    sink: mpsc::UnboundedSender<Http2Mock>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: AsyncRead + AsyncWrite + Unpin,
{
    let mut hpack = HpackTable::new();
    let mut seen_headers = std::collections::HashSet::new();
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let frame = match reader.read_frame().await {
            Ok(f) => f,
            Err(_) => return Ok(()),
        };

        if frame.frame_type == FrameType::Headers && frame.has_flag(flags::END_HEADERS) {
            if let Ok(pairs) = decode_block(frame.payload.clone(), &mut hpack) {
                let is_trailers = seen_headers.contains(&frame.stream_id);
                acc.add_response_headers(frame.stream_id, pairs, is_trailers);
                if !is_trailers {
                    seen_headers.insert(frame.stream_id);
                }
                if is_trailers && frame.has_flag(flags::END_STREAM) {
                    if let Some((request, response, req_ts, res_ts)) = acc.take_and_reset(frame.stream_id) {
                        seen_headers.remove(&frame.stream_id);
                        let mock = Mock::new(
                            wiretap_core::MockKind::Http2Grpc,
                            request,
                            response,
                            req_ts,
                            res_ts,
                        );
                        let _ = sink.send(mock);
                    }
                }
            }
        } else if frame.frame_type == FrameType::Data {
            acc.add_response_body_chunk(frame.stream_id, &frame.payload);
        }

        writer.write_frame(frame.frame_type, frame.flags, frame.stream_id, &frame.payload).await?;
    }
}

/// Replay mode: terminate the client, synthesize
/// responses from matched mocks, enforcing this engine's own flow control.
pub struct ReplayEngine<C, St> {
    reader: Http2Reader<C>,
    writer: Http2Writer<C>,
    flow: Arc<FlowControl>,
    acc: Arc<StreamAccumulator>,
    store: Arc<St>,
    cancel: CancelSignal,
    hpack_in: HpackTable,
}

impl<C, St> ReplayEngine<C, St>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    St: MockStore<Http2Request, crate::message::Http2Response> + Send + Sync + 'static,
{
    pub fn new(client: C, store: Arc<St>, cancel: CancelSignal) -> Self {
        let (reader, writer) = split_codec(client);
        Self {
            reader,
            writer,
            flow: Arc::new(FlowControl::new()),
            acc: Arc::new(StreamAccumulator::new()),
            store,
            cancel,
            hpack_in: HpackTable::new(),
        }
    }

    /// Step 1: send initial SETTINGS advertising `MAX_FRAME_SIZE`.
    async fn send_initial_settings(&self) -> Result<()> {
        self.writer
        .write_frame(FrameType::Settings, 0, 0, &settings::encode_initial(MAX_FRAME_SIZE))
        .await
    }

    pub async fn run(mut self) -> Result<()> {
        self.send_initial_settings().await?;

        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let frame = self.reader.read_frame().await?;
            self.handle_frame(frame).await?;
        }
    }

    async fn handle_frame(&mut self, frame: RawFrame) -> Result<()> {
        match frame.frame_type {
            FrameType::Headers => {
                if !is_client_stream(frame.stream_id) {
                    return Err(Error::protocol_violation("even stream id from client"));
                }
                if !frame.has_flag(flags::END_HEADERS) {
                    tracing::warn!(stream_id = frame.stream_id, "CONTINUATION unsupported, ignoring frame");
                    return Ok(());
                }
                let pairs = decode_block(frame.payload.clone(), &mut self.hpack_in)?;
                self.acc.add_request_headers(frame.stream_id, pairs);
                if frame.has_flag(flags::END_STREAM) {
                    self.finish_stream(frame.stream_id).await?;
                }
            }
            FrameType::Data => {
                self.acc.add_request_body_chunk(frame.stream_id, &frame.payload);
                if frame.has_flag(flags::END_STREAM) {
                    self.finish_stream(frame.stream_id).await?;
                }
            }
            FrameType::Ping => {
                if frame.stream_id != 0 {
                    return Err(Error::protocol_violation("PING on non-zero stream"));
                }
                if !frame.has_flag(flags::ACK) {
                    self.writer.write_frame(FrameType::Ping, flags::ACK, 0, &frame.payload).await?;
                }
            }
            FrameType::Settings => {
                if !frame.has_flag(flags::ACK) {
                    let parsed = settings::parse(frame.payload.clone());
                    if let Some(v) = parsed.initial_window_size {
                        self.flow.on_initial_window_size_change(v);
                    }
                    self.writer.write_frame(FrameType::Settings, flags::ACK, 0, &[]).await?;
                }
            }
            FrameType::WindowUpdate => {
                let mut p = frame.payload.clone();
                use bytes::Buf;
                if p.remaining() >= 4 {
                    let increment = p.get_u32() & 0x7fff_ffff;
                    self.flow.on_window_update(frame.stream_id, increment);
                }
            }
            FrameType::RstStream => {
                self.acc.take_and_reset(frame.stream_id);
                self.flow.drop_stream(frame.stream_id);
            }
            FrameType::GoAway | FrameType::Priority | FrameType::PushPromise | FrameType::Continuation => {
                tracing::debug!(frame_type = ?frame.frame_type, "ignoring unsupported frame");
            }
        }
        Ok(())
    }

    /// A request completed (END_STREAM seen); match it and synthesize the response.
    async fn finish_stream(&mut self, stream_id: u32) -> Result<()> {
        let Some(request) = self.acc.fetch_request(stream_id) else {
            return Ok(());
        };
        let mock = match_and_claim(&*self.store, &request, &Http2Predicates).map_err(|e| match e {
            Error::NoMock(_) => Error::no_mock(format!("no mock for stream {stream_id}")),
            other => other,
        })?;

        self.send_response(stream_id, &mock.response).await?;
        self.acc.take_and_reset(stream_id);
        self.flow.drop_stream(stream_id);
        Ok(())
    }

    async fn send_response(&mut self, stream_id: u32, response: &crate::message::Http2Response) -> Result<()> {
        let mut headers: Vec<(String, String)> = response
        .headers
        .pseudo
        .iter()
        .chain(response.headers.ordinary.iter())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
        if !headers.iter().any(|(k, _)| k == ":status") {
            headers.insert(0, (":status".to_string(), "200".to_string()));
        }
        let block = encode_block(&headers);
        self.writer
        .write_frame(FrameType::Headers, flags::END_HEADERS, stream_id, &block)
        .await?;

        if let Some(body) = &response.body {
            let mut wire = Vec::with_capacity(5 + body.payload.len());
            wire.push(body.compression_flag);
            wire.extend_from_slice(&(body.payload.len() as u32).to_be_bytes());
            wire.extend_from_slice(&body.payload);
            self.write_data_flow_controlled(stream_id, Bytes::from(wire)).await?;
        }

        let trailer_pairs: Vec<(String, String)> = response
        .trailers
        .as_ref()
        .map(|t| t.pseudo.iter().chain(t.ordinary.iter()).map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_else(|| vec![("grpc-status".to_string(), "0".to_string())]);
        let trailer_block = encode_block(&trailer_pairs);
        self.writer
        .write_frame(
            FrameType::Headers,
            flags::END_HEADERS | flags::END_STREAM,
            stream_id,
            &trailer_block,
        )
        .await
    }

    /// Splits `payload` into DATA frames no larger than `MAX_FRAME_SIZE`, each gated by
    /// the flow-control credit available at write time. This engine always carries
    /// trailers in a separate HEADERS frame, so no DATA frame here ever sets END_STREAM.
    async fn write_data_flow_controlled(&mut self, stream_id: u32, payload: Bytes) -> Result<()> {
        let mut offset = 0usize;
        let cap = MAX_FRAME_SIZE as usize;
        while offset < payload.len() {
            let remaining = payload.len() - offset;
            let take = remaining.min(cap);
            self.flow.reserve(stream_id, take as u32).await;

            let chunk = payload.slice(offset..offset + take);
            self.writer.write_frame(FrameType::Data, 0, stream_id, &chunk).await?;
            offset += take;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Http2Response;
    use crate::stream_state::GrpcMessage;
    use std::time::SystemTime;
    use tokio::io::duplex;
    use wiretap_core::store::InMemoryMockStore;

    fn unary_mock(req_path: &str, req_body: &'static [u8], resp_body: &'static [u8]) -> Http2Mock {
        let mut request = Http2Request::default();
        request.headers.insert(":path".into(), req_path.into());
        request.headers.insert("content-type".into(), "application/grpc".into());
        request.body = Some(GrpcMessage {
                compression_flag: 0,
                length: req_body.len() as u32,
                payload: Bytes::from_static(req_body),
            });

        let mut response = Http2Response::default();
        response.headers.insert(":status".into(), "200".into());
        response.body = Some(GrpcMessage {
                compression_flag: 0,
                length: resp_body.len() as u32,
                payload: Bytes::from_static(resp_body),
            });
        let mut trailers = crate::message::HeaderSet::default();
        trailers.insert("grpc-status".into(), "0".into());
        response.trailers = Some(trailers);

        let now = SystemTime::now();
        Mock::new(wiretap_core::MockKind::Http2Grpc, request, response, now, now)
    }

    #[tokio::test]
    async fn s1_unary_roundtrip_replays_recorded_response() {
        let store = Arc::new(InMemoryMockStore::new());
        store.insert(unary_mock("/svc.M/Method", b"hello", b"world"));

        let (client, server) = duplex(1 << 16);
        let cancel = CancelSignal::new();
        let engine = ReplayEngine::new(server, store, cancel.clone());
        let handle = tokio::spawn(engine.run());

        let (mut reader, writer) = split_codec(client);

        // Drain the engine's initial SETTINGS.
        let settings_frame = reader.read_frame().await.unwrap();
        assert_eq!(settings_frame.frame_type, FrameType::Settings);

        // Send request HEADERS + DATA with END_STREAM.
        let mut hpack = HpackTable::new();
        let headers = encode_block(&[
                (":path".to_string(), "/svc.M/Method".to_string()),
                ("content-type".to_string(), "application/grpc".to_string()),
            ]);
        writer.write_frame(FrameType::Headers, flags::END_HEADERS, 1, &headers).await.unwrap();
        let mut body = vec![0u8];
        body.extend_from_slice(&5u32.to_be_bytes());
        body.extend_from_slice(b"hello");
        writer.write_frame(FrameType::Data, flags::END_STREAM, 1, &body).await.unwrap();

        let resp_headers_frame = reader.read_frame().await.unwrap();
        assert_eq!(resp_headers_frame.frame_type, FrameType::Headers);
        let decoded = decode_block(resp_headers_frame.payload, &mut hpack).unwrap();
        assert!(decoded.iter().any(|(k, v)| k == ":status" && v == "200"));

        let data_frame = reader.read_frame().await.unwrap();
        assert_eq!(data_frame.frame_type, FrameType::Data);
        assert_eq!(&data_frame.payload[5..], b"world");

        let trailers_frame = reader.read_frame().await.unwrap();
        assert!(trailers_frame.has_flag(flags::END_STREAM));

        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn s2_flow_control_splits_large_response_into_capped_frames() {
        let store = Arc::new(InMemoryMockStore::new());
        let big = vec![b'x'; 10_000];
        store.insert(unary_mock("/svc.M/Stream", b"go", Box::leak(big.into_boxed_slice())));

        let (client, server) = duplex(1 << 20);
        let cancel = CancelSignal::new();
        let engine = ReplayEngine::new(server, store, cancel.clone());
        let handle = tokio::spawn(engine.run());

        let (mut reader, writer) = split_codec(client);
        let _settings = reader.read_frame().await.unwrap();

        let headers = encode_block(&[(":path".to_string(), "/svc.M/Stream".to_string())]);
        writer.write_frame(FrameType::Headers, flags::END_HEADERS, 1, &headers).await.unwrap();
        let mut body = vec![0u8];
        body.extend_from_slice(&2u32.to_be_bytes());
        body.extend_from_slice(b"go");
        writer.write_frame(FrameType::Data, flags::END_STREAM, 1, &body).await.unwrap();

        let _resp_headers = reader.read_frame().await.unwrap();

        let mut total = 0usize;
        let mut frames = 0usize;
        loop {
            let frame = reader.read_frame().await.unwrap();
            if frame.frame_type == FrameType::Headers {
                break; // trailers
            }
            assert!(frame.payload.len() as u32 <= MAX_FRAME_SIZE);
            total += frame.payload.len();
            frames += 1;
        }
        assert_eq!(total, 5 + 10_000); // 5-byte gRPC prefix + body
        assert!(frames >= 2, "10000 bytes at 8KiB frames must split into >1 DATA frame");

        cancel.cancel();
        let _ = handle.await;
    }
}
