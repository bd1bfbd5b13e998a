//! Integration test for the full record -> replay round trip: a live startup handshake
//! and simple query against a fake backend is captured by `record_mode` into a mock, the
//! mock is inserted into a store, and a fresh client connection against `ReplayEngine`
//! gets back the exact recorded response bytes without ever talking to a real backend.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::duplex;
use tokio::sync::mpsc;

use wiretap_core::io::Decode;
use wiretap_core::store::InMemoryMockStore;
use wiretap_core::CancelSignal;
use wiretap_postgres::codec::{
    encode_startup_frame, encode_tagged_frame, split_codec, PgReader, PgWriter, StartupFrame,
    PROTOCOL_VERSION_3,
};
use wiretap_postgres::engine::{record_mode, ReplayEngine};
use wiretap_postgres::packet::{CommandComplete, DataRow, FieldDescription, Query, ReadyForQuery, RowDescription};

fn encode_msg<'en, T: wiretap_core::io::Encode<'en>>(msg: &T) -> Vec<u8> {
    let mut buf = Vec::new();
    msg.encode(&mut buf);
    buf
}

fn startup_params() -> Bytes {
    let mut body = Vec::new();
    body.extend_from_slice(b"user\0alice\0\0");
    Bytes::from(body)
}

#[tokio::test]
async fn record_then_replay_round_trips_a_simple_query() {
    let (test_client, record_client_side) = duplex(1 << 16);
    let (record_server_side, fake_server) = duplex(1 << 16);
    let cancel = CancelSignal::new();
    let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();

    let record_handle = tokio::spawn(record_mode(record_client_side, record_server_side, cancel.clone(), sink_tx));

    // Fake backend: drains the startup handshake, replies with AuthenticationOk and
    // ReadyForQuery, then answers the tee'd query with a row and ReadyForQuery.
    let fake_server_task = tokio::spawn(async move {
            let (mut reader, mut writer) = split_codec(fake_server);

            let startup = reader.read_startup_frame().await.unwrap();
            assert!(matches!(startup, StartupFrame::Startup { version, .. } if version == PROTOCOL_VERSION_3));

            writer
            .write_raw(&encode_msg(&wiretap_postgres::packet::Authentication::Ok))
            .await
            .unwrap();
            writer.write_raw(&encode_msg(&ReadyForQuery { status: b'I' })).await.unwrap();

            let query_frame = reader.read_tagged_frame().await.unwrap();
            assert_eq!(query_frame.tag, b'Q');
            let query = Query::decode(query_frame.payload).unwrap();
            assert_eq!(query.sql, "select 1");

            let row_description = RowDescription {
                fields: vec![FieldDescription {
                        name: "?column?".into(),
                        table_oid: 0,
                        column_id: 0,
                        type_oid: 23,
                        type_size: 4,
                        type_modifier: -1,
                        format: 0,
                    }],
            };
            writer.write_raw(&encode_msg(&row_description)).await.unwrap();
            writer
            .write_raw(&encode_msg(&DataRow { columns: vec![Some(Bytes::from_static(b"1"))] }))
            .await
            .unwrap();
            writer
            .write_raw(&encode_msg(&CommandComplete { tag: "SELECT 1".into() }))
            .await
            .unwrap();
            writer.write_raw(&encode_msg(&ReadyForQuery { status: b'I' })).await.unwrap();
        });

    // Test client drives the "live" startup + query through record_mode.
    let (mut client_reader, mut client_writer) = split_codec(test_client);
    let startup_frame = StartupFrame::Startup { version: PROTOCOL_VERSION_3, params: startup_params() };
    client_writer.write_raw(&encode_startup_frame(&startup_frame)).await.unwrap();

    let _auth_ok = client_reader.read_tagged_frame().await.unwrap();
    let _ready = client_reader.read_tagged_frame().await.unwrap();

    client_writer.write_raw(&encode_msg(&Query { sql: "select 1".into() })).await.unwrap();

    let _row_description = client_reader.read_tagged_frame().await.unwrap();
    let _data_row = client_reader.read_tagged_frame().await.unwrap();
    let _command_complete = client_reader.read_tagged_frame().await.unwrap();
    let _ready2 = client_reader.read_tagged_frame().await.unwrap();

    fake_server_task.await.unwrap();

    let mock = tokio::time::timeout(Duration::from_millis(500), sink_rx.recv())
    .await
    .expect("mock emitted before timeout")
    .expect("sink not closed");
    assert_eq!(mock.request.query.as_ref().map(|q| q.sql.as_str()), Some("select 1"));

    cancel.cancel();
    let _ = record_handle.await;

    // Now replay: a fresh client connection should get back exactly the recorded bytes,
    // with no backend involved at all.
    let store = Arc::new(InMemoryMockStore::new());
    store.insert(mock);

    let (mut replay_client, replay_server) = duplex(1 << 16);
    let replay_cancel = CancelSignal::new();
    let engine = ReplayEngine::new(replay_server, store, replay_cancel.clone());
    let replay_handle = tokio::spawn(engine.run());

    let startup_bytes = encode_startup_frame(&StartupFrame::Startup { version: PROTOCOL_VERSION_3, params: startup_params() });
    {
        let mut writer = PgWriter::new(&mut replay_client);
        writer.write_raw(&startup_bytes).await.unwrap();
    }

    let (mut reader, mut writer) = split_codec(replay_client);
    let auth = reader.read_tagged_frame().await.unwrap();
    assert_eq!(auth.tag, b'R');
    let _param_status_and_key_data_and_ready = {
        let mut last = reader.read_tagged_frame().await.unwrap();
        while last.tag != b'Z' {
            last = reader.read_tagged_frame().await.unwrap();
        }
        last
    };

    writer.write_raw(&encode_msg(&Query { sql: "select 1".into() })).await.unwrap();

    let row_description = reader.read_tagged_frame().await.unwrap();
    assert_eq!(row_description.tag, b'T');
    let data_row = reader.read_tagged_frame().await.unwrap();
    assert_eq!(data_row.tag, b'D');
    let decoded = DataRow::decode(data_row.payload).unwrap();
    assert_eq!(decoded.columns, vec![Some(Bytes::from_static(b"1"))]);
    let command_complete = reader.read_tagged_frame().await.unwrap();
    assert_eq!(command_complete.tag, b'C');
    let ready = reader.read_tagged_frame().await.unwrap();
    assert_eq!(ready.tag, b'Z');

    replay_cancel.cancel();
    let _ = replay_handle.await;
}
