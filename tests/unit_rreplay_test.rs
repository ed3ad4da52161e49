mod common;

use bytes::{Bytes, BytesMut};
use citrinedb_repl::core::protocol::{RespFrame, RespFrameCodec};
use citrinedb_repl::core::replication::active::{
    replica_replay, wrap_rreplay, MvccClock, RreplayEnvelope,
};
use citrinedb_repl::core::state::master::MasterInfo;
use common::{active_config, new_ctx};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_util::codec::Decoder;
use uuid::Uuid;

fn encoded_command(parts: &[&str]) -> Bytes {
    let argv: Vec<Bytes> = parts
        .iter()
        .map(|p| Bytes::copy_from_slice(p.as_bytes()))
        .collect();
    RespFrame::from_argv(&argv).encode_to_bytes().unwrap()
}

#[test]
fn test_mvcc_clock_is_strictly_monotonic() {
    let clock = MvccClock::new();
    let mut last = 0;
    for _ in 0..10_000 {
        let next = clock.next();
        assert!(next > last);
        last = next;
    }
    assert_eq!(clock.latest(), last);

    clock.witness(last + 1_000_000);
    assert!(clock.next() > last + 1_000_000);
}

#[test]
fn test_envelope_wire_layout_roundtrip() {
    let source = Uuid::new_v4();
    let payload = encoded_command(&["SET", "k", "v"]);
    let wire = wrap_rreplay(&source, &payload, 3, 12345);

    let mut buf = BytesMut::from(&wire[..]);
    let frame = RespFrameCodec.decode(&mut buf).unwrap().unwrap();
    let argv = frame.to_argv().unwrap();
    assert_eq!(argv.len(), 5);
    assert_eq!(&argv[0][..], b"RREPLAY");

    let envelope = RreplayEnvelope::parse(&argv, 0).unwrap();
    assert_eq!(envelope.source_uuid, source);
    assert_eq!(envelope.payload, payload);
    assert_eq!(envelope.db, 3);
    assert_eq!(envelope.mvcc, 12345);

    // Encoding the parsed form again reproduces the identical wire bytes.
    let reencoded = RespFrame::from_argv(&envelope.to_argv())
        .encode_to_bytes()
        .unwrap();
    assert_eq!(reencoded, wire);
}

#[test]
fn test_envelope_parse_accepts_short_forms() {
    let source = Uuid::new_v4();
    let argv = vec![
        Bytes::from_static(b"RREPLAY"),
        Bytes::from(source.to_string()),
        encoded_command(&["SET", "a", "b"]),
    ];
    let envelope = RreplayEnvelope::parse(&argv, 9).unwrap();
    assert_eq!(envelope.db, 9);
    assert_eq!(envelope.mvcc, 0);
}

#[test]
fn test_envelope_parse_rejects_bad_uuid() {
    let argv = vec![
        Bytes::from_static(b"RREPLAY"),
        Bytes::from_static(b"not-a-uuid"),
        encoded_command(&["SET", "a", "b"]),
    ];
    assert!(RreplayEnvelope::parse(&argv, 0).is_err());
}

#[tokio::test]
async fn test_self_originated_envelope_is_never_applied() {
    let (ctx, engine) = new_ctx(active_config());
    let mi = Arc::new(MasterInfo::new(1, "127.0.0.1".to_string(), 6379));

    let payload = encoded_command(&["SET", "k", "v"]);
    let wire_argv = RreplayEnvelope {
        source_uuid: ctx.uuid,
        payload,
        db: 0,
        mvcc: 777,
    }
    .to_argv();

    replica_replay(&ctx, &mi, &wire_argv, 0).await.unwrap();
    assert_eq!(engine.applied_count(), 0);
    assert_eq!(mi.mvcc_last_sync.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_foreign_envelope_applies_and_repropagates() {
    let (ctx, engine) = new_ctx(active_config());
    ctx.backlog.create(16 * 1024).await;
    let mi = Arc::new(MasterInfo::new(1, "127.0.0.1".to_string(), 6379));

    let source = Uuid::new_v4();
    let payload = encoded_command(&["SET", "k", "v"]);
    let envelope = RreplayEnvelope {
        source_uuid: source,
        payload,
        db: 5,
        mvcc: 4242,
    };

    replica_replay(&ctx, &mi, &envelope.to_argv(), 0).await.unwrap();

    // Applied to the keyspace with the envelope's database.
    let applied = engine.applied();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].0, 5);
    assert_eq!(mi.mvcc_last_sync.load(Ordering::SeqCst), 4242);

    // Re-published with the original source UUID, not ours.
    let stream = ctx.backlog.read_range(1).await.unwrap();
    let mut buf = BytesMut::from(&stream[..]);
    let frame = RespFrameCodec.decode(&mut buf).unwrap().unwrap();
    let argv = frame.to_argv().unwrap();
    let republished = RreplayEnvelope::parse(&argv, 0).unwrap();
    assert_eq!(republished.source_uuid, source);
    assert_eq!(republished.mvcc, 4242);
}

#[tokio::test]
async fn test_payload_with_select_switches_db() {
    let (ctx, engine) = new_ctx(active_config());
    let mi = Arc::new(MasterInfo::new(1, "127.0.0.1".to_string(), 6379));

    let mut payload = BytesMut::new();
    payload.extend_from_slice(&encoded_command(&["SELECT", "8"]));
    payload.extend_from_slice(&encoded_command(&["SET", "k", "v"]));
    let envelope = RreplayEnvelope {
        source_uuid: Uuid::new_v4(),
        payload: payload.freeze(),
        db: 0,
        mvcc: 1,
    };

    replica_replay(&ctx, &mi, &envelope.to_argv(), 0).await.unwrap();
    let applied = engine.applied();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].0, 8);
}
