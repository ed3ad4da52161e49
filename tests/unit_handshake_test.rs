mod common;

use bytes::Bytes;
use citrinedb_repl::config::Config;
use citrinedb_repl::core::engine::{SnapshotEngine, SnapshotMetadata};
use citrinedb_repl::core::protocol::{RespFrame, RespFrameCodec};
use citrinedb_repl::core::replication::replication_add_master;
use citrinedb_repl::core::state::master::{MasterLinkState, MasterInfo};
use common::{new_ctx, wait_for, MemoryEngine};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::FramedRead;
use uuid::Uuid;

const R40: &str = "cccccccccccccccccccccccccccccccccccccccc";

struct ScriptedPrimary {
    framed: FramedRead<tokio::net::tcp::OwnedReadHalf, RespFrameCodec>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl ScriptedPrimary {
    async fn accept(listener: &TcpListener) -> Self {
        let (socket, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("timed out waiting for replica to connect")
            .unwrap();
        let (reader, writer) = socket.into_split();
        Self {
            framed: FramedRead::new(reader, RespFrameCodec),
            writer,
        }
    }

    async fn next_cmd(&mut self) -> Vec<String> {
        let frame = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("timed out waiting for handshake command")
            .expect("replica closed the connection")
            .unwrap();
        frame
            .to_argv()
            .unwrap()
            .iter()
            .map(|b| String::from_utf8_lossy(b).to_string())
            .collect()
    }

    async fn reply(&mut self, raw: &str) {
        self.writer.write_all(raw.as_bytes()).await.unwrap();
    }

    async fn send_frame(&mut self, parts: &[&str]) {
        let argv: Vec<Bytes> = parts
            .iter()
            .map(|p| Bytes::copy_from_slice(p.as_bytes()))
            .collect();
        let encoded = RespFrame::from_argv(&argv).encode_to_bytes().unwrap();
        self.writer.write_all(&encoded).await.unwrap();
    }
}

async fn snapshot_bytes(entries: &[(u64, &str, &str)]) -> Bytes {
    let engine = MemoryEngine::new();
    for (db, key, value) in entries {
        engine.set(*db, key, value, 1);
    }
    engine
        .save(SnapshotMetadata {
            repl_id: R40.to_string(),
            repl_offset: 0,
            repl_stream_db: 0,
            mvcc_min: 0,
        })
        .await
        .unwrap()
}

async fn first_master(ctx: &Arc<citrinedb_repl::core::state::ReplContext>) -> Arc<MasterInfo> {
    ctx.masters.lock().await.first().unwrap().clone()
}

// The complete handshake sequence, a sized snapshot transfer, and the live
// command stream with cumulative ACKs.
#[tokio::test]
async fn test_full_handshake_and_sized_transfer() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (ctx, engine) = new_ctx(Config::default());
    replication_add_master(&ctx, "127.0.0.1", port).await.unwrap();
    let mi = first_master(&ctx).await;

    let mut primary = ScriptedPrimary::accept(&listener).await;
    let primary_uuid = Uuid::new_v4();

    assert_eq!(primary.next_cmd().await, vec!["PING"]);
    primary.reply("+PONG\r\n").await;

    let cmd = primary.next_cmd().await;
    assert_eq!(&cmd[..2], &["REPLCONF".to_string(), "uuid".to_string()]);
    assert_eq!(cmd[2], ctx.uuid.to_string());
    primary.reply(&format!("+{primary_uuid}\r\n")).await;

    let cmd = primary.next_cmd().await;
    assert_eq!(&cmd[..2], &["REPLCONF".to_string(), "listening-port".to_string()]);
    primary.reply("+OK\r\n").await;

    let cmd = primary.next_cmd().await;
    assert_eq!(cmd, vec!["REPLCONF", "capa", "eof", "capa", "psync2"]);
    primary.reply("+OK\r\n").await;

    let cmd = primary.next_cmd().await;
    assert_eq!(cmd, vec!["PSYNC", "?", "-1"]);

    let payload = snapshot_bytes(&[(0, "seed", "1")]).await;
    primary.reply(&format!("+FULLRESYNC {R40} 0\r\n")).await;
    primary
        .reply(&format!("${}\r\n", payload.len()))
        .await;
    primary.writer.write_all(&payload).await.unwrap();

    assert!(
        wait_for(|| mi.state() == MasterLinkState::Connected, Duration::from_secs(5)).await
    );
    assert_eq!(engine.get(0, "seed").unwrap().value, "1");
    assert_eq!(ctx.ids.replid(), R40);
    assert_eq!(*mi.master_uuid.lock(), Some(primary_uuid));

    // Live stream: one SET advances the offset by its exact wire length and
    // lands in the keyspace.
    primary.send_frame(&["SET", "x", "42"]).await;
    assert!(
        wait_for(|| engine.get(0, "x").is_some(), Duration::from_secs(5)).await
    );
    let set_len = RespFrame::from_argv(&[
        Bytes::from_static(b"SET"),
        Bytes::from_static(b"x"),
        Bytes::from_static(b"42"),
    ])
    .encoded_len() as u64;
    assert_eq!(mi.reploff(), set_len);

    // The periodic ACK reports the consumed offset.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        assert!(tokio::time::Instant::now() < deadline);
        let cmd = primary.next_cmd().await;
        if cmd.len() == 3 && cmd[0] == "REPLCONF" && cmd[1] == "ACK" {
            if cmd[2] == set_len.to_string() {
                break;
            }
        }
    }
    ctx.shutdown();
}

// AUTH, licence key, announced IP/port, and the activeExpire capability all
// appear in the handshake when configured.
#[tokio::test]
async fn test_handshake_with_all_options() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut config = Config::default();
    config.replication.active_replica = true;
    config.replication.masteruser = Some("repl".to_string());
    config.replication.masterauth = Some("sekret".to_string());
    config.replication.license_key = Some("LK-1234".to_string());
    config.replication.replica_announce_ip = Some("10.0.0.9".to_string());
    config.replication.replica_announce_port = Some(16379);
    let (ctx, _) = new_ctx(config);
    replication_add_master(&ctx, "127.0.0.1", port).await.unwrap();

    let mut primary = ScriptedPrimary::accept(&listener).await;

    assert_eq!(primary.next_cmd().await, vec!["PING"]);
    primary.reply("+PONG\r\n").await;

    assert_eq!(primary.next_cmd().await, vec!["AUTH", "repl", "sekret"]);
    primary.reply("+OK\r\n").await;

    let cmd = primary.next_cmd().await;
    assert_eq!(&cmd[..2], &["REPLCONF".to_string(), "uuid".to_string()]);
    primary.reply(&format!("+{}\r\n", Uuid::new_v4())).await;

    assert_eq!(
        primary.next_cmd().await,
        vec!["REPLCONF", "license", "LK-1234"]
    );
    primary.reply("+OK\r\n").await;

    assert_eq!(
        primary.next_cmd().await,
        vec!["REPLCONF", "listening-port", "16379"]
    );
    primary.reply("+OK\r\n").await;

    assert_eq!(
        primary.next_cmd().await,
        vec!["REPLCONF", "ip-address", "10.0.0.9"]
    );
    primary.reply("+OK\r\n").await;

    assert_eq!(
        primary.next_cmd().await,
        vec!["REPLCONF", "capa", "eof", "capa", "psync2", "capa", "activeExpire"]
    );
    primary.reply("+OK\r\n").await;

    // Active replicas always ask for a full history.
    assert_eq!(primary.next_cmd().await, vec!["PSYNC", "?", "-1"]);
    ctx.shutdown();
}

// The diskless EOF-marked framing: payload bytes bounded by a trailing
// 40-char nonce, which must not end up in the loaded dataset.
#[tokio::test]
async fn test_eof_marked_transfer() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (ctx, engine) = new_ctx(Config::default());
    replication_add_master(&ctx, "127.0.0.1", port).await.unwrap();
    let mi = first_master(&ctx).await;

    let mut primary = ScriptedPrimary::accept(&listener).await;
    for _ in 0..4 {
        // PING, uuid, listening-port, capa.
        let cmd = primary.next_cmd().await;
        if cmd[0] == "PING" {
            primary.reply("+PONG\r\n").await;
        } else if cmd[1] == "uuid" {
            primary.reply(&format!("+{}\r\n", Uuid::new_v4())).await;
        } else {
            primary.reply("+OK\r\n").await;
        }
    }
    assert_eq!(primary.next_cmd().await[0], "PSYNC");

    let payload = snapshot_bytes(&[(0, "streamed", "yes")]).await;
    let nonce = "f".repeat(40);
    primary.reply(&format!("+FULLRESYNC {R40} 0\r\n")).await;
    primary.reply(&format!("$EOF:{nonce}\r\n")).await;
    // Payload and marker in a single write: the marker is found as the
    // stream's own suffix and only the trailing 40 bytes are truncated.
    let mut stream = payload.to_vec();
    stream.extend_from_slice(nonce.as_bytes());
    primary.writer.write_all(&stream).await.unwrap();

    assert!(
        wait_for(|| mi.state() == MasterLinkState::Connected, Duration::from_secs(5)).await
    );
    assert_eq!(engine.get(0, "streamed").unwrap().value, "yes");
    ctx.shutdown();
}

// A transient -LOADING reply makes the replica retry the whole cycle.
#[tokio::test]
async fn test_loading_reply_triggers_retry() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (ctx, _) = new_ctx(Config::default());
    replication_add_master(&ctx, "127.0.0.1", port).await.unwrap();
    let mi = first_master(&ctx).await;

    let mut primary = ScriptedPrimary::accept(&listener).await;
    loop {
        let cmd = primary.next_cmd().await;
        match cmd[0].as_str() {
            "PING" => primary.reply("+PONG\r\n").await,
            "REPLCONF" if cmd[1] == "uuid" => {
                primary.reply(&format!("+{}\r\n", Uuid::new_v4())).await;
            }
            "REPLCONF" => primary.reply("+OK\r\n").await,
            "PSYNC" => {
                primary.reply("-LOADING CitrineDB is loading the dataset in memory\r\n").await;
                break;
            }
            other => panic!("unexpected command {other}"),
        }
    }
    drop(primary);

    // The worker backs off briefly, then reconnects from scratch.
    let second = ScriptedPrimary::accept(&listener).await;
    assert_ne!(mi.state(), MasterLinkState::Connected);
    drop(second);
    ctx.shutdown();
}

// Self-synthesized cached master: an instance demoted by REPLICAOF offers its
// own history, and a +CONTINUE with a different id shifts the local lineage.
#[tokio::test]
async fn test_demoted_primary_resumes_with_continue() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (ctx, _) = new_ctx(Config::default());
    let old_replid = ctx.ids.replid();
    ctx.backlog.create(16 * 1024).await;
    ctx.backlog.feed(&[1u8; 250]).await;
    assert_eq!(ctx.master_offset(), 250);

    // Was a primary until now: the cached master is synthesized from our own
    // id and offset.
    replication_add_master(&ctx, "127.0.0.1", port).await.unwrap();
    let mi = first_master(&ctx).await;
    assert!(mi.cached_master.lock().is_some());

    let mut primary = ScriptedPrimary::accept(&listener).await;
    loop {
        let cmd = primary.next_cmd().await;
        match cmd[0].as_str() {
            "PING" => primary.reply("+PONG\r\n").await,
            "REPLCONF" if cmd[1] == "uuid" => {
                primary.reply(&format!("+{}\r\n", Uuid::new_v4())).await;
            }
            "REPLCONF" => primary.reply("+OK\r\n").await,
            "PSYNC" => {
                // Our own history, from the first byte we do not have.
                assert_eq!(cmd[1], old_replid);
                assert_eq!(cmd[2], "251");
                let new_id = "d".repeat(40);
                primary.reply(&format!("+CONTINUE {new_id}\r\n")).await;
                break;
            }
            other => panic!("unexpected command {other}"),
        }
    }

    assert!(
        wait_for(|| mi.state() == MasterLinkState::Connected, Duration::from_secs(5)).await
    );
    // The new lineage is adopted; the old one survives as the secondary up to
    // the promotion offset.
    assert_eq!(ctx.ids.replid(), "d".repeat(40));
    assert_eq!(ctx.ids.replid2(), old_replid);
    assert_eq!(ctx.ids.second_replid_offset(), 251);
    assert_eq!(mi.reploff(), 250);
    ctx.shutdown();
}

// cancel_replication_handshake is idempotent and a no-op outside handshake
// and transfer states.
#[tokio::test]
async fn test_cancel_handshake_is_idempotent() {
    let mi = MasterInfo::new(1, "127.0.0.1".to_string(), 6379);

    // Nothing in progress: a no-op.
    assert!(!mi.cancel_replication_handshake());
    assert_eq!(mi.state(), MasterLinkState::Connect);

    // Mid-transfer: the temp file is removed and the state resets.
    let tmp = std::env::temp_dir().join(format!("citrine-cancel-test-{}", std::process::id()));
    std::fs::write(&tmp, b"partial").unwrap();
    *mi.transfer_tmpfile.lock() = Some(tmp.clone());
    mi.set_state(MasterLinkState::Transfer);

    assert!(mi.cancel_replication_handshake());
    assert_eq!(mi.state(), MasterLinkState::Connect);
    assert!(!tmp.exists());

    // Calling it again changes nothing.
    assert!(!mi.cancel_replication_handshake());
    assert_eq!(mi.state(), MasterLinkState::Connect);
}
