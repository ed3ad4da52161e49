mod common;

use bytes::Bytes;
use citrinedb_repl::config::Config;
use citrinedb_repl::core::commands::wait::Wait;
use citrinedb_repl::core::events::WriteEvent;
use citrinedb_repl::core::protocol::RespFrame;
use citrinedb_repl::core::replication::primary::{SyncRequest, SyncSession};
use citrinedb_repl::core::replication::{
    replication_add_master, replication_unset_masters, setup_replication,
};
use citrinedb_repl::core::state::master::MasterLinkState;
use citrinedb_repl::core::state::replica::{ReplicaAttrs, ReplicaCapa, ReplicaDirective};
use common::{new_ctx, test_addr, wait_for, TestPrimary};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};

fn argv(parts: &[&str]) -> Vec<Bytes> {
    parts
        .iter()
        .map(|p| Bytes::copy_from_slice(p.as_bytes()))
        .collect()
}

// The whole link, end to end: full sync, live replication through the event
// bus, WAIT acknowledgement, a transient disconnect resumed with +CONTINUE,
// and a chained sub-replica fed the identical stream.
#[tokio::test]
async fn test_full_replication_lifecycle() {
    // A long ping period keeps the scripted stream deterministic.
    let mut primary_config = Config::default();
    primary_config.replication.repl_ping_replica_period = 1000;
    let primary = TestPrimary::spawn(primary_config).await;
    primary.engine.set(0, "seed", "1", 1);
    setup_replication(&primary.ctx).await;

    // --- Full sync ---
    let (replica_ctx, replica_engine) = new_ctx(Config::default());
    replication_add_master(&replica_ctx, "127.0.0.1", primary.addr.port())
        .await
        .unwrap();
    let mi = replica_ctx.masters.lock().await.first().unwrap().clone();

    assert!(
        wait_for(|| mi.state() == MasterLinkState::Connected, Duration::from_secs(10)).await
    );
    assert!(
        wait_for(|| replica_engine.get(0, "seed").is_some(), Duration::from_secs(5)).await
    );
    // After a full resync the replica mirrors the primary's lineage.
    assert_eq!(replica_ctx.ids.replid(), primary.ctx.ids.replid());
    assert!(matches!(
        primary.sync_requests.lock().first(),
        Some(SyncRequest::Psync { replid, offset })
            if replid.as_str() == "?" && offset.as_str() == "-1"
    ));

    // --- Live replication ---
    primary.ctx.event_bus.publish(WriteEvent {
        db: 0,
        argv: argv(&["SET", "x", "9"]),
        origin: None,
    });
    assert!(
        wait_for(|| replica_engine.get(0, "x").is_some(), Duration::from_secs(5)).await
    );
    assert_eq!(replica_engine.get(0, "x").unwrap().value, "9");

    // --- WAIT sees the replica's acknowledgement ---
    let reply = Wait {
        num_replicas: 1,
        timeout_ms: 5000,
    }
    .execute(&primary.ctx, primary.ctx.master_offset())
    .await
    .unwrap();
    assert_eq!(reply, RespFrame::Integer(1));

    // --- Chained sub-replica: fed the raw upstream stream, not re-encoded ---
    let sub_offset_start = replica_ctx.master_offset();
    let (server_end, client_end) = tokio::io::duplex(64 * 1024);
    let sub_attrs = ReplicaAttrs {
        capa: Some(ReplicaCapa::EOF | ReplicaCapa::PSYNC2),
        ..ReplicaAttrs::default()
    };
    let session = SyncSession::new(replica_ctx.clone(), test_addr(), server_end, sub_attrs);
    tokio::spawn(session.run(
        SyncRequest::Psync {
            replid: replica_ctx.ids.replid(),
            offset: (sub_offset_start + 1).to_string(),
        },
        replica_ctx.subscribe_shutdown(),
    ));
    let (sub_reader, _sub_writer) = tokio::io::split(client_end);
    let mut sub_reader = BufReader::new(sub_reader);
    let mut line = String::new();
    sub_reader.read_line(&mut line).await.unwrap();
    assert!(line.starts_with("+CONTINUE"));

    let wire_before = primary.ctx.master_offset();
    primary.ctx.event_bus.publish(WriteEvent {
        db: 0,
        argv: argv(&["SET", "chained", "yes"]),
        origin: None,
    });
    assert!(
        wait_for(|| replica_engine.get(0, "chained").is_some(), Duration::from_secs(5)).await
    );
    let wire_len = (primary.ctx.master_offset() - wire_before) as usize;

    // The replica's offset advances in lock-step with the primary's, and the
    // sub-replica receives the identical bytes.
    assert!(
        wait_for(
            || replica_ctx.master_offset() == primary.ctx.master_offset(),
            Duration::from_secs(5),
        )
        .await
    );
    let expected = primary
        .ctx
        .backlog
        .read_range(wire_before + 1)
        .await
        .unwrap();
    let mut forwarded = vec![0u8; wire_len];
    tokio::time::timeout(Duration::from_secs(5), sub_reader.read_exact(&mut forwarded))
        .await
        .expect("sub-replica did not receive the proxied stream")
        .unwrap();
    assert_eq!(&forwarded[..], &expected[..]);

    // --- Transient disconnect: the reconnect resumes with +CONTINUE ---
    let served_before = primary.sync_requests.lock().len();
    for entry in primary.ctx.replicas.iter() {
        entry
            .value()
            .send_directive(ReplicaDirective::Close { reason: None });
    }
    assert!(
        wait_for(
            || primary.sync_requests.lock().len() > served_before,
            Duration::from_secs(10),
        )
        .await
    );
    {
        let requests = primary.sync_requests.lock();
        let last = requests.last().unwrap().clone();
        match last {
            SyncRequest::Psync { replid, offset } => {
                assert_eq!(replid, primary.ctx.ids.replid());
                let offset: u64 = offset.parse().unwrap();
                assert!(offset <= primary.ctx.master_offset() + 1);
            }
            SyncRequest::Sync => panic!("reconnect fell back to legacy SYNC"),
        }
    }
    assert!(
        wait_for(|| mi.state() == MasterLinkState::Connected, Duration::from_secs(10)).await
    );

    // Replication still works after the resume.
    primary.ctx.event_bus.publish(WriteEvent {
        db: 0,
        argv: argv(&["SET", "resumed", "1"]),
        origin: None,
    });
    assert!(
        wait_for(|| replica_engine.get(0, "resumed").is_some(), Duration::from_secs(5)).await
    );

    // --- Promotion: REPLICAOF NO ONE shifts the lineage ---
    let inherited = replica_ctx.ids.replid();
    let promoted_at = replica_ctx.master_offset();
    replication_unset_masters(&replica_ctx).await;
    assert!(!replica_ctx.has_masters().await);
    assert_eq!(replica_ctx.ids.replid2(), inherited);
    assert_eq!(replica_ctx.ids.second_replid_offset(), promoted_at as i64 + 1);
    assert_ne!(replica_ctx.ids.replid(), inherited);

    primary.ctx.shutdown();
    replica_ctx.shutdown();
}

// Adding the same upstream twice reports "already connected" without touching
// state.
#[tokio::test]
async fn test_duplicate_replicaof_is_a_noop() {
    let (ctx, _) = new_ctx(Config::default());
    let first = replication_add_master(&ctx, "127.0.0.1", 1).await;
    assert!(first.is_some());
    let second = replication_add_master(&ctx, "127.0.0.1", 1).await;
    assert!(second.is_none());
    assert_eq!(ctx.masters.lock().await.len(), 1);
    ctx.shutdown();
}

// Without multimaster, a second REPLICAOF replaces the first upstream.
#[tokio::test]
async fn test_replicaof_replaces_upstream_without_multimaster() {
    let (ctx, _) = new_ctx(Config::default());
    replication_add_master(&ctx, "127.0.0.1", 1).await.unwrap();
    replication_add_master(&ctx, "127.0.0.1", 2).await.unwrap();

    let masters = ctx.masters.lock().await;
    assert_eq!(masters.len(), 1);
    assert_eq!(masters[0].port, 2);
    drop(masters);
    ctx.shutdown();
}

// With multimaster, upstreams accumulate.
#[tokio::test]
async fn test_multimaster_keeps_all_upstreams() {
    let mut config = Config::default();
    config.replication.enable_multimaster = true;
    let (ctx, _) = new_ctx(config);
    replication_add_master(&ctx, "127.0.0.1", 1).await.unwrap();
    replication_add_master(&ctx, "127.0.0.1", 2).await.unwrap();
    assert_eq!(ctx.masters.lock().await.len(), 2);
    ctx.shutdown();
}
