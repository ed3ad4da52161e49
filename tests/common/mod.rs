// tests/common/mod.rs

//! Shared test fixtures: an in-memory snapshot engine / command sink pair and
//! a minimal primary-side accept loop for end-to-end link tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use citrinedb_repl::config::Config;
use citrinedb_repl::core::commands::psync::Psync;
use citrinedb_repl::core::commands::replconf::{self, ReplconfAction};
use citrinedb_repl::core::engine::{
    CommandSink, EngineHandles, SnapshotApplyReport, SnapshotEngine, SnapshotLoadOptions,
    SnapshotMetadata, StaleKeys,
};
use citrinedb_repl::core::protocol::{RespFrame, RespFrameCodec};
use citrinedb_repl::core::replication::primary::{SyncRequest, SyncSession};
use citrinedb_repl::core::state::replica::ReplicaAttrs;
use citrinedb_repl::core::state::ReplContext;
use citrinedb_repl::CitrineError;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::codec::FramedRead;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entry {
    pub value: String,
    pub mvcc: u64,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct SnapshotDoc {
    repl_id: String,
    repl_offset: u64,
    repl_stream_db: u64,
    mvcc_min: u64,
    dbs: Vec<(u64, Vec<(String, Entry)>)>,
}

/// An in-memory keyspace standing in for the data-structure engine: it can
/// cut and ingest snapshots (JSON-encoded) and apply SET/DEL write commands.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    dbs: Mutex<HashMap<u64, HashMap<String, Entry>>>,
    applied: Mutex<Vec<(u64, Vec<Bytes>)>>,
    mvcc_seq: AtomicU64,
    /// Artificial latency for `save`, letting tests attach replicas to an
    /// in-flight snapshot.
    save_delay: Mutex<Option<Duration>>,
}

impl MemoryEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, db: u64, key: &str, value: &str, mvcc: u64) {
        self.dbs.lock().entry(db).or_default().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                mvcc,
            },
        );
    }

    pub fn get(&self, db: u64, key: &str) -> Option<Entry> {
        self.dbs.lock().get(&db).and_then(|m| m.get(key)).cloned()
    }

    pub fn applied(&self) -> Vec<(u64, Vec<Bytes>)> {
        self.applied.lock().clone()
    }

    pub fn applied_count(&self) -> usize {
        self.applied.lock().len()
    }

    pub fn set_save_delay(&self, delay: Duration) {
        *self.save_delay.lock() = Some(delay);
    }
}

#[async_trait]
impl SnapshotEngine for MemoryEngine {
    async fn save(&self, meta: SnapshotMetadata) -> Result<Bytes, CitrineError> {
        let delay = *self.save_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let dbs = self
            .dbs
            .lock()
            .iter()
            .map(|(db, entries)| {
                let mut list: Vec<(String, Entry)> =
                    entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                list.sort_by(|a, b| a.0.cmp(&b.0));
                (*db, list)
            })
            .collect();
        let doc = SnapshotDoc {
            repl_id: meta.repl_id,
            repl_offset: meta.repl_offset,
            repl_stream_db: meta.repl_stream_db,
            mvcc_min: meta.mvcc_min,
            dbs,
        };
        let encoded = serde_json::to_vec(&doc)
            .map_err(|e| CitrineError::SnapshotError(e.to_string()))?;
        Ok(Bytes::from(encoded))
    }

    async fn load(
        &self,
        bytes: Bytes,
        opts: SnapshotLoadOptions,
    ) -> Result<SnapshotApplyReport, CitrineError> {
        let doc: SnapshotDoc = serde_json::from_slice(&bytes)
            .map_err(|e| CitrineError::SnapshotError(format!("corrupt snapshot: {e}")))?;

        let mut dbs = self.dbs.lock();
        if opts.flush_before {
            dbs.clear();
        }

        let mut stale: StaleKeys = StaleKeys::new();
        for (db, entries) in &doc.dbs {
            let local = dbs.entry(*db).or_default();
            for (key, incoming) in entries {
                // Classic load: everything in the snapshot lands as-is.
                if opts.mvcc_min == 0 && !opts.collect_stale_keys {
                    local.insert(key.clone(), incoming.clone());
                    continue;
                }
                // MVCC merge: a locally newer key wins, and the upstream must
                // be told to delete its stale copy.
                let locally_newer = local.get(key).is_some_and(|e| e.mvcc > incoming.mvcc);
                if locally_newer {
                    if opts.collect_stale_keys {
                        stale
                            .entry(*db)
                            .or_default()
                            .push(Bytes::from(key.clone().into_bytes()));
                    }
                    continue;
                }
                if incoming.mvcc > opts.mvcc_min {
                    local.insert(key.clone(), incoming.clone());
                }
            }
        }

        Ok(SnapshotApplyReport {
            metadata: SnapshotMetadata {
                repl_id: doc.repl_id,
                repl_offset: doc.repl_offset,
                repl_stream_db: doc.repl_stream_db,
                mvcc_min: doc.mvcc_min,
            },
            stale_keys: stale,
        })
    }
}

#[async_trait]
impl CommandSink for MemoryEngine {
    async fn apply(&self, db: u64, argv: Vec<Bytes>) -> Result<(), CitrineError> {
        self.applied.lock().push((db, argv.clone()));
        let name = String::from_utf8_lossy(&argv[0]).to_ascii_uppercase();
        let mvcc = self.mvcc_seq.fetch_add(1, Ordering::SeqCst) + 1;
        match name.as_str() {
            "SET" if argv.len() >= 3 => {
                let key = String::from_utf8_lossy(&argv[1]).to_string();
                let value = String::from_utf8_lossy(&argv[2]).to_string();
                self.dbs
                    .lock()
                    .entry(db)
                    .or_default()
                    .insert(key, Entry { value, mvcc });
                Ok(())
            }
            "DEL" if argv.len() >= 2 => {
                let key = String::from_utf8_lossy(&argv[1]).to_string();
                if let Some(entries) = self.dbs.lock().get_mut(&db) {
                    entries.remove(&key);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Builds a context around a fresh `MemoryEngine`.
pub fn new_ctx(config: Config) -> (Arc<ReplContext>, Arc<MemoryEngine>) {
    let engine = MemoryEngine::new();
    let handles = EngineHandles {
        snapshots: engine.clone(),
        sink: engine.clone(),
    };
    (ReplContext::initialize(config, handles), engine)
}

pub fn test_config() -> Config {
    Config::default()
}

pub fn active_config() -> Config {
    let mut config = Config::default();
    config.replication.active_replica = true;
    config
}

pub fn test_addr() -> SocketAddr {
    "127.0.0.1:7979".parse().unwrap()
}

/// A minimal primary accept loop: answers the replication handshake the way
/// the connection handler would, then hands the stream over to a
/// `SyncSession`. Records each sync request it served.
pub struct TestPrimary {
    pub ctx: Arc<ReplContext>,
    pub engine: Arc<MemoryEngine>,
    pub addr: SocketAddr,
    pub sync_requests: Arc<Mutex<Vec<SyncRequest>>>,
}

impl TestPrimary {
    pub async fn spawn(config: Config) -> Arc<Self> {
        let (ctx, engine) = new_ctx(config);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let primary = Arc::new(Self {
            ctx,
            engine,
            addr,
            sync_requests: Arc::new(Mutex::new(Vec::new())),
        });

        let accept_primary = primary.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, peer)) = listener.accept().await else {
                    return;
                };
                let primary = accept_primary.clone();
                tokio::spawn(async move {
                    primary.serve_connection(socket, peer).await;
                });
            }
        });
        primary
    }

    async fn serve_connection(&self, socket: tokio::net::TcpStream, peer: SocketAddr) {
        let (reader, mut writer) = socket.into_split();
        let mut framed = FramedRead::new(reader, RespFrameCodec);
        let mut attrs = ReplicaAttrs::default();

        while let Some(Ok(frame)) = framed.next().await {
            let RespFrame::Array(items) = frame else {
                continue;
            };
            if items.is_empty() {
                continue;
            }
            let Ok(name) = citrinedb_repl::core::commands::extract_string(&items[0]) else {
                continue;
            };
            match name.to_ascii_uppercase().as_str() {
                "PING" => {
                    let _ = writer.write_all(b"+PONG\r\n").await;
                }
                "AUTH" => {
                    let _ = writer.write_all(b"+OK\r\n").await;
                }
                "REPLCONF" => {
                    let action = replconf::apply(&self.ctx, &mut attrs, &items[1..])
                        .await
                        .unwrap_or(ReplconfAction::Reply(RespFrame::Error(
                            "ERR syntax".to_string(),
                        )));
                    match action {
                        ReplconfAction::Reply(reply) => {
                            let _ = writer
                                .write_all(&reply.encode_to_bytes().unwrap())
                                .await;
                        }
                        ReplconfAction::ReplyAndClose(reply) => {
                            let _ = writer
                                .write_all(&reply.encode_to_bytes().unwrap())
                                .await;
                            return;
                        }
                        ReplconfAction::NoReply => {}
                    }
                }
                "PSYNC" | "SYNC" => {
                    let request = if name.eq_ignore_ascii_case("PSYNC") {
                        match Psync::parse(&items[1..]) {
                            Ok(psync) => psync.into_sync_request(),
                            Err(_) => SyncRequest::Sync,
                        }
                    } else {
                        SyncRequest::Sync
                    };
                    self.sync_requests.lock().push(request.clone());

                    // Reunite the halves so the session owns the socket.
                    let reader = framed.into_inner();
                    let stream = reader.reunite(writer).unwrap();
                    let session =
                        SyncSession::new(self.ctx.clone(), peer, stream, attrs.clone());
                    session.run(request, self.ctx.subscribe_shutdown()).await;
                    return;
                }
                _ => {
                    let _ = writer.write_all(b"-ERR unknown command\r\n").await;
                }
            }
        }
    }
}

/// Polls `predicate` until it holds or the timeout elapses.
pub async fn wait_for<F: Fn() -> bool>(predicate: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    predicate()
}
