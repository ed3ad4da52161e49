// src/core/engine.rs

//! Interfaces to the external collaborators of the replication core: the
//! snapshot producer/loader and the command dispatcher. The core never touches
//! the keyspace directly; it hands replicated writes and snapshot bytes to
//! implementations of these traits.

use crate::core::CitrineError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

/// Replication metadata embedded in every snapshot as auxiliary fields, so a
/// restarted replica can attempt PSYNC without re-transferring the dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotMetadata {
    /// The replication id of the history this snapshot belongs to.
    pub repl_id: String,
    /// The replication offset at the moment the snapshot was produced.
    pub repl_offset: u64,
    /// The db selected in the replication stream when the snapshot was cut.
    pub repl_stream_db: u64,
    /// Minimum MVCC timestamp of interest to the producer (active mode).
    pub mvcc_min: u64,
}

/// Keys found locally with an MVCC timestamp strictly newer than the incoming
/// snapshot's view. From the upstream's perspective these are stale and must
/// be deleted there; the worker queues them on the upstream's record.
pub type StaleKeys = HashMap<u64, Vec<Bytes>>;

/// How a snapshot should be applied to the keyspace.
#[derive(Debug, Clone, Default)]
pub struct SnapshotLoadOptions {
    /// Empty all databases before loading (classic full resync).
    pub flush_before: bool,
    /// Perform the flush asynchronously.
    pub lazy_flush: bool,
    /// Only entries with an MVCC timestamp strictly greater than this value
    /// may overwrite existing keys (active-replica merge). `0` disables the
    /// check.
    pub mvcc_min: u64,
    /// Collect locally-newer keys during an MVCC merge.
    pub collect_stale_keys: bool,
}

/// Result of applying a snapshot.
#[derive(Debug, Default)]
pub struct SnapshotApplyReport {
    pub metadata: SnapshotMetadata,
    pub stale_keys: StaleKeys,
}

/// Produces and ingests whole-dataset snapshots.
#[async_trait]
pub trait SnapshotEngine: Send + Sync {
    /// Serializes the dataset, embedding `meta` as auxiliary fields.
    async fn save(&self, meta: SnapshotMetadata) -> Result<Bytes, CitrineError>;

    /// Loads a snapshot into the keyspace according to `opts`.
    async fn load(
        &self,
        bytes: Bytes,
        opts: SnapshotLoadOptions,
    ) -> Result<SnapshotApplyReport, CitrineError>;
}

/// Applies replicated write commands to the keyspace.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Executes `argv` against database `db`. A failure here is critical: the
    /// replica's dataset can no longer be trusted to match the primary's.
    async fn apply(&self, db: u64, argv: Vec<Bytes>) -> Result<(), CitrineError>;
}

/// The pair of collaborator handles threaded through the core.
#[derive(Clone)]
pub struct EngineHandles {
    pub snapshots: Arc<dyn SnapshotEngine>,
    pub sink: Arc<dyn CommandSink>,
}
