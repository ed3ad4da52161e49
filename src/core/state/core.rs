// src/core/state/core.rs

//! Defines the central `ReplContext` struct holding all shared replication
//! state. Unlike a whole-server context, this is scoped to the replication
//! core and threaded explicitly through component APIs; interior mutability is
//! limited to the fields that genuinely cross tasks.

use crate::config::Config;
use crate::core::CitrineError;
use crate::core::engine::EngineHandles;
use crate::core::events::EventBus;
use crate::core::replication::backlog::ReplicationBacklog;
use crate::core::replication::primary::SnapshotDispatch;
use crate::core::replication::active::MvccClock;
use crate::core::replication::replid::ReplicationIds;
use crate::core::replication::script_cache::ScriptCache;
use crate::core::state::master::{MasterInfo, MasterLinkState};
use crate::core::state::replica::{ReplicaHandle, ReplicaSyncState};
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tracing::info;
use uuid::Uuid;

/// The central struct holding all shared replication state. Wrapped in an
/// `Arc` and passed to every replication task, it is the single source of
/// truth for offsets, lineage ids, and the replica/primary registries.
pub struct ReplContext {
    /// Runtime configuration, lockable for dynamic changes.
    pub config: Arc<Mutex<Config>>,
    /// This instance's stable identity, exchanged during handshakes and used
    /// for active-replica loop suppression.
    pub uuid: Uuid,
    /// Handles to the snapshot producer/loader and the command dispatcher.
    pub engines: EngineHandles,
    /// Write events published by the dispatcher, drained by the feeder.
    pub event_bus: Arc<EventBus>,
    /// The current and previous lineage identifiers.
    pub ids: ReplicationIds,
    /// The global replication offset; advanced only by backlog feeds.
    pub master_offset: Arc<AtomicU64>,
    /// The circular stream buffer enabling partial resync.
    pub backlog: ReplicationBacklog,
    /// Receiver cloned by replica sessions to learn of offset advances.
    pub offset_rx: watch::Receiver<u64>,
    /// All attached replicas, keyed by connection id.
    pub replicas: DashMap<u64, Arc<ReplicaHandle>>,
    /// All upstream primaries (at most one without `enable_multimaster`).
    pub masters: Mutex<Vec<Arc<MasterInfo>>>,
    /// Script digests every replica is known to have seen.
    pub script_cache: ScriptCache,
    /// Monitor sinks receiving a human-readable echo of each command.
    pub monitors: parking_lot::Mutex<Vec<mpsc::UnboundedSender<Bytes>>>,
    /// The db selector last emitted on the replication stream; `-1` forces a
    /// fresh `SELECT` before the next command.
    pub replica_sel_db: AtomicI64,
    /// Monotonic logical clock stamping active-replica mutations.
    pub mvcc_clock: MvccClock,
    /// Signalled whenever any replica ACK advances, unblocking `WAIT`.
    pub ack_notify: Notify,
    /// Replicas online with lag within `repl_min_replicas_max_lag`.
    pub good_replicas: AtomicUsize,
    /// When the replica set last became empty; drives backlog release.
    pub no_replicas_since: parking_lot::Mutex<Instant>,
    /// Coordinates snapshot production for full resyncs.
    pub snapshot_dispatch: SnapshotDispatch,
    /// Signals every replication task to stop.
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
    /// Cached config flags hot on the propagation path.
    active_replica: AtomicBool,
    multimaster: AtomicBool,
    aof_enabled: AtomicBool,
    next_client_id: AtomicU64,
}

impl ReplContext {
    /// Initializes the replication context from the given configuration and
    /// collaborator handles.
    pub fn initialize(config: Config, engines: EngineHandles) -> Arc<Self> {
        let master_offset = Arc::new(AtomicU64::new(0));
        let (backlog, offset_rx) = ReplicationBacklog::new(master_offset.clone());
        let active = config.replication.active_replica || config.replication.enable_multimaster;
        let multimaster = config.replication.enable_multimaster;
        let aof_enabled = config.aof_enabled;
        let script_cache_size = config.replication.script_cache_size;

        let ctx = Arc::new(Self {
            config: Arc::new(Mutex::new(config)),
            uuid: Uuid::new_v4(),
            engines,
            event_bus: Arc::new(EventBus::new()),
            ids: ReplicationIds::new(),
            master_offset,
            backlog,
            offset_rx,
            replicas: DashMap::new(),
            masters: Mutex::new(Vec::new()),
            script_cache: ScriptCache::new(script_cache_size),
            monitors: parking_lot::Mutex::new(Vec::new()),
            replica_sel_db: AtomicI64::new(-1),
            mvcc_clock: MvccClock::new(),
            ack_notify: Notify::new(),
            good_replicas: AtomicUsize::new(0),
            no_replicas_since: parking_lot::Mutex::new(Instant::now()),
            snapshot_dispatch: SnapshotDispatch::new(),
            shutdown_tx: tokio::sync::broadcast::channel(1).0,
            active_replica: AtomicBool::new(active),
            multimaster: AtomicBool::new(multimaster),
            aof_enabled: AtomicBool::new(aof_enabled),
            next_client_id: AtomicU64::new(1),
        });
        info!("Replication context initialized with UUID {}", ctx.uuid);
        ctx
    }

    pub fn next_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::SeqCst)
    }

    /// A receiver that fires when the replication subsystem is shutting down.
    pub fn subscribe_shutdown(&self) -> tokio::sync::broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Stops every replication task (feeder, cron, workers, sync sessions).
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_active_replica(&self) -> bool {
        self.active_replica.load(Ordering::SeqCst)
    }

    pub fn is_multimaster(&self) -> bool {
        self.multimaster.load(Ordering::SeqCst)
    }

    pub fn is_aof_enabled(&self) -> bool {
        self.aof_enabled.load(Ordering::SeqCst)
    }

    pub fn master_offset(&self) -> u64 {
        self.master_offset.load(Ordering::SeqCst)
    }

    // --- Replica registry ---

    pub fn register_replica(&self, handle: Arc<ReplicaHandle>) {
        self.replicas.insert(handle.id, handle);
    }

    pub fn unregister_replica(&self, id: u64) {
        if self.replicas.remove(&id).is_some() && self.replicas.is_empty() {
            *self.no_replicas_since.lock() = Instant::now();
        }
    }

    /// Finds the attached replica advertising the given instance UUID, i.e.
    /// the downstream channel leading back to that peer.
    pub fn replica_by_uuid(&self, uuid: &Uuid) -> Option<Arc<ReplicaHandle>> {
        self.replicas
            .iter()
            .find(|entry| entry.value().attrs.uuid.as_ref() == Some(uuid))
            .map(|entry| entry.value().clone())
    }

    /// Number of replicas whose acknowledged offset (including credited
    /// skipped bytes) has reached `offset`.
    pub fn count_acks_by_offset(&self, offset: u64) -> usize {
        self.replicas
            .iter()
            .filter(|entry| {
                entry.value().state() == ReplicaSyncState::Online
                    && entry.value().acked_offset() >= offset
            })
            .count()
    }

    /// Recomputes the number of replicas usable for the
    /// `min-replicas-to-write` policy.
    pub async fn refresh_good_replicas_count(&self) {
        let (min_replicas, max_lag) = {
            let config = self.config.lock().await;
            (
                config.replication.repl_min_replicas_to_write,
                config.replication.repl_min_replicas_max_lag,
            )
        };
        if min_replicas == 0 || max_lag == 0 {
            return;
        }
        let max_lag = Duration::from_secs(max_lag);
        let good = self
            .replicas
            .iter()
            .filter(|entry| {
                entry.value().state() == ReplicaSyncState::Online
                    && entry.value().ack_age() <= max_lag
            })
            .count();
        self.good_replicas.store(good, Ordering::SeqCst);
    }

    /// Checks whether a write may be accepted under the
    /// `min-replicas-to-write` policy.
    pub async fn check_min_replicas_policy(&self) -> Result<(), CitrineError> {
        let min_replicas = {
            let config = self.config.lock().await;
            config.replication.repl_min_replicas_to_write
        };
        if min_replicas == 0 {
            return Ok(());
        }
        let good = self.good_replicas.load(Ordering::SeqCst);
        if good < min_replicas {
            return Err(CitrineError::ReadOnly(format!(
                "NOREPLICAS Not enough good replicas to write (have {good}, need {min_replicas})"
            )));
        }
        Ok(())
    }

    // --- Primary registry (replica role) ---

    pub async fn has_masters(&self) -> bool {
        !self.masters.lock().await.is_empty()
    }

    /// True when any configured upstream link is not fully connected. A
    /// non-active replica refuses SYNC from its own replicas in that state.
    pub async fn any_disconnected_masters(&self) -> bool {
        self.masters
            .lock()
            .await
            .iter()
            .any(|mi| mi.state() != MasterLinkState::Connected)
    }

    pub async fn find_master(&self, host: &str, port: u16) -> Option<Arc<MasterInfo>> {
        self.masters
            .lock()
            .await
            .iter()
            .find(|mi| mi.host.eq_ignore_ascii_case(host) && mi.port == port)
            .cloned()
    }

    pub async fn master_by_uuid(&self, uuid: &Uuid) -> Option<Arc<MasterInfo>> {
        self.masters
            .lock()
            .await
            .iter()
            .find(|mi| mi.master_uuid.lock().as_ref() == Some(uuid))
            .cloned()
    }

    // --- Monitors ---

    /// Registers a monitor sink; it will receive a formatted line per command.
    pub fn add_monitor(&self) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.monitors.lock().push(tx);
        rx
    }

    pub fn has_monitors(&self) -> bool {
        !self.monitors.lock().is_empty()
    }

    /// Disconnects every attached replica, e.g. after the replication id
    /// changed and their history is no longer continuable.
    pub fn disconnect_replicas(&self, reason: &str) {
        for entry in self.replicas.iter() {
            entry
                .value()
                .send_directive(crate::core::state::replica::ReplicaDirective::Close {
                    reason: Some(reason.to_string()),
                });
        }
    }

    /// Disconnects attached replicas except the one leading back to `uuid`.
    pub fn disconnect_replicas_except(&self, uuid: Option<&Uuid>, reason: &str) {
        for entry in self.replicas.iter() {
            if uuid.is_some() && entry.value().attrs.uuid.as_ref() == uuid {
                continue;
            }
            entry
                .value()
                .send_directive(crate::core::state::replica::ReplicaDirective::Close {
                    reason: Some(reason.to_string()),
                });
        }
    }
}
