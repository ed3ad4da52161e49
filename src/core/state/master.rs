// src/core/state/master.rs

//! The replica side's record of an upstream primary, including the cached
//! master slot that makes partial resynchronization across reconnects
//! possible.

use crate::core::engine::StaleKeys;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::watch;
use uuid::Uuid;

/// The replica-side handshake and link state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterLinkState {
    /// No replication in progress (the slot is being torn down).
    None,
    /// Must connect on the next cron tick / worker cycle.
    Connect,
    /// Non-blocking connect in flight.
    Connecting,
    ReceivePong,
    SendAuth,
    ReceiveAuth,
    SendUuid,
    ReceiveUuid,
    SendKey,
    KeyAck,
    SendPort,
    ReceivePort,
    SendIp,
    ReceiveIp,
    SendCapa,
    ReceiveCapa,
    SendPsync,
    ReceivePsync,
    /// Bulk snapshot transfer in progress.
    Transfer,
    /// Live command stream established.
    Connected,
}

impl MasterLinkState {
    /// True for every state between the connect completing and PSYNC being
    /// answered.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            MasterLinkState::ReceivePong
                | MasterLinkState::SendAuth
                | MasterLinkState::ReceiveAuth
                | MasterLinkState::SendUuid
                | MasterLinkState::ReceiveUuid
                | MasterLinkState::SendKey
                | MasterLinkState::KeyAck
                | MasterLinkState::SendPort
                | MasterLinkState::ReceivePort
                | MasterLinkState::SendIp
                | MasterLinkState::ReceiveIp
                | MasterLinkState::SendCapa
                | MasterLinkState::ReceiveCapa
                | MasterLinkState::SendPsync
                | MasterLinkState::ReceivePsync
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MasterLinkState::None => "none",
            MasterLinkState::Connect => "connect",
            MasterLinkState::Connecting => "connecting",
            MasterLinkState::Transfer => "sync",
            MasterLinkState::Connected => "connected",
            s if s.is_handshake() => "handshake",
            _ => "unknown",
        }
    }
}

/// What survives a dropped primary link: enough identity and progress to ask
/// for a `+CONTINUE` instead of a full transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMaster {
    pub replid: String,
    /// The stream offset this replica had fully consumed.
    pub reploff: u64,
    pub uuid: Option<Uuid>,
}

/// The record for one upstream primary. With `enable_multimaster` there may be
/// several; classically there is at most one.
#[derive(Debug)]
pub struct MasterInfo {
    pub id: u64,
    pub host: String,
    pub port: u16,
    state: Mutex<MasterLinkState>,
    /// Replid learned from `+FULLRESYNC` (or adopted via `+CONTINUE`).
    pub master_replid: Mutex<String>,
    /// Offset announced by `+FULLRESYNC`; `-1` until known.
    pub master_initial_offset: AtomicI64,
    /// The upstream's instance UUID, learned during the handshake.
    pub master_uuid: Mutex<Option<Uuid>>,
    /// Offset of the live stream consumed so far.
    pub reploff: AtomicU64,
    /// Whether a live master client is currently installed on a link.
    pub link_established: Mutex<Option<Instant>>,
    /// Wall-clock of the last byte seen from the upstream (handshake,
    /// transfer, or stream).
    pub last_io_time: Mutex<Instant>,
    pub cached_master: Mutex<Option<CachedMaster>>,
    /// MVCC timestamp of the last mutation accepted from this upstream.
    pub mvcc_last_sync: AtomicU64,
    /// Keys resurrected locally by an MVCC merge that the upstream must
    /// delete; drained by the cron.
    pub stale_keys: Mutex<StaleKeys>,
    pub transfer_tmpfile: Mutex<Option<PathBuf>>,
    pub down_since: Mutex<Option<Instant>>,
    /// Bumped by `cancel_replication_handshake`; the worker aborts its current
    /// cycle when it observes a change.
    cancel_tx: watch::Sender<u64>,
}

impl MasterInfo {
    pub fn new(id: u64, host: String, port: u16) -> Self {
        let (cancel_tx, _) = watch::channel(0);
        Self {
            id,
            host,
            port,
            state: Mutex::new(MasterLinkState::Connect),
            master_replid: Mutex::new(String::new()),
            master_initial_offset: AtomicI64::new(-1),
            master_uuid: Mutex::new(None),
            reploff: AtomicU64::new(0),
            link_established: Mutex::new(None),
            last_io_time: Mutex::new(Instant::now()),
            cached_master: Mutex::new(None),
            mvcc_last_sync: AtomicU64::new(0),
            stale_keys: Mutex::new(StaleKeys::new()),
            transfer_tmpfile: Mutex::new(None),
            down_since: Mutex::new(None),
            cancel_tx,
        }
    }

    pub fn state(&self) -> MasterLinkState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: MasterLinkState) {
        *self.state.lock() = state;
    }

    pub fn touch_io(&self) {
        *self.last_io_time.lock() = Instant::now();
    }

    pub fn io_idle(&self) -> std::time::Duration {
        self.last_io_time.lock().elapsed()
    }

    pub fn reploff(&self) -> u64 {
        self.reploff.load(Ordering::SeqCst)
    }

    pub fn advance_reploff(&self, n: u64) {
        self.reploff.fetch_add(n, Ordering::SeqCst);
    }

    pub fn subscribe_cancel(&self) -> watch::Receiver<u64> {
        self.cancel_tx.subscribe()
    }

    /// The sole teardown entry for an in-flight handshake or transfer.
    /// Idempotent; calling it with no handshake in progress is a no-op.
    /// Resets the link state to `Connect` so the worker retries, and removes
    /// the transfer temp file if one exists.
    pub fn cancel_replication_handshake(&self) -> bool {
        let mut state = self.state.lock();
        let cancellable = state.is_handshake()
            || matches!(
                *state,
                MasterLinkState::Connecting | MasterLinkState::Transfer
            );
        if !cancellable {
            return false;
        }
        *state = MasterLinkState::Connect;
        drop(state);

        if let Some(path) = self.transfer_tmpfile.lock().take() {
            let _ = std::fs::remove_file(path);
        }
        self.cancel_tx.send_modify(|generation| *generation += 1);
        true
    }

    /// Aborts whatever the worker is doing with the link right now,
    /// regardless of state.
    pub fn force_cancel(&self) {
        self.cancel_tx.send_modify(|generation| *generation += 1);
    }

    /// Tears down an established link whose peer went silent: the identity is
    /// cached for a later `+CONTINUE`, and the worker is nudged off its
    /// blocked read to reconnect.
    pub fn drop_timed_out_link(&self) {
        self.cache_master();
        self.set_state(MasterLinkState::Connect);
        self.force_cancel();
    }

    /// Caches the live link's identity for a later `+CONTINUE`. Called when
    /// the connection to the upstream drops unexpectedly.
    pub fn cache_master(&self) {
        let replid = self.master_replid.lock().clone();
        if replid.is_empty() {
            return;
        }
        let cached = CachedMaster {
            replid,
            reploff: self.reploff(),
            uuid: *self.master_uuid.lock(),
        };
        *self.cached_master.lock() = Some(cached);
        *self.link_established.lock() = None;
        *self.down_since.lock() = Some(Instant::now());
    }

    pub fn discard_cached_master(&self) {
        if self.cached_master.lock().take().is_some() {
            tracing::info!("Discarding previously cached master state.");
        }
    }

    /// Queues keys the upstream should delete after our MVCC merge.
    pub fn queue_stale_keys(&self, keys: StaleKeys) {
        let mut map = self.stale_keys.lock();
        for (db, mut list) in keys {
            map.entry(db).or_default().append(&mut list);
        }
    }
}
