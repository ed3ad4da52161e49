// src/core/state/replica.rs

//! Per-replica runtime state held by a primary.
//!
//! Each accepted PSYNC/SYNC client gets a `ReplicaHandle` registered in the
//! context's replica map. The handle owns the replica's output buffer (fed by
//! the stream encoder) and a directive channel through which the sync
//! coordinator and the cron steer the owning session task.

use bitflags::bitflags;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{Notify, mpsc};
use uuid::Uuid;

bitflags! {
    /// Capabilities a replica advertises with `REPLCONF capa`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReplicaCapa: u32 {
        /// Understands the diskless `$EOF:<nonce>` snapshot framing.
        const EOF = 1 << 0;
        /// Understands the two-id protocol (`+CONTINUE <new-replid>`).
        const PSYNC2 = 1 << 1;
        /// Expires keys on its own; the primary need not propagate DELs for
        /// expired keys to it.
        const ACTIVE_EXPIRE = 1 << 2;
    }
}

/// A replica's position in the synchronization pipeline, as seen by the
/// primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaSyncState {
    /// Waiting for a snapshot to start; accumulates nothing yet.
    WaitBgsaveStart,
    /// A snapshot covering this replica is being produced; stream differences
    /// accumulate in the output buffer.
    WaitBgsaveEnd,
    /// The snapshot payload is being transmitted.
    SendBulk,
    /// Receiving the live stream (or, for socket targets, pending the first
    /// ACK before being counted as good).
    Online,
}

/// Attributes collected from `REPLCONF` before the PSYNC/SYNC handoff.
#[derive(Debug, Clone, Default)]
pub struct ReplicaAttrs {
    pub listening_port: u16,
    pub announced_ip: Option<String>,
    pub capa: Option<ReplicaCapa>,
    pub uuid: Option<Uuid>,
    /// Set when the client used legacy `SYNC`; no ACKs will ever arrive.
    pub pre_psync: bool,
}

impl ReplicaAttrs {
    pub fn capa(&self) -> ReplicaCapa {
        self.capa.unwrap_or(ReplicaCapa::empty())
    }
}

/// Snapshot payload framing on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotFraming {
    /// `$<len>\r\n<bytes>` — the size is known up front.
    Sized,
    /// `$EOF:<40-char nonce>\r\n<bytes><nonce>` — streamed, end marked by the
    /// trailing nonce.
    EofMarked(String),
}

/// Instructions from the sync coordinator / cron to a replica session task.
#[derive(Debug)]
pub enum ReplicaDirective {
    /// A disk-target snapshot started; send `+FULLRESYNC <replid> <offset>`.
    FullResyncStarted { replid: String, offset: u64 },
    /// The snapshot is ready; transmit it with the given framing. For socket
    /// targets the preamble (`+FULLRESYNC …`) is emitted here too.
    Snapshot {
        payload: Bytes,
        framing: SnapshotFraming,
        preamble: Option<String>,
    },
    /// Write a raw `\n` keep-alive (presync phase only).
    Keepalive,
    /// Terminate the session, optionally with an error reply first.
    Close { reason: Option<String> },
}

/// An append-only queue of encoded stream chunks bound for one replica.
///
/// The contents can be copied wholesale onto another replica's buffer, which
/// is how a late arrival attaches to an in-flight snapshot: it inherits the
/// differences accumulated since the snapshot was cut.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    chunks: Mutex<VecDeque<Bytes>>,
    notify: Notify,
    closed: AtomicBool,
}

impl OutputBuffer {
    pub fn append(&self, chunk: Bytes) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.chunks.lock().push_back(chunk);
        self.notify.notify_one();
    }

    /// Replaces this buffer's contents with a copy of another's.
    pub fn copy_from(&self, other: &OutputBuffer) {
        let src = other.chunks.lock().clone();
        let mut dst = self.chunks.lock();
        *dst = src;
        drop(dst);
        self.notify.notify_one();
    }

    /// Pops the next pending chunk, waiting until one arrives. Returns `None`
    /// once the buffer is closed and drained.
    pub async fn next(&self) -> Option<Bytes> {
        loop {
            if let Some(chunk) = self.chunks.lock().pop_front() {
                return Some(chunk);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn pending_chunks(&self) -> usize {
        self.chunks.lock().len()
    }
}

/// The primary's record for one attached replica.
#[derive(Debug)]
pub struct ReplicaHandle {
    pub id: u64,
    pub addr: SocketAddr,
    pub attrs: ReplicaAttrs,
    state: Mutex<ReplicaSyncState>,
    /// The snapshot job generation this replica is attached to, if any.
    pub snapshot_seq: AtomicU64,
    /// The primary offset at the moment this replica's snapshot was cut.
    /// Inherited by later arrivals that attach to the same snapshot.
    pub psync_initial_offset: AtomicI64,
    pub ack_offset: AtomicU64,
    pub ack_time: Mutex<Instant>,
    /// Stream bytes credited without transmission because they originated at
    /// this replica (active-replica loop suppression).
    pub skipped_offset: AtomicU64,
    /// Socket-target snapshots only: count the replica as properly online
    /// when its first ACK arrives.
    pub put_online_on_ack: AtomicBool,
    pub last_interaction: Mutex<Instant>,
    pub buffer: OutputBuffer,
    directives: mpsc::UnboundedSender<ReplicaDirective>,
}

impl ReplicaHandle {
    pub fn new(
        id: u64,
        addr: SocketAddr,
        attrs: ReplicaAttrs,
        state: ReplicaSyncState,
    ) -> (Self, mpsc::UnboundedReceiver<ReplicaDirective>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id,
                addr,
                attrs,
                state: Mutex::new(state),
                snapshot_seq: AtomicU64::new(0),
                psync_initial_offset: AtomicI64::new(-1),
                ack_offset: AtomicU64::new(0),
                ack_time: Mutex::new(Instant::now()),
                skipped_offset: AtomicU64::new(0),
                put_online_on_ack: AtomicBool::new(false),
                last_interaction: Mutex::new(Instant::now()),
                buffer: OutputBuffer::default(),
                directives: tx,
            },
            rx,
        )
    }

    pub fn state(&self) -> ReplicaSyncState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: ReplicaSyncState) {
        *self.state.lock() = state;
    }

    pub fn send_directive(&self, directive: ReplicaDirective) {
        // A send failure means the session task already exited; cleanup of the
        // registry entry happens there.
        let _ = self.directives.send(directive);
    }

    /// The replication offset this replica is known to have processed,
    /// including bytes it originated itself and therefore never received.
    pub fn acked_offset(&self) -> u64 {
        self.ack_offset.load(Ordering::SeqCst) + self.skipped_offset.load(Ordering::SeqCst)
    }

    /// Records an ACK. Offsets are monotonic within a connection; stale ACKs
    /// only refresh the timestamp.
    pub fn record_ack(&self, offset: u64) {
        let _ = self
            .ack_offset
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                (offset > cur).then_some(offset)
            });
        *self.ack_time.lock() = Instant::now();
    }

    pub fn ack_age(&self) -> std::time::Duration {
        self.ack_time.lock().elapsed()
    }

    pub fn touch(&self) {
        *self.last_interaction.lock() = Instant::now();
    }

    pub fn idle(&self) -> std::time::Duration {
        self.last_interaction.lock().elapsed()
    }
}
