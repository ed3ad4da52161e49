// src/core/replication/backlog.rs

//! Implements the replication backlog, a crucial component for efficient replication.
//!
//! The backlog is a fixed-size, in-memory circular byte buffer storing the
//! most recent suffix of the primary's command stream, addressed by the
//! monotonic global replication offset. Replicas that disconnect and reconnect
//! quickly can perform a fast "partial resynchronization" by replaying only
//! the missed bytes rather than undergoing a full snapshot transfer.

use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, watch};
use tracing::debug;

/// The smallest backlog we will allocate. Resize requests below this floor are
/// clamped so a resize always yields a usable buffer.
pub const REPL_BACKLOG_MIN_SIZE: u64 = 16 * 1024;

/// A point-in-time view of the backlog used by the `INFO`-style accessors and
/// by the invariant checks in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BacklogInfo {
    pub size: u64,
    pub histlen: u64,
    pub first_offset: u64,
    pub master_offset: u64,
}

#[derive(Debug)]
struct Inner {
    buf: Vec<u8>,
    /// Next write position inside `buf`.
    idx: usize,
    /// Number of valid history bytes; saturates at `buf.len()`.
    histlen: u64,
    /// Replication offset of the first byte retained in the buffer.
    first_offset: u64,
}

/// `ReplicationBacklog` owns the circular buffer and the global replication
/// offset. Only the feeder task writes; replica handlers read ranges under the
/// same lock.
#[derive(Debug, Clone)]
pub struct ReplicationBacklog {
    inner: Arc<Mutex<Option<Inner>>>,
    master_offset: Arc<AtomicU64>,
    /// Notifies streaming replica handlers that the offset has advanced.
    offset_notifier_tx: Arc<watch::Sender<u64>>,
}

impl ReplicationBacklog {
    /// Creates the backlog holder (initially without a buffer) and returns it
    /// along with a `watch::Receiver` any task can clone to monitor offset
    /// advances.
    pub fn new(master_offset: Arc<AtomicU64>) -> (Self, watch::Receiver<u64>) {
        let (tx, rx) = watch::channel(master_offset.load(Ordering::SeqCst));
        (
            Self {
                inner: Arc::new(Mutex::new(None)),
                master_offset,
                offset_notifier_tx: Arc::new(tx),
            },
            rx,
        )
    }

    /// The current global replication offset.
    pub fn master_offset(&self) -> u64 {
        self.master_offset.load(Ordering::SeqCst)
    }

    pub async fn is_created(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    /// Allocates the circular buffer. The first byte we virtually hold is the
    /// next byte the stream will produce. No-op when already created.
    pub async fn create(&self, size: u64) {
        let size = size.max(REPL_BACKLOG_MIN_SIZE);
        let mut guard = self.inner.lock().await;
        if guard.is_some() {
            return;
        }
        *guard = Some(Inner {
            buf: vec![0u8; size as usize],
            idx: 0,
            histlen: 0,
            first_offset: self.master_offset.load(Ordering::SeqCst) + 1,
        });
    }

    /// Releases the buffer entirely. The global offset is left untouched.
    pub async fn free(&self) {
        *self.inner.lock().await = None;
    }

    /// Reallocates the buffer with a new size, discarding all history.
    /// Copying a multi-gigabyte buffer would stall the server, so continuity
    /// is traded away; affected replicas will full-resync on reconnect.
    pub async fn resize(&self, new_size: u64) {
        let new_size = new_size.max(REPL_BACKLOG_MIN_SIZE);
        let mut guard = self.inner.lock().await;
        if let Some(inner) = guard.as_mut() {
            if inner.buf.len() as u64 == new_size {
                return;
            }
            inner.buf = vec![0u8; new_size as usize];
            inner.idx = 0;
            inner.histlen = 0;
            inner.first_offset = self.master_offset.load(Ordering::SeqCst) + 1;
        }
    }

    /// Takes the backlog lock for a compound operation. Feeding the stream and
    /// attaching a replica's live buffer must be mutually ordered: a partial
    /// resync reads the retained suffix and registers the replica under the
    /// same guard a feed appends under, so no byte is duplicated or lost.
    pub async fn write_lock(&self) -> BacklogWriter<'_> {
        BacklogWriter {
            guard: self.inner.lock().await,
            master_offset: &self.master_offset,
            offset_notifier_tx: &self.offset_notifier_tx,
        }
    }

    /// Appends raw stream bytes, advancing the global replication offset by
    /// exactly `bytes.len()`. There is no case where the backlog is fed
    /// without advancing the offset. Returns `false` when no buffer exists.
    pub async fn feed(&self, bytes: &[u8]) -> bool {
        self.write_lock().await.feed(bytes)
    }

    /// Copies the retained stream suffix starting at `start_offset`. See
    /// [`BacklogWriter::read_range`].
    pub async fn read_range(&self, start_offset: u64) -> Option<Bytes> {
        self.write_lock().await.read_range(start_offset)
    }

    /// Point-in-time counters, or `None` when no buffer is allocated.
    pub async fn info(&self) -> Option<BacklogInfo> {
        let guard = self.inner.lock().await;
        guard.as_ref().map(|inner| BacklogInfo {
            size: inner.buf.len() as u64,
            histlen: inner.histlen,
            first_offset: inner.first_offset,
            master_offset: self.master_offset.load(Ordering::SeqCst),
        })
    }
}

/// A held backlog lock exposing the operations that must compose atomically.
pub struct BacklogWriter<'a> {
    guard: tokio::sync::MutexGuard<'a, Option<Inner>>,
    master_offset: &'a AtomicU64,
    offset_notifier_tx: &'a watch::Sender<u64>,
}

impl BacklogWriter<'_> {
    pub fn is_created(&self) -> bool {
        self.guard.is_some()
    }

    pub fn master_offset(&self) -> u64 {
        self.master_offset.load(Ordering::SeqCst)
    }

    /// Appends raw stream bytes under the held lock. Returns `false` when no
    /// buffer exists (the offset is then left untouched).
    pub fn feed(&mut self, bytes: &[u8]) -> bool {
        let Some(inner) = self.guard.as_mut() else {
            return false;
        };

        let new_offset = self
            .master_offset
            .fetch_add(bytes.len() as u64, Ordering::SeqCst)
            + bytes.len() as u64;

        // Circular copy: write as much as fits before the end, then wrap.
        let size = inner.buf.len();
        let mut src = bytes;
        while !src.is_empty() {
            let room = size - inner.idx;
            let this_len = room.min(src.len());
            inner.buf[inner.idx..inner.idx + this_len].copy_from_slice(&src[..this_len]);
            inner.idx += this_len;
            if inner.idx == size {
                inner.idx = 0;
            }
            inner.histlen += this_len as u64;
            src = &src[this_len..];
        }
        if inner.histlen > size as u64 {
            inner.histlen = size as u64;
        }
        inner.first_offset = new_offset - inner.histlen + 1;

        self.offset_notifier_tx.send_if_modified(|current| {
            if *current < new_offset {
                *current = new_offset;
                true
            } else {
                false
            }
        });
        true
    }

    /// Copies the retained stream suffix starting at `start_offset`.
    ///
    /// A request is serviceable iff
    /// `first_offset <= start_offset <= master_offset + 1`; a request for
    /// exactly `master_offset + 1` yields an empty (but successful) range.
    /// Returns `None` when the requested offset has already been evicted,
    /// signalling that a full resync is required.
    pub fn read_range(&self, start_offset: u64) -> Option<Bytes> {
        let inner = self.guard.as_ref()?;
        let master_offset = self.master_offset.load(Ordering::SeqCst);

        if start_offset < inner.first_offset || start_offset > master_offset + 1 {
            debug!(
                "Requested offset {} outside retained window [{}, {}].",
                start_offset,
                inner.first_offset,
                master_offset + 1
            );
            return None;
        }

        let skip = start_offset - inner.first_offset;
        let len = (inner.histlen - skip) as usize;
        let size = inner.buf.len();
        // Index of the oldest retained byte, then seek forward by `skip`.
        let start = (inner.idx + size - inner.histlen as usize) % size;
        let mut j = (start + skip as usize) % size;

        let mut out = BytesMut::with_capacity(len);
        let mut remaining = len;
        while remaining > 0 {
            let this_len = remaining.min(size - j);
            out.extend_from_slice(&inner.buf[j..j + this_len]);
            remaining -= this_len;
            j = 0;
        }
        Some(out.freeze())
    }
}
