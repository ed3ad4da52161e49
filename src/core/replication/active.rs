// src/core/replication/active.rs

//! Active-replica fan-out: the `RREPLAY` envelope carrying origin identity and
//! an MVCC timestamp around every replicated command, the loop-suppression
//! rules that keep mutations from bouncing between writable peers, and the
//! stale-key queue drained back toward upstreams after an MVCC merge.

use crate::core::CitrineError;
use crate::core::protocol::RespFrame;
use crate::core::replication::propagation;
use crate::core::state::{MasterInfo, ReplContext};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use uuid::Uuid;

/// Hard cap on envelope-in-envelope recursion.
const REPLAY_MAX_NESTING: usize = 64;

/// A monotonic logical clock: the upper bits carry wall-clock milliseconds,
/// the low 20 bits a sequence number, and updates never move backwards even
/// across wall-clock regressions.
#[derive(Debug)]
pub struct MvccClock {
    last: AtomicU64,
}

impl MvccClock {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Draws the next timestamp, strictly greater than every previous one.
    pub fn next(&self) -> u64 {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let candidate = now_ms << 20;
        let mut prev = self.last.load(Ordering::SeqCst);
        loop {
            let next = candidate.max(prev + 1);
            match self
                .last
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    pub fn latest(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }

    /// Advances the clock past an externally observed timestamp so local
    /// mutations always stamp newer than anything already merged.
    pub fn witness(&self, observed: u64) {
        let _ = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                (observed > cur).then_some(observed)
            });
    }
}

impl Default for MvccClock {
    fn default() -> Self {
        Self::new()
    }
}

/// The parsed form of `RREPLAY <source-uuid> <payload> [<db> [<mvcc>]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RreplayEnvelope {
    pub source_uuid: Uuid,
    pub payload: Bytes,
    pub db: u64,
    pub mvcc: u64,
}

impl RreplayEnvelope {
    /// Parses the envelope from a command argument vector (including the
    /// leading `RREPLAY` name).
    pub fn parse(argv: &[Bytes], fallback_db: u64) -> Result<Self, CitrineError> {
        if argv.len() < 3 {
            return Err(CitrineError::WrongArgumentCount("RREPLAY".to_string()));
        }
        let uuid_str = std::str::from_utf8(&argv[1])
            .map_err(|_| CitrineError::ReplicationError("Expected UUID arg1".to_string()))?;
        if uuid_str.len() != 36 {
            return Err(CitrineError::ReplicationError(
                "Expected UUID arg1".to_string(),
            ));
        }
        let source_uuid = Uuid::parse_str(uuid_str)
            .map_err(|_| CitrineError::ReplicationError("Expected UUID arg1".to_string()))?;
        let payload = argv[2].clone();
        let db = match argv.get(3) {
            Some(raw) => std::str::from_utf8(raw)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| CitrineError::ReplicationError("Invalid database ID".to_string()))?,
            None => fallback_db,
        };
        let mvcc = match argv.get(4) {
            Some(raw) => std::str::from_utf8(raw)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| {
                    CitrineError::ReplicationError("Invalid MVCC Timestamp".to_string())
                })?,
            None => 0,
        };
        Ok(Self {
            source_uuid,
            payload,
            db,
            mvcc,
        })
    }

    pub fn to_argv(&self) -> Vec<Bytes> {
        vec![
            Bytes::from_static(b"RREPLAY"),
            Bytes::from(self.source_uuid.to_string()),
            self.payload.clone(),
            Bytes::from(self.db.to_string()),
            Bytes::from(self.mvcc.to_string()),
        ]
    }
}

/// Wraps an encoded command payload in the five-element `RREPLAY` envelope.
/// The wire layout is fixed: the payload travels as one bulk string whose
/// content is the raw command bytes.
pub fn wrap_rreplay(source_uuid: &Uuid, payload: &Bytes, db: u64, mvcc: u64) -> Bytes {
    let uuid_str = source_uuid.to_string();
    let db_str = db.to_string();
    let mvcc_str = mvcc.to_string();
    let mut out = BytesMut::with_capacity(payload.len() + 96);
    out.extend_from_slice(b"*5\r\n$7\r\nRREPLAY\r\n");
    out.extend_from_slice(format!("${}\r\n{}\r\n", uuid_str.len(), uuid_str).as_bytes());
    out.extend_from_slice(format!("${}\r\n", payload.len()).as_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(format!("${}\r\n{}\r\n", db_str.len(), db_str).as_bytes());
    out.extend_from_slice(format!("${}\r\n{}\r\n", mvcc_str.len(), mvcc_str).as_bytes());
    out.freeze()
}

/// Applies an `RREPLAY` envelope received on a master link.
///
/// Self-originated envelopes are dropped (loop freedom); everything else is
/// decoded and executed through the command sink, the link's MVCC watermark is
/// advanced, and the envelope is re-published to our own replicas with its
/// original source UUID so second hops are suppressed the same way.
pub async fn replica_replay(
    ctx: &Arc<ReplContext>,
    mi: &Arc<MasterInfo>,
    argv: &[Bytes],
    current_db: u64,
) -> Result<(), CitrineError> {
    let envelope = RreplayEnvelope::parse(argv, current_db)?;

    if envelope.source_uuid == ctx.uuid {
        // Our own commands have come back to us. Ignore them.
        debug!("Skipping self-originated RREPLAY envelope.");
        return Ok(());
    }

    apply_payload(ctx, &envelope, 1).await?;

    mi.mvcc_last_sync.store(envelope.mvcc, Ordering::SeqCst);
    ctx.mvcc_clock.witness(envelope.mvcc);

    propagation::feed_replicas_rreplay(ctx, &envelope.to_argv()).await;
    Ok(())
}

/// Decodes and executes the commands inside an envelope payload. A payload may
/// itself contain `RREPLAY` envelopes (chained active topologies); recursion
/// is bounded.
async fn apply_payload(
    ctx: &Arc<ReplContext>,
    envelope: &RreplayEnvelope,
    depth: usize,
) -> Result<(), CitrineError> {
    if depth > REPLAY_MAX_NESTING {
        warn!("RREPLAY nesting exceeded {REPLAY_MAX_NESTING}; dropping envelope.");
        return Err(CitrineError::ReplicationLoopDetected);
    }

    use tokio_util::codec::Decoder;

    let mut buf = bytes::BytesMut::from(&envelope.payload[..]);
    let mut db = envelope.db;
    loop {
        let frame = match crate::core::protocol::RespFrameCodec.decode(&mut buf) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => return Err(e),
        };
        let argv = frame.to_argv()?;
        let name = String::from_utf8_lossy(&argv[0]).to_ascii_uppercase();
        match name.as_str() {
            "SELECT" => {
                db = std::str::from_utf8(&argv[1])
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or(CitrineError::NotAnInteger)?;
            }
            "RREPLAY" => {
                let nested = RreplayEnvelope::parse(&argv, db)?;
                if nested.source_uuid == ctx.uuid {
                    continue;
                }
                Box::pin(apply_payload(ctx, &nested, depth + 1)).await?;
            }
            _ => {
                ctx.engines.sink.apply(db, argv).await?;
            }
        }
    }
    Ok(())
}

/// Builds one `RespFrame` echo of the envelope for tests and tracing.
pub fn envelope_frame(envelope: &RreplayEnvelope) -> RespFrame {
    RespFrame::from_argv(&envelope.to_argv())
}
