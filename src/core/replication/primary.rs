// src/core/replication/primary.rs

//! Primary-side synchronization: answers SYNC/PSYNC from a newly attached
//! client, decides partial vs. full resync, coordinates snapshot production
//! for full resyncs (disk or socket target, with attachment of late arrivals
//! to an in-flight snapshot), and streams live updates once a replica is
//! online.

use crate::core::CitrineError;
use crate::core::engine::SnapshotMetadata;
use crate::core::protocol::{RespFrame, RespFrameCodec};
use crate::core::replication::replid::random_replid;
use crate::core::state::replica::{
    ReplicaAttrs, ReplicaCapa, ReplicaDirective, ReplicaHandle, ReplicaSyncState, SnapshotFraming,
};
use crate::core::state::ReplContext;
use bytes::Bytes;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_util::codec::FramedRead;
use tracing::{info, warn};

/// Which transport the in-flight snapshot is aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotTarget {
    /// Produced first, then transmitted with a sized preamble.
    Disk,
    /// Streamed straight at replica sockets with an EOF-marker framing.
    Socket,
}

/// One snapshot production run.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotJob {
    pub seq: u64,
    pub target: SnapshotTarget,
    pub started_at: Instant,
}

/// Tracks whether a snapshot is being produced and hands out job sequence
/// numbers so replicas can be attached to a specific run.
#[derive(Debug)]
pub struct SnapshotDispatch {
    current: Mutex<Option<SnapshotJob>>,
    seq: std::sync::atomic::AtomicU64,
}

impl SnapshotDispatch {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
            seq: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub async fn current(&self) -> Option<SnapshotJob> {
        *self.current.lock().await
    }
}

impl Default for SnapshotDispatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Starts a snapshot for replication purposes, unless one is already running.
///
/// `mincapa` is the AND of the capabilities of the replicas waiting for this
/// snapshot: the target is a socket only when the instance prefers diskless
/// sync and every waiting replica understands the EOF framing. As side
/// effects, waiting replicas are attached to the new run (disk targets get
/// their `+FULLRESYNC` reply immediately), the stream selector is forced to
/// re-emit `SELECT`, and the script cache is flushed.
pub fn start_snapshot_for_replication<'a>(
    ctx: &'a Arc<ReplContext>,
    mincapa: ReplicaCapa,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), CitrineError>> + Send + 'a>> {
    Box::pin(start_snapshot_for_replication_inner(ctx, mincapa))
}

async fn start_snapshot_for_replication_inner(
    ctx: &Arc<ReplContext>,
    mincapa: ReplicaCapa,
) -> Result<(), CitrineError> {
    let mut current = ctx.snapshot_dispatch.current.lock().await;
    if current.is_some() {
        return Ok(());
    }

    let diskless = {
        let config = ctx.config.lock().await;
        config.replication.repl_diskless_sync
    };
    let target = if diskless && mincapa.contains(ReplicaCapa::EOF) {
        SnapshotTarget::Socket
    } else {
        SnapshotTarget::Disk
    };
    let seq = ctx.snapshot_dispatch.seq.fetch_add(1, Ordering::SeqCst) + 1;

    // Cut the snapshot point under the backlog lock: the recorded offset and
    // the first byte accumulated in attached buffers must agree exactly.
    let backlog = ctx.backlog.write_lock().await;
    let offset = backlog.master_offset();
    let replid = ctx.ids.replid();
    let mut attached = 0usize;
    for entry in ctx.replicas.iter() {
        let replica = entry.value();
        if replica.state() != ReplicaSyncState::WaitBgsaveStart {
            continue;
        }
        if target == SnapshotTarget::Socket && !replica.attrs.capa().contains(ReplicaCapa::EOF) {
            continue;
        }
        replica.snapshot_seq.store(seq, Ordering::SeqCst);
        replica
            .psync_initial_offset
            .store(offset as i64, Ordering::SeqCst);
        replica.set_state(ReplicaSyncState::WaitBgsaveEnd);
        if target == SnapshotTarget::Disk && !replica.attrs.pre_psync {
            replica.send_directive(ReplicaDirective::FullResyncStarted {
                replid: replid.clone(),
                offset,
            });
        }
        attached += 1;
    }
    // Accumulated differences must start by selecting the right database.
    ctx.replica_sel_db.store(-1, Ordering::SeqCst);
    drop(backlog);

    *current = Some(SnapshotJob {
        seq,
        target,
        started_at: Instant::now(),
    });
    drop(current);

    ctx.script_cache.flush();
    info!(
        "Starting snapshot for replication, target: {:?}, {} replica(s) attached.",
        target, attached
    );

    let meta = SnapshotMetadata {
        repl_id: replid,
        repl_offset: offset,
        repl_stream_db: ctx.replica_sel_db.load(Ordering::SeqCst).max(0) as u64,
        mvcc_min: ctx.mvcc_clock.latest(),
    };
    let ctx = ctx.clone();
    tokio::spawn(async move {
        let result = ctx.engines.snapshots.save(meta).await;
        finish_snapshot(&ctx, seq, target, result).await;
    });
    Ok(())
}

/// Completes a snapshot run: transmits the payload to every replica attached
/// to it, or closes them on failure, then chains a fresh run for replicas
/// that arrived too late to attach.
pub async fn finish_snapshot(
    ctx: &Arc<ReplContext>,
    seq: u64,
    target: SnapshotTarget,
    result: Result<Bytes, CitrineError>,
) {
    {
        let mut current = ctx.snapshot_dispatch.current.lock().await;
        if current.map(|job| job.seq) == Some(seq) {
            *current = None;
        }
    }

    match result {
        Err(e) => {
            warn!("Snapshot for replication failed: {e}. Dropping attached replicas.");
            for entry in ctx.replicas.iter() {
                let replica = entry.value();
                if replica.snapshot_seq.load(Ordering::SeqCst) == seq
                    && replica.state() == ReplicaSyncState::WaitBgsaveEnd
                {
                    replica.send_directive(ReplicaDirective::Close {
                        reason: Some("Background snapshot failed".to_string()),
                    });
                }
            }
        }
        Ok(payload) => {
            let replid = ctx.ids.replid();
            for entry in ctx.replicas.iter() {
                let replica = entry.value();
                if replica.snapshot_seq.load(Ordering::SeqCst) != seq
                    || replica.state() != ReplicaSyncState::WaitBgsaveEnd
                {
                    continue;
                }
                let directive = match target {
                    SnapshotTarget::Disk => ReplicaDirective::Snapshot {
                        payload: payload.clone(),
                        framing: SnapshotFraming::Sized,
                        preamble: None,
                    },
                    SnapshotTarget::Socket => {
                        let offset = replica.psync_initial_offset.load(Ordering::SeqCst).max(0);
                        ReplicaDirective::Snapshot {
                            payload: payload.clone(),
                            framing: SnapshotFraming::EofMarked(random_replid()),
                            preamble: Some(format!("+FULLRESYNC {replid} {offset}\r\n")),
                        }
                    }
                };
                replica.send_directive(directive);
            }
        }
    }

    // Replicas that could not attach to this run wait for the next one.
    let mut mincapa: Option<ReplicaCapa> = None;
    for entry in ctx.replicas.iter() {
        if entry.value().state() == ReplicaSyncState::WaitBgsaveStart {
            let capa = entry.value().attrs.capa();
            mincapa = Some(mincapa.map_or(capa, |m| m & capa));
        }
    }
    if let Some(mincapa) = mincapa {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_snapshot_for_replication(&ctx, mincapa).await {
                warn!("Failed to chain snapshot for waiting replicas: {e}");
            }
        });
    }
}

/// The synchronization request that hands a client over to the sync session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequest {
    /// Legacy full-resync request; the client will never send ACKs.
    Sync,
    /// `PSYNC <replid> <offset>`.
    Psync { replid: String, offset: String },
}

/// `SyncSession` manages the entire replication lifecycle of one attached
/// replica, from the PSYNC decision to live streaming. It is generic over the
/// stream type `S` so tests can drive it over an in-memory duplex.
pub struct SyncSession<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> {
    ctx: Arc<ReplContext>,
    addr: SocketAddr,
    stream: S,
    attrs: ReplicaAttrs,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> SyncSession<S> {
    pub fn new(ctx: Arc<ReplContext>, addr: SocketAddr, stream: S, attrs: ReplicaAttrs) -> Self {
        Self {
            ctx,
            addr,
            stream,
            attrs,
        }
    }

    /// Runs the session to completion. Cleans up the replica's registry entry
    /// on any exit path.
    pub async fn run(self, request: SyncRequest, mut shutdown_rx: broadcast::Receiver<()>) {
        let SyncSession {
            ctx,
            addr,
            stream,
            mut attrs,
        } = self;
        let (reader, mut writer) = tokio::io::split(stream);
        let mut framed = FramedRead::new(reader, RespFrameCodec);

        // A non-active replica with a broken upstream link cannot serve SYNC:
        // it has no authoritative dataset to hand out.
        if !ctx.is_active_replica() && ctx.any_disconnected_masters().await {
            let _ = writer
                .write_all(b"-NOMASTERLINK Can't SYNC while not connected with my master\r\n")
                .await;
            return;
        }

        info!("Replica {addr} asks for synchronization");
        if request == SyncRequest::Sync {
            attrs.pre_psync = true;
        }
        let id = ctx.next_client_id();

        let mut streaming = false;
        let mut pending_initial: Vec<Bytes> = Vec::new();
        let mut session: Option<(Arc<ReplicaHandle>, mpsc::UnboundedReceiver<ReplicaDirective>)> =
            None;

        if let SyncRequest::Psync { replid, offset } = &request {
            if let Some(partial) =
                try_partial_resync(&ctx, id, addr, &attrs, replid, offset).await
            {
                let (handle, rx, initial) = partial;
                pending_initial = initial;
                streaming = true;
                session = Some((handle, rx));
            }
        }

        let (handle, mut directive_rx) = match session {
            Some(pair) => pair,
            None => {
                match setup_full_resync(&ctx, id, addr, attrs, &mut pending_initial).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = writer.write_all(format!("-ERR {e}\r\n").as_bytes()).await;
                        return;
                    }
                }
            }
        };

        let mut alive = true;
        for chunk in pending_initial.drain(..) {
            if writer.write_all(&chunk).await.is_err() {
                alive = false;
                break;
            }
        }

        while alive {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("Sync session for {addr} received shutdown signal.");
                    break;
                }
                directive = directive_rx.recv() => {
                    match directive {
                        None => break,
                        Some(d) => {
                            alive = handle_directive(&ctx, &handle, &mut writer, &mut streaming, d).await;
                        }
                    }
                }
                chunk = handle.buffer.next(), if streaming => {
                    match chunk {
                        Some(bytes) => {
                            if writer.write_all(&bytes).await.is_err() {
                                warn!("Failed to send update to replica {addr}. Connection lost.");
                                break;
                            }
                        }
                        None => break,
                    }
                }
                frame = framed.next() => {
                    match frame {
                        Some(Ok(frame)) => handle_replica_frame(&ctx, &handle, frame).await,
                        Some(Err(e)) => {
                            warn!("Protocol error from replica {addr}: {e}. Disconnecting.");
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        info!("Sync session for {addr} is terminating. Cleaning up its state.");
        handle.buffer.close();
        ctx.unregister_replica(id);
        ctx.refresh_good_replicas_count().await;
    }
}

/// Attempts a partial resynchronization. On success the replica is registered
/// online under the same backlog lock any concurrent feed appends under, so
/// the returned suffix and the live buffer meet with neither gap nor overlap.
async fn try_partial_resync(
    ctx: &Arc<ReplContext>,
    id: u64,
    addr: SocketAddr,
    attrs: &ReplicaAttrs,
    req_replid: &str,
    req_offset: &str,
) -> Option<(
    Arc<ReplicaHandle>,
    mpsc::UnboundedReceiver<ReplicaDirective>,
    Vec<Bytes>,
)> {
    // A parse failure should never happen; full resync is the robust answer.
    let psync_offset: u64 = req_offset.parse().ok()?;

    let (replid, replid2, second_replid_offset) = ctx.ids.snapshot();
    if req_replid.starts_with('?') {
        info!("Full resync requested by replica {addr}");
        return None;
    }
    let id_match = req_replid.eq_ignore_ascii_case(&replid)
        || (req_replid.eq_ignore_ascii_case(&replid2)
            && (psync_offset as i64) <= second_replid_offset);
    if !id_match {
        info!(
            "Partial resynchronization not accepted: Replication ID mismatch (Replica asked for '{req_replid}', my replication IDs are '{replid}' and '{replid2}')"
        );
        return None;
    }

    let backlog = ctx.backlog.write_lock().await;
    let master_offset = backlog.master_offset();
    let Some(range) = backlog.read_range(psync_offset) else {
        info!(
            "Unable to partial resync with replica {addr} for lack of backlog (Replica request was: {psync_offset})."
        );
        if psync_offset > master_offset {
            warn!(
                "Replica {addr} tried to PSYNC with an offset that is greater than the master replication offset."
            );
        }
        return None;
    };

    let (handle, rx) = ReplicaHandle::new(id, addr, attrs.clone(), ReplicaSyncState::Online);
    let handle = Arc::new(handle);
    ctx.register_replica(handle.clone());
    drop(backlog);

    let reply = if attrs.capa().contains(ReplicaCapa::PSYNC2) {
        format!("+CONTINUE {replid}\r\n")
    } else {
        "+CONTINUE\r\n".to_string()
    };
    info!(
        "Partial resynchronization request from {addr} accepted. Sending {} bytes of backlog starting from offset {psync_offset}.",
        range.len()
    );
    ctx.refresh_good_replicas_count().await;
    Some((handle, rx, vec![Bytes::from(reply), range]))
}

/// Registers the replica for a full resync and joins it to the snapshot
/// dispatch: attach to an in-flight disk snapshot when a compatible peer
/// exists, wait for the next run, or start one now.
async fn setup_full_resync(
    ctx: &Arc<ReplContext>,
    id: u64,
    addr: SocketAddr,
    attrs: ReplicaAttrs,
    pending_initial: &mut Vec<Bytes>,
) -> Result<
    (Arc<ReplicaHandle>, mpsc::UnboundedReceiver<ReplicaDirective>),
    CitrineError,
> {
    let (handle, rx) = ReplicaHandle::new(id, addr, attrs, ReplicaSyncState::WaitBgsaveStart);
    let handle = Arc::new(handle);
    ctx.register_replica(handle.clone());

    // The first replica opens a brand new history: fresh id, no secondary,
    // fresh backlog.
    if ctx.replicas.len() == 1 && !ctx.backlog.is_created().await {
        ctx.ids.change_replication_id();
        ctx.ids.clear_replication_id2();
        let size = {
            let config = ctx.config.lock().await;
            config.replication.repl_backlog_size
        };
        ctx.backlog.create(size).await;
    }

    // The dispatch lock is held across the attach so a completing snapshot
    // cannot slip between the membership check and the state change.
    let job_guard = ctx.snapshot_dispatch.current.lock().await;
    match *job_guard {
        Some(job) if job.target == SnapshotTarget::Disk => {
            let donor = ctx.replicas.iter().find_map(|entry| {
                let candidate = entry.value();
                let compatible = candidate.id != id
                    && candidate.state() == ReplicaSyncState::WaitBgsaveEnd
                    && candidate.snapshot_seq.load(Ordering::SeqCst) == job.seq
                    && handle.attrs.capa().contains(candidate.attrs.capa());
                compatible.then(|| candidate.clone())
            });
            match donor {
                Some(donor) => {
                    // The in-flight snapshot covers us too: inherit the
                    // accumulated differences and the snapshot cut offset.
                    handle.buffer.copy_from(&donor.buffer);
                    handle.snapshot_seq.store(job.seq, Ordering::SeqCst);
                    let offset = donor.psync_initial_offset.load(Ordering::SeqCst);
                    handle.psync_initial_offset.store(offset, Ordering::SeqCst);
                    handle.set_state(ReplicaSyncState::WaitBgsaveEnd);
                    if !handle.attrs.pre_psync {
                        pending_initial.push(Bytes::from(format!(
                            "+FULLRESYNC {} {}\r\n",
                            ctx.ids.replid(),
                            offset.max(0)
                        )));
                    }
                    info!("Waiting for end of BGSAVE for SYNC (attached to in-flight snapshot)");
                }
                None => {
                    info!(
                        "Can't attach the replica to the current snapshot. Waiting for next one for SYNC"
                    );
                }
            }
        }
        Some(_) => {
            info!("Current snapshot has socket target. Waiting for next one for SYNC");
        }
        None => {
            drop(job_guard);
            let (diskless, delay) = {
                let config = ctx.config.lock().await;
                (
                    config.replication.repl_diskless_sync,
                    config.replication.repl_diskless_sync_delay,
                )
            };
            if diskless && handle.attrs.capa().contains(ReplicaCapa::EOF) {
                // The cron launches the diskless snapshot once the delay has
                // elapsed, giving more replicas time to arrive.
                if delay > 0 {
                    info!("Delay next snapshot for diskless SYNC");
                }
            } else {
                start_snapshot_for_replication(ctx, handle.attrs.capa()).await?;
            }
            return Ok((handle, rx));
        }
    }
    Ok((handle, rx))
}

async fn handle_directive<W: AsyncWrite + Unpin>(
    ctx: &Arc<ReplContext>,
    handle: &Arc<ReplicaHandle>,
    writer: &mut W,
    streaming: &mut bool,
    directive: ReplicaDirective,
) -> bool {
    match directive {
        ReplicaDirective::FullResyncStarted { replid, offset } => writer
            .write_all(format!("+FULLRESYNC {replid} {offset}\r\n").as_bytes())
            .await
            .is_ok(),
        ReplicaDirective::Snapshot {
            payload,
            framing,
            preamble,
        } => {
            handle.set_state(ReplicaSyncState::SendBulk);
            if let Some(preamble) = preamble {
                if writer.write_all(preamble.as_bytes()).await.is_err() {
                    return false;
                }
            }
            let sent = match &framing {
                SnapshotFraming::Sized => {
                    let header = format!("${}\r\n", payload.len());
                    writer.write_all(header.as_bytes()).await.is_ok()
                        && writer.write_all(&payload).await.is_ok()
                }
                SnapshotFraming::EofMarked(nonce) => {
                    let header = format!("$EOF:{nonce}\r\n");
                    writer.write_all(header.as_bytes()).await.is_ok()
                        && writer.write_all(&payload).await.is_ok()
                        && writer.write_all(nonce.as_bytes()).await.is_ok()
                }
            };
            if !sent {
                warn!("Failed to transmit snapshot to replica {}.", handle.addr);
                return false;
            }
            handle.set_state(ReplicaSyncState::Online);
            if matches!(framing, SnapshotFraming::EofMarked(_)) {
                handle.put_online_on_ack.store(true, Ordering::SeqCst);
            }
            *handle.ack_time.lock() = Instant::now();
            *streaming = true;
            info!("Synchronization with replica {} succeeded", handle.addr);
            ctx.refresh_good_replicas_count().await;
            true
        }
        ReplicaDirective::Keepalive => writer.write_all(b"\n").await.is_ok(),
        ReplicaDirective::Close { reason } => {
            if let Some(reason) = reason {
                let _ = writer.write_all(format!("-ERR {reason}\r\n").as_bytes()).await;
            }
            false
        }
    }
}

/// Processes a frame sent by the replica over the replication link. The only
/// expected traffic is `REPLCONF ACK <offset>`, which never gets a reply.
async fn handle_replica_frame(ctx: &Arc<ReplContext>, handle: &Arc<ReplicaHandle>, frame: RespFrame) {
    handle.touch();
    let Ok(argv) = frame.to_argv() else {
        return;
    };
    if argv.len() < 3 || !argv[0].eq_ignore_ascii_case(b"REPLCONF") {
        return;
    }
    if !argv[1].eq_ignore_ascii_case(b"ACK") {
        return;
    }
    let Some(offset) = std::str::from_utf8(&argv[2])
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
    else {
        return;
    };
    handle.record_ack(offset);
    ctx.ack_notify.notify_waiters();
    if handle.put_online_on_ack.swap(false, Ordering::SeqCst) {
        // Socket-target snapshots count the replica as properly online only
        // once the first ACK confirms it is reading the stream.
        info!("Replica {} is now online (first ACK received).", handle.addr);
        ctx.refresh_good_replicas_count().await;
    }
}
