// src/core/replication/propagation.rs

//! The stream encoder: converts write commands into the canonical wire form
//! and publishes them to the backlog and to every attached replica's output
//! buffer. Also proxies the raw upstream stream to sub-replicas and feeds
//! monitor clients a human-readable echo of each command.

use crate::core::protocol::RespFrame;
use crate::core::replication::active;
use crate::core::state::ReplContext;
use crate::core::state::replica::{ReplicaHandle, ReplicaSyncState};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;
use uuid::Uuid;

/// Encodes `SELECT <db>` as a command multibulk.
fn select_command(db: u64) -> Bytes {
    let argv = vec![Bytes::from_static(b"SELECT"), Bytes::from(db.to_string())];
    RespFrame::from_argv(&argv)
        .encode_to_bytes()
        .unwrap_or_default()
}

/// Builds the stream payload for one command: an optional `SELECT` when the
/// emitted db selector differs from the shadow, then the command multibulk.
/// Updates the shadow selector as a side effect.
fn build_payload(ctx: &ReplContext, db: u64, argv: &[Bytes]) -> Bytes {
    let mut payload = BytesMut::new();
    if ctx.replica_sel_db.load(Ordering::SeqCst) != db as i64 {
        payload.extend_from_slice(&select_command(db));
        ctx.replica_sel_db.store(db as i64, Ordering::SeqCst);
    }
    payload.extend_from_slice(
        &RespFrame::from_argv(argv)
            .encode_to_bytes()
            .unwrap_or_default(),
    );
    payload.freeze()
}

/// Publishes one write command to the replication stream.
///
/// A negative `db` selects db 0 (this happens for out-of-band commands such as
/// the cron's PING broadcast). `origin` is the UUID of the peer whose link
/// delivered the command, if any: a downstream replica with the same UUID is
/// not re-sent its own command, its `skipped_offset` is credited instead.
pub async fn feed_replicas(ctx: &Arc<ReplContext>, db: i64, argv: &[Bytes], origin: Option<Uuid>) {
    let db = db.max(0) as u64;

    // A chained (non-active) replica proxies the identical upstream stream
    // instead of re-encoding, so it can advertise the same replication id and
    // offsets as its own primary.
    if !ctx.is_active_replica() && ctx.has_masters().await {
        return;
    }
    if !ctx.backlog.is_created().await && ctx.replicas.is_empty() {
        return;
    }

    let on_wire = if ctx.is_active_replica() {
        let inner = build_payload(ctx, db, argv);
        active::wrap_rreplay(&ctx.uuid, &inner, db, ctx.mvcc_clock.next())
    } else {
        build_payload(ctx, db, argv)
    };

    let mut backlog = ctx.backlog.write_lock().await;
    backlog.feed(&on_wire);
    dispatch_to_replicas(ctx, &on_wire, origin.as_ref());
}

/// Re-publishes an already-wrapped `RREPLAY` envelope received from a peer.
/// The envelope keeps its original source UUID, which is also what suppresses
/// the mirror bounce: the replica channel leading back to the origin is
/// credited, not fed.
pub async fn feed_replicas_rreplay(ctx: &Arc<ReplContext>, envelope_argv: &[Bytes]) {
    if ctx.replicas.is_empty() && !ctx.backlog.is_created().await {
        return;
    }
    let origin = envelope_argv
        .get(1)
        .and_then(|raw| std::str::from_utf8(raw).ok())
        .and_then(|s| Uuid::parse_str(s).ok());
    let on_wire = RespFrame::from_argv(envelope_argv)
        .encode_to_bytes()
        .unwrap_or_default();

    let mut backlog = ctx.backlog.write_lock().await;
    backlog.feed(&on_wire);
    dispatch_to_replicas(ctx, &on_wire, origin.as_ref());
}

/// Proxies a verbatim chunk of the upstream primary's stream to sub-replicas.
/// No re-encoding happens here, so a chained replica's offsets advance in
/// lock-step with its primary's.
pub async fn feed_replicas_from_master_stream(ctx: &Arc<ReplContext>, buf: &[u8]) {
    let mut backlog = ctx.backlog.write_lock().await;
    backlog.feed(buf);
    for entry in ctx.replicas.iter() {
        let replica = entry.value();
        if replica.state() == ReplicaSyncState::WaitBgsaveStart {
            continue;
        }
        // Active topologies: a "replica" that is really the channel back to
        // one of our masters must not see its own stream again.
        if let Some(uuid) = replica.attrs.uuid.as_ref() {
            if is_master_uuid(ctx, uuid) {
                continue;
            }
        }
        replica.buffer.append(Bytes::copy_from_slice(buf));
    }
}

fn is_master_uuid(ctx: &ReplContext, uuid: &Uuid) -> bool {
    // Checked without the masters lock: the UUID set of upstreams only
    // changes on REPLICAOF, and a stale read only affects which keep-alive
    // path a chunk takes.
    ctx.masters
        .try_lock()
        .map(|masters| {
            masters
                .iter()
                .any(|mi| mi.master_uuid.lock().as_ref() == Some(uuid))
        })
        .unwrap_or(false)
}

fn dispatch_to_replicas(ctx: &ReplContext, on_wire: &Bytes, origin: Option<&Uuid>) {
    for entry in ctx.replicas.iter() {
        let replica = entry.value();
        if replica.state() == ReplicaSyncState::WaitBgsaveStart {
            continue;
        }
        if let (Some(origin), Some(replica_uuid)) = (origin, replica.attrs.uuid.as_ref()) {
            if origin == replica_uuid {
                replica
                    .skipped_offset
                    .fetch_add(on_wire.len() as u64, Ordering::SeqCst);
                continue;
            }
        }
        replica.buffer.append(on_wire.clone());
    }
}

/// Writes `SELECT` plus one command into a single replica's buffer, without
/// touching the backlog or the global offset. Used for the synthesized `DEL`s
/// that drain a stale-key map toward one particular upstream peer.
pub fn feed_one_replica(ctx: &ReplContext, replica: &ReplicaHandle, db: u64, argv: &[Bytes]) {
    let mut payload = BytesMut::new();
    if ctx.replica_sel_db.load(Ordering::SeqCst) != db as i64 {
        payload.extend_from_slice(&select_command(db));
        ctx.replica_sel_db.store(db as i64, Ordering::SeqCst);
    }
    payload.extend_from_slice(
        &RespFrame::from_argv(argv)
            .encode_to_bytes()
            .unwrap_or_default(),
    );
    replica.buffer.append(payload.freeze());
}

/// Feeds monitor clients the human-readable form of a command, independent of
/// the replica stream.
pub fn feed_monitors(ctx: &ReplContext, db: u64, client_label: &str, argv: &[Bytes]) {
    let mut monitors = ctx.monitors.lock();
    if monitors.is_empty() {
        return;
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let mut line = format!(
        "+{}.{:06} [{} {}]",
        now.as_secs(),
        now.subsec_micros(),
        db,
        client_label
    );
    for arg in argv {
        line.push(' ');
        line.push('"');
        for &b in arg.iter() {
            match b {
                b'"' | b'\\' => {
                    line.push('\\');
                    line.push(b as char);
                }
                b'\n' => line.push_str("\\n"),
                b'\r' => line.push_str("\\r"),
                0x20..=0x7e => line.push(b as char),
                _ => line.push_str(&format!("\\x{b:02x}")),
            }
        }
        line.push('"');
    }
    line.push_str("\r\n");
    let payload = Bytes::from(line);

    // Drop sinks whose receiving side went away.
    monitors.retain(|tx| {
        let alive = tx.send(payload.clone()).is_ok();
        if !alive {
            debug!("Removing a disconnected monitor sink.");
        }
        alive
    });
}
