// src/core/replication/mod.rs

//! This module orchestrates the replication subsystem: the backlog feeder that
//! turns dispatcher write events into stream bytes, the supervisor cron, and
//! the per-upstream replica workers managed through `REPLICAOF`.

use crate::core::state::master::{MasterInfo, MasterLinkState};
use crate::core::state::replica::ReplicaSyncState;
use crate::core::state::ReplContext;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub mod active;
pub mod backlog;
pub mod cron;
pub mod primary;
pub mod propagation;
pub mod replica_worker;
pub mod replid;
pub mod script_cache;

/// Spawns the replication background tasks: the write-event feeder and the
/// cron, plus a worker per upstream configured with `replicaof`.
pub async fn setup_replication(ctx: &Arc<ReplContext>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    handles.push(tokio::spawn(run_backlog_feeder(
        ctx.clone(),
        ctx.subscribe_shutdown(),
    )));
    handles.push(tokio::spawn(
        cron::ReplicationCronTask::new(ctx.clone()).run(ctx.subscribe_shutdown()),
    ));

    let upstreams = {
        let config = ctx.config.lock().await;
        config.replicaof.clone()
    };
    for upstream in upstreams {
        replication_add_master(ctx, &upstream.host, upstream.port).await;
    }
    handles
}

/// A background task that drains the write-event bus into the stream encoder.
async fn run_backlog_feeder(ctx: Arc<ReplContext>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut event_rx = ctx.event_bus.subscribe();
    info!("Replication backlog feeder task is running.");

    loop {
        tokio::select! {
            result = event_rx.recv() => {
                match result {
                    Ok(event) => {
                        propagation::feed_replicas(&ctx, event.db as i64, &event.argv, event.origin)
                            .await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(
                            "Replication backlog feeder lagged. {n} events were dropped. This may cause replicas to require a full resync."
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Event bus channel closed. Replication backlog feeder shutting down.");
                        return;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Replication backlog feeder shutting down.");
                return;
            }
        }
    }
}

/// Registers a new upstream primary and returns its record, or `None` when we
/// are already replicating from that exact address ("already connected").
///
/// Without multimaster a second upstream replaces the first. When the
/// instance was a primary until now, a cached master is synthesized from our
/// own id and offset so the new upstream may answer `+CONTINUE` against our
/// history.
pub async fn replication_add_master(
    ctx: &Arc<ReplContext>,
    host: &str,
    port: u16,
) -> Option<Arc<MasterInfo>> {
    let mut masters = ctx.masters.lock().await;
    if masters
        .iter()
        .any(|mi| mi.host.eq_ignore_ascii_case(host) && mi.port == port)
    {
        return None;
    }

    let was_master = masters.is_empty();
    if !ctx.is_multimaster() {
        // Only one upstream at a time: retire the current one without
        // shifting ids (the history continues, just from elsewhere).
        for old in masters.drain(..) {
            old.set_state(MasterLinkState::None);
            old.discard_cached_master();
            old.force_cancel();
        }
    }

    // Replicas of a replica chain from the stream we are about to adopt;
    // their current history may not continue.
    if !ctx.is_active_replica() {
        ctx.disconnect_replicas("instance is becoming a replica");
    }

    let mi = Arc::new(MasterInfo::new(ctx.next_client_id(), host.to_string(), port));
    if was_master {
        replication_cache_master_using_myself(ctx, &mi);
    }
    mi.set_state(MasterLinkState::Connect);
    masters.push(mi.clone());
    drop(masters);

    tokio::spawn(
        replica_worker::ReplicaWorker::new(ctx.clone(), mi.clone()).run(ctx.subscribe_shutdown()),
    );
    info!("REPLICAOF {host}:{port} enabled");
    Some(mi)
}

/// Synthesizes a cached master from our own replication id and offset before
/// turning into a replica, so the new upstream may accept a partial resync of
/// our own history.
fn replication_cache_master_using_myself(ctx: &Arc<ReplContext>, mi: &Arc<MasterInfo>) {
    let replid = ctx.ids.replid();
    let offset = ctx.master_offset();
    mi.master_initial_offset.store(offset as i64, Ordering::SeqCst);
    *mi.master_replid.lock() = replid.clone();
    *mi.cached_master.lock() = Some(crate::core::state::master::CachedMaster {
        replid,
        reploff: offset,
        uuid: None,
    });
    info!(
        "Before turning into a replica, using my master parameters to synthesize a cached master: I may be able to synchronize with the new master with just a partial transfer."
    );
}

/// `REPLICAOF NO ONE`: removes every upstream, turning the instance into a
/// primary. The inherited replication id becomes our secondary, valid up to
/// the promotion offset, so old siblings can still PSYNC against it.
pub async fn replication_unset_masters(ctx: &Arc<ReplContext>) -> usize {
    let mut masters = ctx.masters.lock().await;
    let removed = masters.len();
    for mi in masters.drain(..) {
        ctx.ids.shift_replication_id(ctx.master_offset());
        mi.set_state(MasterLinkState::None);
        mi.discard_cached_master();
        mi.force_cancel();
        // Replicas must learn of the id change; they will partially resync
        // right back.
        if !ctx.is_active_replica() {
            ctx.disconnect_replicas("instance promoted to primary");
        }
    }
    drop(masters);
    if removed > 0 {
        info!("MASTER MODE enabled (user request)");
        // The next replicated command must re-select its database.
        ctx.replica_sel_db.store(-1, Ordering::SeqCst);
        *ctx.no_replicas_since.lock() = Instant::now();
    }
    removed
}

/// Sum of replicas currently streaming (online) as reported for `ROLE` and
/// `INFO`-style surfaces.
pub fn online_replica_count(ctx: &ReplContext) -> usize {
    ctx.replicas
        .iter()
        .filter(|entry| entry.value().state() == ReplicaSyncState::Online)
        .count()
}
