// src/core/replication/cron.rs

//! The once-per-second replication supervisor: enforces handshake and idle
//! timeouts, emits keep-alives, releases an unused backlog, launches delayed
//! diskless snapshots, drains stale-key queues, and refreshes the good-replica
//! count.

use crate::core::replication::{primary, propagation};
use crate::core::state::master::MasterLinkState;
use crate::core::state::replica::{ReplicaCapa, ReplicaDirective, ReplicaSyncState};
use crate::core::state::ReplContext;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

const CRON_INTERVAL: Duration = Duration::from_secs(1);

/// The background supervisor task for the replication subsystem.
pub struct ReplicationCronTask {
    ctx: Arc<ReplContext>,
    loops: u64,
}

impl ReplicationCronTask {
    pub fn new(ctx: Arc<ReplContext>) -> Self {
        Self { ctx, loops: 0 }
    }

    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Replication cron task started.");
        let mut interval = tokio::time::interval(CRON_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                    self.loops += 1;
                }
                _ = shutdown_rx.recv() => {
                    info!("Replication cron task shutting down.");
                    return;
                }
            }
        }
    }

    async fn tick(&self) {
        let (
            repl_timeout,
            ping_period,
            backlog_time_limit,
            diskless,
            diskless_delay,
        ) = {
            let config = self.ctx.config.lock().await;
            (
                Duration::from_secs(config.replication.repl_timeout),
                config.replication.repl_ping_replica_period,
                config.replication.repl_backlog_time_limit,
                config.replication.repl_diskless_sync,
                config.replication.repl_diskless_sync_delay,
            )
        };

        self.supervise_masters(repl_timeout).await;
        self.ping_replicas(ping_period).await;
        self.keepalive_presync_replicas().await;
        self.disconnect_timedout_replicas(repl_timeout);
        self.release_idle_backlog(backlog_time_limit).await;
        self.flush_unused_script_cache();
        self.start_delayed_snapshot(diskless, diskless_delay).await;
        self.drain_stale_keys().await;
        self.ctx.refresh_good_replicas_count().await;
    }

    /// Timeout enforcement for every upstream link. The worker owns the
    /// socket; the cron only observes wall-clock staleness and fires the
    /// shared cancellation path.
    async fn supervise_masters(&self, repl_timeout: Duration) {
        let masters = self.ctx.masters.lock().await.clone();
        for mi in masters {
            let state = mi.state();
            let idle = mi.io_idle();

            if (state == MasterLinkState::Connecting || state.is_handshake())
                && idle > repl_timeout
            {
                warn!("Timeout connecting to the MASTER...");
                mi.cancel_replication_handshake();
                continue;
            }

            if state == MasterLinkState::Transfer && idle > repl_timeout {
                warn!(
                    "Timeout receiving bulk data from MASTER... If the problem persists try to set the 'repl_timeout' parameter to a larger value."
                );
                mi.cancel_replication_handshake();
                continue;
            }

            if state == MasterLinkState::Connected && idle > repl_timeout {
                warn!("MASTER timeout: no data nor PING received...");
                mi.drop_timed_out_link();
            }
        }
    }

    /// Periodic PING broadcast, so replicas can detect a dead link even when
    /// the TCP connection stays up. The PING travels the ordinary stream and
    /// advances offsets like any other command.
    async fn ping_replicas(&self, ping_period: u64) {
        if ping_period == 0 || self.ctx.replicas.is_empty() {
            return;
        }
        if self.loops % ping_period != 0 {
            return;
        }
        let argv = [Bytes::from_static(b"PING")];
        propagation::feed_replicas(&self.ctx, -1, &argv, None).await;
    }

    /// Replicas still waiting for their snapshot get a raw newline, which
    /// refreshes their timers without touching replication offsets.
    async fn keepalive_presync_replicas(&self) {
        let disk_job = matches!(
            self.ctx.snapshot_dispatch.current().await,
            Some(job) if job.target == primary::SnapshotTarget::Disk
        );
        for entry in self.ctx.replicas.iter() {
            let replica = entry.value();
            let is_presync = replica.state() == ReplicaSyncState::WaitBgsaveStart
                || (replica.state() == ReplicaSyncState::WaitBgsaveEnd && disk_job);
            if is_presync {
                replica.send_directive(ReplicaDirective::Keepalive);
            }
        }
    }

    fn disconnect_timedout_replicas(&self, repl_timeout: Duration) {
        for entry in self.ctx.replicas.iter() {
            let replica = entry.value();
            if replica.state() != ReplicaSyncState::Online || replica.attrs.pre_psync {
                continue;
            }
            if replica.ack_age() > repl_timeout {
                warn!("Disconnecting timedout replica: {}", replica.addr);
                replica.send_directive(ReplicaDirective::Close { reason: None });
            }
        }
    }

    /// A primary without replicas or an upstream frees the backlog after the
    /// configured idle period, changing its replication id at the same time:
    /// the offset stops moving while there is no backlog, so keeping the old
    /// id could later satisfy a PSYNC for a diverged history.
    async fn release_idle_backlog(&self, backlog_time_limit: u64) {
        if backlog_time_limit == 0
            || !self.ctx.replicas.is_empty()
            || self.ctx.has_masters().await
            || !self.ctx.backlog.is_created().await
        {
            return;
        }
        let idle = self.ctx.no_replicas_since.lock().elapsed();
        if idle > Duration::from_secs(backlog_time_limit) {
            self.ctx.ids.change_replication_id();
            self.ctx.ids.clear_replication_id2();
            self.ctx.backlog.free().await;
            info!(
                "Replication backlog freed after {backlog_time_limit} seconds without connected replicas."
            );
        }
    }

    /// With no replicas and no AOF there is nobody left who could need a
    /// cached script digest.
    fn flush_unused_script_cache(&self) {
        if self.ctx.replicas.is_empty()
            && !self.ctx.is_aof_enabled()
            && !self.ctx.script_cache.is_empty()
        {
            self.ctx.script_cache.flush();
        }
    }

    /// Launches the snapshot for replicas parked in `WaitBgsaveStart`. For
    /// diskless syncs the start is delayed so more replicas can attach to the
    /// same stream.
    async fn start_delayed_snapshot(&self, diskless: bool, diskless_delay: u64) {
        if self.ctx.snapshot_dispatch.current().await.is_some() {
            return;
        }
        let mut mincapa: Option<ReplicaCapa> = None;
        let mut max_idle = Duration::ZERO;
        for entry in self.ctx.replicas.iter() {
            let replica = entry.value();
            if replica.state() != ReplicaSyncState::WaitBgsaveStart {
                continue;
            }
            max_idle = max_idle.max(replica.idle());
            let capa = replica.attrs.capa();
            mincapa = Some(mincapa.map_or(capa, |m| m & capa));
        }
        let Some(mincapa) = mincapa else {
            return;
        };
        if !diskless || max_idle > Duration::from_secs(diskless_delay) {
            if let Err(e) = primary::start_snapshot_for_replication(&self.ctx, mincapa).await {
                warn!("Failed to start snapshot for waiting replicas: {e}");
            }
        }
    }

    /// Emits the queued stale-key deletions toward each upstream peer, over
    /// the replica channel that leads back to it.
    async fn drain_stale_keys(&self) {
        let masters = self.ctx.masters.lock().await.clone();
        for mi in masters {
            if mi.state() != MasterLinkState::Connected {
                continue;
            }
            let stale = std::mem::take(&mut *mi.stale_keys.lock());
            if stale.is_empty() {
                continue;
            }
            let Some(uuid) = *mi.master_uuid.lock() else {
                continue;
            };
            let Some(replica) = self.ctx.replica_by_uuid(&uuid) else {
                continue;
            };
            for (db, keys) in stale {
                for key in keys {
                    let argv = [Bytes::from_static(b"DEL"), key];
                    propagation::feed_one_replica(&self.ctx, &replica, db, &argv);
                }
            }
        }
    }
}

impl ReplicationCronTask {
    /// Exposes a single supervision pass for tests.
    pub async fn tick_once(&self) {
        self.tick().await;
    }
}
