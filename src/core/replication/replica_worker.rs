// src/core/replication/replica_worker.rs

//! Implements the replication logic for the replica side of a link.
//!
//! One `ReplicaWorker` owns the entire lifecycle of this instance's
//! connection to one upstream primary: the non-blocking connect, the
//! multi-step handshake (PING, AUTH, UUID and licence exchange, port/IP and
//! capability advertisement, PSYNC), partial resume via the cached master,
//! the bulk snapshot transfer in both sized and EOF-marked framings, and the
//! live command stream. It reconnects with exponential backoff and jitter,
//! and aborts its current cycle whenever `cancel_replication_handshake` fires.

use crate::core::CitrineError;
use crate::core::engine::SnapshotLoadOptions;
use crate::core::protocol::{RespFrame, RespFrameCodec};
use crate::core::replication::{active, propagation};
use crate::core::state::master::{MasterInfo, MasterLinkState};
use crate::core::state::ReplContext;
use bytes::Bytes;
use futures::StreamExt;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader as TokioBufReader,
};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

// The initial delay before the first reconnection attempt.
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
// The maximum delay for the exponential backoff reconnection strategy.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
// Bytes written to the transfer temp file between fsyncs.
const MAX_WRITTEN_BEFORE_FSYNC: u64 = 8 * 1024 * 1024;
// Length of the diskless EOF marker.
const EOF_MARK_LEN: usize = 40;

/// The result of a successful handshake with the primary.
#[derive(PartialEq, Debug, Clone, Copy)]
enum HandshakeResult {
    /// The primary requires a full resynchronization (snapshot transfer).
    FullResync,
    /// The primary will send only the missed bytes from its backlog.
    PartialResync,
    /// The primary predates PSYNC entirely; fall back to legacy `SYNC`.
    LegacySync,
}

/// Classification of a PSYNC reply.
enum PsyncReply {
    FullResync,
    Continue,
    TryLater,
    NotSupported,
}

/// The main worker task for one upstream primary link.
pub struct ReplicaWorker {
    ctx: Arc<ReplContext>,
    mi: Arc<MasterInfo>,
    /// The db selected by the primary's command stream.
    current_db: u64,
}

impl ReplicaWorker {
    pub fn new(ctx: Arc<ReplContext>, mi: Arc<MasterInfo>) -> Self {
        Self {
            ctx,
            mi,
            current_db: 0,
        }
    }

    /// The main run loop: manages connection cycles and reconnection with
    /// exponential backoff. Exits when the upstream is removed (REPLICAOF NO
    /// ONE or replacement) or on shutdown.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "Replica worker started for primary {}:{}.",
            self.mi.host, self.mi.port
        );
        let mut current_delay = INITIAL_RECONNECT_DELAY;
        let mut cancel_rx = self.mi.subscribe_cancel();
        let link_label = format!("{}:{}", self.mi.host, self.mi.port);

        loop {
            if !self.still_registered().await || self.mi.state() == MasterLinkState::None {
                info!(
                    "Primary {link_label} is no longer configured. Stopping its replica worker."
                );
                return;
            }
            cancel_rx.borrow_and_update();

            let cycle_ended_clean;
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Replica worker shutting down.");
                    return;
                }
                _ = cancel_rx.changed() => {
                    info!("Replication cycle cancelled for {link_label}.");
                    current_delay = INITIAL_RECONNECT_DELAY;
                    continue;
                }
                result = self.handle_connection_cycle() => {
                    match result {
                        Ok(()) => {
                            info!("Connection to primary closed cleanly. Reconnecting...");
                            cycle_ended_clean = true;
                        }
                        Err(e) => {
                            warn!("Replication cycle failed: {e}. Reconnecting...");
                            cycle_ended_clean = false;
                        }
                    }
                }
            }

            // A broken link is cached for PSYNC resume; a broken handshake is
            // torn down through the single cancellation path.
            match self.mi.state() {
                MasterLinkState::Connected => {
                    info!("Caching the disconnected master state.");
                    self.mi.cache_master();
                    self.mi.set_state(MasterLinkState::Connect);
                }
                MasterLinkState::Connect | MasterLinkState::None => {}
                _ => {
                    self.mi.cancel_replication_handshake();
                }
            }
            if cycle_ended_clean {
                current_delay = INITIAL_RECONNECT_DELAY;
            }

            // Jitter avoids a thundering herd when a primary restarts.
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
            let wait_time = current_delay + jitter;
            info!("Will try to reconnect to primary in {wait_time:?}");
            tokio::select! {
                _ = tokio::time::sleep(wait_time) => {}
                _ = shutdown_rx.recv() => { info!("Replica worker shutting down during backoff."); return; }
                _ = cancel_rx.changed() => { current_delay = INITIAL_RECONNECT_DELAY; continue; }
            }
            current_delay = (current_delay * 2).min(MAX_RECONNECT_DELAY);
        }
    }

    async fn still_registered(&self) -> bool {
        self.ctx
            .masters
            .lock()
            .await
            .iter()
            .any(|mi| Arc::ptr_eq(mi, &self.mi))
    }

    /// Manages a single connection lifecycle: connect, handshake, sync, and
    /// live stream processing.
    async fn handle_connection_cycle(&mut self) -> Result<(), CitrineError> {
        self.current_db = 0;

        let addr = format!("{}:{}", self.mi.host, self.mi.port);
        info!("Attempting to connect to primary at {}", addr);
        self.mi.set_state(MasterLinkState::Connecting);
        let connect_timeout = self.syncio_timeout().await;
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| CitrineError::ReplicationError("Connect timed out".to_string()))?
            .map_err(|e| CitrineError::ReplicationError(format!("Failed to connect: {e}")))?;
        self.mi.touch_io();
        info!("Successfully connected to primary. Starting handshake...");

        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = TokioBufReader::new(reader);

        let handshake_result = self.perform_handshake(&mut reader, &mut writer).await?;
        debug!("Handshake completed with result: {handshake_result:?}");

        if handshake_result != HandshakeResult::PartialResync {
            if handshake_result == HandshakeResult::LegacySync {
                info!("Retrying with SYNC...");
                writer.write_all(b"SYNC\r\n").await?;
            }
            self.receive_and_load_snapshot(&mut reader).await?;
            info!("MASTER <-> REPLICA sync: Finished with success");
        } else {
            info!("MASTER <-> REPLICA sync: Master accepted a Partial Resynchronization.");
        }

        self.process_command_stream(reader, writer).await
    }

    async fn syncio_timeout(&self) -> Duration {
        let config = self.ctx.config.lock().await;
        Duration::from_secs(config.replication.repl_syncio_timeout.max(1))
    }

    /// Sends one handshake command as a multibulk.
    async fn send_command<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        args: &[&str],
    ) -> Result<(), CitrineError> {
        let argv: Vec<Bytes> = args
            .iter()
            .map(|a| Bytes::copy_from_slice(a.as_bytes()))
            .collect();
        let encoded = RespFrame::from_argv(&argv).encode_to_bytes()?;
        writer.write_all(&encoded).await?;
        Ok(())
    }

    /// Reads one reply line, skipping the bare newlines a busy primary emits
    /// as keep-alives. Bounded by the handshake IO timeout.
    async fn read_reply<R: AsyncBufReadExt + Unpin>(
        &self,
        reader: &mut R,
    ) -> Result<String, CitrineError> {
        let io_timeout = self.syncio_timeout().await;
        loop {
            let mut line = String::new();
            let n = tokio::time::timeout(io_timeout, reader.read_line(&mut line))
                .await
                .map_err(|_| {
                    CitrineError::ReplicationError("Timeout reading from primary".to_string())
                })??;
            if n == 0 {
                return Err(CitrineError::ReplicationError(
                    "Connection closed during handshake".to_string(),
                ));
            }
            self.mi.touch_io();
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                continue;
            }
            return Ok(trimmed.to_string());
        }
    }

    /// Drives the handshake state machine through to the PSYNC decision.
    async fn perform_handshake<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<HandshakeResult, CitrineError>
    where
        R: AsyncBufReadExt + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (masteruser, masterauth, announce_ip, announce_port, license_key, my_port, active) = {
            let config = self.ctx.config.lock().await;
            (
                config.replication.masteruser.clone(),
                config.replication.masterauth.clone(),
                config.replication.replica_announce_ip.clone(),
                config.replication.replica_announce_port,
                config.replication.license_key.clone(),
                config.port,
                config.replication.active_replica || config.replication.enable_multimaster,
            )
        };

        // Step 1: PING. A positive reply or an auth-related error both mean
        // the primary is alive; credentials come next.
        self.send_command(writer, &["PING"]).await?;
        self.mi.set_state(MasterLinkState::ReceivePong);
        let reply = self.read_reply(reader).await?;
        if !reply.starts_with('+')
            && !reply.starts_with("-NOAUTH")
            && !reply.starts_with("-ERR operation not permitted")
        {
            return Err(CitrineError::ReplicationError(format!(
                "Error reply to PING from primary: '{reply}'"
            )));
        }
        info!("Primary replied to PING, replication can continue...");

        // Step 2: AUTH, skipped without credentials.
        self.mi.set_state(MasterLinkState::SendAuth);
        if masterauth.is_some() {
            let pass = masterauth.as_deref().unwrap_or_default();
            match masteruser.as_deref() {
                Some(user) => self.send_command(writer, &["AUTH", user, pass]).await?,
                None => self.send_command(writer, &["AUTH", pass]).await?,
            }
            self.mi.set_state(MasterLinkState::ReceiveAuth);
            let reply = self.read_reply(reader).await?;
            if reply.starts_with('-') {
                return Err(CitrineError::ReplicationError(format!(
                    "Unable to AUTH to primary: {reply}"
                )));
            }
        }

        // Step 3: UUID exchange. The peer's UUID is what loop suppression
        // keys on; a primary that does not understand the option is tolerated.
        self.mi.set_state(MasterLinkState::SendUuid);
        let my_uuid = self.ctx.uuid.to_string();
        self.send_command(writer, &["REPLCONF", "uuid", &my_uuid])
            .await?;
        self.mi.set_state(MasterLinkState::ReceiveUuid);
        let reply = self.read_reply(reader).await?;
        if reply.starts_with('-') {
            warn!("non-fatal: Primary doesn't understand REPLCONF uuid");
            *self.mi.master_uuid.lock() = None;
        } else {
            let raw = reply.trim_start_matches('+');
            match uuid::Uuid::parse_str(raw) {
                Ok(peer) => *self.mi.master_uuid.lock() = Some(peer),
                Err(_) => {
                    return Err(CitrineError::ReplicationError(
                        "Primary replied with a UUID we don't understand".to_string(),
                    ));
                }
            }
        }

        // Step 4: licence key, only when one is configured. The primary
        // rejects a duplicate key outright.
        self.mi.set_state(MasterLinkState::SendKey);
        if let Some(key) = license_key.as_deref() {
            self.send_command(writer, &["REPLCONF", "license", key])
                .await?;
            self.mi.set_state(MasterLinkState::KeyAck);
            let reply = self.read_reply(reader).await?;
            if reply.starts_with('-') {
                return Err(CitrineError::ReplicationError(format!(
                    "Primary rejected our licence key: {reply}"
                )));
            }
        }

        // Step 5: advertise our listening port.
        self.mi.set_state(MasterLinkState::SendPort);
        let port = announce_port.unwrap_or(my_port).to_string();
        self.send_command(writer, &["REPLCONF", "listening-port", &port])
            .await?;
        self.mi.set_state(MasterLinkState::ReceivePort);
        let reply = self.read_reply(reader).await?;
        if reply.starts_with('-') {
            info!("(Non critical) Primary does not understand REPLCONF listening-port: {reply}");
        }

        // Step 6: advertise our IP, only when one is configured.
        self.mi.set_state(MasterLinkState::SendIp);
        if let Some(ip) = announce_ip.as_deref() {
            self.send_command(writer, &["REPLCONF", "ip-address", ip])
                .await?;
            self.mi.set_state(MasterLinkState::ReceiveIp);
            let reply = self.read_reply(reader).await?;
            if reply.starts_with('-') {
                info!("(Non critical) Primary does not understand REPLCONF ip-address: {reply}");
            }
        }

        // Step 7: capabilities. EOF enables diskless transfers, psync2 the
        // two-id protocol; active replicas expire keys on their own.
        self.mi.set_state(MasterLinkState::SendCapa);
        if active {
            self.send_command(
                writer,
                &[
                    "REPLCONF",
                    "capa",
                    "eof",
                    "capa",
                    "psync2",
                    "capa",
                    "activeExpire",
                ],
            )
            .await?;
        } else {
            self.send_command(writer, &["REPLCONF", "capa", "eof", "capa", "psync2"])
                .await?;
        }
        self.mi.set_state(MasterLinkState::ReceiveCapa);
        let reply = self.read_reply(reader).await?;
        if reply.starts_with('-') {
            info!("(Non critical) Primary does not understand REPLCONF capa: {reply}");
        }

        // Step 8: PSYNC.
        self.mi.set_state(MasterLinkState::SendPsync);
        self.mi.master_initial_offset.store(-1, Ordering::SeqCst);
        let cached = self.mi.cached_master.lock().clone();
        let (psync_replid, psync_offset) = match (&cached, active) {
            (Some(cached), false) => {
                info!(
                    "Trying a partial resynchronization (request {}:{}).",
                    cached.replid,
                    cached.reploff + 1
                );
                (cached.replid.clone(), (cached.reploff + 1).to_string())
            }
            _ => {
                info!("Partial resynchronization not possible (no cached master)");
                ("?".to_string(), "-1".to_string())
            }
        };
        self.send_command(writer, &["PSYNC", &psync_replid, &psync_offset])
            .await?;
        self.mi.set_state(MasterLinkState::ReceivePsync);
        let reply = self.read_reply(reader).await?;

        match self.classify_psync_reply(&reply)? {
            PsyncReply::Continue => {
                self.resurrect_cached_master(&reply).await?;
                return Ok(HandshakeResult::PartialResync);
            }
            PsyncReply::TryLater => {
                return Err(CitrineError::ReplicationError(format!(
                    "Primary is currently unable to PSYNC but should be in the future: {reply}"
                )));
            }
            PsyncReply::FullResync => {
                self.prepare_for_new_history().await;
                return Ok(HandshakeResult::FullResync);
            }
            PsyncReply::NotSupported => {
                info!("Primary does not support PSYNC or is in error state (reply: {reply})");
                self.mi.discard_cached_master();
                self.prepare_for_new_history().await;
                return Ok(HandshakeResult::LegacySync);
            }
        }
    }

    fn classify_psync_reply(&self, reply: &str) -> Result<PsyncReply, CitrineError> {
        if reply.starts_with("+FULLRESYNC") {
            let parts: Vec<&str> = reply.split_whitespace().collect();
            if parts.len() != 3 || parts[1].len() != crate::core::replication::replid::REPLID_LEN {
                // The primary supports PSYNC but the reply is malformed; blank
                // the recorded id so later PSYNC attempts cannot match it.
                warn!("Primary replied with wrong +FULLRESYNC syntax.");
                *self.mi.master_replid.lock() = String::new();
            } else {
                let offset: i64 = parts[2].parse().map_err(|_| {
                    CitrineError::ReplicationError("Invalid offset in FULLRESYNC".to_string())
                })?;
                *self.mi.master_replid.lock() = parts[1].to_string();
                self.mi.master_initial_offset.store(offset, Ordering::SeqCst);
                info!("Full resync from primary: {}:{offset}", parts[1]);
            }
            self.mi.discard_cached_master();
            return Ok(PsyncReply::FullResync);
        }
        if reply.starts_with("+CONTINUE") {
            info!("Successful partial resynchronization with primary.");
            return Ok(PsyncReply::Continue);
        }
        if reply.starts_with("-NOMASTERLINK") || reply.starts_with("-LOADING") {
            return Ok(PsyncReply::TryLater);
        }
        if !reply.starts_with("-ERR") {
            warn!("Unexpected reply to PSYNC from primary: {reply}");
        }
        Ok(PsyncReply::NotSupported)
    }

    /// `+CONTINUE [<new-replid>]`: reinstates the cached master on this link.
    /// If the primary advertises a changed replication id, the old id becomes
    /// our secondary so sub-replicas can still PSYNC against it.
    async fn resurrect_cached_master(&mut self, reply: &str) -> Result<(), CitrineError> {
        let mut cached = self.mi.cached_master.lock().take().ok_or_else(|| {
            CitrineError::ReplicationError(
                "Primary accepted +CONTINUE but no cached master exists".to_string(),
            )
        })?;

        let tail = reply["+CONTINUE".len()..].trim();
        if tail.len() == crate::core::replication::replid::REPLID_LEN && tail != cached.replid {
            warn!("Master replication ID changed to {tail}");
            self.ctx
                .ids
                .shift_to(&cached.replid, tail, self.ctx.master_offset());
            cached.replid = tail.to_string();
            // Sub-replicas must learn of the id change; they will be able to
            // partially resync right back.
            if !self.ctx.is_active_replica() {
                self.ctx.disconnect_replicas("replication id changed");
            }
        }

        *self.mi.master_replid.lock() = cached.replid.clone();
        self.mi.reploff.store(cached.reploff, Ordering::SeqCst);
        if self.mi.master_uuid.lock().is_none() {
            *self.mi.master_uuid.lock() = cached.uuid;
        }
        *self.mi.link_established.lock() = Some(Instant::now());
        *self.mi.down_since.lock() = None;
        self.mi.set_state(MasterLinkState::Connected);

        // A restarted instance that resumed from snapshot metadata may not
        // have a backlog yet; sub-replicas need one to PSYNC against.
        if !self.ctx.backlog.is_created().await {
            let size = {
                let config = self.ctx.config.lock().await;
                config.replication.repl_backlog_size
            };
            self.ctx.backlog.create(size).await;
        }
        Ok(())
    }

    /// A full (or legacy) resync replaces our dataset with a different
    /// history, so chained replicas cannot be fed incrementally across it.
    async fn prepare_for_new_history(&self) {
        if !self.ctx.is_active_replica() {
            let master_uuid = *self.mi.master_uuid.lock();
            self.ctx
                .disconnect_replicas_except(master_uuid.as_ref(), "primary history changed");
            self.ctx.backlog.free().await;
        } else if !self.ctx.replicas.is_empty() {
            self.ctx.ids.change_replication_id();
            self.ctx.ids.clear_replication_id2();
        } else {
            self.ctx.backlog.free().await;
        }
    }

    /// Receives the bulk snapshot payload (sized or EOF-marked framing) into
    /// a temp file, loads it through the snapshot engine, and finalizes the
    /// link state and replication ids.
    async fn receive_and_load_snapshot<R>(&mut self, reader: &mut R) -> Result<(), CitrineError>
    where
        R: AsyncBufReadExt + AsyncRead + Unpin,
    {
        self.mi.set_state(MasterLinkState::Transfer);

        // Read the bulk header; bare newlines before it are keep-alives.
        let header = self.read_reply(reader).await?;
        if let Some(err) = header.strip_prefix('-') {
            return Err(CitrineError::ReplicationError(format!(
                "Primary aborted replication with an error: {err}"
            )));
        }
        let Some(header) = header.strip_prefix('$') else {
            return Err(CitrineError::ReplicationError(format!(
                "Bad protocol from primary, the first byte is not '$' (we received '{header}')"
            )));
        };

        let eof_mark: Option<[u8; EOF_MARK_LEN]> = if let Some(mark) = header.strip_prefix("EOF:") {
            if mark.len() < EOF_MARK_LEN {
                return Err(CitrineError::ReplicationError(
                    "Diskless transfer marker is too short".to_string(),
                ));
            }
            let mut buf = [0u8; EOF_MARK_LEN];
            buf.copy_from_slice(&mark.as_bytes()[..EOF_MARK_LEN]);
            info!("MASTER <-> REPLICA sync: receiving streamed snapshot from primary");
            Some(buf)
        } else {
            None
        };
        let declared_size: Option<u64> = match eof_mark {
            Some(_) => None,
            None => {
                let size = header.parse::<u64>().map_err(|_| {
                    CitrineError::ReplicationError(format!("Invalid bulk length: {header}"))
                })?;
                info!("MASTER <-> REPLICA sync: receiving {size} bytes from primary");
                Some(size)
            }
        };

        let tmp_path = self.transfer_tmpfile_path().await;
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        *self.mi.transfer_tmpfile.lock() = Some(tmp_path.clone());

        let mut total: u64 = 0;
        let mut last_fsync: u64 = 0;
        let mut lastbytes = [0u8; EOF_MARK_LEN];
        let mut eof_reached = declared_size == Some(0);
        let mut buf = [0u8; 4096];

        while !eof_reached {
            let want = match declared_size {
                Some(size) => ((size - total) as usize).min(buf.len()),
                None => buf.len(),
            };
            let n = reader.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(CitrineError::ReplicationError(
                    "Connection lost during bulk transfer".to_string(),
                ));
            }
            if let Some(mark) = &eof_mark {
                roll_tail(&mut lastbytes, &buf[..n]);
                if &lastbytes == mark {
                    eof_reached = true;
                }
            }
            file.write_all(&buf[..n]).await?;
            total += n as u64;
            self.mi.touch_io();

            if total >= last_fsync + MAX_WRITTEN_BEFORE_FSYNC {
                file.sync_data().await?;
                last_fsync = total;
            }
            if declared_size == Some(total) {
                eof_reached = true;
            }
        }

        // The trailing marker is not part of the payload.
        if eof_mark.is_some() {
            total = total.saturating_sub(EOF_MARK_LEN as u64);
            file.set_len(total).await?;
        }
        file.sync_all().await?;
        drop(file);

        let active = self.ctx.is_active_replica();
        let lazy_flush = {
            let config = self.ctx.config.lock().await;
            config.replication.repl_replica_lazy_flush
        };
        info!(
            "MASTER <-> REPLICA sync: {}",
            if active { "Keeping old data" } else { "Flushing old data" }
        );
        info!("MASTER <-> REPLICA sync: Loading DB in memory");

        let payload = Bytes::from(tokio::fs::read(&tmp_path).await?);
        let opts = SnapshotLoadOptions {
            flush_before: !active,
            lazy_flush,
            mvcc_min: if active {
                self.mi.mvcc_last_sync.load(Ordering::SeqCst)
            } else {
                0
            },
            collect_stale_keys: active,
        };
        let report = match self.ctx.engines.snapshots.load(payload, opts).await {
            Ok(report) => report,
            Err(e) => {
                error!("Failed trying to load the MASTER synchronization DB: {e}");
                return Err(CitrineError::ReplicationError(format!(
                    "Snapshot loading failed: {e}"
                )));
            }
        };
        if active {
            self.mi.queue_stale_keys(report.stale_keys);
        }
        self.current_db = report.metadata.repl_stream_db;

        let _ = tokio::fs::remove_file(&tmp_path).await;
        *self.mi.transfer_tmpfile.lock() = None;

        // Final setup of the connected replica <- primary link.
        let master_replid = self.mi.master_replid.lock().clone();
        let initial_offset = self.mi.master_initial_offset.load(Ordering::SeqCst).max(0) as u64;
        self.mi.reploff.store(initial_offset, Ordering::SeqCst);
        *self.mi.link_established.lock() = Some(Instant::now());
        *self.mi.down_since.lock() = None;
        self.mi.set_state(MasterLinkState::Connected);

        if active {
            // Both peers converge on the same lineage tag after reciprocal
            // full syncs.
            self.ctx.ids.merge_replication_id(&master_replid);
        } else {
            self.ctx.ids.set_replid(&master_replid);
            self.ctx
                .master_offset
                .store(initial_offset, Ordering::SeqCst);
        }
        self.ctx.ids.clear_replication_id2();

        // Replicas accumulate a backlog regardless of having sub-replicas, so
        // they can serve PSYNC if promoted after a failover.
        if !self.ctx.backlog.is_created().await {
            let size = {
                let config = self.ctx.config.lock().await;
                config.replication.repl_backlog_size
            };
            self.ctx.backlog.create(size).await;
        }
        Ok(())
    }

    async fn transfer_tmpfile_path(&self) -> PathBuf {
        let dir = {
            let config = self.ctx.config.lock().await;
            config
                .replication
                .transfer_tmp_dir
                .clone()
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir)
        };
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        dir.join(format!("temp-{}.{}.rdb", millis, std::process::id()))
    }

    /// Processes the live command stream, sending a cumulative ACK once per
    /// second and on demand.
    async fn process_command_stream<R, W>(
        &mut self,
        reader: TokioBufReader<R>,
        mut writer: W,
    ) -> Result<(), CitrineError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!("Now in sync mode, processing command stream from primary.");
        let mut framed = FramedRead::new(reader, RespFrameCodec);
        let mut ack_interval = tokio::time::interval(Duration::from_secs(1));
        ack_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ack_interval.tick() => {
                    self.send_ack(&mut writer).await?;
                }
                frame = framed.next() => {
                    match frame {
                        None => return Ok(()),
                        Some(Err(e)) => {
                            return Err(CitrineError::ReplicationError(format!(
                                "Protocol error on primary stream: {e}"
                            )));
                        }
                        Some(Ok(frame)) => {
                            self.handle_primary_frame(frame, &mut writer).await?;
                        }
                    }
                }
            }
        }
    }

    async fn handle_primary_frame<W: AsyncWrite + Unpin>(
        &mut self,
        frame: RespFrame,
        writer: &mut W,
    ) -> Result<(), CitrineError> {
        let raw = frame.encode_to_bytes()?;

        // A chained replica proxies the identical stream to its sub-replicas
        // before applying it, so their offsets track ours byte for byte.
        if !self.ctx.is_active_replica() {
            propagation::feed_replicas_from_master_stream(&self.ctx, &raw).await;
        }
        self.mi.advance_reploff(raw.len() as u64);
        self.mi.touch_io();

        let argv = frame.to_argv()?;
        let name = String::from_utf8_lossy(&argv[0]).to_ascii_uppercase();
        debug!("Received command from primary: {name}");
        match name.as_str() {
            "PING" => {}
            "SELECT" => {
                self.current_db = std::str::from_utf8(&argv[1])
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or(CitrineError::NotAnInteger)?;
            }
            "REPLCONF" => {
                if argv
                    .get(1)
                    .is_some_and(|arg| arg.eq_ignore_ascii_case(b"GETACK"))
                {
                    self.send_ack(writer).await?;
                }
            }
            "RREPLAY" => {
                active::replica_replay(&self.ctx, &self.mi, &argv, self.current_db).await?;
            }
            _ => {
                if let Err(e) = self.ctx.engines.sink.apply(self.current_db, argv).await {
                    // The dataset can no longer be trusted to match the
                    // primary's; force a full resync on reconnect.
                    error!(
                        "CRITICAL: Failed to execute propagated command '{name}': {e}. Forcing full resync."
                    );
                    self.mi.discard_cached_master();
                    return Err(CitrineError::ReplicationError(format!(
                        "Failed to apply propagated command: {e}"
                    )));
                }
            }
        }
        Ok(())
    }

    async fn send_ack<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), CitrineError> {
        let offset = self.mi.reploff();
        let argv = vec![
            Bytes::from_static(b"REPLCONF"),
            Bytes::from_static(b"ACK"),
            Bytes::from(offset.to_string()),
        ];
        let encoded = RespFrame::from_argv(&argv).encode_to_bytes()?;
        writer.write_all(&encoded).await?;
        debug!("Sent ACK to primary with offset {offset}");
        Ok(())
    }
}

/// Maintains a rolling window of the last `EOF_MARK_LEN` bytes seen.
fn roll_tail(tail: &mut [u8; EOF_MARK_LEN], chunk: &[u8]) {
    if chunk.len() >= EOF_MARK_LEN {
        tail.copy_from_slice(&chunk[chunk.len() - EOF_MARK_LEN..]);
    } else {
        tail.rotate_left(chunk.len());
        tail[EOF_MARK_LEN - chunk.len()..].copy_from_slice(chunk);
    }
}
