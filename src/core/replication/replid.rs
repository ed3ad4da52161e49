// src/core/replication/replid.rs

//! Manages the pair of replication identifiers naming this instance's history
//! lineage.
//!
//! `replid` names the current history; `replid2` is the inherited previous
//! lineage, valid only up to `second_replid_offset`. Keeping both lets a
//! promoted replica answer PSYNC requests issued against its old primary's
//! lineage up to the promotion point.

use parking_lot::RwLock;
use tracing::warn;

/// Replication ids are 40 lowercase hex characters.
pub const REPLID_LEN: usize = 40;

/// The all-zeroes id used while the secondary slot is invalid.
fn null_replid() -> String {
    "0".repeat(REPLID_LEN)
}

/// Generates a fresh random replication id.
pub fn random_replid() -> String {
    let mut raw = [0u8; REPLID_LEN / 2];
    if getrandom::fill(&mut raw).is_err() {
        // Extremely unlikely; fall back to a time-derived pattern rather than
        // aborting replication setup.
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        return format!("{now:040x}");
    }
    hex::encode(raw)
}

#[derive(Debug, Clone)]
struct IdPair {
    replid: String,
    replid2: String,
    /// Offset up to which `replid2` can answer PSYNC. `-1` when invalid.
    second_replid_offset: i64,
}

/// Thread-safe holder for the two lineage identifiers.
#[derive(Debug)]
pub struct ReplicationIds {
    inner: RwLock<IdPair>,
}

impl ReplicationIds {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(IdPair {
                replid: random_replid(),
                replid2: null_replid(),
                second_replid_offset: -1,
            }),
        }
    }

    pub fn replid(&self) -> String {
        self.inner.read().replid.clone()
    }

    pub fn replid2(&self) -> String {
        self.inner.read().replid2.clone()
    }

    pub fn second_replid_offset(&self) -> i64 {
        self.inner.read().second_replid_offset
    }

    /// Replaces the current id wholesale, e.g. when adopting the primary's
    /// lineage after a full resync.
    pub fn set_replid(&self, id: &str) {
        self.inner.write().replid = id.to_string();
    }

    /// Fills the current id with fresh random hex. Used whenever a new history
    /// begins.
    pub fn change_replication_id(&self) {
        self.inner.write().replid = random_replid();
    }

    /// Invalidates the secondary id, e.g. after a full resynchronization.
    pub fn clear_replication_id2(&self) {
        let mut inner = self.inner.write();
        inner.replid2 = null_replid();
        inner.second_replid_offset = -1;
    }

    /// Moves the current id to the secondary slot, valid up to
    /// `master_offset + 1`, and mints a fresh current id. The `+ 1` accounts
    /// for replicas asking for the first byte they have not yet received.
    pub fn shift_replication_id(&self, master_offset: u64) {
        let mut inner = self.inner.write();
        inner.replid2 = inner.replid.clone();
        inner.second_replid_offset = master_offset as i64 + 1;
        inner.replid = random_replid();
        warn!(
            "Setting secondary replication ID to {}, valid up to offset: {}. New replication ID is {}",
            inner.replid2, inner.second_replid_offset, inner.replid
        );
    }

    /// Adopts a changed upstream lineage mid-stream (`+CONTINUE <new-replid>`):
    /// the id we tracked until now becomes the secondary, valid up to
    /// `master_offset + 1`, and `new_id` becomes current — so our own
    /// sub-replicas can still PSYNC across the switch.
    pub fn shift_to(&self, old_id: &str, new_id: &str, master_offset: u64) {
        let mut inner = self.inner.write();
        inner.replid2 = old_id.to_string();
        inner.second_replid_offset = master_offset as i64 + 1;
        inner.replid = new_id.to_string();
    }

    /// Folds another instance's id into the local one, one hex digit at a
    /// time via XOR. Commutative and self-inverse, so two active replicas that
    /// merge each other's ids after reciprocal full syncs converge on the same
    /// lineage tag.
    pub fn merge_replication_id(&self, other: &str) {
        const CHARSET: &[u8] = b"0123456789abcdef";
        let mut inner = self.inner.write();
        let merged: String = inner
            .replid
            .bytes()
            .zip(other.bytes())
            .map(|(a, b)| CHARSET[(hex_digit(a) ^ hex_digit(b)) as usize] as char)
            .collect();
        if merged.len() == REPLID_LEN {
            inner.replid = merged;
        } else {
            warn!("Refusing to merge malformed replication id '{other}'");
        }
    }

    /// Returns `(replid, replid2, second_replid_offset)` under one lock.
    pub fn snapshot(&self) -> (String, String, i64) {
        let inner = self.inner.read();
        (
            inner.replid.clone(),
            inner.replid2.clone(),
            inner.second_replid_offset,
        )
    }
}

impl Default for ReplicationIds {
    fn default() -> Self {
        Self::new()
    }
}

fn hex_digit(ch: u8) -> u8 {
    match ch {
        b'0'..=b'9' => ch - b'0',
        b'a'..=b'f' => ch - b'a' + 10,
        b'A'..=b'F' => ch - b'A' + 10,
        _ => 0,
    }
}
