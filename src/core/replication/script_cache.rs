// src/core/replication/script_cache.rs

//! Tracks script digests already transmitted to every connected replica, so
//! the encoder can ship the compact digest form instead of a full script body.
//!
//! A capped FIFO provides eviction order, a set provides fast membership. The
//! cache must be flushed whenever we are no longer sure every replica knows
//! every cached script: a new replica performing a full sync, an AOF rewrite,
//! or the last replica leaving with AOF off.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};

#[derive(Debug)]
struct Inner {
    fifo: VecDeque<String>,
    digests: HashSet<String>,
}

#[derive(Debug)]
pub struct ScriptCache {
    inner: Mutex<Inner>,
    max_entries: usize,
}

impl ScriptCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                fifo: VecDeque::new(),
                digests: HashSet::new(),
            }),
            max_entries: max_entries.max(1),
        }
    }

    /// Records a digest as known to all replicas, evicting the oldest entry
    /// when the cap is reached.
    pub fn add(&self, sha1: &str) {
        let mut inner = self.inner.lock();
        if inner.digests.contains(sha1) {
            return;
        }
        if inner.fifo.len() == self.max_entries {
            if let Some(oldest) = inner.fifo.pop_back() {
                inner.digests.remove(&oldest);
            }
        }
        inner.fifo.push_front(sha1.to_string());
        inner.digests.insert(sha1.to_string());
    }

    /// True when every replica is known to have seen this script.
    pub fn exists(&self, sha1: &str) -> bool {
        self.inner.lock().digests.contains(sha1)
    }

    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        inner.fifo.clear();
        inner.digests.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().fifo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().fifo.is_empty()
    }
}
