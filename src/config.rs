// src/config.rs

//! Manages replication configuration: loading, defaults, and validation.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;

/// An upstream primary this instance should replicate from. More than one
/// entry is only meaningful when `enable_multimaster` is set.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
}

/// All replication tunables consumed by the core.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReplicationSettings {
    /// Size of the circular replication backlog in bytes. A floor of 16 KiB
    /// is enforced so that resizing always leaves a usable buffer.
    #[serde(default = "default_backlog_size")]
    pub repl_backlog_size: u64,
    /// Seconds without replicas (and without a primary) after which the
    /// backlog is released. `0` disables the release.
    #[serde(default = "default_backlog_time_limit")]
    pub repl_backlog_time_limit: u64,
    /// Timeout in seconds for handshakes, bulk transfers, and idle links.
    #[serde(default = "default_repl_timeout")]
    pub repl_timeout: u64,
    /// Timeout in seconds for the blocking reads/writes used during the
    /// handshake only.
    #[serde(default = "default_syncio_timeout")]
    pub repl_syncio_timeout: u64,
    /// Period in seconds between PING broadcasts to attached replicas.
    #[serde(default = "default_ping_replica_period")]
    pub repl_ping_replica_period: u64,
    /// Prefer streaming snapshots straight to replica sockets over writing
    /// them out first.
    #[serde(default)]
    pub repl_diskless_sync: bool,
    /// Seconds to wait before starting a diskless snapshot, so several
    /// replicas can attach to the same transfer.
    #[serde(default = "default_diskless_sync_delay")]
    pub repl_diskless_sync_delay: u64,
    #[serde(default)]
    pub repl_disable_tcp_nodelay: bool,
    /// Refuse writes unless at least this many replicas are online with
    /// acceptable lag. `0` disables the policy.
    #[serde(default)]
    pub repl_min_replicas_to_write: usize,
    #[serde(default = "default_min_replicas_max_lag")]
    pub repl_min_replicas_max_lag: u64,
    /// Empty the keyspace asynchronously before loading a full-resync
    /// snapshot.
    #[serde(default)]
    pub repl_replica_lazy_flush: bool,
    /// This replica also accepts writes and replicates them back.
    #[serde(default)]
    pub active_replica: bool,
    /// Allow more than one upstream primary. Implies `active_replica`.
    #[serde(default)]
    pub enable_multimaster: bool,
    #[serde(default)]
    pub masterauth: Option<String>,
    #[serde(default)]
    pub masteruser: Option<String>,
    /// Address to advertise to the primary instead of the socket's own.
    #[serde(default)]
    pub replica_announce_ip: Option<String>,
    /// Port to advertise to the primary instead of the listening port.
    #[serde(default)]
    pub replica_announce_port: Option<u16>,
    /// Licence key exchanged during the handshake in active-replica
    /// deployments. Two peers must not share one.
    #[serde(default)]
    pub license_key: Option<String>,
    /// Maximum number of script digests remembered as already transmitted.
    #[serde(default = "default_script_cache_size")]
    pub script_cache_size: usize,
    /// Directory for snapshot transfer temp files. Defaults to the system
    /// temp directory when empty.
    #[serde(default)]
    pub transfer_tmp_dir: Option<String>,
}

fn default_backlog_size() -> u64 {
    1024 * 1024 // 1 MiB
}
fn default_backlog_time_limit() -> u64 {
    3600
}
fn default_repl_timeout() -> u64 {
    60
}
fn default_syncio_timeout() -> u64 {
    5
}
fn default_ping_replica_period() -> u64 {
    10
}
fn default_diskless_sync_delay() -> u64 {
    5
}
fn default_min_replicas_max_lag() -> u64 {
    10
}
fn default_script_cache_size() -> usize {
    10_000
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            repl_backlog_size: default_backlog_size(),
            repl_backlog_time_limit: default_backlog_time_limit(),
            repl_timeout: default_repl_timeout(),
            repl_syncio_timeout: default_syncio_timeout(),
            repl_ping_replica_period: default_ping_replica_period(),
            repl_diskless_sync: false,
            repl_diskless_sync_delay: default_diskless_sync_delay(),
            repl_disable_tcp_nodelay: false,
            repl_min_replicas_to_write: 0,
            repl_min_replicas_max_lag: default_min_replicas_max_lag(),
            repl_replica_lazy_flush: false,
            active_replica: false,
            enable_multimaster: false,
            masterauth: None,
            masteruser: None,
            replica_announce_ip: None,
            replica_announce_port: None,
            license_key: None,
            script_cache_size: default_script_cache_size(),
            transfer_tmp_dir: None,
        }
    }
}

/// A raw representation of the config file before validation.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_databases")]
    databases: usize,
    #[serde(default)]
    replication: ReplicationSettings,
    /// Primaries to replicate from at startup; the list can also be changed
    /// at runtime via `REPLICAOF`.
    #[serde(default)]
    replicaof: Vec<UpstreamConfig>,
    #[serde(default)]
    aof_enabled: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7878
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_databases() -> usize {
    16
}

/// The final, validated configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub databases: usize,
    pub replication: ReplicationSettings,
    pub replicaof: Vec<UpstreamConfig>,
    pub aof_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            databases: default_databases(),
            replication: ReplicationSettings::default(),
            replicaof: Vec::new(),
            aof_enabled: false,
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config file at '{path}': {e}"))?;
        let raw: RawConfig = toml::from_str(&contents)
            .map_err(|e| anyhow!("Failed to parse TOML from '{path}': {e}"))?;

        let config = Config {
            host: raw.host,
            port: raw.port,
            log_level: raw.log_level,
            databases: raw.databases,
            replication: raw.replication,
            replicaof: raw.replicaof,
            aof_enabled: raw.aof_enabled,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.databases == 0 {
            return Err(anyhow!("databases cannot be 0"));
        }
        if self.replication.repl_timeout == 0 {
            return Err(anyhow!("replication.repl_timeout cannot be 0"));
        }
        if self.replication.repl_ping_replica_period == 0 {
            return Err(anyhow!("replication.repl_ping_replica_period cannot be 0"));
        }
        if self.replication.repl_min_replicas_to_write > 0
            && self.replication.repl_min_replicas_max_lag == 0
        {
            return Err(anyhow!(
                "repl_min_replicas_max_lag must be greater than 0 when repl_min_replicas_to_write is set"
            ));
        }
        if self.replicaof.len() > 1 && !self.replication.enable_multimaster {
            return Err(anyhow!(
                "multiple replicaof entries require replication.enable_multimaster"
            ));
        }
        for upstream in &self.replicaof {
            if upstream.port == 0 {
                return Err(anyhow!("replicaof port cannot be 0"));
            }
        }
        Ok(())
    }
}
