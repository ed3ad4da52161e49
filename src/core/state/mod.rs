// src/core/state/mod.rs

pub mod core;
pub mod master;
pub mod replica;

pub use core::ReplContext;
pub use master::{CachedMaster, MasterInfo, MasterLinkState};
pub use replica::{
    OutputBuffer, ReplicaAttrs, ReplicaCapa, ReplicaDirective, ReplicaHandle, ReplicaSyncState,
    SnapshotFraming,
};
