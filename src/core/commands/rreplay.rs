// src/core/commands/rreplay.rs

use crate::core::protocol::RespFrame;
use crate::core::replication::active::RreplayEnvelope;
use crate::core::CitrineError;
use bytes::Bytes;

/// The internal `RREPLAY <source-uuid> <payload> [<db> [<mvcc>]]` command.
///
/// Valid only on a primary link; the replica worker routes envelopes it
/// receives to the active-replica apply path. A regular client issuing it is
/// refused.
#[derive(Debug, Clone)]
pub struct Rreplay {
    pub envelope: RreplayEnvelope,
}

impl Rreplay {
    pub fn parse(argv: &[Bytes], current_db: u64) -> Result<Self, CitrineError> {
        Ok(Rreplay {
            envelope: RreplayEnvelope::parse(argv, current_db)?,
        })
    }

    /// The reply for an `RREPLAY` arriving outside a primary link.
    pub fn refuse() -> RespFrame {
        RespFrame::Error("ERR Command must be sent from a master".to_string())
    }
}
