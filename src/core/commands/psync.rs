// src/core/commands/psync.rs

use crate::core::commands::{extract_string, validate_arg_count};
use crate::core::protocol::RespFrame;
use crate::core::replication::primary::SyncRequest;
use crate::core::CitrineError;

/// `PSYNC <replid> <offset>`. Never executed in place: the connection handler
/// hands the stream over to a `SyncSession` built from this request.
#[derive(Debug, Clone, Default)]
pub struct Psync {
    pub replication_id: String,
    pub offset: String,
}

impl Psync {
    pub fn parse(args: &[RespFrame]) -> Result<Self, CitrineError> {
        validate_arg_count(args, 2, "PSYNC")?;
        Ok(Psync {
            replication_id: extract_string(&args[0])?,
            offset: extract_string(&args[1])?,
        })
    }

    pub fn into_sync_request(self) -> SyncRequest {
        SyncRequest::Psync {
            replid: self.replication_id,
            offset: self.offset,
        }
    }
}
