// src/core/commands/mod.rs

//! The replication-facing client command surface: parsing and execution for
//! `REPLICAOF`, `ROLE`, `WAIT`, `REPLCONF`, `PSYNC`/`SYNC`, and the internal
//! `RREPLAY`.

pub mod psync;
pub mod replconf;
pub mod replicaof;
pub mod role;
pub mod rreplay;
pub mod wait;

use crate::core::protocol::RespFrame;
use crate::core::CitrineError;

/// Extracts a UTF-8 string out of a bulk or simple string frame.
pub fn extract_string(frame: &RespFrame) -> Result<String, CitrineError> {
    match frame {
        RespFrame::BulkString(b) => Ok(String::from_utf8(b.to_vec())?),
        RespFrame::SimpleString(s) => Ok(s.clone()),
        _ => Err(CitrineError::WrongType),
    }
}

/// Validates an exact argument count for a command.
pub fn validate_arg_count(
    args: &[RespFrame],
    expected: usize,
    name: &str,
) -> Result<(), CitrineError> {
    if args.len() != expected {
        return Err(CitrineError::WrongArgumentCount(name.to_string()));
    }
    Ok(())
}
