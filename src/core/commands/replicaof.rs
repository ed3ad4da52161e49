// src/core/commands/replicaof.rs

use crate::core::commands::{extract_string, validate_arg_count};
use crate::core::protocol::RespFrame;
use crate::core::replication::{replication_add_master, replication_unset_masters};
use crate::core::state::ReplContext;
use crate::core::CitrineError;
use std::sync::Arc;
use tracing::info;

/// `REPLICAOF <host> <port>` or `REPLICAOF NO ONE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replicaof {
    NoOne,
    Primary { host: String, port: u16 },
}

impl Replicaof {
    pub fn parse(args: &[RespFrame]) -> Result<Self, CitrineError> {
        validate_arg_count(args, 2, "REPLICAOF")?;
        let host = extract_string(&args[0])?;
        let port_str = extract_string(&args[1])?;
        if host.eq_ignore_ascii_case("no") && port_str.eq_ignore_ascii_case("one") {
            return Ok(Replicaof::NoOne);
        }
        let port: u16 = port_str.parse().map_err(|_| CitrineError::NotAnInteger)?;
        Ok(Replicaof::Primary { host, port })
    }

    pub async fn execute(self, ctx: &Arc<ReplContext>) -> Result<RespFrame, CitrineError> {
        match self {
            Replicaof::NoOne => {
                replication_unset_masters(ctx).await;
                Ok(RespFrame::SimpleString("OK".to_string()))
            }
            Replicaof::Primary { host, port } => {
                match replication_add_master(ctx, &host, port).await {
                    Some(_) => Ok(RespFrame::SimpleString("OK".to_string())),
                    None => {
                        info!(
                            "REPLICAOF would result into synchronization with the master we are already connected with. No operation performed."
                        );
                        Ok(RespFrame::SimpleString(
                            "OK Already connected to specified master".to_string(),
                        ))
                    }
                }
            }
        }
    }
}
