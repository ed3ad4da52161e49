// src/core/commands/wait.rs

//! `WAIT <numreplicas> <timeout_ms>`: blocks until at least `numreplicas`
//! replicas have acknowledged the caller's last write offset, or the timeout
//! elapses. Polls acknowledged offsets only; it never gates writes.

use crate::core::commands::{extract_string, validate_arg_count};
use crate::core::protocol::RespFrame;
use crate::core::replication::propagation;
use crate::core::state::ReplContext;
use crate::core::CitrineError;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Default)]
pub struct Wait {
    pub num_replicas: usize,
    pub timeout_ms: u64,
}

impl Wait {
    pub fn parse(args: &[RespFrame]) -> Result<Self, CitrineError> {
        validate_arg_count(args, 2, "WAIT")?;
        Ok(Wait {
            num_replicas: extract_string(&args[0])?
                .parse()
                .map_err(|_| CitrineError::NotAnInteger)?,
            timeout_ms: extract_string(&args[1])?
                .parse()
                .map_err(|_| CitrineError::NotAnInteger)?,
        })
    }

    /// `client_offset` is the replication offset reached after the caller's
    /// last write. Returns the number of replicas that acknowledged it.
    pub async fn execute(
        self,
        ctx: &Arc<ReplContext>,
        client_offset: u64,
    ) -> Result<RespFrame, CitrineError> {
        if ctx.has_masters().await && !ctx.is_active_replica() {
            return Err(CitrineError::InvalidState(
                "WAIT cannot be used with replica instances".to_string(),
            ));
        }

        let mut acked = ctx.count_acks_by_offset(client_offset);
        if acked >= self.num_replicas {
            return Ok(RespFrame::Integer(acked as i64));
        }

        // Ask every replica for an ACK as soon as possible. The request rides
        // the ordinary stream and advances offsets like any command.
        let getack = [
            Bytes::from_static(b"REPLCONF"),
            Bytes::from_static(b"GETACK"),
            Bytes::from_static(b"*"),
        ];
        propagation::feed_replicas(ctx, -1, &getack, None).await;

        let deadline = (self.timeout_ms > 0)
            .then(|| Instant::now() + Duration::from_millis(self.timeout_ms));
        loop {
            acked = ctx.count_acks_by_offset(client_offset);
            if acked >= self.num_replicas {
                break;
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, ctx.ack_notify.notified())
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                None => ctx.ack_notify.notified().await,
            }
        }
        Ok(RespFrame::Integer(acked as i64))
    }
}
