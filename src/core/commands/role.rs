// src/core/commands/role.rs

//! `ROLE`: reports the instance's replication role and progress in an
//! easy-to-process form.

use crate::core::protocol::RespFrame;
use crate::core::state::replica::ReplicaSyncState;
use crate::core::state::ReplContext;
use std::sync::Arc;

/// Builds the `ROLE` reply frames. A primary yields a single array; a replica
/// yields one array per configured upstream (several under multimaster).
pub async fn execute(ctx: &Arc<ReplContext>) -> Vec<RespFrame> {
    let masters = ctx.masters.lock().await.clone();

    if masters.is_empty() {
        let mut replicas = Vec::new();
        for entry in ctx.replicas.iter() {
            let replica = entry.value();
            if replica.state() != ReplicaSyncState::Online {
                continue;
            }
            let ip = replica
                .attrs
                .announced_ip
                .clone()
                .unwrap_or_else(|| replica.addr.ip().to_string());
            replicas.push(RespFrame::Array(vec![
                RespFrame::BulkString(ip.into_bytes().into()),
                RespFrame::BulkString(replica.attrs.listening_port.to_string().into_bytes().into()),
                RespFrame::BulkString(replica.acked_offset().to_string().into_bytes().into()),
            ]));
        }
        return vec![RespFrame::Array(vec![
            RespFrame::BulkString(bytes::Bytes::from_static(b"master")),
            RespFrame::Integer(ctx.master_offset() as i64),
            RespFrame::Array(replicas),
        ])];
    }

    let role_name: bytes::Bytes = if ctx.is_active_replica() {
        bytes::Bytes::from_static(b"active-replica")
    } else {
        bytes::Bytes::from_static(b"slave")
    };
    masters
        .iter()
        .map(|mi| {
            let state = mi.state();
            RespFrame::Array(vec![
                RespFrame::BulkString(role_name.clone()),
                RespFrame::BulkString(mi.host.clone().into_bytes().into()),
                RespFrame::Integer(mi.port as i64),
                RespFrame::BulkString(state.as_str().as_bytes().to_vec().into()),
                RespFrame::Integer(if mi.link_established.lock().is_some() {
                    mi.reploff() as i64
                } else {
                    -1
                }),
            ])
        })
        .collect()
}
