// src/core/commands/replconf.rs

//! `REPLCONF <option> <value> [<option> <value> …]` — the option channel a
//! replica uses to configure the replication link before `PSYNC`, and to
//! acknowledge stream offsets afterwards.

use crate::core::commands::extract_string;
use crate::core::protocol::RespFrame;
use crate::core::state::replica::{ReplicaAttrs, ReplicaCapa};
use crate::core::state::ReplContext;
use crate::core::CitrineError;
use std::sync::Arc;
use uuid::Uuid;

/// What the connection handler should do after processing a `REPLCONF`.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplconfAction {
    Reply(RespFrame),
    /// Reply, then drop the connection (duplicate licence key).
    ReplyAndClose(RespFrame),
    /// `REPLCONF ACK` never gets a reply.
    NoReply,
}

/// Applies a `REPLCONF` received on a regular client connection, mutating the
/// replica attributes collected ahead of the PSYNC handoff.
pub async fn apply(
    ctx: &Arc<ReplContext>,
    attrs: &mut ReplicaAttrs,
    args: &[RespFrame],
) -> Result<ReplconfAction, CitrineError> {
    if args.is_empty() || args.len() % 2 != 0 {
        // Every option needs a value.
        return Err(CitrineError::SyntaxError);
    }

    let mut pairs = args.chunks_exact(2);
    for pair in &mut pairs {
        let option = extract_string(&pair[0])?.to_ascii_lowercase();
        match option.as_str() {
            "listening-port" => {
                let port: u16 = extract_string(&pair[1])?
                    .parse()
                    .map_err(|_| CitrineError::NotAnInteger)?;
                attrs.listening_port = port;
            }
            "ip-address" => {
                attrs.announced_ip = Some(extract_string(&pair[1])?);
            }
            "capa" => {
                // Capabilities we do not understand are ignored.
                let capa = match extract_string(&pair[1])?.as_str() {
                    s if s.eq_ignore_ascii_case("eof") => ReplicaCapa::EOF,
                    s if s.eq_ignore_ascii_case("psync2") => ReplicaCapa::PSYNC2,
                    s if s.eq_ignore_ascii_case("activeExpire") => ReplicaCapa::ACTIVE_EXPIRE,
                    _ => ReplicaCapa::empty(),
                };
                attrs.capa = Some(attrs.capa.unwrap_or(ReplicaCapa::empty()) | capa);
            }
            "ack" => {
                // ACKs arrive on an established replication link and are
                // consumed there; on a plain connection they carry nothing.
                return Ok(ReplconfAction::NoReply);
            }
            "getack" => {
                // A request for an immediate ACK toward our own upstreams;
                // the periodic ACK covers it within a second.
                return Ok(ReplconfAction::NoReply);
            }
            "uuid" => {
                let raw = extract_string(&pair[1])?;
                if raw.len() != 36 {
                    return Ok(ReplconfAction::Reply(RespFrame::Error(
                        "Invalid UUID".to_string(),
                    )));
                }
                match Uuid::parse_str(&raw) {
                    Ok(peer) => {
                        attrs.uuid = Some(peer);
                        // The reply carries our own UUID back.
                        return Ok(ReplconfAction::Reply(RespFrame::SimpleString(
                            ctx.uuid.to_string(),
                        )));
                    }
                    Err(_) => {
                        return Ok(ReplconfAction::Reply(RespFrame::Error(
                            "Invalid UUID".to_string(),
                        )));
                    }
                }
            }
            "license" => {
                let offered = extract_string(&pair[1])?;
                let ours = {
                    let config = ctx.config.lock().await;
                    config.replication.license_key.clone()
                };
                if ours.as_deref() == Some(offered.as_str()) {
                    return Ok(ReplconfAction::ReplyAndClose(RespFrame::Error(
                        "Each replica must have a unique license key".to_string(),
                    )));
                }
                return Ok(ReplconfAction::Reply(RespFrame::SimpleString(
                    "OK".to_string(),
                )));
            }
            other => {
                return Ok(ReplconfAction::Reply(RespFrame::Error(format!(
                    "ERR Unrecognized REPLCONF option: {other}"
                ))));
            }
        }
    }
    Ok(ReplconfAction::Reply(RespFrame::SimpleString(
        "OK".to_string(),
    )))
}
