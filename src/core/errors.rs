// src/core/errors.rs

//! Defines the primary error type for the replication core.

use std::num::ParseIntError;
use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the core.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum CitrineError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    #[error("Syntax error")]
    SyntaxError,

    #[error("Wrong number of arguments for '{0}' command")]
    WrongArgumentCount(String),

    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("Value is not an integer or out of range")]
    NotAnInteger,

    #[error("NOAUTH Authentication required")]
    AuthRequired,

    #[error("NOMASTERLINK Can't SYNC while not connected with my master")]
    NoMasterLink,

    #[error("LOADING CitrineDB is loading the dataset in memory")]
    Loading,

    #[error("Command not allowed in the current state: {0}")]
    InvalidState(String),

    #[error("READONLY {0}")]
    ReadOnly(String),

    #[error("Snapshot Error: {0}")]
    SnapshotError(String),

    #[error("Replication Error: {0}")]
    ReplicationError(String),

    #[error("Could not REPLAY: replication loop detected")]
    ReplicationLoopDetected,

    #[error("Internal Server Error: {0}")]
    Internal(String),
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for CitrineError {
    fn clone(&self) -> Self {
        match self {
            CitrineError::Io(e) => CitrineError::Io(Arc::clone(e)),
            CitrineError::IncompleteData => CitrineError::IncompleteData,
            CitrineError::UnknownCommand(s) => CitrineError::UnknownCommand(s.clone()),
            CitrineError::SyntaxError => CitrineError::SyntaxError,
            CitrineError::WrongArgumentCount(s) => CitrineError::WrongArgumentCount(s.clone()),
            CitrineError::WrongType => CitrineError::WrongType,
            CitrineError::NotAnInteger => CitrineError::NotAnInteger,
            CitrineError::AuthRequired => CitrineError::AuthRequired,
            CitrineError::NoMasterLink => CitrineError::NoMasterLink,
            CitrineError::Loading => CitrineError::Loading,
            CitrineError::InvalidState(s) => CitrineError::InvalidState(s.clone()),
            CitrineError::ReadOnly(s) => CitrineError::ReadOnly(s.clone()),
            CitrineError::SnapshotError(s) => CitrineError::SnapshotError(s.clone()),
            CitrineError::ReplicationError(s) => CitrineError::ReplicationError(s.clone()),
            CitrineError::ReplicationLoopDetected => CitrineError::ReplicationLoopDetected,
            CitrineError::Internal(s) => CitrineError::Internal(s.clone()),
        }
    }
}

impl PartialEq for CitrineError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (CitrineError::Io(e1), CitrineError::Io(e2)) => e1.to_string() == e2.to_string(),
            (CitrineError::UnknownCommand(s1), CitrineError::UnknownCommand(s2)) => s1 == s2,
            (CitrineError::WrongArgumentCount(s1), CitrineError::WrongArgumentCount(s2)) => {
                s1 == s2
            }
            (CitrineError::InvalidState(s1), CitrineError::InvalidState(s2)) => s1 == s2,
            (CitrineError::ReadOnly(s1), CitrineError::ReadOnly(s2)) => s1 == s2,
            (CitrineError::SnapshotError(s1), CitrineError::SnapshotError(s2)) => s1 == s2,
            (CitrineError::ReplicationError(s1), CitrineError::ReplicationError(s2)) => s1 == s2,
            (CitrineError::Internal(s1), CitrineError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for CitrineError {
    fn from(e: std::io::Error) -> Self {
        CitrineError::Io(Arc::new(e))
    }
}

impl From<uuid::Error> for CitrineError {
    fn from(e: uuid::Error) -> Self {
        CitrineError::ReplicationError(format!("Invalid UUID: {e}"))
    }
}

impl From<std::str::Utf8Error> for CitrineError {
    fn from(_: std::str::Utf8Error) -> Self {
        CitrineError::WrongType
    }
}

impl From<std::string::FromUtf8Error> for CitrineError {
    fn from(_: std::string::FromUtf8Error) -> Self {
        CitrineError::WrongType
    }
}

impl From<ParseIntError> for CitrineError {
    fn from(_: ParseIntError) -> Self {
        CitrineError::NotAnInteger
    }
}
