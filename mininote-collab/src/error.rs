//! Error taxonomy for the sync engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::model::SessionId;

/// Everything that can go wrong while handling one protocol event.
///
/// All variants are recovered at the event boundary and reported to the
/// originating session only.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
    #[error("document not found: {0}")]
    NotFound(Uuid),
    #[error("not the owner of document {0}")]
    Forbidden(Uuid),
    #[error("session already joined to document {0}")]
    AlreadyJoined(Uuid),
    #[error("malformed block tree: {0}")]
    MalformedTree(#[from] CodecError),
    #[error("document store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("session is not joined to document {0}")]
    Unauthorized(Uuid),
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SyncError {
    /// Stable code sent to clients alongside the message.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidCredential(_) => ErrorCode::InvalidCredential,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::AlreadyJoined(_) => ErrorCode::AlreadyJoined,
            Self::MalformedTree(_) => ErrorCode::MalformedTree,
            Self::StoreUnavailable(_) => ErrorCode::StoreUnavailable,
            Self::Unauthorized(_) | Self::UnknownSession(_) => ErrorCode::Unauthorized,
            Self::Protocol(_) => ErrorCode::Protocol,
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::StoreUnavailable(e.to_string())
    }
}

/// Wire-level error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidCredential,
    NotFound,
    Forbidden,
    AlreadyJoined,
    MalformedTree,
    StoreUnavailable,
    Unauthorized,
    Protocol,
}

/// Block tree shape errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("block {block} references missing parent {parent}")]
    UnknownParent { block: String, parent: String },
    #[error("parent chain of block {0} forms a cycle")]
    Cycle(String),
    #[error("block id {0} appears more than once")]
    DuplicateId(String),
    #[error("tree deeper than {0} levels")]
    TooDeep(usize),
}

/// Document store failures.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("store call exceeded {0:?}")]
    Timeout(Duration),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Startup failures: bad settings or a store that cannot be opened.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("token secret must not be empty")]
    EmptySecret,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        let id = Uuid::new_v4();
        assert_eq!(SyncError::Forbidden(id).code(), ErrorCode::Forbidden);
        assert_eq!(SyncError::UnknownSession(id).code(), ErrorCode::Unauthorized);
        assert_eq!(
            SyncError::from(CodecError::Cycle("x".into())).code(),
            ErrorCode::MalformedTree
        );
    }

    #[test]
    fn test_store_error_becomes_unavailable() {
        let err: SyncError = StoreError::Timeout(Duration::from_millis(5)).into();
        assert_eq!(err.code(), ErrorCode::StoreUnavailable);
        assert!(err.to_string().contains("exceeded"));
    }
}
