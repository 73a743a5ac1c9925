//! JSON event protocol for note synchronization.
//!
//! Wire format (one WebSocket text frame per event):
//! ```text
//! {"event": "<Name>", "data": { ...camelCase fields... }}
//! ```
//!
//! | client → server | server → client                         |
//! |-----------------|-----------------------------------------|
//! | `JoinNote`      | `InitialState` / `JoinError`            |
//! | `NoteChange`    | `NoteChanged` (peers) / `ChangeError`   |
//! | `NoteDelete`    | `NoteDeleted` (peers) / `DeleteError`   |
//! | `Leave`         | none                                    |
//!
//! Server events are encoded once into a shared [`Frame`] and the same
//! allocation is handed to every recipient.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::{ErrorCode, SyncError};
use crate::model::{BlockNode, Document};

/// One encoded server event, shared between all recipients.
pub type Frame = Arc<str>;

/// Events a client sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    JoinNote {
        document_id: Uuid,
        credential_token: String,
    },
    #[serde(rename_all = "camelCase")]
    NoteChange {
        document_id: Uuid,
        blocks: Vec<BlockNode>,
        /// Absent keeps the current title.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    NoteDelete { document_id: Uuid },
    Leave,
}

impl ClientEvent {
    /// Event name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinNote { .. } => "JoinNote",
            Self::NoteChange { .. } => "NoteChange",
            Self::NoteDelete { .. } => "NoteDelete",
            Self::Leave => "Leave",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Scoped error report sent to the originating session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&SyncError> for ErrorPayload {
    fn from(e: &SyncError) -> Self {
        Self {
            code: e.code(),
            message: e.to_string(),
        }
    }
}

/// Events the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// Current state, sent only to the session that joined.
    InitialState {
        document: Document,
        content: Vec<BlockNode>,
    },
    JoinError(ErrorPayload),
    #[serde(rename_all = "camelCase")]
    NoteChanged {
        document_id: Uuid,
        document: Document,
        content: Vec<BlockNode>,
    },
    ChangeError(ErrorPayload),
    #[serde(rename_all = "camelCase")]
    NoteDeleted { document_id: Uuid },
    DeleteError(ErrorPayload),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InitialState { .. } => "InitialState",
            Self::JoinError(_) => "JoinError",
            Self::NoteChanged { .. } => "NoteChanged",
            Self::ChangeError(_) => "ChangeError",
            Self::NoteDeleted { .. } => "NoteDeleted",
            Self::DeleteError(_) => "DeleteError",
        }
    }

    /// The error payload, if this is one of the error events.
    pub fn error(&self) -> Option<&ErrorPayload> {
        match self {
            Self::JoinError(e) | Self::ChangeError(e) | Self::DeleteError(e) => Some(e),
            _ => None,
        }
    }

    /// Encode once for fan-out.
    pub fn encode(&self) -> Result<Frame, ProtocolError> {
        serde_json::to_string(self)
            .map(Frame::from)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Connection closed")]
    ConnectionClosed,
}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        SyncError::Protocol(e.to_string())
    }
}
