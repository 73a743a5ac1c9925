//! # mininote-collab: Real-time collaboration layer for block notes
//!
//! Lets several clients open the same note and see each other's edits live.
//! Every save replaces the whole block set; the last write to land wins.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ NoteClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     JSON events     │ (central)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                   ┌────────┴────────┐
//!                                   │ SyncCoordinator │
//!                                   └─┬─────┬─────┬───┘
//!                                     │     │     │
//!                ┌────────────────────┘     │     └──────────────┐
//!                ▼                          ▼                    ▼
//!       ┌─────────────────┐       ┌──────────────────┐   ┌───────────────┐
//!       │ SessionRegistry │       │AuthorizationGuard│   │ DocumentStore │
//!       │ (fan-out)       │       │ (HS256 + owner)  │   │ + block codec │
//!       └─────────────────┘       └──────────────────┘   └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`]: Documents, block trees and flat block rows
//! - [`codec`]: Tree ⇄ flat row transform
//! - [`auth`]: Token verification and ownership checks
//! - [`registry`]: Session membership and per-document fan-out
//! - [`coordinator`]: Join / change / delete / leave state machine
//! - [`protocol`]: JSON wire events
//! - [`store`]: Document store trait, in-memory and RocksDB backends
//! - [`notes`]: Request/response note operations
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client

pub mod auth;
pub mod client;
pub mod codec;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod notes;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod store;

// Re-exports for convenience
pub use auth::{AccessRight, AuthorizationGuard, TokenVerifier};
pub use client::{ConnectionState, NoteClient, SyncEvent};
pub use codec::{assemble, flatten, flatten_under, reconstruct, ReconstructMode, MAX_TREE_DEPTH};
pub use coordinator::{CoordinatorConfig, SyncCoordinator};
pub use error::{CodecError, ConfigError, ErrorCode, StoreError, SyncError};
pub use model::{BlockNode, BlockRow, BlockType, Document, PrincipalId, SessionId, DEFAULT_TITLE};
pub use notes::{Note, NotePreview, NoteService};
pub use protocol::{ClientEvent, ErrorPayload, Frame, ProtocolError, ServerEvent};
pub use registry::{BroadcastStats, JoinOutcome, JoinPolicy, SessionRegistry, SessionState};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use store::{
    BlockFilter, DocumentFilter, DocumentStore, MemoryStore, RocksStore, StoreConfig, TimedStore,
};
