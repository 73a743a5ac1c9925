//! Protocol state machine for one session at a time.
//!
//! ```text
//!              JoinNote(ok)                 Leave
//!  Connected ───────────────► Joined(doc) ─────────► Connected
//!      ▲          │              │  │
//!      │          │ JoinNote(err)│  │ NoteChange / NoteDelete
//!      │          ▼              │  ▼
//!      │    JoinError (sender)   │  guard ► codec ► store ► broadcast(peers)
//!      │                         │
//!      └──── Disconnect ─────────┘ (terminal)
//! ```
//!
//! Every failure is turned into a scoped error event for the originating
//! session. Nothing is broadcast before the store confirms the write.
//!
//! Concurrent `NoteChange`s for the same document are not serialized: each
//! replaces the full block set and the last write to land wins.

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::{AccessRight, AuthorizationGuard};
use crate::codec::{self, ReconstructMode};
use crate::error::SyncError;
use crate::model::{BlockNode, Document, PrincipalId, SessionId};
use crate::protocol::{ClientEvent, ErrorPayload, Frame, ServerEvent};
use crate::registry::{JoinOutcome, SessionRegistry, SessionState};
use crate::store::{BlockFilter, DocumentFilter, DocumentStore};

/// Coordinator settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoordinatorConfig {
    /// How stored rows are turned back into content for `InitialState`
    /// and `NoteChanged`.
    pub content_mode: ReconstructMode,
}

/// Drives join, change, delete and leave for every session.
pub struct SyncCoordinator {
    registry: Arc<SessionRegistry>,
    guard: Arc<AuthorizationGuard>,
    store: Arc<dyn DocumentStore>,
    config: CoordinatorConfig,
}

impl SyncCoordinator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        guard: Arc<AuthorizationGuard>,
        store: Arc<dyn DocumentStore>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            registry,
            guard,
            store,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> CoordinatorConfig {
        self.config
    }

    /// Open a session. The receiver yields every frame addressed to it.
    pub async fn connect(&self) -> (SessionId, mpsc::Receiver<Frame>) {
        self.registry.connect().await
    }

    pub async fn state(&self, session: SessionId) -> Option<SessionState> {
        self.registry.state(session).await
    }

    /// Handle one client event, reporting any failure to the sender only.
    pub async fn handle(&self, session: SessionId, event: ClientEvent) {
        log::trace!("Session {session} sent {}", event.name());
        match event {
            ClientEvent::JoinNote {
                document_id,
                credential_token,
            } => {
                if let Err(e) = self.join_note(session, document_id, &credential_token).await {
                    self.report(session, &e, ServerEvent::JoinError).await;
                }
            }
            ClientEvent::NoteChange {
                document_id,
                blocks,
                title,
            } => {
                if let Err(e) = self.note_change(session, document_id, blocks, title).await {
                    self.report(session, &e, ServerEvent::ChangeError).await;
                }
            }
            ClientEvent::NoteDelete { document_id } => {
                if let Err(e) = self.note_delete(session, document_id).await {
                    self.report(session, &e, ServerEvent::DeleteError).await;
                }
            }
            ClientEvent::Leave => {
                self.leave(session).await;
            }
        }
    }

    async fn report(
        &self,
        session: SessionId,
        error: &SyncError,
        wrap: fn(ErrorPayload) -> ServerEvent,
    ) {
        match error {
            SyncError::StoreUnavailable(_) => log::error!("Session {session}: {error}"),
            _ => log::warn!("Session {session}: {error}"),
        }
        let event = wrap(ErrorPayload::from(error));
        match event.encode() {
            Ok(frame) => {
                self.registry.send_to(session, frame).await;
            }
            Err(e) => log::error!("Failed to encode {}: {e}", event.name()),
        }
    }

    /// Authenticate, authorize read, load content, then record membership and
    /// send `InitialState` to this session only.
    ///
    /// Membership is recorded only after a successful load, so any failure
    /// leaves the session as it was. The state is read again once the session
    /// is a member: a change landing between the first load and the join was
    /// broadcast without this session and would otherwise be missed.
    ///
    /// A change stored after the second read can still have its `NoteChanged`
    /// queued ahead of this `InitialState`.
    pub async fn join_note(
        &self,
        session: SessionId,
        document_id: Uuid,
        token: &str,
    ) -> Result<(), SyncError> {
        if self.registry.state(session).await.is_none() {
            return Err(SyncError::UnknownSession(session));
        }

        let principal = self.guard.authenticate(token)?;
        let document = self
            .guard
            .authorize_document_access(principal, document_id, AccessRight::Read)
            .await?;
        let content = self.load_content(document_id).await?;
        let fallback = ServerEvent::InitialState { document, content }.encode()?;

        let outcome = self.registry.join(session, document_id, principal).await?;
        let refreshed = self
            .snapshot(document_id)
            .await
            .and_then(|(document, content)| Ok(ServerEvent::InitialState { document, content }.encode()?));
        let frame = match refreshed {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Re-reading {document_id} after join failed, sending earlier state: {e}");
                fallback
            }
        };

        match outcome {
            JoinOutcome::Switched { from } => {
                log::info!("Session {session} switched from {from} to document {document_id}")
            }
            JoinOutcome::Rejoined => log::debug!("Session {session} rejoined {document_id}"),
            JoinOutcome::Joined => log::info!("Session {session} joined document {document_id}"),
        }

        self.registry.send_to(session, frame).await;
        Ok(())
    }

    /// Replace the document's content and title, then fan out `NoteChanged`
    /// to every other member. Returns the number of peers notified.
    pub async fn note_change(
        &self,
        session: SessionId,
        document_id: Uuid,
        blocks: Vec<BlockNode>,
        title: Option<String>,
    ) -> Result<usize, SyncError> {
        let principal = self.require_joined(session, document_id).await?;
        let mut document = self
            .guard
            .authorize_document_access(principal, document_id, AccessRight::Write)
            .await?;

        let rows = codec::flatten(&blocks, document_id)?;
        let content = codec::reconstruct(&rows, self.config.content_mode)?;

        document.touch(principal, title);
        if !self.store.update_document(&document).await? {
            return Err(SyncError::NotFound(document_id));
        }
        let removed = self
            .store
            .delete_blocks(&BlockFilter::document(document_id))
            .await?;
        let inserted = self.store.insert_blocks(rows).await?;
        log::debug!(
            "Document {document_id}: replaced {removed} blocks with {inserted} (editor {principal})"
        );

        if !self.registry.is_member(session, document_id).await {
            log::debug!("Session {session} left {document_id} before its change landed; not broadcasting");
            return Ok(0);
        }

        let event = ServerEvent::NoteChanged {
            document_id,
            document,
            content,
        };
        Ok(self
            .registry
            .broadcast_event(document_id, &event, Some(session))
            .await?)
    }

    /// Delete the document and its blocks, then fan out `NoteDeleted` to
    /// every other member. Members stay joined.
    pub async fn note_delete(&self, session: SessionId, document_id: Uuid) -> Result<usize, SyncError> {
        let principal = self.require_joined(session, document_id).await?;
        self.guard
            .authorize_document_access(principal, document_id, AccessRight::Delete)
            .await?;

        let blocks = self
            .store
            .delete_blocks(&BlockFilter::document(document_id))
            .await?;
        self.store
            .delete_documents(&DocumentFilter::by_id(document_id))
            .await?;
        log::info!("Document {document_id} deleted by {principal} ({blocks} blocks)");

        if !self.registry.is_member(session, document_id).await {
            return Ok(0);
        }
        Ok(self
            .registry
            .broadcast_event(document_id, &ServerEvent::NoteDeleted { document_id }, Some(session))
            .await?)
    }

    pub async fn leave(&self, session: SessionId) -> Option<Uuid> {
        let left = self.registry.leave(session).await;
        if let Some(doc) = left {
            log::info!("Session {session} left document {doc}");
        }
        left
    }

    pub async fn disconnect(&self, session: SessionId) -> Option<Uuid> {
        let left = self.registry.disconnect(session).await;
        if let Some(doc) = left {
            log::info!("Session {session} disconnected from document {doc}");
        }
        left
    }

    /// Current document and its reconstructed content.
    pub async fn snapshot(&self, document_id: Uuid) -> Result<(Document, Vec<BlockNode>), SyncError> {
        let document = self
            .store
            .find_document(document_id)
            .await?
            .ok_or(SyncError::NotFound(document_id))?;
        Ok((document, self.load_content(document_id).await?))
    }

    async fn load_content(&self, document_id: Uuid) -> Result<Vec<BlockNode>, SyncError> {
        let rows = self
            .store
            .find_blocks(&BlockFilter::document(document_id))
            .await?;
        Ok(codec::reconstruct(&rows, self.config.content_mode)?)
    }

    /// The principal behind `session`, provided it is joined to `document_id`.
    async fn require_joined(&self, session: SessionId, document_id: Uuid) -> Result<PrincipalId, SyncError> {
        match self.registry.membership(session).await {
            Some((joined, principal)) if joined == document_id => Ok(principal),
            Some(_) => Err(SyncError::Unauthorized(document_id)),
            None if self.registry.state(session).await.is_none() => {
                Err(SyncError::UnknownSession(session))
            }
            None => Err(SyncError::Unauthorized(document_id)),
        }
    }
}
