//! Request/response note operations outside the realtime protocol.
//!
//! Shares the [`AuthorizationGuard`] and [`DocumentStore`] with the
//! coordinator. A transport (HTTP or otherwise) maps these calls onto routes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::{AccessRight, AuthorizationGuard};
use crate::codec::{self, ReconstructMode};
use crate::error::SyncError;
use crate::model::{BlockNode, BlockRow, Document, PrincipalId};
use crate::store::{BlockFilter, DocumentFilter, DocumentStore};

/// A document together with its content tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub document: Document,
    pub content: Vec<BlockNode>,
}

/// Public read-only view. Carries no owner id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotePreview {
    pub id: Uuid,
    pub title: String,
    pub last_editor: PrincipalId,
    pub last_modified: DateTime<Utc>,
    pub content: Vec<BlockNode>,
}

pub struct NoteService {
    guard: Arc<AuthorizationGuard>,
    store: Arc<dyn DocumentStore>,
    content_mode: ReconstructMode,
}

impl NoteService {
    pub fn new(guard: Arc<AuthorizationGuard>, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            guard,
            store,
            content_mode: ReconstructMode::default(),
        }
    }

    pub fn with_content_mode(mut self, mode: ReconstructMode) -> Self {
        self.content_mode = mode;
        self
    }

    /// Create a document owned by the caller with one empty paragraph.
    pub async fn create_note(
        &self,
        token: &str,
        title: Option<String>,
        initial_block_id: &str,
    ) -> Result<Note, SyncError> {
        let owner = self.guard.authenticate(token)?;
        let document = Document::new(owner, title.filter(|t| !t.is_empty()));
        let initial = BlockRow::initial_paragraph(document.id, initial_block_id);

        self.store.insert_document(document.clone()).await?;
        self.store.insert_blocks(vec![initial.clone()]).await?;
        log::info!("Principal {owner} created document {}", document.id);

        Ok(Note {
            content: codec::reconstruct(&[initial], self.content_mode)?,
            document,
        })
    }

    pub async fn get_note(&self, token: &str, document_id: Uuid) -> Result<Note, SyncError> {
        let principal = self.guard.authenticate(token)?;
        let document = self
            .guard
            .authorize_document_access(principal, document_id, AccessRight::Read)
            .await?;
        self.with_content(document).await
    }

    /// The caller's documents, most recently modified first.
    pub async fn list_notes(&self, token: &str) -> Result<Vec<Note>, SyncError> {
        let owner = self.guard.authenticate(token)?;
        let mut documents = self.store.find_documents(&DocumentFilter::by_owner(owner)).await?;
        documents.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));

        let mut notes = Vec::with_capacity(documents.len());
        for document in documents {
            notes.push(self.with_content(document).await?);
        }
        Ok(notes)
    }

    /// Rename and/or replace content.
    ///
    /// `content` replaces the stored blocks only when it is non-empty, so an
    /// empty editor never wipes a note through this path.
    pub async fn update_note(
        &self,
        token: &str,
        document_id: Uuid,
        title: Option<String>,
        content: Option<Vec<BlockNode>>,
    ) -> Result<Note, SyncError> {
        let principal = self.guard.authenticate(token)?;
        let mut document = self
            .guard
            .authorize_document_access(principal, document_id, AccessRight::Write)
            .await?;

        let rows = match content {
            Some(tree) if !tree.is_empty() => Some(codec::flatten(&tree, document_id)?),
            _ => None,
        };

        document.touch(principal, title);
        if !self.store.update_document(&document).await? {
            return Err(SyncError::NotFound(document_id));
        }
        if let Some(rows) = rows {
            self.store.delete_blocks(&BlockFilter::document(document_id)).await?;
            self.store.insert_blocks(rows).await?;
        }
        self.with_content(document).await
    }

    /// Delete the document and every block it owns.
    pub async fn delete_note(&self, token: &str, document_id: Uuid) -> Result<(), SyncError> {
        let principal = self.guard.authenticate(token)?;
        self.guard
            .authorize_document_access(principal, document_id, AccessRight::Delete)
            .await?;
        self.store.delete_blocks(&BlockFilter::document(document_id)).await?;
        self.store.delete_documents(&DocumentFilter::by_id(document_id)).await?;
        log::info!("Principal {principal} deleted document {document_id}");
        Ok(())
    }

    /// Unauthenticated preview.
    pub async fn preview_note(&self, document_id: Uuid) -> Result<NotePreview, SyncError> {
        let document = self
            .store
            .find_document(document_id)
            .await?
            .ok_or(SyncError::NotFound(document_id))?;
        let Note { document, content } = self.with_content(document).await?;
        Ok(NotePreview {
            id: document.id,
            title: document.title,
            last_editor: document.last_editor,
            last_modified: document.last_modified,
            content,
        })
    }

    async fn with_content(&self, document: Document) -> Result<Note, SyncError> {
        let rows = self.store.find_blocks(&BlockFilter::document(document.id)).await?;
        Ok(Note {
            content: codec::reconstruct(&rows, self.content_mode)?,
            document,
        })
    }
}
