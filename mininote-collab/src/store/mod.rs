//! Document store abstraction.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐   find / insert / delete-many   ┌──────────────┐
//! │ AuthorizationGuard│ ──────────────────────────────► │  TimedStore  │
//! │ SyncCoordinator   │                                 │  (deadline)  │
//! │ NoteService       │                                 └──────┬───────┘
//! └──────────────────┘                                        │
//!                                             ┌───────────────┴──────────────┐
//!                                             ▼                              ▼
//!                                      ┌─────────────┐               ┌─────────────┐
//!                                      │ MemoryStore │               │ RocksStore  │
//!                                      └─────────────┘               └─────────────┘
//! ```
//!
//! Two collections: documents and blocks. There is no cross-call transaction;
//! a content save is a delete-many followed by an insert-many, and concurrent
//! savers race. Per-document serialization or compare-and-swap would slot in
//! behind this trait without touching the protocol layer.

pub mod memory;
pub mod rocks;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{BlockRow, Document, PrincipalId};

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// Selects documents. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentFilter {
    pub id: Option<Uuid>,
    pub owner: Option<PrincipalId>,
}

impl DocumentFilter {
    pub fn by_id(id: Uuid) -> Self {
        Self { id: Some(id), owner: None }
    }

    pub fn by_owner(owner: PrincipalId) -> Self {
        Self { id: None, owner: Some(owner) }
    }

    pub fn matches(&self, document: &Document) -> bool {
        self.id.map_or(true, |id| document.id == id)
            && self.owner.map_or(true, |owner| document.owner == owner)
    }
}

/// Selects blocks of one document, optionally only one sibling group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockFilter {
    pub document_id: Uuid,
    /// `None` = any parent, `Some(None)` = top level, `Some(Some(id))` = children of `id`.
    pub parent_id: Option<Option<String>>,
}

impl BlockFilter {
    pub fn document(document_id: Uuid) -> Self {
        Self { document_id, parent_id: None }
    }

    pub fn children_of(document_id: Uuid, parent_id: Option<&str>) -> Self {
        Self {
            document_id,
            parent_id: Some(parent_id.map(str::to_string)),
        }
    }

    pub fn matches(&self, row: &BlockRow) -> bool {
        row.document_id == self.document_id
            && self.parent_id.as_ref().map_or(true, |p| row.parent_id == *p)
    }
}

/// Async access to the documents and blocks collections.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find_documents(&self, filter: &DocumentFilter) -> Result<Vec<Document>, StoreError>;

    async fn find_document(&self, id: Uuid) -> Result<Option<Document>, StoreError> {
        Ok(self.find_documents(&DocumentFilter::by_id(id)).await?.into_iter().next())
    }

    async fn insert_document(&self, document: Document) -> Result<(), StoreError>;

    /// Replace the stored document with the same id. Returns `false` if none exists.
    async fn update_document(&self, document: &Document) -> Result<bool, StoreError>;

    async fn delete_documents(&self, filter: &DocumentFilter) -> Result<u64, StoreError>;

    /// Matching rows sorted by order index ascending.
    async fn find_blocks(&self, filter: &BlockFilter) -> Result<Vec<BlockRow>, StoreError>;

    /// Upsert keyed by `(document_id, id)`: a row replaces any stored row of
    /// the same document with the same block id.
    async fn insert_blocks(&self, rows: Vec<BlockRow>) -> Result<u64, StoreError>;

    async fn delete_blocks(&self, filter: &BlockFilter) -> Result<u64, StoreError>;
}

/// Stable sort used by every backend for `find_blocks`.
pub(crate) fn sort_by_order(rows: &mut [BlockRow]) {
    rows.sort_by_key(|r| r.order_index);
}

/// Decorator putting a deadline on every call of the wrapped store.
///
/// A call that outlives the deadline is abandoned and reported as
/// [`StoreError::Timeout`], so a disconnecting session never leaves
/// operations pending forever.
pub struct TimedStore {
    inner: Arc<dyn DocumentStore>,
    limit: Duration,
}

impl TimedStore {
    pub fn new(inner: Arc<dyn DocumentStore>, limit: Duration) -> Self {
        Self { inner, limit }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }
}

async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| StoreError::Timeout(limit))?
}

#[async_trait]
impl DocumentStore for TimedStore {
    async fn find_documents(&self, filter: &DocumentFilter) -> Result<Vec<Document>, StoreError> {
        bounded(self.limit, self.inner.find_documents(filter)).await
    }

    async fn find_document(&self, id: Uuid) -> Result<Option<Document>, StoreError> {
        bounded(self.limit, self.inner.find_document(id)).await
    }

    async fn insert_document(&self, document: Document) -> Result<(), StoreError> {
        bounded(self.limit, self.inner.insert_document(document)).await
    }

    async fn update_document(&self, document: &Document) -> Result<bool, StoreError> {
        bounded(self.limit, self.inner.update_document(document)).await
    }

    async fn delete_documents(&self, filter: &DocumentFilter) -> Result<u64, StoreError> {
        bounded(self.limit, self.inner.delete_documents(filter)).await
    }

    async fn find_blocks(&self, filter: &BlockFilter) -> Result<Vec<BlockRow>, StoreError> {
        bounded(self.limit, self.inner.find_blocks(filter)).await
    }

    async fn insert_blocks(&self, rows: Vec<BlockRow>) -> Result<u64, StoreError> {
        bounded(self.limit, self.inner.insert_blocks(rows)).await
    }

    async fn delete_blocks(&self, filter: &BlockFilter) -> Result<u64, StoreError> {
        bounded(self.limit, self.inner.delete_blocks(filter)).await
    }
}
