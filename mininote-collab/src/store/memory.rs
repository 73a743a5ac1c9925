//! In-memory document store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{sort_by_order, BlockFilter, DocumentFilter, DocumentStore};
use crate::error::StoreError;
use crate::model::{BlockRow, Document};

#[derive(Default)]
struct Collections {
    documents: HashMap<Uuid, Document>,
    /// Rows grouped by owning document, in insertion order.
    blocks: HashMap<Uuid, Vec<BlockRow>>,
}

/// Volatile store backed by two hash maps behind one lock.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Collections>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents held.
    pub async fn document_count(&self) -> usize {
        self.inner.read().await.documents.len()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find_documents(&self, filter: &DocumentFilter) -> Result<Vec<Document>, StoreError> {
        let inner = self.inner.read().await;
        if let Some(id) = filter.id {
            return Ok(inner
                .documents
                .get(&id)
                .filter(|d| filter.matches(d))
                .cloned()
                .into_iter()
                .collect());
        }
        Ok(inner.documents.values().filter(|d| filter.matches(d)).cloned().collect())
    }

    async fn insert_document(&self, document: Document) -> Result<(), StoreError> {
        self.inner.write().await.documents.insert(document.id, document);
        Ok(())
    }

    async fn update_document(&self, document: &Document) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        match inner.documents.get_mut(&document.id) {
            Some(stored) => {
                *stored = document.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_documents(&self, filter: &DocumentFilter) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.documents.len();
        inner.documents.retain(|_, d| !filter.matches(d));
        Ok((before - inner.documents.len()) as u64)
    }

    async fn find_blocks(&self, filter: &BlockFilter) -> Result<Vec<BlockRow>, StoreError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<BlockRow> = inner
            .blocks
            .get(&filter.document_id)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default();
        sort_by_order(&mut rows);
        Ok(rows)
    }

    async fn insert_blocks(&self, rows: Vec<BlockRow>) -> Result<u64, StoreError> {
        let count = rows.len() as u64;
        let mut inner = self.inner.write().await;
        for row in rows {
            let stored = inner.blocks.entry(row.document_id).or_default();
            match stored.iter().position(|r| r.id == row.id) {
                Some(i) => stored[i] = row,
                None => stored.push(row),
            }
        }
        Ok(count)
    }

    async fn delete_blocks(&self, filter: &BlockFilter) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(rows) = inner.blocks.get_mut(&filter.document_id) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|r| !filter.matches(r));
        let removed = (before - rows.len()) as u64;
        if rows.is_empty() {
            inner.blocks.remove(&filter.document_id);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(doc: Uuid, id: &str, parent: Option<&str>, order: u32) -> BlockRow {
        let mut r = BlockRow::initial_paragraph(doc, id);
        r.parent_id = parent.map(str::to_string);
        r.order_index = order;
        r
    }

    #[tokio::test]
    async fn test_document_crud() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let mut doc = Document::new(owner, Some("First".into()));
        store.insert_document(doc.clone()).await.unwrap();
        store.insert_document(Document::new(owner, None)).await.unwrap();
        store.insert_document(Document::new(Uuid::new_v4(), None)).await.unwrap();

        assert_eq!(store.find_documents(&DocumentFilter::by_owner(owner)).await.unwrap().len(), 2);

        doc.title = "Second".into();
        assert!(store.update_document(&doc).await.unwrap());
        assert_eq!(store.find_document(doc.id).await.unwrap().unwrap().title, "Second");

        assert_eq!(store.delete_documents(&DocumentFilter::by_id(doc.id)).await.unwrap(), 1);
        assert!(store.find_document(doc.id).await.unwrap().is_none());
        assert!(!store.update_document(&doc).await.unwrap());
        assert_eq!(store.document_count().await, 2);
    }

    #[tokio::test]
    async fn test_find_blocks_sorted_by_order() {
        let store = MemoryStore::new();
        let doc = Uuid::new_v4();
        store
            .insert_blocks(vec![row(doc, "c", None, 2), row(doc, "a", None, 0), row(doc, "b", None, 1)])
            .await
            .unwrap();

        let ids: Vec<String> = store
            .find_blocks(&BlockFilter::document(doc))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_block_filters_scope_to_document_and_parent() {
        let store = MemoryStore::new();
        let doc = Uuid::new_v4();
        let other = Uuid::new_v4();
        store
            .insert_blocks(vec![
                row(doc, "p", None, 0),
                row(doc, "p.0", Some("p"), 0),
                row(other, "p", None, 0),
            ])
            .await
            .unwrap();

        let kids = store.find_blocks(&BlockFilter::children_of(doc, Some("p"))).await.unwrap();
        assert_eq!(kids.len(), 1);
        assert_eq!(kids[0].id, "p.0");

        assert_eq!(store.delete_blocks(&BlockFilter::document(doc)).await.unwrap(), 2);
        assert!(store.find_blocks(&BlockFilter::document(doc)).await.unwrap().is_empty());
        assert_eq!(store.find_blocks(&BlockFilter::document(other)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_insert_blocks_upserts_by_id() {
        let store = MemoryStore::new();
        let doc = Uuid::new_v4();
        let other = Uuid::new_v4();
        store.insert_blocks(vec![row(doc, "p", None, 0), row(other, "p", None, 0)]).await.unwrap();

        let mut newer = row(doc, "p", None, 0);
        newer.content = serde_json::json!("second");
        store.insert_blocks(vec![newer]).await.unwrap();

        let rows = store.find_blocks(&BlockFilter::document(doc)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, serde_json::json!("second"));
        assert_eq!(store.find_blocks(&BlockFilter::document(other)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_blocks_missing_document() {
        let store = MemoryStore::new();
        assert_eq!(store.delete_blocks(&BlockFilter::document(Uuid::new_v4())).await.unwrap(), 0);
    }
}
