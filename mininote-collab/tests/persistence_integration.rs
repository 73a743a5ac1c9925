//! Persistence integration tests.
//!
//! Verifies:
//! - Notes written through the full server stack survive a restart
//! - Nested content trees round-trip through RocksDB
//! - Multi-document isolation under persistence
//! - A realtime session sees content created through NoteService

mod common;

use std::sync::Arc;

use serde_json::json;
use tempfile::tempdir;
use uuid::Uuid;

use common::{mint_token, test_config};
use mininote_collab::model::{BlockNode, BlockType};
use mininote_collab::protocol::{ClientEvent, ServerEvent};
use mininote_collab::server::{ServerConfig, SyncServer};
use mininote_collab::store::{BlockFilter, DocumentFilter, DocumentStore, RocksStore, StoreConfig};

fn persistent_config(path: &std::path::Path) -> ServerConfig {
    ServerConfig {
        storage_path: Some(path.to_path_buf()),
        ..test_config()
    }
}

fn nested_tree() -> Vec<BlockNode> {
    vec![
        BlockNode::new("h", BlockType::Heading)
            .with_content(json!([{"type": "text", "text": "Trip"}]))
            .with_children(vec![
                BlockNode::new("h.0", BlockType::CheckListItem),
                BlockNode::new("h.1", BlockType::CheckListItem).with_children(vec![
                    BlockNode::new("h.1.0", BlockType::Paragraph),
                ]),
            ]),
        BlockNode::new("img", BlockType::Image),
        BlockNode::new("code", BlockType::CodeBlock)
            .with_content(json!([{"type": "text", "text": "fn main() {}"}])),
    ]
}

#[tokio::test]
async fn test_notes_survive_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");
    let owner = Uuid::new_v4();
    let token = mint_token(owner);

    let doc_id = {
        let server = SyncServer::new(persistent_config(&db_path)).unwrap();
        let note = server
            .notes()
            .create_note(&token, Some("Itinerary".into()), "p0")
            .await
            .unwrap();
        server
            .notes()
            .update_note(&token, note.document.id, None, Some(nested_tree()))
            .await
            .unwrap();
        note.document.id
    };

    let server = SyncServer::new(persistent_config(&db_path)).unwrap();
    let note = server.notes().get_note(&token, doc_id).await.unwrap();
    assert_eq!(note.document.title, "Itinerary");
    assert_eq!(note.document.owner, owner);
    assert_eq!(note.content, nested_tree());
}

#[tokio::test]
async fn test_realtime_change_is_durable() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");
    let owner = Uuid::new_v4();
    let token = mint_token(owner);

    let doc_id = {
        let server = SyncServer::new(persistent_config(&db_path)).unwrap();
        let doc_id = server
            .notes()
            .create_note(&token, None, "p0")
            .await
            .unwrap()
            .document
            .id;

        let coordinator = server.coordinator();
        let (session, mut outbox) = coordinator.connect().await;
        coordinator
            .handle(
                session,
                ClientEvent::JoinNote {
                    document_id: doc_id,
                    credential_token: token.clone(),
                },
            )
            .await;
        coordinator
            .handle(
                session,
                ClientEvent::NoteChange {
                    document_id: doc_id,
                    blocks: nested_tree(),
                    title: Some("Packed".into()),
                },
            )
            .await;
        coordinator.disconnect(session).await;

        let frame = outbox.recv().await.unwrap();
        assert_eq!(ServerEvent::decode(&frame).unwrap().name(), "InitialState");
        assert!(outbox.recv().await.is_none(), "no errors and no self-echo");
        doc_id
    };

    let server = SyncServer::new(persistent_config(&db_path)).unwrap();
    let (document, content) = server.coordinator().snapshot(doc_id).await.unwrap();
    assert_eq!(document.title, "Packed");
    assert_eq!(content, nested_tree());

    let rows = server
        .store()
        .find_blocks(&BlockFilter::children_of(doc_id, Some("h")))
        .await
        .unwrap();
    let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["h.0", "h.1"]);
}

#[tokio::test]
async fn test_delete_is_durable() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");
    let owner = Uuid::new_v4();
    let token = mint_token(owner);

    let (kept, gone) = {
        let server = SyncServer::new(persistent_config(&db_path)).unwrap();
        let kept = server.notes().create_note(&token, None, "a").await.unwrap();
        let gone = server.notes().create_note(&token, None, "b").await.unwrap();
        server.notes().delete_note(&token, gone.document.id).await.unwrap();
        (kept.document.id, gone.document.id)
    };

    let store = RocksStore::open(StoreConfig::for_testing(&db_path)).unwrap();
    assert!(store.find_document(gone).await.unwrap().is_none());
    assert!(store.find_blocks(&BlockFilter::document(gone)).await.unwrap().is_empty());
    assert!(store.find_document(kept).await.unwrap().is_some());
    assert_eq!(store.find_documents(&DocumentFilter::by_owner(owner)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_multi_document_isolation() {
    let dir = tempdir().unwrap();
    let store: Arc<dyn DocumentStore> =
        Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let server = SyncServer::with_store(test_config(), store.clone()).unwrap();

    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let mut docs = Vec::new();
    for i in 0..5 {
        let owner = if i % 2 == 0 { alice } else { bob };
        // Same client-assigned block id in every document.
        let note = server.notes().create_note(&mint_token(owner), None, "shared").await.unwrap();
        docs.push(note.document.id);
    }

    server
        .notes()
        .update_note(
            &mint_token(alice),
            docs[0],
            None,
            Some(vec![BlockNode::new("only-in-0", BlockType::Quote)]),
        )
        .await
        .unwrap();

    for (i, doc) in docs.iter().enumerate() {
        let rows = store.find_blocks(&BlockFilter::document(*doc)).await.unwrap();
        assert_eq!(rows.len(), 1);
        let expected = if i == 0 { "only-in-0" } else { "shared" };
        assert_eq!(rows[0].id, expected);
    }

    assert_eq!(server.notes().list_notes(&mint_token(alice)).await.unwrap().len(), 3);
    assert_eq!(server.notes().list_notes(&mint_token(bob)).await.unwrap().len(), 2);
}
