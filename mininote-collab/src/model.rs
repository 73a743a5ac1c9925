//! Document and block records shared by the codec, the store and the wire protocol.
//!
//! A document's content lives in two shapes:
//! ```text
//! BlockNode (tree, on the wire)          BlockRow (flat, persisted)
//! ┌──────────────┐                       ┌────┬────────┬───────┬───────┐
//! │ a            │                       │ id │ parent │ order │ ...   │
//! │ ├── a.1      │   codec::flatten      ├────┼────────┼───────┼───────┤
//! │ └── a.2      │ ───────────────────►  │ a  │ null   │ 0     │       │
//! │ b            │ ◄───────────────────  │ a.1│ a      │ 0     │       │
//! └──────────────┘   codec::reconstruct  │ a.2│ a      │ 1     │       │
//!                                        │ b  │ null   │ 1     │       │
//!                                        └────┴────────┴───────┴───────┘
//! ```
//! `parent_id` + `order_index` are the source of truth; `BlockRow::children`
//! is a cache written on flatten and never read back as authoritative.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identity of an authenticated user.
pub type PrincipalId = Uuid;

/// Identity of one live connection.
pub type SessionId = Uuid;

/// Title given to documents created without one.
pub const DEFAULT_TITLE: &str = "Untitled";

/// A collaborative note.
///
/// `owner` never changes after creation; it is the only access-control input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: Uuid,
    pub owner: PrincipalId,
    pub title: String,
    pub last_editor: PrincipalId,
    pub last_modified: DateTime<Utc>,
}

impl Document {
    /// Create a fresh document owned (and last edited) by `owner`.
    pub fn new(owner: PrincipalId, title: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner,
            title: title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            last_editor: owner,
            last_modified: Utc::now(),
        }
    }

    /// Record an edit by `editor`, optionally renaming the document.
    pub fn touch(&mut self, editor: PrincipalId, title: Option<String>) {
        if let Some(title) = title {
            self.title = title;
        }
        self.last_editor = editor;
        self.last_modified = Utc::now();
    }
}

/// Block type tag.
///
/// Unknown tags round-trip through `Other` so newer editors can add types
/// without a server upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BlockType {
    Paragraph,
    Heading,
    BulletListItem,
    NumberedListItem,
    CheckListItem,
    Image,
    CodeBlock,
    Table,
    Quote,
    Other(String),
}

impl BlockType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Paragraph => "paragraph",
            Self::Heading => "heading",
            Self::BulletListItem => "bulletListItem",
            Self::NumberedListItem => "numberedListItem",
            Self::CheckListItem => "checkListItem",
            Self::Image => "image",
            Self::CodeBlock => "codeBlock",
            Self::Table => "table",
            Self::Quote => "quote",
            Self::Other(tag) => tag,
        }
    }
}

impl From<String> for BlockType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "paragraph" => Self::Paragraph,
            "heading" => Self::Heading,
            "bulletListItem" => Self::BulletListItem,
            "numberedListItem" => Self::NumberedListItem,
            "checkListItem" => Self::CheckListItem,
            "image" => Self::Image,
            "codeBlock" => Self::CodeBlock,
            "table" => Self::Table,
            "quote" => Self::Quote,
            _ => Self::Other(tag),
        }
    }
}

impl From<BlockType> for String {
    fn from(block_type: BlockType) -> Self {
        match block_type {
            BlockType::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node of a document's content tree, as editors send and receive it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockNode {
    pub id: String,
    #[serde(rename = "type")]
    pub block_type: BlockType,
    #[serde(default)]
    pub props: Value,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub children: Vec<BlockNode>,
    /// Parent block id. Only set on nodes from a shallow reconstruction,
    /// where hierarchy travels here instead of in `children`.
    #[serde(default, rename = "parentId", skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Position among siblings. Set on every node of a shallow reconstruction.
    #[serde(default, rename = "orderIndex", skip_serializing_if = "Option::is_none")]
    pub order_index: Option<u32>,
}

impl BlockNode {
    /// A node with empty props/content and no children.
    pub fn new(id: impl Into<String>, block_type: BlockType) -> Self {
        Self {
            id: id.into(),
            block_type,
            props: Value::Object(Default::default()),
            content: Value::Array(Vec::new()),
            children: Vec::new(),
            parent_id: None,
            order_index: None,
        }
    }

    pub fn with_children(mut self, children: Vec<BlockNode>) -> Self {
        self.children = children;
        self
    }

    pub fn with_content(mut self, content: Value) -> Self {
        self.content = content;
        self
    }

    /// Total number of nodes in this subtree, including `self`.
    pub fn subtree_len(&self) -> usize {
        1 + self.children.iter().map(BlockNode::subtree_len).sum::<usize>()
    }
}

/// A persisted block: one flat row per node.
///
/// Block ids are client-assigned and only unique within one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRow {
    pub id: String,
    pub document_id: Uuid,
    pub parent_id: Option<String>,
    #[serde(rename = "type")]
    pub block_type: BlockType,
    pub content: Value,
    pub props: Value,
    pub order_index: u32,
    /// Immediate child ids at write time. Cache only.
    #[serde(default)]
    pub children: Vec<String>,
}

impl BlockRow {
    /// The default first block of a new document.
    pub fn initial_paragraph(document_id: Uuid, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            document_id,
            parent_id: None,
            block_type: BlockType::Paragraph,
            content: Value::Array(Vec::new()),
            props: Value::Object(Default::default()),
            order_index: 0,
            children: Vec::new(),
        }
    }
}
