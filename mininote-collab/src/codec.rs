//! Block tree codec: nested content tree ⇄ flat persisted rows.
//!
//! `flatten` walks the tree depth-first, emitting each node followed by its
//! descendants, and numbers every sibling run 0..n-1. Output position carries
//! no meaning; hierarchy lives in `parent_id` + `order_index` only.
//!
//! `reconstruct` has two explicit modes:
//! - [`ReconstructMode::Shallow`] returns every row as a childless node, in
//!   input order, with its `parent_id` and `order_index` attached. Consumers
//!   rebuild hierarchy themselves, e.g. with [`assemble`].
//! - [`ReconstructMode::FullTree`] groups rows by parent, sorts each group by
//!   order index and attaches groups under their parent starting from the
//!   roots. `reconstruct(flatten(t), FullTree) == t`.
//!
//! Depth is bounded by [`MAX_TREE_DEPTH`] in both directions, and rows that
//! cannot be reached from a root are reported as a cycle, so malformed input
//! never loops.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CodecError;
use crate::model::{BlockNode, BlockRow};

/// Deepest nesting accepted from clients or storage.
pub const MAX_TREE_DEPTH: usize = 64;

/// How flat rows are turned back into nodes for a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconstructMode {
    Shallow,
    #[default]
    FullTree,
}

impl fmt::Display for ReconstructMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shallow => f.write_str("shallow"),
            Self::FullTree => f.write_str("full-tree"),
        }
    }
}

impl FromStr for ReconstructMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shallow" => Ok(Self::Shallow),
            "full-tree" | "full" => Ok(Self::FullTree),
            other => Err(format!("unknown reconstruct mode '{other}' (expected shallow or full-tree)")),
        }
    }
}

/// Flatten a top-level block sequence of `document_id`.
pub fn flatten(tree: &[BlockNode], document_id: Uuid) -> Result<Vec<BlockRow>, CodecError> {
    flatten_under(tree, document_id, None)
}

/// Flatten `tree` as the children of `parent_id`.
pub fn flatten_under(
    tree: &[BlockNode],
    document_id: Uuid,
    parent_id: Option<&str>,
) -> Result<Vec<BlockRow>, CodecError> {
    let total = tree.iter().map(BlockNode::subtree_len).sum();
    let mut rows = Vec::with_capacity(total);
    let mut seen = HashSet::with_capacity(total + 1);
    if let Some(parent) = parent_id {
        seen.insert(parent.to_string());
    }
    flatten_level(tree, document_id, parent_id, 1, &mut seen, &mut rows)?;
    Ok(rows)
}

fn flatten_level(
    nodes: &[BlockNode],
    document_id: Uuid,
    parent_id: Option<&str>,
    depth: usize,
    seen: &mut HashSet<String>,
    rows: &mut Vec<BlockRow>,
) -> Result<(), CodecError> {
    if nodes.is_empty() {
        return Ok(());
    }
    if depth > MAX_TREE_DEPTH {
        return Err(CodecError::TooDeep(MAX_TREE_DEPTH));
    }

    for (index, node) in nodes.iter().enumerate() {
        if !seen.insert(node.id.clone()) {
            return Err(CodecError::DuplicateId(node.id.clone()));
        }
        rows.push(BlockRow {
            id: node.id.clone(),
            document_id,
            parent_id: parent_id.map(str::to_string),
            block_type: node.block_type.clone(),
            content: node.content.clone(),
            props: node.props.clone(),
            order_index: index as u32,
            children: node.children.iter().map(|c| c.id.clone()).collect(),
        });
        flatten_level(&node.children, document_id, Some(&node.id), depth + 1, seen, rows)?;
    }
    Ok(())
}

/// Turn persisted rows back into nodes according to `mode`.
pub fn reconstruct(rows: &[BlockRow], mode: ReconstructMode) -> Result<Vec<BlockNode>, CodecError> {
    match mode {
        ReconstructMode::Shallow => Ok(rows
            .iter()
            .map(|r| BlockNode {
                parent_id: r.parent_id.clone(),
                order_index: Some(r.order_index),
                ..node_from_row(r, Vec::new())
            })
            .collect()),
        ReconstructMode::FullTree => build_tree(rows),
    }
}

/// Rebuild the nested tree from shallow nodes.
///
/// `assemble(&reconstruct(rows, Shallow)?) == reconstruct(rows, FullTree)?`.
/// A node without an order index sorts by its position in `nodes`.
pub fn assemble(nodes: &[BlockNode]) -> Result<Vec<BlockNode>, CodecError> {
    let rows: Vec<BlockRow> = nodes
        .iter()
        .enumerate()
        .map(|(position, node)| BlockRow {
            id: node.id.clone(),
            document_id: Uuid::nil(),
            parent_id: node.parent_id.clone(),
            block_type: node.block_type.clone(),
            content: node.content.clone(),
            props: node.props.clone(),
            order_index: node.order_index.unwrap_or(position as u32),
            children: Vec::new(),
        })
        .collect();
    build_tree(&rows)
}

fn node_from_row(row: &BlockRow, children: Vec<BlockNode>) -> BlockNode {
    BlockNode {
        id: row.id.clone(),
        block_type: row.block_type.clone(),
        props: row.props.clone(),
        content: row.content.clone(),
        children,
        parent_id: None,
        order_index: None,
    }
}

type Groups<'a> = HashMap<Option<&'a str>, Vec<&'a BlockRow>>;

fn build_tree(rows: &[BlockRow]) -> Result<Vec<BlockNode>, CodecError> {
    let mut ids = HashSet::with_capacity(rows.len());
    for row in rows {
        if !ids.insert(row.id.as_str()) {
            return Err(CodecError::DuplicateId(row.id.clone()));
        }
    }

    let mut groups: Groups<'_> = HashMap::new();
    for row in rows {
        if let Some(parent) = row.parent_id.as_deref() {
            if !ids.contains(parent) {
                return Err(CodecError::UnknownParent {
                    block: row.id.clone(),
                    parent: parent.to_string(),
                });
            }
        }
        groups.entry(row.parent_id.as_deref()).or_default().push(row);
    }
    for group in groups.values_mut() {
        group.sort_by(|a, b| a.order_index.cmp(&b.order_index).then_with(|| a.id.cmp(&b.id)));
    }

    let mut visited = HashSet::with_capacity(rows.len());
    let roots = attach(None, &groups, 1, &mut visited)?;

    // Every parent exists, so anything unreached hangs off a cycle.
    if visited.len() != rows.len() {
        if let Some(stray) = rows.iter().find(|r| !visited.contains(r.id.as_str())) {
            return Err(CodecError::Cycle(stray.id.clone()));
        }
    }
    Ok(roots)
}

fn attach<'a>(
    parent: Option<&'a str>,
    groups: &Groups<'a>,
    depth: usize,
    visited: &mut HashSet<&'a str>,
) -> Result<Vec<BlockNode>, CodecError> {
    let Some(group) = groups.get(&parent) else {
        return Ok(Vec::new());
    };
    if depth > MAX_TREE_DEPTH {
        return Err(CodecError::TooDeep(MAX_TREE_DEPTH));
    }

    let mut nodes = Vec::with_capacity(group.len());
    for &row in group {
        visited.insert(row.id.as_str());
        let children = attach(Some(row.id.as_str()), groups, depth + 1, visited)?;
        nodes.push(node_from_row(row, children));
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BlockType;
    use proptest::prelude::*;
    use serde_json::json;

    fn para(id: &str) -> BlockNode {
        BlockNode::new(id, BlockType::Paragraph)
    }

    fn sample_tree() -> Vec<BlockNode> {
        vec![
            BlockNode::new("todo", BlockType::CheckListItem)
                .with_content(json!([{"type": "text", "text": "ship it"}]))
                .with_children(vec![para("todo.a"), para("todo.b").with_children(vec![para("todo.b.i")])]),
            para("tail"),
        ]
    }

    fn row<'a>(rows: &'a [BlockRow], id: &str) -> &'a BlockRow {
        rows.iter().find(|r| r.id == id).unwrap()
    }

    #[test]
    fn test_flatten_assigns_parent_and_order() {
        let doc = Uuid::new_v4();
        let rows = flatten(&sample_tree(), doc).unwrap();
        assert_eq!(rows.len(), 5);

        assert_eq!(row(&rows, "todo").parent_id, None);
        assert_eq!(row(&rows, "todo").order_index, 0);
        assert_eq!(row(&rows, "tail").order_index, 1);
        assert_eq!(row(&rows, "todo.b").parent_id.as_deref(), Some("todo"));
        assert_eq!(row(&rows, "todo.b").order_index, 1);
        assert_eq!(row(&rows, "todo.b.i").parent_id.as_deref(), Some("todo.b"));
        assert_eq!(row(&rows, "todo.b.i").order_index, 0);
        assert!(rows.iter().all(|r| r.document_id == doc));
    }

    #[test]
    fn test_flatten_depth_first_output() {
        let rows = flatten(&sample_tree(), Uuid::new_v4()).unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["todo", "todo.a", "todo.b", "todo.b.i", "tail"]);
    }

    #[test]
    fn test_flatten_children_cache() {
        let rows = flatten(&sample_tree(), Uuid::new_v4()).unwrap();
        assert_eq!(row(&rows, "todo").children, vec!["todo.a", "todo.b"]);
        assert!(row(&rows, "tail").children.is_empty());
    }

    #[test]
    fn test_flatten_under_parent() {
        let rows = flatten_under(&[para("x"), para("y")], Uuid::new_v4(), Some("root")).unwrap();
        assert!(rows.iter().all(|r| r.parent_id.as_deref() == Some("root")));
        assert_eq!(row(&rows, "y").order_index, 1);
    }

    #[test]
    fn test_flatten_rejects_duplicate_ids() {
        let tree = vec![para("a").with_children(vec![para("a")])];
        assert_eq!(
            flatten(&tree, Uuid::new_v4()),
            Err(CodecError::DuplicateId("a".into()))
        );
    }

    #[test]
    fn test_flatten_rejects_excessive_depth() {
        let mut node = para("leaf");
        for i in 0..MAX_TREE_DEPTH {
            node = para(&format!("n{i}")).with_children(vec![node]);
        }
        assert_eq!(
            flatten(&[node], Uuid::new_v4()),
            Err(CodecError::TooDeep(MAX_TREE_DEPTH))
        );
    }

    #[test]
    fn test_flatten_empty() {
        assert!(flatten(&[], Uuid::new_v4()).unwrap().is_empty());
    }

    #[test]
    fn test_full_tree_roundtrip() {
        let tree = sample_tree();
        let rows = flatten(&tree, Uuid::new_v4()).unwrap();
        assert_eq!(reconstruct(&rows, ReconstructMode::FullTree).unwrap(), tree);
    }

    #[test]
    fn test_full_tree_ignores_row_order() {
        let tree = sample_tree();
        let mut rows = flatten(&tree, Uuid::new_v4()).unwrap();
        rows.reverse();
        assert_eq!(reconstruct(&rows, ReconstructMode::FullTree).unwrap(), tree);
    }

    #[test]
    fn test_full_tree_ignores_stale_children_cache() {
        let tree = sample_tree();
        let mut rows = flatten(&tree, Uuid::new_v4()).unwrap();
        for r in rows.iter_mut() {
            r.children = vec!["bogus".into()];
        }
        assert_eq!(reconstruct(&rows, ReconstructMode::FullTree).unwrap(), tree);
    }

    #[test]
    fn test_shallow_keeps_rows_flat() {
        let rows = flatten(&sample_tree(), Uuid::new_v4()).unwrap();
        let nodes = reconstruct(&rows, ReconstructMode::Shallow).unwrap();
        assert_eq!(nodes.len(), rows.len());
        assert!(nodes.iter().all(|n| n.children.is_empty()));
        assert_eq!(nodes[0].id, "todo");
        assert_eq!(nodes[0].content, json!([{"type": "text", "text": "ship it"}]));
    }

    #[test]
    fn test_shallow_carries_position() {
        let rows = flatten(&sample_tree(), Uuid::new_v4()).unwrap();
        let nodes = reconstruct(&rows, ReconstructMode::Shallow).unwrap();
        let node = |id: &str| nodes.iter().find(|n| n.id == id).unwrap();

        assert_eq!(node("todo").parent_id, None);
        assert_eq!(node("todo").order_index, Some(0));
        assert_eq!(node("tail").order_index, Some(1));
        assert_eq!(node("todo.b").parent_id.as_deref(), Some("todo"));
        assert_eq!(node("todo.b").order_index, Some(1));
        assert_eq!(node("todo.b.i").parent_id.as_deref(), Some("todo.b"));

        let wire = serde_json::to_value(node("todo.b.i")).unwrap();
        assert_eq!(wire["parentId"], "todo.b");
        assert_eq!(wire["orderIndex"], 0);
    }

    #[test]
    fn test_assemble_shallow_matches_full_tree() {
        let mut rows = flatten(&sample_tree(), Uuid::new_v4()).unwrap();
        // Stores hand rows back sorted by order index across all parents.
        rows.sort_by_key(|r| r.order_index);

        let shallow = reconstruct(&rows, ReconstructMode::Shallow).unwrap();
        let wire = serde_json::to_string(&shallow).unwrap();
        let received: Vec<BlockNode> = serde_json::from_str(&wire).unwrap();

        assert_eq!(assemble(&received).unwrap(), sample_tree());
        assert_eq!(
            assemble(&received).unwrap(),
            reconstruct(&rows, ReconstructMode::FullTree).unwrap()
        );
    }

    #[test]
    fn test_assemble_rejects_unknown_parent() {
        let mut orphan = para("orphan");
        orphan.parent_id = Some("ghost".into());
        orphan.order_index = Some(0);
        assert_eq!(
            assemble(&[orphan]),
            Err(CodecError::UnknownParent { block: "orphan".into(), parent: "ghost".into() })
        );
    }

    #[test]
    fn test_reconstruct_unknown_parent() {
        let doc = Uuid::new_v4();
        let mut orphan = BlockRow::initial_paragraph(doc, "orphan");
        orphan.parent_id = Some("ghost".into());
        let err = reconstruct(&[orphan], ReconstructMode::FullTree).unwrap_err();
        assert_eq!(
            err,
            CodecError::UnknownParent { block: "orphan".into(), parent: "ghost".into() }
        );
    }

    #[test]
    fn test_reconstruct_detects_cycle() {
        let doc = Uuid::new_v4();
        let root = BlockRow::initial_paragraph(doc, "root");
        let mut a = BlockRow::initial_paragraph(doc, "a");
        let mut b = BlockRow::initial_paragraph(doc, "b");
        a.parent_id = Some("b".into());
        b.parent_id = Some("a".into());

        let err = reconstruct(&[root, a, b], ReconstructMode::FullTree).unwrap_err();
        assert!(matches!(err, CodecError::Cycle(_)));
    }

    #[test]
    fn test_reconstruct_self_parent_is_cycle() {
        let doc = Uuid::new_v4();
        let mut me = BlockRow::initial_paragraph(doc, "me");
        me.parent_id = Some("me".into());
        assert_eq!(
            reconstruct(&[me], ReconstructMode::FullTree),
            Err(CodecError::Cycle("me".into()))
        );
    }

    #[test]
    fn test_reconstruct_duplicate_rows() {
        let doc = Uuid::new_v4();
        let rows = vec![BlockRow::initial_paragraph(doc, "x"), BlockRow::initial_paragraph(doc, "x")];
        assert_eq!(
            reconstruct(&rows, ReconstructMode::FullTree),
            Err(CodecError::DuplicateId("x".into()))
        );
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("shallow".parse::<ReconstructMode>().unwrap(), ReconstructMode::Shallow);
        assert_eq!("full-tree".parse::<ReconstructMode>().unwrap(), ReconstructMode::FullTree);
        assert!("deep".parse::<ReconstructMode>().is_err());
        assert_eq!(ReconstructMode::default().to_string(), "full-tree");
    }

    #[derive(Debug, Clone)]
    struct Shape(Vec<Shape>);

    fn arb_forest() -> impl Strategy<Value = Vec<Shape>> {
        let leaf = Just(Shape(Vec::new()));
        let shape = leaf.prop_recursive(4, 48, 4, |inner| {
            prop::collection::vec(inner, 0..4).prop_map(Shape)
        });
        prop::collection::vec(shape, 0..6)
    }

    fn to_nodes(shapes: &[Shape], next: &mut usize) -> Vec<BlockNode> {
        shapes
            .iter()
            .map(|s| {
                *next += 1;
                let id = format!("b{next}");
                para(&id).with_children(to_nodes(&s.0, next))
            })
            .collect()
    }

    proptest! {
        #[test]
        fn prop_sibling_runs_are_contiguous(forest in arb_forest()) {
            let tree = to_nodes(&forest, &mut 0);
            let rows = flatten(&tree, Uuid::new_v4()).unwrap();

            let mut runs: HashMap<Option<String>, Vec<u32>> = HashMap::new();
            for r in &rows {
                runs.entry(r.parent_id.clone()).or_default().push(r.order_index);
            }
            for (_, mut indices) in runs {
                indices.sort_unstable();
                let expected: Vec<u32> = (0..indices.len() as u32).collect();
                prop_assert_eq!(indices, expected);
            }
        }

        #[test]
        fn prop_full_tree_roundtrip(forest in arb_forest()) {
            let tree = to_nodes(&forest, &mut 0);
            let rows = flatten(&tree, Uuid::new_v4()).unwrap();
            prop_assert_eq!(rows.len(), tree.iter().map(BlockNode::subtree_len).sum::<usize>());
            prop_assert_eq!(reconstruct(&rows, ReconstructMode::FullTree).unwrap(), tree);
        }

        #[test]
        fn prop_assembled_shallow_roundtrip(forest in arb_forest()) {
            let tree = to_nodes(&forest, &mut 0);
            let rows = flatten(&tree, Uuid::new_v4()).unwrap();
            let shallow = reconstruct(&rows, ReconstructMode::Shallow).unwrap();
            prop_assert_eq!(assemble(&shallow).unwrap(), tree);
        }
    }
}
