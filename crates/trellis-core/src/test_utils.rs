//! Test utilities for Trellis core

use std::path::PathBuf;

use crate::diff::{FileBatch, NodeOrigin, StagedEdge, StagedNode};
use crate::model::{EdgeType, Node, NodeId, NodeType};

/// A function node named after the last segment of its qualified name.
pub fn function(qualified_name: &str, file: &str) -> Node {
    let name = qualified_name.rsplit('.').next().unwrap_or(qualified_name);
    Node::new(NodeType::Function, name, qualified_name, file).with_lines(1, 3)
}

pub fn call(file: &str, source: &Node, target_ref: &str) -> StagedEdge {
    StagedEdge {
        origin_file: PathBuf::from(file),
        source_id: source.id.clone(),
        target_ref: target_ref.to_string(),
        edge_type: EdgeType::Calls,
        line: Some(source.start_line + 1),
    }
}

/// Batch replacing one file's subgraph with the given nodes, all tagged with `origin`.
pub fn file_batch(file: &str, nodes: Vec<Node>, origin: NodeOrigin, edges: Vec<StagedEdge>) -> FileBatch {
    let mut batch = FileBatch::default();
    batch.paths.insert(PathBuf::from(file));
    batch.nodes = nodes
        .into_iter()
        .map(|node| StagedNode { node, origin: origin.clone() })
        .collect();
    batch.edges = edges;
    batch
}

pub fn fresh(file: &str, nodes: Vec<Node>, edges: Vec<StagedEdge>) -> FileBatch {
    file_batch(file, nodes, NodeOrigin::Fresh, edges)
}

pub fn existing(file: &str, nodes: Vec<Node>, edges: Vec<StagedEdge>) -> FileBatch {
    file_batch(file, nodes, NodeOrigin::Existing, edges)
}

pub fn id(raw: &str) -> NodeId {
    NodeId::from(raw)
}
