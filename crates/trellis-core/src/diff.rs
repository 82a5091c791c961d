//! Batched file-subgraph replacement and the diffs it produces

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::*;

/// Where a staged node came from, relative to the graph being updated.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOrigin {
    /// The id is already in the graph for the same file.
    Existing,
    /// First observation; the id may be disambiguated if another file owns it.
    Fresh,
    /// An existing node correlated to a new location by rename detection.
    Moved { from: PathBuf },
    /// A recently removed node brought back by rename detection.
    Revived { from: PathBuf },
}

#[derive(Debug, Clone)]
pub struct StagedNode {
    pub node: Node,
    pub origin: NodeOrigin,
}

/// An edge whose target has not been resolved to an id yet.
///
/// `target_ref` is either a node id or a qualified name; the store resolves it
/// while applying the batch and parks the edge as pending if nothing matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedEdge {
    /// File the edge was extracted from; scopes local id rewrites.
    pub origin_file: PathBuf,
    pub source_id: NodeId,
    pub target_ref: String,
    pub edge_type: EdgeType,
    pub line: Option<u32>,
}

/// Everything needed to replace the subgraphs of a set of files in one step.
#[derive(Debug, Clone, Default)]
pub struct FileBatch {
    /// Files whose subgraphs are replaced. Outgoing static edges of every node
    /// in these files are replaced by `edges`.
    pub paths: BTreeSet<PathBuf>,
    pub nodes: Vec<StagedNode>,
    pub removals: Vec<NodeId>,
    pub edges: Vec<StagedEdge>,
    /// Edges restored together with revived nodes, counters included.
    pub restored_edges: Vec<Edge>,
    /// Pending edges parked for a removed node that this batch revives.
    pub released: Vec<EdgeKey>,
    /// Static edges withdrawn outright, for nodes whose file is not in `paths`.
    pub retracted: Vec<EdgeKey>,
}

impl FileBatch {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.removals.is_empty() && self.edges.is_empty() && self.paths.is_empty()
    }
}

/// A node that kept its identity while its location changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMove {
    pub id: NodeId,
    pub from: PathBuf,
    pub to: PathBuf,
}

/// A node deleted by a batch, with the edges that pointed at it.
#[derive(Debug, Clone)]
pub struct RemovedNode {
    pub node: Node,
    pub incoming: Vec<Edge>,
    /// Pending edges created on the node's qualified name for its former callers.
    pub parked: Vec<EdgeKey>,
}

/// Represents a change to the graph that should be broadcast to clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDiff {
    /// Monotonically increasing diff sequence number.
    pub sequence: u64,
    pub added_nodes: Vec<Node>,
    pub removed_nodes: Vec<NodeId>,
    /// Nodes updated in place (span, name or metadata changed).
    pub modified_nodes: Vec<NodeId>,
    pub moved_nodes: Vec<NodeMove>,
    pub added_edges: Vec<EdgeKey>,
    pub removed_edges: Vec<EdgeKey>,
}

impl GraphDiff {
    /// Create an empty diff with given sequence number.
    pub fn new(sequence: u64) -> Self {
        GraphDiff {
            sequence,
            ..Default::default()
        }
    }

    /// Check if this diff is empty (no changes).
    pub fn is_empty(&self) -> bool {
        self.added_nodes.is_empty()
            && self.removed_nodes.is_empty()
            && self.modified_nodes.is_empty()
            && self.moved_nodes.is_empty()
            && self.added_edges.is_empty()
            && self.removed_edges.is_empty()
    }
}

/// Result of applying a [`FileBatch`].
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub diff: GraphDiff,
    pub removed: Vec<RemovedNode>,
    /// Edges from this batch whose targets did not resolve and were parked.
    pub pending: Vec<EdgeKey>,
}
