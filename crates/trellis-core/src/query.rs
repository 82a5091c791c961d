//! Read-only, bounded queries over the graph

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::QueryError;
use crate::graph::{GraphStats, GraphStore};
use crate::model::*;

/// One page of an offset-paginated listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Number of matches across all pages.
    pub total: usize,
    pub offset: usize,
    /// Offset of the next page, absent on the last page.
    pub next_offset: Option<usize>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: usize, offset: usize) -> Self {
        let end = offset + items.len();
        Page {
            next_offset: (end < total).then_some(end),
            items,
            total,
            offset,
        }
    }
}

/// Criteria for [`GraphQuery::list_nodes`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeFilter {
    #[serde(default, alias = "type", skip_serializing_if = "Option::is_none")]
    pub node_type: Option<NodeType>,
    #[serde(default, alias = "filepath", skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    /// Case-insensitive substring of the node name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthetic: Option<bool>,
}

impl NodeFilter {
    pub fn of_type(node_type: NodeType) -> Self {
        NodeFilter {
            node_type: Some(node_type),
            ..Default::default()
        }
    }

    pub fn in_file(path: impl Into<PathBuf>) -> Self {
        NodeFilter {
            file_path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, node: &Node) -> bool {
        if self.node_type.as_ref().is_some_and(|ty| ty != &node.node_type) {
            return false;
        }
        if self.file_path.as_ref().is_some_and(|path| path != &node.file_path) {
            return false;
        }
        if let Some(name) = &self.name {
            if !node.name.to_lowercase().contains(&name.to_lowercase()) {
                return false;
            }
        }
        if self.synthetic.is_some_and(|synthetic| synthetic != node.is_synthetic()) {
            return false;
        }
        true
    }
}

/// Validated accessors shared by the HTTP API and the agent protocol.
///
/// Every listing requires an explicit limit in `1..=max_page_size`. Each
/// call reads through a single [`crate::GraphView`], so it observes one
/// consistent state even while file batches are being applied.
#[derive(Clone)]
pub struct GraphQuery {
    store: Arc<GraphStore>,
    max_page_size: usize,
}

impl GraphQuery {
    pub fn new(store: Arc<GraphStore>, max_page_size: usize) -> Self {
        GraphQuery { store, max_page_size }
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    pub fn max_page_size(&self) -> usize {
        self.max_page_size
    }

    fn check_limit(&self, limit: usize) -> Result<usize, QueryError> {
        if limit == 0 || limit > self.max_page_size {
            return Err(QueryError::InvalidLimit {
                limit,
                max: self.max_page_size,
            });
        }
        Ok(limit)
    }

    pub fn list_nodes(&self, filter: &NodeFilter, limit: usize, offset: usize) -> Result<Page<Node>, QueryError> {
        let limit = self.check_limit(limit)?;
        Ok(self.store.view().list_nodes(filter, limit, offset))
    }

    pub fn get_node_details(&self, id: &NodeId) -> Result<Node, QueryError> {
        self.store
            .view()
            .node(id)
            .ok_or_else(|| QueryError::NotFound(id.clone()))
    }

    pub fn search_nodes(&self, keyword: &str, limit: usize) -> Result<Vec<Node>, QueryError> {
        let limit = self.check_limit(limit)?;
        Ok(self.store.view().search(keyword, limit))
    }

    pub fn list_edges_for_node(
        &self,
        id: &NodeId,
        direction: Direction,
        limit: usize,
        offset: usize,
    ) -> Result<Page<Edge>, QueryError> {
        let limit = self.check_limit(limit)?;
        let view = self.store.view();
        if !view.contains(id) {
            return Err(QueryError::NotFound(id.clone()));
        }
        Ok(view.list_edges(id, direction, limit, offset))
    }

    /// Functions with a `calls` edge into `id`.
    pub fn find_functions_calling(&self, id: &NodeId, limit: usize) -> Result<Vec<Node>, QueryError> {
        self.call_neighbours(id, Direction::Incoming, limit)
    }

    /// Functions that `id` has a `calls` edge to.
    pub fn find_functions_called_by(&self, id: &NodeId, limit: usize) -> Result<Vec<Node>, QueryError> {
        self.call_neighbours(id, Direction::Outgoing, limit)
    }

    fn call_neighbours(&self, id: &NodeId, direction: Direction, limit: usize) -> Result<Vec<Node>, QueryError> {
        let limit = self.check_limit(limit)?;
        let view = self.store.view();
        if !view.contains(id) {
            return Err(QueryError::NotFound(id.clone()));
        }
        let neighbours = view
            .edges(id, direction)
            .into_iter()
            .filter(|edge| edge.edge_type == EdgeType::Calls)
            .map(|edge| match direction {
                Direction::Incoming => edge.source_id,
                _ => edge.target_id,
            })
            .filter_map(|other| view.node(&other))
            .filter(|node| node.node_type == NodeType::Function)
            .take(limit)
            .collect();
        Ok(neighbours)
    }

    pub fn nodes_by_type(&self, node_type: NodeType, limit: usize, offset: usize) -> Result<Page<Node>, QueryError> {
        self.list_nodes(&NodeFilter::of_type(node_type), limit, offset)
    }

    pub fn nodes_by_filepath(&self, path: &Path, limit: usize, offset: usize) -> Result<Page<Node>, QueryError> {
        self.list_nodes(&NodeFilter::in_file(path), limit, offset)
    }

    /// Functions whose name or `parameters` metadata contains `keyword`.
    pub fn find_functions_by_keyword(&self, keyword: &str, limit: usize) -> Result<Vec<Node>, QueryError> {
        let limit = self.check_limit(limit)?;
        let needle = keyword.to_lowercase();
        let view = self.store.view();
        let ids: Vec<NodeId> = view
            .iter_nodes()
            .filter(|node| node.node_type == NodeType::Function)
            .filter(|node| {
                node.name.to_lowercase().contains(&needle)
                    || node
                        .metadata
                        .get("parameters")
                        .is_some_and(|params| params.contains_text(&needle))
            })
            .take(limit)
            .map(|node| node.id.clone())
            .collect();
        Ok(ids.iter().filter_map(|id| view.node(id)).collect())
    }

    /// Functions outside `path` that call into any node defined in `path`.
    pub fn find_functions_calling_filepath(&self, path: &Path, limit: usize) -> Result<Vec<Node>, QueryError> {
        let limit = self.check_limit(limit)?;
        let view = self.store.view();
        let mut callers: BTreeMap<NodeId, Node> = BTreeMap::new();
        for id in view.file_node_ids(path) {
            for edge in view.edges(&id, Direction::Incoming) {
                if edge.edge_type != EdgeType::Calls || callers.contains_key(&edge.source_id) {
                    continue;
                }
                if let Some(node) = view.node(&edge.source_id) {
                    if node.node_type == NodeType::Function && node.file_path != path {
                        callers.insert(edge.source_id, node);
                    }
                }
            }
        }
        Ok(callers.into_values().take(limit).collect())
    }

    pub fn stats(&self) -> GraphStats {
        self.store.stats()
    }
}
