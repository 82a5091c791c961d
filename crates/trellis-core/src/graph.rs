//! Concurrent graph store over petgraph::StableDiGraph with id, file, name and keyword indices

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use fuzzy_matcher::FuzzyMatcher;
use fuzzy_matcher::skim::SkimMatcherV2;
use parking_lot::{RwLock, RwLockReadGuard};
use petgraph::Direction as Flow;
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::diff::*;
use crate::error::{GraphError, SnapshotError};
use crate::instrument::CallRecord;
use crate::keywords::KeywordIndex;
use crate::model::*;
use crate::query::{NodeFilter, Page};
use crate::snapshot::{FORMAT_VERSION, Snapshot};

/// Sentinel for "never observed" in the millisecond timestamp atomics.
const NEVER: i64 = i64::MIN;

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    if ms == NEVER {
        None
    } else {
        Utc.timestamp_millis_opt(ms).single()
    }
}

struct NodeSlot {
    node: Node,
    invocations: AtomicU64,
    last_invoked_ms: AtomicI64,
}

impl NodeSlot {
    fn new(node: Node) -> Self {
        NodeSlot {
            node,
            invocations: AtomicU64::new(0),
            last_invoked_ms: AtomicI64::new(NEVER),
        }
    }

    /// Copy of the node with runtime counters folded into its metadata.
    fn materialize(&self) -> Node {
        let mut node = self.node.clone();
        let invocations = self.invocations.load(Ordering::Acquire);
        if invocations > 0 {
            node.metadata
                .insert(INVOCATIONS_KEY.to_string(), MetaValue::Int(invocations as i64));
        }
        if let Some(at) = from_millis(self.last_invoked_ms.load(Ordering::Acquire)) {
            node.metadata
                .insert(LAST_INVOKED_KEY.to_string(), MetaValue::Text(at.to_rfc3339()));
        }
        node
    }

    /// Move counter values carried in metadata (snapshots, revived nodes) into the atomics.
    ///
    /// Only values `materialize` would write back are taken; anything else stays as plain metadata.
    fn absorb_counters(&self, metadata: &mut Metadata) {
        let count = metadata
            .get(INVOCATIONS_KEY)
            .and_then(MetaValue::as_int)
            .filter(|count| *count > 0);
        if let Some(count) = count {
            metadata.remove(INVOCATIONS_KEY);
            self.invocations.fetch_max(count as u64, Ordering::AcqRel);
        }
        let last = metadata
            .get(LAST_INVOKED_KEY)
            .and_then(MetaValue::as_text)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok());
        if let Some(at) = last {
            metadata.remove(LAST_INVOKED_KEY);
            self.last_invoked_ms
                .fetch_max(at.with_timezone(&Utc).timestamp_millis(), Ordering::AcqRel);
        }
    }
}

struct EdgeSlot {
    key: EdgeKey,
    dynamic: bool,
    corroborated: AtomicBool,
    call_count: AtomicU64,
    last_called_ms: AtomicI64,
    line: Option<u32>,
}

impl EdgeSlot {
    fn new(key: EdgeKey, edge: &Edge) -> Self {
        EdgeSlot {
            key,
            dynamic: edge.dynamic,
            corroborated: AtomicBool::new(edge.dynamic_corroborated && !edge.dynamic),
            call_count: AtomicU64::new(edge.call_count),
            last_called_ms: AtomicI64::new(edge.last_called_at.map_or(NEVER, |at| at.timestamp_millis())),
            line: edge.line,
        }
    }

    fn to_edge(&self) -> Edge {
        Edge {
            source_id: self.key.source_id.clone(),
            target_id: self.key.target_id.clone(),
            edge_type: self.key.edge_type,
            dynamic: self.dynamic,
            dynamic_corroborated: self.corroborated.load(Ordering::Acquire),
            call_count: self.call_count.load(Ordering::Acquire),
            last_called_at: from_millis(self.last_called_ms.load(Ordering::Acquire)),
            line: self.line,
        }
    }
}

/// Outcome of [`GraphStore::upsert_node`].
#[derive(Debug, Clone, PartialEq)]
pub enum NodeChange {
    Inserted { resolved: Vec<EdgeKey> },
    Updated { previous: Node, changed: bool, resolved: Vec<EdgeKey> },
}

/// Outcome of [`GraphStore::upsert_edge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeChange {
    Inserted(EdgeKey),
    Updated(EdgeKey),
    /// The target did not resolve; the edge waits for a matching node.
    Pending(EdgeKey),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    pub nodes: usize,
    pub edges: usize,
    pub pending_edges: usize,
    pub dynamic_edges: usize,
    pub synthetic_nodes: usize,
    pub files: usize,
}

#[derive(Default)]
struct GraphState {
    graph: StableDiGraph<NodeSlot, EdgeSlot>,
    ids: BTreeMap<NodeId, NodeIndex>,
    edges: HashMap<EdgeKey, EdgeIndex>,
    files: BTreeMap<PathBuf, BTreeSet<NodeId>>,
    qualified: HashMap<String, BTreeSet<NodeId>>,
    keywords: KeywordIndex,
    /// Unresolved edges with their counters; `target_id` holds the raw reference.
    pending: BTreeMap<EdgeKey, Edge>,
    pending_refs: HashMap<String, BTreeSet<EdgeKey>>,
}

impl GraphState {
    fn slot(&self, id: &NodeId) -> Option<&NodeSlot> {
        self.ids.get(id).and_then(|idx| self.graph.node_weight(*idx))
    }

    fn edge_slot(&self, key: &EdgeKey) -> Option<&EdgeSlot> {
        self.edges.get(key).and_then(|idx| self.graph.edge_weight(*idx))
    }

    /// Resolve a reference by id, then by qualified name, preferring real nodes over placeholders.
    fn resolve_ref(&self, reference: &str) -> Option<NodeId> {
        let id = NodeId::from(reference);
        if self.ids.contains_key(&id) {
            return Some(id);
        }
        let candidates = self.qualified.get(reference)?;
        candidates
            .iter()
            .find(|id| self.slot(id).is_some_and(|s| !s.node.is_synthetic()))
            .or_else(|| candidates.iter().next())
            .cloned()
    }

    fn index_node(&mut self, node: &Node) {
        if !node.file_path.as_os_str().is_empty() {
            self.files
                .entry(node.file_path.clone())
                .or_default()
                .insert(node.id.clone());
        }
        self.qualified
            .entry(node.qualified_name.clone())
            .or_default()
            .insert(node.id.clone());
        let path = node.file_path.to_string_lossy();
        self.keywords.insert(
            &node.id,
            [node.name.as_str(), node.qualified_name.as_str(), path.as_ref()],
        );
    }

    fn unindex_node(&mut self, node: &Node) {
        if let Some(ids) = self.files.get_mut(&node.file_path) {
            ids.remove(&node.id);
            if ids.is_empty() {
                self.files.remove(&node.file_path);
            }
        }
        if let Some(ids) = self.qualified.get_mut(&node.qualified_name) {
            ids.remove(&node.id);
            if ids.is_empty() {
                self.qualified.remove(&node.qualified_name);
            }
        }
        self.keywords.remove(&node.id);
    }

    fn insert_node(&mut self, mut node: Node) -> Result<NodeChange, GraphError> {
        if node.id.as_str().is_empty() {
            return Err(GraphError::EmptyId);
        }
        if node.start_line > node.end_line {
            return Err(GraphError::InvalidSpan {
                id: node.id,
                start: node.start_line,
                end: node.end_line,
            });
        }

        let Some(&idx) = self.ids.get(&node.id) else {
            let mut metadata = std::mem::take(&mut node.metadata);
            let mut slot = NodeSlot::new(node);
            slot.absorb_counters(&mut metadata);
            slot.node.metadata = metadata;
            let id = slot.node.id.clone();
            let indexed = slot.node.clone();
            let idx = self.graph.add_node(slot);
            self.ids.insert(id.clone(), idx);
            self.index_node(&indexed);
            let mut resolved = self.resolve_pending(id.as_str(), &id);
            resolved.extend(self.resolve_pending(&indexed.qualified_name, &id));
            return Ok(NodeChange::Inserted { resolved });
        };

        let Some(slot) = self.graph.node_weight(idx) else {
            return Err(GraphError::EmptyId);
        };
        slot.absorb_counters(&mut node.metadata);
        let previous = slot.node.clone();
        if node.is_synthetic() && !previous.is_synthetic() {
            return Ok(NodeChange::Updated { previous, changed: false, resolved: Vec::new() });
        }

        let incoming_synthetic = node.is_synthetic();
        let mut metadata = previous.metadata.clone();
        metadata.extend(std::mem::take(&mut node.metadata));
        if !incoming_synthetic {
            metadata.remove(SYNTHETIC_KEY);
        }
        node.metadata = metadata;

        let changed = previous != node;
        let mut resolved = Vec::new();
        if changed {
            self.unindex_node(&previous);
            self.index_node(&node);
            let qualified_name = node.qualified_name.clone();
            let id = node.id.clone();
            if let Some(slot) = self.graph.node_weight_mut(idx) {
                slot.node = node;
            }
            if previous.qualified_name != qualified_name {
                resolved = self.resolve_pending(&qualified_name, &id);
            }
        }
        Ok(NodeChange::Updated { previous, changed, resolved })
    }

    /// Park an unresolved edge. Re-parking an existing key merges evidence and counters.
    fn park(&mut self, edge: Edge) -> EdgeKey {
        let key = edge.key();
        self.pending_refs
            .entry(key.target_id.0.clone())
            .or_default()
            .insert(key.clone());
        match self.pending.get_mut(&key) {
            Some(parked) => {
                if edge.dynamic != parked.dynamic {
                    parked.dynamic = false;
                    parked.dynamic_corroborated = true;
                }
                if edge.dynamic_corroborated && !parked.dynamic {
                    parked.dynamic_corroborated = true;
                }
                parked.call_count += edge.call_count;
                parked.last_called_at = parked.last_called_at.max(edge.last_called_at);
                if edge.line.is_some() {
                    parked.line = edge.line;
                }
            }
            None => {
                self.pending.insert(key.clone(), edge);
            }
        }
        key
    }

    /// Withdraw static evidence for a pending edge. Edges with runtime calls stay parked as dynamic-only.
    fn retract_pending(&mut self, key: &EdgeKey) -> bool {
        let Some(edge) = self.pending.get_mut(key) else {
            return false;
        };
        if edge.call_count == 0 {
            return self.unpark(key);
        }
        edge.dynamic = true;
        edge.dynamic_corroborated = false;
        edge.line = None;
        false
    }

    fn unpark(&mut self, key: &EdgeKey) -> bool {
        if let Some(keys) = self.pending_refs.get_mut(key.target_id.as_str()) {
            keys.remove(key);
            if keys.is_empty() {
                self.pending_refs.remove(key.target_id.as_str());
            }
        }
        self.pending.remove(key).is_some()
    }

    fn pending_from(&self, source: &NodeId) -> Vec<EdgeKey> {
        self.pending_edges_from(source).map(|edge| edge.key()).collect()
    }

    fn pending_edges_from<'a>(&'a self, source: &'a NodeId) -> impl Iterator<Item = &'a Edge> + 'a {
        let start = EdgeKey::new(source.clone(), NodeId::default(), EdgeType::Calls);
        self.pending
            .range(start..)
            .take_while(move |(key, _)| &key.source_id == source)
            .map(|(_, edge)| edge)
    }

    /// Static pending edges of `source`, the ones a reparse of its file replaces.
    fn static_pending_from(&self, source: &NodeId) -> Vec<EdgeKey> {
        self.pending_edges_from(source)
            .filter(|edge| !edge.dynamic)
            .map(Edge::key)
            .collect()
    }

    fn resolve_pending(&mut self, reference: &str, target: &NodeId) -> Vec<EdgeKey> {
        let Some(keys) = self.pending_refs.remove(reference) else {
            return Vec::new();
        };
        let mut resolved = Vec::new();
        for pending in keys {
            let Some(mut edge) = self.pending.remove(&pending) else {
                continue;
            };
            edge.target_id = target.clone();
            if let Ok(EdgeChange::Inserted(key)) = self.insert_edge(edge) {
                debug!("Resolved pending edge {}", key);
                resolved.push(key);
            }
        }
        resolved
    }

    fn insert_edge(&mut self, edge: Edge) -> Result<EdgeChange, GraphError> {
        let Some(&source_idx) = self.ids.get(&edge.source_id) else {
            return Err(GraphError::UnknownSource(edge.source_id));
        };
        let Some(target_id) = self.resolve_ref(edge.target_id.as_str()) else {
            return Ok(EdgeChange::Pending(self.park(edge)));
        };
        let Some(&target_idx) = self.ids.get(&target_id) else {
            return Err(GraphError::UnknownSource(target_id));
        };
        let key = EdgeKey::new(edge.source_id.clone(), target_id, edge.edge_type);

        if let Some(slot) = self.edges.get(&key).and_then(|idx| self.graph.edge_weight_mut(*idx)) {
            if edge.dynamic {
                if !slot.dynamic {
                    slot.corroborated.store(true, Ordering::Release);
                }
            } else if slot.dynamic {
                slot.dynamic = false;
                slot.corroborated.store(true, Ordering::Release);
            }
            if edge.dynamic_corroborated && !slot.dynamic {
                slot.corroborated.store(true, Ordering::Release);
            }
            slot.call_count.fetch_add(edge.call_count, Ordering::AcqRel);
            if let Some(at) = edge.last_called_at {
                slot.last_called_ms.fetch_max(at.timestamp_millis(), Ordering::AcqRel);
            }
            if edge.line.is_some() {
                slot.line = edge.line;
            }
            return Ok(EdgeChange::Updated(key));
        }

        let idx = self.graph.add_edge(source_idx, target_idx, EdgeSlot::new(key.clone(), &edge));
        self.edges.insert(key.clone(), idx);
        Ok(EdgeChange::Inserted(key))
    }

    fn remove_edge(&mut self, key: &EdgeKey) -> Option<Edge> {
        let idx = self.edges.remove(key)?;
        self.graph.remove_edge(idx).map(|slot| slot.to_edge())
    }

    fn outgoing_static(&self, id: &NodeId) -> Vec<EdgeKey> {
        let Some(&idx) = self.ids.get(id) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(idx, Flow::Outgoing)
            .filter(|e| !e.weight().dynamic)
            .map(|e| e.weight().key.clone())
            .collect()
    }

    /// Withdraw static evidence for an edge. Edges with runtime calls survive as dynamic-only.
    fn retract_static(&mut self, key: &EdgeKey) -> bool {
        let Some(slot) = self.edges.get(key).and_then(|idx| self.graph.edge_weight_mut(*idx)) else {
            return false;
        };
        if slot.call_count.load(Ordering::Acquire) > 0 {
            slot.dynamic = true;
            slot.corroborated.store(false, Ordering::Release);
            slot.line = None;
            return false;
        }
        self.remove_edge(key).is_some()
    }

    /// Delete a node and its incident edges.
    ///
    /// With `park_incoming`, static edges arriving from other files are kept
    /// as pending edges on the node's qualified name so a later definition
    /// picks them up again.
    fn remove_node(&mut self, id: &NodeId, park_incoming: bool) -> Option<(RemovedNode, Vec<EdgeKey>)> {
        let idx = *self.ids.get(id)?;
        let incoming: Vec<Edge> = self
            .graph
            .edges_directed(idx, Flow::Incoming)
            .map(|e| e.weight().to_edge())
            .collect();
        let mut removed_keys: BTreeSet<EdgeKey> = self
            .graph
            .edges_directed(idx, Flow::Outgoing)
            .map(|e| e.weight().key.clone())
            .collect();
        removed_keys.extend(incoming.iter().map(Edge::key));
        for key in &removed_keys {
            self.edges.remove(key);
        }
        for key in self.pending_from(id) {
            self.unpark(&key);
        }

        let slot = self.graph.remove_node(idx)?;
        self.ids.remove(id);
        self.unindex_node(&slot.node);
        let node = slot.materialize();

        let mut parked = Vec::new();
        if park_incoming {
            for edge in incoming.iter().filter(|e| !e.dynamic && &e.source_id != id) {
                let other_file = self
                    .slot(&edge.source_id)
                    .is_some_and(|s| s.node.file_path != node.file_path);
                if other_file {
                    let mut edge = edge.clone();
                    edge.target_id = NodeId(node.qualified_name.clone());
                    parked.push(self.park(edge));
                }
            }
        }

        Some((RemovedNode { node, incoming, parked }, removed_keys.into_iter().collect()))
    }

    fn remove_edges_for_file(&mut self, path: &Path) -> Vec<EdgeKey> {
        let ids = self.files.get(path).cloned().unwrap_or_default();
        let mut removed = Vec::new();
        for id in &ids {
            for key in self.outgoing_static(id) {
                if self.retract_static(&key) {
                    removed.push(key);
                }
            }
            for key in self.static_pending_from(id) {
                if self.retract_pending(&key) {
                    removed.push(key);
                }
            }
        }
        removed
    }

    fn apply_batch(&mut self, batch: FileBatch) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let removing: HashSet<&NodeId> = batch.removals.iter().collect();

        // Fresh ids already owned by another file get the file appended.
        let mut remap: HashMap<(PathBuf, NodeId), NodeId> = HashMap::new();
        let mut claimed: HashMap<NodeId, PathBuf> = HashMap::new();
        for staged in batch.nodes.iter().filter(|s| s.origin == NodeOrigin::Fresh) {
            let node = &staged.node;
            let owner = match claimed.get(&node.id) {
                Some(path) => Some(path.clone()),
                None => self
                    .slot(&node.id)
                    .filter(|s| !s.node.is_synthetic() && !removing.contains(&node.id))
                    .map(|s| s.node.file_path.clone()),
            };
            match owner {
                Some(path) if path != node.file_path => {
                    let id = NodeId::disambiguated(&node.node_type, &node.qualified_name, &node.file_path);
                    debug!("Id {} already owned by {}, using {}", node.id, path.display(), id);
                    remap.insert((node.file_path.clone(), node.id.clone()), id);
                }
                _ => {
                    claimed.insert(node.id.clone(), node.file_path.clone());
                }
            }
        }
        drop(removing);

        for id in &batch.removals {
            if let Some((removed, keys)) = self.remove_node(id, true) {
                outcome.diff.removed_nodes.push(id.clone());
                outcome.diff.removed_edges.extend(keys);
                outcome.removed.push(removed);
            }
        }
        for key in &batch.released {
            self.unpark(key);
        }

        for staged in batch.nodes {
            let mut node = staged.node;
            if let Some(id) = remap.get(&(node.file_path.clone(), node.id.clone())) {
                node.id = id.clone();
            }
            let id = node.id.clone();
            let to = node.file_path.clone();
            match self.insert_node(node) {
                Ok(NodeChange::Inserted { resolved }) => {
                    outcome.diff.added_edges.extend(resolved);
                    if let NodeOrigin::Revived { from } = staged.origin {
                        if from != to {
                            outcome.diff.moved_nodes.push(NodeMove { id: id.clone(), from, to });
                        }
                    }
                    if let Some(slot) = self.slot(&id) {
                        outcome.diff.added_nodes.push(slot.materialize());
                    }
                }
                Ok(NodeChange::Updated { previous, changed, resolved }) => {
                    outcome.diff.added_edges.extend(resolved);
                    if previous.is_synthetic() && changed {
                        if let Some(slot) = self.slot(&id) {
                            outcome.diff.added_nodes.push(slot.materialize());
                        }
                    } else if previous.file_path != to {
                        outcome.diff.moved_nodes.push(NodeMove { id, from: previous.file_path, to });
                    } else if changed {
                        outcome.diff.modified_nodes.push(id);
                    }
                }
                Err(err) => warn!("Skipping invalid node: {}", err),
            }
        }

        for key in &batch.retracted {
            if self.retract_static(key) {
                outcome.diff.removed_edges.push(key.clone());
            }
            self.retract_pending(key);
        }

        // Targets that no longer resolve are parked like any other reference.
        for edge in batch.restored_edges {
            if !self.ids.contains_key(&edge.source_id) {
                continue;
            }
            match self.insert_edge(edge) {
                Ok(EdgeChange::Inserted(key)) => outcome.diff.added_edges.push(key),
                Ok(EdgeChange::Pending(key)) => outcome.pending.push(key),
                _ => {}
            }
        }

        let sources: BTreeSet<NodeId> = batch
            .paths
            .iter()
            .filter_map(|path| self.files.get(path))
            .flatten()
            .cloned()
            .collect();
        let mut stale_static: BTreeSet<EdgeKey> =
            sources.iter().flat_map(|id| self.outgoing_static(id)).collect();
        let mut stale_pending: BTreeSet<EdgeKey> =
            sources.iter().flat_map(|id| self.static_pending_from(id)).collect();

        for staged in batch.edges {
            let source_id = remap
                .get(&(staged.origin_file.clone(), staged.source_id.clone()))
                .cloned()
                .unwrap_or(staged.source_id);
            let target_ref = remap
                .get(&(staged.origin_file.clone(), NodeId(staged.target_ref.clone())))
                .map(|id| id.0.clone())
                .unwrap_or(staged.target_ref);
            let mut edge = Edge::new(source_id, target_ref, staged.edge_type);
            edge.line = staged.line;
            match self.insert_edge(edge) {
                Ok(EdgeChange::Inserted(key)) => outcome.diff.added_edges.push(key),
                Ok(EdgeChange::Updated(key)) => {
                    stale_static.remove(&key);
                }
                Ok(EdgeChange::Pending(key)) => {
                    stale_pending.remove(&key);
                    outcome.pending.push(key);
                }
                Err(err) => debug!("Dropping staged edge: {}", err),
            }
        }

        for key in stale_static {
            if self.retract_static(&key) {
                outcome.diff.removed_edges.push(key);
            }
        }
        for key in stale_pending {
            self.retract_pending(&key);
        }

        outcome
    }

    fn incident_edges(&self, id: &NodeId, direction: Direction) -> Vec<Edge> {
        let Some(&idx) = self.ids.get(id) else {
            return Vec::new();
        };
        let flows: &[Flow] = match direction {
            Direction::Incoming => &[Flow::Incoming],
            Direction::Outgoing => &[Flow::Outgoing],
            Direction::Both => &[Flow::Outgoing, Flow::Incoming],
        };
        let edges: BTreeMap<EdgeKey, Edge> = flows
            .iter()
            .flat_map(|flow| self.graph.edges_directed(idx, *flow))
            .map(|e| (e.weight().key.clone(), e.weight().to_edge()))
            .collect();
        edges.into_values().collect()
    }

    fn export(&self) -> Snapshot {
        let nodes = self
            .ids
            .values()
            .filter_map(|idx| self.graph.node_weight(*idx))
            .map(NodeSlot::materialize)
            .collect();
        let mut edges: Vec<Edge> = self
            .edges
            .values()
            .filter_map(|idx| self.graph.edge_weight(*idx))
            .map(EdgeSlot::to_edge)
            .collect();
        edges.extend(self.pending.values().cloned());
        edges.sort_by_key(Edge::key);
        Snapshot {
            format_version: FORMAT_VERSION,
            exported_at: Some(Utc::now()),
            nodes,
            edges,
        }
    }

    fn from_snapshot(mut snapshot: Snapshot) -> Result<Self, SnapshotError> {
        snapshot.upgrade()?;
        let mut state = GraphState::default();
        for node in snapshot.nodes {
            if state.ids.contains_key(&node.id) {
                return Err(SnapshotError::DuplicateNode(node.id));
            }
            state.insert_node(node)?;
        }
        for edge in snapshot.edges {
            if !state.ids.contains_key(&edge.source_id) {
                return Err(SnapshotError::DanglingSource {
                    source_id: edge.source_id,
                    target_id: edge.target_id,
                });
            }
            state.insert_edge(edge)?;
        }
        Ok(state)
    }

    /// Increment counters for an existing call edge without structural change.
    fn bump_call(&self, key: &EdgeKey, at_ms: i64) -> Option<CallRecord> {
        let slot = self.edge_slot(key)?;
        let call_count = slot.call_count.fetch_add(1, Ordering::AcqRel) + 1;
        slot.last_called_ms.fetch_max(at_ms, Ordering::AcqRel);
        if !slot.dynamic {
            slot.corroborated.store(true, Ordering::Release);
        }
        if let Some(callee) = self.slot(&key.target_id) {
            callee.invocations.fetch_add(1, Ordering::AcqRel);
            callee.last_invoked_ms.fetch_max(at_ms, Ordering::AcqRel);
        }
        Some(CallRecord {
            caller: key.source_id.clone(),
            callee: key.target_id.clone(),
            call_count,
            dynamic: slot.dynamic,
        })
    }

    fn resolve_or_placeholder(&mut self, reference: &str) -> NodeId {
        if let Some(id) = self.resolve_ref(reference) {
            return id;
        }
        let placeholder = Node::synthetic(reference);
        let id = placeholder.id.clone();
        if !self.ids.contains_key(&id) {
            debug!("Creating placeholder node {} for runtime reference", id);
            if let Err(err) = self.insert_node(placeholder) {
                warn!("Failed to create placeholder {}: {}", id, err);
            }
        }
        id
    }

    fn stats(&self) -> GraphStats {
        GraphStats {
            nodes: self.ids.len(),
            edges: self.edges.len(),
            pending_edges: self.pending.len(),
            dynamic_edges: self
                .edges
                .values()
                .filter_map(|idx| self.graph.edge_weight(*idx))
                .filter(|slot| slot.dynamic)
                .count(),
            synthetic_nodes: self
                .ids
                .values()
                .filter_map(|idx| self.graph.node_weight(*idx))
                .filter(|slot| slot.node.is_synthetic())
                .count(),
            files: self.files.len(),
        }
    }
}

/// The in-memory dependency graph.
///
/// All state sits behind one `RwLock`. Structural mutations take the write
/// lock only to apply already computed changes; runtime call counters are
/// atomics bumped under the read lock.
pub struct GraphStore {
    state: RwLock<GraphState>,
    sequence: AtomicU64,
}

impl std::fmt::Debug for GraphStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("GraphStore")
            .field("node_count", &stats.nodes)
            .field("edge_count", &stats.edges)
            .field("sequence", &self.sequence())
            .finish()
    }
}

impl GraphStore {
    pub fn new() -> Self {
        GraphStore {
            state: RwLock::new(GraphState::default()),
            sequence: AtomicU64::new(0),
        }
    }

    /// A consistent read-only view. Writers wait while it is alive.
    pub fn view(&self) -> GraphView<'_> {
        GraphView { state: self.state.read() }
    }

    /// Insert or replace a node by id. Existing metadata keys missing from `node` are kept.
    pub fn upsert_node(&self, node: Node) -> Result<NodeChange, GraphError> {
        self.state.write().insert_node(node)
    }

    /// Delete a node and every incident edge. No-op if absent.
    pub fn remove_node(&self, id: &NodeId) -> Option<Node> {
        self.state
            .write()
            .remove_node(id, false)
            .map(|(removed, _)| removed.node)
    }

    pub fn upsert_edge(&self, edge: Edge) -> Result<EdgeChange, GraphError> {
        self.state.write().insert_edge(edge)
    }

    /// Drop the static edges sourced in `path`, returning how many disappeared.
    pub fn remove_edges_for_file(&self, path: &Path) -> usize {
        self.state.write().remove_edges_for_file(path).len()
    }

    pub fn get_node(&self, id: &NodeId) -> Option<Node> {
        self.view().node(id)
    }

    pub fn list_nodes(&self, filter: &NodeFilter, limit: usize, offset: usize) -> Page<Node> {
        self.view().list_nodes(filter, limit, offset)
    }

    pub fn search_nodes(&self, keyword: &str, limit: usize) -> Vec<Node> {
        self.view().search(keyword, limit)
    }

    pub fn list_edges(&self, id: &NodeId, direction: Direction, limit: usize, offset: usize) -> Page<Edge> {
        self.view().list_edges(id, direction, limit, offset)
    }

    pub fn export_snapshot(&self) -> Snapshot {
        self.state.read().export()
    }

    /// Replace the whole graph. The new state is built before the lock is taken.
    pub fn load_snapshot(&self, snapshot: Snapshot) -> Result<(), SnapshotError> {
        let state = GraphState::from_snapshot(snapshot)?;
        let stats = state.stats();
        *self.state.write() = state;
        self.sequence.fetch_add(1, Ordering::AcqRel);
        info!("Loaded snapshot with {} nodes, {} edges", stats.nodes, stats.edges);
        Ok(())
    }

    /// Apply a file batch atomically and stamp the resulting diff.
    pub fn apply_file_batch(&self, batch: FileBatch) -> BatchOutcome {
        let mut state = self.state.write();
        let mut outcome = state.apply_batch(batch);
        outcome.diff.sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        outcome
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> GraphStats {
        self.state.read().stats()
    }

    pub(crate) fn observe_call(&self, caller: &str, callee: &str, at_ms: i64) -> CallRecord {
        {
            let state = self.state.read();
            if let (Some(caller), Some(callee)) = (state.resolve_ref(caller), state.resolve_ref(callee)) {
                let key = EdgeKey::new(caller, callee, EdgeType::Calls);
                if let Some(record) = state.bump_call(&key, at_ms) {
                    return record;
                }
            }
        }

        let mut state = self.state.write();
        let caller = state.resolve_or_placeholder(caller);
        let callee = state.resolve_or_placeholder(callee);
        let key = EdgeKey::new(caller.clone(), callee.clone(), EdgeType::Calls);
        if state.edge_slot(&key).is_none() {
            if let Err(err) = state.insert_edge(Edge::observed_call(caller.clone(), callee.clone())) {
                warn!("Failed to record observed call {}: {}", key, err);
            }
        }
        state.bump_call(&key, at_ms).unwrap_or(CallRecord {
            caller,
            callee,
            call_count: 0,
            dynamic: true,
        })
    }
}

impl Default for GraphStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Read guard over the store exposing consistent multi-step reads.
pub struct GraphView<'a> {
    state: RwLockReadGuard<'a, GraphState>,
}

impl GraphView<'_> {
    pub fn node(&self, id: &NodeId) -> Option<Node> {
        self.state.slot(id).map(NodeSlot::materialize)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.state.ids.contains_key(id)
    }

    pub fn resolve(&self, reference: &str) -> Option<NodeId> {
        self.state.resolve_ref(reference)
    }

    /// Stored nodes in id order, without runtime counters.
    pub fn iter_nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.state
            .ids
            .values()
            .filter_map(|idx| self.state.graph.node_weight(*idx))
            .map(|slot| &slot.node)
    }

    pub fn list_nodes(&self, filter: &NodeFilter, limit: usize, offset: usize) -> Page<Node> {
        let matching: Vec<&NodeId> = match &filter.file_path {
            Some(path) => self
                .state
                .files
                .get(path)
                .map(|ids| ids.iter().collect())
                .unwrap_or_default(),
            None => self.state.ids.keys().collect(),
        };
        let matching: Vec<&NodeSlot> = matching
            .into_iter()
            .filter_map(|id| self.state.slot(id))
            .filter(|slot| filter.matches(&slot.node))
            .collect();
        let total = matching.len();
        let items = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(NodeSlot::materialize)
            .collect();
        Page::new(items, total, offset)
    }

    /// Keyword search ranked by fuzzy score, ties broken by id.
    pub fn search(&self, keyword: &str, limit: usize) -> Vec<Node> {
        let matcher = SkimMatcherV2::default();
        let mut scored: Vec<(i64, &NodeSlot)> = self
            .state
            .keywords
            .lookup(keyword)
            .iter()
            .filter_map(|id| self.state.slot(id))
            .map(|slot| {
                let score = [slot.node.name.as_str(), slot.node.qualified_name.as_str()]
                    .iter()
                    .filter_map(|text| matcher.fuzzy_match(text, keyword))
                    .max()
                    .unwrap_or(0);
                (score, slot)
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.node.id.cmp(&b.1.node.id)));
        scored
            .into_iter()
            .take(limit)
            .map(|(_, slot)| slot.materialize())
            .collect()
    }

    /// Incident edges of a node ordered by edge key.
    pub fn edges(&self, id: &NodeId, direction: Direction) -> Vec<Edge> {
        self.state.incident_edges(id, direction)
    }

    pub fn list_edges(&self, id: &NodeId, direction: Direction, limit: usize, offset: usize) -> Page<Edge> {
        let edges = self.edges(id, direction);
        let total = edges.len();
        Page::new(edges.into_iter().skip(offset).take(limit).collect(), total, offset)
    }

    pub fn file_node_ids(&self, path: &Path) -> Vec<NodeId> {
        self.state
            .files
            .get(path)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn file_nodes(&self, path: &Path) -> Vec<Node> {
        self.file_node_ids(path)
            .iter()
            .filter_map(|id| self.node(id))
            .collect()
    }

    /// Outgoing static and pending edges of every node in `path`.
    pub fn file_edges(&self, path: &Path) -> Vec<Edge> {
        let mut edges = Vec::new();
        for id in self.file_node_ids(path) {
            edges.extend(
                self.state
                    .outgoing_static(&id)
                    .iter()
                    .filter_map(|key| self.state.edge_slot(key))
                    .map(EdgeSlot::to_edge),
            );
            edges.extend(self.state.pending_edges_from(&id).filter(|edge| !edge.dynamic).cloned());
        }
        edges.sort_by_key(Edge::key);
        edges
    }

    pub fn files(&self) -> Vec<PathBuf> {
        self.state.files.keys().cloned().collect()
    }

    pub fn qualified(&self, qualified_name: &str) -> Vec<NodeId> {
        self.state
            .qualified
            .get(qualified_name)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Unresolved edges with their raw target references.
    pub fn pending_edges(&self) -> Vec<Edge> {
        self.state.pending.values().cloned().collect()
    }

    pub fn stats(&self) -> GraphStats {
        self.state.stats()
    }
}
