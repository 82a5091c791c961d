//! Incremental update coordination
//!
//! Turns file change notifications into [`FileBatch`]es for the graph store:
//! extraction runs in parallel outside every lock, per-path version tickets
//! drop results that were overtaken by a newer change, and rename detection
//! carries node identity across edits, moves and short delete/create gaps.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use trellis_core::{
    Direction, Edge, EdgeKey, FileBatch, GraphDiff, GraphStore, GraphView, MetaValue, Node, NodeId, NodeMove,
    NodeOrigin, NodeType, RemovedNode, StagedEdge, StagedNode, TrellisConfig,
};

use crate::extractor::{ExtractionError, ExtractionResult};
use crate::languages::ExtractorRegistry;
use crate::rename::{Candidate, RenameDetector, SimilarityScorer, span_text};
use crate::secrets::{MaskedSource, SecretMasker};

/// Metadata flag set on nodes whose span contained a masked secret.
pub const SECRET_KEY: &str = "has_secret";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// A single file event. Without `content` the file is read from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub content: Option<String>,
}

impl FileChange {
    pub fn created(path: impl Into<PathBuf>) -> Self {
        Self::new(path, ChangeKind::Created)
    }

    pub fn modified(path: impl Into<PathBuf>) -> Self {
        Self::new(path, ChangeKind::Modified)
    }

    pub fn deleted(path: impl Into<PathBuf>) -> Self {
        Self::new(path, ChangeKind::Deleted)
    }

    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        FileChange {
            path: path.into(),
            kind,
            content: None,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }
}

/// Lifecycle of a path as seen by the coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathStatus {
    #[default]
    Unknown,
    Tracked,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedPath {
    pub path: PathBuf,
    pub error: String,
}

/// What one call to [`UpdateCoordinator::apply`] did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpdateReport {
    pub diff: GraphDiff,
    pub applied: Vec<PathBuf>,
    /// Paths no extractor handles.
    pub skipped: Vec<PathBuf>,
    /// Paths whose extraction failed; their previous subgraph is untouched.
    pub failed: Vec<FailedPath>,
    /// Paths whose result was discarded because a newer change was already applied.
    pub stale: Vec<PathBuf>,
    /// Edges from this batch left pending on unresolved targets.
    pub unresolved: Vec<EdgeKey>,
}

impl UpdateReport {
    /// True when every path in the call was superseded.
    pub fn is_stale(&self) -> bool {
        !self.stale.is_empty() && self.applied.is_empty() && self.failed.is_empty()
    }

    pub fn renamed(&self) -> &[NodeMove] {
        &self.diff.moved_nodes
    }
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("extraction failed for {path}: {source}")]
    Extraction {
        path: PathBuf,
        #[source]
        source: ExtractionError,
    },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl UpdateError {
    pub fn path(&self) -> &Path {
        match self {
            UpdateError::Extraction { path, .. } | UpdateError::Io { path, .. } => path,
        }
    }
}

#[derive(Default)]
struct PathSlot {
    issued: AtomicU64,
    state: Mutex<PathState>,
}

#[derive(Default)]
struct PathState {
    /// Highest ticket applied to the graph.
    applied: u64,
    status: PathStatus,
    /// Masked text of the last applied version, used for rename bodies.
    content: Option<Arc<str>>,
}

/// A node removed recently enough to be revived by a later creation.
struct Tombstone {
    node: Node,
    body: String,
    incoming: Vec<Edge>,
    parked: Vec<EdgeKey>,
    removed_at: Instant,
}

/// A node created recently enough to take over the identity of a later removal.
struct Nascent {
    node: Node,
    body: String,
    /// Ticket of the file version that created it.
    ticket: u64,
    created_at: Instant,
}

/// Window entries one run may correlate against.
///
/// Entries are shared snapshots; a run claims one only after scoring, so
/// the window locks are never held while bodies are compared. Each nascent
/// entry comes with its file's state lock, which keeps that file from
/// changing until the batch is applied.
struct Recent<'a> {
    tombstones: Vec<Arc<Tombstone>>,
    nascent: Vec<(Arc<Nascent>, MutexGuard<'a, PathState>)>,
}

struct Plan {
    batch: FileBatch,
    /// Bodies of nodes about to be removed, kept as tombstones once applied.
    removal_bodies: HashMap<NodeId, String>,
    /// Nodes staged as fresh, with their bodies and file tickets.
    fresh: Vec<(Node, String, u64)>,
}

enum Extracted {
    Parsed { masked: MaskedSource, result: ExtractionResult },
    Removed,
}

struct Prepared {
    path: PathBuf,
    slot: Arc<PathSlot>,
    ticket: u64,
    extracted: Extracted,
}

/// A new node waiting for rename correlation.
struct Creation {
    item: usize,
    node: Node,
    body: String,
}

/// An existing node about to disappear unless correlated.
struct Removal {
    node: Node,
    body: String,
}

pub struct UpdateCoordinator {
    store: Arc<GraphStore>,
    registry: ExtractorRegistry,
    detector: RenameDetector,
    masker: Option<SecretMasker>,
    root: PathBuf,
    slots: DashMap<PathBuf, Arc<PathSlot>>,
    tombstones: Mutex<VecDeque<Arc<Tombstone>>>,
    nascent: Mutex<VecDeque<Arc<Nascent>>>,
    window: Duration,
    window_capacity: usize,
}

impl UpdateCoordinator {
    pub fn new(
        store: Arc<GraphStore>,
        registry: ExtractorRegistry,
        config: &TrellisConfig,
        root: impl Into<PathBuf>,
    ) -> Self {
        UpdateCoordinator {
            store,
            registry,
            detector: RenameDetector::new(&config.rename),
            masker: config.secrets.mask.then(SecretMasker::new),
            root: root.into(),
            slots: DashMap::new(),
            tombstones: Mutex::new(VecDeque::new()),
            nascent: Mutex::new(VecDeque::new()),
            window: Duration::from_millis(config.rename.window_ms),
            window_capacity: config.rename.window_capacity,
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn SimilarityScorer>) -> Self {
        self.detector = self.detector.with_scorer(scorer);
        self
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    pub fn registry(&self) -> &ExtractorRegistry {
        &self.registry
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_status(&self, path: &Path) -> PathStatus {
        let path = self.relative(path);
        self.slot(&path)
            .map(|slot| slot.state.lock().status)
            .unwrap_or_default()
    }

    /// The slot for `path`, released from the map before any state lock is taken.
    fn slot(&self, path: &Path) -> Option<Arc<PathSlot>> {
        self.slots.get(path).map(|slot| Arc::clone(&slot))
    }

    /// Number of removed nodes still available for revival.
    pub fn tombstone_count(&self) -> usize {
        let mut tombstones = self.tombstones.lock();
        expire(&mut tombstones, self.window, |t| t.removed_at);
        tombstones.len()
    }

    /// Repository-relative form of `path` with `.` segments removed.
    pub fn relative(&self, path: &Path) -> PathBuf {
        let path = path.strip_prefix(&self.root).unwrap_or(path);
        path.components()
            .filter(|c| !matches!(c, Component::CurDir))
            .collect()
    }

    /// Apply a single change, surfacing extraction failures as errors.
    pub fn update_file(&self, change: FileChange) -> Result<UpdateReport, UpdateError> {
        let (report, mut errors) = self.run(vec![change]);
        match errors.pop() {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Apply a batch of changes atomically; failures are reported per path.
    pub fn apply(&self, changes: Vec<FileChange>) -> UpdateReport {
        self.run(changes).0
    }

    fn run(&self, changes: Vec<FileChange>) -> (UpdateReport, Vec<UpdateError>) {
        let mut report = UpdateReport::default();
        let mut errors = Vec::new();

        let mut latest: BTreeMap<PathBuf, FileChange> = BTreeMap::new();
        for mut change in changes {
            change.path = self.relative(&change.path);
            latest.insert(change.path.clone(), change);
        }

        let mut tickets = Vec::with_capacity(latest.len());
        for (path, change) in latest {
            let tracked = !self.store.view().file_node_ids(&path).is_empty();
            if change.kind == ChangeKind::Deleted && !tracked && !self.is_live(&path) {
                debug!("Ignoring delete of untracked {}", path.display());
                report.skipped.push(path);
                continue;
            }
            if !self.registry.supports(&path) && change.kind != ChangeKind::Deleted {
                report.skipped.push(path);
                continue;
            }
            let slot = Arc::clone(&self.slots.entry(path).or_default());
            let ticket = slot.issued.fetch_add(1, Ordering::AcqRel) + 1;
            tickets.push((change, slot, ticket));
        }

        let prepared: Vec<Result<Prepared, UpdateError>> = tickets
            .into_par_iter()
            .map(|(change, slot, ticket)| self.prepare(change, slot, ticket))
            .collect();

        let mut ready = Vec::new();
        for result in prepared {
            match result {
                Ok(p) => ready.push(p),
                Err(err) => {
                    error!("{}", err);
                    report.failed.push(FailedPath {
                        path: err.path().to_path_buf(),
                        error: err.to_string(),
                    });
                    errors.push(err);
                }
            }
        }

        // Locks are taken in path order; `ready` is already sorted.
        let slots: Vec<Arc<PathSlot>> = ready.iter().map(|p| Arc::clone(&p.slot)).collect();
        let guards: Vec<MutexGuard<'_, PathState>> = slots.iter().map(|s| s.state.lock()).collect();
        let mut work = Vec::new();
        for (prep, guard) in ready.into_iter().zip(guards) {
            if guard.applied > prep.ticket {
                debug!("Discarding stale result for {}", prep.path.display());
                report.stale.push(prep.path);
            } else {
                work.push((prep, guard));
            }
        }
        if work.is_empty() {
            return (report, errors);
        }

        let nascent = self.nascent_candidates(&work);
        let recent = Recent {
            tombstones: self.tombstone_candidates(),
            nascent: nascent
                .iter()
                .filter_map(|(entry, slot)| {
                    // Never wait here: state locks are otherwise taken in path order.
                    let guard = slot.state.try_lock()?;
                    (guard.applied == entry.ticket).then(|| (Arc::clone(entry), guard))
                })
                .collect(),
        };
        let plan = self.plan(&work, &recent);

        let outcome = self.store.apply_file_batch(plan.batch);
        drop(recent);
        for moved in &outcome.diff.moved_nodes {
            info!("Node {} moved from {} to {}", moved.id, moved.from.display(), moved.to.display());
        }
        self.remember(&outcome.diff.added_nodes, outcome.removed, plan.removal_bodies, plan.fresh);

        for (prep, mut guard) in work {
            guard.applied = prep.ticket;
            match prep.extracted {
                Extracted::Parsed { masked, .. } => {
                    guard.status = PathStatus::Tracked;
                    guard.content = Some(Arc::from(masked.text));
                }
                Extracted::Removed => {
                    guard.status = PathStatus::Removed;
                    guard.content = None;
                }
            }
            report.applied.push(prep.path);
        }

        if !outcome.pending.is_empty() {
            debug!("{} references left unresolved", outcome.pending.len());
        }
        report.unresolved = outcome.pending;
        report.diff = outcome.diff;
        (report, errors)
    }

    /// Read, mask and extract one file. Runs without holding any lock.
    fn prepare(&self, change: FileChange, slot: Arc<PathSlot>, ticket: u64) -> Result<Prepared, UpdateError> {
        let path = change.path;
        let extracted = match change.kind {
            ChangeKind::Deleted => Extracted::Removed,
            ChangeKind::Created | ChangeKind::Modified => match self.registry.for_path(&path) {
                None => Extracted::Removed,
                Some(extractor) => {
                    let content = match change.content {
                        Some(content) => Some(content),
                        None => self.read(&path)?,
                    };
                    match content {
                        None => Extracted::Removed,
                        Some(content) => {
                            let masked = match &self.masker {
                                Some(masker) => masker.mask(&content),
                                None => MaskedSource::unmasked(content),
                            };
                            for finding in &masked.findings {
                                debug!(
                                    "Masked {} in {} at lines {}-{}",
                                    finding.kind,
                                    path.display(),
                                    finding.start_line,
                                    finding.end_line
                                );
                            }
                            let result = extractor
                                .extract(&path, &masked.text)
                                .map_err(|source| UpdateError::Extraction {
                                    path: path.clone(),
                                    source,
                                })?;
                            Extracted::Parsed { masked, result }
                        }
                    }
                }
            },
        };
        Ok(Prepared {
            path,
            slot,
            ticket,
            extracted,
        })
    }

    /// File text, or `None` if it no longer exists.
    fn read(&self, path: &Path) -> Result<Option<String>, UpdateError> {
        match std::fs::read(self.root.join(path)) {
            Ok(bytes) => String::from_utf8(bytes).map(Some).map_err(|_| UpdateError::Extraction {
                path: path.to_path_buf(),
                source: ExtractionError::InvalidEncoding(path.to_path_buf()),
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(UpdateError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// A delete of a path with no graph nodes only matters while a change to it is in flight.
    fn is_live(&self, path: &Path) -> bool {
        let Some(slot) = self.slot(path) else {
            return false;
        };
        let state = slot.state.lock();
        state.status == PathStatus::Tracked || slot.issued.load(Ordering::Acquire) > state.applied
    }

    fn tombstone_candidates(&self) -> Vec<Arc<Tombstone>> {
        let mut tombstones = self.tombstones.lock();
        expire(&mut tombstones, self.window, |t| t.removed_at);
        tombstones.iter().cloned().collect()
    }

    /// Recently created nodes outside `work`, with the slots of their files.
    fn nascent_candidates(&self, work: &[(Prepared, MutexGuard<'_, PathState>)]) -> Vec<(Arc<Nascent>, Arc<PathSlot>)> {
        let busy: HashSet<&Path> = work.iter().map(|(prep, _)| prep.path.as_path()).collect();
        let mut nascent = self.nascent.lock();
        expire(&mut nascent, self.window, |n| n.created_at);
        nascent
            .iter()
            .filter(|entry| !busy.contains(entry.node.file_path.as_path()))
            .filter_map(|entry| Some((Arc::clone(entry), self.slot(&entry.node.file_path)?)))
            .collect()
    }

    /// Record what an applied batch removed and created for later correlation.
    fn remember(
        &self,
        added: &[Node],
        removed: Vec<RemovedNode>,
        mut removal_bodies: HashMap<NodeId, String>,
        fresh: Vec<(Node, String, u64)>,
    ) {
        if self.window_capacity == 0 || self.window.is_zero() {
            return;
        }
        let now = Instant::now();

        let mut tombstones = self.tombstones.lock();
        for removed in removed {
            // Nodes re-keyed onto an older identity leave no tombstone.
            let Some(body) = removal_bodies.remove(&removed.node.id) else {
                continue;
            };
            tombstones.push_back(Arc::new(Tombstone {
                node: removed.node,
                body,
                incoming: removed.incoming,
                parked: removed.parked,
                removed_at: now,
            }));
        }
        while tombstones.len() > self.window_capacity {
            tombstones.pop_front();
        }
        drop(tombstones);

        // Fresh ids may have been disambiguated by the store.
        let applied: HashMap<(&Path, &NodeType, &str), &NodeId> = added
            .iter()
            .map(|n| ((n.file_path.as_path(), &n.node_type, n.qualified_name.as_str()), &n.id))
            .collect();
        let mut nascent = self.nascent.lock();
        for (mut node, body, ticket) in fresh {
            let key = (node.file_path.as_path(), &node.node_type, node.qualified_name.as_str());
            let Some(id) = applied.get(&key).map(|id| (*id).clone()) else {
                continue;
            };
            node.id = id;
            nascent.push_back(Arc::new(Nascent {
                node,
                body,
                ticket,
                created_at: now,
            }));
        }
        while nascent.len() > self.window_capacity {
            nascent.pop_front();
        }
    }

    /// Build the batch for `work`, claiming the window entries it correlates with.
    fn plan(&self, work: &[(Prepared, MutexGuard<'_, PathState>)], recent: &Recent<'_>) -> Plan {
        let view = self.store.view();
        let mut batch = FileBatch::default();
        let mut ids: Vec<HashMap<String, NodeId>> = vec![HashMap::new(); work.len()];
        let mut removals: Vec<Removal> = Vec::new();
        let mut creations: Vec<Creation> = Vec::new();

        for (item, (prep, state)) in work.iter().enumerate() {
            batch.paths.insert(prep.path.clone());
            let previous = state.content.clone().unwrap_or_else(|| Arc::from(""));
            let mut existing: HashMap<(NodeType, String), Node> = view
                .file_nodes(&prep.path)
                .into_iter()
                .map(|n| ((n.node_type.clone(), n.qualified_name.clone()), n))
                .collect();

            if let Extracted::Parsed { masked, result } = &prep.extracted {
                let mut seen = HashSet::new();
                for raw in &result.nodes {
                    if !seen.insert((raw.node_type.clone(), raw.qualified_name.clone())) {
                        continue;
                    }
                    let mut node = Node::new(
                        raw.node_type.clone(),
                        raw.name.clone(),
                        raw.qualified_name.clone(),
                        prep.path.clone(),
                    )
                    .with_lines(raw.start_line, raw.end_line);
                    node.metadata = raw.metadata.clone();
                    if masked.overlaps(raw.start_line, raw.end_line) {
                        node.metadata.insert(SECRET_KEY.to_string(), MetaValue::Bool(true));
                    }

                    match existing.remove(&(raw.node_type.clone(), raw.qualified_name.clone())) {
                        Some(old) => {
                            let had_secret = old.metadata.get(SECRET_KEY).and_then(MetaValue::as_bool);
                            if had_secret == Some(true) && !node.metadata.contains_key(SECRET_KEY) {
                                node.metadata.insert(SECRET_KEY.to_string(), MetaValue::Bool(false));
                            }
                            node.id = old.id;
                            ids[item].insert(node.qualified_name.clone(), node.id.clone());
                            batch.nodes.push(StagedNode {
                                node,
                                origin: NodeOrigin::Existing,
                            });
                        }
                        None => {
                            let body = span_text(&masked.text, raw.start_line, raw.end_line);
                            creations.push(Creation { item, node, body });
                        }
                    }
                }
            }

            let mut leftover: Vec<Node> = existing.into_values().collect();
            leftover.sort_by(|a, b| a.id.cmp(&b.id));
            for node in leftover {
                let body = span_text(&previous, node.start_line, node.end_line);
                removals.push(Removal { node, body });
            }
        }

        let revivable: Vec<&Arc<Tombstone>> = recent
            .tombstones
            .iter()
            .filter(|t| !view.contains(&t.node.id))
            .collect();
        let nascent: Vec<&Arc<Nascent>> = recent
            .nascent
            .iter()
            .map(|(entry, _)| entry)
            .filter(|entry| view.contains(&entry.node.id))
            .collect();
        drop(view);

        let matches = {
            let removed: Vec<Candidate<'_>> = removals
                .iter()
                .map(|r| candidate(&r.node, &r.body))
                .chain(revivable.iter().map(|t| candidate(&t.node, &t.body)))
                .collect();
            let created: Vec<Candidate<'_>> = creations
                .iter()
                .map(|c| candidate(&c.node, &c.body))
                .chain(nascent.iter().map(|n| candidate(&n.node, &n.body)))
                .collect();
            self.detector.correlate(&removed, &created)
        };

        let mut claimed: Vec<Option<(NodeId, NodeOrigin)>> = vec![None; creations.len()];
        let mut kept = vec![false; removals.len()];
        let mut restored: HashMap<NodeId, Arc<Tombstone>> = HashMap::new();
        let mut rekeyed: Vec<(usize, &Arc<Nascent>)> = Vec::new();
        for m in matches {
            if m.created >= creations.len() {
                // A removal that came after the creation of its new location.
                let entry = nascent[m.created - creations.len()];
                if m.removed < removals.len() && claim(&self.nascent, entry) {
                    kept[m.removed] = true;
                    rekeyed.push((m.removed, entry));
                }
                continue;
            }
            let to = &creations[m.created].node;
            if m.removed < removals.len() {
                let old = &removals[m.removed].node;
                kept[m.removed] = true;
                let origin = if old.file_path == to.file_path {
                    NodeOrigin::Existing
                } else {
                    NodeOrigin::Moved {
                        from: old.file_path.clone(),
                    }
                };
                if old.qualified_name != to.qualified_name {
                    info!(
                        "Renamed {} to {} (similarity {:.2})",
                        old.qualified_name, to.qualified_name, m.score
                    );
                }
                claimed[m.created] = Some((old.id.clone(), origin));
            } else {
                let tomb = revivable[m.removed - removals.len()];
                // Another run may have revived it since the window was read.
                if !claim(&self.tombstones, tomb) {
                    continue;
                }
                info!(
                    "Reviving {} as {} (similarity {:.2})",
                    tomb.node.qualified_name, to.qualified_name, m.score
                );
                claimed[m.created] = Some((
                    tomb.node.id.clone(),
                    NodeOrigin::Revived {
                        from: tomb.node.file_path.clone(),
                    },
                ));
                restored.insert(tomb.node.id.clone(), Arc::clone(tomb));
            }
        }

        if !rekeyed.is_empty() {
            let view = self.store.view();
            let mut pairs = Vec::new();
            for (r, entry) in rekeyed {
                let old = &removals[r].node;
                match view.node(&entry.node.id) {
                    Some(current) => {
                        info!("Node {} reappeared as {}, keeping its identity", old.id, current.id);
                        pairs.push((old, current));
                    }
                    None => kept[r] = false,
                }
            }
            rekey(&view, pairs, &mut batch);
        }

        let mut fresh = Vec::new();
        for (creation, assigned) in creations.into_iter().zip(claimed) {
            let mut node = creation.node;
            let origin = match assigned {
                None => {
                    let ticket = work[creation.item].0.ticket;
                    fresh.push((node.clone(), creation.body, ticket));
                    NodeOrigin::Fresh
                }
                Some((id, origin)) => {
                    node.id = id;
                    if let Some(tomb) = restored.remove(&node.id) {
                        let mut metadata = tomb.node.metadata.clone();
                        metadata.extend(std::mem::take(&mut node.metadata));
                        node.metadata = metadata;
                        batch.restored_edges.extend(tomb.incoming.iter().cloned());
                        batch.released.extend(tomb.parked.iter().cloned());
                    }
                    origin
                }
            };
            ids[creation.item].insert(node.qualified_name.clone(), node.id.clone());
            batch.nodes.push(StagedNode { node, origin });
        }

        let mut removal_bodies = HashMap::new();
        for (removal, kept) in removals.into_iter().zip(kept) {
            if !kept {
                batch.removals.push(removal.node.id.clone());
                removal_bodies.insert(removal.node.id, removal.body);
            }
        }

        for (item, (prep, _)) in work.iter().enumerate() {
            let Extracted::Parsed { result, .. } = &prep.extracted else {
                continue;
            };
            for raw in &result.edges {
                let Some(source_id) = ids[item].get(&raw.source_ref) else {
                    warn!(
                        "Dropping {} edge from unknown source {} in {}",
                        raw.edge_type.as_str(),
                        raw.source_ref,
                        prep.path.display()
                    );
                    continue;
                };
                let target_ref = ids[item]
                    .get(&raw.target_ref)
                    .map(|id| id.as_str().to_string())
                    .unwrap_or_else(|| raw.target_ref.clone());
                batch.edges.push(StagedEdge {
                    origin_file: prep.path.clone(),
                    source_id: source_id.clone(),
                    target_ref,
                    edge_type: raw.edge_type,
                    line: raw.line,
                });
            }
        }

        Plan {
            batch,
            removal_bodies,
            fresh,
        }
    }
}

/// Stage each fresh node under the identity of the removal it matched.
///
/// Fresh nodes go away and the old ids move to their locations. Edges of
/// the fresh nodes are carried over with their counters; static edges the
/// old nodes no longer have are withdrawn, since the new files are not part
/// of the batch.
fn rekey(view: &GraphView<'_>, pairs: Vec<(&Node, Node)>, batch: &mut FileBatch) {
    let ids: HashMap<NodeId, NodeId> = pairs
        .iter()
        .map(|(old, current)| (current.id.clone(), old.id.clone()))
        .collect();
    let retarget = |id: &NodeId| ids.get(id).cloned().unwrap_or_else(|| id.clone());
    let fresh: HashMap<&NodeId, &Node> = pairs.iter().map(|(_, current)| (&current.id, current)).collect();

    let mut seen = HashSet::new();
    let mut carried = HashSet::new();
    for (_, current) in &pairs {
        let mut edges = view.edges(&current.id, Direction::Both);
        edges.extend(view.pending_edges().into_iter().filter(|e| e.source_id == current.id));
        for edge in edges {
            if !seen.insert(edge.key()) {
                continue;
            }
            if let Some(target) = fresh.get(&edge.target_id) {
                let from_other_file = edge.source_id != edge.target_id
                    && !edge.dynamic
                    && view
                        .node(&edge.source_id)
                        .is_some_and(|source| source.file_path != target.file_path);
                if from_other_file {
                    // Removal parks these on the qualified name; they come back retargeted instead.
                    batch.released.push(EdgeKey::new(
                        edge.source_id.clone(),
                        NodeId::from(target.qualified_name.as_str()),
                        edge.edge_type,
                    ));
                }
            }
            let edge = Edge {
                source_id: retarget(&edge.source_id),
                target_id: retarget(&edge.target_id),
                ..edge
            };
            carried.insert(edge.key());
            batch.restored_edges.push(edge);
        }
    }

    for (old, current) in pairs {
        let stale = view
            .edges(&old.id, Direction::Outgoing)
            .into_iter()
            .chain(view.pending_edges().into_iter().filter(|e| e.source_id == old.id))
            .filter(|e| !e.dynamic && !carried.contains(&e.key()));
        batch.retracted.extend(stale.map(|e| e.key()));

        batch.removals.push(current.id.clone());
        let mut node = current;
        node.id = old.id.clone();
        batch.nodes.push(StagedNode {
            node,
            origin: NodeOrigin::Moved {
                from: old.file_path.clone(),
            },
        });
    }
}

/// Take `entry` out of `window` unless it is already gone.
fn claim<T>(window: &Mutex<VecDeque<Arc<T>>>, entry: &Arc<T>) -> bool {
    let mut window = window.lock();
    match window.iter().position(|e| Arc::ptr_eq(e, entry)) {
        Some(i) => {
            window.remove(i);
            true
        }
        None => false,
    }
}

fn expire<T>(window: &mut VecDeque<Arc<T>>, ttl: Duration, at: impl Fn(&T) -> Instant) {
    while window.front().is_some_and(|entry| at(entry).elapsed() > ttl) {
        window.pop_front();
    }
}

fn candidate<'a>(node: &'a Node, body: &'a str) -> Candidate<'a> {
    Candidate {
        node_type: &node.node_type,
        qualified_name: &node.qualified_name,
        body,
    }
}

impl std::fmt::Debug for UpdateCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateCoordinator")
            .field("root", &self.root)
            .field("paths", &self.slots.len())
            .field("threshold", &self.detector.threshold())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> UpdateCoordinator {
        UpdateCoordinator::new(
            Arc::new(GraphStore::new()),
            ExtractorRegistry::with_defaults(),
            &TrellisConfig::default(),
            "/repo",
        )
    }

    #[test]
    fn test_superseded_result_is_discarded() {
        let coordinator = coordinator();
        coordinator
            .update_file(FileChange::created("a.py").with_content("def foo():\n    pass\n"))
            .unwrap();
        let sequence = coordinator.store().sequence();

        // A newer version of the path has already been applied.
        let slot = Arc::clone(&coordinator.slots.get(Path::new("a.py")).unwrap());
        slot.state.lock().applied = u64::MAX;

        let report = coordinator
            .update_file(FileChange::modified("a.py").with_content("def bar():\n    pass\n"))
            .unwrap();
        assert!(report.is_stale());
        assert_eq!(report.stale, vec![PathBuf::from("a.py")]);
        assert_eq!(coordinator.store().sequence(), sequence);
        assert!(coordinator.store().get_node(&NodeId::from("function:a.foo")).is_some());
    }

    #[test]
    fn test_tickets_increase_per_path() {
        let coordinator = coordinator();
        for _ in 0..3 {
            coordinator
                .update_file(FileChange::modified("a.py").with_content("X = 1\n"))
                .unwrap();
        }
        let slot = Arc::clone(&coordinator.slots.get(Path::new("a.py")).unwrap());
        assert_eq!(slot.issued.load(Ordering::Acquire), 3);
        assert_eq!(slot.state.lock().applied, 3);
        assert_eq!(coordinator.path_status(Path::new("/repo/a.py")), PathStatus::Tracked);
    }

    #[test]
    fn test_relative_paths() {
        let coordinator = coordinator();
        assert_eq!(coordinator.relative(Path::new("/repo/pkg/a.py")), PathBuf::from("pkg/a.py"));
        assert_eq!(coordinator.relative(Path::new("./pkg/a.py")), PathBuf::from("pkg/a.py"));
        assert_eq!(coordinator.relative(Path::new("b.py")), PathBuf::from("b.py"));
    }
}
