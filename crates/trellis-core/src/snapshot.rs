//! Snapshot document and on-disk persistence

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GraphError, SnapshotError};
use crate::model::{Edge, Node, NodeId};

/// State directory: .trellis/
pub const STATE_DIR: &str = ".trellis";

/// Default snapshot file inside the state directory
pub const SNAPSHOT_FILE: &str = "graph.json";

/// Current snapshot document version. Documents without a version are version 0.
pub const FORMAT_VERSION: u32 = 1;

/// Complete, order-independent serialization of a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default, alias = "version")]
    pub format_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exported_at: Option<DateTime<Utc>>,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl Snapshot {
    pub fn from_json(data: &str) -> Result<Self, SnapshotError> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn to_json(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Bring older documents up to the current format and reject what cannot be upgraded.
    ///
    /// Version 0 documents may lack qualified names and ids; both are
    /// derived from the node's name and type.
    pub fn upgrade(&mut self) -> Result<(), SnapshotError> {
        if self.format_version > FORMAT_VERSION {
            return Err(SnapshotError::UnsupportedVersion {
                found: self.format_version,
                supported: FORMAT_VERSION,
            });
        }

        let mut seen = HashSet::new();
        for node in &mut self.nodes {
            if node.qualified_name.is_empty() {
                node.qualified_name = node.name.clone();
            }
            if node.id.as_str().is_empty() {
                node.id = NodeId::derive(&node.node_type, &node.qualified_name);
            }
            if node.start_line > node.end_line {
                return Err(GraphError::InvalidSpan {
                    id: node.id.clone(),
                    start: node.start_line,
                    end: node.end_line,
                }
                .into());
            }
            if !seen.insert(node.id.clone()) {
                return Err(SnapshotError::DuplicateNode(node.id.clone()));
            }
        }
        self.format_version = FORMAT_VERSION;
        Ok(())
    }
}

/// Get state directory path
pub fn state_dir(root: &Path) -> PathBuf {
    root.join(STATE_DIR)
}

/// Resolve the snapshot location; relative paths are taken from the repository root.
pub fn snapshot_path(root: &Path, configured: &Path) -> PathBuf {
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        root.join(configured)
    }
}

/// Write a snapshot atomically: serialize to a sibling temp file, then rename over the target.
pub fn save_snapshot(snapshot: &Snapshot, path: &Path) -> Result<(), SnapshotError> {
    let io_err = |source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let json = snapshot.to_json()?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)?;

    tracing::info!(
        "Snapshot saved: {} ({} nodes, {} edges)",
        path.display(),
        snapshot.nodes.len(),
        snapshot.edges.len()
    );
    Ok(())
}

/// Read a snapshot if one exists.
pub fn read_snapshot(path: &Path) -> Result<Option<Snapshot>, SnapshotError> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path).map_err(|source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let snapshot = Snapshot::from_json(&data)?;
    tracing::debug!("Snapshot read from: {}", path.display());
    Ok(Some(snapshot))
}

/// Clear the state directory
pub fn clear_state(root: &Path) -> std::io::Result<()> {
    let dir = state_dir(root);
    if dir.exists() {
        std::fs::remove_dir_all(&dir)?;
    }
    Ok(())
}
