//! Error taxonomy for graph mutation, persistence and queries

use std::path::PathBuf;

use thiserror::Error;

use crate::model::NodeId;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("node id must not be empty")]
    EmptyId,

    #[error("node {id} has start line {start} after end line {end}")]
    InvalidSpan { id: NodeId, start: u32, end: u32 },

    #[error("edge source {0} is not in the graph")]
    UnknownSource(NodeId),
}

/// A snapshot document could not be read or did not describe a valid graph.
/// The graph that was loaded before the failed attempt is left untouched.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("malformed snapshot document: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("snapshot format version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("duplicate node id {0}")]
    DuplicateNode(NodeId),

    #[error("edge {source_id} -> {target_id} references a source that is not in the snapshot")]
    DanglingSource { source_id: NodeId, target_id: NodeId },

    #[error(transparent)]
    InvalidNode(#[from] GraphError),

    #[error("snapshot I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("node not found: {0}")]
    NotFound(NodeId),

    #[error("limit {limit} is outside the accepted range 1..={max}")]
    InvalidLimit { limit: usize, max: usize },
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("call observation has an empty {0} reference")]
    EmptyReference(&'static str),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}
