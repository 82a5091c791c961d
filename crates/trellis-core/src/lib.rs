//! Trellis core: dependency graph model, store, runtime merge and query layer

pub mod config;
pub mod diff;
pub mod error;
pub mod graph;
pub mod instrument;
pub mod keywords;
pub mod model;
pub mod query;
pub mod snapshot;

#[cfg(test)]
pub mod tests;

#[cfg(test)]
pub mod test_utils;

pub use config::TrellisConfig;
pub use diff::{BatchOutcome, FileBatch, GraphDiff, NodeMove, NodeOrigin, RemovedNode, StagedEdge, StagedNode};
pub use error::{ConfigError, GraphError, MergeError, QueryError, SnapshotError};
pub use graph::{EdgeChange, GraphStats, GraphStore, GraphView, NodeChange};
pub use instrument::{CallObservation, CallRecord, InstrumentationMerge};
pub use model::{Direction, Edge, EdgeKey, EdgeType, MetaValue, Metadata, Node, NodeId, NodeType};
pub use query::{GraphQuery, NodeFilter, Page};
pub use snapshot::{STATE_DIR, SNAPSHOT_FILE, Snapshot, clear_state, read_snapshot, save_snapshot, snapshot_path, state_dir};
