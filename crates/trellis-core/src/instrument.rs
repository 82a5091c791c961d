//! Folding runtime call observations into the graph

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::MergeError;
use crate::graph::GraphStore;
use crate::model::NodeId;

/// One observed call. References are node ids or qualified names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallObservation {
    #[serde(alias = "caller_ref")]
    pub caller: String,
    #[serde(alias = "callee_ref")]
    pub callee: String,
    #[serde(default = "Utc::now", alias = "timestamp")]
    pub occurred_at: DateTime<Utc>,
}

impl CallObservation {
    pub fn new(caller: impl Into<String>, callee: impl Into<String>) -> Self {
        CallObservation {
            caller: caller.into(),
            callee: callee.into(),
            occurred_at: Utc::now(),
        }
    }

    pub fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }
}

/// Edge state right after an observation was counted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallRecord {
    pub caller: NodeId,
    pub callee: NodeId,
    pub call_count: u64,
    /// The edge has no static counterpart.
    pub dynamic: bool,
}

/// Merges runtime call events into a shared [`GraphStore`].
///
/// Known edges are counted with atomic increments under the store's read
/// lock, so concurrent observations never block each other or readers.
/// The write lock is taken only when a placeholder node or a new dynamic
/// edge must be created. Events may arrive out of order; the last-called
/// timestamp only ever moves forward.
#[derive(Clone)]
pub struct InstrumentationMerge {
    store: Arc<GraphStore>,
}

impl InstrumentationMerge {
    pub fn new(store: Arc<GraphStore>) -> Self {
        InstrumentationMerge { store }
    }

    pub fn record(&self, observation: &CallObservation) -> Result<CallRecord, MergeError> {
        let (caller, callee) = references(observation)?;
        Ok(self.count(caller, callee, observation))
    }

    /// Record a batch. An invalid observation rejects the whole batch before anything is counted.
    pub fn record_all(&self, observations: &[CallObservation]) -> Result<Vec<CallRecord>, MergeError> {
        let checked = observations
            .iter()
            .map(|obs| references(obs).map(|(caller, callee)| (caller, callee, obs)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(checked
            .into_iter()
            .map(|(caller, callee, obs)| self.count(caller, callee, obs))
            .collect())
    }

    fn count(&self, caller: &str, callee: &str, observation: &CallObservation) -> CallRecord {
        let record = self
            .store
            .observe_call(caller, callee, observation.occurred_at.timestamp_millis());
        debug!(
            "Observed call {} -> {} (count {})",
            record.caller, record.callee, record.call_count
        );
        record
    }
}

fn references(observation: &CallObservation) -> Result<(&str, &str), MergeError> {
    let caller = observation.caller.trim();
    let callee = observation.callee.trim();
    if caller.is_empty() {
        return Err(MergeError::EmptyReference("caller"));
    }
    if callee.is_empty() {
        return Err(MergeError::EmptyReference("callee"));
    }
    Ok((caller, callee))
}
