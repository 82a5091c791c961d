//! Core data structures for the dependency graph

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata key marking a placeholder node created from runtime evidence.
pub const SYNTHETIC_KEY: &str = "synthetic";
/// Metadata key surfacing how often a node was observed as a callee.
pub const INVOCATIONS_KEY: &str = "runtime.call_count";
/// Metadata key surfacing the last time a node was observed as a callee.
pub const LAST_INVOKED_KEY: &str = "runtime.last_called_at";

/// Stable identifier for a node.
///
/// Derived once, when the node is first observed, as `"{node_type}:{qualified_name}"`.
/// When that id is already owned by an unrelated node in another file the
/// defining file is appended (`"{node_type}:{qualified_name}@{file_path}"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn derive(node_type: &NodeType, qualified_name: &str) -> Self {
        NodeId(format!("{}:{}", node_type, qualified_name))
    }

    pub fn disambiguated(node_type: &NodeType, qualified_name: &str, file_path: &Path) -> Self {
        NodeId(format!("{}:{}@{}", node_type, qualified_name, file_path.display()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split an id of the form `type:qualified_name` into its parts.
    pub fn parts(&self) -> Option<(NodeType, &str)> {
        let (ty, rest) = self.0.split_once(':')?;
        let rest = rest.split('@').next().unwrap_or(rest);
        match NodeType::from(ty.to_string()) {
            NodeType::Other(_) => None,
            known => Some((known, rest)),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        NodeId(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        NodeId(value)
    }
}

/// What kind of code entity a node represents.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeType {
    Module,
    File,
    Class,
    Function,
    Variable,
    /// Extension point for extractors that emit other entity kinds.
    Other(String),
}

impl NodeType {
    pub fn as_str(&self) -> &str {
        match self {
            NodeType::Module => "module",
            NodeType::File => "file",
            NodeType::Class => "class",
            NodeType::Function => "function",
            NodeType::Variable => "variable",
            NodeType::Other(other) => other,
        }
    }
}

impl From<String> for NodeType {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "module" => NodeType::Module,
            "file" => NodeType::File,
            "class" => NodeType::Class,
            "function" | "method" => NodeType::Function,
            "variable" => NodeType::Variable,
            _ => NodeType::Other(value),
        }
    }
}

impl From<NodeType> for String {
    fn from(value: NodeType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relationship represented by an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    Calls,
    Imports,
    Defines,
    Uses,
    Contains,
}

impl EdgeType {
    pub const ALL: [EdgeType; 5] = [
        EdgeType::Calls,
        EdgeType::Imports,
        EdgeType::Defines,
        EdgeType::Uses,
        EdgeType::Contains,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::Calls => "calls",
            EdgeType::Imports => "imports",
            EdgeType::Defines => "defines",
            EdgeType::Uses => "uses",
            EdgeType::Contains => "contains",
        }
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EdgeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EdgeType::ALL
            .into_iter()
            .find(|ty| ty.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown edge type `{}`", s))
    }
}

/// A metadata value. Metadata is open-ended; nothing in the engine requires a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<MetaValue>),
}

impl MetaValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetaValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            MetaValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MetaValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Case-insensitive substring match against text values, recursing into lists.
    pub fn contains_text(&self, needle: &str) -> bool {
        match self {
            MetaValue::Text(s) => s.to_lowercase().contains(needle),
            MetaValue::List(items) => items.iter().any(|v| v.contains_text(needle)),
            _ => false,
        }
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        MetaValue::Bool(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        MetaValue::Int(value)
    }
}

impl From<f64> for MetaValue {
    fn from(value: f64) -> Self {
        MetaValue::Float(value)
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::Text(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        MetaValue::Text(value)
    }
}

impl From<Vec<String>> for MetaValue {
    fn from(value: Vec<String>) -> Self {
        MetaValue::List(value.into_iter().map(MetaValue::Text).collect())
    }
}

pub type Metadata = BTreeMap<String, MetaValue>;

/// A single node in the dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Empty in legacy documents; snapshot upgrade derives it.
    #[serde(default)]
    pub id: NodeId,
    #[serde(alias = "type")]
    pub node_type: NodeType,
    pub name: String,
    #[serde(default)]
    pub qualified_name: String,
    #[serde(alias = "filepath", default)]
    pub file_path: PathBuf,
    #[serde(default)]
    pub start_line: u32,
    #[serde(default)]
    pub end_line: u32,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Node {
    /// Build a node whose id is derived from its type and qualified name.
    pub fn new(
        node_type: NodeType,
        name: impl Into<String>,
        qualified_name: impl Into<String>,
        file_path: impl Into<PathBuf>,
    ) -> Self {
        let qualified_name = qualified_name.into();
        Node {
            id: NodeId::derive(&node_type, &qualified_name),
            node_type,
            name: name.into(),
            qualified_name,
            file_path: file_path.into(),
            start_line: 0,
            end_line: 0,
            metadata: Metadata::new(),
        }
    }

    /// Placeholder for a callable only known from runtime evidence.
    pub fn synthetic(reference: &str) -> Self {
        let (node_type, qualified_name) = match NodeId::from(reference).parts() {
            Some((ty, qn)) => (ty, qn.to_string()),
            None => (NodeType::Function, reference.to_string()),
        };
        let name = qualified_name
            .rsplit(['.', ':', '/'])
            .next()
            .unwrap_or(&qualified_name)
            .to_string();
        let mut node = Node::new(node_type, name, qualified_name, PathBuf::new());
        node.metadata.insert(SYNTHETIC_KEY.to_string(), MetaValue::Bool(true));
        node
    }

    pub fn with_lines(mut self, start_line: u32, end_line: u32) -> Self {
        self.start_line = start_line;
        self.end_line = end_line;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_synthetic(&self) -> bool {
        self.metadata
            .get(SYNTHETIC_KEY)
            .and_then(MetaValue::as_bool)
            .unwrap_or(false)
    }
}

/// Composite identity of an edge.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeKey {
    pub source_id: NodeId,
    pub target_id: NodeId,
    pub edge_type: EdgeType,
}

impl EdgeKey {
    pub fn new(source_id: NodeId, target_id: NodeId, edge_type: EdgeType) -> Self {
        EdgeKey { source_id, target_id, edge_type }
    }
}

impl fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -{}-> {}", self.source_id, self.edge_type, self.target_id)
    }
}

/// A directed edge in the dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(alias = "source")]
    pub source_id: NodeId,
    #[serde(alias = "target")]
    pub target_id: NodeId,
    #[serde(alias = "type")]
    pub edge_type: EdgeType,
    /// Only runtime evidence supports this edge.
    #[serde(default)]
    pub dynamic: bool,
    /// A static edge that has also been observed at runtime.
    #[serde(default)]
    pub dynamic_corroborated: bool,
    #[serde(default)]
    pub call_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_called_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl Edge {
    /// A statically extracted edge.
    pub fn new(source_id: impl Into<NodeId>, target_id: impl Into<NodeId>, edge_type: EdgeType) -> Self {
        Edge {
            source_id: source_id.into(),
            target_id: target_id.into(),
            edge_type,
            dynamic: false,
            dynamic_corroborated: false,
            call_count: 0,
            last_called_at: None,
            line: None,
        }
    }

    /// A call edge known only from runtime observation.
    pub fn observed_call(source_id: impl Into<NodeId>, target_id: impl Into<NodeId>) -> Self {
        Edge {
            dynamic: true,
            ..Edge::new(source_id, target_id, EdgeType::Calls)
        }
    }

    pub fn at_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    pub fn key(&self) -> EdgeKey {
        EdgeKey::new(self.source_id.clone(), self.target_id.clone(), self.edge_type)
    }
}

/// Which incident edges of a node to visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[serde(alias = "in")]
    Incoming,
    #[serde(alias = "out")]
    Outgoing,
    #[default]
    Both,
}
