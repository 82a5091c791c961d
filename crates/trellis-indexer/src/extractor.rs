//! Extractor trait, raw extraction records and shared tree-sitter helpers

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tree_sitter::{Language, Node, Parser, Point, Tree};
use trellis_core::{EdgeType, Metadata, NodeType};

/// A definition found in one file, before it is given a graph identity.
#[derive(Debug, Clone, PartialEq)]
pub struct RawNode {
    pub node_type: NodeType,
    pub name: String,
    pub qualified_name: String,
    pub start_line: u32,
    pub end_line: u32,
    pub metadata: Metadata,
}

impl RawNode {
    pub fn new(node_type: NodeType, name: impl Into<String>, qualified_name: impl Into<String>) -> Self {
        RawNode {
            node_type,
            name: name.into(),
            qualified_name: qualified_name.into(),
            start_line: 0,
            end_line: 0,
            metadata: Metadata::new(),
        }
    }

    pub fn lines(mut self, start_line: u32, end_line: u32) -> Self {
        self.start_line = start_line;
        self.end_line = end_line.max(start_line);
        self
    }
}

/// A relationship found in one file.
///
/// `source_ref` is the qualified name of a [`RawNode`] from the same result.
/// `target_ref` is a qualified name or node id that may live anywhere.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RawEdge {
    pub source_ref: String,
    pub target_ref: String,
    pub edge_type: EdgeType,
    pub line: Option<u32>,
}

impl RawEdge {
    pub fn new(source_ref: impl Into<String>, target_ref: impl Into<String>, edge_type: EdgeType) -> Self {
        RawEdge {
            source_ref: source_ref.into(),
            target_ref: target_ref.into(),
            edge_type,
            line: None,
        }
    }

    pub fn at(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }
}

/// Ordered output of one extraction. An empty result is a valid file with no definitions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionResult {
    pub nodes: Vec<RawNode>,
    pub edges: Vec<RawEdge>,
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("failed to parse {path} near line {line}")]
    Parse { path: PathBuf, line: u32 },

    #[error("no extractor registered for {0}")]
    Unsupported(PathBuf),

    #[error("{0} is not valid UTF-8")]
    InvalidEncoding(PathBuf),

    #[error("failed to load {language} grammar: {reason}")]
    Grammar { language: &'static str, reason: String },
}

/// A language capability selected by file extension.
///
/// Implementations are stateless per call and may run on any thread.
pub trait Extractor: Send + Sync {
    fn language(&self) -> &'static str;

    /// Extensions handled by this extractor, without the leading dot.
    fn extensions(&self) -> &'static [&'static str];

    /// Extract definitions and relationships from already masked source text.
    fn extract(&self, path: &Path, source: &str) -> Result<ExtractionResult, ExtractionError>;
}

/// Parse `source`, rejecting trees that contain error or missing nodes.
pub fn parse_source(
    path: &Path,
    source: &str,
    language: &Language,
    name: &'static str,
) -> Result<Tree, ExtractionError> {
    let mut parser = Parser::new();
    parser.set_language(language).map_err(|e| ExtractionError::Grammar {
        language: name,
        reason: e.to_string(),
    })?;
    let tree = parser.parse(source, None).ok_or_else(|| ExtractionError::Parse {
        path: path.to_path_buf(),
        line: 1,
    })?;
    let root = tree.root_node();
    if root.has_error() {
        return Err(ExtractionError::Parse {
            path: path.to_path_buf(),
            line: first_error_line(root),
        });
    }
    Ok(tree)
}

fn first_error_line(node: Node) -> u32 {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.is_error() || child.is_missing() {
            return point_to_line(child.start_position());
        }
        if child.has_error() {
            return first_error_line(child);
        }
    }
    point_to_line(node.start_position())
}

pub fn point_to_line(point: Point) -> u32 {
    (point.row as u32) + 1
}

/// One-based first and last line of a syntax node.
pub fn span(node: Node) -> (u32, u32) {
    (point_to_line(node.start_position()), point_to_line(node.end_position()))
}

pub fn text<'a>(node: Node, source: &'a [u8]) -> &'a str {
    node.utf8_text(source).unwrap_or_default()
}

pub fn field_text<'a>(node: Node, field: &str, source: &'a [u8]) -> Option<&'a str> {
    node.child_by_field_name(field).map(|n| text(n, source))
}

/// Dotted module name for a repository-relative path.
///
/// `pkg/util.py` becomes `pkg.util`; package entry files (`__init__`,
/// `index`) take the name of their directory.
pub fn module_name(path: &Path) -> String {
    let stem = path.with_extension("");
    let mut parts: Vec<String> = stem
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.len() > 1 && matches!(parts.last().map(String::as_str), Some("__init__" | "index")) {
        parts.pop();
    }
    parts.join(".")
}

/// One edge per (source, target, type), keeping the earliest line.
pub fn dedup_edges(edges: BTreeSet<RawEdge>) -> Vec<RawEdge> {
    let mut seen = BTreeSet::new();
    edges
        .into_iter()
        .filter(|edge| seen.insert((edge.source_ref.clone(), edge.target_ref.clone(), edge.edge_type)))
        .collect()
}

/// Last segment of a dotted name.
pub fn short_name(qualified_name: &str) -> &str {
    qualified_name.rsplit('.').next().unwrap_or(qualified_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_name() {
        assert_eq!(module_name(Path::new("a.py")), "a");
        assert_eq!(module_name(Path::new("pkg/util.py")), "pkg.util");
        assert_eq!(module_name(Path::new("pkg/__init__.py")), "pkg");
        assert_eq!(module_name(Path::new("web/index.js")), "web");
        assert_eq!(module_name(Path::new("./src/app.test.js")), "src.app.test");
    }

    #[test]
    fn test_raw_node_lines_never_invert() {
        let node = RawNode::new(NodeType::Function, "f", "m.f").lines(4, 2);
        assert_eq!((node.start_line, node.end_line), (4, 4));
    }
}
