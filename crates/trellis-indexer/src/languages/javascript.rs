//! JavaScript and TypeScript extractor using tree-sitter

use std::collections::{BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};

use tree_sitter::{Language, Node};
use trellis_core::{EdgeType, MetaValue, NodeType};

use crate::extractor::*;

/// Grammar variant handled by a [`JavaScriptExtractor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    JavaScript,
    TypeScript,
    Tsx,
}

impl Dialect {
    fn grammar(&self) -> Language {
        match self {
            Dialect::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
            Dialect::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            Dialect::Tsx => tree_sitter_typescript::LANGUAGE_TSX.into(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Dialect::JavaScript => "javascript",
            Dialect::TypeScript | Dialect::Tsx => "typescript",
        }
    }
}

pub struct JavaScriptExtractor {
    dialect: Dialect,
}

impl JavaScriptExtractor {
    pub fn new(dialect: Dialect) -> Self {
        JavaScriptExtractor { dialect }
    }

    pub fn javascript() -> Self {
        Self::new(Dialect::JavaScript)
    }

    pub fn typescript() -> Self {
        Self::new(Dialect::TypeScript)
    }

    pub fn tsx() -> Self {
        Self::new(Dialect::Tsx)
    }
}

impl Extractor for JavaScriptExtractor {
    fn language(&self) -> &'static str {
        self.dialect.name()
    }

    fn extensions(&self) -> &'static [&'static str] {
        match self.dialect {
            Dialect::JavaScript => &["js", "jsx", "mjs", "cjs"],
            Dialect::TypeScript => &["ts", "mts", "cts"],
            Dialect::Tsx => &["tsx"],
        }
    }

    fn extract(&self, path: &Path, source: &str) -> Result<ExtractionResult, ExtractionError> {
        let tree = parse_source(path, source, &self.dialect.grammar(), self.dialect.name())?;
        let module = module_name(path);
        let lines = source.lines().count().max(1) as u32;

        let mut module_node = RawNode::new(NodeType::Module, short_name(&module), module.clone()).lines(1, lines);
        module_node
            .metadata
            .insert("language".to_string(), MetaValue::from(self.dialect.name()));

        let mut walker = Walker {
            source: source.as_bytes(),
            directory: path.parent().map(Path::to_path_buf).unwrap_or_default(),
            nodes: vec![module_node],
            edges: BTreeSet::new(),
            aliases: HashMap::new(),
            defined: HashMap::new(),
            references: Vec::new(),
        };
        let scope = Scope {
            container: module.clone(),
            owner: module,
            class: None,
            top_level: true,
        };
        walker.visit_children(tree.root_node(), &scope);
        Ok(walker.finish())
    }
}

struct Scope {
    container: String,
    owner: String,
    class: Option<String>,
    top_level: bool,
}

struct Reference {
    source: String,
    callee: String,
    class: Option<String>,
    edge_type: EdgeType,
    line: u32,
}

struct Walker<'a> {
    source: &'a [u8],
    directory: PathBuf,
    nodes: Vec<RawNode>,
    edges: BTreeSet<RawEdge>,
    aliases: HashMap<String, String>,
    defined: HashMap<String, String>,
    references: Vec<Reference>,
}

fn is_function_value(node: Node) -> bool {
    matches!(
        node.kind(),
        "arrow_function" | "function_expression" | "function" | "generator_function"
    )
}

impl Walker<'_> {
    fn visit_children(&mut self, node: Node, scope: &Scope) {
        let mut cursor = node.walk();
        let children: Vec<Node> = node.named_children(&mut cursor).collect();
        for child in children {
            self.visit(child, scope);
        }
    }

    fn visit(&mut self, node: Node, scope: &Scope) {
        match node.kind() {
            "function_declaration" | "generator_function_declaration" => {
                if let Some(name) = field_text(node, "name", self.source) {
                    self.function(name, node, node, scope);
                }
            }
            "class_declaration" | "abstract_class_declaration" => self.class(node, scope),
            "variable_declarator" => self.declarator(node, scope),
            "import_statement" => self.import(node, scope),
            "call_expression" => {
                if let Some(function) = node.child_by_field_name("function") {
                    self.reference(function, node, EdgeType::Calls, scope);
                }
                self.visit_children(node, scope);
            }
            "new_expression" => {
                if let Some(constructor) = node.child_by_field_name("constructor") {
                    self.reference(constructor, node, EdgeType::Uses, scope);
                }
                self.visit_children(node, scope);
            }
            _ => self.visit_children(node, scope),
        }
    }

    fn define(&mut self, raw: RawNode, scope: &Scope, line: u32) {
        let edge_type = if scope.top_level {
            self.defined.insert(raw.name.clone(), raw.qualified_name.clone());
            EdgeType::Defines
        } else {
            EdgeType::Contains
        };
        self.edges
            .insert(RawEdge::new(scope.container.clone(), raw.qualified_name.clone(), edge_type).at(line));
        self.nodes.push(raw);
    }

    /// `function_node` carries parameters and body; `span_node` the reported lines.
    fn function(&mut self, name: &str, function_node: Node, span_node: Node, scope: &Scope) {
        let qualified_name = format!("{}.{}", scope.container, name);
        let (start, end) = span(span_node);
        let mut raw = RawNode::new(NodeType::Function, name, qualified_name.clone()).lines(start, end);
        raw.metadata.insert(
            "parameters".to_string(),
            MetaValue::from(self.parameters(function_node)),
        );
        if text(function_node, self.source).starts_with("async") {
            raw.metadata.insert("async".to_string(), MetaValue::Bool(true));
        }
        if function_node.kind() == "method_definition" {
            raw.metadata.insert("method".to_string(), MetaValue::Bool(true));
        }
        self.define(raw, scope, start);

        if let Some(body) = function_node.child_by_field_name("body") {
            let inner = Scope {
                container: qualified_name.clone(),
                owner: qualified_name,
                class: scope.class.clone(),
                top_level: false,
            };
            self.visit(body, &inner);
        }
    }

    fn class(&mut self, node: Node, scope: &Scope) {
        let Some(name) = field_text(node, "name", self.source) else {
            return;
        };
        let qualified_name = format!("{}.{}", scope.container, name);
        let (start, end) = span(node);
        let mut raw = RawNode::new(NodeType::Class, name, qualified_name.clone()).lines(start, end);

        let mut cursor = node.walk();
        let heritage = node
            .named_children(&mut cursor)
            .find(|child| child.kind() == "class_heritage");
        if let Some(heritage) = heritage {
            let mut bases = Vec::new();
            let mut inner = heritage.walk();
            for clause in heritage.named_children(&mut inner) {
                // JavaScript puts the expression directly under the heritage;
                // TypeScript wraps it in extends/implements clauses.
                let targets: Vec<Node> = if clause.kind().ends_with("_clause") {
                    let mut clause_cursor = clause.walk();
                    clause.named_children(&mut clause_cursor).collect()
                } else {
                    vec![clause]
                };
                for target in targets {
                    if matches!(target.kind(), "identifier" | "member_expression" | "type_identifier") {
                        let base = text(target, self.source).to_string();
                        self.references.push(Reference {
                            source: qualified_name.clone(),
                            callee: base.clone(),
                            class: None,
                            edge_type: EdgeType::Uses,
                            line: start,
                        });
                        bases.push(base);
                    }
                }
            }
            if !bases.is_empty() {
                raw.metadata.insert("bases".to_string(), MetaValue::from(bases));
            }
        }
        self.define(raw, scope, start);

        let Some(body) = node.child_by_field_name("body") else {
            return;
        };
        let inner = Scope {
            container: qualified_name.clone(),
            owner: qualified_name.clone(),
            class: Some(qualified_name),
            top_level: false,
        };
        let mut cursor = body.walk();
        let members: Vec<Node> = body.named_children(&mut cursor).collect();
        for member in members {
            match member.kind() {
                "method_definition" => {
                    if let Some(name) = field_text(member, "name", self.source) {
                        self.function(name, member, member, &inner);
                    }
                }
                _ => self.visit(member, &inner),
            }
        }
    }

    fn declarator(&mut self, node: Node, scope: &Scope) {
        let Some(name_node) = node.child_by_field_name("name") else {
            return;
        };
        let value = node.child_by_field_name("value");
        let name = text(name_node, self.source);
        if name_node.kind() == "identifier" {
            if let Some(value) = value.filter(|v| is_function_value(*v)) {
                // Report the whole declaration so `const f = () => {}` spans its statement.
                let span_node = node.parent().unwrap_or(node);
                self.function(name, value, span_node, scope);
                return;
            }
            if scope.top_level {
                let qualified_name = format!("{}.{}", scope.container, name);
                let (start, end) = span(node);
                let raw = RawNode::new(NodeType::Variable, name, qualified_name).lines(start, end);
                self.define(raw, scope, start);
            }
        }
        if let Some(value) = value {
            self.visit(value, scope);
        }
    }

    fn parameters(&self, function_node: Node) -> Vec<String> {
        if let Some(single) = function_node.child_by_field_name("parameter") {
            return vec![text(single, self.source).to_string()];
        }
        let Some(params) = function_node.child_by_field_name("parameters") else {
            return Vec::new();
        };
        let mut cursor = params.walk();
        params
            .named_children(&mut cursor)
            .filter_map(|param| {
                let name = match param.kind() {
                    "identifier" => Some(param),
                    "assignment_pattern" => param.child_by_field_name("left"),
                    "required_parameter" | "optional_parameter" => param.child_by_field_name("pattern"),
                    "rest_pattern" => param.named_child(0),
                    _ => None,
                }?;
                let name = text(name, self.source);
                Some(name.trim_start_matches("...").to_string())
            })
            .collect()
    }

    fn import(&mut self, node: Node, scope: &Scope) {
        let Some(source) = field_text(node, "source", self.source) else {
            return;
        };
        let module = self.resolve_specifier(source.trim_matches(['"', '\'', '`']));
        if module.is_empty() {
            return;
        }
        let line = point_to_line(node.start_position());
        self.edges
            .insert(RawEdge::new(scope.owner.clone(), module.clone(), EdgeType::Imports).at(line));

        let mut cursor = node.walk();
        let clause = node
            .named_children(&mut cursor)
            .find(|child| child.kind() == "import_clause");
        let Some(clause) = clause else {
            return;
        };
        let mut cursor = clause.walk();
        let parts: Vec<Node> = clause.named_children(&mut cursor).collect();
        for part in parts {
            match part.kind() {
                "identifier" => {
                    let local = text(part, self.source);
                    self.aliases
                        .insert(local.to_string(), format!("{}.{}", module, local));
                }
                "namespace_import" => {
                    if let Some(local) = part.named_child(0) {
                        self.aliases
                            .insert(text(local, self.source).to_string(), module.clone());
                    }
                }
                "named_imports" => {
                    let mut inner = part.walk();
                    for specifier in part.named_children(&mut inner) {
                        if specifier.kind() != "import_specifier" {
                            continue;
                        }
                        let Some(imported) = field_text(specifier, "name", self.source) else {
                            continue;
                        };
                        let local = field_text(specifier, "alias", self.source).unwrap_or(imported);
                        self.aliases
                            .insert(local.to_string(), format!("{}.{}", module, imported));
                    }
                }
                _ => {}
            }
        }
    }

    /// Relative specifiers become dotted module names; packages keep their name.
    fn resolve_specifier(&self, specifier: &str) -> String {
        if !specifier.starts_with('.') {
            return specifier.to_string();
        }
        let mut parts: Vec<String> = self
            .directory
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        for segment in specifier.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                other => parts.push(other.to_string()),
            }
        }
        module_name(&parts.iter().collect::<PathBuf>())
    }

    fn reference(&mut self, target: Node, at: Node, edge_type: EdgeType, scope: &Scope) {
        if !matches!(target.kind(), "identifier" | "member_expression") {
            return;
        }
        let callee: String = text(target, self.source)
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        if callee.is_empty() || callee.contains(['(', '[', '?']) {
            return;
        }
        self.references.push(Reference {
            source: scope.owner.clone(),
            callee,
            class: scope.class.clone(),
            edge_type,
            line: point_to_line(at.start_position()),
        });
    }

    fn resolve(&self, callee: &str, class: Option<&str>) -> String {
        let (head, rest) = match callee.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (callee, None),
        };
        if head == "this" {
            if let (Some(class), Some(rest)) = (class, rest) {
                return format!("{}.{}", class, rest);
            }
        }
        let base = self.aliases.get(head).or_else(|| self.defined.get(head));
        match (base, rest) {
            (Some(base), Some(rest)) => format!("{}.{}", base, rest),
            (Some(base), None) => base.clone(),
            (None, _) => callee.to_string(),
        }
    }

    fn finish(mut self) -> ExtractionResult {
        for reference in std::mem::take(&mut self.references) {
            let target = self.resolve(&reference.callee, reference.class.as_deref());
            if target == reference.source {
                continue;
            }
            self.edges.insert(
                RawEdge::new(reference.source, target, reference.edge_type).at(reference.line),
            );
        }
        ExtractionResult {
            nodes: self.nodes,
            edges: dedup_edges(self.edges),
        }
    }
}
