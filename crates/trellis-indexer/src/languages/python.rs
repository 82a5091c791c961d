//! Python language extractor using tree-sitter

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use tree_sitter::Node;
use trellis_core::{EdgeType, MetaValue, NodeType};

use crate::extractor::*;

pub struct PythonExtractor;

impl Extractor for PythonExtractor {
    fn language(&self) -> &'static str {
        "python"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["py", "pyi"]
    }

    fn extract(&self, path: &Path, source: &str) -> Result<ExtractionResult, ExtractionError> {
        let tree = parse_source(path, source, &tree_sitter_python::LANGUAGE.into(), "python")?;
        let module = module_name(path);
        let is_package = path.file_stem().is_some_and(|s| s == "__init__");

        let mut walker = Walker::new(source.as_bytes(), module.clone(), is_package);
        let root = tree.root_node();
        let lines = source.lines().count().max(1) as u32;
        let mut module_node = RawNode::new(NodeType::Module, short_name(&module), module.clone()).lines(1, lines);
        module_node
            .metadata
            .insert("language".to_string(), MetaValue::from("python"));
        walker.nodes.push(module_node);

        let scope = Scope {
            container: module.clone(),
            owner: module,
            class: None,
            kind: ScopeKind::Module,
        };
        walker.visit_children(root, &scope);
        Ok(walker.finish())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Module,
    Class,
    Function,
}

struct Scope {
    /// Qualified name new definitions are nested under.
    container: String,
    /// Qualified name calls made here are attributed to.
    owner: String,
    /// Enclosing class, for `self.method()` calls.
    class: Option<String>,
    kind: ScopeKind,
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
    module: String,
    is_package: bool,
    nodes: Vec<RawNode>,
    edges: BTreeSet<RawEdge>,
    /// Local name -> qualified target, from import statements.
    aliases: HashMap<String, String>,
    /// Module level name -> qualified name of the local definition.
    defined: HashMap<String, String>,
    references: Vec<Reference>,
}

impl<'a> Walker<'a> {
    fn new(source: &'a [u8], module: String, is_package: bool) -> Self {
        Walker {
            source,
            module,
            is_package,
            nodes: Vec::new(),
            edges: BTreeSet::new(),
            aliases: HashMap::new(),
            defined: HashMap::new(),
            references: Vec::new(),
        }
    }

    fn visit_children(&mut self, node: Node, scope: &Scope) {
        let mut cursor = node.walk();
        let children: Vec<Node> = node.named_children(&mut cursor).collect();
        for child in children {
            self.visit(child, scope);
        }
    }

    fn visit(&mut self, node: Node, scope: &Scope) {
        match node.kind() {
            "function_definition" => self.function(node, Vec::new(), scope),
            "class_definition" => self.class(node, Vec::new(), scope),
            "decorated_definition" => {
                let decorators = self.decorators(node);
                if let Some(definition) = node.child_by_field_name("definition") {
                    match definition.kind() {
                        "function_definition" => self.function(definition, decorators, scope),
                        "class_definition" => self.class(definition, decorators, scope),
                        _ => self.visit(definition, scope),
                    }
                }
            }
            "import_statement" => self.import(node, scope),
            "import_from_statement" => self.import_from(node, scope),
            "assignment" => {
                if scope.kind == ScopeKind::Module {
                    self.variable(node, scope);
                }
                self.visit_children(node, scope);
            }
            "call" => {
                if let Some(function) = node.child_by_field_name("function") {
                    self.reference(function, node, EdgeType::Calls, scope);
                }
                self.visit_children(node, scope);
            }
            _ => self.visit_children(node, scope),
        }
    }

    fn define(&mut self, raw: RawNode, scope: &Scope, line: u32) {
        let edge_type = match scope.kind {
            ScopeKind::Module => EdgeType::Defines,
            ScopeKind::Class | ScopeKind::Function => EdgeType::Contains,
        };
        if scope.kind == ScopeKind::Module {
            self.defined.insert(raw.name.clone(), raw.qualified_name.clone());
        }
        self.edges
            .insert(RawEdge::new(scope.container.clone(), raw.qualified_name.clone(), edge_type).at(line));
        self.nodes.push(raw);
    }

    fn function(&mut self, node: Node, decorators: Vec<String>, scope: &Scope) {
        let Some(name) = field_text(node, "name", self.source) else {
            return;
        };
        let qualified_name = format!("{}.{}", scope.container, name);
        let (start, end) = span(node);
        let mut raw = RawNode::new(NodeType::Function, name, qualified_name.clone()).lines(start, end);

        let parameters = node
            .child_by_field_name("parameters")
            .map(|p| self.parameters(p))
            .unwrap_or_default();
        raw.metadata
            .insert("parameters".to_string(), MetaValue::from(parameters));
        if !decorators.is_empty() {
            raw.metadata
                .insert("decorators".to_string(), MetaValue::from(decorators));
        }
        if text(node, self.source).starts_with("async") {
            raw.metadata.insert("async".to_string(), MetaValue::Bool(true));
        }
        if scope.kind == ScopeKind::Class {
            raw.metadata.insert("method".to_string(), MetaValue::Bool(true));
        }
        self.define(raw, scope, start);

        if let Some(body) = node.child_by_field_name("body") {
            let inner = Scope {
                container: qualified_name.clone(),
                owner: qualified_name,
                class: scope.class.clone(),
                kind: ScopeKind::Function,
            };
            self.visit_children(body, &inner);
        }
    }

    fn class(&mut self, node: Node, decorators: Vec<String>, scope: &Scope) {
        let Some(name) = field_text(node, "name", self.source) else {
            return;
        };
        let qualified_name = format!("{}.{}", scope.container, name);
        let (start, end) = span(node);
        let mut raw = RawNode::new(NodeType::Class, name, qualified_name.clone()).lines(start, end);

        let mut bases = Vec::new();
        if let Some(superclasses) = node.child_by_field_name("superclasses") {
            let mut cursor = superclasses.walk();
            for base in superclasses.named_children(&mut cursor) {
                if matches!(base.kind(), "identifier" | "attribute") {
                    bases.push(text(base, self.source).to_string());
                    self.references.push(Reference {
                        source: qualified_name.clone(),
                        callee: text(base, self.source).to_string(),
                        class: None,
                        edge_type: EdgeType::Uses,
                        line: start,
                    });
                }
            }
        }
        if !bases.is_empty() {
            raw.metadata.insert("bases".to_string(), MetaValue::from(bases));
        }
        if !decorators.is_empty() {
            raw.metadata
                .insert("decorators".to_string(), MetaValue::from(decorators));
        }
        self.define(raw, scope, start);

        if let Some(body) = node.child_by_field_name("body") {
            let inner = Scope {
                container: qualified_name.clone(),
                owner: qualified_name.clone(),
                class: Some(qualified_name),
                kind: ScopeKind::Class,
            };
            self.visit_children(body, &inner);
        }
    }

    fn variable(&mut self, node: Node, scope: &Scope) {
        let Some(left) = node.child_by_field_name("left") else {
            return;
        };
        if left.kind() != "identifier" {
            return;
        }
        let name = text(left, self.source);
        let qualified_name = format!("{}.{}", scope.container, name);
        if self.nodes.iter().any(|n| n.qualified_name == qualified_name) {
            return;
        }
        let (start, end) = span(node);
        let raw = RawNode::new(NodeType::Variable, name, qualified_name).lines(start, end);
        self.define(raw, scope, start);
    }

    fn decorators(&self, node: Node) -> Vec<String> {
        let mut cursor = node.walk();
        node.named_children(&mut cursor)
            .filter(|child| child.kind() == "decorator")
            .map(|child| {
                let raw = text(child, self.source).trim_start_matches('@').trim();
                raw.split('(').next().unwrap_or(raw).trim().to_string()
            })
            .collect()
    }

    fn parameters(&self, node: Node) -> Vec<String> {
        let mut cursor = node.walk();
        node.named_children(&mut cursor)
            .filter_map(|param| {
                let name = match param.kind() {
                    "identifier" => Some(param),
                    "default_parameter" | "typed_default_parameter" => param.child_by_field_name("name"),
                    "typed_parameter" | "list_splat_pattern" | "dictionary_splat_pattern" => param
                        .named_children(&mut param.walk())
                        .find(|c| c.kind() == "identifier"),
                    _ => None,
                }?;
                let name = text(name, self.source);
                (!matches!(name, "self" | "cls")).then(|| name.to_string())
            })
            .collect()
    }

    fn import(&mut self, node: Node, scope: &Scope) {
        let line = point_to_line(node.start_position());
        let mut cursor = node.walk();
        let names: Vec<Node> = node.children_by_field_name("name", &mut cursor).collect();
        for name in names {
            let (target, alias) = match name.kind() {
                "aliased_import" => (
                    field_text(name, "name", self.source).unwrap_or_default().to_string(),
                    field_text(name, "alias", self.source).map(str::to_string),
                ),
                _ => (text(name, self.source).to_string(), None),
            };
            if target.is_empty() {
                continue;
            }
            // `import a.b` binds `a`; `import a.b as c` binds `c` to `a.b`.
            match alias {
                Some(alias) => self.aliases.insert(alias, target.clone()),
                None => {
                    let head = target.split('.').next().unwrap_or(&target).to_string();
                    self.aliases.insert(head.clone(), head)
                }
            };
            self.edges
                .insert(RawEdge::new(scope.owner.clone(), target, EdgeType::Imports).at(line));
        }
    }

    fn import_from(&mut self, node: Node, scope: &Scope) {
        let line = point_to_line(node.start_position());
        let Some(module_node) = node.child_by_field_name("module_name") else {
            return;
        };
        let module = match module_node.kind() {
            "relative_import" => self.resolve_relative(text(module_node, self.source)),
            _ => text(module_node, self.source).to_string(),
        };
        if module.is_empty() {
            return;
        }
        self.edges
            .insert(RawEdge::new(scope.owner.clone(), module.clone(), EdgeType::Imports).at(line));

        let mut cursor = node.walk();
        let names: Vec<Node> = node.children_by_field_name("name", &mut cursor).collect();
        for name in names {
            let (imported, alias) = match name.kind() {
                "aliased_import" => (
                    field_text(name, "name", self.source).unwrap_or_default(),
                    field_text(name, "alias", self.source),
                ),
                _ => (text(name, self.source), None),
            };
            if imported.is_empty() {
                continue;
            }
            let local = alias.unwrap_or(imported).to_string();
            self.aliases.insert(local, format!("{}.{}", module, imported));
        }
    }

    /// `.`/`..` prefixed module paths relative to the current package.
    fn resolve_relative(&self, relative: &str) -> String {
        let dots = relative.chars().take_while(|c| *c == '.').count();
        let rest = &relative[dots..];
        let mut package: Vec<&str> = self.module.split('.').collect();
        if !self.is_package {
            package.pop();
        }
        for _ in 1..dots {
            package.pop();
        }
        if !rest.is_empty() {
            package.push(rest);
        }
        package.join(".")
    }

    fn reference(&mut self, target: Node, at: Node, edge_type: EdgeType, scope: &Scope) {
        if !matches!(target.kind(), "identifier" | "attribute") {
            return;
        }
        let callee: String = text(target, self.source)
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        if callee.is_empty() || callee.contains(['(', '[']) {
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

    /// Map a dotted reference onto the name it most likely denotes.
    fn resolve(&self, callee: &str, class: Option<&str>) -> String {
        let (head, rest) = match callee.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (callee, None),
        };
        if matches!(head, "self" | "cls") {
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
        let references = std::mem::take(&mut self.references);
        for reference in references {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(path: &str, code: &str) -> ExtractionResult {
        PythonExtractor.extract(Path::new(path), code).unwrap()
    }

    fn has_edge(result: &ExtractionResult, source: &str, target: &str, edge_type: EdgeType) -> bool {
        result
            .edges
            .iter()
            .any(|e| e.source_ref == source && e.target_ref == target && e.edge_type == edge_type)
    }

    #[test]
    fn test_extract_python_definitions() {
        let code = r#"
import os
from b import bar as baz

LIMIT = 10

@cached
def foo(user_id, retries=3, *args, **kwargs):
    return baz(user_id)

class Service(Base):
    def run(self, job):
        self.prepare(job)
        return foo(job)

    def prepare(self, job):
        os.path.join("a", job)
"#;
        let result = extract("a.py", code);
        let names: Vec<&str> = result.nodes.iter().map(|n| n.qualified_name.as_str()).collect();
        assert_eq!(
            names,
            vec!["a", "a.LIMIT", "a.foo", "a.Service", "a.Service.run", "a.Service.prepare"]
        );

        let foo = &result.nodes[2];
        assert_eq!(foo.start_line, 8);
        assert_eq!(foo.end_line, 9);
        assert_eq!(
            foo.metadata.get("parameters"),
            Some(&MetaValue::from(vec![
                "user_id".to_string(),
                "retries".to_string(),
                "args".to_string(),
                "kwargs".to_string()
            ]))
        );
        assert_eq!(foo.metadata.get("decorators"), Some(&MetaValue::from(vec!["cached".to_string()])));

        assert!(has_edge(&result, "a", "a.foo", EdgeType::Defines));
        assert!(has_edge(&result, "a.Service", "a.Service.run", EdgeType::Contains));
        assert!(has_edge(&result, "a", "b", EdgeType::Imports));
        assert!(has_edge(&result, "a", "os", EdgeType::Imports));
        assert!(has_edge(&result, "a.foo", "b.bar", EdgeType::Calls));
        assert!(has_edge(&result, "a.Service.run", "a.Service.prepare", EdgeType::Calls));
        assert!(has_edge(&result, "a.Service.run", "a.foo", EdgeType::Calls));
        assert!(has_edge(&result, "a.Service.prepare", "os.path.join", EdgeType::Calls));
        assert!(has_edge(&result, "a.Service", "Base", EdgeType::Uses));
    }

    #[test]
    fn test_relative_imports() {
        let result = extract("pkg/views.py", "from .models import User\n\ndef show():\n    User()\n");
        assert!(has_edge(&result, "pkg.views", "pkg.models", EdgeType::Imports));
        assert!(has_edge(&result, "pkg.views.show", "pkg.models.User", EdgeType::Calls));

        let result = extract("pkg/__init__.py", "from . import views\n\ndef boot():\n    views.render()\n");
        assert!(has_edge(&result, "pkg.boot", "pkg.views.render", EdgeType::Calls));
    }

    #[test]
    fn test_syntax_error_is_reported() {
        let err = PythonExtractor
            .extract(Path::new("bad.py"), "def ok():\n    pass\n\ndef broken(:\n")
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Parse { line, .. } if line >= 4));
    }

    #[test]
    fn test_empty_file_yields_module_only() {
        let result = extract("empty.py", "");
        assert_eq!(result.nodes.len(), 1);
        assert_eq!(result.nodes[0].node_type, NodeType::Module);
        assert!(result.edges.is_empty());
    }
}
