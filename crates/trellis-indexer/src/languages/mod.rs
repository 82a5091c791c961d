//! Language extractors and the extension registry

pub mod javascript;
pub mod python;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

pub use javascript::{Dialect, JavaScriptExtractor};
pub use python::PythonExtractor;

use crate::extractor::Extractor;

/// Selects an [`Extractor`] by file extension.
#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    by_extension: HashMap<String, Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Python, JavaScript and TypeScript.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PythonExtractor));
        registry.register(Arc::new(JavaScriptExtractor::javascript()));
        registry.register(Arc::new(JavaScriptExtractor::typescript()));
        registry.register(Arc::new(JavaScriptExtractor::tsx()));
        registry
    }

    /// Register an extractor for every extension it declares, replacing earlier ones.
    pub fn register(&mut self, extractor: Arc<dyn Extractor>) {
        for ext in extractor.extensions() {
            self.by_extension.insert(ext.to_ascii_lowercase(), Arc::clone(&extractor));
        }
    }

    pub fn for_path(&self, path: &Path) -> Option<Arc<dyn Extractor>> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        self.by_extension.get(&ext).cloned()
    }

    pub fn supports(&self, path: &Path) -> bool {
        self.for_path(path).is_some()
    }

    pub fn extensions(&self) -> Vec<&str> {
        let mut extensions: Vec<&str> = self.by_extension.keys().map(String::as_str).collect();
        extensions.sort_unstable();
        extensions
    }
}

impl std::fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractorRegistry")
            .field("extensions", &self.extensions())
            .finish()
    }
}
