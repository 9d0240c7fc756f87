use crate::error::ParseError;
use crate::indexer::csharp::CSharpAdapter;
use crate::indexer::extract::LanguageAdapter;
use crate::indexer::go::GoAdapter;
use crate::indexer::javascript::{Dialect, JavaScriptAdapter};
use crate::indexer::python::PythonAdapter;
use crate::indexer::rust::RustAdapter;
use std::collections::{BTreeMap, HashMap};

pub type AdapterFactory = fn() -> Result<Box<dyn LanguageAdapter>, ParseError>;

/// Language id -> adapter constructor. Parsers are not shareable across threads,
/// so each worker builds its own adapters through an `AdapterSet`.
#[derive(Clone)]
pub struct ParserRegistry {
    factories: BTreeMap<&'static str, AdapterFactory>,
}

impl ParserRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, language: &'static str, factory: AdapterFactory) {
        self.factories.insert(language, factory);
    }

    pub fn supports(&self, language: &str) -> bool {
        self.factories.contains_key(language)
    }

    pub fn languages(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    pub fn create(&self, language: &str) -> Option<Result<Box<dyn LanguageAdapter>, ParseError>> {
        self.factories.get(language).map(|factory| factory())
    }

    pub fn adapter_set(&self) -> AdapterSet<'_> {
        AdapterSet {
            registry: self,
            adapters: HashMap::new(),
        }
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("rust", || Ok(Box::new(RustAdapter::new()?)));
        registry.register("python", || Ok(Box::new(PythonAdapter::new()?)));
        registry.register("go", || Ok(Box::new(GoAdapter::new()?)));
        registry.register("csharp", || Ok(Box::new(CSharpAdapter::new()?)));
        registry.register("javascript", || {
            Ok(Box::new(JavaScriptAdapter::new(Dialect::JavaScript)?))
        });
        registry.register("typescript", || {
            Ok(Box::new(JavaScriptAdapter::new(Dialect::TypeScript)?))
        });
        registry.register("tsx", || Ok(Box::new(JavaScriptAdapter::new(Dialect::Tsx)?)));
        registry
    }
}

/// Lazily constructed adapters owned by one parsing worker.
pub struct AdapterSet<'r> {
    registry: &'r ParserRegistry,
    adapters: HashMap<String, Box<dyn LanguageAdapter>>,
}

impl AdapterSet<'_> {
    pub fn get(&mut self, language: &str, path: &str) -> Result<&mut dyn LanguageAdapter, ParseError> {
        if !self.adapters.contains_key(language) {
            let adapter = self
                .registry
                .create(language)
                .ok_or_else(|| ParseError::Unsupported {
                    path: path.to_string(),
                    language: language.to_string(),
                })??;
            self.adapters.insert(language.to_string(), adapter);
        }
        self.adapters
            .get_mut(language)
            .map(|adapter| adapter.as_mut() as &mut dyn LanguageAdapter)
            .ok_or_else(|| ParseError::Unsupported {
                path: path.to_string(),
                language: language.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_covers_scanned_languages() {
        let registry = ParserRegistry::default();
        for spec in crate::indexer::scan::language_specs().iter().filter(|spec| !spec.document) {
            assert!(registry.supports(spec.name), "missing adapter for {}", spec.name);
        }
    }

    #[test]
    fn adapter_set_reports_unsupported_language() {
        let registry = ParserRegistry::empty();
        let mut set = registry.adapter_set();
        let err = set.get("cobol", "a.cbl").err().unwrap();
        assert!(matches!(err, ParseError::Unsupported { .. }));
    }

    #[test]
    fn adapter_set_reuses_adapters() {
        let registry = ParserRegistry::default();
        let mut set = registry.adapter_set();
        assert_eq!(set.get("python", "a.py").unwrap().language(), "python");
        assert_eq!(set.get("tsx", "a.tsx").unwrap().language(), "tsx");
        assert_eq!(set.adapters.len(), 2);
    }
}
