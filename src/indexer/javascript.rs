use crate::error::ParseError;
use crate::indexer::extract::{
    Declaration, LanguageAdapter, Syntax, extract_signature, field_text, new_parser, node_text,
    unquote,
};
use crate::model::NodeKind;
use crate::util::normalize_path;
use std::path::{Path, PathBuf};
use tree_sitter::{Node, Parser, Tree};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    JavaScript,
    TypeScript,
    Tsx,
}

impl Dialect {
    fn language_id(self) -> &'static str {
        match self {
            Dialect::JavaScript => "javascript",
            Dialect::TypeScript => "typescript",
            Dialect::Tsx => "tsx",
        }
    }
}

/// One adapter for the JavaScript family; the dialect selects the grammar.
pub struct JavaScriptAdapter {
    parser: Parser,
    dialect: Dialect,
}

impl JavaScriptAdapter {
    pub fn new(dialect: Dialect) -> Result<Self, ParseError> {
        let language = match dialect {
            Dialect::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
            Dialect::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            Dialect::Tsx => tree_sitter_typescript::LANGUAGE_TSX.into(),
        };
        let parser = new_parser(language, dialect.language_id())?;
        Ok(Self { parser, dialect })
    }
}

impl LanguageAdapter for JavaScriptAdapter {
    fn language(&self) -> &'static str {
        self.dialect.language_id()
    }

    fn parse(&mut self, source: &str) -> Option<Tree> {
        self.parser.parse(source, None)
    }

    fn module_name(&self, rel_path: &str) -> String {
        module_name_from_rel_path(rel_path)
    }

    fn separator(&self) -> &'static str {
        "."
    }

    fn classify(&self, node: Node<'_>, source: &str) -> Syntax {
        match node.kind() {
            "function_declaration" | "generator_function_declaration" | "method_definition"
            | "function_signature" | "method_signature" | "abstract_method_signature" => {
                match field_text(node, "name", source) {
                    Some(name) => Syntax::Declaration(
                        Declaration::new(NodeKind::Function, name)
                            .with_signature(extract_signature(node, source)),
                    ),
                    None => Syntax::Other,
                }
            }
            "variable_declarator" => {
                let value = node.child_by_field_name("value");
                let is_function = value.is_some_and(|value| {
                    matches!(
                        value.kind(),
                        "arrow_function" | "function_expression" | "function"
                    )
                });
                match (is_function, field_text(node, "name", source)) {
                    (true, Some(name)) => Syntax::Declaration(
                        Declaration::new(NodeKind::Function, name)
                            .with_signature(value.and_then(|v| extract_signature(v, source))),
                    ),
                    _ => Syntax::Other,
                }
            }
            "class_declaration" | "abstract_class_declaration" | "interface_declaration"
            | "type_alias_declaration" | "enum_declaration" => {
                match field_text(node, "name", source) {
                    Some(name) => Syntax::Declaration(Declaration::new(NodeKind::Type, name)),
                    None => Syntax::Other,
                }
            }
            "internal_module" | "module" => match field_text(node, "name", source) {
                Some(name) => Syntax::Declaration(Declaration::new(NodeKind::Module, unquote(&name))),
                None => Syntax::Other,
            },
            "call_expression" => match field_text(node, "function", source) {
                Some(callee) if callee != "require" => Syntax::Call(callee),
                _ => Syntax::Other,
            },
            "new_expression" => match field_text(node, "constructor", source) {
                Some(callee) => Syntax::Call(callee),
                None => Syntax::Other,
            },
            "import_statement" | "export_statement" => match field_text(node, "source", source) {
                Some(specifier) => Syntax::Import(vec![unquote(&specifier)]),
                None if node.kind() == "import_statement" => Syntax::Skip,
                None => Syntax::Other,
            },
            "type_identifier" => Syntax::Reference(node_text(node, source)),
            "expression_statement" | "return_statement" | "if_statement" | "for_statement"
            | "for_in_statement" | "while_statement" | "lexical_declaration"
            | "variable_declaration" | "throw_statement" | "try_statement" => Syntax::Statement,
            "comment" | "string" | "template_string" | "regex" => Syntax::Skip,
            _ => Syntax::Other,
        }
    }

    /// Relative specifiers resolve against the importing file's directory;
    /// bare package specifiers never match a repository file.
    fn import_candidates(&self, raw: &str, _module: &str, rel_path: &str) -> Vec<String> {
        let raw = raw.trim();
        if !raw.starts_with('.') {
            return vec![raw.to_string()];
        }
        let dir = Path::new(rel_path).parent().unwrap_or(Path::new(""));
        let mut joined = PathBuf::new();
        for comp in dir.join(raw).components() {
            match comp {
                std::path::Component::ParentDir => {
                    joined.pop();
                }
                std::path::Component::CurDir => {}
                other => joined.push(other.as_os_str()),
            }
        }
        vec![module_name_from_rel_path(&normalize_path(&joined))]
    }
}

pub fn module_name_from_rel_path(rel_path: &str) -> String {
    let path = Path::new(rel_path);
    let mut parts: Vec<String> = path
        .components()
        .filter_map(|comp| comp.as_os_str().to_str().map(|s| s.to_string()))
        .collect();
    if parts.is_empty() {
        return "index".to_string();
    }
    let file = parts.pop().unwrap_or_default();
    let mut stem = match file.rsplit_once('.') {
        Some((stem, ext)) if is_script_extension(ext) => stem.to_string(),
        _ => file.clone(),
    };
    if stem.ends_with(".d") {
        stem.truncate(stem.len() - 2);
    }
    if stem != "index" {
        parts.push(stem);
    }
    if parts.is_empty() {
        "index".to_string()
    } else {
        parts.join("/")
    }
}

fn is_script_extension(ext: &str) -> bool {
    matches!(
        ext,
        "js" | "jsx" | "mjs" | "cjs" | "ts" | "mts" | "cts" | "tsx"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_names_drop_extension_and_index() {
        assert_eq!(module_name_from_rel_path("src/util.ts"), "src/util");
        assert_eq!(module_name_from_rel_path("src/api/index.js"), "src/api");
        assert_eq!(module_name_from_rel_path("types/global.d.ts"), "types/global");
        assert_eq!(module_name_from_rel_path("src/util"), "src/util");
    }

    #[test]
    fn relative_specifiers_resolve() {
        let adapter = JavaScriptAdapter::new(Dialect::JavaScript).unwrap();
        assert_eq!(
            adapter.import_candidates("./util", "src/app", "src/app.js"),
            vec!["src/util"]
        );
        assert_eq!(
            adapter.import_candidates("../lib/index.js", "src/app", "src/app.js"),
            vec!["lib"]
        );
        assert_eq!(
            adapter.import_candidates("react", "src/app", "src/app.js"),
            vec!["react"]
        );
    }
}
