use crate::error::ParseError;
use crate::indexer::extract::{
    Declaration, LanguageAdapter, Syntax, extract_signature, field_text, new_parser, node_text,
    unquote,
};
use crate::model::NodeKind;
use std::path::Path;
use tree_sitter::{Node, Parser, Tree};

pub struct GoAdapter {
    parser: Parser,
}

impl GoAdapter {
    pub fn new() -> Result<Self, ParseError> {
        let parser = new_parser(tree_sitter_go::LANGUAGE.into(), "go")?;
        Ok(Self { parser })
    }
}

impl LanguageAdapter for GoAdapter {
    fn language(&self) -> &'static str {
        "go"
    }

    fn parse(&mut self, source: &str) -> Option<Tree> {
        self.parser.parse(source, None)
    }

    /// Go symbols are qualified by package directory, not by file.
    fn module_name(&self, rel_path: &str) -> String {
        module_name_from_rel_path(rel_path)
    }

    fn separator(&self) -> &'static str {
        "."
    }

    fn classify(&self, node: Node<'_>, source: &str) -> Syntax {
        match node.kind() {
            "function_declaration" => match field_text(node, "name", source) {
                Some(name) => Syntax::Declaration(
                    Declaration::new(NodeKind::Function, name)
                        .with_signature(extract_signature(node, source)),
                ),
                None => Syntax::Other,
            },
            "method_declaration" => match field_text(node, "name", source) {
                Some(name) => Syntax::Declaration(
                    Declaration::new(NodeKind::Function, name)
                        .with_signature(extract_signature(node, source))
                        .with_container(receiver_type(node, source)),
                ),
                None => Syntax::Other,
            },
            "type_spec" | "type_alias" => match field_text(node, "name", source) {
                Some(name) => Syntax::Declaration(Declaration::new(NodeKind::Type, name)),
                None => Syntax::Other,
            },
            "call_expression" => match field_text(node, "function", source) {
                Some(callee) => Syntax::Call(callee),
                None => Syntax::Other,
            },
            "import_spec" => match field_text(node, "path", source) {
                Some(path) => Syntax::Import(vec![unquote(&path)]),
                None => Syntax::Skip,
            },
            "type_identifier" => Syntax::Reference(node_text(node, source)),
            "expression_statement" | "return_statement" | "if_statement" | "for_statement"
            | "assignment_statement" | "short_var_declaration" | "go_statement"
            | "defer_statement" => Syntax::Statement,
            "comment" | "interpreted_string_literal" | "raw_string_literal" => Syntax::Skip,
            _ => Syntax::Other,
        }
    }

    /// Import paths are matched against package directories by their longest suffix.
    fn import_candidates(&self, raw: &str, _module: &str, _rel_path: &str) -> Vec<String> {
        let segments: Vec<&str> = raw.split('/').filter(|part| !part.is_empty()).collect();
        (0..segments.len())
            .map(|start| segments[start..].join("/"))
            .collect()
    }
}

pub fn module_name_from_rel_path(rel_path: &str) -> String {
    let path = Path::new(rel_path);
    let parts: Vec<String> = path
        .parent()
        .map(|parent| {
            parent
                .components()
                .filter_map(|comp| comp.as_os_str().to_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    if parts.is_empty() {
        "main".to_string()
    } else {
        parts.join("/")
    }
}

fn receiver_type(node: Node<'_>, source: &str) -> Option<String> {
    let receiver = node.child_by_field_name("receiver")?;
    let mut cursor = receiver.walk();
    let param = receiver
        .named_children(&mut cursor)
        .find(|child| child.kind() == "parameter_declaration")?;
    let raw = field_text(param, "type", source)?;
    let name = raw
        .trim_start_matches('*')
        .split('[')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();
    if name.is_empty() { None } else { Some(name) }
}
