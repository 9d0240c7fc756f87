use crate::error::ParseError;
use crate::indexer::extract::{
    Declaration, LanguageAdapter, Syntax, extract_signature, field_text, new_parser, node_text,
};
use crate::model::NodeKind;
use std::path::Path;
use tree_sitter::{Node, Parser, Tree};

pub struct CSharpAdapter {
    parser: Parser,
}

impl CSharpAdapter {
    pub fn new() -> Result<Self, ParseError> {
        let parser = new_parser(tree_sitter_c_sharp::LANGUAGE.into(), "csharp")?;
        Ok(Self { parser })
    }
}

impl LanguageAdapter for CSharpAdapter {
    fn language(&self) -> &'static str {
        "csharp"
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
            "namespace_declaration" | "file_scoped_namespace_declaration" => {
                match field_text(node, "name", source) {
                    Some(name) => Syntax::Declaration(Declaration::new(NodeKind::Module, name)),
                    None => Syntax::Other,
                }
            }
            "class_declaration" | "struct_declaration" | "interface_declaration"
            | "enum_declaration" | "record_declaration" => match field_text(node, "name", source) {
                Some(name) => Syntax::Declaration(Declaration::new(NodeKind::Type, name)),
                None => Syntax::Other,
            },
            "method_declaration" | "constructor_declaration" | "local_function_statement" => {
                match field_text(node, "name", source) {
                    Some(name) => Syntax::Declaration(
                        Declaration::new(NodeKind::Function, name)
                            .with_signature(extract_signature(node, source)),
                    ),
                    None => Syntax::Other,
                }
            }
            "invocation_expression" => match field_text(node, "function", source) {
                Some(callee) => Syntax::Call(callee),
                None => Syntax::Other,
            },
            "object_creation_expression" => match field_text(node, "type", source) {
                Some(callee) => Syntax::Call(callee),
                None => Syntax::Other,
            },
            "using_directive" => match parse_using(&node_text(node, source)) {
                Some(target) => Syntax::Import(vec![target]),
                None => Syntax::Skip,
            },
            "expression_statement" | "return_statement" | "if_statement" | "for_statement"
            | "foreach_statement" | "while_statement" | "local_declaration_statement"
            | "throw_statement" | "try_statement" => Syntax::Statement,
            "comment" | "string_literal" | "verbatim_string_literal" | "raw_string_literal"
            | "attribute_list" => Syntax::Skip,
            _ => Syntax::Other,
        }
    }
}

/// Files are qualified by path; namespaces declared inside become Module nodes.
pub fn module_name_from_rel_path(rel_path: &str) -> String {
    let path = Path::new(rel_path);
    let mut parts: Vec<String> = path
        .components()
        .filter_map(|comp| comp.as_os_str().to_str().map(|s| s.to_string()))
        .collect();
    if parts.is_empty() {
        return "module".to_string();
    }
    let file = parts.pop().unwrap_or_default();
    let stem = Path::new(&file)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(&file)
        .to_string();
    if !stem.is_empty() {
        parts.push(stem);
    }
    if parts.is_empty() {
        "module".to_string()
    } else {
        parts.join("/")
    }
}

fn parse_using(text: &str) -> Option<String> {
    let cleaned = text.trim().trim_end_matches(';').trim();
    let rest = cleaned
        .strip_prefix("global using ")
        .or_else(|| cleaned.strip_prefix("using "))?
        .trim();
    let rest = rest.strip_prefix("static ").unwrap_or(rest).trim();
    let target = match rest.split_once('=') {
        Some((_, target)) => target.trim(),
        None => rest,
    };
    if target.is_empty() {
        None
    } else {
        Some(target.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn using_directives() {
        assert_eq!(parse_using("using System.IO;"), Some("System.IO".into()));
        assert_eq!(parse_using("using static Acme.Math;"), Some("Acme.Math".into()));
        assert_eq!(parse_using("using Io = System.IO;"), Some("System.IO".into()));
        assert_eq!(parse_using("global using Acme.Core;"), Some("Acme.Core".into()));
    }

    #[test]
    fn module_name_keeps_directories() {
        assert_eq!(module_name_from_rel_path("src/Services/Billing.cs"), "src/Services/Billing");
    }
}
