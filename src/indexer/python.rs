use crate::error::ParseError;
use crate::indexer::extract::{
    Declaration, LanguageAdapter, Syntax, extract_signature, field_text, new_parser, node_text,
};
use crate::model::NodeKind;
use std::path::Path;
use tree_sitter::{Node, Parser, Tree};

pub struct PythonAdapter {
    parser: Parser,
}

impl PythonAdapter {
    pub fn new() -> Result<Self, ParseError> {
        let parser = new_parser(tree_sitter_python::LANGUAGE.into(), "python")?;
        Ok(Self { parser })
    }
}

impl LanguageAdapter for PythonAdapter {
    fn language(&self) -> &'static str {
        "python"
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
            "function_definition" => match field_text(node, "name", source) {
                Some(name) => Syntax::Declaration(
                    Declaration::new(NodeKind::Function, name)
                        .with_signature(extract_signature(node, source)),
                ),
                None => Syntax::Other,
            },
            "class_definition" => match field_text(node, "name", source) {
                Some(name) => Syntax::Declaration(Declaration::new(NodeKind::Type, name)),
                None => Syntax::Other,
            },
            "call" => match field_text(node, "function", source) {
                Some(callee) => Syntax::Call(callee),
                None => Syntax::Other,
            },
            "import_statement" | "import_from_statement" => {
                Syntax::Import(parse_imports(&node_text(node, source)))
            }
            "type" => {
                let text = node_text(node, source);
                if is_dotted_identifier(&text) {
                    Syntax::Reference(text)
                } else {
                    Syntax::Other
                }
            }
            "expression_statement" | "return_statement" | "if_statement" | "for_statement"
            | "while_statement" | "try_statement" | "with_statement" | "raise_statement" => {
                Syntax::Statement
            }
            "comment" | "string" => Syntax::Skip,
            _ => Syntax::Other,
        }
    }

    fn import_candidates(&self, raw: &str, module: &str, rel_path: &str) -> Vec<String> {
        let base_package = base_package_parts(rel_path, module);
        let Some(absolute) = absolutize_module(raw, &base_package) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut current = absolute.as_str();
        loop {
            out.push(current.to_string());
            match current.rsplit_once('.') {
                Some((head, _)) if !head.is_empty() => current = head,
                _ => break,
            }
        }
        out
    }
}

pub fn module_name_from_rel_path(rel_path: &str) -> String {
    let path = Path::new(rel_path);
    let mut parts: Vec<String> = path
        .components()
        .filter_map(|comp| comp.as_os_str().to_str().map(|s| s.to_string()))
        .collect();
    if parts.is_empty() {
        return "__init__".to_string();
    }
    if parts.len() > 1 && parts.first().map(|part| part == "src").unwrap_or(false) {
        parts.remove(0);
    }
    let file = parts.pop().unwrap_or_default();
    let stem = Path::new(&file)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(&file)
        .to_string();
    if stem != "__init__" {
        parts.push(stem);
    }
    if parts.is_empty() {
        "__init__".to_string()
    } else {
        parts.join(".")
    }
}

fn is_dotted_identifier(text: &str) -> bool {
    !text.is_empty()
        && text
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|ch| ch.is_alphanumeric() || ch == '_'))
}

fn parse_imports(text: &str) -> Vec<String> {
    let cleaned = text.replace(['\n', '(', ')', '\\'], " ");
    let cleaned = cleaned.trim().trim_end_matches(';');
    if let Some(rest) = cleaned.strip_prefix("import ") {
        return rest
            .split(',')
            .filter_map(|part| part.split_whitespace().next().map(|s| s.to_string()))
            .collect();
    }
    if let Some(rest) = cleaned.strip_prefix("from ") {
        if let Some((module, names)) = rest.split_once(" import ") {
            let base = module.trim();
            return names
                .split(',')
                .filter_map(|part| {
                    let item = part.split_whitespace().next()?;
                    if item == "*" {
                        return Some(base.to_string());
                    }
                    if base.is_empty() {
                        Some(item.to_string())
                    } else if base.ends_with('.') {
                        Some(format!("{base}{item}"))
                    } else {
                        Some(format!("{base}.{item}"))
                    }
                })
                .collect();
        }
    }
    Vec::new()
}

fn base_package_parts(file_rel_path: &str, file_module: &str) -> Vec<String> {
    let is_init = Path::new(file_rel_path)
        .file_name()
        .and_then(|s| s.to_str())
        == Some("__init__.py");
    let parts: Vec<&str> = file_module
        .split('.')
        .filter(|part| !part.is_empty() && *part != "__init__")
        .collect();
    let keep = if is_init {
        parts.len()
    } else {
        parts.len().saturating_sub(1)
    };
    parts[..keep].iter().map(|part| part.to_string()).collect()
}

fn absolutize_module(candidate: &str, base_package: &[String]) -> Option<String> {
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return None;
    }
    if !trimmed.starts_with('.') {
        return Some(trimmed.to_string());
    }
    let dot_count = trimmed.chars().take_while(|ch| *ch == '.').count();
    let rest = &trimmed[dot_count..];
    let up = dot_count.saturating_sub(1);
    if up > base_package.len() {
        return None;
    }
    let mut parts: Vec<String> = base_package.to_vec();
    let keep = parts.len().saturating_sub(up);
    parts.truncate(keep);
    for segment in rest.split('.').filter(|part| !part.is_empty()) {
        parts.push(segment.to_string());
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_names() {
        assert_eq!(module_name_from_rel_path("pkg/__init__.py"), "pkg");
        assert_eq!(module_name_from_rel_path("pkg/util.py"), "pkg.util");
        assert_eq!(module_name_from_rel_path("src/pkg/util.py"), "pkg.util");
        assert_eq!(module_name_from_rel_path("app.py"), "app");
    }

    #[test]
    fn imports_parse() {
        assert_eq!(parse_imports("import os, pkg.util as u"), vec!["os", "pkg.util"]);
        assert_eq!(
            parse_imports("from pkg import (a,\n b)"),
            vec!["pkg.a", "pkg.b"]
        );
        assert_eq!(parse_imports("from . import helpers"), vec![".helpers"]);
    }

    #[test]
    fn relative_imports_resolve_against_package() {
        let adapter = PythonAdapter::new().unwrap();
        assert_eq!(
            adapter.import_candidates(".helpers", "pkg.service", "pkg/service.py"),
            vec!["pkg.helpers", "pkg"]
        );
        assert_eq!(
            adapter.import_candidates("..core.db", "pkg.api.views", "pkg/api/views.py"),
            vec!["pkg.core.db", "pkg.core", "pkg"]
        );
    }
}
