use crate::error::ParseError;
use crate::indexer::extract::{
    Declaration, LanguageAdapter, Syntax, extract_signature, field_text, new_parser, node_text,
};
use crate::model::NodeKind;
use std::path::Path;
use tree_sitter::{Node, Parser, Tree};

pub struct RustAdapter {
    parser: Parser,
}

impl RustAdapter {
    pub fn new() -> Result<Self, ParseError> {
        let parser = new_parser(tree_sitter_rust::LANGUAGE.into(), "rust")?;
        Ok(Self { parser })
    }
}

impl LanguageAdapter for RustAdapter {
    fn language(&self) -> &'static str {
        "rust"
    }

    fn parse(&mut self, source: &str) -> Option<Tree> {
        self.parser.parse(source, None)
    }

    fn module_name(&self, rel_path: &str) -> String {
        module_name_from_rel_path(rel_path)
    }

    fn separator(&self) -> &'static str {
        "::"
    }

    fn classify(&self, node: Node<'_>, source: &str) -> Syntax {
        match node.kind() {
            "function_item" | "function_signature_item" => {
                match field_text(node, "name", source) {
                    Some(name) => Syntax::Declaration(
                        Declaration::new(NodeKind::Function, name)
                            .with_signature(extract_signature(node, source)),
                    ),
                    None => Syntax::Other,
                }
            }
            "struct_item" | "enum_item" | "union_item" | "trait_item" | "type_item" => {
                match field_text(node, "name", source) {
                    Some(name) => Syntax::Declaration(Declaration::new(NodeKind::Type, name)),
                    None => Syntax::Other,
                }
            }
            "mod_item" => {
                let Some(name) = field_text(node, "name", source) else {
                    return Syntax::Other;
                };
                if node.child_by_field_name("body").is_some() {
                    Syntax::Declaration(Declaration::new(NodeKind::Module, name))
                } else {
                    Syntax::Import(vec![format!("self::{name}")])
                }
            }
            "impl_item" => match node.child_by_field_name("type") {
                Some(type_node) => {
                    let type_name = normalize_type_path(&node_text(type_node, source));
                    let simple = type_name.rsplit("::").next().unwrap_or(&type_name);
                    if simple.is_empty() {
                        Syntax::Other
                    } else {
                        Syntax::Scope(simple.to_string())
                    }
                }
                None => Syntax::Other,
            },
            "use_declaration" => Syntax::Import(parse_use_declaration(&node_text(node, source))),
            "call_expression" => match field_text(node, "function", source) {
                Some(callee) => Syntax::Call(callee),
                None => Syntax::Other,
            },
            "type_identifier" => Syntax::Reference(node_text(node, source)),
            "expression_statement" | "let_declaration" => Syntax::Statement,
            "line_comment" | "block_comment" | "string_literal" | "raw_string_literal"
            | "attribute_item" | "inner_attribute_item" | "macro_definition" => Syntax::Skip,
            _ => Syntax::Other,
        }
    }

    fn import_candidates(&self, raw: &str, module: &str, _rel_path: &str) -> Vec<String> {
        let absolute = absolutize_use_path(raw, module);
        let mut out = Vec::new();
        let mut current = absolute.as_str();
        loop {
            out.push(current.to_string());
            match current.rsplit_once("::") {
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
        return "crate".to_string();
    }
    if parts.first().map(|part| part == "src").unwrap_or(false) {
        parts.remove(0);
    }
    let file = parts.pop().unwrap_or_default();
    let stem = Path::new(&file)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(&file)
        .to_string();
    match stem.as_str() {
        "lib" | "main" | "mod" => {}
        _ => parts.push(stem),
    }
    if parts.is_empty() {
        "crate".to_string()
    } else {
        format!("crate::{}", parts.join("::"))
    }
}

/// Rewrite `self::` and `super::` prefixes against the current module.
fn absolutize_use_path(raw: &str, module: &str) -> String {
    let raw = raw.trim().trim_start_matches("::");
    if let Some(rest) = raw.strip_prefix("self::") {
        return format!("{module}::{rest}");
    }
    let mut base = module.to_string();
    let mut rest = raw;
    let mut climbed = false;
    while let Some(next) = rest.strip_prefix("super::") {
        if let Some((parent, _)) = base.rsplit_once("::") {
            base = parent.to_string();
        }
        rest = next;
        climbed = true;
    }
    if climbed {
        format!("{base}::{rest}")
    } else {
        raw.to_string()
    }
}

fn normalize_type_path(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let mut cleaned = String::new();
    let mut depth = 0;
    for ch in trimmed.chars() {
        match ch {
            '<' => {
                depth += 1;
            }
            '>' => {
                if depth > 0 {
                    depth -= 1;
                }
            }
            _ if depth > 0 => {}
            _ => cleaned.push(ch),
        }
    }
    let cleaned = cleaned.replace(' ', "");
    cleaned.trim_start_matches('&').trim().to_string()
}

fn parse_use_declaration(text: &str) -> Vec<String> {
    let cleaned = text.replace('\n', " ");
    let cleaned = cleaned.trim().trim_end_matches(';');
    let rest = cleaned
        .strip_prefix("pub(crate) use ")
        .or_else(|| cleaned.strip_prefix("pub use "))
        .or_else(|| cleaned.strip_prefix("use "))
        .unwrap_or(cleaned)
        .trim();
    if rest.is_empty() {
        return Vec::new();
    }
    expand_use_tree(rest)
}

fn expand_use_tree(input: &str) -> Vec<String> {
    let input = input.trim();
    if input.is_empty() {
        return Vec::new();
    }
    if let Some((before, inner)) = split_outer_braces(input) {
        let base = before.trim().trim_end_matches("::").trim().to_string();
        let mut results = Vec::new();
        for item in split_top_level(inner.as_str(), ',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let combined = if base.is_empty() {
                item.to_string()
            } else if item == "self" {
                base.clone()
            } else {
                format!("{base}::{item}")
            };
            results.extend(expand_use_tree(&combined));
        }
        return results;
    }

    let main = match input.split_once(" as ") {
        Some((left, _)) => left.trim(),
        None => input,
    };
    let main = main.trim_end_matches("::*").trim_end_matches("::self");
    if main.is_empty() {
        Vec::new()
    } else {
        vec![main.to_string()]
    }
}

fn split_outer_braces(input: &str) -> Option<(String, String)> {
    let mut depth = 0;
    let mut start = None;
    for (idx, ch) in input.char_indices() {
        match ch {
            '{' => {
                if depth == 0 {
                    start = Some(idx);
                }
                depth += 1;
            }
            '}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        let start_idx = start?;
                        return Some((
                            input[..start_idx].to_string(),
                            input[start_idx + 1..idx].to_string(),
                        ));
                    }
                }
            }
            _ => {}
        }
    }
    None
}

fn split_top_level(input: &str, delimiter: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0;
    let mut start = 0;
    for (idx, ch) in input.char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                if depth > 0 {
                    depth -= 1;
                }
            }
            _ if ch == delimiter && depth == 0 => {
                parts.push(input[start..idx].to_string());
                start = idx + ch.len_utf8();
            }
            _ => {}
        }
    }
    if start <= input.len() {
        parts.push(input[start..].to_string());
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_names() {
        assert_eq!(module_name_from_rel_path("src/lib.rs"), "crate");
        assert_eq!(module_name_from_rel_path("src/store/mod.rs"), "crate::store");
        assert_eq!(module_name_from_rel_path("src/store/sqlite.rs"), "crate::store::sqlite");
    }

    #[test]
    fn use_trees_expand() {
        assert_eq!(
            parse_use_declaration("use crate::model::{GraphNode, NodeKind as Kind};"),
            vec!["crate::model::GraphNode", "crate::model::NodeKind"]
        );
        assert_eq!(
            parse_use_declaration("pub use crate::store::{self, memory::*};"),
            vec!["crate::store", "crate::store::memory"]
        );
    }

    #[test]
    fn import_candidates_resolve_relative_paths() {
        let adapter = RustAdapter::new().unwrap();
        assert_eq!(
            adapter.import_candidates("super::util::read", "crate::store::sqlite", "src/store/sqlite.rs"),
            vec!["crate::store::util::read", "crate::store::util", "crate::store", "crate"]
        );
        assert_eq!(
            adapter.import_candidates("self::memory", "crate::store", "src/store/mod.rs")[0],
            "crate::store::memory"
        );
    }
}
