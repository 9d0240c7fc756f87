use crate::error::ParseError;
use crate::model::{EdgeKind, NodeKind};
use std::collections::HashSet;
use tree_sitter::{Language, Node, Parser, Tree};

/// What a syntax node means to the graph builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Syntax {
    /// Creates a graph node; children are walked inside it.
    Declaration(Declaration),
    /// Qualifies the names of its children without a node of its own (e.g. a Rust `impl`).
    Scope(String),
    /// A call; the string is the raw callee expression.
    Call(String),
    /// A use of a type name.
    Reference(String),
    /// Raw import targets (module paths, relative specifiers).
    Import(Vec<String>),
    /// A statement inside a function body.
    Statement,
    /// Do not descend (comments, string literals).
    Skip,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub kind: NodeKind,
    pub name: String,
    /// Enclosing type named outside the AST nesting, e.g. a Go method receiver.
    pub container: Option<String>,
    pub signature: Option<String>,
}

impl Declaration {
    pub fn new(kind: NodeKind, name: String) -> Self {
        Self {
            kind,
            name,
            container: None,
            signature: None,
        }
    }

    pub fn with_signature(mut self, signature: Option<String>) -> Self {
        self.signature = signature;
        self
    }

    pub fn with_container(mut self, container: Option<String>) -> Self {
        self.container = container;
        self
    }
}

/// Per-language capability used by the builder. One implementation per language;
/// the registry selects one by language id.
pub trait LanguageAdapter: Send {
    fn language(&self) -> &'static str;

    fn parse(&mut self, source: &str) -> Option<Tree>;

    /// Module name of a file, the root qualifier of every symbol in it.
    fn module_name(&self, rel_path: &str) -> String;

    /// Separator between qualified name segments.
    fn separator(&self) -> &'static str;

    fn classify(&self, node: Node<'_>, source: &str) -> Syntax;

    /// Module names an import may refer to, most specific first.
    fn import_candidates(&self, raw: &str, _module: &str, _rel_path: &str) -> Vec<String> {
        let sep = self.separator();
        let mut out = Vec::new();
        let mut current = raw.trim().to_string();
        while !current.is_empty() {
            out.push(current.clone());
            match current.rsplit_once(sep) {
                Some((head, _)) => current = head.to_string(),
                None => break,
            }
        }
        out
    }
}

pub(crate) fn new_parser(language: Language, name: &str) -> Result<Parser, ParseError> {
    let mut parser = Parser::new();
    parser
        .set_language(&language)
        .map_err(|err| ParseError::Grammar {
            language: name.to_string(),
            message: err.to_string(),
        })?;
    Ok(parser)
}

#[derive(Debug, Clone, Copy)]
pub struct WalkOptions {
    pub max_depth: usize,
    pub statement_nodes: bool,
}

#[derive(Debug, Clone)]
pub struct SymbolInput {
    pub kind: NodeKind,
    pub name: String,
    pub qualname: String,
    pub start_line: i64,
    pub start_col: i64,
    pub end_line: i64,
    pub end_col: i64,
    /// Depth of the declaring syntax node below the file root.
    pub depth: u32,
    pub signature: Option<String>,
    /// Index of the enclosing symbol; `None` means the file itself.
    pub parent: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ReferenceInput {
    pub kind: EdgeKind,
    /// Index of the symbol the reference occurs in; `None` means the file.
    pub source: Option<usize>,
    pub name: String,
    pub qualifier: Option<String>,
    /// Qualified scopes enclosing the site, innermost first.
    pub scopes: Vec<String>,
    pub line: i64,
}

#[derive(Debug, Clone)]
pub struct ImportInput {
    pub raw: String,
    pub candidates: Vec<String>,
    pub line: i64,
}

#[derive(Debug, Clone)]
pub struct ExtractedFile {
    pub rel_path: String,
    pub language: String,
    pub module: String,
    pub separator: &'static str,
    pub line_count: i64,
    pub symbols: Vec<SymbolInput>,
    pub references: Vec<ReferenceInput>,
    pub imports: Vec<ImportInput>,
    /// Subtrees cut off by the depth bound.
    pub truncated_subtrees: usize,
}

#[derive(Clone)]
struct Context {
    parent: Option<usize>,
    qual: String,
    scopes: Vec<String>,
    source: Option<usize>,
    in_function: bool,
}

struct Frame<'t> {
    node: Node<'t>,
    depth: usize,
    ctx: usize,
}

/// Parse `source` and walk its tree depth-first. Nodes deeper than
/// `options.max_depth` are omitted together with their subtrees.
pub fn extract_file(
    adapter: &mut dyn LanguageAdapter,
    source: &str,
    rel_path: &str,
    options: &WalkOptions,
) -> Result<ExtractedFile, ParseError> {
    let tree = adapter.parse(source).ok_or_else(|| ParseError::NoTree {
        path: rel_path.to_string(),
    })?;
    let root = tree.root_node();
    if root.has_error() {
        return Err(ParseError::Syntax {
            path: rel_path.to_string(),
            line: first_error_line(root),
        });
    }

    let module = adapter.module_name(rel_path);
    let sep = adapter.separator();
    let mut output = ExtractedFile {
        rel_path: rel_path.to_string(),
        language: adapter.language().to_string(),
        module: module.clone(),
        separator: sep,
        line_count: line_count(source),
        symbols: Vec::new(),
        references: Vec::new(),
        imports: Vec::new(),
        truncated_subtrees: 0,
    };
    let mut containers: HashSet<String> = HashSet::new();
    let mut contexts = vec![Context {
        parent: None,
        qual: module.clone(),
        scopes: vec![module.clone()],
        source: None,
        in_function: false,
    }];
    let mut stack = vec![Frame {
        node: root,
        depth: 0,
        ctx: 0,
    }];

    while let Some(frame) = stack.pop() {
        if frame.depth > options.max_depth {
            output.truncated_subtrees += 1;
            continue;
        }
        let node = frame.node;
        let ctx = contexts[frame.ctx].clone();
        let mut child_ctx = frame.ctx;
        let mut skip_child = None;

        match adapter.classify(node, source) {
            Syntax::Declaration(decl) => {
                let base = match &decl.container {
                    Some(container) => join(&module, sep, container),
                    None => ctx.qual.clone(),
                };
                let qualname = join(&base, sep, &decl.name);
                let (start_line, start_col, end_line, end_col) = span(node);
                let index = output.symbols.len();
                output.symbols.push(SymbolInput {
                    kind: decl.kind,
                    name: decl.name.clone(),
                    qualname: qualname.clone(),
                    start_line,
                    start_col,
                    end_line,
                    end_col,
                    depth: frame.depth as u32,
                    signature: decl.signature,
                    parent: ctx.parent,
                });
                if decl.container.is_some() {
                    containers.insert(base.clone());
                }
                let mut scopes = vec![qualname.clone()];
                if decl.container.is_some() {
                    scopes.push(base);
                }
                scopes.extend(ctx.scopes.iter().cloned());
                contexts.push(Context {
                    parent: Some(index),
                    qual: qualname,
                    scopes,
                    source: Some(index),
                    in_function: ctx.in_function || decl.kind == NodeKind::Function,
                });
                child_ctx = contexts.len() - 1;
                skip_child = node.child_by_field_name("name").map(|name| name.id());
            }
            Syntax::Scope(name) => {
                let qual = join(&ctx.qual, sep, &name);
                let mut scopes = vec![qual.clone()];
                scopes.extend(ctx.scopes.iter().cloned());
                contexts.push(Context {
                    parent: ctx.parent,
                    qual: qual.clone(),
                    scopes,
                    source: ctx.source,
                    in_function: ctx.in_function,
                });
                child_ctx = contexts.len() - 1;
                containers.insert(qual);
            }
            Syntax::Call(raw) => {
                if let Some((qualifier, name)) = split_callee(&raw) {
                    output.references.push(ReferenceInput {
                        kind: EdgeKind::Calls,
                        source: ctx.source,
                        name,
                        qualifier,
                        scopes: ctx.scopes.clone(),
                        line: span(node).0,
                    });
                }
            }
            Syntax::Reference(raw) => {
                if let Some((qualifier, name)) = split_callee(&raw) {
                    output.references.push(ReferenceInput {
                        kind: EdgeKind::References,
                        source: ctx.source,
                        name,
                        qualifier,
                        scopes: ctx.scopes.clone(),
                        line: span(node).0,
                    });
                }
                continue;
            }
            Syntax::Import(targets) => {
                let line = span(node).0;
                for raw in targets {
                    let candidates = adapter.import_candidates(&raw, &module, rel_path);
                    output.imports.push(ImportInput {
                        raw,
                        candidates,
                        line,
                    });
                }
                continue;
            }
            Syntax::Statement if options.statement_nodes && ctx.in_function => {
                let (start_line, start_col, end_line, end_col) = span(node);
                let name = format!("{}@{}:{}", node.kind(), start_line, start_col);
                let qualname = join(&ctx.qual, sep, &name);
                let index = output.symbols.len();
                output.symbols.push(SymbolInput {
                    kind: NodeKind::Statement,
                    name,
                    qualname,
                    start_line,
                    start_col,
                    end_line,
                    end_col,
                    depth: frame.depth as u32,
                    signature: None,
                    parent: ctx.parent,
                });
                let mut stmt_ctx = ctx.clone();
                stmt_ctx.parent = Some(index);
                contexts.push(stmt_ctx);
                child_ctx = contexts.len() - 1;
            }
            Syntax::Skip => continue,
            Syntax::Statement | Syntax::Other => {}
        }

        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.named_children(&mut cursor).collect();
        for child in children.into_iter().rev() {
            if Some(child.id()) == skip_child {
                continue;
            }
            stack.push(Frame {
                node: child,
                depth: frame.depth + 1,
                ctx: child_ctx,
            });
        }
    }

    attach_to_containers(&mut output, &containers);
    Ok(output)
}

/// Symbols declared under a `Scope` or with an explicit container are
/// re-parented to the type of that name when the same file declares it.
fn attach_to_containers(output: &mut ExtractedFile, containers: &HashSet<String>) {
    if containers.is_empty() {
        return;
    }
    let sep = output.separator;
    let types: Vec<(usize, String)> = output
        .symbols
        .iter()
        .enumerate()
        .filter(|(_, symbol)| symbol.kind == NodeKind::Type && containers.contains(&symbol.qualname))
        .map(|(index, symbol)| (index, symbol.qualname.clone()))
        .collect();
    for symbol_index in 0..output.symbols.len() {
        let Some((prefix, _)) = output.symbols[symbol_index].qualname.rsplit_once(sep) else {
            continue;
        };
        let owner = types
            .iter()
            .find(|(index, qualname)| *index != symbol_index && qualname == prefix)
            .map(|(index, _)| *index);
        if let Some(owner) = owner {
            output.symbols[symbol_index].parent = Some(owner);
        }
    }
}

pub(crate) fn join(base: &str, sep: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{base}{sep}{name}")
    }
}

/// Split a raw callee into (qualifier, simple name). Returns `None` when the
/// callee is not a plain name path (closures, indexing, parenthesized exprs).
pub fn split_callee(raw: &str) -> Option<(Option<String>, String)> {
    let cleaned = strip_generics(raw.trim());
    let cleaned = cleaned.trim_start_matches('&').trim_start_matches('*');
    let (qualifier, name) = if let Some((left, right)) = cleaned.rsplit_once("::") {
        (Some(left.to_string()), right.to_string())
    } else if let Some((left, right)) = cleaned.rsplit_once('.') {
        (Some(left.to_string()), right.to_string())
    } else {
        (None, cleaned.to_string())
    };
    let name = name.trim().to_string();
    if name.is_empty()
        || !name
            .chars()
            .all(|ch| ch.is_alphanumeric() || ch == '_' || ch == '$')
        || name.chars().next().is_some_and(|ch| ch.is_ascii_digit())
    {
        return None;
    }
    Some((qualifier.filter(|q| !q.is_empty()), name))
}

fn strip_generics(raw: &str) -> String {
    let mut cleaned = String::with_capacity(raw.len());
    let mut depth = 0usize;
    for ch in raw.chars() {
        match ch {
            '<' | '[' => depth += 1,
            '>' | ']' => depth = depth.saturating_sub(1),
            _ if depth > 0 => {}
            _ => cleaned.push(ch),
        }
    }
    cleaned.replace("::::", "::").trim_end_matches("::").trim().to_string()
}

pub(crate) fn span(node: Node<'_>) -> (i64, i64, i64, i64) {
    let start = node.start_position();
    let end = node.end_position();
    (
        start.row as i64 + 1,
        start.column as i64 + 1,
        end.row as i64 + 1,
        end.column as i64 + 1,
    )
}

pub(crate) fn node_text(node: Node<'_>, source: &str) -> String {
    let start = node.start_byte();
    let end = node.end_byte();
    source.get(start..end).unwrap_or("").trim().to_string()
}

pub(crate) fn field_text(node: Node<'_>, field: &str, source: &str) -> Option<String> {
    node.child_by_field_name(field)
        .map(|child| node_text(child, source))
        .filter(|text| !text.is_empty())
}

/// `(params) -> ret` from the conventional tree-sitter field names.
pub(crate) fn extract_signature(node: Node<'_>, source: &str) -> Option<String> {
    let params = field_text(node, "parameters", source);
    let return_type = field_text(node, "return_type", source)
        .or_else(|| field_text(node, "result", source));
    match (params, return_type) {
        (Some(p), Some(r)) => Some(format!("{p} -> {}", r.trim_start_matches("->").trim())),
        (Some(p), None) => Some(p),
        _ => None,
    }
}

pub(crate) fn unquote(raw: &str) -> String {
    raw.trim()
        .trim_matches(|ch| ch == '"' || ch == '\'' || ch == '`')
        .to_string()
}

fn first_error_line(node: Node<'_>) -> usize {
    let mut stack = vec![node];
    while let Some(current) = stack.pop() {
        if current.is_error() || current.is_missing() {
            return current.start_position().row + 1;
        }
        let mut cursor = current.walk();
        let children: Vec<Node<'_>> = current.children(&mut cursor).collect();
        for child in children.into_iter().rev() {
            if child.has_error() || child.is_missing() {
                stack.push(child);
            }
        }
    }
    node.start_position().row + 1
}

pub fn line_count(source: &str) -> i64 {
    let count = source.lines().count();
    if count == 0 { 1 } else { count as i64 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_callee_handles_paths_and_receivers() {
        assert_eq!(split_callee("helper"), Some((None, "helper".into())));
        assert_eq!(
            split_callee("self.helper"),
            Some((Some("self".into()), "helper".into()))
        );
        assert_eq!(
            split_callee("crate::util::read::<String>"),
            Some((Some("crate::util".into()), "read".into()))
        );
        assert_eq!(
            split_callee("Vec::<u8>::new"),
            Some((Some("Vec".into()), "new".into()))
        );
        assert_eq!(split_callee("(make())"), None);
        assert_eq!(split_callee("items[0]"), Some((None, "items".into())));
    }

    #[test]
    fn join_skips_empty_base() {
        assert_eq!(join("", "::", "a"), "a");
        assert_eq!(join("crate", "::", "a"), "crate::a");
    }
}
