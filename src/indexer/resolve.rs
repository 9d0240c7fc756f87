use crate::indexer::extract::join;
use crate::model::{EdgeKind, GraphEdge, GraphNode, NodeId, NodeKind};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A reference whose target was not known when its file was parsed.
#[derive(Debug, Clone)]
pub struct DeferredEdge {
    pub source: NodeId,
    pub file: String,
    pub separator: &'static str,
    pub line: i64,
    pub target: Pending,
}

#[derive(Debug, Clone)]
pub enum Pending {
    Symbol {
        kind: EdgeKind,
        name: String,
        qualifier: Option<String>,
        /// Enclosing qualified scopes, innermost first.
        scopes: Vec<String>,
    },
    Import {
        raw: String,
        candidates: Vec<String>,
    },
}

impl DeferredEdge {
    pub fn is_import(&self) -> bool {
        matches!(self.target, Pending::Import { .. })
    }

    /// Simple name the target must carry, if this is a symbol reference.
    pub fn symbol_name(&self) -> Option<&str> {
        match &self.target {
            Pending::Symbol { name, .. } => Some(name),
            Pending::Import { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
struct SymbolEntry {
    id: NodeId,
    kind: NodeKind,
    qualname: String,
    file: String,
}

/// Lookup tables over the declarations of one or more files.
#[derive(Debug, Default)]
pub struct SymbolTable {
    entries: Vec<SymbolEntry>,
    by_qualname: HashMap<String, Vec<usize>>,
    by_name: HashMap<String, Vec<usize>>,
    /// Module name -> file path -> File node id.
    modules: HashMap<String, BTreeMap<String, NodeId>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_nodes<'a>(nodes: impl IntoIterator<Item = &'a GraphNode>) -> Self {
        let mut table = Self::new();
        for node in nodes {
            table.insert_node(node);
        }
        table
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert_node(&mut self, node: &GraphNode) {
        if !node.kind.is_symbol() {
            return;
        }
        let index = self.entries.len();
        self.entries.push(SymbolEntry {
            id: node.id.clone(),
            kind: node.kind,
            qualname: node.qualname.clone(),
            file: node.file_path().to_string(),
        });
        self.by_qualname
            .entry(node.qualname.clone())
            .or_default()
            .push(index);
        self.by_name.entry(node.name.clone()).or_default().push(index);
    }

    pub fn insert_module(&mut self, module: &str, file: &str, file_id: &NodeId) {
        if module.is_empty() {
            return;
        }
        self.modules
            .entry(module.to_string())
            .or_default()
            .insert(file.to_string(), file_id.clone());
    }

    fn module_files(&self, module: &str) -> Option<&BTreeMap<String, NodeId>> {
        self.modules.get(module)
    }

    fn pick(&self, indices: &[usize], file: &str) -> Option<&SymbolEntry> {
        let mut matches: Vec<&SymbolEntry> = indices.iter().map(|&i| &self.entries[i]).collect();
        matches.sort_by(|a, b| (a.file.as_str(), &a.id).cmp(&(b.file.as_str(), &b.id)));
        matches
            .iter()
            .find(|entry| entry.file == file)
            .or_else(|| matches.first())
            .copied()
    }
}

/// Files each file imports, filled in as import edges resolve.
#[derive(Debug, Clone, Default)]
pub struct ImportMap {
    imports: HashMap<String, BTreeSet<String>>,
}

impl ImportMap {
    pub fn record(&mut self, file: &str, target: &str) {
        self.imports
            .entry(file.to_string())
            .or_default()
            .insert(target.to_string());
    }

    pub fn merge(&mut self, other: ImportMap) {
        for (file, targets) in other.imports {
            self.imports.entry(file).or_default().extend(targets);
        }
    }

    pub fn imports(&self, file: &str, target: &str) -> bool {
        self.imports
            .get(file)
            .is_some_and(|targets| targets.contains(target))
    }
}

#[derive(Debug, Default)]
pub struct Resolution {
    pub edges: Vec<GraphEdge>,
    pub unresolved: Vec<DeferredEdge>,
}

/// Resolve imports first so symbol lookups can prefer imported files, then
/// every symbol reference. Anything without a unique target stays unresolved.
pub fn resolve_deferred(
    table: &SymbolTable,
    imports: &mut ImportMap,
    deferred: Vec<DeferredEdge>,
) -> Resolution {
    let mut resolution = Resolution::default();
    let (import_edges, symbol_edges): (Vec<_>, Vec<_>) =
        deferred.into_iter().partition(DeferredEdge::is_import);

    for edge in import_edges {
        match resolve_import(table, &edge) {
            Some(targets) => {
                for (file, id) in targets {
                    imports.record(&edge.file, &file);
                    resolution
                        .edges
                        .push(GraphEdge::new(edge.source.clone(), id, EdgeKind::Imports));
                }
            }
            None => resolution.unresolved.push(edge),
        }
    }

    for edge in symbol_edges {
        match resolve_symbol(table, imports, &edge) {
            Some(target) if target == edge.source => {}
            Some(target) => {
                let kind = match &edge.target {
                    Pending::Symbol { kind, .. } => *kind,
                    Pending::Import { .. } => EdgeKind::Imports,
                };
                resolution
                    .edges
                    .push(GraphEdge::new(edge.source.clone(), target, kind));
            }
            None => resolution.unresolved.push(edge),
        }
    }
    resolution
}

/// Same-file pass: only exact scope matches, nothing that depends on other files.
pub fn resolve_local(table: &SymbolTable, deferred: Vec<DeferredEdge>) -> Resolution {
    let mut resolution = Resolution::default();
    for edge in deferred {
        let target = match &edge.target {
            Pending::Symbol {
                kind,
                name,
                qualifier,
                scopes,
            } => qualified_match(table, &edge, *kind, name, qualifier.as_deref(), scopes)
                .map(|entry| (entry.id.clone(), *kind)),
            Pending::Import { .. } => None,
        };
        match target {
            Some((target, _)) if target == edge.source => {}
            Some((target, kind)) => resolution
                .edges
                .push(GraphEdge::new(edge.source.clone(), target, kind)),
            None => resolution.unresolved.push(edge),
        }
    }
    resolution
}

fn resolve_import(table: &SymbolTable, edge: &DeferredEdge) -> Option<Vec<(String, NodeId)>> {
    let Pending::Import { candidates, .. } = &edge.target else {
        return None;
    };
    for candidate in candidates {
        if let Some(files) = table.module_files(candidate) {
            return Some(
                files
                    .iter()
                    .filter(|(file, _)| *file != &edge.file)
                    .map(|(file, id)| (file.clone(), id.clone()))
                    .collect(),
            );
        }
    }
    None
}

fn resolve_symbol(table: &SymbolTable, imports: &ImportMap, edge: &DeferredEdge) -> Option<NodeId> {
    let Pending::Symbol {
        kind,
        name,
        qualifier,
        scopes,
    } = &edge.target
    else {
        return None;
    };

    if let Some(entry) = qualified_match(table, edge, *kind, name, qualifier.as_deref(), scopes) {
        return Some(entry.id.clone());
    }

    let candidates: Vec<&SymbolEntry> = table
        .by_name
        .get(name.as_str())
        .map(|indices| {
            indices
                .iter()
                .map(|&i| &table.entries[i])
                .filter(|entry| accepts(*kind, entry.kind))
                .collect()
        })
        .unwrap_or_default();

    if let Some(qualifier) = qualifier.as_deref().filter(|q| !is_receiver(q)) {
        let last = qualifier.rsplit(edge.separator).next().unwrap_or(qualifier);
        let suffix = format!("{}{}{}{}", edge.separator, last, edge.separator, name);
        let narrowed: Vec<&&SymbolEntry> = candidates
            .iter()
            .filter(|entry| entry.qualname.ends_with(&suffix))
            .collect();
        if narrowed.len() == 1 {
            return Some(narrowed[0].id.clone());
        }
    }

    if candidates.len() == 1 {
        return Some(candidates[0].id.clone());
    }

    let same_file: Vec<&&SymbolEntry> = candidates
        .iter()
        .filter(|entry| entry.file == edge.file)
        .collect();
    if same_file.len() == 1 {
        return Some(same_file[0].id.clone());
    }
    let imported: Vec<&&SymbolEntry> = candidates
        .iter()
        .filter(|entry| imports.imports(&edge.file, &entry.file))
        .collect();
    if imported.len() == 1 {
        return Some(imported[0].id.clone());
    }
    None
}

fn qualified_match<'t>(
    table: &'t SymbolTable,
    edge: &DeferredEdge,
    kind: EdgeKind,
    name: &str,
    qualifier: Option<&str>,
    scopes: &[String],
) -> Option<&'t SymbolEntry> {
    let sep = edge.separator;
    let mut candidates: Vec<String> = Vec::new();
    match qualifier.filter(|q| !is_receiver(q)) {
        None => {
            candidates.extend(scopes.iter().map(|scope| join(scope, sep, name)));
        }
        Some(qualifier) => {
            let tail = join(qualifier, sep, name);
            candidates.extend(scopes.iter().map(|scope| join(scope, sep, &tail)));
            candidates.push(tail);
        }
    }
    for candidate in candidates {
        let Some(indices) = table.by_qualname.get(&candidate) else {
            continue;
        };
        let accepted: Vec<usize> = indices
            .iter()
            .copied()
            .filter(|&i| accepts(kind, table.entries[i].kind))
            .collect();
        if let Some(entry) = table.pick(&accepted, &edge.file) {
            return Some(entry);
        }
    }
    None
}

fn accepts(edge: EdgeKind, target: NodeKind) -> bool {
    match edge {
        EdgeKind::Calls => matches!(target, NodeKind::Function | NodeKind::Type),
        EdgeKind::References => target == NodeKind::Type,
        _ => false,
    }
}

fn is_receiver(qualifier: &str) -> bool {
    matches!(qualifier, "self" | "Self" | "this" | "cls")
}
