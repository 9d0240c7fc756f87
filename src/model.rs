use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Repository,
    File,
    Module,
    Type,
    Function,
    Statement,
    /// A line-aligned slice of a prose document.
    Chunk,
}

impl NodeKind {
    pub const ALL: [NodeKind; 7] = [
        NodeKind::Repository,
        NodeKind::File,
        NodeKind::Module,
        NodeKind::Type,
        NodeKind::Function,
        NodeKind::Statement,
        NodeKind::Chunk,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Repository => "repository",
            NodeKind::File => "file",
            NodeKind::Module => "module",
            NodeKind::Type => "type",
            NodeKind::Function => "function",
            NodeKind::Statement => "statement",
            NodeKind::Chunk => "chunk",
        }
    }

    /// Kinds that name something a query can point at.
    pub fn is_symbol(&self) -> bool {
        matches!(self, NodeKind::Module | NodeKind::Type | NodeKind::Function)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        NodeKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| format!("unknown node kind: {value}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Contains,
    Calls,
    References,
    Imports,
    DefinedIn,
    NextChunk,
}

impl EdgeKind {
    pub const ALL: [EdgeKind; 6] = [
        EdgeKind::Contains,
        EdgeKind::Calls,
        EdgeKind::References,
        EdgeKind::Imports,
        EdgeKind::DefinedIn,
        EdgeKind::NextChunk,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Contains => "contains",
            EdgeKind::Calls => "calls",
            EdgeKind::References => "references",
            EdgeKind::Imports => "imports",
            EdgeKind::DefinedIn => "defined_in",
            EdgeKind::NextChunk => "next_chunk",
        }
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EdgeKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        EdgeKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| format!("unknown edge kind: {value}"))
    }
}

/// Deterministic node identity, see `indexer::stable_id`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        NodeId(value.to_string())
    }
}

/// 1-based lines and columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpan {
    pub file: String,
    pub start_line: i64,
    pub start_col: i64,
    pub end_line: i64,
    pub end_col: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub name: String,
    pub qualname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<SourceSpan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub depth: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub repository: String,
    pub revision: String,
    /// Full source as ingested. Only File nodes carry it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl GraphNode {
    pub fn file_path(&self) -> &str {
        self.span.as_ref().map(|span| span.file.as_str()).unwrap_or("")
    }

    pub fn start_line(&self) -> i64 {
        self.span.as_ref().map(|span| span.start_line).unwrap_or(0)
    }

    pub fn end_line(&self) -> i64 {
        self.span.as_ref().map(|span| span.end_line).unwrap_or(0)
    }

    /// Ordering used wherever output must be deterministic: path, line, id.
    pub fn location_key(&self) -> (&str, i64, &str) {
        (self.file_path(), self.start_line(), self.id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: NodeId,
    pub target: NodeId,
    pub kind: EdgeKind,
}

impl GraphEdge {
    pub fn new(source: NodeId, target: NodeId, kind: EdgeKind) -> Self {
        Self {
            source,
            target,
            kind,
        }
    }
}

/// The id space a graph lives in: one repository at one revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphScope {
    pub repository: String,
    pub revision: String,
}

/// A repository checkout plus the revision its graph is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub root: PathBuf,
    pub revision: String,
}

pub const WORKTREE_REVISION: &str = "worktree";

impl RepositoryRef {
    /// Canonicalize `path` and pin the revision. Without an explicit revision the
    /// git HEAD is used, or `worktree` when the directory is not a git repository.
    pub fn open(path: &Path, revision: Option<&str>) -> anyhow::Result<Self> {
        let root = path
            .canonicalize()
            .map_err(|err| anyhow::anyhow!("open repository {}: {err}", path.display()))?;
        let revision = match revision {
            Some(value) => value.to_string(),
            None => crate::util::git_head_sha(&root)
                .unwrap_or_else(|| WORKTREE_REVISION.to_string()),
        };
        Ok(Self { root, revision })
    }

    /// The canonical root with forward slashes.
    pub fn key(&self) -> String {
        self.root.to_string_lossy().replace('\\', "/")
    }

    pub fn scope(&self) -> GraphScope {
        GraphScope {
            repository: self.key(),
            revision: self.revision.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestionSummary {
    pub repository: String,
    pub revision: String,
    pub files_processed: usize,
    pub files_skipped: usize,
    pub nodes: usize,
    pub edge_count: usize,
    pub unresolved_references: usize,
    pub truncated_nodes: usize,
    pub chunks_written: usize,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub skipped: Vec<SkippedFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkippedFile {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GraphOverview {
    pub repository: String,
    pub revision: String,
    pub nodes: BTreeMap<String, usize>,
    pub edges: BTreeMap<String, usize>,
    pub languages: BTreeMap<String, usize>,
}

/// Order-independent fingerprint of a scope's node and edge sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphDigest {
    pub nodes: usize,
    pub edges: usize,
    pub hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbor {
    pub node: GraphNode,
    pub distance: u32,
    pub via: GraphEdge,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextFragment {
    pub node_id: NodeId,
    pub kind: NodeKind,
    pub qualname: String,
    pub file_path: String,
    pub start_line: i64,
    pub end_line: i64,
    pub distance: u32,
    pub score: f64,
    pub estimated_tokens: usize,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedContext {
    pub query: String,
    pub scoring: String,
    pub token_budget: usize,
    pub used_tokens: usize,
    pub anchors: Vec<NodeId>,
    pub fragments: Vec<ContextFragment>,
    pub truncated: bool,
}

impl RetrievedContext {
    pub fn empty(query: &str, scoring: &str, token_budget: usize) -> Self {
        Self {
            query: query.to_string(),
            scoring: scoring.to_string(),
            token_budget,
            used_tokens: 0,
            anchors: Vec::new(),
            fragments: Vec::new(),
            truncated: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn render(&self) -> String {
        self.fragments
            .iter()
            .map(|fragment| fragment.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}
