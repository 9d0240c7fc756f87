//! Graph persistence contract and its implementations.
//!
//! Node ids are deterministic, so every operation here is idempotent under retry.
//! The only strong guarantee is within-batch atomicity: `write_batch` either
//! persists all of its nodes and edges or none of them.

use crate::error::StoreError;
use crate::model::{
    EdgeKind, GraphDigest, GraphEdge, GraphNode, GraphOverview, GraphScope, Neighbor, NodeId,
    NodeKind,
};
use blake3::Hasher;

pub mod memory;
mod migrations;
pub mod sqlite;
mod traverse;

pub use memory::MemoryGraphStore;
pub use sqlite::SqliteGraphStore;

/// Rows affected by one `write_batch`; replays report zeros.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub nodes_inserted: usize,
    pub edges_inserted: usize,
}

/// Name pattern for `find_by_name`. `*` matches any run of characters and
/// matching is case-insensitive. Patterns containing `/` or `::` are matched
/// against the qualified name instead of the simple name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePattern {
    raw: String,
}

impl NamePattern {
    pub fn new(raw: &str) -> Self {
        Self {
            raw: raw.trim().to_string(),
        }
    }

    pub fn exact(name: &str) -> Self {
        Self::new(&name.replace('*', ""))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.raw.trim_matches('*').is_empty()
    }

    pub fn targets_qualname(&self) -> bool {
        self.raw.contains('/') || self.raw.contains("::")
    }

    pub fn matches_node(&self, node: &GraphNode) -> bool {
        if self.targets_qualname() {
            self.matches(&node.qualname)
        } else {
            self.matches(&node.name)
        }
    }

    pub fn matches(&self, candidate: &str) -> bool {
        let pattern = self.raw.to_lowercase();
        let candidate = candidate.to_lowercase();
        let parts: Vec<&str> = pattern.split('*').collect();
        if parts.len() == 1 {
            return pattern == candidate;
        }
        let mut rest = candidate.as_str();
        let last = parts.len() - 1;
        for (index, part) in parts.iter().enumerate() {
            if part.is_empty() {
                continue;
            }
            if index == 0 {
                match rest.strip_prefix(part) {
                    Some(next) => rest = next,
                    None => return false,
                }
            } else if index == last {
                return rest.ends_with(part);
            } else {
                match rest.find(part) {
                    Some(pos) => rest = &rest[pos + part.len()..],
                    None => return false,
                }
            }
        }
        true
    }

    /// SQL LIKE form with `\` as the escape character.
    pub fn to_like(&self) -> String {
        let mut out = String::with_capacity(self.raw.len());
        for ch in self.raw.chars() {
            match ch {
                '*' => out.push('%'),
                '%' | '_' | '\\' => {
                    out.push('\\');
                    out.push(ch);
                }
                _ => out.push(ch),
            }
        }
        out
    }
}

pub trait GraphStore: Send + Sync {
    /// Persist nodes then edges atomically. Existing nodes are never modified;
    /// duplicate edges are ignored. An edge whose endpoint exists neither in
    /// this batch nor in the store fails the whole batch.
    fn write_batch(&self, nodes: &[GraphNode], edges: &[GraphEdge])
    -> Result<WriteReport, StoreError>;

    fn get_node(&self, id: &NodeId) -> Result<Option<GraphNode>, StoreError>;

    fn get_nodes(&self, ids: &[NodeId]) -> Result<Vec<GraphNode>, StoreError>;

    /// Edges of the given kinds with either endpoint in `ids`. An empty `kinds` means all kinds.
    fn edges_touching(
        &self,
        ids: &[NodeId],
        kinds: &[EdgeKind],
    ) -> Result<Vec<GraphEdge>, StoreError>;

    /// Nodes in `scope` whose name matches `pattern`, ordered by path, line, id.
    fn find_by_name(
        &self,
        scope: &GraphScope,
        pattern: &NamePattern,
        kind: Option<NodeKind>,
    ) -> Result<Vec<GraphNode>, StoreError>;

    fn nodes_in_file(&self, scope: &GraphScope, path: &str) -> Result<Vec<GraphNode>, StoreError>;

    /// File nodes in `scope` whose ingested text contains `needle`, ignoring
    /// ASCII case. Ordered by path, at most `limit` of them.
    fn find_by_text(
        &self,
        scope: &GraphScope,
        needle: &str,
        limit: usize,
    ) -> Result<Vec<GraphNode>, StoreError>;

    fn record_revision(&self, scope: &GraphScope) -> Result<(), StoreError>;

    /// Most recently recorded revision of `repository`.
    fn latest_revision(&self, repository: &str) -> Result<Option<String>, StoreError>;

    fn overview(&self, scope: &GraphScope) -> Result<GraphOverview, StoreError>;

    /// Every node id and edge in `scope`, in any order.
    fn scope_contents(&self, scope: &GraphScope)
    -> Result<(Vec<NodeId>, Vec<GraphEdge>), StoreError>;

    /// Breadth-first neighborhood of `node_id` following `edge_kinds` in both
    /// directions, up to `depth` hops. Ordered by distance, path, line, id.
    fn get_neighbors(
        &self,
        node_id: &NodeId,
        edge_kinds: &[EdgeKind],
        depth: usize,
    ) -> Result<Vec<Neighbor>, StoreError> {
        traverse::neighbors(self, node_id, edge_kinds, depth)
    }

    fn digest(&self, scope: &GraphScope) -> Result<GraphDigest, StoreError> {
        let (mut nodes, mut edges) = self.scope_contents(scope)?;
        nodes.sort();
        nodes.dedup();
        edges.sort();
        edges.dedup();
        let mut hasher = Hasher::new();
        for id in &nodes {
            hasher.update(id.as_str().as_bytes());
            hasher.update(b"\n");
        }
        for edge in &edges {
            hasher.update(edge.source.as_str().as_bytes());
            hasher.update(b"\x00");
            hasher.update(edge.target.as_str().as_bytes());
            hasher.update(b"\x00");
            hasher.update(edge.kind.as_str().as_bytes());
            hasher.update(b"\n");
        }
        Ok(GraphDigest {
            nodes: nodes.len(),
            edges: edges.len(),
            hash: hasher.finalize().to_hex().to_string(),
        })
    }
}

pub(crate) fn sort_nodes(nodes: &mut [GraphNode]) {
    nodes.sort_by(|a, b| a.location_key().cmp(&b.location_key()));
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_pattern_is_case_insensitive() {
        let pattern = NamePattern::new("Helper");
        assert!(pattern.matches("helper"));
        assert!(!pattern.matches("helpers"));
    }

    #[test]
    fn wildcard_patterns() {
        assert!(NamePattern::new("parse*").matches("parse_file"));
        assert!(NamePattern::new("*_file").matches("parse_file"));
        assert!(NamePattern::new("*arse*").matches("parse_file"));
        assert!(NamePattern::new("p*_*e").matches("parse_file"));
        assert!(!NamePattern::new("p*x").matches("parse_file"));
        assert!(NamePattern::new("*").matches("anything"));
    }

    #[test]
    fn qualname_patterns_and_like_escaping() {
        let pattern = NamePattern::new("*/util.py");
        assert!(pattern.targets_qualname());
        assert_eq!(pattern.to_like(), "%/util.py");
        assert_eq!(NamePattern::new("a_b*").to_like(), "a\\_b%");
        assert!(!NamePattern::new("helper").targets_qualname());
        assert!(NamePattern::new("**").is_empty());
    }
}
