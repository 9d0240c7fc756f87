use crate::error::StoreError;
use crate::model::{EdgeKind, GraphEdge, GraphNode, GraphOverview, GraphScope, NodeId, NodeKind};
use crate::store::{GraphStore, NamePattern, WriteReport, sort_nodes};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<NodeId, GraphNode>,
    edges: BTreeSet<GraphEdge>,
    revisions: HashMap<String, Vec<String>>,
    unavailable: bool,
}

/// In-process store with the same contract as the SQLite store. Used by tests
/// and for one-shot runs that do not need persistence.
#[derive(Default)]
pub struct MemoryGraphStore {
    inner: Mutex<Inner>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with `StoreError::Unavailable` until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.unavailable = unavailable;
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".to_string()))?;
        if inner.unavailable {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(inner)
    }
}

fn in_scope(node: &GraphNode, scope: &GraphScope) -> bool {
    node.repository == scope.repository && node.revision == scope.revision
}

impl GraphStore for MemoryGraphStore {
    fn write_batch(
        &self,
        nodes: &[GraphNode],
        edges: &[GraphEdge],
    ) -> Result<WriteReport, StoreError> {
        let mut inner = self.lock()?;
        let batch_ids: BTreeSet<&NodeId> = nodes.iter().map(|node| &node.id).collect();
        for edge in edges {
            for endpoint in [&edge.source, &edge.target] {
                if !batch_ids.contains(endpoint) && !inner.nodes.contains_key(endpoint) {
                    return Err(StoreError::DanglingEdge {
                        source_id: edge.source.to_string(),
                        target_id: edge.target.to_string(),
                        kind: edge.kind.to_string(),
                    });
                }
            }
        }

        let mut report = WriteReport::default();
        for node in nodes {
            if !inner.nodes.contains_key(&node.id) {
                inner.nodes.insert(node.id.clone(), node.clone());
                report.nodes_inserted += 1;
            }
        }
        for edge in edges {
            if inner.edges.insert(edge.clone()) {
                report.edges_inserted += 1;
            }
        }
        Ok(report)
    }

    fn get_node(&self, id: &NodeId) -> Result<Option<GraphNode>, StoreError> {
        Ok(self.lock()?.nodes.get(id).cloned())
    }

    fn get_nodes(&self, ids: &[NodeId]) -> Result<Vec<GraphNode>, StoreError> {
        let inner = self.lock()?;
        Ok(ids.iter().filter_map(|id| inner.nodes.get(id).cloned()).collect())
    }

    fn edges_touching(
        &self,
        ids: &[NodeId],
        kinds: &[EdgeKind],
    ) -> Result<Vec<GraphEdge>, StoreError> {
        let inner = self.lock()?;
        let wanted: BTreeSet<&NodeId> = ids.iter().collect();
        Ok(inner
            .edges
            .iter()
            .filter(|edge| kinds.is_empty() || kinds.contains(&edge.kind))
            .filter(|edge| wanted.contains(&edge.source) || wanted.contains(&edge.target))
            .cloned()
            .collect())
    }

    fn find_by_name(
        &self,
        scope: &GraphScope,
        pattern: &NamePattern,
        kind: Option<NodeKind>,
    ) -> Result<Vec<GraphNode>, StoreError> {
        if pattern.is_empty() && !pattern.as_str().contains('*') {
            return Ok(Vec::new());
        }
        let inner = self.lock()?;
        let mut nodes: Vec<GraphNode> = inner
            .nodes
            .values()
            .filter(|node| in_scope(node, scope))
            .filter(|node| kind.is_none_or(|kind| node.kind == kind))
            .filter(|node| pattern.matches_node(node))
            .cloned()
            .collect();
        sort_nodes(&mut nodes);
        Ok(nodes)
    }

    fn nodes_in_file(&self, scope: &GraphScope, path: &str) -> Result<Vec<GraphNode>, StoreError> {
        let inner = self.lock()?;
        let mut nodes: Vec<GraphNode> = inner
            .nodes
            .values()
            .filter(|node| in_scope(node, scope) && node.span.is_some() && node.file_path() == path)
            .cloned()
            .collect();
        sort_nodes(&mut nodes);
        Ok(nodes)
    }

    fn find_by_text(
        &self,
        scope: &GraphScope,
        needle: &str,
        limit: usize,
    ) -> Result<Vec<GraphNode>, StoreError> {
        if needle.trim().is_empty() {
            return Ok(Vec::new());
        }
        let needle = needle.to_ascii_lowercase();
        let inner = self.lock()?;
        let mut nodes: Vec<GraphNode> = inner
            .nodes
            .values()
            .filter(|node| in_scope(node, scope) && node.kind == NodeKind::File)
            .filter(|node| {
                node.text
                    .as_ref()
                    .is_some_and(|text| text.to_ascii_lowercase().contains(&needle))
            })
            .cloned()
            .collect();
        nodes.sort_by(|a, b| (a.file_path(), &a.id).cmp(&(b.file_path(), &b.id)));
        nodes.truncate(limit);
        Ok(nodes)
    }

    fn record_revision(&self, scope: &GraphScope) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let history = inner.revisions.entry(scope.repository.clone()).or_default();
        history.retain(|revision| revision != &scope.revision);
        history.push(scope.revision.clone());
        Ok(())
    }

    fn latest_revision(&self, repository: &str) -> Result<Option<String>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .revisions
            .get(repository)
            .and_then(|history| history.last().cloned()))
    }

    fn overview(&self, scope: &GraphScope) -> Result<GraphOverview, StoreError> {
        let inner = self.lock()?;
        let mut overview = GraphOverview {
            repository: scope.repository.clone(),
            revision: scope.revision.clone(),
            ..GraphOverview::default()
        };
        for node in inner.nodes.values().filter(|node| in_scope(node, scope)) {
            *overview.nodes.entry(node.kind.to_string()).or_default() += 1;
            if node.kind == NodeKind::File {
                if let Some(language) = &node.language {
                    *overview.languages.entry(language.clone()).or_default() += 1;
                }
            }
        }
        for edge in &inner.edges {
            if inner
                .nodes
                .get(&edge.source)
                .is_some_and(|node| in_scope(node, scope))
            {
                *overview.edges.entry(edge.kind.to_string()).or_default() += 1;
            }
        }
        Ok(overview)
    }

    fn scope_contents(
        &self,
        scope: &GraphScope,
    ) -> Result<(Vec<NodeId>, Vec<GraphEdge>), StoreError> {
        let inner = self.lock()?;
        let ids: Vec<NodeId> = inner
            .nodes
            .values()
            .filter(|node| in_scope(node, scope))
            .map(|node| node.id.clone())
            .collect();
        let edges: Vec<GraphEdge> = inner
            .edges
            .iter()
            .filter(|edge| {
                inner
                    .nodes
                    .get(&edge.source)
                    .is_some_and(|node| in_scope(node, scope))
            })
            .cloned()
            .collect();
        Ok((ids, edges))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Direction;
    use crate::store::tests_support::{edge, file_node, scope, symbol_node};

    /// file a.py contains a, a calls b, b calls c, c references T.
    fn chain(store: &MemoryGraphStore) -> Vec<GraphNode> {
        let scope = scope("v1");
        let file = file_node(&scope, "a.py");
        let a = symbol_node(&scope, "a.py", "a", NodeKind::Function, 1);
        let b = symbol_node(&scope, "a.py", "b", NodeKind::Function, 5);
        let c = symbol_node(&scope, "b.py", "c", NodeKind::Function, 1);
        let t = symbol_node(&scope, "b.py", "T", NodeKind::Type, 9);
        let edges = vec![
            edge(&file, &a, EdgeKind::Contains),
            edge(&a, &b, EdgeKind::Calls),
            edge(&b, &c, EdgeKind::Calls),
            edge(&c, &t, EdgeKind::References),
        ];
        let nodes = vec![file, a, b, c, t];
        store.write_batch(&nodes, &edges).unwrap();
        nodes
    }

    #[test]
    fn neighbors_respect_depth_and_kinds() {
        let store = MemoryGraphStore::new();
        let nodes = chain(&store);
        let b = &nodes[2];

        let one = store.get_neighbors(&b.id, &[EdgeKind::Calls], 1).unwrap();
        let names: Vec<&str> = one.iter().map(|n| n.node.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
        assert!(one.iter().all(|n| n.distance == 1));
        assert_eq!(one[0].direction, Direction::Incoming);
        assert_eq!(one[1].direction, Direction::Outgoing);

        let two = store.get_neighbors(&b.id, &[EdgeKind::Calls], 2).unwrap();
        assert_eq!(two.len(), 2);

        let all = store.get_neighbors(&b.id, &[], 2).unwrap();
        let names: Vec<&str> = all.iter().map(|n| n.node.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c", "a.py", "T"]);
        assert_eq!(all[2].distance, 2);
    }

    #[test]
    fn neighbors_of_unknown_node_are_empty() {
        let store = MemoryGraphStore::new();
        chain(&store);
        let missing = NodeId::from("n_missing");
        assert!(store.get_neighbors(&missing, &[], 3).unwrap().is_empty());
        let nodes = chain(&store);
        assert!(store.get_neighbors(&nodes[1].id, &[], 0).unwrap().is_empty());
    }

    #[test]
    fn replay_keeps_digest_stable() {
        let store = MemoryGraphStore::new();
        chain(&store);
        let before = store.digest(&scope("v1")).unwrap();
        chain(&store);
        assert_eq!(store.digest(&scope("v1")).unwrap(), before);
        assert_eq!(before.nodes, 5);
        assert_eq!(before.edges, 4);
    }

    #[test]
    fn unavailable_store_fails_every_call() {
        let store = MemoryGraphStore::new();
        store.set_unavailable(true);
        let err = store.latest_revision("/repo").unwrap_err();
        assert!(err.is_retryable());
        store.set_unavailable(false);
        assert!(store.latest_revision("/repo").unwrap().is_none());
    }

    #[test]
    fn dangling_edges_are_rejected_atomically() {
        let store = MemoryGraphStore::new();
        let scope = scope("v1");
        let a = symbol_node(&scope, "a.py", "a", NodeKind::Function, 1);
        let ghost = symbol_node(&scope, "z.py", "ghost", NodeKind::Function, 1);
        let err = store
            .write_batch(&[a.clone()], &[edge(&a, &ghost, EdgeKind::Calls)])
            .unwrap_err();
        assert!(matches!(err, StoreError::DanglingEdge { .. }));
        assert!(store.get_node(&a.id).unwrap().is_none());
    }

    #[test]
    fn text_search_orders_by_path_and_respects_limit() {
        let store = MemoryGraphStore::new();
        let v1 = scope("v1");
        let mut nodes = Vec::new();
        for path in ["c.md", "a.py", "b.py"] {
            let mut file = file_node(&v1, path);
            file.text = Some(format!("# {path}\nTimeout While Polling\n"));
            nodes.push(file);
        }
        let helper = symbol_node(&v1, "a.py", "poll", NodeKind::Function, 1);
        nodes.push(helper);
        store.write_batch(&nodes, &[]).unwrap();

        let found = store.find_by_text(&v1, "timeout while", 10).unwrap();
        let paths: Vec<&str> = found.iter().map(|node| node.file_path()).collect();
        assert_eq!(paths, vec!["a.py", "b.py", "c.md"]);
        assert_eq!(store.find_by_text(&v1, "timeout while", 2).unwrap().len(), 2);
        assert!(store.find_by_text(&scope("v2"), "timeout", 10).unwrap().is_empty());
    }
}
