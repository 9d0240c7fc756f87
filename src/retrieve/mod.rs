//! Query -> anchors -> bounded neighborhood -> rendered fragments.
//!
//! Scoring is `proximity-v1`: an anchor carries a strength (1.0 for exact
//! path or name hits, 0.75 for quoted text found in a file, 0.5 for
//! substring hits) and a node reached `d` hops
//! away scores `strength * 0.5^d`. Output order is distance, then strength,
//! then path, line and id, so identical graph state and query always give
//! identical output. Fragment text comes from the sources stored with the
//! graph, never from the working tree.

use crate::config::RetrievalConfig;
use crate::error::StoreError;
use crate::indexer::stable_id;
use crate::model::{
    EdgeKind, GraphNode, GraphScope, NodeId, NodeKind, RepositoryRef, RetrievedContext,
};
use crate::store::{GraphStore, NamePattern};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

mod render;
mod terms;

pub use render::{FragmentRenderer, estimate_tokens};
pub use terms::{QueryTerms, extract_terms};

pub const SCORING: &str = "proximity-v1";

const EXPAND_KINDS: [EdgeKind; 4] = [
    EdgeKind::Contains,
    EdgeKind::Calls,
    EdgeKind::References,
    EdgeKind::NextChunk,
];
const EXACT_STRENGTH: f64 = 1.0;
const TEXT_STRENGTH: f64 = 0.75;
const FUZZY_STRENGTH: f64 = 0.5;
const MIN_FUZZY_LEN: usize = 4;

pub fn proximity_score(strength: f64, distance: u32) -> f64 {
    strength * 0.5f64.powi(distance as i32)
}

/// A node selected for the context, before rendering.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub node: GraphNode,
    pub distance: u32,
    pub strength: f64,
}

impl Candidate {
    pub fn score(&self) -> f64 {
        proximity_score(self.strength, self.distance)
    }
}

fn rank_order(a: &Candidate, b: &Candidate) -> Ordering {
    a.distance
        .cmp(&b.distance)
        .then_with(|| b.strength.total_cmp(&a.strength))
        .then_with(|| a.node.location_key().cmp(&b.node.location_key()))
}

pub struct ContextRetriever {
    store: Arc<dyn GraphStore>,
    config: RetrievalConfig,
}

impl ContextRetriever {
    pub fn new(store: Arc<dyn GraphStore>, config: RetrievalConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// An empty result is not an error; it means no anchor resolved.
    pub fn retrieve(
        &self,
        query: &str,
        repo: &RepositoryRef,
        token_budget: usize,
    ) -> Result<RetrievedContext, StoreError> {
        let scope = repo.scope();
        let terms = extract_terms(query);
        let anchors = self.resolve_anchors(repo, &terms)?;
        if anchors.is_empty() {
            tracing::info!(
                repository = %scope.repository,
                revision = %scope.revision,
                paths = terms.paths.len(),
                identifiers = terms.identifiers.len(),
                phrases = terms.phrases.len(),
                "retrieval.empty"
            );
            return Ok(RetrievedContext::empty(query, SCORING, token_budget));
        }

        let anchor_ids: Vec<NodeId> = anchors.iter().map(|c| c.node.id.clone()).collect();
        let ranked = self.expand(anchors)?;

        let mut renderer =
            FragmentRenderer::new(self.config.max_fragment_lines, self.config.chars_per_token);
        for file in self.file_sources(&scope, &ranked)? {
            if let Some(text) = &file.text {
                renderer.add_source(file.file_path(), text.clone());
            }
        }
        let mut context = RetrievedContext::empty(query, SCORING, token_budget);
        context.anchors = anchor_ids;
        for candidate in &ranked {
            if renderer.is_covered(&candidate.node) {
                continue;
            }
            let fragment = renderer.render(&candidate.node, candidate.distance, candidate.score());
            if context.used_tokens + fragment.estimated_tokens > token_budget {
                context.truncated = true;
                break;
            }
            context.used_tokens += fragment.estimated_tokens;
            renderer.mark_emitted(&fragment);
            context.fragments.push(fragment);
        }

        tracing::debug!(
            repository = %scope.repository,
            anchors = context.anchors.len(),
            candidates = ranked.len(),
            fragments = context.fragments.len(),
            used_tokens = context.used_tokens,
            truncated = context.truncated,
            "retrieval.done"
        );
        Ok(context)
    }

    /// Anchors ordered by rank, at most `max_nodes` of them.
    pub fn resolve_anchors(
        &self,
        repo: &RepositoryRef,
        terms: &QueryTerms,
    ) -> Result<Vec<Candidate>, StoreError> {
        let scope = repo.scope();
        let mut found: BTreeMap<NodeId, Candidate> = BTreeMap::new();

        for path in &terms.paths {
            let pattern = if path.contains('/') {
                NamePattern::new(&format!("*{path}"))
            } else {
                NamePattern::exact(path)
            };
            let wanted = path.to_lowercase();
            for node in self.store.find_by_name(&scope, &pattern, Some(NodeKind::File))? {
                let qualname = node.qualname.to_lowercase();
                if qualname == wanted || qualname.ends_with(&format!("/{wanted}")) {
                    add_anchor(&mut found, node, EXACT_STRENGTH);
                }
            }
        }

        for ident in &terms.identifiers {
            for node in self.store.find_by_name(&scope, &NamePattern::exact(ident), None)? {
                if node.kind.is_symbol() {
                    add_anchor(&mut found, node, EXACT_STRENGTH);
                }
            }
        }

        for phrase in &terms.phrases {
            self.anchor_phrase(&scope, phrase, &mut found)?;
        }

        if found.is_empty() {
            for ident in terms
                .identifiers
                .iter()
                .filter(|ident| ident.chars().count() >= MIN_FUZZY_LEN)
            {
                let pattern = NamePattern::new(&format!("*{ident}*"));
                for node in self.store.find_by_name(&scope, &pattern, None)? {
                    if node.kind.is_symbol() {
                        add_anchor(&mut found, node, FUZZY_STRENGTH);
                    }
                }
            }
        }

        let mut anchors: Vec<Candidate> = found.into_values().collect();
        anchors.sort_by(rank_order);
        anchors.truncate(self.config.max_nodes.max(1));
        Ok(anchors)
    }

    /// Each line of a stored file containing `phrase` anchors the innermost
    /// node around it, or the file itself when nothing narrower spans it.
    fn anchor_phrase(
        &self,
        scope: &GraphScope,
        phrase: &str,
        found: &mut BTreeMap<NodeId, Candidate>,
    ) -> Result<(), StoreError> {
        let limit = self.config.max_text_matches;
        let mut matches = 0;
        for file in self.store.find_by_text(scope, phrase, limit)? {
            if matches >= limit {
                break;
            }
            let Some(text) = file.text.as_deref() else {
                continue;
            };
            let lines = matching_lines(text, phrase);
            if lines.is_empty() {
                continue;
            }
            let inner: Vec<GraphNode> = self
                .store
                .nodes_in_file(scope, file.file_path())?
                .into_iter()
                .filter(|node| !matches!(node.kind, NodeKind::File | NodeKind::Repository))
                .collect();
            for line in lines {
                if matches >= limit {
                    break;
                }
                matches += 1;
                let node = innermost(&inner, line).cloned().unwrap_or_else(|| file.clone());
                add_anchor(found, node, TEXT_STRENGTH);
            }
        }
        tracing::debug!(phrase, matches, "retrieval.text_anchors");
        Ok(())
    }

    /// File nodes, with their stored text, for every path in `ranked`.
    fn file_sources(
        &self,
        scope: &GraphScope,
        ranked: &[Candidate],
    ) -> Result<Vec<GraphNode>, StoreError> {
        let paths: BTreeSet<&str> = ranked
            .iter()
            .map(|c| c.node.file_path())
            .filter(|path| !path.is_empty())
            .collect();
        let ids: Vec<NodeId> = paths
            .into_iter()
            .map(|path| stable_id::file_node_id(scope, path))
            .collect();
        self.store.get_nodes(&ids)
    }

    /// Level-by-level expansion from every anchor at once. A node keeps the
    /// strongest anchor strength that reaches it at its first distance.
    pub fn expand(&self, anchors: Vec<Candidate>) -> Result<Vec<Candidate>, StoreError> {
        let max_nodes = self.config.max_nodes.max(1);
        let mut visited: HashSet<NodeId> = anchors.iter().map(|c| c.node.id.clone()).collect();
        let mut frontier: BTreeMap<NodeId, f64> = anchors
            .iter()
            .map(|c| (c.node.id.clone(), c.strength))
            .collect();
        let mut reached = anchors;

        for distance in 1..=self.config.max_hops as u32 {
            if frontier.is_empty() || reached.len() >= max_nodes {
                break;
            }
            let ids: Vec<NodeId> = frontier.keys().cloned().collect();
            let mut edges = self.store.edges_touching(&ids, &EXPAND_KINDS)?;
            edges.sort();

            let mut next: BTreeMap<NodeId, f64> = BTreeMap::new();
            for edge in &edges {
                for (from, to) in [(&edge.source, &edge.target), (&edge.target, &edge.source)] {
                    let Some(&strength) = frontier.get(from) else {
                        continue;
                    };
                    if visited.contains(to)
                        || proximity_score(strength, distance) < self.config.min_relevance
                    {
                        continue;
                    }
                    let best = next.entry(to.clone()).or_insert(strength);
                    if strength > *best {
                        *best = strength;
                    }
                }
            }
            if next.is_empty() {
                break;
            }

            let ids: Vec<NodeId> = next.keys().cloned().collect();
            visited.extend(ids.iter().cloned());
            let mut level: Vec<Candidate> = self
                .store
                .get_nodes(&ids)?
                .into_iter()
                .filter(|node| node.kind != NodeKind::Repository)
                .filter_map(|node| {
                    let strength = *next.get(&node.id)?;
                    Some(Candidate {
                        node,
                        distance,
                        strength,
                    })
                })
                .collect();
            level.sort_by(rank_order);
            level.truncate(max_nodes.saturating_sub(reached.len()));

            frontier = level
                .iter()
                .map(|c| (c.node.id.clone(), c.strength))
                .collect();
            reached.extend(level);
        }

        reached.sort_by(rank_order);
        Ok(reached)
    }
}

/// 1-based lines holding `needle`, ignoring ASCII case, each listed once.
fn matching_lines(text: &str, needle: &str) -> Vec<i64> {
    let haystack = text.to_ascii_lowercase();
    let needle = needle.to_ascii_lowercase();
    if needle.is_empty() {
        return Vec::new();
    }
    let mut lines = Vec::new();
    let mut line = 1i64;
    let mut counted = 0;
    for (at, _) in haystack.match_indices(&needle) {
        line += haystack.as_bytes()[counted..at]
            .iter()
            .filter(|&&byte| byte == b'\n')
            .count() as i64;
        counted = at;
        if lines.last() != Some(&line) {
            lines.push(line);
        }
    }
    lines
}

/// Deepest node whose span covers `line`; the shortest span breaks ties.
fn innermost(nodes: &[GraphNode], line: i64) -> Option<&GraphNode> {
    nodes
        .iter()
        .filter(|node| node.start_line() <= line && line <= node.end_line())
        .min_by(|a, b| {
            b.depth
                .cmp(&a.depth)
                .then_with(|| {
                    (a.end_line() - a.start_line()).cmp(&(b.end_line() - b.start_line()))
                })
                .then_with(|| a.location_key().cmp(&b.location_key()))
        })
}

fn add_anchor(found: &mut BTreeMap<NodeId, Candidate>, node: GraphNode, strength: f64) {
    match found.get_mut(&node.id) {
        Some(existing) if existing.strength >= strength => {}
        Some(existing) => existing.strength = strength,
        None => {
            found.insert(
                node.id.clone(),
                Candidate {
                    node,
                    distance: 0,
                    strength,
                },
            );
        }
    }
}
