use crate::indexer::resolve::{DeferredEdge, ImportMap};
use crate::model::{GraphEdge, GraphNode, GraphScope, SkippedFile};
use std::collections::BTreeMap;

/// Everything one source file contributes to the graph: its File node, its
/// declarations, and the Contains/DefinedIn edges between them. A unit is
/// never split across store chunks.
#[derive(Debug, Clone, Default)]
pub struct FileUnit {
    pub rel_path: String,
    pub module: String,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl FileUnit {
    pub fn weight(&self) -> usize {
        self.nodes.len() + self.edges.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub files_processed: usize,
    pub files_skipped: usize,
    pub truncated_nodes: usize,
    pub skipped: Vec<SkippedFile>,
}

/// Output of one `GraphBuilder::build` call, held until it is flushed.
#[derive(Debug, Clone)]
pub struct IngestionBatch {
    pub scope: GraphScope,
    pub repository: GraphNode,
    pub units: Vec<FileUnit>,
    /// Cross-reference edges (Calls, References, Imports) resolved inside the batch.
    pub edges: Vec<GraphEdge>,
    /// References still unresolved after the batch-wide pass.
    pub deferred: Vec<DeferredEdge>,
    /// Which files import which, as far as the batch could tell.
    pub imports: ImportMap,
    pub stats: BuildStats,
    /// Whether the batch covers every file of the repository. Incomplete
    /// batches resolve leftovers against the store when flushed.
    pub complete: bool,
}

impl IngestionBatch {
    pub fn node_count(&self) -> usize {
        1 + self.units.iter().map(|unit| unit.nodes.len()).sum::<usize>()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len() + self.units.iter().map(|unit| unit.edges.len()).sum::<usize>()
    }

    /// Fold a later build of the same scope into this one. Units for the same
    /// file are replaced.
    pub fn merge(&mut self, other: IngestionBatch) {
        let mut units: BTreeMap<String, FileUnit> = self
            .units
            .drain(..)
            .map(|unit| (unit.rel_path.clone(), unit))
            .collect();
        for unit in other.units {
            units.insert(unit.rel_path.clone(), unit);
        }
        self.units = units.into_values().collect();
        self.edges.extend(other.edges);
        self.edges.sort();
        self.edges.dedup();
        self.deferred.extend(other.deferred);
        self.imports.merge(other.imports);
        self.stats.files_processed += other.stats.files_processed;
        self.stats.files_skipped += other.stats.files_skipped;
        self.stats.truncated_nodes += other.stats.truncated_nodes;
        self.stats.skipped.extend(other.stats.skipped);
        self.complete = self.complete || other.complete;
    }

    /// Node chunks in write order: the Repository node first, then whole file
    /// units.
    pub fn unit_chunks(&self, batch_size: usize) -> Vec<Chunk> {
        let mut writer = ChunkWriter::new(batch_size);
        let mut chunks = Vec::new();
        writer.add(vec![self.repository.clone()], Vec::new());
        for unit in &self.units {
            if writer.would_overflow(unit.weight()) {
                chunks.push(writer.take());
            }
            writer.add(unit.nodes.clone(), unit.edges.clone());
        }
        if !writer.is_empty() {
            chunks.push(writer.take());
        }
        chunks
    }
}

/// Edge-only chunks for cross-reference edges, written after every node.
pub fn edge_chunks(edges: &[GraphEdge], batch_size: usize) -> Vec<Chunk> {
    edges
        .chunks(batch_size.max(1))
        .map(|part| Chunk {
            nodes: Vec::new(),
            edges: part.to_vec(),
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chunk {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl Chunk {
    pub fn weight(&self) -> usize {
        self.nodes.len() + self.edges.len()
    }
}

/// Accumulates rows until the next addition would exceed `batch_size`.
pub struct ChunkWriter {
    batch_size: usize,
    pending: Chunk,
}

impl ChunkWriter {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            pending: Chunk::default(),
        }
    }

    pub fn add(&mut self, nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) {
        self.pending.nodes.extend(nodes);
        self.pending.edges.extend(edges);
    }

    /// An oversized unit still gets a chunk of its own; it is never split.
    pub fn would_overflow(&self, weight: usize) -> bool {
        !self.is_empty() && self.pending.weight() + weight > self.batch_size
    }

    pub fn take(&mut self) -> Chunk {
        std::mem::take(&mut self.pending)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.weight()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.weight() == 0
    }
}
