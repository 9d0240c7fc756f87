use crate::config::IngestConfig;
use crate::error::{IngestError, ParseError, StoreError};
use crate::indexer::batch::{BuildStats, Chunk, FileUnit, IngestionBatch, edge_chunks};
use crate::indexer::extract::{ExtractedFile, WalkOptions, extract_file};
use crate::indexer::registry::{AdapterSet, ParserRegistry};
use crate::indexer::resolve::{
    DeferredEdge, ImportMap, Pending, SymbolTable, resolve_deferred, resolve_local,
};
use crate::indexer::scan::{ScanOptions, ScannedFile, is_document};
use crate::model::{
    EdgeKind, GraphEdge, GraphNode, GraphScope, IngestionSummary, NodeId, NodeKind,
    RepositoryRef, SkippedFile, SourceSpan,
};
use crate::store::{GraphStore, NamePattern, WriteReport};
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

pub mod batch;
pub mod csharp;
pub mod document;
pub mod extract;
pub mod go;
pub mod javascript;
pub mod python;
pub mod registry;
pub mod resolve;
pub mod rust;
pub mod scan;
pub mod stable_id;

/// One parsed file before batch-wide resolution.
struct ParsedFile {
    unit: FileUnit,
    local_edges: Vec<GraphEdge>,
    deferred: Vec<DeferredEdge>,
    truncated: usize,
}

/// Turns a repository checkout into an `IngestionBatch`. Parsing is parallel;
/// cross-file resolution waits for every parse to finish.
pub struct GraphBuilder {
    registry: ParserRegistry,
    config: IngestConfig,
}

impl GraphBuilder {
    pub fn new(config: IngestConfig) -> Self {
        Self::with_registry(config, ParserRegistry::default())
    }

    pub fn with_registry(config: IngestConfig, registry: ParserRegistry) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn registry(&self) -> &ParserRegistry {
        &self.registry
    }

    pub fn scan(&self, repo: &RepositoryRef) -> Result<Vec<ScannedFile>, IngestError> {
        let options = ScanOptions::new(!self.config.follow_gitignore);
        let files = scan::scan_repo_with_options(&repo.root, options).map_err(|err| {
            IngestError::Scan {
                path: repo.root.clone(),
                message: format!("{err:#}"),
            }
        })?;
        Ok(files
            .into_iter()
            .filter(|file| {
                self.registry.supports(&file.language)
                    || (self.config.index_documents && is_document(&file.language))
            })
            .collect())
    }

    /// Build the graph of every supported file in the checkout.
    pub fn build(&self, repo: &RepositoryRef, max_depth: usize) -> Result<IngestionBatch, IngestError> {
        let all = self.scan(repo)?;
        self.build_scanned(repo, &all, all.clone(), max_depth, true)
    }

    /// Build only `rel_paths`. References into other files are resolved
    /// against the store when the batch is flushed.
    pub fn build_files(
        &self,
        repo: &RepositoryRef,
        rel_paths: &[String],
        max_depth: usize,
    ) -> Result<IngestionBatch, IngestError> {
        let all = self.scan(repo)?;
        let wanted: HashSet<&str> = rel_paths.iter().map(String::as_str).collect();
        let selected: Vec<ScannedFile> = all
            .iter()
            .filter(|file| wanted.contains(file.rel_path.as_str()))
            .cloned()
            .collect();
        let complete = selected.len() == all.len();
        self.build_scanned(repo, &all, selected, max_depth, complete)
    }

    fn build_scanned(
        &self,
        repo: &RepositoryRef,
        all: &[ScannedFile],
        selected: Vec<ScannedFile>,
        max_depth: usize,
        complete: bool,
    ) -> Result<IngestionBatch, IngestError> {
        let scope = repo.scope();
        let repository = repository_node(&scope, repo);
        let options = WalkOptions {
            max_depth,
            statement_nodes: self.config.statement_nodes,
        };

        let parsed = self.parse_all(&scope, &repository.id, &selected, &options);

        let mut stats = BuildStats::default();
        let mut units = Vec::new();
        let mut edges = Vec::new();
        let mut leftovers = Vec::new();
        for (file, result) in selected.iter().zip(parsed) {
            match result {
                Ok(parsed) => {
                    stats.files_processed += 1;
                    stats.truncated_nodes += parsed.truncated;
                    edges.extend(parsed.local_edges);
                    leftovers.extend(parsed.deferred);
                    units.push(parsed.unit);
                }
                Err(err) => {
                    tracing::warn!(
                        repository = %scope.repository,
                        file = %file.rel_path,
                        error = %err,
                        "ingest.parse_skipped"
                    );
                    stats.files_skipped += 1;
                    stats.skipped.push(SkippedFile {
                        path: file.rel_path.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        // Pass 2: every declaration of the batch is known now.
        let mut table = SymbolTable::new();
        for unit in &units {
            let file_id = &unit.nodes[0].id;
            if !unit.module.is_empty() {
                table.insert_module(&unit.module, &unit.rel_path, file_id);
            }
            for node in &unit.nodes {
                table.insert_node(node);
                if node.kind == NodeKind::Module {
                    table.insert_module(&node.qualname, &unit.rel_path, file_id);
                    table.insert_module(&node.name, &unit.rel_path, file_id);
                }
            }
        }
        if !complete {
            self.register_unparsed_modules(&scope, all, &units, &mut table);
        }
        let mut imports = ImportMap::default();
        let resolution = resolve_deferred(&table, &mut imports, leftovers);
        edges.extend(resolution.edges);
        edges.sort();
        edges.dedup();

        tracing::debug!(
            repository = %scope.repository,
            files = units.len(),
            symbols = table.len(),
            deferred = resolution.unresolved.len(),
            "graph built"
        );

        Ok(IngestionBatch {
            scope,
            repository,
            units,
            edges,
            deferred: resolution.unresolved,
            imports,
            stats,
            complete,
        })
    }

    fn parse_all(
        &self,
        scope: &GraphScope,
        repository_id: &NodeId,
        files: &[ScannedFile],
        options: &WalkOptions,
    ) -> Vec<Result<ParsedFile, ParseError>> {
        let work = || -> Vec<Result<ParsedFile, ParseError>> {
            files
                .par_iter()
                .map_init(
                    || self.registry.adapter_set(),
                    |adapters, file| {
                        self.parse_file(adapters, scope, repository_id, file, options)
                    },
                )
                .collect()
        };
        match rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.parse_threads)
            .build()
        {
            Ok(pool) => pool.install(work),
            Err(err) => {
                tracing::warn!(error = %err, "parser pool unavailable, using the global pool");
                work()
            }
        }
    }

    fn parse_file(
        &self,
        adapters: &mut AdapterSet<'_>,
        scope: &GraphScope,
        repository_id: &NodeId,
        file: &ScannedFile,
        options: &WalkOptions,
    ) -> Result<ParsedFile, ParseError> {
        if file.size > self.config.max_file_bytes {
            return Err(ParseError::TooLarge {
                path: file.rel_path.clone(),
                limit: self.config.max_file_bytes,
            });
        }
        let bytes = std::fs::read(&file.abs_path).map_err(|source| ParseError::Read {
            path: file.rel_path.clone(),
            source,
        })?;
        let source = String::from_utf8(bytes).map_err(|err| ParseError::Read {
            path: file.rel_path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, err.utf8_error()),
        })?;
        if is_document(&file.language) {
            return Ok(document_unit(
                scope,
                repository_id,
                file,
                source,
                self.config.doc_chunk_chars,
            ));
        }
        let adapter = adapters.get(&file.language, &file.rel_path)?;
        let extracted = extract_file(adapter, &source, &file.rel_path, options)?;
        Ok(file_unit(scope, repository_id, extracted, source))
    }

    /// Files outside a partial build still own their module names, so imports
    /// of them resolve to their (already stored) File nodes.
    fn register_unparsed_modules(
        &self,
        scope: &GraphScope,
        all: &[ScannedFile],
        units: &[FileUnit],
        table: &mut SymbolTable,
    ) {
        let parsed: HashSet<&str> = units.iter().map(|unit| unit.rel_path.as_str()).collect();
        let mut adapters = self.registry.adapter_set();
        for file in all {
            if parsed.contains(file.rel_path.as_str()) || is_document(&file.language) {
                continue;
            }
            match adapters.get(&file.language, &file.rel_path) {
                Ok(adapter) => {
                    let module = adapter.module_name(&file.rel_path);
                    let file_id = stable_id::file_node_id(scope, &file.rel_path);
                    table.insert_module(&module, &file.rel_path, &file_id);
                }
                Err(err) => tracing::debug!(file = %file.rel_path, error = %err, "module not registered"),
            }
        }
    }
}

fn repository_node(scope: &GraphScope, repo: &RepositoryRef) -> GraphNode {
    let name = repo
        .root
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(&scope.repository)
        .to_string();
    GraphNode {
        id: stable_id::repository_node_id(scope),
        kind: NodeKind::Repository,
        name,
        qualname: scope.repository.clone(),
        span: None,
        language: None,
        depth: 0,
        signature: None,
        repository: scope.repository.clone(),
        revision: scope.revision.clone(),
        text: None,
    }
}

/// Pass 1: turn an extracted file into nodes, structural edges, same-file
/// references and a deferred queue for everything else.
fn file_unit(
    scope: &GraphScope,
    repository_id: &NodeId,
    extracted: ExtractedFile,
    source: String,
) -> ParsedFile {
    let rel_path = extracted.rel_path.clone();
    let file = file_node(scope, &rel_path, &extracted.language, extracted.line_count, source);
    let file_id = file.id.clone();
    let mut nodes = vec![file];
    let mut edges = vec![GraphEdge::new(
        repository_id.clone(),
        file_id.clone(),
        EdgeKind::Contains,
    )];

    let mut ids: Vec<NodeId> = Vec::with_capacity(extracted.symbols.len());
    let mut seen: HashSet<NodeId> = HashSet::new();
    for symbol in &extracted.symbols {
        let id = stable_id::node_id(scope, &rel_path, &symbol.qualname, symbol.kind);
        ids.push(id.clone());
        if !seen.insert(id.clone()) {
            continue;
        }
        nodes.push(GraphNode {
            id,
            kind: symbol.kind,
            name: symbol.name.clone(),
            qualname: symbol.qualname.clone(),
            span: Some(SourceSpan {
                file: rel_path.clone(),
                start_line: symbol.start_line,
                start_col: symbol.start_col,
                end_line: symbol.end_line,
                end_col: symbol.end_col,
            }),
            language: Some(extracted.language.clone()),
            depth: symbol.depth,
            signature: symbol.signature.clone(),
            repository: scope.repository.clone(),
            revision: scope.revision.clone(),
            text: None,
        });
    }
    for (index, symbol) in extracted.symbols.iter().enumerate() {
        let id = &ids[index];
        let parent = symbol
            .parent
            .map(|parent| ids[parent].clone())
            .unwrap_or_else(|| file_id.clone());
        if &parent != id {
            edges.push(GraphEdge::new(parent, id.clone(), EdgeKind::Contains));
        }
        if symbol.kind != NodeKind::Statement {
            edges.push(GraphEdge::new(id.clone(), file_id.clone(), EdgeKind::DefinedIn));
        }
    }
    edges.sort();
    edges.dedup();

    let mut deferred = Vec::new();
    for reference in extracted.references {
        let source = reference
            .source
            .map(|index| ids[index].clone())
            .unwrap_or_else(|| file_id.clone());
        deferred.push(DeferredEdge {
            source,
            file: rel_path.clone(),
            separator: extracted.separator,
            line: reference.line,
            target: Pending::Symbol {
                kind: reference.kind,
                name: reference.name,
                qualifier: reference.qualifier,
                scopes: reference.scopes,
            },
        });
    }

    let local = SymbolTable::from_nodes(&nodes);
    let resolution = resolve_local(&local, deferred);
    let mut deferred = resolution.unresolved;
    for import in extracted.imports {
        deferred.push(DeferredEdge {
            source: file_id.clone(),
            file: rel_path.clone(),
            separator: extracted.separator,
            line: import.line,
            target: Pending::Import {
                raw: import.raw,
                candidates: import.candidates,
            },
        });
    }

    ParsedFile {
        unit: FileUnit {
            rel_path,
            module: extracted.module,
            nodes,
            edges,
        },
        local_edges: resolution.edges,
        deferred,
        truncated: extracted.truncated_subtrees,
    }
}

/// The File node keeps the source as ingested, so fragments render from the
/// graph rather than from whatever the checkout holds now.
fn file_node(
    scope: &GraphScope,
    rel_path: &str,
    language: &str,
    line_count: i64,
    source: String,
) -> GraphNode {
    GraphNode {
        id: stable_id::file_node_id(scope, rel_path),
        kind: NodeKind::File,
        name: rel_path.rsplit('/').next().unwrap_or(rel_path).to_string(),
        qualname: rel_path.to_string(),
        span: Some(SourceSpan {
            file: rel_path.to_string(),
            start_line: 1,
            start_col: 1,
            end_line: line_count,
            end_col: 1,
        }),
        language: Some(language.to_string()),
        depth: 0,
        signature: None,
        repository: scope.repository.clone(),
        revision: scope.revision.clone(),
        text: Some(source),
    }
}

fn document_unit(
    scope: &GraphScope,
    repository_id: &NodeId,
    file: &ScannedFile,
    source: String,
    chunk_chars: usize,
) -> ParsedFile {
    let rel_path = file.rel_path.clone();
    let chunks = document::chunk_lines(&source, chunk_chars);
    let line_count = extract::line_count(&source);
    let root = file_node(scope, &rel_path, &file.language, line_count, source);
    let file_id = root.id.clone();

    let mut nodes = vec![root];
    let mut edges = vec![GraphEdge::new(
        repository_id.clone(),
        file_id.clone(),
        EdgeKind::Contains,
    )];
    let mut previous: Option<NodeId> = None;
    for chunk in chunks {
        let qualname = format!("{rel_path}#{}", chunk.index);
        let id = stable_id::node_id(scope, &rel_path, &qualname, NodeKind::Chunk);
        edges.push(GraphEdge::new(file_id.clone(), id.clone(), EdgeKind::Contains));
        edges.push(GraphEdge::new(id.clone(), file_id.clone(), EdgeKind::DefinedIn));
        if let Some(previous) = previous.replace(id.clone()) {
            edges.push(GraphEdge::new(previous, id.clone(), EdgeKind::NextChunk));
        }
        nodes.push(GraphNode {
            id,
            kind: NodeKind::Chunk,
            name: chunk.title,
            qualname,
            span: Some(SourceSpan {
                file: rel_path.clone(),
                start_line: chunk.start_line,
                start_col: 1,
                end_line: chunk.end_line,
                end_col: 1,
            }),
            language: Some(file.language.clone()),
            depth: 1,
            signature: None,
            repository: scope.repository.clone(),
            revision: scope.revision.clone(),
            text: None,
        });
    }
    edges.sort();

    ParsedFile {
        unit: FileUnit {
            module: String::new(),
            rel_path,
            nodes,
            edges,
        },
        local_edges: Vec::new(),
        deferred: Vec::new(),
        truncated: 0,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub chunks_written: usize,
    pub nodes_written: usize,
    pub edges_written: usize,
    pub cross_edges: usize,
    pub unresolved: usize,
}

/// Ingestion pipeline for one repository: build, resolve, write in chunks.
pub struct Indexer {
    store: Arc<dyn GraphStore>,
    builder: GraphBuilder,
}

impl Indexer {
    pub fn new(store: Arc<dyn GraphStore>, config: IngestConfig) -> Self {
        Self {
            store,
            builder: GraphBuilder::new(config),
        }
    }

    pub fn builder(&self) -> &GraphBuilder {
        &self.builder
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    pub fn ingest(&self, repo: &RepositoryRef) -> Result<IngestionSummary, IngestError> {
        let config = self.builder.config();
        self.ingest_with(repo, config.max_depth, config.batch_size)
    }

    pub fn ingest_with(
        &self,
        repo: &RepositoryRef,
        max_depth: usize,
        batch_size: usize,
    ) -> Result<IngestionSummary, IngestError> {
        let started = Instant::now();
        let batch = self.builder.build(repo, max_depth)?;
        self.finish(batch, batch_size, started)
    }

    /// Re-ingest a changed-file set into the same revision.
    pub fn ingest_files(
        &self,
        repo: &RepositoryRef,
        rel_paths: &[String],
    ) -> Result<IngestionSummary, IngestError> {
        let started = Instant::now();
        let config = self.builder.config();
        let batch = self.builder.build_files(repo, rel_paths, config.max_depth)?;
        self.finish(batch, config.batch_size, started)
    }

    fn finish(
        &self,
        batch: IngestionBatch,
        batch_size: usize,
        started: Instant,
    ) -> Result<IngestionSummary, IngestError> {
        let scope = batch.scope.clone();
        let stats = batch.stats.clone();
        let nodes = batch.node_count();
        let report = self.flush(batch, batch_size)?;
        let summary = IngestionSummary {
            repository: scope.repository,
            revision: scope.revision,
            files_processed: stats.files_processed,
            files_skipped: stats.files_skipped,
            nodes,
            edge_count: report.edges_written,
            unresolved_references: report.unresolved,
            truncated_nodes: stats.truncated_nodes,
            chunks_written: report.chunks_written,
            duration_ms: started.elapsed().as_millis() as u64,
            skipped: stats.skipped,
        };
        tracing::info!(
            repository = %summary.repository,
            revision = %summary.revision,
            files = summary.files_processed,
            skipped = summary.files_skipped,
            nodes = summary.nodes,
            edges = summary.edge_count,
            unresolved = summary.unresolved_references,
            chunks = summary.chunks_written,
            duration_ms = summary.duration_ms,
            "ingest.summary"
        );
        Ok(summary)
    }

    /// Write a batch: node chunks first, then cross-reference edges. A failed
    /// chunk aborts the flush; replaying the whole batch is safe.
    pub fn flush(&self, mut batch: IngestionBatch, batch_size: usize) -> Result<FlushReport, IngestError> {
        let mut report = FlushReport::default();
        let mut chunk_index = 0;

        for chunk in batch.unit_chunks(batch_size) {
            let written = self.write_chunk(chunk_index, &chunk)?;
            report.nodes_written += chunk.nodes.len();
            report.edges_written += chunk.edges.len();
            tracing::debug!(
                chunk = chunk_index,
                inserted_nodes = written.nodes_inserted,
                inserted_edges = written.edges_inserted,
                "chunk written"
            );
            chunk_index += 1;
        }

        let mut edges = std::mem::take(&mut batch.edges);
        let mut unresolved = Vec::new();
        let deferred = std::mem::take(&mut batch.deferred);
        if batch.complete {
            unresolved = deferred;
        } else if !deferred.is_empty() {
            let resolution = self.resolve_from_store(&batch.scope, &mut batch.imports, deferred)?;
            edges.extend(resolution.edges);
            unresolved = resolution.unresolved;
        }

        let dropped = self.drop_external_dangling(&batch, &mut edges)?;
        edges.sort();
        edges.dedup();
        for chunk in edge_chunks(&edges, batch_size) {
            self.write_chunk(chunk_index, &chunk)?;
            report.edges_written += chunk.edges.len();
            chunk_index += 1;
        }

        self.with_retry(|| self.store.record_revision(&batch.scope))
            .map_err(IngestError::Query)?;

        report.chunks_written = chunk_index;
        report.cross_edges = edges.len();
        report.unresolved = unresolved.len() + dropped;
        Ok(report)
    }

    /// Leftovers of a partial build: look their names up among stored nodes.
    fn resolve_from_store(
        &self,
        scope: &GraphScope,
        imports: &mut ImportMap,
        deferred: Vec<DeferredEdge>,
    ) -> Result<resolve::Resolution, IngestError> {
        let names: BTreeSet<&str> = deferred.iter().filter_map(DeferredEdge::symbol_name).collect();
        let mut found: HashMap<NodeId, GraphNode> = HashMap::new();
        for name in names {
            let pattern = NamePattern::exact(name);
            let nodes = self
                .with_retry(|| self.store.find_by_name(scope, &pattern, None))
                .map_err(IngestError::Query)?;
            for node in nodes {
                found.insert(node.id.clone(), node);
            }
        }
        let mut nodes: Vec<GraphNode> = found.into_values().collect();
        crate::store::sort_nodes(&mut nodes);
        let table = SymbolTable::from_nodes(&nodes);
        Ok(resolve_deferred(&table, imports, deferred))
    }

    /// Edges whose far end lives outside the batch are kept only when the
    /// store already has that node. Returns how many were dropped.
    fn drop_external_dangling(
        &self,
        batch: &IngestionBatch,
        edges: &mut Vec<GraphEdge>,
    ) -> Result<usize, IngestError> {
        let local: HashSet<&NodeId> = batch
            .units
            .iter()
            .flat_map(|unit| unit.nodes.iter().map(|node| &node.id))
            .chain(std::iter::once(&batch.repository.id))
            .collect();
        let external: BTreeSet<NodeId> = edges
            .iter()
            .flat_map(|edge| [&edge.source, &edge.target])
            .filter(|id| !local.contains(id))
            .cloned()
            .collect();
        if external.is_empty() {
            return Ok(0);
        }
        let ids: Vec<NodeId> = external.into_iter().collect();
        let stored: HashSet<NodeId> = self
            .with_retry(|| self.store.get_nodes(&ids))
            .map_err(IngestError::Query)?
            .into_iter()
            .map(|node| node.id)
            .collect();
        let before = edges.len();
        edges.retain(|edge| {
            (local.contains(&edge.source) || stored.contains(&edge.source))
                && (local.contains(&edge.target) || stored.contains(&edge.target))
        });
        Ok(before - edges.len())
    }

    fn write_chunk(&self, chunk_index: usize, chunk: &Chunk) -> Result<WriteReport, IngestError> {
        let attempts = self.builder.config().store_retries.max(1);
        let backoff = &self.builder.config().store_backoff;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.write_batch(&chunk.nodes, &chunk.edges) {
                Ok(report) => return Ok(report),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    let delay = backoff.delay(attempt);
                    tracing::warn!(
                        chunk = chunk_index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "ingest.chunk_retry"
                    );
                    std::thread::sleep(delay);
                }
                Err(source) => {
                    return Err(IngestError::Store {
                        chunk: chunk_index,
                        source,
                    });
                }
            }
        }
    }

    fn with_retry<T>(&self, mut op: impl FnMut() -> Result<T, StoreError>) -> Result<T, StoreError> {
        let attempts = self.builder.config().store_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Err(err) if err.is_retryable() && attempt < attempts => {
                    std::thread::sleep(self.builder.config().store_backoff.delay(attempt));
                }
                other => return other,
            }
        }
    }
}
