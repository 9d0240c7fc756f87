use repograph::config::{BackoffConfig, Config, StoreConfig};
use repograph::model::{EdgeKind, NodeKind, RepositoryRef};
use repograph::store::{GraphStore, MemoryGraphStore, NamePattern, SqliteGraphStore};
use repograph::{Engine, IngestOverrides};
use std::path::Path;
use std::sync::Arc;

fn write(root: &Path, rel: &str, text: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, text).unwrap();
}

fn config() -> Config {
    let mut config = Config::default();
    config.ingest.store_backoff = BackoffConfig::none();
    config
}

fn memory_engine() -> (Engine, Arc<MemoryGraphStore>) {
    let store = Arc::new(MemoryGraphStore::new());
    (Engine::new(config(), store.clone()), store)
}

#[test]
fn single_file_with_an_internal_call() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "app.py",
        "def helper():\n    return 1\n\n\ndef main():\n    return helper()\n",
    );
    let repo = RepositoryRef::open(dir.path(), Some("v1")).unwrap();
    let (engine, store) = memory_engine();

    let summary = engine.ingest(&repo, IngestOverrides::default()).unwrap();
    assert_eq!(summary.files_processed, 1);
    assert_eq!(summary.files_skipped, 0);
    assert_eq!(summary.unresolved_references, 0);

    let overview = store.overview(&repo.scope()).unwrap();
    assert_eq!(overview.nodes.get("file"), Some(&1));
    assert_eq!(overview.nodes.get("function"), Some(&2));
    assert_eq!(overview.edges.get("calls"), Some(&1));

    let scope = repo.scope();
    let file = store.nodes_in_file(&scope, "app.py").unwrap();
    let file_id = file
        .iter()
        .find(|node| node.kind == NodeKind::File)
        .map(|node| node.id.clone())
        .unwrap();
    for name in ["helper", "main"] {
        let function = store
            .find_by_name(&scope, &NamePattern::exact(name), Some(NodeKind::Function))
            .unwrap();
        assert_eq!(function.len(), 1);
        let contains = store
            .edges_touching(std::slice::from_ref(&function[0].id), &[EdgeKind::Contains])
            .unwrap();
        assert_eq!(contains.len(), 1, "{name} has one container");
        assert_eq!(contains[0].source, file_id);
    }

    let main = store
        .find_by_name(&scope, &NamePattern::exact("main"), Some(NodeKind::Function))
        .unwrap();
    let callees = store
        .get_neighbors(&main[0].id, &[EdgeKind::Calls], 1)
        .unwrap();
    assert_eq!(callees.len(), 1);
    assert_eq!(callees[0].node.qualname, "app.helper");
}

#[test]
fn reingesting_a_revision_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "pkg/util.py", "def helper():\n    return 1\n");
    write(
        dir.path(),
        "pkg/main.py",
        "from pkg.util import helper\n\n\ndef run():\n    return helper()\n",
    );
    let repo = RepositoryRef::open(dir.path(), Some("v1")).unwrap();
    let (engine, store) = memory_engine();

    engine.ingest(&repo, IngestOverrides::default()).unwrap();
    let before = store.digest(&repo.scope()).unwrap();
    // small batches write the same graph in more chunks
    let again = engine
        .ingest(
            &repo,
            IngestOverrides {
                batch_size: Some(3),
                ..IngestOverrides::default()
            },
        )
        .unwrap();
    assert!(again.chunks_written > 1);
    assert_eq!(store.digest(&repo.scope()).unwrap(), before);
}

#[test]
fn revisions_live_side_by_side() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.py", "def first():\n    return 1\n");
    let (engine, store) = memory_engine();

    let v1 = RepositoryRef::open(dir.path(), Some("v1")).unwrap();
    engine.ingest(&v1, IngestOverrides::default()).unwrap();
    write(dir.path(), "a.py", "def second():\n    return 2\n");
    let v2 = RepositoryRef::open(dir.path(), Some("v2")).unwrap();
    engine.ingest(&v2, IngestOverrides::default()).unwrap();

    let first = NamePattern::exact("first");
    assert_eq!(store.find_by_name(&v1.scope(), &first, None).unwrap().len(), 1);
    assert!(store.find_by_name(&v2.scope(), &first, None).unwrap().is_empty());
    assert_eq!(
        store.latest_revision(&v1.key()).unwrap().as_deref(),
        Some("v2")
    );
}

#[test]
fn depth_bound_omits_nested_declarations() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "nested.py",
        "class Outer:\n    class Inner:\n        def deep(self):\n            return 1\n",
    );
    let repo = RepositoryRef::open(dir.path(), Some("v1")).unwrap();
    let (engine, store) = memory_engine();

    let summary = engine
        .ingest(
            &repo,
            IngestOverrides {
                max_depth: Some(3),
                ..IngestOverrides::default()
            },
        )
        .unwrap();
    assert!(summary.truncated_nodes > 0);

    let scope = repo.scope();
    assert!(store
        .find_by_name(&scope, &NamePattern::exact("deep"), None)
        .unwrap()
        .is_empty());
    let outer = store
        .find_by_name(&scope, &NamePattern::exact("Outer"), Some(NodeKind::Type))
        .unwrap();
    assert_eq!(outer.len(), 1);
    let (ids, _) = store.scope_contents(&scope).unwrap();
    for node in store.get_nodes(&ids).unwrap() {
        assert!(node.depth <= 3, "{} at depth {}", node.qualname, node.depth);
    }
}

#[test]
fn broken_files_are_skipped_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "good.py", "def ok():\n    return 1\n");
    write(dir.path(), "bad.py", "def broken(:\n    return\n");
    let repo = RepositoryRef::open(dir.path(), Some("v1")).unwrap();
    let (engine, store) = memory_engine();

    let summary = engine.ingest(&repo, IngestOverrides::default()).unwrap();
    assert_eq!(summary.files_processed, 1);
    assert_eq!(summary.files_skipped, 1);
    assert_eq!(summary.skipped[0].path, "bad.py");
    assert!(store.nodes_in_file(&repo.scope(), "bad.py").unwrap().is_empty());
}

#[test]
fn mixed_language_repository() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "src/lib.rs",
        "pub struct Stack {\n    items: Vec<u32>,\n}\n\nfn helper() -> u32 {\n    1\n}\n\npub fn run() -> u32 {\n    helper()\n}\n",
    );
    write(
        dir.path(),
        "cmd/main.go",
        "package main\n\nfunc helper() int {\n\treturn 1\n}\n\nfunc run() int {\n\treturn helper()\n}\n",
    );
    write(
        dir.path(),
        "web/app.ts",
        "export function helper(): number {\n  return 1;\n}\n\nexport function run(): number {\n  return helper();\n}\n",
    );
    write(
        dir.path(),
        "Billing/Invoice.cs",
        "namespace Billing {\n  public class Invoice {\n    public int Helper() { return 1; }\n    public int Run() { return Helper(); }\n  }\n}\n",
    );
    let repo = RepositoryRef::open(dir.path(), Some("v1")).unwrap();
    let (engine, store) = memory_engine();

    let summary = engine.ingest(&repo, IngestOverrides::default()).unwrap();
    assert_eq!(summary.files_processed, 4);

    let scope = repo.scope();
    let overview = store.overview(&scope).unwrap();
    assert_eq!(overview.languages.len(), 4);

    let runs = store
        .find_by_name(&scope, &NamePattern::exact("run"), Some(NodeKind::Function))
        .unwrap();
    // case-insensitive: the C# Run matches too
    assert_eq!(runs.len(), 4);
    for run in &runs {
        let callees = store
            .get_neighbors(&run.id, &[EdgeKind::Calls], 1)
            .unwrap();
        assert_eq!(callees.len(), 1, "{} calls its helper", run.qualname);
        assert_eq!(callees[0].node.file_path(), run.file_path());
    }

    let stack = store
        .find_by_name(&scope, &NamePattern::exact("Stack"), Some(NodeKind::Type))
        .unwrap();
    assert_eq!(stack[0].qualname, "crate::Stack");
}

#[test]
fn sqlite_store_matches_memory_store() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "pkg/util.py", "def helper():\n    return 1\n");
    write(
        dir.path(),
        "pkg/main.py",
        "from pkg.util import helper\n\n\ndef run():\n    return helper()\n",
    );
    let repo = RepositoryRef::open(dir.path(), Some("v1")).unwrap();

    let db_dir = tempfile::tempdir().unwrap();
    let sqlite = Arc::new(
        SqliteGraphStore::open(&db_dir.path().join("graph.sqlite"), &StoreConfig::default())
            .unwrap(),
    );
    Engine::new(config(), sqlite.clone())
        .ingest(&repo, IngestOverrides::default())
        .unwrap();
    let (memory_engine, memory) = memory_engine();
    memory_engine.ingest(&repo, IngestOverrides::default()).unwrap();

    assert_eq!(
        sqlite.digest(&repo.scope()).unwrap(),
        memory.digest(&repo.scope()).unwrap()
    );
}

#[test]
fn documents_become_chained_chunks() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "lib.py", "def entry():\n    return 1\n");
    write(
        dir.path(),
        "README.md",
        "# Project\n\nShort intro.\n\n# Install\n\nRun the setup script.\n",
    );
    write(dir.path(), "notes.txt", "\n\n");
    let repo = RepositoryRef::open(dir.path(), Some("v1")).unwrap();
    let mut config = config();
    config.ingest.doc_chunk_chars = 34;
    let store = Arc::new(MemoryGraphStore::new());
    let engine = Engine::new(config, store.clone());

    let summary = engine.ingest(&repo, IngestOverrides::default()).unwrap();
    assert_eq!(summary.files_processed, 3);

    let scope = repo.scope();
    let nodes = store.nodes_in_file(&scope, "README.md").unwrap();
    let chunks: Vec<_> = nodes
        .iter()
        .filter(|node| node.kind == NodeKind::Chunk)
        .collect();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].name, "Project");
    assert_eq!(chunks[1].name, "Install");
    let file = nodes.iter().find(|node| node.kind == NodeKind::File).unwrap();
    assert!(file.text.as_deref().unwrap().contains("Run the setup script."));

    let next = store
        .edges_touching(std::slice::from_ref(&chunks[0].id), &[EdgeKind::NextChunk])
        .unwrap();
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].target, chunks[1].id);

    // the empty text file is a file without chunks
    let notes = store.nodes_in_file(&scope, "notes.txt").unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].kind, NodeKind::File);
}
