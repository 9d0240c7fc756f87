use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use repograph::config::{BackoffConfig, IngestConfig, RetrievalConfig};
use repograph::indexer::Indexer;
use repograph::model::RepositoryRef;
use repograph::retrieve::ContextRetriever;
use repograph::store::MemoryGraphStore;
use std::path::Path;
use std::sync::Arc;

/// `modules` Python files, each calling into the previous one.
fn synthetic_repo(root: &Path, modules: usize) {
    let pkg = root.join("pkg");
    std::fs::create_dir_all(&pkg).unwrap();
    for i in 0..modules {
        let mut source = String::new();
        if i > 0 {
            source.push_str(&format!("from pkg.mod_{} import step_{}\n\n\n", i - 1, i - 1));
        }
        source.push_str(&format!("class Worker{i}:\n    def run(self, x):\n        return step_{i}(x)\n\n\n"));
        source.push_str(&format!("def step_{i}(x):\n"));
        if i > 0 {
            source.push_str(&format!("    return step_{}(x) + {i}\n", i - 1));
        } else {
            source.push_str("    return x\n");
        }
        std::fs::write(pkg.join(format!("mod_{i}.py")), source).unwrap();
    }
}

fn config() -> IngestConfig {
    IngestConfig {
        store_backoff: BackoffConfig::none(),
        ..IngestConfig::default()
    }
}

fn bench_ingest(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest");
    group.sample_size(10);
    for modules in [10usize, 100] {
        let dir = tempfile::tempdir().unwrap();
        synthetic_repo(dir.path(), modules);
        let repo = RepositoryRef::open(dir.path(), Some("bench")).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(modules), &repo, |b, repo| {
            b.iter(|| {
                let indexer = Indexer::new(Arc::new(MemoryGraphStore::new()), config());
                black_box(indexer.ingest(black_box(repo)).unwrap())
            })
        });
    }
    group.finish();
}

fn bench_retrieve(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    synthetic_repo(dir.path(), 100);
    let repo = RepositoryRef::open(dir.path(), Some("bench")).unwrap();
    let store = Arc::new(MemoryGraphStore::new());
    Indexer::new(store.clone(), config()).ingest(&repo).unwrap();
    let retriever = ContextRetriever::new(store, RetrievalConfig::default());

    c.bench_function("retrieve_step_50", |b| {
        b.iter(|| {
            black_box(
                retriever
                    .retrieve(black_box("why does `step_50` overflow?"), &repo, 6_000)
                    .unwrap(),
            )
        })
    });
}

criterion_group!(benches, bench_ingest, bench_retrieve);
criterion_main!(benches);
