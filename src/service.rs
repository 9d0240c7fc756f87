//! Entry points shared by the CLI and library callers. One `Engine` per store;
//! it is cheap to clone and safe to use from many tasks.

use crate::agent::{AgentStateMachine, Collaborators, RepositoryLocks, ResolutionOutcome, ResolutionRequest};
use crate::config::Config;
use crate::error::{IngestError, StoreError};
use crate::indexer::Indexer;
use crate::model::{IngestionSummary, RepositoryRef, RetrievedContext};
use crate::retrieve::ContextRetriever;
use crate::store::GraphStore;
use std::sync::Arc;

/// Per-call ingestion limits; `None` keeps the configured value.
#[derive(Debug, Clone, Copy, Default)]
pub struct IngestOverrides {
    pub max_depth: Option<usize>,
    pub batch_size: Option<usize>,
}

#[derive(Clone)]
pub struct Engine {
    config: Arc<Config>,
    store: Arc<dyn GraphStore>,
    locks: RepositoryLocks,
}

impl Engine {
    pub fn new(config: Config, store: Arc<dyn GraphStore>) -> Self {
        Self {
            config: Arc::new(config),
            store,
            locks: RepositoryLocks::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    pub fn locks(&self) -> &RepositoryLocks {
        &self.locks
    }

    /// Fails fast with `RepositoryBusy` while a session holds the repository.
    /// Overrides are validated like the configuration they replace.
    pub fn ingest(
        &self,
        repo: &RepositoryRef,
        overrides: IngestOverrides,
    ) -> Result<IngestionSummary, IngestError> {
        let mut ingest = self.config.ingest.clone();
        if let Some(max_depth) = overrides.max_depth {
            ingest.max_depth = max_depth;
        }
        if let Some(batch_size) = overrides.batch_size {
            ingest.batch_size = batch_size;
        }
        ingest.validate()?;

        let _lease = self.locks.try_exclusive(&repo.key())?;
        tracing::info!(
            repository = %repo.key(),
            revision = %repo.revision,
            max_depth = ingest.max_depth,
            batch_size = ingest.batch_size,
            "ingest.start"
        );
        Indexer::new(self.store.clone(), ingest).ingest(repo)
    }

    pub fn retrieve(
        &self,
        query: &str,
        repo: &RepositoryRef,
        token_budget: Option<usize>,
    ) -> Result<RetrievedContext, StoreError> {
        let budget = token_budget.unwrap_or(self.config.retrieval.token_budget);
        ContextRetriever::new(self.store.clone(), self.config.retrieval.clone()).retrieve(query, repo, budget)
    }

    /// Waits for a running ingestion of the same repository, then holds it
    /// shared until the session ends.
    pub async fn resolve(
        &self,
        request: ResolutionRequest,
        collaborators: Collaborators,
    ) -> ResolutionOutcome {
        let _lease = self.locks.shared(&request.repository.key()).await;
        AgentStateMachine::new(self.store.clone(), &self.config)
            .run(request, collaborators)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use crate::store::MemoryGraphStore;

    fn engine() -> Engine {
        Engine::new(Config::default(), Arc::new(MemoryGraphStore::new()))
    }

    #[test]
    fn ingest_then_retrieve() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("calc.py"),
            "def add(a, b):\n    return a + b\n\n\ndef total(xs):\n    return add(xs[0], xs[1])\n",
        )
        .unwrap();
        let repo = RepositoryRef::open(dir.path(), Some("v1")).unwrap();
        let engine = engine();

        let summary = engine.ingest(&repo, IngestOverrides::default()).unwrap();
        assert_eq!(summary.files_processed, 1);

        let context = engine.retrieve("what calls `add`?", &repo, Some(500)).unwrap();
        assert!(!context.is_empty());
        assert_eq!(context.fragments[0].qualname, "calc.add");
    }

    #[test]
    fn zero_overrides_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "def a():\n    return 1\n").unwrap();
        let repo = RepositoryRef::open(dir.path(), Some("v1")).unwrap();
        let store = Arc::new(MemoryGraphStore::new());
        let engine = Engine::new(Config::default(), store.clone());

        for overrides in [
            IngestOverrides {
                max_depth: Some(0),
                ..IngestOverrides::default()
            },
            IngestOverrides {
                batch_size: Some(0),
                ..IngestOverrides::default()
            },
        ] {
            let err = engine.ingest(&repo, overrides).unwrap_err();
            assert!(matches!(err, IngestError::Config(ConfigError::Invalid(_))), "{err}");
            assert!(!err.is_retryable());
        }
        assert_eq!(store.digest(&repo.scope()).unwrap().nodes, 0);
    }

    #[tokio::test]
    async fn ingest_is_refused_while_a_session_holds_the_repository() {
        let dir = tempfile::tempdir().unwrap();
        let repo = RepositoryRef::open(dir.path(), Some("v1")).unwrap();
        let engine = engine();
        let _session = engine.locks().shared(&repo.key()).await;
        let err = engine.ingest(&repo, IngestOverrides::default()).unwrap_err();
        assert!(matches!(err, IngestError::RepositoryBusy(_)));
    }
}
