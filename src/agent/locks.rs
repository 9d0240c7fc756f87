use crate::error::IngestError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

pub type SessionLease = OwnedRwLockReadGuard<()>;
pub type IngestLease = OwnedRwLockWriteGuard<()>;

/// Soft per-repository locks: any number of sessions share a repository, and
/// ingestion needs it exclusively. Keys are repository keys (canonical paths).
#[derive(Debug, Default, Clone)]
pub struct RepositoryLocks {
    locks: Arc<Mutex<HashMap<String, Arc<RwLock<()>>>>>,
}

impl RepositoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &str) -> Arc<RwLock<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Held by a session for its lifetime. Waits while an ingestion runs.
    pub async fn shared(&self, key: &str) -> SessionLease {
        self.lock_for(key).read_owned().await
    }

    /// Fails fast with `RepositoryBusy` while any session holds the repository.
    pub fn try_exclusive(&self, key: &str) -> Result<IngestLease, IngestError> {
        self.lock_for(key)
            .try_write_owned()
            .map_err(|_| IngestError::RepositoryBusy(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ingestion_is_refused_while_a_session_runs() {
        let locks = RepositoryLocks::new();
        let lease = locks.shared("/repo").await;
        assert!(matches!(
            locks.try_exclusive("/repo"),
            Err(IngestError::RepositoryBusy(_))
        ));
        // other repositories are unaffected
        assert!(locks.try_exclusive("/other").is_ok());
        drop(lease);
        assert!(locks.try_exclusive("/repo").is_ok());
    }

    #[tokio::test]
    async fn sessions_share_a_repository() {
        let locks = RepositoryLocks::new();
        let _a = locks.shared("/repo").await;
        let _b = locks.shared("/repo").await;
        assert!(locks.try_exclusive("/repo").is_err());
    }
}
