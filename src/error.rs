//! Typed errors for each component seam.
//!
//! - `ParseError` is per file and absorbed by the graph builder
//! - `StoreError` comes from the graph store and may be retryable
//! - `IngestError` aborts an ingestion run (replay is idempotent)
//! - `CompletionError`, `PatchError`, `RunnerError` are consumed by the agent state machine
//! - `FailureReason` is the terminal reason code carried by a failed session

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no parser registered for language {language} ({path})")]
    Unsupported { path: String, language: String },

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is larger than {limit} bytes")]
    TooLarge { path: String, limit: u64 },

    #[error("{path} has syntax errors near line {line}")]
    Syntax { path: String, line: usize },

    #[error("parser produced no tree for {path}")]
    NoTree { path: String },

    #[error("failed to load grammar for {language}: {message}")]
    Grammar { language: String, message: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("graph store unavailable: {0}")]
    Unavailable(String),

    #[error("edge {kind} {source_id} -> {target_id} references a node that does not exist")]
    DanglingEdge {
        source_id: String,
        target_id: String,
        kind: String,
    },

    #[error("stored value is invalid: {0}")]
    Corrupt(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

impl StoreError {
    /// Whether the operation may succeed when repeated unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Unavailable(_) | StoreError::Pool(_) => true,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("store write failed on chunk {chunk} (safe to replay): {source}")]
    Store {
        chunk: usize,
        #[source]
        source: StoreError,
    },

    #[error("graph store query failed: {0}")]
    Query(#[from] StoreError),

    #[error("repository {0} is locked by an active session")]
    RepositoryBusy(String),

    #[error("failed to scan repository {path}: {message}")]
    Scan { path: PathBuf, message: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl IngestError {
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::Store { .. } | IngestError::RepositoryBusy(_) => true,
            IngestError::Query(err) => err.is_retryable(),
            IngestError::Scan { .. } | IngestError::Config(_) => false,
        }
    }
}

/// Failures of the text-generation backend. All three are retryable
/// generation failures from the state machine's point of view.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompletionError {
    #[error("completion backend rate limited the request")]
    RateLimited,

    #[error("completion backend unavailable: {0}")]
    Unavailable(String),

    #[error("completion backend returned malformed output: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("malformed diff: {0}")]
    Malformed(String),

    #[error("diff does not apply: {0}")]
    DoesNotApply(String),

    #[error("working checkout corrupted: {0}")]
    CheckoutCorrupted(String),
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("working directory {0} does not exist")]
    MissingWorkingDir(PathBuf),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Reason code carried by a session that ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    GenerationExhausted,
    ApplyExhausted,
    VerifyExhausted,
    Timeout,
    CheckoutCorrupted,
    StoreUnavailable,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::GenerationExhausted => "generation_exhausted",
            FailureReason::ApplyExhausted => "apply_exhausted",
            FailureReason::VerifyExhausted => "verify_exhausted",
            FailureReason::Timeout => "timeout",
            FailureReason::CheckoutCorrupted => "checkout_corrupted",
            FailureReason::StoreUnavailable => "store_unavailable",
        }
    }

    /// Retrying the whole request could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureReason::CheckoutCorrupted)
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_unavailable_is_retryable() {
        assert!(StoreError::Unavailable("down".into()).is_retryable());
        assert!(!StoreError::Corrupt("bad kind".into()).is_retryable());
        let dangling = StoreError::DanglingEdge {
            source_id: "n_a".into(),
            target_id: "n_b".into(),
            kind: "calls".into(),
        };
        assert!(!dangling.is_retryable());
    }

    #[test]
    fn sqlite_busy_is_retryable() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(StoreError::Sqlite(busy).is_retryable());
    }

    #[test]
    fn ingest_store_error_mentions_chunk() {
        let err = IngestError::Store {
            chunk: 4,
            source: StoreError::Unavailable("disk full".into()),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("chunk 4"));
    }

    #[test]
    fn failure_reason_serializes_snake_case() {
        let json = serde_json::to_string(&FailureReason::ApplyExhausted).unwrap();
        assert_eq!(json, "\"apply_exhausted\"");
        assert_eq!(FailureReason::VerifyExhausted.to_string(), "verify_exhausted");
        assert!(!FailureReason::CheckoutCorrupted.is_retryable());
        assert!(FailureReason::Timeout.is_retryable());
    }

    #[test]
    fn completion_errors_are_distinct() {
        let err = CompletionError::RateLimited;
        assert!(matches!(err, CompletionError::RateLimited));
        assert!(!matches!(err, CompletionError::Unavailable(_)));
    }
}
