// Configuration for repograph.
// Defaults, then an optional TOML file, then REPOGRAPH_* environment overrides.
// The resulting value is passed explicitly to every component.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ingest: IngestConfig,
    pub retrieval: RetrievalConfig,
    pub agent: AgentConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Maximum depth of a graph node below its file root (REPOGRAPH_MAX_DEPTH)
    pub max_depth: usize,

    /// Maximum nodes + edges per store write (REPOGRAPH_BATCH_SIZE)
    pub batch_size: usize,

    /// Parser worker threads; 0 uses the available parallelism
    pub parse_threads: usize,

    /// Files larger than this are skipped
    pub max_file_bytes: u64,

    /// Emit Statement nodes under functions
    pub statement_nodes: bool,

    pub follow_gitignore: bool,

    /// Index .md/.txt/.rst files as chunked prose
    pub index_documents: bool,

    /// Upper bound on characters per document chunk
    pub doc_chunk_chars: usize,

    /// Attempts per chunk before ingestion aborts
    pub store_retries: u32,

    pub store_backoff: BackoffConfig,
}

impl IngestConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_depth == 0 {
            return Err(ConfigError::Invalid("ingest.max_depth must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("ingest.batch_size must be > 0".into()));
        }
        if self.doc_chunk_chars == 0 {
            return Err(ConfigError::Invalid(
                "ingest.doc_chunk_chars must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_depth: 24,
            batch_size: 500,
            parse_threads: 0,
            max_file_bytes: 1024 * 1024,
            statement_nodes: false,
            follow_gitignore: true,
            index_documents: true,
            doc_chunk_chars: 1_000,
            store_retries: 3,
            store_backoff: BackoffConfig {
                strategy: BackoffStrategy::Exponential,
                base_ms: 100,
                max_ms: 2_000,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Token budget when a caller does not give one (REPOGRAPH_TOKEN_BUDGET)
    pub token_budget: usize,
    pub max_hops: usize,
    pub max_nodes: usize,
    pub min_relevance: f64,
    pub chars_per_token: usize,
    pub max_fragment_lines: usize,
    /// Full-text anchors taken per quoted phrase
    pub max_text_matches: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            token_budget: 6_000,
            max_hops: 3,
            max_nodes: 200,
            min_relevance: 0.2,
            chars_per_token: 4,
            max_fragment_lines: 80,
            max_text_matches: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// R1: consecutive generation/apply failures allowed (REPOGRAPH_MAX_GENERATION_ATTEMPTS)
    pub max_generation_attempts: u32,

    /// R2: build+test failures allowed per session (REPOGRAPH_MAX_VERIFY_ATTEMPTS)
    pub max_verify_attempts: u32,

    pub backoff: BackoffConfig,

    pub session_timeout_secs: u64,
    pub command_timeout_secs: u64,

    /// History entries replayed verbatim into a prompt
    pub max_history_entries: usize,

    /// Tail of build/test output kept per history entry
    pub max_log_bytes: usize,

    pub store_retries: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_generation_attempts: 3,
            max_verify_attempts: 2,
            backoff: BackoffConfig::default(),
            session_timeout_secs: 30 * 60,
            command_timeout_secs: 10 * 60,
            max_history_entries: 12,
            max_log_bytes: 8 * 1024,
            store_retries: 3,
        }
    }
}

impl AgentConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub strategy: BackoffStrategy,
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_ms: 500,
            max_ms: 30_000,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (1-based). Never decreases, never exceeds `max_ms`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let ms = match self.strategy {
            BackoffStrategy::Linear => self.base_ms.saturating_mul(u64::from(attempt)),
            BackoffStrategy::Exponential => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                self.base_ms.saturating_mul(factor)
            }
        };
        Duration::from_millis(ms.min(self.max_ms))
    }

    pub fn none() -> Self {
        Self {
            strategy: BackoffStrategy::Linear,
            base_ms: 0,
            max_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Read connection pool size (REPOGRAPH_POOL_SIZE)
    pub pool_size: u32,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            busy_timeout_ms: 5_000,
        }
    }
}

impl Config {
    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Config::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply REPOGRAPH_* overrides from `lookup`. Invalid values are ignored with a warning.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        override_value(&lookup, "REPOGRAPH_MAX_DEPTH", &mut self.ingest.max_depth);
        override_value(&lookup, "REPOGRAPH_BATCH_SIZE", &mut self.ingest.batch_size);
        override_value(&lookup, "REPOGRAPH_PARSE_THREADS", &mut self.ingest.parse_threads);
        override_value(
            &lookup,
            "REPOGRAPH_STATEMENT_NODES",
            &mut self.ingest.statement_nodes,
        );
        override_value(
            &lookup,
            "REPOGRAPH_INDEX_DOCUMENTS",
            &mut self.ingest.index_documents,
        );
        override_value(
            &lookup,
            "REPOGRAPH_TOKEN_BUDGET",
            &mut self.retrieval.token_budget,
        );
        override_value(
            &lookup,
            "REPOGRAPH_MAX_GENERATION_ATTEMPTS",
            &mut self.agent.max_generation_attempts,
        );
        override_value(
            &lookup,
            "REPOGRAPH_MAX_VERIFY_ATTEMPTS",
            &mut self.agent.max_verify_attempts,
        );
        override_value(
            &lookup,
            "REPOGRAPH_SESSION_TIMEOUT_SECS",
            &mut self.agent.session_timeout_secs,
        );
        override_value(
            &lookup,
            "REPOGRAPH_COMMAND_TIMEOUT_SECS",
            &mut self.agent.command_timeout_secs,
        );
        override_value(&lookup, "REPOGRAPH_POOL_SIZE", &mut self.store.pool_size);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ingest.validate()?;
        if self.retrieval.token_budget == 0 {
            return Err(ConfigError::Invalid(
                "retrieval.token_budget must be > 0".into(),
            ));
        }
        if self.retrieval.chars_per_token == 0 {
            return Err(ConfigError::Invalid(
                "retrieval.chars_per_token must be > 0".into(),
            ));
        }
        if self.agent.max_generation_attempts == 0 {
            return Err(ConfigError::Invalid(
                "agent.max_generation_attempts must be > 0".into(),
            ));
        }
        if self.agent.max_verify_attempts == 0 {
            return Err(ConfigError::Invalid(
                "agent.max_verify_attempts must be > 0".into(),
            ));
        }
        if self.store.pool_size == 0 {
            return Err(ConfigError::Invalid("store.pool_size must be > 0".into()));
        }
        Ok(())
    }
}

fn override_value<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => tracing::warn!(
            key,
            value = %raw,
            default = %slot,
            "invalid configuration override, keeping current value"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.ingest.max_depth, 24);
        assert_eq!(config.ingest.batch_size, 500);
        assert_eq!(config.agent.max_generation_attempts, 3);
        assert_eq!(config.agent.max_verify_attempts, 2);
        assert_eq!(config.retrieval.token_budget, 6_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides_apply_and_ignore_garbage() {
        let env: HashMap<&str, &str> = [
            ("REPOGRAPH_MAX_DEPTH", "7"),
            ("REPOGRAPH_BATCH_SIZE", "lots"),
            ("REPOGRAPH_STATEMENT_NODES", "true"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.ingest.max_depth, 7);
        assert_eq!(config.ingest.batch_size, 500);
        assert!(config.ingest.statement_nodes);
    }

    #[test]
    fn test_toml_partial_sections() {
        let config: Config = toml::from_str(
            r#"
            [agent]
            max_generation_attempts = 5

            [agent.backoff]
            strategy = "linear"
            base_ms = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.agent.max_generation_attempts, 5);
        assert_eq!(config.agent.max_verify_attempts, 2);
        assert_eq!(config.agent.backoff.strategy, BackoffStrategy::Linear);
        assert_eq!(config.agent.backoff.max_ms, 30_000);
        assert_eq!(config.ingest.max_depth, 24);
    }

    #[test]
    fn test_validate_rejects_zero_budgets() {
        let mut config = Config::default();
        config.ingest.batch_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.agent.max_generation_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.ingest.doc_chunk_chars = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_increases_and_caps() {
        let exp = BackoffConfig {
            strategy: BackoffStrategy::Exponential,
            base_ms: 100,
            max_ms: 1_000,
        };
        assert_eq!(exp.delay(1), Duration::from_millis(100));
        assert_eq!(exp.delay(2), Duration::from_millis(200));
        assert_eq!(exp.delay(4), Duration::from_millis(800));
        assert_eq!(exp.delay(5), Duration::from_millis(1_000));
        assert_eq!(exp.delay(80), Duration::from_millis(1_000));

        let linear = BackoffConfig {
            strategy: BackoffStrategy::Linear,
            base_ms: 100,
            max_ms: 250,
        };
        assert_eq!(linear.delay(2), Duration::from_millis(200));
        assert_eq!(linear.delay(3), Duration::from_millis(250));
        assert_eq!(BackoffConfig::none().delay(9), Duration::ZERO);
    }
}
