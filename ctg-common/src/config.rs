//! Environment-driven configuration, validated at startup
//!
//! Every recognized option is read and checked once, before any store or
//! broker connection is opened. A missing or invalid value is a fatal
//! configuration error; the binary maps it to exit code 1.

use crate::{Error, Result};
use std::path::PathBuf;

/// Default Neo4j credential that must never reach production.
const DEFAULT_GRAPH_PASSWORD: &str = "neo4j";

/// Graph store connection settings
#[derive(Debug, Clone)]
pub struct Neo4jConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
    pub database: String,
}

/// Broker connection settings
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub password: Option<String>,
}

/// Per-worker-type concurrency levels
#[derive(Debug, Clone, Copy)]
pub struct WorkerConcurrency {
    pub file_analysis: usize,
    pub directory: usize,
    pub relationship: usize,
    pub validation: usize,
    pub reconciliation: usize,
    pub graph_builder: usize,
}

impl Default for WorkerConcurrency {
    fn default() -> Self {
        Self {
            file_analysis: 4,
            directory: 2,
            relationship: 2,
            validation: 4,
            reconciliation: 8,
            graph_builder: 1,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub target_directory: PathBuf,
    pub sqlite_db_path: PathBuf,
    pub neo4j: Neo4jConfig,
    pub redis: RedisConfig,
    pub anthropic_api_key: String,
    /// Max outbox rows drained per publisher tick
    pub ingestor_batch_size: usize,
    /// Publisher poll interval in milliseconds
    pub ingestor_interval_ms: u64,
    pub max_batch_tokens: usize,
    pub max_batch_files: usize,
    pub workers: WorkerConcurrency,
    pub oracle_timeout_ms: u64,
    pub oracle_max_concurrent: usize,
    pub max_job_attempts: u32,
    /// True when CTG_ENV=production; enables credential hardening checks
    pub production: bool,
}

impl AppConfig {
    /// Load and validate configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Tests pass a map here so config
    /// validation can be exercised without mutating process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let production = lookup("CTG_ENV")
            .map(|v| v.eq_ignore_ascii_case("production"))
            .unwrap_or(false);

        let target_directory = PathBuf::from(require(&lookup, "TARGET_DIRECTORY")?);
        let sqlite_db_path = PathBuf::from(require(&lookup, "SQLITE_DB_PATH")?);

        let neo4j = Neo4jConfig {
            uri: require(&lookup, "NEO4J_URI")?,
            user: require(&lookup, "NEO4J_USER")?,
            password: require(&lookup, "NEO4J_PASSWORD")?,
            database: lookup("NEO4J_DATABASE").unwrap_or_else(|| "neo4j".to_string()),
        };

        let redis = RedisConfig {
            url: require(&lookup, "REDIS_URL")?,
            password: lookup("REDIS_PASSWORD").filter(|p| !p.is_empty()),
        };

        let anthropic_api_key = require(&lookup, "ANTHROPIC_API_KEY")?;

        if production {
            if neo4j.password == DEFAULT_GRAPH_PASSWORD {
                return Err(Error::Config(
                    "NEO4J_PASSWORD must not be the default in production".to_string(),
                ));
            }
            if redis.password.is_none() {
                return Err(Error::Config(
                    "REDIS_PASSWORD is required in production".to_string(),
                ));
            }
        }

        let workers = WorkerConcurrency {
            file_analysis: positive(&lookup, "WORKER_CONCURRENCY_FILE_ANALYSIS", 4)?,
            directory: positive(&lookup, "WORKER_CONCURRENCY_DIRECTORY", 2)?,
            relationship: positive(&lookup, "WORKER_CONCURRENCY_RELATIONSHIP", 2)?,
            validation: positive(&lookup, "WORKER_CONCURRENCY_VALIDATION", 4)?,
            reconciliation: positive(&lookup, "WORKER_CONCURRENCY_RECONCILIATION", 8)?,
            graph_builder: positive(&lookup, "WORKER_CONCURRENCY_GRAPH_BUILDER", 1)?,
        };

        Ok(Self {
            target_directory,
            sqlite_db_path,
            neo4j,
            redis,
            anthropic_api_key,
            ingestor_batch_size: positive(&lookup, "INGESTOR_BATCH_SIZE", 50)?,
            ingestor_interval_ms: positive(&lookup, "INGESTOR_INTERVAL_MS", 250)? as u64,
            max_batch_tokens: positive(&lookup, "MAX_BATCH_TOKENS", 60_000)?,
            max_batch_files: positive(&lookup, "MAX_BATCH_FILES", 20)?,
            workers,
            oracle_timeout_ms: positive(&lookup, "ORACLE_TIMEOUT_MS", 1_800_000)? as u64,
            oracle_max_concurrent: positive(&lookup, "ORACLE_MAX_CONCURRENT", 4)?,
            max_job_attempts: positive(&lookup, "MAX_JOB_ATTEMPTS", 3)? as u32,
            production,
        })
    }
}

fn require<F>(lookup: &F, key: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| Error::Config(format!("{} is required", key)))
}

/// Parse an optional positive integer, falling back to `default`.
fn positive<F>(lookup: &F, key: &str, default: usize) -> Result<usize>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => {
            let value: usize = raw
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("{} must be a positive integer: {:?}", key, raw)))?;
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than zero", key)));
            }
            Ok(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<&'static str, String> {
        let mut env = HashMap::new();
        env.insert("TARGET_DIRECTORY", "/tmp/project".to_string());
        env.insert("SQLITE_DB_PATH", "/tmp/ctg.db".to_string());
        env.insert("NEO4J_URI", "bolt://localhost:7687".to_string());
        env.insert("NEO4J_USER", "neo4j".to_string());
        env.insert("NEO4J_PASSWORD", "s3cret".to_string());
        env.insert("REDIS_URL", "redis://localhost:6379".to_string());
        env.insert("ANTHROPIC_API_KEY", "sk-test".to_string());
        env
    }

    fn load(env: &HashMap<&'static str, String>) -> Result<AppConfig> {
        AppConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_load_with_defaults() {
        let config = load(&base_env()).unwrap();
        assert_eq!(config.workers.file_analysis, 4);
        assert_eq!(config.workers.reconciliation, 8);
        assert_eq!(config.workers.graph_builder, 1);
        assert_eq!(config.oracle_max_concurrent, 4);
        assert_eq!(config.max_job_attempts, 3);
        assert_eq!(config.oracle_timeout_ms, 1_800_000);
        assert!(!config.production);
    }

    #[test]
    fn test_missing_required_key() {
        let mut env = base_env();
        env.remove("ANTHROPIC_API_KEY");
        let err = load(&env).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("ANTHROPIC_API_KEY"));
    }

    #[test]
    fn test_zero_rejected() {
        let mut env = base_env();
        env.insert("INGESTOR_BATCH_SIZE", "0".to_string());
        assert!(load(&env).is_err());
    }

    #[test]
    fn test_non_numeric_rejected() {
        let mut env = base_env();
        env.insert("MAX_BATCH_TOKENS", "lots".to_string());
        assert!(load(&env).is_err());
    }

    #[test]
    fn test_production_forbids_default_graph_password() {
        let mut env = base_env();
        env.insert("CTG_ENV", "production".to_string());
        env.insert("NEO4J_PASSWORD", "neo4j".to_string());
        env.insert("REDIS_PASSWORD", "broker-pass".to_string());
        assert!(load(&env).is_err());
    }

    #[test]
    fn test_production_requires_broker_password() {
        let mut env = base_env();
        env.insert("CTG_ENV", "production".to_string());
        let err = load(&env).unwrap_err();
        assert!(err.to_string().contains("REDIS_PASSWORD"));
    }

    #[test]
    fn test_production_with_hardened_credentials() {
        let mut env = base_env();
        env.insert("CTG_ENV", "production".to_string());
        env.insert("REDIS_PASSWORD", "broker-pass".to_string());
        let config = load(&env).unwrap();
        assert!(config.production);
        assert_eq!(config.redis.password.as_deref(), Some("broker-pass"));
    }

    #[test]
    fn test_concurrency_override() {
        let mut env = base_env();
        env.insert("WORKER_CONCURRENCY_FILE_ANALYSIS", "12".to_string());
        let config = load(&env).unwrap();
        assert_eq!(config.workers.file_analysis, 12);
    }
}
