use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::db::Db;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub relations: RelationsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    #[serde(default = "default_migrations_dir")]
    pub migrations_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// How long a connection waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

/// Relation query limits
#[derive(Debug, Clone, Deserialize)]
pub struct RelationsConfig {
    /// Default cap on the number of edges a path query returns.
    #[serde(default = "default_max_path_results")]
    pub max_path_results: usize,
    /// Per-tenant overrides of `max_path_results`, keyed by tenant UUID.
    #[serde(default)]
    pub tenant_limits: HashMap<Uuid, usize>,
}

impl Default for RelationsConfig {
    fn default() -> Self {
        Self {
            max_path_results: default_max_path_results(),
            tenant_limits: HashMap::new(),
        }
    }
}

impl RelationsConfig {
    /// Path query result cap for a tenant.
    pub fn path_limit_for(&self, tenant_id: Uuid) -> usize {
        self.tenant_limits
            .get(&tenant_id)
            .copied()
            .unwrap_or(self.max_path_results)
    }
}

/// Query result cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Maximum cached query results. 0 disables the cache.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
        }
    }
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_max_path_results() -> usize {
    1000
}

fn default_cache_capacity() -> usize {
    1024
}

impl Config {
    /// Load configuration from file
    ///
    /// Loads environment variables from .env file (if present) before loading config.
    /// Looks for config file in this order:
    /// 1. Path specified in RELGRAPH_CONFIG environment variable
    /// 2. ./config.toml in current directory
    pub fn load() -> Result<Self> {
        // .env is optional
        let _ = dotenv::dotenv();

        let config_path = std::env::var("RELGRAPH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        Self::from_toml_str(&config_str)
            .with_context(|| format!("Invalid config file: {}", config_path.display()))
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        let config: Config = toml::from_str(config_str).context("Failed to parse config.toml")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.storage.db_path.as_os_str().is_empty() {
            anyhow::bail!("storage.db_path must not be empty");
        }

        if self.relations.max_path_results == 0 {
            anyhow::bail!("relations.max_path_results must be greater than 0");
        }

        if let Some((tenant, _)) = self.relations.tenant_limits.iter().find(|(_, v)| **v == 0) {
            anyhow::bail!("relations.tenant_limits.{} must be greater than 0", tenant);
        }

        Ok(())
    }

    /// Get database path
    pub fn db_path(&self) -> &Path {
        &self.storage.db_path
    }

    /// Get migrations directory
    pub fn migrations_dir(&self) -> &Path {
        &self.storage.migrations_dir
    }

    /// Database handle honouring `storage.busy_timeout_ms`.
    pub fn open_db(&self) -> Db {
        Db::new(self.db_path()).with_busy_timeout(Duration::from_millis(self.storage.busy_timeout_ms))
    }
}
