//! SQLite pool for the commit log
//!
//! Opening a database creates its directory when needed and migrates the
//! schema before the pool is handed out.

use crate::storage::migrations;
use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::path::{Path, PathBuf};

const MEMORY_PATH: &str = ":memory:";

/// Where the commit log lives and how it is opened
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
    /// FULL by default: a commit is durable before it becomes visible
    pub synchronous: SqliteSynchronous,
}

impl DatabaseConfig {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_connections: 5,
            synchronous: SqliteSynchronous::Full,
        }
    }

    /// A private in-memory log; one connection so every query sees the same database
    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::from(MEMORY_PATH),
            max_connections: 1,
            synchronous: SqliteSynchronous::Normal,
        }
    }

    fn is_memory(&self) -> bool {
        self.path.as_os_str() == MEMORY_PATH
    }

    fn connect_options(&self) -> SqliteConnectOptions {
        if self.is_memory() {
            return SqliteConnectOptions::new()
                .in_memory(true)
                .foreign_keys(true);
        }
        SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(self.synchronous)
            .foreign_keys(true)
    }
}

/// `<data dir>/loom/loom.db`, or `loom.db` in the working directory when the
/// platform has no data directory
pub fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("loom").join("loom.db"))
        .unwrap_or_else(|| PathBuf::from("loom.db"))
}

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    config: DatabaseConfig,
}

impl Database {
    pub async fn new(config: DatabaseConfig) -> Result<Self> {
        if !config.is_memory()
            && let Some(parent) = config.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(config.connect_options())
            .await
            .with_context(|| format!("Failed to open commit log at {}", config.path.display()))?;

        migrations::run_migrations(&pool)
            .await
            .context("Failed to migrate commit log schema")?;
        tracing::debug!(path = %config.path.display(), "Commit log database ready");

        Ok(Self { pool, config })
    }

    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::new(DatabaseConfig::with_path(path)).await
    }

    pub async fn in_memory() -> Result<Self> {
        Self::new(DatabaseConfig::in_memory()).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migration_status(&self) -> Result<migrations::MigrationStatus> {
        migrations::migration_status(&self.pool)
            .await
            .context("Failed to read commit log schema version")
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }
}
