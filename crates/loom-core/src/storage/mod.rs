//! Storage layer - SQLite connection management and migrations
//!
//! # Architecture
//!
//! - `database`: Connection pool management and initialization
//! - `migrations`: Schema versioning and automatic migration
//!
//! # Usage
//!
//! ```ignore
//! use loom_core::storage::Database;
//! use loom_core::infrastructure::SqliteCommitLog;
//!
//! let db = Database::open("loom.db").await?;
//! let log = SqliteCommitLog::new(db.pool().clone());
//! ```

pub mod database;
pub mod migrations;

pub use database::{Database, DatabaseConfig, default_database_path};
pub use migrations::{CURRENT_VERSION, MigrationStatus, migration_status, run_migrations};
