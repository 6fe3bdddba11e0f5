//! Infrastructure layer - persistence implementations of domain traits

pub mod commit_log;

pub use commit_log::SqliteCommitLog;
