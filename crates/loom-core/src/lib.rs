//! Loom Core Library
//!
//! This crate provides the core functionality for Loom, including:
//! - Graph store with atomic transactions and a replayable commit log
//! - Resolution and extraction stages behind a typed model boundary
//! - Taxonomy placement over a bounded category tree
//! - Sampled duplicate detection and transactional consolidation
//! - Repair loop with human escalation
//! - Read-only query/explorer
//! - Storage (SQLite commit log)

pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod llm;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::domain::consolidation::{ConsolidationEngine, MergeDecision, MergeProposal};
    pub use crate::domain::graph::{Edge, GraphStore, Node, RelationshipType, Transaction};
    pub use crate::domain::pipeline::{Pipeline, PipelineGate};
    pub use crate::domain::query::{QueryExplorer, SelectionCriteria};
    pub use crate::error::{Error, Result};
}
