//! Consolidation
//!
//! Turns candidate batches into committed graph state and decides every
//! duplicate group: merged, deferred or rejected.

pub mod decision;
pub mod engine;
pub mod unify;

pub use decision::{
    DeferredMerge, MergeDecision, MergeProposal, UNIFIED_FIELDS_MIN_CONFIDENCE, UnifiedFields,
};
pub use engine::{BatchCommit, ConsolidationConfig, ConsolidationEngine, ConsolidationStats};
pub use unify::{choose_survivor, unify};
