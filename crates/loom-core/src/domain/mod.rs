//! Domain layer - graph model and the consolidation pipeline components

pub mod consolidation;
pub mod dedup;
pub mod extraction;
pub mod graph;
pub mod locking;
pub mod pipeline;
pub mod query;
pub mod repair;
pub mod taxonomy;
