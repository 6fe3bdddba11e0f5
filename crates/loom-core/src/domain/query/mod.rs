//! Query/Explorer
//!
//! The only external read path. Every selection runs against one committed
//! snapshot, so uncommitted candidates and half-applied merges are never seen.

pub mod explorer;

pub use explorer::{QueryExplorer, SelectedNode, SelectionCriteria, select_in};
