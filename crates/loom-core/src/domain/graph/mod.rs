//! Graph domain
//!
//! Nodes, edges, transactions and the store that owns committed state.
//!
//! # Architecture
//!
//! - **Nodes / Edges**: typed entities and the relationships between them
//! - **Transactions**: the only way to mutate committed state
//! - **GraphStore**: arena behind an RwLock, validated then applied atomically
//! - **CommitLog**: ordered, replayable persistence of committed transactions
//! - **Events**: audit view derived from commit records

pub mod edge;
pub mod event;
pub mod log;
pub mod node;
pub mod store;
pub mod transaction;

pub use edge::{Edge, RelationshipType};
pub use event::GraphEvent;
pub use log::{CommitLog, MemoryCommitLog};
pub use node::{Node, TemporalBound, TemporalRange, canonicalize};
pub use store::{GraphSnapshot, GraphState, GraphStats, GraphStore};
pub use transaction::{Commit, CommitRecord, MergeRewrite, Transaction};
