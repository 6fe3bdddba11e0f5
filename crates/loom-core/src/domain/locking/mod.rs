//! Per-node locking
//!
//! At most one transaction that rewrites a given node id is in flight at a
//! time. Merges on disjoint id sets proceed in parallel; a merge touching a
//! locked id waits for the holder to commit or abort, bounded by a timeout.
//!
//! # Usage
//!
//! ```rust,ignore
//! use loom_core::domain::locking::NodeLockManager;
//!
//! let locks = NodeLockManager::with_defaults();
//! let guard = locks.acquire_many(["a", "b"], "merge", None).await?;
//! // ... build and apply the transaction ...
//! // locks released when `guard` drops
//! ```

pub mod guard;
pub mod manager;
pub mod types;

pub use guard::{MultiLockGuard, NodeLockGuard};
pub use manager::NodeLockManager;
pub use types::{LockConfig, LockError, LockHold, LockResult};
