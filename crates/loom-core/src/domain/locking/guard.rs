//! RAII guards over node locks
//!
//! A guard releases its node when dropped, so a merge's locks end with it
//! on every path out, early returns included.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::debug;

use super::types::LockHold;

/// node id -> current hold
pub(crate) type LockTable = Arc<Mutex<HashMap<String, LockHold>>>;

#[derive(Debug)]
pub struct NodeLockGuard {
    hold: LockHold,
    table: LockTable,
    released: Arc<Notify>,
}

impl NodeLockGuard {
    pub(crate) fn new(hold: LockHold, table: LockTable, released: Arc<Notify>) -> Self {
        Self {
            hold,
            table,
            released,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.hold.node_id
    }

    pub fn holder(&self) -> &str {
        &self.hold.holder
    }
}

impl Drop for NodeLockGuard {
    fn drop(&mut self) {
        if let Ok(mut table) = self.table.lock()
            && table
                .get(&self.hold.node_id)
                .is_some_and(|current| current.id == self.hold.id)
        {
            table.remove(&self.hold.node_id);
        }
        debug!(node_id = %self.hold.node_id, holder = %self.hold.holder, "Node lock released");
        self.released.notify_waiters();
    }
}

/// Locks over a set of node ids, held in sorted id order
#[derive(Debug, Default)]
pub struct MultiLockGuard {
    guards: Vec<NodeLockGuard>,
}

impl MultiLockGuard {
    pub(crate) fn new(guards: Vec<NodeLockGuard>) -> Self {
        Self { guards }
    }

    pub fn node_ids(&self) -> Vec<&str> {
        self.guards.iter().map(NodeLockGuard::node_id).collect()
    }

    pub fn covers(&self, node_id: &str) -> bool {
        self.guards.iter().any(|g| g.node_id() == node_id)
    }
}

impl Drop for MultiLockGuard {
    fn drop(&mut self) {
        // reverse acquisition order
        while self.guards.pop().is_some() {}
    }
}
