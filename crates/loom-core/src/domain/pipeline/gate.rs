//! Pipeline admission gate
//!
//! A cooperative pause flag shared by every component that starts graph
//! transactions. Pausing never aborts a running transaction; components check
//! the gate before starting new ones.
//!
//! # Example
//!
//! ```ignore
//! let gate = PipelineGate::new();
//! gate.pause("operator review of case 42");
//! assert!(gate.is_paused());
//! gate.resume();
//! gate.wait_until_open().await;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::info;

#[derive(Default)]
struct GateState {
    paused: AtomicBool,
    reason: Mutex<Option<String>>,
    opened: Notify,
}

/// Cloneable handle to one shared gate
#[derive(Clone, Default)]
pub struct PipelineGate {
    inner: Arc<GateState>,
}

impl std::fmt::Debug for PipelineGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineGate")
            .field("paused", &self.is_paused())
            .field("reason", &self.reason())
            .finish()
    }
}

impl PipelineGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop admitting new transactions
    pub fn pause(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if let Ok(mut slot) = self.inner.reason.lock() {
            *slot = Some(reason.clone());
        }
        if !self.inner.paused.swap(true, Ordering::SeqCst) {
            info!(reason = %reason, "Pipeline paused");
        }
    }

    pub fn resume(&self) {
        if let Ok(mut slot) = self.inner.reason.lock() {
            *slot = None;
        }
        if self.inner.paused.swap(false, Ordering::SeqCst) {
            info!("Pipeline resumed");
        }
        self.inner.opened.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Why the gate is closed, if it is
    pub fn reason(&self) -> Option<String> {
        if !self.is_paused() {
            return None;
        }
        self.inner.reason.lock().ok().and_then(|r| r.clone())
    }

    /// Wait until the gate is open; returns at once if it already is
    pub async fn wait_until_open(&self) {
        loop {
            let opened = self.inner.opened.notified();
            if !self.is_paused() {
                return;
            }
            opened.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pause_and_resume() {
        let gate = PipelineGate::new();
        assert!(!gate.is_paused());
        assert_eq!(gate.reason(), None);

        let shared = gate.clone();
        shared.pause("case c1 escalated");
        assert!(gate.is_paused());
        assert_eq!(gate.reason().as_deref(), Some("case c1 escalated"));

        gate.resume();
        assert!(!shared.is_paused());
        assert_eq!(shared.reason(), None);
    }

    #[tokio::test]
    async fn test_wait_until_open() {
        let gate = PipelineGate::new();
        gate.wait_until_open().await;

        gate.pause("hold");
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_until_open().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gate.resume();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
