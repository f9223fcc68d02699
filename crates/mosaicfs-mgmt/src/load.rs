//! In-flight request counters per node address.

use std::sync::Arc;

use dashmap::DashMap;

/// Counts requests the manager has outstanding against each node.
#[derive(Clone, Default)]
pub struct LoadTracker {
    inflight: Arc<DashMap<String, usize>>,
}

/// Decrements its node's counter when dropped.
pub struct LoadTicket {
    tracker: LoadTracker,
    addr: String,
}

impl LoadTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one request against `addr` until the ticket is dropped.
    pub fn track(&self, addr: &str) -> LoadTicket {
        *self.inflight.entry(addr.to_string()).or_insert(0) += 1;
        LoadTicket {
            tracker: self.clone(),
            addr: addr.to_string(),
        }
    }

    /// Requests currently outstanding against `addr`.
    pub fn load(&self, addr: &str) -> usize {
        self.inflight.get(addr).map(|n| *n).unwrap_or(0)
    }
}

impl Drop for LoadTicket {
    fn drop(&mut self) {
        if let Some(mut n) = self.tracker.inflight.get_mut(&self.addr) {
            *n = n.saturating_sub(1);
        }
    }
}
