//! Counters describing how effective coalescing is.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for request coalescing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoalescerStats {
    /// Total requests received.
    pub total_requests: u64,
    /// Requests that attached to an in-flight execution.
    pub coalesced_requests: u64,
    /// Requests that led a new execution.
    pub leader_executions: u64,
    /// Requests executed without touching the registry.
    pub bypassed_requests: u64,
    /// Current number of in-flight tickets.
    pub in_flight: usize,
}

impl CoalescerStats {
    /// Returns the coalescing ratio.
    pub fn coalescing_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.coalesced_requests as f64 / self.total_requests as f64
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatsInner {
    pub(crate) total_requests: AtomicU64,
    pub(crate) coalesced_requests: AtomicU64,
    pub(crate) leader_executions: AtomicU64,
    pub(crate) bypassed_requests: AtomicU64,
}

impl StatsInner {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, in_flight: usize) -> CoalescerStats {
        CoalescerStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            coalesced_requests: self.coalesced_requests.load(Ordering::Relaxed),
            leader_executions: self.leader_executions.load(Ordering::Relaxed),
            bypassed_requests: self.bypassed_requests.load(Ordering::Relaxed),
            in_flight,
        }
    }
}
