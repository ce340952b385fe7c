//! Engine counters, owned by the orchestrator and injected where needed.
//!
//! Presentation-only: nothing in the pipeline branches on these values. The
//! health endpoint reads them for its status payload.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide engine counters.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// JSON-RPC requests issued (including retries).
    pub rpc_requests: AtomicU64,
    /// JSON-RPC attempts that were retried after a transport failure.
    pub rpc_retries: AtomicU64,
    /// Logs written to the cache.
    pub logs_fetched: AtomicU64,
    /// Blocks hydrated into the cache.
    pub blocks_hydrated: AtomicU64,
    /// Events delivered to user handlers.
    pub events_dispatched: AtomicU64,
    /// Reorgs detected and repaired.
    pub reorgs_handled: AtomicU64,
}

impl EngineStats {
    /// Create a zeroed counter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by `n`.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Read a counter.
    #[must_use]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
