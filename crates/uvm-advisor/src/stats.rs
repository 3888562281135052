//! Engine counters
//!
//! Plain atomics updated on the hot path; read through [`EngineStats::snapshot`].

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free engine statistics
#[derive(Debug, Default)]
pub struct EngineStats {
    ops_observed: AtomicU64,
    prefetches_issued: AtomicU64,
    bytes_prefetched: AtomicU64,
    unresolved_ids: AtomicU64,
    device_errors: AtomicU64,
    tensor_allocs_tracked: AtomicU64,
    tensor_frees_applied: AtomicU64,
    region_allocs_tracked: AtomicU64,
    region_frees_applied: AtomicU64,
    events_ignored: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_op(&self) {
        self.ops_observed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_prefetch(&self, bytes: u64) {
        self.prefetches_issued.fetch_add(1, Ordering::Relaxed);
        self.bytes_prefetched.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_unresolved(&self, count: u64) {
        self.unresolved_ids.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_device_error(&self) {
        self.device_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tensor_alloc(&self) {
        self.tensor_allocs_tracked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tensor_free(&self) {
        self.tensor_frees_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_region_alloc(&self) {
        self.region_allocs_tracked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_region_free(&self) {
        self.region_frees_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ignored(&self) {
        self.events_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            ops_observed: self.ops_observed.load(Ordering::Relaxed),
            prefetches_issued: self.prefetches_issued.load(Ordering::Relaxed),
            bytes_prefetched: self.bytes_prefetched.load(Ordering::Relaxed),
            unresolved_ids: self.unresolved_ids.load(Ordering::Relaxed),
            device_errors: self.device_errors.load(Ordering::Relaxed),
            tensor_allocs_tracked: self.tensor_allocs_tracked.load(Ordering::Relaxed),
            tensor_frees_applied: self.tensor_frees_applied.load(Ordering::Relaxed),
            region_allocs_tracked: self.region_allocs_tracked.load(Ordering::Relaxed),
            region_frees_applied: self.region_frees_applied.load(Ordering::Relaxed),
            events_ignored: self.events_ignored.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatsSnapshot {
    /// Operation-start events seen
    pub ops_observed: u64,
    /// Prefetch requests accepted by the runtime
    pub prefetches_issued: u64,
    /// Bytes covered by accepted requests
    pub bytes_prefetched: u64,
    /// Scheduled ids with no live allocation behind them
    pub unresolved_ids: u64,
    /// Prefetch requests the runtime rejected
    pub device_errors: u64,
    pub tensor_allocs_tracked: u64,
    pub tensor_frees_applied: u64,
    pub region_allocs_tracked: u64,
    pub region_frees_applied: u64,
    /// Allocation or resource events filtered out at the boundary
    pub events_ignored: u64,
}

impl EngineStatsSnapshot {
    /// Fraction of scheduled ids that resolved to a live allocation
    pub fn resolve_rate(&self) -> f64 {
        let attempted = self.prefetches_issued + self.device_errors + self.unresolved_ids;
        if attempted == 0 {
            return 0.0;
        }
        (self.prefetches_issued + self.device_errors) as f64 / attempted as f64
    }
}
