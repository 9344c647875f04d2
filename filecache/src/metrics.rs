//! Cache activity counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters describing cache activity.
///
/// All counters are monotonically increasing; read a consistent view with
/// [`snapshot`](Self::snapshot).
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    removals: AtomicU64,
    reserve_refusals: AtomicU64,
    recovered: AtomicU64,
}

impl CacheMetrics {
    pub(crate) fn add_hits(&self, count: u64) {
        self.hits.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_removal(&self) {
        self.removals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reserve_refusal(&self) {
        self.reserve_refusals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_recovered(&self, count: u64) {
        self.recovered.fetch_add(count, Ordering::Relaxed);
    }

    /// Read all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
            reserve_refusals: self.reserve_refusals.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`CacheMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Requested segments already present in the index.
    pub hits: u64,
    /// Segments created empty for a requested range.
    pub misses: u64,
    /// Segments evicted to make room for a reservation.
    pub evictions: u64,
    /// Segments dropped from the index for any reason (including
    /// evictions).
    pub removals: u64,
    /// Reservations refused because nothing evictable was left.
    pub reserve_refusals: u64,
    /// Segments re-indexed from disk on startup.
    pub recovered: u64,
}

impl MetricsSnapshot {
    /// Hit ratio across all segment requests, or 0.0 before any request.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
