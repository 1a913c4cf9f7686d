//! Engine metrics
//!
//! Process-wide counters instrumenting cache effectiveness and notification
//! traffic. Counters use relaxed atomics; they are diagnostics, not
//! synchronization.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

/// Counters for the whole engine.
#[derive(Debug)]
pub struct EngineMetrics {
    /// Computed reads answered from cache.
    pub cache_hits: AtomicU64,

    /// Computed reads that found the cache dirty or absent.
    pub cache_misses: AtomicU64,

    /// Times a compute function actually ran.
    pub recomputations: AtomicU64,

    /// Dependency-set rewires (observed set differed from the last run).
    pub rewires: AtomicU64,

    /// Observer fanout passes with at least one live target.
    pub fanouts: AtomicU64,

    /// Trigger invalidations dropped because an update was already pending.
    pub coalesced_updates: AtomicU64,
}

impl EngineMetrics {
    fn new() -> Self {
        EngineMetrics {
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            recomputations: AtomicU64::new(0),
            rewires: AtomicU64::new(0),
            fanouts: AtomicU64::new(0),
            coalesced_updates: AtomicU64::new(0),
        }
    }

    /// The process-wide instance.
    pub fn global() -> &'static EngineMetrics {
        static GLOBAL: OnceLock<EngineMetrics> = OnceLock::new();
        GLOBAL.get_or_init(EngineMetrics::new)
    }

    pub(crate) fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recomputation(&self) {
        self.recomputations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rewire(&self) {
        self.rewires.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fanout(&self) {
        self.fanouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_coalesced(&self) {
        self.coalesced_updates.fetch_add(1, Ordering::Relaxed);
    }

    /// Cache hit rate over all computed reads so far (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed) as f64;
        let total = hits + self.cache_misses.load(Ordering::Relaxed) as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.recomputations.store(0, Ordering::Relaxed);
        self.rewires.store(0, Ordering::Relaxed);
        self.fanouts.store(0, Ordering::Relaxed);
        self.coalesced_updates.store(0, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            recomputations: self.recomputations.load(Ordering::Relaxed),
            rewires: self.rewires.load(Ordering::Relaxed),
            fanouts: self.fanouts.load(Ordering::Relaxed),
            coalesced_updates: self.coalesced_updates.load(Ordering::Relaxed),
        }
    }
}

/// Frozen copy of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub recomputations: u64,
    pub rewires: u64,
    pub fanouts: u64,
    pub coalesced_updates: u64,
}
