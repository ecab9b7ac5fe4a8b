//! Cache Statistics Module
//!
//! Tracks cache performance metrics including hits, misses, trims and
//! removals by reason.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::cache::RemovedReason;

// == Cache Counters ==
/// Live counters, updated without the container's write section.
#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    trims: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    removals: AtomicU64,
    invalidations: AtomicU64,
}

impl CacheCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts entries removed by a trim pass.
    pub fn record_trimmed(&self, count: usize) {
        self.trims.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_removal(&self, reason: RemovedReason) {
        let counter = match reason {
            RemovedReason::Removed => &self.removals,
            RemovedReason::Expired => &self.expirations,
            RemovedReason::Evicted => &self.evictions,
            RemovedReason::DependencyChanged => &self.invalidations,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the counters into a snapshot.
    pub fn snapshot(&self, total_entries: usize) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            trims: self.trims.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            total_entries,
        }
    }
}

// == Cache Stats ==
/// Point-in-time view of cache metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Number of successful cache retrievals
    pub hits: u64,
    /// Number of failed cache retrievals (key not found or expired)
    pub misses: u64,
    /// Number of entries removed by trim passes
    pub trims: u64,
    /// Number of entries evicted by trim or the entry limit
    pub evictions: u64,
    /// Number of entries removed because their deadline passed
    pub expirations: u64,
    /// Number of explicit removals
    pub removals: u64,
    /// Number of entries removed because a change monitor fired
    pub invalidations: u64,
    /// Current number of entries in the cache
    pub total_entries: usize,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    // == Hit Rate ==
    /// Calculates the cache hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no requests have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Adds another snapshot into this one (used to aggregate shards).
    pub fn merge(&mut self, other: &CacheStats) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.trims += other.trims;
        self.evictions += other.evictions;
        self.expirations += other.expirations;
        self.removals += other.removals;
        self.invalidations += other.invalidations;
        self.total_entries += other.total_entries;
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_new() {
        let stats = CacheStats::new();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.trims, 0);
        assert_eq!(stats.total_entries, 0);
    }

    #[test]
    fn test_hit_rate_no_requests() {
        let stats = CacheStats::new();
        assert_eq!(stats.hit_rate(), 0.0);
    }

    #[test]
    fn test_hit_rate_mixed() {
        let counters = CacheCounters::new();
        counters.record_hit();
        counters.record_hit();
        counters.record_hit();
        counters.record_miss();
        assert_eq!(counters.snapshot(0).hit_rate(), 0.75);
    }

    #[test]
    fn test_removals_counted_by_reason() {
        let counters = CacheCounters::new();
        counters.record_removal(RemovedReason::Removed);
        counters.record_removal(RemovedReason::Expired);
        counters.record_removal(RemovedReason::Expired);
        counters.record_removal(RemovedReason::Evicted);
        counters.record_removal(RemovedReason::DependencyChanged);
        counters.record_trimmed(3);

        let stats = counters.snapshot(7);
        assert_eq!(stats.removals, 1);
        assert_eq!(stats.expirations, 2);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.invalidations, 1);
        assert_eq!(stats.trims, 3);
        assert_eq!(stats.total_entries, 7);
    }

    #[test]
    fn test_merge() {
        let mut total = CacheStats {
            hits: 1,
            misses: 2,
            total_entries: 3,
            ..CacheStats::default()
        };
        total.merge(&CacheStats {
            hits: 10,
            misses: 20,
            trims: 4,
            total_entries: 30,
            ..CacheStats::default()
        });
        assert_eq!(total.hits, 11);
        assert_eq!(total.misses, 22);
        assert_eq!(total.trims, 4);
        assert_eq!(total.total_entries, 33);
    }

    #[test]
    fn test_stats_serialize() {
        let stats = CacheStats {
            hits: 5,
            ..CacheStats::default()
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["hits"], 5);
        assert_eq!(json["total_entries"], 0);
    }
}
