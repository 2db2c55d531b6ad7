// Cache performance metrics, one instance per partition key.
//
// Grounded on the teacher's query-cache metrics module: hit/miss/eviction
// counters behind an atomic-friendly snapshot type, consulted by the CLI's
// `status`/`cache overview` verbs (external, not implemented here).

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Reason a cache entry was evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionReason {
    /// Evicted by the configured `EvictionStrategy` (oldest / LRU).
    Strategy,
    /// Removed by an explicit `delete` or `clear` call.
    Manual,
    /// Removed because its partition key was dropped.
    PartitionDropped,
}

/// Point-in-time snapshot of a partition key's cache counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub evictions: u64,
    pub entry_count: u64,
}

/// Live counters backing a [`CacheMetrics`] snapshot. Kept separate from the
/// snapshot type so back-ends can hold one per partition key behind a
/// `DashMap` without needing interior mutability on the snapshot itself.
#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    evictions: AtomicU64,
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

    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self, _reason: EvictionReason) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, entry_count: u64) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entry_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_independently() {
        let counters = CacheCounters::new();
        counters.record_hit();
        counters.record_hit();
        counters.record_miss();
        counters.record_eviction(EvictionReason::Manual);

        let snap = counters.snapshot(3);
        assert_eq!(snap.hits, 2);
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.evictions, 1);
        assert_eq!(snap.entry_count, 3);
    }
}
