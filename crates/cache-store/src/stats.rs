//! Store statistics.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters updated by store operations.
#[derive(Default)]
pub(crate) struct StoreCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub puts: AtomicU64,
    pub duplicate_puts: AtomicU64,
    pub evictions: AtomicU64,
    pub bytes_evicted: AtomicU64,
    pub integrity_drops: AtomicU64,
    pub quota_rejections: AtomicU64,
    pub index_writes: AtomicU64,
    pub index_writes_deferred: AtomicU64,
}

impl StoreCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Snapshot of store statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStoreStats {
    pub entries: usize,
    pub used_bytes: u64,
    pub quota_bytes: u64,
    pub pinned_entries: usize,
    pub leased_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub duplicate_puts: u64,
    pub evictions: u64,
    pub bytes_evicted: u64,
    pub integrity_drops: u64,
    pub quota_rejections: u64,
    /// Times `index.json` was rewritten.
    pub index_writes: u64,
    /// Mutations whose index write was left to a later one.
    pub index_writes_deferred: u64,
}

impl CacheStoreStats {
    /// Cache hit rate as a percentage (0-100).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }

    /// Fraction of the quota in use (0-1).
    pub fn utilization(&self) -> f64 {
        if self.quota_bytes == 0 {
            0.0
        } else {
            self.used_bytes as f64 / self.quota_bytes as f64
        }
    }
}

impl StoreCounters {
    pub fn snapshot(&self, into: &mut CacheStoreStats) {
        into.hits = self.hits.load(Ordering::Relaxed);
        into.misses = self.misses.load(Ordering::Relaxed);
        into.puts = self.puts.load(Ordering::Relaxed);
        into.duplicate_puts = self.duplicate_puts.load(Ordering::Relaxed);
        into.evictions = self.evictions.load(Ordering::Relaxed);
        into.bytes_evicted = self.bytes_evicted.load(Ordering::Relaxed);
        into.integrity_drops = self.integrity_drops.load(Ordering::Relaxed);
        into.quota_rejections = self.quota_rejections.load(Ordering::Relaxed);
        into.index_writes = self.index_writes.load(Ordering::Relaxed);
        into.index_writes_deferred = self.index_writes_deferred.load(Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let stats = CacheStoreStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 75.0).abs() < 1e-9);
        assert_eq!(CacheStoreStats::default().hit_rate(), 0.0);
    }
}
