use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters updated on the read path.
#[derive(Debug, Default)]
pub(crate) struct CacheMetrics {
    pub hits: AtomicU64,
    pub stale_hits: AtomicU64,
    pub misses: AtomicU64,
    pub coalesced: AtomicU64,
    pub background_refreshes: AtomicU64,
    pub failures: AtomicU64,
}

impl CacheMetrics {
    pub fn record(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, entry_count: usize, in_flight: usize) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            background_refreshes: self.background_refreshes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            entry_count: entry_count as u64,
            in_flight: in_flight as u64,
        }
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads served from a fresh entry.
    pub hits: u64,
    /// Reads served from a stale entry while revalidating.
    pub stale_hits: u64,
    /// Reads that had to wait for a fetch.
    pub misses: u64,
    /// Misses that joined a fetch already in flight.
    pub coalesced: u64,
    /// Background refreshes started.
    pub background_refreshes: u64,
    /// Fetches that failed, foreground or background.
    pub failures: u64,
    pub entry_count: u64,
    pub in_flight: u64,
}

impl CacheStats {
    /// Share of reads answered without waiting (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.stale_hits;
        let total = served + self.misses;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }
}
