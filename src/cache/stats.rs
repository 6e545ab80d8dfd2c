//! Cache Statistics Module
//!
//! Tracks cache performance metrics including hits, misses, refreshes and
//! evictions, and forwards them to an optional external recorder.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

// == Metrics Recorder ==
/// Sink for cache events.
///
/// Every method defaults to a no-op so implementors only override what they
/// export. Calls are made after the shard lock has been released.
pub trait MetricsRecorder: Send + Sync {
    fn cache_hit(&self) {}
    fn cache_miss(&self) {}
    fn missing_record_hit(&self) {}
    fn refresh_signalled(&self) {}
    fn forced_eviction(&self) {}
    fn entries_evicted(&self, _count: usize) {}
    fn shard_index(&self, _index: usize) {}
}

// == Cache Stats ==
/// Point-in-time snapshot of the cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Reads that found a live value
    pub hits: u64,
    /// Reads that found nothing, or only an expired entry
    pub misses: u64,
    /// Reads that found a cached missing record
    pub missing_record_hits: u64,
    /// Reads that were told to refresh the entry
    pub refreshes: u64,
    /// Number of forced (capacity driven) eviction passes
    pub forced_evictions: u64,
    /// Entries removed by forced eviction or expiry sweeps
    pub evictions: u64,
    /// Current number of entries in the cache
    pub total_entries: usize,
}

impl CacheStats {
    // == Hit Rate ==
    /// Calculates the cache hit rate.
    ///
    /// Missing-record hits count as hits. Returns 0.0 if no reads happened.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits + self.missing_record_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

// == Metrics ==
/// Shared counters owned by the client and every shard.
#[derive(Default)]
pub(crate) struct Metrics {
    hits: AtomicU64,
    misses: AtomicU64,
    missing_record_hits: AtomicU64,
    refreshes: AtomicU64,
    forced_evictions: AtomicU64,
    evictions: AtomicU64,
    recorder: Option<Arc<dyn MetricsRecorder>>,
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics")
            .field("snapshot", &self.snapshot(0))
            .field("recorder", &self.recorder.is_some())
            .finish()
    }
}

impl Metrics {
    pub(crate) fn new(recorder: Option<Arc<dyn MetricsRecorder>>) -> Self {
        Self {
            recorder,
            ..Self::default()
        }
    }

    /// Records the outcome of a single read.
    pub(crate) fn record_read(&self, exists: bool, missing_record: bool, refresh: bool) {
        if !exists {
            self.misses.fetch_add(1, Ordering::Relaxed);
            self.notify(|r| r.cache_miss());
            return;
        }
        if missing_record {
            self.missing_record_hits.fetch_add(1, Ordering::Relaxed);
            self.notify(|r| r.missing_record_hit());
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.notify(|r| r.cache_hit());
        }
        if refresh {
            self.refreshes.fetch_add(1, Ordering::Relaxed);
            self.notify(|r| r.refresh_signalled());
        }
    }

    pub(crate) fn record_forced_eviction(&self) {
        self.forced_evictions.fetch_add(1, Ordering::Relaxed);
        self.notify(|r| r.forced_eviction());
    }

    pub(crate) fn record_evictions(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
        self.notify(|r| r.entries_evicted(count));
    }

    pub(crate) fn record_shard_index(&self, index: usize) {
        self.notify(|r| r.shard_index(index));
    }

    pub(crate) fn snapshot(&self, total_entries: usize) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            missing_record_hits: self.missing_record_hits.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            forced_evictions: self.forced_evictions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            total_entries,
        }
    }

    fn notify(&self, f: impl FnOnce(&dyn MetricsRecorder)) {
        if let Some(recorder) = &self.recorder {
            f(recorder.as_ref());
        }
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingRecorder {
        misses: AtomicUsize,
        evicted: AtomicUsize,
        shards: AtomicUsize,
    }

    impl MetricsRecorder for CountingRecorder {
        fn cache_miss(&self) {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        fn entries_evicted(&self, count: usize) {
            self.evicted.fetch_add(count, Ordering::Relaxed);
        }
        fn shard_index(&self, _index: usize) {
            self.shards.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_hit_rate_no_requests() {
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }

    #[test]
    fn test_hit_rate_mixed() {
        let metrics = Metrics::new(None);
        metrics.record_read(true, false, false);
        metrics.record_read(true, true, false);
        metrics.record_read(false, false, false);
        metrics.record_read(false, false, false);

        let stats = metrics.snapshot(3);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.missing_record_hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_refresh_only_counted_on_hits() {
        let metrics = Metrics::new(None);
        metrics.record_read(true, false, true);
        metrics.record_read(false, false, true);
        assert_eq!(metrics.snapshot(0).refreshes, 1);
    }

    #[test]
    fn test_recorder_receives_events() {
        let recorder = Arc::new(CountingRecorder::default());
        let metrics = Metrics::new(Some(recorder.clone()));

        metrics.record_read(false, false, false);
        metrics.record_evictions(0);
        metrics.record_evictions(4);
        metrics.record_shard_index(2);

        assert_eq!(recorder.misses.load(Ordering::Relaxed), 1);
        assert_eq!(recorder.evicted.load(Ordering::Relaxed), 4);
        assert_eq!(recorder.shards.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.snapshot(0).evictions, 4);
    }

    #[test]
    fn test_stats_serialize() {
        let stats = CacheStats {
            hits: 3,
            total_entries: 2,
            ..CacheStats::default()
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["hits"], 3);
        assert_eq!(json["total_entries"], 2);
    }
}
