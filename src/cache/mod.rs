//! Bounded two-level cache of serialized derived buckets.
//!
//! The processor for window `W` publishes its derived buckets here so the
//! very next tick's `W' > W` processor can source them without re-reading
//! the column store. Entries are serialized payloads keyed by
//! `(metric, bucket number)`; an empty payload is the empty-bucket
//! sentinel that marks a slot as known-blank. Reads remove, so the cache
//! can never serve stale data; a metric that loses temporal locality with
//! the processing tick is dropped wholesale.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::bucket::codec::decode_lossy;
use crate::bucket::{Metric, WindowBucket};
use crate::config::BucketCacheConfig;
use crate::time::{BucketNumber, Tick, WindowDuration};

/// Per-metric payload map. Values are versioned bucket encodings; the
/// empty vec encodes the empty-bucket sentinel.
#[derive(Default)]
struct MetricBucketCache {
    buckets: DashMap<BucketNumber, Vec<u8>>,
}

#[derive(Default)]
struct StatCounters {
    hits: AtomicU64,
    sentinel_hits: AtomicU64,
    misses: AtomicU64,
    collisions: AtomicU64,
    evictions: AtomicU64,
    refusals: AtomicU64,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    /// Hits whose every slot was the empty sentinel.
    pub sentinel_hits: u64,
    pub misses: u64,
    pub collisions: u64,
    pub evictions: u64,
    pub admission_refusals: u64,
    pub cached_metrics: usize,
}

/// One bucket family's cache. Two independent instances exist per
/// process: one for histogram buckets, one for counter buckets.
pub struct BucketCache<T: WindowBucket> {
    cfg: BucketCacheConfig,
    metrics: DashMap<Metric, MetricBucketCache>,
    /// Raw bucket number of the last processing tick observed;
    /// `i64::MIN` until the first mark.
    last_known_tick: AtomicI64,
    n_cached_metrics: AtomicUsize,
    stats: StatCounters,
    _family: PhantomData<fn() -> T>,
}

impl<T: WindowBucket> BucketCache<T> {
    pub fn new(cfg: BucketCacheConfig) -> Self {
        BucketCache {
            cfg,
            metrics: DashMap::new(),
            last_known_tick: AtomicI64::new(i64::MIN),
            n_cached_metrics: AtomicUsize::new(0),
            stats: StatCounters::default(),
            _family: PhantomData,
        }
    }

    /// Inserts serialized buckets for `[from, to)`, filling every slot in
    /// the range that no bucket claims with the empty sentinel.
    ///
    /// Insert-if-absent throughout; a collision is replace-and-warn. The
    /// whole write is skipped when the metric kind is not cached, the
    /// span exceeds the store limit, or the metric-count cap refuses
    /// admission.
    pub fn multi_set(&self, metric: &Metric, from: BucketNumber, to: BucketNumber, buckets: &[T]) {
        if !self.cfg.enabled_for(metric.kind) {
            return;
        }

        let span = to.number() - from.number();
        if span <= 0 {
            return;
        }
        if span - 1 > self.cfg.max_store {
            debug!(metric = %metric, span, "bucket span exceeds cache store limit, skipping");
            return;
        }

        let entry = match self.metrics.entry(metric.clone()) {
            Entry::Occupied(e) => e.into_ref(),
            Entry::Vacant(v) => {
                // Soft cap: increment first, correct the overshoot.
                let n = self.n_cached_metrics.fetch_add(1, Ordering::Relaxed) + 1;
                if n > self.cfg.max_metrics {
                    self.n_cached_metrics.fetch_sub(1, Ordering::Relaxed);
                    self.stats.refusals.fetch_add(1, Ordering::Relaxed);
                    debug!(metric = %metric, "cache metric cap reached, not admitting");
                    return;
                }
                v.insert(MetricBucketCache::default())
            }
        };

        for bucket in buckets {
            if bucket.is_empty() {
                continue;
            }
            let payload = match bucket.encode() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(metric = %metric, error = %e, "unencodable bucket, not caching");
                    continue;
                }
            };
            match entry.buckets.entry(bucket.number()) {
                Entry::Occupied(mut slot) => {
                    warn!(
                        metric = %metric,
                        bucket = %bucket.number(),
                        "cache collision, replacing existing payload"
                    );
                    self.stats.collisions.fetch_add(1, Ordering::Relaxed);
                    slot.insert(payload);
                }
                Entry::Vacant(slot) => {
                    slot.insert(payload);
                }
            }
        }

        for number in from.number()..to.number() {
            entry
                .buckets
                .entry(BucketNumber::new(number, from.duration()))
                .or_default();
        }
    }

    /// Removes and returns every bucket in `[from, to)`. A hit requires
    /// the full range to be resident (sentinels count); anything less is
    /// a miss and the partial removals are discarded. Disabled for raw
    /// source reads, which always go to the store.
    pub fn multi_get(&self, metric: &Metric, from: BucketNumber, to: BucketNumber) -> Option<Vec<T>> {
        if from.duration().is_raw() {
            return None;
        }
        let span = to.number() - from.number();
        if span <= 0 {
            return None;
        }

        let Some(entry) = self.metrics.get(metric) else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let mut payloads = Vec::with_capacity(span as usize);
        for number in from.number()..to.number() {
            let key = BucketNumber::new(number, from.duration());
            if let Some((_, payload)) = entry.buckets.remove(&key) {
                payloads.push(payload);
            }
        }

        if payloads.len() as i64 != span {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        if payloads.iter().all(Vec::is_empty) {
            self.stats.sentinel_hits.fetch_add(1, Ordering::Relaxed);
        }
        Some(payloads.iter().map(|p| decode_lossy::<T>(p)).collect())
    }

    /// Records that a processing tick completed. When the tick actually
    /// advances, every resident metric without a bucket covering the
    /// previous tick has lost temporal locality and is dropped.
    pub fn mark_processed_tick(&self, tick: Tick) {
        let new = tick.bucket_number().number();
        let prev = self.last_known_tick.swap(new, Ordering::AcqRel);
        if prev == new || prev == i64::MIN {
            return;
        }

        let prev_ts = BucketNumber::new(prev, WindowDuration::RAW).start_timestamp();
        self.metrics.retain(|metric, entry| {
            let keep = entry.buckets.iter().any(|slot| slot.key().covers(prev_ts));
            if !keep {
                self.n_cached_metrics.fetch_sub(1, Ordering::Relaxed);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(metric = %metric, "metric lost tick affinity, dropping cache entry");
            }
            keep
        });
    }

    /// The last processing tick recorded via `mark_processed_tick`, if
    /// any. Processors use it to bound their cache reads to the slots
    /// published since the previous tick.
    pub fn last_tick(&self) -> Option<Tick> {
        let number = self.last_known_tick.load(Ordering::Acquire);
        if number == i64::MIN {
            return None;
        }
        Some(Tick::at(
            BucketNumber::new(number, WindowDuration::RAW).start_timestamp(),
        ))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            sentinel_hits: self.stats.sentinel_hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            collisions: self.stats.collisions.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            admission_refusals: self.stats.refusals.load(Ordering::Relaxed),
            cached_metrics: self.n_cached_metrics.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::CounterBucket;
    use crate::time::Timestamp;

    const S30: WindowDuration = WindowDuration::from_millis(30_000);

    fn bucket(n: i64) -> CounterBucket {
        CounterBucket::new(BucketNumber::new(n, S30), n)
    }

    fn bn(n: i64) -> BucketNumber {
        BucketNumber::new(n, S30)
    }

    fn cache() -> BucketCache<CounterBucket> {
        BucketCache::new(BucketCacheConfig::default())
    }

    #[test]
    fn test_multi_get_fills_gaps_and_hits_once() {
        let cache = cache();
        let metric = Metric::counter("m");

        cache.multi_set(&metric, bn(10), bn(15), &[bucket(10), bucket(12)]);

        let got = cache.multi_get(&metric, bn(10), bn(15)).expect("hit");
        assert_eq!(got.len(), 5);
        assert_eq!(got[0], bucket(10));
        assert!(got[1].is_empty());
        assert_eq!(got[2], bucket(12));
        assert!(got[3].is_empty());
        assert!(got[4].is_empty());

        // Reads remove: the same range is now a miss.
        assert!(cache.multi_get(&metric, bn(10), bn(15)).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sentinel_hits, 0);
    }

    #[test]
    fn test_partial_range_is_a_miss() {
        let cache = cache();
        let metric = Metric::counter("m");

        cache.multi_set(&metric, bn(10), bn(12), &[bucket(10), bucket(11)]);
        assert!(cache.multi_get(&metric, bn(10), bn(15)).is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_sentinel_only_hit_is_tracked_separately() {
        let cache = cache();
        let metric = Metric::counter("m");

        cache.multi_set(&metric, bn(0), bn(3), &[]);
        let got = cache.multi_get(&metric, bn(0), bn(3)).expect("hit");
        assert!(got.iter().all(CounterBucket::is_empty));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.sentinel_hits, 1);
    }

    #[test]
    fn test_raw_source_reads_are_disabled() {
        let cache = cache();
        let metric = Metric::counter("m");
        let raw0 = BucketNumber::new(0, WindowDuration::RAW);
        let raw5 = BucketNumber::new(5, WindowDuration::RAW);

        assert!(cache.multi_get(&metric, raw0, raw5).is_none());
        // Disabled reads are not misses.
        assert_eq!(cache.stats().misses, 0);
    }

    #[test]
    fn test_collision_replaces_and_counts() {
        let cache = cache();
        let metric = Metric::counter("m");

        cache.multi_set(&metric, bn(1), bn(2), &[bucket(1)]);
        let replacement = CounterBucket::new(bn(1), 999);
        cache.multi_set(&metric, bn(1), bn(2), &[replacement.clone()]);

        assert_eq!(cache.stats().collisions, 1);
        let got = cache.multi_get(&metric, bn(1), bn(2)).expect("hit");
        assert_eq!(got[0], replacement);
    }

    #[test]
    fn test_span_over_max_store_is_not_cached() {
        let mut cfg = BucketCacheConfig::default();
        cfg.max_store = 3;
        let cache = BucketCache::<CounterBucket>::new(cfg);
        let metric = Metric::counter("m");

        cache.multi_set(&metric, bn(0), bn(5), &[bucket(0)]);
        assert!(cache.multi_get(&metric, bn(0), bn(5)).is_none());

        cache.multi_set(&metric, bn(0), bn(4), &[bucket(0)]);
        assert!(cache.multi_get(&metric, bn(0), bn(4)).is_some());
    }

    #[test]
    fn test_metric_cap_refuses_admission() {
        let mut cfg = BucketCacheConfig::default();
        cfg.max_metrics = 1;
        let cache = BucketCache::<CounterBucket>::new(cfg);

        cache.multi_set(&Metric::counter("a"), bn(0), bn(1), &[bucket(0)]);
        cache.multi_set(&Metric::counter("b"), bn(0), bn(1), &[bucket(0)]);

        let stats = cache.stats();
        assert_eq!(stats.cached_metrics, 1);
        assert_eq!(stats.admission_refusals, 1);
        assert!(cache.multi_get(&Metric::counter("b"), bn(0), bn(1)).is_none());
    }

    #[test]
    fn test_disabled_kind_is_never_cached() {
        let mut cfg = BucketCacheConfig::default();
        cfg.cache_counters = false;
        let cache = BucketCache::<CounterBucket>::new(cfg);
        let metric = Metric::counter("m");

        cache.multi_set(&metric, bn(0), bn(1), &[bucket(0)]);
        assert_eq!(cache.stats().cached_metrics, 0);
    }

    #[test]
    fn test_affinity_eviction_drops_stale_metrics() {
        let cache = cache();
        let covered = Metric::counter("covered");
        let stale = Metric::counter("stale");

        // `covered` holds 30s bucket 100, which covers tick at ts 100 * 30s.
        cache.multi_set(&covered, bn(100), bn(101), &[bucket(100)]);
        // `stale` holds an unrelated bucket far from the tick.
        cache.multi_set(&stale, bn(5), bn(6), &[bucket(5)]);

        cache.mark_processed_tick(Tick::at(Timestamp(100 * 30_000)));
        // First mark establishes state; nothing is evicted yet.
        assert_eq!(cache.stats().cached_metrics, 2);

        cache.mark_processed_tick(Tick::at(Timestamp(200 * 30_000)));
        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.cached_metrics, 1);
        assert!(cache.multi_get(&covered, bn(100), bn(101)).is_some());
    }

    #[test]
    fn test_repeated_tick_does_not_evict() {
        let cache = cache();
        let metric = Metric::counter("m");
        cache.multi_set(&metric, bn(5), bn(6), &[bucket(5)]);

        let tick = Tick::at(Timestamp(100 * 30_000));
        cache.mark_processed_tick(tick);
        cache.mark_processed_tick(tick);
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.stats().cached_metrics, 1);
    }
}
