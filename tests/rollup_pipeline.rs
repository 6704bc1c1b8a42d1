//! Black-box roll-up pipeline tests over the in-memory backend:
//! ingest -> smallest-window processing -> higher-window processing,
//! with exact summary assertions.

use std::sync::Arc;
use std::time::Duration;

use windroll::bucket::summary::Summary;
use windroll::bucket::{
    new_histogram, CounterBucket, HistogramBucket, Metric, WindowBucket,
};
use windroll::cache::BucketCache;
use windroll::config::BucketCacheConfig;
use windroll::ingest::{MeasurementPoint, MeasurementWriter, MetricMeasurement};
use windroll::process::{CacheOutcome, WindowProcessor};
use windroll::store::memory::{MemoryBucketStore, MemoryMetaStore, MemorySummaryStore};
use windroll::store::{BucketStore, MetaStore};
use windroll::time::{BucketNumber, Tick, Timestamp, WindowDuration};

const RAW: WindowDuration = WindowDuration::RAW;
const S30: WindowDuration = WindowDuration::from_millis(30_000);
const M5: WindowDuration = WindowDuration::from_millis(300_000);

struct Pipeline {
    histograms: Arc<MemoryBucketStore<HistogramBucket>>,
    counters: Arc<MemoryBucketStore<CounterBucket>>,
    summaries: Arc<MemorySummaryStore>,
    meta: Arc<MemoryMetaStore>,
    histogram_cache: Arc<BucketCache<HistogramBucket>>,
    counter_cache: Arc<BucketCache<CounterBucket>>,
}

impl Pipeline {
    fn new() -> Pipeline {
        Pipeline {
            histograms: Arc::new(MemoryBucketStore::new()),
            counters: Arc::new(MemoryBucketStore::new()),
            summaries: Arc::new(MemorySummaryStore::new()),
            meta: Arc::new(MemoryMetaStore::new()),
            histogram_cache: Arc::new(BucketCache::new(BucketCacheConfig::default())),
            counter_cache: Arc::new(BucketCache::new(BucketCacheConfig::default())),
        }
    }

    fn histogram_processor(
        &self,
        window: WindowDuration,
        source: WindowDuration,
    ) -> WindowProcessor<HistogramBucket> {
        WindowProcessor::new(
            window,
            source,
            true,
            self.histograms.clone(),
            self.summaries.clone(),
            self.meta.clone(),
            self.histogram_cache.clone(),
            10_000,
        )
    }

    fn counter_processor(
        &self,
        window: WindowDuration,
        source: WindowDuration,
    ) -> WindowProcessor<CounterBucket> {
        WindowProcessor::new(
            window,
            source,
            true,
            self.counters.clone(),
            self.summaries.clone(),
            self.meta.clone(),
            self.counter_cache.clone(),
            10_000,
        )
    }

    fn writer(&self) -> MeasurementWriter {
        MeasurementWriter::new(
            self.histograms.clone(),
            self.counters.clone(),
            self.meta.clone(),
            WindowDuration::from_millis(5_000),
            Duration::from_secs(30),
        )
    }
}

fn raw_histogram(n: i64, values: impl IntoIterator<Item = u64>) -> HistogramBucket {
    let mut h = new_histogram();
    for v in values {
        h.saturating_record(v);
    }
    HistogramBucket::new(BucketNumber::new(n, RAW), h)
}

fn statistic(summary: &Summary) -> &windroll::bucket::summary::StatisticSummary {
    match summary {
        Summary::Statistic(s) => s,
        other => panic!("expected statistic summary, got {other:?}"),
    }
}

fn counter_count(summary: &Summary) -> i64 {
    match summary {
        Summary::Counter(c) => c.count,
        other => panic!("expected counter summary, got {other:?}"),
    }
}

/// Scenario 1: two 30s summaries from three raw buckets, with exact
/// percentiles and moments.
#[tokio::test]
async fn two_bucket_summary_over_30s_window() {
    let pipeline = Pipeline::new();
    let metric = Metric::timer("request_time");

    pipeline
        .histograms
        .store(
            &metric,
            RAW,
            &[
                raw_histogram(1, 1..=50),
                raw_histogram(2, 51..=100),
                raw_histogram(30_001, [100, 100]),
            ],
        )
        .await
        .expect("seed raw buckets");

    let done = pipeline
        .histogram_processor(S30, RAW)
        .process(&metric, Timestamp(30_001))
        .await
        .expect("process");

    assert_eq!(done.emitted, 2);
    assert_eq!(done.high_water, Some(Timestamp(30_000)));
    assert_eq!(
        pipeline
            .meta
            .last_processed(&metric, S30)
            .await
            .expect("mark"),
        Some(Timestamp(30_000))
    );

    let summaries = pipeline.summaries.summaries(&metric, S30);
    assert_eq!(summaries.len(), 2);

    let first = statistic(&summaries[0]);
    assert_eq!(first.timestamp, Timestamp(0));
    assert_eq!(first.min, 1);
    assert_eq!(first.max, 100);
    assert_eq!(first.count, 100);
    assert!((first.mean - 50.5).abs() < 1e-9, "mean={}", first.mean);
    assert_eq!(first.p50, 50);
    assert_eq!(first.p80, 80);
    assert_eq!(first.p90, 90);
    assert_eq!(first.p95, 95);
    assert_eq!(first.p99, 99);
    assert_eq!(first.p999, 100);

    let second = statistic(&summaries[1]);
    assert_eq!(second.timestamp, Timestamp(30_000));
    assert_eq!(second.min, 100);
    assert_eq!(second.max, 100);
    assert_eq!(second.count, 2);
    assert!((second.mean - 100.0).abs() < 1e-9);
    assert_eq!(second.p50, 100);
    assert_eq!(second.p999, 100);

    // All three raw buckets removed.
    assert_eq!(pipeline.histograms.row_count(&metric, RAW), 0);
}

/// Scenario 2: an interval already covered by the mark publishes nothing
/// but still sweeps the residual raw rows.
#[tokio::test]
async fn reprocess_is_a_publish_free_sweep() {
    let pipeline = Pipeline::new();
    let metric = Metric::timer("request_time");

    pipeline
        .meta
        .update_last_processed(&metric, S30, Timestamp(15_000))
        .await
        .expect("seed mark");
    pipeline
        .histograms
        .store(&metric, RAW, &[raw_histogram(15_000, [7])])
        .await
        .expect("seed raw");

    let done = pipeline
        .histogram_processor(S30, RAW)
        .process(&metric, Timestamp(20_000))
        .await
        .expect("process");

    assert_eq!(done.emitted, 0);
    assert_eq!(done.skipped_groups, 1);
    assert!(pipeline.summaries.summaries(&metric, S30).is_empty());
    assert_eq!(pipeline.histograms.row_count(&metric, RAW), 0);
    // The mark did not move.
    assert_eq!(
        pipeline
            .meta
            .last_processed(&metric, S30)
            .await
            .expect("mark"),
        Some(Timestamp(15_000))
    );
}

/// Scenario 3: an empty source slice is a complete no-op.
#[tokio::test]
async fn empty_source_slice_changes_nothing() {
    let pipeline = Pipeline::new();
    let metric = Metric::timer("request_time");

    let done = pipeline
        .histogram_processor(S30, RAW)
        .process(&metric, Timestamp(60_000))
        .await
        .expect("process");

    assert_eq!(done.emitted, 0);
    assert_eq!(done.swept, 0);
    assert!(pipeline.summaries.summaries(&metric, S30).is_empty());
    assert!(pipeline
        .meta
        .last_processed(&metric, S30)
        .await
        .expect("mark")
        .is_none());
}

/// Scenario 4: negative counter values are dropped at ingest; the stored
/// bucket sums only the non-negative ones.
#[tokio::test]
async fn negative_values_dropped_at_ingest() {
    let pipeline = Pipeline::new();
    let writer = pipeline.writer();

    writer
        .store_metric_measurements(&[MetricMeasurement {
            name: "requests".to_string(),
            kind: "counter".to_string(),
            points: vec![MeasurementPoint {
                timestamp: Timestamp(2_000),
                values: vec![3, -1, 4, -5, 2],
            }],
        }])
        .await
        .expect("ingest");

    let metric = Metric::counter("requests");
    let done = pipeline
        .counter_processor(S30, RAW)
        .process(&metric, Timestamp(30_000))
        .await
        .expect("process");
    assert_eq!(done.emitted, 1);

    let summaries = pipeline.summaries.summaries(&metric, S30);
    assert_eq!(summaries.len(), 1);
    assert_eq!(counter_count(&summaries[0]), 9);
}

/// Scenario 5: a full-range read is a hit that empties the range; the
/// repeated read misses.
#[tokio::test]
async fn cache_hit_then_miss_on_reread() {
    let cache: BucketCache<CounterBucket> = BucketCache::new(BucketCacheConfig::default());
    let metric = Metric::counter("requests");
    let bn = |n: i64| BucketNumber::new(n, S30);

    cache.multi_set(
        &metric,
        bn(10),
        bn(15),
        &[
            CounterBucket::new(bn(10), 1),
            CounterBucket::new(bn(12), 2),
        ],
    );

    let got = cache.multi_get(&metric, bn(10), bn(15)).expect("hit");
    assert_eq!(got.len(), 5);
    assert!(!got[0].is_empty());
    assert!(got[1].is_empty());
    assert!(!got[2].is_empty());
    assert!(got[3].is_empty());
    assert!(got[4].is_empty());

    assert!(cache.multi_get(&metric, bn(10), bn(15)).is_none());
}

/// Scenario 6: a metric whose cached buckets do not cover the previous
/// tick is dropped when the tick advances; a covered one is retained.
#[tokio::test]
async fn affinity_eviction_on_tick_change() {
    let cache: BucketCache<CounterBucket> = BucketCache::new(BucketCacheConfig::default());
    let bn = |n: i64| BucketNumber::new(n, S30);

    let retained = Metric::counter("retained");
    cache.multi_set(&retained, bn(100), bn(101), &[CounterBucket::new(bn(100), 1)]);

    let dropped = Metric::counter("dropped");
    cache.multi_set(&dropped, bn(7), bn(8), &[CounterBucket::new(bn(7), 1)]);

    // Tick covered by 30s bucket 100.
    cache.mark_processed_tick(Tick::at(Timestamp(100 * 30_000)));
    cache.mark_processed_tick(Tick::at(Timestamp(200 * 30_000)));

    assert!(cache.multi_get(&retained, bn(100), bn(101)).is_some());
    assert!(cache.multi_get(&dropped, bn(7), bn(8)).is_none());
    assert_eq!(cache.stats().evictions, 1);
}

/// Full pipeline: ingest -> 30s roll-up -> 5m roll-up, with the 5m pass
/// sourcing its buckets from the cache the 30s pass filled.
#[tokio::test]
async fn ingest_rolls_up_through_two_windows() {
    let pipeline = Pipeline::new();
    let writer = pipeline.writer();
    let metric = Metric::timer("db_query_time");

    writer
        .store_metric_measurements(&[MetricMeasurement {
            name: "db_query_time".to_string(),
            kind: "timer".to_string(),
            points: vec![
                MeasurementPoint {
                    timestamp: Timestamp(1_000),
                    values: vec![10, 20],
                },
                MeasurementPoint {
                    timestamp: Timestamp(31_000),
                    values: vec![30],
                },
            ],
        }])
        .await
        .expect("ingest");

    // Metric registered on first sight.
    assert!(pipeline.meta.contains(&metric).await.expect("contains"));

    let done_30s = pipeline
        .histogram_processor(S30, RAW)
        .process(&metric, Timestamp(40_000))
        .await
        .expect("30s pass");
    assert_eq!(done_30s.emitted, 2);

    // The previous tick preceded the published 30s slots, so the 5m pass
    // reads them straight from the cache.
    pipeline
        .histogram_cache
        .mark_processed_tick(Tick::at(Timestamp(-1)));

    let done_5m = pipeline
        .histogram_processor(M5, S30)
        .process(&metric, Timestamp(40_000))
        .await
        .expect("5m pass");
    assert_eq!(done_5m.cache, CacheOutcome::Hit);
    assert_eq!(done_5m.emitted, 1);

    let summaries = pipeline.summaries.summaries(&metric, M5);
    assert_eq!(summaries.len(), 1);
    let s = statistic(&summaries[0]);
    assert_eq!(s.count, 3);
    assert_eq!(s.min, 10);
    assert_eq!(s.max, 30);
    assert_eq!(s.p50, 20);

    // Both layers of source buckets were swept.
    assert_eq!(pipeline.histograms.row_count(&metric, RAW), 0);
    assert_eq!(pipeline.histograms.row_count(&metric, S30), 0);
}
