//! In-memory store implementations backing unit and integration tests
//! and the `memory` backend of the binary. Rows hold the same versioned
//! blobs the column store would, so the codec is exercised on every
//! read and write path.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::ops::Bound;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::bucket::codec::decode_lossy;
use crate::bucket::summary::Summary;
use crate::bucket::{Metric, MetricKind, WindowBucket};
use crate::time::{Timestamp, WindowDuration};

use super::{BucketSlice, BucketStore, MetaStore, SummaryStore};

type RowKey = (String, u64);

/// Blob-list bucket rows keyed by `(metric, window)` then timestamp.
pub struct MemoryBucketStore<T> {
    rows: Mutex<BTreeMap<RowKey, BTreeMap<i64, Vec<Vec<u8>>>>>,
    _family: PhantomData<fn() -> T>,
}

impl<T: WindowBucket> MemoryBucketStore<T> {
    pub fn new() -> Self {
        MemoryBucketStore {
            rows: Mutex::new(BTreeMap::new()),
            _family: PhantomData,
        }
    }

    fn key(metric: &Metric, window: WindowDuration) -> RowKey {
        (metric.name.clone(), window.as_millis())
    }

    /// Number of rows currently held for a metric/window. Test helper.
    pub fn row_count(&self, metric: &Metric, window: WindowDuration) -> usize {
        self.rows
            .lock()
            .get(&Self::key(metric, window))
            .map_or(0, |rows| rows.len())
    }
}

impl<T: WindowBucket> Default for MemoryBucketStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: WindowBucket> BucketStore<T> for MemoryBucketStore<T> {
    async fn slice(
        &self,
        metric: &Metric,
        window: WindowDuration,
        from: Timestamp,
        to: Timestamp,
        limit: usize,
    ) -> Result<BucketSlice<T>> {
        let rows = self.rows.lock();
        let Some(metric_rows) = rows.get(&Self::key(metric, window)) else {
            return Ok(BucketSlice::default());
        };

        let mut slice = BucketSlice::default();
        for (_, blobs) in metric_rows.range((Bound::Included(from.0), Bound::Excluded(to.0))) {
            if slice.rows >= limit {
                break;
            }
            slice.rows += 1;
            for blob in blobs {
                slice.buckets.push(decode_lossy::<T>(blob));
            }
        }
        Ok(slice)
    }

    async fn store(&self, metric: &Metric, window: WindowDuration, buckets: &[T]) -> Result<()> {
        let mut rows = self.rows.lock();
        let metric_rows = rows.entry(Self::key(metric, window)).or_default();
        for bucket in buckets {
            if bucket.is_empty() {
                continue;
            }
            let blob = bucket.encode()?;
            metric_rows
                .entry(bucket.timestamp().0)
                .or_default()
                .push(blob);
        }
        Ok(())
    }

    async fn remove(&self, metric: &Metric, window: WindowDuration, buckets: &[T]) -> Result<()> {
        let mut rows = self.rows.lock();
        if let Some(metric_rows) = rows.get_mut(&Self::key(metric, window)) {
            for bucket in buckets {
                if bucket.is_empty() {
                    continue;
                }
                metric_rows.remove(&bucket.timestamp().0);
            }
        }
        Ok(())
    }
}

/// Upsert summary rows keyed by `(metric, window)` then timestamp.
#[derive(Default)]
pub struct MemorySummaryStore {
    rows: Mutex<BTreeMap<RowKey, BTreeMap<i64, Summary>>>,
}

impl MemorySummaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Summaries for a metric/window, ascending by timestamp. Test helper.
    pub fn summaries(&self, metric: &Metric, window: WindowDuration) -> Vec<Summary> {
        self.rows
            .lock()
            .get(&(metric.name.clone(), window.as_millis()))
            .map_or_else(Vec::new, |rows| rows.values().cloned().collect())
    }
}

#[async_trait]
impl SummaryStore for MemorySummaryStore {
    async fn store(
        &self,
        metric: &Metric,
        window: WindowDuration,
        summaries: &[Summary],
    ) -> Result<()> {
        let mut rows = self.rows.lock();
        let metric_rows = rows
            .entry((metric.name.clone(), window.as_millis()))
            .or_default();
        for summary in summaries {
            metric_rows.insert(summary.timestamp().0, summary.clone());
        }
        Ok(())
    }
}

#[derive(Default)]
struct MetaInner {
    marks: BTreeMap<RowKey, i64>,
    descriptors: BTreeMap<String, MetricKind>,
}

/// Metric descriptors and high-water marks.
#[derive(Default)]
pub struct MemoryMetaStore {
    inner: Mutex<MetaInner>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn last_processed(
        &self,
        metric: &Metric,
        window: WindowDuration,
    ) -> Result<Option<Timestamp>> {
        Ok(self
            .inner
            .lock()
            .marks
            .get(&(metric.name.clone(), window.as_millis()))
            .map(|&ms| Timestamp(ms)))
    }

    async fn update_last_processed(
        &self,
        metric: &Metric,
        window: WindowDuration,
        ts: Timestamp,
    ) -> Result<()> {
        self.inner
            .lock()
            .marks
            .insert((metric.name.clone(), window.as_millis()), ts.0);
        Ok(())
    }

    async fn insert(&self, metric: &Metric) -> Result<()> {
        self.inner
            .lock()
            .descriptors
            .insert(metric.name.clone(), metric.kind);
        Ok(())
    }

    async fn contains(&self, metric: &Metric) -> Result<bool> {
        Ok(self.inner.lock().descriptors.contains_key(&metric.name))
    }

    async fn metrics(&self) -> Result<Vec<Metric>> {
        Ok(self
            .inner
            .lock()
            .descriptors
            .iter()
            .map(|(name, &kind)| Metric::new(name.clone(), kind))
            .collect())
    }
}
