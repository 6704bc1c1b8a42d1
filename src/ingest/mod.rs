//! Write-side ingestion: measurement batches become 1 ms raw buckets.
//!
//! Incoming measurements are dispatched by metric kind, grouped by a
//! coarse timestamp granule, and appended to the raw bucket store one
//! group after another per metric. The raw store uses blob-list append
//! semantics keyed by `(metric, timestamp)`, so at-least-once delivery
//! is acceptable; the roll-up pipeline merges duplicates later.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashSet;
use tracing::{debug, warn};

use crate::bucket::{CounterBucket, HistogramBucket, Metric, MetricKind, new_histogram};
use crate::store::{BucketStore, MetaStore};
use crate::time::{Tick, Timestamp, WindowDuration};

/// One metric's measurements as they arrive on the wire: a kind tag and
/// timestamped value lists.
#[derive(Debug, Clone)]
pub struct MetricMeasurement {
    pub name: String,
    pub kind: String,
    pub points: Vec<MeasurementPoint>,
}

#[derive(Debug, Clone)]
pub struct MeasurementPoint {
    pub timestamp: Timestamp,
    pub values: Vec<i64>,
}

/// Converts measurement batches into raw buckets and registers metrics
/// on first sight.
pub struct MeasurementWriter {
    histograms: Arc<dyn BucketStore<HistogramBucket>>,
    counters: Arc<dyn BucketStore<CounterBucket>>,
    meta: Arc<dyn MetaStore>,
    /// Best-effort membership cache in front of the meta store.
    known_metrics: DashSet<String>,
    granule: WindowDuration,
    tick_safety: Duration,
}

impl MeasurementWriter {
    pub fn new(
        histograms: Arc<dyn BucketStore<HistogramBucket>>,
        counters: Arc<dyn BucketStore<CounterBucket>>,
        meta: Arc<dyn MetaStore>,
        granule: WindowDuration,
        tick_safety: Duration,
    ) -> Self {
        MeasurementWriter {
            histograms,
            counters,
            meta,
            known_metrics: DashSet::new(),
            granule,
            tick_safety,
        }
    }

    /// Stores a measurement batch. Groups of one metric are applied in
    /// sequence; metrics with unknown kinds are discarded with a report
    /// and never abort the rest of the batch.
    pub async fn store_metric_measurements(&self, batch: &[MetricMeasurement]) -> Result<()> {
        let tick = Tick::current(self.tick_safety);

        for measurement in batch {
            if measurement.points.is_empty() {
                continue;
            }

            let Some(kind) = MetricKind::parse(&measurement.kind) else {
                warn!(
                    metric = %measurement.name,
                    kind = %measurement.kind,
                    "unsupported metric kind, discarding measurements"
                );
                continue;
            };
            let metric = Metric::new(measurement.name.clone(), kind);

            self.store_one_metric(&metric, &measurement.points, tick)
                .await
                .with_context(|| format!("storing measurements for {metric}"))?;

            self.register_if_unseen(&metric).await?;
        }

        Ok(())
    }

    async fn store_one_metric(
        &self,
        metric: &Metric,
        points: &[MeasurementPoint],
        tick: Tick,
    ) -> Result<()> {
        // Coarse grouping: all points in the same granule share one raw
        // bucket.
        let mut groups: BTreeMap<i64, Vec<&MeasurementPoint>> = BTreeMap::new();
        for point in points {
            let group_ts = point.timestamp.aligned_to(self.granule);
            groups.entry(group_ts.0).or_default().push(point);
        }

        let mut negatives: Vec<i64> = Vec::new();
        for (group_ts, group) in groups {
            let raw_bn = Timestamp(group_ts).to_bucket_number_of(WindowDuration::RAW);
            if tick.already_processed(raw_bn) {
                // The source logs and stores anyway; gating here would
                // silently drop late data.
                warn!(
                    metric = %metric,
                    bucket = %raw_bn,
                    "storing measurements for an already-processed bucket"
                );
            }

            if metric.kind.uses_histogram() {
                let mut histogram = new_histogram();
                for point in &group {
                    for &value in &point.values {
                        if value < 0 {
                            negatives.push(value);
                            continue;
                        }
                        histogram.saturating_record(value as u64);
                    }
                }
                let bucket = HistogramBucket::new(raw_bn, histogram);
                self.histograms
                    .store(metric, WindowDuration::RAW, &[bucket])
                    .await?;
            } else {
                let mut counts = 0i64;
                for point in &group {
                    for &value in &point.values {
                        if value < 0 {
                            negatives.push(value);
                            continue;
                        }
                        counts = counts.saturating_add(value);
                    }
                }
                let bucket = CounterBucket::new(raw_bn, counts);
                self.counters
                    .store(metric, WindowDuration::RAW, &[bucket])
                    .await?;
            }
        }

        if !negatives.is_empty() {
            warn!(metric = %metric, values = ?negatives, "dropped negative measurement values");
        }

        Ok(())
    }

    /// Check-then-insert over a best-effort cache. `insert` is
    /// idempotent, so a racing duplicate registration is harmless.
    async fn register_if_unseen(&self, metric: &Metric) -> Result<()> {
        if self.known_metrics.contains(&metric.name) {
            return Ok(());
        }
        if !self
            .meta
            .contains(metric)
            .await
            .context("checking metric registration")?
        {
            self.meta
                .insert(metric)
                .await
                .context("registering metric")?;
            debug!(metric = %metric, "registered new metric");
        }
        self.known_metrics.insert(metric.name.clone());
        Ok(())
    }
}
