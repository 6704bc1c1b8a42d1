//! Per-metric, per-window roll-up processing.
//!
//! One `process` invocation folds every source bucket that became
//! available since the metric's high-water mark into buckets aligned to
//! the target window, derives their summaries, persists newest-first,
//! publishes the derived buckets toward the next-larger window, advances
//! the mark, and sweeps the consumed sources. The mark only moves after
//! summaries are durable, so a failed invocation is always safe to
//! retry.

pub mod driver;

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::bucket::summary::Summary;
use crate::bucket::{Metric, WindowBucket};
use crate::cache::BucketCache;
use crate::store::{BucketStore, MetaStore, SummaryStore};
use crate::time::{BucketNumber, Timestamp, WindowDuration};

/// How the source read interacted with the bucket cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Miss,
    /// Raw sources and first-time metrics always read the store.
    Bypassed,
}

/// Report of one `process` invocation.
#[derive(Debug)]
pub struct Completion {
    /// Target buckets whose summaries were published.
    pub emitted: usize,
    /// Target groups dropped by the high-water idempotency check.
    pub skipped_groups: usize,
    /// Source buckets handed to the sweep.
    pub swept: usize,
    /// The high-water mark after this invocation.
    pub high_water: Option<Timestamp>,
    pub cache: CacheOutcome,
    /// The sweep failed; residual sources will be retried next pass.
    pub sweep_failed: bool,
}

impl Completion {
    fn no_op(high_water: Option<Timestamp>, cache: CacheOutcome) -> Completion {
        Completion {
            emitted: 0,
            skipped_groups: 0,
            swept: 0,
            high_water,
            cache,
            sweep_failed: false,
        }
    }
}

/// The roll-up unit for one `(bucket family, window)` pair. Holds its
/// collaborators by reference; one instance serves every metric of the
/// family.
pub struct WindowProcessor<T: WindowBucket> {
    window: WindowDuration,
    source_window: WindowDuration,
    /// Whether a larger window will consume this window's buckets.
    has_next: bool,
    buckets: Arc<dyn BucketStore<T>>,
    summaries: Arc<dyn SummaryStore>,
    meta: Arc<dyn MetaStore>,
    cache: Arc<BucketCache<T>>,
    slice_limit: usize,
}

impl<T: WindowBucket> WindowProcessor<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        window: WindowDuration,
        source_window: WindowDuration,
        has_next: bool,
        buckets: Arc<dyn BucketStore<T>>,
        summaries: Arc<dyn SummaryStore>,
        meta: Arc<dyn MetaStore>,
        cache: Arc<BucketCache<T>>,
        slice_limit: usize,
    ) -> Self {
        WindowProcessor {
            window,
            source_window,
            has_next,
            buckets,
            summaries,
            meta,
            cache,
            slice_limit,
        }
    }

    pub fn window(&self) -> WindowDuration {
        self.window
    }

    /// Consumes all source buckets available for `metric` up to
    /// `execution_ts`, emits summaries at the target window, advances the
    /// high-water mark, and removes the consumed sources.
    pub async fn process(&self, metric: &Metric, execution_ts: Timestamp) -> Result<Completion> {
        let high_water = self
            .meta
            .last_processed(metric, self.window)
            .await
            .context("reading high-water mark")?;

        let (sources, cache_outcome) = self.read_sources(metric, high_water, execution_ts).await?;
        if sources.iter().all(T::is_empty) {
            return Ok(Completion::no_op(high_water, cache_outcome));
        }

        // Partition sources by the target bucket containing their start.
        let mut groups: BTreeMap<i64, Vec<T>> = BTreeMap::new();
        for bucket in sources {
            if bucket.is_empty() {
                continue;
            }
            let target = bucket.number().rescaled_to(self.window);
            groups.entry(target.number()).or_default().push(bucket);
        }

        let mut emitted_buckets: Vec<T> = Vec::with_capacity(groups.len());
        let mut summaries: Vec<Summary> = Vec::with_capacity(groups.len());
        let mut sweep: Vec<T> = Vec::new();
        let mut skipped_groups = 0usize;

        for (target_number, members) in groups {
            let target = BucketNumber::new(target_number, self.window);
            let fresh = high_water.map_or(true, |h| target.start_timestamp() > h);
            if !fresh {
                // Re-delivered sources: swept below, but never re-summarized.
                skipped_groups += 1;
                sweep.extend(members);
                continue;
            }

            let folded = T::fold(target, &members);
            sweep.extend(members);
            if let Some(summary) = folded.summarize(metric.kind) {
                summaries.push(summary);
                emitted_buckets.push(folded);
            }
        }

        let mut new_high = high_water;
        if !summaries.is_empty() {
            summaries.sort_by_key(|s| Reverse(s.timestamp()));
            self.summaries
                .store(metric, self.window, &summaries)
                .await
                .context("persisting summaries")?;

            if self.has_next {
                self.buckets
                    .store(metric, self.window, &emitted_buckets)
                    .await
                    .context("publishing derived buckets")?;
                self.publish_to_cache(metric, &emitted_buckets);
            }

            // Newest-first order puts the new mark at the front.
            let advanced = summaries[0].timestamp();
            self.meta
                .update_last_processed(metric, self.window, advanced)
                .await
                .context("advancing high-water mark")?;
            new_high = Some(advanced);
        }

        let mut sweep_failed = false;
        let swept = sweep.len();
        if !sweep.is_empty() {
            if let Err(e) = self.buckets.remove(metric, self.source_window, &sweep).await {
                warn!(
                    metric = %metric,
                    window = %self.window,
                    error = %e,
                    "source bucket removal failed, residue retried next pass"
                );
                sweep_failed = true;
            }
        }

        debug!(
            metric = %metric,
            window = %self.window,
            emitted = emitted_buckets.len(),
            skipped_groups,
            swept,
            cache = ?cache_outcome,
            "window processed"
        );

        Ok(Completion {
            emitted: emitted_buckets.len(),
            skipped_groups,
            swept,
            high_water: new_high,
            cache: cache_outcome,
            sweep_failed,
        })
    }

    /// Reads the source buckets in `[high_water, execution_ts]`.
    ///
    /// Derived source windows consult the cache first, over the source
    /// slots published since the previous processing tick; anything less
    /// than full coverage falls through to the store. Raw sources and
    /// the first-ever tick always read the store.
    async fn read_sources(
        &self,
        metric: &Metric,
        high_water: Option<Timestamp>,
        execution_ts: Timestamp,
    ) -> Result<(Vec<T>, CacheOutcome)> {
        let mut outcome = CacheOutcome::Bypassed;
        if !self.source_window.is_raw() {
            if let Some(prev_tick) = self.cache.last_tick() {
                let from_n = prev_tick
                    .timestamp()
                    .to_bucket_number_of(self.source_window)
                    .number()
                    + 1;
                let to_n = execution_ts
                    .to_bucket_number_of(self.source_window)
                    .number()
                    + 1;
                if from_n < to_n {
                    let from = BucketNumber::new(from_n, self.source_window);
                    let to = BucketNumber::new(to_n, self.source_window);
                    if let Some(buckets) = self.cache.multi_get(metric, from, to) {
                        return Ok((buckets, CacheOutcome::Hit));
                    }
                    outcome = CacheOutcome::Miss;
                }
            }
        }

        let from = high_water.unwrap_or(Timestamp::MIN);
        let slice = self
            .buckets
            .slice(
                metric,
                self.source_window,
                from,
                execution_ts.next(),
                self.slice_limit,
            )
            .await
            .context("reading source buckets")?;
        Ok((slice.buckets, outcome))
    }

    /// Publishes derived buckets for the next window's read, spanning the
    /// full emitted range so gaps become sentinels.
    fn publish_to_cache(&self, metric: &Metric, buckets: &[T]) {
        let numbers = buckets.iter().map(|b| b.number().number());
        let (Some(min), Some(max)) = (numbers.clone().min(), numbers.max()) else {
            return;
        };
        self.cache.multi_set(
            metric,
            BucketNumber::new(min, self.window),
            BucketNumber::new(max + 1, self.window),
            buckets,
        );
    }
}
