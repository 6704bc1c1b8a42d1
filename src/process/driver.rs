//! Single-node roll-up driver.
//!
//! Stands in for the external dispatcher: on every tick it enumerates
//! the registered metrics and runs each window's processor smallest to
//! largest, then records the tick with both bucket caches so affinity
//! eviction can observe it. Per-metric failures are logged and retried
//! on the next tick; the high-water marks make that safe.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bucket::{CounterBucket, HistogramBucket, Metric, MetricKind};
use crate::cache::BucketCache;
use crate::store::{BucketStore, MetaStore, SummaryStore};
use crate::time::{Tick, WindowDuration};

use super::WindowProcessor;

/// The four store seams the roll-up pipeline runs against.
#[derive(Clone)]
pub struct RollupStores {
    pub histograms: Arc<dyn BucketStore<HistogramBucket>>,
    pub counters: Arc<dyn BucketStore<CounterBucket>>,
    pub summaries: Arc<dyn SummaryStore>,
    pub meta: Arc<dyn MetaStore>,
}

/// Outcome of one driver pass, for logging and tests.
#[derive(Debug, Default)]
pub struct DriverPass {
    pub metrics: usize,
    pub summaries_emitted: usize,
    pub failures: usize,
}

pub struct RollupDriver {
    histogram_processors: Vec<WindowProcessor<HistogramBucket>>,
    counter_processors: Vec<WindowProcessor<CounterBucket>>,
    histogram_cache: Arc<BucketCache<HistogramBucket>>,
    counter_cache: Arc<BucketCache<CounterBucket>>,
    meta: Arc<dyn MetaStore>,
    tick_interval: Duration,
    tick_safety: Duration,
}

impl RollupDriver {
    /// Builds one processor per window above raw, each sourcing from the
    /// next-smaller duration.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        windows: &[WindowDuration],
        stores: RollupStores,
        histogram_cache: Arc<BucketCache<HistogramBucket>>,
        counter_cache: Arc<BucketCache<CounterBucket>>,
        slice_limit: usize,
        tick_interval: Duration,
        tick_safety: Duration,
    ) -> Self {
        let mut histogram_processors = Vec::with_capacity(windows.len().saturating_sub(1));
        let mut counter_processors = Vec::with_capacity(windows.len().saturating_sub(1));

        for (i, &window) in windows.iter().enumerate().skip(1) {
            let source = windows[i - 1];
            let has_next = i + 1 < windows.len();
            histogram_processors.push(WindowProcessor::new(
                window,
                source,
                has_next,
                stores.histograms.clone(),
                stores.summaries.clone(),
                stores.meta.clone(),
                histogram_cache.clone(),
                slice_limit,
            ));
            counter_processors.push(WindowProcessor::new(
                window,
                source,
                has_next,
                stores.counters.clone(),
                stores.summaries.clone(),
                stores.meta.clone(),
                counter_cache.clone(),
                slice_limit,
            ));
        }

        RollupDriver {
            histogram_processors,
            counter_processors,
            histogram_cache,
            counter_cache,
            meta: stores.meta,
            tick_interval,
            tick_safety,
        }
    }

    /// Runs the driver until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            tick_interval = ?self.tick_interval,
            tick_safety = ?self.tick_safety,
            windows = self.histogram_processors.len(),
            "roll-up driver started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("roll-up driver stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let tick = Tick::current(self.tick_safety);
                    let pass = self.run_once(tick).await;
                    debug!(
                        tick = tick.bucket_number().number(),
                        metrics = pass.metrics,
                        summaries = pass.summaries_emitted,
                        failures = pass.failures,
                        "tick processed"
                    );
                }
            }
        }
    }

    /// One full pass: every metric, every window smallest to largest,
    /// then the tick mark that drives cache affinity eviction.
    pub async fn run_once(&self, tick: Tick) -> DriverPass {
        let mut pass = DriverPass::default();

        let metrics = match self.meta.metrics().await {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!(error = %e, "metric enumeration failed, skipping tick");
                pass.failures += 1;
                return pass;
            }
        };
        pass.metrics = metrics.len();

        for metric in &metrics {
            match metric.kind {
                MetricKind::Timer | MetricKind::Gauge => {
                    pass.absorb(
                        Self::process_metric(&self.histogram_processors, metric, tick).await,
                    );
                }
                MetricKind::Counter => {
                    pass.absorb(Self::process_metric(&self.counter_processors, metric, tick).await);
                }
            }
        }

        self.histogram_cache.mark_processed_tick(tick);
        self.counter_cache.mark_processed_tick(tick);
        pass
    }

    /// Processes one metric through a window hierarchy. A failing window
    /// stops the larger ones this tick: their sources are not ready.
    async fn process_metric<T: crate::bucket::WindowBucket>(
        processors: &[WindowProcessor<T>],
        metric: &Metric,
        tick: Tick,
    ) -> DriverPass {
        let mut pass = DriverPass::default();
        for processor in processors {
            match processor.process(metric, tick.timestamp()).await {
                Ok(done) => pass.summaries_emitted += done.emitted,
                Err(e) => {
                    warn!(
                        metric = %metric,
                        window = %processor.window(),
                        error = %e,
                        "window processing failed, rescheduling on next tick"
                    );
                    pass.failures += 1;
                    break;
                }
            }
        }
        pass
    }
}

impl DriverPass {
    fn absorb(&mut self, other: DriverPass) {
        self.summaries_emitted += other.summaries_emitted;
        self.failures += other.failures;
    }
}
