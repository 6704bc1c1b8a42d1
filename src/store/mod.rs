//! Persistence contracts consumed by the roll-up core.
//!
//! The column-store driver itself is an external collaborator; the core
//! only depends on these seams. All operations are asynchronous and
//! compose sequentially inside one `process` invocation.

pub mod clickhouse;
pub mod memory;
pub mod schema;

use anyhow::Result;
use async_trait::async_trait;

use crate::bucket::summary::Summary;
use crate::bucket::{Metric, WindowBucket};
use crate::time::{Timestamp, WindowDuration};

/// The result of one bucket slice read. Rows use append semantics keyed
/// by `(metric, timestamp)` with a blob list, so one row may yield
/// several buckets.
#[derive(Debug)]
pub struct BucketSlice<T> {
    /// Decoded buckets, ascending by row timestamp.
    pub buckets: Vec<T>,
    /// Number of rows the slice covered.
    pub rows: usize,
}

impl<T> Default for BucketSlice<T> {
    fn default() -> Self {
        BucketSlice {
            buckets: Vec::new(),
            rows: 0,
        }
    }
}

/// Bucket persistence for one bucket family across all windows.
#[async_trait]
pub trait BucketStore<T: WindowBucket>: Send + Sync {
    /// Buckets with row timestamps in `[from, to)`, ascending, up to
    /// `limit` rows.
    async fn slice(
        &self,
        metric: &Metric,
        window: WindowDuration,
        from: Timestamp,
        to: Timestamp,
        limit: usize,
    ) -> Result<BucketSlice<T>>;

    /// Appends buckets to the blob list of their `(metric, timestamp)`
    /// row.
    async fn store(&self, metric: &Metric, window: WindowDuration, buckets: &[T]) -> Result<()>;

    /// Deletes the `(metric, timestamp)` rows of the given buckets.
    async fn remove(&self, metric: &Metric, window: WindowDuration, buckets: &[T]) -> Result<()>;
}

/// Summary persistence: upsert keyed by `(metric, timestamp)`.
#[async_trait]
pub trait SummaryStore: Send + Sync {
    async fn store(
        &self,
        metric: &Metric,
        window: WindowDuration,
        summaries: &[Summary],
    ) -> Result<()>;
}

/// Metric descriptors and per-(metric, window) high-water marks.
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn last_processed(
        &self,
        metric: &Metric,
        window: WindowDuration,
    ) -> Result<Option<Timestamp>>;

    async fn update_last_processed(
        &self,
        metric: &Metric,
        window: WindowDuration,
        ts: Timestamp,
    ) -> Result<()>;

    /// Registers a metric descriptor. Idempotent; `contains` may lag.
    async fn insert(&self, metric: &Metric) -> Result<()>;

    async fn contains(&self, metric: &Metric) -> Result<bool>;

    /// All registered metrics, for the roll-up driver's enumeration.
    async fn metrics(&self) -> Result<Vec<Metric>>;
}
