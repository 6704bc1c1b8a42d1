//! ClickHouse-backed store adapters.
//!
//! Inserts are hand-built batch `INSERT ... VALUES` statements with hex
//! blob literals, chunked by the configured insert size. Bucket rows are
//! append-only: one `(metric, timestamp)` key may accumulate several
//! rows, which the slice read flattens back into a blob list. Summary
//! tables are ReplacingMergeTree upserts; retention is applied as
//! table-level TTLs by the schema module.

use std::fmt::Write;
use std::marker::PhantomData;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clickhouse_rs::Pool;
use tracing::warn;

use crate::bucket::codec::{decode_lossy, encode_summary};
use crate::bucket::summary::Summary;
use crate::bucket::{Metric, MetricKind, WindowBucket};
use crate::config::ClickHouseConfig;
use crate::time::{Timestamp, WindowDuration};

use super::{BucketSlice, BucketStore, MetaStore, SummaryStore};

/// Builds a connection pool from configuration.
pub fn connect(cfg: &ClickHouseConfig) -> Pool {
    let credentials = if cfg.username.is_empty() {
        String::new()
    } else {
        format!("{}:{}@", cfg.username, cfg.password)
    };
    let url = format!("tcp://{}{}/{}", credentials, cfg.endpoint, cfg.database);
    Pool::new(url)
}

/// Escapes a string for embedding in a single-quoted SQL literal.
fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Appends `unhex('…')` for a blob.
fn append_blob_literal(sql: &mut String, blob: &[u8]) {
    sql.push_str("unhex('");
    for byte in blob {
        let _ = write!(sql, "{byte:02x}");
    }
    sql.push_str("')");
}

fn bucket_table(database: &str, family: &str, window: WindowDuration) -> String {
    format!("{database}.windroll_bucket_{family}_{}", window.as_millis())
}

fn summary_table(database: &str, kind: MetricKind, window: WindowDuration) -> String {
    let variant = match kind {
        MetricKind::Timer => "statistic",
        MetricKind::Gauge => "gauge",
        MetricKind::Counter => "counter",
    };
    format!("{database}.windroll_summary_{variant}_{}", window.as_millis())
}

fn meta_table(database: &str) -> String {
    format!("{database}.windroll_meta")
}

/// Bucket rows for one family: `(metric, timestamp, buckets)`.
pub struct ClickHouseBucketStore<T: WindowBucket> {
    pool: Pool,
    database: String,
    insert_chunk_size: usize,
    _family: PhantomData<fn() -> T>,
}

impl<T: WindowBucket> ClickHouseBucketStore<T> {
    pub fn new(pool: Pool, cfg: &ClickHouseConfig) -> Self {
        ClickHouseBucketStore {
            pool,
            database: cfg.database.clone(),
            insert_chunk_size: cfg.insert_chunk_size.max(1),
            _family: PhantomData,
        }
    }

    fn insert_sql(&self, metric: &Metric, window: WindowDuration, chunk: &[(i64, Vec<u8>)]) -> String {
        let table = bucket_table(&self.database, T::KIND, window);
        let name = escape_sql(&metric.name);
        let mut sql = String::with_capacity(96 + chunk.len() * 128);
        let _ = write!(sql, "INSERT INTO {table} (metric, timestamp, buckets) VALUES ");
        for (idx, (ts, blob)) in chunk.iter().enumerate() {
            if idx > 0 {
                sql.push_str(", ");
            }
            let _ = write!(sql, "('{name}', {ts}, [");
            append_blob_literal(&mut sql, blob);
            sql.push_str("])");
        }
        sql
    }
}

#[async_trait]
impl<T: WindowBucket> BucketStore<T> for ClickHouseBucketStore<T> {
    async fn slice(
        &self,
        metric: &Metric,
        window: WindowDuration,
        from: Timestamp,
        to: Timestamp,
        limit: usize,
    ) -> Result<BucketSlice<T>> {
        let table = bucket_table(&self.database, T::KIND, window);
        let sql = format!(
            "SELECT timestamp, buckets FROM {table} \
             WHERE metric = '{}' AND timestamp >= {} AND timestamp < {} \
             ORDER BY timestamp ASC LIMIT {limit}",
            escape_sql(&metric.name),
            from.0,
            to.0,
        );

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for bucket slice")?;
        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .with_context(|| format!("slicing {table}"))?;

        let mut slice = BucketSlice::default();
        for row in block.rows() {
            slice.rows += 1;
            let blobs: Vec<Vec<u8>> = row.get("buckets").context("reading buckets column")?;
            for blob in blobs {
                slice.buckets.push(decode_lossy::<T>(&blob));
            }
        }
        Ok(slice)
    }

    async fn store(&self, metric: &Metric, window: WindowDuration, buckets: &[T]) -> Result<()> {
        let mut rows = Vec::with_capacity(buckets.len());
        for bucket in buckets {
            if bucket.is_empty() {
                continue;
            }
            rows.push((bucket.timestamp().0, bucket.encode()?));
        }
        if rows.is_empty() {
            return Ok(());
        }

        for chunk in rows.chunks(self.insert_chunk_size) {
            let sql = self.insert_sql(metric, window, chunk);
            let mut handle = self
                .pool
                .get_handle()
                .await
                .context("getting handle for bucket insert")?;
            handle
                .execute(sql.as_str())
                .await
                .with_context(|| format!("inserting {} bucket rows", chunk.len()))?;
        }
        Ok(())
    }

    async fn remove(&self, metric: &Metric, window: WindowDuration, buckets: &[T]) -> Result<()> {
        let mut timestamps: Vec<i64> = buckets
            .iter()
            .filter(|b| !b.is_empty())
            .map(|b| b.timestamp().0)
            .collect();
        if timestamps.is_empty() {
            return Ok(());
        }
        timestamps.sort_unstable();
        timestamps.dedup();

        let table = bucket_table(&self.database, T::KIND, window);
        let list = timestamps
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "ALTER TABLE {table} DELETE WHERE metric = '{}' AND timestamp IN ({list})",
            escape_sql(&metric.name),
        );

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for bucket removal")?;
        handle
            .execute(sql.as_str())
            .await
            .with_context(|| format!("removing {} bucket rows", timestamps.len()))?;
        Ok(())
    }
}

/// Summary rows: `(metric, timestamp, summary)` upserts.
pub struct ClickHouseSummaryStore {
    pool: Pool,
    database: String,
    insert_chunk_size: usize,
}

impl ClickHouseSummaryStore {
    pub fn new(pool: Pool, cfg: &ClickHouseConfig) -> Self {
        ClickHouseSummaryStore {
            pool,
            database: cfg.database.clone(),
            insert_chunk_size: cfg.insert_chunk_size.max(1),
        }
    }

    fn insert_sql(&self, metric: &Metric, window: WindowDuration, chunk: &[&Summary]) -> String {
        let table = summary_table(&self.database, metric.kind, window);
        let name = escape_sql(&metric.name);
        let mut sql = String::with_capacity(96 + chunk.len() * 96);
        let _ = write!(sql, "INSERT INTO {table} (metric, timestamp, summary) VALUES ");
        for (idx, summary) in chunk.iter().enumerate() {
            if idx > 0 {
                sql.push_str(", ");
            }
            let _ = write!(sql, "('{name}', {}, ", summary.timestamp().0);
            append_blob_literal(&mut sql, &encode_summary(summary));
            sql.push(')');
        }
        sql
    }
}

#[async_trait]
impl SummaryStore for ClickHouseSummaryStore {
    async fn store(
        &self,
        metric: &Metric,
        window: WindowDuration,
        summaries: &[Summary],
    ) -> Result<()> {
        if summaries.is_empty() {
            return Ok(());
        }

        let refs: Vec<&Summary> = summaries.iter().collect();
        for chunk in refs.chunks(self.insert_chunk_size) {
            let sql = self.insert_sql(metric, window, chunk);
            let mut handle = self
                .pool
                .get_handle()
                .await
                .context("getting handle for summary insert")?;
            handle
                .execute(sql.as_str())
                .await
                .with_context(|| format!("inserting {} summary rows", chunk.len()))?;
        }
        Ok(())
    }
}

/// Metric descriptors (window_ms = 0 rows) and high-water marks.
pub struct ClickHouseMetaStore {
    pool: Pool,
    database: String,
}

impl ClickHouseMetaStore {
    pub fn new(pool: Pool, cfg: &ClickHouseConfig) -> Self {
        ClickHouseMetaStore {
            pool,
            database: cfg.database.clone(),
        }
    }
}

#[async_trait]
impl MetaStore for ClickHouseMetaStore {
    async fn last_processed(
        &self,
        metric: &Metric,
        window: WindowDuration,
    ) -> Result<Option<Timestamp>> {
        let table = meta_table(&self.database);
        let sql = format!(
            "SELECT last_processed FROM {table} \
             WHERE metric = '{}' AND window_ms = {} \
             ORDER BY last_processed DESC LIMIT 1",
            escape_sql(&metric.name),
            window.as_millis(),
        );

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for high-water read")?;
        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("querying high-water mark")?;

        match block.rows().next() {
            Some(row) => {
                let ms: i64 = row.get("last_processed").context("reading last_processed")?;
                Ok(Some(Timestamp(ms)))
            }
            None => Ok(None),
        }
    }

    async fn update_last_processed(
        &self,
        metric: &Metric,
        window: WindowDuration,
        ts: Timestamp,
    ) -> Result<()> {
        let table = meta_table(&self.database);
        let sql = format!(
            "INSERT INTO {table} (metric, kind, window_ms, last_processed) \
             VALUES ('{}', '{}', {}, {})",
            escape_sql(&metric.name),
            metric.kind.as_str(),
            window.as_millis(),
            ts.0,
        );

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for high-water update")?;
        handle
            .execute(sql.as_str())
            .await
            .context("updating high-water mark")?;
        Ok(())
    }

    async fn insert(&self, metric: &Metric) -> Result<()> {
        let table = meta_table(&self.database);
        let sql = format!(
            "INSERT INTO {table} (metric, kind, window_ms, last_processed) \
             VALUES ('{}', '{}', 0, 0)",
            escape_sql(&metric.name),
            metric.kind.as_str(),
        );

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for metric registration")?;
        handle
            .execute(sql.as_str())
            .await
            .context("registering metric")?;
        Ok(())
    }

    async fn contains(&self, metric: &Metric) -> Result<bool> {
        let table = meta_table(&self.database);
        let sql = format!(
            "SELECT count() AS n FROM {table} WHERE metric = '{}' AND window_ms = 0",
            escape_sql(&metric.name),
        );

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for metric lookup")?;
        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("querying metric registration")?;

        match block.rows().next() {
            Some(row) => {
                let n: u64 = row.get("n").context("reading count")?;
                Ok(n > 0)
            }
            None => Ok(false),
        }
    }

    async fn metrics(&self) -> Result<Vec<Metric>> {
        let table = meta_table(&self.database);
        let sql =
            format!("SELECT DISTINCT metric, kind FROM {table} WHERE window_ms = 0 ORDER BY metric");

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for metric enumeration")?;
        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("enumerating metrics")?;

        let mut metrics = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            let name: String = row.get("metric").context("reading metric")?;
            let kind: String = row.get("kind").context("reading kind")?;
            let Some(kind) = MetricKind::parse(&kind) else {
                warn!(metric = %name, kind = %kind, "unknown metric kind in meta table, skipping");
                continue;
            };
            metrics.push(Metric::new(name, kind));
        }
        Ok(metrics)
    }
}
