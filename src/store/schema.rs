//! Startup schema management for the ClickHouse backend.
//!
//! Tables are generated from the configured window hierarchy: one bucket
//! table per (family, window), one summary table per (summary kind,
//! window above raw), and the meta table. Retention policies become
//! table-level TTL clauses. A DDL failure here is a configuration error
//! and aborts startup.

use std::fmt::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use clickhouse_rs::Pool;
use tracing::info;

use crate::config::Config;
use crate::time::WindowDuration;

const BUCKET_FAMILIES: [&str; 2] = ["histogram", "counter"];
const SUMMARY_KINDS: [&str; 3] = ["statistic", "counter", "gauge"];

fn ttl_clause(ttl: Option<Duration>) -> String {
    match ttl {
        Some(ttl) => format!(
            "\nTTL toDateTime(intDiv(timestamp, 1000)) + toIntervalSecond({})",
            ttl.as_secs()
        ),
        None => String::new(),
    }
}

fn bucket_table_ddl(database: &str, family: &str, window: WindowDuration, ttl: Option<Duration>) -> String {
    let mut ddl = String::with_capacity(256);
    let _ = write!(
        ddl,
        "CREATE TABLE IF NOT EXISTS {database}.windroll_bucket_{family}_{} (\n\
         \x20   metric String,\n\
         \x20   timestamp Int64,\n\
         \x20   buckets Array(String)\n\
         ) ENGINE = MergeTree()\n\
         ORDER BY (metric, timestamp)",
        window.as_millis(),
    );
    ddl.push_str(&ttl_clause(ttl));
    ddl
}

fn summary_table_ddl(database: &str, kind: &str, window: WindowDuration, ttl: Option<Duration>) -> String {
    let mut ddl = String::with_capacity(256);
    let _ = write!(
        ddl,
        "CREATE TABLE IF NOT EXISTS {database}.windroll_summary_{kind}_{} (\n\
         \x20   metric String,\n\
         \x20   timestamp Int64,\n\
         \x20   summary String\n\
         ) ENGINE = ReplacingMergeTree()\n\
         ORDER BY (metric, timestamp)",
        window.as_millis(),
    );
    ddl.push_str(&ttl_clause(ttl));
    ddl
}

fn meta_table_ddl(database: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {database}.windroll_meta (\n\
         \x20   metric String,\n\
         \x20   kind String,\n\
         \x20   window_ms UInt64,\n\
         \x20   last_processed Int64\n\
         ) ENGINE = ReplacingMergeTree(last_processed)\n\
         ORDER BY (metric, window_ms)"
    )
}

/// All DDL statements for the configured hierarchy, in creation order.
pub fn ddl_statements(cfg: &Config) -> Result<Vec<String>> {
    let windows = cfg.window_durations()?;
    let database = &cfg.clickhouse.database;

    let mut statements = Vec::new();
    for &window in &windows {
        for family in BUCKET_FAMILIES {
            statements.push(bucket_table_ddl(database, family, window, cfg.bucket_ttl(window)));
        }
    }
    for &window in &windows[1..] {
        for kind in SUMMARY_KINDS {
            statements.push(summary_table_ddl(database, kind, window, cfg.summary_ttl(window)));
        }
    }
    statements.push(meta_table_ddl(database));
    Ok(statements)
}

/// Creates every missing table. Called once at startup when migrations
/// are enabled.
pub async fn ensure_schema(pool: &Pool, cfg: &Config) -> Result<()> {
    let statements = ddl_statements(cfg)?;
    let count = statements.len();

    let mut handle = pool
        .get_handle()
        .await
        .context("getting handle for schema setup")?;
    for ddl in statements {
        handle
            .execute(ddl.as_str())
            .await
            .with_context(|| format!("applying DDL:\n{ddl}"))?;
    }

    info!(tables = count, "schema ensured");
    Ok(())
}
