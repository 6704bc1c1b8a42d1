use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::bucket::MetricKind;
use crate::time::WindowDuration;

/// Top-level configuration for the windroll roll-up core.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Window hierarchy and tick timing.
    #[serde(default)]
    pub windows: WindowsConfig,

    /// Ingest grouping configuration.
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Bucket cache configuration.
    #[serde(default)]
    pub bucket_cache: BucketCacheConfig,

    /// ClickHouse connection configuration.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    /// Per-window retention policies.
    #[serde(default)]
    pub retention: Vec<RetentionPolicy>,

    /// Read-shape limits.
    #[serde(default)]
    pub query: QueryConfig,
}

/// Window hierarchy and tick timing.
#[derive(Debug, Clone, Deserialize)]
pub struct WindowsConfig {
    /// Ordered window durations, smallest first. The first entry is the
    /// raw duration and must be 1ms.
    #[serde(
        default = "default_window_durations",
        deserialize_with = "deserialize_durations"
    )]
    pub durations: Vec<Duration>,

    /// How far the processing tick lags wall clock, absorbing cross-node
    /// clock skew. Default: 30s.
    #[serde(default = "default_tick_safety_interval", with = "humantime_serde")]
    pub tick_safety_interval: Duration,

    /// Cadence of the roll-up driver loop. Default: 30s.
    #[serde(default = "default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,
}

/// Ingest grouping configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Coarse granule incoming measurements are grouped by. Default: 5s.
    #[serde(default = "default_ingest_granule", with = "humantime_serde")]
    pub granule: Duration,
}

/// Bucket cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BucketCacheConfig {
    /// Global cache on/off switch. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cache derived buckets of timer metrics. Default: true.
    #[serde(default = "default_true")]
    pub cache_timers: bool,

    /// Cache derived buckets of gauge metrics. Default: true.
    #[serde(default = "default_true")]
    pub cache_gauges: bool,

    /// Cache derived buckets of counter metrics. Default: true.
    #[serde(default = "default_true")]
    pub cache_counters: bool,

    /// Soft cap on the number of metrics with a live cache entry.
    /// Default: 10000.
    #[serde(default = "default_cache_max_metrics")]
    pub max_metrics: usize,

    /// Maximum bucket-number span `(to - from - 1)` a single write may
    /// insert. Default: 1000.
    #[serde(default = "default_cache_max_store")]
    pub max_store: i64,
}

impl BucketCacheConfig {
    /// The per-metric-kind cache admission predicate.
    pub fn enabled_for(&self, kind: MetricKind) -> bool {
        if !self.enabled {
            return false;
        }
        match kind {
            MetricKind::Timer => self.cache_timers,
            MetricKind::Gauge => self.cache_gauges,
            MetricKind::Counter => self.cache_counters,
        }
    }
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// Use ClickHouse for persistence; when false the binary runs on the
    /// in-memory backend. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// ClickHouse native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Target database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,

    /// Number of buckets per INSERT statement. Default: 100.
    #[serde(default = "default_insert_chunk_size")]
    pub insert_chunk_size: usize,

    /// Schema management configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Schema management behavior.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Ensure tables exist on startup. Default: false.
    #[serde(default)]
    pub enabled: bool,
}

/// Retention for one window duration, applied as column-store TTLs.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionPolicy {
    /// The window this policy applies to.
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// How long summaries at this window are kept.
    #[serde(with = "humantime_serde")]
    pub summary_ttl: Duration,

    /// How long un-swept buckets at this window are kept.
    #[serde(with = "humantime_serde")]
    pub bucket_ttl: Duration,
}

/// Read-shape limits.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    /// Maximum summary rows a single query returns. Default: 10000.
    #[serde(default = "default_summary_limit")]
    pub summary_limit: usize,

    /// Fetch size for paged summary reads. Default: 5000.
    #[serde(default = "default_summary_fetch_size")]
    pub summary_fetch_size: usize,

    /// Maximum rows one bucket slice read may cover. Default: 100000.
    #[serde(default = "default_slice_row_limit")]
    pub slice_row_limit: usize,
}

impl Config {
    /// Loads and validates a YAML configuration file.
    pub fn load(path: &Path) -> Result<Config> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let cfg: Config = serde_yaml::from_str(&data).context("parsing YAML config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Startup-time validation. Failures here abort the process.
    pub fn validate(&self) -> Result<()> {
        let windows = self.window_durations()?;

        if self.windows.tick_interval < Duration::from_millis(1) {
            bail!("windows.tick_interval must be at least 1ms");
        }

        if self.clickhouse.enabled {
            if self.clickhouse.endpoint.is_empty() {
                bail!("clickhouse.endpoint is required when clickhouse is enabled");
            }
            if self.clickhouse.insert_chunk_size == 0 {
                bail!("clickhouse.insert_chunk_size must be positive");
            }
        }

        for policy in &self.retention {
            let w = WindowDuration::try_from(policy.window).context("retention.window")?;
            if !windows.contains(&w) {
                bail!("retention policy names unconfigured window {w}");
            }
        }

        if self.query.slice_row_limit == 0 {
            bail!("query.slice_row_limit must be positive");
        }

        Ok(())
    }

    /// The validated window hierarchy, smallest first.
    pub fn window_durations(&self) -> Result<Vec<WindowDuration>> {
        if self.windows.durations.len() < 2 {
            bail!("windows.durations needs the raw duration plus at least one window");
        }

        let mut out = Vec::with_capacity(self.windows.durations.len());
        for d in &self.windows.durations {
            out.push(WindowDuration::try_from(*d).context("windows.durations")?);
        }

        if !out[0].is_raw() {
            bail!("windows.durations must start with the 1ms raw duration");
        }
        for pair in out.windows(2) {
            if pair[1] <= pair[0] {
                bail!(
                    "windows.durations must be strictly increasing ({} then {})",
                    pair[0],
                    pair[1]
                );
            }
            if pair[1].as_millis() % pair[0].as_millis() != 0 {
                bail!(
                    "each window must be divisible by its predecessor ({} then {})",
                    pair[0],
                    pair[1]
                );
            }
        }
        Ok(out)
    }

    /// Summary retention for a window, if configured.
    pub fn summary_ttl(&self, window: WindowDuration) -> Option<Duration> {
        self.retention
            .iter()
            .find(|p| WindowDuration::try_from(p.window).ok() == Some(window))
            .map(|p| p.summary_ttl)
    }

    /// Bucket retention for a window, if configured.
    pub fn bucket_ttl(&self, window: WindowDuration) -> Option<Duration> {
        self.retention
            .iter()
            .find(|p| WindowDuration::try_from(p.window).ok() == Some(window))
            .map(|p| p.bucket_ttl)
    }
}

/// Deserializes a list of humantime durations ("1ms", "30s", "5m").
fn deserialize_durations<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Vec<humantime_serde::Serde<Duration>> = Deserialize::deserialize(deserializer)?;
    Ok(raw.into_iter().map(humantime_serde::Serde::into_inner).collect())
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_window_durations() -> Vec<Duration> {
    vec![
        Duration::from_millis(1),
        Duration::from_secs(30),
        Duration::from_secs(300),
        Duration::from_secs(3600),
    ]
}

fn default_tick_safety_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_ingest_granule() -> Duration {
    Duration::from_secs(5)
}

fn default_true() -> bool {
    true
}

fn default_cache_max_metrics() -> usize {
    10_000
}

fn default_cache_max_store() -> i64 {
    1_000
}

fn default_database() -> String {
    "default".to_string()
}

fn default_insert_chunk_size() -> usize {
    100
}

fn default_summary_limit() -> usize {
    10_000
}

fn default_summary_fetch_size() -> usize {
    5_000
}

fn default_slice_row_limit() -> usize {
    100_000
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            windows: WindowsConfig::default(),
            ingest: IngestConfig::default(),
            bucket_cache: BucketCacheConfig::default(),
            clickhouse: ClickHouseConfig::default(),
            retention: Vec::new(),
            query: QueryConfig::default(),
        }
    }
}

impl Default for WindowsConfig {
    fn default() -> Self {
        WindowsConfig {
            durations: default_window_durations(),
            tick_safety_interval: default_tick_safety_interval(),
            tick_interval: default_tick_interval(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            granule: default_ingest_granule(),
        }
    }
}

impl Default for BucketCacheConfig {
    fn default() -> Self {
        BucketCacheConfig {
            enabled: true,
            cache_timers: true,
            cache_gauges: true,
            cache_counters: true,
            max_metrics: default_cache_max_metrics(),
            max_store: default_cache_max_store(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        ClickHouseConfig {
            enabled: false,
            endpoint: String::new(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
            insert_chunk_size: default_insert_chunk_size(),
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        QueryConfig {
            summary_limit: default_summary_limit(),
            summary_fetch_size: default_summary_fetch_size(),
            slice_row_limit: default_slice_row_limit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let cfg = Config::default();
        cfg.validate().expect("default config is valid");

        let windows = cfg.window_durations().expect("windows");
        assert_eq!(windows[0], WindowDuration::RAW);
        assert_eq!(windows[1], WindowDuration::from_millis(30_000));
    }

    #[test]
    fn test_rejects_non_raw_first_window() {
        let mut cfg = Config::default();
        cfg.windows.durations = vec![Duration::from_secs(30), Duration::from_secs(300)];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_unordered_windows() {
        let mut cfg = Config::default();
        cfg.windows.durations = vec![
            Duration::from_millis(1),
            Duration::from_secs(300),
            Duration::from_secs(30),
        ];
        let err = cfg.validate().expect_err("must fail");
        assert!(err.to_string().contains("strictly increasing"));
    }

    #[test]
    fn test_rejects_non_divisible_window() {
        let mut cfg = Config::default();
        cfg.windows.durations = vec![
            Duration::from_millis(1),
            Duration::from_millis(7),
            Duration::from_millis(20),
        ];
        let err = cfg.validate().expect_err("must fail");
        assert!(err.to_string().contains("divisible"));
    }

    #[test]
    fn test_rejects_single_duration() {
        let mut cfg = Config::default();
        cfg.windows.durations = vec![Duration::from_millis(1)];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_clickhouse_requires_endpoint_when_enabled() {
        let mut cfg = Config::default();
        cfg.clickhouse.enabled = true;
        let err = cfg.validate().expect_err("must fail");
        assert!(err.to_string().contains("endpoint"));
    }

    #[test]
    fn test_retention_must_name_configured_window() {
        let mut cfg = Config::default();
        cfg.retention.push(RetentionPolicy {
            window: Duration::from_secs(60),
            summary_ttl: Duration::from_secs(86_400),
            bucket_ttl: Duration::from_secs(3_600),
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_retention_lookup() {
        let mut cfg = Config::default();
        cfg.retention.push(RetentionPolicy {
            window: Duration::from_secs(30),
            summary_ttl: Duration::from_secs(86_400),
            bucket_ttl: Duration::from_secs(3_600),
        });

        let s30 = WindowDuration::from_millis(30_000);
        assert_eq!(cfg.summary_ttl(s30), Some(Duration::from_secs(86_400)));
        assert_eq!(cfg.bucket_ttl(WindowDuration::from_millis(300_000)), None);
    }

    #[test]
    fn test_cache_kind_predicate() {
        let mut cache = BucketCacheConfig::default();
        cache.cache_counters = false;
        assert!(cache.enabled_for(MetricKind::Timer));
        assert!(!cache.enabled_for(MetricKind::Counter));

        cache.enabled = false;
        assert!(!cache.enabled_for(MetricKind::Timer));
    }

    #[test]
    fn test_yaml_config_parses() {
        let yaml = r#"
log_level: debug
windows:
  durations: ["1ms", "30s", "5m"]
  tick_safety_interval: "10s"
bucket_cache:
  max_metrics: 5
clickhouse:
  enabled: true
  endpoint: "localhost:9000"
retention:
  - window: "30s"
    summary_ttl: "30days"
    bucket_ttl: "1h"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parses");
        cfg.validate().expect("valid");
        assert_eq!(cfg.bucket_cache.max_metrics, 5);
        assert_eq!(cfg.window_durations().expect("windows").len(), 3);
    }
}
