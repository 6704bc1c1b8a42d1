use hdrhistogram::Histogram;

use crate::time::Timestamp;

/// A compact statistical projection of one aggregated bucket.
#[derive(Debug, Clone, PartialEq)]
pub enum Summary {
    Statistic(StatisticSummary),
    Counter(CounterSummary),
    Gauge(GaugeSummary),
}

impl Summary {
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Summary::Statistic(s) => s.timestamp,
            Summary::Counter(s) => s.timestamp,
            Summary::Gauge(s) => s.timestamp,
        }
    }
}

/// Timer summary: configured percentiles plus the moments, all read from
/// the merged histogram.
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticSummary {
    pub timestamp: Timestamp,
    pub p50: u64,
    pub p80: u64,
    pub p90: u64,
    pub p95: u64,
    pub p99: u64,
    pub p999: u64,
    pub min: u64,
    pub max: u64,
    pub count: u64,
    pub mean: f64,
}

impl StatisticSummary {
    pub fn from_histogram(timestamp: Timestamp, h: &Histogram<u64>) -> StatisticSummary {
        StatisticSummary {
            timestamp,
            p50: h.value_at_quantile(0.50),
            p80: h.value_at_quantile(0.80),
            p90: h.value_at_quantile(0.90),
            p95: h.value_at_quantile(0.95),
            p99: h.value_at_quantile(0.99),
            p999: h.value_at_quantile(0.999),
            min: h.min(),
            max: h.max(),
            count: h.len(),
            mean: h.mean(),
        }
    }
}

/// Counter summary: the summed increments of one interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSummary {
    pub timestamp: Timestamp,
    pub count: i64,
}

/// Gauge summary: moments only, no percentiles.
#[derive(Debug, Clone, PartialEq)]
pub struct GaugeSummary {
    pub timestamp: Timestamp,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub count: u64,
}

impl GaugeSummary {
    pub fn from_histogram(timestamp: Timestamp, h: &Histogram<u64>) -> GaugeSummary {
        GaugeSummary {
            timestamp,
            min: h.min(),
            max: h.max(),
            mean: h.mean(),
            count: h.len(),
        }
    }
}
