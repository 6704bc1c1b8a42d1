pub mod codec;
pub mod summary;

use std::fmt;

use hdrhistogram::Histogram;
use tracing::warn;

use crate::time::{BucketNumber, Timestamp};

use self::codec::CodecError;
use self::summary::{CounterSummary, GaugeSummary, StatisticSummary, Summary};

/// Significant figures kept by every recording histogram. Three figures
/// keep typical latency values exact while bounding memory per bucket.
const HISTOGRAM_SIGFIGS: u8 = 3;

/// The kind of a metric. Immutable for the lifetime of the metric name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Timer,
    Gauge,
    Counter,
}

impl MetricKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Timer => "timer",
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }

    /// Parses the wire form of a metric kind. Unknown kinds are the
    /// caller's unsupported-input path.
    pub fn parse(s: &str) -> Option<MetricKind> {
        match s {
            "timer" => Some(MetricKind::Timer),
            "gauge" => Some(MetricKind::Gauge),
            "counter" => Some(MetricKind::Counter),
            _ => None,
        }
    }

    /// Timer and gauge samples are recorded into histograms; counters are
    /// summed.
    pub fn uses_histogram(self) -> bool {
        matches!(self, MetricKind::Timer | MetricKind::Gauge)
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metric identity: opaque UTF-8 name plus its immutable kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metric {
    pub name: String,
    pub kind: MetricKind,
}

impl Metric {
    pub fn new(name: impl Into<String>, kind: MetricKind) -> Metric {
        Metric {
            name: name.into(),
            kind,
        }
    }

    pub fn timer(name: impl Into<String>) -> Metric {
        Metric::new(name, MetricKind::Timer)
    }

    pub fn gauge(name: impl Into<String>) -> Metric {
        Metric::new(name, MetricKind::Gauge)
    }

    pub fn counter(name: impl Into<String>) -> Metric {
        Metric::new(name, MetricKind::Counter)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.kind)
    }
}

/// Creates the recording histogram used for timer/gauge samples.
pub fn new_histogram() -> Histogram<u64> {
    // Auto-resizing with a constant sigfig count cannot fail to construct.
    Histogram::new(HISTOGRAM_SIGFIGS).expect("histogram construction with constant sigfigs")
}

/// The seam shared by the two bucket families. The processor, the cache
/// and the stores are generic over it.
pub trait WindowBucket: Sized + Send + Sync + 'static {
    /// Short family label used in table names and logs.
    const KIND: &'static str;

    /// The empty sentinel of this family.
    fn empty() -> Self;

    fn number(&self) -> BucketNumber;

    fn is_empty(&self) -> bool;

    /// Start timestamp of the bucket's interval; undefined for empties.
    fn timestamp(&self) -> Timestamp {
        self.number().start_timestamp()
    }

    /// Folds a group of source buckets into one bucket at `target`.
    /// Empty members contribute nothing; an all-empty group folds to the
    /// empty sentinel.
    fn fold(target: BucketNumber, sources: &[Self]) -> Self;

    /// Derives the summary for a metric of `kind`. Empty buckets yield
    /// no summary.
    fn summarize(&self, kind: MetricKind) -> Option<Summary>;

    /// Versioned wire encoding. The empty sentinel encodes to an empty
    /// byte slice.
    fn encode(&self) -> Result<Vec<u8>, CodecError>;

    /// Inverse of `encode`. Trailing bytes are ignored; unknown versions
    /// are an error the caller downgrades to the empty sentinel.
    fn decode(bytes: &[u8]) -> Result<Self, CodecError>;
}

/// A timer/gauge bucket: one interval's worth of recorded samples.
#[derive(Clone)]
pub enum HistogramBucket {
    Filled {
        number: BucketNumber,
        histogram: Histogram<u64>,
    },
    Empty,
}

impl HistogramBucket {
    pub fn new(number: BucketNumber, histogram: Histogram<u64>) -> HistogramBucket {
        HistogramBucket::Filled { number, histogram }
    }

    pub fn histogram(&self) -> Option<&Histogram<u64>> {
        match self {
            HistogramBucket::Filled { histogram, .. } => Some(histogram),
            HistogramBucket::Empty => None,
        }
    }
}

impl WindowBucket for HistogramBucket {
    const KIND: &'static str = "histogram";

    fn empty() -> Self {
        HistogramBucket::Empty
    }

    fn number(&self) -> BucketNumber {
        match self {
            HistogramBucket::Filled { number, .. } => *number,
            HistogramBucket::Empty => BucketNumber::UNDEFINED,
        }
    }

    fn is_empty(&self) -> bool {
        matches!(self, HistogramBucket::Empty)
    }

    fn fold(target: BucketNumber, sources: &[Self]) -> Self {
        let mut merged = new_histogram();
        let mut any = false;
        for source in sources {
            if let HistogramBucket::Filled { histogram, .. } = source {
                if let Err(e) = merged.add(histogram) {
                    warn!(target_bucket = %target, error = %e, "histogram merge failed, dropping member");
                    continue;
                }
                any = true;
            }
        }
        if !any {
            return HistogramBucket::Empty;
        }
        HistogramBucket::Filled {
            number: target,
            histogram: merged,
        }
    }

    fn summarize(&self, kind: MetricKind) -> Option<Summary> {
        let HistogramBucket::Filled { number, histogram } = self else {
            return None;
        };
        let ts = number.start_timestamp();
        match kind {
            MetricKind::Timer => Some(Summary::Statistic(StatisticSummary::from_histogram(
                ts, histogram,
            ))),
            MetricKind::Gauge => Some(Summary::Gauge(GaugeSummary::from_histogram(ts, histogram))),
            // Counter metrics never route through histogram buckets.
            MetricKind::Counter => None,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode_histogram_bucket(self)
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        codec::decode_histogram_bucket(bytes)
    }
}

impl fmt::Debug for HistogramBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistogramBucket::Filled { number, histogram } => f
                .debug_struct("HistogramBucket")
                .field("number", number)
                .field("count", &histogram.len())
                .finish(),
            HistogramBucket::Empty => f.write_str("HistogramBucket::Empty"),
        }
    }
}

impl PartialEq for HistogramBucket {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                HistogramBucket::Filled {
                    number: a,
                    histogram: ha,
                },
                HistogramBucket::Filled {
                    number: b,
                    histogram: hb,
                },
            ) => a == b && ha == hb,
            (HistogramBucket::Empty, HistogramBucket::Empty) => true,
            _ => false,
        }
    }
}

/// A counter bucket: one interval's summed increments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterBucket {
    Filled { number: BucketNumber, counts: i64 },
    Empty,
}

impl CounterBucket {
    pub fn new(number: BucketNumber, counts: i64) -> CounterBucket {
        CounterBucket::Filled { number, counts }
    }

    pub fn counts(&self) -> Option<i64> {
        match self {
            CounterBucket::Filled { counts, .. } => Some(*counts),
            CounterBucket::Empty => None,
        }
    }
}

impl WindowBucket for CounterBucket {
    const KIND: &'static str = "counter";

    fn empty() -> Self {
        CounterBucket::Empty
    }

    fn number(&self) -> BucketNumber {
        match self {
            CounterBucket::Filled { number, .. } => *number,
            CounterBucket::Empty => BucketNumber::UNDEFINED,
        }
    }

    fn is_empty(&self) -> bool {
        matches!(self, CounterBucket::Empty)
    }

    fn fold(target: BucketNumber, sources: &[Self]) -> Self {
        let mut total = 0i64;
        let mut any = false;
        for source in sources {
            if let CounterBucket::Filled { counts, .. } = source {
                total = total.saturating_add(*counts);
                any = true;
            }
        }
        if !any {
            return CounterBucket::Empty;
        }
        CounterBucket::Filled {
            number: target,
            counts: total,
        }
    }

    fn summarize(&self, _kind: MetricKind) -> Option<Summary> {
        let CounterBucket::Filled { number, counts } = self else {
            return None;
        };
        Some(Summary::Counter(CounterSummary {
            timestamp: number.start_timestamp(),
            count: *counts,
        }))
    }

    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode_counter_bucket(self)
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        codec::decode_counter_bucket(bytes)
    }
}
