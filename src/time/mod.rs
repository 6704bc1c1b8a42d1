use std::fmt;
use std::time::Duration;

/// Millisecond-precision wall-clock timestamp (signed, epoch-relative).
///
/// All alignment arithmetic is integer math over milliseconds; floats are
/// never involved, so repeated realignment cannot drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// The "never processed" lower bound.
    pub const MIN: Timestamp = Timestamp(i64::MIN);

    pub fn millis(self) -> i64 {
        self.0
    }

    /// The largest multiple of `d` that is <= `self`.
    pub fn aligned_to(self, d: WindowDuration) -> Timestamp {
        let w = d.as_millis() as i64;
        Timestamp(self.0.div_euclid(w) * w)
    }

    /// The bucket number of the interval of duration `d` containing `self`.
    pub fn to_bucket_number_of(self, d: WindowDuration) -> BucketNumber {
        BucketNumber::new(self.0.div_euclid(d.as_millis() as i64), d)
    }

    /// The next representable timestamp. Used to turn an inclusive upper
    /// bound into the store contract's exclusive one.
    pub fn next(self) -> Timestamp {
        Timestamp(self.0.saturating_add(1))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// A fixed window width in whole milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowDuration(u64);

impl WindowDuration {
    /// The finest bucket width. Raw buckets are always 1 ms wide.
    pub const RAW: WindowDuration = WindowDuration(1);

    /// Sentinel duration carried by the undefined bucket number.
    pub(crate) const UNDEFINED: WindowDuration = WindowDuration(0);

    pub const fn from_millis(ms: u64) -> WindowDuration {
        WindowDuration(ms)
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    pub fn is_raw(self) -> bool {
        self.0 == Self::RAW.0
    }
}

impl TryFrom<Duration> for WindowDuration {
    type Error = anyhow::Error;

    fn try_from(d: Duration) -> Result<Self, Self::Error> {
        let ms = d.as_millis();
        if ms == 0 {
            anyhow::bail!("window duration must be at least 1ms");
        }
        if d.subsec_nanos() % 1_000_000 != 0 {
            anyhow::bail!("window duration must be a whole number of milliseconds");
        }
        Ok(WindowDuration(ms as u64))
    }
}

impl fmt::Display for WindowDuration {
    /// Renders the way durations appear in config files: "30s", "250ms".
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1_000 && self.0 % 1_000 == 0 {
            write!(f, "{}s", self.0 / 1_000)
        } else {
            write!(f, "{}ms", self.0)
        }
    }
}

/// Integer index of a window interval under a fixed duration.
///
/// A bucket number `n` at duration `d` identifies the half-open interval
/// `[n * d, (n + 1) * d)`. Ordering is only meaningful between bucket
/// numbers of equal duration, which is why this type is `PartialOrd` and
/// deliberately not `Ord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketNumber {
    number: i64,
    duration: WindowDuration,
}

impl BucketNumber {
    /// The "no interval" sentinel carried by empty buckets.
    pub const UNDEFINED: BucketNumber = BucketNumber {
        number: -1,
        duration: WindowDuration::UNDEFINED,
    };

    pub fn new(number: i64, duration: WindowDuration) -> BucketNumber {
        BucketNumber { number, duration }
    }

    pub fn number(self) -> i64 {
        self.number
    }

    pub fn duration(self) -> WindowDuration {
        self.duration
    }

    pub fn is_undefined(self) -> bool {
        self.duration.0 == 0
    }

    /// Inclusive lower edge of the interval.
    pub fn start_timestamp(self) -> Timestamp {
        Timestamp(self.number * self.duration.0 as i64)
    }

    /// The bucket number at duration `target` whose interval contains this
    /// bucket's start timestamp.
    pub fn rescaled_to(self, target: WindowDuration) -> BucketNumber {
        self.start_timestamp().to_bucket_number_of(target)
    }

    /// Whether `ts` falls inside `[start, start + duration)`.
    pub fn covers(self, ts: Timestamp) -> bool {
        if self.is_undefined() {
            return false;
        }
        let start = self.start_timestamp().0;
        ts.0 >= start && ts.0 < start + self.duration.0 as i64
    }
}

impl PartialOrd for BucketNumber {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        if self.duration != other.duration {
            return None;
        }
        Some(self.number.cmp(&other.number))
    }
}

impl fmt::Display for BucketNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_undefined() {
            write!(f, "undefined")
        } else {
            write!(f, "{}@{}", self.number, self.duration)
        }
    }
}

/// A discrete processing instant: the raw bucket number the pipeline
/// considers current, lagging wall clock by a safety interval so small
/// cross-node clock skew cannot make a node process ahead of its peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    bucket: BucketNumber,
}

impl Tick {
    /// The tick for the current wall clock minus `safety`.
    pub fn current(safety: Duration) -> Tick {
        let now = chrono::Utc::now().timestamp_millis();
        Tick::at(Timestamp(now - safety.as_millis() as i64))
    }

    /// The tick containing `ts`.
    pub fn at(ts: Timestamp) -> Tick {
        Tick {
            bucket: ts.to_bucket_number_of(WindowDuration::RAW),
        }
    }

    pub fn bucket_number(self) -> BucketNumber {
        self.bucket
    }

    /// Start timestamp of the tick's raw bucket.
    pub fn timestamp(self) -> Timestamp {
        self.bucket.start_timestamp()
    }

    /// Whether a raw bucket falls at or before this tick, i.e. the roll-up
    /// pipeline may already have swept it.
    pub fn already_processed(self, raw_bn: BucketNumber) -> bool {
        raw_bn.number() <= self.bucket.number()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S30: WindowDuration = WindowDuration(30_000);

    #[test]
    fn test_aligned_to_rounds_down() {
        assert_eq!(Timestamp(30_001).aligned_to(S30), Timestamp(30_000));
        assert_eq!(Timestamp(59_999).aligned_to(S30), Timestamp(30_000));
        assert_eq!(Timestamp(60_000).aligned_to(S30), Timestamp(60_000));
        assert_eq!(Timestamp(0).aligned_to(S30), Timestamp(0));
    }

    #[test]
    fn test_aligned_to_negative_rounds_toward_minus_infinity() {
        assert_eq!(Timestamp(-1).aligned_to(S30), Timestamp(-30_000));
        assert_eq!(Timestamp(-30_000).aligned_to(S30), Timestamp(-30_000));
        assert_eq!(Timestamp(-30_001).aligned_to(S30), Timestamp(-60_000));
    }

    #[test]
    fn test_to_bucket_number_of() {
        let bn = Timestamp(65_000).to_bucket_number_of(S30);
        assert_eq!(bn.number(), 2);
        assert_eq!(bn.duration(), S30);
        assert_eq!(bn.start_timestamp(), Timestamp(60_000));
    }

    #[test]
    fn test_raw_bucket_number_equals_millis() {
        let bn = Timestamp(30_001).to_bucket_number_of(WindowDuration::RAW);
        assert_eq!(bn.number(), 30_001);
        assert_eq!(bn.start_timestamp(), Timestamp(30_001));
    }

    #[test]
    fn test_rescaled_to_partitions_raw_into_windows() {
        let raw = WindowDuration::RAW;
        assert_eq!(BucketNumber::new(1, raw).rescaled_to(S30).number(), 0);
        assert_eq!(BucketNumber::new(29_999, raw).rescaled_to(S30).number(), 0);
        assert_eq!(BucketNumber::new(30_000, raw).rescaled_to(S30).number(), 1);
        assert_eq!(BucketNumber::new(30_001, raw).rescaled_to(S30).number(), 1);
    }

    #[test]
    fn test_rescaled_to_between_derived_windows() {
        // 30s buckets 0..9 all land in 5m bucket 0; bucket 10 starts 5m bucket 1.
        let m5 = WindowDuration::from_millis(300_000);
        assert_eq!(BucketNumber::new(9, S30).rescaled_to(m5).number(), 0);
        assert_eq!(BucketNumber::new(10, S30).rescaled_to(m5).number(), 1);
    }

    #[test]
    fn test_undefined_sentinel() {
        let bn = BucketNumber::UNDEFINED;
        assert!(bn.is_undefined());
        assert!(!bn.covers(Timestamp(0)));
        assert_eq!(bn.number(), -1);
    }

    #[test]
    fn test_ordering_only_within_equal_durations() {
        let a = BucketNumber::new(1, S30);
        let b = BucketNumber::new(2, S30);
        let c = BucketNumber::new(2, WindowDuration::RAW);
        assert!(a < b);
        assert_eq!(a.partial_cmp(&c), None);
    }

    #[test]
    fn test_covers() {
        let bn = BucketNumber::new(2, S30);
        assert!(bn.covers(Timestamp(60_000)));
        assert!(bn.covers(Timestamp(89_999)));
        assert!(!bn.covers(Timestamp(90_000)));
        assert!(!bn.covers(Timestamp(59_999)));
    }

    #[test]
    fn test_tick_already_processed() {
        let tick = Tick::at(Timestamp(1_000));
        assert!(tick.already_processed(BucketNumber::new(999, WindowDuration::RAW)));
        assert!(tick.already_processed(BucketNumber::new(1_000, WindowDuration::RAW)));
        assert!(!tick.already_processed(BucketNumber::new(1_001, WindowDuration::RAW)));
    }

    #[test]
    fn test_tick_current_lags_by_safety_interval() {
        let lagged = Tick::current(Duration::from_secs(30));
        let live = Tick::current(Duration::ZERO);
        let delta = live.bucket_number().number() - lagged.bucket_number().number();
        // Allow slack for wall-clock movement between the two reads.
        assert!((29_900..=30_100).contains(&delta), "delta={delta}");
    }

    #[test]
    fn test_window_duration_rejects_sub_millisecond() {
        assert!(WindowDuration::try_from(Duration::from_micros(500)).is_err());
        assert!(WindowDuration::try_from(Duration::ZERO).is_err());
        let w = WindowDuration::try_from(Duration::from_secs(30)).expect("whole ms");
        assert_eq!(w.as_millis(), 30_000);
    }
}
