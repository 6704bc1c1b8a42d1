//! Versioned wire encoding for buckets and summaries.
//!
//! Layout is a single format-version byte followed by var-int fields
//! (unsigned LEB128, zig-zag for signed values). Histogram payloads are
//! the HDR V2 serialization, length-prefixed. Decoders ignore trailing
//! bytes and never panic; an unknown version byte is an error the caller
//! downgrades to the empty sentinel so newer writers cannot halt older
//! readers.

use hdrhistogram::serialization::{Deserializer, Serializer, V2Serializer};
use hdrhistogram::Histogram;
use thiserror::Error;
use tracing::warn;

use crate::time::{BucketNumber, Timestamp, WindowDuration};

use super::summary::{CounterSummary, GaugeSummary, StatisticSummary, Summary};
use super::{CounterBucket, HistogramBucket, WindowBucket};

/// The only defined serialization format version.
pub const FORMAT_VERSION: u8 = 1;

const TAG_STATISTIC: u8 = 1;
const TAG_COUNTER: u8 = 2;
const TAG_GAUGE: u8 = 3;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload truncated")]
    Truncated,
    #[error("var-int exceeds 64 bits")]
    VarintOverflow,
    #[error("unknown serialization version {0}")]
    UnknownVersion(u8),
    #[error("unknown summary tag {0}")]
    UnknownTag(u8),
    #[error("histogram payload: {0}")]
    Histogram(String),
}

// --- var-int primitives ---

fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn put_varint(buf: &mut Vec<u8>, v: i64) {
    put_uvarint(buf, zigzag(v));
}

fn take_uvarint(input: &mut &[u8]) -> Result<u64, CodecError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let (&byte, rest) = input.split_first().ok_or(CodecError::Truncated)?;
        *input = rest;
        if shift >= 64 || (shift == 63 && byte > 1) {
            return Err(CodecError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn take_varint(input: &mut &[u8]) -> Result<i64, CodecError> {
    Ok(unzigzag(take_uvarint(input)?))
}

fn take_bytes<'a>(input: &mut &'a [u8], len: usize) -> Result<&'a [u8], CodecError> {
    if input.len() < len {
        return Err(CodecError::Truncated);
    }
    let (head, rest) = input.split_at(len);
    *input = rest;
    Ok(head)
}

fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

fn check_version(input: &mut &[u8]) -> Result<(), CodecError> {
    let (&version, rest) = input.split_first().ok_or(CodecError::Truncated)?;
    if version != FORMAT_VERSION {
        return Err(CodecError::UnknownVersion(version));
    }
    *input = rest;
    Ok(())
}

fn put_bucket_number(buf: &mut Vec<u8>, number: BucketNumber) {
    put_varint(buf, number.number());
    put_uvarint(buf, number.duration().as_millis());
}

fn take_bucket_number(input: &mut &[u8]) -> Result<BucketNumber, CodecError> {
    let number = take_varint(input)?;
    let duration = take_uvarint(input)?;
    Ok(BucketNumber::new(number, WindowDuration::from_millis(duration)))
}

// --- buckets ---

pub(crate) fn encode_histogram_bucket(bucket: &HistogramBucket) -> Result<Vec<u8>, CodecError> {
    let HistogramBucket::Filled { number, histogram } = bucket else {
        return Ok(Vec::new());
    };

    let mut payload = Vec::new();
    V2Serializer::new()
        .serialize(histogram, &mut payload)
        .map_err(|e| CodecError::Histogram(format!("{e:?}")))?;

    let mut out = Vec::with_capacity(payload.len() + 16);
    out.push(FORMAT_VERSION);
    put_bucket_number(&mut out, *number);
    put_uvarint(&mut out, payload.len() as u64);
    out.extend_from_slice(&payload);
    Ok(out)
}

pub(crate) fn decode_histogram_bucket(bytes: &[u8]) -> Result<HistogramBucket, CodecError> {
    if bytes.is_empty() {
        return Ok(HistogramBucket::Empty);
    }

    let mut input = bytes;
    check_version(&mut input)?;
    let number = take_bucket_number(&mut input)?;
    let payload_len = take_uvarint(&mut input)? as usize;
    let mut payload = take_bytes(&mut input, payload_len)?;

    let histogram: Histogram<u64> = Deserializer::new()
        .deserialize(&mut payload)
        .map_err(|e| CodecError::Histogram(format!("{e:?}")))?;

    Ok(HistogramBucket::Filled { number, histogram })
}

pub(crate) fn encode_counter_bucket(bucket: &CounterBucket) -> Result<Vec<u8>, CodecError> {
    let CounterBucket::Filled { number, counts } = bucket else {
        return Ok(Vec::new());
    };

    let mut out = Vec::with_capacity(24);
    out.push(FORMAT_VERSION);
    put_bucket_number(&mut out, *number);
    put_varint(&mut out, *counts);
    Ok(out)
}

pub(crate) fn decode_counter_bucket(bytes: &[u8]) -> Result<CounterBucket, CodecError> {
    if bytes.is_empty() {
        return Ok(CounterBucket::Empty);
    }

    let mut input = bytes;
    check_version(&mut input)?;
    let number = take_bucket_number(&mut input)?;
    let counts = take_varint(&mut input)?;
    Ok(CounterBucket::Filled { number, counts })
}

/// Decodes a payload, substituting the empty sentinel for anything
/// unreadable. Corruption must not halt the pipeline.
pub fn decode_lossy<T: WindowBucket>(bytes: &[u8]) -> T {
    match T::decode(bytes) {
        Ok(bucket) => bucket,
        Err(e) => {
            warn!(kind = T::KIND, error = %e, "unreadable bucket payload, substituting empty");
            T::empty()
        }
    }
}

// --- summaries ---

/// Means travel as integer micro-units to keep the wire format integral.
const MEAN_SCALE: f64 = 1e6;

pub fn encode_summary(summary: &Summary) -> Vec<u8> {
    let mut out = Vec::with_capacity(48);
    out.push(FORMAT_VERSION);
    match summary {
        Summary::Statistic(s) => {
            out.push(TAG_STATISTIC);
            put_varint(&mut out, s.timestamp.millis());
            for v in [s.p50, s.p80, s.p90, s.p95, s.p99, s.p999, s.min, s.max, s.count] {
                put_uvarint(&mut out, v);
            }
            put_varint(&mut out, (s.mean * MEAN_SCALE).round() as i64);
        }
        Summary::Counter(s) => {
            out.push(TAG_COUNTER);
            put_varint(&mut out, s.timestamp.millis());
            put_varint(&mut out, s.count);
        }
        Summary::Gauge(s) => {
            out.push(TAG_GAUGE);
            put_varint(&mut out, s.timestamp.millis());
            for v in [s.min, s.max, s.count] {
                put_uvarint(&mut out, v);
            }
            put_varint(&mut out, (s.mean * MEAN_SCALE).round() as i64);
        }
    }
    out
}

pub fn decode_summary(bytes: &[u8]) -> Result<Summary, CodecError> {
    let mut input = bytes;
    check_version(&mut input)?;
    let (&tag, rest) = input.split_first().ok_or(CodecError::Truncated)?;
    input = rest;
    let timestamp = Timestamp(take_varint(&mut input)?);

    match tag {
        TAG_STATISTIC => {
            let mut fields = [0u64; 9];
            for field in &mut fields {
                *field = take_uvarint(&mut input)?;
            }
            let mean = take_varint(&mut input)? as f64 / MEAN_SCALE;
            let [p50, p80, p90, p95, p99, p999, min, max, count] = fields;
            Ok(Summary::Statistic(StatisticSummary {
                timestamp,
                p50,
                p80,
                p90,
                p95,
                p99,
                p999,
                min,
                max,
                count,
                mean,
            }))
        }
        TAG_COUNTER => Ok(Summary::Counter(CounterSummary {
            timestamp,
            count: take_varint(&mut input)?,
        })),
        TAG_GAUGE => {
            let min = take_uvarint(&mut input)?;
            let max = take_uvarint(&mut input)?;
            let count = take_uvarint(&mut input)?;
            let mean = take_varint(&mut input)? as f64 / MEAN_SCALE;
            Ok(Summary::Gauge(GaugeSummary {
                timestamp,
                min,
                max,
                mean,
                count,
            }))
        }
        other => Err(CodecError::UnknownTag(other)),
    }
}

/// Decodes a summary, substituting the all-zero counter summary for
/// unknown versions so newer rows never halt older readers.
pub fn decode_summary_lossy(bytes: &[u8]) -> Summary {
    match decode_summary(bytes) {
        Ok(summary) => summary,
        Err(e) => {
            warn!(error = %e, "unreadable summary payload, substituting neutral default");
            Summary::Counter(CounterSummary {
                timestamp: Timestamp(0),
                count: 0,
            })
        }
    }
}
