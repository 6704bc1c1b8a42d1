//! Time-window roll-up core for a distributed time-series metrics platform.
//!
//! Raw timer/gauge/counter measurements are ingested into 1 ms buckets,
//! folded upward through a configured hierarchy of window durations, and
//! summarized into statistical projections that are persisted to a column
//! store. Previously-derived buckets are kept in a bounded in-memory cache
//! so the next tick's coarser window can avoid re-reading the store.

pub mod bucket;
pub mod cache;
pub mod config;
pub mod ingest;
pub mod process;
pub mod store;
pub mod time;
