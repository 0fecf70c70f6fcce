//! Wall-clock alignment helpers.
//!
//! Both candle buckets and collection cycles are aligned to multiples of their
//! width since the Unix epoch, never to the moment the process started.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Start of the bucket of width `width` containing `ts`.
///
/// `floor(ts / width) * width`, computed in milliseconds so that pre-epoch
/// timestamps still round down.
pub fn bucket_start(ts: DateTime<Utc>, width: Duration) -> DateTime<Utc> {
    let width_ms = width.as_millis().max(1) as i64;
    let start_ms = ts.timestamp_millis().div_euclid(width_ms) * width_ms;
    DateTime::from_timestamp_millis(start_ms).unwrap_or(ts)
}

/// The first multiple of `interval` strictly after `now`.
///
/// A `now` that sits exactly on a boundary yields the following boundary, so a
/// cycle that finishes instantly can never re-fire for the same mark.
pub fn next_boundary(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let step = chrono::Duration::seconds(interval.as_secs() as i64);
    bucket_start(now, interval) + step
}
