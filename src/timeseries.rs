//! Time-range filtering for timestamped series.
//!
//! Ranges are half-open: `start <= t < end`.

use chrono::{DateTime, Utc};

use crate::sim::types::CallRecord;
use crate::store::Measurement;

/// Anything carrying a single UTC timestamp.
pub trait Timestamped {
    /// Timestamp of the point.
    fn timestamp(&self) -> DateTime<Utc>;
}

impl Timestamped for Measurement {
    fn timestamp(&self) -> DateTime<Utc> {
        self.time
    }
}

impl Timestamped for CallRecord {
    fn timestamp(&self) -> DateTime<Utc> {
        self.observed_at
    }
}

/// Keeps only points inside `[start, end)`, preserving input order.
pub fn filter_strict<T: Timestamped + Clone>(
    points: &[T],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<T> {
    points
        .iter()
        .filter(|p| in_range(p.timestamp(), start, end))
        .cloned()
        .collect()
}

/// Points inside `[start, end)` plus the nearest point on each side.
///
/// The result is sorted by time and includes the last point before `start`
/// and the first point at or after `end`, when they exist, so callers can
/// interpolate across the whole window.
pub fn filter_with_interpolation<T: Timestamped + Clone>(
    points: &[T],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<T> {
    let mut sorted = points.to_vec();
    sorted.sort_by_key(Timestamped::timestamp);

    let before = sorted.iter().rev().find(|p| p.timestamp() < start);
    let after = sorted.iter().find(|p| p.timestamp() >= end);

    before
        .into_iter()
        .chain(sorted.iter().filter(|p| in_range(p.timestamp(), start, end)))
        .chain(after)
        .cloned()
        .collect()
}

fn in_range(t: DateTime<Utc>, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    start <= t && t < end
}
