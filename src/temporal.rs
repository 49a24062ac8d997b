//! # Temporal Module
//!
//! Reporting periods for cycles and instant normalisation for fingerprints.
//! All times are normalized to UTC epoch seconds.

use crate::error::{BlueskyError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use time::{OffsetDateTime, UtcOffset};

/// A temporal instant as UTC epoch seconds
pub type Instant = i64;

/// A half-open period [start, end) where start < end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    /// Start time (inclusive)
    pub start: Instant,
    /// End time (exclusive)
    pub end: Instant,
}

impl Interval {
    /// Create a new interval with validation
    ///
    /// # Errors
    /// Returns `InvalidPeriod` if start >= end
    pub fn new(start: Instant, end: Instant) -> Result<Self> {
        if start >= end {
            return Err(BlueskyError::InvalidPeriod(format!(
                "start ({}) must be less than end ({})",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Create an interval from two datetimes in any offset
    pub fn from_utc_datetimes(start: OffsetDateTime, end: OffsetDateTime) -> Result<Self> {
        Self::new(normalize_instant(start), normalize_instant(end))
    }

    /// Check if this interval contains a specific instant
    pub fn contains(&self, instant: Instant) -> bool {
        self.start <= instant && instant < self.end
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

impl PartialOrd for Interval {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Interval {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.start.cmp(&other.start) {
            Ordering::Equal => self.end.cmp(&other.end),
            ordering => ordering,
        }
    }
}

/// Check if two intervals overlap
#[inline]
pub fn is_overlapping(a: &Interval, b: &Interval) -> bool {
    // Half-open intervals overlap unless one ends at or before the other's start.
    a.start < b.end && b.start < a.end
}

/// Collapse a datetime to UTC whole seconds.
///
/// The same instant written with different offsets or sub-second precision
/// yields the same value.
#[inline]
pub fn normalize_instant(datetime: OffsetDateTime) -> Instant {
    datetime.to_offset(UtcOffset::UTC).unix_timestamp()
}
