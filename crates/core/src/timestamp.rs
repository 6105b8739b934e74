//! Millisecond-precision timestamp and timespan types
//!
//! History providers report record times with millisecond resolution, so
//! every watermark, window bound and record time in the engine uses the
//! same unit.
//!
//! ## Usage
//!
//! Never expose raw arithmetic. Use explicit constructors:
//!
//! ```
//! use backfill_core::Timestamp;
//!
//! let watermark = Timestamp::from_millis(1_000_000);
//! assert_eq!(watermark.saturating_add_millis(500).millis_since(watermark), 500);
//! ```

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Milliseconds in one UTC day.
pub const MILLIS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

/// Millisecond-precision timestamp
///
/// Represents a point in time as milliseconds since Unix epoch.
///
/// ## Invariants
///
/// - Timestamps are always non-negative (u64)
/// - Timestamps are always in milliseconds
/// - Timestamps are comparable and orderable
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Unix epoch (1970-01-01 00:00:00 UTC)
    pub const EPOCH: Timestamp = Timestamp(0);

    // =========================================================================
    // Constructors
    // =========================================================================

    /// Create a timestamp from milliseconds since epoch
    #[inline]
    pub const fn from_millis(millis: u64) -> Self {
        Timestamp(millis)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Get milliseconds since Unix epoch
    #[inline]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    // =========================================================================
    // Arithmetic
    // =========================================================================

    /// Milliseconds between `earlier` and `self`, zero if `earlier` is later.
    #[inline]
    pub const fn millis_since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    /// Add milliseconds, saturating at `u64::MAX`.
    #[inline]
    pub const fn saturating_add_millis(&self, millis: u64) -> Self {
        Timestamp(self.0.saturating_add(millis))
    }

    // =========================================================================
    // Day boundaries (UTC)
    // =========================================================================

    /// Midnight UTC at or before this timestamp.
    #[inline]
    pub const fn start_of_day(&self) -> Self {
        Timestamp(self.0 - self.0 % MILLIS_PER_DAY)
    }

    /// Midnight UTC strictly after this timestamp.
    #[inline]
    pub const fn start_of_next_day(&self) -> Self {
        self.start_of_day().saturating_add_millis(MILLIS_PER_DAY)
    }

    /// Chrono UTC datetime, if representable.
    fn to_datetime(&self) -> Option<DateTime<Utc>> {
        i64::try_from(self.0)
            .ok()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
    }

    /// Convert from a chrono UTC datetime. Pre-epoch instants clamp to epoch.
    pub fn from_datetime(datetime: &DateTime<Utc>) -> Self {
        Timestamp(datetime.timestamp_millis().max(0) as u64)
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Timestamp::EPOCH
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_datetime() {
            Some(datetime) => write!(f, "{}", datetime.format("%Y-%m-%dT%H:%M:%S%.3fZ")),
            None => write!(f, "{}ms", self.0),
        }
    }
}

impl From<u64> for Timestamp {
    /// Create from raw milliseconds
    fn from(millis: u64) -> Self {
        Timestamp::from_millis(millis)
    }
}

impl From<Timestamp> for u64 {
    /// Extract raw milliseconds
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Timestamp::from_datetime(&datetime)
    }
}

// ============================================================================
// Timespan
// ============================================================================

/// Closed time range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timespan {
    start: Timestamp,
    end: Timestamp,
}

impl Timespan {
    /// Create a timespan. Returns `None` if `end` is before `start`.
    pub fn new(start: Timestamp, end: Timestamp) -> Option<Self> {
        if end < start {
            None
        } else {
            Some(Timespan { start, end })
        }
    }

    /// First instant covered
    #[inline]
    pub fn start(&self) -> Timestamp {
        self.start
    }

    /// Last instant covered
    #[inline]
    pub fn end(&self) -> Timestamp {
        self.end
    }

    /// Length of the span in milliseconds
    #[inline]
    pub fn len_millis(&self) -> u64 {
        self.end.millis_since(self.start)
    }

    /// True if `ts` lies inside the span (inclusive on both ends)
    #[inline]
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }
}

impl std::fmt::Display for Timespan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}
