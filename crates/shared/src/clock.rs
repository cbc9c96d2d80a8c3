//! Clock and timestamp normalization
//!
//! Every persisted timestamp may be naive (no offset, written by older code
//! paths) or offset-aware. All comparisons go through [`StoredInstant::to_utc`]
//! so both shapes describe the same instant.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::{Iso8601, Rfc3339};
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::error::{SharedError, SharedResult};

/// Source of "now" for entitlement decisions
pub trait Clock: Send + Sync {
    /// Current instant, always in UTC
    fn now(&self) -> OffsetDateTime;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Settable clock for tests and replays
#[derive(Debug)]
pub struct ManualClock {
    unix_nanos: AtomicI64,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            unix_nanos: AtomicI64::new(to_nanos(start)),
        }
    }

    /// Jump to an absolute instant
    pub fn set(&self, instant: OffsetDateTime) {
        self.unix_nanos.store(to_nanos(instant), Ordering::SeqCst);
    }

    /// Move forward (or backward, for negative durations)
    pub fn advance(&self, by: Duration) {
        let delta = by.whole_nanoseconds() as i64;
        self.unix_nanos.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        let nanos = self.unix_nanos.load(Ordering::SeqCst);
        OffsetDateTime::from_unix_timestamp_nanos(nanos as i128)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }
}

fn to_nanos(instant: OffsetDateTime) -> i64 {
    instant.unix_timestamp_nanos() as i64
}

/// A persisted timestamp as it came back from storage
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StoredInstant {
    /// No offset recorded; interpreted as UTC wall-clock time
    Naive(PrimitiveDateTime),
    /// Offset recorded (not necessarily UTC)
    Aware(OffsetDateTime),
}

impl StoredInstant {
    /// Normalize to a UTC-aware instant
    pub fn to_utc(self) -> OffsetDateTime {
        match self {
            StoredInstant::Naive(naive) => naive.assume_utc(),
            StoredInstant::Aware(aware) => aware.to_offset(UtcOffset::UTC),
        }
    }

    /// True when this instant is strictly earlier than `now`
    pub fn is_before(self, now: OffsetDateTime) -> bool {
        self.to_utc() < now.to_offset(UtcOffset::UTC)
    }

    /// True when this instant is strictly later than `now`
    pub fn is_after(self, now: OffsetDateTime) -> bool {
        self.to_utc() > now.to_offset(UtcOffset::UTC)
    }

    /// Calendar date in UTC
    pub fn utc_date(self) -> Date {
        self.to_utc().date()
    }
}

impl PartialEq for StoredInstant {
    fn eq(&self, other: &Self) -> bool {
        self.to_utc() == other.to_utc()
    }
}

impl Eq for StoredInstant {}

impl From<OffsetDateTime> for StoredInstant {
    fn from(instant: OffsetDateTime) -> Self {
        StoredInstant::Aware(instant)
    }
}

impl From<PrimitiveDateTime> for StoredInstant {
    fn from(instant: PrimitiveDateTime) -> Self {
        StoredInstant::Naive(instant)
    }
}

/// Parse a timestamp string written by any historical code path.
///
/// Accepts RFC 3339 (aware), ISO 8601 without offset (naive) and the
/// space-separated form Postgres prints for `TIMESTAMP` columns (naive).
pub fn parse_stored_instant(raw: &str) -> SharedResult<StoredInstant> {
    let raw = raw.trim();

    if let Ok(aware) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Ok(StoredInstant::Aware(aware));
    }

    if let Ok(naive) = PrimitiveDateTime::parse(raw, &Iso8601::DEFAULT) {
        return Ok(StoredInstant::Naive(naive));
    }

    let spaced = format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second][optional [.[subsecond]]]"
    );
    PrimitiveDateTime::parse(raw, &spaced)
        .map(StoredInstant::Naive)
        .map_err(|_| SharedError::InvalidTimestamp(raw.to_string()))
}

/// UTC calendar date of an instant
pub fn utc_date(instant: OffsetDateTime) -> Date {
    instant.to_offset(UtcOffset::UTC).date()
}

/// First UTC midnight strictly after `instant`
pub fn next_utc_midnight(instant: OffsetDateTime) -> OffsetDateTime {
    utc_date(instant)
        .next_day()
        .map(|day| day.midnight().assume_utc())
        .unwrap_or(instant + Duration::days(1))
}

/// `YYYY-MM` key of the UTC calendar month containing `instant`
pub fn month_key(instant: OffsetDateTime) -> String {
    let date = utc_date(instant);
    format!("{:04}-{:02}", date.year(), u8::from(date.month()))
}

/// Whole days from `now` until `until`, never negative
pub fn days_until(until: OffsetDateTime, now: OffsetDateTime) -> i64 {
    (until - now).whole_days().max(0)
}
