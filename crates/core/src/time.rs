//! Time normalization and clock abstraction.
//!
//! Every timestamp entering the system is normalized to UTC here:
//! offset timestamps are converted, naive timestamps are assumed to be UTC.

use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, Utc};

/// How far `occurred_at` may be ahead of processing-time "now", in seconds.
pub const MAX_CLOCK_SKEW_SECS: i64 = 300;

/// [`MAX_CLOCK_SKEW_SECS`] as a duration.
pub fn max_clock_skew() -> Duration {
    Duration::seconds(MAX_CLOCK_SKEW_SECS)
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
];

/// Parse an ISO 8601 timestamp and normalize it to UTC.
pub fn normalize_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }

    // RFC 3339 with a space separator, e.g. "2024-01-01 10:00:00+03:00".
    if let Ok(dt) = DateTime::<FixedOffset>::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Ok(dt.with_timezone(&Utc));
    }

    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(naive.and_utc());
        }
    }

    Err(format!("'{raw}' is not an ISO 8601 timestamp"))
}

/// Source of processing-time "now".
pub trait Clock: Send + Sync + core::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to a single instant, for deterministic tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn offset_timestamps_are_converted_to_utc() {
        let dt = normalize_timestamp("2024-03-01T12:00:00+03:00").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap());
    }

    #[test]
    fn zulu_and_naive_timestamps_are_equal() {
        let zulu = normalize_timestamp("2024-03-01T12:00:00Z").unwrap();
        let naive = normalize_timestamp("2024-03-01T12:00:00").unwrap();
        let spaced = normalize_timestamp("2024-03-01 12:00:00").unwrap();
        assert_eq!(zulu, naive);
        assert_eq!(zulu, spaced);
    }

    #[test]
    fn fractional_seconds_are_kept() {
        let dt = normalize_timestamp("2024-03-01T12:00:00.250").unwrap();
        assert_eq!(dt.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(normalize_timestamp("yesterday").is_err());
        assert!(normalize_timestamp("").is_err());
    }
}
