//! Date/time utilities for rapidstore.
//!
//! The metadata tables store timestamps as unix seconds; everything above the
//! row mapping works with `DateTime<Utc>`.

use chrono::{DateTime, Utc};

/// Convert a `DateTime<Utc>` to unix seconds for storage.
pub fn to_unix(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp()
}

/// Convert stored unix seconds back to `DateTime<Utc>`.
///
/// Returns `None` for values outside chrono's representable range.
pub fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

/// Convert an optional stored timestamp.
pub fn from_unix_opt(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(from_unix)
}

/// Truncate a timestamp to whole seconds, matching what a round trip through
/// the database yields.
pub fn truncate_to_secs(dt: DateTime<Utc>) -> DateTime<Utc> {
    from_unix(dt.timestamp()).unwrap_or(dt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_round_trip() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
        let secs = to_unix(&dt);
        assert_eq!(secs, 1_705_314_600);
        assert_eq!(from_unix(secs), Some(dt));
    }

    #[test]
    fn test_from_unix_opt() {
        assert_eq!(from_unix_opt(None), None);
        assert!(from_unix_opt(Some(0)).is_some());
    }

    #[test]
    fn test_from_unix_out_of_range() {
        assert_eq!(from_unix(i64::MAX), None);
    }

    #[test]
    fn test_truncate_to_secs() {
        let dt = Utc.timestamp_opt(1_700_000_000, 999_000_000).unwrap();
        let truncated = truncate_to_secs(dt);
        assert_eq!(truncated.timestamp(), 1_700_000_000);
        assert_eq!(truncated.timestamp_subsec_nanos(), 0);
    }
}
