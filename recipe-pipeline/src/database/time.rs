//! Timestamp helpers for the database layer.
//!
//! Timestamps are stored as `INTEGER` Unix epoch milliseconds (UTC).

use chrono::{DateTime, TimeZone, Utc};

#[inline]
pub fn to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

#[inline]
pub fn opt_to_ms(dt: Option<DateTime<Utc>>) -> Option<i64> {
    dt.map(to_ms)
}

/// Convert epoch milliseconds back to a `DateTime<Utc>`.
///
/// Out-of-range values clamp to the Unix epoch rather than panicking.
pub fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .earliest()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[inline]
pub fn opt_from_ms(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ms_roundtrip_keeps_millisecond_precision() {
        let now = Utc::now();
        let back = from_ms(to_ms(now));
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn test_out_of_range_clamps() {
        assert_eq!(from_ms(i64::MAX), DateTime::<Utc>::UNIX_EPOCH);
    }
}
