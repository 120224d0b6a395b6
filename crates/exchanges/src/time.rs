use chrono::{DateTime, Utc};

/// Epoch values above this are taken to be milliseconds. Seconds stay below
/// ~1.7e9 until 2286, milliseconds are already ~1.7e12.
const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

/// Converts an epoch timestamp in seconds or milliseconds to a UTC instant.
pub fn to_utc_datetime(timestamp: i64) -> Option<DateTime<Utc>> {
	if timestamp < 0 {
		return None;
	}

	if timestamp > MILLIS_THRESHOLD {
		DateTime::from_timestamp_millis(timestamp)
	} else {
		DateTime::from_timestamp(timestamp, 0)
	}
}

/// As [`to_utc_datetime`], falling back to the Unix epoch for out-of-range input.
pub fn to_utc_datetime_or_epoch(timestamp: i64) -> DateTime<Utc> {
	to_utc_datetime(timestamp).unwrap_or_default()
}
