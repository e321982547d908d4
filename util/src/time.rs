//! Timestamp helpers shared by the Store, Treasury and Pool.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix timestamp in seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

/// Format a Unix timestamp as an ISO-8601 string, for logs and the
/// read-only API. Falls back to a placeholder on an out-of-range value.
pub fn format_timestamp(unix_secs: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(unix_secs, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| "invalid-timestamp".to_string())
}
