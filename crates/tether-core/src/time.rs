//! Wall-clock helpers for session timestamps

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current Unix timestamp in milliseconds (0 if the clock is before the epoch)
///
/// # Examples
/// ```
/// use tether_core::time::current_time_millis;
///
/// let now = current_time_millis();
/// assert!(now > 0);
/// ```
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Time elapsed since a millisecond timestamp; zero for timestamps in the future
pub fn elapsed_since(since_millis: u64) -> Duration {
    Duration::from_millis(current_time_millis().saturating_sub(since_millis))
}

/// Compact human-readable age: `42s`, `5m`, `3h`, `2d`
pub fn format_age(age: Duration) -> String {
    let secs = age.as_secs();
    match secs {
        0..=59 => format!("{}s", secs),
        60..=3599 => format!("{}m", secs / 60),
        3600..=86399 => format!("{}h", secs / 3600),
        _ => format!("{}d", secs / 86400),
    }
}
