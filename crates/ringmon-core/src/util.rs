use std::time::{SystemTime, UNIX_EPOCH};

/// Wall clock as epoch seconds, the time base of every series.
pub fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
