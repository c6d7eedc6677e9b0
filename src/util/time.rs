//! Timestamp helpers. All persisted timestamps are UTC epoch seconds; local
//! time is a presentation-layer concern handled by CLI commands only (see
//! SPEC_FULL.md §3 on why we dropped the source's implicit timezone shift).

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as UTC epoch seconds, saturating at zero if the clock is
/// somehow before the epoch.
pub fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Convert epoch seconds to a `SystemTime`, for handing to `fuser`.
pub fn epoch_to_system_time(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + std::time::Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - std::time::Duration::from_secs((-secs) as u64)
    }
}

/// Convert a `SystemTime` back to epoch seconds.
pub fn system_time_to_epoch(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}
