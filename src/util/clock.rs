//! Wall-clock helpers shared by scheduling and profiling code.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// Convert an absolute epoch-millisecond start time into a monotonic deadline.
///
/// A start time at or before "now" maps to an immediate deadline.
#[must_use]
pub fn deadline_for(start_at_ms: u128) -> Instant {
    let delay = start_at_ms.saturating_sub(now_ms());
    let delay = u64::try_from(delay).unwrap_or(u64::MAX);
    Instant::now() + Duration::from_millis(delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }

    #[test]
    fn past_start_time_is_immediate() {
        let deadline = deadline_for(0);
        assert!(deadline <= Instant::now() + Duration::from_millis(1));
    }
}
