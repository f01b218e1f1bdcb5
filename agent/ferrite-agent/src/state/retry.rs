//! Backoff schedules for fetch/install retries and status reporting.

use std::time::Duration;

/// Attempts allowed per backoff epoch.
const PER_EPOCH_ATTEMPTS: u32 = 3;

/// Smallest interval the fetch/install schedule hands out.
const MIN_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Floor for the number of report-sending attempts.
pub const MIN_REPORT_SEND_RETRIES: u32 = 3;

/// Interval to wait before fetch/install attempt number `attempt`
/// (0-based), or `None` once the schedule is exhausted.
///
/// The schedule runs in epochs of [`PER_EPOCH_ATTEMPTS`] attempts each.
/// Epoch `e` waits `2^e` minutes, capped at `max_interval` but never
/// below one minute. One final epoch runs at the cap, then the
/// schedule ends.
pub fn fetch_install_retry_interval(attempt: u32, max_interval: Duration) -> Option<Duration> {
    let mut interval = MIN_RETRY_INTERVAL;
    let mut next_interval = interval;

    let mut epoch_start = 0;
    while epoch_start <= attempt {
        interval = next_interval;
        next_interval = next_interval.saturating_mul(2);
        if interval >= max_interval {
            if attempt - epoch_start >= PER_EPOCH_ATTEMPTS {
                // Already tried a full epoch at the cap. Give up.
                return None;
            }
            if max_interval < MIN_RETRY_INTERVAL {
                return Some(MIN_RETRY_INTERVAL);
            }
            return Some(max_interval);
        }
        epoch_start += PER_EPOCH_ATTEMPTS;
    }

    Some(interval)
}

/// Number of attempts allowed when sending a deployment status report.
///
/// One poll interval's worth of retries spaced `retry_interval` apart,
/// but never fewer than [`MIN_REPORT_SEND_RETRIES`].
pub fn max_sending_attempts(poll_interval: Duration, retry_interval: Duration) -> u32 {
    if retry_interval.is_zero() {
        return MIN_REPORT_SEND_RETRIES;
    }
    let attempts = (poll_interval.as_nanos() / retry_interval.as_nanos()) as u32;
    attempts.max(MIN_REPORT_SEND_RETRIES)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_retry_interval_one_minute_cap() {
        assert_eq!(fetch_install_retry_interval(0, MINUTE), Some(MINUTE));
        assert_eq!(fetch_install_retry_interval(1, MINUTE), Some(MINUTE));
        assert_eq!(fetch_install_retry_interval(2, MINUTE), Some(MINUTE));
        assert_eq!(fetch_install_retry_interval(3, MINUTE), None);
        assert_eq!(fetch_install_retry_interval(7, MINUTE), None);
    }

    #[test]
    fn test_retry_interval_two_minute_cap() {
        assert_eq!(fetch_install_retry_interval(5, 2 * MINUTE), Some(2 * MINUTE));
        assert_eq!(fetch_install_retry_interval(6, 2 * MINUTE), None);
    }

    #[test]
    fn test_retry_interval_ten_minute_cap() {
        assert_eq!(
            fetch_install_retry_interval(11, 10 * MINUTE),
            Some(8 * MINUTE)
        );
        assert_eq!(
            fetch_install_retry_interval(12, 10 * MINUTE),
            Some(10 * MINUTE)
        );
        assert_eq!(
            fetch_install_retry_interval(14, 10 * MINUTE),
            Some(10 * MINUTE)
        );
        assert_eq!(fetch_install_retry_interval(15, 10 * MINUTE), None);
    }

    #[test]
    fn test_retry_interval_sub_minute_cap_uses_floor() {
        let second = Duration::from_secs(1);
        assert_eq!(fetch_install_retry_interval(0, second), Some(MINUTE));
        assert_eq!(fetch_install_retry_interval(1, second), Some(MINUTE));
        assert_eq!(fetch_install_retry_interval(2, second), Some(MINUTE));
        assert_eq!(fetch_install_retry_interval(3, second), None);
    }

    #[test]
    fn test_retry_interval_five_minute_cap_allows_twelve_attempts() {
        // Epochs 1m, 2m, 4m, 5m with three attempts each.
        for attempt in 0..12 {
            assert!(fetch_install_retry_interval(attempt, 5 * MINUTE).is_some());
        }
        assert_eq!(fetch_install_retry_interval(9, 5 * MINUTE), Some(5 * MINUTE));
        assert_eq!(fetch_install_retry_interval(12, 5 * MINUTE), None);
    }

    #[test]
    fn test_max_sending_attempts() {
        let second = Duration::from_secs(1);
        assert_eq!(
            max_sending_attempts(second, Duration::ZERO),
            MIN_REPORT_SEND_RETRIES
        );
        assert_eq!(max_sending_attempts(second, MINUTE), MIN_REPORT_SEND_RETRIES);
        assert_eq!(max_sending_attempts(5 * second, second), 5);
        assert_eq!(max_sending_attempts(second, second), MIN_REPORT_SEND_RETRIES);
    }
}
