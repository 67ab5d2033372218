//! Time utilities and timing defaults for the singleton protocol.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

/// Protocol timing defaults.
pub mod constants {
    use super::Duration;

    /// How long a removed member is remembered (15 minutes).
    pub fn removed_member_ttl() -> Duration {
        Duration::from_secs(15 * 60)
    }

    /// Interval of the removed-member sweep (1 minute).
    pub fn cleanup_interval() -> Duration {
        Duration::from_secs(60)
    }

    /// Interval between hand-over and take-over retries (1 second).
    pub fn hand_over_retry_interval() -> Duration {
        Duration::from_secs(1)
    }

    /// Lower bound for the derived number of hand-over retries.
    pub const MIN_HAND_OVER_RETRIES: u32 = 15;

    /// Retries added on top of `removal_margin / retry_interval`.
    pub const HAND_OVER_RETRY_HEADROOM: u32 = 3;
}

/// A timestamp with timezone (always UTC).
pub type Timestamp = DateTime<Utc>;

/// Get the current timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}

/// A point in monotonic time after which something is overdue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Instant);

impl Deadline {
    /// Deadline `duration` after `now`.
    pub fn after(now: Instant, duration: Duration) -> Self {
        Self(now + duration)
    }

    /// Check if the deadline has passed.
    pub fn is_overdue(&self, now: Instant) -> bool {
        now >= self.0
    }

    /// Remaining time, zero once overdue.
    pub fn time_left(&self, now: Instant) -> Duration {
        self.0.saturating_duration_since(now)
    }

    /// The instant this deadline expires.
    pub fn instant(&self) -> Instant {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_overdue() {
        let start = Instant::now();
        let deadline = Deadline::after(start, Duration::from_secs(10));
        assert!(!deadline.is_overdue(start));
        assert!(!deadline.is_overdue(start + Duration::from_secs(9)));
        assert!(deadline.is_overdue(start + Duration::from_secs(10)));
    }

    #[test]
    fn test_deadline_time_left() {
        let start = Instant::now();
        let deadline = Deadline::after(start, Duration::from_secs(10));
        assert_eq!(deadline.time_left(start + Duration::from_secs(4)), Duration::from_secs(6));
        assert_eq!(deadline.time_left(start + Duration::from_secs(40)), Duration::ZERO);
    }

    #[test]
    fn test_default_ttl() {
        assert_eq!(constants::removed_member_ttl(), Duration::from_secs(900));
    }
}
