//! Access Token Lifecycle
//!
//! Tracks when the access token expires and how far ahead of expiry a
//! refresh should start. The client drives the refresh itself; this module
//! only answers "when".

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Default lead time before expiry at which a refresh starts.
pub const DEFAULT_REFRESH_BEFORE: Duration = Duration::from_secs(5 * 60);

/// Expiry tracking for the access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenSchedule {
    expires_at: Option<Instant>,
    refresh_before: Duration,
}

impl Default for TokenSchedule {
    fn default() -> Self {
        Self::new(DEFAULT_REFRESH_BEFORE)
    }
}

impl TokenSchedule {
    /// Create a schedule with no known expiry.
    #[must_use]
    pub const fn new(refresh_before: Duration) -> Self {
        Self {
            expires_at: None,
            refresh_before,
        }
    }

    /// Set the expiry relative to `now`.
    pub fn set_expires_in(&mut self, now: Instant, expires_in: Duration) {
        self.expires_at = Some(now + expires_in);
    }

    /// Set the expiry from a wall-clock deadline. Past deadlines expire now.
    pub fn set_expires_at_wall(&mut self, now: Instant, wall_now: DateTime<Utc>, at: DateTime<Utc>) {
        let remaining = (at - wall_now).to_std().unwrap_or(Duration::ZERO);
        self.set_expires_in(now, remaining);
    }

    /// Forget the expiry.
    pub const fn clear(&mut self) {
        self.expires_at = None;
    }

    /// Monotonic expiry, if known.
    #[must_use]
    pub const fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    /// Lead time before expiry.
    #[must_use]
    pub const fn refresh_before(&self) -> Duration {
        self.refresh_before
    }

    /// Change the lead time.
    pub const fn set_refresh_before(&mut self, refresh_before: Duration) {
        self.refresh_before = refresh_before;
    }

    /// Delay from `now` until the refresh should start, floored at zero.
    ///
    /// `None` when the expiry is unknown.
    #[must_use]
    pub fn refresh_delay(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|expires_at| {
            expires_at
                .saturating_duration_since(now)
                .saturating_sub(self.refresh_before)
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use test_case::test_case;

    use super::*;

    #[test]
    fn unknown_expiry_has_no_delay() {
        let schedule = TokenSchedule::default();
        assert_eq!(schedule.refresh_before(), DEFAULT_REFRESH_BEFORE);
        assert!(schedule.refresh_delay(Instant::now()).is_none());
    }

    #[test_case(50, 10 => 40 ; "lead time subtracted")]
    #[test_case(10, 10 => 0 ; "lead time equals lifetime")]
    #[test_case(5, 10 => 0 ; "already inside lead time")]
    fn delay_is_floored_at_zero(expires_ms: u64, before_ms: u64) -> u128 {
        let now = Instant::now();
        let mut schedule = TokenSchedule::new(Duration::from_millis(before_ms));
        schedule.set_expires_in(now, Duration::from_millis(expires_ms));
        schedule.refresh_delay(now).unwrap().as_millis()
    }

    #[test]
    fn wall_clock_expiry_in_the_past_is_due_now() {
        let now = Instant::now();
        let wall_now = Utc::now();
        let mut schedule = TokenSchedule::new(Duration::ZERO);
        schedule.set_expires_at_wall(now, wall_now, wall_now - TimeDelta::minutes(1));
        assert_eq!(schedule.refresh_delay(now), Some(Duration::ZERO));
    }

    #[test]
    fn wall_clock_expiry_in_the_future() {
        let now = Instant::now();
        let wall_now = Utc::now();
        let mut schedule = TokenSchedule::new(Duration::from_secs(60));
        schedule.set_expires_at_wall(now, wall_now, wall_now + TimeDelta::hours(1));
        assert_eq!(
            schedule.refresh_delay(now),
            Some(Duration::from_secs(59 * 60))
        );

        schedule.clear();
        assert!(schedule.expires_at().is_none());
    }
}
