//! Subscription Management Types
//!
//! Domain types for tracking the desired instrument subscription set and
//! throttling subscribe sends.
//!
//! # Design
//!
//! The ticker protocol is fire-and-forget: a subscribe frame is never
//! acknowledged. The manager therefore tracks *intent* (the desired token
//! set) and decides, each time a flush is triggered, whether the full set may
//! be written now or must wait for the connection to open or the rate limit
//! suspension to lapse. A deferred flush never drops desired state.
//!
//! All methods take `now` explicitly so the caller owns the clock.

use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};

/// Exchange instrument token.
pub type InstrumentToken = u32;

// =============================================================================
// Rate Limit Window
// =============================================================================

/// Rolling-window rate limit options for subscribe sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitOptions {
    /// Length of the rolling window.
    pub window: Duration,
    /// Attempts allowed inside one window.
    pub max_per_window: usize,
    /// Suspension applied once the window overflows.
    pub backoff: Duration,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(1),
            max_per_window: 10,
            backoff: Duration::from_secs(5),
        }
    }
}

/// Rolling window of subscribe attempts with an overflow suspension.
#[derive(Debug, Clone)]
pub struct RateLimitWindow {
    options: RateLimitOptions,
    attempts: VecDeque<Instant>,
    suspended_until: Option<Instant>,
}

impl RateLimitWindow {
    /// Create an empty window.
    #[must_use]
    pub const fn new(options: RateLimitOptions) -> Self {
        Self {
            options,
            attempts: VecDeque::new(),
            suspended_until: None,
        }
    }

    /// Current options.
    #[must_use]
    pub const fn options(&self) -> RateLimitOptions {
        self.options
    }

    /// Replace the options. Recorded attempts and any suspension are kept.
    pub const fn set_options(&mut self, options: RateLimitOptions) {
        self.options = options;
    }

    /// Record a subscribe attempt at `now`.
    ///
    /// Returns `true` when this attempt overflowed the window and the
    /// limiter is now suspended.
    pub fn record_attempt(&mut self, now: Instant) -> bool {
        self.attempts.push_back(now);
        self.evict(now);

        if self.attempts.len() > self.options.max_per_window {
            self.suspend(now);
            return true;
        }

        false
    }

    /// Suspend sends for one backoff starting at `now`.
    pub fn suspend(&mut self, now: Instant) {
        self.suspended_until = Some(now + self.options.backoff);
        tracing::warn!(
            attempts = self.attempts.len(),
            max_per_window = self.options.max_per_window,
            backoff_ms = self.options.backoff.as_millis(),
            "Subscribe rate limit exceeded, suspending sends"
        );
    }

    /// Whether another attempt at `now` would overflow the window.
    #[must_use]
    pub fn is_full(&self, now: Instant) -> bool {
        self.attempts_in_window(now) >= self.options.max_per_window
    }

    /// Earliest instant a send may go out, or `None` if one may go out at
    /// `now`. Covers both an active suspension and a full window.
    #[must_use]
    pub fn resume_at(&self, now: Instant) -> Option<Instant> {
        let suspended = self.suspended_until(now);
        let slot = if self.is_full(now) {
            self.attempts
                .iter()
                .find(|t| now.saturating_duration_since(**t) < self.options.window)
                .map(|oldest| *oldest + self.options.window)
        } else {
            None
        };
        match (suspended, slot) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Whether sends are suspended at `now`.
    #[must_use]
    pub fn is_suspended(&self, now: Instant) -> bool {
        self.suspended_until.is_some_and(|until| now < until)
    }

    /// End of the current suspension, if one is active at `now`.
    #[must_use]
    pub fn suspended_until(&self, now: Instant) -> Option<Instant> {
        self.suspended_until.filter(|until| now < *until)
    }

    /// Number of attempts still inside the window at `now`.
    #[must_use]
    pub fn attempts_in_window(&self, now: Instant) -> usize {
        self.attempts
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < self.options.window)
            .count()
    }

    /// Forget all attempts and any suspension.
    pub fn reset(&mut self) {
        self.attempts.clear();
        self.suspended_until = None;
    }

    fn evict(&mut self, now: Instant) {
        while let Some(oldest) = self.attempts.front() {
            if now.saturating_duration_since(*oldest) >= self.options.window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
    }
}

// =============================================================================
// Flush Decision
// =============================================================================

/// Why a flush could not write the subscribe frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// The socket is not open.
    NotOpen,
    /// The rate limiter is suspended until the given instant.
    Suspended {
        /// When sends may resume.
        until: Instant,
    },
}

/// Outcome of a flush request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushDecision {
    /// Nothing is desired; nothing to send.
    Idle,
    /// The flush must wait; desired state is kept pending.
    Deferred(DeferReason),
    /// Write a subscribe frame for these tokens.
    Send(Vec<InstrumentToken>),
}

// =============================================================================
// Subscription Manager
// =============================================================================

/// Desired subscription set plus the subscribe rate limiter.
#[derive(Debug, Clone)]
pub struct SubscriptionManager {
    desired: BTreeSet<InstrumentToken>,
    rate_limit: RateLimitWindow,
    auto_resubscribe: bool,
    pending: bool,
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new(RateLimitOptions::default())
    }
}

impl SubscriptionManager {
    /// Create an empty manager with auto-resubscribe enabled.
    #[must_use]
    pub const fn new(options: RateLimitOptions) -> Self {
        Self {
            desired: BTreeSet::new(),
            rate_limit: RateLimitWindow::new(options),
            auto_resubscribe: true,
            pending: false,
        }
    }

    /// Replace the desired set.
    pub fn set_tokens(&mut self, tokens: impl IntoIterator<Item = InstrumentToken>) {
        self.desired = tokens.into_iter().collect();
        self.pending = !self.desired.is_empty();
    }

    /// Add tokens to the desired set.
    ///
    /// Returns `true` if at least one token was new.
    pub fn add_tokens(&mut self, tokens: impl IntoIterator<Item = InstrumentToken>) -> bool {
        let mut changed = false;
        for token in tokens {
            changed |= self.desired.insert(token);
        }
        if changed {
            self.pending = true;
        }
        changed
    }

    /// Desired tokens in ascending order.
    #[must_use]
    pub fn tokens(&self) -> Vec<InstrumentToken> {
        self.desired.iter().copied().collect()
    }

    /// Number of desired tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.desired.len()
    }

    /// Whether nothing is desired.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.desired.is_empty()
    }

    /// Drop the desired set and any pending flush.
    pub fn clear(&mut self) {
        self.desired.clear();
        self.pending = false;
    }

    /// Whether a deferred flush is still owed.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.pending
    }

    /// Whether the full set is flushed automatically when a socket opens.
    #[must_use]
    pub const fn auto_resubscribe(&self) -> bool {
        self.auto_resubscribe
    }

    /// Enable or disable flushing on open.
    pub const fn set_auto_resubscribe(&mut self, enabled: bool) {
        self.auto_resubscribe = enabled;
    }

    /// The subscribe rate limiter.
    #[must_use]
    pub const fn rate_limit(&self) -> &RateLimitWindow {
        &self.rate_limit
    }

    /// Mutable access to the subscribe rate limiter.
    pub const fn rate_limit_mut(&mut self) -> &mut RateLimitWindow {
        &mut self.rate_limit
    }

    /// Decide whether the desired set can be written now.
    ///
    /// An attempt is recorded against the rate limiter only when the frame
    /// is actually released. A flush that finds the window full trips the
    /// suspension, is withheld and stays pending; the returned instant is
    /// when both the suspension has lapsed and the window has room again.
    pub fn flush(&mut self, now: Instant, is_open: bool) -> FlushDecision {
        if self.desired.is_empty() {
            self.pending = false;
            return FlushDecision::Idle;
        }

        self.pending = true;

        if !is_open {
            return FlushDecision::Deferred(DeferReason::NotOpen);
        }

        if self.rate_limit.resume_at(now).is_some() {
            if !self.rate_limit.is_suspended(now) {
                self.rate_limit.suspend(now);
            }
            let until = self
                .rate_limit
                .resume_at(now)
                .unwrap_or(now + self.rate_limit.options().backoff);
            return FlushDecision::Deferred(DeferReason::Suspended { until });
        }

        self.rate_limit.record_attempt(now);
        self.pending = false;
        FlushDecision::Send(self.tokens())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(window_ms: u64, max: usize, backoff_ms: u64) -> RateLimitOptions {
        RateLimitOptions {
            window: Duration::from_millis(window_ms),
            max_per_window: max,
            backoff: Duration::from_millis(backoff_ms),
        }
    }

    #[test]
    fn fourth_attempt_in_window_suspends() {
        let mut window = RateLimitWindow::new(options(100, 3, 200));
        let t0 = Instant::now();

        assert!(!window.record_attempt(t0));
        assert!(!window.record_attempt(t0 + Duration::from_millis(10)));
        assert!(!window.record_attempt(t0 + Duration::from_millis(20)));
        assert!(!window.is_suspended(t0 + Duration::from_millis(20)));

        assert!(window.record_attempt(t0 + Duration::from_millis(30)));
        assert!(window.is_suspended(t0 + Duration::from_millis(31)));
    }

    #[test]
    fn suspension_lapses_after_backoff() {
        let mut window = RateLimitWindow::new(options(100, 3, 200));
        let t0 = Instant::now();
        for i in 0..4 {
            window.record_attempt(t0 + Duration::from_millis(i));
        }
        let tripped_at = t0 + Duration::from_millis(3);

        assert!(window.is_suspended(tripped_at + Duration::from_millis(199)));
        assert!(!window.is_suspended(tripped_at + Duration::from_millis(200)));
        assert!(window.suspended_until(tripped_at + Duration::from_millis(200)).is_none());
    }

    #[test]
    fn attempts_older_than_window_are_evicted() {
        let mut window = RateLimitWindow::new(options(100, 3, 200));
        let t0 = Instant::now();

        for i in 0..3 {
            window.record_attempt(t0 + Duration::from_millis(i));
        }
        // The first three have aged out by the time the fourth arrives.
        assert!(!window.record_attempt(t0 + Duration::from_millis(150)));
        assert_eq!(window.attempts_in_window(t0 + Duration::from_millis(150)), 1);
    }

    #[test]
    fn reset_clears_suspension() {
        let mut window = RateLimitWindow::new(options(100, 0, 1_000));
        let t0 = Instant::now();
        assert!(window.record_attempt(t0));
        window.reset();
        assert!(!window.is_suspended(t0));
    }

    #[test]
    fn set_tokens_replaces_and_sorts() {
        let mut manager = SubscriptionManager::default();
        manager.set_tokens([30, 10, 20, 10]);
        assert_eq!(manager.tokens(), vec![10, 20, 30]);

        manager.set_tokens([5]);
        assert_eq!(manager.tokens(), vec![5]);
        assert!(manager.is_pending());
    }

    #[test]
    fn add_tokens_reports_changes() {
        let mut manager = SubscriptionManager::default();
        assert!(manager.add_tokens([1, 2]));
        assert!(!manager.add_tokens([2]));
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn flush_with_empty_set_is_idle() {
        let mut manager = SubscriptionManager::default();
        assert_eq!(manager.flush(Instant::now(), true), FlushDecision::Idle);
        assert!(!manager.is_pending());
    }

    #[test]
    fn flush_defers_when_not_open() {
        let mut manager = SubscriptionManager::default();
        manager.set_tokens([256_265]);

        let decision = manager.flush(Instant::now(), false);
        assert_eq!(decision, FlushDecision::Deferred(DeferReason::NotOpen));
        assert!(manager.is_pending());
        assert_eq!(manager.rate_limit().attempts_in_window(Instant::now()), 0);
    }

    #[test]
    fn flush_sends_full_set_when_open() {
        let mut manager = SubscriptionManager::default();
        manager.set_tokens([2, 1]);

        let decision = manager.flush(Instant::now(), true);
        assert_eq!(decision, FlushDecision::Send(vec![1, 2]));
        assert!(!manager.is_pending());
    }

    #[test]
    fn flush_defers_while_suspended_and_keeps_desired_state() {
        let mut manager = SubscriptionManager::new(options(1_000, 1, 500));
        manager.set_tokens([1]);
        let t0 = Instant::now();

        assert!(matches!(manager.flush(t0, true), FlushDecision::Send(_)));

        // Second flush overflows the window and is withheld.
        let second = manager.flush(t0 + Duration::from_millis(1), true);
        assert!(matches!(
            second,
            FlushDecision::Deferred(DeferReason::Suspended { .. })
        ));

        // Further flushes during the suspension do not record attempts.
        let third = manager.flush(t0 + Duration::from_millis(2), true);
        assert!(matches!(
            third,
            FlushDecision::Deferred(DeferReason::Suspended { .. })
        ));
        assert_eq!(manager.tokens(), vec![1]);
        assert!(manager.is_pending());

        // Once the backoff lapses and the window has drained, sends resume.
        let later = t0 + Duration::from_millis(1_600);
        assert_eq!(manager.flush(later, true), FlushDecision::Send(vec![1]));
    }

    #[test]
    fn withheld_flush_is_not_counted() {
        // Backoff shorter than the window: the retry must wait for the
        // window to drain, not just the backoff.
        let mut manager = SubscriptionManager::new(options(1_000, 1, 200));
        manager.set_tokens([1]);
        let t0 = Instant::now();

        assert!(matches!(manager.flush(t0, true), FlushDecision::Send(_)));
        manager.add_tokens([2]);

        let withheld = manager.flush(t0 + Duration::from_millis(10), true);
        assert_eq!(
            withheld,
            FlushDecision::Deferred(DeferReason::Suspended {
                until: t0 + Duration::from_millis(1_000)
            })
        );
        assert_eq!(
            manager
                .rate_limit()
                .attempts_in_window(t0 + Duration::from_millis(10)),
            1
        );

        // Retrying after the backoff but inside the window is deferred to the
        // same instant without extending it.
        let early = manager.flush(t0 + Duration::from_millis(300), true);
        assert_eq!(
            early,
            FlushDecision::Deferred(DeferReason::Suspended {
                until: t0 + Duration::from_millis(1_000)
            })
        );

        let retry = t0 + Duration::from_millis(1_000);
        assert_eq!(manager.flush(retry, true), FlushDecision::Send(vec![1, 2]));
        assert!(!manager.is_pending());
    }

    #[test]
    fn resume_at_is_none_with_room() {
        let window = RateLimitWindow::new(options(1_000, 2, 200));
        assert!(window.resume_at(Instant::now()).is_none());
    }

    #[test]
    fn clear_drops_pending_state() {
        let mut manager = SubscriptionManager::default();
        manager.set_tokens([1, 2, 3]);
        manager.clear();
        assert!(manager.is_empty());
        assert!(!manager.is_pending());
    }

    #[test]
    fn auto_resubscribe_defaults_on() {
        let mut manager = SubscriptionManager::default();
        assert!(manager.auto_resubscribe());
        manager.set_auto_resubscribe(false);
        assert!(!manager.auto_resubscribe());
    }
}
