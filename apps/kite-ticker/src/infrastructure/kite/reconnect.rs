//! Reconnection Policy
//!
//! Exponential backoff with additive jitter for ticker reconnection:
//! `delay = min(base * 2^attempts + jitter(), max_delay)`.
//!
//! The attempt counter is incremented each time a delay is handed out and
//! only resets on a confirmed open.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

/// Jitter source added to each backoff delay.
pub type JitterFn = Arc<dyn Fn() -> Duration + Send + Sync>;

/// Jitter drawn uniformly from `0..=max`.
#[must_use]
pub fn random_jitter(max: Duration) -> JitterFn {
    let max_millis = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    Arc::new(move || {
        let mut rng = rand::rng();
        Duration::from_millis(rng.random_range(0..=max_millis))
    })
}

/// Jitter that always returns the same duration.
#[must_use]
pub fn fixed_jitter(jitter: Duration) -> JitterFn {
    Arc::new(move || jitter)
}

/// Configuration for reconnection behavior.
#[derive(Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt (before jitter).
    pub base_delay: Duration,
    /// Cap applied after jitter.
    pub max_delay: Duration,
    /// Added to every delay.
    pub jitter: JitterFn,
    /// Maximum number of scheduled attempts per cycle (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: random_jitter(Duration::from_secs(1)),
            max_attempts: 10,
        }
    }
}

impl std::fmt::Debug for ReconnectConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectConfig")
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl ReconnectConfig {
    /// Create a configuration with random jitter of up to one second.
    #[must_use]
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
            ..Self::default()
        }
    }

    /// Replace the jitter source.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterFn) -> Self {
        self.jitter = jitter;
        self
    }

    /// Create configuration from `TickerSettings`.
    #[must_use]
    pub fn from_ticker_settings(settings: &crate::TickerSettings) -> Self {
        Self::new(
            settings.reconnect_base_delay,
            settings.reconnect_max_delay,
            settings.max_reconnect_attempts,
        )
    }
}

/// Reconnection policy implementing exponential backoff with jitter.
///
/// # Example
///
/// ```rust
/// use kite_ticker::infrastructure::kite::reconnect::{
///     ReconnectConfig, ReconnectPolicy, fixed_jitter,
/// };
/// use std::time::Duration;
///
/// let config = ReconnectConfig::new(Duration::from_millis(100), Duration::from_secs(5), 0)
///     .with_jitter(fixed_jitter(Duration::from_millis(5)));
/// let mut policy = ReconnectPolicy::new(config);
///
/// assert_eq!(policy.next_delay(), Some(Duration::from_millis(105)));
/// assert_eq!(policy.next_delay(), Some(Duration::from_millis(205)));
///
/// // Confirmed open
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
        }
    }

    /// Current configuration.
    #[must_use]
    pub const fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Replace the configuration. The attempt count is kept.
    pub fn set_config(&mut self, config: ReconnectConfig) {
        self.config = config;
    }

    /// Get the next delay and count the attempt.
    ///
    /// Returns `None` once the attempt budget is spent.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }

        let delay = self.delay_for(self.attempt_count);
        self.attempt_count += 1;
        Some(delay)
    }

    /// Delay for a given attempt index, ignoring the budget.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
        let backoff = self
            .config
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.config.max_delay);
        backoff
            .saturating_add((self.config.jitter)())
            .min(self.config.max_delay)
    }

    /// Reset the policy after a successful connection.
    pub const fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Get the current attempt count.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Check if reconnection should continue.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }
}
