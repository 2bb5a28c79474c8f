//! Heartbeat Monitor
//!
//! Tracks the time since the last inbound frame and reports a stale
//! connection. The monitor never reconnects; it asks the connection task to
//! close the socket and the close path owns the reconnect decision.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between liveness checks.
    pub check_interval: Duration,
    /// Silence longer than this marks the connection stale.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(30),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(check_interval: Duration, timeout: Duration) -> Self {
        Self {
            check_interval,
            timeout,
        }
    }

    /// Create configuration from `TickerSettings`.
    #[must_use]
    pub const fn from_ticker_settings(settings: &crate::TickerSettings) -> Self {
        Self {
            check_interval: settings.heartbeat_interval,
            timeout: settings.heartbeat_timeout,
        }
    }
}

/// Events emitted by the heartbeat monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// No frame arrived within the timeout; close the socket.
    Stale {
        /// Silence observed at the check.
        elapsed: Duration,
    },
}

/// Last-inbound-frame timestamps shared between the socket reader and the
/// monitor.
#[derive(Debug, Default)]
pub struct HeartbeatState {
    last_message: RwLock<Option<(Instant, DateTime<Utc>)>>,
}

impl HeartbeatState {
    /// Create empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an inbound frame.
    pub fn touch(&self) {
        *self.last_message.write() = Some((Instant::now(), Utc::now()));
    }

    /// Monotonic time of the last inbound frame.
    #[must_use]
    pub fn last_message(&self) -> Option<Instant> {
        self.last_message.read().map(|(at, _)| at)
    }

    /// Wall-clock time of the last inbound frame.
    #[must_use]
    pub fn last_message_at(&self) -> Option<DateTime<Utc>> {
        self.last_message.read().map(|(_, at)| at)
    }

    /// Time since the last inbound frame, if any arrived.
    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        self.last_message().map(|at| at.elapsed())
    }

    /// Forget the last frame.
    pub fn clear(&self) {
        *self.last_message.write() = None;
    }
}

/// Heartbeat monitor for one connection.
///
/// # Example
///
/// ```rust,no_run
/// use kite_ticker::infrastructure::kite::heartbeat::{
///     HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState,
/// };
/// use std::sync::Arc;
/// use tokio::sync::mpsc;
/// use tokio_util::sync::CancellationToken;
///
/// async fn example() {
///     let state = Arc::new(HeartbeatState::new());
///     let (event_tx, mut event_rx) = mpsc::channel(1);
///     let cancel = CancellationToken::new();
///
///     let manager =
///         HeartbeatManager::new(HeartbeatConfig::default(), state.clone(), event_tx, cancel);
///     tokio::spawn(manager.run());
///
///     // Socket reader calls `state.touch()` for every frame.
///     if let Some(HeartbeatEvent::Stale { .. }) = event_rx.recv().await {
///         // Close the socket.
///     }
/// }
/// ```
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a new heartbeat manager.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run the liveness loop until cancelled or the connection goes stale.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.config.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat monitor cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if let Some(elapsed) = self.check() {
                        tracing::warn!(
                            elapsed_ms = elapsed.as_millis(),
                            timeout_ms = self.config.timeout.as_millis(),
                            "Heartbeat timeout detected, closing socket"
                        );
                        crate::infrastructure::metrics::record_heartbeat_timeout();
                        let _ = self.event_tx.send(HeartbeatEvent::Stale { elapsed }).await;
                        break;
                    }
                }
            }
        }
    }

    /// Silence duration when it exceeds the timeout.
    fn check(&self) -> Option<Duration> {
        self.state
            .elapsed()
            .filter(|elapsed| *elapsed > self.config.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.check_interval, Duration::from_secs(30));
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn state_starts_empty() {
        let state = HeartbeatState::new();
        assert!(state.last_message().is_none());
        assert!(state.elapsed().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn touch_records_time() {
        let state = HeartbeatState::new();
        state.touch();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(state.elapsed(), Some(Duration::from_secs(3)));
        assert!(state.last_message_at().is_some());

        state.clear();
        assert!(state.last_message().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_connection_is_reported() {
        let config = HeartbeatConfig::new(Duration::from_secs(1), Duration::from_secs(2));
        let state = Arc::new(HeartbeatState::new());
        state.touch();
        let (event_tx, mut event_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            HeartbeatManager::new(config, state.clone(), event_tx, cancel.clone()).run(),
        );

        let event = event_rx.recv().await.expect("stale event");
        let HeartbeatEvent::Stale { elapsed } = event;
        assert!(elapsed > Duration::from_secs(2));

        // Monitor exits after reporting.
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn live_connection_is_not_reported() {
        let config = HeartbeatConfig::new(Duration::from_secs(1), Duration::from_secs(2));
        let state = Arc::new(HeartbeatState::new());
        state.touch();
        let (event_tx, mut event_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            HeartbeatManager::new(config, state.clone(), event_tx, cancel.clone()).run(),
        );

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(500)).await;
            state.touch();
        }
        assert!(event_rx.try_recv().is_err());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn manager_cancellation() {
        let config = HeartbeatConfig::new(Duration::from_secs(10), Duration::from_secs(10));
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, _event_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(HeartbeatManager::new(config, state, event_tx, cancel.clone()).run());
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_millis(100), handle).await;
        assert!(result.is_ok(), "monitor should shut down on cancellation");
    }
}
