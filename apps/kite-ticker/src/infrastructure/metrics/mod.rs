//! Prometheus Metrics Module
//!
//! Exposes ticker metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Ticks**: Decoded ticks by mode and dropped frames
//! - **Subscriptions**: Subscribe frames sent and deferred
//! - **Connection**: Socket state, reconnects and heartbeat timeouts
//! - **Token**: Refresh outcomes
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! without an installed recorder is a no-op.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::streaming::TickMode;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Repeated calls return the handle installed by the first call.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!("kite_ticker_ticks_total", "Ticks decoded by mode");
    describe_counter!(
        "kite_ticker_frames_dropped_total",
        "Binary frames that decoded to no tick"
    );
    describe_counter!(
        "kite_ticker_subscribe_sent_total",
        "Subscribe frames written to the socket"
    );
    describe_counter!(
        "kite_ticker_subscribe_deferred_total",
        "Subscribe flushes deferred by reason"
    );
    describe_counter!(
        "kite_ticker_reconnects_total",
        "Reconnect attempts scheduled"
    );
    describe_counter!(
        "kite_ticker_reconnect_exhausted_total",
        "Reconnect cycles that ran out of attempts"
    );
    describe_counter!(
        "kite_ticker_heartbeat_timeouts_total",
        "Sockets closed for silence"
    );
    describe_counter!(
        "kite_ticker_token_refresh_total",
        "Token refresh outcomes"
    );
    describe_gauge!(
        "kite_ticker_connected",
        "1 while the ticker socket is open"
    );
    describe_gauge!(
        "kite_ticker_subscriptions",
        "Desired instrument subscriptions"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Reason a subscribe flush was deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// Socket not open.
    NotOpen,
    /// Rate limit suspension.
    RateLimited,
}

impl DeferReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::NotOpen => "not_open",
            Self::RateLimited => "rate_limited",
        }
    }
}

/// Outcome of a token refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Handler supplied a new token.
    Refreshed,
    /// Outside intervention required.
    Required,
    /// Handler failed.
    Failed,
}

impl RefreshOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Refreshed => "refreshed",
            Self::Required => "required",
            Self::Failed => "failed",
        }
    }
}

/// Record a decoded tick.
pub fn record_tick(mode: TickMode) {
    counter!("kite_ticker_ticks_total", "mode" => mode.as_str()).increment(1);
}

/// Record a dropped binary frame.
pub fn record_frame_dropped() {
    counter!("kite_ticker_frames_dropped_total").increment(1);
}

/// Record a subscribe frame written.
pub fn record_subscribe_sent(tokens: usize) {
    counter!("kite_ticker_subscribe_sent_total").increment(1);
    #[allow(clippy::cast_precision_loss)]
    gauge!("kite_ticker_subscriptions").set(tokens as f64);
}

/// Record a deferred subscribe flush.
pub fn record_subscribe_deferred(reason: DeferReason) {
    counter!("kite_ticker_subscribe_deferred_total", "reason" => reason.as_str()).increment(1);
}

/// Record a scheduled reconnect attempt.
pub fn record_reconnect() {
    counter!("kite_ticker_reconnects_total").increment(1);
}

/// Record an exhausted reconnect cycle.
pub fn record_reconnect_exhausted() {
    counter!("kite_ticker_reconnect_exhausted_total").increment(1);
}

/// Record a heartbeat timeout.
pub fn record_heartbeat_timeout() {
    counter!("kite_ticker_heartbeat_timeouts_total").increment(1);
}

/// Record a token refresh outcome.
pub fn record_token_refresh(outcome: RefreshOutcome) {
    counter!("kite_ticker_token_refresh_total", "outcome" => outcome.as_str()).increment(1);
}

/// Update the connection gauge.
pub fn set_connected(connected: bool) {
    gauge!("kite_ticker_connected").set(if connected { 1.0 } else { 0.0 });
}

// =============================================================================
// Tests
// =============================================================================
