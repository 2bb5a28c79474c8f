//! Tick Publisher
//!
//! Fan-out of decoded ticks and client lifecycle events over tokio broadcast
//! channels.
//!
//! # Architecture
//!
//! The `TickPublisher` owns two channels:
//! - `ticks`: every decoded [`Tick`], in receive order
//! - `events`: connection and token lifecycle [`ClientEvent`]s
//!
//! Publishing never blocks. A send with no receivers is not an error; a
//! lagging receiver loses the oldest messages.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::TickerSettings;
use crate::domain::streaming::Tick;

// =============================================================================
// Events
// =============================================================================

/// Lifecycle events emitted by a ticker client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Socket opened.
    Connected,
    /// Socket closed.
    Disconnected,
    /// A reconnect was scheduled.
    Reconnecting {
        /// Attempt number within the current cycle, starting at 1.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// The reconnect budget ran out; no further attempts are scheduled.
    ReconnectExhausted {
        /// Attempts made in the cycle.
        attempts: u32,
    },
    /// The access token is about to expire; a refresh is starting.
    TokenAboutToExpire,
    /// The token could not be refreshed automatically.
    TokenRefreshRequired,
}

impl ClientEvent {
    /// Event name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::ReconnectExhausted { .. } => "reconnect_exhausted",
            Self::TokenAboutToExpire => "token_about_to_expire",
            Self::TokenRefreshRequired => "token_refresh_required",
        }
    }
}

// =============================================================================
// Publisher
// =============================================================================

/// Configuration for broadcast channel capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastConfig {
    /// Capacity for the tick channel.
    pub ticks_capacity: usize,
    /// Capacity for the event channel.
    pub events_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            ticks_capacity: 10_000,
            events_capacity: 256,
        }
    }
}

impl From<&TickerSettings> for BroadcastConfig {
    fn from(settings: &TickerSettings) -> Self {
        Self {
            ticks_capacity: settings.tick_capacity,
            ..Self::default()
        }
    }
}

/// Broadcast channels for ticks and client events.
///
/// # Example
///
/// ```rust
/// use kite_ticker::infrastructure::broadcast::{BroadcastConfig, ClientEvent, TickPublisher};
///
/// let publisher = TickPublisher::new(BroadcastConfig::default());
/// let mut events = publisher.events_rx();
///
/// assert_eq!(publisher.send_event(ClientEvent::Connected), Some(1));
/// assert_eq!(events.try_recv().unwrap(), ClientEvent::Connected);
/// ```
#[derive(Debug)]
#[allow(clippy::struct_field_names)]
pub struct TickPublisher {
    ticks_tx: broadcast::Sender<Tick>,
    events_tx: broadcast::Sender<ClientEvent>,
}

impl Default for TickPublisher {
    fn default() -> Self {
        Self::new(BroadcastConfig::default())
    }
}

impl TickPublisher {
    /// Create a new publisher with the given configuration.
    #[must_use]
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            ticks_tx: broadcast::channel(config.ticks_capacity.max(1)).0,
            events_tx: broadcast::channel(config.events_capacity.max(1)).0,
        }
    }

    /// Publish a tick.
    ///
    /// Returns the number of receivers, or `None` if nobody is listening.
    pub fn send_tick(&self, tick: Tick) -> Option<usize> {
        self.ticks_tx.send(tick).ok()
    }

    /// Publish a lifecycle event.
    ///
    /// Returns the number of receivers, or `None` if nobody is listening.
    pub fn send_event(&self, event: ClientEvent) -> Option<usize> {
        tracing::debug!(event = event.name(), "Client event");
        self.events_tx.send(event).ok()
    }

    /// Get a new tick receiver.
    #[must_use]
    pub fn ticks_rx(&self) -> broadcast::Receiver<Tick> {
        self.ticks_tx.subscribe()
    }

    /// Get a new event receiver.
    #[must_use]
    pub fn events_rx(&self) -> broadcast::Receiver<ClientEvent> {
        self.events_tx.subscribe()
    }

    /// Receiver counts for both channels.
    #[must_use]
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            tick_receivers: self.ticks_tx.receiver_count(),
            event_receivers: self.events_tx.receiver_count(),
        }
    }
}

/// Shared publisher reference.
pub type SharedTickPublisher = Arc<TickPublisher>;

/// Statistics about broadcast channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Number of tick receivers.
    pub tick_receivers: usize,
    /// Number of event receivers.
    pub event_receivers: usize,
}

impl BroadcastStats {
    /// Total receivers across both channels.
    #[must_use]
    pub const fn total_receivers(&self) -> usize {
        self.tick_receivers + self.event_receivers
    }
}

// =============================================================================
// Tests
// =============================================================================
