#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Kite Ticker - Market Data Streaming Client
//!
//! Maintains a single authenticated WebSocket connection to the Kite ticker
//! gateway, decodes the binary tick protocol and fans ticks out to any
//! number of in-process consumers.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core types with no I/O
//!   - `session`: Credentials and connection state
//!   - `streaming`: Tick types (ltp, quote, full)
//!   - `subscription`: Desired token set and subscribe rate limiting
//!
//! - **Application**: Port definitions
//!   - `ports`: Credential provider, token refresh, session exchange,
//!     checksum signing, symbol lookup
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `kite`: Ticker client, binary codec, REST client
//!   - `broadcast`: Tick and event channels
//!   - `instruments`: Instruments dump and symbol resolution
//!   - `cache`: Latest tick per symbol
//!   - `config`: Configuration from the environment
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//!                    ┌──────────────┐     ┌─────────────┐
//! Kite ticker WS ───►│ TickerClient │────►│  Broadcast  │──► Consumer 1
//!   (binary)         │  (decode)    │     │  Channels   │──► Tick cache
//!                    └──────────────┘     └─────────────┘──► Consumer N
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core ticker types with no external dependencies.
pub mod domain;

/// Application layer - Port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::session::{ConnectionState, Credentials};
pub use domain::streaming::{Tick, TickMode};
pub use domain::subscription::{InstrumentToken, RateLimitOptions, SubscriptionManager};

// Ports
pub use application::ports::{
    CredentialProvider, FnRefreshHandler, PortError, RefreshedToken, RequestSigner, Session,
    SessionApi, SymbolResolver, TokenRefreshHandler,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, ServerSettings, TickerConfig, TickerSettings};

// Ticker client
pub use infrastructure::kite::{
    ClientError, ReconnectConfig, TickerClient, TickerClientBuilder, client::ClientStatus,
};

// Broadcast
pub use infrastructure::broadcast::{
    BroadcastConfig, BroadcastStats, ClientEvent, SharedTickPublisher, TickPublisher,
};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
