//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Kite ticker WebSocket client and REST adapters.
pub mod kite;

/// Broadcast channels for ticks and client events.
pub mod broadcast;

/// Latest-tick cache keyed by symbol.
pub mod cache;

/// Configuration loaded from the environment.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Instruments dump parsing and symbol resolution.
pub mod instruments;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
