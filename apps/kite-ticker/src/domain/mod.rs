//! Domain Layer - Core ticker types and business logic.
//!
//! This layer contains the core domain types for market data streaming
//! with no I/O. Time is passed in explicitly where rules depend on it.

/// Session credentials and connection state.
pub mod session;

/// Market data tick types (ltp, quote, full).
pub mod streaming;

/// Desired subscription set and subscribe rate limiting.
pub mod subscription;
