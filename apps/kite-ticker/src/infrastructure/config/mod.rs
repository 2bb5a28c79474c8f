//! Configuration Module
//!
//! Configuration loading for the ticker service.

mod settings;

pub use settings::{ConfigError, ServerSettings, TickerConfig, TickerSettings};
