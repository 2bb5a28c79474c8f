//! Ticker Configuration Settings
//!
//! Configuration types for the ticker service, loaded from environment
//! variables. Credentials are not part of this configuration; they come from
//! a `CredentialProvider`.

use std::path::PathBuf;
use std::time::Duration;

use crate::infrastructure::kite::auth::DEFAULT_WS_URL;
use crate::infrastructure::kite::codec::FrameMode;
use crate::infrastructure::kite::rest::DEFAULT_API_URL;
use crate::infrastructure::kite::token::DEFAULT_REFRESH_BEFORE;

/// Ticker client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickerSettings {
    /// Interval between liveness checks.
    pub heartbeat_interval: Duration,
    /// Silence before the socket is considered dead.
    pub heartbeat_timeout: Duration,
    /// Reconnect backoff base.
    pub reconnect_base_delay: Duration,
    /// Reconnect backoff cap.
    pub reconnect_max_delay: Duration,
    /// Reconnect attempts per cycle before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Subscribe rate limit window.
    pub rate_limit_window: Duration,
    /// Subscribe sends allowed per window.
    pub rate_limit_max: usize,
    /// Suspension after the window overflows.
    pub rate_limit_backoff: Duration,
    /// Lead time before token expiry at which a refresh starts.
    pub refresh_before: Duration,
    /// Packets surfaced per binary frame.
    pub frame_mode: FrameMode,
    /// Capacity of the tick broadcast channel.
    pub tick_capacity: usize,
}

impl Default for TickerSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(30),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            rate_limit_window: Duration::from_secs(1),
            rate_limit_max: 10,
            rate_limit_backoff: Duration::from_secs(5),
            refresh_before: DEFAULT_REFRESH_BEFORE,
            frame_mode: FrameMode::FirstPacket,
            tick_capacity: 10_000,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Health check HTTP port (0 = disabled).
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete ticker service configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickerConfig {
    /// Ticker WebSocket endpoint.
    pub ws_url: String,
    /// REST API base URL.
    pub api_url: String,
    /// Local instruments dump; fetched from the API when absent.
    pub instruments_csv: Option<PathBuf>,
    /// Instrument tokens to subscribe at startup.
    pub tokens: Vec<u32>,
    /// Ticker client settings.
    pub ticker: TickerSettings,
    /// Server port settings.
    pub server: ServerSettings,
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            instruments_csv: None,
            tokens: Vec::new(),
            ticker: TickerSettings::default(),
            server: ServerSettings::default(),
        }
    }
}

impl TickerConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `KITE_TOKENS` or `TICKER_FRAME_MODE` is malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable lookup.
    ///
    /// Unset or unparseable numeric values fall back to defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if `KITE_TOKENS` or `TICKER_FRAME_MODE` is malformed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);
        let defaults = TickerSettings::default();

        let tokens = match env.string("KITE_TOKENS") {
            Some(raw) => parse_tokens(&raw)?,
            None => Vec::new(),
        };

        let frame_mode = match env.string("TICKER_FRAME_MODE") {
            Some(raw) => FrameMode::parse(&raw).ok_or_else(|| ConfigError::InvalidValue {
                key: "TICKER_FRAME_MODE".to_string(),
                value: raw,
            })?,
            None => defaults.frame_mode,
        };

        let ticker = TickerSettings {
            heartbeat_interval: env.duration_secs(
                "TICKER_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval,
            ),
            heartbeat_timeout: env
                .duration_secs("TICKER_HEARTBEAT_TIMEOUT_SECS", defaults.heartbeat_timeout),
            reconnect_base_delay: env
                .duration_millis("TICKER_RECONNECT_BASE_MS", defaults.reconnect_base_delay),
            reconnect_max_delay: env
                .duration_millis("TICKER_RECONNECT_MAX_MS", defaults.reconnect_max_delay),
            max_reconnect_attempts: env.parse(
                "TICKER_RECONNECT_MAX_ATTEMPTS",
                defaults.max_reconnect_attempts,
            ),
            rate_limit_window: env
                .duration_millis("TICKER_RATE_LIMIT_WINDOW_MS", defaults.rate_limit_window),
            rate_limit_max: env.parse("TICKER_RATE_LIMIT_MAX", defaults.rate_limit_max),
            rate_limit_backoff: env
                .duration_millis("TICKER_RATE_LIMIT_BACKOFF_MS", defaults.rate_limit_backoff),
            refresh_before: env.duration_secs("TICKER_REFRESH_BEFORE_SECS", defaults.refresh_before),
            frame_mode,
            tick_capacity: env.parse("TICKER_TICK_CAPACITY", defaults.tick_capacity),
        };

        Ok(Self {
            ws_url: env
                .string("KITE_WS_URL")
                .unwrap_or_else(|| DEFAULT_WS_URL.to_string()),
            api_url: env
                .string("KITE_API_URL")
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            instruments_csv: env.string("KITE_INSTRUMENTS_CSV").map(PathBuf::from),
            tokens,
            ticker,
            server: ServerSettings {
                health_port: env.parse("TICKER_HEALTH_PORT", ServerSettings::default().health_port),
            },
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has a value that cannot be used.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
}

fn parse_tokens(raw: &str) -> Result<Vec<u32>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>().map_err(|_| ConfigError::InvalidValue {
                key: "KITE_TOKENS".to_string(),
                value: s.to_string(),
            })
        })
        .collect()
}

/// Variable lookup with typed fallbacks.
struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.string(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Duration {
        self.string(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Duration {
        self.string(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}
