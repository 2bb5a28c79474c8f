//! Kite REST Client
//!
//! Thin `reqwest` client for the REST endpoints the ticker needs around the
//! socket: session exchange, the instruments dump, quote snapshots and
//! historical candles.
//!
//! Every response is wrapped in an envelope:
//! `{"status":"success","data":...}` or
//! `{"status":"error","error_type":"TokenException","message":"..."}`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::auth::{AuthError, KITE_API_VERSION};
use crate::application::ports::{PortError, Session, SessionApi};
use crate::domain::session::Credentials;

/// Default REST base URL.
pub const DEFAULT_API_URL: &str = "https://api.kite.trade";

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Error Types
// =============================================================================

/// Errors from the REST client.
#[derive(Debug, Clone, Error)]
pub enum RestError {
    /// Transport failure.
    #[error("http error: {0}")]
    Http(String),

    /// The API answered with an error envelope or status.
    #[error("api error ({status}, {error_type}): {message}")]
    Api {
        /// HTTP status.
        status: u16,
        /// Kite exception class.
        error_type: String,
        /// Error message.
        message: String,
    },

    /// The response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Credentials were insufficient for the call.
    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl RestError {
    /// Whether the API rejected the access token.
    #[must_use]
    pub fn is_token_error(&self) -> bool {
        matches!(self, Self::Api { status: 403, .. })
            || matches!(self, Self::Api { error_type, .. } if error_type == "TokenException")
    }
}

impl From<RestError> for PortError {
    fn from(err: RestError) -> Self {
        match err {
            RestError::Http(msg) => Self::Unavailable(msg),
            RestError::Api { .. } | RestError::Auth(_) => Self::Rejected(err.to_string()),
            RestError::Decode(msg) => Self::InvalidResponse(msg),
        }
    }
}

// =============================================================================
// API Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionData {
    access_token: String,
    #[serde(default)]
    user_id: Option<String>,
}

/// Day OHLC in a quote snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
pub struct QuoteOhlc {
    /// Day open.
    pub open: f64,
    /// Day high.
    pub high: f64,
    /// Day low.
    pub low: f64,
    /// Previous close.
    pub close: f64,
}

/// Quote snapshot for one instrument.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Quote {
    /// Instrument token.
    pub instrument_token: u32,
    /// Last traded price.
    pub last_price: f64,
    /// Volume traded today.
    #[serde(default)]
    pub volume: Option<u64>,
    /// Open interest.
    #[serde(default)]
    pub oi: Option<f64>,
    /// Day OHLC.
    #[serde(default)]
    pub ohlc: QuoteOhlc,
}

/// One historical candle.
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    /// Candle open time.
    pub timestamp: DateTime<FixedOffset>,
    /// Open.
    pub open: f64,
    /// High.
    pub high: f64,
    /// Low.
    pub low: f64,
    /// Close.
    pub close: f64,
    /// Volume.
    pub volume: u64,
    /// Open interest, when requested.
    pub oi: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CandleData {
    candles: Vec<Vec<serde_json::Value>>,
}

impl Candle {
    fn from_row(row: &[serde_json::Value]) -> Result<Self, RestError> {
        let field = |i: usize| {
            row.get(i)
                .ok_or_else(|| RestError::Decode(format!("candle row missing column {i}")))
        };
        let number = |i: usize| {
            field(i)?
                .as_f64()
                .ok_or_else(|| RestError::Decode(format!("candle column {i} is not a number")))
        };

        let raw_ts = field(0)?
            .as_str()
            .ok_or_else(|| RestError::Decode("candle timestamp is not a string".to_string()))?;
        let timestamp = DateTime::parse_from_str(raw_ts, "%Y-%m-%dT%H:%M:%S%z")
            .map_err(|e| RestError::Decode(format!("candle timestamp {raw_ts}: {e}")))?;

        Ok(Self {
            timestamp,
            open: number(1)?,
            high: number(2)?,
            low: number(3)?,
            close: number(4)?,
            volume: field(5)?
                .as_u64()
                .ok_or_else(|| RestError::Decode("candle volume is not an integer".to_string()))?,
            oi: row.get(6).and_then(serde_json::Value::as_u64),
        })
    }
}

// =============================================================================
// Client
// =============================================================================

/// REST client for the Kite API.
#[derive(Debug, Clone)]
pub struct KiteRestClient {
    client: Client,
    base_url: String,
}

impl KiteRestClient {
    /// Create a client for the given base URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RestError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RestError::Http(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Base URL without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Exchange a request token for a session.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or an API rejection.
    pub async fn create_session(
        &self,
        api_key: &str,
        request_token: &str,
        checksum: &str,
    ) -> Result<Session, RestError> {
        let request = self
            .client
            .post(format!("{}/session/token", self.base_url))
            .header("X-Kite-Version", KITE_API_VERSION)
            .form(&[
                ("api_key", api_key),
                ("request_token", request_token),
                ("checksum", checksum),
            ]);

        let data: SessionData = self.send_json(request).await?;
        tracing::info!(user_id = ?data.user_id, "Kite session created");
        Ok(Session {
            access_token: data.access_token,
            user_id: data.user_id,
        })
    }

    /// Download the instruments dump as CSV text.
    ///
    /// # Errors
    ///
    /// Returns an error if credentials are incomplete or the request fails.
    pub async fn instruments_csv(&self, credentials: &Credentials) -> Result<String, RestError> {
        let request = self.authorized(
            self.client.get(format!("{}/instruments", self.base_url)),
            credentials,
        )?;
        let response = Self::check(request.send().await.map_err(http_error)?).await?;
        response.text().await.map_err(http_error)
    }

    /// Quote snapshots keyed by `EXCHANGE:SYMBOL`.
    ///
    /// # Errors
    ///
    /// Returns an error if credentials are incomplete or the request fails.
    pub async fn quote(
        &self,
        credentials: &Credentials,
        instruments: &[&str],
    ) -> Result<HashMap<String, Quote>, RestError> {
        let query: Vec<(&str, &str)> = instruments.iter().map(|i| ("i", *i)).collect();
        let request = self.authorized(
            self.client
                .get(format!("{}/quote", self.base_url))
                .query(&query),
            credentials,
        )?;
        self.send_json(request).await
    }

    /// Historical candles for an instrument.
    ///
    /// `interval` is a Kite interval name such as `minute` or `day`.
    ///
    /// # Errors
    ///
    /// Returns an error if credentials are incomplete, the request fails or a
    /// candle row is malformed.
    pub async fn historical(
        &self,
        credentials: &Credentials,
        instrument_token: u32,
        interval: &str,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<Candle>, RestError> {
        let from = from.format("%Y-%m-%d %H:%M:%S").to_string();
        let to = to.format("%Y-%m-%d %H:%M:%S").to_string();
        let request = self.authorized(
            self.client
                .get(format!(
                    "{}/instruments/historical/{instrument_token}/{interval}",
                    self.base_url
                ))
                .query(&[("from", from.as_str()), ("to", to.as_str())]),
            credentials,
        )?;

        let data: CandleData = self.send_json(request).await?;
        data.candles.iter().map(|row| Candle::from_row(row)).collect()
    }

    fn authorized(
        &self,
        request: RequestBuilder,
        credentials: &Credentials,
    ) -> Result<RequestBuilder, RestError> {
        if !credentials.has_api_key() {
            return Err(AuthError::MissingApiKey.into());
        }
        let token = credentials
            .access_token()
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingAccessToken)?;

        Ok(request
            .header("X-Kite-Version", KITE_API_VERSION)
            .header(
                "Authorization",
                format!("token {}:{token}", credentials.api_key()),
            ))
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, RestError> {
        let response = Self::check(request.send().await.map_err(http_error)?).await?;
        let body = response.text().await.map_err(http_error)?;
        let envelope: Envelope<T> =
            serde_json::from_str(&body).map_err(|e| RestError::Decode(e.to_string()))?;
        envelope
            .data
            .ok_or_else(|| RestError::Decode("response has no data".to_string()))
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, RestError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let envelope: ErrorEnvelope = serde_json::from_str(&body).unwrap_or_default();
        let err = RestError::Api {
            status: status.as_u16(),
            error_type: envelope
                .error_type
                .unwrap_or_else(|| default_error_type(status).to_string()),
            message: envelope.message.unwrap_or(body),
        };
        tracing::warn!(error = %err, "Kite API request failed");
        Err(err)
    }
}

fn http_error(err: reqwest::Error) -> RestError {
    RestError::Http(err.to_string())
}

const fn default_error_type(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "InputException",
        403 => "TokenException",
        429 => "NetworkException",
        _ => "GeneralException",
    }
}

#[async_trait]
impl SessionApi for KiteRestClient {
    async fn create_session(
        &self,
        api_key: &str,
        request_token: &str,
        checksum: &str,
    ) -> Result<Session, PortError> {
        Ok(Self::create_session(self, api_key, request_token, checksum).await?)
    }
}
