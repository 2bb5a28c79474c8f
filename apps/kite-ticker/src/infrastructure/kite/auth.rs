//! Kite Authentication
//!
//! Login URL construction, session checksum signing and environment-backed
//! credentials.
//!
//! # Login Flow
//!
//! 1. Send the user to [`login_url`]
//! 2. The broker redirects back with a `request_token`
//! 3. Exchange it through `SessionApi` with checksum
//!    `sha256(api_key + request_token + api_secret)`
//! 4. The returned access token authenticates the ticker socket via the
//!    `api_key` and `access_token` query parameters

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::application::ports::{CredentialProvider, PortError, RequestSigner};
use crate::domain::session::Credentials;

// =============================================================================
// Constants
// =============================================================================

/// Default ticker endpoint.
pub const DEFAULT_WS_URL: &str = "wss://ws.kite.trade";

/// Default login endpoint.
pub const DEFAULT_LOGIN_URL: &str = "https://kite.zerodha.com/connect/login";

/// Login API version.
pub const KITE_API_VERSION: &str = "3";

// =============================================================================
// Error Types
// =============================================================================

/// Errors raised while preparing authentication material.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// API key is missing.
    #[error("missing api key")]
    MissingApiKey,

    /// API secret is missing.
    #[error("missing api secret")]
    MissingApiSecret,

    /// Access token is missing.
    #[error("missing access token")]
    MissingAccessToken,

    /// Request token is empty.
    #[error("missing request token")]
    MissingRequestToken,

    /// Base URL could not be used.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// No session exchange collaborator is configured.
    #[error("no session api configured")]
    MissingSessionApi,
}

// =============================================================================
// URLs
// =============================================================================

/// Login URL for the given credentials.
///
/// # Errors
///
/// Returns [`AuthError::MissingApiKey`] when no API key is set.
pub fn login_url(credentials: &Credentials) -> Result<String, AuthError> {
    if !credentials.has_api_key() {
        return Err(AuthError::MissingApiKey);
    }
    Ok(format!(
        "{DEFAULT_LOGIN_URL}?v={KITE_API_VERSION}&api_key={}",
        credentials.api_key()
    ))
}

/// Ticker URL carrying the API key and access token.
///
/// # Errors
///
/// Returns an error when the key or token is missing or the base URL is
/// empty.
pub fn authenticated_ws_url(base: &str, credentials: &Credentials) -> Result<String, AuthError> {
    if base.trim().is_empty() {
        return Err(AuthError::InvalidUrl("empty ticker url".to_string()));
    }
    if !credentials.has_api_key() {
        return Err(AuthError::MissingApiKey);
    }
    let token = credentials
        .access_token()
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::MissingAccessToken)?;

    let separator = if base.contains('?') { '&' } else { '?' };
    Ok(format!(
        "{base}{separator}api_key={}&access_token={token}",
        credentials.api_key()
    ))
}

// =============================================================================
// Checksum Signer
// =============================================================================

/// SHA-256 session checksum: hex of `sha256(api_key + request_token + api_secret)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Signer;

impl RequestSigner for Sha256Signer {
    fn checksum(&self, api_key: &str, request_token: &str, api_secret: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(api_key.as_bytes());
        hasher.update(request_token.as_bytes());
        hasher.update(api_secret.as_bytes());
        hex::encode(hasher.finalize())
    }
}

// =============================================================================
// Environment Credentials
// =============================================================================

/// Loads credentials from `KITE_API_KEY`, `KITE_API_SECRET`,
/// `KITE_ACCESS_TOKEN` and `KITE_TOKEN_EXPIRES_IN_SECS`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentialProvider;

impl EnvCredentialProvider {
    /// Build credentials from an environment lookup.
    ///
    /// Returns `None` when no API key is configured.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        now: DateTime<Utc>,
    ) -> Option<Credentials> {
        let api_key = lookup("KITE_API_KEY").filter(|v| !v.is_empty())?;
        let api_secret = lookup("KITE_API_SECRET").unwrap_or_default();

        let mut credentials = Credentials::new(api_key, api_secret);
        if let Some(token) = lookup("KITE_ACCESS_TOKEN").filter(|v| !v.is_empty()) {
            credentials.set_access_token(token);
        }
        let expires_at = lookup("KITE_TOKEN_EXPIRES_IN_SECS")
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(TimeDelta::try_seconds)
            .map(|lifetime| now + lifetime);
        credentials.set_token_expires_at(expires_at);

        Some(credentials)
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn load(&self) -> Result<Option<Credentials>, PortError> {
        Ok(Self::from_lookup(|k| std::env::var(k).ok(), Utc::now()))
    }
}
