//! Session Types
//!
//! API credentials for the ticker gateway and the connection state of a
//! ticker client.

use chrono::{DateTime, Utc};

// =============================================================================
// Credentials
// =============================================================================

/// Kite API credentials.
///
/// The access token is absent until a login completes or a credential
/// provider supplies one. `Debug` redacts the secret and the token.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    api_key: String,
    api_secret: String,
    access_token: Option<String>,
    token_expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    /// Create credentials without an access token.
    #[must_use]
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            access_token: None,
            token_expires_at: None,
        }
    }

    /// Attach an access token.
    #[must_use]
    pub fn with_access_token(mut self, access_token: impl Into<String>) -> Self {
        self.access_token = Some(access_token.into());
        self
    }

    /// Attach the wall-clock expiry of the access token.
    #[must_use]
    pub const fn with_token_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.token_expires_at = Some(expires_at);
        self
    }

    /// API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// API secret.
    #[must_use]
    pub fn api_secret(&self) -> &str {
        &self.api_secret
    }

    /// Access token, if one is held.
    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    /// Wall-clock expiry of the access token, if known.
    #[must_use]
    pub const fn token_expires_at(&self) -> Option<DateTime<Utc>> {
        self.token_expires_at
    }

    /// Whether an API key is present.
    #[must_use]
    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// Whether an API secret is present.
    #[must_use]
    pub fn has_api_secret(&self) -> bool {
        !self.api_secret.is_empty()
    }

    /// Whether a non-empty access token is present.
    #[must_use]
    pub fn has_access_token(&self) -> bool {
        self.access_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Replace the access token.
    pub fn set_access_token(&mut self, access_token: impl Into<String>) {
        self.access_token = Some(access_token.into());
    }

    /// Replace the token expiry.
    pub const fn set_token_expires_at(&mut self, expires_at: Option<DateTime<Utc>>) {
        self.token_expires_at = expires_at;
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"[REDACTED]")
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("token_expires_at", &self.token_expires_at)
            .finish()
    }
}

// =============================================================================
// Connection State
// =============================================================================

/// Socket state of a ticker client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No socket.
    #[default]
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Socket open and receiving.
    Open,
    /// Close requested, waiting for the socket to end.
    Closing,
}

impl ConnectionState {
    /// Whether the socket is open.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Coarse socket state: `"OPEN"` or `"CLOSED"`.
    #[must_use]
    pub const fn as_ws_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Disconnected | Self::Connecting | Self::Closing => "CLOSED",
        }
    }

    /// State name for logs and health output.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_secret_and_token() {
        let creds = Credentials::new("key123", "supersecret").with_access_token("tok-abc");
        let debug = format!("{creds:?}");
        assert!(debug.contains("key123"));
        assert!(!debug.contains("supersecret"));
        assert!(!debug.contains("tok-abc"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn access_token_presence() {
        let mut creds = Credentials::new("k", "s");
        assert!(!creds.has_access_token());

        creds.set_access_token("");
        assert!(!creds.has_access_token());

        creds.set_access_token("t");
        assert!(creds.has_access_token());
        assert_eq!(creds.access_token(), Some("t"));
    }

    #[test]
    fn ws_state_is_coarse() {
        assert_eq!(ConnectionState::Open.as_ws_str(), "OPEN");
        assert_eq!(ConnectionState::Connecting.as_ws_str(), "CLOSED");
        assert_eq!(ConnectionState::Closing.as_ws_str(), "CLOSED");
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }
}
