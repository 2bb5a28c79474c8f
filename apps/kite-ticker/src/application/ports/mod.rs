//! Port Interfaces
//!
//! Contracts for the collaborators a ticker client consumes. Infrastructure
//! adapters (env credentials, the REST session API, the instrument table)
//! implement them; embedding applications can supply their own.
//!
//! ## Driven Ports (Outbound)
//!
//! - `CredentialProvider`: loads persisted credentials
//! - `TokenRefreshHandler`: obtains a fresh access token before expiry
//! - `RequestSigner`: computes the session checksum
//! - `SessionApi`: exchanges a request token for an access token
//! - `SymbolResolver`: maps instrument tokens to trading symbols

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::session::Credentials;

// =============================================================================
// Errors
// =============================================================================

/// Error returned by a port implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    /// The collaborator could not be reached.
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    /// The collaborator refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The collaborator answered with something unusable.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

// =============================================================================
// Credentials
// =============================================================================

/// Source of persisted credentials.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Load credentials, or `None` when nothing is stored.
    async fn load(&self) -> Result<Option<Credentials>, PortError>;
}

// =============================================================================
// Token Refresh
// =============================================================================

/// A replacement access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshedToken {
    /// New access token.
    pub access_token: String,
    /// Lifetime of the new token from now. `None` leaves the expiry unknown
    /// and no further refresh is scheduled.
    pub expires_in: Option<Duration>,
}

impl RefreshedToken {
    /// Token with a known lifetime.
    #[must_use]
    pub fn new(access_token: impl Into<String>, expires_in: Duration) -> Self {
        Self {
            access_token: access_token.into(),
            expires_in: Some(expires_in),
        }
    }

    /// Token with no expiry information.
    #[must_use]
    pub fn without_expiry(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_in: None,
        }
    }
}

/// Obtains a fresh access token ahead of expiry.
///
/// `Ok(None)` means the handler could not refresh on its own; the client
/// then signals that outside intervention is required.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenRefreshHandler: Send + Sync {
    /// Refresh the token for the given credentials.
    async fn refresh(&self, current: &Credentials) -> Result<Option<RefreshedToken>, PortError>;
}

/// Adapts an async closure into a [`TokenRefreshHandler`].
pub struct FnRefreshHandler<F>(F);

impl<F> FnRefreshHandler<F> {
    /// Wrap a closure.
    pub const fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> std::fmt::Debug for FnRefreshHandler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnRefreshHandler")
    }
}

#[async_trait]
impl<F, Fut> TokenRefreshHandler for FnRefreshHandler<F>
where
    F: Fn(Credentials) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<RefreshedToken>, PortError>> + Send,
{
    async fn refresh(&self, current: &Credentials) -> Result<Option<RefreshedToken>, PortError> {
        (self.0)(current.clone()).await
    }
}

// =============================================================================
// Session Exchange
// =============================================================================

/// Computes the checksum sent with a session exchange.
#[cfg_attr(test, mockall::automock)]
pub trait RequestSigner: Send + Sync {
    /// Checksum over the key, the request token and the secret.
    fn checksum(&self, api_key: &str, request_token: &str, api_secret: &str) -> String;
}

/// Session established by a request token exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Access token for the API and the ticker.
    pub access_token: String,
    /// Account the session belongs to.
    pub user_id: Option<String>,
}

/// Exchanges a login request token for an access token.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// Create a session.
    async fn create_session(
        &self,
        api_key: &str,
        request_token: &str,
        checksum: &str,
    ) -> Result<Session, PortError>;
}

// =============================================================================
// Symbol Lookup
// =============================================================================

/// Maps instrument tokens to trading symbols.
pub trait SymbolResolver: Send + Sync {
    /// Symbol for the token, if known.
    fn resolve(&self, instrument_token: u32) -> Option<String>;
}

/// Resolver that knows no symbols.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSymbols;

impl SymbolResolver for NoSymbols {
    fn resolve(&self, _instrument_token: u32) -> Option<String> {
        None
    }
}

impl<S: std::hash::BuildHasher + Send + Sync> SymbolResolver for HashMap<u32, String, S> {
    fn resolve(&self, instrument_token: u32) -> Option<String> {
        self.get(&instrument_token).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fn_handler_receives_current_credentials() {
        let handler = FnRefreshHandler::new(|creds: Credentials| async move {
            Ok::<_, PortError>(Some(RefreshedToken::without_expiry(format!(
                "{}-next",
                creds.api_key()
            ))))
        });

        let refreshed = handler
            .refresh(&Credentials::new("key", "secret"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(refreshed.access_token, "key-next");
        assert!(refreshed.expires_in.is_none());
    }

    #[tokio::test]
    async fn mocked_provider_returns_credentials() {
        let mut provider = MockCredentialProvider::new();
        provider
            .expect_load()
            .returning(|| Ok(Some(Credentials::new("k", "s").with_access_token("t"))));

        let loaded = provider.load().await.unwrap().unwrap();
        assert_eq!(loaded.access_token(), Some("t"));
    }

    #[test]
    fn map_resolver_looks_up_symbols() {
        let mut map = HashMap::new();
        map.insert(408_065_u32, "INFY".to_string());
        assert_eq!(map.resolve(408_065), Some("INFY".to_string()));
        assert_eq!(map.resolve(1), None);
        assert_eq!(NoSymbols.resolve(408_065), None);
    }
}
