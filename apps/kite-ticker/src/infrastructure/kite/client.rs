//! Kite Ticker Client
//!
//! One authenticated WebSocket connection to the ticker gateway, with
//! reconnect backoff, heartbeat supervision, access token refresh and a
//! rate-limited subscription flush.
//!
//! # Architecture
//!
//! [`TickerClient`] is a cheap `Clone` handle over shared state. All protocol
//! state lives behind one `parking_lot::Mutex` that is never held across an
//! `.await`. The socket itself is owned by a connection task that reads
//! frames, writes queued commands and reports its end back to the client.
//!
//! Each connection attempt gets a generation number. Callbacks from an
//! older generation (a superseded handshake, a socket closed during
//! cleanup) are ignored, so teardown never re-enters the reconnect path.
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──open──► Open
//!      ▲                          │                  │
//!      └──────── error ───────────┴── close/error ───┘ (reconnect scheduled)
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::auth::{self, AuthError, DEFAULT_WS_URL, Sha256Signer};
use super::codec::TickCodec;
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
use super::messages::{SubscribeRequest, TextMessage, TextMessageKind};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use super::timer::TimerSlot;
use super::token::TokenSchedule;
use crate::TickerSettings;
use crate::application::ports::{
    CredentialProvider, NoSymbols, PortError, RequestSigner, Session, SessionApi, SymbolResolver,
    TokenRefreshHandler,
};
use crate::domain::session::{ConnectionState, Credentials};
use crate::domain::streaming::Tick;
use crate::domain::subscription::{
    DeferReason, FlushDecision, InstrumentToken, RateLimitOptions, SubscriptionManager,
};
use crate::infrastructure::broadcast::{
    BroadcastConfig, ClientEvent, SharedTickPublisher, TickPublisher,
};
use crate::infrastructure::metrics;

/// Grace period for the close handshake before the socket task is aborted.
pub const CLOSE_GRACE: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Error Types
// =============================================================================

/// Errors returned by [`TickerClient`] operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Credentials or collaborators are missing. Never retried.
    #[error("configuration error: {0}")]
    Config(#[from] AuthError),

    /// The socket could not be opened.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// A newer connect or a cleanup replaced this attempt.
    #[error("connection attempt superseded")]
    Superseded,

    /// A collaborator failed.
    #[error("collaborator error: {0}")]
    Port(#[from] PortError),
}

// =============================================================================
// Status Snapshot
// =============================================================================

/// Point-in-time view of a client for health reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStatus {
    /// Socket state.
    pub state: ConnectionState,
    /// Reconnect attempts in the current cycle.
    pub reconnect_attempts: u32,
    /// Whether the reconnect budget ran out.
    pub reconnect_exhausted: bool,
    /// Time of the last inbound frame.
    pub last_message_at: Option<DateTime<Utc>>,
    /// Silence since the last inbound frame.
    pub last_message_age: Option<Duration>,
    /// Desired subscription count.
    pub subscriptions: usize,
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`TickerClient`].
pub struct TickerClientBuilder {
    settings: TickerSettings,
    ws_url: String,
    credentials: Credentials,
    resolver: Arc<dyn SymbolResolver>,
    credential_provider: Option<Arc<dyn CredentialProvider>>,
    session_api: Option<Arc<dyn SessionApi>>,
    signer: Arc<dyn RequestSigner>,
    refresh_handler: Option<Arc<dyn TokenRefreshHandler>>,
    reconnect: Option<ReconnectConfig>,
}

impl Default for TickerClientBuilder {
    fn default() -> Self {
        Self {
            settings: TickerSettings::default(),
            ws_url: DEFAULT_WS_URL.to_string(),
            credentials: Credentials::default(),
            resolver: Arc::new(NoSymbols),
            credential_provider: None,
            session_api: None,
            signer: Arc::new(Sha256Signer),
            refresh_handler: None,
            reconnect: None,
        }
    }
}

impl TickerClientBuilder {
    /// Client settings.
    #[must_use]
    pub fn settings(mut self, settings: TickerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Default ticker endpoint used by [`TickerClient::connect`].
    #[must_use]
    pub fn ws_url(mut self, ws_url: impl Into<String>) -> Self {
        self.ws_url = ws_url.into();
        self
    }

    /// Initial credentials.
    #[must_use]
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Token to symbol lookup for decoded ticks.
    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn SymbolResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Source for [`TickerClient::load_credentials`].
    #[must_use]
    pub fn credential_provider(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credential_provider = Some(provider);
        self
    }

    /// Session exchange used by [`TickerClient::handle_callback`].
    #[must_use]
    pub fn session_api(mut self, session_api: Arc<dyn SessionApi>) -> Self {
        self.session_api = Some(session_api);
        self
    }

    /// Checksum signer for the session exchange.
    #[must_use]
    pub fn signer(mut self, signer: Arc<dyn RequestSigner>) -> Self {
        self.signer = signer;
        self
    }

    /// Token refresh handler.
    #[must_use]
    pub fn refresh_handler(mut self, handler: Arc<dyn TokenRefreshHandler>) -> Self {
        self.refresh_handler = Some(handler);
        self
    }

    /// Reconnect configuration, overriding the one derived from settings.
    #[must_use]
    pub fn reconnect_config(mut self, config: ReconnectConfig) -> Self {
        self.reconnect = Some(config);
        self
    }

    /// Build the client. No socket is opened.
    #[must_use]
    pub fn build(self) -> TickerClient {
        let settings = &self.settings;
        let reconnect = self
            .reconnect
            .unwrap_or_else(|| ReconnectConfig::from_ticker_settings(settings));

        let state = State {
            credentials: self.credentials,
            ws_url: self.ws_url,
            connection: ConnectionState::Disconnected,
            generation: 0,
            conn: None,
            reconnect: ReconnectPolicy::new(reconnect),
            reconnect_exhausted: false,
            reconnect_stopped: false,
            subscriptions: SubscriptionManager::new(RateLimitOptions {
                window: settings.rate_limit_window,
                max_per_window: settings.rate_limit_max,
                backoff: settings.rate_limit_backoff,
            }),
            token: TokenSchedule::new(settings.refresh_before),
            token_epoch: 0,
            refresh_handler: self.refresh_handler,
            heartbeat: None,
            reconnect_timer: TimerSlot::new(),
            token_timer: TimerSlot::new(),
            flush_timer: TimerSlot::new(),
        };

        TickerClient {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                publisher: Arc::new(TickPublisher::new(BroadcastConfig::from(settings))),
                resolver: self.resolver,
                credential_provider: self.credential_provider,
                session_api: self.session_api,
                signer: self.signer,
                codec: TickCodec::new(settings.frame_mode),
                heartbeat_config: HeartbeatConfig::from_ticker_settings(settings),
                heartbeat_state: Arc::new(HeartbeatState::new()),
            }),
        }
    }
}

// =============================================================================
// Client Handle
// =============================================================================

/// Handle to a ticker connection.
///
/// Clones share the same connection and state.
///
/// # Example
///
/// ```rust,no_run
/// use kite_ticker::domain::session::Credentials;
/// use kite_ticker::infrastructure::kite::client::TickerClient;
///
/// # async fn run() -> Result<(), kite_ticker::infrastructure::kite::client::ClientError> {
/// let client = TickerClient::builder()
///     .credentials(Credentials::new("api_key", "secret").with_access_token("token"))
///     .build();
///
/// let mut ticks = client.ticks();
/// client.connect().await?;
/// client.subscribe([408_065]);
///
/// while let Ok(tick) = ticks.recv().await {
///     println!("{} {}", tick.symbol, tick.last_price);
/// }
/// client.cleanup_async().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TickerClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TickerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickerClient")
            .field("state", &self.connection_state())
            .finish_non_exhaustive()
    }
}

impl TickerClient {
    /// Start building a client.
    #[must_use]
    pub fn builder() -> TickerClientBuilder {
        TickerClientBuilder::default()
    }

    /// Client with the given settings and defaults elsewhere.
    #[must_use]
    pub fn new(settings: TickerSettings) -> Self {
        Self::builder().settings(settings).build()
    }

    // -------------------------------------------------------------------------
    // Connection
    // -------------------------------------------------------------------------

    /// Connect to the configured ticker endpoint.
    ///
    /// # Errors
    ///
    /// Fails immediately with [`ClientError::Config`] when no access token is
    /// held; otherwise resolves on open and fails on socket error (a reconnect
    /// is scheduled in that case).
    pub async fn connect(&self) -> Result<(), ClientError> {
        let url = self.inner.state.lock().ws_url.clone();
        self.connect_to(url).await
    }

    /// Connect to a specific ticker endpoint, which becomes the reconnect
    /// target.
    ///
    /// # Errors
    ///
    /// See [`TickerClient::connect`].
    pub async fn connect_to(&self, url: impl Into<String>) -> Result<(), ClientError> {
        let url = url.into();
        {
            let mut state = self.inner.state.lock();
            auth::authenticated_ws_url(&url, &state.credentials)?;
            state.ws_url.clone_from(&url);
            state.reconnect_timer.cancel();
            if state.reconnect_exhausted {
                state.reconnect.reset();
                state.reconnect_exhausted = false;
            }
        }
        self.inner.open_socket(url).await
    }

    // -------------------------------------------------------------------------
    // Credentials & Login
    // -------------------------------------------------------------------------

    /// Replace the credentials.
    ///
    /// A known token expiry arms the refresh timer; an unknown one disarms it.
    pub fn set_credentials(&self, credentials: Credentials) {
        let mut state = self.inner.state.lock();
        let expires_at = credentials.token_expires_at();
        state.credentials = credentials;
        self.inner.arm_token_expiry(&mut state, expires_at);
    }

    /// Current credentials.
    #[must_use]
    pub fn credentials(&self) -> Credentials {
        self.inner.state.lock().credentials.clone()
    }

    /// Load credentials from the credential provider.
    ///
    /// Returns `true` if credentials were found and applied.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Port`] if the provider fails.
    pub async fn load_credentials(&self) -> Result<bool, ClientError> {
        let Some(provider) = self.inner.credential_provider.clone() else {
            tracing::debug!("No credential provider configured");
            return Ok(false);
        };

        match provider.load().await? {
            Some(credentials) => {
                tracing::info!(
                    has_access_token = credentials.has_access_token(),
                    "Credentials loaded"
                );
                self.set_credentials(credentials);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Login URL for the configured API key.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] when no API key is set.
    pub fn login_url(&self) -> Result<String, ClientError> {
        Ok(auth::login_url(&self.inner.state.lock().credentials)?)
    }

    /// Exchange a login request token for an access token, then connect.
    ///
    /// # Errors
    ///
    /// Fails with [`ClientError::Config`] when the key, secret, request token
    /// or session API is missing, [`ClientError::Port`] when the exchange is
    /// rejected, or any [`TickerClient::connect`] error.
    pub async fn handle_callback(&self, request_token: &str) -> Result<Session, ClientError> {
        if request_token.is_empty() {
            return Err(AuthError::MissingRequestToken.into());
        }
        let session_api = self
            .inner
            .session_api
            .clone()
            .ok_or(AuthError::MissingSessionApi)?;

        let credentials = self.credentials();
        if !credentials.has_api_key() {
            return Err(AuthError::MissingApiKey.into());
        }
        if !credentials.has_api_secret() {
            return Err(AuthError::MissingApiSecret.into());
        }

        let checksum = self.inner.signer.checksum(
            credentials.api_key(),
            request_token,
            credentials.api_secret(),
        );
        let session = session_api
            .create_session(credentials.api_key(), request_token, &checksum)
            .await?;

        tracing::info!(user_id = ?session.user_id, "Session exchanged, connecting");
        self.inner
            .state
            .lock()
            .credentials
            .set_access_token(session.access_token.clone());

        self.connect().await?;
        Ok(session)
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Enable or disable resubscribing on every open.
    pub fn set_auto_resubscribe(&self, enabled: bool) {
        self.inner
            .state
            .lock()
            .subscriptions
            .set_auto_resubscribe(enabled);
    }

    /// Whether the desired set is flushed on every open.
    #[must_use]
    pub fn auto_resubscribe(&self) -> bool {
        self.inner.state.lock().subscriptions.auto_resubscribe()
    }

    /// Replace the desired set and flush it.
    pub fn set_subscribed_tokens(&self, tokens: impl IntoIterator<Item = InstrumentToken>) {
        let mut state = self.inner.state.lock();
        state.subscriptions.set_tokens(tokens);
        self.inner.flush_locked(&mut state);
    }

    /// Add tokens to the desired set and flush it.
    pub fn subscribe(&self, tokens: impl IntoIterator<Item = InstrumentToken>) {
        let mut state = self.inner.state.lock();
        if state.subscriptions.add_tokens(tokens) {
            self.inner.flush_locked(&mut state);
        }
    }

    /// Desired tokens in ascending order.
    #[must_use]
    pub fn subscribed_tokens(&self) -> Vec<InstrumentToken> {
        self.inner.state.lock().subscriptions.tokens()
    }

    // -------------------------------------------------------------------------
    // Rate Limiting
    // -------------------------------------------------------------------------

    /// Replace the subscribe rate limit.
    pub fn set_rate_limit_options(&self, options: RateLimitOptions) {
        self.inner
            .state
            .lock()
            .subscriptions
            .rate_limit_mut()
            .set_options(options);
    }

    /// Count a subscribe attempt. Returns `true` if the limiter is now
    /// suspended.
    pub fn record_subscribe_attempt(&self) -> bool {
        let now = Instant::now().into_std();
        self.inner
            .state
            .lock()
            .subscriptions
            .rate_limit_mut()
            .record_attempt(now)
    }

    /// Whether subscribe sends are suspended.
    #[must_use]
    pub fn is_subscribe_suspended(&self) -> bool {
        let now = Instant::now().into_std();
        self.inner
            .state
            .lock()
            .subscriptions
            .rate_limit()
            .is_suspended(now)
    }

    // -------------------------------------------------------------------------
    // Reconnect
    // -------------------------------------------------------------------------

    /// Replace the reconnect configuration. The attempt count is kept.
    pub fn set_reconnect_options(&self, config: ReconnectConfig) {
        self.inner.state.lock().reconnect.set_config(config);
    }

    /// Reconnect now, lifting a stop and starting a fresh cycle if the
    /// previous one was exhausted. An open socket is closed and the close
    /// path schedules the reconnect. A handshake already in flight is left
    /// to finish.
    pub fn trigger_reconnect(&self) {
        let mut state = self.inner.state.lock();
        state.reconnect_stopped = false;
        if state.reconnect_exhausted {
            state.reconnect.reset();
            state.reconnect_exhausted = false;
        }

        if state.connection == ConnectionState::Connecting {
            tracing::debug!("Reconnect requested while connecting, ignored");
            return;
        }

        if let Some(conn) = &state.conn {
            tracing::info!("Reconnect requested, closing current socket");
            let _ = conn.commands.send(Command::Close);
        } else {
            self.inner.schedule_reconnect_locked(&mut state);
        }
    }

    /// Stop automatic reconnects. The current socket stays open.
    pub fn stop_reconnect(&self) {
        let mut state = self.inner.state.lock();
        state.reconnect_stopped = true;
        if state.reconnect_timer.cancel() {
            tracing::info!("Pending reconnect cancelled");
        }
    }

    /// Reconnect attempts in the current cycle.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.state.lock().reconnect.attempt_count()
    }

    /// Whether the reconnect budget ran out.
    #[must_use]
    pub fn is_reconnect_exhausted(&self) -> bool {
        self.inner.state.lock().reconnect_exhausted
    }

    // -------------------------------------------------------------------------
    // Token Lifecycle
    // -------------------------------------------------------------------------

    /// Set the token expiry relative to now, optionally arming the refresh
    /// timer.
    pub fn set_token_expires_at(&self, from_now: Duration, reschedule: bool) {
        let mut state = self.inner.state.lock();
        state.token.set_expires_in(Instant::now(), from_now);
        let wall = TimeDelta::from_std(from_now).ok().map(|d| Utc::now() + d);
        state.credentials.set_token_expires_at(wall);
        if reschedule {
            self.inner.schedule_token_refresh_locked(&mut state);
        }
    }

    /// Lead time before expiry at which a refresh starts. Takes effect on the
    /// next schedule.
    pub fn set_refresh_before(&self, refresh_before: Duration) {
        self.inner
            .state
            .lock()
            .token
            .set_refresh_before(refresh_before);
    }

    /// Install or remove the token refresh handler.
    pub fn set_refresh_handler(&self, handler: Option<Arc<dyn TokenRefreshHandler>>) {
        self.inner.state.lock().refresh_handler = handler;
    }

    /// Run the about-to-expire and refresh sequence now.
    pub async fn trigger_token_refresh(&self) {
        self.inner.run_token_refresh().await;
    }

    // -------------------------------------------------------------------------
    // State
    // -------------------------------------------------------------------------

    /// Coarse socket state: `"OPEN"` or `"CLOSED"`.
    #[must_use]
    pub fn ws_state(&self) -> &'static str {
        self.connection_state().as_ws_str()
    }

    /// Socket state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.lock().connection
    }

    /// Time of the last inbound frame.
    #[must_use]
    pub fn last_message_time(&self) -> Option<DateTime<Utc>> {
        self.inner.heartbeat_state.last_message_at()
    }

    /// Snapshot for health reporting.
    #[must_use]
    pub fn status(&self) -> ClientStatus {
        let state = self.inner.state.lock();
        ClientStatus {
            state: state.connection,
            reconnect_attempts: state.reconnect.attempt_count(),
            reconnect_exhausted: state.reconnect_exhausted,
            last_message_at: self.inner.heartbeat_state.last_message_at(),
            last_message_age: self.inner.heartbeat_state.elapsed(),
            subscriptions: state.subscriptions.len(),
        }
    }

    // -------------------------------------------------------------------------
    // Channels
    // -------------------------------------------------------------------------

    /// Receiver for decoded ticks.
    #[must_use]
    pub fn ticks(&self) -> broadcast::Receiver<Tick> {
        self.inner.publisher.ticks_rx()
    }

    /// Receiver for lifecycle events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.publisher.events_rx()
    }

    /// The underlying publisher.
    #[must_use]
    pub fn publisher(&self) -> SharedTickPublisher {
        Arc::clone(&self.inner.publisher)
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    /// Start [`TickerClient::cleanup_async`] in the background.
    pub fn cleanup(&self) {
        let client = self.clone();
        tokio::spawn(async move { client.cleanup_async().await });
    }

    /// Tear the connection down.
    ///
    /// Cancels the heartbeat and every timer, clears the desired set, detaches
    /// the socket so its end does not schedule a reconnect, sends a close
    /// frame and waits for the socket task to finish, aborting it after
    /// [`CLOSE_GRACE`]. Safe to call repeatedly and from any state.
    pub async fn cleanup_async(&self) {
        let (generation, conn, was_active) = {
            let mut state = self.inner.state.lock();
            state.reconnect_timer.cancel();
            state.token_timer.cancel();
            state.flush_timer.cancel();
            state.token_epoch += 1;
            if let Some(heartbeat) = state.heartbeat.take() {
                heartbeat.cancel();
            }
            state.subscriptions.clear();
            state.generation += 1;

            let was_active = state.connection != ConnectionState::Disconnected;
            let conn = state.conn.take();
            if let Some(conn) = &conn {
                state.connection = ConnectionState::Closing;
                let _ = conn.commands.send(Command::Close);
            } else {
                state.connection = ConnectionState::Disconnected;
            }
            (state.generation, conn, was_active)
        };

        if let Some(conn) = conn {
            let mut task = conn.task;
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                tracing::warn!("Socket did not close in time, aborting");
                task.abort();
            }
        }

        {
            let mut state = self.inner.state.lock();
            if state.generation == generation {
                state.connection = ConnectionState::Disconnected;
            }
        }

        if was_active {
            tracing::info!("Ticker client cleaned up");
            let _ = self.inner.publisher.send_event(ClientEvent::Disconnected);
            metrics::set_connected(false);
        }
    }
}

// =============================================================================
// Shared State
// =============================================================================

enum Command {
    Text(String),
    Close,
}

struct Connection {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

struct State {
    credentials: Credentials,
    ws_url: String,
    connection: ConnectionState,
    generation: u64,
    conn: Option<Connection>,
    reconnect: ReconnectPolicy,
    reconnect_exhausted: bool,
    reconnect_stopped: bool,
    subscriptions: SubscriptionManager,
    token: TokenSchedule,
    /// Bumped by teardown; a refresh started under an older epoch is void.
    token_epoch: u64,
    refresh_handler: Option<Arc<dyn TokenRefreshHandler>>,
    heartbeat: Option<CancellationToken>,
    reconnect_timer: TimerSlot,
    token_timer: TimerSlot,
    flush_timer: TimerSlot,
}

impl State {
    /// Abandon the current socket: later callbacks from it are ignored.
    fn detach(&mut self) {
        self.generation += 1;
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.cancel();
        }
        if let Some(conn) = self.conn.take() {
            let _ = conn.commands.send(Command::Close);
        }
    }
}

struct Inner {
    state: Mutex<State>,
    publisher: SharedTickPublisher,
    resolver: Arc<dyn SymbolResolver>,
    credential_provider: Option<Arc<dyn CredentialProvider>>,
    session_api: Option<Arc<dyn SessionApi>>,
    signer: Arc<dyn RequestSigner>,
    codec: TickCodec,
    heartbeat_config: HeartbeatConfig,
    heartbeat_state: Arc<HeartbeatState>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(heartbeat) = state.heartbeat.take() {
            heartbeat.cancel();
        }
        if let Some(conn) = state.conn.take() {
            conn.task.abort();
        }
    }
}

impl Inner {
    // -------------------------------------------------------------------------
    // Socket lifecycle
    // -------------------------------------------------------------------------

    fn open_socket(self: &Arc<Self>, url: String) -> BoxFuture<'static, Result<(), ClientError>> {
        let inner = Arc::clone(self);
        Box::pin(async move {
            let (generation, target) = {
                let mut state = inner.state.lock();
                let target = auth::authenticated_ws_url(&url, &state.credentials)?;
                state.detach();
                state.connection = ConnectionState::Connecting;
                (state.generation, target)
            };

            tracing::info!(url = %url, generation, "Connecting to ticker");

            match tokio_tungstenite::connect_async(target.as_str()).await {
                Ok((ws, _response)) => inner.finish_open(generation, ws),
                Err(e) => {
                    tracing::warn!(error = %e, "Ticker connection failed");
                    let mut state = inner.state.lock();
                    if state.generation == generation {
                        state.connection = ConnectionState::Disconnected;
                        inner.schedule_reconnect_locked(&mut state);
                    }
                    Err(ClientError::WebSocket(e.to_string()))
                }
            }
        })
    }

    fn finish_open(self: &Arc<Self>, generation: u64, ws: WsStream) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        if state.generation != generation {
            tracing::debug!(generation, "Discarding superseded socket");
            return Err(ClientError::Superseded);
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(1);
        let frames = FrameHandler {
            codec: self.codec,
            resolver: Arc::clone(&self.resolver),
            publisher: Arc::clone(&self.publisher),
            heartbeat: Arc::clone(&self.heartbeat_state),
        };
        let task = tokio::spawn(run_connection(
            Arc::downgrade(self),
            generation,
            ws,
            command_rx,
            heartbeat_rx,
            frames,
        ));
        state.conn = Some(Connection {
            commands: command_tx,
            task,
        });

        state.connection = ConnectionState::Open;
        state.reconnect.reset();
        state.reconnect_exhausted = false;

        self.heartbeat_state.touch();
        let cancel = CancellationToken::new();
        tokio::spawn(
            HeartbeatManager::new(
                self.heartbeat_config,
                Arc::clone(&self.heartbeat_state),
                heartbeat_tx,
                cancel.clone(),
            )
            .run(),
        );
        if let Some(previous) = state.heartbeat.replace(cancel) {
            previous.cancel();
        }

        tracing::info!(generation, "Ticker connected");
        let _ = self.publisher.send_event(ClientEvent::Connected);
        metrics::set_connected(true);

        if state.subscriptions.auto_resubscribe() || state.subscriptions.is_pending() {
            self.flush_locked(&mut state);
        }
        Ok(())
    }

    fn on_close(self: &Arc<Self>, generation: u64) {
        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }

        state.conn = None;
        state.connection = ConnectionState::Disconnected;
        if let Some(heartbeat) = state.heartbeat.take() {
            heartbeat.cancel();
        }

        tracing::warn!(generation, "Ticker disconnected");
        let _ = self.publisher.send_event(ClientEvent::Disconnected);
        metrics::set_connected(false);

        self.schedule_reconnect_locked(&mut state);
    }

    // -------------------------------------------------------------------------
    // Reconnect
    // -------------------------------------------------------------------------

    fn schedule_reconnect_locked(self: &Arc<Self>, state: &mut State) {
        if state.reconnect_stopped
            || state.reconnect_exhausted
            || state.reconnect_timer.is_pending()
        {
            return;
        }

        let Some(delay) = state.reconnect.next_delay() else {
            let attempts = state.reconnect.attempt_count();
            state.reconnect_exhausted = true;
            tracing::warn!(attempts, "Reconnect attempts exhausted");
            let _ = self
                .publisher
                .send_event(ClientEvent::ReconnectExhausted { attempts });
            metrics::record_reconnect_exhausted();
            return;
        };

        let attempt = state.reconnect.attempt_count();
        tracing::info!(
            attempt,
            delay_ms = delay.as_millis(),
            "Reconnecting to ticker"
        );
        let _ = self
            .publisher
            .send_event(ClientEvent::Reconnecting { attempt, delay });
        metrics::record_reconnect();

        let weak = Arc::downgrade(self);
        state.reconnect_timer.schedule(delay, move |id| async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let url = {
                let mut state = inner.state.lock();
                if !state.reconnect_timer.fired(id) || state.reconnect_stopped {
                    return;
                }
                state.ws_url.clone()
            };
            if let Err(e) = inner.open_socket(url).await {
                tracing::debug!(error = %e, "Reconnect attempt failed");
            }
        });
    }

    // -------------------------------------------------------------------------
    // Subscription flush
    // -------------------------------------------------------------------------

    fn flush_locked(self: &Arc<Self>, state: &mut State) {
        let now = Instant::now();
        let is_open = state.connection.is_open() && state.conn.is_some();

        match state.subscriptions.flush(now.into_std(), is_open) {
            FlushDecision::Idle => {}
            FlushDecision::Deferred(DeferReason::NotOpen) => {
                tracing::debug!("Subscribe deferred until the socket opens");
                metrics::record_subscribe_deferred(metrics::DeferReason::NotOpen);
            }
            FlushDecision::Deferred(DeferReason::Suspended { until }) => {
                let delay = until.saturating_duration_since(now.into_std());
                tracing::debug!(
                    retry_ms = delay.as_millis(),
                    "Subscribe deferred by rate limit"
                );
                metrics::record_subscribe_deferred(metrics::DeferReason::RateLimited);

                let weak = Arc::downgrade(self);
                state.flush_timer.schedule(delay, move |id| async move {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    let mut state = inner.state.lock();
                    if state.flush_timer.fired(id) {
                        inner.flush_locked(&mut state);
                    }
                });
            }
            FlushDecision::Send(tokens) => Self::send_subscribe(state, tokens),
        }
    }

    fn send_subscribe(state: &State, tokens: Vec<InstrumentToken>) {
        let count = tokens.len();
        let json = match SubscribeRequest::subscribe(tokens).to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode subscribe request");
                return;
            }
        };

        let sent = state
            .conn
            .as_ref()
            .is_some_and(|conn| conn.commands.send(Command::Text(json)).is_ok());
        if sent {
            tracing::debug!(tokens = count, "Subscribe sent");
            metrics::record_subscribe_sent(count);
        } else {
            tracing::warn!(tokens = count, "Socket task gone, subscribe dropped");
        }
    }

    // -------------------------------------------------------------------------
    // Token refresh
    // -------------------------------------------------------------------------

    fn arm_token_expiry(self: &Arc<Self>, state: &mut State, expires_at: Option<DateTime<Utc>>) {
        match expires_at {
            Some(at) => {
                state
                    .token
                    .set_expires_at_wall(Instant::now(), Utc::now(), at);
                self.schedule_token_refresh_locked(state);
            }
            None => {
                state.token.clear();
                state.token_timer.cancel();
            }
        }
    }

    fn schedule_token_refresh_locked(self: &Arc<Self>, state: &mut State) {
        let Some(delay) = state.token.refresh_delay(Instant::now()) else {
            state.token_timer.cancel();
            return;
        };

        tracing::debug!(delay_ms = delay.as_millis(), "Token refresh scheduled");
        let weak = Arc::downgrade(self);
        state.token_timer.schedule(delay, move |id| async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let fired = { inner.state.lock().token_timer.fired(id) };
            if fired {
                inner.run_token_refresh().await;
            }
        });
    }

    async fn run_token_refresh(self: &Arc<Self>) {
        tracing::info!("Access token about to expire");
        let _ = self.publisher.send_event(ClientEvent::TokenAboutToExpire);

        let (handler, credentials, epoch) = {
            let state = self.state.lock();
            (
                state.refresh_handler.clone(),
                state.credentials.clone(),
                state.token_epoch,
            )
        };

        let outcome = match handler {
            Some(handler) => match handler.refresh(&credentials).await {
                Ok(Some(token)) => Ok(token),
                Ok(None) => Err(metrics::RefreshOutcome::Required),
                Err(e) => {
                    tracing::warn!(error = %e, "Token refresh handler failed");
                    Err(metrics::RefreshOutcome::Failed)
                }
            },
            None => Err(metrics::RefreshOutcome::Required),
        };

        let mut state = self.state.lock();
        if state.token_epoch != epoch {
            tracing::debug!("Client torn down during token refresh, discarding result");
            return;
        }

        match outcome {
            Ok(token) => {
                state.credentials.set_access_token(token.access_token);
                if let Some(expires_in) = token.expires_in {
                    state.token.set_expires_in(Instant::now(), expires_in);
                    let wall = TimeDelta::from_std(expires_in).ok().map(|d| Utc::now() + d);
                    state.credentials.set_token_expires_at(wall);
                    self.schedule_token_refresh_locked(&mut state);
                }
                tracing::info!(
                    rescheduled = token.expires_in.is_some(),
                    "Access token refreshed"
                );
                metrics::record_token_refresh(metrics::RefreshOutcome::Refreshed);
            }
            Err(outcome) => {
                tracing::warn!("Access token refresh required");
                let _ = self.publisher.send_event(ClientEvent::TokenRefreshRequired);
                metrics::record_token_refresh(outcome);
            }
        }
    }
}

// =============================================================================
// Connection Task
// =============================================================================

/// Inbound frame processing, owned by the connection task.
struct FrameHandler {
    codec: TickCodec,
    resolver: Arc<dyn SymbolResolver>,
    publisher: SharedTickPublisher,
    heartbeat: Arc<HeartbeatState>,
}

impl FrameHandler {
    fn on_binary(&self, data: &[u8]) {
        self.heartbeat.touch();

        // Single-byte frames are server keepalives.
        if data.len() < 2 {
            return;
        }

        let ticks = self.codec.decode_frame(data, self.resolver.as_ref());
        if ticks.is_empty() {
            tracing::debug!(len = data.len(), "Dropped undecodable frame");
            metrics::record_frame_dropped();
            return;
        }
        for tick in ticks {
            metrics::record_tick(tick.mode);
            let _ = self.publisher.send_tick(tick);
        }
    }

    fn on_text(&self, text: &str) {
        self.heartbeat.touch();

        match TextMessage::parse(text) {
            Ok(message) => match message.kind {
                TextMessageKind::Error => {
                    tracing::warn!(message = %message.data_text(), "Ticker error message");
                }
                TextMessageKind::Message => {
                    tracing::info!(message = %message.data_text(), "Ticker message");
                }
                TextMessageKind::Order | TextMessageKind::Other => {
                    tracing::debug!(kind = ?message.kind, "Ticker text frame ignored");
                }
            },
            Err(e) => tracing::debug!(error = %e, "Unparseable text frame"),
        }
    }

    fn touch(&self) {
        self.heartbeat.touch();
    }
}

async fn run_connection(
    client: Weak<Inner>,
    generation: u64,
    ws: WsStream,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut heartbeat: mpsc::Receiver<HeartbeatEvent>,
    frames: FrameHandler,
) {
    let (mut write, mut read) = ws.split();
    let mut closing = false;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Text(text)) => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        tracing::warn!(error = %e, "Socket write failed");
                        break;
                    }
                }
                Some(Command::Close) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    closing = true;
                    break;
                }
            },
            Some(HeartbeatEvent::Stale { elapsed }) = heartbeat.recv() => {
                tracing::warn!(elapsed_ms = elapsed.as_millis(), "Closing stale socket");
                let _ = write.send(Message::Close(None)).await;
                closing = true;
                break;
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Binary(data))) => frames.on_binary(&data),
                Some(Ok(Message::Text(text))) => frames.on_text(&text),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => frames.touch(),
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(frame = ?frame, "Server closed the socket");
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Socket read failed");
                    break;
                }
                None => {
                    tracing::info!("Socket stream ended");
                    break;
                }
            },
        }
    }

    if closing {
        // Wait for the peer's close reply so the handshake completes.
        let drain = async {
            while let Some(Ok(message)) = read.next().await {
                if message.is_close() {
                    break;
                }
            }
        };
        let _ = tokio::time::timeout(CLOSE_GRACE, drain).await;
    }

    if let Some(inner) = client.upgrade() {
        inner.on_close(generation);
    }
}
