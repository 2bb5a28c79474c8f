//! Kite Ticker Binary
//!
//! Connects to the Kite ticker, subscribes the configured instruments and
//! logs ticks until interrupted.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin kite-ticker
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `KITE_API_KEY`: Kite Connect API key
//! - `KITE_ACCESS_TOKEN` or `KITE_REQUEST_TOKEN` (with `KITE_API_SECRET`)
//!
//! ## Optional
//! - `KITE_TOKENS`: Comma-separated instrument tokens to subscribe
//! - `KITE_INSTRUMENTS_CSV`: Local instruments dump (fetched when unset)
//! - `KITE_WS_URL` / `KITE_API_URL`: Endpoint overrides
//! - `KITE_TOKEN_EXPIRES_IN_SECS`: Access token lifetime
//! - `TICKER_HEALTH_PORT`: Health check HTTP port (default: 8083, 0 disables)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `RUST_LOG`: Log filter (default: `kite_ticker=info`)

use std::sync::Arc;
use std::time::Duration;

use kite_ticker::application::ports::{CredentialProvider, NoSymbols, SymbolResolver};
use kite_ticker::infrastructure::cache::{DEFAULT_TICK_TTL, TickCache};
use kite_ticker::infrastructure::health::{HealthServer, HealthServerState};
use kite_ticker::infrastructure::instruments::InstrumentTable;
use kite_ticker::infrastructure::kite::rest::{DEFAULT_TIMEOUT, KiteRestClient};
use kite_ticker::infrastructure::kite::{EnvCredentialProvider, TickerClient};
use kite_ticker::infrastructure::telemetry;
use kite_ticker::{ClientEvent, TickerConfig, init_metrics};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    load_dotenv();

    // Initialize telemetry (tracing + optional OpenTelemetry)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Kite ticker");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder not installed");
    }

    let config = TickerConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();
    let rest = Arc::new(KiteRestClient::new(config.api_url.clone(), DEFAULT_TIMEOUT)?);
    let provider = Arc::new(EnvCredentialProvider);

    let resolver = load_instruments(&config, &rest, &*provider).await;

    let client = TickerClient::builder()
        .settings(config.ticker.clone())
        .ws_url(config.ws_url.clone())
        .resolver(resolver)
        .credential_provider(provider)
        .session_api(rest)
        .build();

    if !client.load_credentials().await? {
        tracing::error!("KITE_API_KEY is not set");
        return Err("missing Kite credentials".into());
    }

    // Consumers subscribe before the socket opens so no tick is missed.
    let cache = Arc::new(TickCache::new(DEFAULT_TICK_TTL));
    let cache_task = Arc::clone(&cache).spawn_feeder(client.ticks(), shutdown_token.clone());
    let log_task = tokio::spawn(log_stream(client.clone(), shutdown_token.clone()));

    client.set_subscribed_tokens(config.tokens.iter().copied());

    if config.server.health_port != 0 {
        let health_state = Arc::new(HealthServerState::new(
            env!("CARGO_PKG_VERSION").to_string(),
            client.clone(),
        ));
        let health_server = HealthServer::new(
            config.server.health_port,
            health_state,
            shutdown_token.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = health_server.run().await {
                tracing::error!(error = %e, "Health server error");
            }
        });
    }

    let connected = if client.credentials().has_access_token() {
        client.connect().await
    } else if let Ok(request_token) = std::env::var("KITE_REQUEST_TOKEN") {
        client.handle_callback(&request_token).await.map(|_| ())
    } else {
        tracing::error!(
            login_url = %client.login_url()?,
            "No access token; log in and set KITE_REQUEST_TOKEN"
        );
        return Err("missing Kite access token".into());
    };

    if let Err(e) = connected {
        // Transport failures are retried in the background; anything else is fatal.
        if matches!(e, kite_ticker::ClientError::WebSocket(_)) {
            tracing::warn!(error = %e, "Initial connection failed, retrying in background");
        } else {
            return Err(e.into());
        }
    }

    tracing::info!(
        subscriptions = client.subscribed_tokens().len(),
        "Kite ticker ready"
    );

    await_shutdown(shutdown_token).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, client.cleanup_async())
        .await
        .is_err()
    {
        tracing::warn!("Ticker cleanup timed out");
    }
    let _ = tokio::join!(cache_task, log_task);

    tracing::info!("Kite ticker stopped");
    Ok(())
}

/// Resolve symbols from a local dump or the instruments endpoint.
async fn load_instruments(
    config: &TickerConfig,
    rest: &KiteRestClient,
    provider: &dyn CredentialProvider,
) -> Arc<dyn SymbolResolver> {
    if let Some(path) = &config.instruments_csv {
        match InstrumentTable::from_path(path) {
            Ok(table) => return Arc::new(table),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to load instruments file");
            }
        }
    }

    let credentials = match provider.load().await {
        Ok(Some(credentials)) if credentials.has_access_token() => credentials,
        Ok(_) => {
            tracing::warn!("No access token yet, ticks will carry unresolved symbols");
            return Arc::new(NoSymbols);
        }
        Err(e) => {
            tracing::warn!(error = %e, "Credential provider failed");
            return Arc::new(NoSymbols);
        }
    };

    let table = rest
        .instruments_csv(&credentials)
        .await
        .map_err(|e| e.to_string())
        .and_then(|csv| InstrumentTable::from_csv_str(&csv).map_err(|e| e.to_string()));
    match table {
        Ok(table) => Arc::new(table),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to fetch instruments, symbols unresolved");
            Arc::new(NoSymbols)
        }
    }
}

/// Log ticks and lifecycle events until shutdown.
async fn log_stream(client: TickerClient, shutdown_token: CancellationToken) {
    let mut ticks = client.ticks();
    let mut events = client.events();

    loop {
        tokio::select! {
            () = shutdown_token.cancelled() => break,
            tick = ticks.recv() => match tick {
                Ok(tick) => tracing::debug!(
                    symbol = %tick.symbol,
                    token = tick.instrument_token,
                    mode = tick.mode.as_str(),
                    last_price = tick.last_price,
                    "Tick"
                ),
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Tick logger lagging"),
                Err(RecvError::Closed) => break,
            },
            event = events.recv() => match event {
                Ok(ClientEvent::ReconnectExhausted { attempts }) => {
                    tracing::error!(attempts, "Ticker gave up reconnecting");
                }
                Ok(ClientEvent::TokenRefreshRequired) => {
                    tracing::error!("Access token needs renewal; log in again");
                }
                Ok(event) => tracing::info!(event = event.name(), "Ticker event"),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &TickerConfig) {
    tracing::info!(
        ws_url = %config.ws_url,
        tokens = config.tokens.len(),
        frame_mode = ?config.ticker.frame_mode,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        heartbeat_timeout_secs = config.ticker.heartbeat_timeout.as_secs(),
        reconnect_max_attempts = config.ticker.max_reconnect_attempts,
        "Ticker settings"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
