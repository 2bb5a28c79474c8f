//! Ticker Client Integration Tests
//!
//! Drives a real client against an in-process WebSocket gateway: tick
//! delivery, subscribe frames, reconnect, exhaustion, login and teardown.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{MockGateway, closed_port_url, ltp_frame, wait_until};
use kite_ticker::infrastructure::kite::reconnect::fixed_jitter;
use kite_ticker::{
    ClientError, ClientEvent, ConnectionState, Credentials, PortError, RateLimitOptions,
    ReconnectConfig, Session, SessionApi, TickMode, TickerClient, TickerSettings,
};
use tokio::sync::broadcast;
use tokio::time::timeout;

fn credentials() -> Credentials {
    Credentials::new("key", "secret").with_access_token("tok")
}

fn fast_reconnect(max_attempts: u32) -> ReconnectConfig {
    ReconnectConfig::new(Duration::from_millis(20), Duration::from_millis(100), max_attempts)
        .with_jitter(fixed_jitter(Duration::ZERO))
}

fn client_for(gateway: &MockGateway) -> TickerClient {
    TickerClient::builder()
        .ws_url(gateway.url())
        .credentials(credentials())
        .reconnect_config(fast_reconnect(5))
        .build()
}

async fn next_event(
    events: &mut broadcast::Receiver<ClientEvent>,
    wanted: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not received in time")
}

// =============================================================================
// Tick Delivery
// =============================================================================

#[tokio::test]
async fn delivers_ltp_tick_from_gateway() {
    let gateway = MockGateway::start().await;
    let client = client_for(&gateway);
    let mut ticks = client.ticks();

    client.connect().await.unwrap();
    assert_eq!(client.connection_state(), ConnectionState::Open);
    assert_eq!(client.ws_state(), "OPEN");

    gateway.send_binary(ltp_frame(12345, 456.78));

    let tick = timeout(Duration::from_secs(2), ticks.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tick.instrument_token, 12345);
    assert_eq!(tick.mode, TickMode::Ltp);
    assert!((tick.last_price - 456.78).abs() < 1e-3);
    assert!(client.last_message_time().is_some());

    // Exactly one tick per frame.
    assert!(
        timeout(Duration::from_millis(100), ticks.recv())
            .await
            .is_err()
    );

    client.cleanup_async().await;
}

#[tokio::test]
async fn handshake_carries_key_and_token() {
    let gateway = MockGateway::start().await;
    let client = client_for(&gateway);

    client.connect().await.unwrap();
    gateway.wait_accepted(1).await;

    let uris = gateway.uris();
    assert_eq!(uris.len(), 1);
    assert!(uris[0].contains("api_key=key"));
    assert!(uris[0].contains("access_token=tok"));

    client.cleanup_async().await;
}

#[tokio::test]
async fn keepalive_frame_touches_without_tick() {
    let gateway = MockGateway::start().await;
    let client = client_for(&gateway);
    let mut ticks = client.ticks();

    client.connect().await.unwrap();
    let before = client.status().last_message_at;

    tokio::time::sleep(Duration::from_millis(20)).await;
    gateway.send_binary(vec![0]);
    wait_until(|| client.status().last_message_at > before).await;

    assert!(
        timeout(Duration::from_millis(100), ticks.recv())
            .await
            .is_err()
    );

    client.cleanup_async().await;
}

// =============================================================================
// Subscriptions
// =============================================================================

#[tokio::test]
async fn subscribe_frame_sent_after_open() {
    let gateway = MockGateway::start().await;
    let client = client_for(&gateway);

    // Desired before the socket exists: deferred, then flushed on open.
    client.set_subscribed_tokens([408_065, 884_737]);
    client.connect().await.unwrap();

    let texts = gateway.wait_texts(1).await;
    let frame: serde_json::Value = serde_json::from_str(&texts[0]).unwrap();
    assert_eq!(frame["a"], "subscribe");
    let mut tokens: Vec<u64> = frame["v"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_u64().unwrap())
        .collect();
    tokens.sort_unstable();
    assert_eq!(tokens, vec![408_065, 884_737]);

    client.cleanup_async().await;
}

#[tokio::test]
async fn subscribe_while_open_sends_immediately() {
    let gateway = MockGateway::start().await;
    let client = client_for(&gateway);

    client.connect().await.unwrap();
    client.subscribe([256_265]);

    let texts = gateway.wait_texts(1).await;
    assert!(texts[0].contains("256265"));

    client.cleanup_async().await;
}

#[tokio::test]
async fn rate_limited_subscribe_is_sent_once_window_drains() {
    let gateway = MockGateway::start().await;
    let client = client_for(&gateway);
    client.set_rate_limit_options(RateLimitOptions {
        window: Duration::from_secs(1),
        max_per_window: 1,
        backoff: Duration::from_millis(200),
    });

    client.connect().await.unwrap();
    client.subscribe([1]);
    gateway.wait_texts(1).await;

    client.subscribe([2]);
    assert!(client.is_subscribe_suspended());
    assert_eq!(client.subscribed_tokens(), vec![1, 2]);

    // Backoff has ended but the window is still full.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(gateway.texts().len(), 1);

    let texts = gateway.wait_texts(2).await;
    let frame: serde_json::Value = serde_json::from_str(&texts[1]).unwrap();
    assert_eq!(frame["a"], "subscribe");
    assert_eq!(frame["v"], serde_json::json!([1, 2]));
    assert_eq!(texts.len(), 2);

    client.cleanup_async().await;
}

// =============================================================================
// Reconnect
// =============================================================================

#[tokio::test]
async fn reconnects_after_server_close() {
    let gateway = MockGateway::start().await;
    let client = client_for(&gateway);
    let mut events = client.events();

    client.set_subscribed_tokens([408_065]);
    client.connect().await.unwrap();
    gateway.wait_texts(1).await;

    gateway.close_all();

    next_event(&mut events, |e| matches!(e, ClientEvent::Disconnected)).await;
    let reconnecting = next_event(&mut events, |e| {
        matches!(e, ClientEvent::Reconnecting { .. })
    })
    .await;
    assert!(matches!(
        reconnecting,
        ClientEvent::Reconnecting { attempt: 1, .. }
    ));
    next_event(&mut events, |e| matches!(e, ClientEvent::Connected)).await;

    assert_eq!(gateway.accepted(), 2);
    assert_eq!(client.reconnect_attempts(), 0);
    assert!(!client.is_reconnect_exhausted());

    // Desired set is replayed on the new socket.
    let texts = gateway.wait_texts(2).await;
    assert!(texts[1].contains("408065"));

    client.cleanup_async().await;
}

#[tokio::test]
async fn stale_socket_is_replaced() {
    let gateway = MockGateway::start().await;
    let settings = TickerSettings {
        heartbeat_interval: Duration::from_millis(20),
        heartbeat_timeout: Duration::from_millis(100),
        ..TickerSettings::default()
    };
    let client = TickerClient::builder()
        .settings(settings)
        .ws_url(gateway.url())
        .credentials(credentials())
        .reconnect_config(fast_reconnect(0))
        .build();

    client.connect().await.unwrap();

    // The gateway never sends anything, so the heartbeat closes the socket.
    gateway.wait_accepted(2).await;

    client.cleanup_async().await;
}

#[tokio::test]
async fn exhausts_reconnect_against_closed_port() {
    let url = closed_port_url().await;
    let client = TickerClient::builder()
        .ws_url(url)
        .credentials(credentials())
        .reconnect_config(fast_reconnect(2))
        .build();
    let mut events = client.events();

    let result = client.connect().await;
    assert!(matches!(result, Err(ClientError::WebSocket(_))));

    let exhausted = next_event(&mut events, |e| {
        matches!(e, ClientEvent::ReconnectExhausted { .. })
    })
    .await;
    assert_eq!(exhausted, ClientEvent::ReconnectExhausted { attempts: 2 });
    assert!(client.is_reconnect_exhausted());
    assert!(client.status().reconnect_exhausted);
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);

    client.cleanup_async().await;
}

#[tokio::test]
async fn trigger_reconnect_after_exhaustion_retries() {
    let url = closed_port_url().await;
    let client = TickerClient::builder()
        .ws_url(url)
        .credentials(credentials())
        .reconnect_config(fast_reconnect(1))
        .build();
    let mut events = client.events();

    let _ = client.connect().await;
    next_event(&mut events, |e| {
        matches!(e, ClientEvent::ReconnectExhausted { .. })
    })
    .await;

    client.trigger_reconnect();
    let event = next_event(&mut events, |e| {
        matches!(
            e,
            ClientEvent::Reconnecting { .. } | ClientEvent::ReconnectExhausted { .. }
        )
    })
    .await;
    assert!(matches!(event, ClientEvent::Reconnecting { attempt: 1, .. }));

    client.cleanup_async().await;
}

// =============================================================================
// Login
// =============================================================================

struct FakeSessionApi;

#[async_trait]
impl SessionApi for FakeSessionApi {
    async fn create_session(
        &self,
        api_key: &str,
        request_token: &str,
        checksum: &str,
    ) -> Result<Session, PortError> {
        assert_eq!(api_key, "key");
        assert_eq!(request_token, "req");
        assert_eq!(checksum.len(), 64);
        Ok(Session {
            access_token: "fresh".to_string(),
            user_id: Some("AB1234".to_string()),
        })
    }
}

#[tokio::test]
async fn callback_exchanges_token_then_connects() {
    let gateway = MockGateway::start().await;
    let client = TickerClient::builder()
        .ws_url(gateway.url())
        .credentials(Credentials::new("key", "secret"))
        .session_api(Arc::new(FakeSessionApi))
        .build();

    let session = client.handle_callback("req").await.unwrap();
    assert_eq!(session.access_token, "fresh");
    assert_eq!(client.credentials().access_token(), Some("fresh"));
    assert_eq!(client.connection_state(), ConnectionState::Open);

    gateway.wait_accepted(1).await;
    assert!(gateway.uris()[0].contains("access_token=fresh"));

    client.cleanup_async().await;
}

#[tokio::test]
async fn connect_without_token_is_config_error() {
    let gateway = MockGateway::start().await;
    let client = TickerClient::builder()
        .ws_url(gateway.url())
        .credentials(Credentials::new("key", "secret"))
        .build();

    assert!(matches!(
        client.connect().await,
        Err(ClientError::Config(_))
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(gateway.accepted(), 0);
}

// =============================================================================
// Teardown
// =============================================================================

#[tokio::test]
async fn cleanup_is_idempotent_and_final() {
    let gateway = MockGateway::start().await;
    let client = client_for(&gateway);
    let mut events = client.events();

    client.set_subscribed_tokens([408_065]);
    client.connect().await.unwrap();
    gateway.wait_accepted(1).await;

    client.cleanup_async().await;
    client.cleanup_async().await;
    client.cleanup();

    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert!(client.subscribed_tokens().is_empty());

    // Closing on our side never schedules a reconnect.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(gateway.accepted(), 1);
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, ClientEvent::Reconnecting { .. }));
    }
}
