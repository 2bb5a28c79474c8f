//! Kite Ticker Adapters
//!
//! Client for the Kite ticker WebSocket and the REST calls around it:
//!
//! - **client**: connection lifecycle, reconnect, heartbeat, token refresh
//! - **codec**: binary tick packets
//! - **messages**: JSON text frames (subscribe requests, server notices)
//! - **rest**: session exchange, instruments, quotes, historical candles

pub mod auth;
pub mod client;
pub mod codec;
pub mod heartbeat;
pub mod messages;
pub mod reconnect;
pub mod rest;
pub mod timer;
pub mod token;

pub use auth::{AuthError, EnvCredentialProvider, Sha256Signer, authenticated_ws_url, login_url};
pub use client::{ClientError, ClientStatus, TickerClient, TickerClientBuilder};
pub use codec::{FrameMode, TickCodec, decode, decode_all};
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
pub use messages::{SubscribeRequest, TextMessage, TextMessageKind};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use rest::{Candle, KiteRestClient, Quote, RestError};
pub use timer::{TimerId, TimerSlot};
pub use token::TokenSchedule;
