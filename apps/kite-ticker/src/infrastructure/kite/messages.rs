//! Ticker Text Message Types
//!
//! JSON text frames exchanged with the ticker gateway. Market data arrives
//! as binary frames (see [`super::codec`]); text frames carry control
//! requests outbound and postbacks or errors inbound.
//!
//! # Outbound
//! - `{"a":"subscribe","v":[408065, 884737]}`
//!
//! # Inbound
//! - `{"type":"error","data":"..."}`
//! - `{"type":"message","data":"..."}`
//! - `{"type":"order","data":{...}}`

use serde::{Deserialize, Serialize};

// =============================================================================
// Outbound
// =============================================================================

/// Subscribe request for a set of instrument tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscribeRequest {
    /// Action name.
    #[serde(rename = "a")]
    pub action: &'static str,

    /// Instrument tokens.
    #[serde(rename = "v")]
    pub tokens: Vec<u32>,
}

impl SubscribeRequest {
    /// Create a subscribe request.
    #[must_use]
    pub const fn subscribe(tokens: Vec<u32>) -> Self {
        Self {
            action: "subscribe",
            tokens,
        }
    }

    /// Serialize to a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// Inbound
// =============================================================================

/// Kind of an inbound text frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextMessageKind {
    /// Gateway error.
    Error,
    /// Informational broadcast.
    Message,
    /// Order postback.
    Order,
    /// Anything else.
    #[serde(other)]
    Other,
}

/// Inbound text frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TextMessage {
    /// Frame kind.
    #[serde(rename = "type")]
    pub kind: TextMessageKind,

    /// Payload.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl TextMessage {
    /// Parse an inbound text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a typed JSON object.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Payload rendered as text for logging.
    #[must_use]
    pub fn data_text(&self) -> String {
        match &self.data {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}
