//! Market Data Streaming Types
//!
//! Core domain types for market data ticks. These types are codec-agnostic
//! and represent the canonical internal representation of a decoded tick.

use serde::{Deserialize, Serialize};

/// Symbol used when an instrument token cannot be resolved.
pub const UNKNOWN_SYMBOL: &str = "UNKNOWN";

/// Number of depth levels per side in a full tick.
pub const DEPTH_LEVELS: usize = 5;

/// Tick detail level, derived from the packet flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TickMode {
    /// Last traded price only.
    Ltp,
    /// Quote: LTP plus volumes and day OHLC.
    Quote,
    /// Full: quote plus open interest and market depth.
    Full,
}

impl TickMode {
    /// Derive the mode from a packet flags byte.
    #[must_use]
    pub const fn from_flags(flags: u8) -> Self {
        if flags & 0x01 == 0 {
            Self::Ltp
        } else if flags & 0x02 != 0 {
            Self::Full
        } else {
            Self::Quote
        }
    }

    /// Mode name as used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ltp => "ltp",
            Self::Quote => "quote",
            Self::Full => "full",
        }
    }
}

/// Day OHLC carried by quote and full ticks.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Ohlc {
    /// Day open.
    pub open: f32,
    /// Day high.
    pub high: f32,
    /// Day low.
    pub low: f32,
    /// Previous close.
    pub close: f32,
}

/// Fields present on quote and full ticks.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QuoteFields {
    /// Quantity of the last trade.
    pub last_quantity: u32,
    /// Volume weighted average traded price.
    pub average_price: f32,
    /// Volume traded today.
    pub volume: u32,
    /// Total pending buy quantity.
    pub buy_quantity: u32,
    /// Total pending sell quantity.
    pub sell_quantity: u32,
    /// Day OHLC.
    pub ohlc: Ohlc,
}

/// Open interest block of a full tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpenInterest {
    /// Current open interest.
    pub oi: u32,
    /// Day high OI, when the gateway sends it.
    pub day_high: Option<u32>,
    /// Day low OI, when the gateway sends it.
    pub day_low: Option<u32>,
}

/// A single order book level.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DepthLevel {
    /// Level price.
    pub price: f32,
    /// Aggregate quantity at this price.
    pub quantity: u32,
    /// Number of orders at this price.
    pub orders: u16,
}

/// Top-of-book depth for both sides.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MarketDepth {
    /// Buy levels, best first.
    pub buy: Vec<DepthLevel>,
    /// Sell levels, best first.
    pub sell: Vec<DepthLevel>,
}

/// A decoded market data tick.
///
/// Produced once per decode and handed to the publisher; the client does not
/// retain it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Detail level of this tick.
    pub mode: TickMode,
    /// Exchange instrument token.
    pub instrument_token: u32,
    /// Trading symbol, or [`UNKNOWN_SYMBOL`].
    pub symbol: String,
    /// Last traded price.
    pub last_price: f32,
    /// Quote fields (quote and full modes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<QuoteFields>,
    /// Open interest (full mode, when flagged).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_interest: Option<OpenInterest>,
    /// Market depth (full mode, when flagged).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<MarketDepth>,
}

impl Tick {
    /// Whether the symbol lookup failed for this tick.
    #[must_use]
    pub fn is_unresolved(&self) -> bool {
        self.symbol == UNKNOWN_SYMBOL
    }
}
