//! Binary Tick Codec
//!
//! Decodes the ticker gateway's big-endian binary frames into [`Tick`]s.
//!
//! # Frame Format
//!
//! ```text
//! u16 packet_count
//! packet*:
//!   u32 instrument_token
//!   u8  flags            bit0 quote, bit1 full, bit2 oi, bit3 oi day range, bit4 depth
//!   f32 last_price
//!   -- quote/full --
//!   u32 last_quantity, f32 average_price, u32 volume,
//!   u32 buy_quantity, u32 sell_quantity,
//!   f32 open, f32 high, f32 low, f32 close
//!   -- full & oi --
//!   u32 oi [u32 oi_day_high, u32 oi_day_low if oi day range]
//!   -- full & depth --
//!   5 buy + 5 sell levels of f32 price, u32 quantity, u16 orders, 2 reserved
//! ```
//!
//! Decoding never panics: every read is bounds checked and any truncated or
//! malformed frame yields `None`.

use crate::application::ports::SymbolResolver;
use crate::domain::streaming::{
    DEPTH_LEVELS, DepthLevel, MarketDepth, Ohlc, OpenInterest, QuoteFields, Tick, TickMode,
    UNKNOWN_SYMBOL,
};

// =============================================================================
// Flags
// =============================================================================

/// Quote fields follow the last price.
pub const FLAG_QUOTE: u8 = 0x01;
/// Full tick (requires [`FLAG_QUOTE`]).
pub const FLAG_FULL: u8 = 0x02;
/// Open interest follows the quote fields.
pub const FLAG_OI: u8 = 0x04;
/// Day high and low open interest follow the open interest.
pub const FLAG_OI_DAY_RANGE: u8 = 0x08;
/// Market depth follows.
pub const FLAG_DEPTH: u8 = 0x10;

/// Bytes in an ltp packet.
pub const LTP_PACKET_LEN: usize = 9;

/// Bytes per depth level, including two reserved bytes.
pub const DEPTH_LEVEL_STRIDE: usize = 12;

// =============================================================================
// Frame Mode
// =============================================================================

/// How many packets of a frame the client surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameMode {
    /// Surface only the first packet of each frame.
    #[default]
    FirstPacket,
    /// Surface every packet of each frame.
    AllPackets,
}

impl FrameMode {
    /// Parse a mode name (`first` or `all`).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "first" | "first_packet" => Some(Self::FirstPacket),
            "all" | "all_packets" => Some(Self::AllPackets),
            _ => None,
        }
    }
}

/// Binary tick codec bound to a frame mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickCodec {
    mode: FrameMode,
}

impl TickCodec {
    /// Create a codec.
    #[must_use]
    pub const fn new(mode: FrameMode) -> Self {
        Self { mode }
    }

    /// Configured frame mode.
    #[must_use]
    pub const fn mode(&self) -> FrameMode {
        self.mode
    }

    /// Decode a frame according to the frame mode.
    ///
    /// An empty result means the frame was dropped.
    #[must_use]
    pub fn decode_frame(&self, buffer: &[u8], resolver: &dyn SymbolResolver) -> Vec<Tick> {
        match self.mode {
            FrameMode::FirstPacket => decode(buffer, resolver).into_iter().collect(),
            FrameMode::AllPackets => decode_all(buffer, resolver),
        }
    }
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode the first packet of a frame.
///
/// Returns `None` when the frame holds no packets or the first packet is
/// truncated.
#[must_use]
pub fn decode(buffer: &[u8], resolver: &dyn SymbolResolver) -> Option<Tick> {
    let mut reader = Reader::new(buffer);
    let count = reader.u16()?;
    if count == 0 {
        return None;
    }
    read_packet(&mut reader, resolver)
}

/// Decode every packet of a frame.
///
/// Packets are contiguous and sized by their flags. Decoding stops at the
/// first truncated packet; packets before it are returned.
#[must_use]
pub fn decode_all(buffer: &[u8], resolver: &dyn SymbolResolver) -> Vec<Tick> {
    let mut reader = Reader::new(buffer);
    let Some(count) = reader.u16() else {
        return Vec::new();
    };

    // Smallest packet is an ltp packet.
    let mut ticks = Vec::with_capacity(usize::from(count).min(buffer.len() / LTP_PACKET_LEN));
    for _ in 0..count {
        match read_packet(&mut reader, resolver) {
            Some(tick) => ticks.push(tick),
            None => break,
        }
    }
    ticks
}

fn read_packet(reader: &mut Reader<'_>, resolver: &dyn SymbolResolver) -> Option<Tick> {
    let instrument_token = reader.u32()?;
    let flags = reader.u8()?;
    let mode = TickMode::from_flags(flags);
    let last_price = reader.f32()?;

    let mut tick = Tick {
        mode,
        instrument_token,
        symbol: resolver
            .resolve(instrument_token)
            .unwrap_or_else(|| UNKNOWN_SYMBOL.to_string()),
        last_price,
        quote: None,
        open_interest: None,
        depth: None,
    };

    if mode == TickMode::Ltp {
        return Some(tick);
    }

    tick.quote = Some(QuoteFields {
        last_quantity: reader.u32()?,
        average_price: reader.f32()?,
        volume: reader.u32()?,
        buy_quantity: reader.u32()?,
        sell_quantity: reader.u32()?,
        ohlc: Ohlc {
            open: reader.f32()?,
            high: reader.f32()?,
            low: reader.f32()?,
            close: reader.f32()?,
        },
    });

    if mode != TickMode::Full {
        return Some(tick);
    }

    if flags & FLAG_OI != 0 {
        let oi = reader.u32()?;
        let (day_high, day_low) = if flags & FLAG_OI_DAY_RANGE != 0 {
            (Some(reader.u32()?), Some(reader.u32()?))
        } else {
            (None, None)
        };
        tick.open_interest = Some(OpenInterest {
            oi,
            day_high,
            day_low,
        });
    }

    if flags & FLAG_DEPTH != 0 {
        let buy = read_levels(reader)?;
        let sell = read_levels(reader)?;
        tick.depth = Some(MarketDepth { buy, sell });
    }

    Some(tick)
}

fn read_levels(reader: &mut Reader<'_>) -> Option<Vec<DepthLevel>> {
    let mut levels = Vec::with_capacity(DEPTH_LEVELS);
    for _ in 0..DEPTH_LEVELS {
        let level = reader.take(DEPTH_LEVEL_STRIDE)?;
        let mut level = Reader::new(level);
        levels.push(DepthLevel {
            price: level.f32()?,
            quantity: level.u32()?,
            orders: level.u16()?,
        });
    }
    Some(levels)
}

// =============================================================================
// Reader
// =============================================================================

/// Bounds-checked big-endian cursor.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let bytes = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.take(N)?.try_into().ok()
    }

    fn u8(&mut self) -> Option<u8> {
        self.array::<1>().map(|[b]| b)
    }

    fn u16(&mut self) -> Option<u16> {
        self.array().map(u16::from_be_bytes)
    }

    fn u32(&mut self) -> Option<u32> {
        self.array().map(u32::from_be_bytes)
    }

    fn f32(&mut self) -> Option<f32> {
        self.array().map(f32::from_be_bytes)
    }
}
