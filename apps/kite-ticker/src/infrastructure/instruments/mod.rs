//! Instrument Table
//!
//! Parses the Kite instruments dump (CSV) into a token/symbol table. The
//! table resolves tick tokens to trading symbols and symbols back to tokens
//! for subscription.
//!
//! # Format
//!
//! ```text
//! instrument_token,exchange_token,tradingsymbol,name,last_price,expiry,strike,tick_size,lot_size,instrument_type,segment,exchange
//! 408065,1594,INFY,INFOSYS,0,,,0.05,1,EQ,NSE,NSE
//! ```
//!
//! Rows that do not parse are skipped with a warning.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::application::ports::SymbolResolver;

/// Errors raised while loading the instruments dump.
#[derive(Debug, Error)]
pub enum InstrumentError {
    /// The dump could not be read.
    #[error("failed to read instruments: {0}")]
    Read(#[from] csv::Error),

    /// The dump has no usable rows.
    #[error("instruments dump is empty")]
    Empty,
}

/// One row of the instruments dump.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Instrument {
    /// Ticker token.
    pub instrument_token: u32,
    /// Exchange-assigned token.
    #[serde(default)]
    pub exchange_token: Option<u32>,
    /// Trading symbol, e.g. `INFY`.
    pub tradingsymbol: String,
    /// Company or contract name.
    #[serde(default)]
    pub name: Option<String>,
    /// Expiry date for derivatives (`YYYY-MM-DD`).
    #[serde(default)]
    pub expiry: Option<String>,
    /// Strike price for options.
    #[serde(default)]
    pub strike: Option<f64>,
    /// Minimum price increment.
    #[serde(default)]
    pub tick_size: Option<f64>,
    /// Contract lot size.
    #[serde(default)]
    pub lot_size: Option<u32>,
    /// `EQ`, `FUT`, `CE`, `PE`, ...
    #[serde(default)]
    pub instrument_type: Option<String>,
    /// Market segment.
    #[serde(default)]
    pub segment: Option<String>,
    /// Exchange, e.g. `NSE`.
    pub exchange: String,
}

/// Token/symbol lookup built from the instruments dump.
#[derive(Debug, Clone, Default)]
pub struct InstrumentTable {
    by_token: HashMap<u32, Instrument>,
    by_symbol: HashMap<String, u32>,
}

impl InstrumentTable {
    /// Parse a dump from any reader.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be read or no row parses.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, InstrumentError> {
        let mut csv = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut table = Self::default();
        let mut skipped = 0_usize;

        for row in csv.deserialize::<Instrument>() {
            match row {
                Ok(instrument) => table.insert(instrument),
                Err(e) => {
                    skipped += 1;
                    tracing::warn!(error = %e, "Skipping malformed instrument row");
                }
            }
        }

        if table.is_empty() {
            return Err(InstrumentError::Empty);
        }
        tracing::info!(instruments = table.len(), skipped, "Instrument table loaded");
        Ok(table)
    }

    /// Parse a dump held in memory.
    ///
    /// # Errors
    ///
    /// See [`InstrumentTable::from_reader`].
    pub fn from_csv_str(csv: &str) -> Result<Self, InstrumentError> {
        Self::from_reader(csv.as_bytes())
    }

    /// Parse a dump from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, or see
    /// [`InstrumentTable::from_reader`].
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, InstrumentError> {
        let file = std::fs::File::open(path.as_ref()).map_err(csv::Error::from)?;
        Self::from_reader(file)
    }

    /// Add or replace an instrument.
    pub fn insert(&mut self, instrument: Instrument) {
        self.by_symbol.insert(
            symbol_key(&instrument.exchange, &instrument.tradingsymbol),
            instrument.instrument_token,
        );
        self.by_token.insert(instrument.instrument_token, instrument);
    }

    /// Instrument for a token.
    #[must_use]
    pub fn get(&self, instrument_token: u32) -> Option<&Instrument> {
        self.by_token.get(&instrument_token)
    }

    /// Token for `exchange` and `tradingsymbol`.
    #[must_use]
    pub fn token_for(&self, exchange: &str, tradingsymbol: &str) -> Option<u32> {
        self.by_symbol
            .get(&symbol_key(exchange, tradingsymbol))
            .copied()
    }

    /// Tokens for `EXCHANGE:SYMBOL` keys. Unknown keys are skipped.
    #[must_use]
    pub fn tokens_for_keys<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Vec<u32> {
        keys.into_iter()
            .filter_map(|key| {
                let (exchange, symbol) = key.split_once(':')?;
                self.token_for(exchange, symbol)
            })
            .collect()
    }

    /// Number of instruments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }
}

impl SymbolResolver for InstrumentTable {
    fn resolve(&self, instrument_token: u32) -> Option<String> {
        self.get(instrument_token).map(|i| i.tradingsymbol.clone())
    }
}

fn symbol_key(exchange: &str, tradingsymbol: &str) -> String {
    format!(
        "{}:{}",
        exchange.to_ascii_uppercase(),
        tradingsymbol.to_ascii_uppercase()
    )
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const DUMP: &str = "\
instrument_token,exchange_token,tradingsymbol,name,last_price,expiry,strike,tick_size,lot_size,instrument_type,segment,exchange
408065,1594,INFY,INFOSYS,0,,,0.05,1,EQ,NSE,NSE
884737,3456,TATAMOTORS,TATA MOTORS,0,,,0.05,1,EQ,NSE,NSE
12345678,48225,NIFTY24JANFUT,NIFTY,0,2024-01-25,0,0.05,50,FUT,NFO-FUT,NFO
";

    #[test]
    fn parses_dump_and_resolves_both_ways() {
        let table = InstrumentTable::from_csv_str(DUMP).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.resolve(408_065).as_deref(), Some("INFY"));
        assert_eq!(table.token_for("nse", "tatamotors"), Some(884_737));

        let fut = table.get(12_345_678).unwrap();
        assert_eq!(fut.expiry.as_deref(), Some("2024-01-25"));
        assert_eq!(fut.lot_size, Some(50));
        assert!(table.get(408_065).unwrap().expiry.is_none());
    }

    #[test]
    fn keys_map_to_tokens() {
        let table = InstrumentTable::from_csv_str(DUMP).unwrap();
        assert_eq!(
            table.tokens_for_keys(["NSE:INFY", "NFO:NIFTY24JANFUT", "BSE:NOPE", "bad"]),
            vec![408_065, 12_345_678]
        );
    }

    #[test]
    fn malformed_rows_are_skipped() {
        let dump = format!("{DUMP}notanumber,1,BAD,,0,,,0.05,1,EQ,NSE,NSE\n");
        let table = InstrumentTable::from_csv_str(&dump).unwrap();
        assert_eq!(table.len(), 3);
        assert!(table.token_for("NSE", "BAD").is_none());
    }

    #[test]
    fn header_only_dump_is_empty() {
        let header = DUMP.lines().next().unwrap();
        assert!(matches!(
            InstrumentTable::from_csv_str(header),
            Err(InstrumentError::Empty)
        ));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(DUMP.as_bytes()).unwrap();

        let table = InstrumentTable::from_path(file.path()).unwrap();
        assert_eq!(table.resolve(884_737).as_deref(), Some("TATAMOTORS"));
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(matches!(
            InstrumentTable::from_path("/nonexistent/instruments.csv"),
            Err(InstrumentError::Read(_))
        ));
    }
}
