//! Canonical market-data records.
//!
//! All broker payloads normalize into these types. A live-streamed
//! record is provisional until a historic/settlement fetch confirms it;
//! consumers may therefore see a provisional record followed by a
//! corrected, non-provisional one for the same timestamp.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Origin of a canonical record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordSource {
    /// Delivered by the streaming connection.
    Live,
    /// Delivered by a historic/settlement fetch.
    Historic,
}

/// A timestamped bid/ask quote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    /// Canonical instrument symbol.
    pub instrument: String,
    /// Event timestamp (UTC).
    pub timestamp: DateTime<Utc>,
    /// Best bid price.
    pub bid: Decimal,
    /// Best ask price.
    pub ask: Decimal,
    /// Not yet confirmed by a settlement/historic source.
    pub provisional: bool,
    /// Where the record came from.
    pub source: RecordSource,
}

/// A single executed trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeTick {
    /// Canonical instrument symbol.
    pub instrument: String,
    /// Event timestamp (UTC).
    pub timestamp: DateTime<Utc>,
    /// Trade price.
    pub price: Decimal,
    /// Trade size.
    pub size: Decimal,
    /// Not yet confirmed by a settlement/historic source.
    pub provisional: bool,
    /// Where the record came from.
    pub source: RecordSource,
}

/// An OHLCV candle for a fixed interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    /// Canonical instrument symbol.
    pub instrument: String,
    /// Interval open timestamp (UTC).
    pub timestamp: DateTime<Utc>,
    /// Open price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Close price.
    pub close: Decimal,
    /// Traded volume over the interval.
    pub volume: Decimal,
    /// Not yet confirmed by a settlement/historic source.
    pub provisional: bool,
    /// Where the record came from.
    pub source: RecordSource,
}

impl Candle {
    /// Whether two candles agree on all price/volume fields.
    #[must_use]
    pub fn same_values(&self, other: &Self) -> bool {
        self.open == other.open
            && self.high == other.high
            && self.low == other.low
            && self.close == other.close
            && self.volume == other.volume
    }
}

/// A canonical record of any channel kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketRecord {
    /// Bid/ask quote.
    Quote(Quote),
    /// Executed trade.
    Trade(TradeTick),
    /// OHLCV candle.
    Candle(Candle),
}

impl MarketRecord {
    /// Canonical instrument symbol.
    #[must_use]
    pub fn instrument(&self) -> &str {
        match self {
            Self::Quote(q) => &q.instrument,
            Self::Trade(t) => &t.instrument,
            Self::Candle(c) => &c.instrument,
        }
    }

    /// Event timestamp.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Quote(q) => q.timestamp,
            Self::Trade(t) => t.timestamp,
            Self::Candle(c) => c.timestamp,
        }
    }

    /// Whether the record is still provisional.
    #[must_use]
    pub const fn is_provisional(&self) -> bool {
        match self {
            Self::Quote(q) => q.provisional,
            Self::Trade(t) => t.provisional,
            Self::Candle(c) => c.provisional,
        }
    }

    /// Where the record came from.
    #[must_use]
    pub const fn source(&self) -> RecordSource {
        match self {
            Self::Quote(q) => q.source,
            Self::Trade(t) => t.source,
            Self::Candle(c) => c.source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn candle(close: Decimal) -> Candle {
        Candle {
            instrument: "EURUSD".to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
            open: dec!(1.0840),
            high: dec!(1.0855),
            low: dec!(1.0838),
            close,
            volume: dec!(1250),
            provisional: true,
            source: RecordSource::Live,
        }
    }

    #[test]
    fn same_values_ignores_flags() {
        let live = candle(dec!(1.0850));
        let mut confirmed = candle(dec!(1.0850));
        confirmed.provisional = false;
        confirmed.source = RecordSource::Historic;
        assert!(live.same_values(&confirmed));
    }

    #[test]
    fn same_values_detects_differing_close() {
        let live = candle(dec!(1.0850));
        let confirmed = candle(dec!(1.0851));
        assert!(!live.same_values(&confirmed));
    }

    #[test]
    fn record_accessors() {
        let record = MarketRecord::Candle(candle(dec!(1.0850)));
        assert_eq!(record.instrument(), "EURUSD");
        assert!(record.is_provisional());
        assert_eq!(record.source(), RecordSource::Live);
    }
}
