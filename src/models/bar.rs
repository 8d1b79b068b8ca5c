//! OHLCV price bars and ticker snapshots.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// One OHLCV candle. Immutable once produced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    /// Bar open time, epoch milliseconds
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl PriceBar {
    pub fn new(timestamp: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Bar open time as a UTC datetime.
    pub fn datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.timestamp)
            .single()
            .unwrap_or_default()
    }
}

/// ccxt returns candles as `[ts, o, h, l, c, v]` arrays; recorded feeds may
/// also hold plain objects.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum RawBar {
    Array(i64, f64, f64, f64, f64, f64),
    Object(PriceBar),
}

impl From<RawBar> for PriceBar {
    fn from(raw: RawBar) -> Self {
        match raw {
            RawBar::Array(ts, o, h, l, c, v) => PriceBar::new(ts, o, h, l, c, v),
            RawBar::Object(bar) => bar,
        }
    }
}

/// Latest traded price for a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last: f64,
    pub timestamp: i64,
}
