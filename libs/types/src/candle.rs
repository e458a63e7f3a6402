//! OHLCV candles and stream intervals
//!
//! Candles arrive from the upstream feed with millisecond start times; the
//! internal representation uses epoch seconds. Each `(symbol, interval)`
//! pair is a distinct stream.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::symbol::Symbol;

/// Candle timeframe, mirroring the upstream interval codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    /// 1 minute
    Min1,
    /// 3 minutes
    Min3,
    /// 5 minutes
    Min5,
    /// 15 minutes
    Min15,
    /// 30 minutes
    Min30,
    /// 1 hour
    Hour1,
    /// 2 hours
    Hour2,
    /// 4 hours
    Hour4,
    /// 1 day
    Day,
    /// 1 week
    Week,
}

impl Interval {
    /// All supported intervals.
    pub const ALL: [Interval; 10] = [
        Interval::Min1,
        Interval::Min3,
        Interval::Min5,
        Interval::Min15,
        Interval::Min30,
        Interval::Hour1,
        Interval::Hour2,
        Interval::Hour4,
        Interval::Day,
        Interval::Week,
    ];

    /// Upstream interval code ("1", "3", ..., "D", "W").
    pub fn code(&self) -> &'static str {
        match self {
            Interval::Min1 => "1",
            Interval::Min3 => "3",
            Interval::Min5 => "5",
            Interval::Min15 => "15",
            Interval::Min30 => "30",
            Interval::Hour1 => "60",
            Interval::Hour2 => "120",
            Interval::Hour4 => "240",
            Interval::Day => "D",
            Interval::Week => "W",
        }
    }

    /// Resolve an upstream interval code.
    pub fn from_code(code: &str) -> Option<Interval> {
        Interval::ALL.into_iter().find(|ivl| ivl.code() == code)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// A stream subscription key: one symbol at one interval.
///
/// Displays in the `<SYMBOL>:<interval>` form used on the consumer surface,
/// e.g. `BTCUSDT:1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    pub symbol: Symbol,
    pub interval: Interval,
}

impl StreamKey {
    pub fn new(symbol: Symbol, interval: Interval) -> Self {
        Self { symbol, interval }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.symbol.upstream(), self.interval.code())
    }
}

/// A single OHLCV candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: Symbol,
    pub interval: Interval,
    /// Candle start, seconds since epoch.
    pub time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    /// Whether the upstream has closed this candle.
    pub confirm: bool,
}
