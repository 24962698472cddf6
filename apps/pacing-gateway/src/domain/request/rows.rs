//! Result Rows
//!
//! Rows delivered by the venue and buffered on a request. Prices and sizes
//! use `Decimal` to avoid float drift when rows are compared for pruning.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Aggregated bar (OHLCV).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    /// Bar open time.
    pub time: DateTime<Utc>,
    /// Open price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Close price.
    pub close: Decimal,
    /// Traded volume.
    pub volume: Decimal,
    /// Volume-weighted average price.
    pub wap: Decimal,
    /// Number of trades.
    pub count: u64,
}

/// Individual trade print.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeTick {
    /// Print time.
    pub time: DateTime<Utc>,
    /// Trade price.
    pub price: Decimal,
    /// Trade size.
    pub size: Decimal,
    /// Reporting exchange.
    pub exchange: String,
}

/// Top-of-book quote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteTick {
    /// Quote time.
    pub time: DateTime<Utc>,
    /// Best bid.
    pub bid: Decimal,
    /// Best ask.
    pub ask: Decimal,
    /// Bid size.
    pub bid_size: Decimal,
    /// Ask size.
    pub ask_size: Decimal,
}

/// Single snapshot field value (last, bid, volume, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickValue {
    /// Update time.
    pub time: DateTime<Utc>,
    /// Field name.
    pub field: String,
    /// Field value.
    pub value: Decimal,
}

/// One scanner result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRow {
    /// Rank within the scan.
    pub rank: u32,
    /// Matched symbol.
    pub symbol: String,
    /// Venue contract id.
    pub contract_id: i64,
}

/// A row of request results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Row {
    /// OHLCV bar.
    Bar(Bar),
    /// Trade print.
    Trade(TradeTick),
    /// Bid/ask quote.
    Quote(QuoteTick),
    /// Snapshot field value.
    Tick(TickValue),
    /// Scanner row.
    Scan(ScanRow),
    /// Fundamental report body.
    Report {
        /// Raw report body.
        body: String,
    },
    /// Earliest available data point.
    HeadTimestamp {
        /// Head timestamp.
        time: DateTime<Utc>,
    },
}

impl Row {
    /// Timestamp used for ordering, if the row carries one.
    #[must_use]
    pub const fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Bar(b) => Some(b.time),
            Self::Trade(t) => Some(t.time),
            Self::Quote(q) => Some(q.time),
            Self::Tick(t) => Some(t.time),
            Self::HeadTimestamp { time } => Some(*time),
            Self::Scan(_) | Self::Report { .. } => None,
        }
    }

    /// Coalescing key match: same variant and timestamp, plus the same
    /// field for snapshot values. Rows without a timestamp never match.
    #[must_use]
    pub fn same_key(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Tick(a), Self::Tick(b)) => a.time == b.time && a.field == b.field,
            (Self::Bar(_), Self::Bar(_))
            | (Self::Trade(_), Self::Trade(_))
            | (Self::Quote(_), Self::Quote(_))
            | (Self::HeadTimestamp { .. }, Self::HeadTimestamp { .. }) => {
                self.timestamp() == other.timestamp()
            }
            _ => false,
        }
    }

    /// Traded volume, for rows that carry one.
    #[must_use]
    pub const fn volume(&self) -> Option<Decimal> {
        match self {
            Self::Bar(b) => Some(b.volume),
            Self::Trade(t) => Some(t.size),
            _ => None,
        }
    }

    /// Fields compared when pruning unchanged bid/ask rows.
    #[must_use]
    pub fn tracked_fields(&self) -> Vec<Decimal> {
        match self {
            Self::Bar(b) => vec![b.open, b.high, b.low, b.close],
            Self::Quote(q) => vec![q.bid, q.ask, q.bid_size, q.ask_size],
            Self::Trade(t) => vec![t.price, t.size],
            Self::Tick(t) => vec![t.value],
            Self::Scan(_) | Self::Report { .. } | Self::HeadTimestamp { .. } => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    use super::*;

    fn tick(sec: u32, field: &str, value: i64) -> Row {
        Row::Tick(TickValue {
            time: Utc.with_ymd_and_hms(2024, 1, 2, 15, 0, sec).unwrap(),
            field: field.to_string(),
            value: Decimal::from(value),
        })
    }

    #[test]
    fn tick_key_includes_field() {
        assert!(tick(1, "last", 10).same_key(&tick(1, "last", 11)));
        assert!(!tick(1, "last", 10).same_key(&tick(1, "bid", 10)));
        assert!(!tick(1, "last", 10).same_key(&tick(2, "last", 10)));
    }

    #[test]
    fn rows_without_time_never_coalesce() {
        let a = Row::Report {
            body: "a".to_string(),
        };
        assert!(!a.same_key(&a.clone()));
        assert!(a.timestamp().is_none());
    }

    #[test]
    fn serializes_with_type_tag() {
        let json = serde_json::to_value(tick(0, "last", 5)).unwrap();
        assert_eq!(json["type"], "tick");
        assert_eq!(json["field"], "last");
    }
}
