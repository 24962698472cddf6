//! Request Parameters
//!
//! Closed, validated parameter types for every request kind. Parameters are
//! an adjacently tagged enum (`kind` + `params`) so that requests arriving as
//! JSON are rejected when they carry fields the kind does not define.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::error::ValidationError;

/// Smallest bar size accepted for keep-up-to-date historical requests.
pub const MIN_STREAMING_BAR_SECONDS: i64 = 5;

/// Bars at or below this length are "small bars" with stricter pacing.
pub const SMALL_BAR_MAX_SECONDS: i64 = 30;

/// Longest bar accepted, one nominal year.
pub const MAX_BAR_SECONDS: i64 = 366 * 86_400;

/// Maximum ticks returned by a single historical tick request.
pub const MAX_HISTORICAL_TICKS: u32 = 1_000;

/// Maximum rows a scanner subscription may request.
pub const MAX_SCANNER_ROWS: u32 = 50;

// =============================================================================
// Instrument
// =============================================================================

/// A resolved tradeable contract.
///
/// Resolution and disambiguation happen upstream; this type only carries
/// the identity needed for accounting and for the outbound request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Instrument {
    /// Ticker or local symbol.
    pub symbol: String,
    /// Security type (`STK`, `FUT`, `OPT`, ...).
    #[serde(default = "default_security_type")]
    pub security_type: String,
    /// Routing exchange.
    #[serde(default = "default_exchange")]
    pub exchange: String,
    /// Trading currency.
    #[serde(default = "default_currency")]
    pub currency: String,
    /// Venue contract identifier, when already resolved.
    #[serde(default)]
    pub contract_id: Option<i64>,
}

fn default_security_type() -> String {
    "STK".to_string()
}

fn default_exchange() -> String {
    "SMART".to_string()
}

fn default_currency() -> String {
    "USD".to_string()
}

impl Instrument {
    /// Smart-routed USD stock.
    #[must_use]
    pub fn stock(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            security_type: default_security_type(),
            exchange: default_exchange(),
            currency: default_currency(),
            contract_id: None,
        }
    }

    /// Attach a resolved contract identifier.
    #[must_use]
    pub const fn with_contract_id(mut self, contract_id: i64) -> Self {
        self.contract_id = Some(contract_id);
        self
    }

    /// Accounting key used by per-instrument restriction classes.
    #[must_use]
    pub fn key(&self) -> String {
        self.contract_id.map_or_else(
            || {
                format!(
                    "{}:{}:{}:{}",
                    self.symbol, self.security_type, self.exchange, self.currency
                )
            },
            |id| format!("conid:{id}"),
        )
    }
}

// =============================================================================
// Bar Size
// =============================================================================

/// Granularity unit of a bar size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BarUnit {
    /// Seconds.
    Second,
    /// Minutes.
    Minute,
    /// Hours.
    Hour,
    /// Trading days.
    Day,
    /// Weeks.
    Week,
    /// Months.
    Month,
}

impl BarUnit {
    const fn seconds(self) -> i64 {
        match self {
            Self::Second => 1,
            Self::Minute => 60,
            Self::Hour => 3_600,
            Self::Day => 86_400,
            Self::Week => 7 * 86_400,
            Self::Month => 30 * 86_400,
        }
    }

    const fn label(self, plural: bool) -> &'static str {
        match (self, plural) {
            (Self::Second, _) => "secs",
            (Self::Minute, false) => "min",
            (Self::Minute, true) => "mins",
            (Self::Hour, false) => "hour",
            (Self::Hour, true) => "hours",
            (Self::Day, false) => "day",
            (Self::Day, true) => "days",
            (Self::Week, false) => "week",
            (Self::Week, true) => "weeks",
            (Self::Month, false) => "month",
            (Self::Month, true) => "months",
        }
    }
}

/// Aggregation size of bar data, e.g. `5 secs` or `1 day`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BarSize {
    count: u32,
    unit: BarUnit,
}

impl BarSize {
    /// Create a bar size. Zero counts are rejected during validation.
    #[must_use]
    pub const fn new(count: u32, unit: BarUnit) -> Self {
        Self { count, unit }
    }

    /// Seconds-based bar size.
    #[must_use]
    pub const fn seconds(count: u32) -> Self {
        Self::new(count, BarUnit::Second)
    }

    /// Minutes-based bar size.
    #[must_use]
    pub const fn minutes(count: u32) -> Self {
        Self::new(count, BarUnit::Minute)
    }

    /// Day bars.
    #[must_use]
    pub const fn days(count: u32) -> Self {
        Self::new(count, BarUnit::Day)
    }

    /// Number of units per bar.
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }

    /// Granularity unit.
    #[must_use]
    pub const fn unit(&self) -> BarUnit {
        self.unit
    }

    /// Nominal length of one bar (months count as 30 days). Saturates at
    /// `TimeDelta::MAX` instead of overflowing.
    #[must_use]
    pub fn duration(&self) -> TimeDelta {
        i64::from(self.count)
            .checked_mul(self.unit.seconds())
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX)
    }

    /// Non-zero and no longer than [`MAX_BAR_SECONDS`].
    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.count > 0 && self.duration() <= TimeDelta::seconds(MAX_BAR_SECONDS)
    }

    /// Bars of 30 seconds or less are subject to the high-frequency rules.
    #[must_use]
    pub fn is_small(&self) -> bool {
        self.duration() <= TimeDelta::seconds(SMALL_BAR_MAX_SECONDS)
    }

    /// Day-or-coarser aggregation follows trading-day boundaries.
    #[must_use]
    pub fn is_daily_or_coarser(&self) -> bool {
        self.unit >= BarUnit::Day
    }
}

impl fmt::Display for BarSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.count, self.unit.label(self.count != 1))
    }
}

impl FromStr for BarSize {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidBarSize(s.to_string());
        let mut parts = s.split_whitespace();
        let count = parts
            .next()
            .and_then(|c| c.parse::<u32>().ok())
            .ok_or_else(invalid)?;
        let unit = match parts.next().map(str::to_lowercase).as_deref() {
            Some("sec" | "secs" | "second" | "seconds" | "s") => BarUnit::Second,
            Some("min" | "mins" | "minute" | "minutes") => BarUnit::Minute,
            Some("hour" | "hours" | "h") => BarUnit::Hour,
            Some("day" | "days" | "d") => BarUnit::Day,
            Some("week" | "weeks" | "w") => BarUnit::Week,
            Some("month" | "months" | "m") => BarUnit::Month,
            _ => return Err(invalid()),
        };
        if parts.next().is_some() {
            return Err(invalid());
        }
        let size = Self::new(count, unit);
        if size.duration() > TimeDelta::seconds(MAX_BAR_SECONDS) {
            return Err(invalid());
        }
        Ok(size)
    }
}

impl TryFrom<String> for BarSize {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BarSize> for String {
    fn from(value: BarSize) -> Self {
        value.to_string()
    }
}

// =============================================================================
// Data Feeds
// =============================================================================

/// Which prices a bar request aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WhatToShow {
    /// Trade prices and volume.
    #[default]
    Trades,
    /// Bid/ask midpoint.
    Midpoint,
    /// Bid side.
    Bid,
    /// Ask side.
    Ask,
    /// Combined bid/ask feed (double venue-side cost).
    BidAsk,
}

/// Tick-level feed selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TickFeed {
    /// Last trade ticks.
    #[default]
    Trades,
    /// Combined bid/ask ticks.
    BidAsk,
    /// Midpoint ticks.
    Midpoint,
}

// =============================================================================
// Per-kind Parameters
// =============================================================================

/// One-shot top-of-book snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotParams {
    /// Additional generic tick types to include.
    #[serde(default)]
    pub generic_ticks: Vec<String>,
    /// Request a regulatory (NBBO) snapshot.
    #[serde(default)]
    pub regulatory: bool,
}

/// Streaming real-time bars.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamingBarParams {
    /// Feed the bars aggregate.
    #[serde(default)]
    pub what_to_show: WhatToShow,
    /// Restrict to regular trading hours.
    #[serde(default)]
    pub regular_hours_only: bool,
}

/// Streaming tick-by-tick data.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamingTickParams {
    /// Tick feed.
    #[serde(default)]
    pub feed: TickFeed,
    /// Ignore size-only updates.
    #[serde(default)]
    pub ignore_size: bool,
}

/// Historical bars over a date range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistoricalParams {
    /// Inclusive range start.
    pub start: DateTime<Utc>,
    /// Range end; `None` means "now".
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    /// Aggregation size.
    pub bar_size: BarSize,
    /// Feed the bars aggregate.
    #[serde(default)]
    pub what_to_show: WhatToShow,
    /// Restrict to regular trading hours.
    #[serde(default)]
    pub regular_hours_only: bool,
    /// Keep streaming bar updates after the initial range.
    #[serde(default)]
    pub keep_up_to_date: bool,
}

impl HistoricalParams {
    /// Bars for `[start, end]` with trade data.
    #[must_use]
    pub const fn new(start: DateTime<Utc>, end: Option<DateTime<Utc>>, bar_size: BarSize) -> Self {
        Self {
            start,
            end,
            bar_size,
            what_to_show: WhatToShow::Trades,
            regular_hours_only: false,
            keep_up_to_date: false,
        }
    }

    /// Same parameters over a different window.
    #[must_use]
    pub fn with_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end: Some(end),
            ..self.clone()
        }
    }
}

/// Historical tick data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistoricalTickParams {
    /// First tick time.
    pub start: DateTime<Utc>,
    /// Optional last tick time.
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    /// Number of ticks to return.
    pub number_of_ticks: u32,
    /// Tick feed.
    #[serde(default)]
    pub feed: TickFeed,
    /// Restrict to regular trading hours.
    #[serde(default)]
    pub regular_hours_only: bool,
}

/// Market scanner subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScannerParams {
    /// Scan code, e.g. `TOP_PERC_GAIN`.
    pub scan_code: String,
    /// Location code, e.g. `STK.US.MAJOR`.
    pub location: String,
    /// Instrument type, e.g. `STK`.
    #[serde(default = "default_security_type")]
    pub instrument_type: String,
    /// Number of rows.
    #[serde(default = "default_scanner_rows")]
    pub rows: u32,
}

const fn default_scanner_rows() -> u32 {
    MAX_SCANNER_ROWS
}

/// Fundamental report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FundamentalParams {
    /// Report type, e.g. `ReportSnapshot`.
    pub report_type: String,
}

/// Earliest available data point.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeadTimestampParams {
    /// Feed to query.
    #[serde(default)]
    pub what_to_show: WhatToShow,
    /// Restrict to regular trading hours.
    #[serde(default)]
    pub regular_hours_only: bool,
}

// =============================================================================
// Request Kind and Parameters
// =============================================================================

/// Request kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Market data snapshot.
    Snapshot,
    /// Streaming real-time bars.
    StreamingBar,
    /// Streaming tick-by-tick data.
    StreamingTick,
    /// Historical bars.
    Historical,
    /// Historical ticks.
    HistoricalTick,
    /// Scanner subscription.
    Scanner,
    /// Fundamental report.
    Fundamental,
    /// Head timestamp.
    HeadTimestamp,
}

impl RequestKind {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::StreamingBar => "streaming_bar",
            Self::StreamingTick => "streaming_tick",
            Self::Historical => "historical",
            Self::HistoricalTick => "historical_tick",
            Self::Scanner => "scanner",
            Self::Fundamental => "fundamental",
            Self::HeadTimestamp => "head_timestamp",
        }
    }
}

/// Kind-specific request parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "params", rename_all = "snake_case")]
pub enum RequestParams {
    /// Market data snapshot.
    Snapshot(SnapshotParams),
    /// Streaming real-time bars.
    StreamingBar(StreamingBarParams),
    /// Streaming tick-by-tick data.
    StreamingTick(StreamingTickParams),
    /// Historical bars.
    Historical(HistoricalParams),
    /// Historical ticks.
    HistoricalTick(HistoricalTickParams),
    /// Scanner subscription.
    Scanner(ScannerParams),
    /// Fundamental report.
    Fundamental(FundamentalParams),
    /// Head timestamp.
    HeadTimestamp(HeadTimestampParams),
}

impl RequestParams {
    /// The request kind these parameters describe.
    #[must_use]
    pub const fn kind(&self) -> RequestKind {
        match self {
            Self::Snapshot(_) => RequestKind::Snapshot,
            Self::StreamingBar(_) => RequestKind::StreamingBar,
            Self::StreamingTick(_) => RequestKind::StreamingTick,
            Self::Historical(_) => RequestKind::Historical,
            Self::HistoricalTick(_) => RequestKind::HistoricalTick,
            Self::Scanner(_) => RequestKind::Scanner,
            Self::Fundamental(_) => RequestKind::Fundamental,
            Self::HeadTimestamp(_) => RequestKind::HeadTimestamp,
        }
    }

    /// Bounded requests receive a terminal callback; unbounded ones stream
    /// until cancelled.
    #[must_use]
    pub const fn is_bounded(&self) -> bool {
        match self {
            Self::StreamingBar(_) | Self::StreamingTick(_) => false,
            Self::Historical(p) => !p.keep_up_to_date,
            Self::Snapshot(_)
            | Self::HistoricalTick(_)
            | Self::Scanner(_)
            | Self::Fundamental(_)
            | Self::HeadTimestamp(_) => true,
        }
    }

    /// Small-bar predicate. Historical ticks are paced like small bars.
    #[must_use]
    pub fn is_small_bar(&self) -> bool {
        match self {
            Self::Historical(p) => p.bar_size.is_small(),
            Self::HistoricalTick(_) => true,
            _ => false,
        }
    }

    /// Number of accounting entries one send costs.
    #[must_use]
    pub const fn cost(&self) -> usize {
        match self {
            Self::Historical(HistoricalParams {
                what_to_show: WhatToShow::BidAsk,
                ..
            })
            | Self::HistoricalTick(HistoricalTickParams {
                feed: TickFeed::BidAsk,
                ..
            }) => 2,
            _ => 1,
        }
    }

    /// Structural preconditions checked before a request may be queued.
    ///
    /// # Errors
    ///
    /// Returns the first violated precondition.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Historical(p) => {
                if !p.bar_size.is_supported() {
                    return Err(ValidationError::InvalidBarSize(p.bar_size.to_string()));
                }
                if p.keep_up_to_date {
                    if p.end.is_some() {
                        return Err(ValidationError::StreamingWithEndDate);
                    }
                    if p.bar_size.duration() < TimeDelta::seconds(MIN_STREAMING_BAR_SECONDS) {
                        return Err(ValidationError::StreamingBarTooSmall {
                            bar_size: p.bar_size.to_string(),
                            minimum_secs: MIN_STREAMING_BAR_SECONDS,
                        });
                    }
                }
                if let Some(end) = p.end
                    && end <= p.start
                {
                    return Err(ValidationError::EmptyRange {
                        start: p.start,
                        end,
                    });
                }
                Ok(())
            }
            Self::HistoricalTick(p) => {
                if p.number_of_ticks == 0 || p.number_of_ticks > MAX_HISTORICAL_TICKS {
                    return Err(ValidationError::TickCount(p.number_of_ticks));
                }
                if let Some(end) = p.end
                    && end <= p.start
                {
                    return Err(ValidationError::EmptyRange {
                        start: p.start,
                        end,
                    });
                }
                Ok(())
            }
            Self::Scanner(p) => {
                if p.scan_code.trim().is_empty() {
                    return Err(ValidationError::EmptyField("scan_code"));
                }
                if p.location.trim().is_empty() {
                    return Err(ValidationError::EmptyField("location"));
                }
                if p.rows == 0 || p.rows > MAX_SCANNER_ROWS {
                    return Err(ValidationError::ScannerRows(p.rows));
                }
                Ok(())
            }
            Self::Fundamental(p) => {
                if p.report_type.trim().is_empty() {
                    return Err(ValidationError::EmptyField("report_type"));
                }
                Ok(())
            }
            Self::Snapshot(_)
            | Self::StreamingBar(_)
            | Self::StreamingTick(_)
            | Self::HeadTimestamp(_) => Ok(()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use test_case::test_case;

    use super::*;
    use crate::domain::restriction::RestrictionClass;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, h, 0, 0).unwrap()
    }

    #[test_case("5 secs", BarSize::seconds(5) ; "seconds plural")]
    #[test_case("1 secs", BarSize::seconds(1) ; "venue style single second")]
    #[test_case("1 min", BarSize::minutes(1) ; "single minute")]
    #[test_case("30 MINS", BarSize::minutes(30) ; "upper case")]
    #[test_case("1 hour", BarSize::new(1, BarUnit::Hour) ; "hour")]
    #[test_case("1 day", BarSize::days(1) ; "day")]
    #[test_case("2 weeks", BarSize::new(2, BarUnit::Week) ; "weeks")]
    #[test_case("1 month", BarSize::new(1, BarUnit::Month) ; "month")]
    fn bar_size_parses(input: &str, expected: BarSize) {
        assert_eq!(input.parse::<BarSize>().unwrap(), expected);
    }

    #[test_case("" ; "empty")]
    #[test_case("five secs" ; "non numeric")]
    #[test_case("5 fortnights" ; "unknown unit")]
    #[test_case("5 secs extra" ; "trailing garbage")]
    #[test_case("4294967295 months" ; "beyond time range")]
    #[test_case("13 months" ; "longer than a year")]
    fn bar_size_rejects(input: &str) {
        assert!(input.parse::<BarSize>().is_err());
    }

    #[test]
    fn oversized_bar_saturates_and_fails_validation() {
        let huge = BarSize::new(u32::MAX, BarUnit::Month);
        assert_eq!(huge.duration(), TimeDelta::MAX);
        assert!(!huge.is_small());
        assert!(!huge.is_supported());

        let params = RequestParams::Historical(HistoricalParams::new(ts(10), Some(ts(12)), huge));
        assert!(RestrictionClass::for_params(&params).contains(&RestrictionClass::SimultaneousHistorical));
        assert_eq!(
            params.validate(),
            Err(ValidationError::InvalidBarSize(huge.to_string()))
        );
    }

    #[test]
    fn bar_size_display_round_trips_through_serde() {
        let json = serde_json::to_string(&BarSize::minutes(1)).unwrap();
        assert_eq!(json, "\"1 min\"");
        let back: BarSize = serde_json::from_str("\"15 mins\"").unwrap();
        assert_eq!(back, BarSize::minutes(15));
    }

    #[test]
    fn small_bar_boundary_is_thirty_seconds() {
        assert!(BarSize::seconds(30).is_small());
        assert!(!BarSize::minutes(1).is_small());
        assert!(!BarSize::seconds(31).is_small());
    }

    #[test]
    fn instrument_key_prefers_contract_id() {
        let plain = Instrument::stock("AAPL");
        assert_eq!(plain.key(), "AAPL:STK:SMART:USD");
        assert_eq!(plain.with_contract_id(265_598).key(), "conid:265598");
    }

    #[test]
    fn streaming_historical_rejects_end_date() {
        let mut p = HistoricalParams::new(ts(1), Some(ts(2)), BarSize::seconds(5));
        p.keep_up_to_date = true;
        assert!(matches!(
            RequestParams::Historical(p).validate(),
            Err(ValidationError::StreamingWithEndDate)
        ));
    }

    #[test]
    fn streaming_historical_rejects_tiny_bars() {
        let mut p = HistoricalParams::new(ts(1), None, BarSize::seconds(1));
        p.keep_up_to_date = true;
        assert!(matches!(
            RequestParams::Historical(p).validate(),
            Err(ValidationError::StreamingBarTooSmall { .. })
        ));
    }

    #[test]
    fn historical_rejects_inverted_range() {
        let p = HistoricalParams::new(ts(5), Some(ts(2)), BarSize::minutes(1));
        assert!(matches!(
            RequestParams::Historical(p).validate(),
            Err(ValidationError::EmptyRange { .. })
        ));
    }

    #[test]
    fn bid_ask_costs_double() {
        let mut p = HistoricalParams::new(ts(1), Some(ts(2)), BarSize::seconds(5));
        assert_eq!(RequestParams::Historical(p.clone()).cost(), 1);
        p.what_to_show = WhatToShow::BidAsk;
        assert_eq!(RequestParams::Historical(p).cost(), 2);
    }

    #[test]
    fn keep_up_to_date_is_unbounded() {
        let mut p = HistoricalParams::new(ts(1), None, BarSize::seconds(5));
        assert!(RequestParams::Historical(p.clone()).is_bounded());
        p.keep_up_to_date = true;
        assert!(!RequestParams::Historical(p).is_bounded());
        assert!(!RequestParams::StreamingBar(StreamingBarParams::default()).is_bounded());
    }

    #[test]
    fn params_deserialize_with_kind_tag() {
        let json = r#"{"kind":"historical","params":{"start":"2024-03-04T14:30:00Z","bar_size":"5 secs"}}"#;
        let params: RequestParams = serde_json::from_str(json).unwrap();
        assert_eq!(params.kind(), RequestKind::Historical);
        assert!(params.is_small_bar());
    }

    #[test]
    fn params_reject_unknown_fields() {
        let json = r#"{"kind":"fundamental","params":{"report_type":"ReportSnapshot","colour":"red"}}"#;
        assert!(serde_json::from_str::<RequestParams>(json).is_err());
    }

    #[test]
    fn scanner_rows_bounded() {
        let p = ScannerParams {
            scan_code: "TOP_PERC_GAIN".to_string(),
            location: "STK.US.MAJOR".to_string(),
            instrument_type: "STK".to_string(),
            rows: 51,
        };
        assert!(matches!(
            RequestParams::Scanner(p).validate(),
            Err(ValidationError::ScannerRows(51))
        ));
    }
}
