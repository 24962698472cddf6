//! Restriction Classes and Policies

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::domain::request::params::RequestParams;

// =============================================================================
// Restriction Class
// =============================================================================

/// A named, independently enforced rate or concurrency limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestrictionClass {
    /// Concurrent historical requests.
    SimultaneousHistorical,
    /// Concurrent market data lines (snapshots, streams).
    SimultaneousStreams,
    /// Concurrent scanner subscriptions.
    SimultaneousScanners,
    /// Concurrent tick-by-tick streams.
    SimultaneousTickStreams,
    /// Identical small-bar requests within a window.
    IdenticalHighFreq,
    /// Small-bar requests on one instrument within a window.
    SameInstrumentHighFreq,
    /// Small-bar requests overall within a window.
    GlobalHighFreqWindow,
    /// Tick-stream subscriptions on one instrument within a window.
    TickStreamSameInstrument,
}

/// How a class partitions its accounting containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keying {
    /// One container for the whole class.
    Global,
    /// One container per instrument key.
    PerInstrument,
    /// One container per request fingerprint (instrument, kind, parameters).
    PerRequestIdentity,
}

impl RestrictionClass {
    /// Every class.
    pub const ALL: [Self; 8] = [
        Self::SimultaneousHistorical,
        Self::SimultaneousStreams,
        Self::SimultaneousScanners,
        Self::SimultaneousTickStreams,
        Self::IdenticalHighFreq,
        Self::SameInstrumentHighFreq,
        Self::GlobalHighFreqWindow,
        Self::TickStreamSameInstrument,
    ];

    /// Stable label for logs, metrics and configuration.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SimultaneousHistorical => "simultaneous-historical",
            Self::SimultaneousStreams => "simultaneous-streams",
            Self::SimultaneousScanners => "simultaneous-scanners",
            Self::SimultaneousTickStreams => "simultaneous-tick-streams",
            Self::IdenticalHighFreq => "identical-high-freq",
            Self::SameInstrumentHighFreq => "same-instrument-high-freq",
            Self::GlobalHighFreqWindow => "global-high-freq-window",
            Self::TickStreamSameInstrument => "tick-stream-same-instrument",
        }
    }

    /// Container partitioning for this class.
    #[must_use]
    pub const fn keying(&self) -> Keying {
        match self {
            Self::IdenticalHighFreq => Keying::PerRequestIdentity,
            Self::SameInstrumentHighFreq | Self::TickStreamSameInstrument => Keying::PerInstrument,
            _ => Keying::Global,
        }
    }

    /// Classes a request with these parameters is subject to.
    #[must_use]
    pub fn for_params(params: &RequestParams) -> Vec<Self> {
        const HIGH_FREQ: [RestrictionClass; 3] = [
            RestrictionClass::IdenticalHighFreq,
            RestrictionClass::SameInstrumentHighFreq,
            RestrictionClass::GlobalHighFreqWindow,
        ];

        match params {
            RequestParams::Historical(p) => {
                let mut classes = if p.keep_up_to_date {
                    vec![Self::SimultaneousStreams]
                } else {
                    vec![Self::SimultaneousHistorical]
                };
                if params.is_small_bar() {
                    classes.extend(HIGH_FREQ);
                }
                classes
            }
            RequestParams::HistoricalTick(_) => {
                let mut classes = vec![Self::SimultaneousHistorical];
                classes.extend(HIGH_FREQ);
                classes
            }
            RequestParams::HeadTimestamp(_) => vec![Self::SimultaneousHistorical],
            RequestParams::Snapshot(_) | RequestParams::StreamingBar(_) => {
                vec![Self::SimultaneousStreams]
            }
            RequestParams::StreamingTick(_) => vec![
                Self::SimultaneousTickStreams,
                Self::TickStreamSameInstrument,
            ],
            RequestParams::Scanner(_) => vec![Self::SimultaneousScanners],
            RequestParams::Fundamental(_) => Vec::new(),
        }
    }

    /// Environment variable suffix, e.g. `SIMULTANEOUS_HISTORICAL`.
    #[must_use]
    pub fn env_suffix(&self) -> String {
        self.as_str().replace('-', "_").to_uppercase()
    }
}

impl fmt::Display for RestrictionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Restriction Policy
// =============================================================================

/// The shape of a class limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestrictionPolicy {
    /// At most `max_concurrent` live (sent, unfinished) requests.
    Ceiling {
        /// Live-set capacity.
        max_concurrent: usize,
    },
    /// At most `max_count` registrations within any `window`.
    Window {
        /// Entries allowed per window.
        max_count: usize,
        /// Sliding window length.
        window: Duration,
    },
}

impl RestrictionPolicy {
    /// Concurrency ceiling.
    #[must_use]
    pub const fn ceiling(max_concurrent: usize) -> Self {
        Self::Ceiling { max_concurrent }
    }

    /// Sliding window of `max_count` per `window`.
    #[must_use]
    pub const fn window(max_count: usize, window: Duration) -> Self {
        Self::Window { max_count, window }
    }

    /// Entry capacity of the policy.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        match self {
            Self::Ceiling { max_concurrent } => *max_concurrent,
            Self::Window { max_count, .. } => *max_count,
        }
    }
}

impl fmt::Display for RestrictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ceiling { max_concurrent } => write!(f, "{max_concurrent}"),
            Self::Window { max_count, window } => {
                write!(f, "{max_count}/{}", window.as_secs_f64())
            }
        }
    }
}

/// Policy string could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid restriction policy {0:?}: expected \"N\" or \"N/SECS\"")]
pub struct PolicyParseError(pub String);

impl FromStr for RestrictionPolicy {
    type Err = PolicyParseError;

    /// Parses `"N"` as a ceiling and `"N/SECS"` as a window.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PolicyParseError(s.to_string());
        match s.trim().split_once('/') {
            None => s
                .trim()
                .parse::<usize>()
                .map(Self::ceiling)
                .map_err(|_| invalid()),
            Some((count, secs)) => {
                let max_count = count.trim().parse::<usize>().map_err(|_| invalid())?;
                let secs = secs.trim().parse::<f64>().map_err(|_| invalid())?;
                let window = Duration::try_from_secs_f64(secs).map_err(|_| invalid())?;
                if window.is_zero() {
                    return Err(invalid());
                }
                Ok(Self::window(max_count, window))
            }
        }
    }
}

// =============================================================================
// Policy Table
// =============================================================================

/// Policy per restriction class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyTable {
    policies: HashMap<RestrictionClass, RestrictionPolicy>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        let policies = RestrictionClass::ALL
            .into_iter()
            .map(|class| (class, Self::default_policy(class)))
            .collect();
        Self { policies }
    }
}

impl PolicyTable {
    /// Venue defaults for `class`.
    #[must_use]
    pub const fn default_policy(class: RestrictionClass) -> RestrictionPolicy {
        match class {
            RestrictionClass::SimultaneousHistorical => RestrictionPolicy::ceiling(2),
            RestrictionClass::SimultaneousStreams => RestrictionPolicy::ceiling(100),
            RestrictionClass::SimultaneousScanners => RestrictionPolicy::ceiling(10),
            RestrictionClass::SimultaneousTickStreams => RestrictionPolicy::ceiling(5),
            RestrictionClass::IdenticalHighFreq | RestrictionClass::TickStreamSameInstrument => {
                RestrictionPolicy::window(1, Duration::from_secs(15))
            }
            RestrictionClass::SameInstrumentHighFreq => {
                RestrictionPolicy::window(6, Duration::from_secs(2))
            }
            RestrictionClass::GlobalHighFreqWindow => {
                RestrictionPolicy::window(60, Duration::from_secs(600))
            }
        }
    }

    /// Override the policy of one class.
    #[must_use]
    pub fn with(mut self, class: RestrictionClass, policy: RestrictionPolicy) -> Self {
        self.policies.insert(class, policy);
        self
    }

    /// Policy for `class`.
    #[must_use]
    pub fn get(&self, class: RestrictionClass) -> RestrictionPolicy {
        self.policies
            .get(&class)
            .copied()
            .unwrap_or_else(|| Self::default_policy(class))
    }

    /// Every class with its policy, in class order.
    #[must_use]
    pub fn entries(&self) -> Vec<(RestrictionClass, RestrictionPolicy)> {
        RestrictionClass::ALL
            .into_iter()
            .map(|class| (class, self.get(class)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use test_case::test_case;

    use super::*;
    use crate::domain::request::params::{
        BarSize, FundamentalParams, HistoricalParams, HistoricalTickParams, StreamingTickParams,
        TickFeed,
    };

    fn historical(bar_size: BarSize, keep_up_to_date: bool) -> RequestParams {
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 14, 30, 0).unwrap();
        let mut p = HistoricalParams::new(start, None, bar_size);
        p.keep_up_to_date = keep_up_to_date;
        RequestParams::Historical(p)
    }

    #[test_case(historical(BarSize::minutes(1), false), &[RestrictionClass::SimultaneousHistorical] ; "large historical")]
    #[test_case(
        historical(BarSize::seconds(5), false),
        &[
            RestrictionClass::SimultaneousHistorical,
            RestrictionClass::IdenticalHighFreq,
            RestrictionClass::SameInstrumentHighFreq,
            RestrictionClass::GlobalHighFreqWindow,
        ] ; "small historical"
    )]
    #[test_case(historical(BarSize::minutes(5), true), &[RestrictionClass::SimultaneousStreams] ; "keep up to date")]
    #[test_case(
        RequestParams::StreamingTick(StreamingTickParams::default()),
        &[RestrictionClass::SimultaneousTickStreams, RestrictionClass::TickStreamSameInstrument] ; "tick stream"
    )]
    #[test_case(
        RequestParams::Fundamental(FundamentalParams { report_type: "ReportSnapshot".into() }),
        &[] ; "fundamental is unrestricted"
    )]
    fn classes_by_kind(params: RequestParams, expected: &[RestrictionClass]) {
        assert_eq!(RestrictionClass::for_params(&params), expected);
    }

    #[test]
    fn historical_ticks_are_high_frequency() {
        let params = RequestParams::HistoricalTick(HistoricalTickParams {
            start: Utc.with_ymd_and_hms(2024, 1, 2, 14, 30, 0).unwrap(),
            end: None,
            number_of_ticks: 1000,
            feed: TickFeed::Trades,
            regular_hours_only: true,
        });
        let classes = RestrictionClass::for_params(&params);
        assert!(classes.contains(&RestrictionClass::IdenticalHighFreq));
        assert!(classes.contains(&RestrictionClass::SimultaneousHistorical));
    }

    #[test_case("2", RestrictionPolicy::ceiling(2) ; "ceiling")]
    #[test_case("6/2", RestrictionPolicy::window(6, Duration::from_secs(2)) ; "window")]
    #[test_case(" 1 / 0.5 ", RestrictionPolicy::window(1, Duration::from_millis(500)) ; "fractional window")]
    fn policy_parses(input: &str, expected: RestrictionPolicy) {
        assert_eq!(input.parse::<RestrictionPolicy>().unwrap(), expected);
    }

    #[test_case("" ; "empty")]
    #[test_case("x/2" ; "bad count")]
    #[test_case("1/0" ; "zero window")]
    #[test_case("1/-3" ; "negative window")]
    #[test_case("1/1e20" ; "window beyond duration range")]
    #[test_case("1/inf" ; "infinite window")]
    #[test_case("1/NaN" ; "nan window")]
    #[test_case("1/1e-12" ; "window rounds to zero")]
    fn policy_rejects(input: &str) {
        assert!(input.parse::<RestrictionPolicy>().is_err());
    }

    #[test]
    fn default_table_matches_venue_limits() {
        let table = PolicyTable::default();
        assert_eq!(
            table.get(RestrictionClass::SimultaneousHistorical),
            RestrictionPolicy::ceiling(2)
        );
        assert_eq!(
            table.get(RestrictionClass::GlobalHighFreqWindow),
            RestrictionPolicy::window(60, Duration::from_secs(600))
        );
        assert_eq!(table.entries().len(), 8);
    }

    #[test]
    fn env_suffix_is_screaming_snake() {
        assert_eq!(
            RestrictionClass::TickStreamSameInstrument.env_suffix(),
            "TICK_STREAM_SAME_INSTRUMENT"
        );
    }
}
