//! Historical Range Splitting
//!
//! The venue caps how much history one request may cover for a given bar
//! size. `RangeSplitter` cuts an over-long range into contiguous,
//! non-overlapping windows that each fit the cap; day-or-coarser bars are
//! first snapped to the venue's trading-day boundary, which sits at a fixed
//! local time of day rather than midnight.

pub mod multi;

use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;

pub use multi::MultiRequest;

use crate::domain::request::params::{BarSize, BarUnit, HistoricalParams};

/// Splitting failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SplitError {
    /// The (possibly snapped) range is empty.
    #[error("empty range: start {start} is not before end {end}")]
    EmptyRange {
        /// Range start.
        start: DateTime<Utc>,
        /// Range end.
        end: DateTime<Utc>,
    },
    /// The boundary time does not exist on this local date.
    #[error("trading-day boundary does not resolve on {0}")]
    UnresolvableBoundary(NaiveDate),
}

/// Longest range the venue serves in one request for `unit` bars.
#[must_use]
pub const fn max_window(unit: BarUnit) -> TimeDelta {
    match unit {
        BarUnit::Second => TimeDelta::minutes(30),
        BarUnit::Minute => TimeDelta::days(7),
        BarUnit::Hour => TimeDelta::days(30),
        BarUnit::Day => TimeDelta::days(365),
        BarUnit::Week => TimeDelta::days(730),
        BarUnit::Month => TimeDelta::days(3_650),
    }
}

// =============================================================================
// Trading-Day Boundary
// =============================================================================

/// Local time of day at which the venue rolls over to the next trading day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TradingDayBoundary {
    tz: Tz,
    time: NaiveTime,
}

impl Default for TradingDayBoundary {
    fn default() -> Self {
        Self {
            tz: chrono_tz::America::New_York,
            time: NaiveTime::from_hms_opt(17, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

impl TradingDayBoundary {
    /// Boundary at `time` local to `tz`.
    #[must_use]
    pub const fn new(tz: Tz, time: NaiveTime) -> Self {
        Self { tz, time }
    }

    /// Boundary time zone.
    #[must_use]
    pub const fn tz(&self) -> Tz {
        self.tz
    }

    /// Boundary local time of day.
    #[must_use]
    pub const fn time(&self) -> NaiveTime {
        self.time
    }

    fn on(&self, date: NaiveDate) -> Result<DateTime<Utc>, SplitError> {
        let local = date.and_time(self.time);
        self.tz
            .from_local_datetime(&local)
            .earliest()
            // Boundary falls in a DST gap: take the first instant after it.
            .or_else(|| {
                self.tz
                    .from_local_datetime(&(local + TimeDelta::hours(1)))
                    .earliest()
            })
            .map(|t| t.with_timezone(&Utc))
            .ok_or(SplitError::UnresolvableBoundary(date))
    }

    /// Latest boundary at or before `t`.
    ///
    /// # Errors
    ///
    /// Returns [`SplitError::UnresolvableBoundary`] if the boundary cannot
    /// be placed on the relevant local date.
    pub fn floor(&self, t: DateTime<Utc>) -> Result<DateTime<Utc>, SplitError> {
        let date = t.with_timezone(&self.tz).date_naive();
        let same_day = self.on(date)?;
        if same_day <= t {
            return Ok(same_day);
        }
        let previous = date
            .checked_sub_days(Days::new(1))
            .ok_or(SplitError::UnresolvableBoundary(date))?;
        self.on(previous)
    }

    /// Earliest boundary at or after `t`.
    ///
    /// # Errors
    ///
    /// Returns [`SplitError::UnresolvableBoundary`] if the boundary cannot
    /// be placed on the relevant local date.
    pub fn ceil(&self, t: DateTime<Utc>) -> Result<DateTime<Utc>, SplitError> {
        let date = t.with_timezone(&self.tz).date_naive();
        let same_day = self.on(date)?;
        if same_day >= t {
            return Ok(same_day);
        }
        let next = date
            .checked_add_days(Days::new(1))
            .ok_or(SplitError::UnresolvableBoundary(date))?;
        self.on(next)
    }
}

// =============================================================================
// Range Splitter
// =============================================================================

/// Half-open sub-range `[start, end)` of a split request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    /// Window start.
    pub start: DateTime<Utc>,
    /// Window end.
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Window length.
    #[must_use]
    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }
}

/// Outcome of splitting a historical request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitPlan {
    /// The request fits in one window; send it unmodified.
    Single(HistoricalParams),
    /// One parameter set per window, in time order.
    Multi(Vec<HistoricalParams>),
}

impl SplitPlan {
    /// Number of requests the plan produces.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Multi(parts) => parts.len(),
        }
    }

    /// Plans always produce at least one request.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }
}

/// Decomposes over-long historical ranges into venue-compliant windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RangeSplitter {
    boundary: TradingDayBoundary,
}

impl RangeSplitter {
    /// Splitter snapping daily bars to `boundary`.
    #[must_use]
    pub const fn new(boundary: TradingDayBoundary) -> Self {
        Self { boundary }
    }

    /// Trading-day boundary in use.
    #[must_use]
    pub const fn boundary(&self) -> TradingDayBoundary {
        self.boundary
    }

    /// Cut `[start, end]` into windows no longer than the venue allows for
    /// `bar_size`. Daily and coarser bars snap `start` down and `end` up to
    /// the trading-day boundary first.
    ///
    /// # Errors
    ///
    /// Returns [`SplitError::EmptyRange`] when the range is empty.
    pub fn windows(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bar_size: BarSize,
    ) -> Result<Vec<TimeWindow>, SplitError> {
        let (start, end) = if bar_size.is_daily_or_coarser() {
            (self.boundary.floor(start)?, self.boundary.ceil(end)?)
        } else {
            (start, end)
        };
        if start >= end {
            return Err(SplitError::EmptyRange { start, end });
        }

        let step = max_window(bar_size.unit());
        let mut windows = Vec::new();
        let mut cursor = start;
        while cursor < end {
            let next = (cursor + step).min(end);
            windows.push(TimeWindow {
                start: cursor,
                end: next,
            });
            cursor = next;
        }
        Ok(windows)
    }

    /// Split a historical request. An open `end` means `now`.
    /// Keep-up-to-date requests are never split.
    ///
    /// # Errors
    ///
    /// Returns a [`SplitError`] when the range is empty.
    pub fn split(
        &self,
        params: &HistoricalParams,
        now: DateTime<Utc>,
    ) -> Result<SplitPlan, SplitError> {
        if params.keep_up_to_date {
            return Ok(SplitPlan::Single(params.clone()));
        }
        let end = params.end.unwrap_or(now);
        let windows = self.windows(params.start, end, params.bar_size)?;
        if windows.len() <= 1 {
            return Ok(SplitPlan::Single(params.clone()));
        }
        tracing::debug!(
            start = %params.start,
            %end,
            bar_size = %params.bar_size,
            windows = windows.len(),
            "Split historical range"
        );
        Ok(SplitPlan::Multi(
            windows
                .iter()
                .map(|w| params.with_window(w.start, w.end))
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Timelike;
    use proptest::prelude::*;

    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn four_hundred_days_of_daily_bars_is_two_windows() {
        let splitter = RangeSplitter::default();
        // 22:00Z in January is 17:00 New York, already on the boundary.
        let start = utc(2023, 1, 1, 22, 0);
        let end = start + TimeDelta::days(400);
        let windows = splitter.windows(start, end, BarSize::days(1)).unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].start, start);
        assert_eq!(windows[0].duration(), TimeDelta::days(365));
        assert_eq!(windows[1].start, windows[0].end);
        assert_eq!(windows[1].end, end);
    }

    #[test]
    fn single_window_returns_original_params() {
        let splitter = RangeSplitter::default();
        let params = HistoricalParams::new(
            utc(2024, 3, 4, 14, 30),
            Some(utc(2024, 3, 4, 14, 50)),
            BarSize::seconds(5),
        );
        assert_eq!(
            splitter.split(&params, Utc::now()).unwrap(),
            SplitPlan::Single(params)
        );
    }

    #[test]
    fn second_bars_split_every_thirty_minutes() {
        let splitter = RangeSplitter::default();
        let params = HistoricalParams::new(
            utc(2024, 3, 4, 14, 30),
            Some(utc(2024, 3, 4, 16, 0)),
            BarSize::seconds(5),
        );
        let SplitPlan::Multi(parts) = splitter.split(&params, Utc::now()).unwrap() else {
            panic!("expected a multi plan");
        };
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].start, utc(2024, 3, 4, 15, 0));
        assert_eq!(parts[2].end, Some(utc(2024, 3, 4, 16, 0)));
        assert!(parts.iter().all(|p| p.bar_size == BarSize::seconds(5)));
    }

    #[test]
    fn open_end_uses_now() {
        let splitter = RangeSplitter::default();
        let now = utc(2024, 3, 4, 16, 0);
        let params = HistoricalParams::new(utc(2024, 3, 4, 15, 0), None, BarSize::seconds(1));
        assert_eq!(splitter.split(&params, now).unwrap().len(), 2);
    }

    #[test]
    fn keep_up_to_date_is_never_split() {
        let splitter = RangeSplitter::default();
        let mut params = HistoricalParams::new(utc(2024, 1, 1, 0, 0), None, BarSize::seconds(5));
        params.keep_up_to_date = true;
        assert!(matches!(
            splitter.split(&params, utc(2024, 3, 1, 0, 0)).unwrap(),
            SplitPlan::Single(_)
        ));
    }

    #[test]
    fn daily_bars_snap_to_boundary() {
        let splitter = RangeSplitter::default();
        // 15:00Z on 2024-07-10 is 11:00 New York (EDT).
        let windows = splitter
            .windows(utc(2024, 7, 10, 15, 0), utc(2024, 7, 12, 15, 0), BarSize::days(1))
            .unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].start, utc(2024, 7, 9, 21, 0));
        assert_eq!(windows[0].end, utc(2024, 7, 12, 21, 0));
    }

    #[test]
    fn boundary_floor_and_ceil_are_identity_on_boundary() {
        let boundary = TradingDayBoundary::default();
        let on = utc(2024, 1, 5, 22, 0);
        assert_eq!(boundary.floor(on).unwrap(), on);
        assert_eq!(boundary.ceil(on).unwrap(), on);
        let local = boundary.floor(on).unwrap().with_timezone(&boundary.tz());
        assert_eq!(local.hour(), 17);
    }

    #[test]
    fn empty_range_is_an_error() {
        let splitter = RangeSplitter::default();
        let t = utc(2024, 3, 4, 14, 30);
        assert!(matches!(
            splitter.windows(t, t, BarSize::minutes(1)),
            Err(SplitError::EmptyRange { .. })
        ));
    }

    fn bar_sizes() -> impl Strategy<Value = BarSize> {
        prop_oneof![
            (1u32..=30).prop_map(BarSize::seconds),
            (1u32..=30).prop_map(BarSize::minutes),
            (1u32..=8).prop_map(|n| BarSize::new(n, BarUnit::Hour)),
            Just(BarSize::days(1)),
            Just(BarSize::new(1, BarUnit::Week)),
            Just(BarSize::new(1, BarUnit::Month)),
        ]
    }

    proptest! {
        #[test]
        fn windows_tile_the_range(
            start_secs in 1_500_000_000i64..1_800_000_000,
            len_secs in 1i64..(3 * 365 * 86_400),
            bar_size in bar_sizes(),
        ) {
            let splitter = RangeSplitter::default();
            let start = DateTime::from_timestamp(start_secs, 0).unwrap();
            let end = start + TimeDelta::seconds(len_secs);
            let windows = splitter.windows(start, end, bar_size).unwrap();

            let (expected_start, expected_end) = if bar_size.is_daily_or_coarser() {
                let b = splitter.boundary();
                (b.floor(start).unwrap(), b.ceil(end).unwrap())
            } else {
                (start, end)
            };

            prop_assert!(!windows.is_empty());
            prop_assert_eq!(windows[0].start, expected_start);
            prop_assert_eq!(windows[windows.len() - 1].end, expected_end);
            for w in &windows {
                prop_assert!(w.start < w.end);
                prop_assert!(w.duration() <= max_window(bar_size.unit()));
            }
            for pair in windows.windows(2) {
                prop_assert_eq!(pair[0].end, pair[1].start);
            }
        }
    }
}
