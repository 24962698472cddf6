//! Request Errors

use chrono::{DateTime, Utc};

use super::status::RequestStatus;

/// A structural precondition violated by request parameters.
///
/// Validation errors fail synchronously at `place()` and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Bar size string could not be parsed, or has a zero count.
    #[error("invalid bar size: {0:?}")]
    InvalidBarSize(String),
    /// Keep-up-to-date historical requests must leave `end` open.
    #[error("streaming historical request must not carry an end date")]
    StreamingWithEndDate,
    /// Keep-up-to-date historical requests need a minimum bar size.
    #[error("streaming historical bar size {bar_size} is below {minimum_secs} secs")]
    StreamingBarTooSmall {
        /// Requested bar size.
        bar_size: String,
        /// Minimum allowed, in seconds.
        minimum_secs: i64,
    },
    /// The requested range is empty or inverted.
    #[error("empty range: start {start} is not before end {end}")]
    EmptyRange {
        /// Range start.
        start: DateTime<Utc>,
        /// Range end.
        end: DateTime<Utc>,
    },
    /// Historical tick count out of range.
    #[error("number of ticks must be within 1..=1000, got {0}")]
    TickCount(u32),
    /// Scanner row count out of range.
    #[error("scanner rows must be within 1..=50, got {0}")]
    ScannerRows(u32),
    /// A required text field is blank.
    #[error("field {0} must not be empty")]
    EmptyField(&'static str),
}

/// Lifecycle violations. These indicate logic bugs, not venue conditions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    /// Transition not allowed by the status machine.
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        /// Current status.
        from: RequestStatus,
        /// Requested status.
        to: RequestStatus,
    },
    /// The status was already recorded during this attempt.
    #[error("status {0} already recorded for this attempt")]
    DuplicateStatus(RequestStatus),
    /// The request is already registered with the restriction manager.
    #[error("request is already registered with the restriction manager")]
    AlreadyRegistered,
    /// `reset()` called from a status that does not allow it.
    #[error("cannot reset a request in status {0}")]
    NotResettable(RequestStatus),
    /// A venue request id is already bound to this attempt.
    #[error("request already bound to venue request id {0}")]
    AlreadyBound(i64),
}
