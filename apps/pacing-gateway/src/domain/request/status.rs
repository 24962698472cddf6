//! Request Status Machine
//!
//! ```text
//! NEW ──► QUEUED ──► PROCESSING ──► SENT ──► COMPLETE
//!  ▲        │            │            ├────► CANCELLED
//!  │        │            │            ├────► TIMED_OUT ──► NEW (retry)
//!  │        │            │            └────► FAILED
//!  └── reset() from NEW | COMPLETE | CANCELLED | FAILED
//! ```

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::LifecycleError;

/// Lifecycle status of a data request.
///
/// The declaration order is the lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    /// Created, not yet placed.
    New,
    /// Waiting in a scheduler queue.
    Queued,
    /// Dequeued by a worker, awaiting admission.
    Processing,
    /// Dispatched to the venue.
    Sent,
    /// Terminal callback received.
    Complete,
    /// Cancelled by the caller.
    Cancelled,
    /// No terminal callback within the deadline, or the session was lost.
    TimedOut,
    /// Non-retriable failure or exhausted retries.
    Failed,
}

impl RequestStatus {
    /// Queued, processing or sent.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Processing | Self::Sent)
    }

    /// No further transitions without a reset.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::Failed)
    }

    /// States from which the public `reset()` is valid.
    #[must_use]
    pub const fn is_resettable(&self) -> bool {
        matches!(
            self,
            Self::New | Self::Complete | Self::Cancelled | Self::Failed
        )
    }

    /// Forward edges of the status machine (resets excluded).
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::Queued | Self::Cancelled)
                | (Self::Queued, Self::Processing | Self::Cancelled | Self::Failed)
                | (
                    Self::Processing,
                    Self::Sent | Self::Cancelled | Self::Failed | Self::TimedOut
                )
                | (
                    Self::Sent,
                    Self::Complete | Self::Cancelled | Self::TimedOut | Self::Failed
                )
                | (Self::TimedOut, Self::Failed | Self::Cancelled)
        )
    }

    /// Wire label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Queued => "QUEUED",
            Self::Processing => "PROCESSING",
            Self::Sent => "SENT",
            Self::Complete => "COMPLETE",
            Self::Cancelled => "CANCELLED",
            Self::TimedOut => "TIMED_OUT",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-attempt record of when each status was entered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusLog {
    entries: BTreeMap<RequestStatus, DateTime<Utc>>,
}

impl StatusLog {
    /// Log holding only `NEW` at `at`.
    #[must_use]
    pub fn started(at: DateTime<Utc>) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(RequestStatus::New, at);
        Self { entries }
    }

    /// Record `status` once.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::DuplicateStatus`] if already recorded.
    pub fn record(&mut self, status: RequestStatus, at: DateTime<Utc>) -> Result<(), LifecycleError> {
        if self.entries.contains_key(&status) {
            return Err(LifecycleError::DuplicateStatus(status));
        }
        self.entries.insert(status, at);
        Ok(())
    }

    /// When `status` was entered during this attempt.
    #[must_use]
    pub fn at(&self, status: RequestStatus) -> Option<DateTime<Utc>> {
        self.entries.get(&status).copied()
    }

    /// Entries in lifecycle order.
    pub fn iter(&self) -> impl Iterator<Item = (RequestStatus, DateTime<Utc>)> + '_ {
        self.entries.iter().map(|(s, t)| (*s, *t))
    }

    /// Whether `status` has been recorded.
    #[must_use]
    pub fn contains(&self, status: RequestStatus) -> bool {
        self.entries.contains_key(&status)
    }
}
