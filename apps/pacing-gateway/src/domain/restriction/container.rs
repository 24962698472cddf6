//! Accounting Containers
//!
//! One container per restriction class (and per key for keyed classes).
//! Ceiling classes hold a live set mirroring currently-sent requests;
//! windowed classes hold a FIFO of registration instants that is purged
//! lazily before every check or registration.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::manager::Admission;
use super::policy::RestrictionPolicy;
use crate::domain::request::RequestId;

/// Accounting state for a single class/key pair.
#[derive(Debug, Clone)]
pub enum AccountingContainer {
    /// Live requests and their weights.
    Live(HashMap<RequestId, usize>),
    /// Registration instants, oldest first. Weighted requests push one
    /// entry per unit of weight.
    Window(VecDeque<(Instant, RequestId)>),
}

impl AccountingContainer {
    /// Empty container shaped for `policy`.
    #[must_use]
    pub fn for_policy(policy: &RestrictionPolicy) -> Self {
        match policy {
            RestrictionPolicy::Ceiling { .. } => Self::Live(HashMap::new()),
            RestrictionPolicy::Window { .. } => Self::Window(VecDeque::new()),
        }
    }

    /// Drop window entries that are at least one window old.
    pub fn purge(&mut self, policy: &RestrictionPolicy, now: Instant) {
        if let (Self::Window(entries), RestrictionPolicy::Window { window, .. }) = (self, policy) {
            while entries
                .front()
                .is_some_and(|(at, _)| now.saturating_duration_since(*at) >= *window)
            {
                entries.pop_front();
            }
        }
    }

    /// Number of accounted entries (weights summed for live sets).
    #[must_use]
    pub fn count(&self) -> usize {
        match self {
            Self::Live(live) => live.values().sum(),
            Self::Window(entries) => entries.len(),
        }
    }

    /// Whether nothing is accounted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Live(live) => live.is_empty(),
            Self::Window(entries) => entries.is_empty(),
        }
    }

    /// Admission decision against an already purged container.
    ///
    /// A window that is full reports the exact wait until enough entries
    /// age out to leave room for one more.
    #[must_use]
    pub fn admission(&self, policy: &RestrictionPolicy, now: Instant) -> Admission {
        let count = self.count();
        match (self, policy) {
            (_, RestrictionPolicy::Ceiling { max_concurrent }) => {
                if count < *max_concurrent {
                    Admission::Granted
                } else {
                    Admission::Blocked
                }
            }
            (Self::Window(entries), RestrictionPolicy::Window { max_count, window }) => {
                if count < *max_count {
                    Admission::Granted
                } else if *max_count == 0 {
                    Admission::Blocked
                } else {
                    let (oldest_blocking, _) = entries[count - max_count];
                    let wait = oldest_blocking
                        .checked_add(*window)
                        .map_or(*window, |ready_at| ready_at.saturating_duration_since(now));
                    Admission::Paced(wait.max(Duration::from_millis(1)))
                }
            }
            (Self::Live(_), RestrictionPolicy::Window { max_count, .. }) => {
                if count < *max_count {
                    Admission::Granted
                } else {
                    Admission::Blocked
                }
            }
        }
    }

    /// Account `weight` entries for `id`.
    pub fn register(&mut self, id: RequestId, weight: usize, now: Instant) {
        match self {
            Self::Live(live) => {
                live.insert(id, weight);
            }
            Self::Window(entries) => {
                entries.extend(std::iter::repeat_n((now, id), weight));
            }
        }
    }

    /// Release `id` from a live set. Window entries only age out.
    pub fn deregister(&mut self, id: RequestId) -> bool {
        match self {
            Self::Live(live) => live.remove(&id).is_some(),
            Self::Window(_) => false,
        }
    }
}
