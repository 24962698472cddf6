//! Split Multi-Requests
//!
//! A parent handle over the leaves of a split historical request. Leaves are
//! scheduled independently; the parent aggregates their status and merges
//! their results on demand.

use std::sync::Arc;

use uuid::Uuid;

use crate::domain::request::params::{HistoricalParams, Instrument, RequestParams, WhatToShow};
use crate::domain::request::{
    DataRequest, LifecycleError, RequestId, RequestStatus, Row, SessionBinding,
};
use crate::domain::restriction::RestrictionManager;

/// Parent of the leaves produced by splitting one historical request.
#[derive(Debug)]
pub struct MultiRequest {
    id: RequestId,
    template: HistoricalParams,
    leaves: Vec<Arc<DataRequest>>,
}

impl MultiRequest {
    /// Build one leaf per parameter set.
    #[must_use]
    pub fn new(instrument: &Instrument, template: HistoricalParams, parts: Vec<HistoricalParams>) -> Self {
        let leaves = parts
            .into_iter()
            .map(|p| Arc::new(DataRequest::new(instrument.clone(), RequestParams::Historical(p))))
            .collect();
        Self {
            id: Uuid::new_v4(),
            template,
            leaves,
        }
    }

    /// Parent id.
    #[must_use]
    pub const fn id(&self) -> RequestId {
        self.id
    }

    /// The unsplit parameters.
    #[must_use]
    pub const fn template(&self) -> &HistoricalParams {
        &self.template
    }

    /// Leaves in time order.
    #[must_use]
    pub fn leaves(&self) -> &[Arc<DataRequest>] {
        &self.leaves
    }

    /// Active iff any leaf is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.leaves.iter().any(|leaf| leaf.is_active())
    }

    /// Aggregate status of the leaves.
    #[must_use]
    pub fn status(&self) -> RequestStatus {
        aggregate_status(self.leaves.iter().map(|leaf| leaf.status()))
    }

    /// Cancel every active leaf; finished leaves keep their status.
    ///
    /// Returns the venue bindings of cancelled leaves that were in flight.
    ///
    /// # Errors
    ///
    /// Returns the first [`LifecycleError`] raised by a leaf.
    pub fn cancel(
        &self,
        restrictions: &RestrictionManager,
    ) -> Result<Vec<(Arc<DataRequest>, SessionBinding)>, LifecycleError> {
        let mut in_flight = Vec::new();
        for leaf in self.leaves.iter().filter(|leaf| leaf.is_active()) {
            if let Some(binding) = leaf.cancel(restrictions)? {
                in_flight.push((Arc::clone(leaf), binding));
            }
        }
        Ok(in_flight)
    }

    /// Leaves' rows merged in time order, exact duplicates removed and
    /// unchanged rows pruned.
    #[must_use]
    pub fn data(&self) -> Vec<Row> {
        let rows = self.leaves.iter().flat_map(|leaf| leaf.data()).collect();
        merge_rows(rows, self.template.what_to_show)
    }
}

/// Status of a parent given its leaves' statuses.
#[must_use]
pub fn aggregate_status(statuses: impl IntoIterator<Item = RequestStatus>) -> RequestStatus {
    let statuses: Vec<RequestStatus> = statuses.into_iter().collect();
    if !statuses.is_empty() && statuses.iter().all(|s| *s == RequestStatus::Complete) {
        return RequestStatus::Complete;
    }
    if let Some(most_advanced) = statuses.iter().filter(|s| s.is_active()).max() {
        return *most_advanced;
    }
    [
        RequestStatus::Failed,
        RequestStatus::Cancelled,
        RequestStatus::TimedOut,
    ]
    .into_iter()
    .find(|candidate| statuses.contains(candidate))
    .unwrap_or(RequestStatus::New)
}

/// Sort by timestamp, drop exact duplicates, then prune rows that carry no
/// new information for the feed: zero-volume trade rows, and bid/ask rows
/// whose tracked fields match the previous kept row.
#[must_use]
pub fn merge_rows(mut rows: Vec<Row>, feed: WhatToShow) -> Vec<Row> {
    // Rows without a timestamp sort last, keeping their arrival order.
    rows.sort_by_key(|row| (row.timestamp().is_none(), row.timestamp()));

    let mut merged: Vec<Row> = Vec::with_capacity(rows.len());
    for row in rows {
        let duplicate = merged
            .iter()
            .rev()
            .take_while(|kept| kept.timestamp() == row.timestamp())
            .any(|kept| *kept == row);
        if duplicate {
            continue;
        }
        let keep = match feed {
            WhatToShow::Trades => row.volume().is_none_or(|v| !v.is_zero()),
            WhatToShow::BidAsk => merged
                .last()
                .is_none_or(|prev| prev.tracked_fields() != row.tracked_fields()),
            WhatToShow::Midpoint | WhatToShow::Bid | WhatToShow::Ask => true,
        };
        if keep {
            merged.push(row);
        }
    }
    merged
}
