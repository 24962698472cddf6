//! Data Requests
//!
//! A `DataRequest` is one self-contained unit of work sent to the venue:
//! instrument, closed parameters, the restriction classes it is subject to,
//! its lifecycle status and its result buffer.
//!
//! # Locking
//!
//! All mutable state sits behind one mutex per request. Status transitions
//! that register or deregister with the `RestrictionManager` take the
//! per-class ledger locks while holding the request lock; ledger code never
//! locks a request, so the order is always request then class.

pub mod error;
pub mod params;
pub mod rows;
pub mod status;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

pub use error::{LifecycleError, ValidationError};
pub use params::{Instrument, RequestKind, RequestParams};
pub use rows::Row;
pub use status::{RequestStatus, StatusLog};

use crate::domain::restriction::{RestrictionClass, RestrictionManager};

// =============================================================================
// Types
// =============================================================================

/// Unique identifier of a data request.
pub type RequestId = Uuid;

/// Integer id a session assigns to an outbound request.
pub type VenueRequestId = i64;

/// Client identity a session is bound to.
pub type ClientId = u32;

/// Scheduling priority. Lower values are served first.
pub type Priority = i32;

/// Where a sent request lives on the venue side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionBinding {
    /// Client identity of the owning session.
    pub client_id: ClientId,
    /// Endpoint port of the owning session.
    pub port: u16,
    /// Venue request id.
    pub request_id: VenueRequestId,
}

/// Why a request ended up `FAILED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestFailure {
    /// Venue error code, when the venue reported one.
    pub code: Option<i32>,
    /// Human-readable reason.
    pub message: String,
}

impl RequestFailure {
    /// Failure without a venue code.
    #[must_use]
    pub fn local(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// Failure reported by the venue.
    #[must_use]
    pub fn venue(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }
}

/// Point-in-time view of a request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestSummary {
    /// Request id.
    pub id: RequestId,
    /// Request kind.
    pub kind: RequestKind,
    /// Instrument key.
    pub instrument: String,
    /// Current status.
    pub status: RequestStatus,
    /// Times the request has been sent.
    pub attempts: u32,
    /// Current venue binding.
    pub binding: Option<SessionBinding>,
    /// Buffered rows.
    pub rows: usize,
    /// Failure reason, if failed.
    pub failure: Option<RequestFailure>,
}

// =============================================================================
// DataRequest
// =============================================================================

#[derive(Debug)]
struct RequestState {
    status: RequestStatus,
    log: StatusLog,
    binding: Option<SessionBinding>,
    rows: Vec<Row>,
    registered: bool,
    attempts: u32,
    placement: Option<(Priority, u64)>,
    failure: Option<RequestFailure>,
}

impl RequestState {
    fn fresh() -> Self {
        Self {
            status: RequestStatus::New,
            log: StatusLog::started(Utc::now()),
            binding: None,
            rows: Vec::new(),
            registered: false,
            attempts: 0,
            placement: None,
            failure: None,
        }
    }

    fn restart(&mut self) {
        self.status = RequestStatus::New;
        self.log = StatusLog::started(Utc::now());
        self.binding = None;
        self.rows.clear();
        self.failure = None;
    }
}

/// A single request to the venue.
#[derive(Debug)]
pub struct DataRequest {
    id: RequestId,
    instrument: Instrument,
    params: RequestParams,
    classes: Vec<RestrictionClass>,
    fingerprint: String,
    state: Mutex<RequestState>,
}

impl DataRequest {
    /// Create a `NEW` request.
    #[must_use]
    pub fn new(instrument: Instrument, params: RequestParams) -> Self {
        let classes = RestrictionClass::for_params(&params);
        let fingerprint = format!("{}|{params:?}", instrument.key());
        Self {
            id: Uuid::new_v4(),
            instrument,
            params,
            classes,
            fingerprint,
            state: Mutex::new(RequestState::fresh()),
        }
    }

    /// Request id.
    #[must_use]
    pub const fn id(&self) -> RequestId {
        self.id
    }

    /// Target instrument.
    #[must_use]
    pub const fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    /// Kind-specific parameters.
    #[must_use]
    pub const fn params(&self) -> &RequestParams {
        &self.params
    }

    /// Restriction classes this request is subject to.
    #[must_use]
    pub fn classes(&self) -> &[RestrictionClass] {
        &self.classes
    }

    /// Identity of the request for identical-request pacing.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Accounting weight of one send.
    #[must_use]
    pub const fn cost(&self) -> usize {
        self.params.cost()
    }

    /// Structural validity.
    ///
    /// # Errors
    ///
    /// Returns the violated precondition.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.params.validate()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> RequestStatus {
        self.state.lock().status
    }

    /// Queued, processing or sent.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status().is_active()
    }

    /// Times the request has entered `SENT` since the last public reset.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.state.lock().attempts
    }

    /// Venue binding of the current attempt.
    #[must_use]
    pub fn binding(&self) -> Option<SessionBinding> {
        self.state.lock().binding
    }

    /// Whether the request currently holds restriction accounting.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.state.lock().registered
    }

    /// Failure reason, once `FAILED`.
    #[must_use]
    pub fn failure(&self) -> Option<RequestFailure> {
        self.state.lock().failure.clone()
    }

    /// Status timestamps of the current attempt.
    #[must_use]
    pub fn status_log(&self) -> StatusLog {
        self.state.lock().log.clone()
    }

    /// Queue placement `(priority, sequence)` of the latest `place()`.
    #[must_use]
    pub fn placement(&self) -> Option<(Priority, u64)> {
        self.state.lock().placement
    }

    /// Record the queue placement of this request.
    pub fn set_placement(&self, priority: Priority, sequence: u64) {
        self.state.lock().placement = Some((priority, sequence));
    }

    /// Move to `next`, registering on entry to `SENT` and deregistering on
    /// the way out of it.
    ///
    /// # Errors
    ///
    /// Returns a [`LifecycleError`] for edges the status machine forbids,
    /// for statuses already recorded in this attempt, and for double
    /// registration.
    pub fn transition(
        &self,
        next: RequestStatus,
        restrictions: &RestrictionManager,
    ) -> Result<(), LifecycleError> {
        let mut state = self.state.lock();
        self.transition_locked(&mut state, next, restrictions)
    }

    fn transition_locked(
        &self,
        state: &mut RequestState,
        next: RequestStatus,
        restrictions: &RestrictionManager,
    ) -> Result<(), LifecycleError> {
        let from = state.status;
        if !from.can_transition_to(next) {
            return Err(LifecycleError::InvalidTransition { from, to: next });
        }
        if state.log.contains(next) {
            return Err(LifecycleError::DuplicateStatus(next));
        }

        if next == RequestStatus::Sent {
            if state.registered {
                return Err(LifecycleError::AlreadyRegistered);
            }
            restrictions.register(self);
            state.registered = true;
            state.attempts += 1;
        } else if from == RequestStatus::Sent && state.registered {
            restrictions.deregister(self);
            state.registered = false;
        }

        state.log.record(next, Utc::now())?;
        state.status = next;
        tracing::trace!(request_id = %self.id, %from, to = %next, "Status transition");
        Ok(())
    }

    /// Move to `FAILED` with a reason.
    ///
    /// # Errors
    ///
    /// Returns a [`LifecycleError`] if `FAILED` is not reachable.
    pub fn fail(
        &self,
        failure: RequestFailure,
        restrictions: &RestrictionManager,
    ) -> Result<(), LifecycleError> {
        let mut state = self.state.lock();
        self.transition_locked(&mut state, RequestStatus::Failed, restrictions)?;
        state.failure = Some(failure);
        Ok(())
    }

    /// Cancel if not already finished.
    ///
    /// Returns the venue binding when the request was sent, so the caller
    /// can cancel it at the venue. Cancelling a finished request is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a [`LifecycleError`] on an inconsistent status log.
    pub fn cancel(
        &self,
        restrictions: &RestrictionManager,
    ) -> Result<Option<SessionBinding>, LifecycleError> {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return Ok(None);
        }
        let was_sent = state.status == RequestStatus::Sent;
        self.transition_locked(&mut state, RequestStatus::Cancelled, restrictions)?;
        Ok(if was_sent { state.binding } else { None })
    }

    /// Return to `NEW` from `NEW`, `COMPLETE`, `CANCELLED` or `FAILED`,
    /// clearing results, binding and attempt count.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotResettable`] from any other status.
    pub fn reset(&self) -> Result<(), LifecycleError> {
        let mut state = self.state.lock();
        if !state.status.is_resettable() {
            return Err(LifecycleError::NotResettable(state.status));
        }
        state.restart();
        state.attempts = 0;
        state.placement = None;
        Ok(())
    }

    /// Return a timed-out request to `NEW` for requeueing, keeping its
    /// attempt count and placement.
    pub(crate) fn retry_reset(&self) -> Result<(), LifecycleError> {
        let mut state = self.state.lock();
        if state.status != RequestStatus::TimedOut {
            return Err(LifecycleError::InvalidTransition {
                from: state.status,
                to: RequestStatus::New,
            });
        }
        state.restart();
        Ok(())
    }

    /// Bind the current attempt to a venue request id.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::AlreadyBound`] if already bound.
    pub fn bind(&self, binding: SessionBinding) -> Result<(), LifecycleError> {
        let mut state = self.state.lock();
        if let Some(existing) = state.binding {
            return Err(LifecycleError::AlreadyBound(existing.request_id));
        }
        state.binding = Some(binding);
        Ok(())
    }

    /// Append a result row.
    pub fn append(&self, row: Row) {
        self.state.lock().rows.push(row);
    }

    /// Replace the last row if its key matches, else append.
    pub fn update(&self, row: Row) {
        let mut state = self.state.lock();
        match state.rows.last_mut() {
            Some(last) if last.same_key(&row) => *last = row,
            _ => state.rows.push(row),
        }
    }

    /// Copy of the result buffer.
    #[must_use]
    pub fn data(&self) -> Vec<Row> {
        self.state.lock().rows.clone()
    }

    /// Point-in-time view.
    #[must_use]
    pub fn summary(&self) -> RequestSummary {
        let state = self.state.lock();
        RequestSummary {
            id: self.id,
            kind: self.params.kind(),
            instrument: self.instrument.key(),
            status: state.status,
            attempts: state.attempts,
            binding: state.binding,
            rows: state.rows.len(),
            failure: state.failure.clone(),
        }
    }

    /// When the current attempt entered `status`.
    #[must_use]
    pub fn entered_at(&self, status: RequestStatus) -> Option<DateTime<Utc>> {
        self.state.lock().log.at(status)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::request::params::{BarSize, HistoricalParams, StreamingBarParams};
    use crate::domain::request::rows::Bar;

    fn historical() -> DataRequest {
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 14, 30, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 2, 15, 0, 0).unwrap();
        DataRequest::new(
            Instrument::stock("AAPL"),
            RequestParams::Historical(HistoricalParams::new(start, Some(end), BarSize::seconds(5))),
        )
    }

    fn bar(sec: u32, close: i64) -> Row {
        Row::Bar(Bar {
            time: Utc.with_ymd_and_hms(2024, 1, 2, 15, 0, sec).unwrap(),
            open: Decimal::from(close),
            high: Decimal::from(close),
            low: Decimal::from(close),
            close: Decimal::from(close),
            volume: Decimal::from(100),
            wap: Decimal::from(close),
            count: 1,
        })
    }

    fn drive_to_sent(req: &DataRequest, rm: &RestrictionManager) {
        req.transition(RequestStatus::Queued, rm).unwrap();
        req.transition(RequestStatus::Processing, rm).unwrap();
        req.transition(RequestStatus::Sent, rm).unwrap();
    }

    fn live_historical(rm: &RestrictionManager) -> usize {
        rm.usage()
            .into_iter()
            .find(|u| u.class == RestrictionClass::SimultaneousHistorical)
            .map_or(0, |u| u.keys.iter().map(|k| k.count).sum())
    }

    #[test]
    fn sent_registers_and_complete_deregisters() {
        let rm = RestrictionManager::default();
        let req = historical();
        drive_to_sent(&req, &rm);
        assert!(req.is_registered());
        assert_eq!(live_historical(&rm), 1);
        req.transition(RequestStatus::Complete, &rm).unwrap();
        assert!(!req.is_registered());
        assert_eq!(live_historical(&rm), 0);
        assert_eq!(req.attempts(), 1);
    }

    #[test]
    fn cannot_skip_queued() {
        let rm = RestrictionManager::default();
        let req = historical();
        assert!(matches!(
            req.transition(RequestStatus::Sent, &rm),
            Err(LifecycleError::InvalidTransition { .. })
        ));
        assert!(!req.is_registered());
    }

    #[test]
    fn log_is_ordered_through_queued_and_sent() {
        let rm = RestrictionManager::default();
        let req = historical();
        drive_to_sent(&req, &rm);
        req.transition(RequestStatus::Complete, &rm).unwrap();
        let statuses: Vec<_> = req.status_log().iter().map(|(s, _)| s).collect();
        assert_eq!(
            statuses,
            vec![
                RequestStatus::New,
                RequestStatus::Queued,
                RequestStatus::Processing,
                RequestStatus::Sent,
                RequestStatus::Complete,
            ]
        );
    }

    #[test]
    fn cancel_sent_returns_binding_and_deregisters() {
        let rm = RestrictionManager::default();
        let req = historical();
        req.transition(RequestStatus::Queued, &rm).unwrap();
        req.transition(RequestStatus::Processing, &rm).unwrap();
        let binding = SessionBinding {
            client_id: 1,
            port: 4002,
            request_id: 7,
        };
        req.bind(binding).unwrap();
        req.transition(RequestStatus::Sent, &rm).unwrap();
        assert_eq!(req.cancel(&rm).unwrap(), Some(binding));
        assert_eq!(req.status(), RequestStatus::Cancelled);
        assert_eq!(live_historical(&rm), 0);
        assert_eq!(req.cancel(&rm).unwrap(), None);
    }

    #[test]
    fn reset_from_complete_clears_everything() {
        let rm = RestrictionManager::default();
        let req = historical();
        req.transition(RequestStatus::Queued, &rm).unwrap();
        req.transition(RequestStatus::Processing, &rm).unwrap();
        req.bind(SessionBinding {
            client_id: 1,
            port: 4002,
            request_id: 3,
        })
        .unwrap();
        req.transition(RequestStatus::Sent, &rm).unwrap();
        req.append(bar(0, 10));
        req.transition(RequestStatus::Complete, &rm).unwrap();

        req.reset().unwrap();
        assert_eq!(req.status(), RequestStatus::New);
        assert!(req.data().is_empty());
        assert!(req.binding().is_none());
        assert_eq!(req.attempts(), 0);
    }

    #[test]
    fn reset_rejected_while_active() {
        let rm = RestrictionManager::default();
        let req = historical();
        req.transition(RequestStatus::Queued, &rm).unwrap();
        assert_eq!(
            req.reset(),
            Err(LifecycleError::NotResettable(RequestStatus::Queued))
        );
    }

    #[test]
    fn retry_reset_keeps_attempts() {
        let rm = RestrictionManager::default();
        let req = historical();
        drive_to_sent(&req, &rm);
        req.transition(RequestStatus::TimedOut, &rm).unwrap();
        req.retry_reset().unwrap();
        assert_eq!(req.status(), RequestStatus::New);
        assert_eq!(req.attempts(), 1);
        drive_to_sent(&req, &rm);
        assert_eq!(req.attempts(), 2);
    }

    #[test]
    fn update_coalesces_matching_key() {
        let req = DataRequest::new(
            Instrument::stock("AAPL"),
            RequestParams::StreamingBar(StreamingBarParams::default()),
        );
        req.append(bar(0, 10));
        req.update(bar(0, 11));
        req.update(bar(5, 12));
        let data = req.data();
        assert_eq!(data.len(), 2);
        assert_eq!(data[0], bar(0, 11));
    }

    #[test]
    fn fail_records_reason() {
        let rm = RestrictionManager::default();
        let req = historical();
        drive_to_sent(&req, &rm);
        req.fail(RequestFailure::venue(200, "No security definition"), &rm)
            .unwrap();
        assert_eq!(req.status(), RequestStatus::Failed);
        assert_eq!(req.failure().and_then(|f| f.code), Some(200));
        assert!(!req.is_registered());
    }

    #[test]
    fn bind_twice_is_rejected() {
        let req = historical();
        let binding = SessionBinding {
            client_id: 1,
            port: 4002,
            request_id: 1,
        };
        req.bind(binding).unwrap();
        assert_eq!(req.bind(binding), Err(LifecycleError::AlreadyBound(1)));
    }
}
