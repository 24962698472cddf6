//! Venue Sessions
//!
//! A `Session` composes a command sender (the `VenueTransport`) with an
//! explicit dispatch of venue callbacks to the requests it has in flight.
//! Callbacks arrive on the transport's reader thread; dispatch only holds
//! the open-request map lock long enough to look a request up.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::application::ports::{
    Endpoint, EventSink, TransportError, VenueConnector, VenueEvent, VenueTransport,
    is_pacing_violation,
};
use crate::domain::request::{
    ClientId, DataRequest, RequestFailure, RequestStatus, SessionBinding, VenueRequestId,
};
use crate::domain::restriction::RestrictionManager;
use crate::infrastructure::metrics;

/// Called with unbounded requests whose session failed underneath them, so
/// they can be requeued.
pub type FailoverHook = Box<dyn Fn(Arc<DataRequest>) + Send + Sync>;

/// Shared, late-bound failover hook.
pub type SharedFailover = Arc<OnceLock<FailoverHook>>;

// =============================================================================
// Session Role
// =============================================================================

/// Logical role of a session; each role connects to its own port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    /// Snapshots and streams.
    MarketData,
    /// Historical bars, ticks and head timestamps.
    Historical,
    /// Scanners and fundamentals.
    Reference,
}

impl SessionRole {
    /// Every role.
    pub const ALL: [Self; 3] = [Self::MarketData, Self::Historical, Self::Reference];

    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MarketData => "market_data",
            Self::Historical => "historical",
            Self::Reference => "reference",
        }
    }
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session establishment failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No client identity could be established.
    #[error("could not establish a {role} session after {attempts} attempts: {last}")]
    ConnectFailed {
        /// Role requested.
        role: SessionRole,
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        last: String,
    },
    /// Connected, but the venue never sent the initial request id.
    #[error("client {client_id} got no handshake within {waited:?}")]
    HandshakeTimeout {
        /// Client identity.
        client_id: ClientId,
        /// Time waited.
        waited: Duration,
    },
    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Handshake wait parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeWait {
    /// Total wait for the initial request id.
    pub timeout: Duration,
    /// Poll interval while waiting.
    pub poll: Duration,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Role.
    pub role: SessionRole,
    /// Client identity.
    pub client_id: ClientId,
    /// Endpoint port.
    pub port: u16,
    /// Connection state.
    pub connected: bool,
    /// Requests awaiting callbacks.
    pub open_requests: usize,
}

// =============================================================================
// Session
// =============================================================================

/// One duplex channel to the venue bound to a client identity.
pub struct Session {
    role: SessionRole,
    client_id: ClientId,
    endpoint: Endpoint,
    next_id: AtomicI64,
    handshake: AtomicBool,
    open: Mutex<HashMap<VenueRequestId, Arc<DataRequest>>>,
    transport: RwLock<Option<Arc<dyn VenueTransport>>>,
    restrictions: Arc<RestrictionManager>,
    failover: SharedFailover,
    wait: HandshakeWait,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("client_id", &self.client_id)
            .field("endpoint", &self.endpoint)
            .field("open_requests", &self.open.lock().len())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Build an unconnected session.
    #[must_use]
    pub fn new(
        role: SessionRole,
        client_id: ClientId,
        endpoint: Endpoint,
        restrictions: Arc<RestrictionManager>,
        failover: SharedFailover,
        wait: HandshakeWait,
    ) -> Self {
        Self {
            role,
            client_id,
            endpoint,
            next_id: AtomicI64::new(1),
            handshake: AtomicBool::new(false),
            open: Mutex::new(HashMap::new()),
            transport: RwLock::new(None),
            restrictions,
            failover,
            wait,
        }
    }

    /// Connect a new session and wait for its handshake.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] if the transport cannot connect or the
    /// handshake does not arrive in time.
    pub fn open(
        session: Self,
        connector: &dyn VenueConnector,
    ) -> Result<Arc<Self>, SessionError> {
        let session = Arc::new(session);
        let sink: Arc<dyn EventSink> = Arc::clone(&session) as Arc<dyn EventSink>;
        let transport = connector.connect(&session.endpoint, session.client_id, sink)?;
        *session.transport.write() = Some(transport);
        if let Err(err) = session.await_handshake() {
            session.disconnect();
            return Err(err);
        }
        tracing::info!(
            role = %session.role,
            client_id = session.client_id,
            endpoint = %session.endpoint,
            "Session established"
        );
        Ok(session)
    }

    /// Session role.
    #[must_use]
    pub const fn role(&self) -> SessionRole {
        self.role
    }

    /// Client identity.
    #[must_use]
    pub const fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Endpoint port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.endpoint.port
    }

    /// Next client-side request id.
    pub fn next_request_id(&self) -> VenueRequestId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Binding for a venue request id on this session.
    #[must_use]
    pub const fn binding(&self, request_id: VenueRequestId) -> SessionBinding {
        SessionBinding {
            client_id: self.client_id,
            port: self.endpoint.port,
            request_id,
        }
    }

    /// Connected and handshaken.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.handshake.load(Ordering::SeqCst)
            && self
                .transport
                .read()
                .as_ref()
                .is_some_and(|t| t.is_connected())
    }

    /// Route callbacks for `id` to `request`.
    pub fn track(&self, id: VenueRequestId, request: Arc<DataRequest>) {
        self.open.lock().insert(id, request);
    }

    /// Stop routing callbacks for `id`.
    pub fn untrack(&self, id: VenueRequestId) -> Option<Arc<DataRequest>> {
        self.open.lock().remove(&id)
    }

    /// Requests awaiting callbacks.
    #[must_use]
    pub fn open_requests(&self) -> usize {
        self.open.lock().len()
    }

    fn transport(&self) -> Result<Arc<dyn VenueTransport>, TransportError> {
        self.transport
            .read()
            .as_ref()
            .map(Arc::clone)
            .ok_or(TransportError::NotConnected)
    }

    /// Dispatch `request` under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the command could not be written.
    pub fn send(&self, id: VenueRequestId, request: &DataRequest) -> Result<(), TransportError> {
        self.transport()?.send(
            request.params().kind(),
            id,
            request.instrument(),
            request.params(),
        )
    }

    /// Cancel `request` at the venue and stop routing its callbacks.
    pub fn cancel(&self, id: VenueRequestId, request: &DataRequest) {
        self.untrack(id);
        match self.transport().and_then(|t| t.cancel(request.params().kind(), id)) {
            Ok(()) => tracing::debug!(client_id = self.client_id, venue_request_id = id, "Cancelled at venue"),
            Err(err) => tracing::debug!(
                client_id = self.client_id,
                venue_request_id = id,
                error = %err,
                "Venue cancel not delivered"
            ),
        }
    }

    /// Drop the connection and fail over every open request.
    pub fn disconnect(&self) {
        self.handshake.store(false, Ordering::SeqCst);
        if let Ok(transport) = self.transport() {
            transport.disconnect();
        }
        self.fail_open_requests();
    }

    /// Reconnect under the same client identity.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] if the transport cannot reconnect or the
    /// handshake does not arrive.
    pub fn reconnect(&self) -> Result<(), SessionError> {
        self.handshake.store(false, Ordering::SeqCst);
        self.transport()?.reconnect()?;
        self.await_handshake()?;
        tracing::info!(role = %self.role, client_id = self.client_id, "Session reconnected");
        Ok(())
    }

    fn await_handshake(&self) -> Result<(), SessionError> {
        let started = Instant::now();
        while !self.handshake.load(Ordering::SeqCst) {
            if started.elapsed() >= self.wait.timeout {
                return Err(SessionError::HandshakeTimeout {
                    client_id: self.client_id,
                    waited: self.wait.timeout,
                });
            }
            std::thread::sleep(self.wait.poll);
        }
        Ok(())
    }

    /// Point-in-time view.
    #[must_use]
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            role: self.role,
            client_id: self.client_id,
            port: self.endpoint.port,
            connected: self.is_connected(),
            open_requests: self.open_requests(),
        }
    }

    fn lookup(&self, id: VenueRequestId) -> Option<Arc<DataRequest>> {
        let found = self.open.lock().get(&id).map(Arc::clone);
        if found.is_none() {
            tracing::debug!(client_id = self.client_id, venue_request_id = id, "Callback for untracked request ignored");
        }
        found
    }

    fn time_out(&self, request: Arc<DataRequest>) {
        if request.status() != RequestStatus::Sent {
            return;
        }
        if let Err(err) = request.transition(RequestStatus::TimedOut, &self.restrictions) {
            tracing::warn!(request_id = %request.id(), error = %err, "Could not mark request timed out");
            return;
        }
        metrics::record_venue_timeout(self.role.as_str());
        if !request.params().is_bounded()
            && let Some(hook) = self.failover.get()
        {
            hook(request);
        }
    }

    fn fail_open_requests(&self) {
        let drained: Vec<Arc<DataRequest>> = self.open.lock().drain().map(|(_, r)| r).collect();
        if !drained.is_empty() {
            tracing::warn!(
                client_id = self.client_id,
                requests = drained.len(),
                "Session lost with requests in flight"
            );
        }
        for request in drained {
            self.time_out(request);
        }
    }
}

impl EventSink for Session {
    fn on_event(&self, event: VenueEvent) {
        match event {
            VenueEvent::NextValidId(id) => {
                self.next_id.fetch_max(id, Ordering::SeqCst);
                self.handshake.store(true, Ordering::SeqCst);
            }
            VenueEvent::Row { request_id, row } => {
                if let Some(request) = self.lookup(request_id) {
                    request.append(row);
                }
            }
            VenueEvent::RowUpdate { request_id, row } => {
                if let Some(request) = self.lookup(request_id) {
                    request.update(row);
                }
            }
            VenueEvent::End { request_id } => {
                if let Some(request) = self.untrack(request_id)
                    && let Err(err) = request.transition(RequestStatus::Complete, &self.restrictions)
                {
                    tracing::debug!(request_id = %request.id(), error = %err, "End callback after request left SENT");
                }
            }
            VenueEvent::Error {
                request_id: Some(request_id),
                code,
                message,
            } => {
                let Some(request) = self.untrack(request_id) else {
                    tracing::debug!(venue_request_id = request_id, code, "Error for untracked request ignored");
                    return;
                };
                if is_pacing_violation(code) {
                    tracing::warn!(request_id = %request.id(), code, %message, "Venue pacing violation");
                    self.time_out(request);
                } else {
                    tracing::warn!(request_id = %request.id(), code, %message, "Venue rejected request");
                    if let Err(err) =
                        request.fail(RequestFailure::venue(code, message), &self.restrictions)
                    {
                        tracing::debug!(request_id = %request.id(), error = %err, "Error callback after request left SENT");
                    }
                }
            }
            VenueEvent::Error {
                request_id: None,
                code,
                message,
            } => {
                tracing::info!(client_id = self.client_id, code, %message, "Venue notice");
            }
            VenueEvent::ConnectionClosed => {
                self.handshake.store(false, Ordering::SeqCst);
                self.fail_open_requests();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use mockall::predicate::eq;

    use super::*;
    use crate::application::ports::MockVenueTransport;
    use crate::domain::request::params::{BarSize, HistoricalParams, StreamingBarParams};
    use crate::domain::request::{Instrument, RequestKind, RequestParams};

    fn session(failover: SharedFailover) -> Session {
        Session::new(
            SessionRole::Historical,
            1,
            Endpoint::new("localhost", 4002),
            Arc::new(RestrictionManager::default()),
            failover,
            HandshakeWait {
                timeout: Duration::from_millis(50),
                poll: Duration::from_millis(5),
            },
        )
    }

    fn sent(session: &Session, params: RequestParams, id: VenueRequestId) -> Arc<DataRequest> {
        let request = Arc::new(DataRequest::new(Instrument::stock("AAPL"), params));
        for status in [RequestStatus::Queued, RequestStatus::Processing, RequestStatus::Sent] {
            request.transition(status, &session.restrictions).unwrap();
        }
        session.track(id, Arc::clone(&request));
        request
    }

    fn historical() -> RequestParams {
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 14, 30, 0).unwrap();
        RequestParams::Historical(HistoricalParams::new(start, None, BarSize::minutes(1)))
    }

    #[test]
    fn handshake_advances_request_ids() {
        let s = session(SharedFailover::default());
        s.on_event(VenueEvent::NextValidId(500));
        assert_eq!(s.next_request_id(), 500);
        assert_eq!(s.next_request_id(), 501);
    }

    #[test]
    fn end_completes_and_untracks() {
        let s = session(SharedFailover::default());
        let request = sent(&s, historical(), 9);
        s.on_event(VenueEvent::End { request_id: 9 });
        assert_eq!(request.status(), RequestStatus::Complete);
        assert_eq!(s.open_requests(), 0);
        s.on_event(VenueEvent::End { request_id: 9 });
    }

    #[test]
    fn pacing_error_times_out_and_other_errors_fail() {
        let s = session(SharedFailover::default());
        let paced = sent(&s, historical(), 1);
        let rejected = sent(&s, historical(), 2);
        s.on_event(VenueEvent::Error {
            request_id: Some(1),
            code: 162,
            message: "Historical Market Data Service error message:pacing violation".into(),
        });
        s.on_event(VenueEvent::Error {
            request_id: Some(2),
            code: 200,
            message: "No security definition has been found".into(),
        });
        assert_eq!(paced.status(), RequestStatus::TimedOut);
        assert_eq!(rejected.status(), RequestStatus::Failed);
        assert_eq!(rejected.failure().and_then(|f| f.code), Some(200));
    }

    #[test]
    fn connection_loss_fails_over_unbounded_requests() {
        let failover = SharedFailover::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        assert!(
            failover
                .set(Box::new(move |r: Arc<DataRequest>| sink.lock().push(r.id())))
                .is_ok()
        );
        let s = session(failover);
        let bounded = sent(&s, historical(), 1);
        let stream = sent(&s, RequestParams::StreamingBar(StreamingBarParams::default()), 2);

        s.on_event(VenueEvent::ConnectionClosed);

        assert_eq!(bounded.status(), RequestStatus::TimedOut);
        assert_eq!(stream.status(), RequestStatus::TimedOut);
        assert_eq!(*seen.lock(), vec![stream.id()]);
        assert_eq!(s.open_requests(), 0);
    }

    #[test]
    fn rows_for_untracked_ids_are_ignored() {
        let s = session(SharedFailover::default());
        s.on_event(VenueEvent::Row {
            request_id: 77,
            row: crate::domain::request::Row::Report { body: "x".into() },
        });
        assert_eq!(s.open_requests(), 0);
    }

    #[test]
    fn send_and_cancel_go_through_transport() {
        let s = session(SharedFailover::default());
        let mut transport = MockVenueTransport::new();
        transport
            .expect_send()
            .withf(|kind, id, _, _| *kind == RequestKind::Historical && *id == 4)
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        transport
            .expect_cancel()
            .with(eq(RequestKind::Historical), eq(4))
            .times(1)
            .returning(|_, _| Ok(()));
        *s.transport.write() = Some(Arc::new(transport));

        let request = sent(&s, historical(), 4);
        s.send(4, &request).unwrap();
        s.cancel(4, &request);
        assert_eq!(s.open_requests(), 0);
    }

    #[test]
    fn send_without_transport_is_not_connected() {
        let s = session(SharedFailover::default());
        let request = DataRequest::new(Instrument::stock("AAPL"), historical());
        assert_eq!(s.send(1, &request), Err(TransportError::NotConnected));
        assert!(!s.is_connected());
    }
}
