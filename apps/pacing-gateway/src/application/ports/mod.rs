//! Port Interfaces
//!
//! Contracts between the scheduling core and the venue transport.
//!
//! ## Driven Ports (Outbound)
//!
//! - `VenueConnector`: Opens a transport bound to one client identity
//! - `VenueTransport`: Fire-and-forget commands on an open connection
//!
//! ## Driver Ports (Inbound)
//!
//! - `EventSink`: Receives asynchronous venue callbacks from the transport's
//!   reader thread

use std::sync::Arc;

use crate::domain::request::{ClientId, Instrument, RequestKind, RequestParams, Row, VenueRequestId};

/// Venue error codes that signal a pacing violation rather than a bad request.
pub const PACING_VIOLATION_CODES: [i32; 2] = [162, 420];

/// Whether a venue error code means "too fast, try again later".
#[must_use]
pub fn is_pacing_violation(code: i32) -> bool {
    PACING_VIOLATION_CODES.contains(&code)
}

/// Venue host and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Endpoint at `host:port`.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Transport-level failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection is down.
    #[error("not connected")]
    NotConnected,
    /// The venue refused the client identity.
    #[error("client id {0} already in use")]
    ClientIdInUse(ClientId),
    /// Socket-level failure.
    #[error("i/o error: {0}")]
    Io(String),
    /// The venue rejected the command outright.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Asynchronous callback from the venue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VenueEvent {
    /// Handshake done; first usable request id.
    NextValidId(VenueRequestId),
    /// A result row to append.
    Row {
        /// Venue request id.
        request_id: VenueRequestId,
        /// Row payload.
        row: Row,
    },
    /// A streaming row that supersedes the last one with the same key.
    RowUpdate {
        /// Venue request id.
        request_id: VenueRequestId,
        /// Row payload.
        row: Row,
    },
    /// Terminal callback of a bounded request.
    End {
        /// Venue request id.
        request_id: VenueRequestId,
    },
    /// Error, optionally tied to a request.
    Error {
        /// Venue request id, if request-specific.
        request_id: Option<VenueRequestId>,
        /// Venue error code.
        code: i32,
        /// Venue error message.
        message: String,
    },
    /// The connection dropped.
    ConnectionClosed,
}

/// Outbound commands on an open venue connection.
///
/// Requests are fire-and-forget: results arrive later through the
/// connection's [`EventSink`], keyed by the client-chosen id.
#[cfg_attr(test, mockall::automock)]
pub trait VenueTransport: Send + Sync {
    /// Send a request under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the command could not be written.
    fn send(
        &self,
        kind: RequestKind,
        id: VenueRequestId,
        instrument: &Instrument,
        params: &RequestParams,
    ) -> Result<(), TransportError>;

    /// Cancel the request sent under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the command could not be written.
    fn cancel(&self, kind: RequestKind, id: VenueRequestId) -> Result<(), TransportError>;

    /// Whether the connection is up.
    fn is_connected(&self) -> bool;

    /// Drop the connection.
    fn disconnect(&self);

    /// Re-establish the connection under the same client identity.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the venue cannot be reached.
    fn reconnect(&self) -> Result<(), TransportError>;
}

/// Receiver of venue callbacks, invoked on the transport's reader thread.
pub trait EventSink: Send + Sync {
    /// Handle one callback. Must not block for long.
    fn on_event(&self, event: VenueEvent);
}

/// Opens venue connections.
pub trait VenueConnector: Send + Sync {
    /// Connect to `endpoint` as `client_id`, delivering callbacks to `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the connection cannot be opened.
    fn connect(
        &self,
        endpoint: &Endpoint,
        client_id: ClientId,
        sink: Arc<dyn EventSink>,
    ) -> Result<Arc<dyn VenueTransport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pacing_codes() {
        assert!(is_pacing_violation(162));
        assert!(is_pacing_violation(420));
        assert!(!is_pacing_violation(200));
    }

    #[test]
    fn endpoint_display() {
        assert_eq!(Endpoint::new("127.0.0.1", 4002).to_string(), "127.0.0.1:4002");
    }
}
