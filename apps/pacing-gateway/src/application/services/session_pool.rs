//! Session Pool
//!
//! Allocates and reuses sessions per role. New sessions probe client
//! identities upward from 1, skipping identities already bound on the
//! role's port; disconnected sessions are reconnected in place.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use super::reconnect::{Backoff, BackoffConfig, retry};
use super::session::{HandshakeWait, Session, SessionError, SessionInfo, SessionRole, SharedFailover};
use crate::application::ports::{Endpoint, TransportError, VenueConnector};
use crate::domain::request::{ClientId, SessionBinding};
use crate::domain::restriction::RestrictionManager;
use crate::infrastructure::metrics;

/// Session pool settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionPoolConfig {
    /// Venue host.
    pub host: String,
    /// Port serving market data sessions.
    pub market_data_port: u16,
    /// Port serving historical sessions.
    pub historical_port: u16,
    /// Port serving reference sessions.
    pub reference_port: u16,
    /// Connection attempts before giving up on a new session.
    pub max_connect_attempts: u32,
    /// Handshake wait per attempt.
    pub handshake: HandshakeWait,
    /// Backoff for reconnecting an existing session.
    pub backoff: BackoffConfig,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            market_data_port: 4002,
            historical_port: 4002,
            reference_port: 4002,
            max_connect_attempts: 10,
            handshake: HandshakeWait {
                timeout: Duration::from_secs(2),
                poll: Duration::from_millis(20),
            },
            backoff: BackoffConfig::default(),
        }
    }
}

impl SessionPoolConfig {
    /// Endpoint serving `role`.
    #[must_use]
    pub fn endpoint(&self, role: SessionRole) -> Endpoint {
        let port = match role {
            SessionRole::MarketData => self.market_data_port,
            SessionRole::Historical => self.historical_port,
            SessionRole::Reference => self.reference_port,
        };
        Endpoint::new(self.host.clone(), port)
    }
}

/// Pool of venue sessions keyed by role.
pub struct SessionPool {
    config: SessionPoolConfig,
    connector: Arc<dyn VenueConnector>,
    restrictions: Arc<RestrictionManager>,
    failover: SharedFailover,
    sessions: Mutex<Vec<Arc<Session>>>,
    /// Establishment and reconnect are serialised per role, never pool-wide.
    establishing: [Mutex<()>; SessionRole::ALL.len()],
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("config", &self.config)
            .field("sessions", &self.sessions.lock().len())
            .finish_non_exhaustive()
    }
}

impl SessionPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new(
        config: SessionPoolConfig,
        connector: Arc<dyn VenueConnector>,
        restrictions: Arc<RestrictionManager>,
        failover: SharedFailover,
    ) -> Self {
        Self {
            config,
            connector,
            restrictions,
            failover,
            sessions: Mutex::new(Vec::new()),
            establishing: Default::default(),
        }
    }

    fn establishing(&self, role: SessionRole) -> MutexGuard<'_, ()> {
        let slot = match role {
            SessionRole::MarketData => 0,
            SessionRole::Historical => 1,
            SessionRole::Reference => 2,
        };
        self.establishing[slot].lock()
    }

    /// A connected session for `role`, reusing, reconnecting or creating
    /// one as needed.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::ConnectFailed`] once every client identity
    /// probe has failed.
    pub fn get_session(&self, role: SessionRole) -> Result<Arc<Session>, SessionError> {
        let _establishing = self.establishing(role);

        let existing = self.sessions.lock().iter().find(|s| s.role() == role).map(Arc::clone);
        if let Some(session) = existing {
            if session.is_connected() {
                return Ok(session);
            }
            match self.reconnect(&session) {
                Ok(()) => return Ok(session),
                Err(err) => {
                    tracing::warn!(
                        role = %role,
                        client_id = session.client_id(),
                        error = %err,
                        "Dropping session that could not be reconnected"
                    );
                    session.disconnect();
                    self.sessions.lock().retain(|s| !Arc::ptr_eq(s, &session));
                }
            }
        }

        let session = self.establish(role)?;
        self.sessions.lock().push(Arc::clone(&session));
        metrics::set_live_sessions(self.sessions.lock().len());
        Ok(session)
    }

    fn establish(&self, role: SessionRole) -> Result<Arc<Session>, SessionError> {
        let endpoint = self.config.endpoint(role);
        let mut taken: Vec<ClientId> = self
            .sessions
            .lock()
            .iter()
            .filter(|s| s.port() == endpoint.port)
            .map(|s| s.client_id())
            .collect();

        let mut candidate: ClientId = 1;
        let mut last = String::from("no attempt made");
        for attempt in 1..=self.config.max_connect_attempts {
            while taken.contains(&candidate) {
                candidate += 1;
            }
            let session = Session::new(
                role,
                candidate,
                endpoint.clone(),
                Arc::clone(&self.restrictions),
                Arc::clone(&self.failover),
                self.config.handshake,
            );
            match Session::open(session, self.connector.as_ref()) {
                Ok(session) => return Ok(session),
                Err(SessionError::Transport(TransportError::ClientIdInUse(id))) => {
                    tracing::debug!(role = %role, client_id = id, attempt, "Client id in use, probing next");
                    taken.push(id);
                    last = format!("client id {id} in use");
                }
                Err(err) => {
                    tracing::warn!(role = %role, client_id = candidate, attempt, error = %err, "Session attempt failed");
                    last = err.to_string();
                    std::thread::sleep(self.config.handshake.poll);
                }
            }
        }

        Err(SessionError::ConnectFailed {
            role,
            attempts: self.config.max_connect_attempts,
            last,
        })
    }

    fn reconnect(&self, session: &Session) -> Result<(), SessionError> {
        metrics::record_session_reconnect(session.role().as_str());
        retry(
            Backoff::new(self.config.backoff.clone()),
            |_| session.reconnect(),
            std::thread::sleep,
        )
        .map_err(|exhausted| exhausted.last)
    }

    /// Session that owns `binding`, if still pooled.
    #[must_use]
    pub fn session_for(&self, binding: &SessionBinding) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .iter()
            .find(|s| s.client_id() == binding.client_id && s.port() == binding.port)
            .map(Arc::clone)
    }

    /// Force a disconnect + reconnect of `session`. Its open requests fail
    /// over as timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] if the session could not be reconnected;
    /// it stays pooled and is retried on the next `get_session`.
    pub fn recycle(&self, session: &Session) -> Result<(), SessionError> {
        let _establishing = self.establishing(session.role());
        tracing::warn!(role = %session.role(), client_id = session.client_id(), "Recycling session");
        session.disconnect();
        self.reconnect(session)
    }

    /// Every pooled session.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.lock().iter().map(|s| s.info()).collect()
    }

    /// Disconnect and forget every session.
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.lock().drain(..).collect();
        for session in sessions {
            session.disconnect();
        }
        metrics::set_live_sessions(0);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::application::ports::{EventSink, MockVenueTransport, VenueEvent, VenueTransport};

    /// Connector that refuses listed ids and handshakes immediately.
    struct Refusing {
        refused: HashSet<ClientId>,
        connects: AtomicU32,
    }

    impl VenueConnector for Refusing {
        fn connect(
            &self,
            _endpoint: &Endpoint,
            client_id: ClientId,
            sink: Arc<dyn EventSink>,
        ) -> Result<Arc<dyn VenueTransport>, TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.refused.contains(&client_id) {
                return Err(TransportError::ClientIdInUse(client_id));
            }
            sink.on_event(VenueEvent::NextValidId(1));
            let mut transport = MockVenueTransport::new();
            transport.expect_is_connected().return_const(true);
            transport.expect_disconnect().return_const(());
            Ok(Arc::new(transport))
        }
    }

    fn pool(refused: &[ClientId], attempts: u32) -> (SessionPool, Arc<Refusing>) {
        let connector = Arc::new(Refusing {
            refused: refused.iter().copied().collect(),
            connects: AtomicU32::new(0),
        });
        let config = SessionPoolConfig {
            max_connect_attempts: attempts,
            handshake: HandshakeWait {
                timeout: Duration::from_millis(50),
                poll: Duration::from_millis(1),
            },
            ..SessionPoolConfig::default()
        };
        let pool = SessionPool::new(
            config,
            Arc::clone(&connector) as Arc<dyn VenueConnector>,
            Arc::new(RestrictionManager::default()),
            SharedFailover::default(),
        );
        (pool, connector)
    }

    #[test]
    fn reuses_connected_session() {
        let (pool, connector) = pool(&[], 10);
        let a = pool.get_session(SessionRole::Historical).unwrap();
        let b = pool.get_session(SessionRole::Historical).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn probes_past_refused_ids() {
        let (pool, _) = pool(&[1, 2], 10);
        let session = pool.get_session(SessionRole::Historical).unwrap();
        assert_eq!(session.client_id(), 3);
    }

    #[test]
    fn skips_ids_bound_on_same_port() {
        let (pool, _) = pool(&[], 10);
        let first = pool.get_session(SessionRole::Historical).unwrap();
        let second = pool.get_session(SessionRole::MarketData).unwrap();
        assert_eq!(first.client_id(), 1);
        assert_eq!(second.client_id(), 2);
        assert_eq!(pool.sessions().len(), 2);
    }

    #[test]
    fn exhausting_attempts_is_an_error() {
        let (pool, connector) = pool(&[1, 2, 3], 3);
        let err = pool.get_session(SessionRole::Reference).unwrap_err();
        assert!(matches!(err, SessionError::ConnectFailed { attempts: 3, .. }));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
    }

    /// Connector that fails slowly on one port and connects instantly elsewhere.
    struct SlowPort {
        port: u16,
        delay: Duration,
    }

    impl VenueConnector for SlowPort {
        fn connect(
            &self,
            endpoint: &Endpoint,
            _client_id: ClientId,
            sink: Arc<dyn EventSink>,
        ) -> Result<Arc<dyn VenueTransport>, TransportError> {
            if endpoint.port == self.port {
                std::thread::sleep(self.delay);
                return Err(TransportError::Io("connection refused".to_string()));
            }
            sink.on_event(VenueEvent::NextValidId(1));
            let mut transport = MockVenueTransport::new();
            transport.expect_is_connected().return_const(true);
            transport.expect_disconnect().return_const(());
            Ok(Arc::new(transport))
        }
    }

    #[test]
    fn unreachable_role_does_not_stall_other_roles() {
        let config = SessionPoolConfig {
            historical_port: 4001,
            reference_port: 4003,
            max_connect_attempts: 1,
            handshake: HandshakeWait {
                timeout: Duration::from_millis(50),
                poll: Duration::from_millis(1),
            },
            ..SessionPoolConfig::default()
        };
        let pool = Arc::new(SessionPool::new(
            config,
            Arc::new(SlowPort {
                port: 4001,
                delay: Duration::from_millis(800),
            }),
            Arc::new(RestrictionManager::default()),
            SharedFailover::default(),
        ));

        let historical = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.get_session(SessionRole::Historical))
        };
        std::thread::sleep(Duration::from_millis(50));

        let started = std::time::Instant::now();
        let reference = pool.get_session(SessionRole::Reference);
        let waited = started.elapsed();

        assert!(reference.is_ok());
        assert!(waited < Duration::from_millis(400), "reference waited {waited:?}");
        assert!(historical.join().unwrap().is_err());
    }

    /// Connector whose first transport reports down and never reconnects.
    struct Unrecoverable {
        connects: AtomicU32,
    }

    impl VenueConnector for Unrecoverable {
        fn connect(
            &self,
            _endpoint: &Endpoint,
            _client_id: ClientId,
            sink: Arc<dyn EventSink>,
        ) -> Result<Arc<dyn VenueTransport>, TransportError> {
            let first = self.connects.fetch_add(1, Ordering::SeqCst) == 0;
            sink.on_event(VenueEvent::NextValidId(1));
            let mut transport = MockVenueTransport::new();
            transport.expect_is_connected().return_const(!first);
            transport
                .expect_reconnect()
                .returning(|| Err(TransportError::NotConnected));
            transport.expect_disconnect().return_const(());
            Ok(Arc::new(transport))
        }
    }

    #[test]
    fn dropped_session_fails_over_its_open_requests() {
        use crate::domain::request::params::StreamingBarParams;
        use crate::domain::request::{DataRequest, Instrument, RequestParams, RequestStatus};

        let restrictions = Arc::new(RestrictionManager::default());
        let failed_over = Arc::new(Mutex::new(Vec::new()));
        let failover = SharedFailover::default();
        let sink = Arc::clone(&failed_over);
        assert!(
            failover
                .set(Box::new(move |request: Arc<DataRequest>| sink.lock().push(request.id())))
                .is_ok()
        );
        let config = SessionPoolConfig {
            handshake: HandshakeWait {
                timeout: Duration::from_millis(50),
                poll: Duration::from_millis(1),
            },
            backoff: BackoffConfig {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                multiplier: 1.0,
                jitter_factor: 0.0,
                max_attempts: 1,
            },
            ..SessionPoolConfig::default()
        };
        let pool = SessionPool::new(
            config,
            Arc::new(Unrecoverable {
                connects: AtomicU32::new(0),
            }),
            Arc::clone(&restrictions),
            failover,
        );

        let broken = pool.get_session(SessionRole::MarketData).unwrap();
        let request = Arc::new(DataRequest::new(
            Instrument::stock("AAPL"),
            RequestParams::StreamingBar(StreamingBarParams::default()),
        ));
        request.transition(RequestStatus::Queued, &restrictions).unwrap();
        request.transition(RequestStatus::Processing, &restrictions).unwrap();
        let id = broken.next_request_id();
        request.bind(broken.binding(id)).unwrap();
        request.transition(RequestStatus::Sent, &restrictions).unwrap();
        broken.track(id, Arc::clone(&request));

        let replacement = pool.get_session(SessionRole::MarketData).unwrap();

        assert!(!Arc::ptr_eq(&broken, &replacement));
        assert_eq!(broken.open_requests(), 0);
        assert_eq!(request.status(), RequestStatus::TimedOut);
        assert_eq!(*failed_over.lock(), vec![request.id()]);
        assert_eq!(pool.sessions().len(), 1);
    }

    #[test]
    fn session_for_finds_binding_owner() {
        let (pool, _) = pool(&[], 10);
        let session = pool.get_session(SessionRole::Historical).unwrap();
        let binding = session.binding(12);
        assert!(pool.session_for(&binding).is_some_and(|s| Arc::ptr_eq(&s, &session)));
        pool.shutdown();
        assert!(pool.session_for(&binding).is_none());
    }
}
