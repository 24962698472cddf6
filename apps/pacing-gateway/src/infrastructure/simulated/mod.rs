//! Simulated Venue
//!
//! In-process venue used by the binary and the integration tests. Every
//! transport owns a reader thread that answers requests after a latency
//! with synthetic rows and streams rows for unbounded requests until they
//! are cancelled. Faults can be injected: refused client identities,
//! silently dropped requests, pacing violations, rejections and forced
//! disconnects.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::application::ports::{
    Endpoint, EventSink, TransportError, VenueConnector, VenueEvent, VenueTransport,
};
use crate::domain::request::params::{TickFeed, WhatToShow};
use crate::domain::request::rows::{Bar, QuoteTick, ScanRow, TickValue, TradeTick};
use crate::domain::request::{ClientId, Instrument, RequestKind, RequestParams, Row, VenueRequestId};

/// Pacing violation code sent for injected pacing faults.
pub const SIMULATED_PACING_CODE: i32 = 162;

// =============================================================================
// Configuration
// =============================================================================

/// Simulated venue behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedVenueConfig {
    /// Delay between a request and its first response.
    pub latency: Duration,
    /// Interval between streamed rows.
    pub stream_interval: Duration,
    /// Delay before the handshake identifier is sent.
    pub handshake_delay: Duration,
    /// Rows per bounded response.
    pub rows_per_response: usize,
    /// First usable request id announced in the handshake.
    pub first_request_id: VenueRequestId,
}

impl Default for SimulatedVenueConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(25),
            stream_interval: Duration::from_millis(500),
            handshake_delay: Duration::from_millis(5),
            rows_per_response: 5,
            first_request_id: 1,
        }
    }
}

/// A request as received by the venue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRecord {
    /// Sending client identity.
    pub client_id: ClientId,
    /// Endpoint port.
    pub port: u16,
    /// Client-chosen request id.
    pub request_id: VenueRequestId,
    /// Request kind.
    pub kind: RequestKind,
    /// Instrument key.
    pub instrument: String,
    /// Arrival time.
    pub at: Instant,
}

#[derive(Debug, Clone)]
enum Fault {
    Drop,
    Pace,
    Reject(i32, String),
}

// =============================================================================
// Venue
// =============================================================================

struct VenueState {
    config: SimulatedVenueConfig,
    refused: Mutex<HashSet<ClientId>>,
    bound: Mutex<HashSet<(u16, ClientId)>>,
    faults: Mutex<VecDeque<Fault>>,
    sent: Mutex<Vec<SentRecord>>,
    cancelled: Mutex<Vec<(ClientId, VenueRequestId)>>,
    transports: Mutex<Vec<Weak<SimulatedTransport>>>,
    connects: AtomicUsize,
}

/// In-process venue; clones share state.
#[derive(Clone)]
pub struct SimulatedVenue {
    state: Arc<VenueState>,
}

impl std::fmt::Debug for SimulatedVenue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedVenue")
            .field("config", &self.state.config)
            .field("bound", &self.state.bound.lock().len())
            .finish_non_exhaustive()
    }
}

impl Default for SimulatedVenue {
    fn default() -> Self {
        Self::new(SimulatedVenueConfig::default())
    }
}

impl SimulatedVenue {
    /// Venue with the given behaviour.
    #[must_use]
    pub fn new(config: SimulatedVenueConfig) -> Self {
        Self {
            state: Arc::new(VenueState {
                config,
                refused: Mutex::new(HashSet::new()),
                bound: Mutex::new(HashSet::new()),
                faults: Mutex::new(VecDeque::new()),
                sent: Mutex::new(Vec::new()),
                cancelled: Mutex::new(Vec::new()),
                transports: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
            }),
        }
    }

    /// Refuse `client_id` as if another application held it.
    pub fn refuse_client_id(&self, client_id: ClientId) {
        self.state.refused.lock().insert(client_id);
    }

    /// Silently swallow the next `n` requests.
    pub fn drop_next(&self, n: usize) {
        self.state.faults.lock().extend(std::iter::repeat_n(Fault::Drop, n));
    }

    /// Answer the next `n` requests with a pacing violation.
    pub fn pace_next(&self, n: usize) {
        self.state.faults.lock().extend(std::iter::repeat_n(Fault::Pace, n));
    }

    /// Reject the next request with `code`.
    pub fn reject_next(&self, code: i32, message: impl Into<String>) {
        self.state.faults.lock().push_back(Fault::Reject(code, message.into()));
    }

    /// Every request received so far, in arrival order.
    #[must_use]
    pub fn sent_log(&self) -> Vec<SentRecord> {
        self.state.sent.lock().clone()
    }

    /// Every venue-side cancel received so far.
    #[must_use]
    pub fn cancelled(&self) -> Vec<(ClientId, VenueRequestId)> {
        self.state.cancelled.lock().clone()
    }

    /// Successful connects and reconnects.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Client identities currently bound on `port`.
    #[must_use]
    pub fn bound_client_ids(&self, port: u16) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self
            .state
            .bound
            .lock()
            .iter()
            .filter(|(p, _)| *p == port)
            .map(|(_, id)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Drop every live connection from the venue side. Returns how many
    /// connections were closed.
    pub fn disconnect_all(&self) -> usize {
        let transports: Vec<Arc<SimulatedTransport>> = {
            let mut list = self.state.transports.lock();
            list.retain(|t| t.strong_count() > 0);
            list.iter().filter_map(Weak::upgrade).collect()
        };
        let closed = transports.into_iter().filter(|t| t.lose_connection()).count();
        tracing::info!(closed, "Simulated venue dropped connections");
        closed
    }
}

impl VenueConnector for SimulatedVenue {
    fn connect(
        &self,
        endpoint: &Endpoint,
        client_id: ClientId,
        sink: Arc<dyn EventSink>,
    ) -> Result<Arc<dyn VenueTransport>, TransportError> {
        let transport = Arc::new(SimulatedTransport {
            endpoint: endpoint.clone(),
            client_id,
            venue: Arc::clone(&self.state),
            sink: Arc::downgrade(&sink),
            link: Mutex::new(None),
        });
        transport.open_link()?;
        self.state.transports.lock().push(Arc::downgrade(&transport));
        Ok(transport)
    }
}

// =============================================================================
// Transport
// =============================================================================

enum Command {
    Send {
        id: VenueRequestId,
        instrument: Instrument,
        params: RequestParams,
    },
    Fail {
        id: VenueRequestId,
        code: i32,
        message: String,
    },
    Cancel(VenueRequestId),
}

struct SimulatedTransport {
    endpoint: Endpoint,
    client_id: ClientId,
    venue: Arc<VenueState>,
    sink: Weak<dyn EventSink>,
    link: Mutex<Option<Sender<Command>>>,
}

impl SimulatedTransport {
    fn open_link(&self) -> Result<(), TransportError> {
        let key = (self.endpoint.port, self.client_id);
        if self.venue.refused.lock().contains(&self.client_id) || !self.venue.bound.lock().insert(key) {
            return Err(TransportError::ClientIdInUse(self.client_id));
        }

        let (tx, rx) = mpsc::channel();
        let reader = Reader {
            client_id: self.client_id,
            config: self.venue.config.clone(),
            sink: Weak::clone(&self.sink),
            scheduled: Vec::new(),
        };
        let spawned = std::thread::Builder::new()
            .name(format!("sim-venue-{}", self.client_id))
            .spawn(move || reader.run(&rx));
        if let Err(err) = spawned {
            self.venue.bound.lock().remove(&key);
            return Err(TransportError::Io(err.to_string()));
        }

        *self.link.lock() = Some(tx);
        self.venue.connects.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(client_id = self.client_id, endpoint = %self.endpoint, "Simulated connection opened");
        Ok(())
    }

    fn close_link(&self) -> bool {
        let closed = self.link.lock().take().is_some();
        if closed {
            self.venue.bound.lock().remove(&(self.endpoint.port, self.client_id));
        }
        closed
    }

    fn lose_connection(&self) -> bool {
        if !self.close_link() {
            return false;
        }
        if let Some(sink) = self.sink.upgrade() {
            sink.on_event(VenueEvent::ConnectionClosed);
        }
        true
    }

    fn command(&self, command: Command) -> Result<(), TransportError> {
        self.link
            .lock()
            .as_ref()
            .ok_or(TransportError::NotConnected)?
            .send(command)
            .map_err(|_| TransportError::NotConnected)
    }
}

impl VenueTransport for SimulatedTransport {
    fn send(
        &self,
        kind: RequestKind,
        id: VenueRequestId,
        instrument: &Instrument,
        params: &RequestParams,
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.venue.sent.lock().push(SentRecord {
            client_id: self.client_id,
            port: self.endpoint.port,
            request_id: id,
            kind,
            instrument: instrument.key(),
            at: Instant::now(),
        });
        let fault = self.venue.faults.lock().pop_front();
        match fault {
            Some(Fault::Drop) => {
                tracing::debug!(client_id = self.client_id, venue_request_id = id, "Simulated venue dropped request");
                Ok(())
            }
            Some(Fault::Pace) => self.command(Command::Fail {
                id,
                code: SIMULATED_PACING_CODE,
                message: "Historical data request pacing violation".to_string(),
            }),
            Some(Fault::Reject(code, message)) => self.command(Command::Fail { id, code, message }),
            None => self.command(Command::Send {
                id,
                instrument: instrument.clone(),
                params: params.clone(),
            }),
        }
    }

    fn cancel(&self, _kind: RequestKind, id: VenueRequestId) -> Result<(), TransportError> {
        self.venue.cancelled.lock().push((self.client_id, id));
        self.command(Command::Cancel(id))
    }

    fn is_connected(&self) -> bool {
        self.link.lock().is_some()
    }

    fn disconnect(&self) {
        if self.close_link() {
            tracing::debug!(client_id = self.client_id, "Simulated connection closed");
        }
    }

    fn reconnect(&self) -> Result<(), TransportError> {
        self.close_link();
        self.open_link()
    }
}

// =============================================================================
// Reader Thread
// =============================================================================

struct Scheduled {
    due: Instant,
    id: VenueRequestId,
    action: Action,
}

enum Action {
    Respond(Vec<VenueEvent>),
    Stream {
        params: RequestParams,
        seq: u32,
    },
}

struct Reader {
    client_id: ClientId,
    config: SimulatedVenueConfig,
    sink: Weak<dyn EventSink>,
    scheduled: Vec<Scheduled>,
}

impl Reader {
    fn run(mut self, commands: &Receiver<Command>) {
        std::thread::sleep(self.config.handshake_delay);
        if !self.emit(VenueEvent::NextValidId(self.config.first_request_id)) {
            return;
        }

        loop {
            let now = Instant::now();
            let wait = self
                .scheduled
                .iter()
                .map(|s| s.due.saturating_duration_since(now))
                .min()
                .unwrap_or(self.config.stream_interval);
            match commands.recv_timeout(wait) {
                Ok(Command::Send { id, instrument, params }) => self.accept(id, &instrument, params),
                Ok(Command::Fail { id, code, message }) => self.scheduled.push(Scheduled {
                    due: Instant::now() + self.config.latency,
                    id,
                    action: Action::Respond(vec![VenueEvent::Error {
                        request_id: Some(id),
                        code,
                        message,
                    }]),
                }),
                Ok(Command::Cancel(id)) => self.scheduled.retain(|s| s.id != id),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if !self.fire_due() {
                break;
            }
        }
        tracing::debug!(client_id = self.client_id, "Simulated reader stopped");
    }

    fn emit(&self, event: VenueEvent) -> bool {
        match self.sink.upgrade() {
            Some(sink) => {
                sink.on_event(event);
                true
            }
            None => false,
        }
    }

    fn accept(&mut self, id: VenueRequestId, instrument: &Instrument, params: RequestParams) {
        let due = Instant::now() + self.config.latency;
        let action = if params.is_bounded() {
            let mut events: Vec<VenueEvent> = synthesize(instrument, &params, self.config.rows_per_response)
                .into_iter()
                .map(|row| VenueEvent::Row { request_id: id, row })
                .collect();
            events.push(VenueEvent::End { request_id: id });
            Action::Respond(events)
        } else {
            Action::Stream { params, seq: 0 }
        };
        self.scheduled.push(Scheduled { due, id, action });
    }

    fn fire_due(&mut self) -> bool {
        let now = Instant::now();
        let (due, pending): (Vec<Scheduled>, Vec<Scheduled>) =
            self.scheduled.drain(..).partition(|s| s.due <= now);
        self.scheduled = pending;

        for scheduled in due {
            match scheduled.action {
                Action::Respond(events) => {
                    for event in events {
                        if !self.emit(event) {
                            return false;
                        }
                    }
                }
                Action::Stream { params, seq } => {
                    if !self.emit(stream_event(scheduled.id, &params, seq)) {
                        return false;
                    }
                    self.scheduled.push(Scheduled {
                        due: now + self.config.stream_interval,
                        id: scheduled.id,
                        action: Action::Stream { params, seq: seq + 1 },
                    });
                }
            }
        }
        true
    }
}

// =============================================================================
// Synthetic Data
// =============================================================================

fn price(step: u32) -> Decimal {
    Decimal::new(10_000 + i64::from(step % 200), 2)
}

fn bar(time: DateTime<Utc>, step: u32) -> Bar {
    let open = price(step);
    Bar {
        time,
        open,
        high: open + Decimal::new(25, 2),
        low: open - Decimal::new(25, 2),
        close: open + Decimal::new(5, 2),
        volume: Decimal::from(100 + step),
        wap: open,
        count: u64::from(10 + step),
    }
}

fn quote(time: DateTime<Utc>, step: u32) -> QuoteTick {
    let bid = price(step);
    QuoteTick {
        time,
        bid,
        ask: bid + Decimal::new(1, 2),
        bid_size: Decimal::from(100),
        ask_size: Decimal::from(200),
    }
}

fn trade(time: DateTime<Utc>, step: u32) -> TradeTick {
    TradeTick {
        time,
        price: price(step),
        size: Decimal::from(100),
        exchange: "SIM".to_string(),
    }
}

fn synthesize(instrument: &Instrument, params: &RequestParams, count: usize) -> Vec<Row> {
    let steps = (0..u32::try_from(count).unwrap_or(u32::MAX)).collect::<Vec<_>>();
    let now = Utc::now();
    match params {
        RequestParams::Historical(p) => {
            let step = p.bar_size.duration();
            steps
                .iter()
                .map(|&i| (p.start + step * i32::try_from(i).unwrap_or(i32::MAX), i))
                .take_while(|(t, _)| p.end.is_none_or(|end| *t < end))
                .map(|(t, i)| match p.what_to_show {
                    WhatToShow::BidAsk => Row::Quote(quote(t, i)),
                    _ => Row::Bar(bar(t, i)),
                })
                .collect()
        }
        RequestParams::HistoricalTick(p) => steps
            .iter()
            .map(|&i| {
                let t = p.start + TimeDelta::seconds(i64::from(i));
                match p.feed {
                    TickFeed::BidAsk => Row::Quote(quote(t, i)),
                    TickFeed::Trades | TickFeed::Midpoint => Row::Trade(trade(t, i)),
                }
            })
            .collect(),
        RequestParams::Snapshot(_) => ["bid", "ask", "last", "volume"]
            .into_iter()
            .zip(0..)
            .map(|(field, i)| {
                Row::Tick(TickValue {
                    time: now,
                    field: field.to_string(),
                    value: price(i),
                })
            })
            .collect(),
        RequestParams::Scanner(p) => (1..=p.rows.min(u32::try_from(count).unwrap_or(u32::MAX)))
            .map(|rank| {
                Row::Scan(ScanRow {
                    rank,
                    symbol: format!("SIM{rank}"),
                    contract_id: 100_000 + i64::from(rank),
                })
            })
            .collect(),
        RequestParams::Fundamental(p) => vec![Row::Report {
            body: format!("<{} symbol=\"{}\"/>", p.report_type, instrument.symbol),
        }],
        RequestParams::HeadTimestamp(_) => DateTime::from_timestamp(946_900_800, 0)
            .map(|time| Row::HeadTimestamp { time })
            .into_iter()
            .collect(),
        RequestParams::StreamingBar(_) | RequestParams::StreamingTick(_) => Vec::new(),
    }
}

/// Streaming bar rows update the bar that is currently forming, so
/// consecutive updates within one bar share a timestamp.
fn stream_event(request_id: VenueRequestId, params: &RequestParams, seq: u32) -> VenueEvent {
    let now = Utc::now();
    let floor = |secs: i64| DateTime::from_timestamp(now.timestamp() - now.timestamp().rem_euclid(secs), 0).unwrap_or(now);
    match params {
        RequestParams::StreamingTick(p) => VenueEvent::Row {
            request_id,
            row: match p.feed {
                TickFeed::BidAsk => Row::Quote(quote(now, seq)),
                TickFeed::Trades | TickFeed::Midpoint => Row::Trade(trade(now, seq)),
            },
        },
        RequestParams::Historical(p) => VenueEvent::RowUpdate {
            request_id,
            row: Row::Bar(bar(floor(p.bar_size.duration().num_seconds().max(1)), seq)),
        },
        _ => VenueEvent::RowUpdate {
            request_id,
            row: Row::Bar(bar(floor(5), seq)),
        },
    }
}
