//! End-to-end scheduling scenarios against the simulated venue.
//!
//! Each test builds its own gateway with short windows and timeouts so the
//! pacing behaviour is observable in well under a second.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use pacing_gateway::application::services::{BackoffConfig, HandshakeWait};
use pacing_gateway::domain::request::params::{
    BarSize, FundamentalParams, HistoricalParams, StreamingBarParams,
};
use pacing_gateway::{
    Gateway, GatewayOptions, Instrument, PolicyTable, RequestParams, RequestStatus,
    RestrictionClass, RestrictionPolicy, SchedulerConfig, SessionPoolConfig, SimulatedVenue,
    SimulatedVenueConfig,
};

// =============================================================================
// Helpers
// =============================================================================

const SETTLE: Duration = Duration::from_secs(5);

fn scheduler(request_timeout: Duration, max_attempts: u32) -> SchedulerConfig {
    SchedulerConfig {
        ceiling_poll: Duration::from_millis(10),
        completion_poll: Duration::from_millis(5),
        request_timeout,
        reconnect_threshold: 3,
        max_attempts,
        queue_capacity: None,
        queue_wait_slice: Duration::from_millis(20),
    }
}

fn sessions() -> SessionPoolConfig {
    SessionPoolConfig {
        max_connect_attempts: 5,
        handshake: HandshakeWait {
            timeout: Duration::from_millis(500),
            poll: Duration::from_millis(5),
        },
        backoff: BackoffConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts: 5,
        },
        ..SessionPoolConfig::default()
    }
}

fn venue(latency: Duration) -> Arc<SimulatedVenue> {
    Arc::new(SimulatedVenue::new(SimulatedVenueConfig {
        latency,
        stream_interval: Duration::from_millis(20),
        handshake_delay: Duration::from_millis(2),
        ..SimulatedVenueConfig::default()
    }))
}

fn gateway(venue: &Arc<SimulatedVenue>, policies: PolicyTable, scheduler: SchedulerConfig) -> Gateway {
    let options = GatewayOptions {
        policies,
        scheduler,
        sessions: sessions(),
        ..GatewayOptions::default()
    };
    Gateway::new(options, Arc::<SimulatedVenue>::clone(venue)).unwrap()
}

fn fundamental() -> RequestParams {
    RequestParams::Fundamental(FundamentalParams {
        report_type: "ReportSnapshot".to_string(),
    })
}

fn at(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 14, 30, 0).unwrap() + TimeDelta::minutes(minute)
}

fn small_bars(start_minute: i64, minutes: i64) -> RequestParams {
    RequestParams::Historical(HistoricalParams::new(
        at(start_minute),
        Some(at(start_minute + minutes)),
        BarSize::seconds(30),
    ))
}

fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

// =============================================================================
// Pacing
// =============================================================================

#[test]
fn identical_small_bar_requests_are_spaced_by_the_window() {
    let window = Duration::from_millis(400);
    let venue = venue(Duration::from_millis(5));
    let policies = PolicyTable::default()
        .with(RestrictionClass::IdenticalHighFreq, RestrictionPolicy::window(1, window));
    let gateway = gateway(&venue, policies, scheduler(Duration::from_secs(2), 3));

    let first = gateway.request(Instrument::stock("AAPL"), small_bars(0, 10)).unwrap();
    let second = gateway.request(Instrument::stock("AAPL"), small_bars(0, 10)).unwrap();
    first.place(0).unwrap();
    second.place(0).unwrap();

    assert_eq!(first.wait(SETTLE), RequestStatus::Complete);
    assert_eq!(second.wait(SETTLE), RequestStatus::Complete);

    let log = venue.sent_log();
    assert_eq!(log.len(), 2);
    let gap = log[1].at.duration_since(log[0].at);
    assert!(gap >= Duration::from_millis(350), "second identical request sent after {gap:?}");
}

#[test]
fn seventh_request_on_one_instrument_waits_for_the_window() {
    let window = Duration::from_millis(500);
    let venue = venue(Duration::from_millis(2));
    let policies = PolicyTable::default()
        .with(RestrictionClass::SameInstrumentHighFreq, RestrictionPolicy::window(6, window))
        .with(
            RestrictionClass::IdenticalHighFreq,
            RestrictionPolicy::window(100, Duration::from_secs(1)),
        );
    let gateway = gateway(&venue, policies, scheduler(Duration::from_secs(2), 3));

    let handles: Vec<_> = (0..7)
        .map(|i| gateway.request(Instrument::stock("MSFT"), small_bars(i * 10, 10)).unwrap())
        .collect();
    for handle in &handles {
        handle.place(0).unwrap();
    }
    for handle in &handles {
        assert_eq!(handle.wait(SETTLE), RequestStatus::Complete);
    }

    let log = venue.sent_log();
    assert_eq!(log.len(), 7);
    let burst = log[5].at.duration_since(log[0].at);
    let seventh = log[6].at.duration_since(log[0].at);
    assert!(burst < window, "first six should go out together, took {burst:?}");
    assert!(seventh >= Duration::from_millis(450), "seventh sent after {seventh:?}");
}

#[test]
fn other_instruments_are_not_delayed_by_a_full_instrument_window() {
    let venue = venue(Duration::from_millis(2));
    let policies = PolicyTable::default()
        .with(
            RestrictionClass::SameInstrumentHighFreq,
            RestrictionPolicy::window(1, Duration::from_secs(10)),
        );
    let gateway = gateway(&venue, policies, scheduler(Duration::from_secs(2), 3));

    let first = gateway.request(Instrument::stock("AAPL"), small_bars(0, 10)).unwrap();
    let other = gateway.request(Instrument::stock("IBM"), small_bars(0, 10)).unwrap();
    first.place(0).unwrap();
    other.place(0).unwrap();

    assert_eq!(first.wait(SETTLE), RequestStatus::Complete);
    assert_eq!(other.wait(Duration::from_secs(2)), RequestStatus::Complete);
}

#[test]
fn historical_ceiling_holds_back_a_second_category() {
    let latency = Duration::from_millis(300);
    let venue = venue(latency);
    let policies = PolicyTable::default()
        .with(RestrictionClass::SimultaneousHistorical, RestrictionPolicy::ceiling(1));
    let gateway = gateway(&venue, policies, scheduler(Duration::from_secs(3), 3));

    let large = RequestParams::Historical(HistoricalParams::new(at(0), Some(at(60)), BarSize::minutes(1)));
    let large = gateway.request(Instrument::stock("AAPL"), large).unwrap();
    let small = gateway.request(Instrument::stock("MSFT"), small_bars(0, 10)).unwrap();

    large.place(0).unwrap();
    assert!(wait_until(SETTLE, || large.status() == RequestStatus::Sent));
    small.place(0).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(small.status(), RequestStatus::Processing, "held at the ceiling");

    assert_eq!(large.wait(SETTLE), RequestStatus::Complete);
    assert_eq!(small.wait(SETTLE), RequestStatus::Complete);

    let log = venue.sent_log();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].instrument, large.instrument().key());
    let gap = log[1].at.duration_since(log[0].at);
    assert!(gap >= Duration::from_millis(250), "second historical request sent after {gap:?}");
}

#[test]
fn full_queue_holds_the_producer_until_the_worker_catches_up() {
    let venue = venue(Duration::from_millis(300));
    let mut config = scheduler(Duration::from_secs(3), 3);
    config.queue_capacity = Some(1);
    let gateway = gateway(&venue, PolicyTable::default(), config);

    let handles: Vec<_> = (0..3)
        .map(|_| Arc::new(gateway.request(Instrument::stock("AAPL"), fundamental()).unwrap()))
        .collect();

    handles[0].place(0).unwrap();
    assert!(wait_until(SETTLE, || handles[0].status() == RequestStatus::Sent));

    let started = Instant::now();
    handles[1].place(0).unwrap();
    assert!(started.elapsed() < Duration::from_millis(100), "room for one queued request");

    let third = Arc::clone(&handles[2]);
    let producer = std::thread::spawn(move || {
        let started = Instant::now();
        third.place(0).unwrap();
        started.elapsed()
    });
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(handles[2].status(), RequestStatus::New, "producer still waiting for room");

    let held = producer.join().unwrap();
    assert!(held >= Duration::from_millis(150), "producer held for {held:?}");
    for handle in &handles {
        assert_eq!(handle.wait(SETTLE), RequestStatus::Complete);
    }
}

// =============================================================================
// Recovery
// =============================================================================

#[test]
fn dropped_request_times_out_and_is_retried() {
    let venue = venue(Duration::from_millis(5));
    let gateway = gateway(&venue, PolicyTable::default(), scheduler(Duration::from_millis(150), 3));
    venue.drop_next(1);

    let handle = gateway.request(Instrument::stock("AAPL"), fundamental()).unwrap();
    handle.place(0).unwrap();

    assert_eq!(handle.wait(SETTLE), RequestStatus::Complete);
    assert_eq!(handle.leaves()[0].attempts(), 2);
    assert_eq!(venue.sent_log().len(), 2);
    assert_eq!(venue.cancelled().len(), 1, "timed-out attempt is cancelled at the venue");
}

#[test]
fn repeated_timeouts_recycle_the_session() {
    let venue = venue(Duration::from_millis(5));
    let mut config = scheduler(Duration::from_millis(100), 5);
    config.reconnect_threshold = 0;
    let gateway = gateway(&venue, PolicyTable::default(), config);
    venue.drop_next(1);

    let handle = gateway.request(Instrument::stock("AAPL"), fundamental()).unwrap();
    handle.place(0).unwrap();

    assert_eq!(handle.wait(SETTLE), RequestStatus::Complete);
    assert!(venue.connects() >= 2, "session should have reconnected");
    assert_eq!(gateway.stats().sessions.len(), 1);
}

#[test]
fn pacing_violation_requeues_the_request() {
    let venue = venue(Duration::from_millis(5));
    let gateway = gateway(&venue, PolicyTable::default(), scheduler(Duration::from_secs(2), 3));
    venue.pace_next(1);

    let handle = gateway.request(Instrument::stock("AAPL"), fundamental()).unwrap();
    handle.place(0).unwrap();

    assert_eq!(handle.wait(SETTLE), RequestStatus::Complete);
    assert_eq!(handle.leaves()[0].attempts(), 2);
}

#[test]
fn venue_rejection_fails_the_request() {
    let venue = venue(Duration::from_millis(5));
    let gateway = gateway(&venue, PolicyTable::default(), scheduler(Duration::from_secs(2), 3));
    venue.reject_next(200, "No security definition has been found");

    let handle = gateway.request(Instrument::stock("NOPE"), fundamental()).unwrap();
    handle.place(0).unwrap();

    assert_eq!(handle.wait(SETTLE), RequestStatus::Failed);
    let failure = handle.leaves()[0].failure().unwrap();
    assert_eq!(failure.code, Some(200));
}

#[test]
fn exhausted_attempts_fail_the_request() {
    let venue = venue(Duration::from_millis(5));
    let gateway = gateway(&venue, PolicyTable::default(), scheduler(Duration::from_millis(80), 2));
    venue.drop_next(5);

    let handle = gateway.request(Instrument::stock("AAPL"), fundamental()).unwrap();
    handle.place(0).unwrap();

    assert_eq!(handle.wait(SETTLE), RequestStatus::Failed);
    assert_eq!(venue.sent_log().len(), 2);
    let failure = handle.leaves()[0].failure().unwrap();
    assert_eq!(failure.code, None);
    assert!(failure.message.contains("2 attempts"));
}

#[test]
fn lost_connection_fails_streams_over_to_a_new_attempt() {
    let venue = venue(Duration::from_millis(5));
    let gateway = gateway(&venue, PolicyTable::default(), scheduler(Duration::from_secs(2), 5));

    let handle = gateway
        .request(
            Instrument::stock("AAPL"),
            RequestParams::StreamingBar(StreamingBarParams::default()),
        )
        .unwrap();
    handle.place(0).unwrap();
    assert!(wait_until(SETTLE, || handle.status() == RequestStatus::Sent));

    assert_eq!(venue.disconnect_all(), 1);

    let leaf = Arc::clone(&handle.leaves()[0]);
    assert!(wait_until(SETTLE, || {
        leaf.attempts() == 2 && leaf.status() == RequestStatus::Sent
    }));
    handle.cancel().unwrap();
    assert_eq!(handle.status(), RequestStatus::Cancelled);
}

// =============================================================================
// Sessions
// =============================================================================

#[test]
fn refused_client_ids_are_probed_past() {
    let venue = venue(Duration::from_millis(5));
    venue.refuse_client_id(1);
    venue.refuse_client_id(2);
    let gateway = gateway(&venue, PolicyTable::default(), scheduler(Duration::from_secs(2), 3));

    let handle = gateway.request(Instrument::stock("AAPL"), fundamental()).unwrap();
    handle.place(0).unwrap();

    assert_eq!(handle.wait(SETTLE), RequestStatus::Complete);
    assert_eq!(venue.sent_log()[0].client_id, 3);
    assert_eq!(venue.bound_client_ids(4002), vec![3]);
}

// =============================================================================
// Split Requests and Handles
// =============================================================================

#[test]
fn long_small_bar_range_is_split_and_merged() {
    let venue = venue(Duration::from_millis(5));
    let gateway = gateway(&venue, PolicyTable::default(), scheduler(Duration::from_secs(2), 3));

    let params = RequestParams::Historical(HistoricalParams::new(
        at(0),
        Some(at(60)),
        BarSize::seconds(5),
    ));
    let handle = gateway.request(Instrument::stock("AAPL"), params).unwrap();
    assert!(handle.is_split());
    assert_eq!(handle.leaves().len(), 2);

    handle.place(0).unwrap();
    assert_eq!(handle.wait(SETTLE), RequestStatus::Complete);

    let rows = handle.data();
    assert_eq!(rows.len(), 10);
    assert!(rows.windows(2).all(|w| w[0].timestamp() <= w[1].timestamp()));
}

#[test]
fn split_request_with_a_spent_leaf_places_nothing() {
    let venue = venue(Duration::from_millis(5));
    let gateway = gateway(&venue, PolicyTable::default(), scheduler(Duration::from_secs(2), 3));

    let params = RequestParams::Historical(HistoricalParams::new(
        at(0),
        Some(at(60)),
        BarSize::seconds(5),
    ));
    let handle = gateway.request(Instrument::stock("AAPL"), params).unwrap();
    let leaves = handle.leaves();
    assert_eq!(leaves.len(), 2);
    leaves[1].cancel(gateway.restrictions()).unwrap();

    assert!(handle.place(0).is_err());
    assert_eq!(leaves[0].status(), RequestStatus::New);
    std::thread::sleep(Duration::from_millis(100));
    assert!(venue.sent_log().is_empty());

    handle.reset().unwrap();
    handle.place(0).unwrap();
    assert_eq!(handle.wait(SETTLE), RequestStatus::Complete);
    assert_eq!(venue.sent_log().len(), 2);
}

#[test]
fn cancelling_a_split_request_cancels_every_leaf() {
    let venue = venue(Duration::from_secs(3));
    let gateway = gateway(&venue, PolicyTable::default(), scheduler(Duration::from_secs(10), 3));

    let params = RequestParams::Historical(HistoricalParams::new(
        at(0),
        Some(at(120)),
        BarSize::seconds(5),
    ));
    let handle = gateway.request(Instrument::stock("AAPL"), params).unwrap();
    assert_eq!(handle.leaves().len(), 4);
    handle.place(0).unwrap();
    assert!(wait_until(SETTLE, || {
        handle.leaves().iter().any(|leaf| leaf.status() == RequestStatus::Sent)
    }));

    handle.cancel().unwrap();

    assert_eq!(handle.status(), RequestStatus::Cancelled);
    assert!(!handle.is_active());
    assert!(
        handle
            .leaves()
            .iter()
            .all(|leaf| leaf.status() == RequestStatus::Cancelled)
    );
    assert!(!venue.cancelled().is_empty());
}

#[test]
fn reset_allows_a_completed_request_to_run_again() {
    let venue = venue(Duration::from_millis(5));
    let gateway = gateway(&venue, PolicyTable::default(), scheduler(Duration::from_secs(2), 3));

    let handle = gateway.request(Instrument::stock("AAPL"), fundamental()).unwrap();
    handle.place(0).unwrap();
    assert_eq!(handle.wait(SETTLE), RequestStatus::Complete);

    handle.reset().unwrap();
    assert_eq!(handle.status(), RequestStatus::New);
    assert!(handle.data().is_empty());

    handle.place(0).unwrap();
    assert_eq!(handle.wait(SETTLE), RequestStatus::Complete);
    let log = venue.sent_log();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].client_id, log[1].client_id);
    assert_ne!(log[0].request_id, log[1].request_id, "a rerun gets a fresh venue request id");
}

#[test]
fn placing_twice_is_rejected() {
    let venue = venue(Duration::from_millis(500));
    let gateway = gateway(&venue, PolicyTable::default(), scheduler(Duration::from_secs(2), 3));

    let handle = gateway.request(Instrument::stock("AAPL"), fundamental()).unwrap();
    handle.place(0).unwrap();
    assert!(handle.place(0).is_err());
    assert!(handle.reset().is_err(), "active requests cannot be reset");
    handle.cancel().unwrap();
}

#[test]
fn shut_down_gateway_refuses_new_work() {
    let venue = venue(Duration::from_millis(5));
    let gateway = gateway(&venue, PolicyTable::default(), scheduler(Duration::from_secs(2), 3));
    let handle = gateway.request(Instrument::stock("AAPL"), fundamental()).unwrap();

    gateway.shutdown();

    assert!(!gateway.is_running());
    assert!(handle.place(0).is_err());
}
