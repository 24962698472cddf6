//! Per-Category Schedulers
//!
//! Each request category owns one priority queue and one worker thread.
//! The worker pops the most urgent request, waits for every restriction
//! class to admit it, sends it through a pooled session and, for bounded
//! requests, waits for the terminal callback. Timeouts are reset and
//! requeued at their original place in the queue; repeated timeouts
//! recycle the session.
//!
//! A single consumer per category keeps FIFO order within a priority and
//! keeps requests of the same category from racing each other through
//! admission.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicBool, AtomicU32, AtomicU64};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use super::session::{Session, SessionRole};
use super::session_pool::SessionPool;
use crate::domain::request::{
    DataRequest, LifecycleError, Priority, RequestFailure, RequestParams, RequestStatus,
};
use crate::domain::restriction::RestrictionManager;
use crate::infrastructure::metrics;

// =============================================================================
// Categories
// =============================================================================

/// Request category; one scheduler and worker each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerCategory {
    /// Historical bars of 30 seconds or less, and historical ticks.
    HistoricalSmallBar,
    /// Larger historical bars and head timestamps.
    HistoricalLargeBar,
    /// Snapshots, streaming bars and keep-up-to-date historical bars.
    Streams,
    /// Tick-by-tick streams.
    TickStreams,
    /// Scanner subscriptions.
    Scanners,
    /// Everything else (fundamentals).
    Generic,
}

impl SchedulerCategory {
    /// Every category.
    pub const ALL: [Self; 6] = [
        Self::HistoricalSmallBar,
        Self::HistoricalLargeBar,
        Self::Streams,
        Self::TickStreams,
        Self::Scanners,
        Self::Generic,
    ];

    /// Label for logs, metrics and thread names.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::HistoricalSmallBar => "historical_small_bar",
            Self::HistoricalLargeBar => "historical_large_bar",
            Self::Streams => "streams",
            Self::TickStreams => "tick_streams",
            Self::Scanners => "scanners",
            Self::Generic => "generic",
        }
    }

    /// Session role serving this category.
    #[must_use]
    pub const fn role(&self) -> SessionRole {
        match self {
            Self::HistoricalSmallBar | Self::HistoricalLargeBar => SessionRole::Historical,
            Self::Streams | Self::TickStreams => SessionRole::MarketData,
            Self::Scanners | Self::Generic => SessionRole::Reference,
        }
    }

    /// Category a request with these parameters is queued in.
    #[must_use]
    pub fn for_params(params: &RequestParams) -> Self {
        match params {
            RequestParams::Historical(p) if p.keep_up_to_date => Self::Streams,
            RequestParams::Historical(_) | RequestParams::HistoricalTick(_) => {
                if params.is_small_bar() {
                    Self::HistoricalSmallBar
                } else {
                    Self::HistoricalLargeBar
                }
            }
            RequestParams::HeadTimestamp(_) => Self::HistoricalLargeBar,
            RequestParams::Snapshot(_) | RequestParams::StreamingBar(_) => Self::Streams,
            RequestParams::StreamingTick(_) => Self::TickStreams,
            RequestParams::Scanner(_) => Self::Scanners,
            RequestParams::Fundamental(_) => Self::Generic,
        }
    }
}

impl fmt::Display for SchedulerCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Worker timing and retry settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Poll interval while a concurrency ceiling is full, and the slice
    /// length of every interruptible sleep.
    pub ceiling_poll: Duration,
    /// Poll interval while awaiting a bounded request's terminal callback.
    pub completion_poll: Duration,
    /// Per-attempt wait for a terminal callback.
    pub request_timeout: Duration,
    /// Consecutive timeouts tolerated before the session is recycled.
    pub reconnect_threshold: u32,
    /// Sends per request before a further timeout fails it (0 = unlimited).
    pub max_attempts: u32,
    /// Queue length at which producers wait (None = unbounded).
    pub queue_capacity: Option<usize>,
    /// How long an idle worker waits before re-checking for shutdown.
    pub queue_wait_slice: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            ceiling_poll: Duration::from_millis(150),
            completion_poll: Duration::from_millis(50),
            request_timeout: Duration::from_secs(30),
            reconnect_threshold: 3,
            max_attempts: 10,
            queue_capacity: None,
            queue_wait_slice: Duration::from_millis(250),
        }
    }
}

// =============================================================================
// Queue
// =============================================================================

/// A queued request, ordered by priority then sequence.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Lower is more urgent.
    pub priority: Priority,
    /// Placement order, for FIFO within a priority.
    pub sequence: u64,
    /// The queued request.
    pub request: Arc<DataRequest>,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.priority, self.sequence).cmp(&(other.priority, other.sequence))
    }
}

/// Scheduler counters.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    /// Category.
    pub category: SchedulerCategory,
    /// Entries waiting in the queue.
    pub queued: usize,
    /// Current consecutive-timeout count.
    pub consecutive_timeouts: u32,
}

// =============================================================================
// Scheduler
// =============================================================================

struct Shared {
    category: SchedulerCategory,
    config: SchedulerConfig,
    restrictions: Arc<RestrictionManager>,
    pool: Arc<SessionPool>,
    queue: Mutex<BinaryHeap<Reverse<QueueEntry>>>,
    available: Condvar,
    sequence: AtomicU64,
    consecutive_timeouts: AtomicU32,
    shutdown: AtomicBool,
}

/// One priority queue and its dedicated worker.
pub struct Scheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("category", &self.shared.category)
            .field("queued", &self.shared.queue.lock().len())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Start the worker thread for `category`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the thread cannot be spawned.
    pub fn spawn(
        category: SchedulerCategory,
        config: SchedulerConfig,
        restrictions: Arc<RestrictionManager>,
        pool: Arc<SessionPool>,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            category,
            config,
            restrictions,
            pool,
            queue: Mutex::new(BinaryHeap::new()),
            available: Condvar::new(),
            sequence: AtomicU64::new(0),
            consecutive_timeouts: AtomicU32::new(0),
            shutdown: AtomicBool::new(false),
        });
        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(format!("sched-{}", category.as_str()))
            .spawn(move || worker_shared.run())?;
        tracing::debug!(category = %category, "Scheduler worker started");
        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Category served.
    #[must_use]
    pub fn category(&self) -> SchedulerCategory {
        self.shared.category
    }

    /// Queue `request` at `priority`. Blocks while the queue is at capacity.
    ///
    /// # Errors
    ///
    /// Returns a [`LifecycleError`] if the request cannot enter `QUEUED`.
    pub fn submit(&self, request: Arc<DataRequest>, priority: Priority) -> Result<(), LifecycleError> {
        self.shared.wait_for_room(&request);
        let sequence = self.shared.sequence.fetch_add(1, atomic::Ordering::SeqCst);
        request.set_placement(priority, sequence);
        self.shared.enqueue(request, priority, sequence)?;
        metrics::record_request_placed(self.shared.category.as_str());
        Ok(())
    }

    /// Reset a timed-out request and requeue it at its original place, or
    /// fail it once its attempts are exhausted.
    pub fn retry_timed_out(&self, request: Arc<DataRequest>) {
        self.shared.retry_timed_out(request);
    }

    /// Queue length and timeout counter.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            category: self.shared.category,
            queued: self.shared.queue.lock().len(),
            consecutive_timeouts: self
                .shared
                .consecutive_timeouts
                .load(atomic::Ordering::SeqCst),
        }
    }

    /// Stop the worker and wait for it to exit.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, atomic::Ordering::SeqCst);
        self.shared.available.notify_all();
        if let Some(handle) = self.worker.lock().take()
            && handle.join().is_err()
        {
            tracing::error!(category = %self.shared.category, "Scheduler worker panicked");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(atomic::Ordering::SeqCst)
    }

    fn wait_for_room(&self, request: &DataRequest) {
        let Some(capacity) = self.config.queue_capacity else {
            return;
        };
        while self.queue.lock().len() >= capacity
            && !self.is_shutdown()
            && request.status() != RequestStatus::Cancelled
        {
            std::thread::sleep(self.config.ceiling_poll);
        }
    }

    fn enqueue(
        &self,
        request: Arc<DataRequest>,
        priority: Priority,
        sequence: u64,
    ) -> Result<(), LifecycleError> {
        request.transition(RequestStatus::Queued, &self.restrictions)?;
        let depth = {
            let mut queue = self.queue.lock();
            queue.push(Reverse(QueueEntry {
                priority,
                sequence,
                request,
            }));
            queue.len()
        };
        metrics::set_queue_depth(self.category.as_str(), depth);
        self.available.notify_one();
        Ok(())
    }

    fn next_entry(&self) -> Option<QueueEntry> {
        let mut queue = self.queue.lock();
        loop {
            if self.is_shutdown() {
                return None;
            }
            if let Some(Reverse(entry)) = queue.pop() {
                metrics::set_queue_depth(self.category.as_str(), queue.len());
                return Some(entry);
            }
            self.available
                .wait_for(&mut queue, self.config.queue_wait_slice);
        }
    }

    fn run(&self) {
        while let Some(entry) = self.next_entry() {
            self.process(&entry.request);
        }
        tracing::debug!(category = %self.category, "Scheduler worker stopped");
    }

    fn process(&self, request: &Arc<DataRequest>) {
        if request.status() != RequestStatus::Queued {
            return;
        }
        if let Err(invalid) = request.validate() {
            tracing::warn!(request_id = %request.id(), error = %invalid, "Rejecting invalid request");
            self.finish_failed(request, RequestFailure::local(invalid.to_string()));
            return;
        }
        if request
            .transition(RequestStatus::Processing, &self.restrictions)
            .is_err()
        {
            return;
        }
        if !self.await_admission(request) {
            return;
        }

        let session = match self.pool.get_session(self.category.role()) {
            Ok(session) => session,
            Err(err) => {
                tracing::warn!(request_id = %request.id(), category = %self.category, error = %err, "No session available");
                if request
                    .transition(RequestStatus::TimedOut, &self.restrictions)
                    .is_ok()
                {
                    self.on_timeout(request, None);
                }
                return;
            }
        };

        let id = session.next_request_id();
        if let Err(err) = request.bind(session.binding(id)) {
            tracing::error!(request_id = %request.id(), error = %err, "Request already bound");
            self.finish_failed(request, RequestFailure::local(err.to_string()));
            return;
        }
        session.track(id, Arc::clone(request));
        if request
            .transition(RequestStatus::Sent, &self.restrictions)
            .is_err()
        {
            session.untrack(id);
            return;
        }
        metrics::record_request_sent(self.category.as_str());
        tracing::debug!(
            request_id = %request.id(),
            category = %self.category,
            client_id = session.client_id(),
            venue_request_id = id,
            "Request sent"
        );

        if let Err(err) = session.send(id, request) {
            tracing::warn!(request_id = %request.id(), error = %err, "Send failed");
            session.untrack(id);
            match request.transition(RequestStatus::TimedOut, &self.restrictions) {
                Ok(()) => self.on_timeout(request, Some(&session)),
                // The session timed it out on connection loss; unbounded
                // requests are already with the failover hook.
                Err(_) if request.status() == RequestStatus::TimedOut && request.params().is_bounded() => {
                    self.on_timeout(request, Some(&session));
                }
                Err(lifecycle) => tracing::debug!(
                    request_id = %request.id(),
                    status = %request.status(),
                    error = %lifecycle,
                    "Request left SENT before the send failure was handled"
                ),
            }
            return;
        }

        // A cancel landing between SENT and the write reached the venue
        // before the request did.
        if request.status() == RequestStatus::Cancelled {
            tracing::debug!(request_id = %request.id(), venue_request_id = id, "Cancelled while sending");
            session.cancel(id, request);
            return;
        }

        if request.params().is_bounded() {
            self.await_completion(request, &session, id);
        }
    }

    /// Loop until every class admits `request`. Returns false if the
    /// request left `PROCESSING` or the scheduler is shutting down.
    fn await_admission(&self, request: &DataRequest) -> bool {
        loop {
            if request.status() != RequestStatus::Processing || self.is_shutdown() {
                return false;
            }
            let report = self.restrictions.check(request);
            if report.is_satisfied() {
                return true;
            }

            let paced = report.longest_delay().unwrap_or(Duration::ZERO);
            let wait = if report.is_blocked() {
                paced.max(self.config.ceiling_poll)
            } else {
                paced
            };
            for (class, _) in report.unsatisfied() {
                metrics::record_admission_wait(class.as_str(), wait);
            }
            tracing::debug!(
                request_id = %request.id(),
                category = %self.category,
                blocked = report.is_blocked(),
                wait_ms = wait.as_millis(),
                "Awaiting admission"
            );
            self.sleep_while(wait, || request.status() == RequestStatus::Processing);
        }
    }

    fn await_completion(&self, request: &Arc<DataRequest>, session: &Arc<Session>, id: i64) {
        let deadline = Instant::now().checked_add(self.config.request_timeout);
        while request.status() == RequestStatus::Sent
            && deadline.is_none_or(|d| Instant::now() < d)
            && !self.is_shutdown()
        {
            std::thread::sleep(self.config.completion_poll);
        }

        match request.status() {
            RequestStatus::Sent if self.is_shutdown() => {}
            RequestStatus::Sent => {
                tracing::warn!(
                    request_id = %request.id(),
                    category = %self.category,
                    timeout_ms = self.config.request_timeout.as_millis(),
                    "No terminal callback before deadline"
                );
                session.cancel(id, request);
                if request
                    .transition(RequestStatus::TimedOut, &self.restrictions)
                    .is_ok()
                {
                    self.on_timeout(request, Some(session));
                }
            }
            RequestStatus::TimedOut => self.on_timeout(request, Some(session)),
            status => {
                if status == RequestStatus::Complete {
                    self.consecutive_timeouts.store(0, atomic::Ordering::SeqCst);
                }
                metrics::record_request_finished(self.category.as_str(), status.as_str());
            }
        }
    }

    fn on_timeout(&self, request: &Arc<DataRequest>, session: Option<&Arc<Session>>) {
        metrics::record_venue_timeout(self.category.as_str());
        let count = self
            .consecutive_timeouts
            .fetch_add(1, atomic::Ordering::SeqCst)
            + 1;
        if count > self.config.reconnect_threshold {
            self.consecutive_timeouts.store(0, atomic::Ordering::SeqCst);
            if let Some(session) = session
                && let Err(err) = self.pool.recycle(session)
            {
                tracing::error!(category = %self.category, error = %err, "Session recycle failed");
            }
        }
        self.retry_timed_out(Arc::clone(request));
    }

    fn retry_timed_out(&self, request: Arc<DataRequest>) {
        if request.status() != RequestStatus::TimedOut {
            return;
        }
        let attempts = request.attempts();
        if self.config.max_attempts > 0 && attempts >= self.config.max_attempts {
            tracing::warn!(request_id = %request.id(), attempts, "Retry limit reached");
            self.finish_failed(
                &request,
                RequestFailure::local(format!("timed out after {attempts} attempts")),
            );
            return;
        }
        if request.retry_reset().is_err() {
            return;
        }
        let (priority, sequence) = request.placement().unwrap_or_else(|| {
            (
                Priority::default(),
                self.sequence.fetch_add(1, atomic::Ordering::SeqCst),
            )
        });
        tracing::info!(request_id = %request.id(), attempts, priority, "Requeueing timed-out request");
        if let Err(err) = self.enqueue(request, priority, sequence) {
            tracing::warn!(error = %err, "Requeue failed");
        }
    }

    fn finish_failed(&self, request: &DataRequest, failure: RequestFailure) {
        match request.fail(failure, &self.restrictions) {
            Ok(()) => metrics::record_request_finished(self.category.as_str(), RequestStatus::Failed.as_str()),
            Err(err) => tracing::debug!(request_id = %request.id(), error = %err, "Could not mark request failed"),
        }
    }

    /// Sleep up to `total` in slices of the ceiling poll interval, waking
    /// early on shutdown or once `keep_waiting` turns false. A `total` past
    /// the clock's range has no deadline.
    fn sleep_while(&self, total: Duration, keep_waiting: impl Fn() -> bool) {
        let deadline = Instant::now().checked_add(total);
        loop {
            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) || self.is_shutdown() || !keep_waiting() {
                return;
            }
            let left = deadline.map_or(total, |d| d - now);
            std::thread::sleep(left.min(self.config.ceiling_poll));
        }
    }
}
