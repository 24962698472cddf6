//! Request Gateway
//!
//! Entry point for callers. The gateway owns the restriction manager, the
//! session pool, the range splitter and one scheduler per category, and
//! turns `(instrument, params)` into `RequestHandle`s that can be placed,
//! cancelled, reset and read.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use super::scheduler::{Scheduler, SchedulerCategory, SchedulerConfig, SchedulerStats};
use super::session::{SessionInfo, SharedFailover};
use super::session_pool::{SessionPool, SessionPoolConfig};
use crate::application::ports::VenueConnector;
use crate::domain::request::{
    DataRequest, Instrument, LifecycleError, Priority, RequestId, RequestKind, RequestParams,
    RequestStatus, RequestSummary, Row, SessionBinding, ValidationError,
};
use crate::domain::restriction::{ClassUsage, PolicyTable, RestrictionManager};
use crate::domain::splitter::{MultiRequest, RangeSplitter, SplitError, SplitPlan};

/// Gateway failure visible to callers.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Parameters failed structural validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The operation is not valid in the request's current status.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    /// The historical range could not be split.
    #[error(transparent)]
    Split(#[from] SplitError),
    /// A scheduler worker could not be started.
    #[error("failed to start scheduler worker: {0}")]
    Spawn(#[from] std::io::Error),
    /// The gateway has been shut down.
    #[error("gateway is shut down")]
    ShutDown,
}

/// Everything needed to build a gateway.
#[derive(Debug, Clone, Default)]
pub struct GatewayOptions {
    /// Restriction policies.
    pub policies: PolicyTable,
    /// Historical range splitter.
    pub splitter: RangeSplitter,
    /// Worker settings, shared by every category.
    pub scheduler: SchedulerConfig,
    /// Session pool settings.
    pub sessions: SessionPoolConfig,
}

/// Gateway-wide counters.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    /// Per-category queues.
    pub schedulers: Vec<SchedulerStats>,
    /// Per-class accounting.
    pub restrictions: Vec<ClassUsage>,
    /// Pooled sessions.
    pub sessions: Vec<SessionInfo>,
}

// =============================================================================
// Dispatcher
// =============================================================================

struct Dispatcher {
    restrictions: Arc<RestrictionManager>,
    pool: Arc<SessionPool>,
    splitter: RangeSplitter,
    schedulers: HashMap<SchedulerCategory, Scheduler>,
    poll: Duration,
    closed: AtomicBool,
}

impl Dispatcher {
    fn scheduler(&self, request: &DataRequest) -> Result<&Scheduler, GatewayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::ShutDown);
        }
        self.schedulers
            .get(&SchedulerCategory::for_params(request.params()))
            .ok_or(GatewayError::ShutDown)
    }

    fn submit(&self, request: &Arc<DataRequest>, priority: Priority) -> Result<(), GatewayError> {
        self.scheduler(request)?
            .submit(Arc::clone(request), priority)?;
        Ok(())
    }

    fn resubmit(&self, request: Arc<DataRequest>) {
        match self.scheduler(&request) {
            Ok(scheduler) => scheduler.retry_timed_out(request),
            Err(err) => tracing::debug!(request_id = %request.id(), error = %err, "Failover dropped"),
        }
    }

    fn cancel_at_venue(&self, request: &DataRequest, binding: SessionBinding) {
        if let Some(session) = self.pool.session_for(&binding) {
            session.cancel(binding.request_id, request);
        }
    }

    fn build(&self, instrument: &Instrument, params: &RequestParams) -> Result<Target, GatewayError> {
        let RequestParams::Historical(historical) = params else {
            return Ok(Target::Single(Arc::new(DataRequest::new(
                instrument.clone(),
                params.clone(),
            ))));
        };
        Ok(match self.splitter.split(historical, Utc::now())? {
            SplitPlan::Single(p) => Target::Single(Arc::new(DataRequest::new(
                instrument.clone(),
                RequestParams::Historical(p),
            ))),
            SplitPlan::Multi(parts) => {
                Target::Split(MultiRequest::new(instrument, historical.clone(), parts))
            }
        })
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for scheduler in self.schedulers.values() {
            scheduler.shutdown();
        }
        self.pool.shutdown();
        tracing::info!("Gateway shut down");
    }
}

// =============================================================================
// Gateway
// =============================================================================

/// Admission-controlled access to the venue.
pub struct Gateway {
    dispatcher: Arc<Dispatcher>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("schedulers", &self.dispatcher.schedulers.len())
            .field("closed", &self.dispatcher.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Start one worker per category on top of `connector`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Spawn`] if a worker thread cannot start.
    pub fn new(options: GatewayOptions, connector: Arc<dyn VenueConnector>) -> Result<Self, GatewayError> {
        let restrictions = Arc::new(RestrictionManager::new(&options.policies));
        let failover = SharedFailover::default();
        let pool = Arc::new(SessionPool::new(
            options.sessions,
            connector,
            Arc::clone(&restrictions),
            Arc::clone(&failover),
        ));

        let mut schedulers = HashMap::new();
        for category in SchedulerCategory::ALL {
            let scheduler = Scheduler::spawn(
                category,
                options.scheduler.clone(),
                Arc::clone(&restrictions),
                Arc::clone(&pool),
            )?;
            schedulers.insert(category, scheduler);
        }

        let dispatcher = Arc::new(Dispatcher {
            restrictions,
            pool,
            splitter: options.splitter,
            schedulers,
            poll: options.scheduler.completion_poll,
            closed: AtomicBool::new(false),
        });

        let weak: Weak<Dispatcher> = Arc::downgrade(&dispatcher);
        let installed = failover.set(Box::new(move |request| {
            if let Some(dispatcher) = weak.upgrade() {
                dispatcher.resubmit(request);
            }
        }));
        if installed.is_err() {
            tracing::warn!("Failover hook already installed");
        }

        tracing::info!(categories = SchedulerCategory::ALL.len(), "Gateway started");
        Ok(Self { dispatcher })
    }

    /// Build a handle for `params` on `instrument`. Historical ranges that
    /// exceed the venue's window are split into leaves.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Validation`] for structurally invalid
    /// parameters and [`GatewayError::Split`] for empty ranges.
    pub fn request(&self, instrument: Instrument, params: RequestParams) -> Result<RequestHandle, GatewayError> {
        params.validate()?;
        let target = self.dispatcher.build(&instrument, &params)?;
        Ok(RequestHandle {
            id: target.id(),
            instrument,
            params,
            dispatcher: Arc::clone(&self.dispatcher),
            target: RwLock::new(target),
        })
    }

    /// Shared restriction manager.
    #[must_use]
    pub fn restrictions(&self) -> &RestrictionManager {
        &self.dispatcher.restrictions
    }

    /// Queue, accounting and session counters.
    #[must_use]
    pub fn stats(&self) -> GatewayStats {
        let mut schedulers: Vec<SchedulerStats> = self
            .dispatcher
            .schedulers
            .values()
            .map(Scheduler::stats)
            .collect();
        schedulers.sort_by_key(|s| s.category);
        GatewayStats {
            schedulers,
            restrictions: self.dispatcher.restrictions.usage(),
            sessions: self.dispatcher.pool.sessions(),
        }
    }

    /// Whether the gateway still accepts requests.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.dispatcher.closed.load(Ordering::SeqCst)
    }

    /// Stop every worker and disconnect every session.
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.dispatcher.shutdown();
    }
}

// =============================================================================
// Request Handle
// =============================================================================

enum Target {
    Single(Arc<DataRequest>),
    Split(MultiRequest),
}

impl Target {
    fn id(&self) -> RequestId {
        match self {
            Self::Single(request) => request.id(),
            Self::Split(multi) => multi.id(),
        }
    }

    fn leaves(&self) -> Vec<Arc<DataRequest>> {
        match self {
            Self::Single(request) => vec![Arc::clone(request)],
            Self::Split(multi) => multi.leaves().to_vec(),
        }
    }
}

/// Point-in-time view of a handle.
#[derive(Debug, Clone, Serialize)]
pub struct HandleSummary {
    /// Handle id.
    pub id: RequestId,
    /// Request kind.
    pub kind: RequestKind,
    /// Instrument key.
    pub instrument: String,
    /// Aggregate status.
    pub status: RequestStatus,
    /// Whether the handle was split.
    pub split: bool,
    /// Per-leaf details.
    pub leaves: Vec<RequestSummary>,
}

/// Caller-facing handle over a single request or a split multi-request.
pub struct RequestHandle {
    id: RequestId,
    instrument: Instrument,
    params: RequestParams,
    dispatcher: Arc<Dispatcher>,
    target: RwLock<Target>,
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.id)
            .field("kind", &self.params.kind())
            .field("instrument", &self.instrument.key())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl RequestHandle {
    /// Stable handle id.
    #[must_use]
    pub const fn id(&self) -> RequestId {
        self.id
    }

    /// Target instrument.
    #[must_use]
    pub const fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    /// Unsplit parameters.
    #[must_use]
    pub const fn params(&self) -> &RequestParams {
        &self.params
    }

    /// Queue the request (every leaf, if split) at `priority`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Validation`] for invalid parameters and
    /// [`GatewayError::Lifecycle`] if a request is not `NEW`. Placement is
    /// all or nothing: on error no leaf is left queued.
    pub fn place(&self, priority: Priority) -> Result<(), GatewayError> {
        self.params.validate()?;
        let leaves = self.target.read().leaves();
        if let Some(leaf) = leaves.iter().find(|leaf| leaf.status() != RequestStatus::New) {
            return Err(LifecycleError::InvalidTransition {
                from: leaf.status(),
                to: RequestStatus::Queued,
            }
            .into());
        }
        for (placed, leaf) in leaves.iter().enumerate() {
            if let Err(err) = self.dispatcher.submit(leaf, priority) {
                tracing::warn!(handle_id = %self.id, placed, error = %err, "Placement failed, withdrawing queued leaves");
                self.withdraw(&leaves[..placed]);
                return Err(err);
            }
        }
        tracing::debug!(handle_id = %self.id, priority, kind = self.params.kind().as_str(), "Placed");
        Ok(())
    }

    fn withdraw(&self, leaves: &[Arc<DataRequest>]) {
        for leaf in leaves {
            match leaf.cancel(&self.dispatcher.restrictions) {
                Ok(Some(binding)) => self.dispatcher.cancel_at_venue(leaf, binding),
                Ok(None) => {}
                Err(err) => tracing::warn!(request_id = %leaf.id(), error = %err, "Could not withdraw leaf"),
            }
        }
    }

    /// Cancel the request, or every active leaf if split.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Lifecycle`] on an inconsistent status log.
    pub fn cancel(&self) -> Result<(), GatewayError> {
        let target = self.target.read();
        match &*target {
            Target::Single(request) => {
                if let Some(binding) = request.cancel(&self.dispatcher.restrictions)? {
                    self.dispatcher.cancel_at_venue(request, binding);
                }
            }
            Target::Split(multi) => {
                for (leaf, binding) in multi.cancel(&self.dispatcher.restrictions)? {
                    self.dispatcher.cancel_at_venue(&leaf, binding);
                }
            }
        }
        tracing::debug!(handle_id = %self.id, "Cancelled");
        Ok(())
    }

    /// Return to `NEW`. Open-ended historical ranges are re-split against
    /// the current time.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Lifecycle`] while any part is active.
    pub fn reset(&self) -> Result<(), GatewayError> {
        let mut target = self.target.write();
        let leaves = target.leaves();
        if let Some(active) = leaves.iter().find(|leaf| !leaf.status().is_resettable()) {
            return Err(LifecycleError::NotResettable(active.status()).into());
        }

        let open_ended = matches!(&self.params, RequestParams::Historical(p) if p.end.is_none() && !p.keep_up_to_date);
        if open_ended {
            *target = self.dispatcher.build(&self.instrument, &self.params)?;
        } else {
            for leaf in &leaves {
                leaf.reset()?;
            }
        }
        tracing::debug!(handle_id = %self.id, resplit = open_ended, "Reset");
        Ok(())
    }

    /// Result rows; merged across leaves when split.
    #[must_use]
    pub fn data(&self) -> Vec<Row> {
        match &*self.target.read() {
            Target::Single(request) => request.data(),
            Target::Split(multi) => multi.data(),
        }
    }

    /// Current (aggregate) status.
    #[must_use]
    pub fn status(&self) -> RequestStatus {
        match &*self.target.read() {
            Target::Single(request) => request.status(),
            Target::Split(multi) => multi.status(),
        }
    }

    /// Whether any part is queued, processing or sent.
    #[must_use]
    pub fn is_active(&self) -> bool {
        match &*self.target.read() {
            Target::Single(request) => request.is_active(),
            Target::Split(multi) => multi.is_active(),
        }
    }

    /// Poll until inactive or `timeout` elapses; returns the final status.
    #[must_use]
    pub fn wait(&self, timeout: Duration) -> RequestStatus {
        let deadline = Instant::now() + timeout;
        while self.is_active() && Instant::now() < deadline {
            std::thread::sleep(self.dispatcher.poll);
        }
        self.status()
    }

    /// Underlying requests (one unless split).
    #[must_use]
    pub fn leaves(&self) -> Vec<Arc<DataRequest>> {
        self.target.read().leaves()
    }

    /// Whether the handle was split into several leaves.
    #[must_use]
    pub fn is_split(&self) -> bool {
        matches!(&*self.target.read(), Target::Split(_))
    }

    /// Point-in-time view.
    #[must_use]
    pub fn summary(&self) -> HandleSummary {
        HandleSummary {
            id: self.id,
            kind: self.params.kind(),
            instrument: self.instrument.key(),
            status: self.status(),
            split: self.is_split(),
            leaves: self.leaves().iter().map(|leaf| leaf.summary()).collect(),
        }
    }
}
