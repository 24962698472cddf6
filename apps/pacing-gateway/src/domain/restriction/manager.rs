//! Restriction Manager
//!
//! Tracks and enforces every restriction class. Each class has its own
//! ledger behind its own mutex, so unrelated classes never contend. A
//! request declaring several classes is checked and registered class by
//! class; admission across classes is not atomic, and slight
//! over-admission under contention is tolerated.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use super::container::AccountingContainer;
use super::policy::{Keying, PolicyTable, RestrictionClass, RestrictionPolicy};
use crate::domain::request::DataRequest;

const GLOBAL_KEY: &str = "*";

// =============================================================================
// Admission
// =============================================================================

/// Outcome of checking one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Room available.
    Granted,
    /// A concurrency ceiling is full; retry after a poll interval.
    Blocked,
    /// A window is full; retry after exactly this delay.
    Paced(Duration),
}

impl Admission {
    /// Whether the class admits the request now.
    #[must_use]
    pub const fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// Per-class admission decisions for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdmissionReport {
    decisions: Vec<(RestrictionClass, Admission)>,
}

impl AdmissionReport {
    /// Every declared class admits the request.
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        self.decisions.iter().all(|(_, a)| a.is_granted())
    }

    /// `{class: satisfied}` for every declared class.
    #[must_use]
    pub fn satisfied(&self) -> BTreeMap<RestrictionClass, bool> {
        self.decisions
            .iter()
            .map(|(class, a)| (*class, a.is_granted()))
            .collect()
    }

    /// Any ceiling class is full.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.decisions
            .iter()
            .any(|(_, a)| matches!(a, Admission::Blocked))
    }

    /// Longest exact wait among windowed classes that are full.
    #[must_use]
    pub fn longest_delay(&self) -> Option<Duration> {
        self.decisions
            .iter()
            .filter_map(|(_, a)| match a {
                Admission::Paced(delay) => Some(*delay),
                _ => None,
            })
            .max()
    }

    /// Classes that currently deny the request.
    pub fn unsatisfied(&self) -> impl Iterator<Item = (RestrictionClass, Admission)> + '_ {
        self.decisions
            .iter()
            .filter(|(_, a)| !a.is_granted())
            .copied()
    }

    /// Decision for one class.
    #[must_use]
    pub fn decision(&self, class: RestrictionClass) -> Option<Admission> {
        self.decisions
            .iter()
            .find(|(c, _)| *c == class)
            .map(|(_, a)| *a)
    }
}

// =============================================================================
// Usage Snapshot
// =============================================================================

/// Accounted entries for one key of a class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyUsage {
    /// Container key (`*` for unkeyed classes).
    pub key: String,
    /// Accounted entries.
    pub count: usize,
}

/// Usage of one restriction class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassUsage {
    /// Restriction class.
    pub class: RestrictionClass,
    /// Policy in `N` or `N/SECS` form.
    pub policy: String,
    /// Entry capacity per key.
    pub capacity: usize,
    /// Non-empty keys.
    pub keys: Vec<KeyUsage>,
}

// =============================================================================
// Restriction Manager
// =============================================================================

#[derive(Debug)]
struct ClassLedger {
    policy: RestrictionPolicy,
    containers: HashMap<String, AccountingContainer>,
}

impl ClassLedger {
    fn new(policy: RestrictionPolicy) -> Self {
        Self {
            policy,
            containers: HashMap::new(),
        }
    }

    fn check(&mut self, key: &str, now: Instant) -> Admission {
        let policy = self.policy;
        match self.containers.get_mut(key) {
            Some(container) => {
                container.purge(&policy, now);
                let admission = container.admission(&policy, now);
                if container.is_empty() {
                    self.containers.remove(key);
                }
                admission
            }
            None => AccountingContainer::for_policy(&policy).admission(&policy, now),
        }
    }
}

/// Enforces rate and concurrency policies for all restriction classes.
#[derive(Debug)]
pub struct RestrictionManager {
    ledgers: HashMap<RestrictionClass, Mutex<ClassLedger>>,
}

impl Default for RestrictionManager {
    fn default() -> Self {
        Self::new(&PolicyTable::default())
    }
}

impl RestrictionManager {
    /// Create a manager enforcing `table`.
    #[must_use]
    pub fn new(table: &PolicyTable) -> Self {
        let ledgers = table
            .entries()
            .into_iter()
            .map(|(class, policy)| (class, Mutex::new(ClassLedger::new(policy))))
            .collect();
        Self { ledgers }
    }

    /// Policy enforced for `class`.
    #[must_use]
    pub fn policy(&self, class: RestrictionClass) -> Option<RestrictionPolicy> {
        self.ledgers.get(&class).map(|ledger| ledger.lock().policy)
    }

    /// Evaluate every class `request` declares.
    #[must_use]
    pub fn check(&self, request: &DataRequest) -> AdmissionReport {
        self.check_at(request, Instant::now())
    }

    /// Evaluate every class `request` declares as of `now`.
    #[must_use]
    pub fn check_at(&self, request: &DataRequest, now: Instant) -> AdmissionReport {
        let decisions = request
            .classes()
            .iter()
            .map(|class| {
                let admission = self.ledgers.get(class).map_or(Admission::Granted, |ledger| {
                    ledger.lock().check(&Self::key_for(*class, request), now)
                });
                (*class, admission)
            })
            .collect();
        AdmissionReport { decisions }
    }

    /// Account `request` in every class it declares.
    pub fn register(&self, request: &DataRequest) {
        self.register_at(request, Instant::now());
    }

    /// Account `request` in every class it declares as of `now`.
    pub fn register_at(&self, request: &DataRequest, now: Instant) {
        let weight = request.cost();
        for class in request.classes() {
            let Some(ledger) = self.ledgers.get(class) else {
                continue;
            };
            let key = Self::key_for(*class, request);
            let mut ledger = ledger.lock();
            let policy = ledger.policy;
            let container = ledger
                .containers
                .entry(key)
                .or_insert_with(|| AccountingContainer::for_policy(&policy));
            container.purge(&policy, now);
            container.register(request.id(), weight, now);
        }
        tracing::debug!(
            request_id = %request.id(),
            kind = request.params().kind().as_str(),
            weight,
            "Registered with restriction manager"
        );
    }

    /// Release `request` from every ceiling class it declares.
    pub fn deregister(&self, request: &DataRequest) {
        for class in request.classes() {
            let Some(ledger) = self.ledgers.get(class) else {
                continue;
            };
            let key = Self::key_for(*class, request);
            let mut ledger = ledger.lock();
            if let Some(container) = ledger.containers.get_mut(&key) {
                container.deregister(request.id());
                if container.is_empty() {
                    ledger.containers.remove(&key);
                }
            }
        }
        tracing::debug!(request_id = %request.id(), "Deregistered from restriction manager");
    }

    /// Current usage of every class, purged as of now.
    #[must_use]
    pub fn usage(&self) -> Vec<ClassUsage> {
        let now = Instant::now();
        let mut usage: Vec<ClassUsage> = self
            .ledgers
            .iter()
            .map(|(class, ledger)| {
                let mut ledger = ledger.lock();
                let policy = ledger.policy;
                ledger.containers.retain(|_, container| {
                    container.purge(&policy, now);
                    !container.is_empty()
                });
                let mut keys: Vec<KeyUsage> = ledger
                    .containers
                    .iter()
                    .map(|(key, container)| KeyUsage {
                        key: key.clone(),
                        count: container.count(),
                    })
                    .collect();
                keys.sort_by(|a, b| a.key.cmp(&b.key));
                ClassUsage {
                    class: *class,
                    policy: policy.to_string(),
                    capacity: policy.capacity(),
                    keys,
                }
            })
            .collect();
        usage.sort_by_key(|u| u.class);
        usage
    }

    fn key_for(class: RestrictionClass, request: &DataRequest) -> String {
        match class.keying() {
            Keying::Global => GLOBAL_KEY.to_string(),
            Keying::PerInstrument => request.instrument().key(),
            Keying::PerRequestIdentity => request.fingerprint().to_string(),
        }
    }
}
