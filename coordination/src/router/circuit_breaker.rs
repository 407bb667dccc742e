//! Per-backend circuit breaker.
//!
//! The breaker tracks consecutive failures per [`BackendId`]. When failures
//! reach a configurable threshold the circuit *opens* and the backend is
//! skipped. Once the cool-down has elapsed, the next availability check
//! moves the circuit to *half-open* and admits a single trial call whose
//! reported outcome closes or re-opens it.
//!
//! ```text
//! Closed ──(failures >= threshold)──▶ Open
//! Open ──(cool-down elapsed, checked)──▶ HalfOpen
//! HalfOpen ──(success)──▶ Closed
//! HalfOpen ──(failure)──▶ Open
//! ```
//!
//! Only one trial is admitted per half-open window. A granted trial is a
//! lease: if its outcome is never reported it expires after the lease
//! length (at least the reset timeout) and another trial may be granted.
//! A caller still working on its trial keeps the lease with
//! [`CircuitBreaker::renew_trial`].

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{elapsed_ms, SharedClock};
use crate::persistence::SharedStore;
use crate::registry::BackendId;

/// Circuit breaker state for a single backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Healthy — requests allowed.
    Closed,
    /// Tripped — requests blocked until cooldown expires.
    Open,
    /// Cooldown expired — one trial request allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Milliseconds after the last failure before Open → HalfOpen.
    pub reset_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout_ms: 300_000,
        }
    }
}

/// Persisted breaker state for one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerRecord {
    pub backend: BackendId,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    #[serde(skip)]
    trial_started_at: Option<DateTime<Utc>>,
}

impl BreakerRecord {
    /// A fresh closed record with no failures.
    pub fn closed(backend: BackendId) -> Self {
        Self {
            backend,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_time: None,
            trial_started_at: None,
        }
    }

    /// Whether a half-open trial has been granted and not yet reported.
    pub fn trial_in_flight(&self) -> bool {
        self.trial_started_at.is_some()
    }
}

/// Circuit breaker governing every backend.
///
/// All mutation goes through this type; callers only ever see cloned
/// records.
pub struct CircuitBreaker {
    records: Mutex<HashMap<BackendId, BreakerRecord>>,
    config: BreakerConfig,
    clock: SharedClock,
    store: Option<SharedStore<BreakerRecord>>,
    /// How long a granted trial stays exclusive without being renewed.
    trial_lease_ms: u64,
    /// Serializes snapshot + save so the newest state is always written last.
    persist_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("trial_lease_ms", &self.trial_lease_ms)
            .field("backends", &self.lock().len())
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create an in-memory breaker.
    pub fn new(config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            trial_lease_ms: config.reset_timeout_ms,
            config,
            clock,
            store: None,
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Persist every state change to `store`.
    pub fn with_store(mut self, store: SharedStore<BreakerRecord>) -> Self {
        self.store = Some(store);
        self
    }

    /// Create a breaker backed by `store`, restoring whatever it holds.
    ///
    /// A store that cannot be read is logged and the breaker starts empty.
    pub async fn load(
        config: BreakerConfig,
        clock: SharedClock,
        store: SharedStore<BreakerRecord>,
    ) -> Self {
        let breaker = Self::new(config, clock).with_store(store.clone());
        match store.load_all().await {
            Ok(records) => {
                let mut map = breaker.lock();
                for record in records {
                    map.insert(record.backend.clone(), record);
                }
                info!(backends = map.len(), "Restored circuit breaker state");
            }
            Err(e) => {
                warn!(
                    component = "breaker",
                    error = %e,
                    "Failed to load breaker state, starting fresh"
                );
            }
        }
        breaker
    }

    /// Keep a granted trial exclusive for at least `lease`. Never shorter
    /// than the reset timeout.
    pub fn with_trial_lease(mut self, lease: Duration) -> Self {
        let lease_ms = u64::try_from(lease.as_millis()).unwrap_or(u64::MAX);
        self.trial_lease_ms = lease_ms.max(self.config.reset_timeout_ms);
        self
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn trial_lease_ms(&self) -> u64 {
        self.trial_lease_ms
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<BackendId, BreakerRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The record for `backend`, created closed on first observation.
    fn get_or_create<'a>(
        records: &'a mut HashMap<BackendId, BreakerRecord>,
        backend: &BackendId,
    ) -> &'a mut BreakerRecord {
        records
            .entry(backend.clone())
            .or_insert_with(|| BreakerRecord::closed(backend.clone()))
    }

    fn cooldown_elapsed(&self, record: &BreakerRecord, now: DateTime<Utc>) -> bool {
        match record.last_failure_time {
            Some(last) => elapsed_ms(last, now) > self.config.reset_timeout_ms,
            None => true,
        }
    }

    fn trial_lease_held(&self, record: &BreakerRecord, now: DateTime<Utc>) -> bool {
        match record.trial_started_at {
            Some(started) => elapsed_ms(started, now) <= self.trial_lease_ms,
            None => false,
        }
    }

    /// Whether `backend` may be called now.
    ///
    /// An open circuit whose cool-down has elapsed moves to half-open and
    /// the caller receives the single trial; the caller must report the
    /// outcome through [`on_success`](Self::on_success) /
    /// [`on_failure`](Self::on_failure) or give it back with
    /// [`release_trial`](Self::release_trial).
    pub fn is_available(&self, backend: &BackendId) -> bool {
        let now = self.clock.now();
        let mut records = self.lock();
        let record = Self::get_or_create(&mut records, backend);
        let state = record.state;

        match state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if !self.cooldown_elapsed(record, now) {
                    return false;
                }
                record.state = CircuitState::HalfOpen;
                record.trial_started_at = Some(now);
                info!(backend = %backend, "Circuit half-open, admitting trial call");
                true
            }
            CircuitState::HalfOpen => {
                if self.trial_lease_held(record, now) {
                    debug!(backend = %backend, "Trial already in flight");
                    return false;
                }
                record.trial_started_at = Some(now);
                debug!(backend = %backend, "Admitting half-open trial call");
                true
            }
        }
    }

    /// What [`is_available`](Self::is_available) would answer, without
    /// changing any state or consuming the trial.
    pub fn peek_available(&self, backend: &BackendId) -> bool {
        let now = self.clock.now();
        let records = self.lock();
        match records.get(backend) {
            None => true,
            Some(record) => match record.state {
                CircuitState::Closed => true,
                CircuitState::Open => self.cooldown_elapsed(record, now),
                CircuitState::HalfOpen => !self.trial_lease_held(record, now),
            },
        }
    }

    /// Record a success — closes the circuit.
    pub async fn on_success(&self, backend: &BackendId) {
        {
            let mut records = self.lock();
            let record = Self::get_or_create(&mut records, backend);
            let previous = record.state;
            record.state = CircuitState::Closed;
            record.consecutive_failures = 0;
            record.trial_started_at = None;
            if previous != CircuitState::Closed {
                info!(backend = %backend, from = %previous, "Circuit closed");
            }
        }
        self.persist().await;
    }

    /// Record a failure — may trip the circuit open.
    pub async fn on_failure(&self, backend: &BackendId) {
        let now = self.clock.now();
        {
            let mut records = self.lock();
            let record = Self::get_or_create(&mut records, backend);
            record.consecutive_failures = record.consecutive_failures.saturating_add(1);
            record.last_failure_time = Some(now);
            record.trial_started_at = None;

            match record.state {
                CircuitState::HalfOpen => {
                    record.state = CircuitState::Open;
                    warn!(backend = %backend, "Trial call failed, circuit re-opened");
                }
                CircuitState::Closed
                    if record.consecutive_failures >= self.config.failure_threshold =>
                {
                    record.state = CircuitState::Open;
                    warn!(
                        backend = %backend,
                        failures = record.consecutive_failures,
                        "Circuit opened"
                    );
                }
                _ => {
                    debug!(
                        backend = %backend,
                        failures = record.consecutive_failures,
                        "Failure recorded"
                    );
                }
            }
        }
        self.persist().await;
    }

    /// Restart the lease of a trial still in progress, so a caller retrying
    /// its trial keeps exclusive access. No-op unless a trial is held.
    pub fn renew_trial(&self, backend: &BackendId) {
        let now = self.clock.now();
        let mut records = self.lock();
        if let Some(record) = records.get_mut(backend) {
            if record.state == CircuitState::HalfOpen && record.trial_started_at.is_some() {
                record.trial_started_at = Some(now);
            }
        }
    }

    /// Give back a granted trial without reporting an outcome.
    pub fn release_trial(&self, backend: &BackendId) {
        let mut records = self.lock();
        if let Some(record) = records.get_mut(backend) {
            if record.state == CircuitState::HalfOpen && record.trial_started_at.is_some() {
                record.trial_started_at = None;
                debug!(backend = %backend, "Trial released");
            }
        }
    }

    /// Force `backend` closed with zero failures.
    pub async fn reset(&self, backend: &BackendId) {
        {
            let mut records = self.lock();
            records.insert(backend.clone(), BreakerRecord::closed(backend.clone()));
        }
        info!(backend = %backend, "Circuit reset");
        self.persist().await;
    }

    /// Force every known backend closed with zero failures.
    pub async fn reset_all(&self) {
        {
            let mut records = self.lock();
            for (backend, record) in records.iter_mut() {
                *record = BreakerRecord::closed(backend.clone());
            }
        }
        info!("All circuits reset");
        self.persist().await;
    }

    /// Flush in-memory state to the store before exit.
    pub async fn shutdown(&self) {
        self.persist().await;
    }

    /// Current recorded state; unknown backends are closed.
    pub fn state(&self, backend: &BackendId) -> CircuitState {
        self.lock()
            .get(backend)
            .map(|r| r.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Consecutive failures recorded for `backend`.
    pub fn failure_count(&self, backend: &BackendId) -> u32 {
        self.lock()
            .get(backend)
            .map(|r| r.consecutive_failures)
            .unwrap_or(0)
    }

    pub fn record(&self, backend: &BackendId) -> Option<BreakerRecord> {
        self.lock().get(backend).cloned()
    }

    /// All records, ordered by backend id.
    pub fn snapshot(&self) -> Vec<BreakerRecord> {
        let mut records: Vec<BreakerRecord> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| a.backend.cmp(&b.backend));
        records
    }

    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.snapshot();
        if let Err(e) = store.save_all(&snapshot).await {
            warn!(component = "breaker", error = %e, "Failed to persist breaker state");
        }
    }
}
