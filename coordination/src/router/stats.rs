//! Running success and latency metrics per backend.
//!
//! Every call attempt is recorded, successful or not. Latency is a running
//! mean over all attempts rather than a window, so updates commute and need
//! no ordering between concurrent calls.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::persistence::SharedStore;
use crate::registry::BackendId;

/// Metrics for one backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendMetric {
    pub backend: BackendId,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    /// Running mean over every attempt
    pub avg_response_time_ms: f64,
    pub last_used: DateTime<Utc>,
}

impl BackendMetric {
    fn new(backend: BackendId, now: DateTime<Utc>) -> Self {
        Self {
            backend,
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            avg_response_time_ms: 0.0,
            last_used: now,
        }
    }

    /// Success rate (0.0 - 1.0); a backend never called scores 0.0.
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.successful_calls as f64 / self.total_calls as f64
        }
    }

    fn record(&mut self, success: bool, latency_ms: f64, now: DateTime<Utc>) {
        self.total_calls += 1;
        if success {
            self.successful_calls += 1;
        } else {
            self.failed_calls += 1;
        }
        self.avg_response_time_ms +=
            (latency_ms - self.avg_response_time_ms) / self.total_calls as f64;
        self.last_used = now;
    }
}

/// Metrics for every backend
pub struct BackendStats {
    metrics: Mutex<HashMap<BackendId, BackendMetric>>,
    clock: SharedClock,
    store: Option<SharedStore<BackendMetric>>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for BackendStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendStats")
            .field("backends", &self.lock().len())
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl BackendStats {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            metrics: Mutex::new(HashMap::new()),
            clock,
            store: None,
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_store(mut self, store: SharedStore<BackendMetric>) -> Self {
        self.store = Some(store);
        self
    }

    /// Create stats backed by `store`, restoring whatever it holds.
    pub async fn load(clock: SharedClock, store: SharedStore<BackendMetric>) -> Self {
        let stats = Self::new(clock).with_store(store.clone());
        match store.load_all().await {
            Ok(metrics) => {
                let mut map = stats.lock();
                for metric in metrics {
                    map.insert(metric.backend.clone(), metric);
                }
                info!(backends = map.len(), "Restored backend stats");
            }
            Err(e) => {
                warn!(
                    component = "stats",
                    error = %e,
                    "Failed to load backend stats, starting fresh"
                );
            }
        }
        stats
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<BackendId, BackendMetric>> {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record one call attempt.
    pub fn record_attempt(&self, backend: &BackendId, success: bool, latency: Duration) {
        let now = self.clock.now();
        let mut metrics = self.lock();
        metrics
            .entry(backend.clone())
            .or_insert_with(|| BackendMetric::new(backend.clone(), now))
            .record(success, latency.as_secs_f64() * 1000.0, now);
    }

    /// Success rate for `backend`; unknown backends score 0.0.
    pub fn success_rate(&self, backend: &BackendId) -> f64 {
        self.lock()
            .get(backend)
            .map(BackendMetric::success_rate)
            .unwrap_or(0.0)
    }

    pub fn metric(&self, backend: &BackendId) -> Option<BackendMetric> {
        self.lock().get(backend).cloned()
    }

    /// All metrics, ordered by backend id.
    pub fn snapshot(&self) -> Vec<BackendMetric> {
        let mut metrics: Vec<BackendMetric> = self.lock().values().cloned().collect();
        metrics.sort_by(|a, b| a.backend.cmp(&b.backend));
        metrics
    }

    /// Write the current metrics to the store, if any.
    pub async fn flush(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.snapshot();
        if let Err(e) = store.save_all(&snapshot).await {
            warn!(component = "stats", error = %e, "Failed to persist backend stats");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::MemoryStore;
    use std::sync::Arc;

    fn id(s: &str) -> BackendId {
        BackendId::from(s)
    }

    #[test]
    fn test_success_rate_and_counts() {
        let stats = BackendStats::new(ManualClock::starting_now());
        assert_eq!(stats.success_rate(&id("a")), 0.0);

        stats.record_attempt(&id("a"), true, Duration::from_millis(100));
        stats.record_attempt(&id("a"), false, Duration::from_millis(300));
        stats.record_attempt(&id("a"), true, Duration::from_millis(200));

        let m = stats.metric(&id("a")).unwrap();
        assert_eq!(m.total_calls, 3);
        assert_eq!(m.successful_calls, 2);
        assert_eq!(m.failed_calls, 1);
        assert!((stats.success_rate(&id("a")) - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_running_mean_latency() {
        let stats = BackendStats::new(ManualClock::starting_now());
        for ms in [100, 200, 300, 400] {
            stats.record_attempt(&id("a"), true, Duration::from_millis(ms));
        }
        let m = stats.metric(&id("a")).unwrap();
        assert!((m.avg_response_time_ms - 250.0).abs() < 1e-6);
    }

    #[test]
    fn test_last_used_tracks_clock() {
        let clock = ManualClock::starting_now();
        let stats = BackendStats::new(clock.clone());
        stats.record_attempt(&id("a"), true, Duration::from_millis(1));
        clock.advance_ms(5_000);
        stats.record_attempt(&id("a"), true, Duration::from_millis(1));
        let m = stats.metric(&id("a")).unwrap();
        assert_eq!(m.last_used, crate::clock::Clock::now(clock.as_ref()));
    }

    #[tokio::test]
    async fn test_flush_and_load() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(MemoryStore::<BackendMetric>::new());
        let stats = BackendStats::new(clock.clone()).with_store(store.clone());
        stats.record_attempt(&id("b"), true, Duration::from_millis(10));
        stats.record_attempt(&id("a"), false, Duration::from_millis(10));
        stats.flush().await;

        let saved = store.records();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[0].backend, id("a"));

        let restored = BackendStats::load(clock, store).await;
        assert_eq!(restored.success_rate(&id("b")), 1.0);
        assert_eq!(restored.metric(&id("a")).unwrap().failed_calls, 1);
    }
}
