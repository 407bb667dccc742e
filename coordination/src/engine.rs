//! Engine facade
//!
//! Wires registry, breaker, stats, selector, coordinator and cache together
//! from an [`EngineConfig`]. Persisted state is restored on construction
//! and flushed by [`Engine::shutdown`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::{compute_key, CacheEntry, ResultCache, SharedResultCache};
use crate::clock::{SharedClock, SystemClock};
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::persistence::{JsonFileStore, SharedStore};
use crate::registry::BackendRegistry;
use crate::resilience::{
    BackendInvoker, ExecutionCoordinator, ExecutionOutcome, SharedAuditSink,
};
use crate::router::{
    BackendMetric, BackendSelector, BackendStats, BreakerRecord, CircuitBreaker, TaskProfile,
};

/// Result of [`Engine::execute_cached`]
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResult {
    pub key: String,
    pub output: String,
    /// Served from the cache without calling a backend
    pub hit: bool,
}

/// Fully wired execution engine
pub struct Engine {
    config: EngineConfig,
    registry: Arc<BackendRegistry>,
    breaker: Arc<CircuitBreaker>,
    stats: Arc<BackendStats>,
    cache: SharedResultCache,
    coordinator: ExecutionCoordinator,
    sweeper: Option<(CancellationToken, JoinHandle<()>)>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("backends", &self.registry.len())
            .field("state_dir", &self.config.state_dir)
            .field("sweeper", &self.sweeper.is_some())
            .finish()
    }
}

impl Engine {
    /// Build an engine on the system clock.
    pub async fn from_config(config: EngineConfig, invoker: Arc<dyn BackendInvoker>) -> Self {
        Self::with_clock(config, invoker, SystemClock::shared()).await
    }

    /// Build an engine on `clock`, restoring state from `config.state_dir`.
    pub async fn with_clock(
        config: EngineConfig,
        invoker: Arc<dyn BackendInvoker>,
        clock: SharedClock,
    ) -> Self {
        let registry = Arc::new(config.registry());

        let breaker = match config.breaker_state_path() {
            Some(path) => {
                let store: SharedStore<BreakerRecord> = Arc::new(JsonFileStore::new(path));
                CircuitBreaker::load(config.breaker.clone(), clock.clone(), store).await
            }
            None => CircuitBreaker::new(config.breaker.clone(), clock.clone()),
        };
        let breaker = Arc::new(breaker.with_trial_lease(config.trial_lease()));

        let stats = match config.stats_state_path() {
            Some(path) => {
                let store: SharedStore<BackendMetric> = Arc::new(JsonFileStore::new(path));
                BackendStats::load(clock.clone(), store).await
            }
            None => BackendStats::new(clock.clone()),
        };
        let stats = Arc::new(stats);

        let cache = match config.cache_state_path() {
            Some(path) => {
                let store: SharedStore<CacheEntry> = Arc::new(JsonFileStore::new(path));
                ResultCache::load(clock.clone(), store).await
            }
            None => ResultCache::new(clock.clone()),
        }
        .shared();

        let selector = BackendSelector::new(
            registry.clone(),
            breaker.clone(),
            stats.clone(),
            config.selector.clone(),
        );
        let coordinator = ExecutionCoordinator::new(
            selector,
            breaker.clone(),
            stats.clone(),
            invoker,
            config.retry.clone(),
            clock.clone(),
        );

        info!(
            backends = registry.len(),
            persistent = config.state_dir.is_some(),
            "Engine ready"
        );

        Self {
            config,
            registry,
            breaker,
            stats,
            cache,
            coordinator,
            sweeper: None,
        }
    }

    /// Emit execution events to `sink`.
    pub fn with_audit(mut self, sink: SharedAuditSink) -> Self {
        self.coordinator = self.coordinator.with_audit(sink);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn stats(&self) -> &Arc<BackendStats> {
        &self.stats
    }

    pub fn cache(&self) -> &SharedResultCache {
        &self.cache
    }

    pub fn selector(&self) -> &BackendSelector {
        self.coordinator.selector()
    }

    pub fn coordinator(&self) -> &ExecutionCoordinator {
        &self.coordinator
    }

    pub async fn execute(
        &self,
        task: &TaskProfile,
        payload: &str,
    ) -> EngineResult<ExecutionOutcome> {
        self.coordinator.execute(task, payload).await
    }

    /// Execute through the cache: a live entry for the inputs is returned
    /// as-is, otherwise the result is computed and stored with the default
    /// TTL.
    pub async fn execute_cached(
        &self,
        owner: &str,
        params: &Value,
        file_contents: &HashMap<String, String>,
        task: &TaskProfile,
        payload: &str,
    ) -> EngineResult<CachedResult> {
        let key = compute_key(owner, params, file_contents);
        if let Some(output) = self.cache.get(&key).await {
            debug!(key = %key, owner, "Cache hit");
            return Ok(CachedResult {
                key,
                output,
                hit: true,
            });
        }

        let outcome = self.coordinator.execute(task, payload).await?;
        let mut metadata = HashMap::new();
        metadata.insert(
            "backend".to_string(),
            Value::String(outcome.backend.to_string()),
        );
        metadata.insert("attempts".to_string(), Value::from(outcome.attempts));
        metadata.insert(
            "execution_id".to_string(),
            Value::String(outcome.execution_id.to_string()),
        );
        self.cache
            .set(
                key.clone(),
                outcome.output.clone(),
                owner,
                self.config.cache.default_ttl_seconds,
                metadata,
            )
            .await;

        Ok(CachedResult {
            key,
            output: outcome.output,
            hit: false,
        })
    }

    /// Start the periodic cache sweep. A second call is a no-op.
    pub fn start_sweeper(&mut self) {
        if self.sweeper.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let interval = Duration::from_secs(self.config.cache.sweep_interval_secs);
        let handle = self.cache.spawn_sweeper(interval, cancel.clone());
        debug!(interval_secs = interval.as_secs(), "Cache sweeper started");
        self.sweeper = Some((cancel, handle));
    }

    /// Stop background work and flush all persisted state.
    pub async fn shutdown(&mut self) {
        if let Some((cancel, handle)) = self.sweeper.take() {
            cancel.cancel();
            let _ = handle.await;
        }
        self.breaker.shutdown().await;
        self.stats.flush().await;
        self.cache.shutdown().await;
        info!("Engine shut down");
    }
}
