//! Persistence across restarts — breaker, stats and cache state written
//! through JSON file stores and restored by a fresh instance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dispatch_coordination::{
    BackendId, BackendMetric, BackendStats, BreakerConfig, BreakerRecord, CacheEntry,
    CircuitBreaker, CircuitState, Clock, JsonFileStore, ManualClock, RecordStore, ResultCache,
    SharedStore,
};

fn id(s: &str) -> BackendId {
    BackendId::from(s)
}

fn breaker_store(path: &std::path::Path) -> SharedStore<BreakerRecord> {
    Arc::new(JsonFileStore::new(path))
}

#[tokio::test]
async fn breaker_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("breaker.json");
    let clock = ManualClock::starting_now();
    let config = BreakerConfig {
        failure_threshold: 2,
        reset_timeout_ms: 60_000,
    };

    let breaker =
        CircuitBreaker::new(config.clone(), clock.clone()).with_store(breaker_store(&path));
    breaker.on_failure(&id("a")).await;
    breaker.on_failure(&id("a")).await;
    breaker.on_failure(&id("b")).await;
    let failed_at = clock.now();

    let restored = CircuitBreaker::load(config, clock.clone(), breaker_store(&path)).await;
    assert_eq!(restored.state(&id("a")), CircuitState::Open);
    assert_eq!(restored.failure_count(&id("b")), 1);
    assert_eq!(
        restored.record(&id("a")).unwrap().last_failure_time,
        Some(failed_at)
    );

    // The cool-down keeps running from the persisted failure time
    assert!(!restored.is_available(&id("a")));
    clock.advance_ms(60_001);
    assert!(restored.is_available(&id("a")));
}

#[tokio::test]
async fn half_open_trial_lease_is_not_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("breaker.json");
    let clock = ManualClock::starting_now();
    let config = BreakerConfig {
        failure_threshold: 1,
        reset_timeout_ms: 1_000,
    };

    let breaker =
        CircuitBreaker::new(config.clone(), clock.clone()).with_store(breaker_store(&path));
    breaker.on_failure(&id("a")).await;
    clock.advance_ms(1_001);
    assert!(breaker.is_available(&id("a")));
    breaker.shutdown().await;

    let restored = CircuitBreaker::load(config, clock, breaker_store(&path)).await;
    let record = restored.record(&id("a")).unwrap();
    assert_eq!(record.state, CircuitState::HalfOpen);
    assert!(!record.trial_in_flight());
    assert!(restored.is_available(&id("a")));
}

#[tokio::test]
async fn corrupt_state_file_starts_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("breaker.json");
    std::fs::write(&path, "{ not json").unwrap();

    let breaker = CircuitBreaker::load(
        BreakerConfig::default(),
        ManualClock::starting_now(),
        breaker_store(&path),
    )
    .await;
    assert!(breaker.snapshot().is_empty());

    // Still usable, and the next write replaces the corrupt file
    breaker.on_failure(&id("a")).await;
    let store: JsonFileStore<BreakerRecord> = JsonFileStore::new(&path);
    assert_eq!(store.load_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn stats_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stats.json");
    let clock = ManualClock::starting_now();
    let store: SharedStore<BackendMetric> = Arc::new(JsonFileStore::new(&path));

    let stats = BackendStats::new(clock.clone()).with_store(store.clone());
    stats.record_attempt(&id("a"), true, Duration::from_millis(120));
    stats.record_attempt(&id("a"), false, Duration::from_millis(80));
    stats.flush().await;

    let restored = BackendStats::load(clock, store).await;
    let metric = restored.metric(&id("a")).unwrap();
    assert_eq!(metric.total_calls, 2);
    assert!((metric.avg_response_time_ms - 100.0).abs() < 1e-6);
    assert!((restored.success_rate(&id("a")) - 0.5).abs() < 1e-9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cache_writes_are_all_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.json");
    let clock = ManualClock::starting_now();
    let store: SharedStore<CacheEntry> = Arc::new(JsonFileStore::new(&path));
    let cache = ResultCache::new(clock.clone()).with_store(store.clone()).shared();

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .set(format!("key-{i}"), format!("value-{i}"), "wf", 600, HashMap::new())
                    .await;
            })
        })
        .collect();
    for handle in futures::future::join_all(handles).await {
        handle.unwrap();
    }

    let restored = ResultCache::load(clock, store).await;
    assert_eq!(restored.len().await, 16);
    for i in 0..16 {
        assert_eq!(
            restored.get(&format!("key-{i}")).await,
            Some(format!("value-{i}"))
        );
    }
    // No temp file left behind
    assert!(!dir.path().join("cache.json.tmp").exists());
}

#[tokio::test]
async fn cache_reload_then_expiry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.json");
    let clock = ManualClock::starting_now();
    let store: SharedStore<CacheEntry> = Arc::new(JsonFileStore::new(&path));

    let cache = ResultCache::new(clock.clone()).with_store(store.clone());
    cache.set("k", "v", "wf", 5, HashMap::new()).await;

    clock.advance_ms(6_000);
    let restored = ResultCache::load(clock, store.clone()).await;
    assert_eq!(restored.stats().await.expired, 1);
    assert_eq!(restored.cleanup().await, 1);
    assert!(store.load_all().await.unwrap().is_empty());
}
