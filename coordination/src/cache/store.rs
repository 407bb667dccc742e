//! TTL result cache
//!
//! Entries live behind a tokio [`RwLock`]: lookups share the read side,
//! every mutation takes the write side and persists the full entry set
//! before releasing it. Readers therefore only ever see complete entries,
//! and the persisted file never lags a later write.
//!
//! Expiry is checked on every read. The sweeper only reclaims memory.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{elapsed_ms, SharedClock};
use crate::persistence::SharedStore;

/// Cache tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL applied by callers that do not pick their own
    pub default_ttl_seconds: u64,
    /// Period of the background sweep
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 3_600,
            sweep_interval_secs: 300,
        }
    }
}

/// A cached result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub result: String,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    /// Logical workflow that produced the result
    pub owner: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CacheEntry {
    /// Expired once strictly more than `ttl_seconds` have passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        elapsed_ms(self.created_at, now) > self.ttl_seconds.saturating_mul(1_000)
    }
}

/// Point-in-time counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total: usize,
    pub live: usize,
    pub expired: usize,
    /// Live entries per owner
    pub by_owner: BTreeMap<String, usize>,
}

/// Shared reference to a result cache
pub type SharedResultCache = Arc<ResultCache>;

/// Content-addressed TTL cache
pub struct ResultCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    clock: SharedClock,
    store: Option<SharedStore<CacheEntry>>,
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("persistent", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

impl ResultCache {
    /// Create an in-memory cache.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
            store: None,
        }
    }

    pub fn with_store(mut self, store: SharedStore<CacheEntry>) -> Self {
        self.store = Some(store);
        self
    }

    /// Create a cache backed by `store`, restoring whatever it holds.
    ///
    /// Expired entries are restored too; reads and the sweeper deal with
    /// them.
    pub async fn load(clock: SharedClock, store: SharedStore<CacheEntry>) -> Self {
        let cache = Self::new(clock).with_store(store.clone());
        match store.load_all().await {
            Ok(entries) => {
                let mut map = cache.entries.write().await;
                for entry in entries {
                    map.insert(entry.key.clone(), entry);
                }
                info!(entries = map.len(), "Restored result cache");
            }
            Err(e) => {
                warn!(
                    component = "cache",
                    error = %e,
                    "Failed to load result cache, starting empty"
                );
            }
        }
        cache
    }

    pub fn shared(self) -> SharedResultCache {
        Arc::new(self)
    }

    /// Cached result for `key`, if present and not expired.
    pub async fn get(&self, key: &str) -> Option<String> {
        self.entry(key).await.map(|entry| entry.result)
    }

    /// Full cached entry for `key`, if present and not expired.
    pub async fn entry(&self, key: &str) -> Option<CacheEntry> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired(self.clock.now()) => {
                    return Some(entry.clone());
                }
                Some(_) => {}
            }
        }

        // Expired: remove it, unless a writer replaced it meanwhile.
        let mut entries = self.entries.write().await;
        let now = self.clock.now();
        let expired = entries.get(key).map(|entry| entry.is_expired(now));
        match expired {
            Some(true) => {
                entries.remove(key);
                debug!(key, "Removed expired cache entry");
                self.persist(&entries).await;
                None
            }
            Some(false) => entries.get(key).cloned(),
            None => None,
        }
    }

    /// Store `result` under `key`, replacing any previous entry.
    pub async fn set(
        &self,
        key: impl Into<String>,
        result: impl Into<String>,
        owner: impl Into<String>,
        ttl_seconds: u64,
        metadata: HashMap<String, serde_json::Value>,
    ) {
        let key = key.into();
        let entry = CacheEntry {
            key: key.clone(),
            result: result.into(),
            created_at: self.clock.now(),
            ttl_seconds,
            owner: owner.into(),
            metadata,
        };

        let mut entries = self.entries.write().await;
        entries.insert(key.clone(), entry);
        debug!(key = %key, ttl_seconds, "Cached result");
        self.persist(&entries).await;
    }

    /// Drop `key`. Returns whether it was present.
    pub async fn remove(&self, key: &str) -> bool {
        let mut entries = self.entries.write().await;
        let removed = entries.remove(key).is_some();
        if removed {
            self.persist(&entries).await;
        }
        removed
    }

    /// Remove every expired entry. Returns how many were removed.
    pub async fn cleanup(&self) -> usize {
        let mut entries = self.entries.write().await;
        let now = self.clock.now();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();
        if removed > 0 {
            info!(removed, remaining = entries.len(), "Swept expired cache entries");
            self.persist(&entries).await;
        }
        removed
    }

    /// Remove everything.
    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        let removed = entries.len();
        entries.clear();
        info!(removed, "Cache cleared");
        self.persist(&entries).await;
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        let now = self.clock.now();
        let mut stats = CacheStats {
            total: entries.len(),
            ..Default::default()
        };
        for entry in entries.values() {
            if entry.is_expired(now) {
                stats.expired += 1;
            } else {
                stats.live += 1;
                *stats.by_owner.entry(entry.owner.clone()).or_default() += 1;
            }
        }
        stats
    }

    /// Number of stored entries, expired ones included.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Flush entries to the store before exit.
    pub async fn shutdown(&self) {
        let entries = self.entries.write().await;
        self.persist(&entries).await;
    }

    /// Run [`cleanup`](Self::cleanup) every `interval` until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Cache sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        cache.cleanup().await;
                    }
                }
            }
        })
    }

    /// Save the full entry set. Called with the write lock held.
    async fn persist(&self, entries: &HashMap<String, CacheEntry>) {
        let Some(store) = &self.store else {
            return;
        };
        let mut snapshot: Vec<CacheEntry> = entries.values().cloned().collect();
        snapshot.sort_by(|a, b| a.key.cmp(&b.key));
        if let Err(e) = store.save_all(&snapshot).await {
            warn!(component = "cache", error = %e, "Failed to persist result cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::{JsonFileStore, MemoryStore};

    fn no_meta() -> HashMap<String, serde_json::Value> {
        HashMap::new()
    }

    #[tokio::test]
    async fn test_ttl_boundary() {
        let clock = ManualClock::starting_now();
        let cache = ResultCache::new(clock.clone());
        cache.set("k", "r1", "wf", 1, no_meta()).await;

        assert_eq!(cache.get("k").await.as_deref(), Some("r1"));
        clock.advance_ms(1_000);
        assert_eq!(cache.get("k").await.as_deref(), Some("r1"));
        clock.advance_ms(1);
        assert_eq!(cache.get("k").await, None);
        // Lazily removed
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_set_overwrites_and_resets_ttl() {
        let clock = ManualClock::starting_now();
        let cache = ResultCache::new(clock.clone());
        cache.set("k", "old", "wf", 1, no_meta()).await;
        clock.advance_ms(900);
        cache.set("k", "new", "wf", 1, no_meta()).await;
        clock.advance_ms(900);
        assert_eq!(cache.get("k").await.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_entry_keeps_metadata() {
        let cache = ResultCache::new(ManualClock::starting_now());
        let mut meta = HashMap::new();
        meta.insert("backend".to_string(), serde_json::json!("deep"));
        cache.set("k", "r", "wf", 60, meta).await;

        let entry = cache.entry("k").await.unwrap();
        assert_eq!(entry.owner, "wf");
        assert_eq!(entry.metadata["backend"], "deep");
    }

    #[tokio::test]
    async fn test_cleanup_stats_remove_clear() {
        let clock = ManualClock::starting_now();
        let cache = ResultCache::new(clock.clone());
        cache.set("short", "a", "wf1", 1, no_meta()).await;
        cache.set("long", "b", "wf1", 60, no_meta()).await;
        cache.set("other", "c", "wf2", 60, no_meta()).await;
        clock.advance_ms(2_000);

        let stats = cache.stats().await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.live, 2);
        assert_eq!(stats.by_owner.get("wf1"), Some(&1));

        assert_eq!(cache.cleanup().await, 1);
        assert_eq!(cache.cleanup().await, 0);
        assert!(cache.remove("long").await);
        assert!(!cache.remove("long").await);
        cache.clear().await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_writes_persist_and_reload() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(MemoryStore::<CacheEntry>::new());
        let cache = ResultCache::new(clock.clone()).with_store(store.clone());

        cache.set("a", "1", "wf", 60, no_meta()).await;
        cache.set("b", "2", "wf", 60, no_meta()).await;
        assert_eq!(store.save_count(), 2);
        assert_eq!(store.records().len(), 2);

        // Reads do not persist
        cache.get("a").await;
        assert_eq!(store.save_count(), 2);

        let restored = ResultCache::load(clock, store).await;
        assert_eq!(restored.get("b").await.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_load_keeps_expired_entries_until_read() {
        let clock = ManualClock::starting_now();
        let stale = CacheEntry {
            key: "old".to_string(),
            result: "x".to_string(),
            created_at: crate::clock::Clock::now(clock.as_ref()) - chrono::Duration::hours(2),
            ttl_seconds: 60,
            owner: "wf".to_string(),
            metadata: HashMap::new(),
        };
        let store = Arc::new(MemoryStore::with_records(vec![stale]));
        let cache = ResultCache::load(clock, store).await;

        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get("old").await, None);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_cache_usable() {
        let store = Arc::new(MemoryStore::<CacheEntry>::new());
        store.set_failing(true);
        let cache = ResultCache::new(ManualClock::starting_now()).with_store(store.clone());

        cache.set("k", "v", "wf", 60, no_meta()).await;
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let clock = ManualClock::starting_now();

        let store: Arc<JsonFileStore<CacheEntry>> = Arc::new(JsonFileStore::new(&path));
        let cache = ResultCache::new(clock.clone()).with_store(store.clone());
        cache.set("k", "v", "wf", 60, no_meta()).await;

        let reopened: Arc<JsonFileStore<CacheEntry>> = Arc::new(JsonFileStore::new(&path));
        let restored = ResultCache::load(clock, reopened).await;
        assert_eq!(restored.get("k").await.as_deref(), Some("v"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_never_see_partial_values() {
        let cache = ResultCache::new(ManualClock::starting_now()).shared();
        let values: Vec<String> = (0..8).map(|i| i.to_string().repeat(4_096)).collect();
        cache.set("k", values[0].clone(), "wf", 60, no_meta()).await;

        let mut handles = Vec::new();
        for value in values.iter().cloned() {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    cache.set("k", value.clone(), "wf", 60, HashMap::new()).await;
                }
            }));
        }
        for _ in 0..4 {
            let cache = cache.clone();
            let values = values.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..200 {
                    let got = cache.get("k").await.unwrap();
                    assert!(values.contains(&got));
                }
            }));
        }
        for result in futures::future::join_all(handles).await {
            result.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_expired_until_cancelled() {
        let clock = ManualClock::starting_now();
        let cache = ResultCache::new(clock.clone()).shared();
        cache.set("k", "v", "wf", 1, no_meta()).await;
        clock.advance_ms(5_000);

        let cancel = CancellationToken::new();
        let handle = cache.spawn_sweeper(Duration::from_secs(10), cancel.clone());
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(cache.len().await, 0);

        cancel.cancel();
        handle.await.unwrap();
    }
}
