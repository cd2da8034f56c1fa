//! In-memory TTL cache with optional storage mirror.
//!
//! Entries expire lazily: nothing runs in the background, an expired entry is
//! dropped the next time it is read. When the cache is full, inserting a new
//! key evicts the entry that was inserted longest ago (reads do not refresh
//! an entry's position).

use crate::storage::Storage;
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::OnceCell;
use tokio::time::Instant;

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries kept in memory. `0` means unbounded.
    pub max_size: usize,
    /// TTL used when `set` is called without one.
    pub default_ttl: Duration,
    /// Prefix for keys written to the storage mirror.
    pub storage_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            default_ttl: Duration::from_secs(300),
            storage_prefix: "querykit:".to_string(),
        }
    }
}

/// Cache counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Reads that found a live entry.
    pub hits: u64,
    /// Reads that found nothing (or an expired entry).
    pub misses: u64,
    /// Entries currently held in memory.
    pub size: usize,
    /// `hits / (hits + misses)`, `0.0` before the first read.
    pub hit_rate: f64,
    /// Entries removed to make room.
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed.
    pub expirations: u64,
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
    order: u64,
}

impl<V> Entry<V> {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) < self.ttl
    }
}

#[derive(Debug)]
struct Entries<V> {
    map: HashMap<String, Entry<V>>,
    next_order: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    value: Value,
    /// Unix time in milliseconds.
    expires_at: u64,
}

struct Mirror<V> {
    storage: Arc<dyn Storage>,
    encode: fn(&V) -> serde_json::Result<Value>,
    decode: fn(Value) -> serde_json::Result<V>,
}

fn encode<V: Serialize>(value: &V) -> serde_json::Result<Value> {
    serde_json::to_value(value)
}

fn decode<V: DeserializeOwned>(value: Value) -> serde_json::Result<V> {
    serde_json::from_value(value)
}

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}

struct CacheInner<V> {
    config: CacheConfig,
    entries: Mutex<Entries<V>>,
    pending: Mutex<HashMap<String, Arc<OnceCell<V>>>>,
    counters: Counters,
    mirror: Option<Mirror<V>>,
}

/// A TTL cache keyed by strings.
///
/// Cloning shares the cache.
///
/// # Examples
///
/// ```
/// use querykit::{CacheConfig, CacheManager};
/// use std::time::Duration;
///
/// # async fn example() -> querykit::Result<()> {
/// let cache: CacheManager<u64> = CacheManager::new(CacheConfig::default());
///
/// cache.set("answer", 42, Some(Duration::from_secs(60)));
/// assert_eq!(cache.get("answer"), Some(42));
///
/// let computed = cache
///     .get_or_compute("expensive", || async { Ok(7) }, None)
///     .await?;
/// assert_eq!(computed, 7);
///
/// let stats = cache.stats();
/// assert_eq!(stats.size, 2);
/// # Ok(())
/// # }
/// ```
pub struct CacheManager<V> {
    inner: Arc<CacheInner<V>>,
}

impl<V> Clone for CacheManager<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> CacheManager<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates an in-memory cache.
    pub fn new(config: CacheConfig) -> Self {
        Self::build(config, None)
    }

    fn build(config: CacheConfig, mirror: Option<Mirror<V>>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                config,
                entries: Mutex::new(Entries {
                    map: HashMap::new(),
                    next_order: 0,
                }),
                pending: Mutex::new(HashMap::new()),
                counters: Counters::default(),
                mirror,
            }),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Returns the live value for `key`, counting a hit or a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        match self.lookup(key) {
            Some(value) => {
                self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(key = key, "Cache hit");
                Some(value)
            }
            None => {
                self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(key = key, "Cache miss");
                None
            }
        }
    }

    /// Returns `true` if `key` holds a live value. Does not touch the counters.
    pub fn has(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    /// Stores `value` under `key` for `ttl` (or the default TTL).
    ///
    /// Returns the key evicted to make room, if the cache was full.
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> Option<String> {
        let ttl = ttl.unwrap_or(self.inner.config.default_ttl);
        self.persist(key, &value, ttl);
        let evicted = self.insert_memory(key, value, ttl);
        if let Some(evicted) = &evicted {
            self.unpersist(evicted);
        }
        evicted
    }

    /// Removes `key`. Returns `true` if something was removed.
    pub fn delete(&self, key: &str) -> bool {
        let removed = self.inner.entries.lock().map.remove(key).is_some();
        let persisted = self.unpersist(key);
        removed || persisted
    }

    /// Removes every entry, including this cache's keys in the storage mirror.
    pub fn clear(&self) {
        self.inner.entries.lock().map.clear();

        if let Some(mirror) = &self.inner.mirror {
            let prefix = &self.inner.config.storage_prefix;
            let keys: Vec<String> = (0..mirror.storage.len())
                .filter_map(|i| mirror.storage.key(i))
                .filter(|k| k.starts_with(prefix.as_str()))
                .collect();
            for key in keys {
                mirror.storage.remove_item(&key);
            }
        }
        tracing::debug!("Cache cleared");
    }

    /// Keys of live in-memory entries.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.inner
            .entries
            .lock()
            .map
            .iter()
            .filter(|(_, entry)| entry.is_fresh(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Drops every expired in-memory entry and returns how many were dropped.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = {
            let mut entries = self.inner.entries.lock();
            let expired: Vec<String> = entries
                .map
                .iter()
                .filter(|(_, entry)| !entry.is_fresh(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                entries.map.remove(key);
            }
            expired
        };

        self.inner
            .counters
            .expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        for key in &expired {
            self.unpersist(key);
        }
        expired.len()
    }

    /// Returns the cached value, or runs `compute` and caches its result.
    ///
    /// Concurrent callers for the same missing key share a single run of
    /// `compute`. Errors are not cached.
    pub async fn get_or_compute<F, Fut>(&self, key: &str, compute: F, ttl: Option<Duration>) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let cell = Arc::clone(
            self.inner
                .pending
                .lock()
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new())),
        );

        let result = cell
            .get_or_try_init(|| async {
                // A computation that finished between our miss and taking the
                // cell has already populated the cache.
                if let Some(value) = self.lookup(key) {
                    return Ok(value);
                }
                tracing::debug!(key = key, "Computing cache entry");
                let value = compute().await?;
                self.set(key, value.clone(), ttl);
                Ok::<V, Error>(value)
            })
            .await
            .cloned();

        let mut pending = self.inner.pending.lock();
        if pending.get(key).is_some_and(|current| Arc::ptr_eq(current, &cell)) {
            pending.remove(key);
        }

        result
    }

    /// Returns hit/miss counters and the current size.
    pub fn stats(&self) -> CacheStats {
        let hits = self.inner.counters.hits.load(Ordering::Relaxed);
        let misses = self.inner.counters.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            size: self.inner.entries.lock().map.len(),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            evictions: self.inner.counters.evictions.load(Ordering::Relaxed),
            expirations: self.inner.counters.expirations.load(Ordering::Relaxed),
        }
    }

    fn lookup(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        {
            let mut entries = self.inner.entries.lock();
            if let Some(entry) = entries.map.get(key) {
                if entry.is_fresh(now) {
                    return Some(entry.value.clone());
                }
                entries.map.remove(key);
                drop(entries);
                self.inner.counters.expirations.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(key = key, "Cache entry expired");
                self.unpersist(key);
                return None;
            }
        }
        self.hydrate(key)
    }

    /// Inserts into memory, returning the key evicted to make room.
    fn insert_memory(&self, key: &str, value: V, ttl: Duration) -> Option<String> {
        let max_size = self.inner.config.max_size;
        let mut entries = self.inner.entries.lock();

        let mut evicted = None;
        if max_size > 0 && !entries.map.contains_key(key) && entries.map.len() >= max_size {
            let oldest = entries
                .map
                .iter()
                .min_by_key(|(_, entry)| entry.order)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                entries.map.remove(&oldest);
                self.inner.counters.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %oldest, "Evicted oldest cache entry");
                evicted = Some(oldest);
            }
        }

        let order = entries.next_order;
        entries.next_order += 1;
        entries.map.insert(
            key.to_string(),
            Entry {
                value,
                inserted_at: Instant::now(),
                ttl,
                order,
            },
        );
        evicted
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.inner.config.storage_prefix, key)
    }

    fn persist(&self, key: &str, value: &V, ttl: Duration) {
        let Some(mirror) = &self.inner.mirror else {
            return;
        };

        let expires_at = SystemTime::now()
            .checked_add(ttl)
            .map(unix_millis)
            .unwrap_or(u64::MAX);
        let record = (mirror.encode)(value)
            .and_then(|value| serde_json::to_string(&PersistedEntry { value, expires_at }));

        match record {
            Ok(record) => {
                if let Err(e) = mirror.storage.set_item(&self.storage_key(key), &record) {
                    tracing::warn!(key = key, error = %e, "Failed to mirror cache entry");
                }
            }
            Err(e) => tracing::warn!(key = key, error = %e, "Failed to encode cache entry"),
        }
    }

    fn unpersist(&self, key: &str) -> bool {
        let Some(mirror) = &self.inner.mirror else {
            return false;
        };
        let storage_key = self.storage_key(key);
        let existed = mirror.storage.get_item(&storage_key).is_some();
        mirror.storage.remove_item(&storage_key);
        existed
    }

    /// Loads a live entry from the storage mirror back into memory.
    fn hydrate(&self, key: &str) -> Option<V> {
        let mirror = self.inner.mirror.as_ref()?;
        let storage_key = self.storage_key(key);
        let raw = mirror.storage.get_item(&storage_key)?;

        let record: PersistedEntry = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(key = key, error = %e, "Dropping unreadable cache entry");
                mirror.storage.remove_item(&storage_key);
                return None;
            }
        };

        let now = unix_millis(SystemTime::now());
        if record.expires_at <= now {
            mirror.storage.remove_item(&storage_key);
            self.inner.counters.expirations.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let value = match (mirror.decode)(record.value) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key = key, error = %e, "Dropping undecodable cache entry");
                mirror.storage.remove_item(&storage_key);
                return None;
            }
        };

        let ttl = if record.expires_at == u64::MAX {
            Duration::MAX
        } else {
            Duration::from_millis(record.expires_at - now)
        };
        if let Some(evicted) = self.insert_memory(key, value.clone(), ttl) {
            self.unpersist(&evicted);
        }
        tracing::trace!(key = key, "Hydrated cache entry from storage");
        Some(value)
    }
}

impl<V> CacheManager<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Creates a cache that mirrors every entry into `storage`.
    ///
    /// On a memory miss, a live mirrored entry is loaded back into memory.
    pub fn with_storage(config: CacheConfig, storage: Arc<dyn Storage>) -> Self {
        Self::build(
            config,
            Some(Mirror {
                storage,
                encode: encode::<V>,
                decode: decode::<V>,
            }),
        )
    }
}

impl<V> std::fmt::Debug for CacheManager<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("config", &self.inner.config)
            .field("size", &self.inner.entries.lock().map.len())
            .field("mirrored", &self.inner.mirror.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::sync::atomic::AtomicUsize;

    fn cache(max_size: usize) -> CacheManager<String> {
        CacheManager::new(CacheConfig {
            max_size,
            default_ttl: Duration::from_secs(60),
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_reads_as_absent() {
        let cache = cache(10);
        cache.set("k", "v".to_string(), Some(Duration::from_secs(5)));
        assert_eq!(cache.get("k").as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.get("k"), None);
        assert!(!cache.has("k"));

        let stats = cache.stats();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicts_oldest_insert_not_least_recently_read() {
        let cache = cache(2);
        cache.set("a", "1".into(), None);
        cache.set("b", "2".into(), None);
        // Reading "a" does not protect it.
        assert!(cache.get("a").is_some());
        assert_eq!(cache.set("c", "3".into(), None).as_deref(), Some("a"));

        assert_eq!(cache.get("a"), None);
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_does_not_evict() {
        let cache = cache(2);
        cache.set("a", "1".into(), None);
        cache.set("b", "2".into(), None);
        assert_eq!(cache.set("a", "3".into(), None), None);
        assert_eq!(cache.stats().size, 2);
        assert_eq!(cache.get("a").as_deref(), Some("3"));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_hit_rate() {
        let cache = cache(10);
        cache.set("a", "1".into(), None);
        cache.get("a");
        cache.get("a");
        cache.get("a");
        cache.get("missing");

        let stats = cache.stats();
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
        assert!((stats.hit_rate - 0.75).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_and_clear() {
        let cache = cache(10);
        cache.set("a", "1".into(), None);
        cache.set("b", "2".into(), None);
        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        cache.clear();
        assert_eq!(cache.stats().size, 0);
        assert!(cache.keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_expired() {
        let cache = cache(10);
        cache.set("short", "1".into(), Some(Duration::from_secs(1)));
        cache.set("long", "2".into(), Some(Duration::from_secs(100)));
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(cache.prune_expired(), 1);
        assert_eq!(cache.keys(), vec!["long".to_string()]);
    }

    #[tokio::test]
    async fn test_get_or_compute_runs_once_for_concurrent_callers() {
        let cache = cache(10);
        let calls = Arc::new(AtomicUsize::new(0));

        let lookups = (0..8).map(|_| {
            let cache = cache.clone();
            let calls = calls.clone();
            async move {
                cache
                    .get_or_compute(
                        "shared",
                        || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok("computed".to_string())
                        },
                        None,
                    )
                    .await
            }
        });

        let results = futures::future::join_all(lookups).await;
        assert!(results.iter().all(|r| r.as_deref().ok() == Some("computed")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get("shared").as_deref(), Some("computed"));
    }

    #[tokio::test]
    async fn test_get_or_compute_does_not_cache_errors() {
        let cache = cache(10);
        let result = cache
            .get_or_compute("k", || async { Err(Error::Storage("boom".into())) }, None)
            .await;
        assert!(result.is_err());
        assert!(!cache.has("k"));

        let value = cache
            .get_or_compute("k", || async { Ok("ok".to_string()) }, None)
            .await
            .unwrap();
        assert_eq!(value, "ok");
    }

    #[tokio::test]
    async fn test_storage_mirror_hydrates_new_instance() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let first: CacheManager<Vec<u32>> =
            CacheManager::with_storage(CacheConfig::default(), storage.clone());
        first.set("ids", vec![1, 2, 3], None);
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.key(0).as_deref(), Some("querykit:ids"));

        let second: CacheManager<Vec<u32>> =
            CacheManager::with_storage(CacheConfig::default(), storage.clone());
        assert_eq!(second.get("ids"), Some(vec![1, 2, 3]));
        assert_eq!(second.stats().size, 1);
    }

    #[tokio::test]
    async fn test_storage_mirror_drops_expired_records() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        storage
            .set_item("querykit:old", r#"{"value":"stale","expires_at":1}"#)
            .unwrap();

        let cache: CacheManager<String> =
            CacheManager::with_storage(CacheConfig::default(), storage.clone());
        assert_eq!(cache.get("old"), None);
        assert!(storage.get_item("querykit:old").is_none());
    }

    #[tokio::test]
    async fn test_clear_only_removes_prefixed_storage_keys() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        storage.set_item("unrelated", "keep me").unwrap();

        let cache: CacheManager<String> =
            CacheManager::with_storage(CacheConfig::default(), storage.clone());
        cache.set("a", "1".into(), None);
        cache.set("b", "2".into(), None);
        cache.clear();

        assert_eq!(storage.len(), 1);
        assert_eq!(storage.get_item("unrelated").as_deref(), Some("keep me"));
    }
}
