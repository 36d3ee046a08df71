//! Adaptive Cache
//!
//! TTL + size-bounded cache shared by every pipeline stage. Keys are SHA256
//! digests of normalized request fields, so identical requests deduplicate.
//!
//! - A read past expiry is a miss and removes the entry
//! - When the approximate total size exceeds the budget, the least recently
//!   accessed 20% of entries are evicted regardless of TTL
//! - An optional [`CacheBackend`] extends the cache beyond process memory
//!   (write-through, read-through on local miss). Backend failures are logged
//!   and treated as misses.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::CacheBackend;
use crate::config::CacheConfig;
use crate::error::OrchestratorError;

/// Approximate in-memory footprint of a cached value
pub trait ApproxSize {
    fn approx_size(&self) -> usize;
}

/// Size of the JSON encoding, used as the footprint of serde types
pub fn json_size<T: Serialize + ?Sized>(value: &T) -> usize {
    serde_json::to_vec(value).map(|b| b.len()).unwrap_or(0)
}

impl ApproxSize for String {
    fn approx_size(&self) -> usize {
        self.len()
    }
}

impl ApproxSize for serde_json::Value {
    fn approx_size(&self) -> usize {
        json_size(self)
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub total_size_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate_percent: f64,
    pub evictions: u64,
    pub expirations: u64,
    pub backend_errors: u64,
}

/// A single cached value with its bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub created_at: Instant,
    pub ttl: Duration,
    pub access_count: u64,
    pub last_accessed_at: Instant,
    pub approx_size_bytes: usize,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.ttl
            .saturating_sub(now.saturating_duration_since(self.created_at))
    }
}

/// Envelope written to durable backends so readers can recover the remaining TTL
#[derive(Serialize, Deserialize)]
struct StoredEntry<V> {
    value: V,
    expires_at_ms: i64,
}

struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    total_size: usize,
}

impl<V> CacheInner<V> {
    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.total_size = self.total_size.saturating_sub(entry.approx_size_bytes);
        Some(entry)
    }
}

/// TTL + LRU-under-pressure cache
pub struct AdaptiveCache<V> {
    name: String,
    config: CacheConfig,
    inner: Mutex<CacheInner<V>>,
    backend: Option<Arc<dyn CacheBackend>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    backend_errors: AtomicU64,
}

impl<V> AdaptiveCache<V>
where
    V: Clone + ApproxSize + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Create a process-local cache
    pub fn new(name: &str, config: CacheConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                total_size: 0,
            }),
            backend: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            backend_errors: AtomicU64::new(0),
        }
    }

    /// Back the cache with a durable store
    pub fn with_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Compute a cache key from ordered parts
    ///
    /// Key = SHA256(part_0 | part_1 | ...)
    pub fn compute_key(parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update(b"|");
        }
        hex::encode(hasher.finalize())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl()
    }

    /// Get a cached value. Expired entries count as misses and are removed.
    pub async fn get(&self, key: &str) -> Option<V> {
        if !self.config.enabled {
            return None;
        }

        let now = Instant::now();
        {
            let mut inner = self.inner.lock();
            let expired = match inner.entries.get_mut(key) {
                Some(entry) if !entry.is_expired(now) => {
                    entry.access_count += 1;
                    entry.last_accessed_at = now;
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    debug!("Cache HIT [{}]: {}", self.name, short(key));
                    return Some(entry.value.clone());
                }
                Some(_) => true,
                None => false,
            };
            if expired {
                inner.remove(key);
                self.expirations.fetch_add(1, Ordering::Relaxed);
            }
        }

        if let Some(value) = self.read_backend(key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Cache HIT (backend) [{}]: {}", self.name, short(key));
            return Some(value);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!("Cache MISS [{}]: {}", self.name, short(key));
        None
    }

    /// Store a value with an explicit TTL
    pub async fn set(&self, key: &str, value: V, ttl: Duration) {
        if !self.config.enabled {
            return;
        }

        let size = value.approx_size();
        self.set_with_size(key, value, size, ttl).await;
    }

    /// Store a value whose size the caller already knows
    pub async fn set_with_size(&self, key: &str, value: V, size: usize, ttl: Duration) {
        if !self.config.enabled {
            return;
        }

        let stored = self.insert_local(key, value.clone(), size, ttl, Instant::now());
        if stored {
            self.write_backend(key, &value, ttl).await;
        }
        debug!("Cache SET [{}]: {} (ttl {:?})", self.name, short(key), ttl);
    }

    /// Store a value with the configured default TTL
    pub async fn set_default(&self, key: &str, value: V) {
        let ttl = self.default_ttl();
        self.set(key, value, ttl).await;
    }

    /// Invalidate an entry locally and in the backend
    pub async fn remove(&self, key: &str) -> bool {
        let removed = self.inner.lock().remove(key).is_some();
        if let Some(backend) = &self.backend {
            if let Err(e) = backend.delete(&self.backend_key(key)).await {
                self.backend_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Cache backend '{}' delete failed: {}", backend.name(), e);
            }
        }
        removed
    }

    /// Drop every expired entry, returning how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .entries
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        if !expired.is_empty() {
            self.expirations
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            debug!("Cache sweep [{}]: {} expired", self.name, expired.len());
        }
        expired.len()
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until cancelled
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let interval = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.sweep();
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Cache sweeper [{}] stopped", cache.name);
                        break;
                    }
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_size(&self) -> usize {
        self.inner.lock().total_size
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let (entries, total_size_bytes) = {
            let inner = self.inner.lock();
            (inner.entries.len(), inner.total_size)
        };

        CacheStats {
            entries,
            total_size_bytes,
            hits,
            misses,
            hit_rate_percent: if total > 0 {
                (hits as f64 / total as f64) * 100.0
            } else {
                0.0
            },
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
        }
    }

    /// Clear all entries and counters (local only)
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.total_size = 0;
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    fn insert_local(&self, key: &str, value: V, size: usize, ttl: Duration, now: Instant) -> bool {
        if size > self.config.max_size_bytes {
            debug!(
                "Cache [{}] skipping {}: {} bytes exceeds budget",
                self.name,
                short(key),
                size
            );
            return false;
        }

        let mut inner = self.inner.lock();
        inner.remove(key);
        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                value,
                created_at: now,
                ttl,
                access_count: 0,
                last_accessed_at: now,
                approx_size_bytes: size,
            },
        );
        inner.total_size += size;

        while inner.total_size > self.config.max_size_bytes
            || inner.entries.len() > self.config.max_entries
        {
            let evicted = self.evict_batch(&mut inner);
            if evicted == 0 {
                break;
            }
        }
        true
    }

    /// Evict the least recently accessed fraction of entries (at least one)
    fn evict_batch(&self, inner: &mut CacheInner<V>) -> usize {
        let mut by_access: Vec<(Instant, String)> = inner
            .entries
            .values()
            .map(|e| (e.last_accessed_at, e.key.clone()))
            .collect();
        by_access.sort_by(|a, b| a.0.cmp(&b.0));

        let batch = ((by_access.len() as f64 * self.config.eviction_fraction).ceil() as usize)
            .max(1)
            .min(by_access.len());
        for (_, key) in by_access.into_iter().take(batch) {
            inner.remove(&key);
        }

        self.evictions.fetch_add(batch as u64, Ordering::Relaxed);
        debug!("Cache [{}] evicted {} entries under size pressure", self.name, batch);
        batch
    }

    fn backend_key(&self, key: &str) -> String {
        format!("{}:{}", self.name, key)
    }

    async fn read_backend(&self, key: &str) -> Option<V> {
        let backend = self.backend.as_ref()?;
        let raw = match backend.read(&self.backend_key(key)).await {
            Ok(raw) => raw?,
            Err(e) => {
                self.backend_errors.fetch_add(1, Ordering::Relaxed);
                let err = OrchestratorError::CacheBackendUnavailable(e.to_string());
                warn!("{} (backend '{}'), treating as miss", err, backend.name());
                return None;
            }
        };

        let stored: StoredEntry<V> = match serde_json::from_str(&raw) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Cache backend '{}' returned undecodable entry: {}", backend.name(), e);
                return None;
            }
        };

        let remaining_ms = stored.expires_at_ms - chrono::Utc::now().timestamp_millis();
        if remaining_ms <= 0 {
            return None;
        }

        let ttl = Duration::from_millis(remaining_ms as u64);
        let size = stored.value.approx_size();
        self.insert_local(key, stored.value.clone(), size, ttl, Instant::now());
        Some(stored.value)
    }

    async fn write_backend(&self, key: &str, value: &V, ttl: Duration) {
        let Some(backend) = &self.backend else {
            return;
        };

        let stored = StoredEntry {
            value,
            expires_at_ms: chrono::Utc::now().timestamp_millis() + ttl.as_millis() as i64,
        };
        let raw = match serde_json::to_string(&stored) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Cache [{}] could not encode entry: {}", self.name, e);
                return;
            }
        };

        if let Err(e) = backend.write(&self.backend_key(key), &raw, ttl).await {
            self.backend_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                "{} (backend '{}'), entry kept in memory only",
                OrchestratorError::CacheBackendUnavailable(e.to_string()),
                backend.name()
            );
        }
    }

    /// Snapshot of an entry's bookkeeping (tests and diagnostics)
    pub fn entry_info(&self, key: &str) -> Option<(u64, Duration)> {
        let now = Instant::now();
        let inner = self.inner.lock();
        inner
            .entries
            .get(key)
            .map(|e| (e.access_count, e.remaining(now)))
    }
}

fn short(key: &str) -> &str {
    match key.char_indices().nth(16) {
        Some((end, _)) => &key[..end],
        None => key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, MemoryBackend};
    use async_trait::async_trait;

    fn config(max_size_bytes: usize) -> CacheConfig {
        CacheConfig {
            max_size_bytes,
            ..Default::default()
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl CacheBackend for FailingBackend {
        fn name(&self) -> &str {
            "failing"
        }

        async fn read(&self, _key: &str) -> Result<Option<String>, BackendError> {
            Err(BackendError::Unavailable("connection refused".to_string()))
        }

        async fn write(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), BackendError> {
            Err(BackendError::Unavailable("connection refused".to_string()))
        }

        async fn delete(&self, _key: &str) -> Result<(), BackendError> {
            Err(BackendError::Unavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_cache_hit_miss() {
        let cache: AdaptiveCache<String> = AdaptiveCache::new("test", config(1024));
        let key = AdaptiveCache::<String>::compute_key(&["flight_search", "tokyo"]);

        assert!(cache.get(&key).await.is_none());

        cache
            .set(&key, "response".to_string(), Duration::from_secs(60))
            .await;

        assert_eq!(cache.get(&key).await.as_deref(), Some("response"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate_percent, 50.0);
        assert_eq!(cache.entry_info(&key).map(|(count, _)| count), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache: AdaptiveCache<String> = AdaptiveCache::new("ttl", config(1024));

        cache.set("k", "v".to_string(), Duration::from_secs(5)).await;
        tokio::time::advance(Duration::from_millis(4_999)).await;
        assert!(cache.get("k").await.is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cache.get("k").await.is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_expired() {
        let cache: AdaptiveCache<String> = AdaptiveCache::new("sweep", config(1024));

        cache.set("short", "a".to_string(), Duration::from_secs(1)).await;
        cache.set("long", "b".to_string(), Duration::from_secs(60)).await;
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_size(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_removes_least_recently_accessed() {
        // 10 entries of 10 bytes fill the budget exactly
        let cache: AdaptiveCache<String> = AdaptiveCache::new("lru", config(100));
        for i in 0..10 {
            cache
                .set(&format!("k{}", i), "x".repeat(10), Duration::from_secs(600))
                .await;
            tokio::time::advance(Duration::from_millis(10)).await;
        }

        // Touch the two oldest so they become the most recent
        cache.get("k0").await;
        cache.get("k1").await;

        cache.set("k10", "x".repeat(10), Duration::from_secs(600)).await;

        // 11 entries * 20% = 3 evicted: k2, k3, k4
        assert!(cache.total_size() <= 100);
        assert!(cache.get("k0").await.is_some());
        assert!(cache.get("k1").await.is_some());
        assert!(cache.get("k2").await.is_none());
        assert!(cache.get("k3").await.is_none());
        assert!(cache.get("k4").await.is_none());
        assert!(cache.get("k5").await.is_some());
        assert!(cache.get("k10").await.is_some());
        assert_eq!(cache.stats().evictions, 3);
    }

    #[tokio::test]
    async fn test_oversized_value_not_stored() {
        let cache: AdaptiveCache<String> = AdaptiveCache::new("big", config(8));
        cache.set("k", "x".repeat(9), Duration::from_secs(60)).await;
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_updates_size() {
        let cache: AdaptiveCache<String> = AdaptiveCache::new("overwrite", config(1024));
        cache.set("k", "x".repeat(10), Duration::from_secs(60)).await;
        cache.set("k", "x".repeat(4), Duration::from_secs(60)).await;
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_size(), 4);
    }

    #[tokio::test]
    async fn test_set_with_size_counts_declared_size() {
        let cache: AdaptiveCache<String> = AdaptiveCache::new("sized", config(100));
        cache.set_with_size("a", "x".into(), 60, Duration::from_secs(60)).await;
        assert_eq!(cache.total_size(), 60);

        // Second insert pushes the total over budget
        cache.set_with_size("b", "y".into(), 60, Duration::from_secs(60)).await;
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_size(), 60);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_backend_failure_is_a_miss() {
        let cache: AdaptiveCache<String> =
            AdaptiveCache::new("flaky", config(1024)).with_backend(Arc::new(FailingBackend));

        cache.set("k", "v".to_string(), Duration::from_secs(60)).await;
        // Local copy still served
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));

        assert!(cache.get("other").await.is_none());
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.backend_errors, 2);
    }

    #[tokio::test]
    async fn test_backend_read_through() {
        let backend = Arc::new(MemoryBackend::new());
        let writer: AdaptiveCache<String> =
            AdaptiveCache::new("shared", config(1024)).with_backend(backend.clone());
        writer.set("k", "from-writer".to_string(), Duration::from_secs(60)).await;

        // A second process-local cache over the same backend
        let reader: AdaptiveCache<String> =
            AdaptiveCache::new("shared", config(1024)).with_backend(backend);
        assert_eq!(reader.get("k").await.as_deref(), Some("from-writer"));
        assert_eq!(reader.len(), 1);
    }

    #[test]
    fn test_key_consistency() {
        let key1 = AdaptiveCache::<String>::compute_key(&["hello", "sys"]);
        let key2 = AdaptiveCache::<String>::compute_key(&["hello", "sys"]);
        let key3 = AdaptiveCache::<String>::compute_key(&["hellos", "ys"]);

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
    }

    #[tokio::test]
    async fn test_multibyte_keys() {
        assert_eq!(short("טיסה-לפריז-בחודש-מרץ"), "טיסה-לפריז-בחודש");
        assert_eq!(short("abc"), "abc");

        let cache: AdaptiveCache<String> = AdaptiveCache::new("raw", config(1024));
        cache.set("מלון בתל אביב ליד הים", "v".into(), Duration::from_secs(60)).await;
        assert_eq!(cache.get("מלון בתל אביב ליד הים").await.as_deref(), Some("v"));
    }
}
