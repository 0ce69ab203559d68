//! Read-through cache with deferred invalidation.
//!
//! The write path never waits on the cache backend: invalidation jobs are
//! enqueued with `try_send` and applied out-of-band by a worker task, so a
//! stale read stays possible for a bounded window after a write. Entry TTLs
//! cap that window even if an invalidation job is lost.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};

use crate::CacheMetrics;

pub fn player_stat_key(player_id: &str, internal_name: &str) -> String {
    format!("player-stat:{player_id}:{internal_name}")
}

pub fn player_stats_key(player_id: &str) -> String {
    format!("player-stats:{player_id}")
}

pub fn global_stat_key(stat_id: i64) -> String {
    format!("global-stat:{stat_id}")
}

struct MemoryEntry {
    value: Vec<u8>,
    /// None = never expires (counter keys).
    deadline: Option<Instant>,
}

#[derive(Default)]
pub struct MemoryCache {
    entries: std::sync::Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryCache {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemoryEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("memory cache lock poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }

    fn get(&self, key: &str, refresh: Option<Duration>) -> Option<Vec<u8>> {
        let now = Instant::now();
        let mut entries = self.lock();
        let expired = entries
            .get(key)
            .is_some_and(|entry| entry.deadline.is_some_and(|deadline| deadline <= now));
        if expired {
            entries.remove(key);
            return None;
        }
        let entry = entries.get_mut(key)?;
        if let Some(ttl) = refresh {
            entry.deadline = Some(now + ttl);
        }
        Some(entry.value.clone())
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) {
        let now = Instant::now();
        let mut entries = self.lock();
        entries.retain(|_, entry| entry.deadline.is_none_or(|deadline| deadline > now));
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_vec(),
                deadline: ttl.map(|ttl| now + ttl),
            },
        );
    }

    fn delete(&self, key: &str) {
        self.lock().remove(key);
    }

    fn delete_prefix(&self, prefix: &str) {
        self.lock().retain(|key, _| !key.starts_with(prefix));
    }

    fn add(&self, key: &str, delta: f64) -> f64 {
        let mut entries = self.lock();
        let current = entries
            .get(key)
            .and_then(|entry| std::str::from_utf8(&entry.value).ok())
            .and_then(|text| text.parse::<f64>().ok())
            .unwrap_or(0.0);
        let next = current + delta;
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: next.to_string().into_bytes(),
                deadline: None,
            },
        );
        next
    }
}

pub struct RedisCache {
    client: redis::Client,
    connection: Mutex<Option<redis::aio::ConnectionManager>>,
    prefix: String,
}

impl RedisCache {
    pub fn new(url: &str, prefix: String) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
            prefix,
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn ensure_connection(
        &self,
    ) -> Result<tokio::sync::MutexGuard<'_, Option<redis::aio::ConnectionManager>>, redis::RedisError>
    {
        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            *guard = Some(self.client.get_connection_manager().await?);
        }
        Ok(guard)
    }

    async fn get(&self, key: &str, refresh: Option<Duration>) -> Option<Vec<u8>> {
        let mut guard = match self.ensure_connection().await {
            Ok(guard) => guard,
            Err(err) => {
                tracing::warn!("redis cache connection failed: {err}");
                return None;
            }
        };
        let conn = guard.as_mut()?;
        let full_key = self.key(key);
        let value: redis::RedisResult<Option<Vec<u8>>> = conn.get(&full_key).await;
        match value {
            Ok(Some(value)) => {
                if let Some(ttl) = refresh {
                    let refreshed: redis::RedisResult<()> =
                        conn.expire(&full_key, ttl.as_secs().max(1) as i64).await;
                    if let Err(err) = refreshed {
                        tracing::warn!("redis cache expire failed: {err}");
                    }
                }
                Some(value)
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!("redis cache get failed: {err}");
                *guard = None;
                None
            }
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) {
        let mut guard = match self.ensure_connection().await {
            Ok(guard) => guard,
            Err(err) => {
                tracing::warn!("redis cache connection failed: {err}");
                return;
            }
        };
        let Some(conn) = guard.as_mut() else {
            return;
        };
        let full_key = self.key(key);
        let ttl = ttl.as_secs().max(1);
        let result: redis::RedisResult<()> = conn.set_ex(full_key, value, ttl).await;
        if let Err(err) = result {
            tracing::warn!("redis cache set failed: {err}");
            *guard = None;
        }
    }

    async fn delete(&self, key: &str) {
        let mut guard = match self.ensure_connection().await {
            Ok(guard) => guard,
            Err(err) => {
                tracing::warn!("redis cache connection failed: {err}");
                return;
            }
        };
        let Some(conn) = guard.as_mut() else {
            return;
        };
        let result: redis::RedisResult<()> = conn.del(self.key(key)).await;
        if let Err(err) = result {
            tracing::warn!("redis cache delete failed: {err}");
            *guard = None;
        }
    }

    async fn delete_prefix(&self, prefix: &str) {
        let mut guard = match self.ensure_connection().await {
            Ok(guard) => guard,
            Err(err) => {
                tracing::warn!("redis cache connection failed: {err}");
                return;
            }
        };
        let pattern = format!("{}*", self.key(prefix));
        let scanned: redis::RedisResult<Vec<String>> = {
            let Some(conn) = guard.as_mut() else {
                return;
            };
            match conn.scan_match::<_, String>(&pattern).await {
                Ok(mut scan) => {
                    let mut keys = Vec::new();
                    while let Some(key) = scan.next_item().await {
                        keys.push(key);
                    }
                    Ok(keys)
                }
                Err(err) => Err(err),
            }
        };
        let keys = match scanned {
            Ok(keys) => keys,
            Err(err) => {
                tracing::warn!("redis cache scan failed: {err}");
                *guard = None;
                return;
            }
        };
        if keys.is_empty() {
            return;
        }
        let Some(conn) = guard.as_mut() else {
            return;
        };
        let result: redis::RedisResult<()> = conn.del(keys).await;
        if let Err(err) = result {
            tracing::warn!("redis cache prefix delete failed: {err}");
            *guard = None;
        }
    }

    async fn add(&self, key: &str, delta: f64) -> Option<f64> {
        let mut guard = match self.ensure_connection().await {
            Ok(guard) => guard,
            Err(err) => {
                tracing::warn!("redis cache connection failed: {err}");
                return None;
            }
        };
        let conn = guard.as_mut()?;
        let result: redis::RedisResult<f64> = conn.incr(self.key(key), delta).await;
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!("redis cache incr failed: {err}");
                *guard = None;
                None
            }
        }
    }
}

pub enum CacheBackend {
    Memory(MemoryCache),
    Redis(RedisCache),
}

pub struct Cache {
    backend: CacheBackend,
    metrics: Arc<CacheMetrics>,
}

impl Cache {
    pub fn memory(metrics: Arc<CacheMetrics>) -> Self {
        Self {
            backend: CacheBackend::Memory(MemoryCache::default()),
            metrics,
        }
    }

    pub fn redis(
        url: &str,
        prefix: String,
        metrics: Arc<CacheMetrics>,
    ) -> Result<Self, redis::RedisError> {
        Ok(Self {
            backend: CacheBackend::Redis(RedisCache::new(url, prefix)?),
            metrics,
        })
    }

    async fn get_raw(&self, key: &str, refresh: Option<Duration>) -> Option<Vec<u8>> {
        match &self.backend {
            CacheBackend::Memory(memory) => memory.get(key, refresh),
            CacheBackend::Redis(redis) => redis.get(key, refresh).await,
        }
    }

    async fn set_raw(&self, key: &str, value: &[u8], ttl: Duration) {
        match &self.backend {
            CacheBackend::Memory(memory) => memory.set(key, value, Some(ttl)),
            CacheBackend::Redis(redis) => redis.set(key, value, ttl).await,
        }
    }

    pub async fn delete(&self, key: &str) {
        match &self.backend {
            CacheBackend::Memory(memory) => memory.delete(key),
            CacheBackend::Redis(redis) => redis.delete(key).await,
        }
    }

    pub async fn delete_prefix(&self, prefix: &str) {
        match &self.backend {
            CacheBackend::Memory(memory) => memory.delete_prefix(prefix),
            CacheBackend::Redis(redis) => redis.delete_prefix(prefix).await,
        }
    }

    /// Atomic float add, used for the fast-cache side of global counters.
    /// Counter keys never expire; the reconciliation job overwrites drift.
    pub async fn add_global(&self, key: &str, delta: f64) -> Option<f64> {
        match &self.backend {
            CacheBackend::Memory(memory) => Some(memory.add(key, delta)),
            CacheBackend::Redis(redis) => redis.add(key, delta).await,
        }
    }

    pub async fn set_global(&self, key: &str, value: f64) {
        let text = value.to_string();
        match &self.backend {
            CacheBackend::Memory(memory) => memory.set(key, text.as_bytes(), None),
            // A very long TTL rather than none keeps abandoned counters from
            // living in redis forever; reconciliation refreshes it.
            CacheBackend::Redis(redis) => {
                redis
                    .set(key, text.as_bytes(), Duration::from_secs(7 * 24 * 3600))
                    .await
            }
        }
    }

    /// Read-through fetch. `sliding` refreshes the TTL on every hit so hot
    /// keys never expire under steady traffic; otherwise the entry expires on
    /// the schedule fixed at write time.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        sliding: bool,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let refresh = sliding.then_some(ttl);
        if let Some(bytes) = self.get_raw(key, refresh).await {
            match serde_json::from_slice(&bytes) {
                Ok(value) => {
                    self.metrics.inc_hit();
                    return Ok(value);
                }
                Err(err) => {
                    tracing::warn!(key, "cached value decode failed: {err}");
                }
            }
        }
        self.metrics.inc_miss();
        let value = compute().await?;
        match serde_json::to_vec(&value) {
            Ok(bytes) => self.set_raw(key, &bytes, ttl).await,
            Err(err) => tracing::warn!(key, "cache encode failed: {err}"),
        }
        Ok(value)
    }
}

pub enum Invalidation {
    Keys(Vec<String>),
    Prefix(String),
}

/// Hands invalidation jobs to a background worker. The enqueue itself is
/// synchronous and cheap; a full queue drops the job (the entry TTL bounds
/// the resulting staleness) instead of ever blocking the write path.
pub struct Invalidator {
    sender: mpsc::Sender<Invalidation>,
    metrics: Arc<CacheMetrics>,
}

impl Invalidator {
    pub fn start(cache: Arc<Cache>, buffer: usize, metrics: Arc<CacheMetrics>) -> Self {
        let (sender, mut receiver) = mpsc::channel(buffer.max(1));
        let worker_metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            while let Some(invalidation) = receiver.recv().await {
                match invalidation {
                    Invalidation::Keys(keys) => {
                        for key in keys {
                            cache.delete(&key).await;
                        }
                    }
                    Invalidation::Prefix(prefix) => cache.delete_prefix(&prefix).await,
                }
                worker_metrics.inc_invalidations_applied();
            }
        });
        Self { sender, metrics }
    }

    pub fn defer(&self, invalidation: Invalidation) {
        match self.sender.try_send(invalidation) {
            Ok(()) => self.metrics.inc_invalidations_enqueued(),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.inc_invalidations_dropped();
                tracing::warn!("invalidation queue full; dropping job");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.inc_invalidations_dropped();
                tracing::warn!("invalidation worker gone; dropping job");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_cache() -> Arc<Cache> {
        Arc::new(Cache::memory(Arc::new(CacheMetrics::default())))
    }

    #[tokio::test]
    async fn computes_on_miss_and_serves_from_cache() {
        let cache = memory_cache();
        let ttl = Duration::from_secs(60);

        let value: Result<u64, ()> = cache
            .get_or_compute("k", ttl, false, || async { Ok(41) })
            .await;
        assert_eq!(value.unwrap(), 41);

        // A second read must not call compute again.
        let value: Result<u64, ()> = cache
            .get_or_compute("k", ttl, false, || async { panic!("cache miss") })
            .await;
        assert_eq!(value.unwrap(), 41);
    }

    #[tokio::test]
    async fn fixed_ttl_expires() {
        let cache = memory_cache();
        let ttl = Duration::from_millis(30);

        let _: Result<u64, ()> = cache
            .get_or_compute("k", ttl, false, || async { Ok(1) })
            .await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        let value: Result<u64, ()> = cache
            .get_or_compute("k", ttl, false, || async { Ok(2) })
            .await;
        assert_eq!(value.unwrap(), 2);
    }

    #[tokio::test]
    async fn sliding_ttl_survives_steady_reads() {
        let cache = memory_cache();
        let ttl = Duration::from_millis(80);

        let _: Result<u64, ()> = cache
            .get_or_compute("k", ttl, true, || async { Ok(1) })
            .await;
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            let value: Result<u64, ()> = cache
                .get_or_compute("k", ttl, true, || async { Ok(99) })
                .await;
            // Each hit refreshed the deadline, so the original value holds
            // past the original expiry.
            assert_eq!(value.unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn deferred_invalidation_applies_out_of_band() {
        let cache = memory_cache();
        let metrics = Arc::new(CacheMetrics::default());
        let invalidator = Invalidator::start(Arc::clone(&cache), 16, Arc::clone(&metrics));
        let ttl = Duration::from_secs(60);

        let _: Result<u64, ()> = cache
            .get_or_compute("player-stat:p1:gold", ttl, false, || async { Ok(10) })
            .await;
        invalidator.defer(Invalidation::Keys(vec![
            "player-stat:p1:gold".to_string(),
        ]));

        // The enqueue returns immediately; the delete lands shortly after.
        let mut observed = 0;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let value: Result<u64, ()> = cache
                .get_or_compute("player-stat:p1:gold", ttl, false, || async { Ok(20) })
                .await;
            observed = value.unwrap();
            if observed == 20 {
                break;
            }
        }
        assert_eq!(observed, 20, "invalidation never applied");
        assert_eq!(metrics.snapshot().invalidations_enqueued, 1);
        for _ in 0..50 {
            if metrics.snapshot().invalidations_applied == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("applied counter never advanced");
    }

    #[tokio::test]
    async fn prefix_invalidation_clears_list_keys() {
        let cache = memory_cache();
        let ttl = Duration::from_secs(60);
        let _: Result<u64, ()> = cache
            .get_or_compute(&player_stats_key("p1"), ttl, false, || async { Ok(1) })
            .await;
        cache.delete_prefix("player-stats:").await;
        let value: Result<u64, ()> = cache
            .get_or_compute(&player_stats_key("p1"), ttl, false, || async { Ok(2) })
            .await;
        assert_eq!(value.unwrap(), 2);
    }

    #[tokio::test]
    async fn global_counter_accumulates() {
        let cache = memory_cache();
        assert_eq!(cache.add_global("global-stat:1", 2.5).await, Some(2.5));
        assert_eq!(cache.add_global("global-stat:1", -0.5).await, Some(2.0));
        cache.set_global("global-stat:1", 10.0).await;
        assert_eq!(cache.add_global("global-stat:1", 1.0).await, Some(11.0));
    }
}
