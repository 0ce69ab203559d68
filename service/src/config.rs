use std::path::PathBuf;

use serde::Serialize;

const DEFAULT_SNAPSHOT_BUFFER: usize = 1_024;
const DEFAULT_SNAPSHOT_BATCH_SIZE: usize = 64;
const DEFAULT_SNAPSHOT_LINGER_MS: u64 = 20;
const DEFAULT_SNAPSHOT_RETRY_LIMIT: usize = 5;
const DEFAULT_INVALIDATION_BUFFER: usize = 1_024;
const DEFAULT_CACHE_REDIS_PREFIX: &str = "tally:stats:";
const DEFAULT_CACHE_TTL_SECONDS: u64 = 300;
const DEFAULT_RECONCILE_INTERVAL_SECONDS: u64 = 300;
const DEFAULT_ITEMS_PER_PAGE: u64 = 50;
const DEFAULT_HTTP_RATE_LIMIT_PER_SECOND: u64 = 1_000;
const DEFAULT_HTTP_RATE_LIMIT_BURST: u32 = 5_000;
const DEFAULT_MUTATE_RATE_LIMIT_PER_MINUTE: u64 = 600;
const DEFAULT_MUTATE_RATE_LIMIT_BURST: u32 = 50;
const DEFAULT_HTTP_BODY_LIMIT_BYTES: usize = 64 * 1024;

/// Service configuration. Every limit is optional; accessors fall back to the
/// defaults above, and the rate-limit env overrides are applied at router
/// construction.
#[derive(Clone, Debug, Serialize)]
pub struct ServiceConfig {
    /// Counter store path. None keeps the store in memory (tests, demos).
    pub db_path: Option<PathBuf>,
    /// Analytics store path. None disables snapshots and history queries.
    pub snapshots_path: Option<PathBuf>,
    pub snapshot_buffer: Option<usize>,
    pub snapshot_batch_size: Option<usize>,
    pub snapshot_linger_ms: Option<u64>,
    pub snapshot_retry_limit: Option<usize>,
    /// Retention window for snapshots; None keeps them forever.
    pub snapshot_retention_days: Option<u64>,
    pub invalidation_buffer: Option<usize>,
    pub cache_redis_url: Option<String>,
    pub cache_redis_prefix: Option<String>,
    pub cache_ttl_seconds: Option<u64>,
    /// Sliding TTL refreshes the deadline on every hit.
    pub cache_sliding: Option<bool>,
    /// 0 disables the periodic global-counter reconciliation.
    pub reconcile_interval_seconds: Option<u64>,
    pub items_per_page: Option<u64>,
    pub http_rate_limit_per_second: Option<u64>,
    pub http_rate_limit_burst: Option<u32>,
    pub mutate_rate_limit_per_minute: Option<u64>,
    pub mutate_rate_limit_burst: Option<u32>,
    pub http_body_limit_bytes: Option<usize>,
    pub webhook_url: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            snapshots_path: None,
            snapshot_buffer: Some(DEFAULT_SNAPSHOT_BUFFER),
            snapshot_batch_size: Some(DEFAULT_SNAPSHOT_BATCH_SIZE),
            snapshot_linger_ms: Some(DEFAULT_SNAPSHOT_LINGER_MS),
            snapshot_retry_limit: Some(DEFAULT_SNAPSHOT_RETRY_LIMIT),
            snapshot_retention_days: None,
            invalidation_buffer: Some(DEFAULT_INVALIDATION_BUFFER),
            cache_redis_url: None,
            cache_redis_prefix: Some(DEFAULT_CACHE_REDIS_PREFIX.to_string()),
            cache_ttl_seconds: Some(DEFAULT_CACHE_TTL_SECONDS),
            cache_sliding: Some(true),
            reconcile_interval_seconds: Some(DEFAULT_RECONCILE_INTERVAL_SECONDS),
            items_per_page: Some(DEFAULT_ITEMS_PER_PAGE),
            http_rate_limit_per_second: Some(DEFAULT_HTTP_RATE_LIMIT_PER_SECOND),
            http_rate_limit_burst: Some(DEFAULT_HTTP_RATE_LIMIT_BURST),
            mutate_rate_limit_per_minute: Some(DEFAULT_MUTATE_RATE_LIMIT_PER_MINUTE),
            mutate_rate_limit_burst: Some(DEFAULT_MUTATE_RATE_LIMIT_BURST),
            http_body_limit_bytes: Some(DEFAULT_HTTP_BODY_LIMIT_BYTES),
            webhook_url: None,
        }
    }
}

impl ServiceConfig {
    pub fn snapshot_buffer_capacity(&self) -> usize {
        self.snapshot_buffer.unwrap_or(DEFAULT_SNAPSHOT_BUFFER).max(1)
    }

    pub fn snapshot_batch_size(&self) -> usize {
        self.snapshot_batch_size
            .unwrap_or(DEFAULT_SNAPSHOT_BATCH_SIZE)
            .max(1)
    }

    pub fn snapshot_linger(&self) -> std::time::Duration {
        std::time::Duration::from_millis(
            self.snapshot_linger_ms.unwrap_or(DEFAULT_SNAPSHOT_LINGER_MS),
        )
    }

    pub fn snapshot_retry_limit(&self) -> usize {
        self.snapshot_retry_limit
            .unwrap_or(DEFAULT_SNAPSHOT_RETRY_LIMIT)
    }

    pub fn invalidation_buffer_capacity(&self) -> usize {
        self.invalidation_buffer
            .unwrap_or(DEFAULT_INVALIDATION_BUFFER)
            .max(1)
    }

    pub fn cache_prefix(&self) -> String {
        self.cache_redis_prefix
            .clone()
            .unwrap_or_else(|| DEFAULT_CACHE_REDIS_PREFIX.to_string())
    }

    pub fn cache_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            self.cache_ttl_seconds.unwrap_or(DEFAULT_CACHE_TTL_SECONDS).max(1),
        )
    }

    pub fn cache_sliding(&self) -> bool {
        self.cache_sliding.unwrap_or(true)
    }

    pub fn reconcile_interval(&self) -> Option<std::time::Duration> {
        let seconds = self
            .reconcile_interval_seconds
            .unwrap_or(DEFAULT_RECONCILE_INTERVAL_SECONDS);
        (seconds > 0).then(|| std::time::Duration::from_secs(seconds))
    }

    pub fn items_per_page(&self) -> u64 {
        self.items_per_page.unwrap_or(DEFAULT_ITEMS_PER_PAGE).max(1)
    }
}
