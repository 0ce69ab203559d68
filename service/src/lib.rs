use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tally_types::{PlayerStat, Timestamp};

mod api;
pub use api::Api;

pub mod activity;
pub mod cache;
pub mod integrations;
pub mod leaderboards;
pub mod snapshots;
pub mod stats;
pub mod store;

mod config;
pub use config::ServiceConfig;
mod metrics;
use metrics::{HttpMetrics, SystemMetrics};
pub use metrics::{HttpMetricsSnapshot, SystemMetricsSnapshot};

use cache::{global_stat_key, player_stat_key, player_stats_key, Cache, Invalidator};
use integrations::{IntegrationHook, WebhookHook};
use snapshots::SnapshotPersistence;
use stats::StatChangeError;
use store::{Store, StoreError};

pub(crate) fn unix_now() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as Timestamp)
        .unwrap_or_default()
}

#[derive(Default)]
pub struct PipelineMetrics {
    applied: AtomicU64,
    rejected_throttled: AtomicU64,
    rejected_magnitude: AtomicU64,
    rejected_range: AtomicU64,
    rejected_unknown: AtomicU64,
    store_errors: AtomicU64,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct PipelineMetricsSnapshot {
    pub applied: u64,
    pub rejected_throttled: u64,
    pub rejected_magnitude: u64,
    pub rejected_range: u64,
    pub rejected_unknown: u64,
    pub store_errors: u64,
}

impl PipelineMetrics {
    pub fn inc_applied(&self) {
        self.applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self, error: &StatChangeError) {
        let counter = match error {
            StatChangeError::Throttled { .. } => &self.rejected_throttled,
            StatChangeError::ChangeTooLarge { .. } => &self.rejected_magnitude,
            StatChangeError::BelowMin { .. } | StatChangeError::AboveMax { .. } => {
                &self.rejected_range
            }
            StatChangeError::UnknownStat(_) | StatChangeError::UnknownPlayer(_) => {
                &self.rejected_unknown
            }
            StatChangeError::Store(_) => &self.store_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineMetricsSnapshot {
        PipelineMetricsSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            rejected_throttled: self.rejected_throttled.load(Ordering::Relaxed),
            rejected_magnitude: self.rejected_magnitude.load(Ordering::Relaxed),
            rejected_range: self.rejected_range.load(Ordering::Relaxed),
            rejected_unknown: self.rejected_unknown.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations_enqueued: AtomicU64,
    invalidations_dropped: AtomicU64,
    invalidations_applied: AtomicU64,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub invalidations_enqueued: u64,
    pub invalidations_dropped: u64,
    pub invalidations_applied: u64,
}

impl CacheMetrics {
    pub fn inc_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_invalidations_enqueued(&self) {
        self.invalidations_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_invalidations_dropped(&self) {
        self.invalidations_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_invalidations_applied(&self) {
        self.invalidations_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations_enqueued: self.invalidations_enqueued.load(Ordering::Relaxed),
            invalidations_dropped: self.invalidations_dropped.load(Ordering::Relaxed),
            invalidations_applied: self.invalidations_applied.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
pub struct SnapshotMetrics {
    queue_depth: AtomicU64,
    queue_high_water: AtomicU64,
    dropped: AtomicU64,
    retries: AtomicU64,
    flushed: AtomicU64,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct SnapshotMetricsSnapshot {
    pub queue_depth: u64,
    pub queue_high_water: u64,
    pub dropped: u64,
    pub retries: u64,
    pub flushed: u64,
}

impl SnapshotMetrics {
    pub fn inc_queue_depth(&self) {
        let depth = self.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        let mut current = self.queue_high_water.load(Ordering::Relaxed);
        while depth > current {
            match self.queue_high_water.compare_exchange_weak(
                current,
                depth,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(next) => current = next,
            }
        }
    }

    pub fn dec_queue_depth(&self) {
        let mut current = self.queue_depth.load(Ordering::Relaxed);
        while current > 0 {
            match self.queue_depth.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(next) => current = next,
            }
        }
    }

    pub fn inc_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_flushed(&self, count: u64) {
        self.flushed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SnapshotMetricsSnapshot {
        SnapshotMetricsSnapshot {
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            queue_high_water: self.queue_high_water.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub ready: bool,
    pub store_ok: bool,
    pub cache_enabled: bool,
    pub snapshots_enabled: bool,
    pub snapshot_queue_depth: u64,
    pub version: &'static str,
}

pub struct Service {
    config: ServiceConfig,
    store: Arc<Store>,
    cache: Arc<Cache>,
    invalidator: Invalidator,
    snapshots: Option<Arc<SnapshotPersistence>>,
    integrations: Vec<Arc<dyn IntegrationHook>>,
    pipeline_metrics: Arc<PipelineMetrics>,
    cache_metrics: Arc<CacheMetrics>,
    snapshot_metrics: Arc<SnapshotMetrics>,
    http_metrics: HttpMetrics,
    system_metrics: SystemMetrics,
}

impl Service {
    /// Builds the service. The counter store is the only hard dependency; a
    /// missing cache backend falls back to the in-process map and a missing
    /// analytics path disables snapshots with a warning, mirroring how the
    /// rest of the system treats side-channel failures.
    pub fn new_with_config(
        config: ServiceConfig,
        mut integrations: Vec<Arc<dyn IntegrationHook>>,
    ) -> anyhow::Result<Self> {
        let store = match config.db_path.as_deref() {
            Some(path) => Store::open(path).context("open counter store")?,
            None => Store::open_in_memory().context("open in-memory counter store")?,
        };

        let cache_metrics = Arc::new(CacheMetrics::default());
        let cache = match config.cache_redis_url.as_deref() {
            Some(url) => {
                match Cache::redis(url, config.cache_prefix(), Arc::clone(&cache_metrics)) {
                    Ok(cache) => cache,
                    Err(err) => {
                        tracing::warn!("redis cache disabled, using memory cache: {err}");
                        Cache::memory(Arc::clone(&cache_metrics))
                    }
                }
            }
            None => Cache::memory(Arc::clone(&cache_metrics)),
        };
        let cache = Arc::new(cache);
        let invalidator = Invalidator::start(
            Arc::clone(&cache),
            config.invalidation_buffer_capacity(),
            Arc::clone(&cache_metrics),
        );

        let snapshot_metrics = Arc::new(SnapshotMetrics::default());
        let snapshots = match config.snapshots_path.as_deref() {
            Some(path) => match SnapshotPersistence::load_and_start(
                path,
                config.snapshot_buffer_capacity(),
                config.snapshot_batch_size(),
                config.snapshot_linger(),
                config.snapshot_retry_limit(),
                Arc::clone(&snapshot_metrics),
            ) {
                Ok(persistence) => Some(Arc::new(persistence)),
                Err(err) => {
                    tracing::warn!("snapshot store disabled: {err}");
                    None
                }
            },
            None => None,
        };

        if let Some(url) = config.webhook_url.clone() {
            integrations.push(Arc::new(WebhookHook::new(url)));
        }

        Ok(Self {
            config,
            store: Arc::new(store),
            cache,
            invalidator,
            snapshots,
            integrations,
            pipeline_metrics: Arc::new(PipelineMetrics::default()),
            cache_metrics,
            snapshot_metrics,
            http_metrics: HttpMetrics::default(),
            system_metrics: SystemMetrics::new(),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<Store> {
        Arc::clone(&self.store)
    }

    pub fn cache(&self) -> Arc<Cache> {
        Arc::clone(&self.cache)
    }

    pub(crate) fn invalidator(&self) -> &Invalidator {
        &self.invalidator
    }

    pub fn snapshots(&self) -> Option<Arc<SnapshotPersistence>> {
        self.snapshots.as_ref().map(Arc::clone)
    }

    pub(crate) fn integrations(&self) -> &[Arc<dyn IntegrationHook>] {
        &self.integrations
    }

    pub fn pipeline_metrics(&self) -> &PipelineMetrics {
        &self.pipeline_metrics
    }

    pub(crate) fn http_metrics(&self) -> &HttpMetrics {
        &self.http_metrics
    }

    pub(crate) fn pipeline_metrics_snapshot(&self) -> PipelineMetricsSnapshot {
        self.pipeline_metrics.snapshot()
    }

    pub(crate) fn cache_metrics_snapshot(&self) -> CacheMetricsSnapshot {
        self.cache_metrics.snapshot()
    }

    pub(crate) fn snapshot_metrics_snapshot(&self) -> SnapshotMetricsSnapshot {
        self.snapshot_metrics.snapshot()
    }

    pub(crate) fn http_metrics_snapshot(&self) -> HttpMetricsSnapshot {
        self.http_metrics.snapshot()
    }

    pub(crate) fn system_metrics_snapshot(&self) -> SystemMetricsSnapshot {
        self.system_metrics.snapshot()
    }

    /// Read-through single-stat value for a player. Unknown stat or player
    /// reads as None; staleness is bounded by the deferred invalidation job
    /// and the entry TTL.
    pub async fn player_stat_cached(
        &self,
        player_id: &str,
        internal_name: &str,
    ) -> Result<Option<PlayerStat>, StoreError> {
        let key = player_stat_key(player_id, internal_name);
        let store = self.store();
        let player_id = player_id.to_string();
        let internal_name = internal_name.to_string();
        self.cache
            .get_or_compute(&key, self.config.cache_ttl(), self.config.cache_sliding(), || async move {
                tokio::task::spawn_blocking(move || -> Result<Option<PlayerStat>, StoreError> {
                    let Some(stat) = store.stat_by_internal_name(&internal_name)? else {
                        return Ok(None);
                    };
                    store.player_stat(&player_id, stat.id)
                })
                .await
                .map_err(|_| StoreError::Task)?
            })
            .await
    }

    /// Read-through listing of every stat row a player holds.
    pub async fn player_stats_cached(
        &self,
        player_id: &str,
    ) -> Result<Vec<PlayerStat>, StoreError> {
        let key = player_stats_key(player_id);
        let store = self.store();
        let player_id = player_id.to_string();
        self.cache
            .get_or_compute(&key, self.config.cache_ttl(), self.config.cache_sliding(), || async move {
                tokio::task::spawn_blocking(move || store.player_stats(&player_id))
                    .await
                    .map_err(|_| StoreError::Task)?
            })
            .await
    }

    /// Evicts every cache key derived from a player, deferred. Used by the
    /// bulk operations (player delete, stat reset) where the affected stat
    /// set is open-ended.
    pub(crate) fn defer_invalidate_player(&self, player_id: &str) {
        self.invalidator
            .defer(cache::Invalidation::Prefix(format!(
                "player-stat:{player_id}:"
            )));
        self.invalidator.defer(cache::Invalidation::Keys(vec![
            player_stats_key(player_id),
        ]));
    }

    /// Recomputes every global counter from its player rows and overwrites
    /// both the relational column and the fast-cache key. Last-writer-wins
    /// against a concurrent burst; the next cycle converges.
    pub async fn reconcile_global_values(&self) -> Result<usize, StoreError> {
        let store = self.store();
        let recomputed =
            tokio::task::spawn_blocking(move || -> Result<Vec<(i64, f64)>, StoreError> {
                let mut recomputed = Vec::new();
                for stat in store.global_stats()? {
                    let value = store.recompute_global_value(stat.id)?;
                    recomputed.push((stat.id, value));
                }
                Ok(recomputed)
            })
            .await
            .map_err(|_| StoreError::Task)??;
        let count = recomputed.len();
        for (stat_id, value) in recomputed {
            self.cache.set_global(&global_stat_key(stat_id), value).await;
        }
        Ok(count)
    }

    /// Periodic recompute-from-source job for the dual global counters.
    pub fn start_reconciliation(self: &Arc<Self>) {
        let Some(interval) = self.config.reconcile_interval() else {
            return;
        };
        let service = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match service.reconcile_global_values().await {
                    Ok(count) => {
                        tracing::debug!(stats = count, "reconciled global counters");
                    }
                    Err(err) => {
                        tracing::warn!("global counter reconciliation failed: {err}");
                    }
                }
            }
        });
    }

    /// Daily retention prune of the analytics store, when configured.
    pub fn start_retention(self: &Arc<Self>) {
        let Some(days) = self.config.snapshot_retention_days else {
            return;
        };
        let Some(snapshots) = self.snapshots() else {
            return;
        };
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                let cutoff = unix_now() - (days as i64) * 86_400;
                let snapshots = Arc::clone(&snapshots);
                let pruned = tokio::task::spawn_blocking(move || snapshots.prune_before(cutoff))
                    .await;
                match pruned {
                    Ok(Ok(count)) => tracing::info!(count, "pruned old snapshots"),
                    Ok(Err(err)) => tracing::warn!("snapshot prune failed: {err}"),
                    Err(err) => tracing::warn!("snapshot prune task failed: {err}"),
                }
            }
        });
    }

    pub async fn health_status(&self) -> HealthStatus {
        let store = self.store();
        let store_ok = tokio::task::spawn_blocking(move || {
            store
                .lock()
                .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .is_ok()
        })
        .await
        .unwrap_or(false);
        HealthStatus {
            healthy: store_ok,
            ready: store_ok,
            store_ok,
            cache_enabled: true,
            snapshots_enabled: self.snapshots.is_some(),
            snapshot_queue_depth: self.snapshot_metrics.snapshot().queue_depth,
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::tests::CountingHook;
    use crate::stats::{apply_change, ChangeRequest};
    use crate::store::StatDefinition;
    use std::sync::atomic::AtomicUsize;

    fn change(internal_name: &str, delta: f64) -> ChangeRequest {
        ChangeRequest {
            player_id: "p1".to_string(),
            alias_id: 1,
            internal_name: internal_name.to_string(),
            change: delta,
            continuity_timestamp: None,
        }
    }

    async fn seeded_service(hooks: Vec<Arc<dyn IntegrationHook>>) -> Arc<Service> {
        let service =
            Arc::new(Service::new_with_config(ServiceConfig::default(), hooks).unwrap());
        service.store().create_player("p1", false, 0).unwrap();
        service
            .store()
            .create_stat(&StatDefinition {
                internal_name: "gold".to_string(),
                name: "Gold".to_string(),
                global: true,
                ..Default::default()
            })
            .unwrap();
        service
    }

    #[tokio::test]
    async fn cached_read_goes_stale_then_catches_up() {
        let service = seeded_service(Vec::new()).await;

        // Warm the cache before any writes: no row yet.
        let before = service.player_stat_cached("p1", "gold").await.unwrap();
        assert!(before.is_none());

        let row = apply_change(Arc::clone(&service), change("gold", 7.0))
            .await
            .unwrap();
        assert_eq!(row.value, 7.0);

        // The deferred invalidation job eventually evicts the stale None.
        let mut caught_up = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let cached = service.player_stat_cached("p1", "gold").await.unwrap();
            if cached.as_ref().map(|row| row.value) == Some(7.0) {
                caught_up = true;
                break;
            }
        }
        assert!(caught_up, "cache never reflected the write");
    }

    #[tokio::test]
    async fn player_list_reads_through_and_invalidates() {
        let service = seeded_service(Vec::new()).await;
        assert!(service.player_stats_cached("p1").await.unwrap().is_empty());

        apply_change(Arc::clone(&service), change("gold", 2.0))
            .await
            .unwrap();

        let mut listed = Vec::new();
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            listed = service.player_stats_cached("p1").await.unwrap();
            if !listed.is_empty() {
                break;
            }
        }
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].value, 2.0);
    }

    #[tokio::test]
    async fn hooks_hear_about_successful_applies_only() {
        let calls = Arc::new(AtomicUsize::new(0));
        let hook = Arc::new(CountingHook {
            calls: Arc::clone(&calls),
        });
        let service = seeded_service(vec![hook]).await;

        apply_change(Arc::clone(&service), change("gold", 1.0))
            .await
            .unwrap();
        let rejected = apply_change(Arc::clone(&service), change("missing", 1.0)).await;
        assert!(rejected.is_err());

        let mut observed = 0;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            observed = calls.load(Ordering::Relaxed);
            if observed > 0 {
                break;
            }
        }
        assert_eq!(observed, 1);
    }

    #[tokio::test]
    async fn reconciliation_repairs_both_counters() {
        let service = seeded_service(Vec::new()).await;
        apply_change(Arc::clone(&service), change("gold", 5.0))
            .await
            .unwrap();
        let stat = service
            .store()
            .stat_by_internal_name("gold")
            .unwrap()
            .unwrap();

        // Wait for both deferred global increments before poisoning the
        // counters.
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let relational = service
                .store()
                .stat_by_internal_name("gold")
                .unwrap()
                .unwrap()
                .global_value;
            let cached = service
                .cache()
                .add_global(&global_stat_key(stat.id), 0.0)
                .await;
            if relational == 5.0 && cached == Some(5.0) {
                break;
            }
        }

        service.store().add_global_value(stat.id, 50.0).unwrap();
        service
            .cache()
            .add_global(&global_stat_key(stat.id), 70.0)
            .await;

        assert_eq!(service.reconcile_global_values().await.unwrap(), 1);
        let repaired = service
            .store()
            .stat_by_internal_name("gold")
            .unwrap()
            .unwrap();
        assert_eq!(repaired.global_value, 5.0);
        assert_eq!(
            service
                .cache()
                .add_global(&global_stat_key(stat.id), 0.0)
                .await,
            Some(5.0)
        );
    }

    #[tokio::test]
    async fn health_reports_the_store() {
        let service = seeded_service(Vec::new()).await;
        let status = service.health_status().await;
        assert!(status.healthy);
        assert!(status.store_ok);
        assert!(!status.snapshots_enabled);
    }
}
