use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};

const LATENCY_BUCKET_COUNT: usize = 12;
const LATENCY_BUCKETS_MS: [u64; LATENCY_BUCKET_COUNT] =
    [1, 2, 5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];

#[derive(Clone, Debug, Serialize)]
pub struct LatencySnapshot {
    pub buckets_ms: Vec<u64>,
    pub counts: Vec<u64>,
    pub overflow: u64,
    pub count: u64,
    pub avg_ms: f64,
    pub max_ms: u64,
}

#[derive(Default)]
struct LatencyMetrics {
    buckets: [AtomicU64; LATENCY_BUCKET_COUNT],
    overflow: AtomicU64,
    count: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl LatencyMetrics {
    fn record(&self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.update_max(ms);

        if let Some((idx, _)) = LATENCY_BUCKETS_MS
            .iter()
            .enumerate()
            .find(|(_, bucket)| ms <= **bucket)
        {
            self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        } else {
            self.overflow.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total_ms = self.total_ms.load(Ordering::Relaxed);
        let avg_ms = if count > 0 {
            total_ms as f64 / count as f64
        } else {
            0.0
        };
        let counts = self
            .buckets
            .iter()
            .map(|bucket| bucket.load(Ordering::Relaxed))
            .collect::<Vec<_>>();

        LatencySnapshot {
            buckets_ms: LATENCY_BUCKETS_MS.to_vec(),
            counts,
            overflow: self.overflow.load(Ordering::Relaxed),
            count,
            avg_ms,
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }

    fn update_max(&self, value: u64) {
        let mut current = self.max_ms.load(Ordering::Relaxed);
        while value > current {
            match self.max_ms.compare_exchange_weak(
                current,
                value,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(next) => current = next,
            }
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct HttpMetricsSnapshot {
    pub apply_change: LatencySnapshot,
    pub list_entries: LatencySnapshot,
    pub history: LatencySnapshot,
    pub reject_rate_limit: u64,
    pub reject_body_limit: u64,
}

#[derive(Default)]
pub struct HttpMetrics {
    apply_change: LatencyMetrics,
    list_entries: LatencyMetrics,
    history: LatencyMetrics,
    reject_rate_limit: AtomicU64,
    reject_body_limit: AtomicU64,
}

impl HttpMetrics {
    pub fn record_apply_change(&self, duration: Duration) {
        self.apply_change.record(duration);
    }

    pub fn record_list_entries(&self, duration: Duration) {
        self.list_entries.record(duration);
    }

    pub fn record_history(&self, duration: Duration) {
        self.history.record(duration);
    }

    pub fn inc_reject_rate_limit(&self) {
        self.reject_rate_limit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reject_body_limit(&self) {
        self.reject_body_limit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HttpMetricsSnapshot {
        HttpMetricsSnapshot {
            apply_change: self.apply_change.snapshot(),
            list_entries: self.list_entries.snapshot(),
            history: self.history.snapshot(),
            reject_rate_limit: self.reject_rate_limit.load(Ordering::Relaxed),
            reject_body_limit: self.reject_body_limit.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct SystemMetricsSnapshot {
    pub rss_bytes: u64,
    pub virtual_bytes: u64,
    pub cpu_usage_percent: f64,
}

pub struct SystemMetrics {
    system: Mutex<System>,
    pid: Pid,
}

impl SystemMetrics {
    pub fn new() -> Self {
        let system = System::new();
        let pid = Pid::from_u32(std::process::id());
        Self {
            system: Mutex::new(system),
            pid,
        }
    }

    pub fn snapshot(&self) -> SystemMetricsSnapshot {
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        system.refresh_cpu_usage();
        system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), false);

        if let Some(process) = system.process(self.pid) {
            SystemMetricsSnapshot {
                rss_bytes: process.memory().saturating_mul(1024),
                virtual_bytes: process.virtual_memory().saturating_mul(1024),
                cpu_usage_percent: process.cpu_usage() as f64,
            }
        } else {
            SystemMetricsSnapshot {
                rss_bytes: 0,
                virtual_bytes: 0,
                cpu_usage_percent: 0.0,
            }
        }
    }
}
