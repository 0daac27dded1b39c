pub mod prometheus;

use dashmap::DashMap;
use hyper::StatusCode;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub requests_duration_ms: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub rate_limited: AtomicU64,
    pub backend_errors: AtomicU64,
    pub redirects: AtomicU64,
    pub tunnels_opened: AtomicU64,
    pub active_tunnels: AtomicU64,
    pub status_codes: DashMap<u16, AtomicU64>,
}

pub struct MetricsCollector {
    metrics: Arc<Metrics>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(Metrics::default()),
        }
    }

    pub fn record_request(&self, status: StatusCode, duration: Duration) {
        self.metrics.requests_total.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .requests_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);

        self.metrics
            .status_codes
            .entry(status.as_u16())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.metrics.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backend_error(&self) {
        self.metrics.backend_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_redirect(&self) {
        self.metrics.redirects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tunnel_opened(&self) {
        self.metrics.tunnels_opened.fetch_add(1, Ordering::Relaxed);
        self.metrics.active_tunnels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tunnel_closed(&self) {
        self.metrics.active_tunnels.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get_metrics_snapshot(&self) -> MetricsSnapshot {
        let m = &self.metrics;
        MetricsSnapshot {
            requests_total: m.requests_total.load(Ordering::Relaxed),
            requests_duration_ms: m.requests_duration_ms.load(Ordering::Relaxed),
            cache_hits: m.cache_hits.load(Ordering::Relaxed),
            cache_misses: m.cache_misses.load(Ordering::Relaxed),
            rate_limited: m.rate_limited.load(Ordering::Relaxed),
            backend_errors: m.backend_errors.load(Ordering::Relaxed),
            redirects: m.redirects.load(Ordering::Relaxed),
            tunnels_opened: m.tunnels_opened.load(Ordering::Relaxed),
            active_tunnels: m.active_tunnels.load(Ordering::Relaxed),
            status_codes: m
                .status_codes
                .iter()
                .map(|entry| (*entry.key(), entry.value().load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_duration_ms: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub rate_limited: u64,
    pub backend_errors: u64,
    pub redirects: u64,
    pub tunnels_opened: u64,
    pub active_tunnels: u64,
    pub status_codes: BTreeMap<u16, u64>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
