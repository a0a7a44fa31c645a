use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::Method;
use serde::Serialize;

use crate::error::{Error, ErrorCode};
use crate::response::Response;
use crate::util::lock_unpoisoned;

/// How the cache participated in a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CacheDisposition {
    Hit,
    Miss,
    /// Caching disabled, or the request failed before a response existed.
    Uncached,
}

/// One completed request, as seen by an observer.
#[derive(Clone, Debug)]
pub struct RequestRecord {
    pub method: Method,
    /// Redacted target (scheme + host + path; no query, no userinfo).
    pub uri: String,
    pub status: Option<u16>,
    pub error_code: Option<ErrorCode>,
    pub elapsed: Duration,
    pub cache: CacheDisposition,
}

/// Best-effort sink for per-request records.
///
/// Observers are invoked after every client-level call, on success and
/// failure alike. The interface is infallible by construction: an observer
/// returns nothing and must never affect the outcome of the request it is
/// told about.
pub trait RequestObserver: Send + Sync {
    fn on_request(&self, _record: &RequestRecord) {}
}

#[derive(Clone, Debug, Default)]
pub(crate) struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    requests_started: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    retries: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_writes: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
    status_counts: Mutex<BTreeMap<u16, u64>>,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

impl Metrics {
    pub(crate) fn record_request_started(&self) {
        self.inner.requests_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_hit(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_miss(&self) {
        self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_write(&self) {
        self.inner.cache_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_request_completed(
        &self,
        outcome: &Result<Response, Error>,
        latency: Duration,
    ) {
        match outcome {
            Ok(response) => {
                self.inner
                    .requests_succeeded
                    .fetch_add(1, Ordering::Relaxed);
                let mut status_counts = lock_unpoisoned(&self.inner.status_counts);
                *status_counts
                    .entry(response.status().as_u16())
                    .or_insert(0) += 1;
            }
            Err(error) => {
                self.inner.requests_failed.fetch_add(1, Ordering::Relaxed);
                let mut error_counts = lock_unpoisoned(&self.inner.error_counts);
                *error_counts
                    .entry(error.code().as_str().to_owned())
                    .or_insert(0) += 1;
            }
        }

        let latency_ms = latency.as_millis().min(u64::MAX as u128) as u64;
        self.inner
            .latency_total_ms
            .fetch_add(latency_ms, Ordering::Relaxed);
        self.inner.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        let latency_total_ms = self.inner.latency_total_ms.load(Ordering::Relaxed);
        let latency_samples = self.inner.latency_samples.load(Ordering::Relaxed);
        let latency_avg_ms = if latency_samples == 0 {
            0.0
        } else {
            latency_total_ms as f64 / latency_samples as f64
        };

        MetricsSnapshot {
            requests_started: self.inner.requests_started.load(Ordering::Relaxed),
            requests_succeeded: self.inner.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: self.inner.requests_failed.load(Ordering::Relaxed),
            retries: self.inner.retries.load(Ordering::Relaxed),
            cache_hits: self.inner.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.inner.cache_misses.load(Ordering::Relaxed),
            cache_writes: self.inner.cache_writes.load(Ordering::Relaxed),
            latency_total_ms,
            latency_samples,
            latency_avg_ms,
            status_counts: lock_unpoisoned(&self.inner.status_counts).clone(),
            error_counts: lock_unpoisoned(&self.inner.error_counts).clone(),
        }
    }
}

/// Point-in-time view of the pipeline's counters, serializable for external
/// collectors.
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub requests_started: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub retries: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_writes: u64,
    pub latency_total_ms: u64,
    pub latency_samples: u64,
    pub latency_avg_ms: f64,
    pub status_counts: BTreeMap<u16, u64>,
    pub error_counts: BTreeMap<String, u64>,
}
