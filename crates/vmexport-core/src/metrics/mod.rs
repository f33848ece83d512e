//! Metrics sink contract (§4.G). The core only consumes this trait; wiring
//! a concrete exporter (Prometheus, statsd, ...) is out of scope.

use crate::jobs::JobStatus;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Size bucket for transfer-duration histograms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeBucket {
    Small,
    Medium,
    Large,
    XLarge,
    XxLarge,
}

impl SizeBucket {
    pub fn for_gb(size_gb: u64) -> Self {
        match size_gb {
            0..=9 => SizeBucket::Small,
            10..=49 => SizeBucket::Medium,
            50..=99 => SizeBucket::Large,
            100..=499 => SizeBucket::XLarge,
            _ => SizeBucket::XxLarge,
        }
    }
}

/// Counters, gauges, and histograms the core emits. Implementations decide
/// how (or whether) to export these; the core only calls these methods.
pub trait MetricsSink: Send + Sync {
    fn incr_jobs_total(&self, status: JobStatus, provider: &str);
    fn incr_bytes_exported(&self, provider: &str, bytes: u64);
    fn incr_errors_total(&self, kind: &str, provider: &str);
    fn incr_retry_attempts(&self, op: &str, provider: &str);

    fn set_active_jobs(&self, count: i64);
    fn set_queued_jobs(&self, count: i64);
    fn set_vms_discovered(&self, provider: &str, state: &str, count: i64);

    fn observe_job_duration(&self, status: JobStatus, provider: &str, seconds: f64);
    fn observe_export_speed(&self, provider: &str, bytes_per_sec: f64);
    fn observe_disk_download_duration(&self, provider: &str, bucket: SizeBucket, seconds: f64);
}

/// Discards everything; used when `metrics.enabled = false`.
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn incr_jobs_total(&self, _status: JobStatus, _provider: &str) {}
    fn incr_bytes_exported(&self, _provider: &str, _bytes: u64) {}
    fn incr_errors_total(&self, _kind: &str, _provider: &str) {}
    fn incr_retry_attempts(&self, _op: &str, _provider: &str) {}
    fn set_active_jobs(&self, _count: i64) {}
    fn set_queued_jobs(&self, _count: i64) {}
    fn set_vms_discovered(&self, _provider: &str, _state: &str, _count: i64) {}
    fn observe_job_duration(&self, _status: JobStatus, _provider: &str, _seconds: f64) {}
    fn observe_export_speed(&self, _provider: &str, _bytes_per_sec: f64) {}
    fn observe_disk_download_duration(&self, _provider: &str, _bucket: SizeBucket, _seconds: f64) {}
}

/// In-process accumulator, useful for tests and for a `/healthz`-style
/// snapshot without a real Prometheus exporter wired up.
#[derive(Default)]
pub struct InMemoryMetricsSink {
    counters: Mutex<HashMap<String, u64>>,
    gauges: Mutex<HashMap<String, i64>>,
    bytes_exported: AtomicU64,
}

impl InMemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, key: String) {
        *self.counters.lock().expect("metrics mutex poisoned").entry(key).or_insert(0) += 1;
    }

    pub fn counter(&self, key: &str) -> u64 {
        *self.counters.lock().expect("metrics mutex poisoned").get(key).unwrap_or(&0)
    }

    pub fn gauge(&self, key: &str) -> i64 {
        *self.gauges.lock().expect("metrics mutex poisoned").get(key).unwrap_or(&0)
    }

    pub fn total_bytes_exported(&self) -> u64 {
        self.bytes_exported.load(Ordering::Relaxed)
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn incr_jobs_total(&self, status: JobStatus, provider: &str) {
        self.bump(format!("jobs_total{{status={},provider={}}}", status, provider));
    }

    fn incr_bytes_exported(&self, provider: &str, bytes: u64) {
        self.bytes_exported.fetch_add(bytes, Ordering::Relaxed);
        let _ = provider;
    }

    fn incr_errors_total(&self, kind: &str, provider: &str) {
        self.bump(format!("errors_total{{type={},provider={}}}", kind, provider));
    }

    fn incr_retry_attempts(&self, op: &str, provider: &str) {
        self.bump(format!("retry_attempts_total{{op={},provider={}}}", op, provider));
    }

    fn set_active_jobs(&self, count: i64) {
        self.gauges.lock().expect("metrics mutex poisoned").insert("active_jobs".to_string(), count);
    }

    fn set_queued_jobs(&self, count: i64) {
        self.gauges.lock().expect("metrics mutex poisoned").insert("queued_jobs".to_string(), count);
    }

    fn set_vms_discovered(&self, provider: &str, state: &str, count: i64) {
        self.gauges
            .lock()
            .expect("metrics mutex poisoned")
            .insert(format!("vms_discovered{{provider={},state={}}}", provider, state), count);
    }

    fn observe_job_duration(&self, status: JobStatus, provider: &str, seconds: f64) {
        self.bump(format!("job_duration_seconds{{status={},provider={}}}:{}", status, provider, seconds as u64));
    }

    fn observe_export_speed(&self, provider: &str, bytes_per_sec: f64) {
        let _ = (provider, bytes_per_sec);
    }

    fn observe_disk_download_duration(&self, provider: &str, bucket: SizeBucket, seconds: f64) {
        let _ = (provider, bucket, seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_bucket_boundaries() {
        assert!(matches!(SizeBucket::for_gb(5), SizeBucket::Small));
        assert!(matches!(SizeBucket::for_gb(10), SizeBucket::Medium));
        assert!(matches!(SizeBucket::for_gb(500), SizeBucket::XxLarge));
    }

    #[test]
    fn in_memory_sink_counts() {
        let sink = InMemoryMetricsSink::new();
        sink.incr_jobs_total(JobStatus::Completed, "esxi");
        sink.incr_jobs_total(JobStatus::Completed, "esxi");
        assert_eq!(sink.counter("jobs_total{status=completed,provider=esxi}"), 2);
        sink.incr_bytes_exported("esxi", 1024);
        assert_eq!(sink.total_bytes_exported(), 1024);
    }
}
