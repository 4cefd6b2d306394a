//! Pipeline metrics.
//!
//! Provides Prometheus-compatible metrics for the digestion pipeline:
//! - Queue depth and jobs in flight
//! - Processed, failed, retried and dead-lettered jobs
//! - Provider fallbacks
//! - Job duration

use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// ============================================================================
// Metric Names
// ============================================================================

/// Jobs waiting in the queue.
pub const QUEUE_DEPTH: &str = "digestion_queue_depth";

/// Jobs dispatched but not yet acknowledged.
pub const JOBS_IN_FLIGHT: &str = "digestion_jobs_in_flight";

/// Jobs that finished successfully.
pub const JOBS_PROCESSED_TOTAL: &str = "digestion_jobs_processed_total";

/// Jobs that failed, labelled by error category.
pub const JOBS_FAILED_TOTAL: &str = "digestion_jobs_failed_total";

/// Jobs requeued with backoff.
pub const JOBS_RETRIED_TOTAL: &str = "digestion_jobs_retried_total";

/// Jobs moved to the dead-letter list.
pub const DEAD_LETTERS_TOTAL: &str = "digestion_dead_letters_total";

/// Primary digestion calls that fell back to plain text.
pub const PROVIDER_FALLBACKS_TOTAL: &str = "digestion_provider_fallbacks_total";

/// Wall-clock duration of successful jobs.
pub const JOB_DURATION: &str = "digestion_job_duration_seconds";

// ============================================================================
// Prometheus Recorder
// ============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Installs the global Prometheus recorder.
///
/// Safe to call multiple times; later calls return the existing handle.
/// Returns `None` when another recorder already owns the global slot.
pub fn init_metrics() -> Option<PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Some(handle.clone());
    }
    let _guard = INIT_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Some(handle.clone());
    }

    let handle = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => handle,
        Err(e) => {
            tracing::warn!(error = %e, "Prometheus recorder not installed");
            return None;
        }
    };

    describe_gauge!(QUEUE_DEPTH, "Jobs waiting in the digestion queue");
    describe_gauge!(JOBS_IN_FLIGHT, "Jobs dispatched but not yet acknowledged");
    describe_counter!(JOBS_PROCESSED_TOTAL, "Total jobs digested successfully");
    describe_counter!(JOBS_FAILED_TOTAL, "Total failed job attempts by category");
    describe_counter!(JOBS_RETRIED_TOTAL, "Total jobs requeued with backoff");
    describe_counter!(DEAD_LETTERS_TOTAL, "Total jobs moved to the dead-letter list");
    describe_counter!(
        PROVIDER_FALLBACKS_TOTAL,
        "Total primary digestion calls that fell back to plain text"
    );
    describe_histogram!(JOB_DURATION, "Duration of successful jobs in seconds");

    tracing::info!("Prometheus metrics recorder initialized");
    let _ = PROMETHEUS_HANDLE.set(handle.clone());
    Some(handle)
}

/// Returns the global Prometheus handle, if initialized.
#[must_use]
pub fn prometheus_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

/// Prometheus text exposition, empty when no recorder is installed
pub fn render() -> String {
    prometheus_handle()
        .map(|handle| handle.render())
        .unwrap_or_default()
}

// ============================================================================
// Metric Recording
// ============================================================================

pub fn set_queue_depth(depth: usize) {
    gauge!(QUEUE_DEPTH).set(depth as f64);
}

pub fn set_in_flight(in_flight: usize) {
    gauge!(JOBS_IN_FLIGHT).set(in_flight as f64);
}

/// Records a successful job.
pub fn record_processed(duration: Duration) {
    counter!(JOBS_PROCESSED_TOTAL).increment(1);
    histogram!(JOB_DURATION).record(duration.as_secs_f64());
}

/// Records a failed attempt.
pub fn record_failed(category: &str) {
    counter!(JOBS_FAILED_TOTAL, "category" => category.to_string()).increment(1);
}

pub fn record_retry() {
    counter!(JOBS_RETRIED_TOTAL).increment(1);
}

pub fn record_dead_letter() {
    counter!(DEAD_LETTERS_TOTAL).increment(1);
}

pub fn record_fallback() {
    counter!(PROVIDER_FALLBACKS_TOTAL).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_failed("timed_out");
        record_retry();
        set_queue_depth(3);
    }

    #[test]
    fn test_render_after_init() {
        if init_metrics().is_some() {
            record_processed(Duration::from_millis(1500));
            record_failed("validation_failed");
            let text = render();
            assert!(text.contains(JOBS_PROCESSED_TOTAL));
            assert!(text.contains("validation_failed"));
        }
    }
}
