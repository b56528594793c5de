//! Metric recording for dispatch engine operations.
//!
//! `MetricsCollector` wraps the raw Prometheus statics with consistent
//! labeling. Every method is a no-op until `init_metrics()` has run.

use std::time::Duration;

use super::prometheus::{
    ACTIVE_WORKERS, CIRCUIT_OPEN, DISPATCH_BACKOFF, JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION,
    QUEUE_DEPTH, RECOVERED_JOBS,
};

/// Metrics collector for recording jobforge operational metrics.
///
/// # Example
///
/// ```ignore
/// use jobforge::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
///
/// collector.record_job_finished("analysis", "completed", Duration::from_secs(12));
/// collector.update_queue_depth("analysis", 42, 3);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record jobs added to the queue.
    pub fn record_enqueued(&self, queue: &str, count: usize) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total
                .with_label_values(&[queue, "queued"])
                .inc_by(count as f64);
        }
    }

    /// Record a job reaching a terminal state.
    ///
    /// # Arguments
    ///
    /// * `queue` - Queue name
    /// * `status` - Final status (e.g., "completed", "failed", "crashed", "timeout")
    /// * `duration` - Time the worker spent on the job
    pub fn record_job_finished(&self, queue: &str, status: &str, duration: Duration) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[queue, status]).inc();
        }

        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration
                .with_label_values(&[queue])
                .observe(duration.as_secs_f64());
        }

        tracing::trace!(
            queue = queue,
            status = status,
            duration_secs = duration.as_secs_f64(),
            "Recorded job metric"
        );
    }

    /// Update queue and processing list depths.
    pub fn update_queue_depth(&self, queue: &str, pending: usize, processing: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.with_label_values(&[queue]).set(pending as f64);
        }
        if let Some(in_progress) = JOBS_IN_PROGRESS.get() {
            in_progress
                .with_label_values(&[queue])
                .set(processing as f64);
        }
    }

    /// Update the number of busy workers.
    pub fn update_active_workers(&self, queue: &str, active: usize) {
        if let Some(workers) = ACTIVE_WORKERS.get() {
            workers.with_label_values(&[queue]).set(active as f64);
        }
    }

    /// Record the sleep the dispatcher chose for a cause.
    pub fn record_backoff(&self, queue: &str, cause: &str, delay: Duration) {
        if let Some(backoff) = DISPATCH_BACKOFF.get() {
            backoff
                .with_label_values(&[queue, cause])
                .set(delay.as_secs_f64());
        }
    }

    /// Record whether the circuit breaker is open.
    pub fn update_circuit(&self, queue: &str, open: bool) {
        if let Some(circuit) = CIRCUIT_OPEN.get() {
            circuit
                .with_label_values(&[queue])
                .set(if open { 1.0 } else { 0.0 });
        }
    }

    /// Record jobs moved back onto the queue by a recovery phase.
    pub fn record_recovered(&self, queue: &str, phase: &str, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(recovered) = RECOVERED_JOBS.get() {
            recovered
                .with_label_values(&[queue, phase])
                .inc_by(count as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_metrics_collector_new() {
        let collector = MetricsCollector::new();
        assert!(std::mem::size_of_val(&collector) == 0);
    }

    #[test]
    fn test_record_job_finished() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_enqueued("collector-test", 3);
        collector.record_job_finished("collector-test", "completed", Duration::from_secs(2));
        collector.record_job_finished("collector-test", "crashed", Duration::from_millis(40));

        let text = export_metrics();
        assert!(text.contains("collector-test"));
    }

    #[test]
    fn test_gauges() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.update_queue_depth("gauges-test", 42, 3);
        collector.update_active_workers("gauges-test", 2);
        collector.record_backoff("gauges-test", "no_jobs", Duration::from_millis(120));
        collector.update_circuit("gauges-test", true);
        collector.update_circuit("gauges-test", false);
        collector.record_recovered("gauges-test", "drain", 4);
        collector.record_recovered("gauges-test", "orphan", 0);

        let text = export_metrics();
        assert!(text.contains("jobforge_dispatch_backoff_seconds"));
        assert!(text.contains("jobforge_recovered_jobs_total"));
    }
}
