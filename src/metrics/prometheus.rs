//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by jobforge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all jobforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Number of jobs waiting on the queue list, labeled by queue.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of jobs on the processing list, labeled by queue.
pub static JOBS_IN_PROGRESS: OnceLock<GaugeVec> = OnceLock::new();

/// Number of workers currently running a job, labeled by queue.
pub static ACTIVE_WORKERS: OnceLock<GaugeVec> = OnceLock::new();

/// Jobs that reached a lifecycle state, labeled by queue and status.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Job execution duration in seconds, labeled by queue.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Current dispatcher sleep in seconds, labeled by queue and cause.
pub static DISPATCH_BACKOFF: OnceLock<GaugeVec> = OnceLock::new();

/// 1 while the circuit breaker is open, labeled by queue.
pub static CIRCUIT_OPEN: OnceLock<GaugeVec> = OnceLock::new();

/// Jobs moved back onto the queue by startup recovery, labeled by queue and phase.
pub static RECOVERED_JOBS: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Recording before this is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("jobforge_queue_depth", "Number of jobs waiting in the queue"),
        &["queue"],
    )?;

    let jobs_in_progress = GaugeVec::new(
        Opts::new(
            "jobforge_jobs_in_progress",
            "Number of jobs on the processing list",
        ),
        &["queue"],
    )?;

    // Job metrics
    let jobs_total = CounterVec::new(
        Opts::new("jobforge_jobs_total", "Jobs that reached a lifecycle state"),
        &["queue", "status"],
    )?;

    let job_duration = HistogramVec::new(
        HistogramOpts::new(
            "jobforge_job_duration_seconds",
            "Job execution duration in seconds",
        )
        .buckets(vec![0.1, 1.0, 5.0, 30.0, 60.0, 300.0, 900.0, 1800.0]),
        &["queue"],
    )?;

    // Dispatcher metrics
    let dispatch_backoff = GaugeVec::new(
        Opts::new(
            "jobforge_dispatch_backoff_seconds",
            "Current dispatcher sleep by cause",
        ),
        &["queue", "cause"],
    )?;

    let circuit_open = GaugeVec::new(
        Opts::new("jobforge_circuit_open", "Whether the circuit breaker is open"),
        &["queue"],
    )?;

    let recovered_jobs = CounterVec::new(
        Opts::new(
            "jobforge_recovered_jobs_total",
            "Jobs returned to the queue by startup recovery",
        ),
        &["queue", "phase"],
    )?;

    // Worker metrics
    let active_workers = GaugeVec::new(
        Opts::new("jobforge_active_workers", "Number of busy workers"),
        &["queue"],
    )?;

    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(dispatch_backoff.clone()))?;
    registry.register(Box::new(circuit_open.clone()))?;
    registry.register(Box::new(recovered_jobs.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // If any of these fail, metrics were already initialized
    let _ = REGISTRY.set(registry);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = DISPATCH_BACKOFF.set(dispatch_backoff);
    let _ = CIRCUIT_OPEN.set(circuit_open);
    let _ = RECOVERED_JOBS.set(recovered_jobs);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
