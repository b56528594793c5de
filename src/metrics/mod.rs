//! Metrics module for Prometheus-based monitoring.
//!
//! This module provides metrics collection and export for the dispatch
//! engine: queue depths, job outcomes, worker usage, dispatcher backoff and
//! startup recovery.
//!
//! # Example
//!
//! ```ignore
//! use jobforge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! // Initialize metrics on startup
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.update_queue_depth("analysis", 12, 4);
//!
//! // Export metrics for Prometheus scraping
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, CIRCUIT_OPEN, DISPATCH_BACKOFF, JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION,
    QUEUE_DEPTH, RECOVERED_JOBS, REGISTRY,
};
