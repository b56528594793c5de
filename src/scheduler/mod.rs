//! Persistent job dispatch over Redis lists.
//!
//! This module provides the dispatch engine:
//!
//! - **QueueManager**: queue, processing list and status records for one named queue
//! - **WorkerPoolManager**: fixed pool of long-lived workers
//! - **JobDispatcher**: the loop moving jobs from the queue onto idle workers
//! - **CircuitBreaker** and **LoadMonitor**: the two gates the loop checks first
//! - **RecoveryManager**: startup reconciliation after an unclean exit
//! - **ProcessingQueue**: everything above behind one start/shutdown lifecycle
//!
//! # Architecture
//!
//! ```text
//!      add_jobs ──LPUSH──▶ ┌───────────────┐
//!                          │  {name}_queue │ ◀──── drain / requeue (recovery)
//!                          └───────┬───────┘
//!                                  │ fetch_jobs (RPOPLPUSH, scripted)
//!                          ┌───────▼──────────────────┐
//!                          │ {name}_queue:processing  │
//!                          └───────┬──────────────────┘
//!                                  │ dispatch_job
//!         ┌────────────────────────┼────────────────────────┐
//!         ▼                        ▼                        ▼
//!    ┌─────────┐              ┌─────────┐              ┌─────────┐
//!    │ Worker 0│              │ Worker 1│              │ Worker N│
//!    └────┬────┘              └────┬────┘              └────┬────┘
//!         └──── LREM + status write (completed / failed) ───┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use jobforge::config::QueueConfig;
//! use jobforge::scheduler::{Job, ProcessingQueue, ProcessWorkerFactory};
//! use std::sync::Arc;
//!
//! let config = QueueConfig::new("thumbnails").with_max_concurrent_jobs(4);
//! let factory = Arc::new(ProcessWorkerFactory::new("./thumbnail-worker"));
//! let queue = ProcessingQueue::connect(config, factory).await?;
//!
//! queue.start().await?;
//! queue.add_jobs(vec![Job::new(serde_json::json!({"image": "a.png"}))]).await?;
//!
//! // Graceful shutdown
//! queue.shutdown().await?;
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic fetch**: entries move to the processing list in one scripted step
//! - **Crash recovery**: the next start drains the processing list and requeues
//!   Running jobs that are on no list
//! - **Dead letter list**: entries that are not valid jobs are parked, not retried
//! - **Graceful shutdown**: workers finish current jobs before stopping

pub mod circuit_breaker;
pub mod dispatcher;
pub mod job;
pub mod load;
pub mod processing_queue;
pub mod queue;
pub mod recovery;
pub mod redis_store;
pub mod store;
pub mod worker_pool;

// Re-export main types for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use dispatcher::{
    Backoff, BackoffConfig, DispatcherConfig, DispatcherControl, JobDispatcher, SleepReason, Tick,
};
pub use job::{InFlightJob, Job, JobResult, JobStatus, StatusRecord};
pub use load::{
    LoadMonitor, LoadReport, LoadThresholds, QueueDepthMonitor, StaticLoadMonitor,
    SystemLoadMonitor,
};
pub use processing_queue::{ProcessingQueue, ProcessingStats};
pub use queue::{QueueManager, QueueStats};
pub use recovery::{RecoveryManager, RecoveryReport};
pub use redis_store::RedisStore;
pub use store::{MemoryStore, OrphanCheck, QueueStore};
pub use worker_pool::{
    DispatchHandle, InProcessWorkerFactory, PoolStats, ProcessWorkerFactory, Worker,
    WorkerFactory, WorkerPoolConfig, WorkerPoolManager, WorkerProgress, WorkerReport,
};
