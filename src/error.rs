//! Error types for jobforge operations.
//!
//! Defines error types for each subsystem of the dispatch engine:
//! - Durable queue and status-record access
//! - Worker pool lifecycle and job execution
//! - Startup recovery
//! - Configuration loading

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to the durable queue store.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to the store.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to serialize or deserialize a job or status record.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A scripted operation returned a reply we do not understand.
    #[error("Unexpected reply from {script}: {reply}")]
    UnexpectedReply { script: &'static str, reply: String },
}

impl QueueError {
    /// Returns whether this error means the store connection went away.
    ///
    /// The dispatcher treats these as a teardown signal rather than a
    /// dispatch failure.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, QueueError::Redis(err) if err.is_connection_dropped())
    }
}

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Queue bookkeeping failed while dispatching.
    #[error("Queue operation failed: {0}")]
    Queue(#[from] QueueError),

    /// The raw payload popped from the queue is not a valid job.
    #[error("Invalid job payload: {0}")]
    InvalidPayload(#[source] serde_json::Error),

    /// Every worker slot is busy or restarting.
    #[error("No idle worker available")]
    NoIdleWorker,

    /// Worker initialization failed.
    #[error("Worker initialization failed: {0}")]
    WorkerInitFailed(String),

    /// A worker died while it held a job.
    #[error("Worker #{worker_id} crashed: {reason}")]
    WorkerCrashed { worker_id: usize, reason: String },

    /// The worker reported that the job failed.
    #[error("Job {job_id} failed: {error}")]
    JobFailed { job_id: String, error: String },

    /// The job exceeded its execution budget.
    #[error("Job {job_id} timed out after {timeout:?}")]
    JobTimeout { job_id: String, timeout: Duration },

    /// The completion signal was lost before the job finished.
    #[error("Completion signal for job {0} was dropped")]
    CompletionLost(String),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// Worker process I/O failed.
    #[error("Worker I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during startup recovery.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("Recovery queue operation failed: {0}")]
    Queue(#[from] QueueError),
}

/// Errors raised while building a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },

    #[error("{0} must be greater than zero")]
    MustBePositive(&'static str),
}
