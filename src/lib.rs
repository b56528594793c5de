//! jobforge: persistent, crash-recoverable job dispatch over Redis.
//!
//! This library moves opaque JSON jobs from a durable Redis queue onto a
//! fixed pool of long-lived workers, tracks each job in a status record and
//! reconciles leftovers of an unclean exit on the next start.

// Core modules
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod scheduler;

// Re-export commonly used types
pub use config::QueueConfig;
pub use error::{ConfigError, PoolError, QueueError, RecoveryError};
pub use scheduler::{Job, JobStatus, ProcessingQueue};
