//! Engine configuration.
//!
//! `QueueConfig` carries every tunable of one processing queue. Build it with
//! `QueueConfig::new(name)` and the `with_*` setters, or overlay environment
//! variables with `QueueConfig::from_env()`.
//!
//! | Variable | Field |
//! |----------|-------|
//! | `JOBFORGE_QUEUE` | `queue_name` |
//! | `JOBFORGE_REDIS_URL`, `REDIS_URL` | `redis_url` |
//! | `JOBFORGE_MAX_CONCURRENT_JOBS` | `max_concurrent_jobs` |
//! | `JOBFORGE_BATCH_SIZE` | `batch_size` |
//! | `JOBFORGE_STATUS_TTL_SECS` | `status_ttl` |
//! | `JOBFORGE_STARTUP_LOCK_TTL_SECS` | `startup_lock_ttl` |
//! | `JOBFORGE_JOB_TIMEOUT_SECS` | `job_timeout` |
//! | `JOBFORGE_SHUTDOWN_TIMEOUT_SECS` | `shutdown_timeout` |
//! | `CPU_LOAD_THRESHOLD` | `load_thresholds.cpu_percent` |
//! | `RAM_LOAD_THRESHOLD` | `load_thresholds.memory_percent` |
//! | `JOBFORGE_BREAKER_THRESHOLD` | `circuit_breaker.failure_threshold` |
//! | `JOBFORGE_BREAKER_TIMEOUT_SECS` | `circuit_breaker.timeout` |

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::scheduler::circuit_breaker::CircuitBreakerConfig;
use crate::scheduler::dispatcher::{BackoffConfig, DispatcherConfig};
use crate::scheduler::load::LoadThresholds;
use crate::scheduler::worker_pool::{default_pool_size, WorkerPoolConfig};

/// Default Redis endpoint.
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// Configuration for one processing queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Logical queue name. Keys derive from `{queue_name}_queue`.
    pub queue_name: String,
    pub redis_url: String,
    /// Number of workers, and so the most jobs in flight at once.
    pub max_concurrent_jobs: usize,
    /// Most jobs fetched per dispatcher iteration.
    pub batch_size: usize,
    /// Lifetime of each status record write.
    pub status_ttl: Duration,
    pub startup_lock_ttl: Duration,
    pub idle_poll_interval: Duration,
    pub pause_poll_interval: Duration,
    pub job_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub crash_window: Duration,
    pub max_consecutive_crashes: u32,
    pub crash_backoff: Duration,
    pub no_jobs_backoff: BackoffConfig,
    pub overload_backoff: BackoffConfig,
    pub error_backoff_step: Duration,
    pub error_backoff_max: Duration,
    pub circuit_breaker: CircuitBreakerConfig,
    pub load_thresholds: LoadThresholds,
    /// SCAN page size hint used by recovery.
    pub recovery_scan_count: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_name: "jobs".to_string(),
            redis_url: DEFAULT_REDIS_URL.to_string(),
            max_concurrent_jobs: default_pool_size(),
            batch_size: 20,
            status_ttl: Duration::from_secs(86_400),
            startup_lock_ttl: Duration::from_secs(30),
            idle_poll_interval: Duration::from_millis(100),
            pause_poll_interval: Duration::from_millis(500),
            job_timeout: Duration::from_secs(30 * 60),
            shutdown_timeout: Duration::from_secs(60),
            crash_window: Duration::from_secs(60),
            max_consecutive_crashes: 5,
            crash_backoff: Duration::from_secs(1),
            no_jobs_backoff: BackoffConfig::no_jobs(),
            overload_backoff: BackoffConfig::overload(),
            error_backoff_step: Duration::from_secs(1),
            error_backoff_max: Duration::from_secs(30),
            circuit_breaker: CircuitBreakerConfig::default(),
            load_thresholds: LoadThresholds::default(),
            recovery_scan_count: 100,
        }
    }
}

impl QueueConfig {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..Default::default()
        }
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_max_concurrent_jobs(mut self, jobs: usize) -> Self {
        self.max_concurrent_jobs = jobs;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_status_ttl(mut self, ttl: Duration) -> Self {
        self.status_ttl = ttl;
        self
    }

    pub fn with_startup_lock_ttl(mut self, ttl: Duration) -> Self {
        self.startup_lock_ttl = ttl;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = breaker;
        self
    }

    pub fn with_load_thresholds(mut self, thresholds: LoadThresholds) -> Self {
        self.load_thresholds = thresholds;
        self
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup("JOBFORGE_QUEUE") {
            config.queue_name = name;
        }
        if let Some(url) = lookup("JOBFORGE_REDIS_URL").or_else(|| lookup("REDIS_URL")) {
            config.redis_url = url;
        }
        if let Some(jobs) = parse(&lookup, "JOBFORGE_MAX_CONCURRENT_JOBS")? {
            config.max_concurrent_jobs = jobs;
        }
        if let Some(batch) = parse(&lookup, "JOBFORGE_BATCH_SIZE")? {
            config.batch_size = batch;
        }
        if let Some(secs) = parse(&lookup, "JOBFORGE_STATUS_TTL_SECS")? {
            config.status_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&lookup, "JOBFORGE_STARTUP_LOCK_TTL_SECS")? {
            config.startup_lock_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&lookup, "JOBFORGE_JOB_TIMEOUT_SECS")? {
            config.job_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&lookup, "JOBFORGE_SHUTDOWN_TIMEOUT_SECS")? {
            config.shutdown_timeout = Duration::from_secs(secs);
        }
        if let Some(percent) = parse(&lookup, "CPU_LOAD_THRESHOLD")? {
            config.load_thresholds.cpu_percent = percent;
        }
        if let Some(percent) = parse(&lookup, "RAM_LOAD_THRESHOLD")? {
            config.load_thresholds.memory_percent = percent;
        }
        if let Some(threshold) = parse(&lookup, "JOBFORGE_BREAKER_THRESHOLD")? {
            config.circuit_breaker.failure_threshold = threshold;
        }
        if let Some(secs) = parse(&lookup, "JOBFORGE_BREAKER_TIMEOUT_SECS")? {
            config.circuit_breaker.timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks values that would stall or spin the engine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "queue_name".to_string(),
                value: self.queue_name.clone(),
            });
        }
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::MustBePositive("max_concurrent_jobs"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::MustBePositive("batch_size"));
        }
        if self.status_ttl.is_zero() {
            return Err(ConfigError::MustBePositive("status_ttl"));
        }
        if self.startup_lock_ttl.is_zero() {
            return Err(ConfigError::MustBePositive("startup_lock_ttl"));
        }
        if self.job_timeout.is_zero() {
            return Err(ConfigError::MustBePositive("job_timeout"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::MustBePositive("circuit_breaker.failure_threshold"));
        }
        for (key, backoff) in [
            ("no_jobs_backoff.multiplier", &self.no_jobs_backoff),
            ("overload_backoff.multiplier", &self.overload_backoff),
        ] {
            if backoff.multiplier.is_nan() || backoff.multiplier < 1.0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: backoff.multiplier.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::new(self.max_concurrent_jobs)
            .with_job_timeout(self.job_timeout)
            .with_shutdown_timeout(self.shutdown_timeout)
            .with_crash_window(self.crash_window)
            .with_max_consecutive_crashes(self.max_consecutive_crashes)
            .with_crash_backoff(self.crash_backoff)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            batch_size: self.batch_size,
            idle_poll_interval: self.idle_poll_interval,
            pause_poll_interval: self.pause_poll_interval,
            no_jobs_backoff: self.no_jobs_backoff,
            overload_backoff: self.overload_backoff,
            error_backoff_step: self.error_backoff_step,
            error_backoff_max: self.error_backoff_max,
            circuit_breaker: self.circuit_breaker,
        }
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
    }
}
