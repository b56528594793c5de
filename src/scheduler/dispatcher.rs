//! The dispatch loop.
//!
//! A single task that, once per iteration, decides whether to sleep or to
//! move a batch of jobs from the queue onto idle workers. Every sleep has a
//! cause, and the causes keep independent backoff state:
//!
//! ```text
//! shutdown? ─▶ exit
//! paused?   ─▶ sleep pause_poll_interval
//! breaker?  ─▶ sleep breaker timeout / 10
//! overload? ─▶ sleep overload backoff (grows ×2)
//! no idle   ─▶ sleep idle_poll_interval
//! no jobs   ─▶ sleep no-jobs backoff (grows ×1.2)
//! jobs      ─▶ dispatch all, reset no-jobs backoff and breaker
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use super::load::LoadMonitor;
use super::queue::QueueManager;
use super::worker_pool::{DispatchHandle, WorkerPoolManager};
use crate::error::{PoolError, QueueError};
use crate::metrics::MetricsCollector;

/// Shape of one exponential backoff.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl BackoffConfig {
    /// Backoff used while the queue is empty.
    pub fn no_jobs() -> Self {
        Self {
            initial: Duration::from_millis(100),
            multiplier: 1.2,
            max: Duration::from_secs(5),
        }
    }

    /// Backoff used while the host is overloaded.
    pub fn overload() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        }
    }
}

/// Exponential backoff state for one sleep cause.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial.min(config.max),
            config,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Returns the current delay and grows the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.grown();
        delay
    }

    /// Grows the delay and returns it.
    pub fn escalate(&mut self) -> Duration {
        self.current = self.grown();
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.config.initial.min(self.config.max);
    }

    fn grown(&self) -> Duration {
        let next = (self.current.as_nanos() as f64 * self.config.multiplier).round();
        let max = self.config.max.as_nanos() as f64;
        Duration::from_nanos(next.min(max) as u64)
    }
}

/// Tuning for the dispatch loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatcherConfig {
    /// Upper bound on jobs fetched per iteration.
    pub batch_size: usize,
    /// Sleep while every worker is busy.
    pub idle_poll_interval: Duration,
    /// Sleep while paused.
    pub pause_poll_interval: Duration,
    pub no_jobs_backoff: BackoffConfig,
    pub overload_backoff: BackoffConfig,
    /// Loop-error sleep per consecutive breaker failure.
    pub error_backoff_step: Duration,
    pub error_backoff_max: Duration,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            idle_poll_interval: Duration::from_millis(100),
            pause_poll_interval: Duration::from_millis(500),
            no_jobs_backoff: BackoffConfig::no_jobs(),
            overload_backoff: BackoffConfig::overload(),
            error_backoff_step: Duration::from_secs(1),
            error_backoff_max: Duration::from_secs(30),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Handle for steering a running dispatcher from other tasks.
#[derive(Debug, Clone)]
pub struct DispatcherControl {
    shutdown: Arc<watch::Sender<bool>>,
    paused: Arc<AtomicBool>,
}

impl DispatcherControl {
    pub fn new() -> Self {
        Self::with_pause_flag(Arc::new(AtomicBool::new(false)))
    }

    /// Shares an existing pause flag, so pausing survives a restart.
    pub fn with_pause_flag(paused: Arc<AtomicBool>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown: Arc::new(shutdown),
            paused,
        }
    }

    /// Asks the loop to exit and wakes it if it is sleeping.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

impl Default for DispatcherControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the loop is about to sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepReason {
    Paused,
    CircuitOpen,
    Overloaded,
    NoWorkers,
    NoJobs,
    LoopError,
}

impl SleepReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SleepReason::Paused => "paused",
            SleepReason::CircuitOpen => "circuit_open",
            SleepReason::Overloaded => "overloaded",
            SleepReason::NoWorkers => "no_workers",
            SleepReason::NoJobs => "no_jobs",
            SleepReason::LoopError => "loop_error",
        }
    }
}

/// The decision made by one loop iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum Tick {
    Exit,
    Sleep {
        duration: Duration,
        reason: SleepReason,
    },
    /// A batch was fetched; `rejected` entries did not reach a worker.
    Dispatched { fetched: usize, rejected: usize },
}

/// Moves jobs from the queue onto idle workers.
pub struct JobDispatcher {
    config: DispatcherConfig,
    queue: Arc<QueueManager>,
    pool: Arc<WorkerPoolManager>,
    load: Arc<dyn LoadMonitor>,
    breaker: CircuitBreaker,
    no_jobs: Backoff,
    overload: Backoff,
    control: DispatcherControl,
    shutdown_rx: watch::Receiver<bool>,
    starved_iterations: u64,
    metrics: MetricsCollector,
}

impl JobDispatcher {
    pub fn new(
        config: DispatcherConfig,
        queue: Arc<QueueManager>,
        pool: Arc<WorkerPoolManager>,
        load: Arc<dyn LoadMonitor>,
        control: DispatcherControl,
    ) -> Self {
        Self {
            breaker: CircuitBreaker::new(config.circuit_breaker),
            no_jobs: Backoff::new(config.no_jobs_backoff),
            overload: Backoff::new(config.overload_backoff),
            shutdown_rx: control.subscribe(),
            control,
            config,
            queue,
            pool,
            load,
            starved_iterations: 0,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn control(&self) -> DispatcherControl {
        self.control.clone()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Runs until `DispatcherControl::shutdown` is called.
    ///
    /// In-flight jobs are left to the pool.
    pub async fn run(mut self) {
        info!(
            queue = %self.queue.queue_name(),
            batch_size = self.config.batch_size,
            "Job dispatcher started"
        );

        loop {
            match self.tick().await {
                Tick::Exit => break,
                Tick::Sleep { duration, .. } => {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {}
                        _ = self.shutdown_rx.changed() => {}
                    }
                }
                Tick::Dispatched { .. } => tokio::task::yield_now().await,
            }
        }

        info!(queue = %self.queue.queue_name(), "Job dispatcher stopped");
    }

    /// Makes one scheduling decision.
    pub async fn tick(&mut self) -> Tick {
        if self.control.is_shutdown() {
            return Tick::Exit;
        }

        if self.control.is_paused() {
            return self.sleep(SleepReason::Paused, self.config.pause_poll_interval);
        }

        if self.breaker.is_open() {
            self.metrics.update_circuit(self.queue.queue_name(), true);
            let delay = self.breaker.timeout() / 10;
            debug!(
                failures = self.breaker.failure_count(),
                delay_ms = delay.as_millis(),
                "Circuit breaker open, skipping dispatch"
            );
            return self.sleep(SleepReason::CircuitOpen, delay);
        }

        match self.dispatch_once().await {
            Ok(tick) => tick,
            Err(e) => self.handle_loop_error(e),
        }
    }

    async fn dispatch_once(&mut self) -> Result<Tick, QueueError> {
        let load = self.load.check_server_load().await;
        if load.overloaded {
            let delay = self.overload.escalate();
            warn!(
                cpu_percent = load.cpu_percent,
                memory_percent = load.memory_percent,
                reason = load.reason.as_deref().unwrap_or("unknown"),
                delay_ms = delay.as_millis(),
                "Server overloaded, backing off"
            );
            return Ok(self.sleep(SleepReason::Overloaded, delay));
        }
        self.overload.reset();

        let count = self
            .pool
            .available_worker_count()
            .min(self.config.batch_size);
        if count == 0 {
            self.starved_iterations += 1;
            if self.starved_iterations % 50 == 0 {
                warn!(
                    iterations = self.starved_iterations,
                    pool_size = self.pool.pool_size(),
                    "No idle workers available"
                );
            }
            return Ok(self.sleep(SleepReason::NoWorkers, self.config.idle_poll_interval));
        }
        self.starved_iterations = 0;

        let jobs = self.queue.fetch_jobs(count).await?;
        if jobs.is_empty() {
            let delay = self.no_jobs.next_delay();
            return Ok(self.sleep(SleepReason::NoJobs, delay));
        }

        self.no_jobs.reset();
        self.breaker.reset();
        self.metrics.update_circuit(self.queue.queue_name(), false);

        let fetched = jobs.len();
        debug!(fetched, requested = count, "Fetched jobs for dispatch");
        let rejected = self.dispatch_batch(jobs).await;
        Ok(Tick::Dispatched { fetched, rejected })
    }

    /// Hands every fetched entry to the pool concurrently.
    ///
    /// Returns how many entries were routed back instead of reaching a worker.
    async fn dispatch_batch(&mut self, jobs: Vec<String>) -> usize {
        let pool = &self.pool;
        let outcomes = join_all(jobs.into_iter().map(|raw| async move {
            let outcome = pool.dispatch_job(raw.clone()).await;
            (raw, outcome)
        }))
        .await;

        let mut rejected = 0;
        for (raw, outcome) in outcomes {
            match outcome {
                Ok(handle) => {
                    tokio::spawn(watch_completion(handle));
                }
                Err(PoolError::InvalidPayload(e)) => {
                    rejected += 1;
                    error!(error = %e, "Unparseable queue entry, moving to dead letter");
                    if let Err(e) = self.queue.dead_letter(&raw).await {
                        error!(error = %e, "Failed to dead-letter entry");
                    }
                }
                Err(e) => {
                    rejected += 1;
                    warn!(error = %e, "Dispatch failed, returning job to the queue");
                    if !matches!(e, PoolError::NoIdleWorker) {
                        self.breaker.record_failure();
                    }
                    if let Err(e) = self.queue.handle_failed_dispatch(&raw).await {
                        error!(error = %e, "Failed to return job to the queue");
                    }
                }
            }
        }

        if self.breaker.is_open() {
            self.metrics.update_circuit(self.queue.queue_name(), true);
        }
        rejected
    }

    fn handle_loop_error(&mut self, err: QueueError) -> Tick {
        if self.control.is_shutdown() {
            if err.is_connection_closed() {
                debug!("Store connection closed during shutdown");
            } else {
                warn!(error = %err, "Dispatch error during shutdown");
            }
            return Tick::Exit;
        }

        self.breaker.record_failure();
        let failures = self.breaker.failure_count().max(1);
        let delay = (self.config.error_backoff_step * failures).min(self.config.error_backoff_max);
        error!(
            error = %err,
            failures,
            delay_ms = delay.as_millis(),
            "Dispatch loop error"
        );
        if self.breaker.is_open() {
            self.metrics.update_circuit(self.queue.queue_name(), true);
        }
        self.sleep(SleepReason::LoopError, delay)
    }

    fn sleep(&self, reason: SleepReason, duration: Duration) -> Tick {
        self.metrics
            .record_backoff(self.queue.queue_name(), reason.as_str(), duration);
        Tick::Sleep { duration, reason }
    }
}

async fn watch_completion(handle: DispatchHandle) {
    let job_id = handle.job_id().to_string();
    match handle.await {
        Ok(result) => debug!(job_id = %job_id, duration_ms = result.duration_ms, "Job acknowledged"),
        Err(e) => debug!(job_id = %job_id, error = %e, "Job did not complete"),
    }
}
