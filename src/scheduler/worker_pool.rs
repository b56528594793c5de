//! Fixed-size pool of long-lived workers.
//!
//! The pool owns one slot per worker. The dispatcher asks how many slots are
//! idle, pulls that many jobs, and hands each raw entry to `dispatch_job`,
//! which claims a slot and returns a `DispatchHandle` resolving when the
//! worker acknowledges the job.
//!
//! # Features
//!
//! - Pluggable worker transport (`WorkerFactory`): child processes speaking
//!   newline-delimited JSON, or in-process async handlers
//! - Progress reports written to the job's status record
//! - Per-job timeout; the worker is killed and replaced
//! - Crash detection with delayed respawn once crashes pile up
//! - Graceful shutdown bounded by a timeout
//!
//! # Worker protocol
//!
//! A process worker reads one `{"job": <Job>}` line per job on stdin and
//! answers on stdout with any number of
//! `{"status":"progress","progress":0.4,"message":"..."}` lines followed by
//! exactly one `{"status":"completed","result":...}` or
//! `{"status":"failed","error":"..."}` line. Other output is ignored. If the
//! process exits while holding a job, the job fails as crashed.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::job::{InFlightJob, Job, JobResult};
use super::queue::QueueManager;
use crate::error::PoolError;
use crate::metrics::MetricsCollector;

/// Default pool size: three quarters of the CPUs, at least two.
pub fn default_pool_size() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus * 3 / 4).max(2)
}

/// Configuration for the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerPoolConfig {
    /// Number of worker slots.
    pub pool_size: usize,
    /// Maximum time allowed for processing a single job.
    pub job_timeout: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
    /// Crashes further apart than this do not count as consecutive.
    pub crash_window: Duration,
    /// Consecutive crashes after which respawns are delayed.
    pub max_consecutive_crashes: u32,
    /// Base respawn delay once in a crash loop.
    pub crash_backoff: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            job_timeout: Duration::from_secs(1800), // 30 minutes
            shutdown_timeout: Duration::from_secs(60),
            crash_window: Duration::from_secs(60),
            max_consecutive_crashes: 5,
            crash_backoff: Duration::from_secs(1),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool_size,
            ..Default::default()
        }
    }

    /// Sets the job timeout.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the window in which crashes count as consecutive.
    pub fn with_crash_window(mut self, window: Duration) -> Self {
        self.crash_window = window;
        self
    }

    /// Sets the crash count that triggers delayed respawns.
    pub fn with_max_consecutive_crashes(mut self, crashes: u32) -> Self {
        self.max_consecutive_crashes = crashes;
        self
    }

    /// Sets the base respawn delay.
    pub fn with_crash_backoff(mut self, backoff: Duration) -> Self {
        self.crash_backoff = backoff;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Total number of worker slots.
    pub pool_size: usize,
    /// Slots ready to take a job.
    pub idle_workers: usize,
    /// Number of workers currently processing jobs.
    pub active_workers: usize,
    /// Total number of jobs completed successfully.
    pub jobs_completed: u64,
    /// Total number of jobs that failed, crashed or timed out.
    pub jobs_failed: u64,
    /// Workers that died or were killed while holding a job.
    pub workers_crashed: u64,
    /// Average job processing duration.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of jobs processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    workers_crashed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            workers_crashed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_completion(&self, duration: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_crash(&self) {
        self.workers_crashed.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_active(&self) -> u64 {
        self.active_workers.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn decrement_active(&self) -> u64 {
        self.active_workers.fetch_sub(1, Ordering::SeqCst) - 1
    }

    fn active(&self) -> u64 {
        self.active_workers.load(Ordering::SeqCst)
    }

    fn to_pool_stats(&self, pool_size: usize, idle_workers: usize) -> PoolStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total_jobs = completed + failed;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            pool_size,
            idle_workers,
            active_workers: self.active() as usize,
            jobs_completed: completed,
            jobs_failed: failed,
            workers_crashed: self.workers_crashed.load(Ordering::SeqCst),
            average_job_duration: average_duration,
        }
    }
}

/// Tracks crashes that happen in quick succession.
#[derive(Debug)]
struct CrashTracker {
    window: Duration,
    max_consecutive: u32,
    backoff: Duration,
    consecutive: u32,
    last_crash: Option<Instant>,
}

impl CrashTracker {
    fn new(config: &WorkerPoolConfig) -> Self {
        Self {
            window: config.crash_window,
            max_consecutive: config.max_consecutive_crashes,
            backoff: config.crash_backoff,
            consecutive: 0,
            last_crash: None,
        }
    }

    /// Records a crash and returns how long to wait before respawning.
    fn record_crash(&mut self) -> Duration {
        let now = Instant::now();
        self.consecutive = match self.last_crash {
            Some(last) if now.duration_since(last) <= self.window => {
                self.consecutive.saturating_add(1)
            }
            _ => 1,
        };
        self.last_crash = Some(now);

        if self.in_crash_loop() {
            self.backoff * self.consecutive.min(5)
        } else {
            Duration::ZERO
        }
    }

    /// A worker finished a job, so the crash streak is broken.
    fn record_success(&mut self) {
        self.consecutive = 0;
        self.last_crash = None;
    }

    fn in_crash_loop(&self) -> bool {
        self.consecutive >= self.max_consecutive
    }
}

/// A progress report from a running job.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerProgress {
    pub progress: Option<f64>,
    pub message: Option<String>,
}

/// How a worker finished a job it was able to process.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReport {
    Completed { result: Option<serde_json::Value> },
    Failed { error: String },
}

/// A long-lived worker occupying one pool slot.
///
/// `run` returns `Err` only when the worker itself is broken (exited, pipe
/// closed); the pool then terminates and replaces it.
#[async_trait]
pub trait Worker: Send {
    fn id(&self) -> usize;

    async fn run(
        &mut self,
        job: &Job,
        progress: mpsc::UnboundedSender<WorkerProgress>,
    ) -> Result<WorkerReport, PoolError>;

    async fn terminate(&mut self);
}

/// Creates workers for pool slots.
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    async fn spawn(&self, worker_id: usize) -> Result<Box<dyn Worker>, PoolError>;
}

/// Messages a process worker writes to stdout.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
enum WorkerMessage {
    Progress {
        #[serde(default)]
        progress: Option<f64>,
        #[serde(default)]
        message: Option<String>,
    },
    Completed {
        #[serde(default)]
        result: Option<serde_json::Value>,
    },
    Failed {
        #[serde(default)]
        error: Option<String>,
    },
}

#[derive(Serialize)]
struct JobEnvelope<'a> {
    job: &'a Job,
}

/// Spawns one child process per slot.
#[derive(Debug, Clone)]
pub struct ProcessWorkerFactory {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl ProcessWorkerFactory {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl WorkerFactory for ProcessWorkerFactory {
    async fn spawn(&self, worker_id: usize) -> Result<Box<dyn Worker>, PoolError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("JOBFORGE_WORKER_ID", worker_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| PoolError::WorkerInitFailed(format!("{}: {}", self.program, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::WorkerInitFailed("worker stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::WorkerInitFailed("worker stdout not captured".to_string()))?;

        debug!(worker_id, pid = ?child.id(), program = %self.program, "Spawned worker process");

        Ok(Box::new(ProcessWorker {
            id: worker_id,
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        }))
    }
}

/// A child process speaking the line protocol.
pub struct ProcessWorker {
    id: usize,
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl ProcessWorker {
    async fn send(&mut self, job: &Job) -> std::io::Result<()> {
        let mut line = serde_json::to_string(&JobEnvelope { job })?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await
    }

    async fn exit_error(&mut self) -> PoolError {
        match self.child.wait().await {
            Ok(status) => {
                let reason = match status.code() {
                    Some(code) => format!("Worker exited with code {}", code),
                    None => "Worker terminated by signal".to_string(),
                };
                PoolError::WorkerCrashed {
                    worker_id: self.id,
                    reason,
                }
            }
            Err(e) => PoolError::Io(e),
        }
    }
}

#[async_trait]
impl Worker for ProcessWorker {
    fn id(&self) -> usize {
        self.id
    }

    async fn run(
        &mut self,
        job: &Job,
        progress: mpsc::UnboundedSender<WorkerProgress>,
    ) -> Result<WorkerReport, PoolError> {
        if let Err(e) = self.send(job).await {
            debug!(worker_id = self.id, error = %e, "Could not write job to worker");
            return Err(self.exit_error().await);
        }

        loop {
            let Some(line) = self.stdout.next_line().await? else {
                return Err(self.exit_error().await);
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match serde_json::from_str::<WorkerMessage>(line) {
                Ok(WorkerMessage::Progress {
                    progress: value,
                    message,
                }) => {
                    let _ = progress.send(WorkerProgress {
                        progress: value,
                        message,
                    });
                }
                Ok(WorkerMessage::Completed { result }) => {
                    return Ok(WorkerReport::Completed { result });
                }
                Ok(WorkerMessage::Failed { error }) => {
                    return Ok(WorkerReport::Failed {
                        error: error.unwrap_or_else(|| "Unknown error".to_string()),
                    });
                }
                Err(_) => {
                    debug!(worker_id = self.id, output = %line, "Ignoring worker output");
                }
            }
        }
    }

    async fn terminate(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!(worker_id = self.id, error = %e, "Worker already gone");
        }
    }
}

/// Async job handler run by in-process workers.
pub type JobHandler = Arc<
    dyn Fn(Job, mpsc::UnboundedSender<WorkerProgress>) -> BoxFuture<'static, Result<WorkerReport, PoolError>>
        + Send
        + Sync,
>;

/// Runs jobs as async functions inside this process.
#[derive(Clone)]
pub struct InProcessWorkerFactory {
    handler: JobHandler,
}

impl InProcessWorkerFactory {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Job, mpsc::UnboundedSender<WorkerProgress>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<WorkerReport, PoolError>> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |job, progress| Box::pin(handler(job, progress))),
        }
    }
}

#[async_trait]
impl WorkerFactory for InProcessWorkerFactory {
    async fn spawn(&self, worker_id: usize) -> Result<Box<dyn Worker>, PoolError> {
        Ok(Box::new(InProcessWorker {
            id: worker_id,
            handler: Arc::clone(&self.handler),
        }))
    }
}

struct InProcessWorker {
    id: usize,
    handler: JobHandler,
}

#[async_trait]
impl Worker for InProcessWorker {
    fn id(&self) -> usize {
        self.id
    }

    async fn run(
        &mut self,
        job: &Job,
        progress: mpsc::UnboundedSender<WorkerProgress>,
    ) -> Result<WorkerReport, PoolError> {
        (self.handler)(job.clone(), progress).await
    }

    async fn terminate(&mut self) {}
}

/// Resolves when the worker acknowledges the dispatched job.
#[derive(Debug)]
pub struct DispatchHandle {
    job_id: String,
    done: oneshot::Receiver<Result<JobResult, PoolError>>,
}

impl DispatchHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

impl Future for DispatchHandle {
    type Output = Result<JobResult, PoolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.done).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(PoolError::CompletionLost(self.job_id.clone()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

enum Slot {
    Idle(Box<dyn Worker>),
    Busy { worker_id: usize, job_id: String },
    Starting,
    Stopped,
}

struct PoolShared {
    config: WorkerPoolConfig,
    queue: Arc<QueueManager>,
    factory: Arc<dyn WorkerFactory>,
    slots: Mutex<Vec<Slot>>,
    stats: SharedPoolStats,
    crashes: Mutex<CrashTracker>,
    running: AtomicBool,
    next_worker_id: AtomicUsize,
    drained: Notify,
    metrics: MetricsCollector,
}

impl PoolShared {
    fn slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn crashes(&self) -> MutexGuard<'_, CrashTracker> {
        self.crashes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> usize {
        self.next_worker_id.fetch_add(1, Ordering::SeqCst)
    }

    fn idle_count(&self) -> usize {
        self.slots()
            .iter()
            .filter(|slot| matches!(slot, Slot::Idle(_)))
            .count()
    }

    fn claim(&self, job_id: &str) -> Option<(usize, Box<dyn Worker>)> {
        let mut slots = self.slots();
        let index = slots.iter().position(|slot| matches!(slot, Slot::Idle(_)))?;
        let worker_id = match &slots[index] {
            Slot::Idle(worker) => worker.id(),
            _ => return None,
        };
        let busy = Slot::Busy {
            worker_id,
            job_id: job_id.to_string(),
        };
        match std::mem::replace(&mut slots[index], busy) {
            Slot::Idle(worker) => Some((index, worker)),
            other => {
                slots[index] = other;
                None
            }
        }
    }

    /// Returns a worker to its slot. Hands it back if the pool has stopped.
    fn park(&self, index: usize, worker: Box<dyn Worker>) -> Option<Box<dyn Worker>> {
        let mut slots = self.slots();
        let running = self.running.load(Ordering::SeqCst);
        match slots.get_mut(index) {
            Some(slot) if running => {
                *slot = Slot::Idle(worker);
                None
            }
            Some(slot) => {
                *slot = Slot::Stopped;
                Some(worker)
            }
            None => Some(worker),
        }
    }

    fn set_slot(&self, index: usize, state: Slot) {
        if let Some(slot) = self.slots().get_mut(index) {
            *slot = state;
        }
    }

    fn take_idle(&self) -> Vec<Box<dyn Worker>> {
        let mut idle = Vec::new();
        for slot in self.slots().iter_mut() {
            if matches!(slot, Slot::Idle(_)) {
                if let Slot::Idle(worker) = std::mem::replace(slot, Slot::Stopped) {
                    idle.push(worker);
                }
            }
        }
        idle
    }

    async fn release(&self, index: usize, worker: Box<dyn Worker>) {
        if let Some(mut worker) = self.park(index, worker) {
            worker.terminate().await;
        }
    }

    async fn execute(
        self: Arc<Self>,
        index: usize,
        mut worker: Box<dyn Worker>,
        in_flight: InFlightJob,
        done: oneshot::Sender<Result<JobResult, PoolError>>,
    ) {
        let queue_name = self.queue.queue_name().to_string();
        let worker_id = in_flight.worker_id;
        let job_id = in_flight.job_id().to_string();
        let started = Instant::now();

        info!(
            queue = %queue_name,
            worker_id,
            job_id = %job_id,
            attempt = in_flight.attempt,
            "Processing job"
        );

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward_progress(
            Arc::clone(&self.queue),
            in_flight.clone(),
            progress_rx,
        ));

        let run = tokio::time::timeout(
            self.config.job_timeout,
            worker.run(&in_flight.job, progress_tx),
        )
        .await;

        // Progress writes must land before the terminal status.
        if let Err(e) = forwarder.await {
            warn!(worker_id, job_id = %job_id, error = %e, "Progress forwarder failed");
        }
        let elapsed = started.elapsed();

        let (outcome, healthy) = match run {
            Ok(Ok(WorkerReport::Completed { result })) => {
                self.stats.record_completion(elapsed);
                self.crashes().record_success();
                self.metrics
                    .record_job_finished(&queue_name, "completed", elapsed);

                let outcome = match self.queue.complete(&in_flight, result.clone(), elapsed).await {
                    Ok(()) => {
                        info!(
                            worker_id,
                            job_id = %job_id,
                            duration_ms = elapsed.as_millis(),
                            "Job completed successfully"
                        );
                        Ok(JobResult::success(
                            job_id.clone(),
                            worker_id,
                            result,
                            elapsed.as_millis() as u64,
                        ))
                    }
                    Err(e) => {
                        error!(worker_id, job_id = %job_id, error = %e, "Failed to mark job complete");
                        Err(PoolError::Queue(e))
                    }
                };
                (outcome, true)
            }
            Ok(Ok(WorkerReport::Failed { error })) => {
                self.stats.record_failure(elapsed);
                self.crashes().record_success();
                self.metrics
                    .record_job_finished(&queue_name, "failed", elapsed);

                warn!(worker_id, job_id = %job_id, error = %error, "Job reported failure");
                if let Err(e) = self.queue.fail(&in_flight, &error, elapsed, false).await {
                    error!(worker_id, job_id = %job_id, error = %e, "Failed to mark job failed");
                }
                (
                    Err(PoolError::JobFailed {
                        job_id: job_id.clone(),
                        error,
                    }),
                    true,
                )
            }
            Ok(Err(e)) => {
                let reason = match e {
                    PoolError::WorkerCrashed { reason, .. } => reason,
                    other => other.to_string(),
                };
                self.stats.record_failure(elapsed);
                self.stats.record_crash();
                self.metrics
                    .record_job_finished(&queue_name, "crashed", elapsed);

                error!(worker_id, job_id = %job_id, reason = %reason, "Worker crashed during job");
                if let Err(e) = self.queue.fail(&in_flight, &reason, elapsed, true).await {
                    error!(worker_id, job_id = %job_id, error = %e, "Failed to record worker crash");
                }
                (Err(PoolError::WorkerCrashed { worker_id, reason }), false)
            }
            Err(_) => {
                let timeout = self.config.job_timeout;
                let reason = format!("Job timed out after {:?}", timeout);
                self.stats.record_failure(elapsed);
                self.stats.record_crash();
                self.metrics
                    .record_job_finished(&queue_name, "timeout", elapsed);

                warn!(worker_id, job_id = %job_id, timeout_ms = timeout.as_millis(), "Job timed out, killing worker");
                if let Err(e) = self.queue.fail(&in_flight, &reason, elapsed, true).await {
                    error!(worker_id, job_id = %job_id, error = %e, "Failed to record job timeout");
                }
                (
                    Err(PoolError::JobTimeout {
                        job_id: job_id.clone(),
                        timeout,
                    }),
                    false,
                )
            }
        };

        if healthy {
            self.release(index, worker).await;
        } else {
            worker.terminate().await;
            self.set_slot(index, Slot::Starting);
        }

        let active = self.stats.decrement_active();
        self.metrics
            .update_active_workers(&queue_name, active as usize);
        let _ = done.send(outcome);
        self.drained.notify_waiters();

        if !healthy {
            self.respawn(index).await;
        }
    }

    async fn respawn(&self, index: usize) {
        let mut delay = self.crashes().record_crash();

        loop {
            if !delay.is_zero() {
                warn!(
                    slot = index,
                    delay_ms = delay.as_millis(),
                    "Workers crashing repeatedly, delaying respawn"
                );
                tokio::time::sleep(delay).await;
            }

            if !self.running.load(Ordering::SeqCst) {
                self.set_slot(index, Slot::Stopped);
                return;
            }

            let worker_id = self.next_id();
            match self.factory.spawn(worker_id).await {
                Ok(worker) => {
                    info!(slot = index, worker_id, "Replacement worker started");
                    self.release(index, worker).await;
                    return;
                }
                Err(e) => {
                    error!(slot = index, worker_id, error = %e, "Failed to start replacement worker");
                    delay = self
                        .crashes()
                        .record_crash()
                        .max(self.config.crash_backoff);
                }
            }
        }
    }
}

async fn forward_progress(
    queue: Arc<QueueManager>,
    in_flight: InFlightJob,
    mut updates: mpsc::UnboundedReceiver<WorkerProgress>,
) {
    while let Some(update) = updates.recv().await {
        debug!(job_id = %in_flight.job_id(), progress = ?update.progress, "Job progress");
        if let Err(e) = queue
            .record_progress(&in_flight, update.progress, update.message)
            .await
        {
            warn!(job_id = %in_flight.job_id(), error = %e, "Failed to record job progress");
        }
    }
}

/// Manages a fixed set of workers and dispatches jobs onto them.
pub struct WorkerPoolManager {
    shared: Arc<PoolShared>,
}

impl WorkerPoolManager {
    /// Creates a pool. Workers are spawned by `start`.
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<QueueManager>,
        factory: Arc<dyn WorkerFactory>,
    ) -> Self {
        let crashes = CrashTracker::new(&config);
        Self {
            shared: Arc::new(PoolShared {
                config,
                queue,
                factory,
                slots: Mutex::new(Vec::new()),
                stats: SharedPoolStats::new(),
                crashes: Mutex::new(crashes),
                running: AtomicBool::new(false),
                next_worker_id: AtomicUsize::new(0),
                drained: Notify::new(),
                metrics: MetricsCollector::new(),
            }),
        }
    }

    /// Spawns every worker.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running, or
    /// the factory's error if a worker cannot be started. Workers started
    /// before the failure are terminated.
    pub async fn start(&self) -> Result<(), PoolError> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        let pool_size = self.shared.config.pool_size;
        let mut started: Vec<Box<dyn Worker>> = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let worker_id = self.shared.next_id();
            match self.shared.factory.spawn(worker_id).await {
                Ok(worker) => started.push(worker),
                Err(e) => {
                    self.shared.running.store(false, Ordering::SeqCst);
                    for mut worker in started {
                        worker.terminate().await;
                    }
                    return Err(e);
                }
            }
        }

        *self.shared.slots() = started.into_iter().map(Slot::Idle).collect();
        info!(
            queue = %self.shared.queue.queue_name(),
            pool_size,
            "Worker pool started"
        );
        Ok(())
    }

    /// Number of slots able to take a job right now.
    pub fn available_worker_count(&self) -> usize {
        if !self.is_running() {
            return 0;
        }
        self.shared.idle_count()
    }

    /// Claims an idle worker and hands it the raw queue entry.
    ///
    /// The entry must already be on the processing list. The returned handle
    /// resolves once the worker acknowledges, fails, crashes or times out;
    /// by then the job's status record and the processing list are updated.
    ///
    /// # Errors
    ///
    /// - `PoolError::InvalidPayload` if the entry is not a job
    /// - `PoolError::NoIdleWorker` if every slot is busy
    /// - `PoolError::Queue` if the Running status could not be written
    pub async fn dispatch_job(&self, raw: String) -> Result<DispatchHandle, PoolError> {
        if !self.is_running() {
            return Err(PoolError::NotRunning);
        }

        let job = Job::from_payload(&raw).map_err(PoolError::InvalidPayload)?;
        let Some((index, worker)) = self.shared.claim(&job.job_id) else {
            return Err(PoolError::NoIdleWorker);
        };

        let in_flight = InFlightJob::new(job, raw, worker.id());
        if let Err(e) = self.shared.queue.mark_running(&in_flight).await {
            self.shared.release(index, worker).await;
            return Err(e.into());
        }

        let active = self.shared.stats.increment_active();
        self.shared
            .metrics
            .update_active_workers(self.shared.queue.queue_name(), active as usize);

        let (done_tx, done_rx) = oneshot::channel();
        let job_id = in_flight.job_id().to_string();
        tokio::spawn(Arc::clone(&self.shared).execute(index, worker, in_flight, done_tx));

        Ok(DispatchHandle {
            job_id,
            done: done_rx,
        })
    }

    /// Stops accepting jobs, terminates idle workers and waits for busy ones.
    ///
    /// Busy workers are terminated as their jobs finish.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NotRunning` if the pool was not started, or
    /// `PoolError::ShutdownTimeout` if jobs are still running after the
    /// configured timeout.
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!(queue = %self.shared.queue.queue_name(), "Initiating worker pool shutdown");

        for mut worker in self.shared.take_idle() {
            worker.terminate().await;
        }

        let wait_for_jobs = async {
            loop {
                let drained = self.shared.drained.notified();
                if self.shared.stats.active() == 0 {
                    break;
                }
                drained.await;
            }
        };

        let timeout = self.shared.config.shutdown_timeout;
        match tokio::time::timeout(timeout, wait_for_jobs).await {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => {
                warn!(
                    active = self.shared.stats.active(),
                    "Jobs still running at shutdown timeout"
                );
                Err(PoolError::ShutdownTimeout(timeout))
            }
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.shared
            .stats
            .to_pool_stats(self.shared.config.pool_size, self.available_worker_count())
    }

    /// Job ids currently held by workers, keyed by worker id.
    pub fn busy_jobs(&self) -> Vec<(usize, String)> {
        self.shared
            .slots()
            .iter()
            .filter_map(|slot| match slot {
                Slot::Busy { worker_id, job_id } => Some((*worker_id, job_id.clone())),
                _ => None,
            })
            .collect()
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Returns whether respawns are currently being delayed.
    pub fn is_in_crash_loop(&self) -> bool {
        self.shared.crashes().in_crash_loop()
    }

    /// Returns the number of worker slots.
    pub fn pool_size(&self) -> usize {
        self.shared.config.pool_size
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.shared.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::JobStatus;
    use crate::scheduler::store::MemoryStore;
    use serde_json::json;

    fn scripted_factory() -> Arc<InProcessWorkerFactory> {
        Arc::new(InProcessWorkerFactory::new(
            |job: Job, progress: mpsc::UnboundedSender<WorkerProgress>| async move {
                match job.payload["mode"].as_str() {
                    Some("fail") => Ok(WorkerReport::Failed {
                        error: "bad input".to_string(),
                    }),
                    Some("crash") => Err(PoolError::WorkerCrashed {
                        worker_id: 0,
                        reason: "Worker exited with code 1".to_string(),
                    }),
                    Some("slow") => {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(WorkerReport::Completed { result: None })
                    }
                    Some("progress") => {
                        let _ = progress.send(WorkerProgress {
                            progress: Some(0.5),
                            message: Some("half".to_string()),
                        });
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok(WorkerReport::Completed {
                            result: Some(json!(1)),
                        })
                    }
                    _ => Ok(WorkerReport::Completed {
                        result: Some(json!({"ok": true})),
                    }),
                }
            },
        ))
    }

    async fn pool(config: WorkerPoolConfig) -> (Arc<QueueManager>, WorkerPoolManager) {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(QueueManager::new(store, "pool", Duration::from_secs(600)));
        let pool = WorkerPoolManager::new(config, Arc::clone(&queue), scripted_factory());
        pool.start().await.expect("start");
        (queue, pool)
    }

    async fn fetch(queue: &QueueManager, id: &str, mode: &str) -> String {
        queue
            .push(&Job::with_id(id, json!({"mode": mode})))
            .await
            .expect("push");
        queue.fetch_jobs(1).await.expect("fetch").remove(0)
    }

    async fn wait_for_idle(pool: &WorkerPoolManager, expected: usize) {
        for _ in 0..100 {
            if pool.available_worker_count() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pool never reached {expected} idle workers");
    }

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();

        assert!(config.pool_size >= 2);
        assert_eq!(config.job_timeout, Duration::from_secs(1800));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(60));
        assert_eq!(config.crash_window, Duration::from_secs(60));
        assert_eq!(config.max_consecutive_crashes, 5);
        assert_eq!(config.crash_backoff, Duration::from_secs(1));
    }

    #[test]
    fn test_worker_pool_config_builder() {
        let config = WorkerPoolConfig::new(8)
            .with_job_timeout(Duration::from_secs(3600))
            .with_shutdown_timeout(Duration::from_secs(120))
            .with_crash_window(Duration::from_secs(10))
            .with_max_consecutive_crashes(2)
            .with_crash_backoff(Duration::from_millis(250));

        assert_eq!(config.pool_size, 8);
        assert_eq!(config.job_timeout, Duration::from_secs(3600));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(120));
        assert_eq!(config.crash_window, Duration::from_secs(10));
        assert_eq!(config.max_consecutive_crashes, 2);
        assert_eq!(config.crash_backoff, Duration::from_millis(250));
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            pool_size: 4,
            idle_workers: 2,
            active_workers: 2,
            jobs_completed: 80,
            jobs_failed: 20,
            workers_crashed: 3,
            average_job_duration: Duration::from_secs(60),
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
        assert!((PoolStats::default().success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::new();

        stats.record_completion(Duration::from_secs(10));
        stats.record_completion(Duration::from_secs(20));
        stats.record_failure(Duration::from_secs(5));
        assert_eq!(stats.increment_active(), 1);
        assert_eq!(stats.increment_active(), 2);
        assert_eq!(stats.decrement_active(), 1);

        let pool_stats = stats.to_pool_stats(4, 3);

        assert_eq!(pool_stats.pool_size, 4);
        assert_eq!(pool_stats.idle_workers, 3);
        assert_eq!(pool_stats.active_workers, 1);
        assert_eq!(pool_stats.jobs_completed, 2);
        assert_eq!(pool_stats.jobs_failed, 1);
        // Average: (10000 + 20000 + 5000) / 3 = 11666 ms
        assert!(pool_stats.average_job_duration.as_millis() > 11000);
        assert!(pool_stats.average_job_duration.as_millis() < 12000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_tracker_delays_after_threshold() {
        let config = WorkerPoolConfig::new(2)
            .with_max_consecutive_crashes(3)
            .with_crash_backoff(Duration::from_secs(1));
        let mut tracker = CrashTracker::new(&config);

        assert_eq!(tracker.record_crash(), Duration::ZERO);
        assert_eq!(tracker.record_crash(), Duration::ZERO);
        assert_eq!(tracker.record_crash(), Duration::from_secs(3));
        assert!(tracker.in_crash_loop());
        for _ in 0..5 {
            tracker.record_crash();
        }
        assert_eq!(tracker.record_crash(), Duration::from_secs(5));

        tracker.record_success();
        assert!(!tracker.in_crash_loop());
        assert_eq!(tracker.record_crash(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_tracker_window() {
        let config = WorkerPoolConfig::new(2).with_max_consecutive_crashes(2);
        let mut tracker = CrashTracker::new(&config);

        tracker.record_crash();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(tracker.record_crash(), Duration::ZERO);
        assert!(!tracker.in_crash_loop());
    }

    #[test]
    fn test_worker_message_parsing() {
        let msg: WorkerMessage =
            serde_json::from_str(r#"{"status":"progress","progress":0.25,"message":"frames"}"#)
                .expect("progress");
        assert_eq!(
            msg,
            WorkerMessage::Progress {
                progress: Some(0.25),
                message: Some("frames".to_string())
            }
        );

        let msg: WorkerMessage =
            serde_json::from_str(r#"{"status":"completed"}"#).expect("completed");
        assert_eq!(msg, WorkerMessage::Completed { result: None });

        let msg: WorkerMessage =
            serde_json::from_str(r#"{"status":"failed","error":"oom"}"#).expect("failed");
        assert_eq!(
            msg,
            WorkerMessage::Failed {
                error: Some("oom".to_string())
            }
        );

        assert!(serde_json::from_str::<WorkerMessage>(r#"{"status":"weird"}"#).is_err());
    }

    #[tokio::test]
    async fn test_dispatch_completes_job() {
        let (queue, pool) = pool(WorkerPoolConfig::new(2)).await;
        assert_eq!(pool.available_worker_count(), 2);

        let raw = fetch(&queue, "a", "ok").await;
        let handle = pool.dispatch_job(raw).await.expect("dispatch");
        assert_eq!(handle.job_id(), "a");

        let result = handle.await.expect("completed");
        assert!(result.is_success());
        assert_eq!(result.result, Some(json!({"ok": true})));

        let record = queue.job_status("a").await.expect("status").expect("record");
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(queue.processing_len().await.expect("len"), 0);
        assert_eq!(pool.available_worker_count(), 2);
        assert_eq!(pool.stats().jobs_completed, 1);
    }

    #[tokio::test]
    async fn test_reported_failure_keeps_worker() {
        let (queue, pool) = pool(WorkerPoolConfig::new(1)).await;

        let raw = fetch(&queue, "f", "fail").await;
        let err = pool
            .dispatch_job(raw)
            .await
            .expect("dispatch")
            .await
            .expect_err("failure");
        assert!(matches!(err, PoolError::JobFailed { .. }));

        let record = queue.job_status("f").await.expect("status").expect("record");
        assert_eq!(record.status, JobStatus::Failed);
        assert!(!record.crashed_during_processing);
        assert_eq!(queue.len().await.expect("len"), 0);
        assert_eq!(pool.available_worker_count(), 1);
        assert_eq!(pool.stats().workers_crashed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_pool_rejects_dispatch() {
        let (queue, pool) = pool(WorkerPoolConfig::new(1)).await;

        let slow = fetch(&queue, "slow", "slow").await;
        let _handle = pool.dispatch_job(slow).await.expect("dispatch");
        assert_eq!(pool.available_worker_count(), 0);
        assert_eq!(pool.busy_jobs(), vec![(0, "slow".to_string())]);

        let next = fetch(&queue, "next", "ok").await;
        let err = pool.dispatch_job(next).await.expect_err("no idle worker");
        assert!(matches!(err, PoolError::NoIdleWorker));
    }

    #[tokio::test]
    async fn test_invalid_payload_is_rejected() {
        let (_, pool) = pool(WorkerPoolConfig::new(1)).await;

        let err = pool
            .dispatch_job("{not a job".to_string())
            .await
            .expect_err("invalid");
        assert!(matches!(err, PoolError::InvalidPayload(_)));
        assert_eq!(pool.available_worker_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_is_recorded_while_running() {
        let (queue, pool) = pool(WorkerPoolConfig::new(1)).await;

        let raw = fetch(&queue, "p", "progress").await;
        let handle = pool.dispatch_job(raw).await.expect("dispatch");

        tokio::time::sleep(Duration::from_secs(1)).await;
        let record = queue.job_status("p").await.expect("status").expect("record");
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.progress, Some(0.5));
        assert_eq!(record.message.as_deref(), Some("half"));

        handle.await.expect("completed");
        let record = queue.job_status("p").await.expect("status").expect("record");
        assert_eq!(record.status, JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_replaces_worker() {
        let (queue, pool) = pool(WorkerPoolConfig::new(1)).await;

        let raw = fetch(&queue, "c", "crash").await;
        let err = pool
            .dispatch_job(raw)
            .await
            .expect("dispatch")
            .await
            .expect_err("crash");
        match err {
            PoolError::WorkerCrashed { worker_id, reason } => {
                assert_eq!(worker_id, 0);
                assert!(reason.contains("code 1"));
            }
            other => panic!("unexpected error: {other}"),
        }

        let record = queue.job_status("c").await.expect("status").expect("record");
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.crashed_during_processing);
        assert_eq!(queue.processing_len().await.expect("len"), 0);

        wait_for_idle(&pool, 1).await;
        assert_eq!(pool.stats().workers_crashed, 1);

        let raw = fetch(&queue, "after", "ok").await;
        let result = pool
            .dispatch_job(raw)
            .await
            .expect("dispatch")
            .await
            .expect("completed");
        assert_eq!(result.worker_id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_kills_job() {
        let config = WorkerPoolConfig::new(1).with_job_timeout(Duration::from_secs(2));
        let (queue, pool) = pool(config).await;

        let raw = fetch(&queue, "t", "slow").await;
        let err = pool
            .dispatch_job(raw)
            .await
            .expect("dispatch")
            .await
            .expect_err("timeout");
        assert!(matches!(err, PoolError::JobTimeout { .. }));

        let record = queue.job_status("t").await.expect("status").expect("record");
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.error.expect("error").contains("timed out"));
        wait_for_idle(&pool, 1).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_active_jobs() {
        let config = WorkerPoolConfig::new(2).with_shutdown_timeout(Duration::from_secs(10));
        let (queue, pool) = pool(config).await;

        let raw = fetch(&queue, "s", "slow").await;
        let _handle = pool.dispatch_job(raw).await.expect("dispatch");

        let err = pool.shutdown().await.expect_err("timeout");
        assert!(matches!(err, PoolError::ShutdownTimeout(_)));
        assert!(!pool.is_running());
        assert_eq!(pool.available_worker_count(), 0);
        assert!(matches!(pool.shutdown().await, Err(PoolError::NotRunning)));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (_, pool) = pool(WorkerPoolConfig::new(1)).await;

        assert!(matches!(pool.start().await, Err(PoolError::AlreadyRunning)));
        pool.shutdown().await.expect("shutdown");
        assert!(matches!(
            pool.dispatch_job("{}".to_string()).await,
            Err(PoolError::NotRunning)
        ));
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::io::Write;

        fn script(body: &str) -> tempfile::NamedTempFile {
            let mut file = tempfile::NamedTempFile::new().expect("tempfile");
            file.write_all(body.as_bytes()).expect("write script");
            file.flush().expect("flush");
            file
        }

        fn factory(path: &std::path::Path) -> Arc<ProcessWorkerFactory> {
            Arc::new(
                ProcessWorkerFactory::new("sh")
                    .with_args(vec![path.to_string_lossy().into_owned()]),
            )
        }

        async fn process_pool(
            path: &std::path::Path,
        ) -> (Arc<QueueManager>, WorkerPoolManager) {
            let store = Arc::new(MemoryStore::new());
            let queue = Arc::new(QueueManager::new(store, "proc", Duration::from_secs(600)));
            let pool =
                WorkerPoolManager::new(WorkerPoolConfig::new(1), Arc::clone(&queue), factory(path));
            pool.start().await.expect("start");
            (queue, pool)
        }

        #[tokio::test]
        async fn test_process_worker_protocol() {
            let file = script(
                "while IFS= read -r line; do\n\
                 echo '{\"status\":\"progress\",\"progress\":0.5}'\n\
                 echo 'loading model'\n\
                 echo '{\"status\":\"completed\",\"result\":{\"frames\":3}}'\n\
                 done\n",
            );
            let (queue, pool) = process_pool(file.path()).await;

            for id in ["first", "second"] {
                let raw = fetch(&queue, id, "ok").await;
                let result = pool
                    .dispatch_job(raw)
                    .await
                    .expect("dispatch")
                    .await
                    .expect("completed");
                assert_eq!(result.result, Some(json!({"frames": 3})));
                assert_eq!(result.worker_id, 0);
            }

            pool.shutdown().await.expect("shutdown");
        }

        #[tokio::test]
        async fn test_process_exit_is_a_crash() {
            let file = script("read -r line\nexit 3\n");
            let (queue, pool) = process_pool(file.path()).await;

            let raw = fetch(&queue, "dies", "ok").await;
            let err = pool
                .dispatch_job(raw)
                .await
                .expect("dispatch")
                .await
                .expect_err("crash");
            match err {
                PoolError::WorkerCrashed { reason, .. } => {
                    assert_eq!(reason, "Worker exited with code 3");
                }
                other => panic!("unexpected error: {other}"),
            }

            let record = queue
                .job_status("dies")
                .await
                .expect("status")
                .expect("record");
            assert!(record.crashed_during_processing);
        }

        #[tokio::test]
        async fn test_missing_program_fails_start() {
            let store = Arc::new(MemoryStore::new());
            let queue = Arc::new(QueueManager::new(store, "proc", Duration::from_secs(600)));
            let factory = Arc::new(ProcessWorkerFactory::new("/nonexistent/jobforge-worker"));
            let pool = WorkerPoolManager::new(WorkerPoolConfig::new(1), queue, factory);

            let err = pool.start().await.expect_err("spawn failure");
            assert!(matches!(err, PoolError::WorkerInitFailed(_)));
            assert!(!pool.is_running());
        }
    }
}
