//! One named processing queue with its workers and dispatch loop.
//!
//! `ProcessingQueue` wires a `QueueManager`, a `WorkerPoolManager`, a
//! `LoadMonitor`, startup recovery and the `JobDispatcher` together and owns
//! their lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::dispatcher::{DispatcherControl, JobDispatcher};
use super::job::{Job, StatusRecord};
use super::load::{LoadMonitor, SystemLoadMonitor};
use super::queue::{QueueManager, QueueStats};
use super::recovery::RecoveryManager;
use super::redis_store::RedisStore;
use super::store::QueueStore;
use super::worker_pool::{PoolStats, WorkerFactory, WorkerPoolManager};
use crate::config::QueueConfig;
use crate::error::{PoolError, QueueError};
use crate::metrics::MetricsCollector;

/// Combined queue and pool statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingStats {
    pub queue: QueueStats,
    pub pool: PoolStats,
}

struct RunningDispatcher {
    control: DispatcherControl,
    handle: JoinHandle<()>,
}

pub struct ProcessingQueue {
    config: QueueConfig,
    queue: Arc<QueueManager>,
    pool: Arc<WorkerPoolManager>,
    load: Arc<dyn LoadMonitor>,
    recovery: RecoveryManager,
    started: AtomicBool,
    paused: Arc<AtomicBool>,
    dispatcher: Mutex<Option<RunningDispatcher>>,
    metrics: MetricsCollector,
}

impl ProcessingQueue {
    pub fn new(
        config: QueueConfig,
        store: Arc<dyn QueueStore>,
        factory: Arc<dyn WorkerFactory>,
        load: Arc<dyn LoadMonitor>,
    ) -> Self {
        let queue = Arc::new(QueueManager::from_config(store, &config));
        let pool = Arc::new(WorkerPoolManager::new(
            config.pool_config(),
            Arc::clone(&queue),
            factory,
        ));
        let recovery = RecoveryManager::new(Arc::clone(&queue), config.startup_lock_ttl)
            .with_scan_count(config.recovery_scan_count);

        Self {
            config,
            queue,
            pool,
            load,
            recovery,
            started: AtomicBool::new(false),
            paused: Arc::new(AtomicBool::new(false)),
            dispatcher: Mutex::new(None),
            metrics: MetricsCollector::new(),
        }
    }

    /// Connects to Redis at `config.redis_url` and samples host load with
    /// the configured thresholds.
    pub async fn connect(
        config: QueueConfig,
        factory: Arc<dyn WorkerFactory>,
    ) -> Result<Self, QueueError> {
        let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
        let load = Arc::new(SystemLoadMonitor::new(config.load_thresholds));
        Ok(Self::new(config, store, factory, load))
    }

    /// Enqueues jobs with a Queued status record each.
    pub async fn add_jobs(&self, jobs: Vec<Job>) -> Result<(), QueueError> {
        let added = self.queue.add_jobs(&jobs).await?;
        self.metrics.record_enqueued(self.queue.queue_name(), added);
        info!(queue = %self.queue.queue_name(), count = added, "Jobs enqueued");
        Ok(())
    }

    /// Recovers leftovers of a previous run, starts the workers and spawns
    /// the dispatch loop.
    ///
    /// Recovery failures are logged; the queue still starts.
    pub async fn start(&self) -> Result<(), PoolError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        match self.recovery.recover_on_startup().await {
            Ok(Some(report)) => info!(
                queue = %self.queue.queue_name(),
                recovered = report.recovered(),
                "Startup recovery finished"
            ),
            Ok(None) => info!(
                queue = %self.queue.queue_name(),
                "Startup recovery handled by another instance"
            ),
            Err(e) => error!(
                queue = %self.queue.queue_name(),
                error = %e,
                "Startup recovery failed"
            ),
        }

        if let Err(e) = self.pool.start().await {
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let control = DispatcherControl::with_pause_flag(Arc::clone(&self.paused));
        let dispatcher = JobDispatcher::new(
            self.config.dispatcher_config(),
            Arc::clone(&self.queue),
            Arc::clone(&self.pool),
            Arc::clone(&self.load),
            control.clone(),
        );
        let handle = tokio::spawn(dispatcher.run());
        *self.lock_dispatcher() = Some(RunningDispatcher { control, handle });

        info!(
            queue = %self.queue.queue_name(),
            workers = self.pool.pool_size(),
            batch_size = self.config.batch_size,
            "Processing queue started"
        );
        Ok(())
    }

    /// Stops the dispatch loop, then shuts the pool down.
    ///
    /// Jobs still running when `shutdown_timeout` expires stay on the
    /// processing list for the next startup recovery.
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        let running = self.lock_dispatcher().take();
        if let Some(RunningDispatcher { control, mut handle }) = running {
            control.shutdown();
            match tokio::time::timeout(self.config.shutdown_timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Dispatch loop ended abnormally"),
                Err(_) => {
                    warn!("Dispatch loop did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        self.pool.shutdown().await?;
        info!(queue = %self.queue.queue_name(), "Processing queue stopped");
        Ok(())
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!(queue = %self.queue.queue_name(), "Dispatch paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!(queue = %self.queue.queue_name(), "Dispatch resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub async fn job_status(&self, job_id: &str) -> Result<Option<StatusRecord>, QueueError> {
        self.queue.job_status(job_id).await
    }

    /// Current list depths and pool counters. Also refreshes the depth gauges.
    pub async fn stats(&self) -> Result<ProcessingStats, QueueError> {
        let queue = self.queue.stats().await?;
        self.metrics.update_queue_depth(
            &queue.queue_name,
            queue.pending_jobs,
            queue.processing_jobs,
        );
        Ok(ProcessingStats {
            queue,
            pool: self.pool.stats(),
        })
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    pub fn pool(&self) -> &Arc<WorkerPoolManager> {
        &self.pool
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn lock_dispatcher(&self) -> std::sync::MutexGuard<'_, Option<RunningDispatcher>> {
        self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
