//! Startup reconciliation.
//!
//! A process that dies leaves two kinds of debris: entries on the processing
//! list that no worker will ever acknowledge, and status records stuck at
//! Running for jobs that are on no list at all. `RecoveryManager` clears
//! both, once per start, under a store-wide lock so that concurrently
//! starting instances do not recover twice.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::job::{JobStatus, StatusRecord};
use super::queue::QueueManager;
use super::store::OrphanCheck;
use crate::error::RecoveryError;
use crate::metrics::MetricsCollector;

/// Counts from one recovery run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Entries moved from the processing list back to the queue.
    pub drained: usize,
    /// Status keys visited by the sweep.
    pub scanned: usize,
    /// Running jobs found on neither list and pushed back onto the queue.
    pub requeued: usize,
    /// Running jobs already on the queue whose status was reset to Queued.
    pub refreshed: usize,
    /// Records that could not be parsed or reconciled.
    pub skipped: usize,
}

impl RecoveryReport {
    pub fn recovered(&self) -> usize {
        self.drained + self.requeued
    }
}

pub struct RecoveryManager {
    queue: Arc<QueueManager>,
    lock_ttl: Duration,
    scan_count: usize,
    metrics: MetricsCollector,
}

impl RecoveryManager {
    pub fn new(queue: Arc<QueueManager>, lock_ttl: Duration) -> Self {
        Self {
            queue,
            lock_ttl,
            scan_count: 100,
            metrics: MetricsCollector::new(),
        }
    }

    /// Sets the SCAN page size hint.
    pub fn with_scan_count(mut self, scan_count: usize) -> Self {
        self.scan_count = scan_count.max(1);
        self
    }

    /// Runs `f` only if this process acquires the startup lock.
    ///
    /// Returns `Ok(None)` when another instance holds the lock. The lock is
    /// released after `f` finishes; a failed release is logged and left to
    /// expire.
    pub async fn with_startup_lock<F, Fut, R>(&self, f: F) -> Result<Option<R>, RecoveryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let token = lock_token();
        if !self.queue.try_startup_lock(&token, self.lock_ttl).await? {
            info!(
                lock = %self.queue.lock_key(),
                "Startup lock held by another instance, skipping recovery"
            );
            return Ok(None);
        }
        debug!(lock = %self.queue.lock_key(), token = %token, "Acquired startup lock");

        let output = f().await;

        match self.queue.release_startup_lock(&token).await {
            Ok(true) => debug!(lock = %self.queue.lock_key(), "Released startup lock"),
            Ok(false) => warn!(
                lock = %self.queue.lock_key(),
                "Startup lock expired before release"
            ),
            Err(e) => warn!(
                lock = %self.queue.lock_key(),
                error = %e,
                "Failed to release startup lock"
            ),
        }

        Ok(Some(output))
    }

    /// Drains the processing list and requeues orphaned Running jobs.
    ///
    /// Returns `Ok(None)` if another instance is already recovering.
    pub async fn recover_on_startup(&self) -> Result<Option<RecoveryReport>, RecoveryError> {
        match self.with_startup_lock(|| self.recover()).await? {
            Some(outcome) => outcome.map(Some),
            None => Ok(None),
        }
    }

    async fn recover(&self) -> Result<RecoveryReport, RecoveryError> {
        let queue_name = self.queue.queue_name();

        let drained = self.queue.drain_processing_into_queue().await?;
        if drained > 0 {
            info!(queue = %queue_name, drained, "Returned in-flight jobs to the queue");
        }
        self.metrics.record_recovered(queue_name, "drain", drained);

        let mut report = self.requeue_stale_running_jobs().await?;
        report.drained = drained;

        info!(
            queue = %queue_name,
            drained = report.drained,
            scanned = report.scanned,
            requeued = report.requeued,
            refreshed = report.refreshed,
            skipped = report.skipped,
            "Startup recovery complete"
        );
        Ok(report)
    }

    /// Sweeps every status record and requeues Running jobs found on neither list.
    ///
    /// Per-record failures are logged and counted as skipped.
    pub async fn requeue_stale_running_jobs(&self) -> Result<RecoveryReport, RecoveryError> {
        let mut report = RecoveryReport::default();
        let mut cursor = 0u64;

        loop {
            let (next, keys) = self
                .queue
                .scan_status_keys(cursor, self.scan_count)
                .await?;
            cursor = next;

            if !keys.is_empty() {
                let values = self.queue.read_many(&keys).await?;
                for (key, value) in keys.iter().zip(values) {
                    report.scanned += 1;
                    // Expired between SCAN and GET.
                    let Some(raw) = value else {
                        continue;
                    };
                    let record = match StatusRecord::from_json(&raw) {
                        Ok(record) => record,
                        Err(e) => {
                            warn!(key = %key, error = %e, "Skipping malformed status record");
                            report.skipped += 1;
                            continue;
                        }
                    };
                    if record.status == JobStatus::Running {
                        self.reconcile(&record, &mut report).await;
                    }
                }
            }

            if cursor == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }

        self.metrics
            .record_recovered(self.queue.queue_name(), "orphan", report.requeued);
        Ok(report)
    }

    async fn reconcile(&self, record: &StatusRecord, report: &mut RecoveryReport) {
        match self.queue.requeue_orphan(record).await {
            Ok(OrphanCheck::Requeued) => {
                report.requeued += 1;
                info!(
                    job_id = %record.job_id,
                    attempts = record.attempts,
                    "Requeued orphaned job"
                );
            }
            Ok(OrphanCheck::AlreadyQueued) => {
                report.refreshed += 1;
                debug!(job_id = %record.job_id, "Orphaned job already queued, status reset");
            }
            Ok(OrphanCheck::InFlight) => {
                debug!(job_id = %record.job_id, "Job still on the processing list");
            }
            Err(e) => {
                report.skipped += 1;
                warn!(job_id = %record.job_id, error = %e, "Failed to reconcile status record");
            }
        }
    }

    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }
}

fn lock_token() -> String {
    format!(
        "{}:{}:{}",
        std::process::id(),
        chrono::Utc::now().timestamp_millis(),
        uuid::Uuid::new_v4()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::{InFlightJob, Job};
    use crate::scheduler::store::{MemoryStore, QueueStore};
    use serde_json::json;

    fn setup() -> (Arc<MemoryStore>, Arc<QueueManager>, RecoveryManager) {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(QueueManager::new(
            store.clone(),
            "recovery",
            Duration::from_secs(600),
        ));
        let recovery =
            RecoveryManager::new(queue.clone(), Duration::from_secs(30)).with_scan_count(2);
        (store, queue, recovery)
    }

    /// Leaves a Running record for a job that is on no list.
    async fn orphan(queue: &QueueManager, id: &str) -> Job {
        let job = Job::with_id(id, json!({"n": id}));
        queue.push(&job).await.expect("push");
        let raw = queue.fetch_jobs(1).await.expect("fetch").remove(0);
        let in_flight = InFlightJob::new(job.clone(), raw.clone(), 0);
        queue.mark_running(&in_flight).await.expect("running");
        queue.dead_letter(&raw).await.expect("remove from processing");
        job
    }

    #[tokio::test]
    async fn test_drain_returns_processing_entries() {
        let (store, queue, recovery) = setup();
        let jobs: Vec<Job> = (0..3)
            .map(|i| Job::with_id(format!("d{i}"), json!({})))
            .collect();
        queue.add_jobs(&jobs).await.expect("add");
        queue.fetch_jobs(2).await.expect("fetch");

        let report = recovery
            .recover_on_startup()
            .await
            .expect("recover")
            .expect("lock acquired");

        assert_eq!(report.drained, 2);
        assert_eq!(queue.processing_len().await.expect("len"), 0);
        assert_eq!(queue.len().await.expect("len"), 3);
        assert!(store.get(queue.lock_key()).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_orphaned_running_job_is_requeued() {
        let (_, queue, recovery) = setup();
        let job = orphan(&queue, "lost").await;
        assert_eq!(queue.len().await.expect("len"), 0);

        let report = recovery
            .recover_on_startup()
            .await
            .expect("recover")
            .expect("lock acquired");

        assert_eq!(report.requeued, 1);
        assert_eq!(queue.len().await.expect("len"), 1);
        let record = queue
            .job_status(&job.job_id)
            .await
            .expect("status")
            .expect("record");
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.attempts, 1);

        let raw = queue.fetch_jobs(1).await.expect("fetch").remove(0);
        assert_eq!(Job::from_payload(&raw).expect("job").attempts, 1);
    }

    #[tokio::test]
    async fn test_running_job_still_queued_is_refreshed() {
        let (_, queue, recovery) = setup();
        let job = Job::with_id("dup", json!({}));
        queue.push(&job).await.expect("push");
        let raw = queue.fetch_jobs(1).await.expect("fetch").remove(0);
        queue
            .mark_running(&InFlightJob::new(job.clone(), raw, 0))
            .await
            .expect("running");

        // The drain puts the entry back on the queue, so the sweep only resets status.
        let report = recovery
            .recover_on_startup()
            .await
            .expect("recover")
            .expect("lock acquired");

        assert_eq!(report.drained, 1);
        assert_eq!(report.requeued, 0);
        assert_eq!(report.refreshed, 1);
        assert_eq!(queue.len().await.expect("len"), 1);
        let record = queue.job_status("dup").await.expect("status").expect("record");
        assert_eq!(record.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_in_flight_job_is_left_alone() {
        let (_, queue, recovery) = setup();
        let job = Job::with_id("busy", json!({}));
        queue.push(&job).await.expect("push");
        let raw = queue.fetch_jobs(1).await.expect("fetch").remove(0);
        queue
            .mark_running(&InFlightJob::new(job, raw, 0))
            .await
            .expect("running");

        let report = recovery.requeue_stale_running_jobs().await.expect("sweep");

        assert_eq!(report.scanned, 1);
        assert_eq!(report.requeued + report.refreshed, 0);
        assert_eq!(queue.processing_len().await.expect("len"), 1);
        assert_eq!(queue.len().await.expect("len"), 0);
    }

    #[tokio::test]
    async fn test_sweep_skips_malformed_and_pages() {
        let (store, queue, recovery) = setup();
        store
            .set_with_expiry(&queue.status_key("junk"), "not json", Duration::from_secs(60))
            .await
            .expect("set");
        let completed: Vec<Job> = (0..4)
            .map(|i| Job::with_id(format!("q{i}"), json!({})))
            .collect();
        queue.add_jobs(&completed).await.expect("add");
        orphan(&queue, "o1").await;
        orphan(&queue, "o2").await;

        let report = recovery.requeue_stale_running_jobs().await.expect("sweep");

        assert_eq!(report.scanned, 7);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.requeued, 2);
        assert_eq!(queue.len().await.expect("len"), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_lock_is_exclusive() {
        let (_, _, recovery) = setup();

        let slow = recovery.with_startup_lock(|| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            "first"
        });
        let fast = recovery.with_startup_lock(|| async { "second" });
        let (first, second) = tokio::join!(slow, fast);

        assert_eq!(first.expect("first"), Some("first"));
        assert_eq!(second.expect("second"), None);

        let again = recovery
            .with_startup_lock(|| async { "third" })
            .await
            .expect("third");
        assert_eq!(again, Some("third"));
    }

    #[tokio::test]
    async fn test_foreign_lock_skips_recovery() {
        let (_, queue, recovery) = setup();
        assert!(queue
            .try_startup_lock("other-instance", Duration::from_secs(30))
            .await
            .expect("lock"));

        assert_eq!(recovery.recover_on_startup().await.expect("recover"), None);
        assert!(!queue
            .release_startup_lock("not-the-owner")
            .await
            .expect("unlock"));
    }

    #[test]
    fn test_lock_token_is_unique() {
        assert_ne!(lock_token(), lock_token());
        assert_eq!(lock_token().split(':').count(), 3);
    }
}
