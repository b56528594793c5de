//! Durable job queue with an in-flight processing list.
//!
//! This module provides the queue side of the dispatch engine:
//!
//! - Atomic batch fetch that moves entries from the queue to the processing list
//! - Per-job status records with a TTL
//! - Failed-dispatch and dead-letter moves
//! - Primitives used by startup recovery (drain, LPOS checks, SCAN, batched reads)
//!
//! # Queue Structure
//!
//! For a queue named `jobs` the store holds:
//!
//! - `jobs_queue`: Jobs waiting for a worker (LPUSH in, pop from the right)
//! - `jobs_queue:processing`: Jobs handed to a worker but not yet acknowledged
//! - `jobs_queue:dead_letter`: Entries that could not be parsed as jobs
//! - `jobs_queue:status:{job_id}`: Latest `StatusRecord` for each job
//! - `jobs_queue:startup_lock`: Held while startup recovery runs
//!
//! # Reliability
//!
//! Entries only leave the queue through `fetch_jobs`, which moves them to the
//! processing list in one atomic step. An entry is removed from the processing
//! list only together with the write of its terminal status.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::job::{InFlightJob, Job, JobStatus, StatusRecord};
use super::store::{EnqueueEntry, OrphanCheck, OrphanRequeue, QueueStore};
use crate::config::QueueConfig;
use crate::error::QueueError;

/// Queue operations for one named queue.
pub struct QueueManager {
    store: Arc<dyn QueueStore>,
    queue_name: String,
    queue_key: String,
    processing_key: String,
    dead_letter_key: String,
    status_key_prefix: String,
    lock_key: String,
    status_ttl: Duration,
}

impl QueueManager {
    /// Creates a queue manager over `store`.
    ///
    /// # Arguments
    ///
    /// * `store` - Backing store shared with other components
    /// * `queue_name` - Logical queue name; keys derive from `{queue_name}_queue`
    /// * `status_ttl` - Lifetime of every status record write
    pub fn new(store: Arc<dyn QueueStore>, queue_name: &str, status_ttl: Duration) -> Self {
        let queue_key = format!("{}_queue", queue_name);
        Self {
            store,
            queue_name: queue_name.to_string(),
            processing_key: format!("{}:processing", queue_key),
            dead_letter_key: format!("{}:dead_letter", queue_key),
            status_key_prefix: format!("{}:status:", queue_key),
            lock_key: format!("{}:startup_lock", queue_key),
            queue_key,
            status_ttl,
        }
    }

    pub fn from_config(store: Arc<dyn QueueStore>, config: &QueueConfig) -> Self {
        Self::new(store, &config.queue_name, config.status_ttl)
    }

    /// Serializes and enqueues jobs, writing a Queued status record for each.
    ///
    /// All pushes and status writes happen in one transaction. Returns the
    /// number of jobs enqueued.
    pub async fn add_jobs(&self, jobs: &[Job]) -> Result<usize, QueueError> {
        if jobs.is_empty() {
            return Ok(0);
        }

        let mut entries = Vec::with_capacity(jobs.len());
        for job in jobs {
            let record = StatusRecord::new(job, JobStatus::Queued, &self.queue_name);
            entries.push(EnqueueEntry {
                payload: job.to_payload()?,
                status_key: self.status_key(&job.job_id),
                status: record.to_json()?,
            });
        }

        self.store
            .enqueue(&self.queue_key, &entries, self.status_ttl)
            .await?;
        debug!(queue = %self.queue_name, count = entries.len(), "Enqueued jobs");
        Ok(entries.len())
    }

    /// Enqueues a single job.
    pub async fn push(&self, job: &Job) -> Result<(), QueueError> {
        self.add_jobs(std::slice::from_ref(job)).await.map(|_| ())
    }

    /// Atomically moves up to `count` entries from the queue to the
    /// processing list and returns them, oldest first.
    pub async fn fetch_jobs(&self, count: usize) -> Result<Vec<String>, QueueError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        self.store
            .move_batch(&self.queue_key, &self.processing_key, count)
            .await
    }

    /// Returns an entry whose dispatch failed from the processing list to the
    /// head of the queue so it is fetched again next.
    pub async fn handle_failed_dispatch(&self, raw: &str) -> Result<bool, QueueError> {
        let moved = self
            .store
            .move_entry(&self.processing_key, &self.queue_key, raw)
            .await?;
        if !moved {
            warn!(queue = %self.queue_name, "Failed dispatch entry was no longer in processing");
        }
        Ok(moved)
    }

    /// Moves an unparseable entry from the processing list to the dead letter list.
    pub async fn dead_letter(&self, raw: &str) -> Result<bool, QueueError> {
        self.store
            .move_entry(&self.processing_key, &self.dead_letter_key, raw)
            .await
    }

    /// Records that a worker has picked up the job.
    pub async fn mark_running(&self, in_flight: &InFlightJob) -> Result<(), QueueError> {
        let record = StatusRecord::new(&in_flight.job, JobStatus::Running, &self.queue_name)
            .with_worker(in_flight.worker_id)
            .with_attempts(in_flight.attempt);
        self.write_status(&in_flight.job.job_id, &record).await
    }

    /// Records a progress report for a running job.
    pub async fn record_progress(
        &self,
        in_flight: &InFlightJob,
        progress: Option<f64>,
        message: Option<String>,
    ) -> Result<(), QueueError> {
        let record = StatusRecord::new(&in_flight.job, JobStatus::Running, &self.queue_name)
            .with_worker(in_flight.worker_id)
            .with_attempts(in_flight.attempt)
            .with_progress(progress, message);
        self.write_status(&in_flight.job.job_id, &record).await
    }

    /// Removes an acknowledged job from the processing list and marks it Completed.
    pub async fn complete(
        &self,
        in_flight: &InFlightJob,
        result: Option<serde_json::Value>,
        elapsed: Duration,
    ) -> Result<(), QueueError> {
        let record = StatusRecord::new(&in_flight.job, JobStatus::Completed, &self.queue_name)
            .with_worker(in_flight.worker_id)
            .with_attempts(in_flight.attempt)
            .with_result(result)
            .with_processing_time(millis(elapsed));
        self.finish(in_flight, &record).await
    }

    /// Removes a failed job from the processing list and marks it Failed.
    ///
    /// `crashed` is set when the worker died or was killed rather than
    /// reporting the failure itself.
    pub async fn fail(
        &self,
        in_flight: &InFlightJob,
        error: &str,
        elapsed: Duration,
        crashed: bool,
    ) -> Result<(), QueueError> {
        let mut record = StatusRecord::new(&in_flight.job, JobStatus::Failed, &self.queue_name)
            .with_worker(in_flight.worker_id)
            .with_attempts(in_flight.attempt)
            .with_error(error)
            .with_processing_time(millis(elapsed));
        if crashed {
            record = record.crashed();
        }
        self.finish(in_flight, &record).await
    }

    /// Reads the latest status record for a job.
    pub async fn job_status(&self, job_id: &str) -> Result<Option<StatusRecord>, QueueError> {
        match self.store.get(&self.status_key(job_id)).await? {
            Some(raw) => Ok(Some(StatusRecord::from_json(&raw)?)),
            None => Ok(None),
        }
    }

    /// Moves every entry of the processing list back onto the queue.
    pub async fn drain_processing_into_queue(&self) -> Result<usize, QueueError> {
        self.store
            .drain(&self.processing_key, &self.queue_key)
            .await
    }

    pub async fn is_queued(&self, raw: &str) -> Result<bool, QueueError> {
        Ok(self.store.position(&self.queue_key, raw).await?.is_some())
    }

    pub async fn is_processing(&self, raw: &str) -> Result<bool, QueueError> {
        Ok(self
            .store
            .position(&self.processing_key, raw)
            .await?
            .is_some())
    }

    /// One SCAN page over this queue's status keys.
    pub async fn scan_status_keys(
        &self,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), QueueError> {
        let pattern = format!("{}*", self.status_key_prefix);
        self.store.scan(cursor, &pattern, count).await
    }

    /// Reads raw values for many keys in one round trip.
    pub async fn read_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, QueueError> {
        self.store.get_many(keys).await
    }

    /// Reconciles a Running record left behind by a dead process.
    ///
    /// If the job is in neither list it is pushed back onto the queue with
    /// its attempt count carried over. If it is already queued, only its
    /// status is reset to Queued. Jobs still on the processing list are left
    /// alone.
    pub async fn requeue_orphan(&self, record: &StatusRecord) -> Result<OrphanCheck, QueueError> {
        let requeue_job = Job {
            status: JobStatus::Queued,
            ..record.job.clone()
        }
        .with_attempts(record.attempts.max(record.job.attempts));

        let requeued = StatusRecord::new(&requeue_job, JobStatus::Queued, &self.queue_name)
            .with_message("Requeued after unclean shutdown");
        let queued = StatusRecord::new(&record.job, JobStatus::Queued, &self.queue_name)
            .with_attempts(record.attempts);

        let orphan = OrphanRequeue {
            dispatched_payload: record.job.to_payload()?,
            requeue_payload: requeue_job.to_payload()?,
            requeued_status: requeued.to_json()?,
            queued_status: queued.to_json()?,
        };

        self.store
            .requeue_orphan(
                &self.queue_key,
                &self.processing_key,
                &self.status_key(&record.job_id),
                &orphan,
                self.status_ttl,
            )
            .await
    }

    /// Tries to take the startup lock for `ttl`.
    pub async fn try_startup_lock(&self, token: &str, ttl: Duration) -> Result<bool, QueueError> {
        self.store.try_lock(&self.lock_key, token, ttl).await
    }

    /// Releases the startup lock if `token` still owns it.
    pub async fn release_startup_lock(&self, token: &str) -> Result<bool, QueueError> {
        self.store.unlock(&self.lock_key, token).await
    }

    /// Returns the number of jobs waiting on the queue.
    pub async fn len(&self) -> Result<usize, QueueError> {
        self.store.len(&self.queue_key).await
    }

    /// Returns the number of jobs currently handed to workers.
    pub async fn processing_len(&self) -> Result<usize, QueueError> {
        self.store.len(&self.processing_key).await
    }

    /// Returns the number of entries in the dead letter list.
    pub async fn dead_letter_len(&self) -> Result<usize, QueueError> {
        self.store.len(&self.dead_letter_key).await
    }

    /// Returns whether the queue is empty.
    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }

    /// Returns queue statistics.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let (queue_len, processing_len, dead_letter_len) =
            tokio::try_join!(self.len(), self.processing_len(), self.dead_letter_len())?;

        Ok(QueueStats {
            queue_name: self.queue_name.clone(),
            pending_jobs: queue_len,
            processing_jobs: processing_len,
            dead_letter_jobs: dead_letter_len,
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn queue_key(&self) -> &str {
        &self.queue_key
    }

    pub fn processing_key(&self) -> &str {
        &self.processing_key
    }

    pub fn dead_letter_key(&self) -> &str {
        &self.dead_letter_key
    }

    pub fn status_key_prefix(&self) -> &str {
        &self.status_key_prefix
    }

    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    pub fn status_key(&self, job_id: &str) -> String {
        format!("{}{}", self.status_key_prefix, job_id)
    }

    async fn write_status(&self, job_id: &str, record: &StatusRecord) -> Result<(), QueueError> {
        self.store
            .set_with_expiry(&self.status_key(job_id), &record.to_json()?, self.status_ttl)
            .await
    }

    async fn finish(&self, in_flight: &InFlightJob, record: &StatusRecord) -> Result<(), QueueError> {
        self.store
            .finish(
                &self.processing_key,
                &in_flight.raw,
                &self.status_key(in_flight.job_id()),
                &record.to_json()?,
                self.status_ttl,
            )
            .await
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Statistics about queue state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStats {
    /// Name of the queue.
    pub queue_name: String,
    /// Number of jobs waiting to be processed.
    pub pending_jobs: usize,
    /// Number of jobs currently being processed.
    pub processing_jobs: usize,
    /// Number of entries in the dead letter list.
    pub dead_letter_jobs: usize,
}

impl QueueStats {
    /// Returns the total number of entries across all lists.
    pub fn total_jobs(&self) -> usize {
        self.pending_jobs + self.processing_jobs + self.dead_letter_jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::store::MemoryStore;
    use serde_json::json;

    fn manager() -> (Arc<MemoryStore>, QueueManager) {
        let store = Arc::new(MemoryStore::new());
        let queue = QueueManager::new(store.clone(), "analysis", Duration::from_secs(60));
        (store, queue)
    }

    fn job(id: &str) -> Job {
        Job::with_id(id, json!({"id": id}))
    }

    #[test]
    fn test_key_naming() {
        let (_, queue) = manager();

        assert_eq!(queue.queue_key(), "analysis_queue");
        assert_eq!(queue.processing_key(), "analysis_queue:processing");
        assert_eq!(queue.status_key_prefix(), "analysis_queue:status:");
        assert_eq!(queue.status_key("j1"), "analysis_queue:status:j1");
        assert_eq!(queue.lock_key(), "analysis_queue:startup_lock");
        assert_eq!(queue.dead_letter_key(), "analysis_queue:dead_letter");
    }

    #[test]
    fn test_queue_stats() {
        let stats = QueueStats {
            queue_name: "test".to_string(),
            pending_jobs: 10,
            processing_jobs: 5,
            dead_letter_jobs: 2,
        };

        assert_eq!(stats.total_jobs(), 17);
    }

    #[tokio::test]
    async fn test_add_jobs_writes_queued_status() {
        let (_, queue) = manager();
        let added = queue.add_jobs(&[job("a"), job("b")]).await.expect("add");

        assert_eq!(added, 2);
        assert_eq!(queue.len().await.expect("len"), 2);
        let record = queue.job_status("a").await.expect("status").expect("record");
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.queue, "analysis");
        assert_eq!(queue.add_jobs(&[]).await.expect("add"), 0);
    }

    #[tokio::test]
    async fn test_fetch_moves_oldest_first() {
        let (store, queue) = manager();
        queue.add_jobs(&[job("a"), job("b"), job("c")]).await.expect("add");

        let fetched = queue.fetch_jobs(2).await.expect("fetch");
        let ids: Vec<String> = fetched
            .iter()
            .map(|raw| Job::from_payload(raw).expect("job").job_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(queue.len().await.expect("len"), 1);
        assert_eq!(queue.processing_len().await.expect("len"), 2);

        for raw in &fetched {
            assert!(queue.is_processing(raw).await.expect("lpos"));
            assert!(!queue.is_queued(raw).await.expect("lpos"));
        }
        assert_eq!(store.list(queue.processing_key()).await.len(), 2);
        assert!(queue.fetch_jobs(0).await.expect("fetch").is_empty());
    }

    #[tokio::test]
    async fn test_complete_removes_from_processing() {
        let (_, queue) = manager();
        queue.push(&job("a")).await.expect("push");
        let raw = queue.fetch_jobs(1).await.expect("fetch").remove(0);
        let in_flight = InFlightJob::new(Job::from_payload(&raw).expect("job"), raw, 3);

        queue.mark_running(&in_flight).await.expect("running");
        let record = queue.job_status("a").await.expect("status").expect("record");
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.worker_id, Some(3));
        assert_eq!(record.attempts, 1);

        queue
            .record_progress(&in_flight, Some(0.5), Some("halfway".to_string()))
            .await
            .expect("progress");
        let record = queue.job_status("a").await.expect("status").expect("record");
        assert_eq!(record.progress, Some(0.5));
        assert_eq!(record.status, JobStatus::Running);

        queue
            .complete(&in_flight, Some(json!({"ok": true})), Duration::from_millis(1200))
            .await
            .expect("complete");
        let record = queue.job_status("a").await.expect("status").expect("record");
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.processing_time_ms, Some(1200));
        assert_eq!(queue.processing_len().await.expect("len"), 0);
    }

    #[tokio::test]
    async fn test_fail_marks_crash() {
        let (_, queue) = manager();
        queue.push(&job("a")).await.expect("push");
        let raw = queue.fetch_jobs(1).await.expect("fetch").remove(0);
        let in_flight = InFlightJob::new(Job::from_payload(&raw).expect("job"), raw, 0);

        queue
            .fail(&in_flight, "Worker exited with code 1", Duration::ZERO, true)
            .await
            .expect("fail");

        let record = queue.job_status("a").await.expect("status").expect("record");
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.crashed_during_processing);
        assert_eq!(record.error.as_deref(), Some("Worker exited with code 1"));
        assert_eq!(queue.processing_len().await.expect("len"), 0);
        assert_eq!(queue.len().await.expect("len"), 0);
    }

    #[tokio::test]
    async fn test_failed_dispatch_goes_back_to_head() {
        let (store, queue) = manager();
        queue.add_jobs(&[job("a"), job("b")]).await.expect("add");
        let raw = queue.fetch_jobs(1).await.expect("fetch").remove(0);

        assert!(queue.handle_failed_dispatch(&raw).await.expect("requeue"));
        assert_eq!(queue.processing_len().await.expect("len"), 0);

        let next = queue.fetch_jobs(1).await.expect("fetch").remove(0);
        assert_eq!(next, raw);
        assert_eq!(store.list(queue.queue_key()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_dead_letter_moves_poison_entry() {
        let (store, queue) = manager();
        store.push_raw(queue.queue_key(), "not json").await;
        let raw = queue.fetch_jobs(1).await.expect("fetch").remove(0);

        assert!(queue.dead_letter(&raw).await.expect("dead letter"));
        let stats = queue.stats().await.expect("stats");
        assert_eq!(stats.dead_letter_jobs, 1);
        assert_eq!(stats.processing_jobs, 0);
        assert_eq!(stats.pending_jobs, 0);
    }

    #[tokio::test]
    async fn test_drain_processing_into_queue() {
        let (_, queue) = manager();
        queue
            .add_jobs(&[job("a"), job("b"), job("c")])
            .await
            .expect("add");
        queue.fetch_jobs(3).await.expect("fetch");

        assert_eq!(queue.drain_processing_into_queue().await.expect("drain"), 3);
        assert_eq!(queue.processing_len().await.expect("len"), 0);
        assert_eq!(queue.len().await.expect("len"), 3);
    }

    #[tokio::test]
    async fn test_requeue_orphan_carries_attempts() {
        let (_, queue) = manager();
        queue.push(&job("a")).await.expect("push");
        let raw = queue.fetch_jobs(1).await.expect("fetch").remove(0);
        let in_flight = InFlightJob::new(Job::from_payload(&raw).expect("job"), raw.clone(), 0);
        queue.mark_running(&in_flight).await.expect("running");

        // Entry lost without a terminal status write.
        queue
            .fail(&in_flight, "lost", Duration::ZERO, true)
            .await
            .expect("remove");
        queue.mark_running(&in_flight).await.expect("running");

        let record = queue.job_status("a").await.expect("status").expect("record");
        let outcome = queue.requeue_orphan(&record).await.expect("requeue");
        assert_eq!(outcome, OrphanCheck::Requeued);

        let record = queue.job_status("a").await.expect("status").expect("record");
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.job.attempts, 1);
        let raw = queue.fetch_jobs(1).await.expect("fetch").remove(0);
        assert_eq!(Job::from_payload(&raw).expect("job").attempts, 1);
    }
}
