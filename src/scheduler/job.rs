//! Job definitions for the dispatch engine.
//!
//! This module defines the core job types:
//!
//! - `Job`: A unit of work as it is serialized onto the durable lists
//! - `JobStatus`: Lifecycle state of a job
//! - `StatusRecord`: The per-job status snapshot polled by observers
//! - `JobResult`: Result of a job that a worker acknowledged
//!
//! A job's serialized form is its identity on the queue and processing
//! lists. Serialization goes through `serde_json` with sorted object keys,
//! so re-serializing a parsed job reproduces the same bytes; recovery relies
//! on this to find a job's list entry from its status record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting on the queue list.
    #[default]
    Queued,
    /// Claimed by a worker.
    Running,
    /// Acknowledged complete by a worker.
    Completed,
    /// Reported failed by a worker, or its worker died.
    Failed,
    /// Resubmitted by a caller after a failure.
    Retrying,
}

impl JobStatus {
    /// Returns whether the engine will never move this job again on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Retrying => write!(f, "retrying"),
        }
    }
}

/// A unit of dispatchable work.
///
/// Jobs are immutable once pushed onto a list. The payload and metadata are
/// opaque to the engine and only meaningful to the worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// Unique identifier for this job.
    pub job_id: String,
    /// Status at the time the job was serialized.
    #[serde(default)]
    pub status: JobStatus,
    /// Work description handed to the worker.
    pub payload: serde_json::Value,
    /// Optional caller metadata carried alongside the payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Number of dispatch attempts already made for this job.
    #[serde(default)]
    pub attempts: u32,
    /// When this job was created.
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Creates a new job with a random UUID.
    pub fn new(payload: serde_json::Value) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), payload)
    }

    /// Creates a new job with a caller-assigned identifier.
    pub fn with_id(job_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Queued,
            payload,
            metadata: None,
            attempts: 0,
            created_at: Utc::now(),
        }
    }

    /// Sets optional metadata for the job.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Sets the number of attempts already made.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Serializes the job into its list entry form.
    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses a list entry back into a job.
    pub fn from_payload(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Returns how long ago the job was created.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

/// Latest known state of a job, stored under `{status_key_prefix}{job_id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusRecord {
    pub job_id: String,
    pub status: JobStatus,
    /// Name of the queue that owns the job.
    pub queue: String,
    /// The job exactly as it sits on the lists.
    pub job: Job,
    /// Attempt number of the current or last run.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
    #[serde(default)]
    pub crashed_during_processing: bool,
    pub updated_at: DateTime<Utc>,
}

impl StatusRecord {
    /// Creates a record for `job` in the given state.
    pub fn new(job: &Job, status: JobStatus, queue: impl Into<String>) -> Self {
        Self {
            job_id: job.job_id.clone(),
            status,
            queue: queue.into(),
            job: job.clone(),
            attempts: job.attempts,
            worker_id: None,
            progress: None,
            message: None,
            error: None,
            result: None,
            processing_time_ms: None,
            crashed_during_processing: false,
            updated_at: Utc::now(),
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_worker(mut self, worker_id: usize) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    pub fn with_progress(mut self, progress: Option<f64>, message: Option<String>) -> Self {
        self.progress = progress;
        self.message = message;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_result(mut self, result: Option<serde_json::Value>) -> Self {
        self.result = result;
        self
    }

    pub fn with_processing_time(mut self, processing_time_ms: u64) -> Self {
        self.processing_time_ms = Some(processing_time_ms);
        self
    }

    /// Marks the record as produced by a worker crash.
    pub fn crashed(mut self) -> Self {
        self.crashed_during_processing = true;
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// A job that has been handed to a worker.
///
/// Keeps the raw list entry so the processing list can be cleaned up by
/// exact value once the worker acknowledges.
#[derive(Debug, Clone)]
pub struct InFlightJob {
    pub job: Job,
    pub raw: String,
    pub worker_id: usize,
    /// Attempt number of this run (`job.attempts + 1`).
    pub attempt: u32,
}

impl InFlightJob {
    pub fn new(job: Job, raw: String, worker_id: usize) -> Self {
        let attempt = job.attempts.saturating_add(1);
        Self {
            job,
            raw,
            worker_id,
            attempt,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job.job_id
    }
}

/// Result of a job a worker acknowledged as complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    /// ID of the job that was executed.
    pub job_id: String,
    /// Final status of the job.
    pub status: JobStatus,
    /// Worker-provided result value, if any.
    pub result: Option<serde_json::Value>,
    /// When the job was completed.
    pub completed_at: DateTime<Utc>,
    /// ID of the worker that processed this job.
    pub worker_id: usize,
    /// Duration of the execution in milliseconds.
    pub duration_ms: u64,
}

impl JobResult {
    /// Creates a new successful job result.
    pub fn success(
        job_id: impl Into<String>,
        worker_id: usize,
        result: Option<serde_json::Value>,
        duration_ms: u64,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Completed,
            result,
            completed_at: Utc::now(),
            worker_id,
            duration_ms,
        }
    }

    /// Returns whether the job completed successfully.
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_new() {
        let job = Job::new(json!({"trajectory": "t-1"}));

        assert!(Uuid::parse_str(&job.job_id).is_ok());
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert!(job.metadata.is_none());
    }

    #[test]
    fn test_job_builder() {
        let job = Job::with_id("job-7", json!({"frame": 3}))
            .with_metadata(json!({"team": "a"}))
            .with_attempts(2);

        assert_eq!(job.job_id, "job-7");
        assert_eq!(job.attempts, 2);
        assert_eq!(job.metadata, Some(json!({"team": "a"})));
    }

    #[test]
    fn test_reserialized_payload_is_identical() {
        // Object keys deliberately out of order.
        let job = Job::with_id(
            "job-1",
            json!({"zeta": 1, "alpha": {"y": 2.5, "b": [1, 2]}, "mid": null}),
        )
        .with_metadata(json!({"source": "api", "priority": 3}));

        let raw = job.to_payload().expect("serialize");
        let parsed = Job::from_payload(&raw).expect("parse");
        assert_eq!(parsed, job);
        assert_eq!(parsed.to_payload().expect("serialize again"), raw);
    }

    #[test]
    fn test_status_record_keeps_job_payload() {
        let job = Job::with_id("job-2", json!({"x": 1}));
        let record = StatusRecord::new(&job, JobStatus::Running, "analysis")
            .with_worker(4)
            .with_attempts(1);

        let raw = record.to_json().expect("serialize");
        let parsed = StatusRecord::from_json(&raw).expect("parse");

        assert_eq!(parsed.status, JobStatus::Running);
        assert_eq!(parsed.worker_id, Some(4));
        assert_eq!(
            parsed.job.to_payload().expect("payload"),
            job.to_payload().expect("payload")
        );
    }

    #[test]
    fn test_status_record_wire_format() {
        let job = Job::with_id("job-3", json!({}));
        let record = StatusRecord::new(&job, JobStatus::Failed, "raster")
            .with_error("boom")
            .crashed();

        let value: serde_json::Value =
            serde_json::from_str(&record.to_json().expect("serialize")).expect("json");
        assert_eq!(value["status"], "failed");
        assert_eq!(value["error"], "boom");
        assert_eq!(value["crashed_during_processing"], true);
        assert!(value.get("worker_id").is_none());
    }

    #[test]
    fn test_job_status_display() {
        assert_eq!(JobStatus::Queued.to_string(), "queued");
        assert_eq!(JobStatus::Running.to_string(), "running");
        assert_eq!(JobStatus::Completed.to_string(), "completed");
        assert_eq!(JobStatus::Failed.to_string(), "failed");
        assert_eq!(JobStatus::Retrying.to_string(), "retrying");
        assert!(JobStatus::Completed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_in_flight_attempt_numbering() {
        let job = Job::with_id("job-4", json!({})).with_attempts(2);
        let in_flight = InFlightJob::new(job, "raw".to_string(), 1);

        assert_eq!(in_flight.attempt, 3);
        assert_eq!(in_flight.job_id(), "job-4");
    }

    #[test]
    fn test_job_result_success() {
        let result = JobResult::success("job-5", 2, Some(json!({"frames": 10})), 1500);

        assert!(result.is_success());
        assert_eq!(result.worker_id, 2);
        assert_eq!(result.duration_ms, 1500);
    }
}
