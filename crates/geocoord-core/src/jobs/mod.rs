//! Background jobs: entity, storage contracts and the scheduler.

pub mod completion;
pub mod queue;
pub mod scheduler;
pub mod store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use completion::{CompletionStore, MemoryCompletionStore, Reservation};
pub use queue::{Delivery, MemoryQueue, MessageQueue};
pub use scheduler::{DeliveryOutcome, JobBackends, JobScheduler, PollSummary, SchedulerStats};
pub use store::{JobStore, MemoryJobStore};

/// Lifecycle state of a job.
///
/// `Pending -> Running -> Succeeded`, or `Running -> Failed`, after which the
/// job is either rescheduled (`Failed -> Pending`) or given up on
/// (`Failed -> DeadLettered`). Succeeded and DeadLettered are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Waiting for its scheduled time.
    Pending,
    /// Claimed by a worker.
    Running,
    /// Handler completed.
    Succeeded,
    /// Last attempt failed; about to be rescheduled or dead-lettered.
    Failed,
    /// Attempts exhausted.
    DeadLettered,
}

impl JobStatus {
    /// Returns true for states no transition leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::DeadLettered)
    }
}

/// A unit of background work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique id.
    pub id: String,
    /// Selects the handler.
    pub job_type: String,
    /// Handler input.
    pub payload: serde_json::Value,
    /// Earliest execution time (ms since epoch).
    pub scheduled_at_ms: u64,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Failed attempts so far.
    pub attempt_count: u32,
    /// Side effects happen at most once per key.
    pub idempotency_key: String,
    /// Most recent handler failure.
    pub last_error: Option<String>,
    /// Instance that claimed the job while Running.
    pub claimed_by: Option<String>,
    /// When the current claim was taken.
    pub claimed_at_ms: Option<u64>,
}

impl Job {
    /// Creates a pending job whose idempotency key is its id.
    pub fn new(
        id: impl Into<String>,
        job_type: impl Into<String>,
        payload: serde_json::Value,
        scheduled_at_ms: u64,
    ) -> Self {
        let id = id.into();
        Self {
            idempotency_key: id.clone(),
            id,
            job_type: job_type.into(),
            payload,
            scheduled_at_ms,
            status: JobStatus::Pending,
            attempt_count: 0,
            last_error: None,
            claimed_by: None,
            claimed_at_ms: None,
        }
    }

    /// Overrides the idempotency key.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = key.into();
        self
    }

    /// Returns true if the job may be claimed at `now_ms`.
    pub fn is_due(&self, now_ms: u64) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at_ms <= now_ms
    }
}

/// Executes jobs of one type.
///
/// Handlers may be invoked again for a job whose previous run crashed before
/// it was recorded; with idempotency enabled the scheduler skips keys already
/// completed, but a handler that was cut off mid-way is retried.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Runs the job. An error counts as a failed attempt.
    async fn execute(&self, job: &Job) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_defaults() {
        let job = Job::new("job-42", "reindex", serde_json::json!({"layer": "buildings"}), 10);
        assert_eq!(job.idempotency_key, "job-42");
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.is_due(10));
        assert!(!job.is_due(9));

        let job = job.with_idempotency_key("reindex:buildings");
        assert_eq!(job.idempotency_key, "reindex:buildings");
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::DeadLettered.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
