//! Job table contract.
//!
//! Mirrors a relational `jobs` table. Every state change goes through
//! [`JobStore::transition`], an optimistic write that only applies if the row
//! still has the status the caller read, so two schedulers racing for the
//! same row cannot both win.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{CoordError, Result};
use crate::jobs::{Job, JobStatus};
use crate::lock_guard;

/// Storage for jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Adds a job. Fails if the id already exists.
    async fn insert(&self, job: Job) -> Result<()>;

    /// Reads a job by id.
    async fn get(&self, id: &str) -> Result<Option<Job>>;

    /// Pending jobs with `scheduled_at_ms <= now_ms`, earliest first.
    async fn due(&self, now_ms: u64, limit: usize) -> Result<Vec<Job>>;

    /// Jobs a worker abandoned: Running with a claim taken at or before
    /// `claimed_before_ms`, or Failed and never settled.
    async fn stranded(&self, claimed_before_ms: u64, limit: usize) -> Result<Vec<Job>>;

    /// Replaces the row with `next` if its current status is `expected`.
    /// Returns false when another writer changed the row first.
    async fn transition(&self, id: &str, expected: JobStatus, next: Job) -> Result<bool>;

    /// Moves a `Failed` job back to `Pending`, due at `run_at_ms`.
    async fn reschedule(&self, job: &Job, run_at_ms: u64) -> Result<bool> {
        let mut next = job.clone();
        next.status = JobStatus::Pending;
        next.scheduled_at_ms = run_at_ms;
        next.claimed_by = None;
        next.claimed_at_ms = None;
        self.transition(&job.id, JobStatus::Failed, next).await
    }
}

/// In-memory job table.
#[derive(Default)]
pub struct MemoryJobStore {
    rows: Mutex<HashMap<String, Job>>,
}

impl MemoryJobStore {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs in `status`.
    pub fn count(&self, status: JobStatus) -> usize {
        lock_guard(&self.rows)
            .values()
            .filter(|j| j.status == status)
            .count()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: Job) -> Result<()> {
        let mut rows = lock_guard(&self.rows);
        if rows.contains_key(&job.id) {
            return Err(CoordError::Config(format!("duplicate job id {}", job.id)));
        }
        rows.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Job>> {
        Ok(lock_guard(&self.rows).get(id).cloned())
    }

    async fn due(&self, now_ms: u64, limit: usize) -> Result<Vec<Job>> {
        let rows = lock_guard(&self.rows);
        let mut due: Vec<Job> = rows.values().filter(|j| j.is_due(now_ms)).cloned().collect();
        due.sort_by(|a, b| {
            a.scheduled_at_ms
                .cmp(&b.scheduled_at_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn stranded(&self, claimed_before_ms: u64, limit: usize) -> Result<Vec<Job>> {
        let rows = lock_guard(&self.rows);
        Ok(rows
            .values()
            .filter(|j| match j.status {
                JobStatus::Running => j.claimed_at_ms.map_or(true, |t| t <= claimed_before_ms),
                JobStatus::Failed => true,
                _ => false,
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn transition(&self, id: &str, expected: JobStatus, next: Job) -> Result<bool> {
        let mut rows = lock_guard(&self.rows);
        match rows.get_mut(id) {
            Some(row) if row.status == expected => {
                *row = next;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
