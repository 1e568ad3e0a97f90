//! Job scheduler.
//!
//! Two execution modes share the handler registry, retry policy and
//! completion markers:
//!
//! - **Polling**: only the current leader runs the poll loop. Each cycle
//!   revalidates leadership against the lock store, recovers stranded jobs,
//!   then claims due jobs with a conditional `Pending -> Running` write.
//! - **Queue**: every instance consumes. Deliveries are at-least-once; the
//!   completion marker keyed by idempotency key turns a redelivery of a job
//!   that already ran into an acknowledgement without re-execution.
//!
//! Handlers already running when the loop stops (or leadership is lost) run
//! to completion.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{duration_ms, Clock};
use crate::config::{BackgroundJobsConfig, JobMode};
use crate::election::{LeaderElector, LeadershipListener};
use crate::error::{CoordError, Result};
use crate::events::{CoordinationEvent, EventBus};
use crate::health::StoreHealthMonitor;
use crate::jobs::completion::{CompletionStore, MemoryCompletionStore, Reservation};
use crate::jobs::queue::{Delivery, MemoryQueue, MessageQueue};
use crate::jobs::store::{JobStore, MemoryJobStore};
use crate::jobs::{Job, JobHandler, JobStatus};
use crate::lock_guard;
use crate::types::{FencingToken, InstanceId};

/// Storage the scheduler runs against.
#[derive(Clone)]
pub struct JobBackends {
    /// Job table (polling mode).
    pub jobs: Arc<dyn JobStore>,
    /// Work queue (queue mode).
    pub queue: Option<Arc<dyn MessageQueue>>,
    /// Completion markers.
    pub completions: Arc<dyn CompletionStore>,
}

impl JobBackends {
    /// In-process backends for a single instance or simulations.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: Arc::new(MemoryJobStore::new()),
            queue: Some(Arc::new(MemoryQueue::new(clock.clone()))),
            completions: Arc::new(MemoryCompletionStore::new(clock)),
        }
    }
}

/// Result of one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// The cycle did nothing because this instance is not the verified leader.
    pub skipped: bool,
    /// Stranded jobs settled.
    pub recovered: usize,
    /// Jobs claimed and handed to workers.
    pub claimed: usize,
    /// Claims lost to another worker.
    pub conflicts: usize,
}

/// What happened to one queue delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The handler ran and succeeded; the message was acked.
    Executed,
    /// The idempotency key was already completed; acked without running.
    Duplicate,
    /// Another worker holds the key; left for redelivery.
    Deferred,
    /// The handler failed; the message reappears after the backoff.
    RetryScheduled,
    /// Attempts exhausted; moved to the dead-letter target.
    DeadLettered,
}

/// Scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Jobs claimed (polling) or deliveries started (queue).
    pub started: u64,
    /// Jobs that succeeded.
    pub succeeded: u64,
    /// Failed attempts rescheduled.
    pub retried: u64,
    /// Jobs dead-lettered.
    pub dead_lettered: u64,
    /// Executions skipped because the key was already completed.
    pub duplicates: u64,
    /// Claims lost to another worker.
    pub claim_conflicts: u64,
    /// Stranded jobs recovered.
    pub recovered: u64,
}

#[derive(Default)]
struct Counters {
    started: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    duplicates: AtomicU64,
    claim_conflicts: AtomicU64,
    recovered: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            started: self.started.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            claim_conflicts: self.claim_conflicts.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum LoopKind {
    Poll,
    Consume,
}

struct LoopHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LoopHandle {
    async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "job loop ended abnormally");
        }
    }
}

struct SchedulerInner {
    config: BackgroundJobsConfig,
    instance_id: InstanceId,
    backends: JobBackends,
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    leader: RwLock<Option<Weak<LeaderElector>>>,
    permits: Arc<Semaphore>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    health: Arc<StoreHealthMonitor>,
    counters: Counters,
}

impl SchedulerInner {
    async fn store_call<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let timeout = self.config.store_timeout();
        let result = match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CoordError::store_unavailable(format!(
                "job {} timed out after {}ms",
                op,
                timeout.as_millis()
            ))),
        };
        self.health.observe(&result);
        result
    }

    fn queue(&self) -> Result<Arc<dyn MessageQueue>> {
        self.backends
            .queue
            .clone()
            .ok_or_else(|| CoordError::Config("queue mode requires a message queue".into()))
    }

    fn handler(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        match self.handlers.read() {
            Ok(h) => h.get(job_type).cloned(),
            Err(poisoned) => poisoned.into_inner().get(job_type).cloned(),
        }
    }

    fn reservation_ttl(&self) -> Duration {
        self.config.handler_timeout() + self.config.visibility_timeout()
    }

    /// Exponential backoff with up to 10% taken off so retries of jobs that
    /// failed together spread out.
    fn backoff(&self, attempt: u32) -> Duration {
        let full = self.config.retry_delay(attempt);
        let spread = duration_ms(full) / 10;
        if spread == 0 {
            return full;
        }
        let jitter = rand::thread_rng().gen_range(0..=spread);
        full.saturating_sub(Duration::from_millis(jitter))
    }

    async fn may_poll(&self) -> bool {
        let leader = match self.leader.read() {
            Ok(l) => l.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let Some(weak) = leader else {
            return true;
        };
        let Some(elector) = weak.upgrade() else {
            return false;
        };
        match elector.verify_leadership().await {
            Ok(true) => true,
            Ok(false) => {
                debug!(instance = %self.instance_id, "not the verified leader; skipping poll");
                false
            }
            Err(e) => {
                warn!(error = %e, "leadership check failed; skipping poll");
                false
            }
        }
    }

    async fn reserve(&self, job: &Job, owner: &str) -> Result<Reservation> {
        if !self.config.idempotency_enabled {
            return Ok(Reservation::Started);
        }
        self.store_call(
            "reserve",
            self.backends
                .completions
                .begin(&job.idempotency_key, owner, self.reservation_ttl()),
        )
        .await
    }

    async fn mark_completed(&self, job: &Job, owner: &str) -> Result<()> {
        if !self.config.idempotency_enabled {
            return Ok(());
        }
        self.store_call(
            "complete",
            self.backends.completions.complete(&job.idempotency_key, owner),
        )
        .await
    }

    async fn release_reservation(&self, job: &Job, owner: &str) {
        if !self.config.idempotency_enabled {
            return;
        }
        let result = self
            .store_call(
                "abandon",
                self.backends.completions.abandon(&job.idempotency_key, owner),
            )
            .await;
        if let Err(e) = result {
            debug!(job_id = %job.id, error = %e, "reservation left to expire");
        }
    }

    /// 1-based number of the queue attempt about to run. Deferred and
    /// duplicate deliveries never ran the handler, so the receive count is
    /// only used when there are no completion markers to count failures.
    async fn queue_attempt(&self, delivery: &Delivery) -> u32 {
        if !self.config.idempotency_enabled {
            return delivery.receive_count;
        }
        let key = &delivery.job.idempotency_key;
        match self
            .store_call("failed-attempts", self.backends.completions.failed_attempts(key))
            .await
        {
            Ok(failed) => failed + 1,
            Err(e) => {
                warn!(job_id = %delivery.job.id, error = %e, "attempt count unavailable; using receive count");
                delivery.receive_count
            }
        }
    }

    /// Releases the reservation and returns the failed executions recorded
    /// for the key, falling back to `attempt` without a counter.
    async fn record_queue_failure(&self, job: &Job, owner: &str, attempt: u32) -> u32 {
        if !self.config.idempotency_enabled {
            return attempt;
        }
        match self
            .store_call(
                "record-failure",
                self.backends.completions.record_failure(&job.idempotency_key, owner),
            )
            .await
        {
            Ok(failed) => failed.max(attempt),
            Err(e) => {
                debug!(job_id = %job.id, error = %e, "failure not recorded; reservation left to expire");
                attempt
            }
        }
    }

    async fn execute(&self, job: &Job, attempt: u32) -> Result<()> {
        let failed = |reason: String| CoordError::JobExecutionFailed {
            job_id: job.id.clone(),
            attempt,
            reason,
        };
        let Some(handler) = self.handler(&job.job_type) else {
            return Err(failed(format!("no handler for job type {}", job.job_type)));
        };
        debug!(job_id = %job.id, job_type = %job.job_type, attempt, "executing job");
        match tokio::time::timeout(self.config.handler_timeout(), handler.execute(job)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(failed(format!("{:#}", e))),
            Err(_) => Err(failed(format!(
                "handler timed out after {}ms",
                self.config.handler_timeout_ms
            ))),
        }
    }

    fn publish_dead_letter(&self, job_id: &str, attempts: u32, reason: &str) {
        Counters::bump(&self.counters.dead_lettered);
        error!(job_id, attempts, reason, "job dead-lettered");
        self.events.publish(CoordinationEvent::JobCompleted {
            job_id: job_id.to_string(),
            status: JobStatus::DeadLettered,
        });
        self.events.publish(CoordinationEvent::JobDeadLettered {
            job_id: job_id.to_string(),
        });
    }

    fn publish_success(&self, job_id: &str) {
        Counters::bump(&self.counters.succeeded);
        self.events.publish(CoordinationEvent::JobCompleted {
            job_id: job_id.to_string(),
            status: JobStatus::Succeeded,
        });
    }

    // Polling mode

    async fn poll_once(self: &Arc<Self>) -> Result<PollSummary> {
        let mut summary = PollSummary::default();
        if !self.may_poll().await {
            summary.skipped = true;
            return Ok(summary);
        }

        let now = self.clock.now_ms();
        let claimed_before = now.saturating_sub(duration_ms(self.reservation_ttl()));
        let stranded = self
            .store_call(
                "scan",
                self.backends.jobs.stranded(claimed_before, self.config.batch_size),
            )
            .await?;
        for job in stranded {
            warn!(job_id = %job.id, status = ?job.status, claimed_by = ?job.claimed_by, "recovering stranded job");
            match job.status {
                JobStatus::Running => {
                    let err = CoordError::JobExecutionFailed {
                        job_id: job.id.clone(),
                        attempt: job.attempt_count + 1,
                        reason: "claim expired before the job completed".into(),
                    };
                    self.fail_attempt(job, &err).await?;
                }
                _ => {
                    let reason = job.last_error.clone().unwrap_or_default();
                    self.settle_failure(job, &reason).await?;
                }
            }
            Counters::bump(&self.counters.recovered);
            summary.recovered += 1;
        }

        let free = self.permits.available_permits().min(self.config.batch_size);
        if free == 0 {
            return Ok(summary);
        }
        let due = self
            .store_call("scan", self.backends.jobs.due(now, free))
            .await?;
        for job in due {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };
            let mut claimed = job.clone();
            claimed.status = JobStatus::Running;
            claimed.claimed_by = Some(self.instance_id.to_string());
            claimed.claimed_at_ms = Some(now);
            let won = self
                .store_call(
                    "claim",
                    self.backends
                        .jobs
                        .transition(&job.id, JobStatus::Pending, claimed.clone()),
                )
                .await?;
            if !won {
                debug!(job_id = %job.id, "claim lost to another worker");
                Counters::bump(&self.counters.claim_conflicts);
                summary.conflicts += 1;
                continue;
            }
            Counters::bump(&self.counters.started);
            summary.claimed += 1;
            let inner = self.clone();
            tokio::spawn(async move {
                let job_id = claimed.id.clone();
                if let Err(e) = inner.run_claimed(claimed).await {
                    warn!(job_id = %job_id, error = %e, "job bookkeeping failed; the claim will be recovered");
                }
                drop(permit);
            });
        }
        Ok(summary)
    }

    async fn run_claimed(&self, job: Job) -> Result<()> {
        let owner = Uuid::new_v4().to_string();
        match self.reserve(&job, &owner).await? {
            Reservation::Started => {}
            Reservation::AlreadyCompleted => {
                debug!(job_id = %job.id, key = %job.idempotency_key, "already completed; not re-executing");
                Counters::bump(&self.counters.duplicates);
                return self.succeed(job).await;
            }
            Reservation::InProgress => {
                debug!(job_id = %job.id, key = %job.idempotency_key, "key in progress elsewhere; deferring");
                let mut pending = job.clone();
                pending.status = JobStatus::Pending;
                pending.scheduled_at_ms = self
                    .clock
                    .now_ms()
                    .saturating_add(self.config.retry_base_delay_ms);
                pending.claimed_by = None;
                pending.claimed_at_ms = None;
                self.store_call(
                    "defer",
                    self.backends
                        .jobs
                        .transition(&job.id, JobStatus::Running, pending),
                )
                .await?;
                return Ok(());
            }
        }

        match self.execute(&job, job.attempt_count + 1).await {
            Ok(()) => {
                self.mark_completed(&job, &owner).await?;
                self.succeed(job).await
            }
            Err(e) => {
                self.release_reservation(&job, &owner).await;
                self.fail_attempt(job, &e).await
            }
        }
    }

    async fn succeed(&self, job: Job) -> Result<()> {
        let mut done = job.clone();
        done.status = JobStatus::Succeeded;
        done.claimed_by = None;
        done.claimed_at_ms = None;
        let won = self
            .store_call(
                "complete",
                self.backends
                    .jobs
                    .transition(&job.id, JobStatus::Running, done),
            )
            .await?;
        if won {
            debug!(job_id = %job.id, "job succeeded");
            self.publish_success(&job.id);
        } else {
            warn!(job_id = %job.id, "job settled elsewhere before it completed");
        }
        Ok(())
    }

    async fn fail_attempt(&self, job: Job, err: &CoordError) -> Result<()> {
        let mut failed = job.clone();
        failed.status = JobStatus::Failed;
        failed.attempt_count = job.attempt_count + 1;
        failed.last_error = Some(err.to_string());
        failed.claimed_by = None;
        failed.claimed_at_ms = None;
        let won = self
            .store_call(
                "fail",
                self.backends
                    .jobs
                    .transition(&job.id, JobStatus::Running, failed.clone()),
            )
            .await?;
        if !won {
            debug!(job_id = %job.id, "job settled elsewhere");
            return Ok(());
        }
        self.settle_failure(failed, &err.to_string()).await
    }

    async fn settle_failure(&self, failed: Job, reason: &str) -> Result<()> {
        let attempts = failed.attempt_count;
        if attempts >= self.config.max_attempts {
            let mut dead = failed.clone();
            dead.status = JobStatus::DeadLettered;
            let won = self
                .store_call(
                    "dead-letter",
                    self.backends
                        .jobs
                        .transition(&failed.id, JobStatus::Failed, dead),
                )
                .await?;
            if won {
                self.publish_dead_letter(&failed.id, attempts, reason);
            }
            return Ok(());
        }

        let delay = self.backoff(attempts);
        let run_at = self.clock.now_ms().saturating_add(duration_ms(delay));
        if self
            .store_call("reschedule", self.backends.jobs.reschedule(&failed, run_at))
            .await?
        {
            Counters::bump(&self.counters.retried);
            warn!(
                job_id = %failed.id,
                attempt = attempts,
                retry_in_ms = duration_ms(delay),
                reason,
                "job attempt failed; retrying"
            );
        }
        Ok(())
    }

    // Queue mode

    async fn consume_once(self: &Arc<Self>) -> Result<usize> {
        let queue = self.queue()?;
        let free = self.permits.available_permits().min(self.config.batch_size);
        if free == 0 {
            return Ok(0);
        }
        let deliveries = self
            .store_call(
                "receive",
                queue.receive(free, self.config.visibility_timeout()),
            )
            .await?;
        let received = deliveries.len();
        for delivery in deliveries {
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                break;
            };
            let inner = self.clone();
            tokio::spawn(async move {
                let message_id = delivery.message_id.clone();
                if let Err(e) = inner.process_delivery(delivery).await {
                    warn!(%message_id, error = %e, "delivery left for redelivery");
                }
                drop(permit);
            });
        }
        Ok(received)
    }

    async fn process_delivery(&self, delivery: Delivery) -> Result<DeliveryOutcome> {
        let queue = self.queue()?;
        let job = &delivery.job;
        match self.reserve(job, &delivery.receipt).await? {
            Reservation::Started => {}
            Reservation::AlreadyCompleted => {
                debug!(job_id = %job.id, key = %job.idempotency_key, "duplicate delivery acknowledged");
                Counters::bump(&self.counters.duplicates);
                self.store_call("ack", queue.ack(&delivery.receipt)).await?;
                return Ok(DeliveryOutcome::Duplicate);
            }
            Reservation::InProgress => {
                debug!(job_id = %job.id, key = %job.idempotency_key, "key in progress elsewhere");
                return Ok(DeliveryOutcome::Deferred);
            }
        }
        Counters::bump(&self.counters.started);

        let attempt = self.queue_attempt(&delivery).await;
        match self.execute_with_heartbeat(queue.as_ref(), &delivery, attempt).await {
            Ok(()) => {
                // Marker first: a crash before the ack turns the redelivery into a duplicate.
                self.mark_completed(job, &delivery.receipt).await?;
                self.store_call("ack", queue.ack(&delivery.receipt)).await?;
                debug!(job_id = %job.id, attempt, "job succeeded");
                self.publish_success(&job.id);
                Ok(DeliveryOutcome::Executed)
            }
            Err(e) => {
                let attempt = self.record_queue_failure(job, &delivery.receipt, attempt).await;
                let reason = e.to_string();
                if attempt >= self.config.max_attempts {
                    let moved = self
                        .store_call("dead-letter", queue.dead_letter(&delivery.receipt, &reason))
                        .await?;
                    if !moved {
                        return Ok(DeliveryOutcome::Deferred);
                    }
                    self.publish_dead_letter(&job.id, attempt, &reason);
                    return Ok(DeliveryOutcome::DeadLettered);
                }
                let delay = self.backoff(attempt);
                self.store_call("retry", queue.extend_visibility(&delivery.receipt, delay))
                    .await?;
                Counters::bump(&self.counters.retried);
                warn!(
                    job_id = %job.id,
                    attempt,
                    retry_in_ms = duration_ms(delay),
                    reason = %reason,
                    "job attempt failed; retrying"
                );
                Ok(DeliveryOutcome::RetryScheduled)
            }
        }
    }

    /// Runs the handler while pushing the message's visibility out every half
    /// timeout, so a slow handler is not redelivered mid-flight.
    async fn execute_with_heartbeat(
        &self,
        queue: &dyn MessageQueue,
        delivery: &Delivery,
        attempt: u32,
    ) -> Result<()> {
        let vt = self.config.visibility_timeout();
        let period = (vt / 2).max(Duration::from_millis(1));
        let run = self.execute(&delivery.job, attempt);
        tokio::pin!(run);
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                result = &mut run => return result,
                _ = heartbeat.tick() => {
                    match self.store_call("extend", queue.extend_visibility(&delivery.receipt, vt)).await {
                        Ok(true) => debug!(job_id = %delivery.job.id, "visibility extended"),
                        Ok(false) => warn!(job_id = %delivery.job.id, "receipt superseded; message may be redelivered"),
                        Err(e) => warn!(job_id = %delivery.job.id, error = %e, "visibility extension failed"),
                    }
                }
            }
        }
    }

    async fn cycle(self: &Arc<Self>, kind: LoopKind) {
        match kind {
            LoopKind::Poll => match self.poll_once().await {
                Ok(summary) if summary.claimed > 0 || summary.recovered > 0 => {
                    debug!(claimed = summary.claimed, recovered = summary.recovered, "poll cycle");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "poll cycle failed"),
            },
            LoopKind::Consume => {
                if let Err(e) = self.consume_once().await {
                    warn!(error = %e, "queue receive failed");
                }
            }
        }
    }
}

fn spawn_loop(inner: Arc<SchedulerInner>, kind: LoopKind) -> LoopHandle {
    let (stop, mut stop_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(inner.config.polling_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                _ = ticker.tick() => {}
            }
            inner.cycle(kind).await;
        }
        debug!(?kind, "job loop stopped");
    });
    LoopHandle { stop, task }
}

/// Runs background jobs in polling or queue mode.
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
    poller: std::sync::Mutex<Option<LoopHandle>>,
    consumer: std::sync::Mutex<Option<LoopHandle>>,
}

impl JobScheduler {
    /// Creates an idle scheduler.
    pub fn new(
        config: BackgroundJobsConfig,
        instance_id: InstanceId,
        backends: JobBackends,
        clock: Arc<dyn Clock>,
        events: EventBus,
        health: Arc<StoreHealthMonitor>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency));
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                instance_id,
                backends,
                handlers: RwLock::new(HashMap::new()),
                leader: RwLock::new(None),
                permits,
                clock,
                events,
                health,
                counters: Counters::default(),
            }),
            poller: std::sync::Mutex::new(None),
            consumer: std::sync::Mutex::new(None),
        }
    }

    /// Gates polling on `elector`: every cycle verifies leadership first.
    /// The scheduler keeps only a weak reference.
    pub fn set_leader(&self, elector: &Arc<LeaderElector>) {
        let weak = Some(Arc::downgrade(elector));
        match self.inner.leader.write() {
            Ok(mut l) => *l = weak,
            Err(poisoned) => *poisoned.into_inner() = weak,
        }
    }

    /// Registers the handler for `job_type`, replacing any previous one.
    pub fn register_handler(&self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let job_type = job_type.into();
        match self.inner.handlers.write() {
            Ok(mut h) => h.insert(job_type, handler),
            Err(poisoned) => poisoned.into_inner().insert(job_type, handler),
        };
    }

    /// Execution mode.
    pub fn mode(&self) -> JobMode {
        self.inner.config.mode
    }

    /// Enqueues a job: into the job table in polling mode, onto the queue in
    /// queue mode (delayed until `scheduled_at_ms`).
    pub async fn submit(&self, job: Job) -> Result<()> {
        debug!(job_id = %job.id, job_type = %job.job_type, "submitting job");
        match self.inner.config.mode {
            JobMode::Polling => {
                self.inner
                    .store_call("insert", self.inner.backends.jobs.insert(job))
                    .await
            }
            JobMode::Queue => {
                let queue = self.inner.queue()?;
                let delay_ms = job.scheduled_at_ms.saturating_sub(self.inner.clock.now_ms());
                self.inner
                    .store_call("send", queue.send(job, Duration::from_millis(delay_ms)))
                    .await
                    .map(|_| ())
            }
        }
    }

    /// Reads a job from the job table.
    pub async fn job(&self, id: &str) -> Result<Option<Job>> {
        self.inner
            .store_call("get", self.inner.backends.jobs.get(id))
            .await
    }

    /// Status of a job in the job table. A job that exhausted its attempts
    /// is reported as [`CoordError::JobDeadLettered`].
    pub async fn outcome(&self, id: &str) -> Result<Option<JobStatus>> {
        match self.job(id).await? {
            Some(job) if job.status == JobStatus::DeadLettered => Err(CoordError::JobDeadLettered {
                job_id: job.id,
                attempts: job.attempt_count,
            }),
            other => Ok(other.map(|job| job.status)),
        }
    }

    /// Starts the mode's loop. Polling without an elector starts immediately;
    /// with one, leadership callbacks start and stop it.
    pub fn start(&self) {
        match self.inner.config.mode {
            JobMode::Queue => self.start_consuming(),
            JobMode::Polling => {
                let gated = match self.inner.leader.read() {
                    Ok(l) => l.is_some(),
                    Err(poisoned) => poisoned.into_inner().is_some(),
                };
                if !gated {
                    self.start_polling();
                }
            }
        }
    }

    /// Starts the poll loop if it is not running.
    pub fn start_polling(&self) {
        let mut poller = lock_guard(&self.poller);
        if poller.is_none() {
            info!(instance = %self.inner.instance_id, "starting job poll loop");
            *poller = Some(spawn_loop(self.inner.clone(), LoopKind::Poll));
        }
    }

    /// Stops the poll loop, waiting for an in-progress cycle to finish.
    /// Handlers already dispatched keep running.
    pub async fn stop_polling(&self) {
        let handle = lock_guard(&self.poller).take();
        if let Some(handle) = handle {
            handle.stop().await;
            info!(instance = %self.inner.instance_id, "job poll loop stopped");
        }
    }

    /// Returns true while the poll loop runs.
    pub fn is_polling(&self) -> bool {
        lock_guard(&self.poller).is_some()
    }

    /// Runs one poll cycle now.
    pub async fn poll_once(&self) -> Result<PollSummary> {
        self.inner.poll_once().await
    }

    /// Starts the queue consumer if it is not running.
    pub fn start_consuming(&self) {
        let mut consumer = lock_guard(&self.consumer);
        if consumer.is_none() {
            info!(instance = %self.inner.instance_id, "starting queue consumer");
            *consumer = Some(spawn_loop(self.inner.clone(), LoopKind::Consume));
        }
    }

    /// Stops the queue consumer.
    pub async fn stop_consuming(&self) {
        let handle = lock_guard(&self.consumer).take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    /// Returns true while the queue consumer runs.
    pub fn is_consuming(&self) -> bool {
        lock_guard(&self.consumer).is_some()
    }

    /// Receives one batch and dispatches it to workers. Returns the number of
    /// deliveries received.
    pub async fn consume_once(&self) -> Result<usize> {
        self.inner.consume_once().await
    }

    /// Handles one delivery inline.
    pub async fn process_delivery(&self, delivery: Delivery) -> Result<DeliveryOutcome> {
        self.inner.process_delivery(delivery).await
    }

    /// Waits until no handler is running.
    pub async fn wait_idle(&self) {
        let all = u32::try_from(self.inner.config.max_concurrency).unwrap_or(u32::MAX);
        if let Ok(permits) = self.inner.permits.acquire_many(all).await {
            drop(permits);
        }
    }

    /// Handlers currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.config.max_concurrency - self.inner.permits.available_permits()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> SchedulerStats {
        self.inner.counters.snapshot()
    }

    /// Stops both loops and waits for running handlers.
    pub async fn shutdown(&self) {
        self.stop_polling().await;
        self.stop_consuming().await;
        self.wait_idle().await;
    }
}

#[async_trait]
impl LeadershipListener for JobScheduler {
    async fn on_elected(&self, term: FencingToken) {
        if self.inner.config.mode == JobMode::Polling {
            debug!(term = term.value(), "leadership gained; polling for jobs");
            self.start_polling();
        }
    }

    async fn on_demoted(&self) {
        self.stop_polling().await;
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        for slot in [&self.poller, &self.consumer] {
            if let Some(handle) = lock_guard(slot).take() {
                handle.task.abort();
            }
        }
    }
}
