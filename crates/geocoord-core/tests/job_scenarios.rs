//! Background jobs across instances sharing one job store and queue.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::SimCluster;
use geocoord_core::config::JobMode;
use geocoord_core::jobs::{CompletionStore, DeliveryOutcome, MessageQueue};
use geocoord_core::{CoordinationEvent, EventBus, Job, JobHandler, JobStatus};

/// Counts side effects; optionally slow or always failing.
struct SideEffect {
    calls: AtomicU32,
    delay: Duration,
    fail: bool,
}

impl SideEffect {
    fn new() -> Arc<Self> {
        Self::with(Duration::ZERO, false)
    }

    fn with(delay: Duration, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            delay,
            fail,
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for SideEffect {
    async fn execute(&self, job: &Job) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            anyhow::bail!("tile render failed for {}", job.id);
        }
        Ok(())
    }
}

async fn wait_for_status(cluster: &SimCluster, job_id: &str, status: JobStatus) {
    for _ in 0..200 {
        let job = cluster.instances[0].scheduler.job(job_id).await.unwrap();
        if job.map(|j| j.status) == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never reached {:?}", job_id, status);
}

#[tokio::test]
async fn test_redelivery_during_slow_handler_has_one_side_effect() {
    let cluster = SimCluster::new(2, JobMode::Queue);
    let effect = SideEffect::with(Duration::from_millis(50), false);
    for inst in &cluster.instances {
        inst.scheduler.register_handler("render", effect.clone());
    }
    let a = &cluster.instances[0].scheduler;
    let b = &cluster.instances[1].scheduler;
    a.submit(Job::new("job-42", "render", serde_json::json!({"z": 12}), cluster.now_ms()))
        .await
        .unwrap();

    // a receives, then stalls past the visibility timeout; b receives the redelivery.
    let first = cluster.queue.receive(1, Duration::from_secs(30)).await.unwrap();
    cluster.advance(30_000);
    let second = cluster.queue.receive(1, Duration::from_secs(30)).await.unwrap();
    assert_eq!(second[0].message_id, first[0].message_id);
    assert_eq!(second[0].receive_count, 2);

    let (ra, rb) = tokio::join!(
        a.process_delivery(first[0].clone()),
        b.process_delivery(second[0].clone())
    );
    assert_eq!(ra.unwrap(), DeliveryOutcome::Executed);
    assert_eq!(rb.unwrap(), DeliveryOutcome::Deferred);
    assert_eq!(effect.calls(), 1);
    assert!(cluster.queue.is_empty());

    // Nothing comes back once the deferred visibility lapses.
    cluster.advance(30_000);
    assert_eq!(b.consume_once().await.unwrap(), 0);
    assert_eq!(effect.calls(), 1);
}

#[tokio::test]
async fn test_crash_after_marker_turns_redelivery_into_duplicate() {
    let cluster = SimCluster::new(2, JobMode::Queue);
    let effect = SideEffect::new();
    for inst in &cluster.instances {
        inst.scheduler.register_handler("render", effect.clone());
    }
    let b = &cluster.instances[1].scheduler;
    b.submit(Job::new("job-42", "render", serde_json::json!({}), cluster.now_ms()))
        .await
        .unwrap();

    // a ran the job and recorded completion, then died before acking.
    let first = cluster.queue.receive(1, Duration::from_secs(30)).await.unwrap();
    effect.execute(&first[0].job).await.unwrap();
    let completions = &cluster.completions;
    completions
        .begin("job-42", &first[0].receipt, Duration::from_secs(35))
        .await
        .unwrap();
    completions.complete("job-42", &first[0].receipt).await.unwrap();

    cluster.advance(30_000);
    assert_eq!(b.consume_once().await.unwrap(), 1);
    b.wait_idle().await;
    assert_eq!(effect.calls(), 1);
    assert_eq!(b.stats().duplicates, 1);
    assert!(cluster.queue.is_empty());
}

#[tokio::test]
async fn test_competing_pollers_dead_letter_exactly_once() {
    let cluster = SimCluster::new(0, JobMode::Polling);
    let events = EventBus::new(256);
    let mut rx = events.subscribe();
    let s1 = cluster.ungated_scheduler("poller-1", JobMode::Polling, events.clone());
    let s2 = cluster.ungated_scheduler("poller-2", JobMode::Polling, events.clone());
    let effect = SideEffect::with(Duration::ZERO, true);
    s1.register_handler("render", effect.clone());
    s2.register_handler("render", effect.clone());
    s1.submit(Job::new("tile-7", "render", serde_json::json!({}), cluster.now_ms()))
        .await
        .unwrap();

    for _ in 0..6 {
        let (r1, r2) = tokio::join!(s1.poll_once(), s2.poll_once());
        r1.unwrap();
        r2.unwrap();
        s1.wait_idle().await;
        s2.wait_idle().await;
        cluster.advance(10_000);
    }

    assert_eq!(effect.calls(), 3);
    let job = s1.job("tile-7").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::DeadLettered);
    assert_eq!(job.attempt_count, 3);
    assert_eq!(s1.stats().dead_lettered + s2.stats().dead_lettered, 1);

    let mut dead = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, CoordinationEvent::JobDeadLettered { ref job_id } if job_id == "tile-7") {
            dead += 1;
        }
    }
    assert_eq!(dead, 1);
}

#[tokio::test]
async fn test_only_the_leader_polls_and_handover_moves_polling() {
    let cluster = SimCluster::new(2, JobMode::Polling);
    let on_a = SideEffect::new();
    let on_b = SideEffect::new();
    cluster.instances[0].scheduler.register_handler("render", on_a.clone());
    cluster.instances[1].scheduler.register_handler("render", on_b.clone());

    cluster.instances[0]
        .scheduler
        .submit(Job::new("first", "render", serde_json::json!({}), cluster.now_ms()))
        .await
        .unwrap();

    cluster.tick_all().await;
    assert_eq!(cluster.leaders(), vec![0]);
    wait_for_status(&cluster, "first", JobStatus::Succeeded).await;
    assert_eq!(on_a.calls(), 1);
    assert_eq!(on_b.calls(), 0);

    // A follower's manual poll is refused.
    let follower = &cluster.instances[1].scheduler;
    assert!(!follower.is_polling());
    assert!(follower.poll_once().await.unwrap().skipped);

    // Hand over: a steps down, b wins and starts polling.
    cluster.instances[0].elector.step_down().await;
    assert!(!cluster.instances[0].scheduler.is_polling());
    cluster.instances[1].elector.tick().await;
    assert_eq!(cluster.leaders(), vec![1]);
    assert!(follower.is_polling());

    follower
        .submit(Job::new("second", "render", serde_json::json!({}), cluster.now_ms()))
        .await
        .unwrap();
    wait_for_status(&cluster, "second", JobStatus::Succeeded).await;
    assert_eq!(on_a.calls(), 1);
    assert_eq!(on_b.calls(), 1);
}
