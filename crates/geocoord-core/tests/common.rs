//! Simulated multi-instance cluster for integration tests.
//!
//! Every instance talks to one shared `MemoryKv` through its own
//! `FaultyLockStore`, so a test can fail or hang one instance's store
//! connection while the others keep working. All instances share a
//! `ManualClock`, so lease expiry is driven explicitly by the test.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use geocoord_core::config::{BackgroundJobsConfig, JobMode, LeaderElectionConfig};
use geocoord_core::health::StoreHealthMonitor;
use geocoord_core::jobs::{
    CompletionStore, JobBackends, MemoryCompletionStore, MemoryJobStore, MemoryQueue,
};
use geocoord_core::testing::{FaultMode, FaultyLockStore, OpLog, RecordingListener};
use geocoord_core::{
    Clock, DistributedLockManager, EventBus, InstanceId, KvLockStore, LeaderElector, LockStore,
    ManualClock, MemoryKv, JobScheduler,
};

/// Lock store call bound used by every simulated instance.
pub const OP_TIMEOUT: Duration = Duration::from_millis(200);

/// Election timing used by the simulations.
pub fn election_config() -> LeaderElectionConfig {
    LeaderElectionConfig {
        enabled: true,
        resource_name: "scheduler".into(),
        lease_duration_ms: 3_000,
        renewal_interval_ms: 1_000,
        max_renewal_failures: 3,
        clock_skew_allowance_ms: 100,
    }
}

/// Job settings used by the simulations.
pub fn jobs_config(mode: JobMode) -> BackgroundJobsConfig {
    BackgroundJobsConfig {
        mode,
        max_attempts: 3,
        retry_base_delay_ms: 1_000,
        retry_max_delay_ms: 10_000,
        visibility_timeout_ms: 30_000,
        handler_timeout_ms: 5_000,
        store_timeout_ms: 1_000,
        ..Default::default()
    }
}

/// One simulated process.
pub struct SimInstance {
    pub id: InstanceId,
    pub store: Arc<FaultyLockStore>,
    pub log: OpLog,
    pub events: EventBus,
    pub health: Arc<StoreHealthMonitor>,
    pub locks: DistributedLockManager,
    pub elector: Arc<LeaderElector>,
    pub scheduler: Arc<JobScheduler>,
    pub listener: Arc<RecordingListener>,
}

impl SimInstance {
    /// Injects a fault into this instance's store connection.
    pub fn set_store_mode(&self, mode: FaultMode) {
        self.store.set_mode(mode);
    }

    pub fn is_leader(&self) -> bool {
        self.elector.is_leader()
    }
}

/// Shared stores plus the instances using them.
pub struct SimCluster {
    pub clock: Arc<ManualClock>,
    pub kv: Arc<MemoryKv>,
    pub job_store: Arc<MemoryJobStore>,
    pub queue: Arc<MemoryQueue>,
    pub completions: Arc<MemoryCompletionStore>,
    pub instances: Vec<SimInstance>,
}

impl SimCluster {
    /// Builds `n` instances named `node-0..node-{n-1}` in the given job mode.
    pub fn new(n: usize, mode: JobMode) -> Self {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        let job_store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryQueue::new(clock.clone()));
        let completions = Arc::new(MemoryCompletionStore::new(clock.clone()));

        let instances = (0..n)
            .map(|i| {
                let id = InstanceId::new(format!("node-{}", i));
                let log = OpLog::new();
                let events = EventBus::new(256);
                log.capture_events(events.subscribe());

                let shared: Arc<dyn LockStore> = Arc::new(KvLockStore::new(kv.clone(), clock.clone()));
                let store = Arc::new(FaultyLockStore::with_log(shared, log.clone()));
                let health = Arc::new(StoreHealthMonitor::new(
                    "lock_store",
                    clock.clone(),
                    Duration::from_secs(30),
                ));
                let locks = DistributedLockManager::new(
                    store.clone(),
                    id.clone(),
                    OP_TIMEOUT,
                    health.clone(),
                );
                let elector = Arc::new(LeaderElector::new(
                    store.clone(),
                    id.clone(),
                    election_config(),
                    OP_TIMEOUT,
                    clock.clone(),
                    health.clone(),
                    events.clone(),
                ));

                let completions_dyn: Arc<dyn CompletionStore> = completions.clone();
                let backends = JobBackends {
                    jobs: job_store.clone(),
                    queue: Some(queue.clone()),
                    completions: completions_dyn,
                };
                let job_health = Arc::new(StoreHealthMonitor::new(
                    "job_store",
                    clock.clone(),
                    Duration::from_secs(30),
                ));
                let scheduler = Arc::new(JobScheduler::new(
                    jobs_config(mode),
                    id.clone(),
                    backends,
                    clock.clone(),
                    events.clone(),
                    job_health,
                ));
                scheduler.set_leader(&elector);

                // Scheduler first, so "demoted" is recorded after polling stopped.
                elector.add_listener(scheduler.clone());
                let listener = Arc::new(RecordingListener::with_log(log.clone()));
                elector.add_listener(listener.clone());

                SimInstance {
                    id,
                    store,
                    log,
                    events,
                    health,
                    locks,
                    elector,
                    scheduler,
                    listener,
                }
            })
            .collect();

        Self {
            clock,
            kv,
            job_store,
            queue,
            completions,
            instances,
        }
    }

    pub fn advance(&self, ms: u64) {
        self.clock.advance(Duration::from_millis(ms));
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// A scheduler on the shared job stores that polls without a leader gate,
    /// for racing schedulers against each other directly.
    pub fn ungated_scheduler(&self, name: &str, mode: JobMode, events: EventBus) -> JobScheduler {
        let completions: Arc<dyn CompletionStore> = self.completions.clone();
        let backends = JobBackends {
            jobs: self.job_store.clone(),
            queue: Some(self.queue.clone()),
            completions,
        };
        JobScheduler::new(
            jobs_config(mode),
            InstanceId::new(name),
            backends,
            self.clock.clone(),
            events,
            Arc::new(StoreHealthMonitor::new(
                "job_store",
                self.clock.clone(),
                Duration::from_secs(30),
            )),
        )
    }

    /// Runs one election step on every instance, in index order.
    pub async fn tick_all(&self) {
        for instance in &self.instances {
            instance.elector.tick().await;
        }
    }

    /// Instances that currently believe they lead.
    pub fn leaders(&self) -> Vec<usize> {
        self.instances
            .iter()
            .enumerate()
            .filter(|(_, inst)| inst.is_leader())
            .map(|(i, _)| i)
            .collect()
    }
}
