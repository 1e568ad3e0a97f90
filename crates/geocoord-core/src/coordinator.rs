//! Assembles the coordination components from one [`CoordinationConfig`].

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::admission::AdmissionController;
use crate::clock::{Clock, SystemClock};
use crate::config::{CoordinationConfig, JobMode, LockBackend};
use crate::election::LeaderElector;
use crate::error::{CoordError, Result};
use crate::events::{CoordinationEvent, EventBus};
use crate::health::{HealthReport, StoreHealthMonitor};
use crate::jobs::{JobBackends, JobScheduler};
use crate::lock::DistributedLockManager;
use crate::lock_store::{LockStore, MemoryLockStore};
use crate::lock_guard;
use crate::replica::{ReplicaProbe, ReplicaRouter};
use crate::types::{FencingToken, InstanceId};

/// One instance's coordination layer.
pub struct Coordinator {
    config: CoordinationConfig,
    instance_id: InstanceId,
    clock: Arc<dyn Clock>,
    events: EventBus,
    lock_health: Arc<StoreHealthMonitor>,
    job_health: Arc<StoreHealthMonitor>,
    locks: DistributedLockManager,
    elector: Option<Arc<LeaderElector>>,
    scheduler: Arc<JobScheduler>,
    admission: Arc<AdmissionController>,
    router: Arc<ReplicaRouter>,
    probe: Option<Arc<dyn ReplicaProbe>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Builds a single-process coordinator on in-memory stores and the system clock.
    pub fn in_memory(config: CoordinationConfig) -> Result<Self> {
        if config.lock_manager == LockBackend::External {
            return Err(CoordError::Config(
                "lock_manager = \"external\" needs a shared store; use Coordinator::with_backends"
                    .into(),
            ));
        }
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(MemoryLockStore::new(clock.clone()));
        let jobs = JobBackends::in_memory(clock.clone());
        Self::with_backends(config, store, jobs, clock)
    }

    /// Builds a coordinator on caller-supplied stores.
    pub fn with_backends(
        config: CoordinationConfig,
        lock_store: Arc<dyn LockStore>,
        jobs: JobBackends,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        if lock_store.backend() != config.lock_manager {
            return Err(CoordError::Config(format!(
                "lock store backend {:?} does not match lock_manager {:?}",
                lock_store.backend(),
                config.lock_manager
            )));
        }
        if config.background_jobs.mode == JobMode::Queue && jobs.queue.is_none() {
            return Err(CoordError::Config(
                "background_jobs.mode = \"queue\" needs a message queue".into(),
            ));
        }

        let instance_id = config
            .cluster
            .instance_id
            .clone()
            .map(InstanceId::new)
            .unwrap_or_else(InstanceId::generate);
        let events = EventBus::default();
        let deadline = config.health.store_unavailable_deadline();
        let lock_health = Arc::new(StoreHealthMonitor::new("lock_store", clock.clone(), deadline));
        let job_health = Arc::new(StoreHealthMonitor::new("job_store", clock.clone(), deadline));

        let locks = DistributedLockManager::new(
            lock_store.clone(),
            instance_id.clone(),
            config.lock_timeout(),
            lock_health.clone(),
        );

        let scheduler = Arc::new(JobScheduler::new(
            config.background_jobs.clone(),
            instance_id.clone(),
            jobs,
            clock.clone(),
            events.clone(),
            job_health.clone(),
        ));

        let elector = if config.leader_election.enabled {
            let elector = Arc::new(LeaderElector::new(
                lock_store,
                instance_id.clone(),
                config.leader_election.clone(),
                config.lock_timeout(),
                clock.clone(),
                lock_health.clone(),
                events.clone(),
            ));
            scheduler.set_leader(&elector);
            elector.add_listener(scheduler.clone());
            Some(elector)
        } else {
            None
        };

        let admission = Arc::new(
            AdmissionController::new(
                config.rate_limit.clone(),
                config.load_shed.clone(),
                clock.clone(),
                events.clone(),
            )
            .with_store_health(lock_health.clone()),
        );
        let router = Arc::new(ReplicaRouter::new(config.replica_routing.clone()));

        Ok(Self {
            config,
            instance_id,
            clock,
            events,
            lock_health,
            job_health,
            locks,
            elector,
            scheduler,
            admission,
            router,
            probe: None,
            background: Mutex::new(Vec::new()),
        })
    }

    /// Probes replicas with `probe` every `replica_routing.probe_interval_ms`
    /// once started.
    pub fn with_replica_probe(mut self, probe: Arc<dyn ReplicaProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Starts leader election, job processing, rate limit bucket pruning and,
    /// with a probe configured, replica health checks.
    pub fn start(&self) {
        info!(
            instance = %self.instance_id,
            backend = ?self.config.lock_manager,
            mode = ?self.config.background_jobs.mode,
            election = self.elector.is_some(),
            "coordinator starting"
        );
        if let Some(elector) = &self.elector {
            elector.start();
        }
        self.scheduler.start();

        let mut background = lock_guard(&self.background);
        background.push(self.admission.spawn_pruner());
        if let Some(probe) = &self.probe {
            if self.config.replica_routing.enabled && !self.config.replica_routing.replicas.is_empty() {
                background.push(self.router.spawn_health_checks(probe.clone()));
            }
        }
    }

    /// Steps down if leader, stops job loops and waits for running handlers.
    pub async fn shutdown(&self) {
        if let Some(elector) = &self.elector {
            elector.shutdown().await;
        }
        self.scheduler.shutdown().await;
        for task in lock_guard(&self.background).drain(..) {
            task.abort();
        }
        info!(instance = %self.instance_id, "coordinator stopped");
    }

    /// This instance's id.
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Effective configuration.
    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    /// Lock manager.
    pub fn locks(&self) -> &DistributedLockManager {
        &self.locks
    }

    /// Leader elector, if election is enabled.
    pub fn elector(&self) -> Option<&Arc<LeaderElector>> {
        self.elector.as_ref()
    }

    /// Job scheduler.
    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    /// Admission controller.
    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Replica router.
    pub fn router(&self) -> &Arc<ReplicaRouter> {
        &self.router
    }

    /// Event bus shared by all components.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Subscribes to coordination events.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinationEvent> {
        self.events.subscribe()
    }

    /// Local leadership belief. Without election every instance leads.
    pub fn is_leader(&self) -> bool {
        self.elector.as_ref().map_or(true, |e| e.is_leader())
    }

    /// Admits one unit for `admission_key`, then runs `write` under the lock
    /// on `resource_key` with its fencing token.
    pub async fn guarded_write<F, Fut, T>(
        &self,
        admission_key: &str,
        resource_key: &str,
        ttl: Duration,
        write: F,
    ) -> Result<T>
    where
        F: FnOnce(FencingToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admission.admit(admission_key, 1.0)?;
        self.locks.with_lock(resource_key, ttl, write).await
    }

    /// Process health: store monitors plus replica routing.
    pub fn health_report(&self) -> HealthReport {
        let now = self.clock.now_ms();
        HealthReport::from_components(
            self.instance_id.to_string(),
            vec![
                self.lock_health.component_health(),
                self.job_health.component_health(),
                self.router.component_health(now),
            ],
            self.is_leader(),
            now,
        )
    }
}
