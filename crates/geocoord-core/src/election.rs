//! Lease-based leader election.
//!
//! Each instance runs one [`LeaderElector`] per cluster resource. The elector
//! is an explicit state machine driven by a periodic timer:
//!
//! ```text
//!   Follower --tick--> Candidate --acquired--> Leader
//!       ^                  |                     |
//!       +----contended-----+                     |
//!       +---renewal failed / deadline / step-down+
//! ```
//!
//! Leadership is the lease on `leader/<resource_name>`; the lease's fencing
//! token is the term. A leader renews every `renewal_interval` and steps down
//! after `max_renewal_failures` consecutive failed renewals, or as soon as its
//! locally computed lease deadline minus `clock_skew_allowance` has passed,
//! whichever comes first. Two instances therefore overlap as leaders only if
//! their clocks disagree by more than the skew allowance.
//!
//! Step-down order is fixed: state becomes Follower, every listener's
//! `on_demoted` is awaited (the job scheduler stops its poll loop there), the
//! `LeadershipChanged(false)` event is published, and only then is the lease
//! released.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::{duration_ms, Clock};
use crate::config::LeaderElectionConfig;
use crate::error::{CoordError, Result};
use crate::events::{CoordinationEvent, EventBus};
use crate::health::StoreHealthMonitor;
use crate::lock_store::LockStore;
use crate::types::{FencingToken, InstanceId, Lease};

/// Role of this instance for one election resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Not the leader.
    Follower,
    /// Attempting to acquire the leadership lease.
    Candidate,
    /// Holds the leadership lease.
    Leader,
}

/// Locally cached view of the election. Advisory only; see
/// [`LeaderElector::verify_leadership`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderState {
    /// Election resource name.
    pub resource_name: String,
    /// This instance's role.
    pub role: Role,
    /// Last known leader, if any.
    pub current_leader_id: Option<InstanceId>,
    /// Local leadership deadline (ms since epoch); 0 when not leader.
    pub lease_expires_at_ms: u64,
    /// Fencing token of the leadership lease while leader.
    pub term: Option<FencingToken>,
}

/// Consumer of leadership changes.
///
/// Callbacks are awaited in registration order before the elector moves on,
/// so work gated by leadership can be stopped before the lease is released.
#[async_trait]
pub trait LeadershipListener: Send + Sync {
    /// This instance became leader for `term`.
    async fn on_elected(&self, term: FencingToken);

    /// This instance is no longer leader. Must return only once leader-only
    /// background work has stopped.
    async fn on_demoted(&self);
}

#[derive(Default)]
struct ElectorRuntime {
    lease: Option<Lease>,
    consecutive_failures: u32,
    local_deadline_ms: u64,
    campaign_after_ms: u64,
}

struct ElectorInner {
    store: Arc<dyn LockStore>,
    instance_id: InstanceId,
    resource_key: String,
    config: LeaderElectionConfig,
    op_timeout: Duration,
    clock: Arc<dyn Clock>,
    health: Arc<StoreHealthMonitor>,
    events: EventBus,
    listeners: RwLock<Vec<Arc<dyn LeadershipListener>>>,
    state_tx: watch::Sender<LeaderState>,
    runtime: Mutex<ElectorRuntime>,
}

impl ElectorInner {
    async fn store_call<T, F>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let result = match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CoordError::store_unavailable(format!(
                "leadership store call on {} timed out after {}ms",
                self.resource_key,
                self.op_timeout.as_millis()
            ))),
        };
        self.health.observe(&result);
        result
    }

    fn listeners(&self) -> Vec<Arc<dyn LeadershipListener>> {
        self.listeners
            .read()
            .map(|l| l.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn set_state(&self, role: Role, leader: Option<InstanceId>, deadline_ms: u64, term: Option<FencingToken>) {
        self.state_tx.send_modify(|s| {
            s.role = role;
            s.current_leader_id = leader;
            s.lease_expires_at_ms = deadline_ms;
            s.term = term;
        });
    }

    fn ttl(&self) -> Duration {
        self.config.lease_duration()
    }

    /// Last instant (local clock) at which this instance may still act as leader.
    fn belief_cutoff(&self, deadline_ms: u64) -> u64 {
        deadline_ms.saturating_sub(self.config.clock_skew_allowance_ms)
    }

    async fn tick(&self) {
        let mut rt = self.runtime.lock().await;
        if rt.lease.is_some() {
            self.renew(&mut rt).await;
        } else if self.clock.now_ms() >= rt.campaign_after_ms {
            self.campaign(&mut rt).await;
        }
    }

    async fn campaign(&self, rt: &mut ElectorRuntime) {
        self.state_tx.send_modify(|s| s.role = Role::Candidate);
        let started_ms = self.clock.now_ms();
        let result = self
            .store_call(self.store.acquire(&self.resource_key, &self.instance_id, self.ttl()))
            .await;

        match result {
            Ok(lease) => {
                let term = lease.fencing_token;
                rt.local_deadline_ms = started_ms.saturating_add(duration_ms(self.ttl()));
                rt.consecutive_failures = 0;
                rt.lease = Some(lease);
                self.set_state(
                    Role::Leader,
                    Some(self.instance_id.clone()),
                    rt.local_deadline_ms,
                    Some(term),
                );
                info!(
                    resource = %self.config.resource_name,
                    instance = %self.instance_id,
                    term = term.value(),
                    "became leader"
                );
                for listener in self.listeners() {
                    listener.on_elected(term).await;
                }
                self.events.publish(CoordinationEvent::LeadershipChanged {
                    instance_id: self.instance_id.clone(),
                    is_leader: true,
                });
            }
            Err(CoordError::LockContention { holder, .. }) => {
                debug!(resource = %self.config.resource_name, %holder, "leadership held elsewhere");
                self.set_state(Role::Follower, Some(InstanceId::new(holder)), 0, None);
            }
            Err(e) => {
                warn!(resource = %self.config.resource_name, error = %e, "election attempt failed");
                self.set_state(Role::Follower, None, 0, None);
            }
        }
    }

    async fn renew(&self, rt: &mut ElectorRuntime) {
        let Some(lease) = rt.lease.clone() else {
            return;
        };
        if self.clock.now_ms() >= self.belief_cutoff(rt.local_deadline_ms) {
            self.step_down(rt, "lease deadline reached").await;
            return;
        }

        let started_ms = self.clock.now_ms();
        match self.store_call(self.store.renew(&lease, self.ttl())).await {
            Ok(renewed) => {
                rt.local_deadline_ms = started_ms.saturating_add(duration_ms(self.ttl()));
                rt.consecutive_failures = 0;
                rt.lease = Some(renewed);
                self.state_tx
                    .send_modify(|s| s.lease_expires_at_ms = rt.local_deadline_ms);
                debug!(
                    resource = %self.config.resource_name,
                    deadline_ms = rt.local_deadline_ms,
                    "leadership renewed"
                );
            }
            Err(CoordError::LeaseExpired { .. }) => {
                self.step_down(rt, "leadership lease lost").await;
            }
            Err(e) => {
                rt.consecutive_failures += 1;
                warn!(
                    resource = %self.config.resource_name,
                    failures = rt.consecutive_failures,
                    max = self.config.max_renewal_failures,
                    error = %e,
                    "leadership renewal failed"
                );
                if rt.consecutive_failures >= self.config.max_renewal_failures {
                    self.step_down(rt, "too many consecutive renewal failures")
                        .await;
                }
            }
        }
    }

    async fn step_down(&self, rt: &mut ElectorRuntime, reason: &str) {
        let Some(lease) = rt.lease.take() else {
            return;
        };
        rt.consecutive_failures = 0;
        rt.local_deadline_ms = 0;
        self.set_state(Role::Follower, None, 0, None);
        info!(
            resource = %self.config.resource_name,
            instance = %self.instance_id,
            term = lease.fencing_token.value(),
            reason,
            "stepping down"
        );

        for listener in self.listeners() {
            listener.on_demoted().await;
        }
        self.events.publish(CoordinationEvent::LeadershipChanged {
            instance_id: self.instance_id.clone(),
            is_leader: false,
        });

        if let Err(e) = self.store_call(self.store.release(&lease)).await {
            warn!(
                resource = %self.config.resource_name,
                error = %e,
                "leadership release failed; lease will lapse"
            );
        }
    }
}

/// Leader election participant for one cluster resource.
pub struct LeaderElector {
    inner: Arc<ElectorInner>,
    shutdown_tx: watch::Sender<bool>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl LeaderElector {
    /// Creates an elector in the Follower state. Call [`LeaderElector::start`]
    /// to begin campaigning.
    pub fn new(
        store: Arc<dyn LockStore>,
        instance_id: InstanceId,
        config: LeaderElectionConfig,
        op_timeout: Duration,
        clock: Arc<dyn Clock>,
        health: Arc<StoreHealthMonitor>,
        events: EventBus,
    ) -> Self {
        let (state_tx, _) = watch::channel(LeaderState {
            resource_name: config.resource_name.clone(),
            role: Role::Follower,
            current_leader_id: None,
            lease_expires_at_ms: 0,
            term: None,
        });
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ElectorInner {
                store,
                resource_key: format!("leader/{}", config.resource_name),
                instance_id,
                config,
                op_timeout,
                clock,
                health,
                events,
                listeners: RwLock::new(Vec::new()),
                state_tx,
                runtime: Mutex::new(ElectorRuntime::default()),
            }),
            shutdown_tx,
            task: std::sync::Mutex::new(None),
        }
    }

    /// Registers a listener. Listeners are notified in registration order.
    pub fn add_listener(&self, listener: Arc<dyn LeadershipListener>) {
        match self.inner.listeners.write() {
            Ok(mut l) => l.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    /// This instance's id.
    pub fn instance_id(&self) -> &InstanceId {
        &self.inner.instance_id
    }

    /// Store key of the leadership lease.
    pub fn resource_key(&self) -> &str {
        &self.inner.resource_key
    }

    /// Spawns the renewal/campaign loop. Calling it twice has no effect.
    pub fn start(&self) {
        let mut task = crate::lock_guard(&self.task);
        if task.is_some() {
            return;
        }
        let inner = self.inner.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = inner.config.renewal_interval();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                }
                // A tick always runs to completion so a step-down is never cut in half.
                inner.tick().await;
            }
            let mut rt = inner.runtime.lock().await;
            inner.step_down(&mut rt, "elector shutting down").await;
        }));
    }

    /// Runs one election/renewal step immediately, outside the timer.
    pub async fn tick(&self) {
        self.inner.tick().await;
    }

    /// Gives up leadership and sits out one lease period so another instance can take over.
    pub async fn step_down(&self) {
        let mut rt = self.inner.runtime.lock().await;
        rt.campaign_after_ms = self
            .inner
            .clock
            .now_ms()
            .saturating_add(self.inner.config.lease_duration_ms);
        self.inner.step_down(&mut rt, "explicit step-down").await;
    }

    /// Stops the loop and steps down if leader. Waits for both to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = crate::lock_guard(&self.task).take();
        match task {
            Some(handle) => {
                if let Err(e) = handle.await {
                    warn!(error = %e, "election loop ended abnormally");
                }
            }
            None => {
                let mut rt = self.inner.runtime.lock().await;
                self.inner.step_down(&mut rt, "elector shutting down").await;
            }
        }
    }

    /// Snapshot of the cached state.
    pub fn state(&self) -> LeaderState {
        self.inner.state_tx.borrow().clone()
    }

    /// Watches state changes.
    pub fn subscribe(&self) -> watch::Receiver<LeaderState> {
        self.inner.state_tx.subscribe()
    }

    /// Local belief: Leader role and the lease deadline (minus skew) not yet passed.
    pub fn is_leader(&self) -> bool {
        let state = self.inner.state_tx.borrow();
        state.role == Role::Leader
            && self.inner.clock.now_ms() < self.inner.belief_cutoff(state.lease_expires_at_ms)
    }

    /// Current term while leader.
    pub fn term(&self) -> Option<FencingToken> {
        self.inner.state_tx.borrow().term
    }

    /// Revalidates the cached belief against the store: true only if the live
    /// leadership lease carries this instance's id and current term.
    pub async fn verify_leadership(&self) -> Result<bool> {
        if !self.is_leader() {
            return Ok(false);
        }
        let Some(term) = self.term() else {
            return Ok(false);
        };
        let current = self
            .inner
            .store_call(self.inner.store.current(&self.inner.resource_key))
            .await?;
        Ok(current
            .map(|l| l.owner_id == self.inner.instance_id && l.fencing_token == term)
            .unwrap_or(false))
    }
}

impl Drop for LeaderElector {
    fn drop(&mut self) {
        if let Some(handle) = crate::lock_guard(&self.task).take() {
            handle.abort();
        }
    }
}
