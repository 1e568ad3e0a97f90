//! Fault-injection wrappers for simulations and tests.
//!
//! [`FaultyLockStore`] wraps any lease store and can make it fail or hang on
//! demand while recording every call. [`RecordingListener`] records leadership
//! callbacks. Both write into an [`OpLog`] that can be shared to assert on the
//! relative order of callbacks, published events and store calls.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::config::LockBackend;
use crate::election::LeadershipListener;
use crate::error::{CoordError, Result};
use crate::events::CoordinationEvent;
use crate::lock_guard;
use crate::lock_store::LockStore;
use crate::types::{FencingToken, InstanceId, Lease};

/// Ordered, shareable log of named operations.
#[derive(Clone, Default)]
pub struct OpLog {
    entries: Arc<Mutex<Vec<String>>>,
    events: Arc<Mutex<Option<broadcast::Receiver<CoordinationEvent>>>>,
}

impl OpLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirrors events from `rx` into the log. Pending events are appended
    /// before every later entry, so their position reflects publish order.
    pub fn capture_events(&self, rx: broadcast::Receiver<CoordinationEvent>) {
        *lock_guard(&self.events) = Some(rx);
    }

    /// Appends an entry.
    pub fn push(&self, entry: impl Into<String>) {
        self.drain_events();
        lock_guard(&self.entries).push(entry.into());
    }

    /// Snapshot of all entries.
    pub fn entries(&self) -> Vec<String> {
        self.drain_events();
        lock_guard(&self.entries).clone()
    }

    /// Position of the first entry equal to `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    fn drain_events(&self) {
        let mut rx = lock_guard(&self.events);
        let Some(rx) = rx.as_mut() else {
            return;
        };
        let mut entries = lock_guard(&self.entries);
        while let Ok(event) = rx.try_recv() {
            entries.push(match event {
                CoordinationEvent::LeadershipChanged { is_leader, .. } => {
                    format!("event:leader={}", is_leader)
                }
                CoordinationEvent::JobCompleted { job_id, status } => {
                    format!("event:completed:{}:{:?}", job_id, status)
                }
                CoordinationEvent::JobDeadLettered { job_id } => {
                    format!("event:dead_lettered:{}", job_id)
                }
                CoordinationEvent::AdmissionRejected { key, reason } => {
                    format!("event:rejected:{}:{:?}", key, reason)
                }
            });
        }
    }
}

/// Injected behaviour of a [`FaultyLockStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultMode {
    /// Pass calls through.
    Healthy,
    /// Fail every call with `StoreUnavailable`.
    Fail,
    /// Never answer, so callers hit their timeout.
    Hang,
}

impl FaultMode {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => FaultMode::Fail,
            2 => FaultMode::Hang,
            _ => FaultMode::Healthy,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            FaultMode::Healthy => 0,
            FaultMode::Fail => 1,
            FaultMode::Hang => 2,
        }
    }
}

/// Lease store wrapper with switchable faults and a call log.
pub struct FaultyLockStore {
    inner: Arc<dyn LockStore>,
    mode: AtomicU8,
    log: OpLog,
}

impl FaultyLockStore {
    /// Wraps `inner` in healthy mode.
    pub fn new(inner: Arc<dyn LockStore>) -> Self {
        Self::with_log(inner, OpLog::new())
    }

    /// Wraps `inner`, recording calls into `log`.
    pub fn with_log(inner: Arc<dyn LockStore>, log: OpLog) -> Self {
        Self {
            inner,
            mode: AtomicU8::new(FaultMode::Healthy.as_u8()),
            log,
        }
    }

    /// Switches the injected behaviour.
    pub fn set_mode(&self, mode: FaultMode) {
        self.mode.store(mode.as_u8(), Ordering::SeqCst);
    }

    /// The call log.
    pub fn log(&self) -> &OpLog {
        &self.log
    }

    async fn gate(&self, op: &str) -> Result<()> {
        self.log.push(format!("store:{}", op));
        match FaultMode::from_u8(self.mode.load(Ordering::SeqCst)) {
            FaultMode::Healthy => Ok(()),
            FaultMode::Fail => Err(CoordError::store_unavailable(format!("injected {} failure", op))),
            FaultMode::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl LockStore for FaultyLockStore {
    async fn acquire(&self, resource_key: &str, owner: &InstanceId, ttl: Duration) -> Result<Lease> {
        self.gate("acquire").await?;
        self.inner.acquire(resource_key, owner, ttl).await
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease> {
        self.gate("renew").await?;
        self.inner.renew(lease, ttl).await
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        self.gate("release").await?;
        self.inner.release(lease).await
    }

    async fn current(&self, resource_key: &str) -> Result<Option<Lease>> {
        self.gate("current").await?;
        self.inner.current(resource_key).await
    }

    fn backend(&self) -> LockBackend {
        self.inner.backend()
    }
}

/// Leadership listener that records its callbacks.
#[derive(Default)]
pub struct RecordingListener {
    log: OpLog,
}

impl RecordingListener {
    /// Records into a shared log.
    pub fn with_log(log: OpLog) -> Self {
        Self { log }
    }

    /// Recorded callbacks, e.g. `["elected:1", "demoted"]`.
    pub fn entries(&self) -> Vec<String> {
        self.log.entries()
    }
}

#[async_trait]
impl LeadershipListener for RecordingListener {
    async fn on_elected(&self, term: FencingToken) {
        self.log.push(format!("elected:{}", term));
    }

    async fn on_demoted(&self) {
        self.log.push("demoted");
    }
}
