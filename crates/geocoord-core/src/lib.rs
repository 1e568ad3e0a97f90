#![warn(missing_docs)]

//! geocoord coordination layer: distributed locks, leader election, background
//! jobs, admission control and read replica routing for a fleet of instances
//! that share nothing but an external store.

pub mod admission;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod election;
pub mod error;
pub mod events;
pub mod health;
pub mod jobs;
pub mod lock;
pub mod lock_store;
pub mod replica;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod types;

pub use admission::{AdmissionController, AdmissionDecision, HealthSignals};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CoordinationConfig;
pub use coordinator::Coordinator;
pub use election::{LeaderElector, LeaderState, LeadershipListener, Role};
pub use error::{CoordError, Result};
pub use events::{CoordinationEvent, EventBus};
pub use jobs::{Job, JobHandler, JobScheduler, JobStatus};
pub use lock::{DistributedLockManager, FencedResource, LockHandle};
pub use lock_store::{ConditionalKv, KvLockStore, LockStore, MemoryKv, MemoryLockStore};
pub use replica::{DataSourceHandle, ReplicaRouter};
pub use types::{FencingToken, InstanceId, Lease};

use std::sync::{Mutex, MutexGuard};

/// Locks a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock_guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
