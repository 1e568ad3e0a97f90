//! Distributed lock manager with fencing tokens.
//!
//! Acquisition never blocks or queues: it either wins the store's conditional
//! write or fails with [`CoordError::LockContention`]. The manager does not
//! retry; backoff is the caller's policy. Every store call is bounded by the
//! configured lock timeout and reported to the store health monitor.
//!
//! Holding a [`LockHandle`] is only a local belief. Writes guarded by the lock
//! must present the handle's fencing token to the protected resource, which
//! checks it with a [`FencedResource`] so a holder whose lease lapsed during a
//! pause cannot overwrite newer state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::config::LockBackend;
use crate::error::{CoordError, Result};
use crate::health::StoreHealthMonitor;
use crate::lock_store::LockStore;
use crate::types::{FencingToken, InstanceId, Lease};

struct LockManagerInner {
    store: Arc<dyn LockStore>,
    owner: InstanceId,
    op_timeout: Duration,
    health: Arc<StoreHealthMonitor>,
}

impl LockManagerInner {
    async fn call<T, F>(&self, op: &'static str, resource_key: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let result = match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CoordError::store_unavailable(format!(
                "{} on {} timed out after {}ms",
                op,
                resource_key,
                self.op_timeout.as_millis()
            ))),
        };
        self.health.observe(&result);
        result
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease> {
        let result = self
            .call("renew", &lease.resource_key, self.store.renew(lease, ttl))
            .await;
        if let Err(CoordError::LeaseExpired { .. }) = &result {
            tracing::warn!(
                resource = %lease.resource_key,
                token = lease.fencing_token.value(),
                "lease lost before renewal"
            );
        }
        result
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        self.call("release", &lease.resource_key, self.store.release(lease))
            .await?;
        tracing::debug!(
            resource = %lease.resource_key,
            token = lease.fencing_token.value(),
            "lock released"
        );
        Ok(())
    }
}

/// Caller-held reference to an active lease.
pub struct LockHandle {
    inner: Arc<LockManagerInner>,
    lease: Lease,
    released: bool,
}

impl LockHandle {
    /// The locked resource.
    pub fn resource_key(&self) -> &str {
        &self.lease.resource_key
    }

    /// Token to present with every protected write.
    pub fn fencing_token(&self) -> FencingToken {
        self.lease.fencing_token
    }

    /// Lease expiry as last confirmed by the store.
    pub fn expires_at_ms(&self) -> u64 {
        self.lease.expires_at_ms
    }

    /// The underlying lease.
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Returns true once [`LockHandle::release`] has succeeded.
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Extends the lease. Fails with `LeaseExpired` if it lapsed or was taken over.
    pub async fn renew(&mut self, ttl: Duration) -> Result<()> {
        if self.released {
            return Err(CoordError::LeaseExpired {
                resource: self.lease.resource_key.clone(),
                token: self.lease.fencing_token.value(),
            });
        }
        self.lease = self.inner.renew(&self.lease, ttl).await?;
        Ok(())
    }

    /// Releases the lease. Safe to call more than once.
    pub async fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.inner.release(&self.lease).await?;
        self.released = true;
        Ok(())
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("lease", &self.lease)
            .field("released", &self.released)
            .finish()
    }
}

/// Per-resource mutual exclusion over a [`LockStore`].
#[derive(Clone)]
pub struct DistributedLockManager {
    inner: Arc<LockManagerInner>,
}

impl DistributedLockManager {
    /// Creates a manager acquiring leases as `owner`.
    pub fn new(
        store: Arc<dyn LockStore>,
        owner: InstanceId,
        op_timeout: Duration,
        health: Arc<StoreHealthMonitor>,
    ) -> Self {
        if store.backend() == LockBackend::Memory {
            tracing::info!(
                owner = %owner,
                "memory lock backend: mutual exclusion holds within this process only"
            );
        }
        Self {
            inner: Arc::new(LockManagerInner {
                store,
                owner,
                op_timeout,
                health,
            }),
        }
    }

    /// Instance id written into every lease this manager takes.
    pub fn owner(&self) -> &InstanceId {
        &self.inner.owner
    }

    /// Backend of the underlying store.
    pub fn backend(&self) -> LockBackend {
        self.inner.store.backend()
    }

    /// Takes the lock on `resource_key`, failing immediately on contention.
    pub async fn acquire(&self, resource_key: &str, ttl: Duration) -> Result<LockHandle> {
        let lease = self
            .inner
            .call(
                "acquire",
                resource_key,
                self.inner.store.acquire(resource_key, &self.inner.owner, ttl),
            )
            .await?;
        tracing::debug!(
            resource = %resource_key,
            token = lease.fencing_token.value(),
            expires_at_ms = lease.expires_at_ms,
            "lock acquired"
        );
        Ok(LockHandle {
            inner: self.inner.clone(),
            lease,
            released: false,
        })
    }

    /// Extends a held lock.
    pub async fn renew(&self, handle: &mut LockHandle, ttl: Duration) -> Result<()> {
        handle.renew(ttl).await
    }

    /// Releases a held lock. Idempotent.
    pub async fn release(&self, handle: &mut LockHandle) -> Result<()> {
        handle.release().await
    }

    /// Reads the live lease on `resource_key` from the store.
    pub async fn current(&self, resource_key: &str) -> Result<Option<Lease>> {
        self.inner
            .call("current", resource_key, self.inner.store.current(resource_key))
            .await
    }

    /// Runs `critical` while holding the lock, releasing it afterwards.
    ///
    /// The closure receives the fencing token to pass to protected writes.
    /// A release failure is logged; the lease then lapses on its own.
    pub async fn with_lock<F, Fut, T>(&self, resource_key: &str, ttl: Duration, critical: F) -> Result<T>
    where
        F: FnOnce(FencingToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut handle = self.acquire(resource_key, ttl).await?;
        let result = critical(handle.fencing_token()).await;
        if let Err(e) = handle.release().await {
            tracing::warn!(resource = %resource_key, error = %e, "release after critical section failed");
        }
        result
    }
}

/// Resource-side fencing check.
///
/// Remembers the highest token accepted per resource key and rejects any write
/// carrying a lower one.
#[derive(Debug, Default)]
pub struct FencedResource {
    highest: DashMap<String, FencingToken>,
}

impl FencedResource {
    /// Creates a check with no tokens seen.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts `token` for a write to `resource_key` or rejects it as stale.
    pub fn check(&self, resource_key: &str, token: FencingToken) -> Result<()> {
        let mut highest = self
            .highest
            .entry(resource_key.to_string())
            .or_insert(token);
        if token < *highest {
            tracing::warn!(
                resource = %resource_key,
                presented = token.value(),
                current = (*highest).value(),
                "rejected write with stale fencing token"
            );
            return Err(CoordError::LeaseExpired {
                resource: resource_key.to_string(),
                token: token.value(),
            });
        }
        *highest = token;
        Ok(())
    }

    /// Highest token accepted so far for `resource_key`.
    pub fn highest(&self, resource_key: &str) -> Option<FencingToken> {
        self.highest.get(resource_key).map(|t| *t)
    }
}
