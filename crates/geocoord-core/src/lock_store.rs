//! Atomic lease primitive.
//!
//! A [`LockStore`] grants at most one live lease per resource key. Acquisition
//! is a single conditional write: it succeeds only if the stored record is
//! absent or expired, and it stamps the new lease with the previous fencing
//! token plus one. Records are never deleted; release vacates the owner but
//! keeps the token so it keeps increasing across acquisitions.
//!
//! Two backends implement the contract:
//! - [`MemoryLockStore`]: a process-local map. Correct for one process only.
//! - [`KvLockStore`]: any keyed store offering versioned compare-and-set
//!   ([`ConditionalKv`]), shared between all instances of the fleet.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::clock::{duration_ms, Clock};
use crate::config::LockBackend;
use crate::error::{CoordError, Result};
use crate::lock_guard;
use crate::types::{FencingToken, InstanceId, Lease};

/// Backend contract for leases.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Takes a lease on `resource_key` if no live lease exists.
    async fn acquire(&self, resource_key: &str, owner: &InstanceId, ttl: Duration) -> Result<Lease>;

    /// Extends a lease still held under the same owner and fencing token.
    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease>;

    /// Vacates a lease. Releasing a lease that is no longer held is a no-op.
    async fn release(&self, lease: &Lease) -> Result<()>;

    /// Returns the live lease on `resource_key`, if any.
    async fn current(&self, resource_key: &str) -> Result<Option<Lease>>;

    /// Which backend this is.
    fn backend(&self) -> LockBackend;
}

/// Stored form of a lease slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct LeaseRecord {
    owner: Option<InstanceId>,
    expires_at_ms: u64,
    fencing_token: FencingToken,
}

impl LeaseRecord {
    fn is_live(&self, now_ms: u64) -> bool {
        self.owner.is_some() && self.expires_at_ms > now_ms
    }

    fn holds(&self, lease: &Lease) -> bool {
        self.owner.as_ref() == Some(&lease.owner_id) && self.fencing_token == lease.fencing_token
    }

    fn to_lease(&self, resource_key: &str, now_ms: u64) -> Option<Lease> {
        if !self.is_live(now_ms) {
            return None;
        }
        Some(Lease {
            resource_key: resource_key.to_string(),
            owner_id: self.owner.clone()?,
            expires_at_ms: self.expires_at_ms,
            fencing_token: self.fencing_token,
        })
    }

    /// Record written by a successful acquire over `prev`.
    fn acquire_over(
        prev: Option<&LeaseRecord>,
        resource_key: &str,
        owner: &InstanceId,
        now_ms: u64,
        ttl: Duration,
    ) -> Result<LeaseRecord> {
        if let Some(rec) = prev.filter(|r| r.is_live(now_ms)) {
            return Err(CoordError::LockContention {
                resource: resource_key.to_string(),
                holder: rec
                    .owner
                    .as_ref()
                    .map(|o| o.to_string())
                    .unwrap_or_default(),
            });
        }
        let fencing_token = prev
            .map(|r| r.fencing_token.next())
            .unwrap_or(FencingToken::new(1));
        Ok(LeaseRecord {
            owner: Some(owner.clone()),
            expires_at_ms: now_ms.saturating_add(duration_ms(ttl)),
            fencing_token,
        })
    }

    /// Record written by a successful renew of `lease`.
    fn renewed(&self, lease: &Lease, now_ms: u64, ttl: Duration) -> Result<LeaseRecord> {
        if !self.holds(lease) || !self.is_live(now_ms) {
            return Err(lease_expired(lease));
        }
        Ok(LeaseRecord {
            expires_at_ms: now_ms.saturating_add(duration_ms(ttl)),
            ..self.clone()
        })
    }

    fn vacated(&self) -> LeaseRecord {
        LeaseRecord {
            owner: None,
            expires_at_ms: 0,
            fencing_token: self.fencing_token,
        }
    }
}

fn lease_expired(lease: &Lease) -> CoordError {
    CoordError::LeaseExpired {
        resource: lease.resource_key.clone(),
        token: lease.fencing_token.value(),
    }
}

fn lease_of(record: &LeaseRecord, resource_key: &str) -> Lease {
    Lease {
        resource_key: resource_key.to_string(),
        owner_id: record.owner.clone().unwrap_or_else(|| InstanceId::new("")),
        expires_at_ms: record.expires_at_ms,
        fencing_token: record.fencing_token,
    }
}

/// Process-local lease store.
///
/// Every per-key operation runs under the map shard's lock, which makes
/// acquisition atomic within this process and nowhere else.
pub struct MemoryLockStore {
    clock: Arc<dyn Clock>,
    records: DashMap<String, LeaseRecord>,
}

impl MemoryLockStore {
    /// Creates an empty store.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            records: DashMap::new(),
        }
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn acquire(&self, resource_key: &str, owner: &InstanceId, ttl: Duration) -> Result<Lease> {
        let now = self.clock.now_ms();
        match self.records.entry(resource_key.to_string()) {
            Entry::Occupied(mut slot) => {
                let record = LeaseRecord::acquire_over(Some(slot.get()), resource_key, owner, now, ttl)?;
                slot.insert(record.clone());
                Ok(lease_of(&record, resource_key))
            }
            Entry::Vacant(slot) => {
                let record = LeaseRecord::acquire_over(None, resource_key, owner, now, ttl)?;
                slot.insert(record.clone());
                Ok(lease_of(&record, resource_key))
            }
        }
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease> {
        let now = self.clock.now_ms();
        let mut slot = self
            .records
            .get_mut(&lease.resource_key)
            .ok_or_else(|| lease_expired(lease))?;
        let record = slot.renewed(lease, now, ttl)?;
        *slot = record.clone();
        Ok(lease_of(&record, &lease.resource_key))
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        if let Some(mut slot) = self.records.get_mut(&lease.resource_key) {
            if slot.holds(lease) {
                *slot = slot.vacated();
            }
        }
        Ok(())
    }

    async fn current(&self, resource_key: &str) -> Result<Option<Lease>> {
        let now = self.clock.now_ms();
        Ok(self
            .records
            .get(resource_key)
            .and_then(|r| r.to_lease(resource_key, now)))
    }

    fn backend(&self) -> LockBackend {
        LockBackend::Memory
    }
}

/// A value read from a [`ConditionalKv`] together with its version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Versioned {
    /// Stored bytes.
    pub value: Vec<u8>,
    /// Store-assigned version, changed by every successful write.
    pub version: u64,
}

/// Keyed store offering atomic conditional-set with TTL.
///
/// Any external store meeting this contract can back [`KvLockStore`].
#[async_trait]
pub trait ConditionalKv: Send + Sync {
    /// Reads a key.
    async fn get(&self, key: &str) -> Result<Option<Versioned>>;

    /// Writes `value` only if the key's current version equals `expected`
    /// (`None` meaning the key must be absent). Returns false when the
    /// condition did not hold. `ttl` asks the store to drop the key itself.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool>;
}

/// Lease store layered over a shared [`ConditionalKv`].
pub struct KvLockStore<K: ConditionalKv> {
    kv: Arc<K>,
    clock: Arc<dyn Clock>,
}

impl<K: ConditionalKv> KvLockStore<K> {
    /// Creates a lease store over `kv`.
    pub fn new(kv: Arc<K>, clock: Arc<dyn Clock>) -> Self {
        Self { kv, clock }
    }

    fn key(resource_key: &str) -> String {
        format!("lease/{}", resource_key)
    }

    async fn load(&self, resource_key: &str) -> Result<Option<(LeaseRecord, u64)>> {
        let Some(v) = self.kv.get(&Self::key(resource_key)).await? else {
            return Ok(None);
        };
        let record: LeaseRecord = serde_json::from_slice(&v.value).map_err(|e| {
            CoordError::store_unavailable(format!("corrupt lease record {}: {}", resource_key, e))
        })?;
        Ok(Some((record, v.version)))
    }

    async fn store(&self, resource_key: &str, expected: Option<u64>, record: &LeaseRecord) -> Result<bool> {
        let bytes = serde_json::to_vec(record)
            .map_err(|e| CoordError::store_unavailable(format!("encode lease record: {}", e)))?;
        // Lease records carry their own expiry; a store-side TTL would drop
        // the fencing counter along with the lease.
        self.kv
            .compare_and_set(&Self::key(resource_key), expected, bytes, None)
            .await
    }
}

#[async_trait]
impl<K: ConditionalKv + 'static> LockStore for KvLockStore<K> {
    async fn acquire(&self, resource_key: &str, owner: &InstanceId, ttl: Duration) -> Result<Lease> {
        let now = self.clock.now_ms();
        let current = self.load(resource_key).await?;
        let (prev, version) = match &current {
            Some((record, version)) => (Some(record), Some(*version)),
            None => (None, None),
        };
        let record = LeaseRecord::acquire_over(prev, resource_key, owner, now, ttl)?;
        if self.store(resource_key, version, &record).await? {
            return Ok(lease_of(&record, resource_key));
        }

        // Lost the conditional write to a concurrent acquirer.
        let holder = self
            .load(resource_key)
            .await?
            .and_then(|(r, _)| r.owner)
            .map(|o| o.to_string())
            .unwrap_or_default();
        Err(CoordError::LockContention {
            resource: resource_key.to_string(),
            holder,
        })
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease> {
        let now = self.clock.now_ms();
        let (record, version) = self
            .load(&lease.resource_key)
            .await?
            .ok_or_else(|| lease_expired(lease))?;
        let renewed = record.renewed(lease, now, ttl)?;
        if self.store(&lease.resource_key, Some(version), &renewed).await? {
            Ok(lease_of(&renewed, &lease.resource_key))
        } else {
            Err(lease_expired(lease))
        }
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        if let Some((record, version)) = self.load(&lease.resource_key).await? {
            if record.holds(lease) {
                // A failed write means someone else already replaced the record.
                self.store(&lease.resource_key, Some(version), &record.vacated())
                    .await?;
            }
        }
        Ok(())
    }

    async fn current(&self, resource_key: &str) -> Result<Option<Lease>> {
        let now = self.clock.now_ms();
        Ok(self
            .load(resource_key)
            .await?
            .and_then(|(r, _)| r.to_lease(resource_key, now)))
    }

    fn backend(&self) -> LockBackend {
        LockBackend::External
    }
}

struct KvEntry {
    value: Vec<u8>,
    version: u64,
    expires_at_ms: Option<u64>,
}

/// In-process [`ConditionalKv`].
///
/// Shared through an `Arc`, it stands in for the external store when several
/// simulated instances run inside one test process.
pub struct MemoryKv {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, KvEntry>>,
    next_version: AtomicU64,
}

impl MemoryKv {
    /// Creates an empty store.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
            next_version: AtomicU64::new(1),
        }
    }

    /// Number of keys currently stored, expired ones excluded.
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        lock_guard(&self.entries)
            .values()
            .filter(|e| e.expires_at_ms.map_or(true, |t| t > now))
            .count()
    }

    /// Returns true if no live key is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ConditionalKv for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let now = self.clock.now_ms();
        let entries = lock_guard(&self.entries);
        Ok(entries
            .get(key)
            .filter(|e| e.expires_at_ms.map_or(true, |t| t > now))
            .map(|e| Versioned {
                value: e.value.clone(),
                version: e.version,
            }))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let now = self.clock.now_ms();
        let mut entries = lock_guard(&self.entries);
        let current = entries
            .get(key)
            .filter(|e| e.expires_at_ms.map_or(true, |t| t > now))
            .map(|e| e.version);
        if current != expected {
            return Ok(false);
        }
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        entries.insert(
            key.to_string(),
            KvEntry {
                value,
                version,
                expires_at_ms: ttl.map(|t| now.saturating_add(duration_ms(t))),
            },
        );
        Ok(true)
    }
}
