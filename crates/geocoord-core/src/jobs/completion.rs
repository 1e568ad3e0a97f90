//! Durable completion markers keyed by idempotency key.
//!
//! A worker reserves a key before running side effects. The reservation
//! carries a TTL so a crashed worker's claim lapses; a completed marker is
//! permanent and makes every later delivery of the same key a no-op.
//!
//! The store also counts failed executions per key. Queue deliveries that
//! were deferred never ran the handler, so the receive count over-states
//! attempts; this counter does not.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::{duration_ms, Clock};
use crate::error::Result;
use crate::lock_guard;

/// Outcome of [`CompletionStore::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// The caller owns the key and must run the side effect.
    Started,
    /// The side effect already happened; skip it.
    AlreadyCompleted,
    /// Another worker holds a live reservation.
    InProgress,
}

/// Store of completion markers.
#[async_trait]
pub trait CompletionStore: Send + Sync {
    /// Reserves `key` for `owner` for `ttl` unless it is completed or
    /// reserved by someone else.
    async fn begin(&self, key: &str, owner: &str, ttl: Duration) -> Result<Reservation>;

    /// Marks `key` completed.
    async fn complete(&self, key: &str, owner: &str) -> Result<()>;

    /// Drops `owner`'s reservation after a failed attempt.
    async fn abandon(&self, key: &str, owner: &str) -> Result<()>;

    /// Drops `owner`'s reservation and counts one failed execution of `key`.
    /// Returns the failed executions recorded so far.
    async fn record_failure(&self, key: &str, owner: &str) -> Result<u32>;

    /// Failed executions recorded for `key`.
    async fn failed_attempts(&self, key: &str) -> Result<u32>;

    /// Returns true if `key` has been completed.
    async fn is_completed(&self, key: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
enum Marker {
    InProgress { owner: String, expires_at_ms: u64 },
    Completed,
}

/// In-process completion markers.
pub struct MemoryCompletionStore {
    clock: Arc<dyn Clock>,
    markers: Mutex<HashMap<String, Marker>>,
    failures: Mutex<HashMap<String, u32>>,
}

impl MemoryCompletionStore {
    /// Creates an empty store.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            markers: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl CompletionStore for MemoryCompletionStore {
    async fn begin(&self, key: &str, owner: &str, ttl: Duration) -> Result<Reservation> {
        let now = self.clock.now_ms();
        let mut markers = lock_guard(&self.markers);
        match markers.get(key) {
            Some(Marker::Completed) => return Ok(Reservation::AlreadyCompleted),
            Some(Marker::InProgress {
                owner: holder,
                expires_at_ms,
            }) if *expires_at_ms > now && holder != owner => {
                return Ok(Reservation::InProgress);
            }
            _ => {}
        }
        markers.insert(
            key.to_string(),
            Marker::InProgress {
                owner: owner.to_string(),
                expires_at_ms: now.saturating_add(duration_ms(ttl)),
            },
        );
        Ok(Reservation::Started)
    }

    async fn complete(&self, key: &str, _owner: &str) -> Result<()> {
        // The side effect already ran; record it even if the reservation lapsed.
        lock_guard(&self.markers).insert(key.to_string(), Marker::Completed);
        lock_guard(&self.failures).remove(key);
        Ok(())
    }

    async fn abandon(&self, key: &str, owner: &str) -> Result<()> {
        let mut markers = lock_guard(&self.markers);
        if matches!(markers.get(key), Some(Marker::InProgress { owner: o, .. }) if o == owner) {
            markers.remove(key);
        }
        Ok(())
    }

    async fn record_failure(&self, key: &str, owner: &str) -> Result<u32> {
        self.abandon(key, owner).await?;
        let mut failures = lock_guard(&self.failures);
        let count = failures.entry(key.to_string()).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn failed_attempts(&self, key: &str) -> Result<u32> {
        Ok(lock_guard(&self.failures).get(key).copied().unwrap_or(0))
    }

    async fn is_completed(&self, key: &str) -> Result<bool> {
        Ok(matches!(
            lock_guard(&self.markers).get(key),
            Some(Marker::Completed)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const TTL: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_reservation_lifecycle() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryCompletionStore::new(clock);

        assert_eq!(store.begin("job-42", "w1", TTL).await.unwrap(), Reservation::Started);
        assert_eq!(store.begin("job-42", "w2", TTL).await.unwrap(), Reservation::InProgress);
        store.complete("job-42", "w1").await.unwrap();
        assert!(store.is_completed("job-42").await.unwrap());
        assert_eq!(
            store.begin("job-42", "w2", TTL).await.unwrap(),
            Reservation::AlreadyCompleted
        );
    }

    #[tokio::test]
    async fn test_lapsed_reservation_can_be_taken_over() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryCompletionStore::new(clock.clone());
        store.begin("k", "w1", TTL).await.unwrap();
        clock.advance(TTL);
        assert_eq!(store.begin("k", "w2", TTL).await.unwrap(), Reservation::Started);
    }

    #[tokio::test]
    async fn test_abandon_only_drops_own_reservation() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryCompletionStore::new(clock);
        store.begin("k", "w1", TTL).await.unwrap();
        store.abandon("k", "w2").await.unwrap();
        assert_eq!(store.begin("k", "w2", TTL).await.unwrap(), Reservation::InProgress);
        store.abandon("k", "w1").await.unwrap();
        assert_eq!(store.begin("k", "w2", TTL).await.unwrap(), Reservation::Started);
        assert!(!store.is_completed("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_failures_counted_per_key_and_cleared_on_completion() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryCompletionStore::new(clock);
        store.begin("k", "w1", TTL).await.unwrap();
        assert_eq!(store.record_failure("k", "w1").await.unwrap(), 1);
        assert_eq!(store.begin("k", "w2", TTL).await.unwrap(), Reservation::Started);
        assert_eq!(store.record_failure("k", "w2").await.unwrap(), 2);
        assert_eq!(store.failed_attempts("k").await.unwrap(), 2);
        assert_eq!(store.failed_attempts("other").await.unwrap(), 0);

        store.begin("k", "w3", TTL).await.unwrap();
        store.complete("k", "w3").await.unwrap();
        assert_eq!(store.failed_attempts("k").await.unwrap(), 0);
    }
}
