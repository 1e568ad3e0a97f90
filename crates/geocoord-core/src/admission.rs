//! Admission control: per-key token buckets behind a load-shedding gate.
//!
//! Shedding is evaluated first and consumes no tokens. A request that passes
//! the gate is admitted only if its key's bucket holds at least `cost` tokens.
//! Buckets start full and refill continuously at `refill_rate` tokens per
//! second up to `capacity`.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::clock::Clock;
use crate::config::{LoadShedConfig, RateLimitConfig};
use crate::error::{CoordError, Result, ShedSignal};
use crate::events::{CoordinationEvent, EventBus, RejectionReason};
use crate::health::{HealthStatus, StoreHealthMonitor};

/// Externally measured load, pushed in by the host process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSignals {
    /// CPU utilisation, 0-100.
    pub cpu_pct: u8,
    /// Depth of the host's work queue.
    pub queue_depth: usize,
    /// The host considers its backing store unhealthy.
    pub store_unhealthy: bool,
}

/// Outcome of [`AdmissionController::try_admit`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AdmissionDecision {
    /// Tokens were consumed; proceed.
    Admitted,
    /// The key's bucket is short of tokens.
    RateLimited {
        /// Time until the bucket holds enough tokens for the same cost.
        retry_after_ms: u64,
    },
    /// Load shedding is active; no tokens were consumed.
    Shed {
        /// The signal over its threshold.
        signal: ShedSignal,
    },
}

impl AdmissionDecision {
    /// Returns true for [`AdmissionDecision::Admitted`].
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionDecision::Admitted)
    }
}

/// Admission counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionStats {
    /// Requests admitted.
    pub admitted: u64,
    /// Requests refused for lack of tokens.
    pub rate_limited: u64,
    /// Requests refused by load shedding.
    pub shed: u64,
    /// Keys with a bucket.
    pub tracked_keys: usize,
}

struct TokenBucket {
    tokens: f64,
    last_refill_ms: u64,
}

impl TokenBucket {
    fn full(capacity: f64, now_ms: u64) -> Self {
        Self {
            tokens: capacity,
            last_refill_ms: now_ms,
        }
    }

    fn refill(&mut self, now_ms: u64, capacity: f64, refill_rate: f64) {
        let elapsed_ms = now_ms.saturating_sub(self.last_refill_ms);
        self.tokens = (self.tokens + elapsed_ms as f64 * refill_rate / 1000.0).min(capacity);
        self.last_refill_ms = self.last_refill_ms.max(now_ms);
    }
}

/// Token-bucket rate limiter with a load-shedding gate.
pub struct AdmissionController {
    limits: RateLimitConfig,
    shed: LoadShedConfig,
    clock: Arc<dyn Clock>,
    events: EventBus,
    store_health: Option<Arc<StoreHealthMonitor>>,
    buckets: DashMap<String, TokenBucket>,
    cpu_pct: AtomicU8,
    queue_depth: AtomicUsize,
    store_unhealthy: AtomicBool,
    admitted: AtomicU64,
    rate_limited: AtomicU64,
    shed_count: AtomicU64,
}

impl AdmissionController {
    /// Creates a controller with healthy signals and no buckets.
    pub fn new(
        limits: RateLimitConfig,
        shed: LoadShedConfig,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            limits,
            shed,
            clock,
            events,
            store_health: None,
            buckets: DashMap::new(),
            cpu_pct: AtomicU8::new(0),
            queue_depth: AtomicUsize::new(0),
            store_unhealthy: AtomicBool::new(false),
            admitted: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            shed_count: AtomicU64::new(0),
        }
    }

    /// Also sheds while `monitor` reports the store Unhealthy.
    pub fn with_store_health(mut self, monitor: Arc<StoreHealthMonitor>) -> Self {
        self.store_health = Some(monitor);
        self
    }

    /// Replaces the current load signals.
    pub fn update_signals(&self, signals: HealthSignals) {
        self.cpu_pct.store(signals.cpu_pct.min(100), Ordering::Relaxed);
        self.queue_depth.store(signals.queue_depth, Ordering::Relaxed);
        self.store_unhealthy
            .store(signals.store_unhealthy, Ordering::Relaxed);
    }

    /// Current load signals.
    pub fn signals(&self) -> HealthSignals {
        HealthSignals {
            cpu_pct: self.cpu_pct.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            store_unhealthy: self.store_unhealthy.load(Ordering::Relaxed),
        }
    }

    /// The signal currently over its threshold, if any.
    pub fn shed_signal(&self) -> Option<ShedSignal> {
        if !self.shed.enabled {
            return None;
        }
        let signals = self.signals();
        if signals.cpu_pct > self.shed.cpu_threshold_pct {
            return Some(ShedSignal::CpuSaturation);
        }
        if signals.queue_depth > self.shed.queue_depth_threshold {
            return Some(ShedSignal::QueueDepth);
        }
        if self.shed.shed_on_store_unhealthy {
            let monitored = self
                .store_health
                .as_ref()
                .map(|m| m.status() == HealthStatus::Unhealthy)
                .unwrap_or(false);
            if signals.store_unhealthy || monitored {
                return Some(ShedSignal::StoreUnhealthy);
            }
        }
        None
    }

    /// Admits `cost` units for `key` if load allows and the bucket has them.
    pub fn try_admit(&self, key: &str, cost: f64) -> AdmissionDecision {
        if let Some(signal) = self.shed_signal() {
            self.shed_count.fetch_add(1, Ordering::Relaxed);
            debug!(key, %signal, "admission shed");
            self.events.publish(CoordinationEvent::AdmissionRejected {
                key: key.to_string(),
                reason: RejectionReason::Shed,
            });
            return AdmissionDecision::Shed { signal };
        }

        let cost = cost.max(0.0);
        let now = self.clock.now_ms();
        let capacity = self.limits.capacity;
        let rate = self.limits.refill_rate;
        let decision = {
            let mut bucket = self
                .buckets
                .entry(key.to_string())
                .or_insert_with(|| TokenBucket::full(capacity, now));
            bucket.refill(now, capacity, rate);
            if bucket.tokens >= cost {
                bucket.tokens -= cost;
                AdmissionDecision::Admitted
            } else {
                AdmissionDecision::RateLimited {
                    retry_after_ms: retry_after_ms(cost - bucket.tokens, rate),
                }
            }
        };

        match decision {
            AdmissionDecision::Admitted => {
                self.admitted.fetch_add(1, Ordering::Relaxed);
            }
            AdmissionDecision::RateLimited { retry_after_ms } => {
                self.rate_limited.fetch_add(1, Ordering::Relaxed);
                debug!(key, cost, retry_after_ms, "admission rate limited");
                self.events.publish(CoordinationEvent::AdmissionRejected {
                    key: key.to_string(),
                    reason: RejectionReason::RateLimited,
                });
            }
            AdmissionDecision::Shed { .. } => {}
        }
        decision
    }

    /// Like [`AdmissionController::try_admit`] but maps refusals to errors.
    pub fn admit(&self, key: &str, cost: f64) -> Result<()> {
        match self.try_admit(key, cost) {
            AdmissionDecision::Admitted => Ok(()),
            AdmissionDecision::RateLimited { retry_after_ms } => Err(CoordError::RateLimited {
                key: key.to_string(),
                retry_after_ms,
            }),
            AdmissionDecision::Shed { signal } => Err(CoordError::Shed {
                key: key.to_string(),
                signal,
            }),
        }
    }

    /// Tokens available to `key` right now.
    pub fn available(&self, key: &str) -> f64 {
        let now = self.clock.now_ms();
        match self.buckets.get_mut(key) {
            Some(mut bucket) => {
                bucket.refill(now, self.limits.capacity, self.limits.refill_rate);
                bucket.tokens
            }
            None => self.limits.capacity,
        }
    }

    /// Drops buckets that have refilled to capacity; they are indistinguishable
    /// from a fresh bucket. Returns the number removed.
    pub fn prune_full(&self) -> usize {
        let now = self.clock.now_ms();
        let capacity = self.limits.capacity;
        let rate = self.limits.refill_rate;
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            bucket.refill(now, capacity, rate);
            bucket.tokens < capacity
        });
        before - self.buckets.len()
    }

    /// Spawns a task calling [`prune_full`](Self::prune_full) every
    /// `prune_interval` so idle keys do not accumulate.
    pub fn spawn_pruner(self: &Arc<Self>) -> JoinHandle<()> {
        let ctl = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ctl.limits.prune_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = ctl.prune_full();
                if removed > 0 {
                    debug!(removed, tracked = ctl.buckets.len(), "pruned idle rate limit buckets");
                }
            }
        })
    }

    /// Counter snapshot.
    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            shed: self.shed_count.load(Ordering::Relaxed),
            tracked_keys: self.buckets.len(),
        }
    }
}

fn retry_after_ms(deficit: f64, refill_rate: f64) -> u64 {
    if refill_rate <= 0.0 {
        return u64::MAX;
    }
    (deficit / refill_rate * 1000.0).ceil() as u64
}
