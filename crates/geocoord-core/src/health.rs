//! Backing-store health tracking and process readiness reports.
//!
//! Store faults are transient by nature, so a single failure only degrades
//! the store's status. An outage that persists past the configured deadline
//! marks it unhealthy, which the process health report surfaces so external
//! orchestration can restart or evict the instance.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::{duration_ms, Clock};
use crate::error::{CoordError, Result};
use crate::lock_guard;

/// Health status of a component or node
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Component is healthy
    Healthy,
    /// Component is degraded but functional
    Degraded,
    /// Component is unhealthy
    Unhealthy,
    /// Health status is unknown (not yet checked)
    Unknown,
}

impl HealthStatus {
    /// Returns true if status is Healthy or Degraded (operational)
    pub fn is_ok(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

/// Health information for a single component
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Component name
    pub name: String,
    /// Current health status
    pub status: HealthStatus,
    /// Optional status message
    pub message: Option<String>,
    /// Milliseconds since epoch of the last observed store call
    pub last_check_ms: u64,
}

/// Complete health report for one instance
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthReport {
    /// Instance identifier
    pub instance_id: String,
    /// Overall health status
    pub overall: HealthStatus,
    /// Component health details
    pub components: Vec<ComponentHealth>,
    /// Whether this instance currently believes it is the leader
    pub is_leader: bool,
    /// Report generation timestamp (milliseconds since epoch)
    pub checked_at_ms: u64,
}

impl HealthReport {
    /// Builds a report whose overall status is the worst component status.
    pub fn from_components(
        instance_id: impl Into<String>,
        components: Vec<ComponentHealth>,
        is_leader: bool,
        checked_at_ms: u64,
    ) -> Self {
        let overall = if components
            .iter()
            .any(|c| c.status == HealthStatus::Unhealthy)
        {
            HealthStatus::Unhealthy
        } else if components
            .iter()
            .any(|c| c.status == HealthStatus::Degraded)
        {
            HealthStatus::Degraded
        } else if components.iter().all(|c| c.status == HealthStatus::Unknown) {
            HealthStatus::Unknown
        } else {
            HealthStatus::Healthy
        };
        Self {
            instance_id: instance_id.into(),
            overall,
            components,
            is_leader,
            checked_at_ms,
        }
    }

    /// Returns true if overall status is Healthy
    pub fn is_healthy(&self) -> bool {
        self.overall == HealthStatus::Healthy
    }

    /// Returns list of unhealthy components
    pub fn unhealthy_components(&self) -> Vec<&ComponentHealth> {
        self.components
            .iter()
            .filter(|c| c.status == HealthStatus::Unhealthy)
            .collect()
    }
}

#[derive(Debug, Default)]
struct StoreHealthState {
    outage_started_ms: Option<u64>,
    consecutive_failures: u32,
    last_check_ms: u64,
    last_error: Option<String>,
    observed: bool,
}

/// Tracks availability of one backing store.
pub struct StoreHealthMonitor {
    name: String,
    clock: Arc<dyn Clock>,
    unavailable_deadline_ms: u64,
    state: Mutex<StoreHealthState>,
}

impl StoreHealthMonitor {
    /// Creates a monitor; outages longer than `unavailable_deadline` are unhealthy.
    pub fn new(
        name: impl Into<String>,
        clock: Arc<dyn Clock>,
        unavailable_deadline: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            clock,
            unavailable_deadline_ms: duration_ms(unavailable_deadline),
            state: Mutex::new(StoreHealthState::default()),
        }
    }

    /// Records a store call that got an answer from the store.
    pub fn record_success(&self) {
        let now = self.clock.now_ms();
        let mut state = lock_guard(&self.state);
        if state.outage_started_ms.is_some() {
            tracing::info!(store = %self.name, "store reachable again");
        }
        state.outage_started_ms = None;
        state.consecutive_failures = 0;
        state.last_error = None;
        state.last_check_ms = now;
        state.observed = true;
    }

    /// Records a store call that failed to reach the store.
    pub fn record_failure(&self, reason: &str) {
        let now = self.clock.now_ms();
        let mut state = lock_guard(&self.state);
        let started = *state.outage_started_ms.get_or_insert(now);
        state.consecutive_failures += 1;
        state.last_error = Some(reason.to_string());
        state.last_check_ms = now;
        state.observed = true;
        if now.saturating_sub(started) >= self.unavailable_deadline_ms {
            tracing::error!(
                store = %self.name,
                outage_ms = now - started,
                failures = state.consecutive_failures,
                "store unavailable past deadline"
            );
        }
    }

    /// Classifies a store call outcome: only `StoreUnavailable` counts as a fault.
    /// Any other outcome, errors included, proves the store answered.
    pub fn observe<T>(&self, result: &Result<T>) {
        match result {
            Err(CoordError::StoreUnavailable { reason }) => self.record_failure(reason),
            _ => self.record_success(),
        }
    }

    /// Current status of the store.
    pub fn status(&self) -> HealthStatus {
        let now = self.clock.now_ms();
        let state = lock_guard(&self.state);
        match state.outage_started_ms {
            _ if !state.observed => HealthStatus::Unknown,
            None => HealthStatus::Healthy,
            Some(started) if now.saturating_sub(started) >= self.unavailable_deadline_ms => {
                HealthStatus::Unhealthy
            }
            Some(_) => HealthStatus::Degraded,
        }
    }

    /// Number of consecutive failed store calls.
    pub fn consecutive_failures(&self) -> u32 {
        lock_guard(&self.state).consecutive_failures
    }

    /// Snapshot for the process health report.
    pub fn component_health(&self) -> ComponentHealth {
        let status = self.status();
        let state = lock_guard(&self.state);
        ComponentHealth {
            name: self.name.clone(),
            status,
            message: state.last_error.clone(),
            last_check_ms: state.last_check_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn monitor(clock: Arc<ManualClock>) -> StoreHealthMonitor {
        StoreHealthMonitor::new("lock_store", clock, Duration::from_secs(30))
    }

    #[test]
    fn test_unknown_until_observed() {
        let clock = Arc::new(ManualClock::new(0));
        let m = monitor(clock);
        assert_eq!(m.status(), HealthStatus::Unknown);
        m.record_success();
        assert_eq!(m.status(), HealthStatus::Healthy);
    }

    #[test]
    fn test_short_outage_is_degraded() {
        let clock = Arc::new(ManualClock::new(0));
        let m = monitor(clock.clone());
        m.record_failure("timeout");
        clock.advance(Duration::from_secs(10));
        m.record_failure("timeout");
        assert_eq!(m.status(), HealthStatus::Degraded);
        assert!(m.status().is_ok());
        assert_eq!(m.consecutive_failures(), 2);
    }

    #[test]
    fn test_sustained_outage_is_unhealthy() {
        let clock = Arc::new(ManualClock::new(0));
        let m = monitor(clock.clone());
        m.record_failure("timeout");
        clock.advance(Duration::from_secs(31));
        assert_eq!(m.status(), HealthStatus::Unhealthy);

        m.record_success();
        assert_eq!(m.status(), HealthStatus::Healthy);
        assert_eq!(m.consecutive_failures(), 0);
    }

    #[test]
    fn test_contention_counts_as_reachable() {
        let clock = Arc::new(ManualClock::new(0));
        let m = monitor(clock);
        m.record_failure("timeout");
        let contended: Result<()> = Err(CoordError::LockContention {
            resource: "r".into(),
            holder: "h".into(),
        });
        m.observe(&contended);
        assert_eq!(m.status(), HealthStatus::Healthy);
    }

    #[test]
    fn test_report_overall_is_worst_component() {
        let components = vec![
            ComponentHealth {
                name: "lock_store".into(),
                status: HealthStatus::Healthy,
                message: None,
                last_check_ms: 1,
            },
            ComponentHealth {
                name: "job_store".into(),
                status: HealthStatus::Unhealthy,
                message: Some("timeout".into()),
                last_check_ms: 1,
            },
        ];
        let report = HealthReport::from_components("node-1", components, false, 1);
        assert_eq!(report.overall, HealthStatus::Unhealthy);
        assert_eq!(report.unhealthy_components().len(), 1);
        assert!(!report.is_healthy());
    }
}
