//! Configuration surface consumed by the coordination layer.
//!
//! All durations are plain millisecond integers so the same file can be
//! written as TOML or JSON.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoordError, Result};

/// Backend used for leases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    /// Process-local map. Correct only for a single instance.
    #[default]
    Memory,
    /// Shared keyed store with atomic conditional-set and TTL.
    External,
}

/// How background jobs are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMode {
    /// Only the elected leader polls the job table.
    Polling,
    /// Every instance consumes from a message queue.
    Queue,
}

/// Identity of this instance within the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Explicit instance id; a random one is generated when absent.
    pub instance_id: Option<String>,
    /// Number of instances the deployment runs.
    pub expected_instances: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            expected_instances: 1,
        }
    }
}

/// Leader election settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderElectionConfig {
    /// Whether this instance takes part in leader election.
    pub enabled: bool,
    /// Well-known cluster resource the leadership lease is taken on.
    pub resource_name: String,
    /// Leadership lease TTL.
    pub lease_duration_ms: u64,
    /// Interval between renewals. Should be at most a third of the lease.
    pub renewal_interval_ms: u64,
    /// Consecutive renewal failures before stepping down.
    pub max_renewal_failures: u32,
    /// Assumed bound on clock skew between instances; the leader steps down
    /// this long before its lease expires.
    pub clock_skew_allowance_ms: u64,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            resource_name: "cluster-leader".to_string(),
            lease_duration_ms: 15_000,
            renewal_interval_ms: 5_000,
            max_renewal_failures: 3,
            clock_skew_allowance_ms: 500,
        }
    }
}

impl LeaderElectionConfig {
    /// Leadership lease TTL.
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    /// Renewal interval.
    pub fn renewal_interval(&self) -> Duration {
        Duration::from_millis(self.renewal_interval_ms)
    }

    /// Clock skew allowance.
    pub fn clock_skew_allowance(&self) -> Duration {
        Duration::from_millis(self.clock_skew_allowance_ms)
    }
}

/// Background job execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundJobsConfig {
    /// Polling or queue consumption.
    pub mode: JobMode,
    /// Interval between poll cycles (polling) or receive calls (queue).
    pub polling_interval_ms: u64,
    /// Maximum handlers running at once on this instance.
    pub max_concurrency: usize,
    /// Queue visibility timeout; also the TTL of in-progress completion markers.
    pub visibility_timeout_ms: u64,
    /// Whether completion markers guard side effects.
    pub idempotency_enabled: bool,
    /// Attempts before a job is dead-lettered.
    pub max_attempts: u32,
    /// Handler runs longer than this count as failed attempts.
    pub handler_timeout_ms: u64,
    /// Backoff before the first retry; doubles per attempt.
    pub retry_base_delay_ms: u64,
    /// Upper bound on the retry backoff.
    pub retry_max_delay_ms: u64,
    /// Maximum jobs fetched per poll cycle.
    pub batch_size: usize,
    /// Bound on a single job store or queue call.
    pub store_timeout_ms: u64,
}

impl Default for BackgroundJobsConfig {
    fn default() -> Self {
        Self {
            mode: JobMode::Polling,
            polling_interval_ms: 1_000,
            max_concurrency: 4,
            visibility_timeout_ms: 30_000,
            idempotency_enabled: true,
            max_attempts: 5,
            handler_timeout_ms: 60_000,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 300_000,
            batch_size: 32,
            store_timeout_ms: 5_000,
        }
    }
}

impl BackgroundJobsConfig {
    /// Poll interval.
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    /// Visibility timeout.
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    /// Handler timeout.
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    /// Job store / queue call timeout.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Backoff before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let delay = self.retry_base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.retry_max_delay_ms))
    }
}

/// Token bucket settings applied to every admission key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum tokens a bucket holds.
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_rate: f64,
    /// How often buckets that refilled to capacity are dropped.
    pub prune_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 100.0,
            refill_rate: 50.0,
            prune_interval_ms: 60_000,
        }
    }
}

impl RateLimitConfig {
    /// Bucket prune interval.
    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }
}

/// Load shedding thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadShedConfig {
    /// Whether load shedding is enabled.
    pub enabled: bool,
    /// CPU usage percentage above which requests are shed.
    pub cpu_threshold_pct: u8,
    /// Queue depth above which requests are shed.
    pub queue_depth_threshold: usize,
    /// Whether an unhealthy backing store sheds writes.
    pub shed_on_store_unhealthy: bool,
}

impl Default for LoadShedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cpu_threshold_pct: 90,
            queue_depth_threshold: 1_000,
            shed_on_store_unhealthy: true,
        }
    }
}

/// A data source the router can hand out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceConfig {
    /// Stable name used in logs and health reports.
    pub name: String,
    /// Connection string passed through to the caller.
    pub url: String,
}

/// Read replica routing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaRoutingConfig {
    /// Whether reads are routed to replicas at all.
    pub enabled: bool,
    /// Operation classes eligible for replica reads.
    pub operations: Vec<String>,
    /// Use the primary when every replica is unhealthy.
    pub fallback_to_primary: bool,
    /// The primary data source.
    pub primary: DataSourceConfig,
    /// Replicas in preference order.
    pub replicas: Vec<DataSourceConfig>,
    /// Consecutive probe failures before a replica is marked unhealthy.
    pub failure_threshold: u32,
    /// Consecutive probe successes before a replica is marked healthy again.
    pub recovery_threshold: u32,
    /// Timeout for one health probe.
    pub probe_timeout_ms: u64,
    /// Interval between health probe rounds.
    pub probe_interval_ms: u64,
}

impl Default for ReplicaRoutingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            operations: Vec::new(),
            fallback_to_primary: false,
            primary: DataSourceConfig {
                name: "primary".to_string(),
                url: String::new(),
            },
            replicas: Vec::new(),
            failure_threshold: 3,
            recovery_threshold: 2,
            probe_timeout_ms: 2_000,
            probe_interval_ms: 5_000,
        }
    }
}

impl ReplicaRoutingConfig {
    /// Probe timeout.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Probe interval.
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

/// Process health settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Store outages longer than this mark the process unhealthy.
    pub store_unavailable_deadline_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            store_unavailable_deadline_ms: 30_000,
        }
    }
}

impl HealthConfig {
    /// Outage deadline.
    pub fn store_unavailable_deadline(&self) -> Duration {
        Duration::from_millis(self.store_unavailable_deadline_ms)
    }
}

/// Top-level configuration of the coordination layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Instance identity.
    pub cluster: ClusterConfig,
    /// Lease backend.
    pub lock_manager: LockBackend,
    /// Bound on a single lock store call.
    pub lock_timeout_ms: u64,
    /// Leader election.
    pub leader_election: LeaderElectionConfig,
    /// Background jobs.
    pub background_jobs: BackgroundJobsConfig,
    /// Admission token buckets.
    pub rate_limit: RateLimitConfig,
    /// Admission load shedding.
    pub load_shed: LoadShedConfig,
    /// Read replica routing.
    pub replica_routing: ReplicaRoutingConfig,
    /// Process health.
    pub health: HealthConfig,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig::default(),
            lock_manager: LockBackend::Memory,
            lock_timeout_ms: 5_000,
            leader_election: LeaderElectionConfig::default(),
            background_jobs: BackgroundJobsConfig::default(),
            rate_limit: RateLimitConfig::default(),
            load_shed: LoadShedConfig::default(),
            replica_routing: ReplicaRoutingConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl CoordinationConfig {
    /// Loads a config from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| CoordError::Config(format!("{}: {}", path.display(), e)))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: CoordinationConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| CoordError::Config(e.to_string()))?,
            "json" => {
                serde_json::from_str(&contents).map_err(|e| CoordError::Config(e.to_string()))?
            }
            _ => {
                return Err(CoordError::Config(format!(
                    "unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Bound on a single lock store call.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Rejects configurations that would silently break coordination guarantees.
    pub fn validate(&self) -> Result<()> {
        if self.lock_manager == LockBackend::Memory && self.cluster.expected_instances > 1 {
            return Err(CoordError::Config(format!(
                "lock_manager = \"memory\" only coordinates a single process, \
                 but cluster.expected_instances = {}",
                self.cluster.expected_instances
            )));
        }
        if self.lock_timeout_ms == 0 {
            return Err(CoordError::Config("lock_timeout_ms must be > 0".into()));
        }

        let le = &self.leader_election;
        if le.enabled {
            if le.resource_name.is_empty() {
                return Err(CoordError::Config(
                    "leader_election.resource_name must not be empty".into(),
                ));
            }
            if le.renewal_interval_ms == 0 || le.renewal_interval_ms >= le.lease_duration_ms {
                return Err(CoordError::Config(format!(
                    "leader_election.renewal_interval_ms ({}) must be in (0, lease_duration_ms = {})",
                    le.renewal_interval_ms, le.lease_duration_ms
                )));
            }
            if le.clock_skew_allowance_ms >= le.lease_duration_ms {
                return Err(CoordError::Config(
                    "leader_election.clock_skew_allowance_ms must be below the lease duration"
                        .into(),
                ));
            }
            if le.max_renewal_failures == 0 {
                return Err(CoordError::Config(
                    "leader_election.max_renewal_failures must be >= 1".into(),
                ));
            }
        }

        let jobs = &self.background_jobs;
        if jobs.max_attempts == 0 || jobs.max_concurrency == 0 || jobs.batch_size == 0 {
            return Err(CoordError::Config(
                "background_jobs.max_attempts, max_concurrency and batch_size must be >= 1".into(),
            ));
        }
        if jobs.mode == JobMode::Polling && !le.enabled && self.cluster.expected_instances > 1 {
            return Err(CoordError::Config(
                "polling mode on more than one instance requires leader_election.enabled".into(),
            ));
        }

        if self.rate_limit.capacity <= 0.0
            || self.rate_limit.refill_rate < 0.0
            || self.rate_limit.prune_interval_ms == 0
        {
            return Err(CoordError::Config(
                "rate_limit.capacity and prune_interval_ms must be > 0, refill_rate >= 0".into(),
            ));
        }

        let rr = &self.replica_routing;
        if rr.enabled && (rr.failure_threshold == 0 || rr.recovery_threshold == 0) {
            return Err(CoordError::Config(
                "replica_routing failure and recovery thresholds must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn valid() -> CoordinationConfig {
        CoordinationConfig::default()
    }

    #[test]
    fn test_default_values() {
        let config = CoordinationConfig::default();
        assert_eq!(config.lock_manager, LockBackend::Memory);
        assert_eq!(config.leader_election.max_renewal_failures, 3);
        assert_eq!(config.background_jobs.mode, JobMode::Polling);
        assert!(!config.replica_routing.fallback_to_primary);
    }

    #[test]
    fn test_memory_backend_rejected_for_multiple_instances() {
        let mut config = valid();
        config.cluster.expected_instances = 3;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, CoordError::Config(_)));
        assert!(err.to_string().contains("memory"));

        config.lock_manager = LockBackend::External;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_renewal_interval_must_be_below_lease() {
        let mut config = valid();
        config.leader_election.renewal_interval_ms = config.leader_election.lease_duration_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_delay_is_exponential_and_capped() {
        let jobs = BackgroundJobsConfig {
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 1_000,
            ..Default::default()
        };
        assert_eq!(jobs.retry_delay(1), Duration::from_millis(100));
        assert_eq!(jobs.retry_delay(2), Duration::from_millis(200));
        assert_eq!(jobs.retry_delay(4), Duration::from_millis(800));
        assert_eq!(jobs.retry_delay(5), Duration::from_millis(1_000));
        assert_eq!(jobs.retry_delay(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
lock_manager = "external"
lock_timeout_ms = 1500

[cluster]
instance_id = "node-a"
expected_instances = 3

[leader_election]
resource_name = "geo-scheduler"
lease_duration_ms = 9000
renewal_interval_ms = 3000

[background_jobs]
mode = "queue"
max_attempts = 4

[replica_routing]
enabled = true
operations = ["wfs.getfeature"]
fallback_to_primary = true
"#
        )
        .unwrap();

        let config = CoordinationConfig::from_file(file.path()).unwrap();
        assert_eq!(config.lock_manager, LockBackend::External);
        assert_eq!(config.lock_timeout(), Duration::from_millis(1500));
        assert_eq!(config.cluster.instance_id.as_deref(), Some("node-a"));
        assert_eq!(config.leader_election.resource_name, "geo-scheduler");
        assert_eq!(config.background_jobs.mode, JobMode::Queue);
        assert_eq!(config.background_jobs.max_attempts, 4);
        assert_eq!(config.replica_routing.operations, vec!["wfs.getfeature"]);
    }

    #[test]
    fn test_from_json_file_and_unknown_extension() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        write!(file, r#"{{"lock_timeout_ms": 750}}"#).unwrap();
        let config = CoordinationConfig::from_file(file.path()).unwrap();
        assert_eq!(config.lock_timeout_ms, 750);

        let other = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(CoordinationConfig::from_file(other.path()).is_err());
    }
}
