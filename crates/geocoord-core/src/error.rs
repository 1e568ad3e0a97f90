//! Error types for the coordination layer.
//!
//! Every failure surfaced by this crate is exactly one [`CoordError`] variant.
//! Callers pick their retry/backoff policy from the variant; the crate itself
//! never retries.

use std::time::Duration;

use thiserror::Error;

/// Why an admission request was shed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ShedSignal {
    /// CPU saturation exceeded the configured threshold.
    CpuSaturation,
    /// Work queue depth exceeded the configured threshold.
    QueueDepth,
    /// The backing store has been unavailable past its deadline.
    StoreUnhealthy,
}

impl std::fmt::Display for ShedSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShedSignal::CpuSaturation => write!(f, "cpu saturation"),
            ShedSignal::QueueDepth => write!(f, "queue depth"),
            ShedSignal::StoreUnhealthy => write!(f, "store unhealthy"),
        }
    }
}

/// Errors that can occur in the coordination layer.
#[derive(Debug, Error)]
pub enum CoordError {
    /// Another instance holds a live lease on the resource.
    #[error("resource {resource} is locked by {holder}")]
    LockContention {
        /// The contended resource key.
        resource: String,
        /// Owner of the live lease.
        holder: String,
    },

    /// The lease lapsed, was stolen, or a stale fencing token was presented.
    /// Work done under the lease must be treated as unverified.
    #[error("lease on {resource} expired (token {token})")]
    LeaseExpired {
        /// The resource key of the lost lease.
        resource: String,
        /// The fencing token the caller held.
        token: u64,
    },

    /// The backing store could not be reached or timed out.
    #[error("store unavailable: {reason}")]
    StoreUnavailable {
        /// Description of the infrastructure fault.
        reason: String,
    },

    /// A job handler failed or timed out; retryable up to the attempt limit.
    #[error("job {job_id} failed on attempt {attempt}: {reason}")]
    JobExecutionFailed {
        /// Job identifier.
        job_id: String,
        /// Attempt number that failed (1-based).
        attempt: u32,
        /// Handler failure description.
        reason: String,
    },

    /// The job exhausted its attempts and was dead-lettered.
    #[error("job {job_id} dead-lettered after {attempts} attempts")]
    JobDeadLettered {
        /// Job identifier.
        job_id: String,
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// The caller exceeded its token budget.
    #[error("rate limited: {key} (retry after {retry_after_ms}ms)")]
    RateLimited {
        /// Rate limit key.
        key: String,
        /// Suggested wait before retrying.
        retry_after_ms: u64,
    },

    /// The server is protecting itself from overload.
    #[error("shed: {key} rejected due to {signal}")]
    Shed {
        /// Rate limit key of the rejected request.
        key: String,
        /// Health signal that triggered shedding.
        signal: ShedSignal,
    },

    /// No healthy data source for a read and fallback is disabled.
    #[error("no data source available for {operation}")]
    RoutingUnavailable {
        /// Operation class that could not be routed.
        operation: String,
    },

    /// Invalid configuration detected at construction time.
    #[error("configuration error: {0}")]
    Config(String),
}

impl CoordError {
    /// Shorthand for a [`CoordError::StoreUnavailable`].
    pub fn store_unavailable(reason: impl Into<String>) -> Self {
        CoordError::StoreUnavailable {
            reason: reason.into(),
        }
    }

    /// Returns true if the same call may succeed later without caller-side repair.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordError::LockContention { .. }
                | CoordError::StoreUnavailable { .. }
                | CoordError::JobExecutionFailed { .. }
                | CoordError::RateLimited { .. }
                | CoordError::Shed { .. }
        )
    }

    /// Backoff hint for caller-visible rejections, if the variant carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CoordError::RateLimited { retry_after_ms, .. } => {
                Some(Duration::from_millis(*retry_after_ms))
            }
            _ => None,
        }
    }
}

/// Result type alias for coordination operations.
pub type Result<T> = std::result::Result<T, CoordError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CoordError::store_unavailable("timeout").is_retryable());
        assert!(CoordError::LockContention {
            resource: "layer:roads".into(),
            holder: "a".into()
        }
        .is_retryable());
        assert!(!CoordError::LeaseExpired {
            resource: "layer:roads".into(),
            token: 3
        }
        .is_retryable());
        assert!(!CoordError::JobDeadLettered {
            job_id: "j".into(),
            attempts: 5
        }
        .is_retryable());
        assert!(!CoordError::RoutingUnavailable {
            operation: "wfs.getfeature".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_retry_after_only_for_rate_limit() {
        let limited = CoordError::RateLimited {
            key: "tenant-a".into(),
            retry_after_ms: 250,
        };
        assert_eq!(limited.retry_after(), Some(Duration::from_millis(250)));

        let shed = CoordError::Shed {
            key: "tenant-a".into(),
            signal: ShedSignal::CpuSaturation,
        };
        assert_eq!(shed.retry_after(), None);
        assert!(shed.to_string().contains("cpu saturation"));
    }
}
