//! Core types shared by the coordination components.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one process in the fleet.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    /// Creates an instance id from an explicit name.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random instance id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monotonically increasing token tied to one lease acquisition.
///
/// Tokens start at 1; a resource that was never leased has no token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FencingToken(u64);

impl FencingToken {
    /// Wraps a raw token value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw token value.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Returns the token issued to the next acquisition.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Time-bounded ownership record over a named resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// The leased resource.
    pub resource_key: String,
    /// The instance that holds the lease.
    pub owner_id: InstanceId,
    /// Expiry in milliseconds since the Unix epoch.
    pub expires_at_ms: u64,
    /// Token issued for this acquisition.
    pub fencing_token: FencingToken,
}

impl Lease {
    /// Returns true if the lease has not yet expired at `now_ms`.
    pub fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at_ms > now_ms
    }

    /// Returns true if `other` refers to the same acquisition.
    pub fn same_acquisition(&self, other: &Lease) -> bool {
        self.owner_id == other.owner_id && self.fencing_token == other.fencing_token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fencing_token_ordering() {
        let t1 = FencingToken::new(1);
        assert_eq!(t1.next(), FencingToken::new(2));
        assert!(t1 < t1.next());
    }

    #[test]
    fn test_generated_instance_ids_differ() {
        assert_ne!(InstanceId::generate(), InstanceId::generate());
    }

    #[test]
    fn test_lease_liveness() {
        let lease = Lease {
            resource_key: "layer:buildings".into(),
            owner_id: InstanceId::new("a"),
            expires_at_ms: 5_000,
            fencing_token: FencingToken::new(1),
        };
        assert!(lease.is_live(4_999));
        assert!(!lease.is_live(5_000));
    }
}
