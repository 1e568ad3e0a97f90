//! Signals emitted to the surrounding system.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::jobs::JobStatus;
use crate::types::InstanceId;

/// Why admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    /// The caller exhausted its token budget.
    RateLimited,
    /// The server is shedding load.
    Shed,
}

/// Coordination signal published on the [`EventBus`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CoordinationEvent {
    /// This instance gained or lost leadership.
    LeadershipChanged {
        /// The instance whose role changed.
        instance_id: InstanceId,
        /// The new role.
        is_leader: bool,
    },
    /// A job reached a terminal state.
    JobCompleted {
        /// Job identifier.
        job_id: String,
        /// Terminal status reached.
        status: JobStatus,
    },
    /// A job exhausted its attempts and needs operator attention.
    JobDeadLettered {
        /// Job identifier.
        job_id: String,
    },
    /// An admission request was refused.
    AdmissionRejected {
        /// Rate limit key of the refused request.
        key: String,
        /// Throttling or shedding.
        reason: RejectionReason,
    },
}

/// Broadcast bus for coordination events.
///
/// Publishing never blocks and never fails the caller: with no subscribers the
/// event is dropped, and slow subscribers observe `Lagged` on their receiver.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoordinationEvent>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event; returns the number of subscribers that received it.
    pub fn publish(&self, event: CoordinationEvent) -> usize {
        tracing::trace!(?event, "publishing coordination event");
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribes to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinationEvent> {
        self.sender.subscribe()
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
