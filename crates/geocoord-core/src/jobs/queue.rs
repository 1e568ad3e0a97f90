//! Message queue contract for queue-mode job execution.
//!
//! Semantics follow the usual visibility-timeout queues: a received message
//! is hidden for the visibility timeout and reappears with a new receipt if it
//! is not acknowledged in time. Delivery is therefore at-least-once.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::clock::{duration_ms, Clock};
use crate::error::Result;
use crate::jobs::Job;
use crate::lock_guard;

/// One receipt of a queued job.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Handle for ack/extend/dead-letter. Changes on every redelivery.
    pub receipt: String,
    /// Stable message id.
    pub message_id: String,
    /// The job. `attempt_count` is the number of earlier deliveries.
    pub job: Job,
    /// How many times the message has been received, this one included.
    pub receive_count: u32,
}

/// A job queue with visibility timeouts and a dead-letter target.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Enqueues `job`, invisible for `delay`. Returns the message id.
    async fn send(&self, job: Job, delay: Duration) -> Result<String>;

    /// Receives up to `max` visible messages, hiding each for `visibility_timeout`.
    async fn receive(&self, max: usize, visibility_timeout: Duration) -> Result<Vec<Delivery>>;

    /// Deletes the message. Acking an already deleted message, or with a
    /// receipt superseded by a redelivery, is not an error.
    async fn ack(&self, receipt: &str) -> Result<()>;

    /// Hides the message for `timeout` from now. False if the receipt is no
    /// longer current.
    async fn extend_visibility(&self, receipt: &str, timeout: Duration) -> Result<bool>;

    /// Moves the message to the dead-letter target. False if the receipt is
    /// no longer current, so a message is dead-lettered at most once.
    async fn dead_letter(&self, receipt: &str, reason: &str) -> Result<bool>;
}

/// A message moved to the dead-letter target.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    /// The job.
    pub job: Job,
    /// Final failure.
    pub reason: String,
    /// Deliveries made before giving up.
    pub receive_count: u32,
}

struct QueuedMessage {
    id: String,
    job: Job,
    visible_at_ms: u64,
    receive_count: u32,
    receipt: Option<String>,
}

#[derive(Default)]
struct QueueState {
    next_seq: u64,
    messages: BTreeMap<u64, QueuedMessage>,
    receipts: HashMap<String, u64>,
    dead: Vec<DeadLetter>,
}

impl QueueState {
    fn current(&mut self, receipt: &str) -> Option<(u64, &mut QueuedMessage)> {
        let seq = *self.receipts.get(receipt)?;
        let msg = self.messages.get_mut(&seq)?;
        (msg.receipt.as_deref() == Some(receipt)).then_some((seq, msg))
    }
}

/// In-process queue with a dead-letter list.
pub struct MemoryQueue {
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    /// Creates an empty queue.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Messages not yet acked or dead-lettered.
    pub fn len(&self) -> usize {
        lock_guard(&self.state).messages.len()
    }

    /// Returns true if no messages remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Contents of the dead-letter target.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        lock_guard(&self.state).dead.clone()
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn send(&self, job: Job, delay: Duration) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let visible_at_ms = self.clock.now_ms().saturating_add(duration_ms(delay));
        let mut state = lock_guard(&self.state);
        let seq = state.next_seq;
        state.next_seq += 1;
        state.messages.insert(
            seq,
            QueuedMessage {
                id: id.clone(),
                job,
                visible_at_ms,
                receive_count: 0,
                receipt: None,
            },
        );
        Ok(id)
    }

    async fn receive(&self, max: usize, visibility_timeout: Duration) -> Result<Vec<Delivery>> {
        let now = self.clock.now_ms();
        let hidden_until = now.saturating_add(duration_ms(visibility_timeout));
        let mut state = lock_guard(&self.state);
        let mut issued = Vec::new();
        let mut out = Vec::new();
        for (seq, msg) in state.messages.iter_mut() {
            if out.len() >= max {
                break;
            }
            if msg.visible_at_ms > now {
                continue;
            }
            let receipt = Uuid::new_v4().to_string();
            msg.receive_count += 1;
            msg.visible_at_ms = hidden_until;
            msg.receipt = Some(receipt.clone());
            let mut job = msg.job.clone();
            job.attempt_count = msg.receive_count - 1;
            issued.push((receipt.clone(), *seq));
            out.push(Delivery {
                receipt,
                message_id: msg.id.clone(),
                job,
                receive_count: msg.receive_count,
            });
        }
        state.receipts.extend(issued);
        Ok(out)
    }

    async fn ack(&self, receipt: &str) -> Result<()> {
        let mut state = lock_guard(&self.state);
        if let Some(seq) = state.receipts.get(receipt).copied() {
            if let Some(msg) = state.messages.remove(&seq) {
                state.receipts.retain(|_, s| *s != seq);
                tracing::debug!(message_id = %msg.id, "message acknowledged");
            }
        }
        Ok(())
    }

    async fn extend_visibility(&self, receipt: &str, timeout: Duration) -> Result<bool> {
        let until = self.clock.now_ms().saturating_add(duration_ms(timeout));
        let mut state = lock_guard(&self.state);
        Ok(match state.current(receipt) {
            Some((_, msg)) => {
                msg.visible_at_ms = until;
                true
            }
            None => false,
        })
    }

    async fn dead_letter(&self, receipt: &str, reason: &str) -> Result<bool> {
        let mut state = lock_guard(&self.state);
        let Some((seq, _)) = state.current(receipt) else {
            return Ok(false);
        };
        let Some(msg) = state.messages.remove(&seq) else {
            return Ok(false);
        };
        state.receipts.retain(|_, s| *s != seq);
        state.dead.push(DeadLetter {
            job: msg.job,
            reason: reason.to_string(),
            receive_count: msg.receive_count,
        });
        Ok(true)
    }
}
