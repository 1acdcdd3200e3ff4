//! Message types for actor communication.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobs_core::{JobId, JobMessage};
use ractor::RpcReplyPort;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::client::QueueClient;
use crate::reconcile::ReconcileReport;

/// Token identifying one delivery of a message. Every receive issues a new one,
/// so a token from an earlier delivery is rejected once the lock moved on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken(pub Ulid);

impl LockToken {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message handed to a consumer under a lock.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: JobMessage,
    pub lock: LockToken,
    /// 1 on first delivery.
    pub delivery_count: u32,
    pub max_delivery_count: u32,
    pub locked_until: DateTime<Utc>,
    pub lock_duration: Duration,
    pub enqueued_at: DateTime<Utc>,
}

impl Delivery {
    /// Whether abandoning this delivery would dead-letter the message.
    pub fn is_last_attempt(&self) -> bool {
        self.delivery_count >= self.max_delivery_count
    }
}

/// A message parked for operator inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: JobMessage,
    pub reason: String,
    pub description: String,
    pub delivery_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Reason recorded when the broker itself dead-letters a message.
pub const MAX_DELIVERY_COUNT_EXCEEDED: &str = "MaxDeliveryCountExceeded";

/// What happened to an abandoned message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonOutcome {
    Requeued,
    DeadLettered,
}

/// Queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Visible and waiting for a consumer.
    pub ready: u64,
    /// Waiting for a delay or backoff to pass.
    pub scheduled: u64,
    /// Locked by a consumer.
    pub in_flight: u64,
    pub dead_lettered: u64,
}

/// Errors returned by queue operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("lock lost or expired")]
    LockLost,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("queue call timed out")]
    Timeout,
}

/// Messages for the QueueActor.
#[derive(Debug)]
pub enum QueueMessage {
    /// Enqueue a message, optionally invisible for `delay`.
    Send {
        message: Box<JobMessage>,
        delay: Option<Duration>,
        reply: RpcReplyPort<Result<(), QueueError>>,
    },

    /// Lock and return the next deliverable message.
    Receive {
        reply: RpcReplyPort<Option<Delivery>>,
    },

    /// Acknowledge and remove a locked message.
    Complete {
        lock: LockToken,
        reply: RpcReplyPort<Result<(), QueueError>>,
    },

    /// Release a locked message for redelivery after `retry_after`.
    Abandon {
        lock: LockToken,
        retry_after: Duration,
        reply: RpcReplyPort<Result<AbandonOutcome, QueueError>>,
    },

    /// Move a locked message to the dead-letter lane.
    DeadLetter {
        lock: LockToken,
        reason: String,
        description: String,
        reply: RpcReplyPort<Result<(), QueueError>>,
    },

    /// Extend a lock by the queue's lock duration.
    RenewLock {
        lock: LockToken,
        reply: RpcReplyPort<Result<DateTime<Utc>, QueueError>>,
    },

    /// Ready and scheduled messages, oldest first.
    Peek {
        limit: usize,
        reply: RpcReplyPort<Vec<JobMessage>>,
    },

    /// Dead-lettered messages, oldest first.
    PeekDeadLetters {
        limit: usize,
        reply: RpcReplyPort<Vec<DeadLetter>>,
    },

    /// Which of `job_ids` have a dead-lettered `JobCreated`.
    DeadLetteredJobs {
        job_ids: Vec<JobId>,
        reply: RpcReplyPort<HashSet<JobId>>,
    },

    /// Whether any ready, scheduled or in-flight message concerns `job_id`.
    ContainsJob {
        job_id: JobId,
        reply: RpcReplyPort<bool>,
    },

    /// Get queue stats.
    GetStats { reply: RpcReplyPort<QueueStats> },

    /// Expire locks and persist a snapshot.
    Tick,

    /// Persist a snapshot and stop.
    Shutdown,
}

/// Messages for the WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Look for work; reschedules itself. Stopping the actor ends the loop.
    Poll,
}

/// Handles to the queues owned by the supervisor.
#[derive(Clone)]
pub struct QueueHandles {
    pub work: QueueClient,
    pub events: QueueClient,
}

impl std::fmt::Debug for QueueHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandles")
            .field("work", &self.work.name())
            .field("events", &self.events.name())
            .finish()
    }
}

/// Messages for the Supervisor.
#[derive(Debug)]
pub enum SupervisorMessage {
    /// Clients for the work and events queues.
    GetQueues { reply: RpcReplyPort<QueueHandles> },

    /// Number of live workers.
    WorkerCount { reply: RpcReplyPort<usize> },

    /// Run a reconciliation sweep now.
    Reconcile {
        reply: RpcReplyPort<Result<ReconcileReport, String>>,
    },

    /// Stop workers and queues.
    Shutdown,

    /// Periodic tick for housekeeping.
    Tick,
}
