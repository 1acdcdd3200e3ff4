//! Actor system for evaluation jobs.
//!
//! This crate provides the Ractor-based message queue, the worker pool that
//! drives jobs through their lifecycle, and the supervisor tying them together.
//!
//! # Architecture
//!
//! - `Supervisor` - Top-level actor owning the queues, workers and reconciler
//! - `QueueActor` - One lease-based message lane (`jobs` or `job-events`)
//! - `WorkerActor` - Pulls deliveries and hands them to the `JobProcessor`
//!
//! # Usage
//!
//! ```ignore
//! use actors::{JobSystem, SupervisorArgs, SystemConfig, SimilarityScorer};
//!
//! let system = JobSystem::start(SupervisorArgs {
//!     config: SystemConfig::default(),
//!     stores,
//!     storage,
//!     scorer: Arc::new(SimilarityScorer),
//!     metrics: Arc::new(NoopMetrics),
//! })
//! .await?;
//!
//! system.queues().work.send(message, None).await?;
//! ```

mod client;
mod messages;
mod offload;
mod persistence;
mod processor;
mod queue_actor;
mod reconcile;
mod scoring;
mod supervisor;
mod worker_actor;

pub use client::QueueClient;
pub use messages::{
    AbandonOutcome, DeadLetter, Delivery, LockToken, MAX_DELIVERY_COUNT_EXCEEDED, QueueError,
    QueueHandles, QueueMessage, QueueStats, SupervisorMessage, WorkerMessage,
};
pub use offload::{MESSAGE_CONTAINER, OffloadError, PayloadOffloader};
pub use persistence::{PersistenceError, StatePersistence};
pub use processor::{
    Disposition, INVALID_PAYLOAD, JOB_NOT_FOUND, JobProcessor, RESULTS_CONTAINER, WorkerError,
    WorkerSettings, cancellation_message,
};
pub use queue_actor::{
    EVENTS_QUEUE, QueueActor, QueueActorArgs, QueueActorState, QueueSettings, WORK_QUEUE,
};
pub use reconcile::{ReconcileError, ReconcileReport, Reconciler};
pub use scoring::{
    FnScorer, RetryPolicy, Score, ScoreError, ScoreFuture, Scorer, ScoringFailure,
    SimilarityScorer, score_with_retry,
};
pub use supervisor::{JobSystem, Supervisor, SupervisorArgs, SystemConfig, SystemError};
pub use worker_actor::{WorkerActor, WorkerArgs};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort};
