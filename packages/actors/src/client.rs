//! Typed async handle over a queue actor.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobs_core::{JobId, JobMessage};
use ractor::rpc::CallResult;
use ractor::{ActorRef, RpcReplyPort};

use crate::messages::{
    AbandonOutcome, DeadLetter, Delivery, LockToken, QueueError, QueueMessage, QueueStats,
};

const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for one queue actor. Cheap to clone.
#[derive(Clone)]
pub struct QueueClient {
    actor: ActorRef<QueueMessage>,
    name: Arc<str>,
}

impl QueueClient {
    pub fn new(actor: ActorRef<QueueMessage>, name: impl Into<Arc<str>>) -> Self {
        Self {
            actor,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn actor(&self) -> &ActorRef<QueueMessage> {
        &self.actor
    }

    async fn call<T, F>(&self, build: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(RpcReplyPort<T>) -> QueueMessage,
    {
        // ractor::rpc::call returns Result<CallResult<T>, MessagingErr<M>>
        match ractor::rpc::call(&self.actor, build, Some(CALL_TIMEOUT)).await {
            Ok(CallResult::Success(value)) => Ok(value),
            Ok(CallResult::Timeout) => Err(QueueError::Timeout),
            Ok(CallResult::SenderError) => Err(QueueError::Unavailable(format!(
                "queue {} dropped the reply",
                self.name
            ))),
            Err(e) => Err(QueueError::Unavailable(format!("queue {}: {e}", self.name))),
        }
    }

    pub async fn send(&self, message: JobMessage, delay: Option<Duration>) -> Result<(), QueueError> {
        self.call(|reply| QueueMessage::Send {
            message: Box::new(message),
            delay,
            reply,
        })
        .await?
    }

    pub async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        self.call(|reply| QueueMessage::Receive { reply }).await
    }

    pub async fn complete(&self, lock: LockToken) -> Result<(), QueueError> {
        self.call(|reply| QueueMessage::Complete { lock, reply }).await?
    }

    pub async fn abandon(
        &self,
        lock: LockToken,
        retry_after: Duration,
    ) -> Result<AbandonOutcome, QueueError> {
        self.call(|reply| QueueMessage::Abandon {
            lock,
            retry_after,
            reply,
        })
        .await?
    }

    pub async fn dead_letter(
        &self,
        lock: LockToken,
        reason: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<(), QueueError> {
        let reason = reason.into();
        let description = description.into();
        self.call(|reply| QueueMessage::DeadLetter {
            lock,
            reason,
            description,
            reply,
        })
        .await?
    }

    pub async fn renew_lock(&self, lock: LockToken) -> Result<DateTime<Utc>, QueueError> {
        self.call(|reply| QueueMessage::RenewLock { lock, reply }).await?
    }

    pub async fn peek(&self, limit: usize) -> Result<Vec<JobMessage>, QueueError> {
        self.call(|reply| QueueMessage::Peek { limit, reply }).await
    }

    pub async fn peek_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        self.call(|reply| QueueMessage::PeekDeadLetters { limit, reply })
            .await
    }

    pub async fn dead_lettered_jobs(&self, job_ids: Vec<JobId>) -> Result<HashSet<JobId>, QueueError> {
        self.call(|reply| QueueMessage::DeadLetteredJobs { job_ids, reply })
            .await
    }

    pub async fn contains_job(&self, job_id: &JobId) -> Result<bool, QueueError> {
        let job_id = job_id.clone();
        self.call(|reply| QueueMessage::ContainsJob { job_id, reply })
            .await
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.call(|reply| QueueMessage::GetStats { reply }).await
    }

    /// Ask the queue to expire locks and persist.
    pub fn tick(&self) {
        let _ = self.actor.send_message(QueueMessage::Tick);
    }

    /// Ask the queue to persist and stop.
    pub fn shutdown(&self) {
        let _ = self.actor.send_message(QueueMessage::Shutdown);
    }
}
