//! Queue actor: an at-least-once, lease-based message queue with optional
//! per-job session ordering and a dead-letter lane.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobs_core::{JobId, JobMessage, MessageType};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use serde::{Deserialize, Serialize};

use crate::messages::{
    AbandonOutcome, DeadLetter, Delivery, LockToken, MAX_DELIVERY_COUNT_EXCEEDED, QueueError,
    QueueMessage, QueueStats,
};
use crate::persistence::StatePersistence;

/// Name of the lane carrying `JobCreated` work.
pub const WORK_QUEUE: &str = "jobs";
/// Name of the lane carrying lifecycle notifications.
pub const EVENTS_QUEUE: &str = "job-events";

/// Per-queue behaviour.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub name: String,
    pub lock_duration: Duration,
    pub max_delivery_count: u32,
    pub max_message_bytes: usize,
    /// Deliver messages of one job in order, one at a time.
    pub session_ordering: bool,
    /// Dead letters kept for inspection; the oldest are dropped beyond this.
    pub max_dead_letters: usize,
}

impl QueueSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lock_duration: Duration::from_secs(60),
            max_delivery_count: 5,
            max_message_bytes: 256 * 1024,
            session_ordering: true,
            max_dead_letters: 10_000,
        }
    }

    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    pub fn with_max_delivery_count(mut self, max_delivery_count: u32) -> Self {
        self.max_delivery_count = max_delivery_count.max(1);
        self
    }

    pub fn with_max_message_bytes(mut self, max_message_bytes: usize) -> Self {
        self.max_message_bytes = max_message_bytes;
        self
    }

    pub fn with_session_ordering(mut self, session_ordering: bool) -> Self {
        self.session_ordering = session_ordering;
        self
    }

    pub fn with_max_dead_letters(mut self, max_dead_letters: usize) -> Self {
        self.max_dead_letters = max_dead_letters.max(1);
        self
    }
}

pub(crate) fn to_delta(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    sequence: u64,
    message: JobMessage,
    enqueued_at: DateTime<Utc>,
    visible_at: DateTime<Utc>,
    delivery_count: u32,
}

#[derive(Debug, Clone)]
struct InFlight {
    envelope: Envelope,
    locked_until: DateTime<Utc>,
}

/// On-disk form of a queue. In-flight messages are stored as ready; their
/// locks do not survive a restart.
#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueSnapshot {
    next_sequence: u64,
    ready: Vec<Envelope>,
    dead_letters: Vec<DeadLetter>,
}

/// State for the queue actor.
pub struct QueueActorState {
    settings: QueueSettings,
    /// Not locked, keyed by enqueue sequence.
    ready: BTreeMap<u64, Envelope>,
    in_flight: HashMap<LockToken, InFlight>,
    dead_letters: VecDeque<DeadLetter>,
    next_sequence: u64,
    persistence: Option<StatePersistence>,
    dirty: bool,
}

impl QueueActorState {
    /// Create a new empty queue state.
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            ready: BTreeMap::new(),
            in_flight: HashMap::new(),
            dead_letters: VecDeque::new(),
            next_sequence: 0,
            persistence: None,
            dirty: false,
        }
    }

    /// Persist snapshots through `persistence`.
    pub fn with_persistence(mut self, persistence: StatePersistence) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    fn send(
        &mut self,
        message: JobMessage,
        delay: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let size = message
            .encoded_size()
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        if size > self.settings.max_message_bytes {
            return Err(QueueError::TooLarge {
                size,
                limit: self.settings.max_message_bytes,
            });
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let visible_at = delay.map_or(now, |d| now + to_delta(d));

        tracing::debug!(
            queue = %self.settings.name,
            message_id = %message.message_id,
            job_id = %message.job_id,
            message_type = %message.message_type,
            sequence,
            "Enqueued message"
        );

        self.ready.insert(
            sequence,
            Envelope {
                sequence,
                message,
                enqueued_at: now,
                visible_at,
                delivery_count: 0,
            },
        );
        self.dirty = true;
        Ok(())
    }

    fn receive(&mut self, now: DateTime<Utc>) -> Option<Delivery> {
        self.expire_locks(now);

        let mut blocked: HashSet<JobId> = if self.settings.session_ordering {
            self.in_flight
                .values()
                .map(|f| f.envelope.message.job_id.clone())
                .collect()
        } else {
            HashSet::new()
        };

        let mut chosen = None;
        for (sequence, envelope) in &self.ready {
            let job_id = &envelope.message.job_id;
            if blocked.contains(job_id) {
                continue;
            }
            if envelope.visible_at <= now {
                chosen = Some(*sequence);
                break;
            }
            if self.settings.session_ordering {
                // Later messages of this job wait for the earlier one.
                blocked.insert(job_id.clone());
            }
        }

        let mut envelope = self.ready.remove(&chosen?)?;
        envelope.delivery_count += 1;

        let lock = LockToken::new();
        let locked_until = now + to_delta(self.settings.lock_duration);
        let delivery = Delivery {
            message: envelope.message.clone(),
            lock,
            delivery_count: envelope.delivery_count,
            max_delivery_count: self.settings.max_delivery_count,
            locked_until,
            lock_duration: self.settings.lock_duration,
            enqueued_at: envelope.enqueued_at,
        };

        self.in_flight.insert(
            lock,
            InFlight {
                envelope,
                locked_until,
            },
        );
        self.dirty = true;
        Some(delivery)
    }

    fn complete(&mut self, lock: LockToken, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.expire_locks(now);
        let in_flight = self.in_flight.remove(&lock).ok_or(QueueError::LockLost)?;
        tracing::debug!(
            queue = %self.settings.name,
            message_id = %in_flight.envelope.message.message_id,
            "Completed message"
        );
        self.dirty = true;
        Ok(())
    }

    fn abandon(
        &mut self,
        lock: LockToken,
        retry_after: Duration,
        now: DateTime<Utc>,
    ) -> Result<AbandonOutcome, QueueError> {
        self.expire_locks(now);
        let in_flight = self.in_flight.remove(&lock).ok_or(QueueError::LockLost)?;
        self.dirty = true;
        Ok(self.release(in_flight.envelope, now + to_delta(retry_after), "abandoned", now))
    }

    /// Return a message to the ready lane, or dead-letter it when it has used
    /// up its deliveries.
    fn release(
        &mut self,
        mut envelope: Envelope,
        visible_at: DateTime<Utc>,
        why: &str,
        now: DateTime<Utc>,
    ) -> AbandonOutcome {
        if envelope.delivery_count >= self.settings.max_delivery_count {
            tracing::warn!(
                queue = %self.settings.name,
                message_id = %envelope.message.message_id,
                job_id = %envelope.message.job_id,
                delivery_count = envelope.delivery_count,
                "Message {why} after its last delivery; dead-lettering"
            );
            self.push_dead_letter(
                envelope,
                MAX_DELIVERY_COUNT_EXCEEDED,
                format!("{why} after {} deliveries", self.settings.max_delivery_count),
                now,
            );
            return AbandonOutcome::DeadLettered;
        }

        envelope.visible_at = visible_at;
        self.ready.insert(envelope.sequence, envelope);
        AbandonOutcome::Requeued
    }

    fn dead_letter(
        &mut self,
        lock: LockToken,
        reason: String,
        description: String,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.expire_locks(now);
        let in_flight = self.in_flight.remove(&lock).ok_or(QueueError::LockLost)?;
        tracing::warn!(
            queue = %self.settings.name,
            message_id = %in_flight.envelope.message.message_id,
            job_id = %in_flight.envelope.message.job_id,
            reason = %reason,
            "Dead-lettered message"
        );
        self.push_dead_letter(in_flight.envelope, &reason, description, now);
        Ok(())
    }

    fn push_dead_letter(
        &mut self,
        envelope: Envelope,
        reason: &str,
        description: String,
        now: DateTime<Utc>,
    ) {
        self.dead_letters.push_back(DeadLetter {
            message: envelope.message,
            reason: reason.to_string(),
            description,
            delivery_count: envelope.delivery_count,
            dead_lettered_at: now,
        });
        self.trim_dead_letters();
        self.dirty = true;
    }

    fn trim_dead_letters(&mut self) {
        while self.dead_letters.len() > self.settings.max_dead_letters {
            if let Some(dropped) = self.dead_letters.pop_front() {
                tracing::warn!(
                    queue = %self.settings.name,
                    message_id = %dropped.message.message_id,
                    job_id = %dropped.message.job_id,
                    "Dead-letter lane full; dropping oldest entry"
                );
            }
        }
    }

    fn renew(&mut self, lock: LockToken, now: DateTime<Utc>) -> Result<DateTime<Utc>, QueueError> {
        self.expire_locks(now);
        let in_flight = self.in_flight.get_mut(&lock).ok_or(QueueError::LockLost)?;
        in_flight.locked_until = now + to_delta(self.settings.lock_duration);
        Ok(in_flight.locked_until)
    }

    fn expire_locks(&mut self, now: DateTime<Utc>) {
        let expired: Vec<LockToken> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.locked_until <= now)
            .map(|(lock, _)| *lock)
            .collect();

        for lock in expired {
            if let Some(in_flight) = self.in_flight.remove(&lock) {
                tracing::info!(
                    queue = %self.settings.name,
                    message_id = %in_flight.envelope.message.message_id,
                    job_id = %in_flight.envelope.message.job_id,
                    "Lock expired; message returned to queue"
                );
                self.release(in_flight.envelope, now, "lock expired", now);
                self.dirty = true;
            }
        }
    }

    fn peek(&self, limit: usize) -> Vec<JobMessage> {
        self.ready
            .values()
            .take(limit)
            .map(|e| e.message.clone())
            .collect()
    }

    fn peek_dead_letters(&self, limit: usize) -> Vec<DeadLetter> {
        self.dead_letters.iter().take(limit).cloned().collect()
    }

    /// Which of `job_ids` have a dead-lettered `JobCreated`.
    fn dead_lettered_jobs(&self, job_ids: Vec<JobId>) -> HashSet<JobId> {
        let wanted: HashSet<JobId> = job_ids.into_iter().collect();
        self.dead_letters
            .iter()
            .map(|d| &d.message)
            .filter(|m| m.message_type == MessageType::JobCreated && wanted.contains(&m.job_id))
            .map(|m| m.job_id.clone())
            .collect()
    }

    fn contains_job(&self, job_id: &JobId) -> bool {
        self.ready.values().any(|e| &e.message.job_id == job_id)
            || self
                .in_flight
                .values()
                .any(|f| &f.envelope.message.job_id == job_id)
    }

    fn stats(&self, now: DateTime<Utc>) -> QueueStats {
        let ready = self.ready.values().filter(|e| e.visible_at <= now).count() as u64;
        QueueStats {
            ready,
            scheduled: self.ready.len() as u64 - ready,
            in_flight: self.in_flight.len() as u64,
            dead_lettered: self.dead_letters.len() as u64,
        }
    }

    fn snapshot(&self) -> QueueSnapshot {
        let mut ready: Vec<Envelope> = self
            .ready
            .values()
            .cloned()
            .chain(self.in_flight.values().map(|f| f.envelope.clone()))
            .collect();
        ready.sort_by_key(|e| e.sequence);

        QueueSnapshot {
            next_sequence: self.next_sequence,
            ready,
            dead_letters: self.dead_letters.iter().cloned().collect(),
        }
    }

    fn restore(&mut self, snapshot: QueueSnapshot) {
        self.next_sequence = snapshot.next_sequence;
        for envelope in snapshot.ready {
            self.next_sequence = self.next_sequence.max(envelope.sequence + 1);
            self.ready.insert(envelope.sequence, envelope);
        }
        self.dead_letters = snapshot.dead_letters.into();
        self.trim_dead_letters();
    }

    async fn persist(&mut self) {
        if !self.dirty {
            return;
        }
        let Some(persistence) = &self.persistence else {
            return;
        };
        match persistence.save(&self.settings.name, &self.snapshot()).await {
            Ok(()) => self.dirty = false,
            Err(e) => tracing::warn!(queue = %self.settings.name, "Failed to persist queue: {}", e),
        }
    }
}

/// Queue actor arguments.
pub struct QueueActorArgs {
    pub settings: QueueSettings,
    pub persistence: Option<StatePersistence>,
}

/// Queue actor that owns one message lane.
pub struct QueueActor;

impl Actor for QueueActor {
    type Msg = QueueMessage;
    type State = QueueActorState;
    type Arguments = QueueActorArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting queue actor: {}", args.settings.name);

        let mut state = QueueActorState::new(args.settings);
        if let Some(persistence) = args.persistence {
            persistence.init().await?;
            if let Some(snapshot) = persistence
                .load::<QueueSnapshot>(&state.settings.name)
                .await?
            {
                tracing::info!(
                    queue = %state.settings.name,
                    messages = snapshot.ready.len(),
                    dead_letters = snapshot.dead_letters.len(),
                    "Restored queue snapshot"
                );
                state.restore(snapshot);
            }
            state = state.with_persistence(persistence);
        }

        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let now = Utc::now();
        match message {
            QueueMessage::Send {
                message,
                delay,
                reply,
            } => {
                let _ = reply.send(state.send(*message, delay, now));
            }

            QueueMessage::Receive { reply } => {
                let _ = reply.send(state.receive(now));
            }

            QueueMessage::Complete { lock, reply } => {
                let _ = reply.send(state.complete(lock, now));
            }

            QueueMessage::Abandon {
                lock,
                retry_after,
                reply,
            } => {
                let _ = reply.send(state.abandon(lock, retry_after, now));
            }

            QueueMessage::DeadLetter {
                lock,
                reason,
                description,
                reply,
            } => {
                let _ = reply.send(state.dead_letter(lock, reason, description, now));
            }

            QueueMessage::RenewLock { lock, reply } => {
                let _ = reply.send(state.renew(lock, now));
            }

            QueueMessage::Peek { limit, reply } => {
                let _ = reply.send(state.peek(limit));
            }

            QueueMessage::PeekDeadLetters { limit, reply } => {
                let _ = reply.send(state.peek_dead_letters(limit));
            }

            QueueMessage::DeadLetteredJobs { job_ids, reply } => {
                let _ = reply.send(state.dead_lettered_jobs(job_ids));
            }

            QueueMessage::ContainsJob { job_id, reply } => {
                let _ = reply.send(state.contains_job(&job_id));
            }

            QueueMessage::GetStats { reply } => {
                state.expire_locks(now);
                let _ = reply.send(state.stats(now));
            }

            QueueMessage::Tick => {
                state.expire_locks(now);
                state.persist().await;
            }

            QueueMessage::Shutdown => {
                tracing::info!("Shutting down queue: {}", state.settings.name);
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.dirty = true;
        state.persist().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobs_core::{CorrelationId, MessageType};

    fn message(job: &str, message_type: MessageType) -> JobMessage {
        JobMessage::new(
            JobId::from_string(job),
            message_type,
            CorrelationId::generate(),
            &serde_json::json!({}),
        )
        .unwrap()
    }

    fn state(session_ordering: bool) -> QueueActorState {
        QueueActorState::new(
            QueueSettings::new("test")
                .with_max_delivery_count(2)
                .with_session_ordering(session_ordering),
        )
    }

    #[test]
    fn session_ordering_holds_back_later_messages_of_a_job() {
        let now = Utc::now();
        let mut q = state(true);
        q.send(message("job_a", MessageType::JobCreated), None, now).unwrap();
        q.send(message("job_a", MessageType::JobProgress), None, now).unwrap();
        q.send(message("job_b", MessageType::JobCreated), None, now).unwrap();

        let first = q.receive(now).unwrap();
        assert_eq!(first.message.job_id.as_str(), "job_a");
        let second = q.receive(now).unwrap();
        assert_eq!(second.message.job_id.as_str(), "job_b");
        assert!(q.receive(now).is_none());

        q.complete(first.lock, now).unwrap();
        let third = q.receive(now).unwrap();
        assert_eq!(third.message.message_type, MessageType::JobProgress);
    }

    #[test]
    fn delayed_message_blocks_its_session_only() {
        let now = Utc::now();
        let mut q = state(true);
        q.send(
            message("job_a", MessageType::JobCreated),
            Some(Duration::from_secs(60)),
            now,
        )
        .unwrap();
        q.send(message("job_a", MessageType::JobCancelled), None, now).unwrap();
        q.send(message("job_b", MessageType::JobCreated), None, now).unwrap();

        let got = q.receive(now).unwrap();
        assert_eq!(got.message.job_id.as_str(), "job_b");
        assert!(q.receive(now).is_none());
        assert_eq!(q.stats(now).scheduled, 1);
    }

    #[test]
    fn without_sessions_messages_of_one_job_run_in_parallel() {
        let now = Utc::now();
        let mut q = state(false);
        q.send(message("job_a", MessageType::JobCreated), None, now).unwrap();
        q.send(message("job_a", MessageType::JobProgress), None, now).unwrap();
        assert!(q.receive(now).is_some());
        assert!(q.receive(now).is_some());
    }

    #[test]
    fn expired_lock_redelivers_then_dead_letters() {
        let now = Utc::now();
        let mut q = state(true);
        q.send(message("job_a", MessageType::JobCreated), None, now).unwrap();

        let first = q.receive(now).unwrap();
        assert_eq!(first.delivery_count, 1);
        let later = now + chrono::Duration::seconds(61);
        assert_eq!(q.renew(first.lock, later), Err(QueueError::LockLost));

        let second = q.receive(later).unwrap();
        assert_eq!(second.delivery_count, 2);
        assert!(second.is_last_attempt());
        assert_eq!(q.complete(first.lock, later), Err(QueueError::LockLost));

        let much_later = later + chrono::Duration::seconds(61);
        assert!(q.receive(much_later).is_none());
        let dead = q.peek_dead_letters(10);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, MAX_DELIVERY_COUNT_EXCEEDED);
    }

    #[test]
    fn dead_letter_lane_keeps_the_newest_entries() {
        let now = Utc::now();
        let mut q = QueueActorState::new(QueueSettings::new("test").with_max_dead_letters(2));
        for job in ["job_a", "job_b", "job_c"] {
            q.send(message(job, MessageType::JobCreated), None, now).unwrap();
            let delivery = q.receive(now).unwrap();
            q.dead_letter(delivery.lock, "InvalidPayload".into(), String::new(), now)
                .unwrap();
        }

        let kept: Vec<String> = q
            .peek_dead_letters(10)
            .into_iter()
            .map(|d| d.message.job_id.to_string())
            .collect();
        assert_eq!(kept, vec!["job_b", "job_c"]);
        assert_eq!(q.stats(now).dead_lettered, 2);
    }

    #[test]
    fn dead_lettered_jobs_only_reports_work_messages_asked_for() {
        let now = Utc::now();
        let mut q = state(false);
        for (job, message_type) in [
            ("job_a", MessageType::JobCreated),
            ("job_b", MessageType::JobProgress),
            ("job_c", MessageType::JobCreated),
        ] {
            q.send(message(job, message_type), None, now).unwrap();
            let delivery = q.receive(now).unwrap();
            q.dead_letter(delivery.lock, "InvalidPayload".into(), String::new(), now)
                .unwrap();
        }

        let found = q.dead_lettered_jobs(vec![
            JobId::from_string("job_a"),
            JobId::from_string("job_b"),
            JobId::from_string("job_d"),
        ]);
        assert_eq!(found, HashSet::from([JobId::from_string("job_a")]));
    }

    #[test]
    fn snapshot_restores_in_flight_as_ready() {
        let now = Utc::now();
        let mut q = state(true);
        q.send(message("job_a", MessageType::JobCreated), None, now).unwrap();
        q.send(message("job_b", MessageType::JobCreated), None, now).unwrap();
        let _locked = q.receive(now).unwrap();

        let snapshot = q.snapshot();
        let mut restored = state(true);
        restored.restore(snapshot);

        assert_eq!(restored.stats(now).ready, 2);
        assert_eq!(restored.stats(now).in_flight, 0);
        let next = restored.receive(now).unwrap();
        assert_eq!(next.message.job_id.as_str(), "job_a");
        assert_eq!(next.delivery_count, 2);
    }
}
