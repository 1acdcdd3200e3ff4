#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use actors::{
    Actor, JobProcessor, PayloadOffloader, QueueActor, QueueActorArgs, QueueClient, QueueSettings,
    RetryPolicy, Scorer, WorkerSettings, EVENTS_QUEUE, WORK_QUEUE,
};
use db::{DbConfig, Stores};
use jobs_core::{
    CorrelationId, CountingMetrics, EvaluationItem, Job, JobConfiguration, JobId, JobMessage,
    JobType, MessageType,
};
use storage::{Storage, StorageConfig};

/// Everything a processor needs, backed by in-memory stores and fresh queues.
pub struct Harness {
    pub stores: Stores,
    pub storage: Storage,
    pub work: QueueClient,
    pub events: QueueClient,
    pub metrics: Arc<CountingMetrics>,
}

pub async fn spawn_queue(settings: QueueSettings) -> QueueClient {
    let name = settings.name.clone();
    let (actor, _handle) = Actor::spawn(
        None,
        QueueActor,
        QueueActorArgs {
            settings,
            persistence: None,
        },
    )
    .await
    .expect("queue actor spawns");
    QueueClient::new(actor, name)
}

pub async fn harness() -> Harness {
    harness_with_work(QueueSettings::new(WORK_QUEUE).with_max_delivery_count(3)).await
}

pub async fn harness_with_work(work: QueueSettings) -> Harness {
    Harness {
        stores: db::init(&DbConfig::memory()).await.expect("in-memory db"),
        storage: Storage::new(StorageConfig::memory())
            .await
            .expect("in-memory storage"),
        work: spawn_queue(work).await,
        events: spawn_queue(QueueSettings::new(EVENTS_QUEUE)).await,
        metrics: Arc::new(CountingMetrics::default()),
    }
}

/// Short timeouts and near-zero backoff; progress on every item.
pub fn fast_settings() -> WorkerSettings {
    WorkerSettings {
        scoring_timeout: Duration::from_secs(2),
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        },
        result_inline_limit_bytes: 64 * 1024,
        progress_every: 1,
    }
}

impl Harness {
    pub fn offloader(&self) -> PayloadOffloader {
        PayloadOffloader::new(self.storage.clone(), 64 * 1024)
    }

    pub fn processor(&self, scorer: impl Scorer, settings: WorkerSettings) -> JobProcessor {
        JobProcessor::new(
            self.stores.jobs.clone(),
            self.offloader(),
            self.events.clone(),
            Arc::new(scorer),
            self.metrics.clone(),
            settings,
        )
    }

    /// Persist `job` and enqueue its `JobCreated`, as the producer does.
    pub async fn submit(&self, job: &Job) -> JobMessage {
        self.stores.jobs.create(job).await.expect("job persisted");
        let message = JobMessage::job_created(job, job.correlation_id.clone()).expect("encodes");
        self.work
            .send(message.clone(), None)
            .await
            .expect("message enqueued");
        message
    }

    /// Message types waiting on the events lane, oldest first.
    pub async fn event_types(&self) -> Vec<MessageType> {
        self.events
            .peek(100)
            .await
            .expect("peek events")
            .into_iter()
            .map(|m| m.message_type)
            .collect()
    }
}

pub fn items(n: usize) -> Vec<EvaluationItem> {
    (0..n)
        .map(|i| {
            EvaluationItem::new(format!("question {i}"), format!("answer {i}"))
                .with_id(format!("item-{i}"))
                .with_actual_response(format!("answer {i}"))
        })
        .collect()
}

pub fn job_with(name: &str, configuration: JobConfiguration) -> Job {
    Job::new(
        JobId::generate().expect("random source"),
        name,
        JobType::BulkEvaluation,
        configuration,
        CorrelationId::generate(),
    )
}

pub fn inline_job(name: &str, n: usize) -> Job {
    job_with(name, JobConfiguration::inline(items(n)))
}
