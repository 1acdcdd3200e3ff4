//! Job processor: the worker state machine for one delivery.
//!
//! A `JobCreated` delivery claims its job, scores every item, stores the
//! results and settles the message. Retry and dead-letter decisions are made
//! here; the worker actor only feeds deliveries in.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use db::{DbError, JobRepository};
use jobs_core::{
    CancelledPayload, CompletedPayload, CreatedPayload, DataSource, ErrorDetails, EvaluationItem,
    FailedPayload, ItemResult, Job, JobConfiguration, JobId, JobMessage, JobMetrics, JobProgress,
    JobResult, JobResults, JobStatus, MessageType, PermittedMutation, ProgressPayload,
    ResultLocation, StartedPayload, error_codes,
};
use serde::Serialize;
use storage::StorageError;

use crate::client::QueueClient;
use crate::messages::{AbandonOutcome, Delivery, LockToken, MAX_DELIVERY_COUNT_EXCEEDED, QueueError};
use crate::offload::{OffloadError, PayloadOffloader};
use crate::queue_actor::to_delta;
use crate::scoring::{RetryPolicy, Scorer, ScoringFailure, score_with_retry};

/// Container holding result sets too large for the job record.
pub const RESULTS_CONTAINER: &str = "results";

/// Dead-letter reason for a `JobCreated` whose job does not exist.
pub const JOB_NOT_FOUND: &str = "JobNotFound";
/// Dead-letter reason for a message whose payload cannot be read.
pub const INVALID_PAYLOAD: &str = "InvalidPayload";

/// Tunables for processing.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Bound on a single scoring call.
    pub scoring_timeout: Duration,
    /// In-process retries of transient scoring failures, and the backoff used
    /// when abandoning a delivery.
    pub retry: RetryPolicy,
    pub result_inline_limit_bytes: usize,
    /// Emit `JobProgress` every this many items.
    pub progress_every: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            scoring_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            result_inline_limit_bytes: 64 * 1024,
            progress_every: 10,
        }
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Failed { code: String },
    Cancelled,
    /// Nothing to do; message acknowledged.
    Acknowledged,
    /// Redelivery of work already running or done elsewhere.
    Duplicate,
    Retrying { delay: Duration },
    DeadLettered { reason: String },
    LockLost,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    /// Infrastructure fault; the delivery is abandoned with backoff.
    #[error("retryable failure: {0}")]
    Retryable(String),

    /// The job cannot succeed.
    #[error("{code}: {message}")]
    Terminal {
        code: &'static str,
        message: String,
        dead_letter: bool,
    },

    /// The lease moved on; stop without further writes.
    #[error("lock lost")]
    LockLost,
}

impl WorkerError {
    fn invalid_configuration(message: impl Into<String>) -> Self {
        WorkerError::Terminal {
            code: error_codes::INVALID_CONFIGURATION,
            message: message.into(),
            dead_letter: false,
        }
    }

    fn from_storage(err: StorageError, what: &str) -> Self {
        match err {
            StorageError::NotFound(_)
            | StorageError::Expired(_)
            | StorageError::Json(_)
            | StorageError::InvalidConfig(_) => {
                WorkerError::invalid_configuration(format!("{what}: {err}"))
            }
            other => WorkerError::Retryable(format!("{what}: {other}")),
        }
    }

    fn from_offload(err: OffloadError) -> Self {
        match err {
            OffloadError::Storage(e) => WorkerError::from_storage(e, "offloaded payload"),
            other => WorkerError::invalid_configuration(other.to_string()),
        }
    }
}

impl From<DbError> for WorkerError {
    fn from(err: DbError) -> Self {
        WorkerError::Retryable(format!("job store: {err}"))
    }
}

impl From<QueueError> for WorkerError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::LockLost => WorkerError::LockLost,
            other => WorkerError::Retryable(format!("queue: {other}")),
        }
    }
}

/// Keeps a delivery's lock alive while it is being worked on.
struct Lease<'a> {
    queue: &'a QueueClient,
    lock: LockToken,
    locked_until: DateTime<Utc>,
    duration: Duration,
}

impl<'a> Lease<'a> {
    fn new(queue: &'a QueueClient, delivery: &Delivery) -> Self {
        Self {
            queue,
            lock: delivery.lock,
            locked_until: delivery.locked_until,
            duration: delivery.lock_duration,
        }
    }

    /// Time left until less than a third of the lock duration remains.
    fn until_renewal(&self) -> Duration {
        (self.locked_until - to_delta(self.duration / 3) - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Drive `work` to completion, renewing the lock whenever it is due.
    async fn hold<F: Future>(&mut self, work: F) -> Result<F::Output, WorkerError> {
        tokio::pin!(work);
        loop {
            tokio::select! {
                output = &mut work => return Ok(output),
                _ = tokio::time::sleep(self.until_renewal()) => self.renew().await?,
            }
        }
    }

    async fn renew(&mut self) -> Result<(), WorkerError> {
        self.locked_until = self.queue.renew_lock(self.lock).await?;
        tracing::trace!(lock = %self.lock, locked_until = %self.locked_until, "Lock renewed");
        Ok(())
    }
}

/// Drives deliveries through the job state machine.
pub struct JobProcessor {
    jobs: JobRepository,
    offloader: PayloadOffloader,
    events: QueueClient,
    scorer: Arc<dyn Scorer>,
    metrics: Arc<dyn JobMetrics>,
    settings: WorkerSettings,
}

impl JobProcessor {
    pub fn new(
        jobs: JobRepository,
        offloader: PayloadOffloader,
        events: QueueClient,
        scorer: Arc<dyn Scorer>,
        metrics: Arc<dyn JobMetrics>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            jobs,
            offloader,
            events,
            scorer,
            metrics,
            settings,
        }
    }

    /// Process one delivery received from `queue` and settle it there.
    pub async fn process(&self, worker_id: &str, queue: &QueueClient, delivery: Delivery) -> Disposition {
        let message = &delivery.message;
        tracing::debug!(
            worker_id,
            queue = queue.name(),
            job_id = %message.job_id,
            message_id = %message.message_id,
            message_type = %message.message_type,
            correlation_id = %message.correlation_id,
            delivery_count = delivery.delivery_count,
            "Processing delivery"
        );

        let outcome = match message.message_type.permitted_mutation() {
            PermittedMutation::Lifecycle => self.handle_created(worker_id, queue, &delivery).await,
            PermittedMutation::Cancellation => self.handle_cancelled(queue, &delivery).await,
            PermittedMutation::Progress => self.handle_progress(queue, &delivery).await,
            PermittedMutation::None => Ok(self.acknowledge(queue, &delivery, Disposition::Acknowledged).await),
        };

        match outcome {
            Ok(disposition) => disposition,
            Err(WorkerError::LockLost) => {
                tracing::warn!(
                    worker_id,
                    job_id = %message.job_id,
                    message_id = %message.message_id,
                    "Lock lost; abandoning work without further writes"
                );
                Disposition::LockLost
            }
            Err(WorkerError::Retryable(reason)) => self.retry_later(queue, &delivery, &reason).await,
            Err(WorkerError::Terminal { message: reason, .. }) => {
                self.dead_letter(queue, &delivery, INVALID_PAYLOAD, &reason).await
            }
        }
    }

    async fn handle_created(
        &self,
        worker_id: &str,
        queue: &QueueClient,
        delivery: &Delivery,
    ) -> Result<Disposition, WorkerError> {
        let message = &delivery.message;
        let Some(job) = self.jobs.find(&message.job_id).await? else {
            let reason = format!("job {} does not exist", message.job_id);
            return Ok(self.dead_letter(queue, delivery, JOB_NOT_FOUND, &reason).await);
        };

        if job.is_terminal() {
            tracing::debug!(job_id = %job.id, status = %job.status, "Job already settled");
            return Ok(self.acknowledge(queue, delivery, Disposition::Acknowledged).await);
        }

        let job = match job.status {
            JobStatus::Pending => match self.jobs.claim(&job.id, message.message_id).await? {
                Some(job) => {
                    tracing::info!(
                        worker_id,
                        job_id = %job.id,
                        correlation_id = %message.correlation_id,
                        attempt = job.attempts,
                        "Job started"
                    );
                    self.metrics.job_started(job.job_type);
                    self.emit(
                        &job,
                        message,
                        MessageType::JobStarted,
                        &StartedPayload {
                            worker_id: worker_id.to_string(),
                            attempt: job.attempts,
                        },
                    )
                    .await;
                    job
                }
                None => return Ok(self.acknowledge(queue, delivery, Disposition::Duplicate).await),
            },
            JobStatus::Running
                if job.claimed_by == Some(message.message_id) && delivery.delivery_count > 1 =>
            {
                match self.jobs.resume(&job.id, message.message_id).await? {
                    Some(job) => {
                        tracing::info!(
                            worker_id,
                            job_id = %job.id,
                            attempt = job.attempts,
                            "Resuming job after redelivery"
                        );
                        job
                    }
                    None => return Ok(self.acknowledge(queue, delivery, Disposition::Duplicate).await),
                }
            }
            _ => {
                tracing::debug!(job_id = %job.id, "Duplicate delivery for running job");
                return Ok(self.acknowledge(queue, delivery, Disposition::Duplicate).await);
            }
        };

        let mut lease = Lease::new(queue, delivery);
        match self.run(queue, delivery, &mut lease, &job).await {
            Err(WorkerError::Terminal {
                code,
                message: reason,
                dead_letter,
            }) => {
                self.fail_job(queue, delivery, ErrorDetails::new(code, reason), dead_letter)
                    .await
            }
            other => other,
        }
    }

    async fn run(
        &self,
        queue: &QueueClient,
        delivery: &Delivery,
        lease: &mut Lease<'_>,
        job: &Job,
    ) -> Result<Disposition, WorkerError> {
        let started = Instant::now();
        let message = self
            .offloader
            .resolve(&delivery.message)
            .await
            .map_err(WorkerError::from_offload)?;
        let payload: CreatedPayload = message
            .decode_payload()
            .map_err(|e| WorkerError::invalid_configuration(format!("job payload: {e}")))?;
        let configuration = payload.configuration;

        let items = self.load_items(&configuration).await?;
        let total = items.len() as u32;
        let mut progress = JobProgress::at(total, 0);
        self.jobs.update_progress(&job.id, progress, None).await?;

        let threshold = configuration.pass_threshold();
        let every = self.settings.progress_every.max(1);
        let mut results = Vec::with_capacity(items.len());

        for (index, item) in items.iter().enumerate() {
            if let Some(disposition) = self.interrupted(queue, delivery, &job.id).await? {
                return Ok(disposition);
            }

            let scoring = score_with_retry(
                self.scorer.as_ref(),
                item,
                &configuration,
                &self.settings.retry,
                self.settings.scoring_timeout,
                self.metrics.as_ref(),
            );
            let score = match lease.hold(scoring).await? {
                Ok(score) => score,
                Err(ScoringFailure::Exhausted { attempts, last_error }) => {
                    return Err(WorkerError::Terminal {
                        code: error_codes::RETRY_EXHAUSTED,
                        message: format!("item {index} failed after {attempts} attempts: {last_error}"),
                        dead_letter: true,
                    });
                }
                Err(ScoringFailure::Permanent(reason)) => {
                    return Err(WorkerError::Terminal {
                        code: error_codes::SCORING_FAILED,
                        message: format!("item {index}: {reason}"),
                        dead_letter: false,
                    });
                }
            };

            results.push(ItemResult {
                index: index as u32,
                item_id: item.id.clone(),
                score: score.value,
                passed: score.value >= threshold,
                rationale: score.rationale,
            });

            let completed = index as u32 + 1;
            progress.advance_to(completed);
            let eta = estimate_completion(started.elapsed(), completed, total);
            self.jobs.update_progress(&job.id, progress, eta).await?;

            if completed % every == 0 && completed < total {
                self.emit(
                    job,
                    &delivery.message,
                    MessageType::JobProgress,
                    &ProgressPayload {
                        progress,
                        estimated_completion_at: eta,
                    },
                )
                .await;
            }
        }

        let result = lease.hold(self.store_results(&job.id, results)).await??;

        lease.renew().await?;
        if self.jobs.complete(&job.id, &result).await?.is_none() {
            // Left Running between the last item and the write.
            return match self.interrupted(queue, delivery, &job.id).await? {
                Some(disposition) => Ok(disposition),
                None => Err(WorkerError::Retryable(format!("job {} could not be completed", job.id))),
            };
        }

        let duration_ms = job
            .started_at
            .map(|at| (Utc::now() - at).num_milliseconds().max(0) as u64)
            .unwrap_or_else(|| started.elapsed().as_millis() as u64);
        tracing::info!(
            job_id = %job.id,
            correlation_id = %delivery.message.correlation_id,
            items = total,
            passed = result.summary.passed_items,
            duration_ms,
            "Job completed"
        );
        self.metrics.job_completed(job.job_type, duration_ms);
        self.emit(
            job,
            &delivery.message,
            MessageType::JobCompleted,
            &CompletedPayload {
                summary: result.summary.clone(),
                result_reference: result.reference().cloned(),
                duration_ms,
            },
        )
        .await;

        Ok(self.acknowledge(queue, delivery, Disposition::Completed).await)
    }

    /// `Some` when the job left Running; the delivery is settled.
    async fn interrupted(
        &self,
        queue: &QueueClient,
        delivery: &Delivery,
        job_id: &JobId,
    ) -> Result<Option<Disposition>, WorkerError> {
        let status = self.jobs.find(job_id).await?.map(|job| job.status);
        match status {
            Some(JobStatus::Running) => Ok(None),
            Some(JobStatus::Cancelled) => {
                tracing::info!(job_id = %job_id, "Job cancelled during processing");
                Ok(Some(self.acknowledge(queue, delivery, Disposition::Cancelled).await))
            }
            _ => Ok(Some(self.acknowledge(queue, delivery, Disposition::Acknowledged).await)),
        }
    }

    async fn load_items(
        &self,
        configuration: &JobConfiguration,
    ) -> Result<Vec<EvaluationItem>, WorkerError> {
        let storage = self.offloader.storage();
        let items: Vec<EvaluationItem> = match &configuration.data_source {
            DataSource::Inline { items } => items.clone(),
            DataSource::Location { key } => storage
                .get_json_at(key)
                .await
                .map_err(|e| WorkerError::from_storage(e, "dataset"))?,
            DataSource::Reference { reference } => storage
                .get_json(reference)
                .await
                .map_err(|e| WorkerError::from_storage(e, "dataset"))?,
        };

        if items.is_empty() {
            return Err(WorkerError::invalid_configuration("dataset contains no items"));
        }
        if let Some(index) = items.iter().position(|item| item.prompt.trim().is_empty()) {
            return Err(WorkerError::invalid_configuration(format!(
                "item {index} has an empty prompt"
            )));
        }
        Ok(items)
    }

    async fn store_results(
        &self,
        job_id: &JobId,
        items: Vec<ItemResult>,
    ) -> Result<JobResult, WorkerError> {
        let results = JobResults::new(job_id.clone(), items);
        let summary = results.summary.clone();
        let size = serde_json::to_vec(&results).map_or(usize::MAX, |bytes| bytes.len());

        let location = if size > self.settings.result_inline_limit_bytes {
            let object_name = format!("{job_id}/results.json");
            let reference = self
                .offloader
                .storage()
                .put_json(RESULTS_CONTAINER, &object_name, &results, None)
                .await
                .map_err(|e| WorkerError::Retryable(format!("storing results: {e}")))?;
            tracing::debug!(job_id = %job_id, size, locator = %reference.locator, "Stored results");
            ResultLocation::Stored { reference }
        } else {
            ResultLocation::Inline { results }
        };

        Ok(JobResult { summary, location })
    }

    async fn handle_cancelled(
        &self,
        queue: &QueueClient,
        delivery: &Delivery,
    ) -> Result<Disposition, WorkerError> {
        let job_id = &delivery.message.job_id;
        let job = self.jobs.find(job_id).await?;
        if job.is_some_and(|job| !job.is_terminal()) && self.jobs.cancel(job_id).await?.is_some() {
            tracing::info!(job_id = %job_id, "Job cancelled");
            self.metrics.job_cancelled();
        }
        Ok(self.acknowledge(queue, delivery, Disposition::Acknowledged).await)
    }

    async fn handle_progress(
        &self,
        queue: &QueueClient,
        delivery: &Delivery,
    ) -> Result<Disposition, WorkerError> {
        let message = self
            .offloader
            .resolve(&delivery.message)
            .await
            .map_err(WorkerError::from_offload)?;
        let payload: ProgressPayload = message
            .decode_payload()
            .map_err(|e| WorkerError::invalid_configuration(format!("progress payload: {e}")))?;

        let progress = JobProgress::at(payload.progress.total_items, payload.progress.completed_items);
        self.jobs
            .update_progress(&message.job_id, progress, payload.estimated_completion_at)
            .await?;
        Ok(self.acknowledge(queue, delivery, Disposition::Acknowledged).await)
    }

    /// Mark the job Failed, announce it, then settle the delivery.
    async fn fail_job(
        &self,
        queue: &QueueClient,
        delivery: &Delivery,
        error: ErrorDetails,
        dead_letter: bool,
    ) -> Result<Disposition, WorkerError> {
        let message = &delivery.message;
        queue.renew_lock(delivery.lock).await?;

        match self.jobs.fail(&message.job_id, &error).await? {
            Some(job) => {
                tracing::warn!(
                    job_id = %job.id,
                    correlation_id = %message.correlation_id,
                    code = %error.code,
                    "Job failed: {}",
                    error.message
                );
                self.metrics.job_failed(job.job_type, &error.code);
                self.emit(
                    &job,
                    message,
                    MessageType::JobFailed,
                    &FailedPayload {
                        error: error.clone(),
                        dead_lettered: dead_letter,
                    },
                )
                .await;
            }
            None => {
                // Settled elsewhere, e.g. cancelled while this delivery ran.
                let status = self.jobs.find(&message.job_id).await?.map(|job| job.status);
                if let Some(status) = status.filter(|s| s.is_terminal()) {
                    tracing::info!(job_id = %message.job_id, %status, "Job settled before it could be failed");
                    let disposition = if status == JobStatus::Cancelled {
                        Disposition::Cancelled
                    } else {
                        Disposition::Acknowledged
                    };
                    return Ok(self.acknowledge(queue, delivery, disposition).await);
                }
            }
        }

        if dead_letter {
            queue
                .dead_letter(delivery.lock, error.code.clone(), error.message.clone())
                .await?;
            self.metrics.message_dead_lettered();
            Ok(Disposition::DeadLettered { reason: error.code })
        } else {
            Ok(self
                .acknowledge(queue, delivery, Disposition::Failed { code: error.code })
                .await)
        }
    }

    /// Abandon with backoff, or give up on the last delivery.
    async fn retry_later(&self, queue: &QueueClient, delivery: &Delivery, reason: &str) -> Disposition {
        let message = &delivery.message;
        tracing::warn!(
            job_id = %message.job_id,
            message_id = %message.message_id,
            delivery_count = delivery.delivery_count,
            "Delivery failed: {}",
            reason
        );

        if message.message_type == MessageType::JobCreated && delivery.is_last_attempt() {
            let error = ErrorDetails::new(
                error_codes::RETRY_EXHAUSTED,
                format!("gave up after {} deliveries: {reason}", delivery.delivery_count),
            );
            match self.fail_job(queue, delivery, error, true).await {
                Ok(disposition) => return disposition,
                Err(WorkerError::LockLost) => return Disposition::LockLost,
                Err(e) => tracing::warn!(job_id = %message.job_id, "Could not fail job: {}", e),
            }
        }

        let delay = self.settings.retry.delay_for(delivery.delivery_count);
        match queue.abandon(delivery.lock, delay).await {
            Ok(AbandonOutcome::Requeued) => Disposition::Retrying { delay },
            Ok(AbandonOutcome::DeadLettered) => {
                self.metrics.message_dead_lettered();
                Disposition::DeadLettered {
                    reason: MAX_DELIVERY_COUNT_EXCEEDED.to_string(),
                }
            }
            Err(QueueError::LockLost) => Disposition::LockLost,
            Err(e) => {
                // The lock expires on its own and the message comes back.
                tracing::warn!(message_id = %message.message_id, "Abandon failed: {}", e);
                Disposition::Retrying { delay }
            }
        }
    }

    async fn dead_letter(
        &self,
        queue: &QueueClient,
        delivery: &Delivery,
        reason: &str,
        description: &str,
    ) -> Disposition {
        match queue.dead_letter(delivery.lock, reason, description).await {
            Ok(()) => {
                self.metrics.message_dead_lettered();
                Disposition::DeadLettered {
                    reason: reason.to_string(),
                }
            }
            Err(QueueError::LockLost) => Disposition::LockLost,
            Err(e) => {
                tracing::warn!(message_id = %delivery.message.message_id, "Dead-letter failed: {}", e);
                Disposition::Retrying {
                    delay: delivery.lock_duration,
                }
            }
        }
    }

    async fn acknowledge(
        &self,
        queue: &QueueClient,
        delivery: &Delivery,
        disposition: Disposition,
    ) -> Disposition {
        match queue.complete(delivery.lock).await {
            Ok(()) => {
                if let Err(e) = self.offloader.discard(&delivery.message).await {
                    tracing::warn!(
                        message_id = %delivery.message.message_id,
                        "Could not discard offloaded payload: {}",
                        e
                    );
                }
                disposition
            }
            Err(QueueError::LockLost) => {
                tracing::warn!(
                    message_id = %delivery.message.message_id,
                    "Lock expired before acknowledgement; message will be redelivered"
                );
                Disposition::LockLost
            }
            Err(e) => {
                tracing::warn!(message_id = %delivery.message.message_id, "Acknowledge failed: {}", e);
                disposition
            }
        }
    }

    /// Publish a lifecycle notification. Failures are logged, never fatal.
    async fn emit<P: Serialize>(
        &self,
        job: &Job,
        cause: &JobMessage,
        message_type: MessageType,
        payload: &P,
    ) {
        let message = match JobMessage::new(job.id.clone(), message_type, cause.correlation_id.clone(), payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(job_id = %job.id, "Could not encode {}: {}", message_type, e);
                return;
            }
        };
        let message = match self.offloader.offload(message).await {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(job_id = %job.id, "Could not offload {}: {}", message_type, e);
                return;
            }
        };
        if let Err(e) = self.events.send(message, None).await {
            tracing::warn!(job_id = %job.id, "Could not publish {}: {}", message_type, e);
        }
    }
}

/// Linear extrapolation from the items scored so far.
fn estimate_completion(elapsed: Duration, completed: u32, total: u32) -> Option<DateTime<Utc>> {
    if completed == 0 || completed >= total {
        return None;
    }
    let remaining = f64::from(total - completed) / f64::from(completed);
    Some(Utc::now() + to_delta(elapsed.mul_f64(remaining)))
}

/// `JobCancelled` message for a job cancelled through the API.
pub fn cancellation_message(
    job: &Job,
    reason: Option<String>,
) -> Result<JobMessage, serde_json::Error> {
    JobMessage::new(
        job.id.clone(),
        MessageType::JobCancelled,
        job.correlation_id.clone(),
        &CancelledPayload { reason },
    )
}
